///
/// Worker message schema.
///
/// Requests arrive as flat JSON objects (`{id, action, sql?, params?, ...}`)
/// and are validated into a typed `Action` before dispatch. Responses echo
/// the request id and carry exactly the fields their action produces; unset
/// fields are omitted from the JSON.
///

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value as Json, json};
use sqlbridge_core::{Params, QueryOptions, QueryResult, Row, SqlError};
use sqlbridge_sqlite3::CsvOptions;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Invalid action : {0}")]
    InvalidAction(String),

    #[error("{action}: Missing query string")]
    MissingSql { action: &'static str },

    #[error("No data for CSV file")]
    MissingBuffer,

    #[error("{action}: Missing file name")]
    MissingFileName { action: &'static str },

    #[error("Invalid separator {0:?}: expected a single-byte character")]
    InvalidSeparator(String),

    #[error("Invalid {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("Malformed request: expected an object, got {0}")]
    NotAnObject(String),

    #[error("Malformed request: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Worker is no longer running")]
    WorkerGone,

    #[error(transparent)]
    Sql(#[from] SqlError),
}

/// A validated request.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Open {
        buffer: Option<Vec<u8>>,
    },
    Exec {
        sql: String,
        params: Option<Params>,
        config: QueryOptions,
    },
    Each {
        sql: String,
        params: Option<Params>,
        config: QueryOptions,
    },
    Export,
    Close,
    CreateCsvTable {
        buffer: Vec<u8>,
        table: String,
        options: CsvOptions,
    },
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::Open { .. } => "open",
            Action::Exec { .. } => "exec",
            Action::Each { .. } => "each",
            Action::Export => "export",
            Action::Close => "close",
            Action::CreateCsvTable { .. } => "createCSVTable",
        }
    }
}

fn parse_separator(separator: Option<&str>) -> Result<u8, ProtocolError> {
    let Some(separator) = separator else {
        return Ok(b',');
    };
    match separator.as_bytes() {
        [byte] => Ok(*byte),
        _ => Err(ProtocolError::InvalidSeparator(separator.to_string())),
    }
}

/// Raw request as received. Only the shape of the envelope is checked at
/// parse time; field types are validated by `into_parts`, so a request with
/// a bad field still yields its id.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkerRequest {
    pub id: Json,
    pub action: Option<Json>,
    pub buffer: Option<Json>,
    pub sql: Option<Json>,
    pub params: Option<Json>,
    pub config: Option<Json>,
    pub file_name: Option<Json>,
    pub separator: Option<Json>,
}

/// Decode an optional field; null counts as absent.
fn field<T: DeserializeOwned>(name: &'static str, value: Option<Json>) -> Result<Option<T>, ProtocolError> {
    match value {
        None | Some(Json::Null) => Ok(None),
        Some(value) => serde_json::from_value(value)
            .map(Some)
            .map_err(|err| ProtocolError::InvalidField {
                field: name,
                reason: err.to_string(),
            }),
    }
}

impl WorkerRequest {
    pub fn new(id: impl Into<Json>, action: &str) -> Self {
        Self {
            id: id.into(),
            action: Some(Json::from(action)),
            ..Self::default()
        }
    }

    pub fn with_sql(mut self, sql: &str) -> Self {
        self.sql = Some(Json::from(sql));
        self
    }

    pub fn with_params(mut self, params: Json) -> Self {
        self.params = Some(params);
        self
    }

    pub fn with_buffer(mut self, buffer: Vec<u8>) -> Self {
        self.buffer = Some(Json::from(buffer));
        self
    }

    pub fn with_config(mut self, config: QueryOptions) -> Self {
        self.config = Some(json!({ "useBigInt": config.use_big_int }));
        self
    }

    pub fn with_file_name(mut self, file_name: &str) -> Self {
        self.file_name = Some(Json::from(file_name));
        self
    }

    /// Parse one request object. Fails only when the text is not JSON or
    /// not an object.
    pub fn from_json(line: &str) -> Result<Self, ProtocolError> {
        match serde_json::from_str::<Json>(line)? {
            value @ Json::Object(_) => Ok(serde_json::from_value(value)?),
            other => Err(ProtocolError::NotAnObject(other.to_string())),
        }
    }

    /// Splits off the id, which every response echoes even when the rest of
    /// the request is invalid.
    pub fn into_parts(mut self) -> (Json, Result<Action, ProtocolError>) {
        let id = std::mem::take(&mut self.id);
        (id, self.into_action())
    }

    fn into_action(self) -> Result<Action, ProtocolError> {
        let WorkerRequest {
            action,
            buffer,
            sql,
            params,
            config,
            file_name,
            separator,
            ..
        } = self;

        let name = match action {
            None | Some(Json::Null) => "undefined".to_string(),
            Some(Json::String(name)) => name,
            Some(other) => other.to_string(),
        };
        let query = |action: &'static str| -> Result<(String, Option<Params>, QueryOptions), ProtocolError> {
            let sql = field::<String>("sql", sql.clone())?
                .filter(|sql| !sql.is_empty())
                .ok_or(ProtocolError::MissingSql { action })?;
            let params = params.clone().map(Params::from_json).transpose()?.flatten();
            let config = field::<QueryOptions>("config", config.clone())?.unwrap_or_default();
            Ok((sql, params, config))
        };

        match name.as_str() {
            "open" => Ok(Action::Open {
                buffer: field("buffer", buffer)?,
            }),
            "exec" => {
                let (sql, params, config) = query("exec")?;
                Ok(Action::Exec { sql, params, config })
            }
            "each" => {
                let (sql, params, config) = query("each")?;
                Ok(Action::Each { sql, params, config })
            }
            "export" => Ok(Action::Export),
            "close" => Ok(Action::Close),
            "createCSVTable" | "createVSVTable" => {
                let (action, separator) = if name == "createVSVTable" {
                    let separator = field::<String>("separator", separator)?;
                    ("createVSVTable", parse_separator(separator.as_deref())?)
                } else {
                    ("createCSVTable", b',')
                };
                let buffer = field("buffer", buffer)?.ok_or(ProtocolError::MissingBuffer)?;
                let table = field("fileName", file_name)?.ok_or(ProtocolError::MissingFileName { action })?;
                Ok(Action::CreateCsvTable {
                    buffer,
                    table,
                    options: CsvOptions::with_separator(separator),
                })
            }
            _ => Err(ProtocolError::InvalidAction(name)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WorkerResponse {
    pub id: Json,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ready: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<Vec<QueryResult>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row: Option<Row>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub buffer: Option<Vec<u8>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WorkerResponse {
    /// Bare acknowledgement carrying only the id.
    pub fn ack(id: Json) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }

    pub fn ready(id: Json) -> Self {
        Self {
            ready: Some(true),
            ..Self::ack(id)
        }
    }

    pub fn results(id: Json, results: Vec<QueryResult>) -> Self {
        Self {
            results: Some(results),
            ..Self::ack(id)
        }
    }

    pub fn row(id: Json, row: Row) -> Self {
        Self {
            row: Some(row),
            finished: Some(false),
            ..Self::ack(id)
        }
    }

    pub fn finished(id: Json) -> Self {
        Self {
            finished: Some(true),
            ..Self::ack(id)
        }
    }

    pub fn buffer(id: Json, buffer: Vec<u8>) -> Self {
        Self {
            buffer: Some(buffer),
            ..Self::ack(id)
        }
    }

    pub fn error(id: Json, message: String) -> Self {
        Self {
            error: Some(message),
            ..Self::ack(id)
        }
    }

    /// False only for streamed rows; any other response ends its request.
    pub fn is_terminal(&self) -> bool {
        self.finished != Some(false)
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlbridge_core::Value;

    fn action_of(line: &str) -> Result<Action, ProtocolError> {
        WorkerRequest::from_json(line).unwrap().into_parts().1
    }

    #[test]
    fn test_parse_exec_request() {
        let request = WorkerRequest::from_json(
            r#"{"id": 4, "action": "exec", "sql": "SELECT ?", "params": [1], "config": {"useBigInt": true}}"#,
        )
        .unwrap();
        let (id, action) = request.into_parts();
        assert_eq!(id, json!(4));
        assert_eq!(
            action.unwrap(),
            Action::Exec {
                sql: "SELECT ?".to_string(),
                params: Some(Params::Positional(vec![Value::Number(1.0)])),
                config: QueryOptions::big_int(),
            }
        );
    }

    #[test]
    fn test_invalid_actions() {
        let err = action_of(r#"{"id": 1, "action": "drop"}"#).unwrap_err();
        assert_eq!(err.to_string(), "Invalid action : drop");

        let err = action_of(r#"{"id": 1}"#).unwrap_err();
        assert_eq!(err.to_string(), "Invalid action : undefined");
    }

    #[test]
    fn test_exec_without_sql() {
        let err = action_of(r#"{"id": 1, "action": "exec"}"#).unwrap_err();
        assert_eq!(err.to_string(), "exec: Missing query string");
        let err = action_of(r#"{"id": 1, "action": "each", "sql": ""}"#).unwrap_err();
        assert_eq!(err.to_string(), "each: Missing query string");
    }

    #[test]
    fn test_csv_requests() {
        let action = action_of(
            r#"{"id": 1, "action": "createVSVTable", "buffer": [97], "fileName": "t", "separator": "|"}"#,
        )
        .unwrap();
        assert_eq!(
            action,
            Action::CreateCsvTable {
                buffer: vec![97],
                table: "t".to_string(),
                options: CsvOptions::with_separator(b'|'),
            }
        );

        let err = action_of(r#"{"id": 1, "action": "createCSVTable", "fileName": "t"}"#).unwrap_err();
        assert_eq!(err.to_string(), "No data for CSV file");

        let err = action_of(
            r#"{"id": 1, "action": "createVSVTable", "buffer": [97], "fileName": "t", "separator": "ab"}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidSeparator(_)));
    }

    #[test]
    fn test_mistyped_fields_keep_the_id() {
        let cases = [
            (r#"{"id": 7, "action": "exec", "sql": "SELECT 1", "config": {"useBigInt": "yes"}}"#, "config"),
            (r#"{"id": 8, "action": "exec", "sql": 42}"#, "sql"),
            (r#"{"id": 9, "action": "open", "buffer": [1, 999]}"#, "buffer"),
            (r#"{"id": 10, "action": "createCSVTable", "buffer": [97], "fileName": 3}"#, "fileName"),
        ];
        for (line, field) in cases {
            let (id, action) = WorkerRequest::from_json(line).unwrap().into_parts();
            assert_eq!(id, serde_json::from_str::<Json>(line).unwrap()["id"]);
            let err = action.unwrap_err();
            assert!(
                err.to_string().starts_with(&format!("Invalid {field}:")),
                "{line}: {err}"
            );
        }
    }

    #[test]
    fn test_non_string_action_is_invalid() {
        let err = action_of(r#"{"id": 1, "action": 5}"#).unwrap_err();
        assert_eq!(err.to_string(), "Invalid action : 5");
    }

    #[test]
    fn test_null_fields_count_as_absent() {
        let action = action_of(r#"{"id": 1, "action": "open", "buffer": null}"#).unwrap();
        assert_eq!(action, Action::Open { buffer: None });
    }

    #[test]
    fn test_unbindable_params_are_rejected() {
        let err = action_of(r#"{"id": 1, "action": "exec", "sql": "SELECT ?", "params": [{"a": 1}]}"#)
            .unwrap_err();
        assert!(err.to_string().starts_with("Wrong API use"));
    }

    #[test]
    fn test_response_serialization_omits_unset_fields() {
        assert_eq!(
            WorkerResponse::ready(json!(1)).to_json().unwrap(),
            r#"{"id":1,"ready":true}"#
        );
        assert_eq!(
            WorkerResponse::finished(json!("a")).to_json().unwrap(),
            r#"{"id":"a","finished":true}"#
        );
        assert_eq!(
            WorkerResponse::error(json!(2), "boom".to_string()).to_json().unwrap(),
            r#"{"id":2,"error":"boom"}"#
        );

        let mut row = Row::new();
        row.insert("n".to_string(), Value::Number(1.0));
        assert_eq!(
            WorkerResponse::row(json!(3), row).to_json().unwrap(),
            r#"{"id":3,"row":{"n":1},"finished":false}"#
        );
    }

    #[test]
    fn test_terminal_responses() {
        assert!(!WorkerResponse::row(json!(1), Row::new()).is_terminal());
        assert!(WorkerResponse::finished(json!(1)).is_terminal());
        assert!(WorkerResponse::ack(json!(1)).is_terminal());
        assert!(WorkerResponse::error(json!(1), String::new()).is_terminal());
    }

    #[test]
    fn test_malformed_json() {
        let err = WorkerRequest::from_json("{not json").unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
        let err = WorkerRequest::from_json("[1, 2]").unwrap_err();
        assert!(matches!(err, ProtocolError::NotAnObject(_)));
    }
}
