///
/// Binding error types.
///
/// `ArenaError` covers the memory bridge; `SqlError` is what every public
/// Statement and Database operation returns. Messages follow the engine's
/// own phrasing so they read the same whether they come from the binding or
/// from `sqlite3_errmsg`.
///

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArenaError {
    #[error("Out of memory: unable to allocate {requested} bytes in the arena")]
    OutOfMemory { requested: usize },

    #[error("Free of {addr:#x}, which is not a live arena allocation")]
    DoubleFree { addr: usize },

    #[error("Access of {width} bytes at {addr:#x} falls outside every arena region")]
    OutOfBounds { addr: usize, width: usize },
}

#[derive(Debug, Error)]
pub enum SqlError {
    #[error("Statement closed")]
    StatementClosed,

    #[error("Database closed")]
    DatabaseClosed,

    #[error("{0}")]
    Prepare(String),

    #[error("Unable to open database: {message}")]
    Open { code: i32, message: String },

    #[error("{message}")]
    Engine { code: i32, message: String },

    #[error("Wrong API use : tried to bind a value of an unknown type ({0}).")]
    InvalidBindType(String),

    #[error("Wrong API use : tried to return a value of an unknown type ({0}).")]
    UnknownFunctionResult(String),

    #[error("{0}")]
    Callback(String),

    #[error("CSV error: {0}")]
    Csv(String),

    #[error(transparent)]
    Arena(#[from] ArenaError),

    #[error("{0}")]
    Io(#[from] std::io::Error),
}

impl SqlError {
    /// Wraps a failure raised by host code (row callbacks, user functions).
    pub fn callback(message: impl std::fmt::Display) -> Self {
        SqlError::Callback(message.to_string())
    }

    /// Native result code, when the error came from the engine.
    pub fn code(&self) -> Option<i32> {
        match self {
            SqlError::Engine { code, .. } | SqlError::Open { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, SqlError::StatementClosed | SqlError::DatabaseClosed)
    }
}

pub type Result<T, E = SqlError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_messages() {
        assert_eq!(SqlError::StatementClosed.to_string(), "Statement closed");
        assert_eq!(SqlError::DatabaseClosed.to_string(), "Database closed");
        assert_eq!(
            SqlError::Prepare("Nothing to prepare".to_string()).to_string(),
            "Nothing to prepare"
        );

        let err = SqlError::Engine {
            code: 1,
            message: "no such table: missing".to_string(),
        };
        assert_eq!(err.to_string(), "no such table: missing");
        assert_eq!(err.code(), Some(1));

        let err = SqlError::InvalidBindType("{}".to_string());
        assert!(err.to_string().contains("tried to bind a value of an unknown type"));
        assert!(err.to_string().contains("({})"));

        let err = SqlError::UnknownFunctionResult("[1,\"a\"]".to_string());
        assert!(err.to_string().contains("tried to return a value of an unknown type"));

        let err = SqlError::from(ArenaError::OutOfMemory { requested: 64 });
        assert!(err.to_string().contains("64 bytes"));
        assert_eq!(err.code(), None);
    }

    #[test]
    fn test_closed_kinds() {
        assert!(SqlError::StatementClosed.is_closed());
        assert!(SqlError::DatabaseClosed.is_closed());
        assert!(!SqlError::callback("boom").is_closed());
        assert_eq!(SqlError::callback("boom").to_string(), "boom");
    }
}
