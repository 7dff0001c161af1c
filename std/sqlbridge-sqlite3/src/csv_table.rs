///
/// CSV / VSV import.
///
/// Loads delimited text into a temporary table of the connection. Column
/// names come from the header row when there is one (blank names fall back
/// to `c<i>`), otherwise they are `c0..cN` sized to the widest record.
/// Every field is stored as text; fields missing from short records are
/// NULL. The load runs under a savepoint, so it nests inside a transaction
/// the caller already opened, and is rolled back on error.
///

use csv::ReaderBuilder;
use sqlbridge_core::{Params, Result, SqlError, Value};
use tracing::debug;

use crate::database::Database;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CsvOptions {
    pub separator: u8,
    pub header: bool,
}

impl Default for CsvOptions {
    fn default() -> Self {
        Self {
            separator: b',',
            header: true,
        }
    }
}

impl CsvOptions {
    pub fn with_separator(separator: u8) -> Self {
        Self {
            separator,
            ..Self::default()
        }
    }
}

fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[derive(Debug)]
struct ParsedCsv {
    columns: Vec<String>,
    rows: Vec<Vec<String>>,
}

fn parse(data: &[u8], options: &CsvOptions) -> Result<ParsedCsv> {
    let mut reader = ReaderBuilder::new()
        .delimiter(options.separator)
        .has_headers(options.header)
        .flexible(true)
        .from_reader(data);

    let headers: Vec<String> = if options.header {
        reader
            .headers()
            .map_err(|err| SqlError::Csv(err.to_string()))?
            .iter()
            .map(str::to_string)
            .collect()
    } else {
        Vec::new()
    };

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|err| SqlError::Csv(err.to_string()))?;
        rows.push(record.iter().map(str::to_string).collect::<Vec<_>>());
    }

    let width = rows.iter().map(Vec::len).max().unwrap_or(0).max(headers.len());
    if width == 0 {
        return Err(SqlError::Csv("no columns found".to_string()));
    }
    let columns = (0..width)
        .map(|i| match headers.get(i) {
            Some(name) if !name.trim().is_empty() => name.clone(),
            _ => format!("c{i}"),
        })
        .collect();
    Ok(ParsedCsv { columns, rows })
}

impl Database {
    /// Create `temp."<table>"` from delimited `data`.
    pub fn create_csv_table(&self, data: &[u8], table: &str, options: &CsvOptions) -> Result<usize> {
        let parsed = parse(data, options)?;
        let table_name = format!("temp.{}", quote_identifier(table));
        let column_list = parsed
            .columns
            .iter()
            .map(|name| quote_identifier(name))
            .collect::<Vec<_>>()
            .join(", ");
        let placeholders = vec!["?"; parsed.columns.len()].join(", ");

        self.run("SAVEPOINT csv_import", None)?;
        let loaded = (|| -> Result<usize> {
            self.run(&format!("CREATE TABLE {table_name}({column_list})"), None)?;
            let mut insert = self.prepare(
                &format!("INSERT INTO {table_name} VALUES ({placeholders})"),
                None,
            )?;
            for row in &parsed.rows {
                let values = (0..parsed.columns.len())
                    .map(|i| row.get(i).map_or(Value::Null, |field| Value::Text(field.clone())));
                insert.run(Some(&Params::Positional(values.collect())))?;
            }
            insert.free()?;
            Ok(parsed.rows.len())
        })();

        match loaded {
            Ok(count) => {
                self.run("RELEASE csv_import", None)?;
                debug!(table, rows = count, columns = parsed.columns.len(), "csv table created");
                Ok(count)
            }
            Err(err) => {
                let _ = self.run("ROLLBACK TO csv_import; RELEASE csv_import", None);
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_with_header() {
        let parsed = parse(b"name,age\nann,31\nbob\n", &CsvOptions::default()).unwrap();
        assert_eq!(parsed.columns, vec!["name", "age"]);
        assert_eq!(parsed.rows, vec![vec!["ann", "31"], vec!["bob"]]);
    }

    #[test]
    fn test_parse_without_header() {
        let options = CsvOptions {
            separator: b'|',
            header: false,
        };
        let parsed = parse(b"a|b\nc|d|e\n", &options).unwrap();
        assert_eq!(parsed.columns, vec!["c0", "c1", "c2"]);
        assert_eq!(parsed.rows.len(), 2);
    }

    #[test]
    fn test_blank_header_names_fall_back() {
        let parsed = parse(b"x,,z\n1,2,3\n", &CsvOptions::default()).unwrap();
        assert_eq!(parsed.columns, vec!["x", "c1", "z"]);
    }

    #[test]
    fn test_empty_input_is_rejected() {
        let err = parse(b"", &CsvOptions::default()).unwrap_err();
        assert!(matches!(err, SqlError::Csv(_)));
    }

    #[test]
    fn test_quote_identifier() {
        assert_eq!(quote_identifier("plain"), "\"plain\"");
        assert_eq!(quote_identifier("we\"ird"), "\"we\"\"ird\"");
    }
}
