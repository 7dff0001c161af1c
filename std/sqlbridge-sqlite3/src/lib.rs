///
/// sqlbridge SQLite3 Bindings
///
/// Provides SQLite access through the engine's raw C ABI, with every string
/// and blob marshaled through the sqlbridge arena.
///
/// Architecture:
/// - A `Database` owns the connection handle, a registry of its open
///   statements (weak references keyed by native address) and the names of
///   its registered functions. Closing or exporting force-finalizes every
///   statement still registered.
/// - A `Statement` owns one `sqlite3_stmt` and the encoded buffers bound to
///   it; buffers live until the next reset, free or bind error.
/// - `StatementIterator` walks a multi-statement script with the engine's
///   tail pointer over one arena copy of the source.
/// - User functions go through a per-thread trampoline table keyed by a
///   stable id passed to the engine as user data.
///
/// Functions:
/// - Database: open, run, exec, each, prepare, iterate_statements, export,
///   close, create_function, create_csv_table, rows_modified
/// - Statement: bind, step, get, get_as_object, column_names, sql,
///   normalized_sql, run, reset, free
///

mod connection;
pub mod csv_table;
pub mod database;
pub mod functions;
pub mod iter;
pub mod marshal;
pub mod normalize;
pub mod statement;

pub use csv_table::CsvOptions;
pub use database::Database;
pub use functions::{IntoFunctionResult, TrampolineId};
pub use iter::StatementIterator;
pub use statement::Statement;

pub use sqlbridge_core::{Params, QueryOptions, QueryResult, Result, Row, SqlError, Value};
