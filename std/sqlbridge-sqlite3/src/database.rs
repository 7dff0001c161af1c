///
/// Database
///
/// One native connection over a private backing file. The file lives in a
/// temporary directory owned by the `Database`, so an image passed to
/// `open` is written there first and `export` reads it back from disk after
/// closing the connection.
///
/// Every SQL text handed to the engine is copied into the arena stack for
/// the duration of the call; statements keep their own copy.
///
/// Error handling:
/// - Native failures become `SqlError::Engine` with the connection's last
///   error message.
/// - Statements prepared inside `run`, `exec` and `each` are freed on every
///   exit path before the error is returned.
/// - After `close`, every operation fails with `DatabaseClosed`.
///

use std::ffi::{c_char, c_int};
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::ptr;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use rusqlite::ffi;
use sqlbridge_core::{
    NativeHandle, Params, QueryOptions, QueryResult, Result, Row, SqlError, StackFrame, Value,
    arena,
};
use tempfile::TempDir;
use tracing::{debug, warn};

use crate::connection::{Connection, errstr};
use crate::functions::{self, IntoFunctionResult};
use crate::iter::StatementIterator;
use crate::statement::Statement;

static NEXT_DB_FILE: AtomicU64 = AtomicU64::new(1);

fn open_native(path: &Path) -> Result<NativeHandle<ffi::sqlite3>> {
    let mut frame = StackFrame::enter()?;
    let filename = frame.alloc_string(&path.to_string_lossy())?;
    let mut db = ptr::null_mut();
    let flags = ffi::SQLITE_OPEN_READWRITE | ffi::SQLITE_OPEN_CREATE;
    let code = unsafe { ffi::sqlite3_open_v2(filename.as_c_ptr(), &mut db, flags, ptr::null()) };
    if code != ffi::SQLITE_OK {
        let message = if db.is_null() {
            errstr(code)
        } else {
            let message = unsafe { arena::read_cstr(ffi::sqlite3_errmsg(db)) };
            unsafe { ffi::sqlite3_close_v2(db) };
            message
        };
        return Err(SqlError::Open { code, message });
    }
    NativeHandle::new(db).ok_or_else(|| SqlError::Open {
        code: ffi::SQLITE_NOMEM,
        message: errstr(ffi::SQLITE_NOMEM),
    })
}

fn drain_results(
    stmt: &mut Statement,
    params: Option<&Params>,
    opts: &QueryOptions,
) -> Result<Option<QueryResult>> {
    if let Some(params) = params {
        stmt.bind(params)?;
    }
    let mut group: Option<QueryResult> = None;
    while stmt.step()? {
        if group.is_none() {
            group = Some(QueryResult::new(stmt.column_names()?));
        }
        let row = stmt.get(None, opts)?;
        if let Some(group) = group.as_mut() {
            group.values.push(row);
        }
    }
    Ok(group)
}

fn drain_rows<F>(stmt: &mut Statement, opts: &QueryOptions, on_row: &mut F) -> Result<()>
where
    F: FnMut(Row) -> Result<()>,
{
    while stmt.step()? {
        on_row(stmt.get_as_object(None, opts)?)?;
    }
    Ok(())
}

pub struct Database {
    conn: Rc<Connection>,
    storage: Option<TempDir>,
    path: PathBuf,
}

impl Database {
    /// Open a database, optionally from a serialized image.
    pub fn open(data: Option<&[u8]>) -> Result<Self> {
        let storage = tempfile::Builder::new().prefix("sqlbridge-").tempdir()?;
        let path = storage
            .path()
            .join(format!("dbfile_{}", NEXT_DB_FILE.fetch_add(1, Ordering::Relaxed)));
        if let Some(bytes) = data {
            std::fs::write(&path, bytes)?;
        }
        let handle = open_native(&path)?;
        debug!(path = %path.display(), image_bytes = data.map_or(0, <[u8]>::len), "database opened");
        Ok(Self {
            conn: Connection::new(handle),
            storage: Some(storage),
            path,
        })
    }

    pub fn is_open(&self) -> bool {
        self.conn.is_open()
    }

    /// Backing file of the connection.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Execute `sql` without returning rows. Without params the whole text
    /// runs through `sqlite3_exec`; with params only the first statement
    /// runs, through a statement that is always freed.
    pub fn run(&self, sql: &str, params: Option<&Params>) -> Result<&Self> {
        let db = self.conn.raw()?;
        match params {
            None => {
                let mut frame = StackFrame::enter()?;
                let text = frame.alloc_string(sql)?;
                let mut errmsg: *mut c_char = ptr::null_mut();
                let code = unsafe {
                    ffi::sqlite3_exec(db, text.as_c_ptr(), None, ptr::null_mut(), &mut errmsg)
                };
                if !errmsg.is_null() {
                    unsafe { ffi::sqlite3_free(errmsg.cast()) };
                }
                self.handle_error(code)?;
            }
            Some(params) => {
                let mut stmt = self.prepare(sql, Some(params))?;
                let stepped = stmt.step();
                stmt.free()?;
                stepped?;
            }
        }
        Ok(self)
    }

    /// Run every statement in `sql`, binding `params` to each, and collect
    /// one result group per statement that produced rows.
    pub fn exec(
        &self,
        sql: &str,
        params: Option<&Params>,
        opts: &QueryOptions,
    ) -> Result<Vec<QueryResult>> {
        let db = self.conn.raw()?;
        let mut frame = StackFrame::enter()?;
        let source = frame.alloc_string(sql)?;
        let mut next = source.as_c_ptr();
        let mut results = Vec::new();

        while unsafe { *next } != 0 {
            let mut raw = ptr::null_mut();
            let mut tail: *const c_char = ptr::null();
            let code = unsafe { ffi::sqlite3_prepare_v2(db, next, -1, &mut raw, &mut tail) };
            if code != ffi::SQLITE_OK {
                let err = self.conn.error(code);
                if !raw.is_null() {
                    unsafe { ffi::sqlite3_finalize(raw) };
                }
                return Err(err);
            }
            if tail.is_null() {
                break;
            }
            next = tail;

            let Some(handle) = NativeHandle::new(raw) else {
                continue;
            };
            let mut stmt = Statement::register(&self.conn, handle);
            let drained = drain_results(&mut stmt, params, opts);
            let freed = stmt.free();
            if let Some(group) = drained? {
                results.push(group);
            }
            freed?;
        }
        Ok(results)
    }

    /// Stream the rows of the first statement in `sql` to `on_row`, then run
    /// `on_complete`. The statement is freed even when `on_row` fails, and
    /// `on_complete` only runs after every row was delivered.
    pub fn each<F, C, T>(
        &self,
        sql: &str,
        params: Option<&Params>,
        opts: &QueryOptions,
        mut on_row: F,
        on_complete: C,
    ) -> Result<T>
    where
        F: FnMut(Row) -> Result<()>,
        C: FnOnce() -> T,
    {
        let mut stmt = self.prepare(sql, params)?;
        let drained = drain_rows(&mut stmt, opts, &mut on_row);
        let freed = stmt.free();
        drained?;
        freed?;
        Ok(on_complete())
    }

    /// Prepare the first statement of `sql`, binding `params` if given.
    pub fn prepare(&self, sql: &str, params: Option<&Params>) -> Result<Statement> {
        let db = self.conn.raw()?;
        let mut frame = StackFrame::enter()?;
        let text = frame.alloc_string(sql)?;
        let mut raw = ptr::null_mut();
        let code = unsafe {
            ffi::sqlite3_prepare_v2(db, text.as_c_ptr(), -1, &mut raw, ptr::null_mut())
        };
        if code != ffi::SQLITE_OK {
            let err = self.conn.error(code);
            if !raw.is_null() {
                unsafe { ffi::sqlite3_finalize(raw) };
            }
            return Err(err);
        }
        let handle = NativeHandle::new(raw)
            .ok_or_else(|| SqlError::Prepare("Nothing to prepare".to_string()))?;
        let mut stmt = Statement::register(&self.conn, handle);
        if let Some(params) = params {
            stmt.bind(params)?;
        }
        Ok(stmt)
    }

    /// Lazily prepare the statements of a script one at a time.
    pub fn iterate_statements(&self, sql: &str) -> Result<StatementIterator> {
        self.conn.raw()?;
        StatementIterator::new(Rc::clone(&self.conn), sql)
    }

    /// Serialize the database. Open statements are finalized and registered
    /// functions dropped; the connection is reopened on the same file.
    pub fn export(&mut self) -> Result<Vec<u8>> {
        self.conn.raw()?;
        self.conn.finalize_statements();
        self.conn.unregister_functions();
        self.conn.close_native()?;

        let bytes = std::fs::read(&self.path);
        let handle = open_native(&self.path)?;
        self.conn.install(handle);
        let bytes = bytes?;
        debug!(bytes = bytes.len(), "database exported");
        Ok(bytes)
    }

    /// Finalize statements, drop functions, close the connection and remove
    /// the backing file. Closing twice is a no-op.
    pub fn close(&mut self) -> Result<()> {
        if !self.conn.is_open() {
            return Ok(());
        }
        self.conn.finalize_statements();
        self.conn.unregister_functions();
        let closed = self.conn.close_native();
        if let Some(storage) = self.storage.take() {
            if let Err(err) = storage.close() {
                warn!(path = %self.path.display(), error = %err, "failed to remove backing file");
            }
        }
        closed
    }

    /// Register `callback` as the SQL function `name`, replacing any earlier
    /// registration under the same name.
    pub fn create_function<F, R, E>(&self, name: &str, callback: F) -> Result<&Self>
    where
        F: Fn(&[Value]) -> std::result::Result<R, E> + 'static,
        R: IntoFunctionResult,
        E: Display,
    {
        let db = self.conn.raw()?;
        let mut frame = StackFrame::enter()?;
        let encoded = frame.alloc_string(name)?;

        // The prior slot stays live until the engine has switched over to
        // the new one; a refused replacement keeps it in service.
        let id = functions::register(name, callback);
        let code = unsafe {
            ffi::sqlite3_create_function_v2(
                db,
                encoded.as_c_ptr(),
                -1,
                ffi::SQLITE_UTF8,
                id.user_data(),
                Some(functions::trampoline),
                None,
                None,
                None,
            )
        };
        if code != ffi::SQLITE_OK {
            functions::unregister(id);
            return Err(self.conn.error(code));
        }
        if let Some(prior) = self.conn.register_function(name, id) {
            functions::unregister(prior);
            debug!(name, "replaced function");
        }
        Ok(self)
    }

    /// `Ok(())` for SQLITE_OK, otherwise the connection's last error.
    pub fn handle_error(&self, code: c_int) -> Result<()> {
        self.conn.check(code)
    }

    /// Rows changed by the most recent INSERT, UPDATE or DELETE.
    pub fn rows_modified(&self) -> Result<i32> {
        let db = self.conn.raw()?;
        Ok(unsafe { ffi::sqlite3_changes(db) })
    }

    pub fn open_statement_count(&self) -> usize {
        self.conn.open_statements()
    }

    pub fn function_count(&self) -> usize {
        self.conn.function_count()
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(error = %err, "database close failed during drop");
        }
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.path)
            .field("open", &self.is_open())
            .field("statements", &self.open_statement_count())
            .finish()
    }
}
