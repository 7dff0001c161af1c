///
/// Prepared Statement
///
/// A `Statement` owns one native `sqlite3_stmt` plus the arena buffers bound
/// to it. Those buffers are bound with SQLITE_STATIC, so they are kept in
/// `pending` until the next reset, free or failed bind releases them.
///
/// The native state sits behind `Rc<RefCell<..>>` so the owning connection
/// can force-finalize it (close, export) while the caller still holds the
/// wrapper; every later call then fails with `StatementClosed`.
///
/// Lifecycle: prepared -> (bind -> step* -> reset)* -> free.
///

use std::cell::RefCell;
use std::ffi::c_int;
use std::fmt;
use std::rc::{Rc, Weak};

use indexmap::IndexMap;
use rusqlite::ffi;
use sqlbridge_core::{
    EncodedBuffer, NativeHandle, Params, QueryOptions, Result, Row, SqlError, StackFrame, Value,
    arena,
};
use tracing::debug;

use crate::connection::Connection;
use crate::marshal;
use crate::normalize;

pub(crate) struct StatementState {
    handle: NativeHandle<ffi::sqlite3_stmt>,
    pending: Vec<EncodedBuffer>,
    cursor: c_int,
}

impl StatementState {
    fn raw(&self) -> Result<*mut ffi::sqlite3_stmt> {
        self.handle.get().ok_or(SqlError::StatementClosed)
    }

    pub(crate) fn is_live(&self) -> bool {
        self.handle.is_live()
    }

    pub(crate) fn addr(&self) -> usize {
        self.handle.addr()
    }

    /// Finalizes the native statement and drops its buffers. `None` when it
    /// was already finalized.
    pub(crate) fn finalize(&mut self) -> Option<c_int> {
        let stmt = self.handle.release()?;
        let code = unsafe { ffi::sqlite3_finalize(stmt) };
        self.pending.clear();
        debug!(addr = stmt as usize, code, "statement finalized");
        Some(code)
    }

    fn bind_positional(&mut self, conn: &Connection, values: &[Value]) -> Result<()> {
        let stmt = self.raw()?;
        self.cursor = 1;
        for value in values {
            let index = self.cursor;
            self.cursor += 1;
            let code = unsafe { marshal::bind_value(stmt, index, value, &mut self.pending)? };
            conn.check(code)?;
        }
        Ok(())
    }

    fn bind_named(&mut self, conn: &Connection, values: &IndexMap<String, Value>) -> Result<()> {
        let stmt = self.raw()?;
        for (name, value) in values {
            let mut frame = StackFrame::enter()?;
            let encoded = frame.alloc_string(name)?;
            let index = unsafe { ffi::sqlite3_bind_parameter_index(stmt, encoded.as_c_ptr()) };
            if index == 0 {
                debug!(parameter = %name, "skipping unknown named parameter");
                continue;
            }
            let code = unsafe { marshal::bind_value(stmt, index, value, &mut self.pending)? };
            conn.check(code)?;
        }
        Ok(())
    }
}

pub struct Statement {
    state: Rc<RefCell<StatementState>>,
    conn: Rc<Connection>,
}

impl Statement {
    /// Wraps a freshly prepared handle and registers it with `conn`.
    pub(crate) fn register(conn: &Rc<Connection>, handle: NativeHandle<ffi::sqlite3_stmt>) -> Self {
        let addr = handle.addr();
        let state = Rc::new(RefCell::new(StatementState {
            handle,
            pending: Vec::new(),
            cursor: 1,
        }));
        conn.track(addr, &state);
        debug!(addr, "statement prepared");
        Self {
            state,
            conn: Rc::clone(conn),
        }
    }

    pub(crate) fn downgrade(&self) -> Weak<RefCell<StatementState>> {
        Rc::downgrade(&self.state)
    }

    fn raw(&self) -> Result<*mut ffi::sqlite3_stmt> {
        self.state.borrow().raw()
    }

    pub fn is_live(&self) -> bool {
        self.state.borrow().is_live()
    }

    /// Native statement address; 0 once freed.
    pub fn addr(&self) -> usize {
        self.state.borrow().handle.addr()
    }

    /// Number of arena buffers currently held for bound values.
    pub fn pending_buffers(&self) -> usize {
        self.state.borrow().pending.len()
    }

    /// Replace all bound values. Named keys that match no parameter are
    /// skipped.
    pub fn bind(&mut self, params: &Params) -> Result<bool> {
        self.reset()?;
        let mut state = self.state.borrow_mut();
        let bound = match params {
            Params::Positional(values) => state.bind_positional(&self.conn, values),
            Params::Named(values) => state.bind_named(&self.conn, values),
        };
        if let Err(err) = bound {
            if let Ok(stmt) = state.raw() {
                unsafe { ffi::sqlite3_clear_bindings(stmt) };
            }
            state.pending.clear();
            return Err(err);
        }
        Ok(true)
    }

    /// Advance to the next row. `Ok(false)` once the statement is done.
    pub fn step(&mut self) -> Result<bool> {
        let stmt = {
            let mut state = self.state.borrow_mut();
            state.cursor = 1;
            state.raw()?
        };
        match unsafe { ffi::sqlite3_step(stmt) } {
            ffi::SQLITE_ROW => Ok(true),
            ffi::SQLITE_DONE => Ok(false),
            code => Err(self.conn.error(code)),
        }
    }

    /// Values of the current row. With `params`, binds and steps first.
    pub fn get(&mut self, params: Option<&Params>, opts: &QueryOptions) -> Result<Vec<Value>> {
        if let Some(params) = params {
            if self.bind(params)? {
                self.step()?;
            }
        }
        let stmt = self.raw()?;
        let count = unsafe { ffi::sqlite3_data_count(stmt) };
        Ok((0..count)
            .map(|i| unsafe { marshal::decode_column(stmt, i, opts) })
            .collect())
    }

    /// The current row keyed by column name.
    pub fn get_as_object(&mut self, params: Option<&Params>, opts: &QueryOptions) -> Result<Row> {
        let values = self.get(params, opts)?;
        let names = self.column_names()?;
        Ok(names.into_iter().zip(values).collect())
    }

    pub fn column_names(&self) -> Result<Vec<String>> {
        let stmt = self.raw()?;
        let count = unsafe { ffi::sqlite3_column_count(stmt) };
        Ok((0..count)
            .map(|i| unsafe { arena::read_cstr(ffi::sqlite3_column_name(stmt, i)) })
            .collect())
    }

    /// Source text the statement was prepared from.
    pub fn sql(&self) -> Result<String> {
        let stmt = self.raw()?;
        Ok(unsafe { arena::read_cstr(ffi::sqlite3_sql(stmt)) })
    }

    /// Canonical form of `sql()`: literals and parameters become `?`,
    /// comments and redundant whitespace are gone, keywords are upper-case.
    pub fn normalized_sql(&self) -> Result<String> {
        Ok(normalize::normalize(&self.sql()?))
    }

    /// Bind, step once and reset. Any step error is returned after the
    /// reset has run.
    pub fn run(&mut self, params: Option<&Params>) -> Result<bool> {
        if let Some(params) = params {
            self.bind(params)?;
        }
        let stepped = self.step();
        let reset = self.reset();
        stepped?;
        reset
    }

    /// Clear bindings, release pending buffers and rewind. True when both
    /// native calls succeed.
    pub fn reset(&mut self) -> Result<bool> {
        let mut state = self.state.borrow_mut();
        let stmt = state.raw()?;
        let cleared = unsafe { ffi::sqlite3_clear_bindings(stmt) } == ffi::SQLITE_OK;
        state.pending.clear();
        let rewound = unsafe { ffi::sqlite3_reset(stmt) } == ffi::SQLITE_OK;
        state.cursor = 1;
        Ok(cleared && rewound)
    }

    /// Finalize and deregister. Fails with `StatementClosed` the second time.
    pub fn free(&mut self) -> Result<bool> {
        let (addr, code) = {
            let mut state = self.state.borrow_mut();
            let addr = state.handle.addr();
            let code = state.finalize().ok_or(SqlError::StatementClosed)?;
            (addr, code)
        };
        self.conn.forget(addr);
        Ok(code == ffi::SQLITE_OK)
    }
}

impl Drop for Statement {
    fn drop(&mut self) {
        let live = self.state.try_borrow().map_or(false, |state| state.is_live());
        if live {
            let _ = self.free();
        }
    }
}

impl fmt::Debug for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.state.try_borrow() {
            Ok(state) => f
                .debug_struct("Statement")
                .field("handle", &state.handle)
                .field("pending", &state.pending.len())
                .finish(),
            Err(_) => f.write_str("Statement(<busy>)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;

    #[test]
    fn test_bind_holds_buffers_until_reset() {
        let db = Database::open(None).unwrap();
        let mut stmt = db.prepare("SELECT ?, ?, ?", None).unwrap();

        let before = arena::stats().live_allocations;
        stmt.bind(&Params::positional([
            Value::from("text"),
            Value::from(vec![1u8, 2]),
            Value::from(7i32),
        ]))
        .unwrap();
        assert_eq!(stmt.pending_buffers(), 2);
        assert_eq!(arena::stats().live_allocations, before + 2);

        stmt.reset().unwrap();
        assert_eq!(stmt.pending_buffers(), 0);
        assert_eq!(arena::stats().live_allocations, before);
    }

    #[test]
    fn test_rebind_releases_previous_buffers() {
        let db = Database::open(None).unwrap();
        let mut stmt = db.prepare("SELECT ?", None).unwrap();
        stmt.bind(&Params::positional(["first"])).unwrap();
        stmt.bind(&Params::positional(["second"])).unwrap();
        assert_eq!(stmt.pending_buffers(), 1);

        assert!(stmt.step().unwrap());
        let row = stmt.get(None, &QueryOptions::default()).unwrap();
        assert_eq!(row, vec![Value::Text("second".into())]);
    }

    #[test]
    fn test_bind_error_releases_buffers() {
        let db = Database::open(None).unwrap();
        let mut stmt = db.prepare("SELECT ?", None).unwrap();
        let err = stmt
            .bind(&Params::positional(["one", "two"]))
            .unwrap_err();
        assert_eq!(err.code(), Some(ffi::SQLITE_RANGE));
        assert_eq!(stmt.pending_buffers(), 0);
    }

    #[test]
    fn test_free_twice_reports_closed() {
        let db = Database::open(None).unwrap();
        let mut stmt = db.prepare("SELECT 1", None).unwrap();
        assert!(stmt.free().unwrap());
        assert!(!stmt.is_live());
        assert!(matches!(stmt.free(), Err(SqlError::StatementClosed)));
        assert!(matches!(stmt.step(), Err(SqlError::StatementClosed)));
        assert!(matches!(stmt.sql(), Err(SqlError::StatementClosed)));
    }

    #[test]
    fn test_debug_output() {
        let db = Database::open(None).unwrap();
        let mut stmt = db.prepare("SELECT 1", None).unwrap();
        assert!(format!("{:?}", stmt).starts_with("Statement"));
        stmt.free().unwrap();
        assert!(format!("{:?}", stmt).contains("released"));
    }
}
