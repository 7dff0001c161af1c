///
/// Statement Iterator
///
/// Walks a multi-statement script one statement at a time. The source is
/// copied into the arena once; each `next()` prepares from the current tail
/// offset with `sqlite3_prepare_v2`, which reports where the following
/// statement begins.
///
/// Only one yielded statement is live at a time: advancing finalizes the
/// previous one, unless the caller already freed it.
///

use std::cell::RefCell;
use std::ffi::c_char;
use std::iter::FusedIterator;
use std::ptr;
use std::rc::{Rc, Weak};

use rusqlite::ffi;
use sqlbridge_core::{EncodedBuffer, NativeHandle, Result, arena};

use crate::connection::Connection;
use crate::statement::{Statement, StatementState};

pub struct StatementIterator {
    conn: Rc<Connection>,
    source: Option<EncodedBuffer>,
    tail: usize,
    current: Option<Weak<RefCell<StatementState>>>,
    remaining: Option<String>,
}

impl StatementIterator {
    pub(crate) fn new(conn: Rc<Connection>, sql: &str) -> Result<Self> {
        let source = arena::alloc_string(sql)?;
        Ok(Self {
            conn,
            source: Some(source),
            tail: 0,
            current: None,
            remaining: None,
        })
    }

    /// SQL text not yet consumed. After a prepare error this is the text of
    /// the failing statement onwards; after exhaustion it is empty.
    pub fn remaining_sql(&self) -> String {
        if let Some(rest) = &self.remaining {
            return rest.clone();
        }
        match &self.source {
            Some(source) => arena::read_bytes(source.ptr(), self.tail, source.len() - self.tail)
                .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
                .unwrap_or_default(),
            None => String::new(),
        }
    }

    fn finalize_current(&mut self) {
        let Some(state) = self.current.take().and_then(|weak| weak.upgrade()) else {
            return;
        };
        let Ok(mut state) = state.try_borrow_mut() else {
            return;
        };
        let addr = state.addr();
        if state.finalize().is_some() {
            self.conn.forget(addr);
        }
    }

    /// Records the unconsumed text and releases the source; the iterator
    /// yields nothing afterwards.
    fn fail(&mut self) {
        self.remaining = Some(self.remaining_sql());
        self.source = None;
    }
}

impl Iterator for StatementIterator {
    type Item = Result<Statement>;

    fn next(&mut self) -> Option<Self::Item> {
        self.finalize_current();
        let (base, start) = {
            let source = self.source.as_ref()?;
            (source.as_c_ptr(), source.as_c_ptr().wrapping_add(self.tail))
        };

        let db = match self.conn.raw() {
            Ok(db) => db,
            Err(err) => {
                self.fail();
                return Some(Err(err));
            }
        };

        let mut stmt = ptr::null_mut();
        let mut tail: *const c_char = ptr::null();
        let code = unsafe { ffi::sqlite3_prepare_v2(db, start, -1, &mut stmt, &mut tail) };
        if code != ffi::SQLITE_OK {
            let err = self.conn.error(code);
            if !stmt.is_null() {
                unsafe { ffi::sqlite3_finalize(stmt) };
            }
            self.fail();
            return Some(Err(err));
        }
        if !tail.is_null() {
            self.tail = tail as usize - base as usize;
        }

        match NativeHandle::new(stmt) {
            Some(handle) => {
                let statement = Statement::register(&self.conn, handle);
                self.current = Some(statement.downgrade());
                Some(Ok(statement))
            }
            None => {
                // Only whitespace or comments were left.
                self.source = None;
                None
            }
        }
    }
}

impl FusedIterator for StatementIterator {}

#[cfg(test)]
mod tests {
    use crate::Database;

    #[test]
    fn test_remaining_sql_tracks_the_tail() {
        let db = Database::open(None).unwrap();
        let mut it = db.iterate_statements("SELECT 1; SELECT 2;").unwrap();
        assert_eq!(it.remaining_sql(), "SELECT 1; SELECT 2;");

        let first = it.next().unwrap().unwrap();
        assert_eq!(first.sql().unwrap(), "SELECT 1;");
        assert_eq!(it.remaining_sql(), " SELECT 2;");

        let _second = it.next().unwrap().unwrap();
        assert!(!first.is_live());
        assert!(it.next().is_none());
        assert!(it.next().is_none());
        assert_eq!(it.remaining_sql(), "");
    }

    #[test]
    fn test_trailing_comment_ends_iteration() {
        let db = Database::open(None).unwrap();
        let it = db.iterate_statements("SELECT 1; -- done\n").unwrap();
        assert_eq!(it.count(), 1);
    }
}
