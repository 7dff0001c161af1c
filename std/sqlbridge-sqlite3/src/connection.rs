///
/// Connection State
///
/// Shared between a `Database` and every `Statement` it prepared. Holds the
/// native connection handle, a registry of open statements (weak references
/// keyed by native statement address) and the trampoline ids of registered
/// functions by name.
///

use std::cell::RefCell;
use std::collections::HashMap;
use std::ffi::c_int;
use std::rc::{Rc, Weak};

use rusqlite::ffi;
use sqlbridge_core::{NativeHandle, Result, SqlError, arena};
use tracing::{debug, warn};

use crate::functions::{self, TrampolineId};
use crate::statement::StatementState;

pub(crate) struct Connection {
    handle: RefCell<NativeHandle<ffi::sqlite3>>,
    statements: RefCell<HashMap<usize, Weak<RefCell<StatementState>>>>,
    functions: RefCell<HashMap<String, TrampolineId>>,
}

impl Connection {
    pub(crate) fn new(handle: NativeHandle<ffi::sqlite3>) -> Rc<Self> {
        Rc::new(Self {
            handle: RefCell::new(handle),
            statements: RefCell::new(HashMap::new()),
            functions: RefCell::new(HashMap::new()),
        })
    }

    pub(crate) fn raw(&self) -> Result<*mut ffi::sqlite3> {
        self.handle.borrow().get().ok_or(SqlError::DatabaseClosed)
    }

    pub(crate) fn is_open(&self) -> bool {
        self.handle.borrow().is_live()
    }

    pub(crate) fn check(&self, code: c_int) -> Result<()> {
        if code == ffi::SQLITE_OK {
            Ok(())
        } else {
            Err(self.error(code))
        }
    }

    /// Engine error for `code`, carrying the connection's last error text.
    pub(crate) fn error(&self, code: c_int) -> SqlError {
        let message = match self.handle.borrow().get() {
            Some(db) => unsafe { arena::read_cstr(ffi::sqlite3_errmsg(db)) },
            None => errstr(code),
        };
        SqlError::Engine { code, message }
    }

    pub(crate) fn track(&self, addr: usize, state: &Rc<RefCell<StatementState>>) {
        self.statements
            .borrow_mut()
            .insert(addr, Rc::downgrade(state));
    }

    pub(crate) fn forget(&self, addr: usize) {
        self.statements.borrow_mut().remove(&addr);
    }

    pub(crate) fn open_statements(&self) -> usize {
        self.statements
            .borrow()
            .values()
            .filter_map(Weak::upgrade)
            .filter(|state| state.try_borrow().map_or(true, |s| s.is_live()))
            .count()
    }

    /// Finalizes every statement still registered. Wrappers held by callers
    /// observe a released handle afterwards.
    pub(crate) fn finalize_statements(&self) {
        let statements = std::mem::take(&mut *self.statements.borrow_mut());
        for (addr, weak) in statements {
            let Some(state) = weak.upgrade() else {
                continue;
            };
            match state.try_borrow_mut() {
                Ok(mut state) => match state.finalize() {
                    Some(ffi::SQLITE_OK) | None => {}
                    Some(code) => debug!(addr, code, "statement finalized with a pending error"),
                },
                Err(_) => warn!(addr, "statement busy during forced finalize"),
            }
        }
    }

    /// Records `id` under `name` and returns the id it replaces.
    pub(crate) fn register_function(&self, name: &str, id: TrampolineId) -> Option<TrampolineId> {
        self.functions.borrow_mut().insert(name.to_string(), id)
    }

    pub(crate) fn function_count(&self) -> usize {
        self.functions.borrow().len()
    }

    pub(crate) fn unregister_functions(&self) {
        let registered = std::mem::take(&mut *self.functions.borrow_mut());
        for (name, id) in registered {
            functions::unregister(id);
            debug!(name = %name, id = id.index(), "function unregistered");
        }
    }

    /// Closes the native connection. Calling it on a closed connection is a
    /// no-op.
    pub(crate) fn close_native(&self) -> Result<()> {
        let Some(db) = self.handle.borrow_mut().release() else {
            return Ok(());
        };
        let code = unsafe { ffi::sqlite3_close_v2(db) };
        if code == ffi::SQLITE_OK {
            debug!(addr = db as usize, "connection closed");
            Ok(())
        } else {
            Err(SqlError::Engine {
                code,
                message: errstr(code),
            })
        }
    }

    /// Installs a reopened connection after `close_native`.
    pub(crate) fn install(&self, handle: NativeHandle<ffi::sqlite3>) {
        if let Some(db) = handle.get() {
            self.handle.borrow_mut().install(db);
        }
    }
}

/// Static description of a result code, usable without a connection.
pub(crate) fn errstr(code: c_int) -> String {
    unsafe { arena::read_cstr(ffi::sqlite3_errstr(code)) }
}
