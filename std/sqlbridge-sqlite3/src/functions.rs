///
/// Function Dispatch Table
///
/// Host callbacks registered as SQL functions live in a per-thread table of
/// slots. The engine only ever sees one `extern "C"` entry point; each
/// native registration carries its slot index as user data, and the
/// trampoline looks the callback up by that index on every call. Freed
/// slots are reused by later registrations.
///
/// Nothing unwinds into the engine: callback errors, results with no native
/// representation and panics all end in `sqlite3_result_error`.
///

use std::cell::RefCell;
use std::ffi::{c_int, c_void};
use std::fmt::Display;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::rc::Rc;

use rusqlite::ffi;
use sqlbridge_core::{Result, SqlError, Value, arena};
use tracing::{debug, warn};

use crate::marshal;

type HostFunction = Rc<dyn Fn(&[Value]) -> Result<Value>>;

struct FunctionSlot {
    name: String,
    callback: HostFunction,
}

#[derive(Default)]
struct FunctionTable {
    slots: Vec<Option<FunctionSlot>>,
    free: Vec<usize>,
}

impl FunctionTable {
    fn insert(&mut self, slot: FunctionSlot) -> TrampolineId {
        match self.free.pop() {
            Some(index) => {
                self.slots[index] = Some(slot);
                TrampolineId(index)
            }
            None => {
                self.slots.push(Some(slot));
                TrampolineId(self.slots.len() - 1)
            }
        }
    }

    fn remove(&mut self, id: TrampolineId) -> Option<FunctionSlot> {
        let slot = self.slots.get_mut(id.0)?.take()?;
        self.free.push(id.0);
        Some(slot)
    }

    fn callback(&self, id: TrampolineId) -> Option<HostFunction> {
        self.slots
            .get(id.0)?
            .as_ref()
            .map(|slot| Rc::clone(&slot.callback))
    }

    fn active(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }
}

thread_local! {
    static FUNCTION_TABLE: RefCell<FunctionTable> = RefCell::new(FunctionTable::default());
}

/// Stable id of a registered callback, valid until `unregister`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TrampolineId(usize);

impl TrampolineId {
    pub fn index(self) -> usize {
        self.0
    }

    pub(crate) fn user_data(self) -> *mut c_void {
        self.0 as *mut c_void
    }

    fn from_user_data(data: *mut c_void) -> Self {
        TrampolineId(data as usize)
    }
}

/// Conversion of a callback's return value into a host `Value` the
/// marshaler can publish.
pub trait IntoFunctionResult {
    fn into_function_result(self) -> Result<Value>;
}

impl IntoFunctionResult for Value {
    fn into_function_result(self) -> Result<Value> {
        Ok(self)
    }
}

macro_rules! into_value_result {
    ($($ty:ty),*) => {
        $(
            impl IntoFunctionResult for $ty {
                fn into_function_result(self) -> Result<Value> {
                    Ok(Value::from(self))
                }
            }
        )*
    };
}

into_value_result!(bool, i32, i64, f64, String, Vec<u8>);

impl IntoFunctionResult for &str {
    fn into_function_result(self) -> Result<Value> {
        Ok(Value::from(self))
    }
}

impl IntoFunctionResult for () {
    fn into_function_result(self) -> Result<Value> {
        Ok(Value::Null)
    }
}

impl<T: IntoFunctionResult> IntoFunctionResult for Option<T> {
    fn into_function_result(self) -> Result<Value> {
        match self {
            Some(value) => value.into_function_result(),
            None => Ok(Value::Null),
        }
    }
}

impl IntoFunctionResult for serde_json::Value {
    fn into_function_result(self) -> Result<Value> {
        Value::try_from(self).map_err(|err| match err {
            SqlError::InvalidBindType(repr) => SqlError::UnknownFunctionResult(repr),
            other => other,
        })
    }
}

/// Add `callback` to this thread's table and return its id.
pub fn register<F, R, E>(name: &str, callback: F) -> TrampolineId
where
    F: Fn(&[Value]) -> std::result::Result<R, E> + 'static,
    R: IntoFunctionResult,
    E: Display,
{
    let callback: HostFunction = Rc::new(move |args: &[Value]| match callback(args) {
        Ok(result) => result.into_function_result(),
        Err(err) => Err(SqlError::callback(err)),
    });
    let id = FUNCTION_TABLE.with(|table| {
        table.borrow_mut().insert(FunctionSlot {
            name: name.to_string(),
            callback,
        })
    });
    debug!(name, id = id.0, "function trampoline registered");
    id
}

/// Free the slot behind `id`. Returns false when it was already free.
pub fn unregister(id: TrampolineId) -> bool {
    FUNCTION_TABLE
        .try_with(|table| table.borrow_mut().remove(id))
        .ok()
        .flatten()
        .is_some()
}

pub fn is_registered(id: TrampolineId) -> bool {
    FUNCTION_TABLE.with(|table| table.borrow().callback(id).is_some())
}

/// Number of occupied slots on this thread.
pub fn active_count() -> usize {
    FUNCTION_TABLE.with(|table| table.borrow().active())
}

fn name_of(id: TrampolineId) -> String {
    FUNCTION_TABLE.with(|table| {
        table
            .borrow()
            .slots
            .get(id.0)
            .and_then(Option::as_ref)
            .map_or_else(String::new, |slot| slot.name.clone())
    })
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "function panicked".to_string()
    }
}

/// Entry point handed to `sqlite3_create_function_v2` for every host
/// function.
pub(crate) unsafe extern "C" fn trampoline(
    ctx: *mut ffi::sqlite3_context,
    argc: c_int,
    argv: *mut *mut ffi::sqlite3_value,
) {
    let id = TrampolineId::from_user_data(unsafe { ffi::sqlite3_user_data(ctx) });
    let Some(callback) = FUNCTION_TABLE.with(|table| table.borrow().callback(id)) else {
        unsafe { marshal::set_error(ctx, "function is no longer registered") };
        return;
    };

    let args: Vec<Value> = (0..argc.max(0) as usize)
        .map(|i| unsafe { marshal::decode_argument(arena::read_ptr(argv as *const _, i)) })
        .collect();

    match catch_unwind(AssertUnwindSafe(|| callback(&args))) {
        Ok(Ok(value)) => {
            if let Err(err) = unsafe { marshal::set_result(ctx, &value) } {
                unsafe { marshal::set_error(ctx, &err.to_string()) };
            }
        }
        Ok(Err(err)) => unsafe { marshal::set_error(ctx, &err.to_string()) },
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            warn!(name = %name_of(id), message = %message, "function panicked");
            unsafe { marshal::set_error(ctx, &message) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slots_are_reused() {
        let a = register("a", |_: &[Value]| Ok::<_, String>(1i32));
        let b = register("b", |_: &[Value]| Ok::<_, String>(2i32));
        assert_ne!(a, b);
        assert!(unregister(a));
        assert!(!unregister(a));
        assert!(!is_registered(a));

        let c = register("c", |_: &[Value]| Ok::<_, String>(3i32));
        assert_eq!(c, a);
        assert!(is_registered(b));
        assert!(unregister(b));
        assert!(unregister(c));
    }

    #[test]
    fn test_active_count_tracks_registrations() {
        let before = active_count();
        let id = register("f", |_: &[Value]| Ok::<_, String>(()));
        assert_eq!(active_count(), before + 1);
        unregister(id);
        assert_eq!(active_count(), before);
    }

    #[test]
    fn test_into_function_result() {
        assert_eq!(true.into_function_result().unwrap(), Value::Bool(true));
        assert_eq!(3i32.into_function_result().unwrap(), Value::Number(3.0));
        assert_eq!(3i64.into_function_result().unwrap(), Value::Integer(3));
        assert_eq!("s".into_function_result().unwrap(), Value::Text("s".into()));
        assert_eq!(().into_function_result().unwrap(), Value::Null);
        assert_eq!(None::<f64>.into_function_result().unwrap(), Value::Null);
        assert_eq!(
            serde_json::json!([1, 2]).into_function_result().unwrap(),
            Value::Blob(vec![1, 2])
        );

        let err = serde_json::json!({"k": 1}).into_function_result().unwrap_err();
        assert!(matches!(err, SqlError::UnknownFunctionResult(_)));
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
        let payload: Box<dyn std::any::Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(payload.as_ref()), "function panicked");
    }
}
