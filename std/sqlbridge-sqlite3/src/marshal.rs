//!
//! Value Marshaler
//!
//! Converts between host `Value`s and the engine's storage classes at the
//! three crossing points: statement parameters (`bind_value`), result
//! columns (`decode_column`) and user-function arguments and results
//! (`decode_argument`, `set_result`).
//!
//! Text and blobs are never handed to the engine from host memory. They are
//! copied into the arena first; bound buffers are pushed onto the owning
//! statement's pending list so they outlive the bind call.
//!

use std::ffi::{c_char, c_int};

use rusqlite::ffi;
use sqlbridge_core::{
    ColumnType, EncodedBuffer, QueryOptions, Result, SqlError, Value, arena, exact_i32,
};

fn encoded_len(len: usize) -> Result<c_int> {
    c_int::try_from(len).map_err(|_| SqlError::Engine {
        code: ffi::SQLITE_TOOBIG,
        message: "string or blob too big".to_string(),
    })
}

/// Bind `value` at the 1-based `index`. Returns the native status code.
///
/// # Safety
/// `stmt` must be a live statement handle.
pub unsafe fn bind_value(
    stmt: *mut ffi::sqlite3_stmt,
    index: c_int,
    value: &Value,
    pending: &mut Vec<EncodedBuffer>,
) -> Result<c_int> {
    let code = match value {
        Value::Null => unsafe { ffi::sqlite3_bind_null(stmt, index) },
        Value::Bool(b) => unsafe { ffi::sqlite3_bind_int(stmt, index, c_int::from(*b)) },
        Value::Number(n) => match exact_i32(*n) {
            Some(i) => unsafe { ffi::sqlite3_bind_int(stmt, index, i) },
            None => unsafe { ffi::sqlite3_bind_double(stmt, index, *n) },
        },
        Value::Integer(i) => match i32::try_from(*i) {
            Ok(small) => unsafe { ffi::sqlite3_bind_int(stmt, index, small) },
            // Outside 32 bits the value goes in as its decimal text.
            Err(_) => return unsafe { bind_text(stmt, index, &i.to_string(), pending) },
        },
        Value::Text(text) => return unsafe { bind_text(stmt, index, text, pending) },
        Value::Blob(bytes) => {
            let len = encoded_len(bytes.len())?;
            let buffer = arena::alloc_bytes(bytes)?;
            let ptr = buffer.as_ptr();
            pending.push(buffer);
            unsafe { ffi::sqlite3_bind_blob(stmt, index, ptr.cast(), len, ffi::SQLITE_STATIC()) }
        }
    };
    Ok(code)
}

unsafe fn bind_text(
    stmt: *mut ffi::sqlite3_stmt,
    index: c_int,
    text: &str,
    pending: &mut Vec<EncodedBuffer>,
) -> Result<c_int> {
    let len = encoded_len(text.len())?;
    let buffer = arena::alloc_string(text)?;
    let ptr = buffer.as_c_ptr();
    pending.push(buffer);
    Ok(unsafe { ffi::sqlite3_bind_text(stmt, index, ptr, len, ffi::SQLITE_STATIC()) })
}

/// Decode column `index` of the current row.
///
/// # Safety
/// `stmt` must be a live statement positioned on a row, and `index` must be
/// below its data count.
pub unsafe fn decode_column(stmt: *mut ffi::sqlite3_stmt, index: c_int, opts: &QueryOptions) -> Value {
    match ColumnType::from_code(unsafe { ffi::sqlite3_column_type(stmt, index) }) {
        ColumnType::Integer if opts.use_big_int => {
            Value::Integer(unsafe { ffi::sqlite3_column_int64(stmt, index) })
        }
        ColumnType::Integer | ColumnType::Float => {
            Value::Number(unsafe { ffi::sqlite3_column_double(stmt, index) })
        }
        ColumnType::Text => {
            // column_text must run before column_bytes so the length is that
            // of the UTF-8 form.
            let ptr = unsafe { ffi::sqlite3_column_text(stmt, index) };
            let len = unsafe { ffi::sqlite3_column_bytes(stmt, index) };
            let bytes = unsafe { arena::copy_foreign(ptr, len.max(0) as usize) };
            Value::Text(String::from_utf8_lossy(&bytes).into_owned())
        }
        ColumnType::Blob => {
            let ptr = unsafe { ffi::sqlite3_column_blob(stmt, index) } as *const u8;
            let len = unsafe { ffi::sqlite3_column_bytes(stmt, index) };
            Value::Blob(unsafe { arena::copy_foreign(ptr, len.max(0) as usize) })
        }
        ColumnType::Null => Value::Null,
    }
}

/// Decode one user-function argument. Integers decode to `Number`.
///
/// # Safety
/// `value` must be an argument pointer handed to the current function call.
pub unsafe fn decode_argument(value: *mut ffi::sqlite3_value) -> Value {
    match ColumnType::from_code(unsafe { ffi::sqlite3_value_type(value) }) {
        ColumnType::Integer | ColumnType::Float => {
            Value::Number(unsafe { ffi::sqlite3_value_double(value) })
        }
        ColumnType::Text => {
            let ptr = unsafe { ffi::sqlite3_value_text(value) };
            let len = unsafe { ffi::sqlite3_value_bytes(value) };
            let bytes = unsafe { arena::copy_foreign(ptr, len.max(0) as usize) };
            Value::Text(String::from_utf8_lossy(&bytes).into_owned())
        }
        ColumnType::Blob => {
            let ptr = unsafe { ffi::sqlite3_value_blob(value) } as *const u8;
            let len = unsafe { ffi::sqlite3_value_bytes(value) };
            Value::Blob(unsafe { arena::copy_foreign(ptr, len.max(0) as usize) })
        }
        ColumnType::Null => Value::Null,
    }
}

/// Publish a host function's return value as the call's result.
///
/// # Safety
/// `ctx` must be the context of the function call in progress.
pub unsafe fn set_result(ctx: *mut ffi::sqlite3_context, value: &Value) -> Result<()> {
    match value {
        Value::Null => unsafe { ffi::sqlite3_result_null(ctx) },
        Value::Bool(b) => unsafe { ffi::sqlite3_result_int(ctx, c_int::from(*b)) },
        Value::Number(n) => unsafe { ffi::sqlite3_result_double(ctx, *n) },
        Value::Integer(i) => unsafe { ffi::sqlite3_result_int64(ctx, *i) },
        Value::Text(text) => {
            let len = encoded_len(text.len())?;
            let buffer = arena::alloc_string(text)?;
            unsafe {
                ffi::sqlite3_result_text(ctx, buffer.as_c_ptr(), len, ffi::SQLITE_TRANSIENT())
            };
        }
        Value::Blob(bytes) => {
            let len = encoded_len(bytes.len())?;
            let buffer = arena::alloc_bytes(bytes)?;
            unsafe {
                ffi::sqlite3_result_blob(ctx, buffer.as_ptr().cast(), len, ffi::SQLITE_TRANSIENT())
            };
        }
    }
    Ok(())
}

/// Fail the call in progress with `message`. The engine copies the text.
///
/// # Safety
/// `ctx` must be the context of the function call in progress.
pub unsafe fn set_error(ctx: *mut ffi::sqlite3_context, message: &str) {
    let len = message.len().min(c_int::MAX as usize) as c_int;
    unsafe { ffi::sqlite3_result_error(ctx, message.as_ptr() as *const c_char, len) };
}
