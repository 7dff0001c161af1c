//!
//! sqlbridge worker
//!
//! Runs one database on a dedicated thread and drives it with JSON-shaped
//! messages: `open`, `exec`, `each`, `export`, `close`, `createCSVTable`
//! and `createVSVTable`. Every response echoes the request id; failures are
//! reported as `{id, error}` and leave the worker running.
//!

pub mod protocol;
pub mod session;
pub mod worker;

pub use protocol::{Action, ProtocolError, WorkerRequest, WorkerResponse};
pub use session::Session;
pub use worker::{Worker, WorkerClient};
