///
/// Background worker.
///
/// A `Worker` owns one dedicated thread holding a `Session`. Requests are
/// posted through an unbounded channel and handled strictly in arrival
/// order; every response is forwarded to the channel given at spawn time.
/// The database never leaves the worker thread.
///
/// `WorkerClient` pairs a worker with its response channel and offers a
/// request/response view for callers that wait on each request in turn.
///

use std::io;
use std::thread::{self, JoinHandle};

use serde_json::Value as Json;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};

use crate::protocol::{ProtocolError, WorkerRequest, WorkerResponse};
use crate::session::Session;

pub struct Worker {
    requests: Option<UnboundedSender<WorkerRequest>>,
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    pub fn spawn(responses: UnboundedSender<WorkerResponse>) -> io::Result<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<WorkerRequest>();
        let thread = thread::Builder::new()
            .name("sqlbridge-worker".to_string())
            .spawn(move || {
                info!("worker started");
                let mut session = Session::new();
                while let Some(request) = rx.blocking_recv() {
                    session.handle(request, &mut |response| {
                        if responses.send(response).is_err() {
                            warn!("response receiver dropped");
                        }
                    });
                }
                info!("worker stopped");
            })?;
        Ok(Self {
            requests: Some(tx),
            thread: Some(thread),
        })
    }

    /// Queue a request. Fails once the worker has been terminated.
    pub fn post(&self, request: WorkerRequest) -> Result<(), ProtocolError> {
        let sender = self.requests.as_ref().ok_or(ProtocolError::WorkerGone)?;
        sender.send(request).map_err(|_| ProtocolError::WorkerGone)
    }

    pub fn is_running(&self) -> bool {
        self.requests.is_some()
    }

    /// Stop accepting requests, let the queue drain and wait for the thread.
    pub fn terminate(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.requests.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("worker thread panicked");
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

pub struct WorkerClient {
    worker: Worker,
    responses: UnboundedReceiver<WorkerResponse>,
    next_id: u64,
}

impl WorkerClient {
    pub fn spawn() -> io::Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Ok(Self {
            worker: Worker::spawn(tx)?,
            responses: rx,
            next_id: 1,
        })
    }

    /// Send `request` and collect its responses up to the terminal one.
    /// A request without an id is given the next free number.
    pub async fn request(
        &mut self,
        mut request: WorkerRequest,
    ) -> Result<Vec<WorkerResponse>, ProtocolError> {
        if request.id.is_null() {
            request.id = Json::from(self.next_id);
            self.next_id += 1;
        }
        let id = request.id.clone();
        self.worker.post(request)?;

        let mut collected = Vec::new();
        loop {
            let response = self.responses.recv().await.ok_or(ProtocolError::WorkerGone)?;
            if response.id != id {
                debug!(expected = %id, got = %response.id, "skipping response for another request");
                continue;
            }
            let terminal = response.is_terminal();
            collected.push(response);
            if terminal {
                return Ok(collected);
            }
        }
    }

    pub fn terminate(self) {
        self.worker.terminate();
    }
}
