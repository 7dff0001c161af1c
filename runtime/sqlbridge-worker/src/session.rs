///
/// Worker session: the single current database of one worker and the
/// dispatch of validated actions against it.
///
/// The database is created on `open`, or lazily by the first action that
/// needs one. Every failure is answered with an error response carrying the
/// request id; the session itself never fails.
///

use serde_json::Value as Json;
use sqlbridge_sqlite3::Database;
use tracing::{debug, error};

use crate::protocol::{Action, ProtocolError, WorkerRequest, WorkerResponse};

#[derive(Debug, Default)]
pub struct Session {
    db: Option<Database>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_database(&self) -> bool {
        self.db.is_some()
    }

    fn database(&mut self) -> Result<&mut Database, ProtocolError> {
        let db = match self.db.take() {
            Some(db) => db,
            None => {
                debug!("creating session database");
                Database::open(None)?
            }
        };
        Ok(self.db.insert(db))
    }

    /// Handle one request, passing every response to `respond` in order.
    pub fn handle(&mut self, request: WorkerRequest, respond: &mut dyn FnMut(WorkerResponse)) {
        let (id, action) = request.into_parts();
        let outcome = action.and_then(|action| {
            debug!(id = %id, action = action.name(), "handling request");
            self.dispatch(&id, action, respond)
        });
        if let Err(err) = outcome {
            error!(id = %id, error = %err, "request failed");
            respond(WorkerResponse::error(id, err.to_string()));
        }
    }

    fn dispatch(
        &mut self,
        id: &Json,
        action: Action,
        respond: &mut dyn FnMut(WorkerResponse),
    ) -> Result<(), ProtocolError> {
        match action {
            Action::Open { buffer } => {
                if let Some(mut db) = self.db.take() {
                    db.close()?;
                }
                self.db = Some(Database::open(buffer.as_deref())?);
                respond(WorkerResponse::ready(id.clone()));
            }
            Action::Exec {
                sql,
                params,
                config,
            } => {
                let results = self.database()?.exec(&sql, params.as_ref(), &config)?;
                respond(WorkerResponse::results(id.clone(), results));
            }
            Action::Each {
                sql,
                params,
                config,
            } => {
                self.database()?.each(
                    &sql,
                    params.as_ref(),
                    &config,
                    |row| {
                        respond(WorkerResponse::row(id.clone(), row));
                        Ok(())
                    },
                    || (),
                )?;
                respond(WorkerResponse::finished(id.clone()));
            }
            Action::Export => {
                let buffer = self.database()?.export()?;
                respond(WorkerResponse::buffer(id.clone(), buffer));
            }
            Action::Close => {
                if let Some(mut db) = self.db.take() {
                    db.close()?;
                }
                respond(WorkerResponse::ack(id.clone()));
            }
            Action::CreateCsvTable {
                buffer,
                table,
                options,
            } => {
                self.database()?.create_csv_table(&buffer, &table, &options)?;
                respond(WorkerResponse::ack(id.clone()));
            }
        }
        Ok(())
    }
}
