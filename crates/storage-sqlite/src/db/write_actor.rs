//! Single writer thread. Every job runs in its own immediate transaction, so a
//! record write and its queue append commit together and never interleave with
//! another writer.

use diesel::sqlite::SqliteConnection;
use log::error;
use std::any::Any;
use tokio::sync::{mpsc, oneshot};

use dairysync_core::errors::{DatabaseError, Error, Result};

use super::DbPool;
use crate::errors::StorageError;

type JobOutput = Box<dyn Any + Send>;
type Job = Box<dyn FnOnce(&mut SqliteConnection) -> Result<JobOutput> + Send>;

struct WriteRequest {
    job: Job,
    reply: oneshot::Sender<Result<JobOutput>>,
}

/// Error carried out of `immediate_transaction`: either the job's own error or
/// a failure to begin/commit.
enum TxError {
    Job(Error),
    Diesel(diesel::result::Error),
}

impl From<diesel::result::Error> for TxError {
    fn from(err: diesel::result::Error) -> Self {
        TxError::Diesel(err)
    }
}

#[derive(Clone)]
pub struct WriteHandle {
    tx: mpsc::UnboundedSender<WriteRequest>,
}

impl WriteHandle {
    /// Runs `job` on the writer thread inside an immediate transaction.
    /// An `Err` from the job rolls the transaction back.
    pub async fn exec<T, F>(&self, job: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut SqliteConnection) -> Result<T> + Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let job: Job = Box::new(move |conn| job(conn).map(|value| Box::new(value) as JobOutput));
        self.tx
            .send(WriteRequest {
                job,
                reply: reply_tx,
            })
            .map_err(|_| writer_unavailable())?;

        let output = reply_rx.await.map_err(|_| writer_unavailable())??;
        output
            .downcast::<T>()
            .map(|value| *value)
            .map_err(|_| Error::Unexpected("Writer returned an unexpected type".to_string()))
    }
}

fn writer_unavailable() -> Error {
    Error::Database(DatabaseError::WriterUnavailable(
        "Database writer has stopped".to_string(),
    ))
}

pub fn spawn_writer(pool: DbPool) -> WriteHandle {
    let (tx, mut rx) = mpsc::unbounded_channel::<WriteRequest>();

    let spawned = std::thread::Builder::new()
        .name("dairysync-db-writer".to_string())
        .spawn(move || {
            let mut conn = match pool.get() {
                Ok(conn) => conn,
                Err(err) => {
                    error!("Database writer could not acquire a connection: {}", err);
                    return;
                }
            };

            while let Some(request) = rx.blocking_recv() {
                let job = request.job;
                let result = conn
                    .immediate_transaction::<JobOutput, TxError, _>(|tx_conn| {
                        job(tx_conn).map_err(TxError::Job)
                    })
                    .map_err(|err| match err {
                        TxError::Job(err) => err,
                        TxError::Diesel(err) => StorageError::from(err).into(),
                    });
                let _ = request.reply.send(result);
            }
        });

    if let Err(err) = spawned {
        error!("Failed to start database writer thread: {}", err);
    }

    WriteHandle { tx }
}
