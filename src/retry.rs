use crate::fields;
use crate::record::Record;
use crate::sink::local::LocalStore;
use crate::site::Site;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// Background worker that re-injects spooled records into the server queue.
///
/// Owns nothing but its store handle and the queue sender. Each tick, once
/// the camera id is known, it drains the spool one row at a time; records
/// keep their sent-to map and prepared flag, so destinations that already
/// succeeded are not retried.
pub struct RetryWorker {
    server_tx: mpsc::UnboundedSender<Record>,
    spool: Arc<LocalStore>,
    site: Site,
    interval: Duration,
    shutdown: watch::Receiver<bool>,
}

impl RetryWorker {
    pub fn new(
        server_tx: mpsc::UnboundedSender<Record>,
        spool: Arc<LocalStore>,
        site: Site,
        interval: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> RetryWorker {
        RetryWorker {
            server_tx,
            spool,
            site,
            interval,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        tracing::info!(interval_s = self.interval.as_secs(), "retry worker starting");
        loop {
            tokio::select! {
                _ = self.shutdown.changed() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
            if self.site.camera_id().is_some() {
                self.drain_once();
            }
        }
        tracing::info!("retry worker stopping");
    }

    /// Replays spool rows until the table is empty. Any store or decode
    /// error ends this tick; the next tick retries from the same row.
    fn drain_once(&self) {
        loop {
            let row = match self.spool.fetch_one() {
                Ok(Some(row)) => row,
                Ok(None) => break,
                Err(err) => {
                    tracing::error!(error = %err, "spool fetch failed");
                    break;
                }
            };
            let (id, payload) = row;

            let record = match Record::from_json_str(&payload) {
                Ok(record) => record,
                Err(err) => {
                    tracing::error!(row = id, error = %err, "spooled record unreadable");
                    break;
                }
            };

            tracing::info!(
                row = id,
                datatype = %record.text(fields::DATA_TYPE),
                data = %record.text(fields::UNIQUE_KEY_PLAIN),
                "replaying spooled record"
            );

            if self.server_tx.send(record).is_err() {
                tracing::error!(row = id, "server queue closed; stopping replay");
                break;
            }
            if let Err(err) = self.spool.delete_by_id(id) {
                tracing::error!(row = id, error = %err, "spool delete failed");
                break;
            }
        }
    }
}
