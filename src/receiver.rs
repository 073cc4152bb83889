use crate::config::Label;
use crate::record::Record;
use crate::remap::SiteRemap;
use crate::router;
use crate::sink::kv::BusSubscriber;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// One receiver per subscribed bus channel: blocks on the next message,
/// routes it, and fans the routed records out to the stage queues.
pub struct Receiver {
    label: Label,
    channel: String,
    send_to: Vec<String>,
    subscriber: BusSubscriber,
    server_tx: mpsc::UnboundedSender<Record>,
    merge_tx: Option<mpsc::UnboundedSender<Record>>,
    ocr_tx: Option<mpsc::UnboundedSender<Record>>,
    remap: Option<Arc<SiteRemap>>,
    shutdown: watch::Receiver<bool>,
}

impl Receiver {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        label: Label,
        channel: String,
        send_to: Vec<String>,
        subscriber: BusSubscriber,
        server_tx: mpsc::UnboundedSender<Record>,
        merge_tx: Option<mpsc::UnboundedSender<Record>>,
        ocr_tx: Option<mpsc::UnboundedSender<Record>>,
        remap: Option<Arc<SiteRemap>>,
        shutdown: watch::Receiver<bool>,
    ) -> Receiver {
        Receiver {
            label,
            channel,
            send_to,
            subscriber,
            server_tx,
            merge_tx,
            ocr_tx,
            remap,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        tracing::info!(label = ?self.label, channel = %self.channel, "receiver starting");
        loop {
            let payload = tokio::select! {
                _ = self.shutdown.changed() => break,
                payload = self.subscriber.next() => payload,
            };
            let Some(payload) = payload else {
                continue;
            };
            self.dispatch(&payload);
        }
        tracing::info!(label = ?self.label, channel = %self.channel, "receiver stopping");
    }

    fn dispatch(&self, payload: &str) {
        let result = router::route(payload, self.label, &self.send_to, self.remap.as_deref());
        if result.is_empty() {
            return;
        }

        for record in result.to_server {
            if self.server_tx.send(record).is_err() {
                tracing::error!(channel = %self.channel, "server queue closed; record lost");
            }
        }

        // Records for a queue this deployment did not configure are dropped.
        for record in result.to_merge {
            match &self.merge_tx {
                Some(tx) => {
                    if tx.send(record).is_err() {
                        tracing::error!(channel = %self.channel, "merge queue closed; record lost");
                    }
                }
                None => {
                    tracing::debug!(channel = %self.channel, "merge disabled; dropping merge record")
                }
            }
        }

        for record in result.to_ocr {
            match &self.ocr_tx {
                Some(tx) => {
                    if tx.send(record).is_err() {
                        tracing::error!(channel = %self.channel, "ocr queue closed; record lost");
                    }
                }
                None => {
                    tracing::debug!(channel = %self.channel, "OCR disabled; dropping raw 4K record")
                }
            }
        }
    }
}
