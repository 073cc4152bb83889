use crate::fields;
use crate::record::{DataType, Record};
use crate::remap::SiteRemap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, watch};

/// Entries older than this are aged out of the buffers before each pass.
const MAX_AGE_SECS: i64 = 60;

/// Maximum |t2 - t4| for a 2K/4K pair to count as the same vehicle.
const MATCH_TOLERANCE_SECS: i64 = 1;

/// U-turns never need 2K/4K fusion.
const TURN_U: i64 = 41;

type MergeKey = (String, String);

/// Time-window fusion of the two vehicle detectors.
///
/// Keeps per-(lane, vehicle class) buffers of both streams sorted by stop
/// pass time and matches them with a two-pointer walk. A 2K that never finds
/// a 4K is already covered by the router's merge-seed; an unmatched 4K ages
/// out, since the merge table reflects 2K authority.
pub struct Merger {
    server_tx: mpsc::UnboundedSender<Record>,
    rx_2k: mpsc::UnboundedReceiver<Record>,
    rx_4k: mpsc::UnboundedReceiver<Record>,
    compare_2k: HashMap<MergeKey, Vec<Record>>,
    compare_4k: HashMap<MergeKey, Vec<Record>>,
    remap: Option<Arc<SiteRemap>>,
    shutdown: watch::Receiver<bool>,
}

impl Merger {
    pub fn new(
        server_tx: mpsc::UnboundedSender<Record>,
        rx_2k: mpsc::UnboundedReceiver<Record>,
        rx_4k: mpsc::UnboundedReceiver<Record>,
        remap: Option<Arc<SiteRemap>>,
        shutdown: watch::Receiver<bool>,
    ) -> Merger {
        Merger {
            server_tx,
            rx_2k,
            rx_4k,
            compare_2k: HashMap::new(),
            compare_4k: HashMap::new(),
            remap,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        tracing::info!("merger starting");
        loop {
            // The 2K queue is the trigger: block on it, then drain whatever
            // else is waiting on both sides and run one matching pass.
            let record = tokio::select! {
                _ = self.shutdown.changed() => break,
                record = self.rx_2k.recv() => record,
            };
            let Some(record) = record else {
                break;
            };
            insert_record(&mut self.compare_2k, record);

            while let Ok(record) = self.rx_2k.try_recv() {
                insert_record(&mut self.compare_2k, record);
            }
            while let Ok(record) = self.rx_4k.try_recv() {
                insert_record(&mut self.compare_4k, record);
            }

            self.matching_pass(now_unix());
        }
        tracing::info!("merger stopping");
    }

    fn matching_pass(&mut self, now: i64) {
        if self.compare_2k.is_empty() || self.compare_4k.is_empty() {
            return;
        }

        age_out(&mut self.compare_2k, now - MAX_AGE_SECS);
        age_out(&mut self.compare_4k, now - MAX_AGE_SECS);

        let common: Vec<MergeKey> = self
            .compare_2k
            .keys()
            .filter(|key| self.compare_4k.contains_key(*key))
            .cloned()
            .collect();

        for key in common {
            let Some(data_2k) = self.compare_2k.get(&key) else {
                continue;
            };
            let Some(data_4k) = self.compare_4k.get(&key) else {
                continue;
            };

            let mut matched_2k = Vec::new();
            let mut matched_4k = Vec::new();
            let mut i = 0;
            let mut j = 0;

            while i < data_2k.len() && j < data_4k.len() {
                let item_2k = &data_2k[i];
                let item_4k = &data_4k[j];
                let t2 = item_2k.int(fields::STOP_PASS_TIME).unwrap_or(0);
                let t4 = item_4k.int(fields::STOP_PASS_TIME).unwrap_or(0);

                if (t2 - t4).abs() <= MATCH_TOLERANCE_SECS {
                    self.emit_merged(item_2k, item_4k);
                    matched_2k.push(i);
                    matched_4k.push(j);
                    i += 1;
                    j += 1;
                } else if t2 < t4 - MATCH_TOLERANCE_SECS {
                    i += 1;
                } else {
                    j += 1;
                }
            }

            if let Some(bucket) = self.compare_2k.get_mut(&key) {
                for index in matched_2k.into_iter().rev() {
                    bucket.remove(index);
                }
                if bucket.is_empty() {
                    self.compare_2k.remove(&key);
                }
            }
            if let Some(bucket) = self.compare_4k.get_mut(&key) {
                for index in matched_4k.into_iter().rev() {
                    bucket.remove(index);
                }
                if bucket.is_empty() {
                    self.compare_4k.remove(&key);
                }
            }
        }
    }

    fn emit_merged(&self, item_2k: &Record, item_4k: &Record) {
        let mut merged = item_2k.clone();
        merged.set_data_type(DataType::Merge);
        merged.set(fields::CAR_ID, item_2k.text(fields::CAR_ID_2K));
        merged.set(
            fields::PLATE_IMAGE_FILE_NAME,
            item_4k.text(fields::PLATE_IMAGE_FILE_NAME),
        );
        merged.set(fields::PLATE_NUM, item_4k.text(fields::PLATE_NUM));
        merged.set(fields::PLATE_DETECTED, item_4k.text(fields::PLATE_DETECTED));

        if let Some(remap) = &self.remap {
            if remap.apply(&mut merged) {
                // Republish the paired 4K under the substituted camera and
                // lane as an extra server record.
                let mut extra = item_4k.clone();
                extra.set(fields::CAMERA_ID, merged.text(fields::CAMERA_ID));
                extra.set(fields::LANE_NO, merged.text(fields::LANE_NO));
                if self.server_tx.send(extra).is_err() {
                    tracing::error!("server queue closed; remapped 4K record lost");
                }
            }
        }

        tracing::info!(
            data_2k = %item_2k.text(fields::UNIQUE_KEY_PLAIN),
            data_4k = %item_4k.text(fields::UNIQUE_KEY_PLAIN),
            plate = %merged.text(fields::PLATE_NUM),
            "merge success"
        );

        if self.server_tx.send(merged).is_err() {
            tracing::error!("server queue closed; merged record lost");
        }
    }
}

fn merge_key(record: &Record) -> MergeKey {
    (
        record.text(fields::LANE_NO),
        record.text(fields::VEHICLE_CLASS),
    )
}

fn insert_record(buckets: &mut HashMap<MergeKey, Vec<Record>>, record: Record) {
    if record.int(fields::TURN_TYPE_CD) == Some(TURN_U) {
        tracing::debug!(
            data = %record.text(fields::UNIQUE_KEY_PLAIN),
            "u-turn record skipped by merger"
        );
        return;
    }
    let timestamp = record.int(fields::STOP_PASS_TIME).unwrap_or(0);
    let bucket = buckets.entry(merge_key(&record)).or_default();
    let index = bucket.partition_point(|r| r.int(fields::STOP_PASS_TIME).unwrap_or(0) < timestamp);
    bucket.insert(index, record);
}

fn age_out(buckets: &mut HashMap<MergeKey, Vec<Record>>, cutoff: i64) {
    buckets.retain(|_, bucket| {
        let stale = bucket.partition_point(|r| r.int(fields::STOP_PASS_TIME).unwrap_or(0) < cutoff);
        if stale > 0 {
            bucket.drain(..stale);
        }
        !bucket.is_empty()
    });
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_secs() as i64
}
