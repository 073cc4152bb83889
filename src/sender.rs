use crate::config::ImageRemoteConfig;
use crate::fields;
use crate::hash::{md5_hex, sha256_hex};
use crate::ocr::N_PLATE;
use crate::paths::{remote_dir, ImageCategory};
use crate::record::{DataType, Record};
use crate::sink::local::LocalStore;
use crate::sink::SinkAdaptor;
use crate::site::Site;
use crate::upload::ImageUploader;
use eyre::{eyre, Result};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// Delivery stage: consumes the server queue, prepares each record once,
/// performs per-destination delivery with sent-to bookkeeping, and spools the
/// record when any destination fails.
pub struct Sender {
    rx: mpsc::UnboundedReceiver<Record>,
    sinks: Vec<Arc<dyn SinkAdaptor>>,
    spool: Arc<LocalStore>,
    projection: Option<Arc<LocalStore>>,
    site: Site,
    uploader: ImageUploader,
    image_remote: ImageRemoteConfig,
    all_sink_names: BTreeSet<String>,
    shutdown: watch::Receiver<bool>,
}

impl Sender {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        rx: mpsc::UnboundedReceiver<Record>,
        sinks: Vec<Arc<dyn SinkAdaptor>>,
        spool: Arc<LocalStore>,
        projection: Option<Arc<LocalStore>>,
        site: Site,
        uploader: ImageUploader,
        image_remote: ImageRemoteConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Sender {
        let all_sink_names = sinks.iter().map(|s| s.name().to_string()).collect();
        Sender {
            rx,
            sinks,
            spool,
            projection,
            site,
            uploader,
            image_remote,
            all_sink_names,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        tracing::info!(sinks = self.sinks.len(), "sender starting");
        loop {
            let record = tokio::select! {
                _ = self.shutdown.changed() => break,
                record = self.rx.recv() => record,
            };
            let Some(record) = record else {
                break;
            };
            self.handle_record(record).await;
        }
        tracing::info!("sender stopping");
    }

    async fn handle_record(&self, mut record: Record) {
        let Some(dtype) = record.data_type() else {
            tracing::error!(
                data = %record.text(fields::UNIQUE_KEY_PLAIN),
                raw_type = %record.text(fields::DATA_TYPE),
                "record without a known data type; dropping"
            );
            return;
        };

        // Until the camera id is discovered nothing can be delivered; every
        // record waits in the spool. 2K vehicles additionally feed the local
        // projection used for offline aggregation.
        let Some(camera_id) = self.site.camera_id() else {
            if dtype == DataType::Vehicle2k {
                if let Some(projection) = &self.projection {
                    if let Err(err) = projection.insert_record(&record) {
                        tracing::error!(error = %err, "projection insert failed");
                    }
                }
            }
            self.spool_record(&record, dtype);
            return;
        };

        if !record.is_prepared() {
            if let Err(err) = self.prepare(&mut record, dtype, &camera_id) {
                tracing::error!(
                    %dtype,
                    data = %record.text(fields::UNIQUE_KEY_PLAIN),
                    error = %err,
                    "record prepare failed; dropping"
                );
                return;
            }
        }

        let allowed: BTreeSet<String> = match record.send_to() {
            Some(destinations) => destinations.into_iter().collect(),
            None => self.all_sink_names.clone(),
        };

        let need_spool = self.deliver(&mut record, dtype, &allowed).await;
        if need_spool {
            self.spool_record(&record, dtype);
        }
    }

    async fn deliver(
        &self,
        record: &mut Record,
        dtype: DataType,
        allowed: &BTreeSet<String>,
    ) -> bool {
        let mut need_spool = false;
        match dtype {
            DataType::Vehicle2k => {
                need_spool |= self
                    .upload_file_image(record, fields::CAR_IMAGE_FILE_NAME)
                    .await;
            }
            DataType::VehicleRaw4k => {
                need_spool |= self.upload_raw_4k(record).await;
            }
            DataType::ApproachQueue | DataType::IncidentStart => {
                need_spool |= self.upload_file_image(record, fields::IMAGE_FILE_NAME).await;
            }
            _ => {}
        }
        need_spool |= self.insert_all(record, dtype, allowed).await;
        need_spool
    }

    /// Single on-disk image upload shared by the 2K, queue, and incident
    /// variants. Returns whether the record must spool.
    async fn upload_file_image(&self, record: &mut Record, name_key: &str) -> bool {
        if record.sent("API") {
            return false;
        }
        let posted = self
            .uploader
            .post_file(
                &record.text(fields::IMAGE_FILE),
                &record.text(fields::IMAGE_PATH_NAME),
                &record.text(name_key),
            )
            .await;
        record.mark_sent("API", posted);
        !posted
    }

    /// Raw 4K ships two in-memory images; both must succeed before the
    /// buffers are freed and the API destination counts as done.
    async fn upload_raw_4k(&self, record: &mut Record) -> bool {
        if record.sent("API") {
            return false;
        }
        let remote = record.text(fields::IMAGE_PATH_NAME);

        let car_posted = match record.bytes(fields::CAR_IMAGE_BYTES) {
            Some(bytes) => {
                self.uploader
                    .post_bytes(
                        bytes.to_vec(),
                        &remote,
                        &record.text(fields::CAR_IMAGE_FILE_NAME),
                    )
                    .await
            }
            None => true,
        };
        let plate_posted = match record.bytes(fields::PLATE_IMAGE_BYTES) {
            Some(bytes) => {
                self.uploader
                    .post_bytes(
                        bytes.to_vec(),
                        &remote,
                        &record.text(fields::PLATE_IMAGE_FILE_NAME),
                    )
                    .await
            }
            None => true,
        };

        let posted = car_posted && plate_posted;
        if posted {
            record.remove(fields::CAR_IMAGE_BYTES);
            record.remove(fields::PLATE_IMAGE_BYTES);
        }
        record.mark_sent("API", posted);
        !posted
    }

    async fn insert_all(
        &self,
        record: &mut Record,
        dtype: DataType,
        allowed: &BTreeSet<String>,
    ) -> bool {
        let mut need_spool = false;
        for sink in &self.sinks {
            let name = sink.name().to_string();
            if !allowed.contains(&name) {
                continue;
            }
            if record.sent(&name) {
                continue;
            }
            let server = format!("{}|{}", sink.kind(), sink.endpoint());
            tracing::info!(
                %dtype,
                data = %record.text(fields::UNIQUE_KEY_PLAIN),
                uk = %record.text(fields::UNIQUE_KEY),
                server = %server,
                "sending record"
            );
            let ok = sink.insert(record, dtype).await;
            record.mark_sent(&name, ok);
            if !ok {
                tracing::info!(
                    %dtype,
                    data = %record.text(fields::UNIQUE_KEY_PLAIN),
                    server = %server,
                    "record send failed"
                );
                need_spool = true;
            }
        }
        need_spool
    }

    /// One-shot pre-send transformation: camera id, 4K lane offset, key
    /// hashing, and remote image path/name rewriting.
    fn prepare(&self, record: &mut Record, dtype: DataType, camera_id: &str) -> Result<()> {
        if !record.contains(fields::CAMERA_ID) {
            record.set(fields::CAMERA_ID, camera_id);
        }

        if dtype == DataType::VehicleRaw4k {
            let offset = self.site.lane_offset().unwrap_or(0);
            let lane = record
                .int(fields::LANE_NO)
                .ok_or_else(|| eyre!("raw 4K record without lane number"))?;
            record.set(fields::LANE_NO, lane + offset);
        }

        self.hash_record(record, dtype, camera_id);

        if dtype.carries_image() {
            self.rewrite_image_paths(record, dtype, camera_id)?;
        }

        record.set_prepared();
        Ok(())
    }

    fn hash_record(&self, record: &mut Record, dtype: DataType, camera_id: &str) {
        let unique_key = sha256_hex(&format!(
            "{camera_id}{}",
            record.text(fields::UNIQUE_KEY_PLAIN)
        ));
        record.set(fields::UNIQUE_KEY, unique_key.as_str());

        // Downstream systems only ever see the hashed vehicle id; the raw
        // detector id is kept in object_id.
        match dtype {
            DataType::Vehicle2k => {
                record.set(fields::OBJECT_ID, record.text(fields::CAR_ID_2K));
                record.set(fields::CAR_ID_2K, unique_key.as_str());
            }
            DataType::Merge => {
                record.set(fields::OBJECT_ID, record.text(fields::CAR_ID));
                record.set(fields::CAR_ID, unique_key.as_str());
            }
            DataType::VehicleRaw4k => {
                record.set(fields::OBJECT_ID, record.text(fields::CAR_ID_4K));
                record.set(fields::CAR_ID_4K, unique_key.as_str());
            }
            _ => {}
        }
    }

    fn rewrite_image_paths(
        &self,
        record: &mut Record,
        dtype: DataType,
        camera_id: &str,
    ) -> Result<()> {
        let local_dir = record.text(fields::IMAGE_PATH_NAME);

        // Join the local directory onto the bare filename so the upload
        // variants have a full path, then derive the remote layout.
        let local_path = if dtype.uses_car_image() {
            let joined = format!("{local_dir}/{}", record.text(fields::CAR_IMAGE_FILE_NAME));
            record.set(fields::CAR_IMAGE_FILE_NAME, joined.as_str());
            if dtype == DataType::VehicleRaw4k {
                let plate = format!("{local_dir}/{}", record.text(fields::PLATE_IMAGE_FILE_NAME));
                record.set(fields::PLATE_IMAGE_FILE_NAME, plate.as_str());
            }
            joined
        } else {
            let joined = format!("{local_dir}/{}", record.text(fields::IMAGE_FILE_NAME));
            record.set(fields::IMAGE_FILE_NAME, joined.as_str());
            joined
        };
        record.set(fields::IMAGE_FILE, local_path.as_str());

        let stem = local_path
            .rsplit('/')
            .next()
            .unwrap_or(&local_path)
            .trim_end_matches(".jpg");
        let created = stem
            .rsplit('_')
            .next()
            .and_then(|part| part.parse::<i64>().ok())
            .ok_or_else(|| eyre!("image name '{stem}' carries no timestamp"))?;

        let (category, base) = match dtype {
            DataType::Vehicle2k | DataType::Merge => {
                record.set(
                    fields::CAR_IMAGE_FILE_NAME,
                    format!("10_{}.jpg", md5_hex(&local_path)),
                );
                (ImageCategory::Vehicle, &self.image_remote.car_image_path_2k)
            }
            DataType::VehicleRaw4k => {
                record.set(
                    fields::CAR_IMAGE_FILE_NAME,
                    format!("10_{}.jpg", md5_hex(&local_path)),
                );
                if record.bytes(fields::PLATE_IMAGE_BYTES).is_some() {
                    record.set(
                        fields::PLATE_IMAGE_FILE_NAME,
                        format!("20_{}.jpg", md5_hex(&record.text(fields::PLATE_NUM))),
                    );
                } else {
                    record.set(fields::PLATE_IMAGE_FILE_NAME, N_PLATE);
                }
                (ImageCategory::Vehicle, &self.image_remote.car_image_path_4k)
            }
            DataType::IncidentStart => {
                record.set(
                    fields::IMAGE_FILE_NAME,
                    format!("30_{}.jpg", md5_hex(&local_path)),
                );
                (
                    ImageCategory::Incident,
                    &self.image_remote.abnormal_image_path,
                )
            }
            _ => {
                record.set(fields::IMAGE_FILE_NAME, format!("{stem}.jpg"));
                (ImageCategory::Queue, &self.image_remote.queue_image_path)
            }
        };

        record.set(
            fields::IMAGE_PATH_NAME,
            remote_dir(base, camera_id, created, category),
        );
        Ok(())
    }

    fn spool_record(&self, record: &Record, dtype: DataType) {
        match self.spool.insert_record(record) {
            Ok(()) => {
                tracing::info!(
                    %dtype,
                    data = %record.text(fields::UNIQUE_KEY_PLAIN),
                    "record spooled"
                );
            }
            Err(err) => {
                tracing::error!(
                    %dtype,
                    data = %record.text(fields::UNIQUE_KEY_PLAIN),
                    error = %err,
                    "spool insert failed; record lost"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cleanup::Cleanup;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct FakeSink {
        name: String,
        results: Mutex<VecDeque<bool>>,
        calls: AtomicUsize,
    }

    impl FakeSink {
        fn new(name: &str, results: Vec<bool>) -> Arc<FakeSink> {
            Arc::new(FakeSink {
                name: name.to_string(),
                results: Mutex::new(results.into()),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SinkAdaptor for FakeSink {
        fn name(&self) -> &str {
            &self.name
        }

        fn kind(&self) -> &'static str {
            "fake"
        }

        fn endpoint(&self) -> String {
            "test".to_string()
        }

        async fn connect(&self) -> Result<()> {
            Ok(())
        }

        async fn insert(&self, _record: &Record, _dtype: DataType) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.results.lock().unwrap().pop_front().unwrap_or(true)
        }
    }

    fn image_remote() -> ImageRemoteConfig {
        ImageRemoteConfig {
            host: "127.0.0.1".to_string(),
            port: 1,
            car_image_path_2k: "/remote/2k".to_string(),
            car_image_path_4k: "/remote/4k".to_string(),
            queue_image_path: "/remote/queue".to_string(),
            abnormal_image_path: "/remote/abnormal".to_string(),
        }
    }

    struct Harness {
        sender: Sender,
        spool: Arc<LocalStore>,
        projection_db: std::path::PathBuf,
        site: Site,
        _dir: tempfile::TempDir,
    }

    fn harness(sinks: Vec<Arc<dyn SinkAdaptor>>) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let spool_db = dir.path().join("spool.db");
        let spool = Arc::new(
            LocalStore::new("SPOOL", spool_db.to_str().unwrap(), "failed_messages").unwrap(),
        );
        spool.open().unwrap();
        let proj_db = dir.path().join("main.db");
        let projection =
            Arc::new(LocalStore::new("LOCAL", proj_db.to_str().unwrap(), "main_table").unwrap());
        projection.open().unwrap();

        let site = Site::new();
        let (_, rx) = mpsc::unbounded_channel();
        let (_, shutdown) = watch::channel(false);
        let uploader = ImageUploader::new("127.0.0.1", 1, Cleanup::new()).unwrap();
        let sender = Sender::new(
            rx,
            sinks,
            spool.clone(),
            Some(projection.clone()),
            site.clone(),
            uploader,
            image_remote(),
            shutdown,
        );
        Harness {
            sender,
            spool,
            projection_db: proj_db,
            site,
            _dir: dir,
        }
    }

    fn ped_record() -> Record {
        let mut record = Record::with_type(DataType::Ped2k);
        record.set(fields::TRACE_ID, "9");
        record.set(fields::PED_DET_TIME, "1700000100");
        record.set(fields::PED_DIRECTION, "1");
        record.set(fields::UNIQUE_KEY_PLAIN, "9_1700000100_1");
        record
    }

    fn vehicle_2k_record() -> Record {
        let mut record = Record::with_type(DataType::Vehicle2k);
        record.set(fields::CAR_ID_2K, "777");
        record.set(fields::VEHICLE_CLASS, "PCAR");
        record.set(fields::LANE_NO, "2");
        record.set(fields::TURN_TYPE_CD, "11");
        record.set(fields::TURN_TIME, "1700000000");
        record.set(fields::STOP_PASS_TIME, "1700000002");
        record.set(fields::FIRST_DET_TIME, "1699999999");
        record.set(fields::OBSERVE_TIME, "3");
        record.set(fields::TURN_SPEED, "50");
        record.set(fields::STOP_PASS_SPEED, "60");
        record.set(fields::INTERVAL_SPEED, "55");
        record.set(fields::IMAGE_PATH_NAME, "/img");
        record.set(fields::CAR_IMAGE_FILE_NAME, "777_2_1700000002.jpg");
        record.set(
            fields::UNIQUE_KEY_PLAIN,
            "777_1700000002_PCAR_2_1700000000_60_777_2_1700000002.jpg",
        );
        record
    }

    fn spool_rows(spool: &LocalStore) -> Vec<Record> {
        let mut rows = Vec::new();
        while let Some((id, payload)) = spool.fetch_one().unwrap() {
            rows.push(Record::from_json_str(&payload).unwrap());
            spool.delete_by_id(id).unwrap();
        }
        rows
    }

    #[tokio::test]
    async fn unknown_camera_spools_everything() {
        let h = harness(vec![FakeSink::new("A", vec![])]);

        for _ in 0..3 {
            h.sender.handle_record(ped_record()).await;
        }

        assert_eq!(spool_rows(&h.spool).len(), 3);
    }

    #[tokio::test]
    async fn unknown_camera_projects_2k_vehicles() {
        let h = harness(vec![]);

        h.sender.handle_record(vehicle_2k_record()).await;
        h.sender.handle_record(ped_record()).await;

        // Both wait in the spool, only the vehicle lands in the projection.
        assert_eq!(spool_rows(&h.spool).len(), 2);
        let conn = rusqlite::Connection::open(&h.projection_db).unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM main_table", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn partial_failure_spools_with_sent_to_preserved() {
        let a = FakeSink::new("A", vec![false, true]);
        let b = FakeSink::new("B", vec![true]);
        let h = harness(vec![a.clone(), b.clone()]);
        h.site.set_camera_id("CAM01");

        h.sender.handle_record(ped_record()).await;

        let rows = spool_rows(&h.spool);
        assert_eq!(rows.len(), 1);
        let spooled = &rows[0];
        assert!(!spooled.sent("A"));
        assert!(spooled.sent("B"));
        assert!(spooled.is_prepared());

        // Replay: only the failed destination is retried.
        h.sender.handle_record(spooled.clone()).await;
        assert_eq!(a.calls(), 2);
        assert_eq!(b.calls(), 1);
        assert!(spool_rows(&h.spool).is_empty());
    }

    #[tokio::test]
    async fn send_to_restricts_destinations() {
        let a = FakeSink::new("A", vec![]);
        let b = FakeSink::new("B", vec![]);
        let h = harness(vec![a.clone(), b.clone()]);
        h.site.set_camera_id("CAM01");

        let mut record = ped_record();
        record.set_send_to(&["B".to_string()]);
        h.sender.handle_record(record).await;

        assert_eq!(a.calls(), 0);
        assert_eq!(b.calls(), 1);
        assert!(spool_rows(&h.spool).is_empty());
    }

    #[tokio::test]
    async fn prepare_hashes_and_rewrites_vehicle_2k() {
        let h = harness(vec![]);
        h.site.set_camera_id("CAM01");

        let mut record = vehicle_2k_record();
        h.sender
            .prepare(&mut record, DataType::Vehicle2k, "CAM01")
            .unwrap();

        let expected_key = crate::hash::sha256_hex(
            "CAM01777_1700000002_PCAR_2_1700000000_60_777_2_1700000002.jpg",
        );
        assert_eq!(record.text(fields::UNIQUE_KEY), expected_key);
        assert_eq!(record.text(fields::OBJECT_ID), "777");
        assert_eq!(record.text(fields::CAR_ID_2K), expected_key);
        assert_eq!(record.text(fields::CAMERA_ID), "CAM01");
        assert!(record.is_prepared());

        // Local path is kept for the upload, the record itself now points at
        // the hashed remote name under the time-derived directory.
        assert_eq!(record.text(fields::IMAGE_FILE), "/img/777_2_1700000002.jpg");
        assert_eq!(
            record.text(fields::CAR_IMAGE_FILE_NAME),
            format!("10_{}.jpg", crate::hash::md5_hex("/img/777_2_1700000002.jpg"))
        );
        assert!(record
            .text(fields::IMAGE_PATH_NAME)
            .starts_with("/remote/2k/CAM01/"));
    }

    #[tokio::test]
    async fn prepare_applies_lane_offset_to_raw_4k() {
        let h = harness(vec![]);
        h.site.set_camera_id("CAM01");
        h.site.set_lane_offset(2);

        let mut record = Record::with_type(DataType::VehicleRaw4k);
        record.set(fields::CAR_ID_4K, "42");
        record.set(fields::LANE_NO, "1");
        record.set(fields::STOP_PASS_TIME, "1700000000");
        record.set(fields::VEHICLE_CLASS, "PCAR");
        record.set(fields::IMAGE_PATH_NAME, "/img");
        record.set(fields::CAR_IMAGE_FILE_NAME, "42_PCAR_3_1700000000.jpg");
        record.set(fields::PLATE_IMAGE_FILE_NAME, "42.jpg");
        record.set(fields::UNIQUE_KEY_PLAIN, "42_1700000000_PCAR_1");

        h.sender
            .prepare(&mut record, DataType::VehicleRaw4k, "CAM01")
            .unwrap();

        assert_eq!(record.int(fields::LANE_NO), Some(3));
        assert_eq!(record.text(fields::OBJECT_ID), "42");
        // No plate bytes attached, so the plate name reads as absent.
        assert_eq!(record.text(fields::PLATE_IMAGE_FILE_NAME), N_PLATE);
        assert!(record
            .text(fields::IMAGE_PATH_NAME)
            .starts_with("/remote/4k/CAM01/"));
    }

    #[tokio::test]
    async fn prepared_records_are_not_prepared_again() {
        let a = FakeSink::new("A", vec![true]);
        let h = harness(vec![a.clone()]);
        h.site.set_camera_id("CAM01");

        let mut record = ped_record();
        record.set_prepared();
        record.set(fields::UNIQUE_KEY, "preset");
        h.sender.handle_record(record).await;

        assert_eq!(a.calls(), 1);
        assert!(spool_rows(&h.spool).is_empty());
    }
}
