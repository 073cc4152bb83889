pub mod detect;
pub mod layout;

use crate::cleanup::Cleanup;
use crate::fields;
use crate::record::Record;
use self::detect::{nms, Detector};
use eyre::{eyre, Result};
use image::{DynamicImage, RgbImage};
use std::io::Cursor;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// Sentinel plate text when no plate image exists for a vehicle.
pub const N_PLATE: &str = "N_PLATE";
/// Sentinel path/filename when a raw 4K record has no images on disk.
pub const N_IMAGE: &str = "N_IMAGE";

const SCORE_THRESH: f64 = 0.5;
const IOU_THRESH: f64 = 0.4;

/// Vehicle class that skips plate detection entirely.
const CLASS_MOTORCYCLE: &str = "MOTOR";

struct BestCandidate {
    image: RgbImage,
    plate_jpeg: Option<Vec<u8>>,
    plate_text: String,
    score: f64,
}

/// OCR stage: consumes raw 4K records, picks the best plate reading across
/// all candidate images of the vehicle, and forwards the enriched record.
pub struct PlateReader {
    server_tx: mpsc::UnboundedSender<Record>,
    rx_ocr: mpsc::UnboundedReceiver<Record>,
    plate_detector: Arc<dyn Detector>,
    ocr_model: Arc<dyn Detector>,
    cleanup: Cleanup,
    shutdown: watch::Receiver<bool>,
}

impl PlateReader {
    pub fn new(
        server_tx: mpsc::UnboundedSender<Record>,
        rx_ocr: mpsc::UnboundedReceiver<Record>,
        plate_detector: Arc<dyn Detector>,
        ocr_model: Arc<dyn Detector>,
        cleanup: Cleanup,
        shutdown: watch::Receiver<bool>,
    ) -> PlateReader {
        PlateReader {
            server_tx,
            rx_ocr,
            plate_detector,
            ocr_model,
            cleanup,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        self.warm_up().await;
        tracing::info!("OCR stage starting");
        loop {
            let record = tokio::select! {
                _ = self.shutdown.changed() => break,
                record = self.rx_ocr.recv() => record,
            };
            let Some(record) = record else {
                break;
            };
            self.handle_record(record).await;
        }
        tracing::info!("OCR stage stopping");
    }

    /// Runs each model over a zero-filled frame twice so the first real
    /// request does not pay initialization cost. Part of the stage contract.
    async fn warm_up(&self) {
        tracing::debug!("model warm up start");
        for _ in 0..2 {
            let plate_frame = zero_jpeg(self.plate_detector.input_size());
            if let Ok(frame) = &plate_frame {
                let _ = self.plate_detector.detect(frame).await;
            }
            let ocr_frame = zero_jpeg(self.ocr_model.input_size());
            if let Ok(frame) = &ocr_frame {
                let _ = self.ocr_model.detect(frame).await;
            }
        }
        tracing::debug!("model warm up finished");
    }

    async fn handle_record(&self, mut record: Record) {
        let car_id = record.text(fields::CAR_ID_4K);
        let paths = candidate_images(&record.text(fields::IMAGE_PATH_NAME), &car_id);

        if paths.is_empty() {
            record.set(fields::PLATE_NUM, N_PLATE);
            record.set(fields::PLATE_DETECTED, "N");
            record.set(fields::IMAGE_PATH_NAME, N_IMAGE);
            record.set(fields::CAR_IMAGE_FILE_NAME, N_IMAGE);
            record.set(fields::PLATE_IMAGE_FILE_NAME, N_IMAGE);
            tracing::error!(
                data = %record.text(fields::UNIQUE_KEY_PLAIN),
                "no candidate images exist"
            );
            self.forward(record);
            return;
        }

        let is_motorcycle = record.text(fields::VEHICLE_CLASS) == CLASS_MOTORCYCLE;
        let mut best: Option<BestCandidate> = None;

        for path in paths {
            let bytes = std::fs::read(&path);
            self.cleanup.remove_image(&path);
            let bytes = match bytes {
                Ok(bytes) => bytes,
                Err(err) => {
                    tracing::error!(
                        image = %path.display(),
                        error = %err,
                        "candidate image unreadable"
                    );
                    continue;
                }
            };
            let image = match image::load_from_memory(&bytes) {
                Ok(image) => image.to_rgb8(),
                Err(err) => {
                    tracing::error!(
                        image = %path.display(),
                        error = %err,
                        "candidate image undecodable"
                    );
                    continue;
                }
            };

            if is_motorcycle {
                // Motorcycles carry no readable front plate; keep the first
                // image so the record still ships a vehicle photo.
                if best.is_none() {
                    best = Some(BestCandidate {
                        image,
                        plate_jpeg: None,
                        plate_text: N_PLATE.to_string(),
                        score: 0.0,
                    });
                }
                continue;
            }

            let plate_jpeg = self.detect_plate(&bytes, &image).await;
            let (plate_text, score) = self.read_plate(plate_jpeg.as_deref()).await;

            let better = best.as_ref().map(|b| score > b.score).unwrap_or(true);
            if better {
                best = Some(BestCandidate {
                    image,
                    plate_jpeg,
                    plate_text,
                    score,
                });
            }
        }

        if let Some(best) = best {
            record.set(
                fields::PLATE_DETECTED,
                if best.plate_text == N_PLATE { "N" } else { "Y" },
            );
            record.set(fields::PLATE_NUM, best.plate_text.as_str());
            record.set(
                fields::CAR_IMAGE_FILE_NAME,
                format!(
                    "{car_id}_{}_{}_{}.jpg",
                    record.text(fields::VEHICLE_CLASS),
                    record.text(fields::LANE_NO),
                    record.text(fields::STOP_PASS_TIME)
                ),
            );
            record.set(fields::PLATE_IMAGE_FILE_NAME, format!("{car_id}.jpg"));

            match encode_jpeg(&best.image) {
                Ok(bytes) => record.set(fields::CAR_IMAGE_BYTES, bytes),
                Err(err) => {
                    tracing::error!(
                        data = %record.text(fields::UNIQUE_KEY_PLAIN),
                        error = %err,
                        "vehicle image encode failed; dropping record"
                    );
                    return;
                }
            }
            if let Some(plate_jpeg) = best.plate_jpeg {
                record.set(fields::PLATE_IMAGE_BYTES, plate_jpeg);
            }
        }

        tracing::info!(
            data = %record.text(fields::UNIQUE_KEY_PLAIN),
            plate = %record.text(fields::PLATE_NUM),
            "plate reading selected"
        );
        self.forward(record);
    }

    /// Plate detection + crop + square padding, returned re-encoded as JPEG.
    /// None means no plate was found; the vehicle image still ships.
    async fn detect_plate(&self, jpeg: &[u8], image: &RgbImage) -> Option<Vec<u8>> {
        let detections = match self.plate_detector.detect(jpeg).await {
            Ok(detections) => detections,
            Err(err) => {
                tracing::error!(error = %err, "plate detection failed");
                return None;
            }
        };
        let kept = nms(&detections, SCORE_THRESH, IOU_THRESH);
        let plate_box = kept.first()?;

        let x = plate_box.x.max(0.0) as u32;
        let y = plate_box.y.max(0.0) as u32;
        let (width, height) = image.dimensions();
        if x >= width || y >= height {
            return None;
        }
        let w = (plate_box.w.max(1.0) as u32).min(width - x);
        let h = (plate_box.h.max(1.0) as u32).min(height - y);

        let crop = image::imageops::crop_imm(image, x, y, w, h).to_image();
        let padded = pad_square(&crop);
        match encode_jpeg(&padded) {
            Ok(bytes) => Some(bytes),
            Err(err) => {
                tracing::error!(error = %err, "plate crop encode failed");
                None
            }
        }
    }

    async fn read_plate(&self, plate_jpeg: Option<&[u8]>) -> (String, f64) {
        let Some(jpeg) = plate_jpeg else {
            return (N_PLATE.to_string(), 0.1);
        };
        let detections = match self.ocr_model.detect(jpeg).await {
            Ok(detections) => detections,
            Err(err) => {
                tracing::error!(error = %err, "character detection failed");
                return (layout::N_OCR.to_string(), 0.1);
            }
        };
        let kept = nms(&detections, SCORE_THRESH, IOU_THRESH);
        layout::assemble_plate_text(&kept, self.ocr_model.classes())
    }

    fn forward(&self, record: Record) {
        if self.server_tx.send(record).is_err() {
            tracing::error!("server queue closed; OCR record lost");
        }
    }
}

/// All on-disk images belonging to one 4K track id, in name order.
fn candidate_images(dir: &str, car_id: &str) -> Vec<PathBuf> {
    let dir = dir.trim_end_matches(['/', '\\']);
    let prefix = format!("{car_id}_");
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return Vec::new(),
    };
    let mut paths: Vec<PathBuf> = entries
        .flatten()
        .filter(|entry| {
            entry
                .file_name()
                .to_str()
                .map(|name| name.starts_with(&prefix))
                .unwrap_or(false)
        })
        .map(|entry| entry.path())
        .collect();
    paths.sort();
    paths
}

/// Pads an image to a black square so the OCR model sees a fixed aspect
/// ratio regardless of the plate crop shape.
fn pad_square(image: &RgbImage) -> RgbImage {
    let (w, h) = image.dimensions();
    let side = w.max(h);
    let mut square = RgbImage::new(side, side);
    let x_off = (side - w) / 2;
    let y_off = (side - h) / 2;
    image::imageops::replace(&mut square, image, x_off as i64, y_off as i64);
    square
}

fn encode_jpeg(image: &RgbImage) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    DynamicImage::ImageRgb8(image.clone())
        .write_to(&mut Cursor::new(&mut buffer), image::ImageFormat::Jpeg)
        .map_err(|e| eyre!("jpeg encode failed: {e}"))?;
    Ok(buffer)
}

fn zero_jpeg(size: u32) -> Result<Vec<u8>> {
    encode_jpeg(&RgbImage::new(size.max(1), size.max(1)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ocr::detect::Detection;
    use crate::record::DataType;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct Scripted {
        classes: Vec<String>,
        input_size: u32,
        responses: Mutex<VecDeque<Vec<Detection>>>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(responses: Vec<Vec<Detection>>) -> Arc<Scripted> {
            let mut classes: Vec<String> = (0..10).map(|i| i.to_string()).collect();
            classes.push("GA".to_string());
            Arc::new(Scripted {
                classes,
                input_size: 64,
                responses: Mutex::new(responses.into()),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Detector for Scripted {
        async fn detect(&self, _jpeg: &[u8]) -> Result<Vec<Detection>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self
                .responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_default())
        }

        fn classes(&self) -> &[String] {
            &self.classes
        }

        fn input_size(&self) -> u32 {
            self.input_size
        }
    }

    fn plate_box(conf: f64) -> Vec<Detection> {
        vec![Detection {
            x: 0.0,
            y: 0.0,
            w: 8.0,
            h: 8.0,
            conf,
            class_id: 0,
        }]
    }

    fn chars(ids: &[usize], conf: f64) -> Vec<Detection> {
        ids.iter()
            .enumerate()
            .map(|(i, &class_id)| Detection {
                x: i as f64 * 12.0,
                y: 4.0,
                w: 10.0,
                h: 8.0,
                conf,
                class_id,
            })
            .collect()
    }

    fn raw_4k(dir: &std::path::Path, car_id: &str, class: &str) -> Record {
        let mut record = Record::with_type(DataType::VehicleRaw4k);
        record.set(fields::CAR_ID_4K, car_id);
        record.set(fields::STOP_PASS_TIME, "1700000000");
        record.set(fields::LANE_NO, "3");
        record.set(fields::VEHICLE_CLASS, class);
        record.set(fields::IMAGE_PATH_NAME, dir.to_str().unwrap());
        record.set(fields::UNIQUE_KEY_PLAIN, format!("{car_id}_1700000000"));
        record
    }

    fn write_image(path: &std::path::Path) {
        let img = RgbImage::new(16, 16);
        DynamicImage::ImageRgb8(img)
            .save_with_format(path, image::ImageFormat::Jpeg)
            .unwrap();
    }

    fn reader(
        plate: Arc<Scripted>,
        ocr: Arc<Scripted>,
    ) -> (PlateReader, mpsc::UnboundedReceiver<Record>) {
        let (server_tx, server_rx) = mpsc::unbounded_channel();
        let (_, rx_ocr) = mpsc::unbounded_channel();
        let (_, shutdown) = watch::channel(false);
        (
            PlateReader::new(server_tx, rx_ocr, plate, ocr, Cleanup::new(), shutdown),
            server_rx,
        )
    }

    #[tokio::test]
    async fn best_of_two_picks_higher_score_and_deletes_sources() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("42_a.jpg");
        let b = dir.path().join("42_b.jpg");
        write_image(&a);
        write_image(&b);

        // First candidate reads "12" at 3.2, second "34" at 4.8.
        let plate = Scripted::new(vec![plate_box(0.6), plate_box(0.7)]);
        let ocr = Scripted::new(vec![chars(&[1, 2], 1.6), chars(&[3, 4], 2.4)]);
        let (reader, mut server_rx) = reader(plate, ocr);

        reader.handle_record(raw_4k(dir.path(), "42", "PCAR")).await;

        let record = server_rx.try_recv().unwrap();
        assert_eq!(record.text(fields::PLATE_NUM), "34");
        assert_eq!(record.text(fields::PLATE_DETECTED), "Y");
        assert_eq!(
            record.text(fields::CAR_IMAGE_FILE_NAME),
            "42_PCAR_3_1700000000.jpg"
        );
        assert_eq!(record.text(fields::PLATE_IMAGE_FILE_NAME), "42.jpg");
        assert!(record.bytes(fields::CAR_IMAGE_BYTES).is_some());
        assert!(record.bytes(fields::PLATE_IMAGE_BYTES).is_some());
        assert!(!a.exists());
        assert!(!b.exists());
    }

    #[tokio::test]
    async fn no_candidates_forwards_sentinel_record() {
        let dir = tempfile::tempdir().unwrap();
        let plate = Scripted::new(vec![]);
        let ocr = Scripted::new(vec![]);
        let (reader, mut server_rx) = reader(plate.clone(), ocr.clone());

        reader.handle_record(raw_4k(dir.path(), "42", "PCAR")).await;

        let record = server_rx.try_recv().unwrap();
        assert_eq!(record.text(fields::PLATE_NUM), N_PLATE);
        assert_eq!(record.text(fields::PLATE_DETECTED), "N");
        assert_eq!(record.text(fields::IMAGE_PATH_NAME), N_IMAGE);
        assert_eq!(record.text(fields::CAR_IMAGE_FILE_NAME), N_IMAGE);
        assert_eq!(plate.calls(), 0);
        assert_eq!(ocr.calls(), 0);
    }

    #[tokio::test]
    async fn motorcycles_skip_detection_but_keep_first_image() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("42_a.jpg");
        write_image(&file);

        let plate = Scripted::new(vec![]);
        let ocr = Scripted::new(vec![]);
        let (reader, mut server_rx) = reader(plate.clone(), ocr.clone());

        reader
            .handle_record(raw_4k(dir.path(), "42", "MOTOR"))
            .await;

        let record = server_rx.try_recv().unwrap();
        assert_eq!(record.text(fields::PLATE_NUM), N_PLATE);
        assert_eq!(record.text(fields::PLATE_DETECTED), "N");
        assert!(record.bytes(fields::CAR_IMAGE_BYTES).is_some());
        assert!(record.bytes(fields::PLATE_IMAGE_BYTES).is_none());
        assert_eq!(plate.calls(), 0);
        assert_eq!(ocr.calls(), 0);
        assert!(!file.exists());
    }

    #[tokio::test]
    async fn warm_up_runs_each_model_twice() {
        let plate = Scripted::new(vec![]);
        let ocr = Scripted::new(vec![]);
        let (reader, _server_rx) = reader(plate.clone(), ocr.clone());

        reader.warm_up().await;

        assert_eq!(plate.calls(), 2);
        assert_eq!(ocr.calls(), 2);
    }

    #[test]
    fn pad_square_centers_the_source() {
        let mut img = RgbImage::new(4, 2);
        img.put_pixel(0, 0, image::Rgb([255, 0, 0]));
        let padded = pad_square(&img);
        assert_eq!(padded.dimensions(), (4, 4));
        assert_eq!(padded.get_pixel(0, 1), &image::Rgb([255, 0, 0]));
        assert_eq!(padded.get_pixel(0, 0), &image::Rgb([0, 0, 0]));
    }
}
