use crate::config::ModelConfig;
use async_trait::async_trait;
use eyre::{eyre, Result};
use serde::Deserialize;
use std::time::Duration;

/// One detected object in image pixel coordinates (top-left corner).
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct Detection {
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
    pub conf: f64,
    pub class_id: usize,
}

impl Detection {
    pub fn center(&self) -> (f64, f64) {
        (self.x + self.w / 2.0, self.y + self.h / 2.0)
    }

    fn area(&self) -> f64 {
        self.w.max(0.0) * self.h.max(0.0)
    }

    fn iou(&self, other: &Detection) -> f64 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.w).min(other.x + other.w);
        let y2 = (self.y + self.h).min(other.y + other.h);
        let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }
}

/// Greedy non-max suppression: drop boxes under the score threshold, then
/// keep boxes in descending score order unless they overlap a kept box by
/// more than the IoU threshold.
pub fn nms(detections: &[Detection], score_thresh: f64, iou_thresh: f64) -> Vec<Detection> {
    let mut candidates: Vec<Detection> = detections
        .iter()
        .copied()
        .filter(|d| d.conf >= score_thresh)
        .collect();
    candidates.sort_by(|a, b| b.conf.partial_cmp(&a.conf).unwrap_or(std::cmp::Ordering::Equal));

    let mut kept: Vec<Detection> = Vec::new();
    for candidate in candidates {
        if kept.iter().all(|k| k.iou(&candidate) <= iou_thresh) {
            kept.push(candidate);
        }
    }
    kept
}

/// Object detection backend. The models themselves run out of process; the
/// stage only depends on this contract.
#[async_trait]
pub trait Detector: Send + Sync {
    /// Raw (pre-NMS) detections for one JPEG frame.
    async fn detect(&self, jpeg: &[u8]) -> Result<Vec<Detection>>;

    /// Class-name table; ids above 9 resolve through it.
    fn classes(&self) -> &[String];

    /// Square input size the model expects; warm-up frames use it.
    fn input_size(&self) -> u32;
}

#[derive(Debug, Deserialize)]
struct DetectReply {
    detections: Vec<Detection>,
}

/// Production detector: posts the frame to a configured inference endpoint
/// and parses its JSON detection list.
pub struct HttpDetector {
    client: reqwest::Client,
    endpoint: String,
    classes: Vec<String>,
    input_size: u32,
}

impl HttpDetector {
    pub fn load(config: &ModelConfig) -> Result<HttpDetector> {
        let names = std::fs::read_to_string(&config.names)
            .map_err(|e| eyre!("failed to read class names {}: {e}", config.names))?;
        let classes: Vec<String> = names
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();
        if classes.is_empty() {
            return Err(eyre!("class name table {} is empty", config.names));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| eyre!("detector client build failed: {e}"))?;
        Ok(HttpDetector {
            client,
            endpoint: config.endpoint.clone(),
            classes,
            input_size: config.input_size,
        })
    }
}

#[async_trait]
impl Detector for HttpDetector {
    async fn detect(&self, jpeg: &[u8]) -> Result<Vec<Detection>> {
        let response = self
            .client
            .post(&self.endpoint)
            .header(reqwest::header::CONTENT_TYPE, "image/jpeg")
            .body(jpeg.to_vec())
            .send()
            .await
            .map_err(|e| eyre!("inference request failed: {e}"))?;
        let reply: DetectReply = response
            .json()
            .await
            .map_err(|e| eyre!("inference reply unreadable: {e}"))?;
        Ok(reply.detections)
    }

    fn classes(&self) -> &[String] {
        &self.classes
    }

    fn input_size(&self) -> u32 {
        self.input_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(x: f64, y: f64, w: f64, h: f64, conf: f64) -> Detection {
        Detection {
            x,
            y,
            w,
            h,
            conf,
            class_id: 0,
        }
    }

    #[test]
    fn nms_drops_low_scores() {
        let kept = nms(&[det(0.0, 0.0, 10.0, 10.0, 0.4)], 0.5, 0.4);
        assert!(kept.is_empty());
    }

    #[test]
    fn nms_suppresses_heavy_overlap() {
        let kept = nms(
            &[
                det(0.0, 0.0, 10.0, 10.0, 0.9),
                det(1.0, 1.0, 10.0, 10.0, 0.8),
                det(50.0, 50.0, 10.0, 10.0, 0.7),
            ],
            0.5,
            0.4,
        );
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].conf, 0.9);
        assert_eq!(kept[1].conf, 0.7);
    }

    #[test]
    fn iou_of_disjoint_boxes_is_zero() {
        assert_eq!(det(0.0, 0.0, 5.0, 5.0, 1.0).iou(&det(10.0, 10.0, 5.0, 5.0, 1.0)), 0.0);
    }
}
