//! Plate-text reconstruction from per-character detections.
//!
//! Characters are ordered by fitting a line through their centers. When the
//! spread around that line is large the plate is read as two rows: the
//! characters are split by a bisector through the two row centroids and
//! emitted upper row first.

use crate::ocr::detect::Detection;

/// Returned when the detector produced no characters at all.
pub const N_OCR: &str = "N_OCR";

/// Mean squared deviation from the regression line at or above which a
/// plate is treated as two-row.
const TWO_LINE_VARIANCE: f64 = 10.0;

/// Characters whose y-centers differ by less than this snap together.
const SNAP_PIXELS: f64 = 9.0;

/// Class ids at or below this emit the digit itself; larger ids resolve
/// through the model's class-name table.
const MAX_DIGIT_CLASS: usize = 9;

/// Assembles `(plate_text, summed_confidence)` from post-NMS character
/// detections. An empty set yields `(N_OCR, 0.1)`.
pub fn assemble_plate_text(detections: &[Detection], classes: &[String]) -> (String, f64) {
    if detections.is_empty() {
        return (N_OCR.to_string(), 0.1);
    }

    let mut centers: Vec<(f64, f64)> = detections.iter().map(Detection::center).collect();

    // Regression of y on x through the raw centers; the deviation variance
    // is the two-row signal and must be computed before noise dampening.
    let (slope, intercept) = regress(&centers);
    let predicted: Vec<f64> = centers.iter().map(|(x, _)| slope * x + intercept).collect();
    let variance = centers
        .iter()
        .zip(&predicted)
        .map(|((_, y), pred)| (pred - y).powi(2))
        .sum::<f64>()
        / centers.len() as f64;

    let conf: f64 = detections.iter().map(|d| d.conf).sum();

    // Dampen row jitter: near-equal y-centers collapse onto each other.
    for i in 0..centers.len() {
        for j in 0..centers.len() {
            if i != j && (centers[i].1 - centers[j].1).abs() < SNAP_PIXELS {
                centers[j].1 = centers[i].1;
            }
        }
    }

    let order = if variance >= TWO_LINE_VARIANCE {
        two_line_order(&centers, &predicted, slope).unwrap_or_else(|| x_order(&centers))
    } else {
        x_order(&centers)
    };

    let mut text = String::new();
    for index in order {
        let class_id = detections[index].class_id;
        if class_id <= MAX_DIGIT_CLASS {
            text.push_str(&class_id.to_string());
        } else if let Some(name) = classes.get(class_id) {
            text.push_str(name);
        }
    }

    (text, conf)
}

fn regress(centers: &[(f64, f64)]) -> (f64, f64) {
    let n = centers.len() as f64;
    let mean_x = centers.iter().map(|(x, _)| x).sum::<f64>() / n;
    let mean_y = centers.iter().map(|(_, y)| y).sum::<f64>() / n;
    let var_x = centers.iter().map(|(x, _)| (x - mean_x).powi(2)).sum::<f64>();
    if var_x == 0.0 {
        return (0.0, mean_y);
    }
    let cov = centers
        .iter()
        .map(|(x, y)| (x - mean_x) * (y - mean_y))
        .sum::<f64>();
    let slope = cov / var_x;
    (slope, mean_y - slope * mean_x)
}

/// Orders a two-row plate: partition by the regression line, re-partition by
/// a bisector of the same slope through the midpoint of the two group
/// centroids, then read each row left to right, upper row first. Returns
/// None when one side of the first partition is empty.
fn two_line_order(centers: &[(f64, f64)], predicted: &[f64], slope: f64) -> Option<Vec<usize>> {
    let (mut first_upper, mut first_lower) = (Vec::new(), Vec::new());
    for (index, (center, pred)) in centers.iter().zip(predicted).enumerate() {
        if center.1 < *pred {
            first_upper.push(index);
        } else {
            first_lower.push(index);
        }
    }
    if first_upper.is_empty() || first_lower.is_empty() {
        return None;
    }

    let centroid = |group: &[usize]| {
        let n = group.len() as f64;
        let x = group.iter().map(|&i| centers[i].0).sum::<f64>() / n;
        let y = group.iter().map(|&i| centers[i].1).sum::<f64>() / n;
        (x, y)
    };
    let (ux, uy) = centroid(&first_upper);
    let (dx, dy) = centroid(&first_lower);
    let mid_x = (ux + dx) / 2.0;
    let mid_y = (uy + dy) / 2.0;
    let bisector_intercept = mid_y - slope * mid_x;

    let (mut upper, mut lower) = (Vec::new(), Vec::new());
    for (index, center) in centers.iter().enumerate() {
        if center.1 < slope * center.0 + bisector_intercept {
            upper.push(index);
        } else {
            lower.push(index);
        }
    }

    let by_x = |group: &mut Vec<usize>| {
        group.sort_by(|&a, &b| {
            centers[a]
                .0
                .partial_cmp(&centers[b].0)
                .unwrap_or(std::cmp::Ordering::Equal)
        })
    };
    by_x(&mut upper);
    by_x(&mut lower);
    upper.extend(lower);
    Some(upper)
}

fn x_order(centers: &[(f64, f64)]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..centers.len()).collect();
    order.sort_by(|&a, &b| {
        centers[a]
            .0
            .partial_cmp(&centers[b].0)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    order
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classes() -> Vec<String> {
        let mut classes: Vec<String> = (0..10).map(|i| i.to_string()).collect();
        classes.extend(["GA", "NA", "DA"].map(str::to_string));
        classes
    }

    fn ch(x: f64, y: f64, class_id: usize, conf: f64) -> Detection {
        Detection {
            x,
            y,
            w: 10.0,
            h: 16.0,
            conf,
            class_id,
        }
    }

    #[test]
    fn empty_detections_yield_sentinel() {
        let (text, conf) = assemble_plate_text(&[], &classes());
        assert_eq!(text, N_OCR);
        assert_eq!(conf, 0.1);
    }

    #[test]
    fn single_row_reads_left_to_right() {
        // Given out of order; same y, variance is 0.
        let dets = [
            ch(40.0, 20.0, 3, 0.9),
            ch(0.0, 20.0, 1, 0.8),
            ch(20.0, 20.0, 2, 0.7),
        ];
        let (text, conf) = assemble_plate_text(&dets, &classes());
        assert_eq!(text, "123");
        assert!((conf - 2.4).abs() < 1e-9);
    }

    #[test]
    fn letter_classes_resolve_through_name_table() {
        let dets = [ch(0.0, 20.0, 1, 0.9), ch(20.0, 20.0, 10, 0.9), ch(40.0, 20.0, 2, 0.9)];
        let (text, _) = assemble_plate_text(&dets, &classes());
        assert_eq!(text, "1GA2");
    }

    #[test]
    fn two_row_plate_reads_upper_then_lower() {
        // Upper row "12" centered over lower row "345", 40 px apart; the
        // deviation variance is far above the two-row threshold.
        let dets = [
            ch(0.0, 50.0, 3, 0.9),
            ch(10.0, 10.0, 1, 0.9),
            ch(20.0, 50.0, 4, 0.9),
            ch(30.0, 10.0, 2, 0.9),
            ch(40.0, 50.0, 5, 0.9),
        ];
        let (text, _) = assemble_plate_text(&dets, &classes());
        assert_eq!(text, "12345");
    }

    #[test]
    fn near_rows_snap_into_one_line() {
        // y-centers differ by less than 9 px; treated as a single row.
        let dets = [
            ch(20.0, 24.0, 2, 0.9),
            ch(0.0, 20.0, 1, 0.9),
            ch(40.0, 22.0, 3, 0.9),
        ];
        let (text, _) = assemble_plate_text(&dets, &classes());
        assert_eq!(text, "123");
    }
}
