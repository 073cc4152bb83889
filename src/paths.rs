use chrono::{DateTime, Datelike, Timelike};

/// Fixed local-timezone offset (KST) added to image timestamps before the
/// date path is derived. The deployment has no DST to worry about.
const TZ_OFFSET_SECS: i64 = 32400;

/// Remote image category: vehicle and incident images are binned to the
/// minute, queue and plate images to the day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageCategory {
    Vehicle,
    Queue,
    Incident,
}

/// Builds the remote directory for an uploaded image:
/// `{base}/{camera_id}/{year}/{month}/{day}` plus `/{hour}/{minute}` for
/// vehicle and incident images, which are binned to the minute.
pub fn remote_dir(base: &str, camera_id: &str, unix_time: i64, category: ImageCategory) -> String {
    let base = base.trim_end_matches('/');
    format!(
        "{base}/{camera_id}/{}",
        time_path(unix_time, category)
    )
}

fn time_path(unix_time: i64, category: ImageCategory) -> String {
    let shifted = unix_time.saturating_add(TZ_OFFSET_SECS);
    let when = DateTime::from_timestamp(shifted, 0).unwrap_or_default();
    match category {
        ImageCategory::Vehicle | ImageCategory::Incident => format!(
            "{:04}/{:02}/{:02}/{:02}/{:02}",
            when.year(),
            when.month(),
            when.day(),
            when.hour(),
            when.minute()
        ),
        ImageCategory::Queue => {
            format!("{:04}/{:02}/{:02}", when.year(), when.month(), when.day())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // 2021-01-01 00:00:00 UTC is 09:00 local.
    const NEW_YEAR_UTC: i64 = 1609459200;

    #[test]
    fn vehicle_paths_are_minute_binned() {
        assert_eq!(
            remote_dir("/remote/2k", "CAM01", NEW_YEAR_UTC, ImageCategory::Vehicle),
            "/remote/2k/CAM01/2021/01/01/09/00"
        );
    }

    #[test]
    fn queue_paths_are_day_binned() {
        assert_eq!(
            remote_dir("/remote/queue/", "CAM01", NEW_YEAR_UTC, ImageCategory::Queue),
            "/remote/queue/CAM01/2021/01/01"
        );
    }

    #[test]
    fn same_inputs_same_path() {
        let a = remote_dir("/r", "C", 1700000002, ImageCategory::Incident);
        let b = remote_dir("/r", "C", 1700000002, ImageCategory::Incident);
        assert_eq!(a, b);
    }
}
