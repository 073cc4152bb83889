use tokio::sync::watch;

/// Runtime-discovered site identity. Both fields start unset and are filled
/// in exactly once by whichever discovery worker (RPC info endpoint, columnar
/// DB lookup, or a `manual` server entry) gets there first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SiteInfo {
    pub camera_id: Option<String>,
    pub lane_offset: Option<i64>,
}

/// Shared handle over the site state. Writers publish once; readers observe
/// either "unset" or the fixed value. Backed by a watch channel so workers
/// that gate on the camera id can await it instead of polling.
#[derive(Clone)]
pub struct Site {
    tx: watch::Sender<SiteInfo>,
}

impl Site {
    pub fn new() -> Site {
        let (tx, _) = watch::channel(SiteInfo::default());
        Site { tx }
    }

    /// Sets the camera id unless one is already published.
    pub fn set_camera_id(&self, camera_id: &str) {
        self.tx.send_if_modified(|info| {
            if info.camera_id.is_none() {
                info.camera_id = Some(camera_id.to_string());
                true
            } else {
                false
            }
        });
    }

    /// Sets the lane offset unless one is already published.
    pub fn set_lane_offset(&self, lane_offset: i64) {
        self.tx.send_if_modified(|info| {
            if info.lane_offset.is_none() {
                info.lane_offset = Some(lane_offset);
                true
            } else {
                false
            }
        });
    }

    pub fn camera_id(&self) -> Option<String> {
        self.tx.borrow().camera_id.clone()
    }

    pub fn lane_offset(&self) -> Option<i64> {
        self.tx.borrow().lane_offset
    }
}

impl Default for Site {
    fn default() -> Self {
        Site::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_writer_wins() {
        let site = Site::new();
        assert_eq!(site.camera_id(), None);
        site.set_camera_id("CAM01");
        site.set_camera_id("CAM02");
        assert_eq!(site.camera_id(), Some("CAM01".to_string()));

        site.set_lane_offset(2);
        site.set_lane_offset(5);
        assert_eq!(site.lane_offset(), Some(2));
    }

    #[test]
    fn readers_observe_unset_until_published() {
        let site = Site::new();
        let reader = site.clone();
        assert_eq!(reader.camera_id(), None);
        assert_eq!(reader.lane_offset(), None);
        site.set_camera_id("CAM09");
        assert_eq!(reader.camera_id(), Some("CAM09".to_string()));
    }
}
