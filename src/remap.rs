use crate::config::SpecialSiteConfig;
use crate::fields;
use crate::record::Record;
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
struct Direction {
    cam_id: String,
    lanes: Vec<i64>,
}

/// Optional per-deployment lane/camera substitution.
///
/// One site's physical layout does not match the detector's lane numbering:
/// each turn direction is covered by its own camera with its own real lane
/// numbers. Applied to bare 2K records at router time and to fused records at
/// merger time.
#[derive(Debug, Clone)]
pub struct SiteRemap {
    directions: BTreeMap<&'static str, Direction>,
}

impl SiteRemap {
    pub fn from_config(config: &SpecialSiteConfig) -> Option<SiteRemap> {
        if !config.enabled {
            return None;
        }
        let mut directions = BTreeMap::new();
        for (key, dir) in &config.dir {
            let name: &'static str = match key.as_str() {
                "straight" => "straight",
                "left" => "left",
                "right" => "right",
                _ => continue,
            };
            directions.insert(
                name,
                Direction {
                    cam_id: dir.cam_id.clone(),
                    lanes: dir.lane.clone(),
                },
            );
        }
        Some(SiteRemap { directions })
    }

    /// Overwrites camera id and lane number in place. Returns whether the
    /// record was remapped; unknown turn codes and out-of-range lanes leave
    /// it untouched.
    pub fn apply(&self, record: &mut Record) -> bool {
        let direction = match record.int(fields::TURN_TYPE_CD) {
            Some(11) => "straight",
            Some(21) => "left",
            Some(31) => "right",
            _ => return false,
        };
        let Some(dir) = self.directions.get(direction) else {
            return false;
        };
        let Some(lane) = record.int(fields::LANE_NO) else {
            return false;
        };

        let Some(index) = group_index(lane, dir.lanes.len()) else {
            tracing::warn!(
                lane,
                direction,
                lanes = dir.lanes.len(),
                "lane outside remap table; leaving record as-is"
            );
            return false;
        };
        let real_lane = dir.lanes[index];

        record.set(fields::CAMERA_ID, dir.cam_id.as_str());
        record.set(fields::LANE_NO, real_lane);
        true
    }
}

/// Reduces an incoming detector lane number to an index into the direction's
/// real-lane list.
fn group_index(lane: i64, lane_count: usize) -> Option<usize> {
    let index = match lane_count {
        0 => return None,
        1 => 0,
        2 => match lane {
            1 | 2 => 0,
            3 | 4 => 1,
            _ => return None,
        },
        3 => match lane {
            1 | 2 => 0,
            3 => 1,
            4 => 2,
            _ => return None,
        },
        _ => usize::try_from(lane.checked_sub(1)?).ok()?,
    };
    (index < lane_count).then_some(index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DirectionRemap;
    use crate::record::DataType;

    fn remap() -> SiteRemap {
        let mut dir = BTreeMap::new();
        dir.insert(
            "straight".to_string(),
            DirectionRemap {
                cam_id: "CAM-S".to_string(),
                lane: vec![3, 4],
            },
        );
        dir.insert(
            "left".to_string(),
            DirectionRemap {
                cam_id: "CAM-L".to_string(),
                lane: vec![7],
            },
        );
        SiteRemap::from_config(&SpecialSiteConfig { enabled: true, dir }).unwrap()
    }

    fn vehicle(turn: i64, lane: i64) -> Record {
        let mut record = Record::with_type(DataType::Vehicle2k);
        record.set(fields::TURN_TYPE_CD, turn);
        record.set(fields::LANE_NO, lane);
        record
    }

    #[test]
    fn two_lane_grouping() {
        let remap = remap();

        let mut low = vehicle(11, 2);
        assert!(remap.apply(&mut low));
        assert_eq!(low.int(fields::LANE_NO), Some(3));
        assert_eq!(low.text(fields::CAMERA_ID), "CAM-S");

        let mut high = vehicle(11, 4);
        assert!(remap.apply(&mut high));
        assert_eq!(high.int(fields::LANE_NO), Some(4));
    }

    #[test]
    fn single_lane_always_first() {
        let remap = remap();
        let mut record = vehicle(21, 4);
        assert!(remap.apply(&mut record));
        assert_eq!(record.int(fields::LANE_NO), Some(7));
        assert_eq!(record.text(fields::CAMERA_ID), "CAM-L");
    }

    #[test]
    fn unmapped_turn_code_untouched() {
        let remap = remap();
        let mut record = vehicle(41, 1);
        assert!(!remap.apply(&mut record));
        assert_eq!(record.int(fields::LANE_NO), Some(1));
        assert!(!record.contains(fields::CAMERA_ID));
    }

    #[test]
    fn out_of_range_lane_untouched() {
        let remap = remap();
        let mut record = vehicle(11, 9);
        assert!(!remap.apply(&mut record));
        assert_eq!(record.int(fields::LANE_NO), Some(9));
    }
}
