use crate::config::Label;
use crate::fields;
use crate::record::{DataType, Record, Value};
use crate::remap::SiteRemap;
use eyre::{eyre, Result};

/// Routing result: which internal queue each produced record goes to.
#[derive(Debug, Default)]
pub struct BuildResult {
    pub to_server: Vec<Record>,
    pub to_merge: Vec<Record>,
    pub to_ocr: Vec<Record>,
}

impl BuildResult {
    fn server(records: Vec<Record>) -> BuildResult {
        BuildResult {
            to_server: records,
            ..BuildResult::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.to_server.is_empty() && self.to_merge.is_empty() && self.to_ocr.is_empty()
    }
}

const CSV_2K: [&str; 13] = [
    fields::CAR_ID_2K,
    fields::VEHICLE_CLASS,
    fields::LANE_NO,
    fields::TURN_TYPE_CD,
    fields::TURN_TIME,
    fields::TURN_SPEED,
    fields::STOP_PASS_TIME,
    fields::STOP_PASS_SPEED,
    fields::INTERVAL_SPEED,
    fields::FIRST_DET_TIME,
    fields::OBSERVE_TIME,
    fields::IMAGE_PATH_NAME,
    fields::CAR_IMAGE_FILE_NAME,
];

const CSV_RAW_4K: [&str; 5] = [
    fields::CAR_ID_4K,
    fields::STOP_PASS_TIME,
    fields::LANE_NO,
    fields::VEHICLE_CLASS,
    fields::IMAGE_PATH_NAME,
];

const CSV_PED: [&str; 3] = [fields::TRACE_ID, fields::PED_DET_TIME, fields::PED_DIRECTION];

/// Translates one raw bus payload into routed records.
///
/// Never fails across the receiver boundary: a bad payload logs an error and
/// yields an empty result.
pub fn route(
    payload: &str,
    label: Label,
    send_to: &[String],
    remap: Option<&SiteRemap>,
) -> BuildResult {
    let built = match label {
        Label::Vehicle2k => build_vehicle_2k(payload, remap),
        Label::VehicleRaw4k => build_vehicle_raw_4k(payload),
        Label::Vehicle4k => build_vehicle_4k(payload),
        Label::Ped2k => build_ped(payload),
        Label::Stats => build_grouped(payload, "stats"),
        Label::Queue => build_grouped(payload, "queue"),
        Label::Incident => build_incident(payload),
        Label::SqliteSt => build_sqlite(payload, DataType::SqliteSt, 11),
        Label::SqliteLt => build_sqlite(payload, DataType::SqliteLt, 21),
        Label::SqliteRt => build_sqlite(payload, DataType::SqliteRt, 31),
        Label::PresenceVehicle => build_presence(payload, DataType::PresenceVehicle),
        Label::PresenceWait => build_presence(payload, DataType::PresenceWait),
        Label::PresenceCross => build_presence(payload, DataType::PresenceCross),
    };

    let mut result = match built {
        Ok(result) => result,
        Err(err) => {
            tracing::error!(?label, error = %err, "payload routing failed; dropping");
            return BuildResult::default();
        }
    };

    stamp_destinations(&mut result.to_server, send_to);
    stamp_destinations(&mut result.to_merge, send_to);
    stamp_destinations(&mut result.to_ocr, send_to);
    result
}

/// Stamps the channel's destination set onto every output record. A
/// merge-typed record that already carries `_send_to` keeps it; the
/// site-remap path relies on that.
fn stamp_destinations(records: &mut [Record], send_to: &[String]) {
    for record in records {
        let keep = record.data_type() == Some(DataType::Merge) && record.send_to().is_some();
        if !keep {
            record.set_send_to(send_to);
        }
    }
}

fn split_csv(payload: &str, schema: &[&str], dtype: DataType) -> Result<Record> {
    let parts: Vec<&str> = payload.split(',').collect();
    if parts.len() != schema.len() {
        return Err(eyre!(
            "{} payload has {} fields, expected {}",
            dtype,
            parts.len(),
            schema.len()
        ));
    }
    let mut record = Record::with_type(dtype);
    for (key, part) in schema.iter().zip(parts) {
        record.set(key, part.trim());
    }
    Ok(record)
}

fn join_key(parts: &[String]) -> String {
    parts.join("_")
}

/// The merge-seed is a pessimistic "assume no 4K match will arrive" record
/// destined for the merge table in case fusion fails.
fn merge_seed(vehicle: &Record) -> Record {
    let mut seed = vehicle.clone();
    seed.set_data_type(DataType::Merge);
    seed.set(fields::CAR_ID, vehicle.text(fields::CAR_ID_2K));
    seed.set(fields::PLATE_DETECTED, "N");
    seed
}

fn build_vehicle_2k(payload: &str, remap: Option<&SiteRemap>) -> Result<BuildResult> {
    let mut record = split_csv(payload, &CSV_2K, DataType::Vehicle2k)?;
    record.set(
        fields::UNIQUE_KEY_PLAIN,
        join_key(&[
            record.text(fields::CAR_ID_2K),
            record.text(fields::STOP_PASS_TIME),
            record.text(fields::VEHICLE_CLASS),
            record.text(fields::LANE_NO),
            record.text(fields::TURN_TIME),
            record.text(fields::STOP_PASS_SPEED),
            record.text(fields::CAR_IMAGE_FILE_NAME),
        ]),
    );

    // The merge queue always gets the original lane numbering so fusion keys
    // line up with the 4K detector.
    let for_merge = record.clone();

    if let Some(remap) = remap {
        let mut remapped = record.clone();
        remap.apply(&mut remapped);
        let seed = merge_seed(&remapped);
        return Ok(BuildResult {
            to_server: vec![remapped, seed],
            to_merge: vec![for_merge],
            to_ocr: Vec::new(),
        });
    }

    let seed = merge_seed(&record);
    Ok(BuildResult {
        to_server: vec![record, seed],
        to_merge: vec![for_merge],
        to_ocr: Vec::new(),
    })
}

fn build_vehicle_raw_4k(payload: &str) -> Result<BuildResult> {
    let mut record = split_csv(payload, &CSV_RAW_4K, DataType::VehicleRaw4k)?;
    record.set(
        fields::UNIQUE_KEY_PLAIN,
        join_key(&[
            record.text(fields::CAR_ID_4K),
            record.text(fields::STOP_PASS_TIME),
            record.text(fields::VEHICLE_CLASS),
            record.text(fields::LANE_NO),
        ]),
    );
    Ok(BuildResult {
        to_ocr: vec![record],
        ..BuildResult::default()
    })
}

fn build_vehicle_4k(payload: &str) -> Result<BuildResult> {
    let mut record = record_from_object(payload)?;
    record.set_data_type(DataType::Vehicle4k);
    record.set(
        fields::UNIQUE_KEY_PLAIN,
        join_key(&[
            record.text(fields::CAR_ID_4K),
            record.text(fields::STOP_PASS_TIME),
            record.text(fields::VEHICLE_CLASS),
            record.text(fields::LANE_NO),
        ]),
    );
    Ok(BuildResult {
        to_server: vec![record.clone()],
        to_merge: vec![record],
        to_ocr: Vec::new(),
    })
}

fn build_ped(payload: &str) -> Result<BuildResult> {
    let mut record = split_csv(payload, &CSV_PED, DataType::Ped2k)?;
    record.set(
        fields::UNIQUE_KEY_PLAIN,
        join_key(&[
            record.text(fields::TRACE_ID),
            record.text(fields::PED_DET_TIME),
            record.text(fields::PED_DIRECTION),
        ]),
    );
    Ok(BuildResult::server(vec![record]))
}

/// Stats and queue payloads share a shape: an object whose keys name
/// sub-categories and whose values are an object or a list of objects. Each
/// sub-value becomes its own record tagged `{name}_{suffix}`.
fn build_grouped(payload: &str, suffix: &str) -> Result<BuildResult> {
    let value: serde_json::Value =
        serde_json::from_str(payload).map_err(|e| eyre!("bad {suffix} payload: {e}"))?;
    let serde_json::Value::Object(groups) = value else {
        return Err(eyre!("{suffix} payload is not an object"));
    };

    let mut out = Vec::new();
    for (name, group) in groups {
        let tag = format!("{name}_{suffix}");
        let Some(dtype) = DataType::parse(&tag) else {
            tracing::error!(group = %name, "unknown {suffix} sub-category; skipping");
            continue;
        };
        let items: Vec<serde_json::Value> = match group {
            serde_json::Value::Array(items) => items,
            other => vec![other],
        };
        for item in items {
            let serde_json::Value::Object(map) = item else {
                tracing::error!(group = %name, "non-object {suffix} entry; skipping");
                continue;
            };
            let mut record = object_to_record(map);
            record.set_data_type(dtype);
            record.set(fields::UNIQUE_KEY_PLAIN, grouped_key(&record, dtype));
            out.push(record);
        }
    }
    Ok(BuildResult::server(out))
}

fn grouped_key(record: &Record, dtype: DataType) -> String {
    let mut parts = vec![dtype.as_str().to_string()];
    for key in [
        fields::HR_TYPE_CD,
        fields::STAT_START_TIME,
        fields::STAT_END_TIME,
        fields::LANE_NO,
        fields::TURN_TYPE_CD,
        fields::VEHICLE_CLASS,
    ] {
        if record.contains(key) {
            parts.push(record.text(key));
        }
    }
    join_key(&parts)
}

fn build_incident(payload: &str) -> Result<BuildResult> {
    let value: serde_json::Value =
        serde_json::from_str(payload).map_err(|e| eyre!("bad incident payload: {e}"))?;
    let serde_json::Value::Object(map) = value else {
        return Err(eyre!("incident payload is not an object"));
    };
    if map.len() != 1 {
        return Err(eyre!("incident payload must have exactly one entry"));
    }
    let (phase, inner) = map.into_iter().next().unwrap_or_default();
    let dtype = match phase.as_str() {
        "start" => DataType::IncidentStart,
        "end" => DataType::IncidentEnd,
        other => return Err(eyre!("unknown incident phase '{other}'")),
    };
    let serde_json::Value::Object(inner) = inner else {
        return Err(eyre!("incident body is not an object"));
    };
    let mut record = object_to_record(inner);
    record.set_data_type(dtype);
    record.set(
        fields::UNIQUE_KEY_PLAIN,
        join_key(&[
            record.text(fields::TRACE_ID),
            record.text(fields::INCIDENT_TIME),
        ]),
    );
    Ok(BuildResult::server(vec![record]))
}

/// Cross-edge vehicle rows destined for the local projection table. Only the
/// turn code this channel covers passes through; everything else is dropped.
fn build_sqlite(payload: &str, dtype: DataType, turn_code: i64) -> Result<BuildResult> {
    let mut record = record_from_object(payload)?;
    record.set_data_type(dtype);
    if record.int(fields::TURN_TYPE_CD) != Some(turn_code) {
        tracing::debug!(
            %dtype,
            turn = %record.text(fields::TURN_TYPE_CD),
            "turn code does not match channel; dropping"
        );
        return Ok(BuildResult::default());
    }
    if !record.contains(fields::UNIQUE_KEY_PLAIN) {
        record.set(
            fields::UNIQUE_KEY_PLAIN,
            join_key(&[
                record.text(fields::CAR_ID_2K),
                record.text(fields::STOP_PASS_TIME),
            ]),
        );
    }
    // Already shaped by the originating edge; the sender must not hash or
    // rewrite it again.
    record.set_prepared();
    Ok(BuildResult::server(vec![record]))
}

fn build_presence(payload: &str, dtype: DataType) -> Result<BuildResult> {
    let state = payload.trim();
    if state != "0" && state != "1" {
        return Err(eyre!("presence payload must be \"0\" or \"1\", got {state:?}"));
    }
    let mut record = Record::with_type(dtype);
    record.set(fields::PRESENCE_STATE, state);
    record.set(fields::UNIQUE_KEY_PLAIN, state);
    Ok(BuildResult::server(vec![record]))
}

fn record_from_object(payload: &str) -> Result<Record> {
    let value: serde_json::Value =
        serde_json::from_str(payload).map_err(|e| eyre!("bad object payload: {e}"))?;
    let serde_json::Value::Object(map) = value else {
        return Err(eyre!("payload is not an object"));
    };
    Ok(object_to_record(map))
}

fn object_to_record(map: serde_json::Map<String, serde_json::Value>) -> Record {
    let mut record = Record::new();
    for (key, value) in map {
        record.set(&key, Value::from_json(value));
    }
    record
}

#[cfg(test)]
mod tests {
    use super::*;

    const S1_2K: &str = "777,PCAR,2,11,1700000000,50,1700000002,60,55,1699999999,3,/img,777_2_1700000002.jpg";

    fn send_to() -> Vec<String> {
        vec!["L4".to_string(), "MW".to_string()]
    }

    #[test]
    fn vehicle_2k_produces_record_seed_and_merge_copy() {
        let result = route(S1_2K, Label::Vehicle2k, &send_to(), None);
        assert_eq!(result.to_server.len(), 2);
        assert_eq!(result.to_merge.len(), 1);
        assert!(result.to_ocr.is_empty());

        let record = &result.to_server[0];
        assert_eq!(record.data_type(), Some(DataType::Vehicle2k));
        assert_eq!(record.text(fields::CAR_ID_2K), "777");
        assert_eq!(record.text(fields::VEHICLE_CLASS), "PCAR");
        assert_eq!(record.int(fields::STOP_PASS_TIME), Some(1700000002));
        assert_eq!(
            record.text(fields::UNIQUE_KEY_PLAIN),
            "777_1700000002_PCAR_2_1700000000_60_777_2_1700000002.jpg"
        );
        assert_eq!(record.send_to(), Some(send_to()));

        // Router-emitted seed covers the "no 4K ever arrives" case.
        let seed = &result.to_server[1];
        assert_eq!(seed.data_type(), Some(DataType::Merge));
        assert_eq!(seed.text(fields::CAR_ID), "777");
        assert_eq!(seed.text(fields::PLATE_DETECTED), "N");

        assert_eq!(result.to_merge[0].data_type(), Some(DataType::Vehicle2k));
    }

    #[test]
    fn vehicle_2k_bad_field_count_yields_empty() {
        let result = route("777,PCAR,2", Label::Vehicle2k, &send_to(), None);
        assert!(result.is_empty());
    }

    #[test]
    fn raw_4k_goes_to_ocr_only() {
        let result = route("42,1700000000,3,PCAR,/img", Label::VehicleRaw4k, &send_to(), None);
        assert!(result.to_server.is_empty());
        assert_eq!(result.to_ocr.len(), 1);
        let record = &result.to_ocr[0];
        assert_eq!(record.data_type(), Some(DataType::VehicleRaw4k));
        assert_eq!(record.text(fields::IMAGE_PATH_NAME), "/img");
        assert_eq!(record.text(fields::UNIQUE_KEY_PLAIN), "42_1700000000_PCAR_3");
    }

    #[test]
    fn vehicle_4k_object_feeds_server_and_merge() {
        let payload = r#"{"car_id_4k": "888", "stop_pass_time": 1700000002,
            "lane_no": 2, "vehicle_class": "PCAR", "plate_num": "12GA3456",
            "plate_detected": "Y", "plate_image_file_name": "888.jpg"}"#;
        let result = route(payload, Label::Vehicle4k, &send_to(), None);
        assert_eq!(result.to_server.len(), 1);
        assert_eq!(result.to_merge.len(), 1);
        assert_eq!(result.to_merge[0].text(fields::PLATE_NUM), "12GA3456");
    }

    #[test]
    fn stats_fan_out_per_group() {
        let payload = r#"{
            "approach": {"hr_type_cd": 1, "stat_start_time": 100, "stat_end_time": 200},
            "lanes": [
                {"lane_no": 1, "stat_start_time": 100, "stat_end_time": 200},
                {"lane_no": 2, "stat_start_time": 100, "stat_end_time": 200}
            ]
        }"#;
        let result = route(payload, Label::Stats, &send_to(), None);
        assert_eq!(result.to_server.len(), 3);
        let types: Vec<_> = result
            .to_server
            .iter()
            .filter_map(|r| r.data_type())
            .collect();
        assert!(types.contains(&DataType::ApproachStats));
        assert_eq!(
            types.iter().filter(|t| **t == DataType::LanesStats).count(),
            2
        );
    }

    #[test]
    fn incident_phase_tags_type() {
        let payload = r#"{"start": {"trace_id": 5, "incident_time": 1700000100,
            "incident_type": "14", "image_path_name": "/img",
            "image_file_name": "inc_1700000100.jpg"}}"#;
        let result = route(payload, Label::Incident, &send_to(), None);
        assert_eq!(result.to_server.len(), 1);
        assert_eq!(
            result.to_server[0].data_type(),
            Some(DataType::IncidentStart)
        );
        assert_eq!(result.to_server[0].text(fields::UNIQUE_KEY_PLAIN), "5_1700000100");
    }

    #[test]
    fn sqlite_channel_filters_by_turn_code() {
        let matching = r#"{"car_id_2k": "1", "turn_type_cd": 21, "stop_pass_time": 100}"#;
        let result = route(matching, Label::SqliteLt, &send_to(), None);
        assert_eq!(result.to_server.len(), 1);
        assert!(result.to_server[0].is_prepared());

        let wrong_code = route(matching, Label::SqliteSt, &send_to(), None);
        assert!(wrong_code.is_empty());
    }

    #[test]
    fn presence_passes_through_minimal_record() {
        let result = route("1", Label::PresenceVehicle, &send_to(), None);
        assert_eq!(result.to_server.len(), 1);
        let record = &result.to_server[0];
        assert_eq!(record.data_type(), Some(DataType::PresenceVehicle));
        assert_eq!(record.text(fields::PRESENCE_STATE), "1");
        assert_eq!(record.text(fields::UNIQUE_KEY_PLAIN), "1");

        assert!(route("2", Label::PresenceVehicle, &send_to(), None).is_empty());
    }

    #[test]
    fn remap_rewrites_server_copy_but_not_merge_copy() {
        use crate::config::{DirectionRemap, SpecialSiteConfig};
        use std::collections::BTreeMap;

        let mut dir = BTreeMap::new();
        dir.insert(
            "straight".to_string(),
            DirectionRemap {
                cam_id: "CAM-S".to_string(),
                lane: vec![5, 6],
            },
        );
        let remap =
            SiteRemap::from_config(&SpecialSiteConfig { enabled: true, dir }).unwrap();

        let result = route(S1_2K, Label::Vehicle2k, &send_to(), Some(&remap));
        let server = &result.to_server[0];
        assert_eq!(server.text(fields::CAMERA_ID), "CAM-S");
        assert_eq!(server.int(fields::LANE_NO), Some(5));
        // Fusion still keys on the original detector lane.
        assert_eq!(result.to_merge[0].text(fields::LANE_NO), "2");
    }
}
