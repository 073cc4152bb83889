use crate::fields;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use eyre::{eyre, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

/// Sentinel returned for absent keys. Downstream formatters rely on always
/// getting a string back, never a missing-key error.
pub const NULL: &str = "NULL";

/// JSON object key used to round-trip byte blobs through the spool.
const BYTES_TAG: &str = "$bytes";

/// A single record field value.
///
/// This is the JSON value set plus `Bytes` for in-memory image buffers.
/// Bytes serialize as `{"$bytes": "<base64>"}` so a spooled record is
/// recoverable with every key and value intact.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Str(s) => serde_json::Value::String(s.clone()),
            Value::Bytes(b) => {
                let mut map = serde_json::Map::new();
                map.insert(
                    BYTES_TAG.to_string(),
                    serde_json::Value::String(BASE64.encode(b)),
                );
                serde_json::Value::Object(map)
            }
            Value::List(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Map(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }

    pub(crate) fn from_json(value: serde_json::Value) -> Value {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            serde_json::Value::String(s) => Value::Str(s),
            serde_json::Value::Array(items) => {
                Value::List(items.into_iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => {
                if map.len() == 1 {
                    if let Some(serde_json::Value::String(encoded)) = map.get(BYTES_TAG) {
                        if let Ok(bytes) = BASE64.decode(encoded) {
                            return Value::Bytes(bytes);
                        }
                    }
                }
                Value::Map(
                    map.into_iter()
                        .map(|(k, v)| (k, Value::from_json(v)))
                        .collect(),
                )
            }
        }
    }

    /// Text form used by the wire formatters. Absent values and byte blobs
    /// render as the NULL sentinel.
    pub fn as_text(&self) -> String {
        match self {
            Value::Null => NULL.to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::Str(s) => s.clone(),
            Value::Bytes(_) => NULL.to_string(),
            Value::List(_) | Value::Map(_) => self.to_json().to_string(),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        serde_json::Value::deserialize(deserializer).map(Value::from_json)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}

impl From<Vec<String>> for Value {
    fn from(items: Vec<String>) -> Self {
        Value::List(items.into_iter().map(Value::Str).collect())
    }
}

/// The closed set of record type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    Vehicle2k,
    Vehicle4k,
    VehicleRaw4k,
    Merge,
    Ped2k,
    ApproachStats,
    TurnTypesStats,
    LanesStats,
    VehicleTypesStats,
    ApproachQueue,
    LanesQueue,
    IncidentStart,
    IncidentEnd,
    SqliteSt,
    SqliteLt,
    SqliteRt,
    PresenceVehicle,
    PresenceWait,
    PresenceCross,
}

impl DataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Vehicle2k => "vehicle_2k",
            DataType::Vehicle4k => "vehicle_4k",
            DataType::VehicleRaw4k => "vehicle_raw_4k",
            DataType::Merge => "merge",
            DataType::Ped2k => "ped_2k",
            DataType::ApproachStats => "approach_stats",
            DataType::TurnTypesStats => "turn_types_stats",
            DataType::LanesStats => "lanes_stats",
            DataType::VehicleTypesStats => "vehicle_types_stats",
            DataType::ApproachQueue => "approach_queue",
            DataType::LanesQueue => "lanes_queue",
            DataType::IncidentStart => "incident_start",
            DataType::IncidentEnd => "incident_end",
            DataType::SqliteSt => "sqlite_st",
            DataType::SqliteLt => "sqlite_lt",
            DataType::SqliteRt => "sqlite_rt",
            DataType::PresenceVehicle => "presence_vehicle",
            DataType::PresenceWait => "presence_wait",
            DataType::PresenceCross => "presence_cross",
        }
    }

    pub fn parse(s: &str) -> Option<DataType> {
        let dtype = match s {
            "vehicle_2k" => DataType::Vehicle2k,
            "vehicle_4k" => DataType::Vehicle4k,
            "vehicle_raw_4k" => DataType::VehicleRaw4k,
            "merge" => DataType::Merge,
            "ped_2k" => DataType::Ped2k,
            "approach_stats" => DataType::ApproachStats,
            "turn_types_stats" => DataType::TurnTypesStats,
            "lanes_stats" => DataType::LanesStats,
            "vehicle_types_stats" => DataType::VehicleTypesStats,
            "approach_queue" => DataType::ApproachQueue,
            "lanes_queue" => DataType::LanesQueue,
            "incident_start" => DataType::IncidentStart,
            "incident_end" => DataType::IncidentEnd,
            "sqlite_st" => DataType::SqliteSt,
            "sqlite_lt" => DataType::SqliteLt,
            "sqlite_rt" => DataType::SqliteRt,
            "presence_vehicle" => DataType::PresenceVehicle,
            "presence_wait" => DataType::PresenceWait,
            "presence_cross" => DataType::PresenceCross,
            _ => return None,
        };
        Some(dtype)
    }

    pub fn is_presence(&self) -> bool {
        matches!(
            self,
            DataType::PresenceVehicle | DataType::PresenceWait | DataType::PresenceCross
        )
    }

    /// Types whose prepare step rewrites image paths and filenames.
    pub fn carries_image(&self) -> bool {
        matches!(
            self,
            DataType::Vehicle2k
                | DataType::VehicleRaw4k
                | DataType::Merge
                | DataType::IncidentStart
                | DataType::ApproachQueue
                | DataType::LanesQueue
        )
    }

    /// Types whose image is the vehicle image rather than the generic one.
    pub fn uses_car_image(&self) -> bool {
        matches!(
            self,
            DataType::Vehicle2k | DataType::VehicleRaw4k | DataType::Merge
        )
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A flat key/value record flowing through the pipeline.
///
/// Reads of absent keys yield the NULL sentinel instead of failing, which is
/// what lets every sink format optional fields without per-type checks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    fields: BTreeMap<String, Value>,
}

impl Record {
    pub fn new() -> Record {
        Record::default()
    }

    pub fn with_type(dtype: DataType) -> Record {
        let mut record = Record::default();
        record.set(fields::DATA_TYPE, dtype.as_str());
        record
    }

    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        self.fields.insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.fields.remove(key)
    }

    /// Get-or-sentinel accessor: absent keys read as `"NULL"`.
    pub fn text(&self, key: &str) -> String {
        self.fields
            .get(key)
            .map(Value::as_text)
            .unwrap_or_else(|| NULL.to_string())
    }

    pub fn int(&self, key: &str) -> Option<i64> {
        match self.fields.get(key)? {
            Value::Int(i) => Some(*i),
            Value::Float(f) => Some(*f as i64),
            Value::Str(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn float(&self, key: &str) -> Option<f64> {
        match self.fields.get(key)? {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Str(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn bytes(&self, key: &str) -> Option<&[u8]> {
        match self.fields.get(key)? {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn data_type(&self) -> Option<DataType> {
        match self.fields.get(fields::DATA_TYPE)? {
            Value::Str(s) => DataType::parse(s),
            _ => None,
        }
    }

    pub fn set_data_type(&mut self, dtype: DataType) {
        self.set(fields::DATA_TYPE, dtype.as_str());
    }

    pub fn is_prepared(&self) -> bool {
        matches!(self.fields.get(fields::PREPARED), Some(Value::Bool(true)))
    }

    pub fn set_prepared(&mut self) {
        self.set(fields::PREPARED, true);
    }

    /// Permitted destinations, when the router restricted them.
    pub fn send_to(&self) -> Option<Vec<String>> {
        match self.fields.get(fields::SEND_TO)? {
            Value::List(items) => Some(items.iter().map(Value::as_text).collect()),
            _ => None,
        }
    }

    pub fn set_send_to(&mut self, destinations: &[String]) {
        self.set(fields::SEND_TO, destinations.to_vec());
    }

    pub fn sent(&self, destination: &str) -> bool {
        match self.fields.get(fields::SENT_TO) {
            Some(Value::Map(map)) => matches!(map.get(destination), Some(Value::Bool(true))),
            _ => false,
        }
    }

    /// Records a delivery outcome. A `true` is sticky: a later `false` for
    /// the same destination never resets it.
    pub fn mark_sent(&mut self, destination: &str, ok: bool) {
        let entry = self
            .fields
            .entry(fields::SENT_TO.to_string())
            .or_insert_with(|| Value::Map(BTreeMap::new()));
        if let Value::Map(map) = entry {
            let already = matches!(map.get(destination), Some(Value::Bool(true)));
            map.insert(destination.to_string(), Value::Bool(already || ok));
        }
    }

    /// Serialization used by the spool and the KV bus.
    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| eyre!("record serialize failed: {e}"))
    }

    pub fn from_json_str(raw: &str) -> Result<Record> {
        serde_json::from_str(raw).map_err(|e| eyre!("record deserialize failed: {e}"))
    }
}

impl Serialize for Record {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.fields.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Record {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        BTreeMap::<String, Value>::deserialize(deserializer).map(|fields| Record { fields })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields;

    #[test]
    fn absent_keys_read_as_null_sentinel() {
        let record = Record::new();
        assert_eq!(record.text("no_such_key"), "NULL");
        assert_eq!(record.int("no_such_key"), None);
    }

    #[test]
    fn numeric_strings_parse_through_accessors() {
        let mut record = Record::new();
        record.set(fields::STOP_PASS_TIME, "1700000002");
        record.set(fields::TURN_SPEED, "50.5");
        assert_eq!(record.int(fields::STOP_PASS_TIME), Some(1700000002));
        assert_eq!(record.float(fields::TURN_SPEED), Some(50.5));
    }

    #[test]
    fn sent_to_true_is_sticky() {
        let mut record = Record::new();
        record.mark_sent("A", false);
        assert!(!record.sent("A"));
        record.mark_sent("A", true);
        assert!(record.sent("A"));
        record.mark_sent("A", false);
        assert!(record.sent("A"));
    }

    #[test]
    fn spool_round_trip_preserves_all_fields() {
        let mut record = Record::with_type(DataType::VehicleRaw4k);
        record.set(fields::CAR_ID_4K, "42");
        record.set(fields::LANE_NO, 3i64);
        record.set(fields::TURN_SPEED, 51.25);
        record.set(fields::CAR_IMAGE_BYTES, vec![0xffu8, 0xd8, 0x00, 0x10]);
        record.set_send_to(&["L4".to_string(), "MW".to_string()]);
        record.mark_sent("L4", true);
        record.mark_sent("MW", false);
        record.set_prepared();

        let json = record.to_json_string().unwrap();
        let restored = Record::from_json_str(&json).unwrap();
        assert_eq!(restored, record);
        assert_eq!(restored.bytes(fields::CAR_IMAGE_BYTES).unwrap().len(), 4);
        assert!(restored.sent("L4"));
        assert!(!restored.sent("MW"));
        assert!(restored.is_prepared());
    }

    #[test]
    fn data_type_round_trip() {
        for tag in [
            "vehicle_2k",
            "vehicle_raw_4k",
            "merge",
            "turn_types_stats",
            "presence_cross",
        ] {
            let dtype = DataType::parse(tag).unwrap();
            assert_eq!(dtype.as_str(), tag);
        }
        assert!(DataType::parse("bogus").is_none());
    }
}
