//! Canonical record field keys.
//!
//! Every stage (router, merger, OCR, sender) and every sink addresses record
//! fields through these names, and the columnar sink expects its discovered
//! column names to match them. Keys starting with `_` are handler-internal
//! bookkeeping and never leave the process except through the spool.

pub const DATA_TYPE: &str = "data_type";
pub const UNIQUE_KEY: &str = "unique_key";
pub const UNIQUE_KEY_PLAIN: &str = "unique_key_plain";
pub const SENT_TO: &str = "sent_to";
pub const SEND_TO: &str = "_send_to";
pub const PREPARED: &str = "_prepared";
pub const OBJECT_ID: &str = "object_id";
pub const CAMERA_ID: &str = "camera_id";

pub const CAR_ID: &str = "car_id";
pub const CAR_ID_2K: &str = "car_id_2k";
pub const CAR_ID_4K: &str = "car_id_4k";
pub const VEHICLE_CLASS: &str = "vehicle_class";
pub const LANE_NO: &str = "lane_no";
pub const TURN_TYPE_CD: &str = "turn_type_cd";
pub const TURN_TIME: &str = "turn_time";
pub const TURN_SPEED: &str = "turn_speed";
pub const STOP_PASS_TIME: &str = "stop_pass_time";
pub const STOP_PASS_SPEED: &str = "stop_pass_speed";
pub const INTERVAL_SPEED: &str = "interval_speed";
pub const FIRST_DET_TIME: &str = "first_det_time";
pub const OBSERVE_TIME: &str = "observe_time";

pub const IMAGE_PATH_NAME: &str = "image_path_name";
pub const IMAGE_FILE_NAME: &str = "image_file_name";
/// Full local path of the image picked for upload, set by the sender's
/// prepare step so the upload variants do not re-derive it.
pub const IMAGE_FILE: &str = "image_file";
pub const CAR_IMAGE_FILE_NAME: &str = "car_image_file_name";
pub const PLATE_IMAGE_FILE_NAME: &str = "plate_image_file_name";
pub const CAR_IMAGE_BYTES: &str = "car_image_bytes";
pub const PLATE_IMAGE_BYTES: &str = "plate_image_bytes";

pub const PLATE_NUM: &str = "plate_num";
pub const PLATE_DETECTED: &str = "plate_detected";

pub const TRACE_ID: &str = "trace_id";
pub const PED_DET_TIME: &str = "ped_det_time";
pub const PED_DIRECTION: &str = "ped_direction";

pub const HR_TYPE_CD: &str = "hr_type_cd";
pub const STAT_START_TIME: &str = "stat_start_time";
pub const STAT_END_TIME: &str = "stat_end_time";
pub const TOTAL_TRAVEL: &str = "total_travel";
pub const AVG_STOP_PASS_SPEED: &str = "avg_stop_pass_speed";
pub const AVG_INTERVAL_SPEED: &str = "avg_interval_speed";
pub const AVG_DENSITY: &str = "avg_density";
pub const MIN_DENSITY: &str = "min_density";
pub const MAX_DENSITY: &str = "max_density";
pub const AVG_LANE_OCCUPANCY: &str = "avg_lane_occupancy";
pub const LANE_OCCUPANCY: &str = "lane_occupancy";
pub const MBUS_TRAVEL: &str = "mbus_travel";
pub const LBUS_TRAVEL: &str = "lbus_travel";
pub const PCAR_TRAVEL: &str = "pcar_travel";
pub const MOTOR_TRAVEL: &str = "motor_travel";
pub const MTRUCK_TRAVEL: &str = "mtruck_travel";
pub const LTRUCK_TRAVEL: &str = "ltruck_travel";

pub const REMAIN_QUEUE_LEN: &str = "remain_queue_len";
pub const MAX_QUEUE_LEN: &str = "max_queue_len";

pub const INCIDENT_TIME: &str = "incident_time";
pub const INCIDENT_END_TIME: &str = "incident_end_time";
pub const INCIDENT_TYPE: &str = "incident_type";

pub const PRESENCE_STATE: &str = "presence_state";
