use crate::config::{RpcMode, ServerConfig};
use crate::fields;
use crate::record::{DataType, Record};
use crate::sink::columnar::ColumnarSink;
use crate::sink::SinkAdaptor;
use crate::site::Site;
use async_trait::async_trait;
use eyre::{eyre, Result};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tonic::transport::{Channel, Endpoint};

const INSERT_ATTEMPTS: usize = 3;
const INFO_FETCH_TIMEOUT: Duration = Duration::from_secs(2);
const INFO_RETRY_WAIT: Duration = Duration::from_secs(10);

/// Wire messages of the edge data service. The schema itself is owned by the
/// remote side; these mirror it field for field, so the client drives the
/// channel directly instead of carrying a codegen step.
pub mod messages {
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Empty {}

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct SaveReply {
        #[prost(int32, tag = "1")]
        pub status_code: i32,
        #[prost(string, tag = "2")]
        pub message: String,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct EdgeInfoReply {
        #[prost(string, tag = "1")]
        pub camera_id: String,
        #[prost(int64, tag = "2")]
        pub lane_offset: i64,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Vehicle2kRequest {
        #[prost(string, tag = "1")]
        pub camera_id: String,
        #[prost(string, tag = "2")]
        pub vehicle_class: String,
        #[prost(int64, tag = "3")]
        pub lane_no: i64,
        #[prost(string, tag = "4")]
        pub turn_type_cd: String,
        #[prost(int64, tag = "5")]
        pub turn_time: i64,
        #[prost(double, tag = "6")]
        pub turn_speed: f64,
        #[prost(int64, tag = "7")]
        pub stop_pass_time: i64,
        #[prost(double, tag = "8")]
        pub stop_pass_speed: f64,
        #[prost(double, tag = "9")]
        pub interval_speed: f64,
        #[prost(int64, tag = "10")]
        pub first_det_time: i64,
        #[prost(int64, tag = "11")]
        pub observe_time: i64,
        #[prost(string, tag = "12")]
        pub image_path_name: String,
        #[prost(string, tag = "13")]
        pub car_image_file_name: String,
        #[prost(string, tag = "14")]
        pub car_id_2k: String,
        #[prost(string, tag = "15")]
        pub unique_key: String,
        #[prost(int64, tag = "16")]
        pub crt_unix_tm: i64,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Vehicle4kRequest {
        #[prost(string, tag = "1")]
        pub camera_id: String,
        #[prost(string, tag = "2")]
        pub vehicle_class: String,
        #[prost(int64, tag = "3")]
        pub lane_no: i64,
        #[prost(int64, tag = "4")]
        pub stop_pass_time: i64,
        #[prost(string, tag = "5")]
        pub plate_num: String,
        #[prost(string, tag = "6")]
        pub plate_detected: String,
        #[prost(string, tag = "7")]
        pub image_path_name: String,
        #[prost(string, tag = "8")]
        pub car_image_file_name: String,
        #[prost(string, tag = "9")]
        pub plate_image_file_name: String,
        #[prost(string, tag = "10")]
        pub car_id_4k: String,
        #[prost(string, tag = "11")]
        pub unique_key: String,
        #[prost(int64, tag = "12")]
        pub crt_unix_tm: i64,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct MergeRequest {
        #[prost(string, tag = "1")]
        pub camera_id: String,
        #[prost(string, tag = "2")]
        pub vehicle_class: String,
        #[prost(string, tag = "3")]
        pub lane_no: String,
        #[prost(string, tag = "4")]
        pub turn_type_cd: String,
        #[prost(int64, tag = "5")]
        pub turn_time: i64,
        #[prost(double, tag = "6")]
        pub turn_speed: f64,
        #[prost(int64, tag = "7")]
        pub stop_pass_time: i64,
        #[prost(double, tag = "8")]
        pub stop_pass_speed: f64,
        #[prost(double, tag = "9")]
        pub interval_speed: f64,
        #[prost(int64, tag = "10")]
        pub first_det_time: i64,
        #[prost(int64, tag = "11")]
        pub observe_time: i64,
        #[prost(string, tag = "12")]
        pub plate_num: String,
        #[prost(string, tag = "13")]
        pub plate_detected: String,
        #[prost(string, tag = "14")]
        pub image_path_name: String,
        #[prost(string, tag = "15")]
        pub car_image_file_name: String,
        #[prost(string, tag = "16")]
        pub plate_image_file_name: String,
        #[prost(string, tag = "17")]
        pub car_id: String,
        #[prost(string, tag = "18")]
        pub unique_key: String,
        #[prost(int64, tag = "19")]
        pub crt_unix_tm: i64,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct PedestrianRequest {
        #[prost(string, tag = "1")]
        pub camera_id: String,
        #[prost(int64, tag = "2")]
        pub trace_id: i64,
        #[prost(int64, tag = "3")]
        pub ped_det_time: i64,
        #[prost(string, tag = "4")]
        pub ped_direction: String,
        #[prost(string, tag = "5")]
        pub unique_key: String,
        #[prost(int64, tag = "6")]
        pub crt_unix_tm: i64,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct ApproachStatsRequest {
        #[prost(string, tag = "1")]
        pub camera_id: String,
        #[prost(int64, tag = "2")]
        pub hr_type_cd: i64,
        #[prost(int64, tag = "3")]
        pub stat_start_time: i64,
        #[prost(int64, tag = "4")]
        pub stat_end_time: i64,
        #[prost(int64, tag = "5")]
        pub total_travel: i64,
        #[prost(double, tag = "6")]
        pub avg_stop_pass_speed: f64,
        #[prost(double, tag = "7")]
        pub avg_interval_speed: f64,
        #[prost(int64, tag = "8")]
        pub avg_density: i64,
        #[prost(int64, tag = "9")]
        pub min_density: i64,
        #[prost(int64, tag = "10")]
        pub max_density: i64,
        #[prost(double, tag = "11")]
        pub avg_lane_occupancy: f64,
        #[prost(string, tag = "12")]
        pub unique_key: String,
        #[prost(int64, tag = "13")]
        pub crt_unix_tm: i64,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct TurnTypesStatsRequest {
        #[prost(string, tag = "1")]
        pub camera_id: String,
        #[prost(int64, tag = "2")]
        pub hr_type_cd: i64,
        #[prost(int64, tag = "3")]
        pub turn_type_cd: i64,
        #[prost(int64, tag = "4")]
        pub stat_start_time: i64,
        #[prost(int64, tag = "5")]
        pub stat_end_time: i64,
        #[prost(int64, tag = "6")]
        pub mbus_travel: i64,
        #[prost(int64, tag = "7")]
        pub lbus_travel: i64,
        #[prost(int64, tag = "8")]
        pub pcar_travel: i64,
        #[prost(int64, tag = "9")]
        pub motor_travel: i64,
        #[prost(int64, tag = "10")]
        pub mtruck_travel: i64,
        #[prost(int64, tag = "11")]
        pub ltruck_travel: i64,
        #[prost(double, tag = "12")]
        pub avg_stop_pass_speed: f64,
        #[prost(double, tag = "13")]
        pub avg_interval_speed: f64,
        #[prost(string, tag = "14")]
        pub unique_key: String,
        #[prost(int64, tag = "15")]
        pub crt_unix_tm: i64,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct LanesStatsRequest {
        #[prost(string, tag = "1")]
        pub camera_id: String,
        #[prost(int64, tag = "2")]
        pub hr_type_cd: i64,
        #[prost(int64, tag = "3")]
        pub lane_no: i64,
        #[prost(int64, tag = "4")]
        pub stat_start_time: i64,
        #[prost(int64, tag = "5")]
        pub stat_end_time: i64,
        #[prost(int64, tag = "6")]
        pub total_travel: i64,
        #[prost(double, tag = "7")]
        pub avg_stop_pass_speed: f64,
        #[prost(double, tag = "8")]
        pub avg_interval_speed: f64,
        #[prost(int64, tag = "9")]
        pub avg_density: i64,
        #[prost(int64, tag = "10")]
        pub min_density: i64,
        #[prost(int64, tag = "11")]
        pub max_density: i64,
        #[prost(double, tag = "12")]
        pub lane_occupancy: f64,
        #[prost(string, tag = "13")]
        pub unique_key: String,
        #[prost(int64, tag = "14")]
        pub crt_unix_tm: i64,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct VehicleTypesStatsRequest {
        #[prost(string, tag = "1")]
        pub camera_id: String,
        #[prost(int64, tag = "2")]
        pub hr_type_cd: i64,
        #[prost(string, tag = "3")]
        pub vehicle_class: String,
        #[prost(int64, tag = "4")]
        pub stat_start_time: i64,
        #[prost(int64, tag = "5")]
        pub stat_end_time: i64,
        #[prost(int64, tag = "6")]
        pub total_travel: i64,
        #[prost(double, tag = "7")]
        pub avg_stop_pass_speed: f64,
        #[prost(double, tag = "8")]
        pub avg_interval_speed: f64,
        #[prost(string, tag = "9")]
        pub unique_key: String,
        #[prost(int64, tag = "10")]
        pub crt_unix_tm: i64,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct ApproachQueueRequest {
        #[prost(string, tag = "1")]
        pub camera_id: String,
        #[prost(int64, tag = "2")]
        pub stat_start_time: i64,
        #[prost(int64, tag = "3")]
        pub stat_end_time: i64,
        #[prost(double, tag = "4")]
        pub remain_queue_len: f64,
        #[prost(double, tag = "5")]
        pub max_queue_len: f64,
        #[prost(string, tag = "6")]
        pub image_path_name: String,
        #[prost(string, tag = "7")]
        pub image_file_name: String,
        #[prost(string, tag = "8")]
        pub unique_key: String,
        #[prost(int64, tag = "9")]
        pub crt_unix_tm: i64,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct LanesQueueRequest {
        #[prost(string, tag = "1")]
        pub camera_id: String,
        #[prost(int64, tag = "2")]
        pub lane_no: i64,
        #[prost(int64, tag = "3")]
        pub stat_start_time: i64,
        #[prost(int64, tag = "4")]
        pub stat_end_time: i64,
        #[prost(double, tag = "5")]
        pub remain_queue_len: f64,
        #[prost(double, tag = "6")]
        pub max_queue_len: f64,
        #[prost(string, tag = "7")]
        pub image_path_name: String,
        #[prost(string, tag = "8")]
        pub image_file_name: String,
        #[prost(string, tag = "9")]
        pub unique_key: String,
        #[prost(int64, tag = "10")]
        pub crt_unix_tm: i64,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct IncidentStartRequest {
        #[prost(string, tag = "1")]
        pub camera_id: String,
        #[prost(int64, tag = "2")]
        pub trace_id: i64,
        #[prost(int64, tag = "3")]
        pub incident_time: i64,
        #[prost(string, tag = "4")]
        pub incident_type: String,
        #[prost(string, tag = "5")]
        pub image_path_name: String,
        #[prost(string, tag = "6")]
        pub image_file_name: String,
        #[prost(string, tag = "7")]
        pub unique_key: String,
        #[prost(int64, tag = "8")]
        pub crt_unix_tm: i64,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct IncidentEndRequest {
        #[prost(string, tag = "1")]
        pub camera_id: String,
        #[prost(int64, tag = "2")]
        pub trace_id: i64,
        #[prost(int64, tag = "3")]
        pub incident_time: i64,
        #[prost(int64, tag = "4")]
        pub incident_end_time: i64,
        #[prost(string, tag = "5")]
        pub unique_key: String,
        #[prost(int64, tag = "6")]
        pub crt_unix_tm: i64,
    }
}

/// Mode-dependent extra fields: `java` servers expect the unique key,
/// `sharp` servers expect the client-side creation time.
#[derive(Debug, Clone, Default)]
struct Extras {
    unique_key: String,
    crt_unix_tm: i64,
}

struct Inner {
    name: String,
    host: String,
    port: u16,
    mode: RpcMode,
    channel: Channel,
    site: Site,
}

/// RPC sink over the edge data service.
pub struct RpcSink {
    inner: Arc<Inner>,
    companion: Option<ColumnarSink>,
}

impl RpcSink {
    pub fn new(config: &ServerConfig, site: Site) -> Result<RpcSink> {
        let mode = config
            .mode
            .ok_or_else(|| eyre!("rpc server '{}' without mode", config.name))?;
        let channel = Endpoint::from_shared(format!("http://{}:{}", config.ip, config.port))
            .map_err(|e| eyre!("bad rpc endpoint {}:{}: {e}", config.ip, config.port))?
            .connect_timeout(Duration::from_secs(2))
            .connect_lazy();

        // In sharp mode the camera/lane discovery lives in a companion
        // columnar endpoint, configured rather than assumed.
        let companion = match (mode, &config.companion) {
            (RpcMode::Sharp, Some(companion)) => Some(ColumnarSink::new(
                &companion.name,
                &companion.ip,
                companion.port,
                site.clone(),
            )?),
            (RpcMode::Sharp, None) => {
                return Err(eyre!(
                    "rpc server '{}' in sharp mode needs a companion entry",
                    config.name
                ))
            }
            (RpcMode::Java, _) => None,
        };

        Ok(RpcSink {
            inner: Arc::new(Inner {
                name: config.name.clone(),
                host: config.ip.clone(),
                port: config.port,
                mode,
                channel,
                site,
            }),
            companion,
        })
    }
}

impl Inner {
    fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    async fn unary<Req, Resp>(&self, path: &'static str, request: Req) -> Result<Resp>
    where
        Req: prost::Message + 'static,
        Resp: prost::Message + Default + 'static,
    {
        let mut grpc = tonic::client::Grpc::new(self.channel.clone());
        grpc.ready()
            .await
            .map_err(|e| eyre!("rpc channel not ready: {e}"))?;
        let codec: tonic::codec::ProstCodec<Req, Resp> = tonic::codec::ProstCodec::default();
        let path = tonic::codegen::http::uri::PathAndQuery::from_static(path);
        let response = grpc
            .unary(tonic::Request::new(request), path, codec)
            .await
            .map_err(|e| eyre!("rpc call failed: {e}"))?;
        Ok(response.into_inner())
    }

    fn extras(&self, record: &Record) -> Extras {
        match self.mode {
            RpcMode::Java => Extras {
                unique_key: record.text(fields::UNIQUE_KEY),
                crt_unix_tm: 0,
            },
            RpcMode::Sharp => Extras {
                unique_key: String::new(),
                crt_unix_tm: now_unix(),
            },
        }
    }

    async fn save(&self, record: &Record, dtype: DataType) -> Result<messages::SaveReply> {
        let extras = self.extras(record);
        match dtype {
            DataType::Vehicle2k => {
                self.unary("/edge.EdgeData/SaveVehicle2k", build_vehicle_2k(record, &extras))
                    .await
            }
            DataType::Vehicle4k | DataType::VehicleRaw4k => {
                self.unary("/edge.EdgeData/SaveVehicle4k", build_vehicle_4k(record, &extras))
                    .await
            }
            DataType::Merge => {
                self.unary("/edge.EdgeData/SaveMerge", build_merge(record, &extras))
                    .await
            }
            DataType::Ped2k => {
                self.unary("/edge.EdgeData/SavePedestrian", build_pedestrian(record, &extras))
                    .await
            }
            DataType::ApproachStats => {
                self.unary(
                    "/edge.EdgeData/SaveApproachStats",
                    build_approach_stats(record, &extras),
                )
                .await
            }
            DataType::TurnTypesStats => {
                self.unary(
                    "/edge.EdgeData/SaveTurnTypesStats",
                    build_turn_types_stats(record, &extras),
                )
                .await
            }
            DataType::LanesStats => {
                self.unary(
                    "/edge.EdgeData/SaveLanesStats",
                    build_lanes_stats(record, &extras),
                )
                .await
            }
            DataType::VehicleTypesStats => {
                self.unary(
                    "/edge.EdgeData/SaveVehicleTypesStats",
                    build_vehicle_types_stats(record, &extras),
                )
                .await
            }
            DataType::ApproachQueue => {
                self.unary(
                    "/edge.EdgeData/SaveApproachQueue",
                    build_approach_queue(record, &extras),
                )
                .await
            }
            DataType::LanesQueue => {
                self.unary(
                    "/edge.EdgeData/SaveLanesQueue",
                    build_lanes_queue(record, &extras),
                )
                .await
            }
            DataType::IncidentStart => {
                self.unary(
                    "/edge.EdgeData/SaveIncidentStart",
                    build_incident_start(record, &extras),
                )
                .await
            }
            DataType::IncidentEnd => {
                self.unary(
                    "/edge.EdgeData/SaveIncidentEnd",
                    build_incident_end(record, &extras),
                )
                .await
            }
            other => Err(eyre!("no rpc request builder for {other}")),
        }
    }

    /// `java` discovery: fetch `{camera_id, lane_offset}` from the info
    /// endpoint, retrying every 10 seconds until something publishes it.
    async fn info_loop(self: Arc<Self>) {
        while self.site.camera_id().is_none() {
            let fetched = tokio::time::timeout(
                INFO_FETCH_TIMEOUT,
                self.unary::<messages::Empty, messages::EdgeInfoReply>(
                    "/edge.EdgeInfo/GetEdgeInfo",
                    messages::Empty {},
                ),
            )
            .await;
            match fetched {
                Ok(Ok(reply)) => {
                    self.site.set_camera_id(&reply.camera_id);
                    self.site.set_lane_offset(reply.lane_offset);
                    tracing::info!(
                        camera_id = %reply.camera_id,
                        lane_offset = reply.lane_offset,
                        server = %self.endpoint(),
                        "rpc edge info retrieved"
                    );
                    return;
                }
                Ok(Err(err)) => {
                    tracing::error!(
                        server = %self.endpoint(),
                        error = %err,
                        "edge info fetch failed; retrying every 10 seconds"
                    );
                }
                Err(_) => {
                    tracing::error!(
                        server = %self.endpoint(),
                        "edge info fetch timed out; retrying every 10 seconds"
                    );
                }
            }
            tokio::time::sleep(INFO_RETRY_WAIT).await;
        }
    }
}

#[async_trait]
impl SinkAdaptor for RpcSink {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn kind(&self) -> &'static str {
        "grpc"
    }

    fn endpoint(&self) -> String {
        self.inner.endpoint()
    }

    async fn connect(&self) -> Result<()> {
        match self.inner.mode {
            RpcMode::Java => {
                tokio::spawn(self.inner.clone().info_loop());
            }
            RpcMode::Sharp => {
                if let Some(companion) = &self.companion {
                    companion.connect().await?;
                }
            }
        }
        Ok(())
    }

    async fn insert(&self, record: &Record, dtype: DataType) -> bool {
        for attempt in 1..=INSERT_ATTEMPTS {
            match self.inner.save(record, dtype).await {
                Ok(reply) => match self.inner.mode {
                    // A sharp server acknowledges by not erroring.
                    RpcMode::Sharp => {
                        tracing::info!(
                            %dtype,
                            data = %record.text(fields::UNIQUE_KEY_PLAIN),
                            uk = %record.text(fields::UNIQUE_KEY),
                            "rpc insert success"
                        );
                        return true;
                    }
                    RpcMode::Java => {
                        if reply.status_code == 200 {
                            tracing::info!(
                                %dtype,
                                data = %record.text(fields::UNIQUE_KEY_PLAIN),
                                uk = %record.text(fields::UNIQUE_KEY),
                                "rpc insert success"
                            );
                            return true;
                        }
                        tracing::error!(
                            %dtype,
                            data = %record.text(fields::UNIQUE_KEY_PLAIN),
                            server = %self.endpoint(),
                            attempt,
                            status = reply.status_code,
                            message = %reply.message,
                            "rpc insert rejected"
                        );
                    }
                },
                Err(err) => {
                    tracing::error!(
                        %dtype,
                        data = %record.text(fields::UNIQUE_KEY_PLAIN),
                        server = %self.endpoint(),
                        attempt,
                        error = %err,
                        "rpc insert failed"
                    );
                }
            }
        }
        false
    }
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_secs() as i64
}

fn build_vehicle_2k(d: &Record, extras: &Extras) -> messages::Vehicle2kRequest {
    messages::Vehicle2kRequest {
        camera_id: d.text(fields::CAMERA_ID),
        vehicle_class: d.text(fields::VEHICLE_CLASS),
        lane_no: d.int(fields::LANE_NO).unwrap_or(0),
        turn_type_cd: d.text(fields::TURN_TYPE_CD),
        turn_time: d.int(fields::TURN_TIME).unwrap_or(0),
        turn_speed: d.float(fields::TURN_SPEED).unwrap_or(0.0),
        stop_pass_time: d.int(fields::STOP_PASS_TIME).unwrap_or(0),
        stop_pass_speed: d.float(fields::STOP_PASS_SPEED).unwrap_or(0.0),
        interval_speed: d.float(fields::INTERVAL_SPEED).unwrap_or(0.0),
        first_det_time: d.int(fields::FIRST_DET_TIME).unwrap_or(0),
        observe_time: d.int(fields::OBSERVE_TIME).unwrap_or(0),
        image_path_name: d.text(fields::IMAGE_PATH_NAME),
        car_image_file_name: d.text(fields::CAR_IMAGE_FILE_NAME),
        car_id_2k: d.text(fields::CAR_ID_2K),
        unique_key: extras.unique_key.clone(),
        crt_unix_tm: extras.crt_unix_tm,
    }
}

fn build_vehicle_4k(d: &Record, extras: &Extras) -> messages::Vehicle4kRequest {
    messages::Vehicle4kRequest {
        camera_id: d.text(fields::CAMERA_ID),
        vehicle_class: d.text(fields::VEHICLE_CLASS),
        lane_no: d.int(fields::LANE_NO).unwrap_or(0),
        stop_pass_time: d.int(fields::STOP_PASS_TIME).unwrap_or(0),
        plate_num: d.text(fields::PLATE_NUM),
        plate_detected: d.text(fields::PLATE_DETECTED),
        image_path_name: d.text(fields::IMAGE_PATH_NAME),
        car_image_file_name: d.text(fields::CAR_IMAGE_FILE_NAME),
        plate_image_file_name: d.text(fields::PLATE_IMAGE_FILE_NAME),
        car_id_4k: d.text(fields::CAR_ID_4K),
        unique_key: extras.unique_key.clone(),
        crt_unix_tm: extras.crt_unix_tm,
    }
}

fn build_merge(d: &Record, extras: &Extras) -> messages::MergeRequest {
    messages::MergeRequest {
        camera_id: d.text(fields::CAMERA_ID),
        vehicle_class: d.text(fields::VEHICLE_CLASS),
        lane_no: d.text(fields::LANE_NO),
        turn_type_cd: d.text(fields::TURN_TYPE_CD),
        turn_time: d.int(fields::TURN_TIME).unwrap_or(0),
        turn_speed: d.float(fields::TURN_SPEED).unwrap_or(0.0),
        stop_pass_time: d.int(fields::STOP_PASS_TIME).unwrap_or(0),
        stop_pass_speed: d.float(fields::STOP_PASS_SPEED).unwrap_or(0.0),
        interval_speed: d.float(fields::INTERVAL_SPEED).unwrap_or(0.0),
        first_det_time: d.int(fields::FIRST_DET_TIME).unwrap_or(0),
        observe_time: d.int(fields::OBSERVE_TIME).unwrap_or(0),
        plate_num: d.text(fields::PLATE_NUM),
        plate_detected: d.text(fields::PLATE_DETECTED),
        image_path_name: d.text(fields::IMAGE_PATH_NAME),
        car_image_file_name: d.text(fields::CAR_IMAGE_FILE_NAME),
        plate_image_file_name: d.text(fields::PLATE_IMAGE_FILE_NAME),
        car_id: d.text(fields::CAR_ID),
        unique_key: extras.unique_key.clone(),
        crt_unix_tm: extras.crt_unix_tm,
    }
}

fn build_pedestrian(d: &Record, extras: &Extras) -> messages::PedestrianRequest {
    messages::PedestrianRequest {
        camera_id: d.text(fields::CAMERA_ID),
        trace_id: d.int(fields::TRACE_ID).unwrap_or(0),
        ped_det_time: d.int(fields::PED_DET_TIME).unwrap_or(0),
        ped_direction: d.text(fields::PED_DIRECTION),
        unique_key: extras.unique_key.clone(),
        crt_unix_tm: extras.crt_unix_tm,
    }
}

fn build_approach_stats(d: &Record, extras: &Extras) -> messages::ApproachStatsRequest {
    messages::ApproachStatsRequest {
        camera_id: d.text(fields::CAMERA_ID),
        hr_type_cd: d.int(fields::HR_TYPE_CD).unwrap_or(0),
        stat_start_time: d.int(fields::STAT_START_TIME).unwrap_or(0),
        stat_end_time: d.int(fields::STAT_END_TIME).unwrap_or(0),
        total_travel: d.int(fields::TOTAL_TRAVEL).unwrap_or(0),
        avg_stop_pass_speed: d.float(fields::AVG_STOP_PASS_SPEED).unwrap_or(0.0),
        avg_interval_speed: d.float(fields::AVG_INTERVAL_SPEED).unwrap_or(0.0),
        avg_density: d.int(fields::AVG_DENSITY).unwrap_or(0),
        min_density: d.int(fields::MIN_DENSITY).unwrap_or(0),
        max_density: d.int(fields::MAX_DENSITY).unwrap_or(0),
        avg_lane_occupancy: d.float(fields::AVG_LANE_OCCUPANCY).unwrap_or(0.0),
        unique_key: extras.unique_key.clone(),
        crt_unix_tm: extras.crt_unix_tm,
    }
}

fn build_turn_types_stats(d: &Record, extras: &Extras) -> messages::TurnTypesStatsRequest {
    messages::TurnTypesStatsRequest {
        camera_id: d.text(fields::CAMERA_ID),
        hr_type_cd: d.int(fields::HR_TYPE_CD).unwrap_or(0),
        turn_type_cd: d.int(fields::TURN_TYPE_CD).unwrap_or(0),
        stat_start_time: d.int(fields::STAT_START_TIME).unwrap_or(0),
        stat_end_time: d.int(fields::STAT_END_TIME).unwrap_or(0),
        mbus_travel: d.int(fields::MBUS_TRAVEL).unwrap_or(0),
        lbus_travel: d.int(fields::LBUS_TRAVEL).unwrap_or(0),
        pcar_travel: d.int(fields::PCAR_TRAVEL).unwrap_or(0),
        motor_travel: d.int(fields::MOTOR_TRAVEL).unwrap_or(0),
        mtruck_travel: d.int(fields::MTRUCK_TRAVEL).unwrap_or(0),
        ltruck_travel: d.int(fields::LTRUCK_TRAVEL).unwrap_or(0),
        avg_stop_pass_speed: d.float(fields::AVG_STOP_PASS_SPEED).unwrap_or(0.0),
        avg_interval_speed: d.float(fields::AVG_INTERVAL_SPEED).unwrap_or(0.0),
        unique_key: extras.unique_key.clone(),
        crt_unix_tm: extras.crt_unix_tm,
    }
}

fn build_lanes_stats(d: &Record, extras: &Extras) -> messages::LanesStatsRequest {
    messages::LanesStatsRequest {
        camera_id: d.text(fields::CAMERA_ID),
        hr_type_cd: d.int(fields::HR_TYPE_CD).unwrap_or(0),
        lane_no: d.int(fields::LANE_NO).unwrap_or(0),
        stat_start_time: d.int(fields::STAT_START_TIME).unwrap_or(0),
        stat_end_time: d.int(fields::STAT_END_TIME).unwrap_or(0),
        total_travel: d.int(fields::TOTAL_TRAVEL).unwrap_or(0),
        avg_stop_pass_speed: d.float(fields::AVG_STOP_PASS_SPEED).unwrap_or(0.0),
        avg_interval_speed: d.float(fields::AVG_INTERVAL_SPEED).unwrap_or(0.0),
        avg_density: d.int(fields::AVG_DENSITY).unwrap_or(0),
        min_density: d.int(fields::MIN_DENSITY).unwrap_or(0),
        max_density: d.int(fields::MAX_DENSITY).unwrap_or(0),
        lane_occupancy: d.float(fields::LANE_OCCUPANCY).unwrap_or(0.0),
        unique_key: extras.unique_key.clone(),
        crt_unix_tm: extras.crt_unix_tm,
    }
}

fn build_vehicle_types_stats(d: &Record, extras: &Extras) -> messages::VehicleTypesStatsRequest {
    messages::VehicleTypesStatsRequest {
        camera_id: d.text(fields::CAMERA_ID),
        hr_type_cd: d.int(fields::HR_TYPE_CD).unwrap_or(0),
        vehicle_class: d.text(fields::VEHICLE_CLASS),
        stat_start_time: d.int(fields::STAT_START_TIME).unwrap_or(0),
        stat_end_time: d.int(fields::STAT_END_TIME).unwrap_or(0),
        total_travel: d.int(fields::TOTAL_TRAVEL).unwrap_or(0),
        avg_stop_pass_speed: d.float(fields::AVG_STOP_PASS_SPEED).unwrap_or(0.0),
        avg_interval_speed: d.float(fields::AVG_INTERVAL_SPEED).unwrap_or(0.0),
        unique_key: extras.unique_key.clone(),
        crt_unix_tm: extras.crt_unix_tm,
    }
}

fn build_approach_queue(d: &Record, extras: &Extras) -> messages::ApproachQueueRequest {
    messages::ApproachQueueRequest {
        camera_id: d.text(fields::CAMERA_ID),
        stat_start_time: d.int(fields::STAT_START_TIME).unwrap_or(0),
        stat_end_time: d.int(fields::STAT_END_TIME).unwrap_or(0),
        remain_queue_len: d.float(fields::REMAIN_QUEUE_LEN).unwrap_or(0.0),
        max_queue_len: d.float(fields::MAX_QUEUE_LEN).unwrap_or(0.0),
        image_path_name: d.text(fields::IMAGE_PATH_NAME),
        image_file_name: d.text(fields::IMAGE_FILE_NAME),
        unique_key: extras.unique_key.clone(),
        crt_unix_tm: extras.crt_unix_tm,
    }
}

fn build_lanes_queue(d: &Record, extras: &Extras) -> messages::LanesQueueRequest {
    messages::LanesQueueRequest {
        camera_id: d.text(fields::CAMERA_ID),
        lane_no: d.int(fields::LANE_NO).unwrap_or(0),
        stat_start_time: d.int(fields::STAT_START_TIME).unwrap_or(0),
        stat_end_time: d.int(fields::STAT_END_TIME).unwrap_or(0),
        remain_queue_len: d.float(fields::REMAIN_QUEUE_LEN).unwrap_or(0.0),
        max_queue_len: d.float(fields::MAX_QUEUE_LEN).unwrap_or(0.0),
        image_path_name: d.text(fields::IMAGE_PATH_NAME),
        image_file_name: d.text(fields::IMAGE_FILE_NAME),
        unique_key: extras.unique_key.clone(),
        crt_unix_tm: extras.crt_unix_tm,
    }
}

fn build_incident_start(d: &Record, extras: &Extras) -> messages::IncidentStartRequest {
    messages::IncidentStartRequest {
        camera_id: d.text(fields::CAMERA_ID),
        trace_id: d.int(fields::TRACE_ID).unwrap_or(0),
        incident_time: d.int(fields::INCIDENT_TIME).unwrap_or(0),
        incident_type: d.text(fields::INCIDENT_TYPE),
        image_path_name: d.text(fields::IMAGE_PATH_NAME),
        image_file_name: d.text(fields::IMAGE_FILE_NAME),
        unique_key: extras.unique_key.clone(),
        crt_unix_tm: extras.crt_unix_tm,
    }
}

fn build_incident_end(d: &Record, extras: &Extras) -> messages::IncidentEndRequest {
    messages::IncidentEndRequest {
        camera_id: d.text(fields::CAMERA_ID),
        trace_id: d.int(fields::TRACE_ID).unwrap_or(0),
        incident_time: d.int(fields::INCIDENT_TIME).unwrap_or(0),
        incident_end_time: d.int(fields::INCIDENT_END_TIME).unwrap_or(0),
        unique_key: extras.unique_key.clone(),
        crt_unix_tm: extras.crt_unix_tm,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::DataType;

    #[test]
    fn vehicle_2k_request_maps_fields() {
        let mut record = Record::with_type(DataType::Vehicle2k);
        record.set(fields::CAMERA_ID, "CAM01");
        record.set(fields::VEHICLE_CLASS, "PCAR");
        record.set(fields::LANE_NO, "2");
        record.set(fields::STOP_PASS_TIME, "1700000002");
        record.set(fields::STOP_PASS_SPEED, "60");
        record.set(fields::CAR_ID_2K, "777");

        let extras = Extras {
            unique_key: "abc".to_string(),
            crt_unix_tm: 0,
        };
        let request = build_vehicle_2k(&record, &extras);
        assert_eq!(request.camera_id, "CAM01");
        assert_eq!(request.lane_no, 2);
        assert_eq!(request.stop_pass_time, 1700000002);
        assert_eq!(request.stop_pass_speed, 60.0);
        assert_eq!(request.car_id_2k, "777");
        assert_eq!(request.unique_key, "abc");
        // Absent optional fields fall back to defaults instead of failing.
        assert_eq!(request.turn_time, 0);
        assert_eq!(request.image_path_name, "NULL");
    }

    #[test]
    fn merge_request_keeps_lane_as_text() {
        let mut record = Record::with_type(DataType::Merge);
        record.set(fields::LANE_NO, 5i64);
        record.set(fields::CAR_ID, "777");
        let request = build_merge(&record, &Extras::default());
        assert_eq!(request.lane_no, "5");
        assert_eq!(request.car_id, "777");
    }
}
