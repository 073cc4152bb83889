use crate::fields;
use crate::record::{DataType, Record};
use crate::sink::SinkAdaptor;
use crate::site::Site;
use async_trait::async_trait;
use eyre::{eyre, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

const CONNECT_RETRY_WAIT: Duration = Duration::from_secs(10);
const INSERT_ATTEMPTS: usize = 3;
const INSERT_RETRY_PAUSE: Duration = Duration::from_millis(100);

const CAMERA_INFO_TABLE: &str = "tb_camera_info";
const LANE_INFO_TABLE: &str = "tb_lane_info";

fn table_for(dtype: DataType) -> Option<&'static str> {
    let table = match dtype {
        DataType::Vehicle2k => "tb_vehicle_2k",
        DataType::Vehicle4k | DataType::VehicleRaw4k => "tb_vehicle_4k",
        DataType::Merge => "tb_vehicle_merge",
        DataType::Ped2k => "tb_pedestrian",
        DataType::ApproachStats => "tb_stats_approach",
        DataType::TurnTypesStats => "tb_stats_turn_type",
        DataType::LanesStats => "tb_stats_lane",
        DataType::VehicleTypesStats => "tb_stats_vehicle_type",
        DataType::ApproachQueue => "tb_queue_approach",
        DataType::LanesQueue => "tb_queue_lane",
        DataType::IncidentStart | DataType::IncidentEnd => "tb_incident",
        _ => return None,
    };
    Some(table)
}

fn all_tables() -> Vec<&'static str> {
    vec![
        "tb_vehicle_2k",
        "tb_vehicle_4k",
        "tb_vehicle_merge",
        "tb_pedestrian",
        "tb_stats_approach",
        "tb_stats_turn_type",
        "tb_stats_lane",
        "tb_stats_vehicle_type",
        "tb_queue_approach",
        "tb_queue_lane",
        "tb_incident",
    ]
}

struct Inner {
    name: String,
    host: String,
    port: u16,
    client: reqwest::Client,
    connected: AtomicBool,
    columns: RwLock<HashMap<String, Vec<String>>>,
    site: Site,
}

/// Columnar database sink over its REST gateway.
///
/// A background task retries connect + schema discovery every 10 seconds;
/// once the catalog is known it also resolves this edge's camera id (keyed
/// by the host's primary IPv4) and the 4K lane offset.
pub struct ColumnarSink {
    inner: Arc<Inner>,
}

impl ColumnarSink {
    pub fn new(name: &str, host: &str, port: u16, site: Site) -> Result<ColumnarSink> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(500))
            .timeout(Duration::from_millis(500))
            .build()
            .map_err(|e| eyre!("columnar client build failed: {e}"))?;
        Ok(ColumnarSink {
            inner: Arc::new(Inner {
                name: name.to_string(),
                host: host.to_string(),
                port,
                client,
                connected: AtomicBool::new(false),
                columns: RwLock::new(HashMap::new()),
                site,
            }),
        })
    }
}

impl Inner {
    fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    async fn call_procedure(&self, procedure: &str, parameter: &str) -> Result<serde_json::Value> {
        let url = format!("http://{}:{}/api/1.0/", self.host, self.port);
        let response = self
            .client
            .get(&url)
            .query(&[("Procedure", procedure), ("Parameters", parameter)])
            .send()
            .await
            .map_err(|e| eyre!("columnar request failed: {e}"))?
            .error_for_status()
            .map_err(|e| eyre!("columnar http error: {e}"))?;
        response
            .json()
            .await
            .map_err(|e| eyre!("columnar reply unreadable: {e}"))
    }

    async fn execute(&self, sql: &str) -> Result<serde_json::Value> {
        let reply = self
            .call_procedure("@AdHoc", &format!("[\"{sql}\"]"))
            .await?;
        if reply.get("status").and_then(|s| s.as_i64()) != Some(1) {
            return Err(eyre!("columnar query rejected: {reply}"));
        }
        Ok(reply)
    }

    async fn select_rows(&self, sql: &str) -> Result<Vec<serde_json::Value>> {
        let reply = self.execute(sql).await?;
        Ok(reply
            .pointer("/results/0/data")
            .and_then(|d| d.as_array())
            .cloned()
            .unwrap_or_default())
    }

    /// System-catalog column discovery: `table -> [columns]`, lowercased.
    async fn fetch_columns(&self) -> Result<HashMap<String, Vec<String>>> {
        let catalog = self.call_procedure("@SystemCatalog", "[\"COLUMNS\"]").await?;
        let rows = catalog
            .pointer("/results/0/data")
            .and_then(|d| d.as_array())
            .cloned()
            .unwrap_or_default();

        let known: HashMap<String, &'static str> = all_tables()
            .into_iter()
            .map(|t| (t.to_uppercase(), t))
            .collect();
        let mut map: HashMap<String, Vec<String>> =
            all_tables().into_iter().map(|t| (t.to_string(), Vec::new())).collect();

        // Catalog rows are [schema, catalog, TABLE_NAME, COLUMN_NAME, ...],
        // with table names stored uppercase.
        for row in rows {
            let Some(cells) = row.as_array() else {
                continue;
            };
            let table = cells.get(2).and_then(|v| v.as_str()).unwrap_or_default();
            let column = cells.get(3).and_then(|v| v.as_str()).unwrap_or_default();
            if let Some(original) = known.get(table) {
                if let Some(columns) = map.get_mut(*original) {
                    columns.push(column.to_lowercase());
                }
            }
        }
        Ok(map)
    }

    async fn fetch_camera_id(&self) -> Result<Option<String>> {
        let ipv4 = local_ipv4()?;
        let rows = self
            .select_rows(&format!(
                "SELECT camera_id FROM {CAMERA_INFO_TABLE} WHERE edge_ip = '{ipv4}';"
            ))
            .await?;
        Ok(rows
            .first()
            .and_then(|row| row.as_array())
            .and_then(|cells| cells.first())
            .and_then(|cell| cell.as_str())
            .map(str::to_string))
    }

    /// Smallest 4K-capable lane minus one, floored at zero.
    async fn fetch_lane_offset(&self, camera_id: &str) -> Result<i64> {
        let rows = self
            .select_rows(&format!(
                "SELECT lane_no FROM {LANE_INFO_TABLE} WHERE camera_id = '{camera_id}' \
                 AND plate_4k_yn = 'Y' ORDER BY lane_no ASC LIMIT 1;"
            ))
            .await?;
        let lane = rows
            .first()
            .and_then(|row| row.as_array())
            .and_then(|cells| cells.first())
            .and_then(|cell| cell.as_i64())
            .unwrap_or(0);
        Ok((lane - 1).max(0))
    }

    async fn discovery_loop(self: Arc<Self>) {
        loop {
            if !self.connected.load(Ordering::SeqCst) {
                match self.fetch_columns().await {
                    Ok(map) => {
                        if let Ok(mut columns) = self.columns.write() {
                            *columns = map;
                        }
                        self.connected.store(true, Ordering::SeqCst);
                        tracing::info!(server = %self.endpoint(), "columnar schema discovered");
                    }
                    Err(err) => {
                        tracing::error!(
                            server = %self.endpoint(),
                            error = %err,
                            "columnar connect failed; retrying every 10 seconds"
                        );
                    }
                }
            }

            if self.connected.load(Ordering::SeqCst) && self.site.camera_id().is_none() {
                match self.fetch_camera_id().await {
                    Ok(Some(camera_id)) => {
                        self.site.set_camera_id(&camera_id);
                        tracing::info!(camera_id = %camera_id, "columnar camera id resolved");
                    }
                    Ok(None) => {
                        tracing::error!(
                            server = %self.endpoint(),
                            "no camera id registered for this edge's IP"
                        );
                    }
                    Err(err) => {
                        tracing::error!(
                            server = %self.endpoint(),
                            error = %err,
                            "camera id fetch failed; retrying every 10 seconds"
                        );
                    }
                }
            }

            if self.site.lane_offset().is_none() {
                if let Some(camera_id) = self.site.camera_id() {
                    match self.fetch_lane_offset(&camera_id).await {
                        Ok(offset) => {
                            self.site.set_lane_offset(offset);
                            tracing::info!(lane_offset = offset, "columnar lane offset resolved");
                        }
                        Err(err) => {
                            tracing::error!(
                                server = %self.endpoint(),
                                error = %err,
                                "lane info fetch failed; retrying every 10 seconds"
                            );
                        }
                    }
                }
            }

            if self.connected.load(Ordering::SeqCst) && self.site.camera_id().is_some() {
                return;
            }
            tokio::time::sleep(CONNECT_RETRY_WAIT).await;
        }
    }
}

/// Column-positional statement with single-quoted values; absent record
/// keys become SQL NULL.
fn build_insert(table: &str, columns: &[String], record: &Record, dtype: DataType) -> String {
    let command = if matches!(dtype, DataType::Merge | DataType::IncidentEnd) {
        "UPSERT"
    } else {
        "INSERT"
    };
    let column_list = columns.join(", ");
    let values: Vec<String> = columns
        .iter()
        .map(|column| {
            if record.contains(column) {
                format!("'{}'", record.text(column).replace('\'', "''"))
            } else {
                "NULL".to_string()
            }
        })
        .collect();
    format!(
        "{command} INTO {table} ({column_list}) VALUES ({});",
        values.join(", ")
    )
}

#[async_trait]
impl SinkAdaptor for ColumnarSink {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn kind(&self) -> &'static str {
        "volt"
    }

    fn endpoint(&self) -> String {
        self.inner.endpoint()
    }

    async fn connect(&self) -> Result<()> {
        let inner = self.inner.clone();
        tokio::spawn(inner.discovery_loop());
        Ok(())
    }

    async fn insert(&self, record: &Record, dtype: DataType) -> bool {
        if !self.inner.connected.load(Ordering::SeqCst) {
            return false;
        }
        let Some(table) = table_for(dtype) else {
            tracing::error!(%dtype, "no columnar table for data type");
            return false;
        };
        let columns = match self.inner.columns.read() {
            Ok(columns) => columns.get(table).cloned().unwrap_or_default(),
            Err(_) => return false,
        };
        if columns.is_empty() {
            tracing::error!(table, "columnar schema missing for table");
            return false;
        }

        let query = build_insert(table, &columns, record, dtype);

        for attempt in 1..=INSERT_ATTEMPTS {
            match self.inner.execute(&query).await {
                Ok(_) => {
                    tracing::info!(
                        %dtype,
                        data = %record.text(fields::UNIQUE_KEY_PLAIN),
                        server = %self.endpoint(),
                        "columnar insert success"
                    );
                    return true;
                }
                Err(err) => {
                    tracing::error!(
                        %dtype,
                        data = %record.text(fields::UNIQUE_KEY_PLAIN),
                        server = %self.endpoint(),
                        attempt,
                        error = %err,
                        "columnar insert failed"
                    );
                }
            }
            tokio::time::sleep(INSERT_RETRY_PAUSE).await;
        }
        false
    }
}

fn local_ipv4() -> Result<String> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0")
        .map_err(|e| eyre!("local address probe bind failed: {e}"))?;
    socket
        .connect("8.8.8.8:80")
        .map_err(|e| eyre!("local address probe connect failed: {e}"))?;
    Ok(socket
        .local_addr()
        .map_err(|e| eyre!("local address probe failed: {e}"))?
        .ip()
        .to_string())
}
