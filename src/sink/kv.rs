use crate::fields;
use crate::record::{DataType, Record};
use crate::sink::SinkAdaptor;
use async_trait::async_trait;
use eyre::{eyre, Result};
use futures::StreamExt;
use std::time::Duration;
use tokio::sync::Mutex;

/// How often a broken subscription is retried.
const RECONNECT_WAIT: Duration = Duration::from_secs(10);

/// Publishing sink over the in-memory key-value bus.
///
/// Presence records publish their bare state string; every other record
/// publishes the JSON serialization of the full map.
pub struct KvSink {
    name: String,
    host: String,
    port: u16,
    channel: String,
    client: redis::Client,
    conn: Mutex<Option<redis::aio::MultiplexedConnection>>,
}

impl KvSink {
    pub fn new(name: &str, host: &str, port: u16, channel: &str) -> Result<KvSink> {
        let client = redis::Client::open(format!("redis://{host}:{port}/"))
            .map_err(|e| eyre!("bad kv endpoint {host}:{port}: {e}"))?;
        Ok(KvSink {
            name: name.to_string(),
            host: host.to_string(),
            port,
            channel: channel.to_string(),
            client,
            conn: Mutex::new(None),
        })
    }

    /// Probes the current connection with a server-time command and
    /// reconnects when the probe fails.
    async fn ensure_connection(&self) -> Result<redis::aio::MultiplexedConnection> {
        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.as_mut() {
            let probe: redis::RedisResult<Vec<String>> =
                redis::cmd("TIME").query_async(conn).await;
            if probe.is_ok() {
                return Ok(conn.clone());
            }
            tracing::error!(server = %self.endpoint(), "kv connection lost; reconnecting");
            *guard = None;
        }
        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| eyre!("kv connect failed: {e}"))?;
        *guard = Some(conn.clone());
        tracing::info!(server = %self.endpoint(), "kv connection established");
        Ok(conn)
    }

    fn payload_for(record: &Record, dtype: DataType) -> Result<String> {
        if dtype.is_presence() {
            Ok(record.text(fields::PRESENCE_STATE))
        } else {
            record.to_json_string()
        }
    }
}

#[async_trait]
impl SinkAdaptor for KvSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "redis"
    }

    fn endpoint(&self) -> String {
        format!("{}:{}|{}", self.host, self.port, self.channel)
    }

    async fn connect(&self) -> Result<()> {
        self.ensure_connection().await.map(|_| ())
    }

    async fn insert(&self, record: &Record, dtype: DataType) -> bool {
        let payload = match Self::payload_for(record, dtype) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::error!(%dtype, error = %err, "kv payload build failed");
                return false;
            }
        };

        let mut conn = match self.ensure_connection().await {
            Ok(conn) => conn,
            Err(err) => {
                tracing::error!(server = %self.endpoint(), error = %err, "kv unreachable");
                return false;
            }
        };

        let published: redis::RedisResult<i64> = redis::cmd("PUBLISH")
            .arg(&self.channel)
            .arg(&payload)
            .query_async(&mut conn)
            .await;
        match published {
            Ok(_) => {
                tracing::info!(
                    %dtype,
                    data = %record.text(fields::UNIQUE_KEY_PLAIN),
                    server = %self.endpoint(),
                    "kv publish success"
                );
                true
            }
            Err(err) => {
                tracing::error!(
                    %dtype,
                    data = %record.text(fields::UNIQUE_KEY_PLAIN),
                    error = %err,
                    "kv publish failed"
                );
                false
            }
        }
    }
}

/// Subscriber side of the bus, used by the receivers. `next()` blocks on the
/// following message and quietly resubscribes after connection loss.
pub struct BusSubscriber {
    client: redis::Client,
    channel: String,
    endpoint: String,
    pubsub: Option<redis::aio::PubSub>,
}

impl BusSubscriber {
    pub fn new(host: &str, port: u16, channel: &str) -> Result<BusSubscriber> {
        let client = redis::Client::open(format!("redis://{host}:{port}/"))
            .map_err(|e| eyre!("bad bus endpoint {host}:{port}: {e}"))?;
        Ok(BusSubscriber {
            client,
            channel: channel.to_string(),
            endpoint: format!("{host}:{port}"),
            pubsub: None,
        })
    }

    /// Returns the next message payload. On any connection problem the
    /// subscription is dropped, the reconnect wait elapses, and None is
    /// returned so the caller can loop.
    pub async fn next(&mut self) -> Option<String> {
        if self.pubsub.is_none() {
            match self.subscribe().await {
                Ok(pubsub) => self.pubsub = Some(pubsub),
                Err(err) => {
                    tracing::error!(
                        server = %self.endpoint,
                        channel = %self.channel,
                        error = %err,
                        "bus subscribe failed; retrying"
                    );
                    tokio::time::sleep(RECONNECT_WAIT).await;
                    return None;
                }
            }
        }

        let message = {
            let pubsub = self.pubsub.as_mut()?;
            pubsub.on_message().next().await
        };
        match message {
            Some(msg) => match msg.get_payload::<String>() {
                Ok(payload) => Some(payload),
                Err(err) => {
                    tracing::error!(channel = %self.channel, error = %err, "bus payload unreadable");
                    None
                }
            },
            None => {
                tracing::error!(
                    server = %self.endpoint,
                    channel = %self.channel,
                    "bus subscription closed; reconnecting"
                );
                self.pubsub = None;
                tokio::time::sleep(RECONNECT_WAIT).await;
                None
            }
        }
    }

    async fn subscribe(&self) -> Result<redis::aio::PubSub> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| eyre!("bus connect failed: {e}"))?;
        pubsub
            .subscribe(&self.channel)
            .await
            .map_err(|e| eyre!("bus subscribe failed: {e}"))?;
        tracing::info!(server = %self.endpoint, channel = %self.channel, "bus subscribed");
        Ok(pubsub)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presence_publishes_bare_state() {
        let mut record = Record::with_type(DataType::PresenceVehicle);
        record.set(fields::PRESENCE_STATE, "1");
        record.set(fields::UNIQUE_KEY_PLAIN, "1");

        let payload = KvSink::payload_for(&record, DataType::PresenceVehicle).unwrap();
        assert_eq!(payload, "1");
    }

    #[test]
    fn other_types_publish_full_json_map() {
        let mut record = Record::with_type(DataType::Ped2k);
        record.set(fields::TRACE_ID, "9");

        let payload = KvSink::payload_for(&record, DataType::Ped2k).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(parsed["trace_id"], "9");
        assert_eq!(parsed["data_type"], "ped_2k");
    }
}
