pub mod columnar;
pub mod kv;
pub mod local;
pub mod rpc;

use crate::record::{DataType, Record};
use async_trait::async_trait;

/// Uniform adaptor contract over every downstream sink.
///
/// `insert` reports success as a bool rather than an error: the sender's
/// delivery policy treats each sink independently and records the outcome in
/// the record's sent-to map, so partial failure is the normal case.
#[async_trait]
pub trait SinkAdaptor: Send + Sync {
    /// Configured sink name, the key used in `sent_to`.
    fn name(&self) -> &str;

    /// Sink family, for log lines.
    fn kind(&self) -> &'static str;

    /// Human-readable endpoint, for log lines.
    fn endpoint(&self) -> String;

    async fn connect(&self) -> eyre::Result<()>;

    async fn insert(&self, record: &Record, dtype: DataType) -> bool;
}
