use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::Result;

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of an open transport handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HandleId(pub u64);

impl HandleId {
    pub fn next() -> Self {
        HandleId(NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Invoked from the reader thread with every inbound chunk.
pub type ReadCallback = Arc<dyn Fn(HandleId, &[u8]) + Send + Sync>;

/// Byte transport underneath a modem device.
///
/// `write` returns only once the bytes have left the output queue, since the
/// scheduler measures reply latency from that point. At most one reader is
/// active per handle; enabling a new one stops the previous reader first.
#[async_trait]
pub trait Transport: Send + Sync {
    fn handle_id(&self) -> HandleId;

    fn port_name(&self) -> &str;

    async fn write(&self, data: &[u8]) -> Result<usize>;

    async fn enable_async(&self, callback: ReadCallback) -> Result<()>;

    /// Stop the reader. No-op when none is running.
    async fn disable_async(&self);

    /// False once the reader has stopped, either on request or because the
    /// underlying handle failed.
    fn is_reading(&self) -> bool;

    async fn close(&self);
}
