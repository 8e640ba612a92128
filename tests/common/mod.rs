#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use gsmlink::scheduler::{TaskEvent, TaskReport};
use gsmlink::serial::{HandleId, ReadCallback, SerialError, Transport};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// In-memory transport that answers known requests with canned bytes,
/// delivered through the read callback the way a serial reader would.
pub struct ScriptedTransport {
    id: HandleId,
    port_name: String,
    replies: Mutex<HashMap<Vec<u8>, Vec<u8>>>,
    writes: Mutex<Vec<Vec<u8>>>,
    callback: Mutex<Option<ReadCallback>>,
    fail_writes: AtomicBool,
    closed: AtomicBool,
}

impl ScriptedTransport {
    pub fn new(port_name: &str) -> Arc<Self> {
        Arc::new(Self {
            id: HandleId::next(),
            port_name: port_name.to_string(),
            replies: Mutex::new(HashMap::new()),
            writes: Mutex::new(Vec::new()),
            callback: Mutex::new(None),
            fail_writes: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    pub fn respond(&self, request: &[u8], reply: &[u8]) {
        self.replies.lock().unwrap().insert(request.to_vec(), reply.to_vec());
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Deliver bytes as if the modem sent them unprompted.
    pub fn inject(&self, bytes: &[u8]) {
        let callback = self.callback.lock().unwrap().clone();
        if let Some(callback) = callback {
            callback(self.id, bytes);
        }
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.writes.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    fn handle_id(&self) -> HandleId {
        self.id
    }

    fn port_name(&self) -> &str {
        &self.port_name
    }

    async fn write(&self, data: &[u8]) -> gsmlink::serial::Result<usize> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(SerialError::NotConnected);
        }
        self.writes.lock().unwrap().push(data.to_vec());
        let reply = self.replies.lock().unwrap().get(data).cloned();
        if let Some(reply) = reply {
            self.inject(&reply);
        }
        Ok(data.len())
    }

    async fn enable_async(&self, callback: ReadCallback) -> gsmlink::serial::Result<()> {
        *self.callback.lock().unwrap() = Some(callback);
        Ok(())
    }

    async fn disable_async(&self) {
        self.callback.lock().unwrap().take();
    }

    fn is_reading(&self) -> bool {
        self.callback.lock().unwrap().is_some()
    }

    async fn close(&self) {
        self.callback.lock().unwrap().take();
        self.closed.store(true, Ordering::SeqCst);
    }
}

pub async fn next_event(events: &mut broadcast::Receiver<TaskEvent>) -> TaskEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for a scheduler event")
        .expect("event channel closed")
}

pub async fn next_resolved(events: &mut broadcast::Receiver<TaskEvent>) -> TaskReport {
    loop {
        if let TaskEvent::Resolved(report) = next_event(events).await {
            return report;
        }
    }
}
