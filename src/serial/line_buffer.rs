//! Per-device accumulator that turns the raw inbound stream into lines.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use tokio::sync::Notify;

pub const DEFAULT_LINE_BUFFER_CAPACITY: usize = 8192;

fn is_terminator(byte: u8) -> bool {
    byte == b'\r' || byte == b'\n'
}

fn is_utf8_continuation(byte: u8) -> bool {
    byte & 0xC0 == 0x80
}

/// Thread-safe byte accumulator fed by the transport reader.
///
/// Every push wakes one waiter on [`LineBuffer::notified`], so a consumer can
/// sleep until data arrives instead of polling.
pub struct LineBuffer {
    content: Mutex<Vec<u8>>,
    capacity: usize,
    trimmed_bytes: AtomicU64,
    notify: Notify,
}

impl LineBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            content: Mutex::new(Vec::with_capacity(capacity.min(DEFAULT_LINE_BUFFER_CAPACITY))),
            capacity: capacity.max(1),
            trimmed_bytes: AtomicU64::new(0),
            notify: Notify::new(),
        }
    }

    // A panic while holding the lock cannot leave the Vec half-written.
    fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
        self.content.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append bytes at the tail. When the bound is exceeded the oldest bytes
    /// are dropped and counted in [`LineBuffer::trimmed_bytes`].
    pub fn push(&self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        {
            let mut content = self.lock();
            content.extend_from_slice(bytes);
            if content.len() > self.capacity {
                let excess = content.len() - self.capacity;
                content.drain(..excess);
                self.trimmed_bytes.fetch_add(excess as u64, Ordering::Relaxed);
                log::warn!("Line buffer over capacity, dropped {} oldest bytes", excess);
            }
        }
        self.notify.notify_one();
    }

    /// Remove and return up to `n` bytes from the head. The cut is moved back
    /// so it never lands inside a UTF-8 sequence.
    pub fn pop_fixed(&self, n: usize) -> Vec<u8> {
        let mut content = self.lock();
        let end = Self::utf8_boundary(&content, n);
        content.drain(..end).collect()
    }

    /// Remove and return the first line: leading bytes plus the whole run of
    /// CR/LF that follows them. Empty when no terminator has arrived yet.
    pub fn pop_line(&self) -> Vec<u8> {
        let mut content = self.lock();
        match Self::line_end(&content) {
            Some(end) => content.drain(..end).collect(),
            None => Vec::new(),
        }
    }

    /// Copy up to `n` bytes from the head without consuming them.
    pub fn peek(&self, n: usize) -> Vec<u8> {
        let content = self.lock();
        let end = n.min(content.len());
        content[..end].to_vec()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn trimmed_bytes(&self) -> u64 {
        self.trimmed_bytes.load(Ordering::Relaxed)
    }

    /// Resolves after the next push (or immediately if one happened since the
    /// last wait).
    pub async fn notified(&self) {
        self.notify.notified().await
    }

    fn line_end(content: &[u8]) -> Option<usize> {
        let mut in_break = false;
        for (idx, &byte) in content.iter().enumerate() {
            if is_terminator(byte) {
                in_break = true;
            } else if in_break {
                return Some(idx);
            }
        }
        if in_break {
            Some(content.len())
        } else {
            None
        }
    }

    fn utf8_boundary(content: &[u8], n: usize) -> usize {
        let end = n.min(content.len());
        if end == content.len() {
            return end;
        }
        let mut cut = end;
        while cut > 0 && is_utf8_continuation(content[cut]) {
            cut -= 1;
        }
        // Nothing but continuation bytes: not text, cut where asked.
        if cut == 0 {
            end
        } else {
            cut
        }
    }
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_LINE_BUFFER_CAPACITY)
    }
}
