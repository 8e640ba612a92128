//! Per-device dispatcher and reply consumer.
//!
//! The dispatcher writes the head task once the device is idle and expires it
//! when its timeout passes. The reply consumer drains complete lines from the
//! line buffer and attributes them to the in-flight task. Both share the
//! device mutex around the [`TaskQueue`].
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{broadcast, watch, Mutex, Notify};
use tokio::task::JoinHandle;

use super::queue::{ReplyDisposition, Resolution, Settled, TaskQueue};
use super::task::{TaskChain, TaskId};
use super::types::{MetricsSnapshot, TaskEvent};
use crate::serial::{HandleId, LineBuffer, Transport};

const EVENT_CAPACITY: usize = 256;
/// Longest unterminated prompt accepted from the buffer.
const PROMPT_PEEK_LEN: usize = 8;

fn is_bare_prompt(bytes: &[u8]) -> bool {
    let mut visible = bytes.iter().filter(|b| !b.is_ascii_whitespace());
    visible.next() == Some(&b'>') && visible.next().is_none()
}

pub struct Scheduler {
    handle_id: HandleId,
    transport: Arc<dyn Transport>,
    buffer: Arc<LineBuffer>,
    queue: Mutex<TaskQueue>,
    wake: Notify,
    events_tx: broadcast::Sender<TaskEvent>,
    metrics_tx: watch::Sender<MetricsSnapshot>,
}

impl Scheduler {
    pub fn new(transport: Arc<dyn Transport>, buffer: Arc<LineBuffer>, reply_capacity: usize) -> Self {
        let (events_tx, _events_rx) = broadcast::channel(EVENT_CAPACITY);
        let (metrics_tx, _metrics_rx) = watch::channel(MetricsSnapshot::default());
        Self {
            handle_id: transport.handle_id(),
            transport,
            buffer,
            queue: Mutex::new(TaskQueue::new(reply_capacity)),
            wake: Notify::new(),
            events_tx,
            metrics_tx,
        }
    }

    /// Append a chain to the device queue. Never blocks on in-flight work.
    pub async fn enqueue(&self, chain: TaskChain) -> Option<TaskId> {
        let head = chain.head_id();
        {
            let mut queue = self.queue.lock().await;
            queue.push(chain);
        }
        self.wake.notify_one();
        head
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<TaskEvent> {
        self.events_tx.subscribe()
    }

    pub fn metrics_receiver(&self) -> watch::Receiver<MetricsSnapshot> {
        self.metrics_tx.subscribe()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics_tx.borrow().clone()
    }

    pub async fn pending_tasks(&self) -> usize {
        self.queue.lock().await.pending_tasks()
    }

    /// Start the dispatcher and reply-consumer tasks. Both exit once
    /// `shutdown` flips to `true` or its sender is dropped.
    pub fn spawn(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        vec![
            tokio::spawn(self.clone().run_dispatcher(shutdown.clone())),
            tokio::spawn(self.clone().run_reply_consumer(shutdown)),
        ]
    }

    /// Drop queued work after the workers have stopped.
    pub async fn discard_pending(&self) -> usize {
        let discarded = self.queue.lock().await.clear();
        if discarded > 0 {
            log::info!("Discarded {} queued task(s) on {}", discarded, self.handle_id);
        }
        discarded
    }

    async fn run_dispatcher(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        log::debug!("Dispatcher started for {}", self.handle_id);
        loop {
            if *shutdown.borrow() {
                break;
            }
            let deadline = self.dispatch_once().await;
            let expiry = async {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at.into()).await,
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = self.wake.notified() => {}
                _ = expiry => {}
            }
        }
        log::debug!("Dispatcher stopped for {}", self.handle_id);
    }

    /// Settle the queue and send whatever became eligible. Returns the
    /// deadline of the in-flight task, if any.
    async fn dispatch_once(&self) -> Option<Instant> {
        let mut resolved = Vec::new();
        let mut queue = self.queue.lock().await;
        self.apply_settled(queue.settle(Instant::now()), &mut resolved);

        while let Some(task) = queue.next_to_send() {
            let id = task.id();
            let label = task.label().to_string();
            let request = task.request().to_vec();

            match self.transport.write(&request).await {
                Ok(_) => {
                    log::debug!("{} -> {}", self.handle_id, label);
                    self.metrics_tx.send_modify(|m| m.tasks_sent += 1);
                    self.publish(TaskEvent::Sent { id, label, request });
                    if let Some(resolution) = queue.mark_sent(Instant::now()) {
                        resolved.push(self.finish(resolution));
                    }
                }
                Err(e) => {
                    let message = e.to_string();
                    log::error!("Write of '{}' on {} failed: {}", label, self.handle_id, message);
                    self.metrics_tx.send_modify(|m| {
                        m.write_errors += 1;
                        m.last_error = Some(message.clone());
                    });
                    self.publish(TaskEvent::WriteFailed { id, message });
                    if let Some(resolution) = queue.fail_head(Instant::now()) {
                        resolved.push(self.finish(resolution));
                    }
                }
            }
            self.apply_settled(queue.settle(Instant::now()), &mut resolved);
        }

        let deadline = queue.head_deadline();
        drop(queue);
        for resolution in resolved {
            resolution.notify();
        }
        deadline
    }

    async fn run_reply_consumer(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        log::debug!("Reply consumer started for {}", self.handle_id);
        loop {
            if *shutdown.borrow() {
                break;
            }
            self.drain_lines().await;
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = self.buffer.notified() => {}
            }
        }
        log::debug!("Reply consumer stopped for {}", self.handle_id);
    }

    async fn drain_lines(&self) {
        loop {
            let line = self.buffer.pop_line();
            if !line.is_empty() {
                self.handle_line(&line).await;
            } else if !self.take_bare_prompt().await {
                break;
            }
        }
    }

    async fn handle_line(&self, line: &[u8]) {
        let mut queue = self.queue.lock().await;
        let resolution = self.accept_line(&mut queue, line);
        drop(queue);
        if let Some(resolution) = resolution {
            resolution.notify();
            self.wake.notify_one();
        }
    }

    /// Modems answer the SMS command with "> " and no line terminator. Accept
    /// it as a line, but only while a prompt is actually awaited.
    async fn take_bare_prompt(&self) -> bool {
        let mut queue = self.queue.lock().await;
        if !queue.expects_prompt() {
            return false;
        }
        let pending = self.buffer.peek(PROMPT_PEEK_LEN);
        if !is_bare_prompt(&pending) {
            return false;
        }
        let prompt = self.buffer.pop_fixed(pending.len());
        let resolution = self.accept_line(&mut queue, &prompt);
        drop(queue);
        if let Some(resolution) = resolution {
            resolution.notify();
            self.wake.notify_one();
        }
        true
    }

    fn accept_line(&self, queue: &mut TaskQueue, line: &[u8]) -> Option<Resolution> {
        self.metrics_tx.send_modify(|m| m.lines_read += 1);
        match queue.append_reply(line, Instant::now()) {
            ReplyDisposition::Unsolicited => {
                self.metrics_tx.send_modify(|m| m.unsolicited_lines += 1);
                let text = String::from_utf8_lossy(line).trim().to_string();
                if !text.is_empty() {
                    log::debug!("Unsolicited line on {}: {}", self.handle_id, text);
                    self.publish(TaskEvent::Unsolicited { line: text });
                }
                None
            }
            ReplyDisposition::Accumulated => None,
            ReplyDisposition::Resolved(resolution) => Some(self.finish(resolution)),
        }
    }

    fn finish(&self, resolution: Resolution) -> Resolution {
        let report = &resolution.report;
        log::debug!(
            "{} <- '{}' resolved {:?} after {:?}",
            self.handle_id,
            report.label,
            report.outcome,
            report.latency
        );
        self.metrics_tx.send_modify(|m| m.record_resolution(report));
        self.publish(TaskEvent::Resolved(report.clone()));
        resolution
    }

    /// Publish settled steps. Timed-out tasks are pushed onto `resolved` so
    /// their callbacks run once the device mutex is released.
    fn apply_settled(&self, settled: Vec<Settled>, resolved: &mut Vec<Resolution>) {
        for step in settled {
            match step {
                Settled::TimedOut(resolution) => {
                    let report = &resolution.report;
                    if report.reply.is_empty() {
                        log::warn!("Command '{}' timed out on {}; no reply received", report.label, self.handle_id);
                    } else {
                        log::warn!(
                            "Command '{}' timed out on {}; partial reply: {:?}",
                            report.label,
                            self.handle_id,
                            String::from_utf8_lossy(&report.reply)
                        );
                    }
                    self.metrics_tx.send_modify(|m| m.record_resolution(report));
                    self.publish(TaskEvent::Resolved(report.clone()));
                    resolved.push(resolution);
                }
                Settled::Advanced { from, to } => {
                    log::debug!("Chain on {} advanced {} -> {}", self.handle_id, from, to);
                }
                Settled::Completed { last } => {
                    log::debug!("Chain ending in {} completed on {}", last, self.handle_id);
                }
                Settled::Abandoned { failed, discarded } => {
                    log::info!(
                        "Chain abandoned on {} after {} failed; {} link(s) not sent",
                        self.handle_id,
                        failed,
                        discarded
                    );
                    self.metrics_tx.send_modify(|m| m.chains_abandoned += 1);
                    self.publish(TaskEvent::ChainAbandoned { failed, discarded });
                }
            }
        }
    }

    fn publish(&self, event: TaskEvent) {
        // No subscribers is fine.
        let _ = self.events_tx.send(event);
    }
}
