//! Events and metrics published by a device scheduler
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::task::{TaskId, TaskOutcome, TaskReport};

/// Default maximum size of one task's accumulated reply.
pub const DEFAULT_REPLY_CAPACITY: usize = 4096;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TaskEvent {
    Sent { id: TaskId, label: String, request: Vec<u8> },
    Resolved(TaskReport),
    /// Links left in a chain whose current link did not succeed.
    ChainAbandoned { failed: TaskId, discarded: usize },
    /// A line that arrived while nothing was in flight.
    Unsolicited { line: String },
    WriteFailed { id: TaskId, message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MetricsSnapshot {
    pub lines_read: u64,
    pub unsolicited_lines: u64,
    pub tasks_sent: u64,
    pub tasks_succeeded: u64,
    pub tasks_failed: u64,
    pub tasks_timed_out: u64,
    pub chains_abandoned: u64,
    pub reply_overflows: u64,
    pub write_errors: u64,
    pub last_error: Option<String>,
    pub command_last_latency_ms: Option<u64>,
    pub command_min_latency_ms: Option<u64>,
    pub command_max_latency_ms: Option<u64>,
    pub command_avg_latency_ms: Option<f64>,
    pub command_latency_samples: u64,
}

impl MetricsSnapshot {
    pub(crate) fn record_resolution(&mut self, report: &TaskReport) {
        match report.outcome {
            TaskOutcome::Success => self.tasks_succeeded += 1,
            TaskOutcome::Failure => self.tasks_failed += 1,
            TaskOutcome::TimedOut => self.tasks_timed_out += 1,
        }
        if report.overflowed {
            self.reply_overflows += 1;
        }
        if report.outcome != TaskOutcome::TimedOut {
            if let Some(latency) = report.latency {
                self.record_latency(latency);
            }
        }
    }

    fn record_latency(&mut self, latency: Duration) {
        let latency_ms = latency.as_millis() as u64;
        self.command_last_latency_ms = Some(latency_ms);
        self.command_min_latency_ms = Some(self.command_min_latency_ms.map_or(latency_ms, |m| m.min(latency_ms)));
        self.command_max_latency_ms = Some(self.command_max_latency_ms.map_or(latency_ms, |m| m.max(latency_ms)));
        self.command_latency_samples += 1;
        let samples = self.command_latency_samples as f64;
        self.command_avg_latency_ms = Some(match self.command_avg_latency_ms {
            Some(avg) if self.command_latency_samples > 1 => (avg * (samples - 1.0) + latency_ms as f64) / samples,
            _ => latency_ms as f64,
        });
    }
}
