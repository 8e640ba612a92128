use std::collections::VecDeque;
use std::fmt;
use std::time::Instant;

use super::task::{Task, TaskCallback, TaskChain, TaskId, TaskOutcome, TaskReport, TaskState};

/// A resolved task together with the callback that should observe it.
pub struct Resolution {
    pub report: TaskReport,
    pub callback: Option<TaskCallback>,
}

impl fmt::Debug for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolution")
            .field("report", &self.report)
            .field("has_callback", &self.callback.is_some())
            .finish()
    }
}

impl Resolution {
    pub fn notify(&self) {
        if let Some(callback) = &self.callback {
            callback(&self.report);
        }
    }
}

pub enum ReplyDisposition {
    /// Nothing in flight to attribute the line to.
    Unsolicited,
    Accumulated,
    Resolved(Resolution),
}

#[derive(Debug)]
pub enum Settled {
    TimedOut(Resolution),
    Advanced { from: TaskId, to: TaskId },
    Completed { last: TaskId },
    Abandoned { failed: TaskId, discarded: usize },
}

struct QueuedChain {
    links: Vec<Task>,
    cursor: usize,
}

impl QueuedChain {
    fn current(&self) -> &Task {
        &self.links[self.cursor]
    }

    fn current_mut(&mut self) -> &mut Task {
        &mut self.links[self.cursor]
    }

    fn remaining_after_current(&self) -> usize {
        self.links.len() - self.cursor - 1
    }
}

/// FIFO of task chains for one device.
///
/// Only the current link of the head chain may be in flight. Everything here
/// is synchronous; callers hold the device mutex around every call.
pub struct TaskQueue {
    chains: VecDeque<QueuedChain>,
    reply_capacity: usize,
}

impl TaskQueue {
    pub fn new(reply_capacity: usize) -> Self {
        Self { chains: VecDeque::new(), reply_capacity }
    }

    pub fn push(&mut self, chain: TaskChain) {
        if chain.is_empty() {
            return;
        }
        self.chains.push_back(QueuedChain { links: chain.links, cursor: 0 });
    }

    /// Number of queued chains.
    pub fn len(&self) -> usize {
        self.chains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }

    /// Tasks not yet resolved, counting every remaining chain link.
    pub fn pending_tasks(&self) -> usize {
        self.chains.iter().map(|c| c.links.len() - c.cursor).sum()
    }

    pub fn head(&self) -> Option<&Task> {
        self.chains.front().map(QueuedChain::current)
    }

    pub fn in_flight(&self) -> Option<&Task> {
        self.head().filter(|t| t.is_sent())
    }

    /// The head task when it has not been sent yet.
    pub fn next_to_send(&self) -> Option<&Task> {
        self.head().filter(|t| t.state == TaskState::Pending)
    }

    pub fn head_deadline(&self) -> Option<Instant> {
        self.head().and_then(Task::deadline)
    }

    pub fn expects_prompt(&self) -> bool {
        self.in_flight().map_or(false, |t| t.classifier.expects_prompt())
    }

    /// Mark the head task sent. Tasks that await no reply resolve at once.
    pub fn mark_sent(&mut self, now: Instant) -> Option<Resolution> {
        let task = self.chains.front_mut()?.current_mut();
        if task.state != TaskState::Pending {
            return None;
        }
        task.mark_sent(now);
        if task.classifier.awaits_reply() {
            None
        } else {
            let report = task.resolve(TaskOutcome::Success, now);
            Some(Resolution { report, callback: task.callback.clone() })
        }
    }

    /// Resolve the in-flight task as failed, e.g. after a write error.
    pub fn fail_head(&mut self, now: Instant) -> Option<Resolution> {
        let task = self.chains.front_mut()?.current_mut();
        if matches!(task.state, TaskState::Resolved(_)) {
            return None;
        }
        let report = task.resolve(TaskOutcome::Failure, now);
        Some(Resolution { report, callback: task.callback.clone() })
    }

    /// Attribute `line` to the in-flight task and re-classify its reply.
    pub fn append_reply(&mut self, line: &[u8], now: Instant) -> ReplyDisposition {
        let capacity = self.reply_capacity;
        let task = match self.chains.front_mut() {
            Some(chain) if chain.current().is_sent() => chain.current_mut(),
            _ => return ReplyDisposition::Unsolicited,
        };

        if task.reply.len() + line.len() > capacity {
            let room = capacity - task.reply.len().min(capacity);
            task.reply.extend_from_slice(&line[..room]);
            task.overflowed = true;
            log::warn!(
                "Reply to '{}' exceeded {} bytes, failing task",
                task.label,
                capacity
            );
            let report = task.resolve(TaskOutcome::Failure, now);
            return ReplyDisposition::Resolved(Resolution { report, callback: task.callback.clone() });
        }

        task.reply.extend_from_slice(line);
        match task.classifier.decide(&task.reply) {
            Some(verdict) => {
                let report = task.resolve(verdict.into(), now);
                ReplyDisposition::Resolved(Resolution { report, callback: task.callback.clone() })
            }
            None => ReplyDisposition::Accumulated,
        }
    }

    /// Expire an overdue head task, then pop or advance resolved heads until
    /// the head is pending, in flight, or the queue is empty.
    pub fn settle(&mut self, now: Instant) -> Vec<Settled> {
        let mut settled = Vec::new();
        loop {
            let Some(chain) = self.chains.front_mut() else { break };
            let task = chain.current_mut();
            match task.state {
                TaskState::Pending => break,
                TaskState::Sent { .. } => {
                    if task.deadline().map_or(false, |d| now >= d) {
                        let report = task.resolve(TaskOutcome::TimedOut, now);
                        settled.push(Settled::TimedOut(Resolution { report, callback: task.callback.clone() }));
                        continue;
                    }
                    break;
                }
                TaskState::Resolved(TaskOutcome::Success) => {
                    let from = task.id;
                    if chain.remaining_after_current() > 0 {
                        chain.cursor += 1;
                        settled.push(Settled::Advanced { from, to: chain.current().id });
                    } else {
                        self.chains.pop_front();
                        settled.push(Settled::Completed { last: from });
                    }
                }
                TaskState::Resolved(_) => {
                    let failed = task.id;
                    let discarded = chain.remaining_after_current();
                    self.chains.pop_front();
                    if discarded > 0 {
                        settled.push(Settled::Abandoned { failed, discarded });
                    }
                }
            }
        }
        settled
    }

    /// Drop everything still queued, returning how many tasks were discarded.
    pub fn clear(&mut self) -> usize {
        let count = self.pending_tasks();
        self.chains.clear();
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::task::ReplyClassifier;
    use std::time::Duration;

    fn chain(commands: &[&str]) -> TaskChain {
        let mut links = commands.iter().map(|c| Task::command(c));
        let mut chain = TaskChain::new(links.next().unwrap());
        for link in links {
            chain = chain.then(link);
        }
        chain
    }

    #[test]
    fn test_only_head_is_sendable() {
        let mut queue = TaskQueue::new(4096);
        queue.push(chain(&["AT+A"]));
        queue.push(chain(&["AT+B"]));
        let now = Instant::now();

        assert_eq!(queue.next_to_send().unwrap().label(), "AT+A");
        assert!(queue.mark_sent(now).is_none());
        assert!(queue.next_to_send().is_none(), "in-flight head blocks dispatch");
        assert!(queue.mark_sent(now).is_none());
        assert_eq!(queue.in_flight().unwrap().label(), "AT+A");
    }

    #[test]
    fn test_success_advances_chain() {
        let mut queue = TaskQueue::new(4096);
        queue.push(chain(&["AT+A", "AT+B"]));
        let now = Instant::now();
        queue.mark_sent(now);

        assert!(matches!(queue.append_reply(b"AT+A\r\n", now), ReplyDisposition::Accumulated));
        assert!(matches!(queue.append_reply(b"OK\r\n", now), ReplyDisposition::Resolved(_)));

        let settled = queue.settle(now);
        assert!(matches!(settled.as_slice(), [Settled::Advanced { .. }]));
        assert_eq!(queue.next_to_send().unwrap().label(), "AT+B");
        assert_eq!(queue.pending_tasks(), 1);
    }

    #[test]
    fn test_failure_abandons_rest_of_chain() {
        let mut queue = TaskQueue::new(4096);
        queue.push(chain(&["AT+A", "AT+B", "AT+C"]));
        queue.push(chain(&["AT+D"]));
        let now = Instant::now();
        queue.mark_sent(now);

        match queue.append_reply(b"ERROR\r\n", now) {
            ReplyDisposition::Resolved(resolution) => assert_eq!(resolution.report.outcome, TaskOutcome::Failure),
            _ => panic!("expected resolution"),
        }
        let settled = queue.settle(now);
        assert!(matches!(settled.as_slice(), [Settled::Abandoned { discarded: 2, .. }]));
        assert_eq!(queue.next_to_send().unwrap().label(), "AT+D");
    }

    #[test]
    fn test_timeout_drops_chain() {
        let mut queue = TaskQueue::new(4096);
        queue.push(TaskChain::new(Task::command("AT+A").with_timeout(Duration::from_millis(50))).then(Task::command("AT+B")));
        let sent_at = Instant::now();
        queue.mark_sent(sent_at);

        assert!(queue.settle(sent_at + Duration::from_millis(10)).is_empty());
        let settled = queue.settle(sent_at + Duration::from_millis(60));
        assert!(matches!(
            settled.as_slice(),
            [Settled::TimedOut(resolution), Settled::Abandoned { discarded: 1, .. }] if resolution.report.outcome == TaskOutcome::TimedOut
        ));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_line_without_in_flight_task_is_unsolicited() {
        let mut queue = TaskQueue::new(4096);
        assert!(matches!(queue.append_reply(b"RING\r\n", Instant::now()), ReplyDisposition::Unsolicited));
        queue.push(chain(&["AT"]));
        assert!(matches!(queue.append_reply(b"RING\r\n", Instant::now()), ReplyDisposition::Unsolicited));
    }

    #[test]
    fn test_reply_overflow_fails_task() {
        let mut queue = TaskQueue::new(8);
        queue.push(chain(&["AT"]));
        let now = Instant::now();
        queue.mark_sent(now);

        assert!(matches!(queue.append_reply(b"12345\r\n", now), ReplyDisposition::Accumulated));
        match queue.append_reply(b"OK\r\n", now) {
            ReplyDisposition::Resolved(resolution) => {
                assert!(resolution.report.overflowed);
                assert_eq!(resolution.report.outcome, TaskOutcome::Failure);
                assert_eq!(resolution.report.reply.len(), 8);
            }
            _ => panic!("expected overflow resolution"),
        }
    }

    #[test]
    fn test_ignore_classifier_resolves_on_send() {
        let mut queue = TaskQueue::new(4096);
        queue.push(TaskChain::new(Task::raw("nudge", b"\x1b".to_vec()).with_classifier(ReplyClassifier::Ignore)));
        let resolution = queue.mark_sent(Instant::now()).expect("resolved on send");
        assert_eq!(resolution.report.outcome, TaskOutcome::Success);
        assert!(matches!(queue.settle(Instant::now()).as_slice(), [Settled::Completed { .. }]));
    }
}
