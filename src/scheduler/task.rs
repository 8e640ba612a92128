use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRLF: &[u8] = b"\r\n";
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_millis(2000);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        TaskId(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    Success,
    Failure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskOutcome {
    Success,
    Failure,
    TimedOut,
}

impl From<Verdict> for TaskOutcome {
    fn from(verdict: Verdict) -> Self {
        match verdict {
            Verdict::Success => TaskOutcome::Success,
            Verdict::Failure => TaskOutcome::Failure,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Sent { at: Instant },
    Resolved(TaskOutcome),
}

fn contains_ignore_case(haystack: &[u8], needle: &[u8]) -> bool {
    haystack
        .windows(needle.len())
        .any(|window| window.eq_ignore_ascii_case(needle))
}

/// Decides when an accumulated reply is final and whether it succeeded.
///
/// Classification always runs over the whole reply received so far.
#[derive(Debug, Clone, Copy)]
pub enum ReplyClassifier {
    /// Success once "OK" appears (any case), failure once "ERROR" does.
    Ok,
    /// Success once the `>` prompt appears, failure once "ERROR" does.
    Prompt,
    /// No reply is awaited: resolves Success as soon as the write completes.
    Ignore,
    /// `None` keeps waiting, `Some` is final.
    Custom(fn(&[u8]) -> Option<Verdict>),
}

impl ReplyClassifier {
    /// Current verdict for `reply`, decisive or not.
    pub fn classify(&self, reply: &[u8]) -> Verdict {
        let success = match self {
            ReplyClassifier::Ok => contains_ignore_case(reply, b"OK"),
            ReplyClassifier::Prompt => reply.contains(&b'>'),
            ReplyClassifier::Ignore => true,
            ReplyClassifier::Custom(f) => f(reply) == Some(Verdict::Success),
        };
        if success {
            Verdict::Success
        } else {
            Verdict::Failure
        }
    }

    /// `Some` once the reply settles the task.
    pub fn decide(&self, reply: &[u8]) -> Option<Verdict> {
        match self {
            ReplyClassifier::Ok | ReplyClassifier::Prompt => {
                if self.classify(reply) == Verdict::Success {
                    Some(Verdict::Success)
                } else if contains_ignore_case(reply, b"ERROR") {
                    Some(Verdict::Failure)
                } else {
                    None
                }
            }
            ReplyClassifier::Ignore => Some(Verdict::Success),
            ReplyClassifier::Custom(f) => f(reply),
        }
    }

    pub fn awaits_reply(&self) -> bool {
        !matches!(self, ReplyClassifier::Ignore)
    }

    pub fn expects_prompt(&self) -> bool {
        matches!(self, ReplyClassifier::Prompt)
    }
}

impl Default for ReplyClassifier {
    fn default() -> Self {
        ReplyClassifier::Ok
    }
}

/// What a resolved task looked like, handed to its callback and to event
/// subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskReport {
    pub id: TaskId,
    pub label: String,
    pub request: Vec<u8>,
    pub reply: Vec<u8>,
    pub outcome: TaskOutcome,
    pub latency: Option<Duration>,
    pub overflowed: bool,
}

impl TaskReport {
    pub fn reply_text(&self) -> String {
        String::from_utf8_lossy(&self.reply).into_owned()
    }
}

pub type TaskCallback = Arc<dyn Fn(&TaskReport) + Send + Sync>;

/// One command/reply exchange.
pub struct Task {
    pub(crate) id: TaskId,
    pub(crate) label: String,
    pub(crate) request: Vec<u8>,
    pub(crate) timeout: Duration,
    pub(crate) reply: Vec<u8>,
    pub(crate) state: TaskState,
    pub(crate) classifier: ReplyClassifier,
    pub(crate) callback: Option<TaskCallback>,
    pub(crate) overflowed: bool,
}

impl Task {
    /// AT command; CRLF is always appended, even if `command` already ends
    /// with one.
    pub fn command(command: &str) -> Self {
        let mut request = command.as_bytes().to_vec();
        request.extend_from_slice(CRLF);
        let label = command.trim_end().to_string();
        Self::with_request(label, request)
    }

    /// Bytes sent verbatim, no terminator added.
    pub fn raw(label: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self::with_request(label.into(), bytes.into())
    }

    fn with_request(label: String, request: Vec<u8>) -> Self {
        Self {
            id: TaskId::new(),
            label,
            request,
            timeout: DEFAULT_COMMAND_TIMEOUT,
            reply: Vec::new(),
            state: TaskState::Pending,
            classifier: ReplyClassifier::default(),
            callback: None,
            overflowed: false,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_classifier(mut self, classifier: ReplyClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn on_resolved<F>(mut self, callback: F) -> Self
    where
        F: Fn(&TaskReport) + Send + Sync + 'static,
    {
        self.callback = Some(Arc::new(callback));
        self
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn request(&self) -> &[u8] {
        &self.request
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn reply(&self) -> &[u8] {
        &self.reply
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn classifier(&self) -> ReplyClassifier {
        self.classifier
    }

    pub fn is_sent(&self) -> bool {
        matches!(self.state, TaskState::Sent { .. })
    }

    pub fn deadline(&self) -> Option<Instant> {
        match self.state {
            TaskState::Sent { at } => Some(at + self.timeout),
            _ => None,
        }
    }

    pub(crate) fn mark_sent(&mut self, at: Instant) {
        self.state = TaskState::Sent { at };
    }

    pub(crate) fn resolve(&mut self, outcome: TaskOutcome, now: Instant) -> TaskReport {
        let latency = match self.state {
            TaskState::Sent { at } => Some(now.saturating_duration_since(at)),
            _ => None,
        };
        self.state = TaskState::Resolved(outcome);
        TaskReport {
            id: self.id,
            label: self.label.clone(),
            request: self.request.clone(),
            reply: self.reply.clone(),
            outcome,
            latency,
            overflowed: self.overflowed,
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("state", &self.state)
            .field("timeout", &self.timeout)
            .field("classifier", &self.classifier)
            .field("reply_len", &self.reply.len())
            .finish()
    }
}

/// Ordered tasks where each link runs only after the previous one succeeded.
#[derive(Debug)]
pub struct TaskChain {
    pub(crate) links: Vec<Task>,
}

impl TaskChain {
    pub fn new(head: Task) -> Self {
        Self { links: vec![head] }
    }

    pub fn then(mut self, task: Task) -> Self {
        self.links.push(task);
        self
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn head_id(&self) -> Option<TaskId> {
        self.links.first().map(|t| t.id)
    }

    pub fn tasks(&self) -> &[Task] {
        &self.links
    }
}

impl From<Task> for TaskChain {
    fn from(task: Task) -> Self {
        TaskChain::new(task)
    }
}
