pub mod commands;
pub mod dispatcher;
pub mod queue;
pub mod task;
pub mod types;

pub use commands::{build_registration_query, build_send_sms_chain, parse_registration, RegistrationStatus, CTRL_Z};
pub use dispatcher::Scheduler;
pub use queue::TaskQueue;
pub use task::{ReplyClassifier, Task, TaskCallback, TaskChain, TaskId, TaskOutcome, TaskReport, TaskState, Verdict};
pub use types::{MetricsSnapshot, TaskEvent, DEFAULT_REPLY_CAPACITY};
