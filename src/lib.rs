//! AT-command engine for GSM modems on a serial line.
//!
//! Inbound bytes flow from the transport reader into a per-device
//! [`serial::LineBuffer`]; the device [`scheduler::Scheduler`] reassembles
//! them into lines, attributes each line to the single in-flight task and
//! sends the next queued task once the current one resolves or times out.
pub mod device;
pub mod scheduler;
pub mod serial;

pub use device::{Device, DeviceConfig, DeviceError, DeviceRegistry, ModemManager, Vendor};
pub use scheduler::{
    build_registration_query, build_send_sms_chain, ReplyClassifier, Task, TaskChain, TaskEvent, TaskOutcome,
    TaskReport,
};
pub use serial::{HandleId, LineBuffer, LineSettings, SerialError, SerialInterface, Transport};
