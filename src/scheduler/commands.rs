//! Builders for the AT exchanges the device layer offers.
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::task::{ReplyClassifier, Task, TaskChain};

/// Ctrl-Z, terminates an SMS body in text mode.
pub const CTRL_Z: u8 = 0x1A;

pub const TEXT_MODE_TIMEOUT: Duration = Duration::from_millis(1000);
pub const SMS_PROMPT_TIMEOUT: Duration = Duration::from_millis(5000);
pub const SMS_SUBMIT_TIMEOUT: Duration = Duration::from_secs(60);
pub const REGISTRATION_TIMEOUT: Duration = Duration::from_millis(2000);

/// Text mode, then `AT+CMGS` waiting for the prompt, then the body and
/// Ctrl-Z. Each link runs only if the previous one succeeded.
pub fn build_send_sms_chain(message: &str, number: &str) -> TaskChain {
    let mut body = message.as_bytes().to_vec();
    body.push(CTRL_Z);

    TaskChain::new(Task::command("AT+CMGF=1").with_timeout(TEXT_MODE_TIMEOUT))
        .then(
            Task::command(&format!("AT+CMGS=\"{}\"", number))
                .with_classifier(ReplyClassifier::Prompt)
                .with_timeout(SMS_PROMPT_TIMEOUT),
        )
        .then(Task::raw("SMS body", body).with_timeout(SMS_SUBMIT_TIMEOUT))
}

/// Network registration state as reported by `+CREG`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistrationStatus {
    NotSearching,
    Home,
    Searching,
    Denied,
    Unknown,
    Roaming,
}

impl RegistrationStatus {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(RegistrationStatus::NotSearching),
            1 => Some(RegistrationStatus::Home),
            2 => Some(RegistrationStatus::Searching),
            3 => Some(RegistrationStatus::Denied),
            4 => Some(RegistrationStatus::Unknown),
            5 => Some(RegistrationStatus::Roaming),
            _ => None,
        }
    }

    pub fn is_registered(&self) -> bool {
        matches!(self, RegistrationStatus::Home | RegistrationStatus::Roaming)
    }
}

/// `AT+CREG?` as a single-link chain.
pub fn build_registration_query() -> TaskChain {
    TaskChain::new(Task::command("AT+CREG?").with_timeout(REGISTRATION_TIMEOUT))
}

/// Extract the status from a reply containing `+CREG: <n>,<stat>[,...]`.
pub fn parse_registration(reply: &str) -> Option<RegistrationStatus> {
    let line = reply.lines().find_map(|l| l.trim().strip_prefix("+CREG:"))?;
    let mut fields = line.split(',').map(str::trim);
    let first = fields.next()?;
    // Unsolicited form carries only <stat>
    let stat = fields.next().unwrap_or(first);
    RegistrationStatus::from_code(stat.parse().ok()?)
}
