//! Lifecycle events exchanged between rigs
//!
//! The table below is a versioned wire contract. Events travel as their integer
//! code; names are accepted leniently when parsing.
//!
//! | Event      | Code | Name          |
//! |------------|------|---------------|
//! | Init       | 10   | EXPINIT       |
//! | Start      | 20   | EXPSTART      |
//! | End        | 30   | EXPEND        |
//! | Cleanup    | 40   | EXPCLEANUP    |
//! | Interrupt  | 50   | EXPINTERRUPT  |
//! | Status     | 1    | EXPSTATUS     |
//! | Info       | 2    | EXPINFO       |
//! | Credential | 3    | ALYX          |

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::error::{CommError, CommResult};

/// Version of the event code table; bump when a code changes meaning
pub const EVENT_TABLE_VERSION: u32 = 1;

/// Experiment lifecycle signals
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LifecycleEvent {
    /// Experiment is initializing
    Init,
    /// Experiment has begun
    Start,
    /// Experiment has stopped
    End,
    /// Experiment cleanup begun
    Cleanup,
    /// Experiment interrupted
    Interrupt,
    /// Experiment status
    Status,
    /// Experiment info
    Info,
    /// Credential (token) exchange
    Credential,
}

/// Something that may name a lifecycle event
#[derive(Debug, Clone, PartialEq)]
pub enum EventKey {
    Event(LifecycleEvent),
    Code(i64),
    Name(String),
    /// A decoded wire value of any JSON type
    Json(Value),
}

impl From<LifecycleEvent> for EventKey {
    fn from(event: LifecycleEvent) -> Self {
        EventKey::Event(event)
    }
}

impl From<i64> for EventKey {
    fn from(code: i64) -> Self {
        EventKey::Code(code)
    }
}

impl From<i32> for EventKey {
    fn from(code: i32) -> Self {
        EventKey::Code(code.into())
    }
}

impl From<&str> for EventKey {
    fn from(name: &str) -> Self {
        EventKey::Name(name.to_string())
    }
}

impl From<String> for EventKey {
    fn from(name: String) -> Self {
        EventKey::Name(name)
    }
}

impl From<Value> for EventKey {
    fn from(value: Value) -> Self {
        EventKey::Json(value)
    }
}

impl LifecycleEvent {
    /// Every event, in code-table order
    pub const ALL: [LifecycleEvent; 8] = [
        LifecycleEvent::Init,
        LifecycleEvent::Start,
        LifecycleEvent::End,
        LifecycleEvent::Cleanup,
        LifecycleEvent::Interrupt,
        LifecycleEvent::Status,
        LifecycleEvent::Info,
        LifecycleEvent::Credential,
    ];

    /// Stable integer code used on the wire
    pub fn code(&self) -> i64 {
        match self {
            LifecycleEvent::Init => 10,
            LifecycleEvent::Start => 20,
            LifecycleEvent::End => 30,
            LifecycleEvent::Cleanup => 40,
            LifecycleEvent::Interrupt => 50,
            LifecycleEvent::Status => 1,
            LifecycleEvent::Info => 2,
            LifecycleEvent::Credential => 3,
        }
    }

    /// Canonical name
    pub fn name(&self) -> &'static str {
        match self {
            LifecycleEvent::Init => "EXPINIT",
            LifecycleEvent::Start => "EXPSTART",
            LifecycleEvent::End => "EXPEND",
            LifecycleEvent::Cleanup => "EXPCLEANUP",
            LifecycleEvent::Interrupt => "EXPINTERRUPT",
            LifecycleEvent::Status => "EXPSTATUS",
            LifecycleEvent::Info => "EXPINFO",
            LifecycleEvent::Credential => "ALYX",
        }
    }

    fn alias(&self) -> &'static str {
        match self {
            LifecycleEvent::Init => "INIT",
            LifecycleEvent::Start => "START",
            LifecycleEvent::End => "END",
            LifecycleEvent::Cleanup => "CLEANUP",
            LifecycleEvent::Interrupt => "INTERRUPT",
            LifecycleEvent::Status => "STATUS",
            LifecycleEvent::Info => "INFO",
            LifecycleEvent::Credential => "CREDENTIAL",
        }
    }

    /// Look up an event by its integer code
    pub fn from_code(code: i64) -> CommResult<Self> {
        Self::ALL
            .into_iter()
            .find(|event| event.code() == code)
            .ok_or_else(|| CommError::config(format!("Unrecognized event code {code}")))
    }

    /// Look up an event by name (trimmed, case-insensitive)
    pub fn from_name(name: &str) -> CommResult<Self> {
        let normalized = name.trim().to_uppercase();
        Self::ALL
            .into_iter()
            .find(|event| event.name() == normalized || event.alias() == normalized)
            .ok_or_else(|| {
                let choices: Vec<&str> = Self::ALL.iter().map(|e| e.name()).collect();
                CommError::config(format!(
                    "Unrecognized event \"{normalized}\". Choices: {}",
                    choices.join(", ")
                ))
            })
    }

    /// Validate an event key
    ///
    /// A member maps to itself, an integer to the member with that code and a
    /// string to the member with that name. JSON keys follow the same rules for
    /// numbers and strings; every other JSON type is rejected.
    pub fn validate(key: impl Into<EventKey>) -> CommResult<Self> {
        match key.into() {
            EventKey::Event(event) => Ok(event),
            EventKey::Code(code) => Self::from_code(code),
            EventKey::Name(name) => Self::from_name(&name),
            EventKey::Json(value) => Self::from_json(&value),
        }
    }

    /// Parse an event from a decoded wire element
    pub fn from_json(value: &Value) -> CommResult<Self> {
        match value {
            Value::Number(n) => n
                .as_i64()
                .ok_or_else(|| CommError::config(format!("Unrecognized event code {n}")))
                .and_then(Self::from_code),
            Value::String(name) => Self::from_name(name),
            other => Err(CommError::config(format!(
                "Unsupported event type: {other} (expected an event, code or name)"
            ))),
        }
    }
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for LifecycleEvent {
    type Err = CommError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().parse::<i64>() {
            Ok(code) => Self::from_code(code),
            Err(_) => Self::from_name(s),
        }
    }
}

impl Serialize for LifecycleEvent {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(self.code())
    }
}

impl<'de> Deserialize<'de> for LifecycleEvent {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::from_json(&value).map_err(serde::de::Error::custom)
    }
}
