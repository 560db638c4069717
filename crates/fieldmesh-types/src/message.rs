//! The message envelope and its wire codec.
//!
//! A [`Message`] serializes to a JSON object; bulk arrays inside the value
//! are packed with the binary array codec from [`crate::array`]. The encoded
//! bytes are cached on first use and reused until a field is mutated, so a
//! relayed message is forwarded byte-for-byte as it arrived.

use crate::error::{MessageError, MessageResult};
use crate::value::Value;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::OnceLock;

/// Default number of retries before a message is given up on.
pub const DEFAULT_TTL: i32 = 2;

/// Destination of a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Address {
    /// A single id, routed through the tree.
    Id(String),
    /// An explicit ordered path; the last element is the final recipient.
    Path(Vec<String>),
}

impl Address {
    /// The final recipient.
    pub fn recipient(&self) -> &str {
        match self {
            Address::Id(id) => id,
            Address::Path(path) => path.last().map(String::as_str).unwrap_or(""),
        }
    }

    /// Explicit hops, empty for tree-routed addresses.
    pub fn hops(&self) -> &[String] {
        match self {
            Address::Id(_) => &[],
            Address::Path(path) => path,
        }
    }

    pub fn is_valid(&self) -> bool {
        match self {
            Address::Id(id) => !id.is_empty(),
            Address::Path(path) => !path.is_empty() && path.iter().all(|hop| !hop.is_empty()),
        }
    }
}

impl Default for Address {
    fn default() -> Self {
        Address::Id(String::new())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Id(id) => write!(f, "{id}"),
            Address::Path(path) => write!(f, "{}", path.join(">")),
        }
    }
}

impl From<&str> for Address {
    fn from(id: &str) -> Self {
        Address::Id(id.to_string())
    }
}

impl From<String> for Address {
    fn from(id: String) -> Self {
        Address::Id(id)
    }
}

impl From<Vec<String>> for Address {
    fn from(path: Vec<String>) -> Self {
        Address::Path(path)
    }
}

/// Named markers altering delivery and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Flag {
    /// No outbox entry, no confirmation.
    NoRepeat,
    /// Log without the value.
    MinPrint,
    /// Never log.
    NoLog,
}

#[derive(Serialize)]
struct EnvelopeRef<'a> {
    id: &'a str,
    to: &'a Address,
    sender: &'a str,
    key: &'a str,
    value: serde_json::Value,
    timestamp: &'a DateTime<Utc>,
    ttl: i32,
    flags: &'a BTreeSet<Flag>,
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(default)]
    id: String,
    #[serde(default)]
    to: Address,
    #[serde(default)]
    sender: String,
    #[serde(default)]
    key: String,
    #[serde(default)]
    value: serde_json::Value,
    #[serde(default = "Utc::now")]
    timestamp: DateTime<Utc>,
    #[serde(default = "default_ttl")]
    ttl: i32,
    #[serde(default)]
    flags: BTreeSet<Flag>,
}

fn default_ttl() -> i32 {
    DEFAULT_TTL
}

/// The unit of communication.
#[derive(Debug, Clone)]
pub struct Message {
    id: String,
    to: Address,
    sender: String,
    key: String,
    value: Value,
    timestamp: DateTime<Utc>,
    ttl: i32,
    flags: BTreeSet<Flag>,
    encoded: OnceLock<Bytes>,
}

impl Message {
    /// Create a message stamped with the current time and the default TTL.
    pub fn new(
        id: impl Into<String>,
        to: impl Into<Address>,
        sender: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<Value>,
    ) -> Self {
        Self {
            id: id.into(),
            to: to.into(),
            sender: sender.into(),
            key: key.into(),
            value: value.into(),
            timestamp: Utc::now(),
            ttl: DEFAULT_TTL,
            flags: BTreeSet::new(),
            encoded: OnceLock::new(),
        }
    }

    pub fn with_flag(mut self, flag: Flag) -> Self {
        self.set_flag(flag);
        self
    }

    pub fn with_flags(mut self, flags: impl IntoIterator<Item = Flag>) -> Self {
        for flag in flags {
            self.set_flag(flag);
        }
        self
    }

    pub fn with_ttl(mut self, ttl: i32) -> Self {
        self.set_ttl(ttl);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn to(&self) -> &Address {
        &self.to
    }

    pub fn sender(&self) -> &str {
        &self.sender
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn ttl(&self) -> i32 {
        self.ttl
    }

    pub fn flags(&self) -> &BTreeSet<Flag> {
        &self.flags
    }

    pub fn has_flag(&self, flag: Flag) -> bool {
        self.flags.contains(&flag)
    }

    /// Final recipient id.
    pub fn recipient(&self) -> &str {
        self.to.recipient()
    }

    /// Take the payload, dropping the envelope.
    pub fn into_value(self) -> Value {
        self.value
    }

    pub fn set_value(&mut self, value: impl Into<Value>) {
        self.value = value.into();
        self.invalidate();
    }

    pub fn set_ttl(&mut self, ttl: i32) {
        self.ttl = ttl;
        self.invalidate();
    }

    pub fn set_flag(&mut self, flag: Flag) {
        if self.flags.insert(flag) {
            self.invalidate();
        }
    }

    fn invalidate(&mut self) {
        self.encoded = OnceLock::new();
    }

    /// Check that `id`, `to`, `sender` and `key` are all present.
    pub fn validate(&self) -> MessageResult<()> {
        if self.id.is_empty() {
            return Err(MessageError::Invalid("id"));
        }
        if !self.to.is_valid() {
            return Err(MessageError::Invalid("to"));
        }
        if self.sender.is_empty() {
            return Err(MessageError::Invalid("sender"));
        }
        if self.key.is_empty() {
            return Err(MessageError::Invalid("key"));
        }
        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }

    /// Encode to wire bytes, reusing the cached encoding when present.
    pub fn serialize(&self) -> MessageResult<Bytes> {
        self.validate()?;
        if let Some(bytes) = self.encoded.get() {
            return Ok(bytes.clone());
        }
        let envelope = EnvelopeRef {
            id: &self.id,
            to: &self.to,
            sender: &self.sender,
            key: &self.key,
            value: self.value.to_json(),
            timestamp: &self.timestamp,
            ttl: self.ttl,
            flags: &self.flags,
        };
        let bytes = Bytes::from(serde_json::to_vec(&envelope)?);
        let _ = self.encoded.set(bytes.clone());
        Ok(bytes)
    }

    /// Decode wire bytes.
    ///
    /// With `expand_arrays` unset, packed arrays stay packed. The input bytes
    /// become the cached encoding either way.
    pub fn deserialize(bytes: Bytes, expand_arrays: bool) -> MessageResult<Self> {
        let envelope: Envelope = serde_json::from_slice(&bytes)?;
        let value = Value::from_json(envelope.value, expand_arrays)?;
        let encoded = OnceLock::new();
        let _ = encoded.set(bytes);
        Ok(Self {
            id: envelope.id,
            to: envelope.to,
            sender: envelope.sender,
            key: envelope.key,
            value,
            timestamp: envelope.timestamp,
            ttl: envelope.ttl,
            flags: envelope.flags,
            encoded,
        })
    }

    /// Decode any packed arrays in the value. The cached encoding stays
    /// valid since the content is unchanged.
    pub fn expand_arrays(&mut self) -> MessageResult<()> {
        self.value.expand()
    }

    /// One-line rendering for logs, honouring `NOLOG` and `MINPRINT`.
    pub fn summary(&self) -> Option<String> {
        if self.has_flag(Flag::NoLog) {
            return None;
        }
        let head = format!(
            "{} {} -> {} [{}]",
            self.id, self.sender, self.to, self.key
        );
        if self.has_flag(Flag::MinPrint) {
            Some(head)
        } else {
            Some(format!("{head} {}", self.value))
        }
    }
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.to == other.to
            && self.sender == other.sender
            && self.key == other.key
            && self.value == other.value
            && self.timestamp == other.timestamp
            && self.ttl == other.ttl
            && self.flags == other.flags
    }
}
