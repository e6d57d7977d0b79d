//! The command envelope written to the replicated log.
//!
//! Every replicated mutation travels as `{domain, action, payload}`.  The
//! domain picks a handler from the registry, the action picks the operation
//! inside that handler, and the payload is an opaque JSON document only the
//! handler interprets.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

/// Built-in replicated domains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Domain {
    Note,
    S3Config,
    Options,
}

impl Domain {
    pub const ALL: [Domain; 3] = [Domain::Note, Domain::S3Config, Domain::Options];

    /// Wire name used in the envelope's `domain` field.
    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Note => "note",
            Domain::S3Config => "s3Configs",
            Domain::Options => "options",
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Domain {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Domain::ALL
            .into_iter()
            .find(|d| d.as_str() == s)
            .ok_or_else(|| format!("unknown domain: {s}"))
    }
}

/// Action names understood by the built-in handlers.
pub mod action {
    pub const CREATE: &str = "create";
    pub const UPDATE: &str = "update";
    pub const DELETE: &str = "delete";
    pub const BULK_DELETE: &str = "bulk_delete";
    pub const SET: &str = "set";
}

/// One replicated mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub domain: String,
    pub action: String,
    pub payload: Box<RawValue>,
}

impl Command {
    /// Build an envelope for a built-in domain.
    pub fn new<T: Serialize>(
        domain: Domain,
        action: &str,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            domain: domain.as_str().to_string(),
            action: action.to_string(),
            payload: serde_json::value::to_raw_value(payload)?,
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    pub fn payload_bytes(&self) -> &[u8] {
        self.payload.get().as_bytes()
    }
}
