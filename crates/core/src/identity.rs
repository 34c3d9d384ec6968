//! Caller identity as supplied by the channel-integration layer.
//!
//! The `trusted` bit may only be set by boundary code that authenticated the
//! caller. It is private, skipped on deserialization, and only settable via
//! [`Identity::trusted`], so a request payload can never claim it.

use serde::{Deserialize, Serialize};

/// Who is asking, and over which channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    /// Stable caller id within the channel (user id, sender id, ...).
    pub caller_id: String,

    /// Channel the request arrived on (e.g. `cli`, `telegram`, `slack`).
    pub channel: String,

    #[serde(skip_deserializing, default)]
    trusted: bool,
}

impl Identity {
    /// An identity whose origin has not been authenticated.
    pub fn untrusted(caller_id: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            caller_id: caller_id.into(),
            channel: channel.into(),
            trusted: false,
        }
    }

    /// An identity vouched for by an authenticating boundary.
    pub fn trusted(caller_id: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            caller_id: caller_id.into(),
            channel: channel.into(),
            trusted: true,
        }
    }

    pub fn is_trusted(&self) -> bool {
        self.trusted
    }

    /// Key used for per-identity ledgers and rate windows.
    pub fn key(&self) -> String {
        format!("{}:{}", self.channel, self.caller_id)
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.channel, self.caller_id)?;
        if !self.trusted {
            write!(f, " (untrusted)")?;
        }
        Ok(())
    }
}
