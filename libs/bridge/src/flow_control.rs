//! Upstream flow-control notices and the per-link phase machine
//!
//! Credit is downstream truth: every announcement re-reads the sender and
//! announces `credit - queued`, never a cached value.
//!
//! ```text
//! Unattached -> Attaching -> Active <-> Draining
//!                   |           |          |
//!                   +--------> Closed <----+
//! ```

use crate::downstream::DownstreamSender;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Separator between the flow-control prefix and the client id
pub const ADDRESS_SEPARATOR: char = '.';

/// Address of the upstream flow-control channel for a client
pub fn flow_control_address(prefix: &str, client_id: &str) -> String {
    format!("{}{}{}", prefix, ADDRESS_SEPARATOR, client_id)
}

/// Credit the upstream may use right now
///
/// Saturates at zero when the sender has queued more than its credit.
pub fn available_credit(sender: &dyn DownstreamSender) -> u32 {
    compute_credit(sender.credit(), sender.queued())
}

pub(crate) fn compute_credit(credit: u32, queued: u32) -> u32 {
    credit.saturating_sub(queued)
}

/// Credit announcement for one upstream link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowControlMessage {
    #[serde(rename = "client-id")]
    pub client_id: String,
    #[serde(rename = "credit")]
    pub credits: u32,
    pub drain: bool,
}

/// Failure notice telling the upstream handler what to do with a link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    #[serde(rename = "client-id")]
    pub client_id: String,
    #[serde(rename = "close-link")]
    pub link_must_close: bool,
}

/// Anything the bridge publishes on an upstream flow-control channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum UpstreamNotice {
    FlowControl(FlowControlMessage),
    Error(ErrorMessage),
}

impl UpstreamNotice {
    pub fn flow_control(client_id: impl Into<String>, credits: u32, drain: bool) -> Self {
        UpstreamNotice::FlowControl(FlowControlMessage {
            client_id: client_id.into(),
            credits,
            drain,
        })
    }

    /// Error notice that always asks the upstream to close the link
    pub fn close_link(client_id: impl Into<String>) -> Self {
        UpstreamNotice::Error(ErrorMessage {
            client_id: client_id.into(),
            link_must_close: true,
        })
    }

    pub fn client_id(&self) -> &str {
        match self {
            UpstreamNotice::FlowControl(msg) => &msg.client_id,
            UpstreamNotice::Error(msg) => &msg.client_id,
        }
    }

    /// Drain announcements must be acknowledged by the upstream
    pub fn requires_ack(&self) -> bool {
        matches!(self, UpstreamNotice::FlowControl(msg) if msg.drain)
    }

    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Lifecycle phase of one client link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkPhase {
    Unattached,
    /// Waiting for the sender factory
    Attaching,
    Active,
    /// Drain announced, waiting for the upstream acknowledgement
    Draining,
    Closed,
}

impl LinkPhase {
    pub fn can_transition_to(self, next: LinkPhase) -> bool {
        use LinkPhase::*;
        matches!(
            (self, next),
            (Unattached, Attaching)
                | (Attaching, Active)
                | (Attaching, Closed)
                | (Active, Draining)
                | (Draining, Active)
                | (Active, Closed)
                | (Draining, Closed)
        )
    }

    /// Links in these phases accept forwarded messages
    pub fn is_forwarding(self) -> bool {
        matches!(self, LinkPhase::Active | LinkPhase::Draining)
    }

    pub fn is_closed(self) -> bool {
        self == LinkPhase::Closed
    }
}

impl fmt::Display for LinkPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LinkPhase::Unattached => "unattached",
            LinkPhase::Attaching => "attaching",
            LinkPhase::Active => "active",
            LinkPhase::Draining => "draining",
            LinkPhase::Closed => "closed",
        };
        f.write_str(name)
    }
}
