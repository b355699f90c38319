//! Flease protocol message types.

use std::fmt;
use std::net::SocketAddr;

use crate::flease::{FleaseConfig, Lease};

use bytes::Bytes;

use serde::{Deserialize, Serialize};

/// Master epoch value meaning "no epoch attached / not fencing".
pub const IGNORE_MASTER_EPOCH: i64 = -1;

/// Master epoch value carried by a PREPARE asking acceptors for their
/// durably stored epoch.
pub const REQUEST_MASTER_EPOCH: i64 = 0;

/// View ID value that invalidates the current view of a cell.
pub const VIEW_ID_INVALIDATED: i32 = -1;

/// Opaque cell identifier naming the resource under negotiation.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CellId(Bytes);

impl CellId {
    pub const EMPTY: CellId = CellId(Bytes::new());

    pub fn new(id: impl Into<Bytes>) -> Self {
        CellId(id.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<&str> for CellId {
    fn from(s: &str) -> Self {
        CellId(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl From<String> for CellId {
    fn from(s: String) -> Self {
        CellId(Bytes::from(s))
    }
}

impl From<Vec<u8>> for CellId {
    fn from(v: Vec<u8>) -> Self {
        CellId(Bytes::from(v))
    }
}

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Debug for CellId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", String::from_utf8_lossy(&self.0))
    }
}

/// Ballot number: `(proposal_no, sender_id)`, ordered lexicographically so
/// that concurrent proposers never produce equal ballots.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    Serialize,
    Deserialize,
)]
pub struct ProposalNumber {
    pub proposal_no: u64,
    pub sender_id: u64,
}

impl ProposalNumber {
    pub const EMPTY: ProposalNumber = ProposalNumber {
        proposal_no: 0,
        sender_id: 0,
    };

    pub fn new(proposal_no: u64, sender_id: u64) -> Self {
        ProposalNumber {
            proposal_no,
            sender_id,
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        *self == Self::EMPTY
    }

    /// Same sender, proposal number bumped by `by`.
    #[inline]
    pub fn bumped(&self, by: u64) -> Self {
        ProposalNumber {
            proposal_no: self.proposal_no + by,
            sender_id: self.sender_id,
        }
    }
}

impl fmt::Display for ProposalNumber {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.proposal_no, self.sender_id)
    }
}

/// Message type. Also classifies which role a message is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MsgType {
    Prepare,
    PrepareAck,
    PrepareNack,
    Accept,
    AcceptAck,
    AcceptNack,
    Learn,
    WrongView,

    /// By internal timers ONLY.
    EventTimeoutPrepare,
    EventTimeoutAccept,
    EventRestart,
    EventRenew,
}

impl MsgType {
    /// Addressed to the passive acceptor role.
    #[inline]
    pub fn is_acceptor_message(&self) -> bool {
        matches!(self, MsgType::Prepare | MsgType::Accept | MsgType::Learn)
    }

    /// Replies addressed to the active proposer role.
    #[inline]
    pub fn is_proposer_message(&self) -> bool {
        matches!(
            self,
            MsgType::PrepareAck
                | MsgType::PrepareNack
                | MsgType::AcceptAck
                | MsgType::AcceptNack
                | MsgType::WrongView
        )
    }

    /// Timer payloads, never valid on the wire.
    #[inline]
    pub fn is_internal_event(&self) -> bool {
        matches!(
            self,
            MsgType::EventTimeoutPrepare
                | MsgType::EventTimeoutAccept
                | MsgType::EventRestart
                | MsgType::EventRenew
        )
    }
}

/// Flease message, used both on the wire and as timer payload.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FleaseMessage {
    pub msg_type: MsgType,
    pub cell: CellId,

    /// Ballot of the round this message belongs to.
    pub ballot: ProposalNumber,

    /// Ballot previously accepted (in PREPARE_ACK) or the blocking prepared
    /// ballot (in NACKs); `EMPTY` otherwise.
    pub prev_ballot: ProposalNumber,

    pub lease_holder: Option<String>,
    pub lease_timeout_ms: i64,
    pub master_epoch: i64,
    pub view_id: i32,

    /// Synchronized clock reading at send time.
    pub send_timestamp_ms: i64,

    /// Listen address of the sending node; `None` for local messages.
    pub sender: Option<SocketAddr>,
}

impl FleaseMessage {
    /// Creates a blank message of given type for given cell.
    pub fn new(msg_type: MsgType, cell: CellId) -> Self {
        FleaseMessage {
            msg_type,
            cell,
            ballot: ProposalNumber::EMPTY,
            prev_ballot: ProposalNumber::EMPTY,
            lease_holder: None,
            lease_timeout_ms: 0,
            master_epoch: IGNORE_MASTER_EPOCH,
            view_id: 0,
            send_timestamp_ms: 0,
            sender: None,
        }
    }

    /// Creates an internal timer event carrying the given ballot.
    pub fn event(msg_type: MsgType, cell: CellId, ballot: ProposalNumber) -> Self {
        debug_assert!(msg_type.is_internal_event());
        FleaseMessage {
            ballot,
            ..Self::new(msg_type, cell)
        }
    }

    /// Creates a reply of given type that copies the ballot, value, epoch and
    /// view of this message. The reply has no sender until the transport
    /// stamps one.
    pub fn reply(&self, msg_type: MsgType, now_ms: i64) -> Self {
        FleaseMessage {
            msg_type,
            cell: self.cell.clone(),
            ballot: self.ballot,
            prev_ballot: ProposalNumber::EMPTY,
            lease_holder: self.lease_holder.clone(),
            lease_timeout_ms: self.lease_timeout_ms,
            master_epoch: self.master_epoch,
            view_id: self.view_id,
            send_timestamp_ms: now_ms,
            sender: None,
        }
    }

    /// True if this message belongs to an earlier ballot than `other`.
    #[inline]
    pub fn before(&self, other: &FleaseMessage) -> bool {
        self.ballot < other.ballot
    }

    /// True if this message belongs to a later ballot than `other`.
    #[inline]
    pub fn after(&self, other: &FleaseMessage) -> bool {
        self.ballot > other.ballot
    }

    /// True if the carried lease value has certainly timed out on every
    /// node: `timeout + dmax < now`.
    #[inline]
    pub fn has_timed_out(&self, config: &FleaseConfig, now_ms: i64) -> bool {
        self.lease_timeout_ms + config.dmax() < now_ms
    }

    /// True if the carried lease value is certainly still valid on every
    /// node: `timeout - dmax > now`.
    #[inline]
    pub fn has_not_timed_out(&self, config: &FleaseConfig, now_ms: i64) -> bool {
        self.lease_timeout_ms - config.dmax() > now_ms
    }

    /// True if the message is older than the message timeout.
    #[inline]
    pub fn is_outdated(&self, config: &FleaseConfig, now_ms: i64) -> bool {
        self.send_timestamp_ms + config.message_timeout() < now_ms
    }

    /// The lease value carried by this message.
    pub fn lease(&self) -> Lease {
        Lease::new(
            self.cell.clone(),
            self.lease_holder.clone(),
            self.lease_timeout_ms,
            self.master_epoch,
        )
    }
}

impl fmt::Debug for FleaseMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{:?}({} b={} pb={} v={}/{} e={} view={} ts={} from={:?})",
            self.msg_type,
            self.cell,
            self.ballot,
            self.prev_ballot,
            self.lease_holder.as_deref().unwrap_or("-"),
            self.lease_timeout_ms,
            self.master_epoch,
            self.view_id,
            self.send_timestamp_ms,
            self.sender
        )
    }
}
