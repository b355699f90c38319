//! Interfaces to the collaborators a lease stage talks to: the transport,
//! the status and view-change listeners, and the master-epoch store.

use std::net::SocketAddr;

use crate::flease::{CellId, FleaseMessage, Lease};
use crate::utils::FleaseError;

use async_trait::async_trait;

/// Outbound message transport. Fire-and-forget: there is no failure signal,
/// lost messages only show up as missing replies.
pub trait MessageSender: Send + Sync {
    fn send_message(&self, msg: FleaseMessage, receiver: SocketAddr);
}

/// Receiver of lease status transitions.
pub trait StatusListener: Send + Sync {
    /// Called on every learned or expired lease transition of an open cell,
    /// including `Lease::EMPTY` on expiry or loss of ownership.
    fn status_changed(&self, cell: &CellId, lease: &Lease);

    /// Called when a cell exhausted its retries without reaching a quorum.
    fn lease_failed(&self, cell: &CellId, error: &FleaseError);
}

/// Receiver of view ID changes observed in incoming messages.
pub trait ViewChangeListener: Send + Sync {
    /// `on_proposal_side` is true if the proposer observed the higher view
    /// in replies, false if the acceptor observed it in a request.
    fn view_id_changed(&self, cell: &CellId, view_id: i32, on_proposal_side: bool);
}

/// Durable master-epoch store.
///
/// Both operations are awaited off the coordinator task; the reply they
/// belong to leaves the process only after they return `Ok`.
#[async_trait]
pub trait MasterEpochHandler: Send + Sync {
    /// Fills `reply.master_epoch` with the durably stored epoch of its cell
    /// (`0` if none was ever stored).
    async fn send_master_epoch(
        &self,
        reply: &mut FleaseMessage,
    ) -> Result<(), FleaseError>;

    /// Durably stores `reply.master_epoch` as the epoch of its cell.
    async fn store_master_epoch(
        &self,
        reply: &FleaseMessage,
    ) -> Result<(), FleaseError>;
}

/// Master-epoch operation a deferred reply waits for before leaving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EpochIo {
    /// Fill in the stored epoch (PREPARE_ACK to a REQUEST_MASTER_EPOCH).
    Fetch,
    /// Persist the carried epoch (ACCEPT_ACK to an epoch-carrying ACCEPT).
    Store,
}

impl EpochIo {
    /// Runs the operation on `handler` for `reply` and hands the reply back
    /// once it may be released.
    pub(crate) async fn run(
        self,
        handler: &dyn MasterEpochHandler,
        mut reply: FleaseMessage,
    ) -> Result<FleaseMessage, FleaseError> {
        match self {
            EpochIo::Fetch => handler.send_master_epoch(&mut reply).await?,
            EpochIo::Store => handler.store_master_epoch(&reply).await?,
        }
        Ok(reply)
    }
}
