//! Items flowing into the coordinator queue, and the future handed back to
//! API callers.

use std::collections::HashMap;
use std::net::SocketAddr;

use crate::flease::{CellId, FleaseMessage, Lease};
use crate::utils::FleaseError;

use tokio::sync::{mpsc, oneshot};

/// Completion side of a `FleaseFuture`.
pub(crate) type Responder<T> = oneshot::Sender<Result<T, FleaseError>>;

/// Client-issued command to the coordinator.
#[derive(Debug)]
pub(crate) enum Request {
    /// Start negotiating a lease for a cell. `tx` completes with the first
    /// lease learned for the cell, or fails when the cell gives up.
    OpenCell {
        cell: CellId,
        acceptors: Vec<SocketAddr>,
        request_master_epoch: bool,
        view_id: i32,
        tx: Option<Responder<Lease>>,
    },

    /// Stop handling a cell on the proposer side.
    CloseCell { cell: CellId, tx: Responder<()> },

    /// Hand a held lease over to another identity.
    HandoverLease {
        cell: CellId,
        new_owner: String,
        tx: Responder<Lease>,
    },

    /// Set (or invalidate with `VIEW_ID_INVALIDATED`) the view of a cell.
    SetView {
        cell: CellId,
        view_id: i32,
        tx: Responder<()>,
    },

    /// Snapshot of every cell known to the local acceptor and its learned
    /// lease.
    GetState {
        tx: Responder<HashMap<CellId, Option<Lease>>>,
    },

    /// Raw acceptor state of one cell, for diagnostics.
    DumpCell { cell: CellId, tx: Responder<String> },

    /// The local acceptor's latest learned lease for a cell.
    LocalLease {
        cell: CellId,
        tx: Responder<Option<Lease>>,
    },
}

/// One item of the coordinator queue.
#[derive(Debug)]
pub(crate) enum StageInput {
    Message(FleaseMessage),
    Request(Request),
}

/// Cloneable handle for delivering inbound network messages to a stage.
#[derive(Debug, Clone)]
pub struct MessageInlet {
    tx_input: mpsc::UnboundedSender<StageInput>,
}

impl MessageInlet {
    pub(crate) fn new(tx_input: mpsc::UnboundedSender<StageInput>) -> Self {
        MessageInlet { tx_input }
    }

    /// Enqueues a message received from a peer. The message must carry the
    /// sender's listen address.
    pub fn receive_message(&self, msg: FleaseMessage) -> Result<(), FleaseError> {
        if msg.sender.is_none() {
            return logged_err!("inbound message without sender: {:?}", msg);
        }
        self.tx_input
            .send(StageInput::Message(msg))
            .map_err(|e| FleaseError::msg(format!("stage queue closed: {}", e)))
    }
}

/// Future-like result of an asynchronous stage operation. Awaited with
/// `wait()` from async code, or `blocking_wait()` from a plain thread.
#[derive(Debug)]
pub struct FleaseFuture<T> {
    rx: oneshot::Receiver<Result<T, FleaseError>>,
}

impl<T> FleaseFuture<T> {
    pub(crate) fn new() -> (Responder<T>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, FleaseFuture { rx })
    }

    pub async fn wait(self) -> Result<T, FleaseError> {
        self.rx.await?
    }

    /// Blocks the calling thread; must not be called from within an async
    /// runtime worker.
    pub fn blocking_wait(self) -> Result<T, FleaseError> {
        self.rx.blocking_recv()?
    }

    /// Returns the result if already available.
    pub fn try_get(&mut self) -> Option<Result<T, FleaseError>> {
        self.rx.try_recv().ok()
    }
}
