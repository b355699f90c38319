//! Flease: fault-tolerant, decentralized lease coordination.
//!
//! A Paxos-derived protocol that elects and continuously renews a single,
//! time-bounded lease holder per cell, without a central lock server and
//! while staying safe under crashes, message loss and bounded clock drift.

#[macro_use]
mod utils;

mod flease;

pub use utils::{logger_init, Bitmap, FleaseError, ME};

pub use flease::{
    CellId, Clock, FileEpochStore, FleaseConfig, FleaseFuture, FleaseMessage,
    FleaseStage, Lease, MasterEpochHandler, MessageInlet, MessageSender,
    MsgType, ProposalNumber, StageState, StatKind, StatsCollector,
    StatusListener, SummaryStats, TcpCommunicator, TokioClock,
    ViewChangeListener, MAX_BATCH_SIZE,
};
pub use flease::{
    IGNORE_MASTER_EPOCH, REQUEST_MASTER_EPOCH, VIEW_ID_INVALIDATED,
};
