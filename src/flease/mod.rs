//! Flease lease manager: protocol roles, coordinator stage, and the
//! pluggable collaborators around them.

mod acceptor;
mod clock;
mod config;
mod epochstore;
mod external;
mod lease;
mod lifecycle;
mod messages;
mod proposer;
mod request;
mod stage;
mod stats;
mod timers;
mod transport;

#[cfg(test)]
mod testkit;

pub use clock::{Clock, TokioClock};
pub use config::FleaseConfig;
pub use epochstore::FileEpochStore;
pub use external::{
    MasterEpochHandler, MessageSender, StatusListener, ViewChangeListener,
};
pub use lease::Lease;
pub use lifecycle::StageState;
pub use messages::{CellId, FleaseMessage, MsgType, ProposalNumber};
pub use messages::{
    IGNORE_MASTER_EPOCH, REQUEST_MASTER_EPOCH, VIEW_ID_INVALIDATED,
};
pub use request::{FleaseFuture, MessageInlet};
pub use stage::{FleaseStage, MAX_BATCH_SIZE};
pub use stats::{StatKind, StatsCollector, SummaryStats};
pub use transport::TcpCommunicator;

pub(crate) use acceptor::Acceptor;
pub(crate) use external::EpochIo;
pub(crate) use proposer::{Proposer, RoundCtx};
pub(crate) use request::{Request, Responder, StageInput};
pub(crate) use timers::{ExpiryHeap, TimerHeap};
