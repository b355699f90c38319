//! Shared test helpers: manual clock, recording collaborators, in-memory
//! cluster transport and master-epoch store.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use crate::flease::{
    CellId, Clock, FleaseMessage, Lease, MasterEpochHandler, MessageInlet,
    MessageSender, StatusListener, ViewChangeListener,
};
use crate::utils::FleaseError;

use async_trait::async_trait;

use tokio::sync::mpsc;

/// Clock that only moves when told to.
#[derive(Debug)]
pub(crate) struct ManualClock {
    now_ms: AtomicI64,
}

impl ManualClock {
    pub(crate) fn new(now_ms: i64) -> Self {
        ManualClock {
            now_ms: AtomicI64::new(now_ms),
        }
    }

    pub(crate) fn set(&self, now_ms: i64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }

    pub(crate) fn advance(&self, by_ms: i64) {
        self.now_ms.fetch_add(by_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

/// Sender that only records what it was asked to send.
#[derive(Debug, Default)]
pub(crate) struct RecordingSender {
    sent: Mutex<Vec<(FleaseMessage, SocketAddr)>>,
}

impl RecordingSender {
    pub(crate) fn take(&self) -> Vec<(FleaseMessage, SocketAddr)> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }
}

impl MessageSender for RecordingSender {
    fn send_message(&self, msg: FleaseMessage, receiver: SocketAddr) {
        self.sent.lock().unwrap().push((msg, receiver));
    }
}

/// One status listener callback.
#[derive(Debug, Clone)]
pub(crate) enum StatusEvent {
    Changed(CellId, Lease),
    Failed(CellId, FleaseError),
}

/// Status listener forwarding every callback into a channel.
#[derive(Debug)]
pub(crate) struct RecordingListener {
    tx_event: mpsc::UnboundedSender<StatusEvent>,
}

impl RecordingListener {
    pub(crate) fn new_pair(
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<StatusEvent>) {
        let (tx_event, rx_event) = mpsc::unbounded_channel();
        (Arc::new(RecordingListener { tx_event }), rx_event)
    }
}

impl StatusListener for RecordingListener {
    fn status_changed(&self, cell: &CellId, lease: &Lease) {
        let _ = self
            .tx_event
            .send(StatusEvent::Changed(cell.clone(), lease.clone()));
    }

    fn lease_failed(&self, cell: &CellId, error: &FleaseError) {
        let _ = self
            .tx_event
            .send(StatusEvent::Failed(cell.clone(), error.clone()));
    }
}

#[derive(Debug, Default)]
pub(crate) struct RecordingViewListener {
    events: Mutex<Vec<(CellId, i32, bool)>>,
}

impl RecordingViewListener {
    pub(crate) fn events(&self) -> Vec<(CellId, i32, bool)> {
        self.events.lock().unwrap().clone()
    }
}

impl ViewChangeListener for RecordingViewListener {
    fn view_id_changed(&self, cell: &CellId, view_id: i32, on_proposal_side: bool) {
        self.events
            .lock()
            .unwrap()
            .push((cell.clone(), view_id, on_proposal_side));
    }
}

/// Fresh scratch directory path (not created) under the system temp dir.
pub(crate) fn temp_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir()
        .join(format!("flease-test-{}-{}", name, std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    dir
}

/// In-process network connecting the message inlets of several stages.
/// Nodes marked down neither send nor receive.
#[derive(Default)]
pub(crate) struct MemNetwork {
    inlets: Mutex<HashMap<SocketAddr, MessageInlet>>,
    down: Mutex<HashSet<SocketAddr>>,
}

impl MemNetwork {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn register(&self, addr: SocketAddr, inlet: MessageInlet) {
        self.inlets.lock().unwrap().insert(addr, inlet);
    }

    pub(crate) fn set_down(&self, addr: SocketAddr, down: bool) {
        let mut set = self.down.lock().unwrap();
        if down {
            set.insert(addr);
        } else {
            set.remove(&addr);
        }
    }

    /// Sender for the node listening on `me`.
    pub(crate) fn sender_for(self: &Arc<Self>, me: SocketAddr) -> Arc<MemSender> {
        Arc::new(MemSender {
            me,
            net: self.clone(),
        })
    }

    fn deliver(&self, from: SocketAddr, to: SocketAddr, mut msg: FleaseMessage) {
        {
            let down = self.down.lock().unwrap();
            if down.contains(&from) || down.contains(&to) {
                return;
            }
        }
        msg.sender = Some(from);
        if let Some(inlet) = self.inlets.lock().unwrap().get(&to) {
            let _ = inlet.receive_message(msg);
        }
    }
}

pub(crate) struct MemSender {
    me: SocketAddr,
    net: Arc<MemNetwork>,
}

impl MessageSender for MemSender {
    fn send_message(&self, msg: FleaseMessage, receiver: SocketAddr) {
        self.net.deliver(self.me, receiver, msg);
    }
}

/// Master-epoch store kept in memory.
#[derive(Debug, Default)]
pub(crate) struct MemEpochStore {
    epochs: Mutex<HashMap<CellId, i64>>,
}

impl MemEpochStore {
    pub(crate) fn stored(&self, cell: &CellId) -> Option<i64> {
        self.epochs.lock().unwrap().get(cell).copied()
    }

    pub(crate) fn preset(&self, cell: CellId, epoch: i64) {
        self.epochs.lock().unwrap().insert(cell, epoch);
    }
}

#[async_trait]
impl MasterEpochHandler for MemEpochStore {
    async fn send_master_epoch(
        &self,
        reply: &mut FleaseMessage,
    ) -> Result<(), FleaseError> {
        reply.master_epoch = self.stored(&reply.cell).unwrap_or(0);
        Ok(())
    }

    async fn store_master_epoch(
        &self,
        reply: &FleaseMessage,
    ) -> Result<(), FleaseError> {
        self.preset(reply.cell.clone(), reply.master_epoch);
        Ok(())
    }
}
