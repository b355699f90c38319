//! Lease stage: the public entry point, and the single coordinator task that
//! owns the queue, the timer heap and the lease-expiry heap and drives both
//! protocol roles.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::flease::lifecycle::wait_for_state;
use crate::flease::{
    Acceptor, CellId, Clock, EpochIo, ExpiryHeap, FleaseConfig, FleaseFuture,
    FleaseMessage, Lease, MasterEpochHandler, MessageInlet, MessageSender,
    MsgType, Proposer, Request, Responder, RoundCtx, StageInput, StageState,
    StatKind, StatsCollector, StatusListener, SummaryStats, TimerHeap,
    TokioClock, ViewChangeListener, IGNORE_MASTER_EPOCH, REQUEST_MASTER_EPOCH,
};
use crate::utils::{FleaseError, ME};

use tokio::sync::{mpsc, watch, Notify};
use tokio::task::{self, JoinHandle};
use tokio::time::{self, Duration, Instant, MissedTickBehavior};

/// Max number of queued items handled per loop iteration before timers are
/// checked again. Also the chunk size of `batch_open_cells`.
pub const MAX_BATCH_SIZE: usize = 20;

/// Upper bound on the coordinator's idle wait, in ms. Lease expiries are
/// swept this far ahead of time.
const TIMER_INTERVAL_MS: i64 = 50;

/// Interval of periodic statistics reports, in ms.
const STATS_REPORT_INTERVAL_MS: u64 = 10_000;

/// A lease manager node. Create with `new`, install optional collaborators
/// with the `with_*` builders, then `start` it.
pub struct FleaseStage {
    config: Arc<FleaseConfig>,
    clock: Arc<dyn Clock>,

    sender: Arc<dyn MessageSender>,
    listener: Arc<dyn StatusListener>,
    view_listener: Option<Arc<dyn ViewChangeListener>>,
    epoch_handler: Option<Arc<dyn MasterEpochHandler>>,
    stats: Option<Arc<dyn StatsCollector>>,

    /// Queue shared by API calls, inbound messages and deferred replies.
    tx_input: mpsc::UnboundedSender<StageInput>,
    rx_input: Option<mpsc::UnboundedReceiver<StageInput>>,

    /// Moved into the coordinator once started.
    tx_state: Option<watch::Sender<StageState>>,
    rx_state: watch::Receiver<StageState>,

    quit: Arc<Notify>,
    coordinator_handle: Option<JoinHandle<()>>,
}

impl FleaseStage {
    /// Creates a stage in state `Created`. Fails if the config is unsafe.
    pub fn new(
        config: FleaseConfig,
        sender: Arc<dyn MessageSender>,
        listener: Arc<dyn StatusListener>,
    ) -> Result<Self, FleaseError> {
        config.validate()?;
        let (tx_input, rx_input) = mpsc::unbounded_channel();
        let (tx_state, rx_state) = watch::channel(StageState::Created);
        let stats: Option<Arc<dyn StatsCollector>> = if config.collect_stats {
            Some(Arc::new(SummaryStats::new()))
        } else {
            None
        };

        Ok(FleaseStage {
            config: Arc::new(config),
            clock: Arc::new(TokioClock::new()),
            sender,
            listener,
            view_listener: None,
            epoch_handler: None,
            stats,
            tx_input,
            rx_input: Some(rx_input),
            tx_state: Some(tx_state),
            rx_state,
            quit: Arc::new(Notify::new()),
            coordinator_handle: None,
        })
    }

    /// Replaces the synchronized clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_view_listener(
        mut self,
        view_listener: Arc<dyn ViewChangeListener>,
    ) -> Self {
        self.view_listener = Some(view_listener);
        self
    }

    /// Installs the master-epoch store. Without one, epoch requests are
    /// answered with the request sentinel and nothing is persisted.
    pub fn with_epoch_handler(
        mut self,
        epoch_handler: Arc<dyn MasterEpochHandler>,
    ) -> Self {
        self.epoch_handler = Some(epoch_handler);
        self
    }

    pub fn with_stats(mut self, stats: Arc<dyn StatsCollector>) -> Self {
        self.stats = Some(stats);
        self
    }

    pub fn config(&self) -> &FleaseConfig {
        &self.config
    }

    /// Sets up the acceptor (lock file) and spawns the coordinator task.
    /// Returns once the stage is `Running`.
    pub async fn start(&mut self) -> Result<(), FleaseError> {
        let (Some(tx_state), Some(rx_input)) =
            (self.tx_state.take(), self.rx_input.take())
        else {
            return logged_err!("lease stage already started");
        };
        let _ = ME.set(self.config.identity.clone());
        tx_state.send_replace(StageState::Starting);

        let acceptor = match Acceptor::new_and_setup(
            self.config.clone(),
            self.clock.clone(),
            self.view_listener.clone(),
        )
        .await
        {
            Ok(acceptor) => acceptor,
            Err(e) => {
                pf_error!("acceptor setup failed: {}", e);
                tx_state.send_replace(StageState::Crashed(e.to_string()));
                return Err(e);
            }
        };
        let proposer = Proposer::new(
            self.config.clone(),
            self.clock.clone(),
            self.sender.clone(),
            self.listener.clone(),
            self.view_listener.clone(),
            self.epoch_handler.clone(),
            self.tx_input.clone(),
        );

        let coordinator = Coordinator {
            config: self.config.clone(),
            clock: self.clock.clone(),
            sender: self.sender.clone(),
            listener: self.listener.clone(),
            epoch_handler: self.epoch_handler.clone(),
            stats: self.stats.clone(),
            acceptor,
            proposer,
            timers: TimerHeap::new(),
            expiry: ExpiryHeap::new(),
            rx_input,
            tx_state,
            quit: self.quit.clone(),
        };
        self.coordinator_handle = Some(tokio::spawn(coordinator.run()));

        self.await_state(StageState::Running).await?;
        pf_info!("lease stage started");
        Ok(())
    }

    /// Stops the coordinator. Pending futures fail, the lock file is
    /// removed. Returns once the stage is `Stopped`.
    pub async fn stop(&mut self) -> Result<(), FleaseError> {
        let Some(handle) = self.coordinator_handle.take() else {
            return logged_err!("lease stage not running");
        };
        self.quit.notify_one();
        handle.await?;

        let state = self.rx_state.borrow().clone();
        match state {
            StageState::Stopped => {
                pf_info!("lease stage stopped");
                Ok(())
            }
            state => logged_err!("lease stage ended as {}", state),
        }
    }

    pub fn state(&self) -> StageState {
        self.rx_state.borrow().clone()
    }

    /// Waits until the stage reaches `target` (any reason for `Crashed`).
    pub async fn await_state(
        &self,
        target: StageState,
    ) -> Result<(), FleaseError> {
        let mut rx_state = self.rx_state.clone();
        wait_for_state(&mut rx_state, &target).await
    }

    pub fn subscribe_state(&self) -> watch::Receiver<StageState> {
        self.rx_state.clone()
    }

    /// Handle for the transport to deliver inbound messages with.
    pub fn message_inlet(&self) -> MessageInlet {
        MessageInlet::new(self.tx_input.clone())
    }

    /// Enqueues a message received from a peer.
    pub fn receive_message(&self, msg: FleaseMessage) -> Result<(), FleaseError> {
        self.message_inlet().receive_message(msg)
    }

    fn submit<T>(
        &self,
        make: impl FnOnce(Responder<T>) -> Request,
    ) -> FleaseFuture<T> {
        let (tx, fut) = FleaseFuture::new();
        if self.tx_input.send(StageInput::Request(make(tx))).is_err() {
            // responder dropped along with the request: the future fails
            pf_warn!("request submitted to a stopped lease stage");
        }
        fut
    }

    /// Opens a cell with the given remote acceptors and starts acquiring
    /// its lease. The future completes with the first lease learned for the
    /// cell (possibly held by another node), or fails if the cell gives up.
    pub fn open_cell(
        &self,
        cell: CellId,
        acceptors: Vec<SocketAddr>,
        request_master_epoch: bool,
        view_id: i32,
    ) -> FleaseFuture<Lease> {
        self.submit(|tx| Request::OpenCell {
            cell,
            acceptors,
            request_master_epoch,
            view_id,
            tx: Some(tx),
        })
    }

    /// Opens many cells sharing one acceptor set, yielding between chunks
    /// of `MAX_BATCH_SIZE` so a large batch does not flood the queue ahead
    /// of network traffic.
    pub async fn batch_open_cells(
        &self,
        cells: Vec<CellId>,
        acceptors: Vec<SocketAddr>,
        request_master_epoch: bool,
    ) -> Vec<FleaseFuture<Lease>> {
        let mut futs = Vec::with_capacity(cells.len());
        for (i, cell) in cells.into_iter().enumerate() {
            if i > 0 && i % MAX_BATCH_SIZE == 0 {
                task::yield_now().await;
            }
            futs.push(self.open_cell(
                cell,
                acceptors.clone(),
                request_master_epoch,
                0,
            ));
        }
        futs
    }

    /// Stops proposing for a cell. The local acceptor keeps serving it.
    pub fn close_cell(&self, cell: CellId) -> FleaseFuture<()> {
        self.submit(|tx| Request::CloseCell { cell, tx })
    }

    /// Sets the view of a cell on both roles; `VIEW_ID_INVALIDATED`
    /// invalidates the current view.
    pub fn set_view_id(&self, cell: CellId, view_id: i32) -> FleaseFuture<()> {
        self.submit(|tx| Request::SetView { cell, view_id, tx })
    }

    /// Hands the lease of a cell held by this node over to `new_owner`. The
    /// future completes once a lease held by `new_owner` is learned.
    pub fn handover_lease(
        &self,
        cell: CellId,
        new_owner: String,
    ) -> FleaseFuture<Lease> {
        self.submit(|tx| Request::HandoverLease {
            cell,
            new_owner,
            tx,
        })
    }

    /// Every cell known to the local acceptor and its learned lease.
    pub fn get_local_state(
        &self,
    ) -> FleaseFuture<HashMap<CellId, Option<Lease>>> {
        self.submit(|tx| Request::GetState { tx })
    }

    /// Human-readable state of one cell on both roles.
    pub fn dump_cell(&self, cell: CellId) -> FleaseFuture<String> {
        self.submit(|tx| Request::DumpCell { cell, tx })
    }

    /// The local acceptor's learned lease for a cell.
    pub fn local_lease(&self, cell: CellId) -> FleaseFuture<Option<Lease>> {
        self.submit(|tx| Request::LocalLease { cell, tx })
    }
}

impl Drop for FleaseStage {
    fn drop(&mut self) {
        if self.coordinator_handle.is_some() {
            self.quit.notify_one();
        }
    }
}

/// The coordinator task. Sole owner of all protocol state.
struct Coordinator {
    config: Arc<FleaseConfig>,
    clock: Arc<dyn Clock>,

    sender: Arc<dyn MessageSender>,
    listener: Arc<dyn StatusListener>,
    epoch_handler: Option<Arc<dyn MasterEpochHandler>>,
    stats: Option<Arc<dyn StatsCollector>>,

    acceptor: Acceptor,
    proposer: Proposer,
    timers: TimerHeap,
    expiry: ExpiryHeap,

    rx_input: mpsc::UnboundedReceiver<StageInput>,
    tx_state: watch::Sender<StageState>,
    quit: Arc<Notify>,
}

impl Coordinator {
    async fn run(mut self) {
        self.tx_state.send_replace(StageState::Running);

        let (final_state, err) = match self.run_loop().await {
            Ok(()) => {
                self.tx_state.send_replace(StageState::Stopping);
                (
                    StageState::Stopped,
                    FleaseError::msg("lease stage stopped"),
                )
            }
            Err(e) => {
                pf_error!("coordinator crashed: {}", e);
                (StageState::Crashed(e.to_string()), e)
            }
        };

        self.proposer.fail_all_waiters(&err);
        self.rx_input.close();
        while let Ok(input) = self.rx_input.try_recv() {
            if let StageInput::Request(req) = input {
                fail_request(req, &err);
            }
        }
        // a crashed stage keeps its lock file
        if final_state == StageState::Stopped {
            if let Err(e) = self.acceptor.shutdown().await {
                pf_error!("error removing lock file: {}", e);
            }
        }
        self.tx_state.send_replace(final_state);
    }

    async fn run_loop(&mut self) -> Result<(), FleaseError> {
        let mut stats_interval =
            time::interval(Duration::from_millis(STATS_REPORT_INTERVAL_MS));
        stats_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let stats_on = self.stats.is_some();

        loop {
            self.fire_due_timers()?;
            self.sweep_expired();

            let wait_ms = match self.timers.next_deadline() {
                Some(at) => (at - self.clock.now_ms()).clamp(0, TIMER_INTERVAL_MS),
                None => TIMER_INTERVAL_MS,
            };

            tokio::select! {
                biased;

                // stage stopping
                _ = self.quit.notified() => {
                    pf_debug!("coordinator asked to quit");
                    return Ok(());
                },

                // queued items, up to a batch
                input = self.rx_input.recv() => {
                    let Some(input) = input else {
                        return Ok(());
                    };
                    self.handle_input(input)?;
                    for _ in 1..MAX_BATCH_SIZE {
                        match self.rx_input.try_recv() {
                            Ok(input) => self.handle_input(input)?,
                            Err(_) => break,
                        }
                    }
                },

                // next timer, or the sweep interval
                _ = time::sleep(Duration::from_millis(wait_ms as u64)) => {},

                _ = stats_interval.tick(), if stats_on => {
                    self.report_stats();
                },
            }
        }
    }

    fn record(&self, kind: StatKind, started: Instant) {
        if let Some(stats) = &self.stats {
            stats.record(kind, started.elapsed());
        }
    }

    fn report_stats(&self) {
        if let Some(report) = self.stats.as_ref().and_then(|s| s.report()) {
            pf_info!(
                "stats: {} | timers {} expiries {}",
                report,
                self.timers.len(),
                self.expiry.len()
            );
        }
    }

    fn fire_due_timers(&mut self) -> Result<(), FleaseError> {
        let now = self.clock.now_ms();
        while let Some((at, event)) = self.timers.pop_due(now) {
            let started = Instant::now();
            pf_trace!("timer due at {} fired: {:?}", at, event);
            let mut ctx = RoundCtx {
                acceptor: &mut self.acceptor,
                timers: &mut self.timers,
            };
            self.proposer.process_message(&mut ctx, event)?;
            self.after_step();
            self.record(StatKind::Timer, started);
        }
        Ok(())
    }

    /// Expires every tracked lease timing out within the next interval plus
    /// the notification lead time.
    fn sweep_expired(&mut self) {
        let deadline = self.clock.now_ms()
            + TIMER_INTERVAL_MS
            + self.config.to_notification_ms as i64;
        while let Some(lease) = self.expiry.pop_due(deadline) {
            // superseded entries are skipped here
            if self.proposer.expire_lease(&mut self.timers, &lease) {
                pf_info!("lease {} of cell {} expired", lease, lease.cell);
                self.listener.status_changed(
                    &lease.cell,
                    &Lease::empty_for(lease.cell.clone()),
                );
            }
        }
    }

    fn handle_input(&mut self, input: StageInput) -> Result<(), FleaseError> {
        let started = Instant::now();
        let kind = match input {
            StageInput::Message(msg) => {
                self.handle_message(msg)?;
                StatKind::Message
            }
            StageInput::Request(req) => {
                self.handle_request(req)?;
                StatKind::Request
            }
        };
        self.after_step();
        self.record(kind, started);
        Ok(())
    }

    /// Applies what the last handler left behind in the acceptor: views
    /// bumped by incoming requests, then learned leases. Repeats until both
    /// are drained, since either may raise more.
    fn after_step(&mut self) {
        loop {
            let view_bumps = self.acceptor.drain_view_bumps();
            let learned = self.acceptor.drain_learned();
            if view_bumps.is_empty() && learned.is_empty() {
                return;
            }
            for (cell, view_id) in view_bumps {
                let mut ctx = RoundCtx {
                    acceptor: &mut self.acceptor,
                    timers: &mut self.timers,
                };
                self.proposer.abandon_round(&mut ctx, &cell, view_id);
            }
            for lease in learned {
                self.learned_event(lease);
            }
        }
    }

    fn learned_event(&mut self, lease: Lease) {
        let Some(old) = self.proposer.update_prev_lease(&lease) else {
            return;
        };
        if !lease.is_empty()
            && old.is_valid(self.clock.now_ms())
            && !old.is_same_holder(&lease)
        {
            pf_warn!(
                "cell {} changed holder while old lease valid: {} -> {}",
                lease.cell,
                old,
                lease
            );
        }
        pf_debug!("cell {} lease now {}", lease.cell, lease);
        self.listener.status_changed(&lease.cell, &lease);
        if !lease.is_empty() {
            self.expiry.push(lease);
        }
    }

    fn handle_message(&mut self, msg: FleaseMessage) -> Result<(), FleaseError> {
        if msg.msg_type.is_internal_event() {
            pf_error!("internal event received from outside, dropped: {:?}", msg);
            return Ok(());
        }

        if msg.msg_type.is_acceptor_message() {
            if let Some(reply) = self.acceptor.process_message(&msg) {
                match msg.sender {
                    Some(to) => self.send_acceptor_reply(&msg, reply, to),
                    None => pf_error!("no sender to reply to: {:?}", msg),
                }
            }
            Ok(())
        } else {
            let mut ctx = RoundCtx {
                acceptor: &mut self.acceptor,
                timers: &mut self.timers,
            };
            self.proposer.process_message(&mut ctx, msg)
        }
    }

    /// Sends an acceptor reply, first running the master-epoch operation it
    /// depends on (off this task) if the request asked for one.
    fn send_acceptor_reply(
        &self,
        request: &FleaseMessage,
        reply: FleaseMessage,
        to: SocketAddr,
    ) {
        let io = match reply.msg_type {
            MsgType::PrepareAck
                if request.master_epoch == REQUEST_MASTER_EPOCH =>
            {
                Some(EpochIo::Fetch)
            }
            MsgType::AcceptAck
                if request.master_epoch != IGNORE_MASTER_EPOCH =>
            {
                Some(EpochIo::Store)
            }
            _ => None,
        };

        match (io, &self.epoch_handler) {
            (None, _) => self.sender.send_message(reply, to),
            (Some(io), None) => {
                pf_error!(
                    "master epoch {:?} for cell {} without a handler",
                    io,
                    reply.cell
                );
                self.sender.send_message(reply, to);
            }
            (Some(io), Some(handler)) => {
                let handler = handler.clone();
                let sender = self.sender.clone();
                tokio::spawn(async move {
                    match io.run(handler.as_ref(), reply).await {
                        Ok(reply) => sender.send_message(reply, to),
                        Err(e) => pf_error!(
                            "master epoch {:?} failed, reply dropped: {}",
                            io,
                            e
                        ),
                    }
                });
            }
        }
    }

    fn handle_request(&mut self, req: Request) -> Result<(), FleaseError> {
        let mut ctx = RoundCtx {
            acceptor: &mut self.acceptor,
            timers: &mut self.timers,
        };
        match req {
            Request::OpenCell {
                cell,
                acceptors,
                request_master_epoch,
                view_id,
                tx,
            } => {
                pf_debug!(
                    "open cell {} with {} acceptors",
                    cell,
                    acceptors.len()
                );
                if self.proposer.cell_state(&cell).is_none() {
                    ctx.acceptor.set_view_id(&cell, view_id);
                }
                self.proposer.open_cell(
                    &mut ctx,
                    cell,
                    acceptors,
                    request_master_epoch,
                    view_id,
                    tx,
                )
            }

            Request::CloseCell { cell, tx } => {
                if !self.proposer.close_cell(&cell) {
                    pf_debug!("close of cell {} that was not open", cell);
                }
                let _ = tx.send(Ok(()));
                Ok(())
            }

            Request::HandoverLease {
                cell,
                new_owner,
                tx,
            } => self.proposer.handover(&mut ctx, &cell, new_owner, tx),

            Request::SetView { cell, view_id, tx } => {
                pf_debug!("set view of cell {} to {}", cell, view_id);
                self.proposer.set_view_id(&cell, view_id);
                ctx.acceptor.set_view_id(&cell, view_id);
                let _ = tx.send(Ok(()));
                Ok(())
            }

            Request::GetState { tx } => {
                let _ = tx.send(Ok(ctx.acceptor.local_state()));
                Ok(())
            }

            Request::DumpCell { cell, tx } => {
                let proposer = self
                    .proposer
                    .dump_cell(&cell)
                    .unwrap_or_else(|| "not open".into());
                let _ = tx.send(Ok(format!(
                    "A {}{} | P {}",
                    ctx.acceptor.dump_cell(&cell),
                    if ctx.acceptor.in_recovery() { " (recovering)" } else { "" },
                    proposer
                )));
                Ok(())
            }

            Request::LocalLease { cell, tx } => {
                let lease = ctx.acceptor.local_lease_info(&cell).map(|m| m.lease());
                let _ = tx.send(Ok(lease));
                Ok(())
            }
        }
    }
}

/// Fails a request that will never be handled.
fn fail_request(req: Request, err: &FleaseError) {
    match req {
        Request::OpenCell { tx, .. } => {
            if let Some(tx) = tx {
                let _ = tx.send(Err(err.clone()));
            }
        }
        Request::CloseCell { tx, .. } | Request::SetView { tx, .. } => {
            let _ = tx.send(Err(err.clone()));
        }
        Request::HandoverLease { tx, .. } => {
            let _ = tx.send(Err(err.clone()));
        }
        Request::GetState { tx } => {
            let _ = tx.send(Err(err.clone()));
        }
        Request::DumpCell { tx, .. } => {
            let _ = tx.send(Err(err.clone()));
        }
        Request::LocalLease { tx, .. } => {
            let _ = tx.send(Err(err.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flease::testkit::{
        temp_dir, MemEpochStore, MemNetwork, RecordingListener,
        RecordingSender, RecordingViewListener, StatusEvent,
    };
    use crate::flease::{ProposalNumber, VIEW_ID_INVALIDATED};

    const LEASE_MS: u64 = 15000;
    const DMAX_MS: u64 = 1000;
    const MSG_TIMEOUT_MS: u64 = 500;

    struct Node {
        stage: FleaseStage,
        rx_event: mpsc::UnboundedReceiver<StatusEvent>,
    }

    struct Cluster {
        net: Arc<MemNetwork>,
        clock: Arc<TokioClock>,
        nodes: Vec<Node>,
    }

    fn addr(i: usize) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 40000 + i as u16))
    }

    /// Remote acceptors of node `me`.
    fn peers(n: usize, me: usize) -> Vec<SocketAddr> {
        (0..n).filter(|&i| i != me).map(addr).collect()
    }

    fn cell() -> CellId {
        CellId::from("C")
    }

    async fn cluster(
        n: usize,
        customize: impl Fn(usize, FleaseStage) -> FleaseStage,
    ) -> Cluster {
        let net = MemNetwork::new();
        let clock = Arc::new(TokioClock::new());
        let mut nodes = vec![];
        for i in 0..n {
            let config = FleaseConfig::new(
                format!("osd-{}", i),
                LEASE_MS,
                DMAX_MS,
                MSG_TIMEOUT_MS,
            )
            .unwrap();
            let (listener, rx_event) = RecordingListener::new_pair();
            let stage =
                FleaseStage::new(config, net.sender_for(addr(i)), listener)
                    .unwrap()
                    .with_clock(clock.clone());
            let mut stage = customize(i, stage);
            net.register(addr(i), stage.message_inlet());
            stage.start().await.unwrap();
            nodes.push(Node { stage, rx_event });
        }
        Cluster { net, clock, nodes }
    }

    async fn next_event(node: &mut Node) -> StatusEvent {
        time::timeout(Duration::from_secs(120), node.rx_event.recv())
            .await
            .expect("no status event in time")
            .expect("listener channel closed")
    }

    async fn next_lease(node: &mut Node) -> Lease {
        match next_event(node).await {
            StatusEvent::Changed(id, lease) => {
                assert_eq!(id, cell());
                lease
            }
            StatusEvent::Failed(id, e) => {
                panic!("lease of {} failed: {}", id, e)
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn single_holder_then_takeover() -> Result<(), FleaseError> {
        let mut c = cluster(3, |_, s| s).await;
        let t0 = c.clock.now_ms();

        let lease = c.nodes[0]
            .stage
            .open_cell(cell(), peers(3, 0), false, 0)
            .wait()
            .await?;
        assert!(lease.is_held_by("osd-0"));
        assert!(lease.timeout_ms >= t0 + LEASE_MS as i64);
        assert!(lease.timeout_ms <= t0 + LEASE_MS as i64 + 1000);
        assert_eq!(lease.master_epoch, IGNORE_MASTER_EPOCH);
        assert_eq!(next_lease(&mut c.nodes[0]).await, lease);
        time::sleep(Duration::from_millis(100)).await;
        assert!(c.nodes[0].rx_event.try_recv().is_err());
        assert!(c.nodes[1].rx_event.try_recv().is_err());
        assert_eq!(
            c.nodes[2].stage.local_lease(cell()).wait().await?,
            Some(lease.clone())
        );

        // the holder disappears, another node takes over once the old lease
        // cannot be valid anywhere anymore
        c.net.set_down(addr(0), true);
        let wait_ms = lease.timeout_ms + DMAX_MS as i64 + 100 - c.clock.now_ms();
        time::sleep(Duration::from_millis(wait_ms as u64)).await;
        let taken = c.nodes[1]
            .stage
            .open_cell(cell(), peers(3, 1), false, 0)
            .wait()
            .await?;
        assert!(taken.is_held_by("osd-1"));
        assert!(taken.timeout_ms > lease.timeout_ms);
        assert_eq!(next_lease(&mut c.nodes[1]).await, taken);

        for node in &mut c.nodes {
            node.stage.stop().await?;
        }
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn holder_renews_before_timeout() -> Result<(), FleaseError> {
        let mut c = cluster(3, |_, s| s).await;
        let lease = c.nodes[0]
            .stage
            .open_cell(cell(), peers(3, 0), false, 0)
            .wait()
            .await?;
        assert_eq!(next_lease(&mut c.nodes[0]).await, lease);

        let renewed = next_lease(&mut c.nodes[0]).await;
        assert!(renewed.is_held_by("osd-0"));
        assert!(renewed.timeout_ms > lease.timeout_ms);
        assert!(c.clock.now_ms() < lease.timeout_ms - DMAX_MS as i64);
        let again = next_lease(&mut c.nodes[0]).await;
        assert!(again.is_held_by("osd-0"));
        assert!(again.timeout_ms > renewed.timeout_ms);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_then_cooldown() -> Result<(), FleaseError> {
        let mut c = cluster(3, |_, s| s).await;
        let lease = c.nodes[0]
            .stage
            .open_cell(cell(), peers(3, 0), false, 0)
            .wait()
            .await?;
        // a follower opening the cell is served from its acceptor's state
        let seen = c.nodes[1]
            .stage
            .open_cell(cell(), peers(3, 1), false, 0)
            .wait()
            .await?;
        assert_eq!(seen, lease);
        assert_eq!(next_lease(&mut c.nodes[1]).await, lease);

        c.net.set_down(addr(0), true);
        let expired = next_lease(&mut c.nodes[1]).await;
        assert!(expired.is_empty());
        assert!(c.clock.now_ms() >= lease.timeout_ms - TIMER_INTERVAL_MS);

        // exactly one EMPTY, then the follower's own lease, proposed no
        // earlier than dmax after the expiry
        let taken = next_lease(&mut c.nodes[1]).await;
        assert!(taken.is_held_by("osd-1"));
        assert!(
            taken.timeout_ms
                >= lease.timeout_ms + (DMAX_MS + LEASE_MS) as i64
        );
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn master_epoch_exceeds_stored() -> Result<(), FleaseError> {
        let stores: Vec<Arc<MemEpochStore>> =
            (0..3).map(|_| Arc::new(MemEpochStore::default())).collect();
        // a majority durably stored the previous owner's epoch
        stores[1].preset(cell(), 5);
        stores[2].preset(cell(), 5);
        let handlers = stores.clone();
        let mut c = cluster(3, move |i, s| {
            s.with_epoch_handler(handlers[i].clone())
        })
        .await;

        let lease = c.nodes[0]
            .stage
            .open_cell(cell(), peers(3, 0), true, 0)
            .wait()
            .await?;
        assert!(lease.is_held_by("osd-0"));
        assert_eq!(lease.master_epoch, 6);
        let stored = stores
            .iter()
            .filter(|s| s.stored(&cell()) == Some(6))
            .count();
        assert!(stored >= 2);
        assert_eq!(next_lease(&mut c.nodes[0]).await.master_epoch, 6);

        // the holder keeps its fencing epoch across renewals
        for _ in 0..2 {
            let renewed = next_lease(&mut c.nodes[0]).await;
            assert!(renewed.is_held_by("osd-0"));
            assert!(renewed.timeout_ms > lease.timeout_ms);
            assert_eq!(renewed.master_epoch, 6);
        }
        assert!(stores.iter().all(|s| s.stored(&cell()) != Some(7)));
        Ok(())
    }

    /// Collects every non-empty lease reported on any node during `for_ms`,
    /// with the time it was observed.
    async fn observe_leases(c: &mut Cluster, for_ms: u64) -> Vec<(i64, Lease)> {
        let mut seen = vec![];
        let end = c.clock.now_ms() + for_ms as i64;
        while c.clock.now_ms() < end {
            time::sleep(Duration::from_millis(10)).await;
            let now = c.clock.now_ms();
            for node in &mut c.nodes {
                while let Ok(event) = node.rx_event.try_recv() {
                    if let StatusEvent::Changed(_, lease) = event {
                        if !lease.is_empty() {
                            seen.push((now, lease));
                        }
                    }
                }
            }
        }
        seen
    }

    /// No two leases with different holders are valid at the same time.
    fn assert_disjoint_holders(seen: &[(i64, Lease)]) {
        for (seen_a, a) in seen {
            for (seen_b, b) in seen {
                if a.is_same_holder(b) {
                    continue;
                }
                assert!(
                    a.timeout_ms <= *seen_b || b.timeout_ms <= *seen_a,
                    "overlapping holders: {} seen at {}, {} seen at {}",
                    a,
                    seen_a,
                    b,
                    seen_b
                );
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_opens_single_holder() -> Result<(), FleaseError> {
        let mut c = cluster(3, |_, s| s).await;
        let opens: Vec<_> = (0..3)
            .map(|i| c.nodes[i].stage.open_cell(cell(), peers(3, i), false, 0))
            .collect();

        let seen = observe_leases(&mut c, 4 * LEASE_MS).await;
        assert!(!seen.is_empty());
        assert_disjoint_holders(&seen);
        // the first holder keeps renewing, nobody takes over
        assert!(seen.iter().all(|(_, l)| l.is_same_holder(&seen[0].1)));
        for mut open in opens {
            assert!(open.try_get().is_some());
        }
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_opens_with_acceptor_down() -> Result<(), FleaseError> {
        let mut c = cluster(3, |_, s| s).await;
        c.net.set_down(addr(2), true);
        let _opens: Vec<_> = (0..2)
            .map(|i| c.nodes[i].stage.open_cell(cell(), peers(3, i), false, 0))
            .collect();

        let seen = observe_leases(&mut c, 4 * LEASE_MS).await;
        assert!(!seen.is_empty());
        assert_disjoint_holders(&seen);
        assert!(seen
            .iter()
            .all(|(_, l)| l.is_held_by("osd-0") || l.is_held_by("osd-1")));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn handover_to_other_node() -> Result<(), FleaseError> {
        let mut c = cluster(3, |_, s| s).await;
        let lease = c.nodes[0]
            .stage
            .open_cell(cell(), peers(3, 0), false, 0)
            .wait()
            .await?;
        assert_eq!(next_lease(&mut c.nodes[0]).await, lease);

        let handed = c.nodes[0]
            .stage
            .handover_lease(cell(), "osd-1".into())
            .wait()
            .await?;
        assert!(handed.is_held_by("osd-1"));
        assert!(handed.timeout_ms > c.clock.now_ms());
        // the outgoing holder first drops its own lease
        assert!(next_lease(&mut c.nodes[0]).await.is_empty());
        assert_eq!(next_lease(&mut c.nodes[0]).await, handed);
        assert_eq!(
            c.nodes[2].stage.local_lease(cell()).wait().await?,
            Some(handed)
        );

        // not the holder anymore
        assert!(c.nodes[0]
            .stage
            .handover_lease(cell(), "osd-2".into())
            .wait()
            .await
            .is_err());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn higher_remote_view_adopted() -> Result<(), FleaseError> {
        let view_listener = Arc::new(RecordingViewListener::default());
        let vl = view_listener.clone();
        let mut c = cluster(3, move |i, s| {
            if i == 0 {
                s.with_view_listener(vl.clone())
            } else {
                s
            }
        })
        .await;
        for node in &c.nodes[1..] {
            node.stage.set_view_id(cell(), 3).wait().await?;
        }

        let lease = c.nodes[0]
            .stage
            .open_cell(cell(), peers(3, 0), false, 0)
            .wait()
            .await?;
        assert!(lease.is_held_by("osd-0"));
        assert!(view_listener.events().contains(&(cell(), 3, true)));
        assert_eq!(next_lease(&mut c.nodes[0]).await, lease);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn invalidated_view_blocks_quorum() -> Result<(), FleaseError> {
        let mut c = cluster(3, |_, s| s).await;
        for node in &c.nodes[1..] {
            node.stage
                .set_view_id(cell(), VIEW_ID_INVALIDATED)
                .wait()
                .await?;
        }
        let result = c.nodes[0]
            .stage
            .open_cell(cell(), peers(3, 0), false, 0)
            .wait()
            .await;
        assert!(result.is_err());
        assert!(matches!(
            next_event(&mut c.nodes[0]).await,
            StatusEvent::Failed(..)
        ));
        Ok(())
    }

    fn single_config(lockfile_dir: Option<String>) -> FleaseConfig {
        let mut config =
            FleaseConfig::new("osd-0", LEASE_MS, DMAX_MS, MSG_TIMEOUT_MS)
                .unwrap();
        config.lockfile_dir = lockfile_dir;
        config.collect_stats = true;
        config
    }

    #[tokio::test(start_paused = true)]
    async fn lifecycle_and_lock_file() -> Result<(), FleaseError> {
        let dir = temp_dir("stage-lifecycle");
        let config = single_config(Some(dir.to_string_lossy().into()));
        let lockfile = dir.join(format!("flease_lock.{}", config.sender_id()));
        let (listener, _rx_event) = RecordingListener::new_pair();
        let mut stage = FleaseStage::new(
            config,
            Arc::new(RecordingSender::default()),
            listener,
        )?;
        assert_eq!(stage.state(), StageState::Created);
        assert!(stage.stop().await.is_err());

        stage.start().await?;
        assert_eq!(stage.state(), StageState::Running);
        assert!(lockfile.exists());
        assert!(stage.start().await.is_err());

        // no remote acceptors: the local one is a quorum of its own
        let lease = stage.open_cell(cell(), vec![], false, 0).wait().await?;
        assert!(lease.is_held_by("osd-0"));
        let dump = stage.dump_cell(cell()).wait().await?;
        assert!(dump.contains("osd-0"));
        let state = stage.get_local_state().wait().await?;
        assert_eq!(state.get(&cell()), Some(&Some(lease)));

        stage.stop().await?;
        assert_eq!(stage.state(), StageState::Stopped);
        assert!(!lockfile.exists());
        assert!(stage
            .open_cell(CellId::from("D"), vec![], false, 0)
            .wait()
            .await
            .is_err());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn outside_events_and_close() -> Result<(), FleaseError> {
        let (listener, _rx_event) = RecordingListener::new_pair();
        let sender = Arc::new(RecordingSender::default());
        let mut stage =
            FleaseStage::new(single_config(None), sender.clone(), listener)?;
        stage.start().await?;

        let mut event = FleaseMessage::event(
            MsgType::EventRestart,
            cell(),
            ProposalNumber::new(1, 1),
        );
        assert!(stage.receive_message(event.clone()).is_err());
        event.sender = Some(addr(9));
        stage.receive_message(event)?;
        assert!(stage.get_local_state().wait().await?.is_empty());
        assert_eq!(stage.state(), StageState::Running);

        // a remote PREPARE is answered even without an open cell
        let mut prepare = FleaseMessage::new(MsgType::Prepare, cell());
        prepare.ballot = ProposalNumber::new(7, 1);
        prepare.send_timestamp_ms = stage.clock.now_ms();
        prepare.sender = Some(addr(9));
        stage.receive_message(prepare)?;
        stage.get_local_state().wait().await?;
        let sent = sender.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0.msg_type, MsgType::PrepareAck);
        assert_eq!(sent[0].1, addr(9));

        stage.open_cell(cell(), vec![], false, 0).wait().await?;
        stage.close_cell(cell()).wait().await?;
        stage.close_cell(cell()).wait().await?;
        assert!(stage
            .handover_lease(cell(), "osd-1".into())
            .wait()
            .await
            .is_err());
        stage.stop().await?;
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn batch_open_many_cells() -> Result<(), FleaseError> {
        let (listener, _rx_event) = RecordingListener::new_pair();
        let mut stage = FleaseStage::new(
            single_config(None),
            Arc::new(RecordingSender::default()),
            listener,
        )?;
        stage.start().await?;
        let cells: Vec<CellId> = (0..45)
            .map(|i| CellId::from(format!("cell-{}", i)))
            .collect();
        let futs = stage.batch_open_cells(cells, vec![], false).await;
        assert_eq!(futs.len(), 45);
        for fut in futs {
            assert!(fut.wait().await?.is_held_by("osd-0"));
        }
        assert_eq!(stage.get_local_state().wait().await?.len(), 45);
        stage.stop().await?;
        Ok(())
    }
}
