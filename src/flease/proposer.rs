//! Flease proposer: the active role running Paxos rounds to acquire, renew
//! and hand over leases.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::flease::{
    Acceptor, CellId, Clock, EpochIo, FleaseConfig, FleaseMessage, Lease,
    MasterEpochHandler, MessageSender, MsgType, ProposalNumber, Responder,
    StageInput, StatusListener, TimerHeap, ViewChangeListener,
    IGNORE_MASTER_EPOCH, REQUEST_MASTER_EPOCH, VIEW_ID_INVALIDATED,
};
use crate::utils::{Bitmap, FleaseError};

use rand::prelude::*;

use tokio::sync::mpsc;

/// Round phase of a proposer cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CellState {
    Idle,
    WaitForPrepAck,
    WaitForAcceptAck,
}

/// Coordinator-owned state a round touches besides the proposer itself.
pub(crate) struct RoundCtx<'a> {
    pub(crate) acceptor: &'a mut Acceptor,
    pub(crate) timers: &'a mut TimerHeap,
}

/// Future waiting for a lease; `Some(holder)` only resolves on a lease held
/// by that identity.
type Waiter = (Option<String>, Responder<Lease>);

/// Per-cell proposer state.
struct ProposerCell {
    id: CellId,

    /// Remote acceptors; the local acceptor is implicitly the last member.
    acceptors: Vec<SocketAddr>,

    state: CellState,
    ballot: ProposalNumber,

    /// Last PREPARE/ACCEPT/LEARN sent in the current round.
    msg_sent: Option<FleaseMessage>,

    responses: Vec<FleaseMessage>,

    /// Acceptors that answered the current phase; index `acceptors.len()`
    /// stands for the local one.
    responded: Bitmap,

    num_failures: u32,

    /// Whether the cell was opened asking for master epochs.
    open_request_master_epoch: bool,

    /// Whether the next round asks for master epochs; off for renewals.
    request_master_epoch: bool,

    /// Epoch won at acquisition, kept by renewals of the same ownership.
    master_epoch: i64,

    view_id: i32,
    view_invalidated: bool,

    last_prepare_ms: i64,

    handover_to: Option<String>,

    /// Last lease learned for this cell, as reported to the listener.
    prev_lease: Lease,

    waiters: Vec<Waiter>,
}

impl ProposerCell {
    fn new(
        id: CellId,
        acceptors: Vec<SocketAddr>,
        request_master_epoch: bool,
        view_id: i32,
        sender_id: u64,
    ) -> Result<Self, FleaseError> {
        let population = u8::try_from(acceptors.len() + 1).map_err(|_| {
            FleaseError::msg(format!(
                "too many acceptors for cell {}: {}",
                id,
                acceptors.len()
            ))
        })?;
        Ok(ProposerCell {
            prev_lease: Lease::empty_for(id.clone()),
            id,
            acceptors,
            state: CellState::Idle,
            ballot: ProposalNumber::new(0, sender_id),
            msg_sent: None,
            responses: vec![],
            responded: Bitmap::new(population)?,
            num_failures: 0,
            open_request_master_epoch: request_master_epoch,
            request_master_epoch,
            master_epoch: IGNORE_MASTER_EPOCH,
            view_id: if view_id == VIEW_ID_INVALIDATED { 0 } else { view_id },
            view_invalidated: view_id == VIEW_ID_INVALIDATED,
            last_prepare_ms: 0,
            handover_to: None,
            waiters: vec![],
        })
    }

    /// Epoch attached to ACCEPT and LEARN messages of this cell.
    fn carried_epoch(&self) -> i64 {
        if self.open_request_master_epoch {
            self.master_epoch
        } else {
            IGNORE_MASTER_EPOCH
        }
    }

    fn reset_responses(&mut self) {
        self.responses.clear();
        self.responded.clear();
    }

    fn restart_event(&self) -> FleaseMessage {
        FleaseMessage::event(MsgType::EventRestart, self.id.clone(), self.ballot)
    }

    fn resolve_waiters(&mut self, lease: &Lease) {
        let (done, pending): (Vec<Waiter>, Vec<Waiter>) =
            self.waiters.drain(..).partition(|(holder, _)| match holder {
                Some(holder) => lease.is_held_by(holder),
                None => true,
            });
        self.waiters = pending;
        for (_, tx) in done {
            let _ = tx.send(Ok(lease.clone()));
        }
    }

    fn fail_waiters(&mut self, err: &FleaseError) {
        for (_, tx) in self.waiters.drain(..) {
            let _ = tx.send(Err(err.clone()));
        }
    }
}

impl fmt::Display for ProposerCell {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "cell={} state={:?} ballot={} failures={} view={}{} \
             handover_to={} prev={}",
            self.id,
            self.state,
            self.ballot,
            self.num_failures,
            self.view_id,
            if self.view_invalidated { "(invalidated)" } else { "" },
            self.handover_to.as_deref().unwrap_or("-"),
            self.prev_lease
        )
    }
}

/// Collaborators and settings shared by all cells.
struct ProposerEnv {
    config: Arc<FleaseConfig>,
    clock: Arc<dyn Clock>,
    sender_id: u64,

    sender: Arc<dyn MessageSender>,
    listener: Arc<dyn StatusListener>,
    view_listener: Option<Arc<dyn ViewChangeListener>>,
    epoch_handler: Option<Arc<dyn MasterEpochHandler>>,

    /// Sender side of the coordinator queue, for deferred local replies.
    tx_input: mpsc::UnboundedSender<StageInput>,
}

/// The proposer module. Owned and driven exclusively by the coordinator.
pub(crate) struct Proposer {
    env: ProposerEnv,
    cells: HashMap<CellId, ProposerCell>,
}

impl Proposer {
    pub(crate) fn new(
        config: Arc<FleaseConfig>,
        clock: Arc<dyn Clock>,
        sender: Arc<dyn MessageSender>,
        listener: Arc<dyn StatusListener>,
        view_listener: Option<Arc<dyn ViewChangeListener>>,
        epoch_handler: Option<Arc<dyn MasterEpochHandler>>,
        tx_input: mpsc::UnboundedSender<StageInput>,
    ) -> Self {
        Proposer {
            env: ProposerEnv {
                sender_id: config.sender_id(),
                config,
                clock,
                sender,
                listener,
                view_listener,
                epoch_handler,
                tx_input,
            },
            cells: HashMap::new(),
        }
    }

    /// Registers a cell and starts acquiring its lease. Opening an already
    /// open cell fails the request and reports the failure to the listener.
    pub(crate) fn open_cell(
        &mut self,
        ctx: &mut RoundCtx,
        id: CellId,
        acceptors: Vec<SocketAddr>,
        request_master_epoch: bool,
        view_id: i32,
        waiter: Option<Responder<Lease>>,
    ) -> Result<(), FleaseError> {
        let new_cell = if self.cells.contains_key(&id) {
            Err(FleaseError::msg(format!("cell {} already opened", id)))
        } else {
            ProposerCell::new(
                id.clone(),
                acceptors,
                request_master_epoch,
                view_id,
                self.env.sender_id,
            )
        };
        let mut cell = match new_cell {
            Ok(cell) => cell,
            Err(err) => {
                pf_warn!("P cannot open cell {}: {}", id, err);
                self.env.listener.lease_failed(&id, &err);
                if let Some(tx) = waiter {
                    let _ = tx.send(Err(err));
                }
                return Ok(());
            }
        };

        if let Some(tx) = waiter {
            cell.waiters.push((None, tx));
        }
        pf_debug!("P created new cell {}", id);
        let cell = self.cells.entry(id).or_insert(cell);
        self.env.acquire_lease(cell, ctx)
    }

    /// Stops handling a cell on the proposer side. Pending futures fail.
    pub(crate) fn close_cell(&mut self, id: &CellId) -> bool {
        match self.cells.remove(id) {
            Some(mut cell) => {
                cell.fail_waiters(&FleaseError::msg(format!(
                    "cell {} closed",
                    id
                )));
                true
            }
            None => false,
        }
    }

    /// Sets (or invalidates) the view of an open cell.
    pub(crate) fn set_view_id(&mut self, id: &CellId, view_id: i32) {
        if let Some(cell) = self.cells.get_mut(id) {
            if view_id == VIEW_ID_INVALIDATED {
                cell.view_invalidated = true;
            } else {
                cell.view_id = view_id;
                cell.view_invalidated = false;
            }
        }
    }

    /// Hands the held lease of a cell over to `new_owner`. `tx` completes
    /// when a lease held by `new_owner` is learned.
    pub(crate) fn handover(
        &mut self,
        ctx: &mut RoundCtx,
        id: &CellId,
        new_owner: String,
        tx: Responder<Lease>,
    ) -> Result<(), FleaseError> {
        let Some(cell) = self.cells.get_mut(id) else {
            let _ = tx.send(Err(FleaseError::msg(format!(
                "cannot handover lease, cell {} not opened",
                id
            ))));
            return Ok(());
        };
        if let Err(err) = self.env.check_owner(cell, ctx.acceptor, "handover") {
            pf_warn!("P {}", err);
            let _ = tx.send(Err(err));
            return Ok(());
        }

        // no self-renewal of the outgoing lease from here on
        cell.handover_to = Some(new_owner.clone());
        cell.waiters.push((Some(new_owner.clone()), tx));
        pf_info!("P handing over cell {} to {}", id, new_owner);

        if cell.state == CellState::Idle {
            // the EMPTY learn event clears the cached lease
            ctx.acceptor.raise_learned(Lease::empty_for(id.clone()));
            self.env.start_prepare(cell, ctx, new_owner)?;
        } else {
            cell.prev_lease = Lease::empty_for(id.clone());
        }
        Ok(())
    }

    /// Entry point for proposer replies and internal timer events.
    pub(crate) fn process_message(
        &mut self,
        ctx: &mut RoundCtx,
        msg: FleaseMessage,
    ) -> Result<(), FleaseError> {
        let Some(cell) = self.cells.get_mut(&msg.cell) else {
            pf_msg!(
                self.env.config,
                "P drop message for unknown cell {} from {:?}",
                msg.cell,
                msg.sender
            );
            return Ok(());
        };

        if !msg.msg_type.is_internal_event() {
            if cell.view_invalidated {
                pf_msg!(
                    self.env.config,
                    "P drop message, view of cell {} is invalidated",
                    cell.id
                );
                return Ok(());
            }
            if cell.view_id > msg.view_id {
                pf_msg!(
                    self.env.config,
                    "P drop message of outdated view for cell {}: local {}, \
                     remote {}",
                    cell.id,
                    cell.view_id,
                    msg.view_id
                );
                return Ok(());
            }
            if cell.view_id < msg.view_id {
                pf_info!(
                    "P cell {} view changed {} -> {}",
                    cell.id,
                    cell.view_id,
                    msg.view_id
                );
                cell.view_id = msg.view_id;
                if let Some(listener) = &self.env.view_listener {
                    listener.view_id_changed(&cell.id, msg.view_id, true);
                }
                if cell.state != CellState::Idle {
                    self.env.cancel(
                        cell,
                        ctx,
                        FleaseError::msg(format!(
                            "view changed to {}",
                            msg.view_id
                        )),
                        0,
                    );
                }
                return Ok(());
            }
        }

        match cell.state {
            CellState::Idle => match msg.msg_type {
                MsgType::EventRestart | MsgType::EventRenew
                    if msg.ballot < cell.ballot =>
                {
                    pf_msg!(self.env.config, "P drop stale event {:?}", msg);
                    Ok(())
                }
                MsgType::EventRestart => {
                    pf_msg!(self.env.config, "P restart event: {:?}", msg);
                    cell.request_master_epoch = cell.open_request_master_epoch;
                    let holder = cell
                        .handover_to
                        .clone()
                        .unwrap_or_else(|| self.env.config.identity.clone());
                    self.env.start_prepare(cell, ctx, holder)
                }
                MsgType::EventRenew => {
                    pf_msg!(self.env.config, "P renew event: {:?}", msg);
                    self.env.renew_lease(cell, ctx)
                }
                _ => {
                    pf_msg!(
                        self.env.config,
                        "P dropped message in state Idle: {:?}",
                        msg
                    );
                    Ok(())
                }
            },
            CellState::WaitForPrepAck => {
                self.env.process_prepare_response(cell, ctx, msg)
            }
            CellState::WaitForAcceptAck => {
                self.env.process_accept_response(cell, ctx, msg)
            }
        }
    }

    /// Records a newly learned lease for an open cell. Returns the replaced
    /// lease if it differs from the new one, `None` if unchanged or if the
    /// cell is not open here.
    pub(crate) fn update_prev_lease(&mut self, lease: &Lease) -> Option<Lease> {
        let cell = self.cells.get_mut(&lease.cell)?;
        if !lease.is_empty() {
            if cell.handover_to.is_some() && cell.handover_to == lease.holder {
                cell.handover_to = None;
            }
            cell.resolve_waiters(lease);
        }
        if cell.prev_lease == *lease {
            return None;
        }
        Some(std::mem::replace(&mut cell.prev_lease, lease.clone()))
    }

    /// Current lease of an open cell.
    pub(crate) fn prev_lease(&self, id: &CellId) -> Option<&Lease> {
        self.cells.get(id).map(|c| &c.prev_lease)
    }

    /// Expires `lease` if it is still the current lease of its cell, and
    /// schedules a new round no earlier than `dmax` after its timeout.
    pub(crate) fn expire_lease(&mut self, timers: &mut TimerHeap, lease: &Lease) -> bool {
        let Some(cell) = self.cells.get_mut(&lease.cell) else {
            return false;
        };
        if cell.prev_lease.is_empty() || cell.prev_lease != *lease {
            return false;
        }
        cell.prev_lease = Lease::empty_for(cell.id.clone());
        let now = self.env.clock.now_ms();
        let restart_at = now.max(lease.timeout_ms) + self.env.config.dmax();
        timers.schedule(restart_at, cell.restart_event());
        pf_debug!("P lease {} expired, restart at {}", lease, restart_at);
        true
    }

    /// Abandons the in-flight round of a cell after the local acceptor saw
    /// a higher view for it.
    pub(crate) fn abandon_round(&mut self, ctx: &mut RoundCtx, id: &CellId, view_id: i32) {
        if let Some(cell) = self.cells.get_mut(id) {
            if view_id > cell.view_id {
                cell.view_id = view_id;
            }
            if cell.state != CellState::Idle {
                self.env.cancel(
                    cell,
                    ctx,
                    FleaseError::msg(format!(
                        "round abandoned, acceptor saw view {}",
                        view_id
                    )),
                    0,
                );
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn current_ballot(&self, id: &CellId) -> Option<ProposalNumber> {
        self.cells.get(id).map(|c| c.ballot)
    }

    pub(crate) fn cell_state(&self, id: &CellId) -> Option<CellState> {
        self.cells.get(id).map(|c| c.state)
    }

    /// Proposer-side state of a cell, for diagnostics.
    pub(crate) fn dump_cell(&self, id: &CellId) -> Option<String> {
        self.cells.get(id).map(|c| c.to_string())
    }

    /// Fails every pending future; used on stage shutdown.
    pub(crate) fn fail_all_waiters(&mut self, err: &FleaseError) {
        for cell in self.cells.values_mut() {
            cell.fail_waiters(err);
        }
    }
}

impl ProposerEnv {
    fn now(&self) -> i64 {
        self.clock.now_ms()
    }

    fn identity(&self) -> &str {
        &self.config.identity
    }

    /// Hands a local acceptor reply to the epoch handler, to come back
    /// through the coordinator queue once done. Returns the reply unchanged
    /// if no handler is installed.
    fn defer_local_reply(
        &self,
        io: EpochIo,
        reply: FleaseMessage,
    ) -> Option<FleaseMessage> {
        let Some(handler) = self.epoch_handler.clone() else {
            pf_error!(
                "master epoch requested for cell {} but no epoch handler \
                 installed, continuing without epoch",
                reply.cell
            );
            return Some(reply);
        };
        let tx_input = self.tx_input.clone();
        tokio::spawn(async move {
            match io.run(handler.as_ref(), reply).await {
                Ok(reply) => {
                    if tx_input.send(StageInput::Message(reply)).is_err() {
                        pf_debug!("stage gone, deferred local reply dropped");
                    }
                }
                Err(e) => {
                    pf_error!("master epoch {:?} failed, reply dropped: {}", io, e)
                }
            }
        });
        None
    }

    fn acquire_lease(
        &self,
        cell: &mut ProposerCell,
        ctx: &mut RoundCtx,
    ) -> Result<(), FleaseError> {
        let now = self.now();
        let local = ctx
            .acceptor
            .local_lease_info(&cell.id)
            .filter(|info| info.has_not_timed_out(&self.config, now))
            .map(|info| info.lease());
        if let Some(lease) = local {
            pf_debug!("P request served from local state: {}", lease);
            ctx.acceptor.raise_learned(lease);
            return Ok(());
        }

        if cell.state == CellState::Idle {
            cell.num_failures = 0;
            cell.handover_to = None;
            let holder = self.config.identity.clone();
            self.start_prepare(cell, ctx, holder)
        } else {
            pf_debug!("P cell {} is not idle, ignoring acquire", cell.id);
            Ok(())
        }
    }

    /// Checks that this node owns the cell's lease with enough time left to
    /// run another round before it ends.
    fn check_owner(
        &self,
        cell: &ProposerCell,
        acceptor: &Acceptor,
        what: &str,
    ) -> Result<(), FleaseError> {
        let now = self.now();
        let info = acceptor.local_lease_info(&cell.id).ok_or_else(|| {
            FleaseError::msg(format!(
                "cannot {} lease of cell {}, no local lease information",
                what, cell.id
            ))
        })?;
        if info.lease_holder.as_deref() != Some(self.identity()) {
            return Err(FleaseError::msg(format!(
                "cannot {} lease of cell {}, not lease owner (owner is {})",
                what,
                cell.id,
                info.lease_holder.as_deref().unwrap_or("-")
            )));
        }
        let latest_start = info.lease_timeout_ms - self.config.dmax();
        let needed = now + 2 * self.config.round_timeout();
        if latest_start < needed {
            return Err(FleaseError::msg(format!(
                "cannot {} lease of cell {}, not enough time left ({} < {})",
                what, cell.id, latest_start, needed
            )));
        }
        Ok(())
    }

    fn renew_lease(
        &self,
        cell: &mut ProposerCell,
        ctx: &mut RoundCtx,
    ) -> Result<(), FleaseError> {
        if let Some(target) = &cell.handover_to {
            pf_info!(
                "P handover of cell {} to {} in progress, renew canceled",
                cell.id,
                target
            );
            return Ok(());
        }

        if let Err(err) = self.check_owner(cell, ctx.acceptor, "renew") {
            pf_warn!("P {}", err);
            cell.state = CellState::Idle;
            cell.msg_sent = None;
            cell.ballot = cell.ballot.bumped(1);
            cell.reset_responses();
            cell.num_failures = 0;
            if cell.prev_lease.is_held_by(self.identity()) {
                ctx.acceptor.raise_learned(Lease::empty_for(cell.id.clone()));
            }
            let restart_at =
                self.now() + self.config.dmax() + self.config.max_lease();
            ctx.timers.schedule(restart_at, cell.restart_event());
            return Ok(());
        }

        // a renewal keeps the epoch won at acquisition
        cell.request_master_epoch = false;
        let holder = self.config.identity.clone();
        self.start_prepare(cell, ctx, holder)
    }

    fn start_prepare(
        &self,
        cell: &mut ProposerCell,
        ctx: &mut RoundCtx,
        holder: String,
    ) -> Result<(), FleaseError> {
        let now = self.now();
        if cell.last_prepare_ms + self.config.max_lease() < now {
            // long idle: jump ahead to the clock so that restarted peers
            // cannot have seen higher ballots
            let no = cell.ballot.proposal_no.max(now.max(0) as u64);
            cell.ballot = ProposalNumber::new(no, self.sender_id);
        }
        cell.last_prepare_ms = now;
        cell.state = CellState::WaitForPrepAck;
        cell.reset_responses();

        let mut msg = FleaseMessage::new(MsgType::Prepare, cell.id.clone());
        msg.ballot = cell.ballot;
        msg.lease_holder = Some(holder);
        msg.lease_timeout_ms = now + self.config.max_lease();
        if cell.request_master_epoch {
            msg.master_epoch = REQUEST_MASTER_EPOCH;
        }
        msg.view_id = cell.view_id;
        msg.send_timestamp_ms = now;
        pf_msg!(self.config, "P start PREPARE: {:?}", msg);

        for &addr in &cell.acceptors {
            self.sender.send_message(msg.clone(), addr);
        }
        ctx.timers.schedule(
            now + self.config.round_timeout(),
            FleaseMessage::event(
                MsgType::EventTimeoutPrepare,
                cell.id.clone(),
                cell.ballot,
            ),
        );

        let reply = ctx.acceptor.handle_prepare(&msg);
        cell.msg_sent = Some(msg);
        let reply = if reply.msg_type == MsgType::PrepareAck
            && cell.request_master_epoch
        {
            match self.defer_local_reply(EpochIo::Fetch, reply) {
                Some(reply) => reply,
                None => return Ok(()),
            }
        } else {
            reply
        };
        self.process_prepare_response(cell, ctx, reply)
    }

    /// Screens a reply of the current phase and records it. Returns true
    /// once a quorum of distinct acceptors has answered.
    fn collect_response(
        &self,
        cell: &mut ProposerCell,
        ctx: &mut RoundCtx,
        msg: FleaseMessage,
    ) -> Result<bool, FleaseError> {
        let now = self.now();
        let Some(sent_ballot) = cell.msg_sent.as_ref().map(|m| m.ballot) else {
            return Ok(false);
        };

        if msg.is_outdated(&self.config, now) {
            pf_msg!(self.config, "P outdated response discarded: {:?}", msg);
            return Ok(false);
        }
        if msg.send_timestamp_ms > now + self.config.dmax() {
            let err = FleaseError::msg(format!(
                "clock drift exceeded: response from {:?} stamped {} at {}",
                msg.sender, msg.send_timestamp_ms, now
            ));
            self.cancel(cell, ctx, err, 0);
            return Ok(false);
        }
        if msg.ballot != sent_ballot {
            pf_msg!(self.config, "P response of another round ignored: {:?}", msg);
            return Ok(false);
        }

        let idx = match msg.sender {
            None => cell.acceptors.len(),
            Some(addr) => match cell.acceptors.iter().position(|&a| a == addr) {
                Some(idx) => idx,
                None => {
                    pf_warn!("P response from unknown acceptor {}", addr);
                    return Ok(false);
                }
            },
        };
        if !cell.responded.mark(idx as u8)? {
            pf_msg!(self.config, "P duplicate response ignored: {:?}", msg);
            return Ok(false);
        }
        cell.responses.push(msg);
        Ok(cell.responded.has_quorum())
    }

    /// Moves the ballot past a blocking one by a random step.
    fn overrule(&self, cell: &mut ProposerCell, blocking: ProposalNumber) {
        let step = thread_rng().gen_range(1..=10);
        cell.ballot = ProposalNumber::new(
            cell.ballot.proposal_no.max(blocking.proposal_no) + step,
            self.sender_id,
        );
    }

    /// Cancels the round if any quorum reply is a WRONG_VIEW or a NACK of
    /// given type. Returns true if canceled.
    fn round_rejected(
        &self,
        cell: &mut ProposerCell,
        ctx: &mut RoundCtx,
        responses: &[FleaseMessage],
        nack: MsgType,
        phase: &str,
    ) -> bool {
        if let Some(wrong) =
            responses.iter().find(|r| r.msg_type == MsgType::WrongView)
        {
            let err = FleaseError::msg(format!(
                "acceptor {:?} is in view {} during {} (local view {})",
                wrong.sender, wrong.view_id, phase, cell.view_id
            ));
            self.cancel(cell, ctx, err, 0);
            return true;
        }
        if let Some(blocking) = responses
            .iter()
            .filter(|r| r.msg_type == nack)
            .map(|r| r.prev_ballot)
            .max()
        {
            self.overrule(cell, blocking);
            let err = FleaseError::msg(format!(
                "proposal was overruled by remote proposal {} during {}",
                blocking, phase
            ));
            self.cancel(cell, ctx, err, 0);
            return true;
        }
        false
    }

    fn process_prepare_response(
        &self,
        cell: &mut ProposerCell,
        ctx: &mut RoundCtx,
        msg: FleaseMessage,
    ) -> Result<(), FleaseError> {
        match msg.msg_type {
            MsgType::EventTimeoutPrepare => {
                if cell.msg_sent.as_ref().map(|m| m.ballot) == Some(msg.ballot) {
                    let err = FleaseError::msg(
                        "did not receive enough responses for PREPARE",
                    );
                    self.cancel(cell, ctx, err, 0);
                }
                return Ok(());
            }
            MsgType::PrepareAck | MsgType::PrepareNack | MsgType::WrongView => {}
            _ => {
                pf_msg!(self.config, "P dropped while preparing: {:?}", msg);
                return Ok(());
            }
        }

        if !self.collect_response(cell, ctx, msg)? {
            return Ok(());
        }
        let responses = std::mem::take(&mut cell.responses);
        if self.round_rejected(cell, ctx, &responses, MsgType::PrepareNack, "PREPARE")
        {
            return Ok(());
        }

        let now = self.now();
        let Some(sent) = cell.msg_sent.as_ref() else {
            return Ok(());
        };
        let mut holder = sent.lease_holder.clone();
        let mut timeout_ms = now + self.config.max_lease();

        // highest previously accepted value reported by the quorum
        let prior = responses
            .iter()
            .filter(|r| r.msg_type == MsgType::PrepareAck)
            .filter(|r| !r.prev_ballot.is_empty())
            .max_by_key(|r| r.prev_ballot);
        if let Some(prior) = prior {
            if prior.has_not_timed_out(&self.config, now) {
                if prior.lease_holder.as_deref() == Some(self.identity()) {
                    pf_debug!("P prior lease {} is ours", prior.lease());
                } else {
                    pf_debug!("P adopting valid prior lease {}", prior.lease());
                    holder = prior.lease_holder.clone();
                    timeout_ms = prior.lease_timeout_ms;
                }
            } else if prior.has_timed_out(&self.config, now) {
                pf_debug!("P prior lease {} timed out", prior.lease());
            } else {
                pf_debug!("P prior lease {} in grace period", prior.lease());
                holder = prior.lease_holder.clone();
                timeout_ms = prior.lease_timeout_ms;
            }
        }

        if cell.request_master_epoch {
            let max_epoch = responses
                .iter()
                .filter(|r| r.msg_type == MsgType::PrepareAck)
                .map(|r| r.master_epoch)
                .max()
                .unwrap_or(REQUEST_MASTER_EPOCH)
                .max(REQUEST_MASTER_EPOCH);
            cell.master_epoch = max_epoch + 1;
            pf_debug!("P using master epoch {}", cell.master_epoch);
        }

        self.start_accept(cell, ctx, holder, timeout_ms)
    }

    fn start_accept(
        &self,
        cell: &mut ProposerCell,
        ctx: &mut RoundCtx,
        holder: Option<String>,
        timeout_ms: i64,
    ) -> Result<(), FleaseError> {
        let now = self.now();
        cell.state = CellState::WaitForAcceptAck;
        cell.reset_responses();

        let mut msg = FleaseMessage::new(MsgType::Accept, cell.id.clone());
        msg.ballot = cell.ballot;
        msg.lease_holder = holder;
        msg.lease_timeout_ms = timeout_ms;
        msg.master_epoch = cell.carried_epoch();
        msg.view_id = cell.view_id;
        msg.send_timestamp_ms = now;
        pf_msg!(self.config, "P start ACCEPT: {:?}", msg);

        for &addr in &cell.acceptors {
            self.sender.send_message(msg.clone(), addr);
        }
        ctx.timers.schedule(
            now + self.config.round_timeout(),
            FleaseMessage::event(
                MsgType::EventTimeoutAccept,
                cell.id.clone(),
                cell.ballot,
            ),
        );

        let reply = ctx.acceptor.handle_accept(&msg);
        let stores_epoch = msg.master_epoch != IGNORE_MASTER_EPOCH;
        cell.msg_sent = Some(msg);
        let reply = if reply.msg_type == MsgType::AcceptAck && stores_epoch {
            match self.defer_local_reply(EpochIo::Store, reply) {
                Some(reply) => reply,
                None => return Ok(()),
            }
        } else {
            reply
        };
        self.process_accept_response(cell, ctx, reply)
    }

    fn process_accept_response(
        &self,
        cell: &mut ProposerCell,
        ctx: &mut RoundCtx,
        msg: FleaseMessage,
    ) -> Result<(), FleaseError> {
        match msg.msg_type {
            MsgType::EventTimeoutAccept => {
                if cell.msg_sent.as_ref().map(|m| m.ballot) == Some(msg.ballot) {
                    let err = FleaseError::msg(
                        "did not receive enough responses for ACCEPT",
                    );
                    self.cancel(cell, ctx, err, 0);
                }
                return Ok(());
            }
            MsgType::AcceptAck | MsgType::AcceptNack | MsgType::WrongView => {}
            _ => {
                pf_msg!(self.config, "P dropped while accepting: {:?}", msg);
                return Ok(());
            }
        }

        if !self.collect_response(cell, ctx, msg)? {
            return Ok(());
        }
        let responses = std::mem::take(&mut cell.responses);
        if self.round_rejected(cell, ctx, &responses, MsgType::AcceptNack, "ACCEPT")
        {
            return Ok(());
        }
        self.learn(cell, ctx)
    }

    fn learn(
        &self,
        cell: &mut ProposerCell,
        ctx: &mut RoundCtx,
    ) -> Result<(), FleaseError> {
        let now = self.now();
        cell.state = CellState::Idle;
        let Some(accepted) = cell.msg_sent.take() else {
            return Ok(());
        };

        let mut msg = FleaseMessage::new(MsgType::Learn, cell.id.clone());
        msg.ballot = cell.ballot;
        msg.lease_holder = accepted.lease_holder;
        msg.lease_timeout_ms = accepted.lease_timeout_ms;
        msg.master_epoch = cell.carried_epoch();
        msg.view_id = cell.view_id;
        msg.send_timestamp_ms = now;
        cell.msg_sent = Some(msg.clone());
        cell.ballot = cell.ballot.bumped(1);

        if msg.has_timed_out(&self.config, now) {
            pf_debug!("P finished round, lease has timed out, restart: {:?}", msg);
            let holder = msg
                .lease_holder
                .unwrap_or_else(|| self.config.identity.clone());
            return self.start_prepare(cell, ctx, holder);
        }
        if !msg.has_not_timed_out(&self.config, now) {
            let wait_ms = msg.lease_timeout_ms - now + self.config.dmax();
            pf_debug!(
                "P finished round, lease in grace period, restart in {} ms: {:?}",
                wait_ms,
                msg
            );
            let err = FleaseError::msg("current lease not yet timed out");
            self.cancel(cell, ctx, err, wait_ms);
            return Ok(());
        }

        pf_debug!("P finished round, lease is valid: {:?}", msg);
        cell.num_failures = 0;
        if self.config.send_learn_messages {
            pf_msg!(self.config, "P start LEARN: {:?}", msg);
            for &addr in &cell.acceptors {
                self.sender.send_message(msg.clone(), addr);
            }
        }
        ctx.acceptor.handle_learn(&msg);

        if msg.lease_holder.as_deref() != Some(self.identity()) {
            return Ok(());
        }

        if let Some(target) = cell.handover_to.clone() {
            // handover was requested while this round was in flight
            ctx.acceptor.raise_learned(Lease::empty_for(cell.id.clone()));
            return self.start_prepare(cell, ctx, target);
        }

        let renew_at = msg.lease_timeout_ms
            - self.config.dmax()
            - 3 * self.config.round_timeout();
        if now < renew_at {
            ctx.timers.schedule(
                renew_at,
                FleaseMessage::event(MsgType::EventRenew, cell.id.clone(), cell.ballot),
            );
            pf_debug!("P scheduled renew for {} at {}", cell.id, renew_at);
        } else {
            let wait_ms = msg.lease_timeout_ms - now + self.config.dmax();
            pf_warn!(
                "P too late to schedule renew for cell {}, restart in {} ms",
                cell.id,
                wait_ms
            );
            let err = FleaseError::msg(format!(
                "too late for renew, re-start after lease has timed out in {} ms",
                wait_ms
            ));
            self.cancel(cell, ctx, err, wait_ms);
        }
        Ok(())
    }

    /// Ends the current round as failed and schedules the next attempt.
    /// After more than `max_retries` consecutive failures the cell reports
    /// lease failure and waits a full lease timeout.
    fn cancel(
        &self,
        cell: &mut ProposerCell,
        ctx: &mut RoundCtx,
        reason: FleaseError,
        wait_ms: i64,
    ) {
        cell.num_failures += 1;
        pf_debug!("P proposal failed for cell {}: {}", cell.id, reason);
        cell.state = CellState::Idle;
        cell.msg_sent = None;
        cell.ballot = cell.ballot.bumped(1);
        cell.reset_responses();

        let now = self.now();
        if cell.num_failures > self.config.max_retries {
            let err = reason.with_context(&*cell);
            pf_warn!("P lease failed: {}", err);
            self.listener.lease_failed(&cell.id, &err);
            cell.fail_waiters(&err);
            if cell.prev_lease.is_held_by(self.identity()) {
                ctx.acceptor.raise_learned(Lease::empty_for(cell.id.clone()));
            }
            cell.num_failures = 0;
            ctx.timers
                .schedule(now + self.config.max_lease(), cell.restart_event());
        } else {
            let wait_ms = if wait_ms > 0 {
                wait_ms
            } else {
                thread_rng().gen_range(50..150)
            };
            ctx.timers.schedule(now + wait_ms, cell.restart_event());
        }
    }
}
