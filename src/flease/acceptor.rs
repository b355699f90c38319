//! Flease acceptor: the passive Paxos role answering PREPARE, ACCEPT and
//! LEARN messages per cell.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::flease::{
    CellId, Clock, FleaseConfig, FleaseMessage, Lease, MsgType,
    ProposalNumber, ViewChangeListener, VIEW_ID_INVALIDATED,
};
use crate::utils::FleaseError;

use tokio::fs::{self, File};

/// Name prefix of the crash-recovery lock file.
const LOCKFILE_PREFIX: &str = "flease_lock.";

/// Per-cell acceptor state, held in memory only.
#[derive(Debug, Default)]
struct AcceptorCell {
    /// Highest ballot ever prepared.
    prepared: Option<ProposalNumber>,

    /// Highest ballot ever accepted, together with its value.
    accepted: Option<FleaseMessage>,

    /// Latest LEARN applied to this cell.
    latest_learn: Option<FleaseMessage>,

    view_id: i32,
    view_invalidated: bool,

    last_access_ms: i64,
}

impl AcceptorCell {
    /// Fresh cell inheriting only the view of a garbage-collected one.
    fn succeed(old: &AcceptorCell) -> Self {
        AcceptorCell {
            view_id: old.view_id,
            view_invalidated: old.view_invalidated,
            ..Default::default()
        }
    }

    fn prepared_after(&self, ballot: ProposalNumber) -> bool {
        self.prepared.map_or(false, |p| p > ballot)
    }
}

impl fmt::Display for AcceptorCell {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let prepared = self.prepared.unwrap_or(ProposalNumber::EMPTY);
        write!(f, "prepared={} accepted=", prepared)?;
        match &self.accepted {
            Some(a) => write!(
                f,
                "{}={}/{}",
                a.ballot,
                a.lease_holder.as_deref().unwrap_or("-"),
                a.lease_timeout_ms
            )?,
            None => write!(f, "-")?,
        }
        write!(f, " learned=")?;
        match &self.latest_learn {
            Some(l) => write!(
                f,
                "{}={}/{}",
                l.ballot,
                l.lease_holder.as_deref().unwrap_or("-"),
                l.lease_timeout_ms
            )?,
            None => write!(f, "-")?,
        }
        write!(
            f,
            " view={}{} last_access={}",
            self.view_id,
            if self.view_invalidated { "(invalidated)" } else { "" },
            self.last_access_ms
        )
    }
}

/// The acceptor module. Owned and driven exclusively by the coordinator.
pub(crate) struct Acceptor {
    config: Arc<FleaseConfig>,
    clock: Arc<dyn Clock>,

    cells: HashMap<CellId, AcceptorCell>,

    view_listener: Option<Arc<dyn ViewChangeListener>>,

    /// All messages are ignored until this time after a crash restart.
    recover_until_ms: i64,

    lockfile: Option<PathBuf>,

    /// Leases learned since the coordinator last drained them.
    learned: Vec<Lease>,

    /// Higher views observed in requests since the last drain.
    view_bumps: Vec<(CellId, i32)>,
}

impl Acceptor {
    /// Creates the acceptor. If a lock file directory is configured, takes
    /// the lock file; finding a stale one means the previous process crashed
    /// and starts the recovery period.
    pub(crate) async fn new_and_setup(
        config: Arc<FleaseConfig>,
        clock: Arc<dyn Clock>,
        view_listener: Option<Arc<dyn ViewChangeListener>>,
    ) -> Result<Self, FleaseError> {
        let mut recover_until_ms = 0;
        let lockfile = match &config.lockfile_dir {
            None => None,
            Some(dir) => {
                let path = Path::new(dir)
                    .join(format!("{}{}", LOCKFILE_PREFIX, config.sender_id()));
                let exists = fs::try_exists(&path).await?;
                if exists && !config.ignore_lockfile_for_testing {
                    recover_until_ms =
                        clock.now_ms() + config.restart_wait_ms() as i64;
                    pf_info!(
                        "restarted after crash (lock file '{}' exists), \
                         ignoring all messages for {} ms",
                        path.display(),
                        config.restart_wait_ms()
                    );
                } else {
                    if exists {
                        fs::remove_file(&path).await?;
                    }
                    fs::create_dir_all(dir).await?;
                    File::create(&path).await?;
                    pf_debug!("created lock file '{}'", path.display());
                }
                Some(path)
            }
        };

        Ok(Acceptor {
            config,
            clock,
            cells: HashMap::new(),
            view_listener,
            recover_until_ms,
            lockfile,
            learned: vec![],
            view_bumps: vec![],
        })
    }

    /// Removes the lock file, marking a clean shutdown.
    pub(crate) async fn shutdown(&mut self) -> Result<(), FleaseError> {
        if let Some(path) = self.lockfile.take() {
            if fs::try_exists(&path).await? {
                fs::remove_file(&path).await?;
            }
        }
        Ok(())
    }

    /// Looks up a cell, creating it on first use and replacing it if it has
    /// not been touched for the cell timeout.
    fn get_cell<'a>(
        cells: &'a mut HashMap<CellId, AcceptorCell>,
        id: &CellId,
        now_ms: i64,
        cell_timeout_ms: i64,
    ) -> &'a mut AcceptorCell {
        let cell = cells.entry(id.clone()).or_default();
        if cell.last_access_ms != 0
            && cell.last_access_ms + cell_timeout_ms < now_ms
        {
            pf_debug!("A GCed cell {}", id);
            *cell = AcceptorCell::succeed(cell);
        }
        cell.last_access_ms = now_ms;
        cell
    }

    /// Sets the view of a cell, or invalidates the current view if given
    /// `VIEW_ID_INVALIDATED`.
    pub(crate) fn set_view_id(&mut self, id: &CellId, view_id: i32) {
        let now = self.clock.now_ms();
        let cell = Self::get_cell(
            &mut self.cells,
            id,
            now,
            self.config.cell_timeout(),
        );
        if view_id == VIEW_ID_INVALIDATED {
            cell.view_invalidated = true;
        } else {
            cell.view_id = view_id;
            cell.view_invalidated = false;
        }
    }

    /// Handles a PREPARE. Always returns a reply: a PREPARE_ACK carrying the
    /// previously accepted value (if any), or a PREPARE_NACK carrying the
    /// blocking ballot if a ballot at least as high was already prepared.
    pub(crate) fn handle_prepare(&mut self, msg: &FleaseMessage) -> FleaseMessage {
        let now = self.clock.now_ms();
        let cell = Self::get_cell(
            &mut self.cells,
            &msg.cell,
            now,
            self.config.cell_timeout(),
        );

        match cell.prepared {
            Some(prepared) if prepared >= msg.ballot => {
                pf_msg!(
                    self.config,
                    "A prepare NACK p:{} not before {}",
                    prepared,
                    msg.ballot
                );
                let mut reject = msg.reply(MsgType::PrepareNack, now);
                reject.prev_ballot = prepared;
                reject.lease_holder = None;
                reject.lease_timeout_ms = 0;
                reject
            }
            _ => {
                pf_msg!(
                    self.config,
                    "A prepare ACK  p:{} -> {} a:{:?}",
                    cell.prepared.unwrap_or(ProposalNumber::EMPTY),
                    msg.ballot,
                    cell.accepted.as_ref().map(|a| a.lease())
                );
                cell.prepared = Some(msg.ballot);
                let mut reply = msg.reply(MsgType::PrepareAck, now);
                if let Some(accepted) = &cell.accepted {
                    reply.prev_ballot = accepted.ballot;
                    reply.lease_holder = accepted.lease_holder.clone();
                    reply.lease_timeout_ms = accepted.lease_timeout_ms;
                }
                reply
            }
        }
    }

    /// Handles an ACCEPT. Accepts unless a higher ballot was prepared.
    pub(crate) fn handle_accept(&mut self, msg: &FleaseMessage) -> FleaseMessage {
        let now = self.clock.now_ms();
        let cell = Self::get_cell(
            &mut self.cells,
            &msg.cell,
            now,
            self.config.cell_timeout(),
        );

        if let Some(prepared) = cell.prepared.filter(|&p| p > msg.ballot) {
            pf_msg!(
                self.config,
                "A accept  NACK p:{} is after {}",
                prepared,
                msg.ballot
            );
            let mut reject = msg.reply(MsgType::AcceptNack, now);
            reject.prev_ballot = prepared;
            reject.lease_holder = None;
            reject.lease_timeout_ms = 0;
            reject
        } else {
            pf_msg!(
                self.config,
                "A accept  ACK  {} -> {:?}",
                msg.ballot,
                msg.lease()
            );
            cell.accepted = Some(msg.clone());
            cell.prepared = Some(msg.ballot);
            msg.reply(MsgType::AcceptAck, now)
        }
    }

    /// Handles a LEARN. Outdated ones are ignored; otherwise the value
    /// becomes the cell's latest learned lease and a learn event is raised.
    pub(crate) fn handle_learn(&mut self, msg: &FleaseMessage) {
        let now = self.clock.now_ms();
        let cell = Self::get_cell(
            &mut self.cells,
            &msg.cell,
            now,
            self.config.cell_timeout(),
        );

        if cell.prepared_after(msg.ballot)
            || cell.accepted.as_ref().map_or(false, |a| a.after(msg))
        {
            pf_msg!(self.config, "A ignore outdated LEARN {}", msg.ballot);
            return;
        }

        pf_msg!(self.config, "A learn {} -> {:?}", msg.ballot, msg.lease());
        cell.accepted = Some(msg.clone());
        cell.prepared = Some(msg.ballot);
        cell.latest_learn = Some(msg.clone());
        self.learned.push(msg.lease());
    }

    /// Entry point for acceptor messages from the network. Returns the reply
    /// to send back, if any.
    pub(crate) fn process_message(
        &mut self,
        msg: &FleaseMessage,
    ) -> Option<FleaseMessage> {
        let now = self.clock.now_ms();
        if msg.is_outdated(&self.config, now) {
            pf_msg!(self.config, "A outdated message discarded: {:?}", msg);
            return None;
        }
        if self.recover_until_ms >= now {
            pf_msg!(
                self.config,
                "A message discarded, still in recovery period"
            );
            return None;
        }

        let cell = Self::get_cell(
            &mut self.cells,
            &msg.cell,
            now,
            self.config.cell_timeout(),
        );
        if cell.view_id < msg.view_id {
            // answer anyway, but let the view owner catch up
            if let Some(listener) = &self.view_listener {
                listener.view_id_changed(&msg.cell, msg.view_id, false);
            }
            self.view_bumps.push((msg.cell.clone(), msg.view_id));
        } else if cell.view_id > msg.view_id
            || (cell.view_id == msg.view_id && cell.view_invalidated)
        {
            pf_msg!(
                self.config,
                "A wrong view {} (local {}{})",
                msg.view_id,
                cell.view_id,
                if cell.view_invalidated { ", invalidated" } else { "" }
            );
            let mut reply = msg.reply(MsgType::WrongView, now);
            reply.view_id = cell.view_id;
            return Some(reply);
        }

        match msg.msg_type {
            MsgType::Prepare => Some(self.handle_prepare(msg)),
            MsgType::Accept => Some(self.handle_accept(msg)),
            MsgType::Learn => {
                self.handle_learn(msg);
                None
            }
            _ => {
                pf_error!("A invalid message type received: {:?}", msg);
                None
            }
        }
    }

    /// Latest LEARN applied to a cell, if the cell is alive.
    pub(crate) fn local_lease_info(&self, id: &CellId) -> Option<&FleaseMessage> {
        let now = self.clock.now_ms();
        self.cells
            .get(id)
            .filter(|c| c.last_access_ms + self.config.cell_timeout() >= now)
            .and_then(|c| c.latest_learn.as_ref())
    }

    /// Every known cell mapped to its learned lease, if any.
    pub(crate) fn local_state(&self) -> HashMap<CellId, Option<Lease>> {
        self.cells
            .iter()
            .map(|(id, c)| (id.clone(), c.latest_learn.as_ref().map(|l| l.lease())))
            .collect()
    }

    /// Raw state of one cell.
    pub(crate) fn dump_cell(&self, id: &CellId) -> String {
        match self.cells.get(id) {
            Some(cell) => format!("{}: {}", id, cell),
            None => format!("{}: does not exist", id),
        }
    }

    /// Records a learn event on behalf of the proposer.
    pub(crate) fn raise_learned(&mut self, lease: Lease) {
        self.learned.push(lease);
    }

    pub(crate) fn drain_learned(&mut self) -> Vec<Lease> {
        std::mem::take(&mut self.learned)
    }

    pub(crate) fn drain_view_bumps(&mut self) -> Vec<(CellId, i32)> {
        std::mem::take(&mut self.view_bumps)
    }

    /// True while in the post-crash recovery period.
    pub(crate) fn in_recovery(&self) -> bool {
        self.recover_until_ms >= self.clock.now_ms()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flease::testkit::{temp_dir, ManualClock, RecordingViewListener};

    fn config() -> Arc<FleaseConfig> {
        Arc::new(FleaseConfig::new("osd-0", 10000, 500, 200).unwrap())
    }

    async fn acceptor_at(now: i64) -> (Acceptor, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(now));
        let acceptor = Acceptor::new_and_setup(config(), clock.clone(), None)
            .await
            .unwrap();
        (acceptor, clock)
    }

    fn request(t: MsgType, no: u64, sender: u64, now: i64) -> FleaseMessage {
        let mut msg = FleaseMessage::new(t, "c0".into());
        msg.ballot = ProposalNumber::new(no, sender);
        msg.lease_holder = Some(format!("osd-{}", sender));
        msg.lease_timeout_ms = now + 10000;
        msg.send_timestamp_ms = now;
        msg.sender = Some("127.0.0.1:7001".parse().unwrap());
        msg
    }

    #[tokio::test]
    async fn prepare_then_lower_prepare_nacked() -> Result<(), FleaseError> {
        let (mut acc, _) = acceptor_at(1000).await;
        let ack = acc.process_message(&request(MsgType::Prepare, 5, 1, 1000));
        let ack = ack.ok_or(FleaseError::msg("no reply"))?;
        assert_eq!(ack.msg_type, MsgType::PrepareAck);
        assert!(ack.prev_ballot.is_empty());

        for (no, sender) in [(5, 1), (4, 9)] {
            let nack = acc.handle_prepare(&request(MsgType::Prepare, no, sender, 1000));
            assert_eq!(nack.msg_type, MsgType::PrepareNack);
            assert_eq!(nack.prev_ballot, ProposalNumber::new(5, 1));
            assert_eq!(nack.lease_holder, None);
        }
        Ok(())
    }

    #[tokio::test]
    async fn prepare_reports_accepted_value() {
        let (mut acc, _) = acceptor_at(1000).await;
        let accept = request(MsgType::Accept, 5, 1, 1000);
        assert_eq!(acc.handle_accept(&accept).msg_type, MsgType::AcceptAck);

        let ack = acc.handle_prepare(&request(MsgType::Prepare, 6, 2, 1000));
        assert_eq!(ack.msg_type, MsgType::PrepareAck);
        assert_eq!(ack.prev_ballot, ProposalNumber::new(5, 1));
        assert_eq!(ack.lease_holder.as_deref(), Some("osd-1"));
        assert_eq!(ack.lease_timeout_ms, 11000);
        assert_eq!(ack.ballot, ProposalNumber::new(6, 2));
    }

    #[tokio::test]
    async fn accept_after_higher_prepare_nacked() {
        let (mut acc, _) = acceptor_at(1000).await;
        acc.handle_prepare(&request(MsgType::Prepare, 7, 2, 1000));
        let nack = acc.handle_accept(&request(MsgType::Accept, 6, 1, 1000));
        assert_eq!(nack.msg_type, MsgType::AcceptNack);
        assert_eq!(nack.prev_ballot, ProposalNumber::new(7, 2));

        // equal ballot is accepted
        let ack = acc.handle_accept(&request(MsgType::Accept, 7, 2, 1000));
        assert_eq!(ack.msg_type, MsgType::AcceptAck);
    }

    #[tokio::test]
    async fn learn_raises_event_unless_outdated() {
        let (mut acc, _) = acceptor_at(1000).await;
        acc.handle_learn(&request(MsgType::Learn, 5, 1, 1000));
        let learned = acc.drain_learned();
        assert_eq!(learned.len(), 1);
        assert!(learned[0].is_held_by("osd-1"));
        assert_eq!(
            acc.local_lease_info(&"c0".into()).map(|m| m.ballot),
            Some(ProposalNumber::new(5, 1))
        );

        acc.handle_prepare(&request(MsgType::Prepare, 9, 2, 1000));
        acc.handle_learn(&request(MsgType::Learn, 6, 1, 1000));
        assert!(acc.drain_learned().is_empty());
        let state = acc.local_state();
        assert_eq!(state.len(), 1);
        assert!(state[&CellId::from("c0")].as_ref().unwrap().is_held_by("osd-1"));
    }

    #[tokio::test]
    async fn outdated_message_dropped() {
        let (mut acc, clock) = acceptor_at(1000).await;
        let msg = request(MsgType::Prepare, 5, 1, 1000);
        clock.set(1201);
        assert!(acc.process_message(&msg).is_none());
        clock.set(1200);
        assert!(acc.process_message(&msg).is_some());
    }

    #[tokio::test]
    async fn view_checks() {
        let clock = Arc::new(ManualClock::new(1000));
        let views = Arc::new(RecordingViewListener::default());
        let mut acc =
            Acceptor::new_and_setup(config(), clock.clone(), Some(views.clone()))
                .await
                .unwrap();
        acc.set_view_id(&"c0".into(), 3);

        let mut msg = request(MsgType::Prepare, 5, 1, 1000);
        msg.view_id = 2;
        let reply = acc.process_message(&msg).unwrap();
        assert_eq!(reply.msg_type, MsgType::WrongView);
        assert_eq!(reply.view_id, 3);

        msg.view_id = 4;
        let reply = acc.process_message(&msg).unwrap();
        assert_eq!(reply.msg_type, MsgType::PrepareAck);
        assert_eq!(views.events(), vec![(CellId::from("c0"), 4, false)]);
        assert_eq!(acc.drain_view_bumps(), vec![(CellId::from("c0"), 4)]);

        acc.set_view_id(&"c0".into(), 4);
        acc.set_view_id(&"c0".into(), VIEW_ID_INVALIDATED);
        msg.ballot = ProposalNumber::new(6, 1);
        let reply = acc.process_message(&msg).unwrap();
        assert_eq!(reply.msg_type, MsgType::WrongView);
        assert!(acc.dump_cell(&"c0".into()).contains("invalidated"));
    }

    #[tokio::test]
    async fn stale_cell_collected_keeping_view() {
        let (mut acc, clock) = acceptor_at(1000).await;
        acc.set_view_id(&"c0".into(), 2);
        let mut msg = request(MsgType::Accept, 5, 1, 1000);
        msg.view_id = 2;
        acc.process_message(&msg);
        assert!(acc.dump_cell(&"c0".into()).contains("accepted=5:1"));

        clock.set(1000 + 20001);
        assert!(acc.local_lease_info(&"c0".into()).is_none());
        let mut msg = request(MsgType::Prepare, 1, 1, clock.now_ms());
        msg.view_id = 2;
        let reply = acc.process_message(&msg).unwrap();
        assert_eq!(reply.msg_type, MsgType::PrepareAck);
        assert!(reply.prev_ballot.is_empty());
        assert!(acc.dump_cell(&"c0".into()).contains("view=2"));
        assert!(acc.dump_cell(&"zz".into()).contains("does not exist"));
    }

    #[tokio::test]
    async fn lockfile_recovery_period() -> Result<(), FleaseError> {
        let dir = temp_dir("acceptor-lock");
        let mut config = FleaseConfig::new("osd-lock", 10000, 500, 200)?;
        config.lockfile_dir = Some(dir.to_string_lossy().into_owned());
        let config = Arc::new(config);
        let clock = Arc::new(ManualClock::new(1000));

        // first start: creates lock file, crash leaves it behind
        let acc =
            Acceptor::new_and_setup(config.clone(), clock.clone(), None).await?;
        assert!(!acc.in_recovery());
        drop(acc);

        // restart after crash: recovery period of restart_wait
        let mut acc =
            Acceptor::new_and_setup(config.clone(), clock.clone(), None).await?;
        assert!(acc.in_recovery());
        let msg = request(MsgType::Prepare, 5, 1, 1000);
        assert!(acc.process_message(&msg).is_none());
        clock.set(1000 + config.restart_wait_ms() as i64 + 1);
        let msg = request(MsgType::Prepare, 5, 1, clock.now_ms());
        assert!(acc.process_message(&msg).is_some());

        // clean shutdown removes it
        acc.shutdown().await?;
        let acc = Acceptor::new_and_setup(config, clock, None).await?;
        assert!(!acc.in_recovery());
        Ok(())
    }
}
