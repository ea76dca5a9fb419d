//! The per-node engine actor and its public handle.
//!
//! [`Engine::start`] recovers persisted state, builds the protocol cores and
//! spawns a single actor task that owns all of them. Everything reaches the
//! actor as a message: admin commands from [`EngineHandle`], decoded envelopes
//! from the per-link reader tasks and ticks from the background tickers.
//! Election, agreement-round, replication and checkpoint-fetch timeouts are
//! deadlines kept inside the actor.
//!
//! ```text
//!  EngineHandle ──commands──┐
//!  link readers ──inbox─────┼──▶ actor ──frames──▶ Transport
//!  tickers ─────ticks───────┘      │
//!                                  ├──▶ watch (membership, election)
//!                                  ├──▶ broadcast (EngineEvent)
//!                                  └──▶ StateStore
//! ```
//!
//! Per step the actor: merges the envelope clock, feeds the relevant core,
//! persists whatever must survive a restart, then stamps and sends the
//! outbound messages the core produced.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::background_tasks::{BackgroundTaskRegistry, TaskStatus};
use super::byzantine::{AgreementId, AgreementStep, ByzantineDetector, Observation, Verdict, VerdictRecord};
use super::checkpoint::{Checkpoint, CheckpointInfo, CheckpointState, ReplicationLog, ResourceOwnership};
use super::config::{EngineConfig, ResourceProtocol};
use super::election::{ElectionCore, ElectionState, PersistedElection, Role};
use super::events::EngineEvent;
use super::failure_detector::{FailureDetector, PeerHealth};
use super::membership::{MemberStatus, MembershipSnapshot, MembershipStore};
use super::metrics;
use super::retry::{self, ElectionBackoff};
use super::ricart_agrawala::RicartAgrawala;
use super::storage::{CheckpointManifest, StateStore};
use super::suzuki_kasami::{SuzukiKasami, TokenDelivery};
use super::transport::{InMemoryNetwork, InboundLink, LinkAcceptor, Transport};
use super::vector_clock::{CausalEvent, CausalHistory, LocalClock};
use crate::constants::{COMMAND_CHANNEL_CAPACITY, EVENT_CHANNEL_CAPACITY, INBOX_CHANNEL_CAPACITY};
use crate::error::{CoordError, Result};
use crate::protocol::{Envelope, Message, Outbound, encode_frame, try_decode};
use crate::types::{CheckpointSeq, MembershipVersion, NodeId, Term};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// A granted resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceGrant {
    pub resource: String,
    pub protocol: ResourceProtocol,
    pub sequence: u64,
    pub waited: Duration,
}

/// Point-in-time summary of one engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterStatistics {
    pub node: NodeId,
    pub role: Role,
    pub term: Term,
    pub leader: Option<NodeId>,
    pub membership_version: MembershipVersion,
    pub members_by_status: BTreeMap<String, usize>,
    pub held_resources: BTreeSet<String>,
    pub pending_resources: BTreeSet<String>,
    pub committed_checkpoints: usize,
    pub last_checkpoint: Option<CheckpointSeq>,
    pub verdicts: BTreeMap<String, usize>,
    pub active_agreements: usize,
    pub causal_events: usize,
    pub background_tasks: Vec<(&'static str, TaskStatus)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tick {
    Heartbeat,
    FailureCheck,
    Checkpoint,
}

enum Command {
    Join {
        node: NodeId,
        reply: oneshot::Sender<Result<MembershipVersion>>,
    },
    Leave {
        node: NodeId,
        reply: oneshot::Sender<Result<MembershipVersion>>,
    },
    MarkFailed {
        node: NodeId,
        reply: oneshot::Sender<Result<MembershipVersion>>,
    },
    Request {
        resource: String,
        reply: oneshot::Sender<Result<ResourceGrant>>,
    },
    Withdraw {
        resource: String,
    },
    Release {
        resource: String,
        reply: oneshot::Sender<Result<()>>,
    },
    RaiseSuspicion {
        node: NodeId,
        reply: oneshot::Sender<Result<VerdictRecord>>,
    },
    ForceCheckpoint {
        reply: oneshot::Sender<Result<CheckpointInfo>>,
    },
    Restore {
        sequence: CheckpointSeq,
        reply: oneshot::Sender<Result<CheckpointInfo>>,
    },
    ReportHealth {
        node: NodeId,
        digest: Option<u64>,
    },
    Statistics {
        reply: oneshot::Sender<ClusterStatistics>,
    },
    CausalHistory {
        reply: oneshot::Sender<Vec<CausalEvent>>,
    },
    Checkpoints {
        reply: oneshot::Sender<Vec<CheckpointInfo>>,
    },
    Tick(Tick),
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Timer {
    AgreementRound(AgreementId, u32),
    Replication(CheckpointSeq),
    /// Waiting on this replica for a checkpoint copy.
    Fetch(NodeId),
}

/// A restore waiting on replicas because no local checkpoint qualified.
struct RestoreFetch {
    sequence: CheckpointSeq,
    asking: NodeId,
    remaining: VecDeque<NodeId>,
    reply: oneshot::Sender<Result<CheckpointInfo>>,
}

struct PendingRequest {
    protocol: ResourceProtocol,
    sequence: u64,
    started: Instant,
    reply: oneshot::Sender<Result<ResourceGrant>>,
}

/// Cloneable handle to a running engine.
#[derive(Clone)]
pub struct EngineHandle {
    node_id: NodeId,
    commands: mpsc::Sender<Command>,
    membership: watch::Receiver<MembershipSnapshot>,
    election: watch::Receiver<ElectionState>,
    events: broadcast::Sender<EngineEvent>,
}

impl std::fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineHandle")
            .field("node_id", &self.node_id)
            .field("running", &self.is_running())
            .finish()
    }
}

impl EngineHandle {
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }

    async fn call<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .await
            .map_err(|_| CoordError::Shutdown)?;
        rx.await.map_err(|_| CoordError::Shutdown)
    }

    /// Add `node` as Joining (or rejoin a departed node).
    pub async fn join_cluster(&self, node: NodeId) -> Result<MembershipVersion> {
        self.call(|reply| Command::Join { node, reply }).await?
    }

    pub async fn leave_cluster(&self, node: NodeId) -> Result<MembershipVersion> {
        self.call(|reply| Command::Leave { node, reply }).await?
    }

    pub async fn mark_failed(&self, node: NodeId) -> Result<MembershipVersion> {
        self.call(|reply| Command::MarkFailed { node, reply }).await?
    }

    /// Acquire `resource`, waiting as long as it takes.
    pub async fn request_resource(&self, resource: impl Into<String>) -> Result<ResourceGrant> {
        self.acquire(resource.into(), CancellationToken::new(), None)
            .await
    }

    /// Acquire `resource` unless `cancel` fires first.
    ///
    /// Cancellation withdraws the request from every peer and returns
    /// [`CoordError::Cancelled`].
    pub async fn request_resource_with_cancel(
        &self,
        resource: impl Into<String>,
        cancel: CancellationToken,
    ) -> Result<ResourceGrant> {
        self.acquire(resource.into(), cancel, None).await
    }

    /// Acquire `resource` within `timeout`, withdrawing on expiry.
    pub async fn request_resource_timeout(
        &self,
        resource: impl Into<String>,
        timeout: Duration,
    ) -> Result<ResourceGrant> {
        self.acquire(resource.into(), CancellationToken::new(), Some(timeout))
            .await
    }

    async fn acquire(
        &self,
        resource: String,
        cancel: CancellationToken,
        timeout: Option<Duration>,
    ) -> Result<ResourceGrant> {
        let (tx, mut rx) = oneshot::channel();
        self.commands
            .send(Command::Request {
                resource: resource.clone(),
                reply: tx,
            })
            .await
            .map_err(|_| CoordError::Shutdown)?;

        let expired = async {
            match timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending().await,
            }
        };

        let abandoned = tokio::select! {
            biased;
            result = &mut rx => return result.map_err(|_| CoordError::Shutdown)?,
            _ = cancel.cancelled() => CoordError::Cancelled { resource: resource.clone() },
            _ = expired => CoordError::Timeout(format!("waiting for resource '{}'", resource)),
        };

        // a grant racing with the withdrawal fails to deliver and is released
        rx.close();
        let _ = self.commands.send(Command::Withdraw { resource }).await;
        Err(abandoned)
    }

    /// Release a held resource. Releasing a resource that is not held is a
    /// no-op.
    pub async fn release_resource(&self, resource: impl Into<String>) -> Result<()> {
        let resource = resource.into();
        self.call(|reply| Command::Release { resource, reply }).await?
    }

    /// Run a Byzantine agreement about `node` and wait for the verdict.
    pub async fn raise_suspicion(&self, node: NodeId) -> Result<VerdictRecord> {
        self.call(|reply| Command::RaiseSuspicion { node, reply })
            .await?
    }

    /// Create a checkpoint and wait until it is committed.
    pub async fn force_checkpoint(&self) -> Result<CheckpointInfo> {
        self.call(|reply| Command::ForceCheckpoint { reply }).await?
    }

    /// Reset to the newest committed checkpoint at or below `sequence`.
    pub async fn restore(&self, sequence: CheckpointSeq) -> Result<CheckpointInfo> {
        self.call(|reply| Command::Restore { sequence, reply })
            .await?
    }

    /// Feed an external observation of `node`.
    ///
    /// `Some(digest)` means the node answered with that state digest; `None`
    /// means it did not answer.
    pub async fn report_health(&self, node: NodeId, digest: Option<u64>) -> Result<()> {
        self.commands
            .send(Command::ReportHealth { node, digest })
            .await
            .map_err(|_| CoordError::Shutdown)
    }

    pub fn membership(&self) -> MembershipSnapshot {
        self.membership.borrow().clone()
    }

    pub fn watch_membership(&self) -> watch::Receiver<MembershipSnapshot> {
        self.membership.clone()
    }

    pub fn election(&self) -> ElectionState {
        self.election.borrow().clone()
    }

    pub fn watch_election(&self) -> watch::Receiver<ElectionState> {
        self.election.clone()
    }

    pub async fn statistics(&self) -> Result<ClusterStatistics> {
        self.call(|reply| Command::Statistics { reply }).await
    }

    pub async fn causal_history(&self) -> Result<Vec<CausalEvent>> {
        self.call(|reply| Command::CausalHistory { reply }).await
    }

    pub async fn checkpoints(&self) -> Result<Vec<CheckpointInfo>> {
        self.call(|reply| Command::Checkpoints { reply }).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Persist state, stop background tasks and end the actor.
    pub async fn shutdown(&self) -> Result<()> {
        self.call(|reply| Command::Shutdown { reply }).await
    }
}

/// The actor. Constructed and driven by [`Engine::start`].
pub struct Engine {
    id: NodeId,
    config: EngineConfig,
    transport: Arc<dyn Transport>,
    store: StateStore,

    membership: MembershipStore,
    detector: FailureDetector,
    election: ElectionCore,
    backoff: ElectionBackoff,
    ricart_agrawala: RicartAgrawala,
    suzuki_kasami: SuzukiKasami,
    byzantine: ByzantineDetector,
    replication: ReplicationLog,
    clock: LocalClock,
    history: CausalHistory,

    observations: HashMap<NodeId, Observation>,
    pending: HashMap<String, PendingRequest>,
    suspicions: HashMap<AgreementId, oneshot::Sender<Result<VerdictRecord>>>,
    checkpoint_waiter: Option<(CheckpointSeq, oneshot::Sender<Result<CheckpointInfo>>)>,
    restore_fetch: Option<RestoreFetch>,

    election_deadline: Option<Instant>,
    timers: BTreeSet<(Instant, Timer)>,
    persisted_election: PersistedElection,
    announced_leader: (Term, Option<NodeId>),

    commands: mpsc::Receiver<Command>,
    inbox: mpsc::Receiver<Envelope>,
    events: broadcast::Sender<EngineEvent>,
    membership_view: watch::Sender<MembershipSnapshot>,
    election_view: watch::Sender<ElectionState>,
    tasks: BackgroundTaskRegistry,
    cancel: CancellationToken,
}

impl Engine {
    /// Start an engine on an in-memory network.
    ///
    /// State is kept under `config.data_path` when set, in memory otherwise.
    pub async fn connect(config: EngineConfig, network: &InMemoryNetwork) -> Result<EngineHandle> {
        let store = match &config.data_path {
            Some(path) => StateStore::local(path, config.node_id)?,
            None => StateStore::in_memory(config.node_id),
        };
        let (transport, acceptor) = network.register(config.node_id);
        Self::start(config, transport, acceptor, store).await
    }

    /// Recover persisted state and spawn the actor.
    pub async fn start(
        config: EngineConfig,
        transport: Arc<dyn Transport>,
        acceptor: LinkAcceptor,
        store: StateStore,
    ) -> Result<EngineHandle> {
        config
            .validate()
            .map_err(|errors| CoordError::Config(errors.join("; ")))?;
        let id = config.node_id;
        if transport.local_id() != id {
            return Err(CoordError::Config(format!(
                "transport is bound to {} but the engine is configured as {}",
                transport.local_id(),
                id
            )));
        }

        let recovered = store.recover().await?;
        let fresh = recovered.election.is_none() && recovered.checkpoints.is_empty();

        let membership = match recovered.membership {
            Some(snapshot) => MembershipStore::from_snapshot(snapshot),
            None => MembershipStore::with_seeds(config.seed_members.iter().copied()),
        };
        let election = match recovered.election {
            Some(persisted) => ElectionCore::from_persisted(id, config.leader_ack_rounds, persisted),
            None => ElectionCore::new(id, config.leader_ack_rounds),
        };
        let mut replication = ReplicationLog::new(id, config.replica_chain.clone(), config.checkpoint_retention);
        replication.load(recovered.checkpoints, recovered.next_sequence);
        replication.load_replicas(recovered.replicas);

        // a restarted minter must not mint a second token
        let minter = if fresh { config.token_minter() } else { None };

        let detector = FailureDetector::new(config.failure_detector_config());
        for (node, status) in membership.members() {
            if node != id && status.counts_toward_quorum() {
                detector.track(node);
            }
        }

        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_CHANNEL_CAPACITY);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (membership_view, membership_rx) = watch::channel(membership.snapshot());
        let (election_view, election_rx) = watch::channel(election.state());

        let cancel = CancellationToken::new();
        let persisted_election = election.persisted();
        let announced_leader = (election.term(), election.leader());

        info!(
            node = %id,
            members = membership.active_count(),
            term = %election.term(),
            checkpoints = replication.committed_count(),
            fresh,
            "Starting engine"
        );

        let mut engine = Engine {
            id,
            backoff: ElectionBackoff::new(config.election_timeout, config.election_jitter_factor),
            ricart_agrawala: RicartAgrawala::new(id),
            suzuki_kasami: SuzukiKasami::new(id, minter),
            byzantine: ByzantineDetector::new(id, config.fault_tolerance),
            clock: LocalClock::new(id),
            history: CausalHistory::new(config.causal_history_limit),
            tasks: BackgroundTaskRegistry::with_token(cancel.child_token()),
            config,
            transport,
            store,
            membership,
            detector,
            election,
            replication,
            observations: HashMap::new(),
            pending: HashMap::new(),
            suspicions: HashMap::new(),
            checkpoint_waiter: None,
            restore_fetch: None,
            election_deadline: None,
            timers: BTreeSet::new(),
            persisted_election,
            announced_leader,
            commands: command_rx,
            inbox: inbox_rx,
            events: events.clone(),
            membership_view,
            election_view,
            cancel,
        };
        engine.spawn_background(&command_tx, inbox_tx, acceptor);
        engine.publish_member_counts();
        engine.after_step();

        tokio::spawn(engine.run());

        Ok(EngineHandle {
            node_id: id,
            commands: command_tx,
            membership: membership_rx,
            election: election_rx,
            events,
        })
    }

    fn spawn_background(
        &mut self,
        commands: &mpsc::Sender<Command>,
        inbox: mpsc::Sender<Envelope>,
        mut acceptor: LinkAcceptor,
    ) {
        let readers = self.cancel.child_token();
        self.tasks.spawn("link_acceptor", async move {
            while let Some(link) = acceptor.recv().await {
                tokio::spawn(read_link(link, inbox.clone(), readers.child_token()));
            }
        });

        // tickers hold weak senders so dropping every handle stops the engine
        let ticker = |tick: Tick| {
            let commands = commands.downgrade();
            move || {
                let commands = commands.clone();
                async move {
                    match commands.upgrade() {
                        Some(commands) => commands.send(Command::Tick(tick)).await.is_ok(),
                        None => false,
                    }
                }
            }
        };

        let heartbeat = self.config.heartbeat_interval;
        self.tasks
            .spawn_jittered("heartbeat", heartbeat, ticker(Tick::Heartbeat));
        self.tasks
            .spawn_periodic("failure_check", heartbeat, ticker(Tick::FailureCheck));
        if let Some(interval) = self.config.checkpoint_interval {
            self.tasks
                .spawn_periodic("checkpoint", interval, ticker(Tick::Checkpoint));
        }
    }

    async fn run(mut self) {
        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                command = self.commands.recv() => match command {
                    Some(command) => {
                        if !self.handle_command(command).await {
                            return;
                        }
                    }
                    None => break,
                },
                Some(envelope) = self.inbox.recv() => self.handle_envelope(envelope).await,
                _ = sleep_until(deadline) => self.fire_timers().await,
            }
            self.after_step();
        }
        self.shutdown().await;
    }

    fn next_deadline(&self) -> Option<Instant> {
        let timer = self.timers.first().map(|(at, _)| *at);
        match (self.election_deadline, timer) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Keep the election timer armed whenever this node could need to run,
    /// then publish the read-only views.
    fn after_step(&mut self) {
        if self.election.is_leader() || !self.membership.is_active(self.id) {
            self.election_deadline = None;
        } else if self.election_deadline.is_none() {
            self.arm_election_timer();
        }

        let snapshot = self.membership.snapshot();
        self.membership_view.send_if_modified(|current| {
            if *current != snapshot {
                *current = snapshot;
                true
            } else {
                false
            }
        });
        let state = self.election.state();
        self.election_view.send_if_modified(|current| {
            if *current != state {
                *current = state;
                true
            } else {
                false
            }
        });
    }

    fn arm_election_timer(&mut self) {
        let timeout = retry::election_timeout(self.config.election_timeout, self.config.election_jitter_factor);
        self.election_deadline = Some(Instant::now() + timeout);
    }

    fn emit(&mut self, event: EngineEvent) {
        let stamp = self.clock.tick();
        self.history.record(self.id, stamp, event.describe());
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    // ---------------------------------------------------------------------
    // Sending
    // ---------------------------------------------------------------------

    async fn send_all(&mut self, outbound: Vec<Outbound>) {
        for message in outbound {
            self.send(message).await;
        }
    }

    async fn send(&mut self, outbound: Outbound) {
        let Outbound { to, message } = outbound;
        if to == self.id {
            return;
        }
        let kind = message.kind();
        let envelope = Envelope {
            from: self.id,
            term: self.election.term(),
            clock: self.clock.tick(),
            message,
        };
        let frame = match encode_frame(&envelope) {
            Ok(frame) => frame,
            Err(e) => {
                error!(node = %self.id, to = %to, kind, error = %e, "Failed to encode message");
                return;
            }
        };
        match self.transport.send(to, frame).await {
            Ok(()) => metrics::record_message(kind, "out"),
            Err(e) => warn!(node = %self.id, to = %to, kind, error = %e, "Send failed"),
        }
    }

    /// Members other than this node that should hear liveness traffic.
    fn reachable_peers(&self) -> Vec<NodeId> {
        self.membership
            .members()
            .filter(|(node, status)| *node != self.id && status.counts_toward_quorum())
            .map(|(node, _)| node)
            .collect()
    }

    fn active_peers(&self) -> Vec<NodeId> {
        self.membership
            .active_members()
            .into_iter()
            .filter(|n| *n != self.id)
            .collect()
    }

    // ---------------------------------------------------------------------
    // Commands
    // ---------------------------------------------------------------------

    /// Returns false once the engine has shut down.
    async fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Join { node, reply } => {
                let result = self.join(node).await;
                let _ = reply.send(result);
            }
            Command::Leave { node, reply } => {
                let result = self.transition(node, |m| m.leave(node)).await;
                let _ = reply.send(result);
            }
            Command::MarkFailed { node, reply } => {
                let result = self.transition(node, |m| m.mark_failed(node)).await;
                let _ = reply.send(result);
            }
            Command::Request { resource, reply } => self.request_resource(resource, reply).await,
            Command::Withdraw { resource } => self.withdraw_resource(&resource).await,
            Command::Release { resource, reply } => {
                self.release_resource(&resource).await;
                let _ = reply.send(Ok(()));
            }
            Command::RaiseSuspicion { node, reply } => self.raise_suspicion(node, reply).await,
            Command::ForceCheckpoint { reply } => self.create_checkpoint(Some(reply)).await,
            Command::Restore { sequence, reply } => self.restore(sequence, reply).await,
            Command::ReportHealth { node, digest } => self.report_health(node, digest).await,
            Command::Statistics { reply } => {
                let _ = reply.send(self.statistics());
            }
            Command::CausalHistory { reply } => {
                let _ = reply.send(self.history.ordered());
            }
            Command::Checkpoints { reply } => {
                let infos = self.replication.committed().map(CheckpointInfo::from).collect();
                let _ = reply.send(infos);
            }
            Command::Tick(Tick::Heartbeat) => self.heartbeat_tick().await,
            Command::Tick(Tick::FailureCheck) => self.failure_check().await,
            Command::Tick(Tick::Checkpoint) => {
                if self.replication.in_flight().is_none() && self.membership.is_active(self.id) {
                    self.create_checkpoint(None).await;
                }
            }
            Command::Shutdown { reply } => {
                self.shutdown().await;
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    async fn join(&mut self, node: NodeId) -> Result<MembershipVersion> {
        let version = self.transition(node, |m| Ok(m.join(node))).await?;
        if node == self.id {
            // this node is alive by definition; peers activate it on contact
            return self.transition(node, |m| m.activate(node)).await;
        }
        Ok(version)
    }

    fn statistics(&self) -> ClusterStatistics {
        let snapshot = self.membership.snapshot();
        let members_by_status = MemberStatus::ALL
            .iter()
            .map(|s| (s.to_string(), snapshot.count(*s)))
            .collect();
        let mut held = self.ricart_agrawala.held_resources();
        held.extend(self.suzuki_kasami.held_resources());
        ClusterStatistics {
            node: self.id,
            role: self.election.role(),
            term: self.election.term(),
            leader: self.election.leader(),
            membership_version: snapshot.version,
            members_by_status,
            held_resources: held,
            pending_resources: self.pending.keys().cloned().collect(),
            committed_checkpoints: self.replication.committed_count(),
            last_checkpoint: self.replication.latest().map(|c| c.sequence),
            verdicts: self.byzantine.verdict_counts(),
            active_agreements: self.byzantine.active_agreements().len(),
            causal_events: self.history.len(),
            background_tasks: self.tasks.health_check(),
        }
    }

    // ---------------------------------------------------------------------
    // Membership
    // ---------------------------------------------------------------------

    /// Apply a membership operation and react to the resulting status change.
    async fn transition(
        &mut self,
        node: NodeId,
        op: impl FnOnce(&mut MembershipStore) -> Result<MembershipVersion>,
    ) -> Result<MembershipVersion> {
        let before = self.membership.status_of(node);
        let version = op(&mut self.membership)?;
        let after = self.membership.status_of(node);
        if before != after {
            if let Some(to) = after {
                self.member_changed(node, before, to).await;
                self.persist_membership().await;
            }
        }
        Ok(version)
    }

    /// React to every status difference between `before` and the current view.
    async fn reconcile_membership(&mut self, before: &MembershipSnapshot) {
        let mut nodes: BTreeSet<NodeId> = before.members.keys().copied().collect();
        nodes.extend(self.membership.members().map(|(node, _)| node));

        let mut changed = false;
        for node in nodes {
            let from = before.status_of(node);
            match self.membership.status_of(node) {
                Some(to) if from != Some(to) => {
                    self.member_changed(node, from, to).await;
                    changed = true;
                }
                None if from.is_some() => {
                    self.detector.untrack(node);
                    changed = true;
                }
                _ => {}
            }
        }
        if changed {
            self.persist_membership().await;
        }
    }

    async fn member_changed(&mut self, node: NodeId, from: Option<MemberStatus>, to: MemberStatus) {
        self.emit(EngineEvent::MembershipChanged {
            version: self.membership.version(),
            node,
            from,
            to,
        });
        self.publish_member_counts();

        match to {
            MemberStatus::Joining | MemberStatus::Active => {
                let was_departed = !from.is_some_and(|s| s.counts_toward_quorum());
                if node != self.id && was_departed {
                    self.detector.track(node);
                }
                if to == MemberStatus::Active {
                    let outbound = self.ricart_agrawala.peer_activated(node);
                    self.send_all(outbound).await;
                }
            }
            MemberStatus::Suspected => {
                self.peer_left_active(node).await;
            }
            MemberStatus::Failed | MemberStatus::Left => {
                self.detector.untrack(node);
                self.peer_left_active(node).await;
                self.suzuki_kasami.peer_departed(node);
                if self.election.leader_departed(node) {
                    self.arm_election_timer();
                    self.announce_leader();
                }
                if let Some(checkpoint) = self.replication.replica_departed(node) {
                    self.checkpoint_committed(checkpoint).await;
                }
                if node == self.id {
                    self.drop_all_resources().await;
                }
            }
        }
    }

    /// Awaited Ricart–Agrawala replies from `node` no longer count.
    async fn peer_left_active(&mut self, node: NodeId) {
        for resource in self.ricart_agrawala.peer_departed(node) {
            self.complete_grant(&resource).await;
        }
    }

    fn publish_member_counts(&self) {
        let snapshot = self.membership.snapshot();
        for status in MemberStatus::ALL {
            metrics::set_member_count(self.id, &status.to_string(), snapshot.count(status));
        }
    }

    async fn persist_membership(&self) {
        if let Err(e) = self.store.save_membership(&self.membership.snapshot()).await {
            error!(node = %self.id, error = %e, "Failed to persist membership");
        }
    }

    /// Any message or report from `node` is evidence that it is alive.
    async fn note_contact(&mut self, node: NodeId) {
        self.detector.record_contact(node);
        if matches!(
            self.membership.status_of(node),
            Some(MemberStatus::Joining | MemberStatus::Suspected)
        ) {
            let _ = self.transition(node, |m| m.activate(node)).await;
        }
    }

    async fn failure_check(&mut self) {
        for change in self.detector.check() {
            let node = change.node;
            let result = match change.current {
                PeerHealth::Suspected => self.transition(node, |m| m.mark_suspected(node)).await,
                PeerHealth::Failed => self.transition(node, |m| m.mark_failed(node)).await,
                PeerHealth::Healthy => continue,
            };
            if let Err(e) = result {
                debug!(node = %self.id, peer = %node, error = %e, "Health change not applied");
            }
        }
    }

    async fn maybe_sync(&mut self, peer: NodeId, remote_version: MembershipVersion) {
        if remote_version < self.membership.version() {
            let snapshot = self.membership.snapshot();
            self.send(Outbound::new(peer, Message::MembershipSync { snapshot }))
                .await;
        }
    }

    async fn merge_membership(&mut self, remote: MembershipSnapshot) {
        let before = self.membership.snapshot();
        if self.membership.merge(&remote, self.id) {
            self.reconcile_membership(&before).await;
        }
        // peers admitted this node: adopt that locally
        if remote.status_of(self.id) == Some(MemberStatus::Active) {
            match self.membership.status_of(self.id) {
                None => {
                    let _ = self.join(self.id).await;
                }
                Some(MemberStatus::Joining) => {
                    let id = self.id;
                    let _ = self.transition(id, |m| m.activate(id)).await;
                }
                _ => {}
            }
        }
    }

    // ---------------------------------------------------------------------
    // Election
    // ---------------------------------------------------------------------

    /// Persist the election state if it changed, then send.
    async fn dispatch_election(&mut self, outbound: Vec<Outbound>) {
        let persisted = self.election.persisted();
        if persisted != self.persisted_election {
            if let Err(e) = self.store.save_election(&persisted).await {
                // a vote that is not durable must not leave this node
                error!(node = %self.id, error = %e, "Failed to persist election state");
                return;
            }
            self.persisted_election = persisted;
        }
        self.send_all(outbound).await;
        self.announce_leader();
    }

    fn announce_leader(&mut self) {
        let current = (self.election.term(), self.election.leader());
        if current == self.announced_leader {
            return;
        }
        let (previous_term, previous_leader) = self.announced_leader;
        self.announced_leader = current;
        let (term, leader) = current;

        if term != previous_term {
            metrics::set_current_term(self.id, term.value());
        }
        // a new candidacy term with still no leader is not a leader change
        if leader.is_none() && previous_leader.is_none() {
            return;
        }
        if let Some(leader) = leader {
            metrics::record_leader_change(self.id, term.value());
            if leader == self.id {
                metrics::record_election(self.id, "won");
                self.backoff.reset();
            }
        }
        self.emit(EngineEvent::LeaderChanged { term, leader });
    }

    async fn on_election_timeout(&mut self) {
        self.election_deadline = None;
        match self.election.role() {
            Role::Leader => return,
            Role::Candidate => {
                self.election.abandon_candidacy();
                metrics::record_election(self.id, "timeout");
            }
            Role::Follower => {}
        }

        match self.election.start_election(&self.membership) {
            Ok(outbound) => {
                metrics::record_election(self.id, "started");
                self.dispatch_election(outbound).await;
                if self.election.role() == Role::Candidate {
                    self.election_deadline = Some(Instant::now() + self.backoff.next_delay());
                }
            }
            Err(e) => {
                debug!(node = %self.id, error = %e, "Election not started");
                metrics::record_election(self.id, "no_quorum");
                self.arm_election_timer();
            }
        }
    }

    async fn heartbeat_tick(&mut self) {
        if self.election.is_leader() {
            let outbound = self.election.heartbeat_round(&self.membership);
            if !self.election.is_leader() {
                metrics::record_election(self.id, "stepped_down");
                self.arm_election_timer();
            }
            self.send_all(outbound).await;
            self.announce_leader();
            // Suspected and Joining members get no heartbeat; keep them in touch
            let version = self.membership.version();
            for peer in self.reachable_peers() {
                if !self.membership.is_active(peer) {
                    self.send(Outbound::new(peer, Message::Ping { membership_version: version }))
                        .await;
                }
            }
        } else if !matches!(
            self.membership.status_of(self.id),
            Some(MemberStatus::Failed | MemberStatus::Left)
        ) {
            let message = Message::Ping {
                membership_version: self.membership.version(),
            };
            let outbound = Outbound::broadcast(self.reachable_peers(), message);
            self.send_all(outbound).await;
        }
    }

    // ---------------------------------------------------------------------
    // Resources
    // ---------------------------------------------------------------------

    fn holds(&self, resource: &str) -> bool {
        self.ricart_agrawala.holds(resource) || self.suzuki_kasami.holds(resource)
    }

    async fn request_resource(&mut self, resource: String, reply: oneshot::Sender<Result<ResourceGrant>>) {
        if self.pending.contains_key(&resource) || self.holds(&resource) {
            let _ = reply.send(Err(CoordError::ResourceBusy { resource }));
            return;
        }
        if !self.membership.is_active(self.id) {
            let _ = reply.send(Err(CoordError::InvalidTransition {
                node: self.id,
                from: self.membership.status_of(self.id).unwrap_or(MemberStatus::Left),
                to: MemberStatus::Active,
            }));
            return;
        }
        if !self.membership.has_quorum() {
            let _ = reply.send(Err(self.membership.quorum_error()));
            return;
        }

        let protocol = self.config.protocol_for(&resource);
        let timestamp = self.clock.tick();
        let peers = self.active_peers();
        let outcome = match protocol {
            ResourceProtocol::RicartAgrawala => self
                .ricart_agrawala
                .request(&resource, timestamp, &peers)
                .map(|o| (o.sequence, o.granted, o.outbound)),
            ResourceProtocol::SuzukiKasami => self
                .suzuki_kasami
                .request(&resource, timestamp, &peers)
                .map(|o| (o.sequence, o.granted, o.outbound)),
        };

        match outcome {
            Ok((sequence, granted, outbound)) => {
                debug!(node = %self.id, resource = %resource, protocol = %protocol, sequence, "Requesting resource");
                self.pending.insert(
                    resource.clone(),
                    PendingRequest {
                        protocol,
                        sequence,
                        started: Instant::now(),
                        reply,
                    },
                );
                self.send_all(outbound).await;
                if granted {
                    self.complete_grant(&resource).await;
                }
            }
            Err(e) => {
                let _ = reply.send(Err(e));
            }
        }
    }

    /// The core granted `resource`; hand it to the waiting caller.
    async fn complete_grant(&mut self, resource: &str) {
        let Some(pending) = self.pending.remove(resource) else {
            debug!(node = %self.id, resource, "Grant with no waiting caller, releasing");
            self.relinquish(resource).await;
            return;
        };
        if !self.membership.has_quorum() {
            let _ = pending.reply.send(Err(self.membership.quorum_error()));
            self.relinquish(resource).await;
            return;
        }

        let waited = pending.started.elapsed();
        let grant = ResourceGrant {
            resource: resource.to_string(),
            protocol: pending.protocol,
            sequence: pending.sequence,
            waited,
        };
        if pending.reply.send(Ok(grant)).is_err() {
            debug!(node = %self.id, resource, "Caller gave up before the grant, releasing");
            self.relinquish(resource).await;
            return;
        }

        metrics::record_grant(pending.protocol.label(), waited.as_secs_f64());
        info!(node = %self.id, resource, protocol = %pending.protocol, waited_ms = waited.as_millis() as u64, "Resource granted");
        self.emit(EngineEvent::ResourceGranted {
            resource: resource.to_string(),
            protocol: pending.protocol,
            waited,
        });
    }

    /// Give up `resource`, held or pending. Returns true if it was held.
    async fn relinquish(&mut self, resource: &str) -> bool {
        let peers = self.active_peers();
        let (held, outbound) = match self.config.protocol_for(resource) {
            ResourceProtocol::RicartAgrawala => {
                let held = self.ricart_agrawala.holds(resource);
                (held, self.ricart_agrawala.release(resource, &peers))
            }
            ResourceProtocol::SuzukiKasami => {
                let held = self.suzuki_kasami.holds(resource);
                let membership = &self.membership;
                let outbound = self
                    .suzuki_kasami
                    .withdraw(resource, &peers, |n| membership.is_active(n));
                (held, outbound)
            }
        };
        self.send_all(outbound).await;
        held
    }

    async fn withdraw_resource(&mut self, resource: &str) {
        let was_pending = self.pending.remove(resource).is_some();
        if was_pending || self.holds(resource) {
            let held = self.relinquish(resource).await;
            info!(node = %self.id, resource, held, "Resource request withdrawn");
            if held {
                self.emit(EngineEvent::ResourceReleased {
                    resource: resource.to_string(),
                });
            }
        }
    }

    async fn release_resource(&mut self, resource: &str) {
        if !self.holds(resource) {
            debug!(node = %self.id, resource, "Release of a resource not held");
            return;
        }
        self.relinquish(resource).await;
        info!(node = %self.id, resource, "Resource released");
        self.emit(EngineEvent::ResourceReleased {
            resource: resource.to_string(),
        });
    }

    /// This node left or failed: nothing it held or wanted survives.
    async fn drop_all_resources(&mut self) {
        for (resource, pending) in std::mem::take(&mut self.pending) {
            let _ = pending.reply.send(Err(CoordError::Cancelled {
                resource: resource.clone(),
            }));
            self.relinquish(&resource).await;
        }
        let mut held = self.ricart_agrawala.held_resources();
        held.extend(self.suzuki_kasami.held_resources());
        for resource in held {
            self.release_resource(&resource).await;
        }
    }

    // ---------------------------------------------------------------------
    // Byzantine agreement
    // ---------------------------------------------------------------------

    /// What this node itself observed of `subject`.
    fn observe(&self, subject: NodeId) -> Observation {
        if subject == self.id {
            return Observation::NoObservation;
        }
        if let Some(observation) = self.observations.get(&subject) {
            return *observation;
        }
        match self.detector.health_of(subject) {
            Some(PeerHealth::Healthy) => Observation::Responsive { digest: 0 },
            Some(PeerHealth::Suspected | PeerHealth::Failed) => Observation::Unresponsive,
            None => Observation::NoObservation,
        }
    }

    async fn report_health(&mut self, node: NodeId, digest: Option<u64>) {
        let observation = match digest {
            Some(digest) => Observation::Responsive { digest },
            None => Observation::Unresponsive,
        };
        self.observations.insert(node, observation);
        if digest.is_some() {
            self.note_contact(node).await;
        }
    }

    async fn raise_suspicion(&mut self, node: NodeId, reply: oneshot::Sender<Result<VerdictRecord>>) {
        let observation = self.observe(node);
        let provider = move |_: NodeId| observation;
        match self.byzantine.start(node, &self.membership, &provider) {
            Ok((id, step)) => {
                info!(node = %self.id, agreement = %id, "Raised suspicion");
                self.suspicions.insert(id, reply);
                self.process_agreement(step).await;
            }
            Err(e) => {
                if let CoordError::AgreementInconclusive { .. } = e {
                    if let Some(record) = self.byzantine.verdicts().last().cloned() {
                        self.emit(EngineEvent::SuspicionVerdict {
                            agreement: record.id,
                            verdict: record.verdict,
                        });
                    }
                }
                let _ = reply.send(Err(e));
            }
        }
    }

    async fn process_agreement(&mut self, step: AgreementStep) {
        let AgreementStep {
            outbound,
            rounds_started,
            verdict,
        } = step;
        self.send_all(outbound).await;
        let deadline = Instant::now() + self.config.round_timeout();
        for (id, round) in rounds_started {
            self.timers.insert((deadline, Timer::AgreementRound(id, round)));
        }
        if let Some(record) = verdict {
            self.finalize_verdict(record).await;
        }
    }

    async fn finalize_verdict(&mut self, record: VerdictRecord) {
        let subject = record.id.subject;
        info!(
            node = %self.id,
            agreement = %record.id,
            verdict = %record.verdict,
            participants = record.participants.len(),
            "Agreement finalized"
        );
        self.timers
            .retain(|(_, timer)| !matches!(timer, Timer::AgreementRound(id, _) if *id == record.id));
        self.emit(EngineEvent::SuspicionVerdict {
            agreement: record.id,
            verdict: record.verdict,
        });
        if record.verdict == Verdict::Faulty && subject != self.id {
            if let Err(e) = self.transition(subject, |m| m.mark_failed(subject)).await {
                warn!(node = %self.id, subject = %subject, error = %e, "Could not mark faulty node failed");
            }
        }
        if let Some(waiter) = self.suspicions.remove(&record.id) {
            let _ = waiter.send(Ok(record));
        }
    }

    // ---------------------------------------------------------------------
    // Checkpoints
    // ---------------------------------------------------------------------

    fn capture_state(&self) -> CheckpointState {
        let mut held = self.ricart_agrawala.held_resources();
        held.extend(self.suzuki_kasami.held_resources());
        CheckpointState {
            membership: self.membership.snapshot(),
            term: self.election.term(),
            ownership: ResourceOwnership {
                held,
                tokens: self.suzuki_kasami.tokens(),
            },
        }
    }

    async fn create_checkpoint(&mut self, waiter: Option<oneshot::Sender<Result<CheckpointInfo>>>) {
        let state = self.capture_state();
        let clock = self.clock.current().clone();
        let membership = &self.membership;
        let started = self.replication.begin(state, clock, |n| {
            membership
                .status_of(n)
                .is_some_and(|s| s.counts_toward_quorum())
        });

        match started {
            Ok(start) => {
                let sequence = start.checkpoint.sequence;
                if let Some(waiter) = waiter {
                    self.checkpoint_waiter = Some((sequence, waiter));
                }
                self.send_all(start.outbound).await;
                if start.committed {
                    self.checkpoint_committed(start.checkpoint).await;
                } else {
                    let deadline = Instant::now() + self.config.replication_timeout;
                    self.timers.insert((deadline, Timer::Replication(sequence)));
                }
            }
            Err(e) => {
                debug!(node = %self.id, error = %e, "Checkpoint not started");
                if let Some(waiter) = waiter {
                    let _ = waiter.send(Err(e));
                }
            }
        }
    }

    async fn checkpoint_committed(&mut self, checkpoint: Checkpoint) {
        let sequence = checkpoint.sequence;
        self.timers
            .retain(|(_, timer)| *timer != Timer::Replication(sequence));

        let manifest = CheckpointManifest {
            committed: self.replication.committed().map(|c| c.sequence).collect(),
            next_sequence: self.replication.next_sequence(),
        };
        let persisted = self.store.save_checkpoint(&checkpoint, &manifest).await;
        if let Err(e) = &persisted {
            error!(node = %self.id, sequence = %sequence, error = %e, "Failed to persist checkpoint");
        }

        metrics::record_checkpoint("committed");
        info!(node = %self.id, sequence = %sequence, digest = checkpoint.digest, "Checkpoint committed");
        self.emit(EngineEvent::CheckpointCommitted {
            sequence,
            digest: checkpoint.digest,
        });

        if let Some((waiting_for, waiter)) = self.checkpoint_waiter.take() {
            if waiting_for == sequence {
                let result = persisted.map(|()| CheckpointInfo::from(&checkpoint));
                let _ = waiter.send(result);
            } else {
                self.checkpoint_waiter = Some((waiting_for, waiter));
            }
        }
    }

    async fn replication_timed_out(&mut self, sequence: CheckpointSeq) {
        let Some(err) = self.replication.timeout(sequence) else {
            return;
        };
        metrics::record_checkpoint("timeout");
        warn!(node = %self.id, error = %err, "Checkpoint replication timed out");
        if let CoordError::ReplicationTimeout { replica, .. } = &err {
            let replica = *replica;
            if let Err(e) = self.transition(replica, |m| m.mark_suspected(replica)).await {
                debug!(node = %self.id, replica = %replica, error = %e, "Replica not marked suspected");
            }
        }
        if let Some((waiting_for, waiter)) = self.checkpoint_waiter.take() {
            if waiting_for == sequence {
                let _ = waiter.send(Err(err));
            } else {
                self.checkpoint_waiter = Some((waiting_for, waiter));
            }
        }
    }

    /// Restore from the newest local checkpoint at or below `sequence`, or
    /// fetch one back from the replica chain when there is none.
    async fn restore(&mut self, sequence: CheckpointSeq, reply: oneshot::Sender<Result<CheckpointInfo>>) {
        let missing = match self.replication.latest_at_or_below(sequence).cloned() {
            Ok(checkpoint) => {
                let info = self.apply_checkpoint(&checkpoint, sequence).await;
                let _ = reply.send(Ok(info));
                return;
            }
            Err(e) => e,
        };
        if let Some(fetch) = &self.restore_fetch {
            let _ = reply.send(Err(CoordError::RestoreInProgress(fetch.sequence)));
            return;
        }

        let membership = &self.membership;
        let mut route: VecDeque<NodeId> = self
            .replication
            .fetch_route(|n| {
                membership
                    .status_of(n)
                    .is_some_and(|s| s.counts_toward_quorum())
            })
            .into();
        let Some(first) = route.pop_front() else {
            let _ = reply.send(Err(missing));
            return;
        };
        info!(node = %self.id, sequence = %sequence, replica = %first, "No local checkpoint, fetching from replicas");
        self.restore_fetch = Some(RestoreFetch {
            sequence,
            asking: first,
            remaining: route,
            reply,
        });
        self.ask_replica(first, sequence).await;
    }

    async fn ask_replica(&mut self, replica: NodeId, sequence: CheckpointSeq) {
        let deadline = Instant::now() + self.config.replication_timeout;
        self.timers.insert((deadline, Timer::Fetch(replica)));
        self.send(Outbound::new(replica, Message::CheckpointFetch { sequence }))
            .await;
    }

    /// Move on to the next replica, or fail the restore when none is left.
    async fn fetch_next_replica(&mut self) {
        let Some(fetch) = self.restore_fetch.as_mut() else {
            return;
        };
        let sequence = fetch.sequence;
        match fetch.remaining.pop_front() {
            Some(next) => {
                fetch.asking = next;
                self.ask_replica(next, sequence).await;
            }
            None => {
                if let Some(fetch) = self.restore_fetch.take() {
                    warn!(node = %self.id, sequence = %sequence, "No replica holds a usable checkpoint");
                    let _ = fetch.reply.send(Err(CoordError::CheckpointNotFound(sequence)));
                }
            }
        }
    }

    async fn handle_checkpoint_copy(
        &mut self,
        from: NodeId,
        sequence: CheckpointSeq,
        checkpoint: Option<Checkpoint>,
    ) {
        let expected = self
            .restore_fetch
            .as_ref()
            .is_some_and(|f| f.asking == from && f.sequence == sequence);
        if !expected {
            debug!(node = %self.id, peer = %from, sequence = %sequence, "Ignoring unexpected checkpoint copy");
            return;
        }
        self.timers.retain(|(_, timer)| *timer != Timer::Fetch(from));

        let Some(checkpoint) = checkpoint.filter(|c| c.sequence <= sequence) else {
            debug!(node = %self.id, replica = %from, sequence = %sequence, "Replica has no copy");
            self.fetch_next_replica().await;
            return;
        };
        if let Err(e) = self.replication.adopt(checkpoint.clone()) {
            warn!(node = %self.id, replica = %from, error = %e, "Rejected fetched checkpoint");
            metrics::record_dropped("corrupt_checkpoint");
            self.fetch_next_replica().await;
            return;
        }
        let Some(fetch) = self.restore_fetch.take() else {
            return;
        };

        let manifest = CheckpointManifest {
            committed: self.replication.committed().map(|c| c.sequence).collect(),
            next_sequence: self.replication.next_sequence(),
        };
        if let Err(e) = self.store.save_checkpoint(&checkpoint, &manifest).await {
            error!(node = %self.id, sequence = %checkpoint.sequence, error = %e, "Failed to persist fetched checkpoint");
        }
        let info = self.apply_checkpoint(&checkpoint, sequence).await;
        let _ = fetch.reply.send(Ok(info));
    }

    async fn apply_checkpoint(&mut self, checkpoint: &Checkpoint, requested: CheckpointSeq) -> CheckpointInfo {
        let state = &checkpoint.state;

        let before = self.membership.snapshot();
        self.membership = MembershipStore::from_snapshot(state.membership.clone());
        self.reconcile_membership(&before).await;

        self.election.restore(state.term);
        self.dispatch_election(Vec::new()).await;

        for (resource, pending) in self.pending.drain() {
            let _ = pending.reply.send(Err(CoordError::Cancelled { resource }));
        }
        let (token_held, permission_held): (BTreeSet<String>, BTreeSet<String>) = state
            .ownership
            .held
            .iter()
            .cloned()
            .partition(|r| self.config.protocol_for(r) == ResourceProtocol::SuzukiKasami);
        self.ricart_agrawala.restore(&permission_held);
        self.suzuki_kasami
            .restore(&state.ownership.tokens, &token_held);

        let mut clock = self.clock.current().clone();
        clock.merge(&checkpoint.clock);
        self.clock.reset_to(clock);

        metrics::record_checkpoint("restored");
        info!(
            node = %self.id,
            requested = %requested,
            restored = %checkpoint.sequence,
            term = %state.term,
            "Restored checkpoint"
        );
        CheckpointInfo::from(checkpoint)
    }

    // ---------------------------------------------------------------------
    // Inbound
    // ---------------------------------------------------------------------

    async fn handle_envelope(&mut self, envelope: Envelope) {
        let Envelope {
            from,
            term: _,
            clock,
            message,
        } = envelope;
        if from == self.id {
            return;
        }
        metrics::record_message(message.kind(), "in");
        self.clock.merge(&clock);
        self.note_contact(from).await;

        let departed = matches!(
            self.membership.status_of(from),
            Some(MemberStatus::Failed | MemberStatus::Left)
        );
        if departed
            && matches!(
                message,
                Message::VoteRequest { .. }
                    | Message::VoteReply { .. }
                    | Message::Heartbeat { .. }
                    | Message::ResourceRequest { .. }
            )
        {
            // departed members get no votes and no permissions
            debug!(node = %self.id, peer = %from, kind = message.kind(), "Ignoring traffic from departed member");
            metrics::record_dropped("departed_sender");
            return;
        }

        match message {
            Message::VoteRequest {
                term,
                membership_version,
            } => {
                let outbound =
                    self.election
                        .handle_vote_request(from, term, membership_version, &self.membership);
                if self.election.persisted().voted_for == Some(from) && self.election.term() == term {
                    self.arm_election_timer();
                }
                self.dispatch_election(outbound).await;
            }
            Message::VoteReply { term, granted } => {
                let outbound = self
                    .election
                    .handle_vote_reply(from, term, granted, &self.membership);
                self.dispatch_election(outbound).await;
            }
            Message::Heartbeat {
                term,
                membership_version,
            } => {
                match self.election.handle_heartbeat(from, term) {
                    Ok(outbound) => {
                        self.arm_election_timer();
                        self.backoff.reset();
                        self.dispatch_election(outbound).await;
                    }
                    Err(e) => {
                        debug!(node = %self.id, leader = %from, error = %e, "Dropping heartbeat");
                        metrics::record_dropped("stale_term");
                    }
                }
                self.maybe_sync(from, membership_version).await;
            }
            Message::HeartbeatAck { term } => {
                self.election.handle_heartbeat_ack(from, term);
                self.dispatch_election(Vec::new()).await;
            }
            Message::Ping { membership_version } => {
                self.maybe_sync(from, membership_version).await;
            }
            Message::MembershipSync { snapshot } => self.merge_membership(snapshot).await,
            Message::ResourceRequest {
                resource,
                timestamp,
                sequence,
            } => {
                let outbound = match self.config.protocol_for(&resource) {
                    ResourceProtocol::RicartAgrawala => {
                        self.ricart_agrawala
                            .handle_request(from, &resource, &timestamp, sequence)
                    }
                    ResourceProtocol::SuzukiKasami => {
                        self.suzuki_kasami.handle_request(from, &resource, sequence)
                    }
                };
                self.send_all(outbound).await;
            }
            Message::ResourceReply { resource, sequence } => {
                if self.ricart_agrawala.handle_reply(from, &resource, sequence) {
                    self.complete_grant(&resource).await;
                }
            }
            Message::ResourceRelease { resource, sequence } => match self.config.protocol_for(&resource) {
                ResourceProtocol::RicartAgrawala => {
                    self.ricart_agrawala.handle_release(from, &resource, sequence)
                }
                ResourceProtocol::SuzukiKasami => {
                    self.suzuki_kasami.handle_release(from, &resource, sequence)
                }
            },
            Message::TokenTransfer { token } => {
                let resource = token.resource.clone();
                let membership = &self.membership;
                let delivery = self
                    .suzuki_kasami
                    .handle_token(token, |n| membership.is_active(n));
                match delivery {
                    TokenDelivery::Granted => self.complete_grant(&resource).await,
                    TokenDelivery::Forwarded(outbound) => self.send_all(outbound).await,
                    TokenDelivery::Dropped => metrics::record_dropped("duplicate_token"),
                }
            }
            Message::SuspicionReport(report) => {
                let observation = self.observe(report.id.subject);
                let provider = move |_: NodeId| observation;
                let step = self.byzantine.handle_report(from, report, &provider);
                self.process_agreement(step).await;
            }
            Message::CheckpointReplicate {
                origin,
                checkpoint,
                route,
            } => {
                let copy = checkpoint.clone();
                match self.replication.handle_replicate(origin, checkpoint, &route) {
                    Ok(step) => {
                        if let Err(e) = self.store.save_replica(origin, &copy).await {
                            error!(node = %self.id, origin = %origin, error = %e, "Failed to persist replica copy");
                            return;
                        }
                        self.send(step.ack).await;
                        if let Some(forward) = step.forward {
                            self.send(forward).await;
                        }
                        for stale in step.evicted {
                            self.store.remove_replica(origin, stale).await;
                        }
                    }
                    Err(e) => {
                        warn!(node = %self.id, origin = %origin, error = %e, "Rejected checkpoint copy");
                        metrics::record_dropped("corrupt_checkpoint");
                    }
                }
            }
            Message::CheckpointAck { sequence, replica } => {
                if let Some(checkpoint) = self.replication.handle_ack(sequence, replica) {
                    self.checkpoint_committed(checkpoint).await;
                }
            }
            Message::CheckpointFetch { sequence } => {
                let checkpoint = self.replication.replica_at_or_below(from, sequence).cloned();
                debug!(
                    node = %self.id,
                    origin = %from,
                    requested = %sequence,
                    found = ?checkpoint.as_ref().map(|c| c.sequence),
                    "Serving checkpoint copy"
                );
                self.send(Outbound::new(from, Message::CheckpointCopy { sequence, checkpoint }))
                    .await;
            }
            Message::CheckpointCopy { sequence, checkpoint } => {
                self.handle_checkpoint_copy(from, sequence, checkpoint).await;
            }
        }
    }

    async fn fire_timers(&mut self) {
        let now = Instant::now();
        if self.election_deadline.is_some_and(|at| at <= now) {
            self.on_election_timeout().await;
        }
        while let Some(&(at, timer)) = self.timers.first() {
            if at > now {
                break;
            }
            self.timers.pop_first();
            match timer {
                Timer::AgreementRound(id, round) => {
                    let step = self.byzantine.round_timeout(id, round);
                    self.process_agreement(step).await;
                }
                Timer::Replication(sequence) => self.replication_timed_out(sequence).await,
                Timer::Fetch(replica) => {
                    if self.restore_fetch.as_ref().is_some_and(|f| f.asking == replica) {
                        debug!(node = %self.id, replica = %replica, "Checkpoint fetch timed out");
                        self.fetch_next_replica().await;
                    }
                }
            }
        }
    }

    async fn shutdown(&mut self) {
        info!(node = %self.id, "Shutting down engine");
        self.persist_membership().await;
        let persisted = self.election.persisted();
        if let Err(e) = self.store.save_election(&persisted).await {
            error!(node = %self.id, error = %e, "Failed to persist election state on shutdown");
        }

        for (_, pending) in self.pending.drain() {
            let _ = pending.reply.send(Err(CoordError::Shutdown));
        }
        for (_, waiter) in self.suspicions.drain() {
            let _ = waiter.send(Err(CoordError::Shutdown));
        }
        if let Some((_, waiter)) = self.checkpoint_waiter.take() {
            let _ = waiter.send(Err(CoordError::Shutdown));
        }
        if let Some(fetch) = self.restore_fetch.take() {
            let _ = fetch.reply.send(Err(CoordError::Shutdown));
        }

        self.tasks.shutdown_all(SHUTDOWN_GRACE).await;
        self.cancel.cancel();
        self.commands.close();
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Decode frames from one peer link into the actor inbox.
async fn read_link(mut link: InboundLink, inbox: mpsc::Sender<Envelope>, cancel: CancellationToken) {
    let peer = link.peer;
    let mut buffer = BytesMut::new();
    debug!(peer = %peer, "Accepted link");
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return,
            frame = link.frames.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        buffer.extend_from_slice(&frame);
        loop {
            match try_decode(&mut buffer) {
                Ok(Some(envelope)) => {
                    if envelope.from != peer {
                        warn!(peer = %peer, claimed = %envelope.from, "Dropping envelope with mismatched sender");
                        metrics::record_dropped("sender_mismatch");
                        continue;
                    }
                    if inbox.send(envelope).await.is_err() {
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(peer = %peer, error = %e, "Dropping malformed frame");
                    metrics::record_dropped("malformed");
                }
            }
        }
    }
    debug!(peer = %peer, "Link closed");
}
