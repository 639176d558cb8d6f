//! The service facade.
//!
//! [`A2dpService`] wires the registry, the admission policy, the arbiter and
//! the dispatcher together and is the only type callers need. Commands are
//! answered synchronously; their effects play out on the per-peer machine
//! tasks and on the reactor task that consumes [`MachineNotice`]s.

use std::sync::{Arc, Mutex, MutexGuard, Weak};

use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use a2dp_types::{
    BondState, CodecStatus, ConnectionPolicy, ConnectionState, OptionalCodecSupport, PeerId,
};

use crate::admission::{Admission, AdmissionPolicy, Candidate};
use crate::arbiter::{ActivationOutcome, ActiveDeviceArbiter};
use crate::config::EngineConfig;
use crate::dispatcher::{DispatchOutcome, EventDispatcher};
use crate::error::{Error, RejectReason, Result};
use crate::events::{EventBroadcaster, EventReceiver};
use crate::peer::{Command, PeerSnapshot, lock_peer};
use crate::registry::{DeviceRegistry, MachineHandle, MachineSpawner};
use crate::state_machine::{IncomingGate, MachineContext, MachineNotice, Message, StackEvent};
use crate::traits::Collaborators;

/// Serializable snapshot of the whole service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceDump {
    pub config: EngineConfig,
    pub running: bool,
    pub active_device: Option<PeerId>,
    pub pending_handoff: Option<PeerId>,
    pub peers: Vec<PeerSnapshot>,
}

struct Shared {
    config: EngineConfig,
    admission: AdmissionPolicy,
    collaborators: Collaborators,
    registry: Arc<DeviceRegistry>,
    arbiter: ActiveDeviceArbiter,
    events: EventBroadcaster,
}

struct Running {
    cancel: CancellationToken,
    reactor: JoinHandle<()>,
    reactor_flush: mpsc::UnboundedSender<oneshot::Sender<u64>>,
}

/// Connection engine for every A2DP peer of one adapter.
pub struct A2dpService {
    shared: Arc<Shared>,
    dispatcher: EventDispatcher,
    running: Mutex<Option<Running>>,
}

impl A2dpService {
    /// Create a stopped service. Fails if `config` is invalid.
    pub fn new(config: EngineConfig, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;
        let events = EventBroadcaster::new(config.event_capacity);
        let registry = Arc::new(DeviceRegistry::new(config.max_state_machines));
        let arbiter = ActiveDeviceArbiter::new(
            Arc::clone(&collaborators.native),
            Arc::clone(&collaborators.routing),
            events.clone(),
        );
        let dispatcher = EventDispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&collaborators.native),
            Arc::clone(&collaborators.adapter),
        );
        Ok(Self {
            shared: Arc::new(Shared {
                admission: AdmissionPolicy::from_config(&config),
                config,
                collaborators,
                registry,
                arbiter,
                events,
            }),
            dispatcher,
            running: Mutex::new(None),
        })
    }

    fn running(&self) -> MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    pub fn is_running(&self) -> bool {
        self.running().is_some()
    }

    /// Start the reactor on the current tokio runtime.
    ///
    /// Calling `start` on a running service does nothing.
    pub fn start(&self) -> Result<()> {
        let mut running = self.running();
        if running.is_some() {
            return Ok(());
        }
        let runtime = Handle::try_current().map_err(|_| Error::ServiceNotRunning)?;
        let cancel = CancellationToken::new();
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        let (flush_tx, flush_rx) = mpsc::unbounded_channel();

        let shared = &self.shared;
        let ctx = MachineContext {
            native: Arc::clone(&shared.collaborators.native),
            gate: Arc::new(ServiceGate {
                shared: Arc::downgrade(shared),
            }),
            events: shared.events.clone(),
            notices: notice_tx,
            connect_timeout: shared.config.connect_timeout_duration(),
            offload_enabled: shared.config.offload_enabled,
        };
        shared.registry.attach(MachineSpawner {
            ctx: Arc::new(ctx),
            runtime: runtime.clone(),
            cancel: cancel.clone(),
        });
        let reactor = runtime.spawn(run_reactor(
            Arc::clone(shared),
            notice_rx,
            flush_rx,
            cancel.clone(),
        ));

        *running = Some(Running {
            cancel,
            reactor,
            reactor_flush: flush_tx,
        });
        info!(
            "A2DP service started (max connected {}, max state machines {})",
            shared.config.max_connected_audio_devices, shared.config.max_state_machines
        );
        Ok(())
    }

    /// Clear the active device and tear down every machine.
    pub fn stop(&self) {
        let Some(running) = self.running().take() else {
            return;
        };
        self.shared.arbiter.set_active(None, &self.shared.registry);
        running.cancel.cancel();
        self.shared.registry.shutdown();
        running.reactor.abort();
        info!("A2DP service stopped");
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(Error::ServiceNotRunning)
        }
    }

    /// Wait until every machine and the reactor have drained their queues.
    pub async fn settle(&self) {
        let mut last = None;
        loop {
            let mut total = 0u64;
            let mut machines = 0usize;
            for handle in self.shared.registry.handles() {
                if let Some(done) = handle.flush()
                    && let Ok(count) = done.await
                {
                    total += count;
                    machines += 1;
                }
            }
            let reactor = self.running().as_ref().and_then(|r| {
                let (reply, done) = oneshot::channel();
                r.reactor_flush.send(reply).ok().map(|_| done)
            });
            if let Some(done) = reactor
                && let Ok(count) = done.await
            {
                total += count;
            }

            let round = (total, machines);
            if last == Some(round) {
                return;
            }
            last = Some(round);
        }
    }

    /// Subscribe to outward events.
    pub fn subscribe(&self) -> EventReceiver {
        self.shared.events.subscribe()
    }

    pub fn events(&self) -> &EventBroadcaster {
        &self.shared.events
    }

    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.dispatcher
    }

    /// Feed one native stack event into the engine.
    pub fn handle_stack_event(&self, event: StackEvent) -> DispatchOutcome {
        self.dispatcher.dispatch(event)
    }

    // --- Commands ---

    /// Start connecting `peer`, evicting other peers if admission requires it.
    pub fn connect(&self, peer: PeerId) -> Result<()> {
        self.ensure_running()?;
        let shared = &self.shared;
        let policy = shared.collaborators.policy.connection_policy(&peer);
        if policy == ConnectionPolicy::Forbidden {
            warn!("[{peer}] connect refused: policy forbidden");
            return Err(Error::rejected(peer, RejectReason::PolicyForbidden));
        }
        let candidate = Candidate::new(peer)
            .with_sibling(shared.collaborators.adapter.paired_set_peer(&peer))
            .with_policy(policy);

        let mut fleet = shared.registry.lock();
        let evictions = match shared.admission.can_admit(&candidate, &fleet.snapshot()) {
            Admission::Allow => Vec::new(),
            Admission::AllowAfterEvicting(peers) => peers,
            Admission::Reject(reason) => {
                warn!("[{peer}] connect refused: {reason}");
                return Err(Error::rejected(peer, reason));
            }
        };
        let handle = fleet.get_or_create(peer, candidate.paired_sibling)?;
        handle.reserve_slot();

        for evicted in evictions {
            if let Some(other) = fleet.get(&evicted) {
                info!("[{evicted}] evicting to make room for {peer}");
                other.send(Message::Command(Command::Disconnect));
            }
        }
        handle.send(Message::Command(Command::Connect));
        Ok(())
    }

    /// Start disconnecting `peer`.
    pub fn disconnect(&self, peer: PeerId) -> Result<()> {
        self.ensure_running()?;
        let handle = self
            .shared
            .registry
            .get(&peer)
            .ok_or(Error::DeviceNotFound(peer))?;
        if !handle.state().is_connecting_or_connected() {
            return Err(Error::NotConnected(peer));
        }
        handle.send(Message::Command(Command::Disconnect));
        Ok(())
    }

    /// Select the active device, or clear it with `None`.
    pub fn set_active(&self, peer: Option<PeerId>) -> ActivationOutcome {
        self.shared.arbiter.set_active(peer, &self.shared.registry)
    }

    /// Silence or un-silence `peer`.
    ///
    /// Silencing the active device clears it; un-silencing while nothing is
    /// active makes the peer active.
    pub fn set_silence_mode(&self, peer: PeerId, silence: bool) -> bool {
        let Some(handle) = self.shared.registry.get(&peer) else {
            warn!("[{peer}] cannot change silence mode of unknown device");
            return false;
        };
        let active = self.shared.arbiter.active();
        if silence && active == Some(peer) {
            self.set_active(None);
        } else if !silence && active.is_none() {
            let outcome = self.set_active(Some(peer));
            debug!("[{peer}] un-silenced, activation {outcome:?}");
        }
        if !self.shared.collaborators.native.set_silence(&peer, silence) {
            warn!("[{peer}] native stack refused silence mode {silence}");
            return false;
        }
        lock_peer(handle.record()).silenced = silence;
        true
    }

    /// Persist a connection policy and act on it.
    pub fn set_connection_policy(&self, peer: PeerId, policy: ConnectionPolicy) -> bool {
        if !self
            .shared
            .collaborators
            .policy
            .set_connection_policy(&peer, policy)
        {
            warn!("[{peer}] failed to store connection policy {policy}");
            return false;
        }
        info!("[{peer}] connection policy set to {policy}");
        let result = match policy {
            ConnectionPolicy::Allowed => self.connect(peer),
            ConnectionPolicy::Forbidden => match self.disconnect(peer) {
                Err(Error::NotConnected(_) | Error::DeviceNotFound(_)) => Ok(()),
                other => other,
            },
            ConnectionPolicy::Unknown => Ok(()),
        };
        if let Err(e) = result {
            debug!("[{peer}] policy follow-up failed: {e}");
        }
        true
    }

    pub fn connection_policy(&self, peer: &PeerId) -> ConnectionPolicy {
        self.shared.collaborators.policy.connection_policy(peer)
    }

    /// Bond-state report from the pairing collaborator.
    ///
    /// An unbonded peer is forgotten once it is Disconnected; if it is still
    /// connected it is removed when its machine gets there.
    pub fn on_bond_state_changed(&self, peer: PeerId, bond: BondState) {
        debug!("[{peer}] bond state {bond:?}");
        if bond == BondState::None && self.shared.registry.remove(&peer) {
            info!("[{peer}] unbonded, state machine removed");
        }
    }

    // --- Queries ---

    pub fn connection_state(&self, peer: &PeerId) -> ConnectionState {
        self.shared
            .registry
            .get(peer)
            .map_or(ConnectionState::Disconnected, |h| h.state())
    }

    /// Peers that are Connected.
    pub fn connected_devices(&self) -> Vec<PeerId> {
        self.devices_matching_states(&[ConnectionState::Connected])
    }

    /// Peers in any of `states`, sorted by address.
    pub fn devices_matching_states(&self, states: &[ConnectionState]) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self
            .shared
            .registry
            .snapshot()
            .into_iter()
            .filter(|s| states.contains(&s.state))
            .map(|s| s.peer)
            .collect();
        peers.sort();
        peers
    }

    pub fn is_playing(&self, peer: &PeerId) -> bool {
        self.shared
            .registry
            .snapshot_of(peer)
            .is_some_and(|s| s.playing)
    }

    pub fn codec_status(&self, peer: &PeerId) -> Option<CodecStatus> {
        self.shared
            .registry
            .snapshot_of(peer)
            .and_then(|s| s.codec_status)
    }

    pub fn active_device(&self) -> Option<PeerId> {
        self.shared.arbiter.active()
    }

    pub fn peer(&self, peer: &PeerId) -> Option<PeerSnapshot> {
        self.shared.registry.snapshot_of(peer)
    }

    /// Snapshot everything for diagnostics.
    pub fn dump(&self) -> ServiceDump {
        let mut peers = self.shared.registry.snapshot();
        peers.sort_by_key(|p| p.peer);
        ServiceDump {
            config: self.shared.config.clone(),
            running: self.is_running(),
            active_device: self.shared.arbiter.active(),
            pending_handoff: self.shared.arbiter.pending_handoff(),
            peers,
        }
    }
}

impl Drop for A2dpService {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for A2dpService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("A2dpService")
            .field("config", &self.shared.config)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

/// Decides peer-initiated connections on behalf of the machines.
struct ServiceGate {
    shared: Weak<Shared>,
}

impl IncomingGate for ServiceGate {
    fn accept_incoming(&self, peer: &PeerId) -> bool {
        let Some(shared) = self.shared.upgrade() else {
            return false;
        };
        let collaborators = &shared.collaborators;

        if collaborators.adapter.is_quiet_mode() {
            warn!("[{peer}] incoming connection refused: {}", RejectReason::QuietMode);
            return false;
        }
        let policy = collaborators.policy.connection_policy(peer);
        if policy == ConnectionPolicy::Forbidden {
            warn!("[{peer}] incoming connection refused: {}", RejectReason::PolicyForbidden);
            return false;
        }
        // Service discovery may still be running while bonding completes.
        let bond = collaborators.adapter.bond_state(peer);
        if !matches!(bond, BondState::Bonded | BondState::Bonding) {
            warn!("[{peer}] incoming connection refused: {}", RejectReason::NotBonded);
            return false;
        }

        let candidate = Candidate::new(*peer)
            .with_sibling(collaborators.adapter.paired_set_peer(peer))
            .with_policy(policy);
        let evicted: Vec<MachineHandle> = {
            let fleet = shared.registry.lock();
            let evictions = match shared.admission.can_admit(&candidate, &fleet.snapshot()) {
                Admission::Allow => Vec::new(),
                Admission::AllowAfterEvicting(peers) => peers,
                Admission::Reject(reason) => {
                    warn!("[{peer}] incoming connection refused: {reason}");
                    return false;
                }
            };
            if let Some(handle) = fleet.get(peer) {
                handle.reserve_slot();
            }
            evictions
                .iter()
                .filter_map(|p| fleet.get(p).cloned())
                .collect()
        };

        for other in evicted {
            info!("[{}] evicting to make room for incoming {peer}", other.peer());
            other.send(Message::Command(Command::Disconnect));
        }
        true
    }
}

async fn run_reactor(
    shared: Arc<Shared>,
    mut notices: mpsc::UnboundedReceiver<MachineNotice>,
    mut flushes: mpsc::UnboundedReceiver<oneshot::Sender<u64>>,
    cancel: CancellationToken,
) {
    let mut processed: u64 = 0;
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            notice = notices.recv() => match notice {
                Some(notice) => {
                    react(&shared, notice);
                    processed += 1;
                }
                None => break,
            },
            Some(reply) = flushes.recv() => {
                let _ = reply.send(processed);
            }
        }
    }
    debug!("notice reactor stopped");
}

fn react(shared: &Shared, notice: MachineNotice) {
    let registry = &shared.registry;
    match notice {
        MachineNotice::ConnectionStateChanged { peer, from, to } => {
            if from == ConnectionState::Connected {
                shared.arbiter.peer_left_connected(peer, registry);
            }
            if to == ConnectionState::Connected {
                recheck_optional_codecs(shared, peer);
                if shared.config.max_connected_audio_devices == 1
                    && shared.config.auto_activate_single_device
                {
                    let outcome = shared.arbiter.set_active(Some(peer), registry);
                    debug!("[{peer}] auto-activation {outcome:?}");
                }
            }
            if to == ConnectionState::Disconnected
                && shared.collaborators.adapter.bond_state(&peer) == BondState::None
                && registry.remove(&peer)
            {
                info!("[{peer}] removed unbonded device");
            }
        }
        MachineNotice::PlayingStateChanged { peer, playing } => {
            shared.collaborators.routing.playing_state_changed(&peer, playing);
        }
        MachineNotice::CodecConfigChanged {
            peer,
            status,
            same_feeding_parameters,
        } => {
            shared
                .arbiter
                .codec_config_changed(peer, status, same_feeding_parameters);
        }
    }
}

/// Record whether `peer` offers any optional codec.
fn recheck_optional_codecs(shared: &Shared, peer: PeerId) {
    let Some(status) = shared
        .registry
        .snapshot_of(&peer)
        .and_then(|s| s.codec_status)
    else {
        return;
    };
    let support = if status.supports_optional_codecs() {
        OptionalCodecSupport::Supported
    } else {
        OptionalCodecSupport::NotSupported
    };
    let store = &shared.collaborators.policy;
    if store.optional_codec_support(&peer) != support {
        debug!("[{peer}] optional codec support now {support:?}");
        store.set_optional_codec_support(&peer, support);
    }
}
