//! Recording collaborators for testing.
//!
//! Every mock implements one collaborator trait and records the calls it
//! receives so tests can assert on exactly what the engine did. The native
//! stack mock also supports failure injection.
//!
//! ```
//! use a2dp_core::mock::MockEnvironment;
//! use a2dp_core::{A2dpService, EngineConfig};
//!
//! let env = MockEnvironment::new();
//! let service = A2dpService::new(EngineConfig::default(), env.collaborators()).unwrap();
//! assert!(service.connected_devices().is_empty());
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;

use a2dp_types::{BondState, CodecStatus, ConnectionPolicy, OptionalCodecSupport, PeerId};

use crate::traits::{
    AdapterProperties, AudioRouting, Collaborators, NativeStack, PolicyStore, RouteChangeHints,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A random locally administered peer address.
pub fn random_peer() -> PeerId {
    let b = rand::random::<u64>().to_be_bytes();
    PeerId::new([0x02, b[3], b[4], b[5], b[6], b[7]])
}

/// A command received by [`MockNativeStack`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NativeCommand {
    Connect(PeerId),
    Disconnect(PeerId),
    SetActive(Option<PeerId>),
    SetSilence(PeerId, bool),
}

/// Native stack that records commands.
#[derive(Debug, Default)]
pub struct MockNativeStack {
    log: Mutex<Vec<NativeCommand>>,
    fail_connect: AtomicBool,
    fail_disconnect: AtomicBool,
    fail_set_active: AtomicBool,
}

impl MockNativeStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `connect_peer` report failure.
    pub fn fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    /// Make `disconnect_peer` report failure.
    pub fn fail_disconnect(&self, fail: bool) {
        self.fail_disconnect.store(fail, Ordering::SeqCst);
    }

    /// Make `set_active_device` report failure.
    pub fn fail_set_active(&self, fail: bool) {
        self.fail_set_active.store(fail, Ordering::SeqCst);
    }

    /// Every command received, in order.
    pub fn commands(&self) -> Vec<NativeCommand> {
        lock(&self.log).clone()
    }

    pub fn clear(&self) {
        lock(&self.log).clear();
    }

    pub fn connect_count(&self, peer: &PeerId) -> usize {
        self.count(|c| *c == NativeCommand::Connect(*peer))
    }

    pub fn disconnect_count(&self, peer: &PeerId) -> usize {
        self.count(|c| *c == NativeCommand::Disconnect(*peer))
    }

    /// Targets of every `set_active_device` call.
    pub fn set_active_calls(&self) -> Vec<Option<PeerId>> {
        lock(&self.log)
            .iter()
            .filter_map(|c| match c {
                NativeCommand::SetActive(target) => Some(*target),
                _ => None,
            })
            .collect()
    }

    fn count(&self, pred: impl Fn(&NativeCommand) -> bool) -> usize {
        lock(&self.log).iter().filter(|c| pred(c)).count()
    }

    fn record(&self, command: NativeCommand, fail: &AtomicBool) -> bool {
        lock(&self.log).push(command);
        !fail.load(Ordering::SeqCst)
    }
}

impl NativeStack for MockNativeStack {
    fn connect_peer(&self, peer: &PeerId) -> bool {
        self.record(NativeCommand::Connect(*peer), &self.fail_connect)
    }

    fn disconnect_peer(&self, peer: &PeerId) -> bool {
        self.record(NativeCommand::Disconnect(*peer), &self.fail_disconnect)
    }

    fn set_active_device(&self, peer: Option<&PeerId>) -> bool {
        self.record(NativeCommand::SetActive(peer.copied()), &self.fail_set_active)
    }

    fn set_silence(&self, peer: &PeerId, silence: bool) -> bool {
        lock(&self.log).push(NativeCommand::SetSilence(*peer, silence));
        true
    }
}

/// A call received by [`MockAudioRouting`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingCall {
    ActiveDeviceChanged {
        active: Option<PeerId>,
        previous: Option<PeerId>,
        hints: RouteChangeHints,
    },
    CodecConfigChanged(PeerId),
    PlayingStateChanged(PeerId, bool),
    StoreVolume(PeerId),
    RestoreVolume(PeerId, u8),
}

/// Audio routing that records calls and remembers volumes.
#[derive(Debug, Default)]
pub struct MockAudioRouting {
    calls: Mutex<Vec<RoutingCall>>,
    volumes: Mutex<HashMap<PeerId, u8>>,
}

impl MockAudioRouting {
    pub fn new() -> Self {
        Self::default()
    }

    /// Preload a remembered volume.
    pub fn set_remembered_volume(&self, peer: PeerId, volume: u8) {
        lock(&self.volumes).insert(peer, volume);
    }

    pub fn calls(&self) -> Vec<RoutingCall> {
        lock(&self.calls).clone()
    }

    pub fn clear(&self) {
        lock(&self.calls).clear();
    }

    /// Only the active-device changes.
    pub fn active_device_changes(&self) -> Vec<RoutingCall> {
        lock(&self.calls)
            .iter()
            .filter(|c| matches!(c, RoutingCall::ActiveDeviceChanged { .. }))
            .cloned()
            .collect()
    }

    fn push(&self, call: RoutingCall) {
        lock(&self.calls).push(call);
    }
}

impl AudioRouting for MockAudioRouting {
    fn active_device_changed(
        &self,
        active: Option<&PeerId>,
        previous: Option<&PeerId>,
        hints: RouteChangeHints,
    ) {
        self.push(RoutingCall::ActiveDeviceChanged {
            active: active.copied(),
            previous: previous.copied(),
            hints,
        });
    }

    fn codec_config_changed(&self, peer: &PeerId, _status: &CodecStatus) {
        self.push(RoutingCall::CodecConfigChanged(*peer));
    }

    fn playing_state_changed(&self, peer: &PeerId, playing: bool) {
        self.push(RoutingCall::PlayingStateChanged(*peer, playing));
    }

    fn remembered_volume(&self, peer: &PeerId) -> Option<u8> {
        lock(&self.volumes).get(peer).copied()
    }

    fn store_volume(&self, peer: &PeerId) {
        self.push(RoutingCall::StoreVolume(*peer));
    }

    fn restore_volume(&self, peer: &PeerId, volume: u8) {
        self.push(RoutingCall::RestoreVolume(*peer, volume));
    }
}

/// In-memory policy store.
#[derive(Debug, Default)]
pub struct MockPolicyStore {
    policies: Mutex<HashMap<PeerId, ConnectionPolicy>>,
    codec_support: Mutex<HashMap<PeerId, OptionalCodecSupport>>,
    fail_writes: AtomicBool,
}

impl MockPolicyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `set_connection_policy` report failure.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn set_policy(&self, peer: PeerId, policy: ConnectionPolicy) {
        lock(&self.policies).insert(peer, policy);
    }
}

impl PolicyStore for MockPolicyStore {
    fn connection_policy(&self, peer: &PeerId) -> ConnectionPolicy {
        lock(&self.policies)
            .get(peer)
            .copied()
            .unwrap_or(ConnectionPolicy::Unknown)
    }

    fn set_connection_policy(&self, peer: &PeerId, policy: ConnectionPolicy) -> bool {
        if self.fail_writes.load(Ordering::SeqCst) {
            return false;
        }
        self.set_policy(*peer, policy);
        true
    }

    fn optional_codec_support(&self, peer: &PeerId) -> OptionalCodecSupport {
        lock(&self.codec_support)
            .get(peer)
            .copied()
            .unwrap_or(OptionalCodecSupport::Unknown)
    }

    fn set_optional_codec_support(&self, peer: &PeerId, support: OptionalCodecSupport) {
        lock(&self.codec_support).insert(*peer, support);
    }
}

/// Adapter facts: bond states, paired sets and quiet mode.
///
/// Unknown peers report `default_bond` (Bonded unless changed).
#[derive(Debug)]
pub struct MockAdapter {
    bonds: Mutex<HashMap<PeerId, BondState>>,
    siblings: Mutex<HashMap<PeerId, PeerId>>,
    default_bond: Mutex<BondState>,
    quiet_mode: AtomicBool,
}

impl Default for MockAdapter {
    fn default() -> Self {
        Self {
            bonds: Mutex::new(HashMap::new()),
            siblings: Mutex::new(HashMap::new()),
            default_bond: Mutex::new(BondState::Bonded),
            quiet_mode: AtomicBool::new(false),
        }
    }
}

impl MockAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_bond_state(&self, peer: PeerId, bond: BondState) {
        lock(&self.bonds).insert(peer, bond);
    }

    pub fn set_default_bond_state(&self, bond: BondState) {
        *lock(&self.default_bond) = bond;
    }

    /// Declare two peers as the halves of one paired set.
    pub fn pair(&self, a: PeerId, b: PeerId) {
        let mut siblings = lock(&self.siblings);
        siblings.insert(a, b);
        siblings.insert(b, a);
    }

    pub fn set_quiet_mode(&self, quiet: bool) {
        self.quiet_mode.store(quiet, Ordering::SeqCst);
    }
}

impl AdapterProperties for MockAdapter {
    fn bond_state(&self, peer: &PeerId) -> BondState {
        lock(&self.bonds)
            .get(peer)
            .copied()
            .unwrap_or_else(|| *lock(&self.default_bond))
    }

    fn paired_set_peer(&self, peer: &PeerId) -> Option<PeerId> {
        lock(&self.siblings).get(peer).copied()
    }

    fn is_quiet_mode(&self) -> bool {
        self.quiet_mode.load(Ordering::SeqCst)
    }
}

/// One of each mock, kept as concrete types for assertions.
#[derive(Debug, Clone, Default)]
pub struct MockEnvironment {
    pub native: Arc<MockNativeStack>,
    pub routing: Arc<MockAudioRouting>,
    pub policy: Arc<MockPolicyStore>,
    pub adapter: Arc<MockAdapter>,
}

impl MockEnvironment {
    pub fn new() -> Self {
        Self::default()
    }

    /// The mocks as trait objects for the service.
    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            native: self.native.clone(),
            routing: self.routing.clone(),
            policy: self.policy.clone(),
            adapter: self.adapter.clone(),
        }
    }
}
