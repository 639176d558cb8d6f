//! Registry of per-peer state machines.
//!
//! The registry lock guards the peer map. Fleet-wide decisions (admission,
//! creation, removal) are made while holding it through a [`Fleet`] guard;
//! each peer's record is then locked individually, always inside the
//! registry lock and never the other way round.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use a2dp_types::{ConnectionState, PeerId};

use crate::error::{Error, Result};
use crate::peer::{PeerConnection, PeerSnapshot, SharedPeer, lock_peer};
use crate::state_machine::{
    ConnectionStateMachine, Envelope, MachineContext, Message, run_machine,
};

/// Handle to a running state machine.
#[derive(Debug, Clone)]
pub struct MachineHandle {
    peer: PeerId,
    record: SharedPeer,
    mailbox: mpsc::UnboundedSender<Envelope>,
    cancel: CancellationToken,
}

impl MachineHandle {
    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn state(&self) -> ConnectionState {
        lock_peer(&self.record).connection_state()
    }

    pub fn snapshot(&self) -> PeerSnapshot {
        lock_peer(&self.record).snapshot()
    }

    pub(crate) fn record(&self) -> &SharedPeer {
        &self.record
    }

    /// Count the peer against the connection cap until its machine acts on
    /// the admitted connection. Only called under the registry lock.
    pub(crate) fn reserve_slot(&self) {
        lock_peer(&self.record).reserve_slot();
    }

    /// Queue a message. Returns `false` if the machine has stopped.
    pub(crate) fn send(&self, message: Message) -> bool {
        self.mailbox.send(Envelope::Message(message)).is_ok()
    }

    /// Ask the machine how many messages it has processed once its mailbox drains.
    pub(crate) fn flush(&self) -> Option<oneshot::Receiver<u64>> {
        let (reply, done) = oneshot::channel();
        self.mailbox.send(Envelope::Flush(reply)).ok()?;
        Some(done)
    }

    fn shutdown(&self) {
        self.cancel.cancel();
    }
}

/// Spawns machine tasks on the service runtime.
#[derive(Clone)]
pub(crate) struct MachineSpawner {
    pub ctx: Arc<MachineContext>,
    pub runtime: Handle,
    pub cancel: CancellationToken,
}

impl MachineSpawner {
    fn spawn(&self, peer: PeerId, paired_sibling: Option<PeerId>) -> MachineHandle {
        let record: SharedPeer = Arc::new(Mutex::new(PeerConnection::new(peer, paired_sibling)));
        let (mailbox, rx) = mpsc::unbounded_channel();
        let cancel = self.cancel.child_token();
        let machine = ConnectionStateMachine::new(Arc::clone(&record), Arc::clone(&self.ctx));
        self.runtime.spawn(run_machine(machine, rx, cancel.clone()));
        MachineHandle {
            peer,
            record,
            mailbox,
            cancel,
        }
    }
}

#[derive(Default)]
struct FleetInner {
    machines: HashMap<PeerId, MachineHandle>,
    spawner: Option<MachineSpawner>,
}

/// Concurrent map from peer to its state machine.
pub struct DeviceRegistry {
    inner: Mutex<FleetInner>,
    limit: usize,
}

impl DeviceRegistry {
    /// Create an empty registry that tracks at most `limit` peers.
    pub fn new(limit: usize) -> Self {
        Self {
            inner: Mutex::new(FleetInner::default()),
            limit,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Take the registry lock.
    pub fn lock(&self) -> Fleet<'_> {
        Fleet {
            inner: self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner()),
            limit: self.limit,
        }
    }

    pub fn get(&self, peer: &PeerId) -> Option<MachineHandle> {
        self.lock().get(peer).cloned()
    }

    pub fn snapshot_of(&self, peer: &PeerId) -> Option<PeerSnapshot> {
        self.lock().get(peer).map(MachineHandle::snapshot)
    }

    /// Snapshot every tracked peer.
    pub fn snapshot(&self) -> Vec<PeerSnapshot> {
        self.lock().snapshot()
    }

    pub fn handles(&self) -> Vec<MachineHandle> {
        self.lock().inner.machines.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove a peer. See [`Fleet::remove`].
    pub fn remove(&self, peer: &PeerId) -> bool {
        self.lock().remove(peer)
    }

    pub(crate) fn attach(&self, spawner: MachineSpawner) {
        self.lock().inner.spawner = Some(spawner);
    }

    /// Stop every machine and forget the spawner.
    pub(crate) fn shutdown(&self) {
        let mut fleet = self.lock();
        fleet.inner.spawner = None;
        for (peer, handle) in fleet.inner.machines.drain() {
            debug!("[{peer}] tearing down state machine");
            handle.shutdown();
        }
    }
}

impl std::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("limit", &self.limit)
            .field("len", &self.len())
            .finish()
    }
}

/// The registry lock, held.
pub struct Fleet<'a> {
    inner: MutexGuard<'a, FleetInner>,
    limit: usize,
}

impl Fleet<'_> {
    pub fn get(&self, peer: &PeerId) -> Option<&MachineHandle> {
        self.inner.machines.get(peer)
    }

    pub fn len(&self) -> usize {
        self.inner.machines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.machines.is_empty()
    }

    pub fn snapshot(&self) -> Vec<PeerSnapshot> {
        self.inner.machines.values().map(MachineHandle::snapshot).collect()
    }

    /// Return the peer's machine, creating it if the cap allows.
    pub fn get_or_create(
        &mut self,
        peer: PeerId,
        paired_sibling: Option<PeerId>,
    ) -> Result<MachineHandle> {
        if let Some(handle) = self.inner.machines.get(&peer) {
            return Ok(handle.clone());
        }
        if self.inner.machines.len() >= self.limit {
            warn!(
                "[{peer}] cannot create state machine: limit of {} reached",
                self.limit
            );
            return Err(Error::RegistryFull { limit: self.limit });
        }
        let spawner = self.inner.spawner.as_ref().ok_or(Error::ServiceNotRunning)?;
        let handle = spawner.spawn(peer, paired_sibling);
        info!("[{peer}] created state machine");
        self.inner.machines.insert(peer, handle.clone());
        Ok(handle)
    }

    /// Remove a peer whose machine is Disconnected.
    ///
    /// Returns `false` if the peer is unknown or still has a connection.
    pub fn remove(&mut self, peer: &PeerId) -> bool {
        let Some(handle) = self.inner.machines.get(peer) else {
            return false;
        };
        let state = handle.state();
        if state != ConnectionState::Disconnected {
            debug!("[{peer}] not removing state machine while {state}");
            return false;
        }
        if let Some(handle) = self.inner.machines.remove(peer) {
            handle.shutdown();
            info!("[{peer}] removed state machine");
        }
        true
    }
}
