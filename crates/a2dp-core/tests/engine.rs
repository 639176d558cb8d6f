//! End-to-end tests of the service against the mock collaborators.

use std::time::Duration;

use a2dp_core::mock::{MockEnvironment, NativeCommand, RoutingCall, random_peer};
use a2dp_core::{
    A2dpService, ActivationFailure, ActivationOutcome, AudioState, BondState, Command,
    ConnectionPolicy, ConnectionState, DispatchOutcome, EngineConfig, EngineEvent, Error,
    EventReceiver, PeerId, PlayingState, RejectReason, RouteChangeHints, StackEvent,
};
use a2dp_types::{ChannelMode, CodecConfig, CodecStatus, CodecType, OptionalCodecSupport};

fn addr(n: u8) -> PeerId {
    PeerId::new([0x00, 0x1A, 0x7D, 0xDA, 0x71, n])
}

struct Fixture {
    env: MockEnvironment,
    service: A2dpService,
}

impl Fixture {
    fn new(config: EngineConfig) -> Self {
        let env = MockEnvironment::new();
        let service = A2dpService::new(config, env.collaborators()).unwrap();
        service.start().unwrap();
        Self { env, service }
    }

    fn stack(&self, peer: PeerId, state: ConnectionState) -> DispatchOutcome {
        self.service
            .handle_stack_event(StackEvent::ConnectionStateChanged { peer, state })
    }

    fn audio(&self, peer: PeerId, state: AudioState) {
        self.service
            .handle_stack_event(StackEvent::AudioStateChanged { peer, state });
    }

    fn codec(&self, peer: PeerId, status: CodecStatus) {
        self.service
            .handle_stack_event(StackEvent::CodecConfigChanged { peer, status });
    }

    async fn settle(&self) {
        self.service.settle().await;
        self.assert_playing_only_when_connected();
    }

    async fn connect_fully(&self, peer: PeerId) {
        self.service.connect(peer).unwrap();
        self.settle().await;
        self.stack(peer, ConnectionState::Connected);
        self.settle().await;
        assert_eq!(self.service.connection_state(&peer), ConnectionState::Connected);
    }

    fn holding_slots(&self) -> usize {
        self.service
            .devices_matching_states(&[ConnectionState::Connecting, ConnectionState::Connected])
            .len()
    }

    fn assert_playing_only_when_connected(&self) {
        for peer in self.service.dump().peers {
            assert!(
                !peer.playing || peer.state == ConnectionState::Connected,
                "{} playing while {}",
                peer.peer,
                peer.state
            );
        }
    }
}

fn drain(rx: &mut EventReceiver) -> Vec<EngineEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn status(codec_type: CodecType, sample_rate: u32) -> CodecStatus {
    CodecStatus::new(CodecConfig::new(codec_type, sample_rate, 16, ChannelMode::Stereo))
}

// --- Connection lifecycle ---

#[tokio::test]
async fn test_connect_broadcasts_transitions_in_order() {
    let f = Fixture::new(EngineConfig::default());
    let mut rx = f.service.subscribe();
    f.connect_fully(addr(1)).await;

    let events = drain(&mut rx);
    assert_eq!(
        events,
        vec![
            EngineEvent::ConnectionStateChanged {
                peer: addr(1),
                state: ConnectionState::Connecting,
                previous: ConnectionState::Disconnected,
            },
            EngineEvent::ConnectionStateChanged {
                peer: addr(1),
                state: ConnectionState::Connected,
                previous: ConnectionState::Connecting,
            },
            EngineEvent::PlayingStateChanged {
                peer: addr(1),
                state: PlayingState::NotPlaying,
                previous: PlayingState::Playing,
            },
        ]
    );
    assert_eq!(f.service.connected_devices(), vec![addr(1)]);
}

#[tokio::test]
async fn test_connect_twice_while_connecting_is_deferred_once() {
    let f = Fixture::new(EngineConfig::default());
    f.service.connect(addr(1)).unwrap();
    f.service.connect(addr(1)).unwrap();
    f.service.connect(addr(1)).unwrap();
    f.settle().await;

    assert_eq!(f.env.native.connect_count(&addr(1)), 1);
    assert_eq!(f.service.peer(&addr(1)).unwrap().deferred, vec![Command::Connect]);

    f.stack(addr(1), ConnectionState::Connected);
    f.settle().await;
    assert_eq!(f.env.native.connect_count(&addr(1)), 1);
    assert!(f.service.peer(&addr(1)).unwrap().deferred.is_empty());
}

#[tokio::test]
async fn test_native_connect_failure_reports_disconnected() {
    let f = Fixture::new(EngineConfig::default());
    f.env.native.fail_connect(true);
    let mut rx = f.service.subscribe();

    f.service.connect(addr(1)).unwrap();
    f.settle().await;

    assert_eq!(f.service.connection_state(&addr(1)), ConnectionState::Disconnected);
    assert_eq!(
        drain(&mut rx),
        vec![EngineEvent::ConnectionStateChanged {
            peer: addr(1),
            state: ConnectionState::Disconnected,
            previous: ConnectionState::Disconnected,
        }]
    );
}

#[tokio::test]
async fn test_disconnect_errors() {
    let f = Fixture::new(EngineConfig::default());
    assert!(matches!(
        f.service.disconnect(addr(1)),
        Err(Error::DeviceNotFound(_))
    ));

    f.env.native.fail_connect(true);
    f.service.connect(addr(1)).unwrap();
    f.settle().await;
    assert!(matches!(
        f.service.disconnect(addr(1)),
        Err(Error::NotConnected(_))
    ));
}

#[tokio::test]
async fn test_disconnect_cancels_pending_connect() {
    let f = Fixture::new(EngineConfig::default());
    f.service.connect(addr(1)).unwrap();
    f.settle().await;
    f.service.disconnect(addr(1)).unwrap();
    f.settle().await;

    assert_eq!(f.service.connection_state(&addr(1)), ConnectionState::Disconnected);
    assert_eq!(
        f.env.native.commands(),
        vec![
            NativeCommand::Connect(addr(1)),
            NativeCommand::Disconnect(addr(1))
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_connect_timeout_forces_single_disconnect() {
    let f = Fixture::new(EngineConfig::default());
    f.service.connect(addr(1)).unwrap();
    f.settle().await;
    assert_eq!(f.service.connection_state(&addr(1)), ConnectionState::Connecting);

    tokio::time::sleep(Duration::from_secs(29)).await;
    f.settle().await;
    assert_eq!(f.service.connection_state(&addr(1)), ConnectionState::Connecting);

    tokio::time::sleep(Duration::from_secs(2)).await;
    f.settle().await;
    assert_eq!(f.service.connection_state(&addr(1)), ConnectionState::Disconnected);
    assert_eq!(f.env.native.disconnect_count(&addr(1)), 1);

    // Nothing is left armed.
    tokio::time::sleep(Duration::from_secs(120)).await;
    f.settle().await;
    assert_eq!(f.env.native.disconnect_count(&addr(1)), 1);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_timeout_recovers() {
    let f = Fixture::new(EngineConfig::default().connect_timeout(Duration::from_secs(5)));
    f.connect_fully(addr(1)).await;
    f.service.disconnect(addr(1)).unwrap();
    f.settle().await;
    assert_eq!(f.service.connection_state(&addr(1)), ConnectionState::Disconnecting);

    tokio::time::sleep(Duration::from_secs(6)).await;
    f.settle().await;
    assert_eq!(f.service.connection_state(&addr(1)), ConnectionState::Disconnected);
    assert_eq!(f.env.native.disconnect_count(&addr(1)), 2);
}

#[tokio::test]
async fn test_playing_tracks_connection() {
    let f = Fixture::new(EngineConfig::default());
    let peer = addr(1);

    // Audio before the connection exists is dropped.
    f.audio(peer, AudioState::Started);
    f.service.connect(peer).unwrap();
    f.audio(peer, AudioState::Started);
    f.settle().await;
    assert!(!f.service.is_playing(&peer));

    f.stack(peer, ConnectionState::Connected);
    f.audio(peer, AudioState::Started);
    f.audio(peer, AudioState::Started);
    f.settle().await;
    assert!(f.service.is_playing(&peer));

    let mut rx = f.service.subscribe();
    f.stack(peer, ConnectionState::Disconnecting);
    f.audio(peer, AudioState::Started);
    f.stack(peer, ConnectionState::Disconnected);
    f.settle().await;
    assert!(!f.service.is_playing(&peer));

    let events = drain(&mut rx);
    assert_eq!(
        events[0],
        EngineEvent::PlayingStateChanged {
            peer,
            state: PlayingState::NotPlaying,
            previous: PlayingState::Playing,
        }
    );
    assert!(matches!(
        events[1],
        EngineEvent::ConnectionStateChanged {
            state: ConnectionState::Disconnecting,
            ..
        }
    ));

    let playing: Vec<_> = f
        .env
        .routing
        .calls()
        .into_iter()
        .filter(|c| matches!(c, RoutingCall::PlayingStateChanged(..)))
        .collect();
    assert_eq!(
        playing,
        vec![
            RoutingCall::PlayingStateChanged(peer, true),
            RoutingCall::PlayingStateChanged(peer, false),
        ]
    );
}

#[tokio::test]
async fn test_remote_suspend_stops_playing() {
    let f = Fixture::new(EngineConfig::default());
    f.connect_fully(addr(1)).await;
    f.audio(addr(1), AudioState::Started);
    f.settle().await;
    f.audio(addr(1), AudioState::RemoteSuspend);
    f.settle().await;
    assert!(!f.service.is_playing(&addr(1)));
    assert_eq!(f.service.connection_state(&addr(1)), ConnectionState::Connected);
}

// --- Admission ---

#[tokio::test]
async fn test_single_slot_evicts_previous_peer() {
    let f = Fixture::new(EngineConfig::default().max_connected_audio_devices(1));
    let (a, b) = (addr(1), addr(2));

    f.connect_fully(a).await;
    assert_eq!(f.service.active_device(), Some(a));

    f.service.connect(b).unwrap();
    f.settle().await;
    assert_eq!(f.service.connection_state(&a), ConnectionState::Disconnecting);
    assert_eq!(f.service.connection_state(&b), ConnectionState::Connecting);
    assert_eq!(f.env.native.disconnect_count(&a), 1);

    f.stack(a, ConnectionState::Disconnected);
    f.stack(b, ConnectionState::Connected);
    f.settle().await;

    assert_eq!(f.service.connection_state(&a), ConnectionState::Disconnected);
    assert_eq!(f.service.connected_devices(), vec![b]);
    assert_eq!(f.service.active_device(), Some(b));
    assert_eq!(f.env.native.set_active_calls(), vec![Some(a), None, Some(b)]);
}

#[tokio::test]
async fn test_capacity_rejects_extra_peer() {
    let f = Fixture::new(EngineConfig::default().max_connected_audio_devices(2));
    f.connect_fully(addr(1)).await;
    f.service.connect(addr(2)).unwrap();
    f.settle().await;

    let err = f.service.connect(addr(3)).unwrap_err();
    assert_eq!(err.reject_reason(), Some(RejectReason::TooManyConnections));
    assert_eq!(f.service.connection_state(&addr(3)), ConnectionState::Disconnected);
    assert_eq!(f.env.native.connect_count(&addr(3)), 0);
}

#[tokio::test]
async fn test_back_to_back_connects_respect_capacity() {
    let f = Fixture::new(EngineConfig::default().max_connected_audio_devices(2));
    let (a, b, c) = (addr(1), addr(2), addr(3));
    f.connect_fully(a).await;

    f.service.connect(b).unwrap();
    let err = f.service.connect(c).unwrap_err();
    assert_eq!(err.reject_reason(), Some(RejectReason::TooManyConnections));
    f.settle().await;

    assert_eq!(f.holding_slots(), 2);
    assert_eq!(f.service.connection_state(&b), ConnectionState::Connecting);
    assert_eq!(f.service.connection_state(&c), ConnectionState::Disconnected);
    assert_eq!(f.env.native.connect_count(&c), 0);
}

#[tokio::test]
async fn test_back_to_back_connects_in_single_slot_fleet() {
    let f = Fixture::new(EngineConfig::default().max_connected_audio_devices(1));
    let (a, b, c) = (addr(1), addr(2), addr(3));
    f.connect_fully(a).await;

    f.service.connect(b).unwrap();
    f.service.connect(c).unwrap();
    f.settle().await;

    // c evicts both the connected peer and the one still waiting to connect.
    assert_eq!(f.holding_slots(), 1);
    assert_eq!(f.service.connection_state(&a), ConnectionState::Disconnecting);
    assert_eq!(f.service.connection_state(&b), ConnectionState::Disconnected);
    assert_eq!(f.service.connection_state(&c), ConnectionState::Connecting);
    assert_eq!(f.env.native.disconnect_count(&a), 1);
    assert_eq!(f.env.native.disconnect_count(&b), 1);

    f.stack(a, ConnectionState::Disconnected);
    f.stack(c, ConnectionState::Connected);
    f.settle().await;
    assert_eq!(f.service.connected_devices(), vec![c]);
    assert_eq!(f.service.active_device(), Some(c));
}

async fn burst_of_requests(max: usize) {
    let f = Fixture::new(EngineConfig::default().max_connected_audio_devices(max));
    f.connect_fully(addr(1)).await;

    for round in 0..4 {
        f.stack(random_peer(), ConnectionState::Connected);
        f.stack(random_peer(), ConnectionState::Connecting);
        if round % 2 == 0 {
            let _ = f.service.connect(random_peer());
        }
    }
    f.settle().await;

    assert_eq!(f.holding_slots(), max);
    assert!(f.service.connected_devices().len() <= max);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_interleaved_requests_never_exceed_capacity() {
    burst_of_requests(2).await;
    burst_of_requests(3).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_interleaved_requests_in_single_slot_fleet() {
    burst_of_requests(1).await;
}

#[tokio::test]
async fn test_paired_set_capacity_with_three_slots() {
    let f = Fixture::new(
        EngineConfig::default()
            .max_connected_audio_devices(3)
            .paired_set_enabled(true),
    );
    let (e1, e2, legacy, other) = (addr(0xE1), addr(0xE2), addr(1), addr(2));
    f.env.adapter.pair(e1, e2);

    f.connect_fully(e1).await;
    f.connect_fully(e2).await;
    f.connect_fully(legacy).await;

    let err = f.service.connect(other).unwrap_err();
    assert_eq!(err.reject_reason(), Some(RejectReason::TooManyConnections));
    assert_eq!(f.service.connected_devices().len(), 3);
}

#[tokio::test]
async fn test_paired_set_disabled_rejects_earbud() {
    let f = Fixture::new(EngineConfig::default());
    f.env.adapter.pair(addr(0xE1), addr(0xE2));
    let err = f.service.connect(addr(0xE1)).unwrap_err();
    assert_eq!(err.reject_reason(), Some(RejectReason::PairedSetDisabled));
}

#[tokio::test]
async fn test_forbidden_policy_rejects_connect() {
    let f = Fixture::new(EngineConfig::default());
    f.env.policy.set_policy(addr(1), ConnectionPolicy::Forbidden);
    let err = f.service.connect(addr(1)).unwrap_err();
    assert_eq!(err.reject_reason(), Some(RejectReason::PolicyForbidden));
    assert!(f.service.dump().peers.is_empty());
}

#[tokio::test]
async fn test_registry_full_on_connect() {
    let f = Fixture::new(
        EngineConfig::default()
            .max_connected_audio_devices(1)
            .max_state_machines(1),
    );
    f.env.native.fail_connect(true);
    f.service.connect(addr(1)).unwrap();
    f.settle().await;

    let err = f.service.connect(addr(2)).unwrap_err();
    assert!(matches!(err, Error::RegistryFull { limit: 1 }));
}

// --- Incoming connections ---

#[tokio::test]
async fn test_incoming_connection_creates_machine() {
    let f = Fixture::new(EngineConfig::default());
    assert_eq!(
        f.stack(addr(1), ConnectionState::Connecting),
        DispatchOutcome::Created
    );
    assert_eq!(
        f.stack(addr(1), ConnectionState::Connected),
        DispatchOutcome::Delivered
    );
    f.settle().await;
    assert_eq!(f.service.connection_state(&addr(1)), ConnectionState::Connected);
}

#[tokio::test]
async fn test_non_connection_events_for_unknown_peer_are_ignored() {
    let f = Fixture::new(EngineConfig::default());
    assert_eq!(
        f.stack(addr(1), ConnectionState::Disconnected),
        DispatchOutcome::Ignored
    );
    f.service
        .handle_stack_event(StackEvent::AudioStateChanged {
            peer: addr(1),
            state: AudioState::Started,
        });
    assert!(f.service.dump().peers.is_empty());
}

#[tokio::test]
async fn test_incoming_gate_rejections() {
    let f = Fixture::new(EngineConfig::default());
    let (quiet, forbidden, unbonded) = (addr(1), addr(2), addr(3));

    f.env.adapter.set_quiet_mode(true);
    f.stack(quiet, ConnectionState::Connected);
    f.settle().await;
    f.env.adapter.set_quiet_mode(false);

    f.env.policy.set_policy(forbidden, ConnectionPolicy::Forbidden);
    f.stack(forbidden, ConnectionState::Connecting);

    f.env.adapter.set_bond_state(unbonded, BondState::None);
    f.stack(unbonded, ConnectionState::Connected);
    f.settle().await;

    for peer in [quiet, forbidden, unbonded] {
        assert_eq!(f.service.connection_state(&peer), ConnectionState::Disconnected);
        assert_eq!(f.env.native.disconnect_count(&peer), 1);
    }
}

#[tokio::test]
async fn test_incoming_accepted_while_bonding() {
    let f = Fixture::new(EngineConfig::default());
    f.env.adapter.set_bond_state(addr(1), BondState::Bonding);

    f.stack(addr(1), ConnectionState::Connecting);
    f.settle().await;
    assert_eq!(f.service.connection_state(&addr(1)), ConnectionState::Connecting);
    assert_eq!(f.env.native.disconnect_count(&addr(1)), 0);
}

#[tokio::test]
async fn test_incoming_rejected_at_capacity() {
    let f = Fixture::new(EngineConfig::default().max_connected_audio_devices(2));
    f.connect_fully(addr(1)).await;
    f.connect_fully(addr(2)).await;

    f.stack(addr(3), ConnectionState::Connected);
    f.settle().await;
    assert_eq!(f.service.connection_state(&addr(3)), ConnectionState::Disconnected);
    assert_eq!(f.env.native.disconnect_count(&addr(3)), 1);
    assert_eq!(f.service.connected_devices(), vec![addr(1), addr(2)]);
}

#[tokio::test]
async fn test_incoming_evicts_in_single_slot_fleet() {
    let f = Fixture::new(EngineConfig::default().max_connected_audio_devices(1));
    let (a, b) = (addr(1), addr(2));
    f.connect_fully(a).await;

    f.stack(b, ConnectionState::Connected);
    f.settle().await;
    assert_eq!(f.service.connection_state(&b), ConnectionState::Connected);
    assert_eq!(f.service.connection_state(&a), ConnectionState::Disconnecting);
    assert_eq!(f.env.native.disconnect_count(&a), 1);
    assert_eq!(f.env.native.disconnect_count(&b), 0);

    f.stack(a, ConnectionState::Disconnected);
    f.settle().await;
    assert_eq!(f.service.connected_devices(), vec![b]);
    assert_eq!(f.service.active_device(), Some(b));
}

#[tokio::test]
async fn test_incoming_refused_when_registry_full() {
    let f = Fixture::new(
        EngineConfig::default()
            .max_connected_audio_devices(1)
            .max_state_machines(1),
    );
    f.connect_fully(addr(1)).await;

    assert_eq!(
        f.stack(addr(2), ConnectionState::Connected),
        DispatchOutcome::Refused
    );
    assert_eq!(f.env.native.disconnect_count(&addr(2)), 1);
}

// --- Active device ---

#[tokio::test]
async fn test_active_device_cleared_once_on_disconnect() {
    let f = Fixture::new(EngineConfig::default());
    let x = addr(1);
    f.connect_fully(x).await;

    assert_eq!(f.service.set_active(Some(x)), ActivationOutcome::Success);
    assert_eq!(f.service.active_device(), Some(x));

    f.stack(x, ConnectionState::Disconnecting);
    f.stack(x, ConnectionState::Disconnected);
    f.settle().await;

    assert_eq!(f.service.active_device(), None);
    assert_eq!(f.env.native.set_active_calls(), vec![Some(x), None]);
}

#[tokio::test]
async fn test_set_active_requires_connected_peer() {
    let f = Fixture::new(EngineConfig::default());
    assert_eq!(
        f.service.set_active(Some(addr(1))),
        ActivationOutcome::Rejected(ActivationFailure::NotConnected)
    );

    f.service.connect(addr(1)).unwrap();
    f.settle().await;
    assert_eq!(
        f.service.set_active(Some(addr(1))),
        ActivationOutcome::Rejected(ActivationFailure::NotConnected)
    );
    assert!(f.env.native.set_active_calls().is_empty());
}

#[tokio::test]
async fn test_native_refusal_keeps_previous_active() {
    let f = Fixture::new(EngineConfig::default());
    f.connect_fully(addr(1)).await;
    f.connect_fully(addr(2)).await;
    f.service.set_active(Some(addr(1)));

    f.env.native.fail_set_active(true);
    assert_eq!(
        f.service.set_active(Some(addr(2))),
        ActivationOutcome::Rejected(ActivationFailure::NativeFailure)
    );
    assert_eq!(f.service.active_device(), Some(addr(1)));
}

#[tokio::test]
async fn test_switch_stores_and_restores_volume() {
    let f = Fixture::new(EngineConfig::default());
    let (x, y) = (addr(1), addr(2));
    f.connect_fully(x).await;
    f.connect_fully(y).await;
    f.env.routing.set_remembered_volume(y, 7);

    f.service.set_active(Some(x));
    f.env.routing.clear();
    let mut rx = f.service.subscribe();
    assert_eq!(f.service.set_active(Some(y)), ActivationOutcome::Success);
    assert_eq!(f.service.set_active(Some(y)), ActivationOutcome::Success);

    assert_eq!(
        f.env.routing.calls(),
        vec![
            RoutingCall::StoreVolume(x),
            RoutingCall::ActiveDeviceChanged {
                active: Some(y),
                previous: Some(x),
                hints: RouteChangeHints {
                    suppress_noisy_intent: true,
                    suppress_volume_renegotiation: false,
                },
            },
            RoutingCall::RestoreVolume(y, 7),
        ]
    );
    assert_eq!(
        drain(&mut rx),
        vec![EngineEvent::ActiveDeviceChanged {
            peer: Some(y),
            previous: Some(x),
        }]
    );
}

#[tokio::test]
async fn test_activation_broadcasts_known_codec() {
    let f = Fixture::new(EngineConfig::default());
    f.connect_fully(addr(1)).await;
    let aac = status(CodecType::Aac, 48_000);
    f.codec(addr(1), aac.clone());
    f.settle().await;

    let mut rx = f.service.subscribe();
    f.service.set_active(Some(addr(1)));
    let events = drain(&mut rx);
    assert_eq!(
        events.last(),
        Some(&EngineEvent::CodecConfigChanged {
            peer: addr(1),
            status: aac,
        })
    );
}

#[tokio::test]
async fn test_paired_set_handoff() {
    let f = Fixture::new(
        EngineConfig::default()
            .max_connected_audio_devices(3)
            .paired_set_enabled(true),
    );
    let (e1, e2) = (addr(0xE1), addr(0xE2));
    f.env.adapter.pair(e1, e2);
    f.connect_fully(e1).await;
    f.connect_fully(e2).await;

    assert_eq!(f.service.set_active(Some(e1)), ActivationOutcome::Success);
    assert_eq!(f.service.set_active(Some(e2)), ActivationOutcome::Pending);
    assert_eq!(f.service.dump().pending_handoff, Some(e2));
    f.env.routing.clear();

    f.stack(e1, ConnectionState::Disconnected);
    f.settle().await;

    assert_eq!(f.service.active_device(), Some(e2));
    assert_eq!(f.env.native.set_active_calls(), vec![Some(e1), Some(e2)]);
    assert_eq!(
        f.env.routing.active_device_changes(),
        vec![RoutingCall::ActiveDeviceChanged {
            active: Some(e2),
            previous: Some(e1),
            hints: RouteChangeHints {
                suppress_noisy_intent: true,
                suppress_volume_renegotiation: true,
            },
        }]
    );
}

// --- Codec changes ---

#[tokio::test]
async fn test_codec_during_disconnecting_is_recorded_silently() {
    let f = Fixture::new(EngineConfig::default());
    let x = addr(1);
    f.connect_fully(x).await;
    f.service.set_active(Some(x));
    f.service.disconnect(x).unwrap();
    f.settle().await;
    assert_eq!(f.service.connection_state(&x), ConnectionState::Disconnecting);

    f.env.routing.clear();
    let mut rx = f.service.subscribe();
    let sbc = status(CodecType::Sbc, 44_100);
    f.codec(x, sbc.clone());
    f.settle().await;

    assert_eq!(f.service.codec_status(&x), Some(sbc));
    assert!(f.env.routing.calls().is_empty());
    assert!(drain(&mut rx).is_empty());
}

#[tokio::test]
async fn test_active_codec_change_notifies_routing_when_feeding_changes() {
    let f = Fixture::new(EngineConfig::default());
    let x = addr(1);
    f.connect_fully(x).await;
    f.codec(x, status(CodecType::Sbc, 44_100));
    f.settle().await;
    f.service.set_active(Some(x));
    f.env.routing.clear();
    let mut rx = f.service.subscribe();

    // Same PCM parameters: broadcast only.
    f.codec(x, status(CodecType::Aac, 44_100));
    f.settle().await;
    assert!(f.env.routing.calls().is_empty());

    // New sample rate: routing is told as well.
    f.codec(x, status(CodecType::Aac, 48_000));
    f.settle().await;
    assert_eq!(f.env.routing.calls(), vec![RoutingCall::CodecConfigChanged(x)]);
    assert_eq!(drain(&mut rx).len(), 2);
}

#[tokio::test]
async fn test_offload_codec_swap_notifies_routing() {
    let f = Fixture::new(EngineConfig::default().offload_enabled(true));
    let x = addr(1);
    f.connect_fully(x).await;
    f.codec(x, status(CodecType::Sbc, 44_100));
    f.settle().await;
    f.service.set_active(Some(x));
    f.env.routing.clear();

    f.codec(x, status(CodecType::Aac, 44_100));
    f.settle().await;
    assert_eq!(f.env.routing.calls(), vec![RoutingCall::CodecConfigChanged(x)]);
}

#[tokio::test]
async fn test_optional_codec_support_rechecked_on_connect() {
    let f = Fixture::new(EngineConfig::default());
    let x = addr(1);
    let mut caps = status(CodecType::Sbc, 44_100);
    caps.selectable_capabilities = vec![
        CodecConfig::new(CodecType::Sbc, 44_100, 16, ChannelMode::Stereo),
        CodecConfig::new(CodecType::Ldac, 96_000, 24, ChannelMode::Stereo),
    ];

    f.service.connect(x).unwrap();
    f.codec(x, caps);
    f.stack(x, ConnectionState::Connected);
    f.settle().await;

    use a2dp_core::PolicyStore;
    assert_eq!(
        f.env.policy.optional_codec_support(&x),
        OptionalCodecSupport::Supported
    );
}

// --- Policy, silence and bonding ---

#[tokio::test]
async fn test_connection_policy_drives_connection() {
    let f = Fixture::new(EngineConfig::default());
    let x = addr(1);

    assert!(f.service.set_connection_policy(x, ConnectionPolicy::Allowed));
    f.settle().await;
    assert_eq!(f.service.connection_state(&x), ConnectionState::Connecting);
    assert_eq!(f.service.connection_policy(&x), ConnectionPolicy::Allowed);

    f.stack(x, ConnectionState::Connected);
    f.settle().await;
    assert!(f.service.set_connection_policy(x, ConnectionPolicy::Forbidden));
    f.settle().await;
    assert_eq!(f.service.connection_state(&x), ConnectionState::Disconnecting);

    f.env.policy.fail_writes(true);
    assert!(!f.service.set_connection_policy(x, ConnectionPolicy::Allowed));
}

#[tokio::test]
async fn test_silence_mode_moves_active_device() {
    let f = Fixture::new(EngineConfig::default());
    let x = addr(1);
    assert!(!f.service.set_silence_mode(x, true));

    f.connect_fully(x).await;
    f.service.set_active(Some(x));

    assert!(f.service.set_silence_mode(x, true));
    assert_eq!(f.service.active_device(), None);
    assert!(f.service.peer(&x).unwrap().silenced);

    assert!(f.service.set_silence_mode(x, false));
    assert_eq!(f.service.active_device(), Some(x));
    assert!(f.env.native.commands().contains(&NativeCommand::SetSilence(x, false)));
}

#[tokio::test]
async fn test_unbonded_peer_removed_once_disconnected() {
    let f = Fixture::new(EngineConfig::default());
    let x = addr(1);
    f.connect_fully(x).await;

    f.env.adapter.set_bond_state(x, BondState::None);
    f.service.on_bond_state_changed(x, BondState::None);
    assert!(f.service.peer(&x).is_some());

    f.stack(x, ConnectionState::Disconnected);
    f.settle().await;
    assert!(f.service.peer(&x).is_none());
    assert!(f.service.dump().peers.is_empty());
}

#[tokio::test]
async fn test_bond_removal_of_disconnected_peer() {
    let f = Fixture::new(EngineConfig::default());
    f.env.native.fail_connect(true);
    f.service.connect(addr(1)).unwrap();
    f.settle().await;

    f.service.on_bond_state_changed(addr(1), BondState::Bonded);
    assert!(f.service.peer(&addr(1)).is_some());
    f.service.on_bond_state_changed(addr(1), BondState::None);
    assert!(f.service.peer(&addr(1)).is_none());
}

// --- Lifecycle and queries ---

#[tokio::test]
async fn test_stop_clears_everything() {
    let f = Fixture::new(EngineConfig::default());
    f.connect_fully(addr(1)).await;
    f.service.set_active(Some(addr(1)));

    f.service.stop();
    assert!(!f.service.is_running());
    assert_eq!(f.service.active_device(), None);
    assert!(f.service.dump().peers.is_empty());
    assert!(matches!(
        f.service.connect(addr(1)),
        Err(Error::ServiceNotRunning)
    ));

    f.service.start().unwrap();
    f.service.connect(addr(1)).unwrap();
    f.settle().await;
    assert_eq!(f.service.connection_state(&addr(1)), ConnectionState::Connecting);
}

#[test]
fn test_invalid_config_rejected() {
    let env = MockEnvironment::new();
    let err = A2dpService::new(
        EngineConfig::default().max_connected_audio_devices(0),
        env.collaborators(),
    )
    .unwrap_err();
    assert!(matches!(err, Error::InvalidConfig(_)));
}

#[tokio::test]
async fn test_devices_matching_states_and_dump() {
    let f = Fixture::new(EngineConfig::default());
    f.connect_fully(addr(2)).await;
    f.service.connect(addr(1)).unwrap();
    f.settle().await;

    assert_eq!(
        f.service
            .devices_matching_states(&[ConnectionState::Connecting, ConnectionState::Connected]),
        vec![addr(1), addr(2)]
    );

    let dump = f.service.dump();
    assert!(dump.running);
    assert_eq!(dump.peers.len(), 2);
    let json = serde_json::to_value(&dump).unwrap();
    assert_eq!(json["peers"][0]["peer"], "00:1A:7D:DA:71:01");
    assert_eq!(json["peers"][0]["state"], "connecting");
    assert_eq!(json["peers"][1]["last_state"], "connecting");
}
