//! Scripted scenarios.
//!
//! A scenario is a TOML file with an optional `[engine]` table (an
//! [`EngineConfig`]), adapter setup, and an ordered list of `[[step]]`s:
//!
//! ```toml
//! [engine]
//! max_connected_audio_devices = 1
//!
//! [[step]]
//! action = "connect"
//! peer = "00:11:22:33:44:01"
//!
//! [[step]]
//! action = "stack"
//! peer = "00:11:22:33:44:01"
//! state = "connected"
//! ```

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use a2dp_core::mock::{MockEnvironment, NativeCommand};
use a2dp_core::{A2dpService, EngineConfig, EngineEvent, EventReceiver, ServiceDump, StackEvent};
use a2dp_types::{
    AudioState, BondState, ChannelMode, CodecConfig, CodecStatus, CodecType, ConnectionPolicy,
    ConnectionState, PeerId,
};

/// A parsed scenario file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Scenario {
    #[serde(default)]
    pub engine: Option<EngineConfig>,
    #[serde(default)]
    pub adapter: AdapterSetup,
    #[serde(default, rename = "step")]
    pub steps: Vec<Step>,
}

/// Initial adapter facts.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AdapterSetup {
    /// Paired sets as `[first, second]`.
    #[serde(default)]
    pub pairs: Vec<[PeerId; 2]>,
    #[serde(default)]
    pub quiet_mode: bool,
    /// Peers that start unbonded.
    #[serde(default)]
    pub unbonded: Vec<PeerId>,
}

fn default_bits() -> u8 {
    16
}

/// One scripted action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Step {
    Connect {
        peer: PeerId,
    },
    Disconnect {
        peer: PeerId,
    },
    SetActive {
        #[serde(default)]
        peer: Option<PeerId>,
    },
    /// Native connection state event.
    Stack {
        peer: PeerId,
        state: ConnectionState,
    },
    Audio {
        peer: PeerId,
        state: AudioState,
    },
    Codec {
        peer: PeerId,
        codec: CodecType,
        sample_rate: u32,
        #[serde(default = "default_bits")]
        bits_per_sample: u8,
        #[serde(default)]
        channel_mode: ChannelMode,
        #[serde(default)]
        selectable: Vec<CodecType>,
    },
    Bond {
        peer: PeerId,
        state: BondState,
    },
    Policy {
        peer: PeerId,
        policy: ConnectionPolicy,
    },
    Silence {
        peer: PeerId,
        silence: bool,
    },
    /// Let time pass; timeouts may fire.
    Wait {
        ms: u64,
    },
}

impl Scenario {
    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        toml::from_str(content).context("invalid scenario")
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read scenario {}", path.display()))?;
        Self::from_toml_str(&content)
    }
}

/// What one step did.
#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    pub index: usize,
    pub step: Step,
    pub outcome: String,
    pub events: Vec<EngineEvent>,
}

/// Everything a run produced.
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub steps: Vec<StepRecord>,
    pub native_commands: Vec<NativeCommand>,
    pub dump: ServiceDump,
}

/// Run a scenario against mock collaborators.
///
/// `config` overrides the scenario's `[engine]` table.
pub async fn run(scenario: &Scenario, config: Option<EngineConfig>) -> anyhow::Result<Report> {
    let config = config
        .or_else(|| scenario.engine.clone())
        .unwrap_or_default();

    let env = MockEnvironment::new();
    for [a, b] in &scenario.adapter.pairs {
        env.adapter.pair(*a, *b);
    }
    for peer in &scenario.adapter.unbonded {
        env.adapter.set_bond_state(*peer, BondState::None);
    }
    env.adapter.set_quiet_mode(scenario.adapter.quiet_mode);

    let service = A2dpService::new(config, env.collaborators())?;
    let mut rx = service.subscribe();
    service.start()?;

    let mut steps = Vec::with_capacity(scenario.steps.len());
    for (index, step) in scenario.steps.iter().enumerate() {
        let outcome = apply(&service, &env, step).await;
        service.settle().await;
        let events = drain(&mut rx);
        info!("step {index}: {outcome} ({} events)", events.len());
        steps.push(StepRecord {
            index,
            step: step.clone(),
            outcome,
            events,
        });
    }

    let report = Report {
        steps,
        native_commands: env.native.commands(),
        dump: service.dump(),
    };
    service.stop();
    Ok(report)
}

async fn apply(service: &A2dpService, env: &MockEnvironment, step: &Step) -> String {
    debug!("applying {step:?}");
    match step {
        Step::Connect { peer } => result(service.connect(*peer)),
        Step::Disconnect { peer } => result(service.disconnect(*peer)),
        Step::SetActive { peer } => format!("{:?}", service.set_active(*peer)),
        Step::Stack { peer, state } => {
            let outcome = service.handle_stack_event(StackEvent::ConnectionStateChanged {
                peer: *peer,
                state: *state,
            });
            format!("{outcome:?}")
        }
        Step::Audio { peer, state } => {
            let outcome = service.handle_stack_event(StackEvent::AudioStateChanged {
                peer: *peer,
                state: *state,
            });
            format!("{outcome:?}")
        }
        Step::Codec {
            peer,
            codec,
            sample_rate,
            bits_per_sample,
            channel_mode,
            selectable,
        } => {
            let config = CodecConfig::new(*codec, *sample_rate, *bits_per_sample, *channel_mode);
            let mut status = CodecStatus::new(config);
            status.selectable_capabilities = selectable
                .iter()
                .map(|c| CodecConfig::new(*c, *sample_rate, *bits_per_sample, *channel_mode))
                .collect();
            let outcome = service.handle_stack_event(StackEvent::CodecConfigChanged {
                peer: *peer,
                status,
            });
            format!("{outcome:?}")
        }
        Step::Bond { peer, state } => {
            env.adapter.set_bond_state(*peer, *state);
            service.on_bond_state_changed(*peer, *state);
            "Ok".to_string()
        }
        Step::Policy { peer, policy } => {
            format!("{}", service.set_connection_policy(*peer, *policy))
        }
        Step::Silence { peer, silence } => {
            format!("{}", service.set_silence_mode(*peer, *silence))
        }
        Step::Wait { ms } => {
            tokio::time::sleep(Duration::from_millis(*ms)).await;
            "Ok".to_string()
        }
    }
}

fn result(result: a2dp_core::Result<()>) -> String {
    match result {
        Ok(()) => "Ok".to_string(),
        Err(e) => format!("Error: {e}"),
    }
}

fn drain(rx: &mut EventReceiver) -> Vec<EngineEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
