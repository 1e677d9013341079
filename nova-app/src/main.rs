//! `nova` — Nova Agent OS voice host.
//!
//! ```text
//! nova [live] [--agent ID] [--voice NAME]   talk to an agent until Ctrl-C
//! nova speak [--voice NAME] TEXT...         synthesize and play a reply
//! nova agents | devices
//! nova memory add FACT | list | clear
//! nova key KEY
//! ```
//!
//! ## Runtime note
//!
//! Live mode builds a multi-threaded Tokio runtime: the inbound event task
//! and the websocket run on it while capture sits on a blocking thread.
//! `speak` needs no runtime; synthesis uses blocking HTTP.

mod agents;
mod console;
mod settings;
mod speech;

use std::io::BufRead;
use std::path::Path;
use std::sync::{mpsc, Arc};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use nova_core::audio::device::{self, DeviceInfo};
use nova_core::{
    CpalMicrophone, CpalOutput, LiveConfig, LiveEngine, LiveServices, NovaError, SessionStatus,
    TurnPlayer, TurnState, WsConnector,
};
use settings::{default_settings_path, load_settings, save_settings, AppSettings};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

const NO_KEY_HINT: &str = "no API key configured: run `nova key <KEY>` or set NOVA_API_KEY";

/// Nova: realtime voice conversations with agent personas.
#[derive(Parser, Debug)]
#[command(name = "nova", version, about, args_conflicts_with_subcommands = true)]
struct Cli {
    /// Live-mode options when no command is given.
    #[command(flatten)]
    live: LiveArgs,

    /// Subcommand to run (default: live).
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Args, Debug, Clone, Default, PartialEq)]
struct LiveArgs {
    /// Agent persona id (see `nova agents`).
    #[arg(long)]
    agent: Option<String>,

    /// Prebuilt voice, overriding the persona default.
    #[arg(long)]
    voice: Option<String>,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
enum Command {
    /// Start a live voice session; Ctrl-C ends it.
    Live(LiveArgs),

    /// Synthesize and play TEXT. stdin: p pause, r resume, s stop, v <0..1> volume.
    Speak {
        /// Prebuilt voice for synthesis.
        #[arg(long)]
        voice: Option<String>,

        #[arg(required = true, num_args = 1.., trailing_var_arg = true)]
        text: Vec<String>,
    },

    /// List agent personas.
    Agents,

    /// List audio devices.
    Devices,

    /// Manage remembered facts.
    Memory {
        #[command(subcommand)]
        action: MemoryAction,
    },

    /// Store the API key in settings.
    Key { key: String },
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
enum MemoryAction {
    /// Remember a fact for future live sessions.
    Add {
        #[arg(required = true, num_args = 1..)]
        fact: Vec<String>,
    },
    /// Show remembered facts.
    List,
    /// Forget every fact.
    Clear,
}

impl Cli {
    fn into_command(self) -> Command {
        self.command.unwrap_or(Command::Live(self.live))
    }
}

fn main() {
    // ── Tracing ───────────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("nova=info,nova_core=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli.into_command()) {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

fn run(command: Command) -> Result<()> {
    let settings_path = default_settings_path();
    let mut settings = load_settings(&settings_path);

    match command {
        Command::Live(args) => run_live(&settings, args.agent.as_deref(), args.voice),
        Command::Speak { voice, text } => {
            let text = text.join(" ");
            if text.trim().is_empty() {
                bail!("nothing to say");
            }
            let volume = run_speak(&settings, voice, &text)?;
            if (volume - settings.volume).abs() > f32::EPSILON {
                settings.volume = volume;
                persist(&settings_path, &settings)?;
            }
            Ok(())
        }
        Command::Agents => {
            for agent in agents::AGENTS {
                let marker = if agent.id == settings.agent { "*" } else { " " };
                println!(
                    "{marker} {:<11} {:<17} {}",
                    agent.id, agent.name, agent.description
                );
            }
            Ok(())
        }
        Command::Devices => {
            print_devices("input", &device::list_input_devices());
            print_devices("output", &device::list_output_devices());
            Ok(())
        }
        Command::Memory {
            action: MemoryAction::Add { fact },
        } => {
            let fact = fact.join(" ");
            if !settings.add_memory(&fact) {
                bail!("memory not added (blank, duplicate or list full)");
            }
            persist(&settings_path, &settings)?;
            println!("remembered: {}", fact.trim());
            Ok(())
        }
        Command::Memory {
            action: MemoryAction::List,
        } => {
            if settings.memories.is_empty() {
                println!("no memories");
            }
            for (i, fact) in settings.memories.iter().enumerate() {
                println!("{:>3}. {fact}", i + 1);
            }
            Ok(())
        }
        Command::Memory {
            action: MemoryAction::Clear,
        } => {
            let n = settings.memories.len();
            settings.memories.clear();
            persist(&settings_path, &settings)?;
            println!("cleared {n} memories");
            Ok(())
        }
        Command::Key { key } => {
            settings.api_key = Some(key);
            settings.normalize();
            if settings.api_key.is_none() {
                bail!("API key must not be blank");
            }
            persist(&settings_path, &settings)?;
            println!("API key saved to {}", settings_path.display());
            Ok(())
        }
    }
}

fn persist(path: &Path, settings: &AppSettings) -> Result<()> {
    save_settings(path, settings)
        .with_context(|| format!("saving settings to {}", path.display()))
}

fn print_devices(kind: &str, devices: &[DeviceInfo]) {
    println!("{kind} devices:");
    if devices.is_empty() {
        println!("  (none)");
    }
    for d in devices {
        let default = if d.is_default { " (default)" } else { "" };
        let loopback = if d.is_loopback_like { " [loopback?]" } else { "" };
        println!("  {}{default}{loopback}", d.name);
    }
}

// ---------------------------------------------------------------------------
// live
// ---------------------------------------------------------------------------

fn run_live(settings: &AppSettings, agent_id: Option<&str>, voice: Option<String>) -> Result<()> {
    let agent = agents::find_agent(agent_id.unwrap_or(&settings.agent));
    let voice = voice.unwrap_or_else(|| settings.live_voice(agent));
    let api_key = settings.resolve_api_key().unwrap_or_default();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("starting async runtime")?;

    runtime.block_on(async {
        let output = Arc::new(
            CpalOutput::open(settings.preferred_output_device.as_deref())
                .context("opening output device")?,
        );
        let bridge = Arc::new(console::ConsoleBridge::new(agent.name));
        let engine = LiveEngine::new(
            LiveConfig {
                model: settings.live_model.clone(),
                memories: settings.memories.clone(),
                persist_transcripts: settings.persist_transcripts,
                ..LiveConfig::default()
            },
            LiveServices {
                connector: Arc::new(WsConnector::new(settings.endpoint.clone())),
                microphone: Arc::new(CpalMicrophone::new(settings.preferred_input_device.clone())),
                output,
                bridge: bridge.clone(),
            },
        );
        let mut status = engine.subscribe_status();

        match engine.start(&api_key, agent.system_instruction, &voice).await {
            Ok(()) => {}
            Err(NovaError::MissingCredential) => bail!(NO_KEY_HINT),
            Err(e) => return Err(e).context("live session failed to start"),
        }
        println!("live with {} ({voice}); speak now, Ctrl-C to end", agent.name);

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    engine.stop();
                    break;
                }
                event = status.recv() => match event {
                    Ok(ev) if ev.status == SessionStatus::Error => {
                        warn!(detail = ev.detail.as_deref().unwrap_or(""), "live session error");
                    }
                    Ok(ev) if ev.status == SessionStatus::Closed => break,
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => break,
                },
            }
        }

        let diag = engine.pipeline_diagnostics_snapshot();
        info!(
            turns = bridge.history().len() / 2,
            frames_sent = diag.frames_sent,
            send_errors = diag.send_errors,
            "live session ended"
        );
        println!();
        Ok::<(), anyhow::Error>(())
    })
}

// ---------------------------------------------------------------------------
// speak
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
enum Control {
    Pause,
    Resume,
    Stop,
    Volume(f32),
}

fn parse_control(line: &str) -> std::result::Result<Control, String> {
    let mut parts = line.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some("p"), None) => Ok(Control::Pause),
        (Some("r"), None) => Ok(Control::Resume),
        (Some("s") | Some("q"), None) => Ok(Control::Stop),
        (Some("v"), Some(level)) => level
            .parse::<f32>()
            .map(Control::Volume)
            .map_err(|_| format!("not a volume: {level}")),
        _ => Err("commands: p, r, s, v <0..1>".into()),
    }
}

/// Play synthesized speech until it ends or the user stops it.
/// Returns the final volume.
fn run_speak(settings: &AppSettings, voice: Option<String>, text: &str) -> Result<f32> {
    let api_key = settings
        .resolve_api_key()
        .ok_or_else(|| anyhow!(NO_KEY_HINT))?;
    let voice = voice.unwrap_or_else(|| settings.tts_voice.clone());
    let client = speech::SpeechClient::new(api_key, settings.tts_model.clone())?;
    let chunk = client.synthesize(text, &voice)?;

    let output = Arc::new(
        CpalOutput::open(settings.preferred_output_device.as_deref())
            .context("opening output device")?,
    );
    let player = TurnPlayer::new(output);
    player.set_volume(settings.volume);
    player.speak(chunk);
    println!("playing ({voice}); p pause, r resume, s stop, v <0..1> volume");

    let (line_tx, line_rx) = mpsc::channel::<String>();
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if line_tx.send(line).is_err() {
                break;
            }
        }
    });

    while player.state() != TurnState::Idle {
        let line = match line_rx.recv_timeout(Duration::from_millis(100)) {
            Ok(line) => line,
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                std::thread::sleep(Duration::from_millis(100));
                continue;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let result = match parse_control(&line) {
            Ok(Control::Pause) => player.pause().map_err(|e| e.to_string()),
            Ok(Control::Resume) => player.resume().map_err(|e| e.to_string()),
            Ok(Control::Stop) => {
                player.stop();
                Ok(())
            }
            Ok(Control::Volume(v)) => {
                player.set_volume(v);
                println!("volume {:.2}", player.volume());
                Ok(())
            }
            Err(msg) => Err(msg),
        };
        if let Err(msg) = result {
            println!("{msg}");
        } else {
            info!(state = player.state().as_str(), position = player.position(), "playback");
        }
    }
    Ok(player.volume())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> std::result::Result<Command, clap::Error> {
        Cli::try_parse_from(std::iter::once("nova").chain(args.iter().copied()))
            .map(Cli::into_command)
    }

    #[test]
    fn no_arguments_means_live_with_defaults() {
        assert_eq!(parse(&[]).unwrap(), Command::Live(LiveArgs::default()));
    }

    #[test]
    fn live_flags_work_with_and_without_subcommand() {
        let expected = Command::Live(LiveArgs {
            agent: Some("coder".into()),
            voice: Some("Puck".into()),
        });
        assert_eq!(
            parse(&["live", "--agent", "coder", "--voice", "Puck"]).unwrap(),
            expected
        );
        assert_eq!(parse(&["--agent", "coder", "--voice", "Puck"]).unwrap(), expected);
        assert!(parse(&["live", "--agent"]).is_err());
    }

    #[test]
    fn speak_takes_voice_and_words() {
        assert_eq!(
            parse(&["speak", "--voice", "Kore", "hello", "world"]).unwrap(),
            Command::Speak {
                voice: Some("Kore".into()),
                text: vec!["hello".into(), "world".into()],
            }
        );
        assert!(parse(&["speak"]).is_err());
    }

    #[test]
    fn memory_subcommands_parse() {
        assert_eq!(
            parse(&["memory", "add", "likes", "tea"]).unwrap(),
            Command::Memory {
                action: MemoryAction::Add {
                    fact: vec!["likes".into(), "tea".into()],
                },
            }
        );
        assert_eq!(
            parse(&["memory", "list"]).unwrap(),
            Command::Memory {
                action: MemoryAction::List
            }
        );
        assert!(parse(&["memory", "add"]).is_err());
        assert!(parse(&["bogus"]).is_err());
    }

    #[test]
    fn key_needs_a_value() {
        assert_eq!(
            parse(&["key", "abc"]).unwrap(),
            Command::Key { key: "abc".into() }
        );
        assert!(parse(&["key"]).is_err());
    }

    #[test]
    fn playback_controls_parse() {
        assert_eq!(parse_control("p"), Ok(Control::Pause));
        assert_eq!(parse_control(" r "), Ok(Control::Resume));
        assert_eq!(parse_control("s"), Ok(Control::Stop));
        assert_eq!(parse_control("v 0.5"), Ok(Control::Volume(0.5)));
        assert!(parse_control("v loud").is_err());
        assert!(parse_control("x").is_err());
    }
}
