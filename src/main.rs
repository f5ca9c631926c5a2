use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{info, warn};

use voice_order_session::config::AppConfig;
use voice_order_session::core::order::{MatchKind, resolve};
use voice_order_session::core::transport::{ChannelMicrophone, LoopbackFactory, LoopbackRemote};
use voice_order_session::{
    SessionEvent, SessionHandle, SessionServices, StaticMenu, StaticTokenBroker,
};

/// Voice ordering session - drive a realtime ordering conversation
#[derive(Parser, Debug)]
#[command(name = "voice-order")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Subcommand to run
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Resolve a spoken item name against the menu
    Resolve {
        /// What the guest said, e.g. "two fahitas"
        utterance: String,

        /// Menu file (YAML); defaults to the configured menu
        #[arg(short = 'm', long = "menu")]
        menu: Option<PathBuf>,
    },

    /// Replay a JSON-lines script against an in-memory model
    Simulate {
        /// Script file, one step per line
        script: PathBuf,

        /// Menu file (YAML); defaults to the configured menu
        #[arg(short = 'm', long = "menu")]
        menu: Option<PathBuf>,
    },

    /// Connect to the realtime model over WebRTC
    Run {
        /// Raw G.711 mu-law audio file or pipe used as the microphone
        #[arg(long = "mic")]
        mic: PathBuf,

        /// Menu file (YAML); defaults to the configured menu
        #[arg(short = 'm', long = "menu")]
        menu: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if it exists (must be done before config loading)
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    let config = if let Some(config_path) = &cli.config {
        info!("Loading configuration from {}", config_path.display());
        AppConfig::from_file(config_path)?
    } else {
        AppConfig::from_env()?
    };

    match cli.command {
        Commands::Resolve { utterance, menu } => {
            let menu = load_menu(&config, menu.as_deref())?;
            resolve_utterance(&config, &menu, &utterance).await
        }
        Commands::Simulate { script, menu } => {
            let menu = load_menu(&config, menu.as_deref())?;
            let steps = read_script(&script)?;
            simulate(&config, menu, steps).await
        }
        Commands::Run { mic, menu } => {
            let menu = load_menu(&config, menu.as_deref())?;
            run(&config, menu, mic).await
        }
    }
}

fn load_menu(config: &AppConfig, path: Option<&Path>) -> anyhow::Result<StaticMenu> {
    match path {
        Some(path) => StaticMenu::from_file(path)
            .map_err(|e| anyhow!("Failed to load menu {}: {e}", path.display())),
        None => Ok(config.load_menu()?),
    }
}

async fn resolve_utterance(
    config: &AppConfig,
    menu: &StaticMenu,
    utterance: &str,
) -> anyhow::Result<()> {
    use voice_order_session::MenuCatalog;

    let items = menu.items().await?;
    match resolve(utterance, &items, &config.order.matcher) {
        Ok(found) => {
            let kind = match found.kind {
                MatchKind::Exact => "exact",
                MatchKind::Alias => "alias",
                MatchKind::Phonetic => "phonetic",
                MatchKind::Fuzzy => "fuzzy",
            };
            println!(
                "{} ({}) via {kind} match, score {:.3}",
                found.item.name, found.item.id, found.score
            );
        }
        Err(e) => println!("{e}"),
    }
    Ok(())
}

// =============================================================================
// Simulation
// =============================================================================

/// One line of a simulation script.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum ScriptStep {
    /// Deliver a server frame to the session
    Inject { frame: serde_json::Value },
    /// Drop the live connection
    Drop {
        #[serde(default = "default_drop_reason")]
        reason: String,
    },
    /// Let the session run for a while
    Wait { ms: u64 },
    /// Issue a caller command
    Command {
        name: String,
        #[serde(default)]
        text: Option<String>,
    },
    /// Print the cart
    Cart,
}

fn default_drop_reason() -> String {
    "dropped by script".to_string()
}

fn parse_script(contents: &str) -> anyhow::Result<Vec<ScriptStep>> {
    contents
        .lines()
        .enumerate()
        .filter(|(_, line)| {
            let line = line.trim();
            !line.is_empty() && !line.starts_with('#')
        })
        .map(|(n, line)| {
            serde_json::from_str(line).with_context(|| format!("script line {}", n + 1))
        })
        .collect()
}

fn read_script(path: &Path) -> anyhow::Result<Vec<ScriptStep>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read script {}", path.display()))?;
    parse_script(&contents)
}

async fn simulate(
    config: &AppConfig,
    menu: StaticMenu,
    steps: Vec<ScriptStep>,
) -> anyhow::Result<()> {
    let (factory, remote) = LoopbackFactory::pair();
    let (microphone, _mic_tx) = ChannelMicrophone::pair();

    let mut options = config.session_options();
    options.capture_audio = false;
    let services = SessionServices {
        broker: Arc::new(StaticTokenBroker::new("ek_simulated")),
        peers: Arc::new(factory),
        microphone: Arc::new(microphone),
        catalog: Arc::new(menu),
    };

    let (session, events) = SessionHandle::start(options, services);
    let printer = tokio::spawn(print_events(events));

    // Let the session reach its first ready state before replaying.
    tokio::time::sleep(Duration::from_millis(50)).await;

    for step in steps {
        run_step(&session, &remote, step).await?;
    }

    let cart = session.cart().await?;
    println!("{}", serde_json::to_string_pretty(&cart)?);

    session.stop().await;
    let _ = printer.await;
    Ok(())
}

async fn run_step(
    session: &SessionHandle,
    remote: &LoopbackRemote,
    step: ScriptStep,
) -> anyhow::Result<()> {
    match step {
        ScriptStep::Inject { frame } => {
            if !remote.inject_json(frame) {
                warn!("No live connection, frame not delivered");
            }
        }
        ScriptStep::Drop { reason } => {
            remote.drop_connection(&reason);
        }
        ScriptStep::Wait { ms } => tokio::time::sleep(Duration::from_millis(ms)).await,
        ScriptStep::Command { name, text } => {
            let result = match name.as_str() {
                "start_recording" => session.start_recording().await,
                "stop_recording" => session.stop_recording().await,
                "pause" => session.pause().await,
                "resume" => session.resume().await,
                "send_text" => session.send_text(text.unwrap_or_default()).await,
                other => return Err(anyhow!("Unknown command {other:?}")),
            };
            if let Err(e) = result {
                println!("command {name} rejected: {e}");
            }
        }
        ScriptStep::Cart => {
            let cart = session.cart().await?;
            println!(
                "cart: {} item(s), subtotal {} cents",
                cart.item_count(),
                cart.subtotal_cents()
            );
        }
    }
    Ok(())
}

async fn print_events(mut events: mpsc::UnboundedReceiver<SessionEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::StateChanged(change) => {
                println!("state: {} -> {}", change.from, change.to)
            }
            SessionEvent::Transcript {
                role,
                text,
                is_final: true,
            } => println!("{role}: {text}"),
            SessionEvent::Transcript { .. } => {}
            SessionEvent::CartUpdated(cart) => println!(
                "cart updated: {} item(s), subtotal {} cents",
                cart.item_count(),
                cart.subtotal_cents()
            ),
            SessionEvent::ClarificationNeeded {
                message,
                suggestion,
                ..
            } => match suggestion {
                Some(suggestion) => println!("clarify: {message} (did you mean {suggestion}?)"),
                None => println!("clarify: {message}"),
            },
            SessionEvent::RemoteError { code, message } => {
                println!("remote error {}: {message}", code.unwrap_or_default())
            }
            SessionEvent::MicrophoneLost(e) => println!("microphone lost: {e}"),
            SessionEvent::MicrophoneMuted => println!("microphone muted"),
            SessionEvent::MicrophoneUnmuted => println!("microphone unmuted"),
            SessionEvent::Reconnected(event) => {
                println!("reconnected on attempt {}", event.attempt)
            }
            SessionEvent::Failed(e) => println!("session failed: {e}"),
        }
    }
}

// =============================================================================
// Live
// =============================================================================

#[cfg(feature = "webrtc-peer")]
async fn run(config: &AppConfig, menu: StaticMenu, mic: PathBuf) -> anyhow::Result<()> {
    use voice_order_session::core::transport::ReaderMicrophone;
    use voice_order_session::core::transport::webrtc::WebRtcPeerFactory;

    let services = SessionServices {
        broker: Arc::new(config.token_broker()?),
        peers: Arc::new(WebRtcPeerFactory::new(config.signaling())),
        microphone: Arc::new(ReaderMicrophone::new(mic)),
        catalog: Arc::new(menu),
    };

    let (session, events) = SessionHandle::start(config.session_options(), services);
    let printer = tokio::spawn(print_events(events));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, stopping session");
            session.stop().await;
        }
        _ = session.closed() => {}
    }

    let cart = session.cart().await?;
    println!("{}", serde_json::to_string_pretty(&cart)?);
    let _ = printer.await;
    Ok(())
}

#[cfg(not(feature = "webrtc-peer"))]
async fn run(_config: &AppConfig, _menu: StaticMenu, _mic: PathBuf) -> anyhow::Result<()> {
    anyhow::bail!("`run` needs the webrtc-peer feature (cargo build --features webrtc-peer)")
}
