//! Command-line host for the attune core.
//!
//! Thin collaborator: loads config + device identity + token cache, installs
//! tracing, starts the runtime, prints session notifications, and maps fatal
//! outcomes to exit codes (0 normal, 1 fatal init, 2 transport fatal).

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use attune_core::{
    AttuneConfig, AttuneRuntime, DeviceIdentity, SessionEvent, TokenCache, ToolRegistryBuilder,
    TransportKind,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    Gui,
    Cli,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Protocol {
    Websocket,
    Mqtt,
}

#[derive(Debug, Parser)]
#[command(name = "attune", about = "Voice-first conversational client")]
struct Args {
    /// Front-end mode.
    #[arg(long, value_enum, default_value_t = Mode::Cli)]
    mode: Mode,

    /// Override the configured transport protocol.
    #[arg(long, value_enum)]
    protocol: Option<Protocol>,

    /// List audio devices (names usable as input_device/output_device in the
    /// config) and exit.
    #[arg(long)]
    list_devices: bool,

    /// Path to the JSON configuration file.
    #[arg(long, default_value = "attune.json")]
    config: PathBuf,

    /// Path to the device identity file (UUID + serial).
    #[arg(long, default_value = "device.json")]
    identity: PathBuf,

    /// Path to the cached session token.
    #[arg(long, default_value = "token.json")]
    token_cache: PathBuf,
}

const EXIT_OK: u8 = 0;
const EXIT_FATAL_INIT: u8 = 1;
const EXIT_TRANSPORT_FATAL: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("attune=info".parse().unwrap()))
        .init();

    let args = Args::parse();
    match run(args).await {
        Ok(code) => code,
        Err(e) => {
            error!("fatal: {e:#}");
            ExitCode::from(EXIT_FATAL_INIT)
        }
    }
}

async fn run(args: Args) -> anyhow::Result<ExitCode> {
    if args.list_devices {
        print_devices();
        return Ok(ExitCode::from(EXIT_OK));
    }

    if args.mode == Mode::Gui {
        warn!("GUI front-end not bundled in this binary; continuing in CLI mode");
    }

    let mut config = AttuneConfig::load(&args.config)
        .with_context(|| format!("loading config {}", args.config.display()))?;
    if let Some(protocol) = args.protocol {
        config.transport.kind = match protocol {
            Protocol::Websocket => TransportKind::Websocket,
            Protocol::Mqtt => TransportKind::Mqtt,
        };
        config.validate().context("validating config after --protocol override")?;
    }

    let identity = DeviceIdentity::load(&args.identity)
        .with_context(|| format!("loading device identity {}", args.identity.display()))?;
    let token = TokenCache::load(&args.token_cache)
        .with_context(|| format!("loading token cache {}", args.token_cache.display()))?;

    info!(device = %identity.uuid, serial = identity.serial.as_str(), "device identity loaded");

    // Tool implementations are external collaborators; the host registers
    // whatever it ships with. The bare CLI ships none.
    let registry = ToolRegistryBuilder::new().build();

    let runtime = AttuneRuntime::start(config, registry, token.access_token)
        .context("starting runtime")?;
    let mut events = runtime.subscribe();

    runtime.start_conversation().await?;

    let mut exit = EXIT_OK;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received, shutting down");
                break;
            }
            event = events.recv() => {
                match event {
                    Ok(SessionEvent::StateChanged { state, session_id, detail }) => {
                        info!(?state, ?session_id, ?detail, "session state");
                    }
                    Ok(SessionEvent::Transcript { text }) => {
                        println!(">> {text}");
                    }
                    Ok(SessionEvent::TtsSentence { text }) => {
                        println!("<< {text}");
                    }
                    Ok(SessionEvent::WakeWord { keyword, confidence }) => {
                        info!(keyword = keyword.as_str(), confidence, "wake word");
                    }
                    Ok(SessionEvent::Error { reason }) => {
                        error!(reason = reason.as_str(), "session error");
                        if reason.contains("transport") {
                            exit = EXIT_TRANSPORT_FATAL;
                        } else {
                            exit = EXIT_FATAL_INIT;
                        }
                        break;
                    }
                    Err(_) => break,
                }
            }
        }
    }

    runtime.shutdown().await;
    Ok(ExitCode::from(exit))
}

fn print_devices() {
    use attune_core::audio::device::{list_input_devices, list_output_devices, CaptureClass};

    println!("capture devices:");
    for info in list_input_devices() {
        let default = if info.is_default { " (default)" } else { "" };
        let class = match info.class {
            Some(CaptureClass::Microphone) => "microphone",
            Some(CaptureClass::Monitor) => "monitor - unsuitable, re-captures playback",
            Some(CaptureClass::Unknown) | None => "unclassified",
        };
        println!("  {}{default}  [{class}]", info.name);
    }

    println!("playback devices:");
    for info in list_output_devices() {
        let default = if info.is_default { " (default)" } else { "" };
        println!("  {}{default}", info.name);
    }
}
