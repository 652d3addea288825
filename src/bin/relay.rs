//! Audio Relay Application
//!
//! Streams a WAV track from the audio server into a simulated BLE link that
//! writes every notification payload to a file, or sends one control
//! command to the server.
//!
//! ```text
//! relay [--config PATH] [--out PATH]
//! relay [--config PATH] command <play [TRACK]|pause|stop|next|prev|volume N>
//! ```

use anyhow::{bail, Context, Result};
use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ble_audio_relay::{
    config::AppConfig,
    gatt::{link::ATT_MTU_MAX, service::CCC_NOTIFY, AudioService, SimulatedLink, SystemClock},
    network::{send_command, IngestOptions, ServerCommand, TcpConnector},
    pipeline::StreamSession,
};

enum Mode {
    Stream { out: PathBuf },
    Command(ServerCommand),
}

struct Args {
    config: Option<PathBuf>,
    mode: Mode,
}

fn parse_args(args: impl Iterator<Item = String>) -> Result<Args> {
    let mut config = None;
    let mut out = PathBuf::from("relay-notifications.pcm");
    let mut rest = Vec::new();

    let mut args = args.peekable();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => config = Some(PathBuf::from(args.next().context("--config needs a path")?)),
            "--out" => out = PathBuf::from(args.next().context("--out needs a path")?),
            _ => rest.push(arg),
        }
    }

    let mode = match rest.first().map(String::as_str) {
        None => Mode::Stream { out },
        Some("command") => Mode::Command(parse_command(&rest[1..])?),
        Some(other) => bail!("unknown argument: {}", other),
    };
    Ok(Args { config, mode })
}

fn parse_command(words: &[String]) -> Result<ServerCommand> {
    let command = match words.first().map(String::as_str) {
        Some("play") => ServerCommand::Play {
            track: words.get(1).cloned(),
        },
        Some("pause") => ServerCommand::Pause,
        Some("stop") => ServerCommand::Stop,
        Some("next") => ServerCommand::Next,
        Some("prev") => ServerCommand::Prev,
        Some("volume") => {
            let level: u8 = words
                .get(1)
                .context("volume needs a level")?
                .parse()
                .context("volume level must be 0..=100")?;
            if level > 100 {
                bail!("volume level must be 0..=100");
            }
            ServerCommand::Volume { level }
        }
        Some(other) => bail!("unknown command: {}", other),
        None => bail!("missing command"),
    };
    Ok(command)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = parse_args(std::env::args().skip(1))?;
    let config = AppConfig::load_or_default(args.config.as_deref())?;

    match args.mode {
        Mode::Command(command) => run_command(config, command).await,
        Mode::Stream { out } => run_stream(config, out).await,
    }
}

async fn run_command(config: AppConfig, command: ServerCommand) -> Result<()> {
    let network = config.network;
    let response = tokio::task::spawn_blocking(move || {
        let mut connector = TcpConnector::new(&network);
        send_command(
            &mut connector,
            &network.host,
            network.port,
            &command,
            IngestOptions::from(&network),
        )
    })
    .await??;

    println!("{} {}", response.status, response.body);
    Ok(())
}

async fn run_stream(config: AppConfig, out: PathBuf) -> Result<()> {
    tracing::info!("Starting BLE audio relay");
    tracing::info!("Audio server: {}:{}", config.network.host, config.network.port);

    let file = File::create(&out).with_context(|| format!("cannot create {}", out.display()))?;
    let link = SimulatedLink::new(BufWriter::new(file));

    // The simulated peer connects with the largest MTU and subscribes at once
    let (service, endpoint) = AudioService::new(&config.control);
    service.on_connected(Some(ATT_MTU_MAX));
    service.on_subscription_changed(CCC_NOTIFY);

    let session = StreamSession::start(
        &config,
        TcpConnector::new(&config.network),
        link,
        SystemClock,
        service.clone(),
        endpoint,
    )?;
    tracing::info!("Session {} started, writing notifications to {}", session.id(), out.display());

    let cancel = session.cancel_handle();
    let mut join = tokio::task::spawn_blocking(move || session.join());

    let result = tokio::select! {
        joined = &mut join => joined?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted, shutting down");
            cancel.cancel();
            join.await?
        }
    };

    match result {
        Ok(report) => {
            tracing::info!("Status: {}", service.read_status());
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Err(e) => {
            tracing::error!(stage = %e.stage, offset = e.offset, "Session failed: {}", e);
            Err(e.into())
        }
    }
}
