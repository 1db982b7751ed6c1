use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand, ValueEnum};
use qcc_core::config::CoreConfig;
use qcc_core::connection_core::ConnectionCore;
use qcc_core::crypto::{Ed25519Verifier, K12Hasher};
use qcc_core::events::CoreEvent;
use qcc_core::outbox::{OutboxEntry, SledOutboxStore};
use qcc_core::peer::WebSocketConnector;
use qcc_core::transfer::{ReferenceTransferBuilder, TransferBuilder, TransferRequest};
use qcc_core::wire::{
    EnergyRequest, IdentityRequest, MessageDigest, StatusRequest, TransferSubmit, CMD_ENERGY,
    CMD_IDENTITY, CMD_STATUS,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Parser)]
#[command(version, author, about = "Quorum-replicating ledger client")]
struct Opts {
    /// The console loglevel.
    #[arg(value_enum, short = 'v', long = "log-level", default_value = "info", env = "QCC_LOG_LEVEL")]
    log_level: LogLevel,

    /// Path to the JSON core configuration (computors, admin public key, ...).
    #[arg(short = 'c', long = "config", default_value = "qcc.json", env = "QCC_CONFIG")]
    config: PathBuf,

    /// Directory for the durable transfer outbox (a sled database).
    #[arg(long = "outbox-dir", default_value = "qcc-outbox", env = "QCC_OUTBOX_DIR")]
    outbox_dir: PathBuf,

    /// How long to wait for a quorum-resolved reply before giving up.
    #[arg(long = "request-timeout", value_parser = parse_duration::parse, default_value = "10s", env = "QCC_REQUEST_TIMEOUT")]
    request_timeout: Duration,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Look up the current nonce for an identity, by quorum agreement.
    Identity { identity: String },
    /// Look up the current energy balance for an identity, by quorum agreement.
    Energy { identity: String },
    /// Build, sign, and submit a transfer, tracking it in the durable outbox.
    Transfer(TransferOpts),
    /// Poll the current inclusion status of a previously submitted transfer.
    Status {
        /// Hex-encoded message digest, as printed by `transfer`.
        message_digest: String,
    },
    /// Stay connected and print Event Bus activity until interrupted.
    Watch,
}

#[derive(Parser)]
struct TransferOpts {
    /// Hex-encoded 32-byte Ed25519 signing key for the sender.
    #[arg(long)]
    signing_key_hex: String,
    #[arg(long)]
    index: u64,
    #[arg(long)]
    sender: String,
    #[arg(long)]
    identity_nonce: u64,
    #[arg(long)]
    energy: u64,
    #[arg(long)]
    required_energy: u64,
    #[arg(long)]
    recipient: String,
    /// Hex-encoded effect payload, e.g. the recipient-specific transfer body.
    #[arg(long, default_value = "")]
    payload_hex: String,
    /// Block until the outbox reports inclusion or rejection.
    #[arg(long)]
    wait: bool,
}

fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(opts.log_level.as_str())),
        )
        .init();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_time()
        .enable_io()
        .build()?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        use signal_hook::{consts::SIGINT, consts::SIGTERM, iterator::Signals};
        let mut signals = Signals::new([SIGINT, SIGTERM])?;
        std::thread::spawn(move || {
            let mut cancel_triggered = false;
            while let Some(sig) = signals.forever().next() {
                if cancel_triggered {
                    warn!("received signal {:?}, forcing shutdown", sig);
                    std::process::exit(1)
                }
                warn!("received signal {:?}, shutting down", sig);
                cancel.cancel();
                cancel_triggered = true;
            }
        });
    }

    let result = rt.block_on(async_main(opts, cancel));
    rt.shutdown_timeout(Duration::from_secs(1));
    if let Err(e) = &result {
        error!("error: {e:#}");
        std::process::exit(1);
    }
    Ok(())
}

async fn async_main(opts: Opts, cancel: CancellationToken) -> anyhow::Result<()> {
    let config_bytes = tokio::fs::read(&opts.config)
        .await
        .with_context(|| format!("error reading config file {:?}", opts.config))?;
    let config: CoreConfig =
        serde_json::from_slice(&config_bytes).context("error parsing core config")?;

    tokio::fs::create_dir_all(&opts.outbox_dir)
        .await
        .with_context(|| format!("error creating outbox dir {:?}", opts.outbox_dir))?;
    let db = sled::open(&opts.outbox_dir)
        .with_context(|| format!("error opening outbox db at {:?}", opts.outbox_dir))?;
    let store = Arc::new(SledOutboxStore::open(&db)?);

    let core = ConnectionCore::start(
        config,
        Arc::new(WebSocketConnector),
        Arc::new(Ed25519Verifier),
        store,
    );

    let result = match opts.command {
        Command::Identity { identity } => run_identity(&core, opts.request_timeout, identity).await,
        Command::Energy { identity } => run_energy(&core, opts.request_timeout, identity).await,
        Command::Transfer(t) => run_transfer(&core, opts.request_timeout, t).await,
        Command::Status { message_digest } => run_status(&core, opts.request_timeout, message_digest).await,
        Command::Watch => run_watch(&core, cancel).await,
    };

    core.terminate();
    result
}

async fn run_identity(core: &ConnectionCore, timeout: Duration, identity: String) -> anyhow::Result<()> {
    let payload = serde_json::to_value(IdentityRequest {
        identity: identity.clone(),
    })?;
    let reply = tokio::time::timeout(
        timeout,
        core.router.send_command(CMD_IDENTITY, payload, identity),
    )
    .await
    .context("timed out waiting for quorum")??;
    println!("{}", serde_json::to_string_pretty(&reply_to_json(&reply)?)?);
    Ok(())
}

async fn run_energy(core: &ConnectionCore, timeout: Duration, identity: String) -> anyhow::Result<()> {
    let payload = serde_json::to_value(EnergyRequest {
        identity: identity.clone(),
    })?;
    let reply = tokio::time::timeout(
        timeout,
        core.router.send_command(CMD_ENERGY, payload, identity),
    )
    .await
    .context("timed out waiting for quorum")??;
    println!("{}", serde_json::to_string_pretty(&reply_to_json(&reply)?)?);
    Ok(())
}

async fn run_transfer(
    core: &ConnectionCore,
    timeout: Duration,
    opts: TransferOpts,
) -> anyhow::Result<()> {
    let key_bytes = hex::decode(&opts.signing_key_hex).context("signing key must be hex")?;
    let key_array: [u8; 32] = key_bytes
        .try_into()
        .map_err(|_| anyhow::anyhow!("signing key must be 32 bytes"))?;
    let signing_key = ed25519_dalek::SigningKey::from_bytes(&key_array);
    let effect_payload = hex::decode(&opts.payload_hex).context("payload must be hex")?;

    let builder = ReferenceTransferBuilder::new(Box::new(K12Hasher));
    let draft = builder
        .build(TransferRequest {
            signing_key,
            index: opts.index,
            sender_identity: opts.sender,
            identity_nonce: opts.identity_nonce,
            energy: opts.energy,
            recipient_identity: opts.recipient,
            effect_payload,
            required_energy: opts.required_energy,
        })
        .await?;

    let digest = draft.message_digest;
    core.outbox
        .put(
            digest,
            OutboxEntry {
                message: draft.message.clone(),
                signature: draft.signature.clone(),
            },
        )
        .await?;

    // Write-ahead is durable now; submit command 3 to the network. A crash
    // or send failure past this point is recovered by the outbox's own
    // status-poll loop once sync catches up, not by retrying here.
    let submit = serde_json::to_value(TransferSubmit {
        message: draft.message,
        signature: draft.signature,
    })?;
    core.router.send_fire_and_forget(submit);
    println!("submitted, message_digest={}", digest.to_hex());

    if opts.wait {
        wait_for_status(core, timeout, digest).await?;
    }
    Ok(())
}

async fn run_status(core: &ConnectionCore, timeout: Duration, message_digest: String) -> anyhow::Result<()> {
    let digest = MessageDigest::from_hex(&message_digest)
        .context("message_digest must be 32 bytes of hex")?;
    let payload = serde_json::to_value(StatusRequest {
        message_digest: digest,
    })?;
    let reply = tokio::time::timeout(
        timeout,
        core.router.send_command(CMD_STATUS, payload, digest.to_hex()),
    )
    .await
    .context("timed out waiting for quorum")??;
    println!("{}", serde_json::to_string_pretty(&reply_to_json(&reply)?)?);
    Ok(())
}

/// Subscribes to the Event Bus and blocks until a terminal verdict for
/// `digest` arrives (the sync-gated polling loop runs independently; this
/// just reports back to the caller).
async fn wait_for_status(core: &ConnectionCore, timeout: Duration, digest: MessageDigest) -> anyhow::Result<()> {
    let mut sub = core.events.subscribe();
    tokio::time::timeout(timeout, async {
        loop {
            match sub.recv().await {
                Ok(CoreEvent::Inclusion { digest: d, tick, epoch, .. }) if d == digest => {
                    println!("included at tick={tick} epoch={epoch}");
                    return Ok(());
                }
                Ok(CoreEvent::Rejection { digest: d, reason }) if d == digest => {
                    println!("rejected: {reason}");
                    return Ok(());
                }
                Ok(_) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    bail!("event bus closed before a verdict arrived")
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
            }
        }
    })
    .await
    .context("timed out waiting for inclusion/rejection")?
}

async fn run_watch(core: &ConnectionCore, cancel: CancellationToken) -> anyhow::Result<()> {
    let mut sub = core.events.subscribe();
    info!("watching event bus, press ctrl-c to stop");
    loop {
        tokio::select! {
            ev = sub.recv() => match ev {
                Ok(ev) => println!("{ev:?}"),
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return Ok(()),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
            },
            _ = cancel.cancelled() => return Ok(()),
        }
    }
}

fn reply_to_json(reply: &qcc_core::wire::Inbound) -> anyhow::Result<serde_json::Value> {
    Ok(serde_json::to_value(ReplyView::from(reply))?)
}

#[derive(serde::Serialize)]
#[serde(untagged)]
enum ReplyView<'a> {
    Identity(&'a qcc_core::wire::IdentityReply),
    Energy(&'a qcc_core::wire::EnergyReply),
    Status(&'a qcc_core::wire::StatusReply),
    Other,
}

impl<'a> From<&'a qcc_core::wire::Inbound> for ReplyView<'a> {
    fn from(inbound: &'a qcc_core::wire::Inbound) -> Self {
        match inbound {
            qcc_core::wire::Inbound::Identity(r) => ReplyView::Identity(r),
            qcc_core::wire::Inbound::Energy(r) => ReplyView::Energy(r),
            qcc_core::wire::Inbound::Status(r) => ReplyView::Status(r),
            _ => ReplyView::Other,
        }
    }
}
