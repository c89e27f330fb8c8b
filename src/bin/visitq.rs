//! visitq CLI: queue offline visit actions and sync them with the backend.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use tokio::sync::watch;
use visitq::clock::SystemClock;
use visitq::config::{Config, DEFAULT_QUEUE_PATH};
use visitq::geofence::{self, GeoPoint};
use visitq::model::{
    Actor, EnqueueResult, EntryState, NewMutation, Proof, Role, TransitionRequest, VisitId,
};
use visitq::notify::{Dispatcher, HttpNotifier, LogNotifier, Notifier};
use visitq::queue::{QueueStore, SyncEngine};
use visitq::remote::RestStore;
use visitq::service::VisitService;
use visitq::telemetry::{TelemetryConfig, init_telemetry};

#[derive(Parser)]
#[command(name = "visitq", about = "Visit lifecycle and offline sync engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Record a visit action in the local queue
    Enqueue {
        #[command(subcommand)]
        action: EnqueueAction,
    },
    /// Inspect and manage queued mutations
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },
    /// Replay the queue against the backend once
    Drain,
    /// Run the background sync loop until interrupted
    Sync,
    /// Show the sync event log
    Events {
        /// Only events after this sequence number
        #[arg(long, default_value_t = 0)]
        since: u64,
    },
    /// Great-circle distance between two points
    Distance {
        lat1: f64,
        lon1: f64,
        lat2: f64,
        lon2: f64,
        /// Also report whether the points are within this radius (meters)
        #[arg(long)]
        radius: Option<f64>,
    },
}

#[derive(Args)]
struct ActorArgs {
    /// Visit ID
    visit: VisitId,
    /// Acting user ID
    #[arg(long)]
    actor: String,
    /// Acting role (caregiver, care_recipient, agency_owner)
    #[arg(long, default_value = "caregiver")]
    role: Role,
}

impl ActorArgs {
    fn actor(&self) -> Actor {
        Actor {
            id: self.actor.clone(),
            role: self.role,
        }
    }
}

#[derive(Args)]
struct ProofArgs {
    #[arg(long, requires = "lon", allow_hyphen_values = true)]
    lat: Option<f64>,
    #[arg(long, requires = "lat", allow_hyphen_values = true)]
    lon: Option<f64>,
    /// Token scanned from the care recipient's QR card
    #[arg(long, conflicts_with_all = ["lat", "override_reason"])]
    qr: Option<String>,
    /// Skip location verification, recording the reason
    #[arg(long = "override", conflicts_with = "lat")]
    override_reason: Option<String>,
}

impl ProofArgs {
    fn proof(&self) -> anyhow::Result<Proof> {
        if let Some(ref token) = self.qr {
            return Ok(Proof::QrCode {
                token: token.clone(),
            });
        }
        if let Some(ref reason) = self.override_reason {
            return Ok(Proof::Override {
                reason: reason.clone(),
            });
        }
        match (self.lat, self.lon) {
            (Some(lat), Some(lon)) => Ok(Proof::gps(lat, lon)),
            _ => anyhow::bail!("one of --lat/--lon, --qr or --override is required"),
        }
    }
}

#[derive(Subcommand)]
enum EnqueueAction {
    CheckIn {
        #[command(flatten)]
        who: ActorArgs,
        #[command(flatten)]
        proof: ProofArgs,
    },
    Start {
        #[command(flatten)]
        who: ActorArgs,
    },
    CheckOut {
        #[command(flatten)]
        who: ActorArgs,
        #[command(flatten)]
        proof: ProofArgs,
    },
    Complete {
        #[command(flatten)]
        who: ActorArgs,
    },
    Cancel {
        #[command(flatten)]
        who: ActorArgs,
    },
    /// Care recipient was not available on arrival
    Unavailable {
        #[command(flatten)]
        who: ActorArgs,
        #[arg(long)]
        note: String,
        #[arg(long, requires = "lon", allow_hyphen_values = true)]
        lat: Option<f64>,
        #[arg(long, requires = "lat", allow_hyphen_values = true)]
        lon: Option<f64>,
    },
    NoShow {
        #[command(flatten)]
        who: ActorArgs,
    },
}

#[derive(Subcommand)]
enum QueueAction {
    /// List queued mutations
    List {
        /// Filter by state (pending, in_flight, failed)
        #[arg(long)]
        state: Option<EntryState>,
    },
    /// Return a failed mutation to the queue
    Retry { seq: u64 },
    /// Return every failed mutation to the queue
    RetryFailed,
    /// Drop a failed mutation
    Dismiss { seq: u64 },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Command::Enqueue { action } => cmd_enqueue(action),
        Command::Queue { action } => cmd_queue(action),
        Command::Events { since } => cmd_events(since),
        Command::Distance {
            lat1,
            lon1,
            lat2,
            lon2,
            radius,
        } => {
            let meters = geofence::distance_meters(lat1, lon1, lat2, lon2);
            println!("{meters:.1} m");
            if let Some(radius) = radius {
                let inside = geofence::within_radius(lat1, lon1, lat2, lon2, radius);
                println!("within {radius} m: {inside}");
            }
            Ok(())
        }
        Command::Drain => cmd_drain().await,
        Command::Sync => cmd_sync().await,
    }
}

/// Queue commands work without backend credentials.
fn open_queue() -> anyhow::Result<QueueStore> {
    let path = std::env::var("VISITQ_QUEUE_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_QUEUE_PATH));
    Ok(QueueStore::open(path)?)
}

fn cmd_enqueue(action: EnqueueAction) -> anyhow::Result<()> {
    let at = Utc::now();
    let (who, request) = match action {
        EnqueueAction::CheckIn { who, proof } => {
            let proof = proof.proof()?;
            (who, TransitionRequest::CheckIn { proof, at })
        }
        EnqueueAction::Start { who } => (who, TransitionRequest::StartVisit { at }),
        EnqueueAction::CheckOut { who, proof } => {
            let proof = proof.proof()?;
            (who, TransitionRequest::CheckOut { proof, at })
        }
        EnqueueAction::Complete { who } => (who, TransitionRequest::Complete { at }),
        EnqueueAction::Cancel { who } => (who, TransitionRequest::Cancel { at }),
        EnqueueAction::Unavailable {
            who,
            note,
            lat,
            lon,
        } => {
            let location = lat.zip(lon).map(|(lat, lon)| GeoPoint::new(lat, lon));
            (who, TransitionRequest::MarkUnavailable { note, location, at })
        }
        EnqueueAction::NoShow { who } => (who, TransitionRequest::MarkNoShow { at }),
    };

    let queue = open_queue()?;
    match queue.enqueue(&NewMutation::new(who.visit, who.actor(), request))? {
        EnqueueResult::Queued(entry) => {
            println!("Queued: #{} {} for visit {}", entry.seq, entry.kind(), entry.visit_id);
        }
        EnqueueResult::Replaced(entry) => {
            println!("Replaced: #{} {} for visit {}", entry.seq, entry.kind(), entry.visit_id);
        }
        EnqueueResult::Duplicate { existing_seq } => {
            println!("Already queued as #{existing_seq}");
        }
    }
    Ok(())
}

fn cmd_queue(action: QueueAction) -> anyhow::Result<()> {
    let queue = open_queue()?;
    match action {
        QueueAction::List { state } => {
            let entries = queue.list(state)?;
            if entries.is_empty() {
                println!("Queue is empty.");
                return Ok(());
            }

            println!(
                "{:<6}  {:<36}  {:<16}  {:<9}  {:<4}  LAST ERROR",
                "SEQ", "VISIT", "KIND", "STATE", "TRY"
            );
            println!("{}", "-".repeat(100));
            for entry in &entries {
                println!(
                    "{:<6}  {:<36}  {:<16}  {:<9}  {:<4}  {}",
                    entry.seq,
                    entry.visit_id,
                    entry.kind(),
                    entry.state,
                    entry.attempts,
                    entry.last_error.as_deref().unwrap_or("-")
                );
            }
            println!("\n{} entr{}", entries.len(), if entries.len() == 1 { "y" } else { "ies" });
        }
        QueueAction::Retry { seq } => {
            queue.retry(seq)?;
            println!("#{seq} returned to queue");
        }
        QueueAction::RetryFailed => {
            let seqs = queue.retry_failed()?;
            println!("{} entr{} returned to queue", seqs.len(), if seqs.len() == 1 { "y" } else { "ies" });
        }
        QueueAction::Dismiss { seq } => {
            let entry = queue.dismiss(seq)?;
            println!("Dismissed #{} {} for visit {}", entry.seq, entry.kind(), entry.visit_id);
        }
    }
    Ok(())
}

fn cmd_events(since: u64) -> anyhow::Result<()> {
    let queue = open_queue()?;
    for event in queue.events_since(since)? {
        println!(
            "{:<6}  {}  {}",
            event.seq,
            event.timestamp.format("%Y-%m-%d %H:%M:%S"),
            serde_json::to_string(&event.kind)?
        );
    }
    Ok(())
}

/// Wire the engine against the configured backend. The returned sender
/// holds the connectivity flag; the CLI assumes it is online.
fn build_engine(config: &Config) -> anyhow::Result<(SyncEngine, watch::Sender<bool>)> {
    let store = RestStore::new(
        &config.remote_url,
        &config.remote_key,
        config.sync.remote_timeout,
    )?;
    let notifier: Arc<dyn Notifier> = match config.notify_url {
        Some(ref url) => Arc::new(HttpNotifier::new(
            url,
            &config.remote_key,
            config.sync.remote_timeout,
        )?),
        None => Arc::new(LogNotifier),
    };
    let dispatcher = Arc::new(Dispatcher::new(notifier, config.sync.remote_timeout));
    let service = VisitService::new(
        Arc::new(store),
        dispatcher,
        Arc::new(SystemClock),
        config.policy.clone(),
    )
    .with_remote_timeout(config.sync.remote_timeout);

    let queue = QueueStore::open(&config.queue_path)?;
    let (online_tx, online_rx) = watch::channel(true);
    let engine = SyncEngine::new(
        Arc::new(queue),
        Arc::new(service),
        config.sync.clone(),
        online_rx,
    );
    Ok((engine, online_tx))
}

async fn cmd_drain() -> anyhow::Result<()> {
    let config = Config::from_env()?;
    let _guard = init_telemetry(TelemetryConfig::from(&config))?;

    let (engine, _online) = build_engine(&config)?;
    let report = engine.drain().await?;

    println!("Committed:       {}", report.committed);
    println!("Already applied: {}", report.already_applied);
    println!("Conflicts:       {}", report.conflicts);
    println!("Retrying:        {}", report.retried);
    println!("Failed:          {}", report.failed);
    println!("Blocked:         {}", report.blocked);
    Ok(())
}

async fn cmd_sync() -> anyhow::Result<()> {
    let config = Config::from_env()?;
    let _guard = init_telemetry(TelemetryConfig::from(&config))?;

    let (engine, _online) = build_engine(&config)?;

    let handle = engine.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        handle.shutdown();
    });

    engine.run().await?;
    Ok(())
}
