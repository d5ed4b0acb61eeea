use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use liveface_engine::{spawn_session, Config, RegistryClient, SessionHandle};

mod replay;

use replay::Recording;

#[derive(Parser)]
#[command(
    name = "liveface",
    version,
    about = "Liveness checks and face enrollment over recorded detector streams"
)]
struct Cli {
    /// TOML configuration file; LIVEFACE_* variables override it.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Registry base URL (overrides configuration).
    #[arg(long, global = true)]
    registry: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run calibration and the liveness challenges, then print the verdict.
    Check(StreamArgs),
    /// Pass liveness, collect descriptors and register them under a username.
    Enroll {
        #[arg(long)]
        username: String,
        #[command(flatten)]
        stream: StreamArgs,
        /// Give up if the sample quota is not reached within this many seconds.
        #[arg(long, default_value_t = 30)]
        capture_timeout: u64,
    },
    /// Pass liveness, then identify the face in view.
    Verify(StreamArgs),
    /// List the profiles known to the registry.
    KnownFaces,
    /// Show registry status.
    Status,
}

#[derive(Args)]
struct StreamArgs {
    /// JSON-lines detector recording (`null` = no face).
    stream: PathBuf,
    /// Replay rate in frames per second.
    #[arg(long, default_value_t = 30)]
    fps: u32,
    /// Loop the recording until the command finishes.
    #[arg(long = "loop")]
    repeat: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_deref())?;
    if let Some(url) = cli.registry {
        config.registry_url = url;
    }
    let registry = RegistryClient::new(&config.registry_url, config.request_timeout())
        .context("failed to build registry client")?;

    match cli.command {
        Commands::Check(stream) => {
            let run = Run::start(config, registry, stream)?;
            let verdict = run.liveness().await;
            run.finish().await;
            verdict?;
            println!("liveness passed");
        }
        Commands::Enroll {
            username,
            stream,
            capture_timeout,
        } => {
            let run = Run::start(config, registry, stream)?;
            let outcome = run.enroll(&username, Duration::from_secs(capture_timeout)).await;
            run.finish().await;
            outcome?;
            println!("registered {username}");
        }
        Commands::Verify(stream) => {
            let run = Run::start(config, registry, stream)?;
            let outcome = run.verify().await;
            run.finish().await;
            let result = outcome?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            if !result.matched {
                std::process::exit(1);
            }
        }
        Commands::KnownFaces => {
            let faces = registry
                .known_faces()
                .await
                .context("failed to list known faces")?;
            for face in &faces {
                println!("{} ({} values)", face.username, face.descriptor.len());
            }
            println!("{} profile(s) at {}", faces.len(), registry.base_url());
        }
        Commands::Status => {
            let status = registry.status().await.context("failed to query registry status")?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => {
            Config::load(path).with_context(|| format!("failed to load config {}", path.display()))
        }
        None => Ok(Config::from_env()),
    }
}

/// A session fed by a replayed recording, with progress logging.
struct Run {
    session: SessionHandle,
    cancel: CancellationToken,
    player: tokio::task::JoinHandle<usize>,
    progress: tokio::task::JoinHandle<()>,
}

impl Run {
    fn start(config: Config, registry: RegistryClient, args: StreamArgs) -> Result<Self> {
        if args.fps == 0 {
            bail!("--fps must be at least 1");
        }
        let recording = Recording::load(&args.stream)?;
        tracing::info!(
            stream = %args.stream.display(),
            frames = recording.len(),
            faces = recording.faces(),
            fps = args.fps,
            "replaying recording"
        );

        let cancel = CancellationToken::new();
        let (session, frames) = spawn_session(config, registry, cancel.clone());
        let interval = Duration::from_secs(1) / args.fps;
        let player = tokio::spawn(recording.play(frames, interval, args.repeat, cancel.clone()));
        let progress = tokio::spawn(report_progress(session.clone()));

        Ok(Self {
            session,
            cancel,
            player,
            progress,
        })
    }

    async fn liveness(&self) -> Result<()> {
        let verdict = self.session.start_liveness().await;
        if let Some(baseline) = self.session.snapshot().baseline {
            tracing::info!(
                median_ear = baseline.median_ear,
                median_mouth_ratio = baseline.median_mouth_ratio,
                ear_threshold = baseline.ear_threshold,
                "calibration baseline"
            );
        }
        verdict.context("liveness check failed")
    }

    async fn enroll(&self, username: &str, capture_timeout: Duration) -> Result<()> {
        self.liveness().await?;
        self.session
            .start_capture()
            .await
            .context("could not start capture")?;

        let mut updates = self.session.subscribe();
        let quota = async {
            loop {
                {
                    let snap = updates.borrow_and_update();
                    if snap.samples_collected >= snap.samples_required {
                        return Ok(());
                    }
                }
                if updates.changed().await.is_err() {
                    bail!("session ended before enough samples were collected");
                }
            }
        };
        tokio::time::timeout(capture_timeout, quota)
            .await
            .context("timed out collecting enrollment samples")??;

        self.session
            .submit_registration(username)
            .await
            .context("registration failed")
    }

    async fn verify(&self) -> Result<liveface_core::VerificationResult> {
        self.liveness().await?;
        self.session.verify_now().await.context("verification failed")
    }

    async fn finish(self) {
        self.cancel.cancel();
        self.progress.abort();
        match self.player.await {
            Ok(sent) => tracing::debug!(sent, "replay finished"),
            Err(e) => tracing::warn!(error = %e, "replay task failed"),
        }
    }
}

async fn report_progress(session: SessionHandle) {
    let mut updates = session.subscribe();
    let mut last_status = String::new();
    while updates.changed().await.is_ok() {
        let snap = updates.borrow_and_update().clone();
        if snap.status == last_status {
            continue;
        }
        tracing::info!(
            state = %snap.state,
            challenge = snap.challenge_label().unwrap_or(""),
            progress = snap.progress_percent,
            face = snap.face_detected,
            samples = snap.samples_collected,
            "{}",
            snap.status
        );
        last_status = snap.status;
    }
}
