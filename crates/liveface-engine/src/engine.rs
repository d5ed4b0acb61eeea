//! Session actor: one task per detector stream.
//!
//! The actor owns the [`SessionContext`] and multiplexes four inputs in a
//! single `select!` loop: detector events, caller requests, completions of
//! registry calls it spawned, and the poll deadline of an in-progress
//! calibration or challenge run. Frames are therefore observed strictly in
//! arrival order and polling never blocks frame processing.
//!
//! Callers talk to the actor through a clone-safe [`SessionHandle`]; each
//! request carries a `oneshot` for its reply. Calibration and liveness
//! requests are answered only when the run finishes, so at most one of them
//! is outstanding at a time.

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use liveface_core::calibration::CalibrationBaseline;
use liveface_core::challenge::{ChallengeEvent, SessionState};
use liveface_core::frame::LandmarkFrame;
use liveface_core::matcher::{EuclideanMatcher, FaceProfile, Matcher, VerificationResult};

use crate::config::{Config, VerifyMode};
use crate::error::{EngineError, PreconditionError};
use crate::registry::{RegistryClient, RegistryError};
use crate::session::{SessionContext, SessionSnapshot};

/// Detector events buffered before the producer is back-pressured.
const FRAME_BUFFER: usize = 8;
const REQUEST_BUFFER: usize = 8;

type Reply<T> = oneshot::Sender<Result<T, EngineError>>;

/// Messages sent from [`SessionHandle`] to the actor.
enum Request {
    Calibrate {
        reply: Reply<CalibrationBaseline>,
    },
    StartLiveness {
        reply: Reply<()>,
    },
    StartCapture {
        reply: Reply<()>,
    },
    SubmitRegistration {
        username: String,
        reply: Reply<()>,
    },
    VerifyNow {
        reply: Reply<VerificationResult>,
    },
    Reset {
        reply: oneshot::Sender<()>,
    },
}

/// Completions of registry calls spawned by the actor.
///
/// `generation` is the reset counter at spawn time; results from before a
/// reset are dropped instead of touching the fresh session.
enum Completion {
    Registered {
        generation: u64,
        refreshed: Option<Vec<FaceProfile>>,
        reply: Reply<()>,
    },
    KnownFacesForVerify {
        generation: u64,
        probe: Vec<f32>,
        result: Result<Vec<FaceProfile>, RegistryError>,
        reply: Reply<VerificationResult>,
    },
    RemoteVerdict {
        generation: u64,
        result: VerificationResult,
    },
    RegistrationFailed {
        generation: u64,
        error: RegistryError,
        reply: Reply<()>,
    },
}

/// The caller waiting on a calibration or liveness run.
enum Waiter {
    Calibration(Reply<CalibrationBaseline>),
    Liveness(Reply<()>),
}

impl Waiter {
    fn fail(self, err: EngineError) {
        match self {
            Waiter::Calibration(reply) => {
                let _ = reply.send(Err(err));
            }
            Waiter::Liveness(reply) => {
                let _ = reply.send(Err(err));
            }
        }
    }
}

/// Clone-safe handle to a running session actor.
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<Request>,
    snapshot: watch::Receiver<SessionSnapshot>,
    cancel: CancellationToken,
}

impl SessionHandle {
    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Request) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Record a neutral-face baseline. Resolves when the calibration window ends.
    pub async fn calibrate(&self) -> Result<CalibrationBaseline, EngineError> {
        self.request(|reply| Request::Calibrate { reply }).await
    }

    /// Calibrate, then run every scheduled challenge. Resolves with the verdict.
    pub async fn start_liveness(&self) -> Result<(), EngineError> {
        self.request(|reply| Request::StartLiveness { reply }).await
    }

    /// Start collecting enrollment descriptors. Requires a passed liveness check.
    pub async fn start_capture(&self) -> Result<(), EngineError> {
        self.request(|reply| Request::StartCapture { reply }).await
    }

    /// Average the collected descriptors and register them under `username`.
    pub async fn submit_registration(&self, username: &str) -> Result<(), EngineError> {
        let username = username.to_string();
        self.request(|reply| Request::SubmitRegistration { username, reply })
            .await
    }

    /// Verify the face currently in view.
    pub async fn verify_now(&self) -> Result<VerificationResult, EngineError> {
        self.request(|reply| Request::VerifyNow { reply }).await
    }

    /// Return to `Idle`; any in-flight calibration or liveness run fails with
    /// [`EngineError::Reset`].
    pub async fn reset(&self) -> Result<(), EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Request::Reset { reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Receiver that observes every published snapshot.
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }

    /// Stop the actor; pending callers receive [`EngineError::Cancelled`].
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

/// Spawn a session actor on the current tokio runtime.
///
/// Returns the caller handle and the sender for detector events
/// (`None` = no face in this frame). Dropping the frame sender means the
/// source stopped: any waiting caller is cancelled and the face is treated
/// as gone. The actor exits when `cancel` fires or every handle is dropped.
pub fn spawn_session(
    config: Config,
    registry: RegistryClient,
    cancel: CancellationToken,
) -> (SessionHandle, mpsc::Sender<Option<LandmarkFrame>>) {
    let (frame_tx, frame_rx) = mpsc::channel(FRAME_BUFFER);
    let (request_tx, request_rx) = mpsc::channel(REQUEST_BUFFER);
    let (completion_tx, completion_rx) = mpsc::unbounded_channel();

    let ctx = SessionContext::new(config);
    let (snapshot_tx, snapshot_rx) = watch::channel(ctx.snapshot());

    let actor = Actor {
        ctx,
        registry,
        frames: frame_rx,
        frames_open: true,
        requests: request_rx,
        completion_tx,
        completions: completion_rx,
        snapshot: snapshot_tx,
        cancel: cancel.clone(),
        waiter: None,
        next_poll: None,
        generation: 0,
        registration_in_flight: false,
    };
    tokio::spawn(actor.run());

    let handle = SessionHandle {
        tx: request_tx,
        snapshot: snapshot_rx,
        cancel,
    };
    (handle, frame_tx)
}

struct Actor {
    ctx: SessionContext,
    registry: RegistryClient,
    frames: mpsc::Receiver<Option<LandmarkFrame>>,
    frames_open: bool,
    requests: mpsc::Receiver<Request>,
    completion_tx: mpsc::UnboundedSender<Completion>,
    completions: mpsc::UnboundedReceiver<Completion>,
    snapshot: watch::Sender<SessionSnapshot>,
    cancel: CancellationToken,
    waiter: Option<Waiter>,
    next_poll: Option<Instant>,
    generation: u64,
    registration_in_flight: bool,
}

impl Actor {
    async fn run(mut self) {
        tracing::info!("session started");
        loop {
            let deadline = self.next_poll;
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    self.abandon(EngineError::Cancelled);
                    break;
                }
                frame = self.frames.recv(), if self.frames_open => match frame {
                    Some(frame) => self.on_frame(frame),
                    None => {
                        tracing::info!("detector stream ended");
                        self.frames_open = false;
                        self.ctx.source_stopped();
                        self.abandon(EngineError::Cancelled);
                    }
                },
                _ = sleep_until_opt(deadline), if deadline.is_some() => self.on_poll(),
                Some(completion) = self.completions.recv() => self.on_completion(completion),
                request = self.requests.recv() => match request {
                    Some(request) => self.on_request(request),
                    None => break,
                },
            }
            self.publish();
        }
        tracing::info!("session stopped");
    }

    fn publish(&self) {
        let snapshot = self.ctx.snapshot();
        self.snapshot.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }

    fn on_frame(&mut self, frame: Option<LandmarkFrame>) {
        if let Err(e) = self.ctx.process_frame(frame) {
            tracing::debug!(error = %e, "frame skipped");
        }
    }

    fn on_request(&mut self, request: Request) {
        let now = Instant::now();
        match request {
            Request::Calibrate { reply } => match self.ctx.begin_calibration(now.into_std()) {
                Ok(()) => {
                    let first_poll = now + self.ctx.config().calibration_poll();
                    self.wait(Waiter::Calibration(reply), first_poll);
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            Request::StartLiveness { reply } => match self.ctx.begin_calibration(now.into_std()) {
                Ok(()) => {
                    let first_poll = now + self.ctx.config().calibration_poll();
                    self.wait(Waiter::Liveness(reply), first_poll);
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            Request::StartCapture { reply } => {
                let _ = reply.send(self.ctx.start_capture());
            }
            Request::SubmitRegistration { username, reply } => {
                self.submit_registration(&username, reply)
            }
            Request::VerifyNow { reply } => self.verify_now(reply),
            Request::Reset { reply } => {
                self.generation += 1;
                if let Some(waiter) = self.waiter.take() {
                    waiter.fail(EngineError::Reset);
                }
                self.next_poll = None;
                self.ctx.reset();
                let _ = reply.send(());
            }
        }
    }

    fn wait(&mut self, waiter: Waiter, first_poll: Instant) {
        self.waiter = Some(waiter);
        self.next_poll = Some(first_poll);
    }

    /// Fail the waiting caller and drop any half-finished run.
    fn abandon(&mut self, err: EngineError) {
        self.next_poll = None;
        if let Some(waiter) = self.waiter.take() {
            self.ctx.abandon();
            waiter.fail(err);
        }
    }

    fn on_poll(&mut self) {
        let now = Instant::now();
        self.next_poll = None;

        match self.ctx.state() {
            SessionState::Calibrating => {
                if !self.ctx.calibration_complete(now.into_std()) {
                    self.next_poll = Some(now + self.ctx.config().calibration_poll());
                    return;
                }
                let Some(baseline) = self.ctx.finish_calibration() else {
                    return;
                };
                match self.waiter.take() {
                    Some(Waiter::Calibration(reply)) => {
                        let _ = reply.send(Ok(baseline));
                    }
                    Some(Waiter::Liveness(reply)) => {
                        match self.ctx.start_challenges(now.into_std()) {
                            Ok(event) => {
                                self.waiter = Some(Waiter::Liveness(reply));
                                self.on_event(event, now);
                            }
                            Err(e) => {
                                let _ = reply.send(Err(e));
                            }
                        }
                    }
                    None => {}
                }
            }
            SessionState::Running => {
                let event = self.ctx.tick(now.into_std());
                self.on_event(event, now);
            }
            _ => {}
        }
    }

    /// Schedule the next poll or answer the liveness caller.
    fn on_event(&mut self, event: ChallengeEvent, now: Instant) {
        let config = self.ctx.config();
        match event {
            // A freshly started challenge is checked right away.
            ChallengeEvent::Started { .. } => {
                self.next_poll = Some(now);
            }
            ChallengeEvent::Pending => {
                self.next_poll = Some(now + config.challenge_poll());
            }
            ChallengeEvent::Detected(_) => {
                self.next_poll = Some(now + config.challenge_timing().acknowledge);
            }
            ChallengeEvent::Passed => {
                if let Some(Waiter::Liveness(reply)) = self.waiter.take() {
                    let _ = reply.send(Ok(()));
                }
            }
            ChallengeEvent::Failed(e) => {
                if let Some(Waiter::Liveness(reply)) = self.waiter.take() {
                    let _ = reply.send(Err(e.into()));
                }
            }
        }
    }

    fn submit_registration(&mut self, username: &str, reply: Reply<()>) {
        if self.registration_in_flight {
            let _ = reply.send(Err(PreconditionError::RegistrationInFlight.into()));
            return;
        }
        let request = match self.ctx.prepare_registration(username) {
            Ok(request) => request,
            Err(e) => {
                tracing::debug!(error = %e, "registration refused");
                let _ = reply.send(Err(e));
                return;
            }
        };

        let registry = self.registry.clone();
        let completions = self.completion_tx.clone();
        let generation = self.generation;
        let refresh = self.ctx.config().verify_mode == VerifyMode::Local;
        self.registration_in_flight = true;

        tokio::spawn(async move {
            if let Err(e) = registry
                .register_face(&request.username, &request.descriptor)
                .await
            {
                tracing::error!(username = %request.username, error = %e, "registration failed");
                let _ = completions.send(Completion::RegistrationFailed {
                    generation,
                    error: e,
                    reply,
                });
                return;
            }

            let refreshed = if refresh {
                match registry.known_faces().await {
                    Ok(faces) => Some(faces),
                    Err(e) => {
                        tracing::warn!(error = %e, "known faces refresh failed");
                        None
                    }
                }
            } else {
                None
            };
            let _ = completions.send(Completion::Registered {
                generation,
                refreshed,
                reply,
            });
        });
    }

    fn verify_now(&mut self, reply: Reply<VerificationResult>) {
        let probe = match self.ctx.probe_descriptor() {
            Ok(probe) => probe,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };

        let registry = self.registry.clone();
        let completions = self.completion_tx.clone();
        let generation = self.generation;

        match self.ctx.config().verify_mode {
            VerifyMode::Local if !self.ctx.known_faces().is_empty() => {
                let result = self.ctx.verify_local(&probe);
                log_verification(&result);
                let _ = reply.send(Ok(result));
            }
            VerifyMode::Local => {
                tokio::spawn(async move {
                    let result = registry.known_faces().await;
                    let _ = completions.send(Completion::KnownFacesForVerify {
                        generation,
                        probe,
                        result,
                        reply,
                    });
                });
            }
            VerifyMode::Remote => {
                tokio::spawn(async move {
                    match registry.verify_face(&probe).await {
                        Ok(result) => {
                            log_verification(&result);
                            let _ = completions.send(Completion::RemoteVerdict {
                                generation,
                                result: result.clone(),
                            });
                            let _ = reply.send(Ok(result));
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "remote verification failed");
                            let _ = reply.send(Err(e.into()));
                        }
                    }
                });
            }
        }
    }

    fn on_completion(&mut self, completion: Completion) {
        match completion {
            Completion::Registered {
                generation,
                refreshed,
                reply,
            } => {
                self.registration_in_flight = false;
                if let Some(faces) = refreshed {
                    tracing::debug!(count = faces.len(), "known faces refreshed");
                    self.ctx.set_known_faces(faces);
                }
                if generation == self.generation {
                    self.ctx.set_status("Registered successfully");
                }
                let _ = reply.send(Ok(()));
            }
            Completion::KnownFacesForVerify {
                generation,
                probe,
                result,
                reply,
            } => match result {
                Ok(faces) => {
                    tracing::debug!(count = faces.len(), "known faces loaded");
                    self.ctx.set_known_faces(faces);
                    let result = if generation == self.generation {
                        self.ctx.verify_local(&probe)
                    } else {
                        EuclideanMatcher.compare(
                            &probe,
                            self.ctx.known_faces(),
                            self.ctx.config().match_threshold,
                        )
                    };
                    log_verification(&result);
                    let _ = reply.send(Ok(result));
                }
                Err(e) => {
                    tracing::error!(error = %e, "loading known faces failed");
                    let _ = reply.send(Err(e.into()));
                }
            },
            Completion::RemoteVerdict { generation, result } => {
                if generation == self.generation {
                    self.ctx.record_verification(&result);
                }
            }
            Completion::RegistrationFailed {
                generation,
                error,
                reply,
            } => {
                self.registration_in_flight = false;
                if generation == self.generation {
                    self.ctx.set_status(format!("Registration failed: {error}"));
                }
                let _ = reply.send(Err(error.into()));
            }
        }
    }
}

fn log_verification(result: &VerificationResult) {
    tracing::info!(
        matched = result.matched,
        label = result.label.as_deref().unwrap_or(""),
        distance = result.distance,
        "verification complete"
    );
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
