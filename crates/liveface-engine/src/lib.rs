//! Async liveness/enrollment sessions over a stream of detector events.
//!
//! ```no_run
//! # async fn demo() -> Result<(), liveface_engine::EngineError> {
//! use liveface_engine::{spawn_session, Config, RegistryClient};
//! use tokio_util::sync::CancellationToken;
//!
//! let config = Config::from_env();
//! let registry = RegistryClient::new(&config.registry_url, config.request_timeout())?;
//! let (session, frames) = spawn_session(config, registry, CancellationToken::new());
//! // feed `frames` from the detector, then:
//! session.start_liveness().await?;
//! session.start_capture().await?;
//! # drop(frames);
//! session.submit_registration("alice").await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod registry;
pub mod session;

pub use config::{ChallengeOrder, Config, ConfigError, DetectorVariant, VerifyMode};
pub use engine::{spawn_session, SessionHandle};
pub use error::{EngineError, PreconditionError};
pub use registry::{RegistryClient, RegistryError};
pub use session::{FrameError, SessionContext, SessionSnapshot};
