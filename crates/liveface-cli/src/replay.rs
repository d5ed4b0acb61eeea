//! Recorded detector streams: one JSON value per line, either a
//! `LandmarkFrame` object or `null` for a frame with no face.
//! Blank lines and lines starting with `#` are skipped.

use anyhow::{bail, Context, Result};
use std::path::Path;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use liveface_core::LandmarkFrame;

/// A parsed recording, ready to be fed into a session.
#[derive(Debug, Clone)]
pub struct Recording {
    frames: Vec<Option<LandmarkFrame>>,
}

impl Recording {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("invalid recording {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut frames = Vec::new();
        for (idx, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let frame: Option<LandmarkFrame> = serde_json::from_str(line)
                .with_context(|| format!("line {}", idx + 1))?;
            frames.push(frame);
        }
        if frames.is_empty() {
            bail!("recording contains no frames");
        }
        Ok(Self { frames })
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn faces(&self) -> usize {
        self.frames.iter().filter(|f| f.is_some()).count()
    }

    /// Feed the recording into `tx`, one frame per `interval`.
    ///
    /// With `repeat` the recording loops until `cancel` fires or the session
    /// goes away. Returns the number of frames sent. The sender is dropped on
    /// return, which the session sees as the source stopping.
    pub async fn play(
        self,
        tx: mpsc::Sender<Option<LandmarkFrame>>,
        interval: Duration,
        repeat: bool,
        cancel: CancellationToken,
    ) -> usize {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sent = 0;

        loop {
            for frame in &self.frames {
                tokio::select! {
                    _ = cancel.cancelled() => return sent,
                    _ = ticker.tick() => {}
                }
                if tx.send(frame.clone()).await.is_err() {
                    tracing::debug!(sent, "session closed; replay stopped");
                    return sent;
                }
                sent += 1;
            }
            if !repeat {
                tracing::debug!(sent, "recording exhausted");
                return sent;
            }
        }
    }
}
