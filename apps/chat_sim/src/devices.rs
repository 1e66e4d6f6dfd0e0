use std::{
    path::{Path, PathBuf},
    sync::Mutex,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use client_core::{AudioRecorder, PreviewPlayer, RecordedClip};
use tracing::info;
use uuid::Uuid;

/// Pretends to record by timing the session and writing a placeholder clip.
pub struct SimRecorder {
    dir: PathBuf,
    started_at: Mutex<Option<Instant>>,
}

impl SimRecorder {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            started_at: Mutex::new(None),
        }
    }

    fn take_started_at(&self) -> Result<Option<Instant>> {
        self.started_at
            .lock()
            .map(|mut started_at| started_at.take())
            .map_err(|_| anyhow!("recorder clock poisoned"))
    }
}

#[async_trait]
impl AudioRecorder for SimRecorder {
    async fn request_permission(&self) -> Result<bool> {
        Ok(true)
    }

    async fn start(&self) -> Result<()> {
        *self
            .started_at
            .lock()
            .map_err(|_| anyhow!("recorder clock poisoned"))? = Some(Instant::now());
        info!("sim: microphone open");
        Ok(())
    }

    async fn stop(&self) -> Result<RecordedClip> {
        let started_at = self
            .take_started_at()?
            .ok_or_else(|| anyhow!("recorder was not started"))?;
        let path = self.dir.join(format!("chat-sim-{}.m4a", Uuid::new_v4()));
        tokio::fs::write(&path, b"\0\0\0\x18ftypM4A ").await?;
        info!("sim: microphone closed, clip at {}", path.display());
        Ok(RecordedClip {
            path,
            duration: started_at.elapsed(),
        })
    }

    async fn cancel(&self) -> Result<()> {
        self.take_started_at()?;
        Ok(())
    }

    fn elapsed(&self) -> Duration {
        self.started_at
            .lock()
            .ok()
            .and_then(|started_at| started_at.map(|at| at.elapsed()))
            .unwrap_or_default()
    }
}

pub struct SimPlayer;

#[async_trait]
impl PreviewPlayer for SimPlayer {
    async fn load(&self, path: &Path) -> Result<()> {
        info!("sim: preview loaded {}", path.display());
        Ok(())
    }

    async fn play(&self) -> Result<()> {
        info!("sim: preview playing");
        Ok(())
    }

    async fn pause(&self) -> Result<()> {
        info!("sim: preview paused");
        Ok(())
    }

    async fn seek_to_start(&self) -> Result<()> {
        Ok(())
    }

    async fn is_at_end(&self) -> Result<bool> {
        Ok(false)
    }

    async fn unload(&self) -> Result<()> {
        info!("sim: preview unloaded");
        Ok(())
    }
}
