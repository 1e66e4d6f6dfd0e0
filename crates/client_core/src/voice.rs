use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use shared::{
    domain::{ConversationId, MediaKind, UserId},
    protocol::Message,
};
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use crate::{error::ChatError, store::MessageStore, upload::MediaUploader, ClientEvent};

const PERMISSION_WARNING: &str = "Microphone access is needed to record voice messages";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedClip {
    pub path: PathBuf,
    pub duration: Duration,
}

#[async_trait]
pub trait AudioRecorder: Send + Sync {
    async fn request_permission(&self) -> Result<bool>;
    async fn start(&self) -> Result<()>;
    /// Finishes the recording and releases the microphone.
    async fn stop(&self) -> Result<RecordedClip>;
    async fn cancel(&self) -> Result<()>;
    fn elapsed(&self) -> Duration;
}

#[async_trait]
pub trait PreviewPlayer: Send + Sync {
    async fn load(&self, path: &Path) -> Result<()>;
    async fn play(&self) -> Result<()>;
    async fn pause(&self) -> Result<()>;
    async fn seek_to_start(&self) -> Result<()>;
    async fn is_at_end(&self) -> Result<bool>;
    async fn unload(&self) -> Result<()>;
}

pub struct MissingAudioRecorder;

#[async_trait]
impl AudioRecorder for MissingAudioRecorder {
    async fn request_permission(&self) -> Result<bool> {
        Ok(false)
    }

    async fn start(&self) -> Result<()> {
        Err(anyhow!("audio recorder is unavailable"))
    }

    async fn stop(&self) -> Result<RecordedClip> {
        Err(anyhow!("audio recorder is unavailable"))
    }

    async fn cancel(&self) -> Result<()> {
        Ok(())
    }

    fn elapsed(&self) -> Duration {
        Duration::ZERO
    }
}

pub struct MissingPreviewPlayer;

#[async_trait]
impl PreviewPlayer for MissingPreviewPlayer {
    async fn load(&self, _path: &Path) -> Result<()> {
        Err(anyhow!("preview player is unavailable"))
    }

    async fn play(&self) -> Result<()> {
        Err(anyhow!("preview player is unavailable"))
    }

    async fn pause(&self) -> Result<()> {
        Ok(())
    }

    async fn seek_to_start(&self) -> Result<()> {
        Err(anyhow!("preview player is unavailable"))
    }

    async fn is_at_end(&self) -> Result<bool> {
        Ok(false)
    }

    async fn unload(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoicePhase {
    Idle,
    Recording,
    Preview,
    Uploading,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Paused,
    Playing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    PermissionDenied,
    /// A recording, preview or upload is already in progress.
    Busy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Sent(Message),
    Ignored,
}

#[derive(Debug, Error)]
pub enum VoiceError {
    #[error("recorder failed: {0}")]
    Recorder(String),
    #[error("preview playback failed: {0}")]
    Playback(String),
    #[error("no recording in progress")]
    NotRecording,
    #[error("no recorded clip")]
    NoClip,
    #[error("failed to upload voice clip: {0}")]
    Upload(#[source] ChatError),
    #[error("failed to send voice message: {0}")]
    Send(#[source] ChatError),
}

enum VoiceState {
    Idle,
    Recording,
    Preview {
        clip: RecordedClip,
        playback: PlaybackState,
        player_loaded: bool,
    },
    Uploading {
        clip: RecordedClip,
    },
}

impl VoiceState {
    fn phase(&self) -> VoicePhase {
        match self {
            VoiceState::Idle => VoicePhase::Idle,
            VoiceState::Recording => VoicePhase::Recording,
            VoiceState::Preview { .. } => VoicePhase::Preview,
            VoiceState::Uploading { .. } => VoicePhase::Uploading,
        }
    }

    fn preview(clip: RecordedClip) -> Self {
        VoiceState::Preview {
            clip,
            playback: PlaybackState::Paused,
            player_loaded: false,
        }
    }
}

struct VoiceSession {
    state: VoiceState,
    /// Bumped on shutdown so a late send result cannot revive the session.
    generation: u64,
}

pub struct VoiceCapture {
    recorder: Arc<dyn AudioRecorder>,
    player: Arc<dyn PreviewPlayer>,
    uploader: Arc<dyn MediaUploader>,
    store: Arc<MessageStore>,
    session: Mutex<VoiceSession>,
    events: broadcast::Sender<ClientEvent>,
}

impl VoiceCapture {
    pub fn new(
        recorder: Arc<dyn AudioRecorder>,
        player: Arc<dyn PreviewPlayer>,
        uploader: Arc<dyn MediaUploader>,
        store: Arc<MessageStore>,
        events: broadcast::Sender<ClientEvent>,
    ) -> Self {
        Self {
            recorder,
            player,
            uploader,
            store,
            session: Mutex::new(VoiceSession {
                state: VoiceState::Idle,
                generation: 0,
            }),
            events,
        }
    }

    pub async fn phase(&self) -> VoicePhase {
        self.session.lock().await.state.phase()
    }

    pub async fn playback(&self) -> Option<PlaybackState> {
        match &self.session.lock().await.state {
            VoiceState::Preview { playback, .. } => Some(*playback),
            _ => None,
        }
    }

    /// Live recorder clock while recording, the clip length afterwards.
    pub async fn elapsed(&self) -> Duration {
        match &self.session.lock().await.state {
            VoiceState::Idle => Duration::ZERO,
            VoiceState::Recording => self.recorder.elapsed(),
            VoiceState::Preview { clip, .. } | VoiceState::Uploading { clip } => clip.duration,
        }
    }

    pub async fn start(&self) -> Result<StartOutcome, VoiceError> {
        let mut session = self.session.lock().await;
        if !matches!(session.state, VoiceState::Idle) {
            debug!("voice: start ignored in phase {:?}", session.state.phase());
            return Ok(StartOutcome::Busy);
        }

        let granted = match self.recorder.request_permission().await {
            Ok(granted) => granted,
            Err(err) => {
                warn!("voice: microphone permission query failed: {err:#}");
                false
            }
        };
        if !granted {
            warn!("voice: microphone permission denied");
            let _ = self
                .events
                .send(ClientEvent::Warning(PERMISSION_WARNING.to_string()));
            return Ok(StartOutcome::PermissionDenied);
        }

        self.recorder
            .start()
            .await
            .map_err(|err| VoiceError::Recorder(format!("{err:#}")))?;
        session.state = VoiceState::Recording;
        self.emit_phase(VoicePhase::Recording);
        info!("voice: recording started");
        Ok(StartOutcome::Started)
    }

    pub async fn stop(&self) -> Result<RecordedClip, VoiceError> {
        let mut session = self.session.lock().await;
        if !matches!(session.state, VoiceState::Recording) {
            return Err(VoiceError::NotRecording);
        }

        match self.recorder.stop().await {
            Ok(clip) => {
                info!(
                    duration_ms = clip.duration.as_millis() as u64,
                    "voice: recording stopped"
                );
                session.state = VoiceState::preview(clip.clone());
                self.emit_phase(VoicePhase::Preview);
                Ok(clip)
            }
            Err(err) => {
                if let Err(cancel_err) = self.recorder.cancel().await {
                    warn!("voice: failed to release recorder: {cancel_err:#}");
                }
                session.state = VoiceState::Idle;
                self.emit_phase(VoicePhase::Idle);
                Err(VoiceError::Recorder(format!("{err:#}")))
            }
        }
    }

    /// Plays or pauses the preview; playing from the end restarts the clip.
    pub async fn toggle_playback(&self) -> Result<PlaybackState, VoiceError> {
        let mut session = self.session.lock().await;
        let VoiceState::Preview {
            clip,
            playback,
            player_loaded,
        } = &mut session.state
        else {
            return Err(VoiceError::NoClip);
        };

        match *playback {
            PlaybackState::Playing => {
                self.player.pause().await.map_err(playback_error)?;
                *playback = PlaybackState::Paused;
            }
            PlaybackState::Paused => {
                if !*player_loaded {
                    self.player.load(&clip.path).await.map_err(playback_error)?;
                    *player_loaded = true;
                } else if self.player.is_at_end().await.map_err(playback_error)? {
                    self.player.seek_to_start().await.map_err(playback_error)?;
                }
                self.player.play().await.map_err(playback_error)?;
                *playback = PlaybackState::Playing;
            }
        }
        Ok(*playback)
    }

    /// Called when the player reaches the end of the clip on its own.
    pub async fn playback_finished(&self) {
        if let VoiceState::Preview { playback, .. } = &mut self.session.lock().await.state {
            *playback = PlaybackState::Paused;
        }
    }

    /// Drops the current recording or preview. The clip file stays on disk.
    pub async fn discard(&self) -> bool {
        let mut session = self.session.lock().await;
        let discarded = match &session.state {
            VoiceState::Recording => {
                self.cancel_recorder().await;
                true
            }
            VoiceState::Preview { player_loaded, .. } => {
                if *player_loaded {
                    self.release_player().await;
                }
                true
            }
            VoiceState::Idle | VoiceState::Uploading { .. } => false,
        };
        if discarded {
            session.state = VoiceState::Idle;
            self.emit_phase(VoicePhase::Idle);
            info!("voice: clip discarded");
        }
        discarded
    }

    /// Uploads the previewed clip and sends it as a voice message. A failed
    /// upload or send returns to preview with the same clip.
    pub async fn send(
        &self,
        conversation_id: ConversationId,
        sender_id: UserId,
    ) -> Result<SendOutcome, VoiceError> {
        let (clip, generation) = {
            let mut session = self.session.lock().await;
            let clip = match &session.state {
                VoiceState::Uploading { .. } => {
                    debug!(%conversation_id, "voice: send ignored while uploading");
                    return Ok(SendOutcome::Ignored);
                }
                VoiceState::Preview {
                    clip,
                    player_loaded,
                    ..
                } => {
                    let clip = clip.clone();
                    if *player_loaded {
                        self.release_player().await;
                    }
                    clip
                }
                VoiceState::Idle | VoiceState::Recording => return Err(VoiceError::NoClip),
            };
            session.state = VoiceState::Uploading { clip: clip.clone() };
            self.emit_phase(VoicePhase::Uploading);
            (clip, session.generation)
        };

        let url = match self.uploader.upload(conversation_id, &clip.path).await {
            Ok(url) => url,
            Err(err) => {
                warn!(%conversation_id, "voice: upload failed: {err}");
                self.return_to_preview(generation, clip).await;
                return Err(VoiceError::Upload(err));
            }
        };

        let message = match self
            .store
            .send_media_message(conversation_id, sender_id, &url, MediaKind::Voice)
            .await
        {
            Ok(message) => message,
            Err(err) => {
                self.return_to_preview(generation, clip).await;
                return Err(VoiceError::Send(err));
            }
        };

        let mut session = self.session.lock().await;
        if session.generation == generation {
            session.state = VoiceState::Idle;
            self.emit_phase(VoicePhase::Idle);
        }
        info!(%conversation_id, message_id = %message.id, "voice: message sent");
        Ok(SendOutcome::Sent(message))
    }

    /// Releases the recorder and player and returns to idle. Any send still in
    /// flight completes without touching the session again.
    pub async fn shutdown(&self) {
        let mut session = self.session.lock().await;
        session.generation += 1;
        match &session.state {
            VoiceState::Idle => return,
            VoiceState::Recording => self.cancel_recorder().await,
            VoiceState::Preview { player_loaded, .. } => {
                if *player_loaded {
                    self.release_player().await;
                }
            }
            VoiceState::Uploading { .. } => {}
        }
        session.state = VoiceState::Idle;
        self.emit_phase(VoicePhase::Idle);
        debug!("voice: session shut down");
    }

    async fn return_to_preview(&self, generation: u64, clip: RecordedClip) {
        let mut session = self.session.lock().await;
        if session.generation != generation {
            return;
        }
        session.state = VoiceState::preview(clip);
        self.emit_phase(VoicePhase::Preview);
    }

    async fn cancel_recorder(&self) {
        if let Err(err) = self.recorder.cancel().await {
            warn!("voice: failed to cancel recording: {err:#}");
        }
    }

    async fn release_player(&self) {
        if let Err(err) = self.player.pause().await {
            warn!("voice: failed to pause preview: {err:#}");
        }
        if let Err(err) = self.player.unload().await {
            warn!("voice: failed to unload preview: {err:#}");
        }
    }

    fn emit_phase(&self, phase: VoicePhase) {
        let _ = self.events.send(ClientEvent::VoiceStateChanged(phase));
    }
}

fn playback_error(err: anyhow::Error) -> VoiceError {
    VoiceError::Playback(format!("{err:#}"))
}

#[cfg(test)]
#[path = "tests/voice_tests.rs"]
mod tests;
