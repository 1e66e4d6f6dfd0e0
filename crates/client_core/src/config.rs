use std::{fs, path::Path};

use anyhow::Context;
use serde::Deserialize;
use tracing::{debug, warn};

const MAX_PAGE_SIZE: u32 = 100;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ChatSettings {
    pub page_size: u32,
    pub event_capacity: usize,
    pub retained_conversations: usize,
    pub media_bucket: String,
    pub backend_url: Option<String>,
    pub access_token: Option<String>,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            page_size: 50,
            event_capacity: 1024,
            retained_conversations: 8,
            media_bucket: "chat-media".into(),
            backend_url: None,
            access_token: None,
        }
    }
}

impl ChatSettings {
    pub fn normalized(mut self) -> Self {
        self.page_size = self.page_size.clamp(1, MAX_PAGE_SIZE);
        self.event_capacity = self.event_capacity.max(1);
        if self.media_bucket.trim().is_empty() {
            self.media_bucket = Self::default().media_bucket;
        }
        self
    }
}

/// Reads `path` when it exists, then applies `CHAT__*` environment overrides.
pub fn load_settings(path: Option<&Path>) -> anyhow::Result<ChatSettings> {
    let mut settings = match path {
        Some(path) if path.exists() => {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("failed to read settings file '{}'", path.display()))?;
            toml::from_str::<ChatSettings>(&raw)
                .with_context(|| format!("invalid settings file '{}'", path.display()))?
        }
        Some(path) => {
            debug!("config: settings file '{}' not found, using defaults", path.display());
            ChatSettings::default()
        }
        None => ChatSettings::default(),
    };

    apply_env_overrides(&mut settings, |key| std::env::var(key).ok());
    Ok(settings.normalized())
}

pub(crate) fn apply_env_overrides(
    settings: &mut ChatSettings,
    lookup: impl Fn(&str) -> Option<String>,
) {
    if let Some(v) = lookup("CHAT__PAGE_SIZE") {
        match v.parse::<u32>() {
            Ok(parsed) => settings.page_size = parsed,
            Err(_) => warn!("config: ignoring invalid CHAT__PAGE_SIZE={v}"),
        }
    }
    if let Some(v) = lookup("CHAT__EVENT_CAPACITY") {
        match v.parse::<usize>() {
            Ok(parsed) => settings.event_capacity = parsed,
            Err(_) => warn!("config: ignoring invalid CHAT__EVENT_CAPACITY={v}"),
        }
    }
    if let Some(v) = lookup("CHAT__RETAINED_CONVERSATIONS") {
        match v.parse::<usize>() {
            Ok(parsed) => settings.retained_conversations = parsed,
            Err(_) => warn!("config: ignoring invalid CHAT__RETAINED_CONVERSATIONS={v}"),
        }
    }
    if let Some(v) = lookup("CHAT__MEDIA_BUCKET") {
        settings.media_bucket = v;
    }
    if let Some(v) = lookup("CHAT__BACKEND_URL") {
        settings.backend_url = Some(v);
    }
    if let Some(v) = lookup("CHAT__ACCESS_TOKEN") {
        settings.access_token = Some(v);
    }
}
