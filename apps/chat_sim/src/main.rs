use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use backend::{ChatBackend, HttpBackend, MemoryBackend};
use chrono::{FixedOffset, Utc};
use clap::Parser;
use client_core::{
    voice::{MissingAudioRecorder, MissingPreviewPlayer},
    load_settings, ChatContext, ChatSettings, ClientEvent, SendOutcome, StartOutcome,
    TimelineEntry, TimelineOrder,
};
use shared::{
    domain::{ConversationId, ConversationKind, DeliveryStatus, MessageId, MessageKind, UserId},
    protocol::{Conversation, Message, NewMessage, Participant},
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod devices;

use devices::{SimPlayer, SimRecorder};

const DEFAULT_LOG_FILTER: &str = "chat_sim=info,client_core=info,backend=info";

#[derive(Parser, Debug)]
struct Args {
    /// TOML settings file; a missing file means defaults.
    #[arg(long, default_value = "chat.toml")]
    config: PathBuf,
    #[arg(long)]
    page_size: Option<u32>,
    #[arg(long)]
    media_bucket: Option<String>,
    /// Talk to a hosted backend instead of the in-process one.
    #[arg(long)]
    backend_url: Option<String>,
    #[arg(long)]
    access_token: Option<String>,
    #[arg(long)]
    conversation_id: Option<ConversationId>,
    #[arg(long)]
    user_id: Option<UserId>,
    #[arg(long, default_value = "see you at the venue")]
    message: String,
    /// Hours east of UTC used for day separators.
    #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
    utc_offset_hours: i32,
    #[arg(long)]
    newest_first: bool,
}

impl Args {
    fn apply_overrides(&self, settings: &mut ChatSettings) {
        if let Some(page_size) = self.page_size {
            settings.page_size = page_size;
        }
        if let Some(bucket) = &self.media_bucket {
            settings.media_bucket = bucket.clone();
        }
        if let Some(url) = &self.backend_url {
            settings.backend_url = Some(url.clone());
        }
        if let Some(token) = &self.access_token {
            settings.access_token = Some(token.clone());
        }
    }

    fn order(&self) -> TimelineOrder {
        if self.newest_first {
            TimelineOrder::NewestFirst
        } else {
            TimelineOrder::OldestFirst
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .init();
    let args = Args::parse();

    let mut settings = load_settings(Some(&args.config))?;
    args.apply_overrides(&mut settings);
    let settings = settings.normalized();
    let offset = FixedOffset::east_opt(args.utc_offset_hours * 3600)
        .context("utc offset must be within +/-23 hours")?;

    match settings.backend_url.clone() {
        Some(server_url) => run_remote(&args, settings, &server_url, offset).await,
        None => run_scripted(&args, settings, offset).await,
    }
}

async fn run_remote(
    args: &Args,
    settings: ChatSettings,
    server_url: &str,
    offset: FixedOffset,
) -> Result<()> {
    let conversation_id = args
        .conversation_id
        .context("--conversation-id is required with a backend url")?;
    let user_id = args
        .user_id
        .context("--user-id is required with a backend url")?;
    let backend = Arc::new(HttpBackend::new(server_url, settings.access_token.clone())?);
    let context = ChatContext::new_with_dependencies(
        settings,
        backend.clone(),
        backend,
        Arc::new(MissingAudioRecorder),
        Arc::new(MissingPreviewPlayer),
    );

    let conversation = context.open_screen(conversation_id, user_id).await?;
    print_header(&conversation, user_id);
    match context
        .store()
        .send_text_message(conversation_id, user_id, &args.message)
        .await
    {
        Ok(message) => info!(message_id = %message.id, "chat_sim: message sent"),
        Err(err) => warn!("chat_sim: send failed: {err}"),
    }
    print_timeline(&context, conversation_id, offset, args.order()).await;

    context.close_screen(conversation_id).await;
    context.shutdown().await;
    Ok(())
}

async fn run_scripted(args: &Args, settings: ChatSettings, offset: FixedOffset) -> Result<()> {
    let backend = Arc::new(MemoryBackend::new());
    let me = args.user_id.unwrap_or_default();
    let peer = UserId::new();
    let conversation = seed_conversation(&backend, me, peer).await;
    let conversation_id = conversation.id;

    let recorder = Arc::new(SimRecorder::new(std::env::temp_dir()));
    let context = ChatContext::new_with_dependencies(
        settings,
        backend.clone(),
        backend.clone(),
        recorder,
        Arc::new(SimPlayer),
    );
    let event_log = tokio::spawn(log_events(context.subscribe_events()));

    let conversation = context.open_screen(conversation_id, me).await?;
    print_header(&conversation, me);
    context.subscribe_conversation_list(me).await?;

    context
        .store()
        .send_text_message(conversation_id, me, &args.message)
        .await?;
    backend
        .insert_message(NewMessage {
            conversation_id,
            sender_id: peer,
            content: Some("great, grabbing drinks first".to_string()),
            kind: MessageKind::Text,
            media_url: None,
        })
        .await?;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let voice = context.voice();
    if voice.start().await? == StartOutcome::Started {
        tokio::time::sleep(Duration::from_millis(300)).await;
        let clip = voice.stop().await?;
        voice.toggle_playback().await?;
        voice.playback_finished().await;
        match voice.send(conversation_id, me).await? {
            SendOutcome::Sent(message) => {
                info!(message_id = %message.id, "chat_sim: voice message sent")
            }
            SendOutcome::Ignored => warn!("chat_sim: voice send ignored"),
        }
        if let Err(err) = tokio::fs::remove_file(&clip.path).await {
            warn!("chat_sim: failed to remove {}: {err}", clip.path.display());
        }
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
    print_timeline(&context, conversation_id, offset, args.order()).await;
    println!(
        "unread: {}",
        context.store().unread_count(conversation_id, me).await
    );

    context.close_screen(conversation_id).await;
    context.shutdown().await;
    event_log.abort();
    Ok(())
}

async fn seed_conversation(backend: &MemoryBackend, me: UserId, peer: UserId) -> Conversation {
    let now = Utc::now();
    let conversation = Conversation {
        id: ConversationId::new(),
        kind: ConversationKind::Direct,
        name: None,
        avatar_url: None,
        participants: vec![
            Participant {
                user_id: me,
                display_name: "you".to_string(),
                avatar_url: None,
                joined_at: now - chrono::Duration::days(3),
            },
            Participant {
                user_id: peer,
                display_name: "Riley".to_string(),
                avatar_url: Some("https://avatars.example/riley.png".to_string()),
                joined_at: now - chrono::Duration::days(2),
            },
        ],
        created_at: now - chrono::Duration::days(3),
    };
    backend.seed_conversation(conversation.clone()).await;

    for (sender_id, content, age) in [
        (peer, "are you going to the rooftop show?", chrono::Duration::days(1)),
        (me, "yes! doors at 8?", chrono::Duration::hours(23)),
    ] {
        backend
            .seed_message(Message {
                id: MessageId::new(),
                conversation_id: conversation.id,
                sender_id,
                content: Some(content.to_string()),
                kind: MessageKind::Text,
                media_url: None,
                created_at: now - age,
                status: DeliveryStatus::Delivered,
            })
            .await;
    }
    conversation
}

async fn log_events(mut events: tokio::sync::broadcast::Receiver<ClientEvent>) {
    loop {
        match events.recv().await {
            Ok(ClientEvent::Warning(warning)) => warn!("chat_sim: {warning}"),
            Ok(ClientEvent::Error(error)) => warn!("chat_sim: error event: {error}"),
            Ok(ClientEvent::VoiceStateChanged(phase)) => info!("chat_sim: voice {phase:?}"),
            Ok(ClientEvent::MessageSent { message }) => {
                info!(kind = ?message.kind, "chat_sim: sent {}", message.id)
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => warn!("chat_sim: event log skipped {skipped}"),
            Err(RecvError::Closed) => break,
        }
    }
}

fn print_header(conversation: &Conversation, viewer: UserId) {
    match conversation.subtitle() {
        Some(subtitle) => println!("== {} ({subtitle}) ==", conversation.display_name(viewer)),
        None => println!("== {} ==", conversation.display_name(viewer)),
    }
}

async fn print_timeline(
    context: &ChatContext,
    conversation_id: ConversationId,
    offset: FixedOffset,
    order: TimelineOrder,
) {
    for entry in context.store().timeline(conversation_id, offset, order).await {
        match entry {
            TimelineEntry::DaySeparator(day) => println!("-- {day} --"),
            TimelineEntry::Message(message) => {
                let time = message.created_at.with_timezone(&offset).format("%H:%M");
                let body = match message.kind {
                    MessageKind::Voice => format!("[voice] {}", message.media_url.unwrap_or_default()),
                    MessageKind::Media => format!("[media] {}", message.media_url.unwrap_or_default()),
                    MessageKind::Text | MessageKind::System => message.content.unwrap_or_default(),
                };
                println!("{time} {} {body} ({:?})", message.sender_id, message.status);
            }
        }
    }
}
