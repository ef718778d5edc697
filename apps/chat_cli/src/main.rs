use std::{
    collections::HashSet,
    path::PathBuf,
    sync::{Arc, Mutex},
};

use anyhow::Result;
use clap::Parser;
use client_core::{
    load_settings, ConversationSummary, ConversationSyncClient, Message, SessionCredentials,
    SyncEvent,
};
use shared::domain::{ChannelKey, GroupId, UserId};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Args {
    /// Settings file; defaults to ./client.toml when present.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    api_base_url: Option<String>,
    #[arg(long)]
    push_url: Option<String>,
    #[arg(long)]
    user_id: i64,
    #[arg(long)]
    token: String,
    /// Open the direct conversation with this user.
    #[arg(long, conflicts_with = "group")]
    peer: Option<i64>,
    /// Open this group conversation.
    #[arg(long)]
    group: Option<i64>,
}

impl Args {
    fn channel(&self) -> Option<ChannelKey> {
        match (self.peer, self.group) {
            (Some(peer), _) => Some(ChannelKey::Direct(UserId(peer))),
            (None, Some(group)) => Some(ChannelKey::Group(GroupId(group))),
            (None, None) => None,
        }
    }
}

fn print_summary(summary: &ConversationSummary, viewer: UserId) {
    let unread = if summary.is_unread() {
        format!(" ({} unread)", summary.unread_count)
    } else {
        String::new()
    };
    let who = if summary.last_message.sender_id == viewer {
        "you".to_string()
    } else {
        summary.last_message.sender_id.to_string()
    };
    println!(
        "  [{}] {}{}: {}: {}",
        summary.channel, summary.display_name, unread, who, summary.last_message.content
    );
}

fn print_message(message: &Message) {
    let mut line = format!(
        "{} <{}> {}",
        message.timestamp.format("%H:%M:%S"),
        message.sender_id,
        message.content
    );
    if let Some(target) = message.referral_target_user_id {
        line.push_str(&format!(" [referral: user {target}]"));
    }
    for attachment in &message.attachments {
        line.push_str(&format!(" [file: {} {}]", attachment.file_name, attachment.file_url));
    }
    println!("{line}");
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();

    let mut settings = load_settings(args.config.as_deref())?;
    if let Some(api_base_url) = &args.api_base_url {
        settings.api_base_url = api_base_url.clone();
    }
    if let Some(push_url) = &args.push_url {
        settings.push_url = Some(push_url.clone());
    }
    if settings.push_url.is_none() {
        warn!("no push_url configured; running on snapshots only");
    }

    let viewer = UserId(args.user_id);
    let client = ConversationSyncClient::from_settings(settings)?;
    if let Err(err) = client
        .start_session(SessionCredentials::new(viewer, args.token.clone()))
        .await
    {
        warn!(%err, "conversation list unavailable");
    }

    let partition = client.conversation_partition().await;
    println!("Your turn:");
    for summary in &partition.your_turn {
        print_summary(summary, viewer);
    }
    println!("Their turn:");
    for summary in &partition.their_turn {
        print_summary(summary, viewer);
    }

    let Some(channel) = args.channel() else {
        client.teardown_session().await;
        return Ok(());
    };

    let printed = Arc::new(Mutex::new(HashSet::new()));
    let _listener = client
        .subscribe_to_messages(channel, move |messages| {
            let Ok(mut printed) = printed.lock() else {
                return;
            };
            for message in messages.iter().filter(|m| printed.insert(m.id)) {
                print_message(message);
            }
        })
        .await;

    let mut events = client.subscribe_events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                SyncEvent::TransportChanged(state) => info!(?state, "push connection"),
                SyncEvent::ViewChanged(status) if status.channel == Some(channel) => {
                    info!(phase = ?status.phase, degraded = status.live_updates_degraded, "view")
                }
                SyncEvent::Error(err) => warn!(%err, "sync error"),
                SyncEvent::ServerError(err) => warn!(%err, "server error"),
                _ => {}
            }
        }
    });

    if let Err(err) = client.open_conversation_view(channel).await {
        warn!(%err, "could not load {channel}; type /refresh to retry");
    }
    println!("Type a message and press enter. /refresh reloads, /quit exits.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            break;
        };
        match line.trim() {
            "" => continue,
            "/quit" => break,
            "/refresh" => {
                if let Err(err) = client.refresh_view(channel).await {
                    warn!(%err, "refresh failed");
                }
            }
            text => {
                if let Err(err) = client.send_message(channel, text, Vec::new()).await {
                    warn!(%err, "send failed");
                }
            }
        }
    }

    client.teardown_session().await;
    Ok(())
}
