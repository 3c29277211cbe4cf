use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use client_core::{load_settings, ChatCore, ConnectionState, SyncEvent};
use shared::{
    domain::{ConversationId, UserId},
    protocol::{Conversation, Message},
};
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "chat_cli", about = "Terminal client for the chat service")]
struct Cli {
    /// Settings file; defaults to ./client.toml when present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
enum Command {
    /// Store an existing token pair.
    Login {
        #[arg(long)]
        access_token: String,
        #[arg(long)]
        refresh_token: String,
    },
    Logout,
    /// List conversations, most recent first.
    Conversations {
        /// Pull the list from the server before printing.
        #[arg(long)]
        refresh: bool,
    },
    /// Create or fetch the conversation with a participant.
    Open { participant: String },
    /// Print a conversation's messages.
    History {
        conversation: String,
        /// Fetch newer messages from the server first.
        #[arg(long)]
        sync: bool,
    },
    Send {
        conversation: String,
        text: String,
        #[arg(long = "attachment", value_name = "URL")]
        attachments: Vec<String>,
    },
    /// Follow a conversation live until Ctrl-C.
    Watch { conversation: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();

    let settings = load_settings(cli.config.as_deref())?;
    let core = ChatCore::open(&settings).await?;

    match cli.command {
        Command::Login {
            access_token,
            refresh_token,
        } => {
            core.session()
                .save_credentials(access_token, refresh_token)
                .await
                .context("failed to store credentials")?;
            println!("credentials saved");
        }
        Command::Logout => {
            core.sign_out().await.context("failed to sign out")?;
            println!("signed out");
        }
        Command::Conversations { refresh } => {
            let conversations = if refresh {
                core.sync().refresh_conversations().await?
            } else {
                core.sync().local_conversations().await?
            };
            if conversations.is_empty() {
                println!("no conversations");
            }
            for conversation in &conversations {
                println!("{}", format_conversation(conversation));
            }
        }
        Command::Open { participant } => {
            let conversation = core
                .sync()
                .open_conversation(&UserId::new(participant))
                .await?;
            println!("{}", format_conversation(&conversation));
        }
        Command::History { conversation, sync } => {
            let conversation = ConversationId::new(conversation);
            if sync {
                let added = core.sync().sync_from_server(&conversation).await?;
                println!("synced {added} new message(s)");
            }
            for message in core.sync().load_local(&conversation).await? {
                println!("{}", format_message(&message));
            }
        }
        Command::Send {
            conversation,
            text,
            attachments,
        } => {
            let message = core
                .sync()
                .send_message(Some(text), attachments, &ConversationId::new(conversation))
                .await?;
            println!("{}", format_message(&message));
        }
        Command::Watch { conversation } => {
            watch(&core, ConversationId::new(conversation)).await?;
        }
    }

    Ok(())
}

async fn watch(core: &ChatCore, conversation: ConversationId) -> Result<()> {
    // Cached messages arrive as the first timeline update.
    let mut events = core.sync().subscribe();
    core.sync().enter_conversation(&conversation).await?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(event) => print_event(&event),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "watch: dropped events"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    core.sync().leave_conversation().await;
    Ok(())
}

fn print_event(event: &SyncEvent) {
    match event {
        SyncEvent::TimelineUpdated { messages, .. } => {
            for message in messages {
                println!("{}", format_message(message));
            }
        }
        SyncEvent::MessageReceived { message, .. } => println!("{}", format_message(message)),
        SyncEvent::TimelineCleared { conversation_id } => {
            println!("-- history of {conversation_id} cleared --");
        }
        SyncEvent::SyncFailed { error, .. } => eprintln!("sync failed: {error}"),
        SyncEvent::ConnectionChanged(status) => match &status.state {
            ConnectionState::Connected => eprintln!("-- live --"),
            ConnectionState::Connecting => eprintln!("-- connecting --"),
            ConnectionState::Disconnected => eprintln!("-- offline --"),
            ConnectionState::Error(reason) => eprintln!("-- realtime error: {reason} --"),
        },
    }
}

fn format_message(message: &Message) -> String {
    let mut line = format!(
        "[{}] {}: {}",
        message.created_at.format("%Y-%m-%d %H:%M:%S"),
        message.sender_id,
        message.content.as_deref().unwrap_or("")
    );
    for attachment in &message.attachments {
        line.push_str(&format!(" <{attachment}>"));
    }
    line
}

fn format_conversation(conversation: &Conversation) -> String {
    let participants = conversation
        .participants
        .iter()
        .map(|p| p.nickname.clone().unwrap_or_else(|| p.id.to_string()))
        .collect::<Vec<_>>()
        .join(", ");
    let preview = conversation.last_message.as_deref().unwrap_or("-");
    format!("{}  ({participants})  {preview}", conversation.id)
}
