use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use shared::domain::ConversationId;
use storage::Storage;

/// Inspects the local chat cache without going through the client.
#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, default_value = "sqlite://./data/chat_cache.db")]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
enum Command {
    /// Cached conversations, most recently updated first.
    Conversations,
    /// Cached messages of one conversation, oldest first.
    Messages { conversation_id: String },
    /// Drop every cached message of one conversation.
    Purge { conversation_id: String },
    /// Names of the stored secrets. Values are never printed.
    Secrets,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let storage = Storage::new(&cli.database_url)
        .await
        .with_context(|| format!("failed to open cache at {}", cli.database_url))?;

    match cli.command {
        Command::Conversations => {
            for conversation in storage.list_conversations().await? {
                println!(
                    "{}\tupdated={}\tlast={}",
                    conversation.id,
                    conversation.updated_at.to_rfc3339(),
                    conversation.last_message.as_deref().unwrap_or("-")
                );
            }
        }
        Command::Messages { conversation_id } => {
            let conversation_id = ConversationId::new(conversation_id);
            for message in storage.query_messages(&conversation_id).await? {
                println!(
                    "{}\t{}\t{}\t{}\tattachments={}",
                    message.created_at.to_rfc3339(),
                    message.id,
                    message.sender_id,
                    message.content.as_deref().unwrap_or(""),
                    message.attachments.len()
                );
            }
        }
        Command::Purge { conversation_id } => {
            let conversation_id = ConversationId::new(conversation_id);
            let removed = storage.delete_messages(&conversation_id).await?;
            println!("removed {removed} message(s) from {conversation_id}");
        }
        Command::Secrets => {
            for key in storage.list_secret_keys().await? {
                println!("{key}");
            }
        }
    }

    Ok(())
}
