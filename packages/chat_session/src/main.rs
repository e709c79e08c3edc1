use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::prelude::*;

mod cli;

use chat_session::config::{ClientPaths, FileConfig, load_config};

#[derive(Parser)]
#[command(name = "chat")]
#[command(about = "Talk to a streaming chat backend from the terminal")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Custom data directory (defaults to ~/.chat-session)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Identity to sign in as
    #[arg(long, global = true, default_value = "cli")]
    user: String,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List conversations
    List,

    /// Stream replies for a conversation until interrupted
    Listen {
        /// Conversation to watch (default: the remembered or most recent one)
        #[arg(short, long)]
        conversation: Option<String>,
    },

    /// Send a message and print the reply
    Send {
        text: String,

        /// Target conversation (default: the active one, or a new one)
        #[arg(short, long)]
        conversation: Option<String>,

        #[arg(long)]
        persona: Option<String>,

        /// Start a new conversation instead of continuing the active one
        #[arg(long)]
        new: bool,
    },

    /// Delete a conversation
    Delete { id: String },

    /// Delete every conversation
    DeleteAll {
        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,
    },

    /// Print the effective configuration
    Config,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_directive = if cli.debug {
        "chat_session=debug,chat=debug,warn"
    } else {
        "chat_session=info,chat=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();

    let paths = ClientPaths::new(cli.data_dir)?;
    let file_config: FileConfig = load_config(&paths.data_dir)
        .extract()
        .context("Failed to load configuration")?;

    if let Commands::Config = cli.command {
        let text = toml::to_string_pretty(&file_config).context("Failed to render configuration")?;
        println!("# {}", paths.config_toml_path().display());
        print!("{text}");
        return Ok(());
    }

    let client = cli::start(&paths, &file_config, cli.user).await?;
    let result = match cli.command {
        Commands::List => cli::list_command(&client).await,
        Commands::Listen { conversation } => cli::listen_command(&client, conversation).await,
        Commands::Send {
            text,
            conversation,
            persona,
            new,
        } => cli::send_command(&client, text, conversation, persona, new).await,
        Commands::Delete { id } => cli::delete_command(&client, id).await,
        Commands::DeleteAll { yes } => cli::delete_all_command(&client, yes).await,
        Commands::Config => Ok(()),
    };
    client.shutdown().await;
    result
}
