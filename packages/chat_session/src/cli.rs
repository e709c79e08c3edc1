//! Subcommands of the `chat` binary.

use anyhow::{Context, Result, bail};
use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use chat_session::clock::SystemClock;
use chat_session::config::{
    ClientPaths, ConnectionConfig, FileConfig, RestConfig, SessionConfig, TokenConfig,
};
use chat_session::persist::JsonFileStore;
use chat_session::rest::HttpConversationApi;
use chat_session::token::{HttpTokenSource, StaticTokenSource, TokenCache, TokenSource};
use chat_session::transport::build_connector;
use chat_session::{
    ChatClient, ClientDeps, ConnectionState, ConversationId, MessageId, NewConversation,
    OutgoingMessage, Role, SessionSnapshot,
};

/// How long `send` waits for the reply to finish.
const REPLY_TIMEOUT: Duration = Duration::from_secs(120);

/// Build the client, sign in and wait for the connection to settle.
pub async fn start(paths: &ClientPaths, fc: &FileConfig, user: String) -> Result<ChatClient> {
    let token_config = TokenConfig::from_file(&fc.auth);
    let source: Arc<dyn TokenSource> = match (&fc.auth.token, &fc.auth.token_url) {
        (Some(token), _) => Arc::new(StaticTokenSource::new(Some(token.clone()))),
        (None, Some(url)) => Arc::new(HttpTokenSource::new(url.clone())),
        (None, None) => Arc::new(StaticTokenSource::new(None)),
    };
    let tokens = Arc::new(TokenCache::new(source, Arc::new(SystemClock), token_config));

    let connection = ConnectionConfig::from_file(fc);
    let store = JsonFileStore::open(paths.session_state_path())?;
    let client = ChatClient::spawn(ClientDeps {
        connector: build_connector(&connection),
        connection,
        session: SessionConfig::from_file(fc),
        api: Arc::new(HttpConversationApi::new(RestConfig::from_file(fc), tokens.clone())),
        tokens,
        store: Arc::new(store),
        clock: Arc::new(SystemClock),
    });

    client.set_auth(Some(user)).await?;
    let status = client
        .subscribe_connection()
        .wait_for(|s| {
            matches!(
                s.state,
                ConnectionState::Connected | ConnectionState::Error | ConnectionState::TokenRequired
            )
        })
        .await
        .context("Connection task stopped")?
        .clone();
    match status.state {
        ConnectionState::Connected => {
            info!(transport = ?status.transport, "connected");
        }
        ConnectionState::TokenRequired => bail!("Server requires a token; set auth.token or auth.token_url"),
        _ => bail!(
            "Could not connect: {}",
            status.last_error.unwrap_or_else(|| "unknown error".into())
        ),
    }

    client.fetch_conversations(false).await?;
    Ok(client)
}

pub async fn list_command(client: &ChatClient) -> Result<()> {
    let snap = client.snapshot();
    if snap.conversations.is_empty() {
        println!("No conversations.");
        return Ok(());
    }
    for conv in &snap.conversations {
        let marker = if snap.active.as_ref() == Some(&conv.id) { "*" } else { " " };
        let unread = snap.unread.get(&conv.id).copied().unwrap_or(0);
        let updated = conv
            .updated_at
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_default();
        println!("{marker} {:<38} {:<16} {:>3}  {}", conv.id, updated, unread, conv.title);
    }
    Ok(())
}

pub async fn listen_command(client: &ChatClient, conversation: Option<String>) -> Result<()> {
    if let Some(id) = conversation {
        activate(client, id).await?;
    }
    let mut snapshots = client.subscribe();
    let mut printer = Printer::seeded(&snapshots.borrow_and_update());
    eprintln!("[listening, Ctrl-C to stop]");

    loop {
        tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let snap = snapshots.borrow_and_update().clone();
                printer.render(&snap, None);
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    Ok(())
}

pub async fn send_command(
    client: &ChatClient,
    text: String,
    conversation: Option<String>,
    persona: Option<String>,
    new: bool,
) -> Result<()> {
    if let Some(id) = conversation {
        activate(client, id).await?;
    } else if new {
        client
            .start_new_conversation(NewConversation {
                auto: false,
                title: None,
                persona_id: persona.clone(),
            })
            .await?;
    }

    let mut snapshots = client.subscribe();
    let mut printer = Printer::seeded(&snapshots.borrow_and_update());
    let sent = client
        .send_message(OutgoingMessage {
            content: text,
            persona_id: persona,
            country: None,
        })
        .await?;
    debug!(%sent, "message sent");

    let wait = async {
        loop {
            if snapshots.changed().await.is_err() {
                bail!("Session stopped before the reply finished");
            }
            let snap = snapshots.borrow_and_update().clone();
            if printer.render(&snap, Some(&sent)) {
                return Ok(());
            }
        }
    };
    tokio::time::timeout(REPLY_TIMEOUT, wait)
        .await
        .context("Timed out waiting for a reply")?
}

pub async fn delete_command(client: &ChatClient, id: String) -> Result<()> {
    client.delete_conversation(ConversationId::new(id)).await?;
    println!("Deleted.");
    Ok(())
}

pub async fn delete_all_command(client: &ChatClient, yes: bool) -> Result<()> {
    let confirmed = yes || {
        print!("This will delete every conversation. Are you sure? (yes/no): ");
        std::io::stdout().flush()?;
        let mut input = String::new();
        std::io::stdin().read_line(&mut input)?;
        input.trim() == "yes"
    };
    if !confirmed {
        println!("Cancelled.");
        return Ok(());
    }
    client.delete_all_conversations(true).await?;
    println!("All conversations deleted.");
    Ok(())
}

async fn activate(client: &ChatClient, id: String) -> Result<()> {
    let id = ConversationId::new(id);
    let snap = client.snapshot();
    if !snap.conversations.iter().any(|c| c.id == id) {
        bail!("No conversation with id {id}");
    }
    client.set_active(id).await?;
    Ok(())
}

/// Prints assistant messages of the active conversation as they grow.
struct Printer {
    printed: HashMap<MessageId, String>,
    done: HashSet<MessageId>,
}

impl Printer {
    /// Treat everything already present as printed.
    fn seeded(snap: &SessionSnapshot) -> Self {
        let printed = snap
            .messages
            .iter()
            .map(|m| (m.id.clone(), m.content.clone()))
            .collect();
        let done = snap
            .messages
            .iter()
            .filter(|m| m.complete)
            .map(|m| m.id.clone())
            .collect();
        Self { printed, done }
    }

    /// Print new assistant output. With `after` set, only messages following
    /// that one count, and the return value says whether one has completed.
    fn render(&mut self, snap: &SessionSnapshot, after: Option<&MessageId>) -> bool {
        let mut out = std::io::stdout().lock();
        let finished = self.render_to(&mut out, snap, after);
        let _ = out.flush();
        finished
    }

    fn render_to(
        &mut self,
        out: &mut impl Write,
        snap: &SessionSnapshot,
        after: Option<&MessageId>,
    ) -> bool {
        let start = match after {
            Some(id) => match snap.messages.iter().position(|m| &m.id == id) {
                Some(pos) => pos + 1,
                None => return false,
            },
            None => 0,
        };

        let mut finished = false;
        for message in snap.messages[start..].iter().filter(|m| m.role == Role::Assistant) {
            if self.done.contains(&message.id) {
                finished = true;
                continue;
            }
            let printed = self.printed.get(&message.id).map(String::as_str).unwrap_or("");
            match message.content.strip_prefix(printed) {
                Some(rest) => {
                    let _ = write!(out, "{rest}");
                }
                // Final content replaced the streamed text.
                None => {
                    let _ = write!(out, "\n{}", message.content);
                }
            }
            self.printed.insert(message.id.clone(), message.content.clone());
            if message.complete {
                let _ = writeln!(out);
                self.done.insert(message.id.clone());
                finished = true;
            }
        }
        finished
    }
}
