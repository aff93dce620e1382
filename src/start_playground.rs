//! Startup helpers and the line-oriented terminal client.
//!
//! Plain lines are sent to the active conversation. Lines starting with `/`
//! are commands (see [`HELP`]). Replies are printed as they stream by writing
//! only the part of each cumulative update that was not printed yet.

use std::process::ExitCode;

use anyhow::{Context, bail};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Stdout};
use tracing::{error, info, warn};

use crate::assembler::events::AssemblerEvent;
use crate::assembler::session::SessionOutcome;
use crate::backend::types::ReplyMode;
use crate::config::PlaygroundConfig;
use crate::conversation::ids::ConversationId;
use crate::conversation::types::{Conversation, Role};
use crate::playground::Playground;

/// Name given to conversations created without one.
pub const DEFAULT_CONVERSATION_NAME: &str = "New conversation";

/// Command summary printed by `/help`.
pub const HELP: &str = "\
Commands:
  <text>                 send to the active conversation
  /plan <text>           send through the planning endpoint
  /search <text>         send through the search endpoint
  /new [name]            create a conversation and switch to it
  /list                  list conversations
  /switch <id>           show a conversation
  /rename <id> <name>    rename a conversation (local only)
  /delete <id>           delete a conversation
  /order <id>...         move conversations to the top, in order
  /images                list generated images
  /rmimage <name>        delete a generated image
  /news <query>          recent news on a topic
  /links <query>         interesting links on a topic
  /help                  show this help
  /quit                  exit";

/// Run the terminal client (used by the `brave-playground` binary).
///
/// # Returns
/// `ExitCode::SUCCESS` on `/quit` or end of input, `1` on startup failure.
#[must_use]
pub fn run() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    info!("Starting Brave Playground v{}", env!("CARGO_PKG_VERSION"));

    let config = match PlaygroundConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {e}");
            return ExitCode::from(1);
        }
    };

    let playground = match Playground::new(config) {
        Ok(playground) => playground,
        Err(e) => {
            error!("Failed to create playground: {e}");
            return ExitCode::from(1);
        }
    };

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!("Failed to create runtime: {e}");
            return ExitCode::from(1);
        }
    };

    if let Err(e) = rt.block_on(repl(&playground)) {
        error!("Terminal client error: {e:#}");
        return ExitCode::from(1);
    }

    ExitCode::SUCCESS
}

/// One parsed input line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// Blank line.
    Empty,
    /// Send through the given endpoint.
    Send(ReplyMode, String),
    /// Create a conversation.
    New(Option<String>),
    /// List conversations.
    List,
    /// Show a conversation.
    Switch(ConversationId),
    /// Rename a conversation.
    Rename(ConversationId, String),
    /// Delete a conversation.
    Delete(ConversationId),
    /// Move conversations to the top.
    Order(Vec<ConversationId>),
    /// List generated images.
    Images,
    /// Delete a generated image.
    RemoveImage(String),
    /// Fetch news.
    News(String),
    /// Fetch links.
    Links(String),
    /// Print help.
    Help,
    /// Exit.
    Quit,
}

fn required(argument: &str, usage: &str) -> anyhow::Result<String> {
    if argument.is_empty() {
        bail!("usage: {usage}");
    }
    Ok(argument.to_string())
}

impl Command {
    /// Parse an input line, sending plain text with `default_mode`.
    ///
    /// # Errors
    /// Returns an error for unknown commands and missing arguments.
    pub fn parse(line: &str, default_mode: ReplyMode) -> anyhow::Result<Self> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(Self::Empty);
        }
        let Some(command) = line.strip_prefix('/') else {
            return Ok(Self::Send(default_mode, line.to_string()));
        };

        let (name, rest) = command
            .split_once(char::is_whitespace)
            .map_or((command, ""), |(name, rest)| (name, rest.trim()));

        Ok(match name {
            "plan" => Self::Send(ReplyMode::Plan, required(rest, "/plan <text>")?),
            "search" => Self::Send(ReplyMode::Search, required(rest, "/search <text>")?),
            "new" => Self::New((!rest.is_empty()).then(|| rest.to_string())),
            "list" => Self::List,
            "switch" => Self::Switch(required(rest, "/switch <id>")?.into()),
            "rename" => {
                let Some((id, title)) = rest.split_once(char::is_whitespace) else {
                    bail!("usage: /rename <id> <name>");
                };
                Self::Rename(id.into(), required(title.trim(), "/rename <id> <name>")?)
            }
            "delete" => Self::Delete(required(rest, "/delete <id>")?.into()),
            "order" => {
                let ids: Vec<ConversationId> = rest.split_whitespace().map(ConversationId::from).collect();
                if ids.is_empty() {
                    bail!("usage: /order <id>...");
                }
                Self::Order(ids)
            }
            "images" => Self::Images,
            "rmimage" => Self::RemoveImage(required(rest, "/rmimage <name>")?),
            "news" => Self::News(required(rest, "/news <query>")?),
            "links" => Self::Links(required(rest, "/links <query>")?),
            "help" | "?" => Self::Help,
            "quit" | "exit" => Self::Quit,
            other => bail!("unknown command /{other}, try /help"),
        })
    }
}

/// Part of `content` not printed yet, given what was printed before.
///
/// Returns `None` when the reply was rewritten rather than extended.
#[must_use]
pub fn unseen_suffix<'a>(printed: &str, content: &'a str) -> Option<&'a str> {
    content.strip_prefix(printed)
}

async fn say(out: &mut Stdout, text: &str) -> std::io::Result<()> {
    out.write_all(text.as_bytes()).await?;
    out.write_all(b"\n").await?;
    out.flush().await
}

async fn prompt(out: &mut Stdout) -> std::io::Result<()> {
    out.write_all(b"> ").await?;
    out.flush().await
}

async fn repl(playground: &Playground) -> anyhow::Result<()> {
    let mut out = tokio::io::stdout();

    match playground.load().await {
        Ok(conversations) => info!(count = conversations.len(), "Ready"),
        Err(err) => warn!(error = %err, "Could not load conversations"),
    }
    if playground.active().is_none() {
        let created = playground.manager().create(DEFAULT_CONVERSATION_NAME).await;
        if let Err(err) = created {
            warn!(error = %err, "Could not create a first conversation");
        }
    }

    say(&mut out, "Brave Playground. Type /help for commands.").await?;
    if let Some(active) = playground.active() {
        show_conversation(playground, &active, &mut out).await?;
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    prompt(&mut out).await?;
    while let Some(line) = lines.next_line().await.context("reading input")? {
        match Command::parse(&line, playground.config().default_mode) {
            Ok(Command::Quit) => break,
            Ok(command) => {
                if let Err(err) = execute(playground, command, &mut out).await {
                    say(&mut out, &format!("error: {err:#}")).await?;
                }
            }
            Err(err) => say(&mut out, &err.to_string()).await?,
        }
        prompt(&mut out).await?;
    }

    playground.shutdown();
    Ok(())
}

async fn execute(playground: &Playground, command: Command, out: &mut Stdout) -> anyhow::Result<()> {
    match command {
        Command::Empty => {}
        Command::Send(mode, text) => stream_reply(playground, &text, mode, out).await?,
        Command::New(name) => {
            let name = name.as_deref().unwrap_or(DEFAULT_CONVERSATION_NAME);
            let created = playground.manager().create(name).await?;
            say(out, &format!("created {} ({})", created.name, created.id)).await?;
        }
        Command::List => {
            let active = playground.store().active();
            for conversation in playground.manager().list() {
                let marker = if active.as_ref() == Some(&conversation.id) { '*' } else { ' ' };
                let line = format!(
                    "{marker} {}  {}  ({} messages)",
                    conversation.id,
                    conversation.name,
                    conversation.messages.len()
                );
                say(out, &line).await?;
            }
        }
        Command::Switch(id) => {
            let conversation = playground.manager().switch_to(&id)?;
            show_conversation(playground, &conversation, out).await?;
        }
        Command::Rename(id, name) => playground.manager().rename(&id, &name)?,
        Command::Delete(id) => {
            playground.manager().delete(&id).await?;
            say(out, &format!("deleted {id}")).await?;
        }
        Command::Order(ids) => {
            let order = playground.manager().reorder(&ids).await?;
            let listed: Vec<&str> = order.iter().map(ConversationId::as_str).collect();
            say(out, &listed.join(" ")).await?;
        }
        Command::Images => {
            for name in playground.manager().list_images().await? {
                let url = playground.manager().image_url(&name)?;
                say(out, &format!("{name}  {url}")).await?;
            }
        }
        Command::RemoveImage(name) => {
            playground.manager().delete_image(&name).await?;
            say(out, &format!("deleted image {name}")).await?;
        }
        Command::News(query) => {
            let payload = playground.news(&query).await?;
            say(out, &serde_json::to_string_pretty(&payload)?).await?;
        }
        Command::Links(query) => {
            let payload = playground.links(&query).await?;
            say(out, &serde_json::to_string_pretty(&payload)?).await?;
        }
        Command::Help => say(out, HELP).await?,
        Command::Quit => {}
    }
    Ok(())
}

async fn show_conversation(
    playground: &Playground,
    conversation: &Conversation,
    out: &mut Stdout,
) -> anyhow::Result<()> {
    say(out, &format!("== {} ({})", conversation.name, conversation.id)).await?;
    for message in &conversation.messages {
        let speaker = match message.role {
            Role::User => "you",
            Role::Assistant => "assistant",
        };
        say(out, &format!("{speaker}: {}", message.content)).await?;
        for image in &message.images {
            say(out, &format!("  [image] {}", playground.manager().image_url(image)?)).await?;
        }
    }
    if playground.is_loading(&conversation.id) {
        say(out, "(reply in progress)").await?;
    }
    Ok(())
}

/// Prints a reply for one conversation as cumulative updates arrive.
struct ReplyPrinter {
    conversation: ConversationId,
    printed: String,
}

impl ReplyPrinter {
    async fn apply(&mut self, event: &AssemblerEvent, out: &mut Stdout) -> std::io::Result<()> {
        let AssemblerEvent::ContentUpdated {
            conversation,
            content,
            ..
        } = event
        else {
            return Ok(());
        };
        if *conversation != self.conversation {
            return Ok(());
        }
        match unseen_suffix(&self.printed, content) {
            Some(suffix) => out.write_all(suffix.as_bytes()).await?,
            None => {
                out.write_all(b"\n").await?;
                out.write_all(content.as_bytes()).await?;
            }
        }
        out.flush().await?;
        self.printed.clone_from(content);
        Ok(())
    }
}

async fn stream_reply(
    playground: &Playground,
    text: &str,
    mode: ReplyMode,
    out: &mut Stdout,
) -> anyhow::Result<()> {
    let Some(active) = playground.store().active() else {
        bail!("no conversation selected, use /new or /switch");
    };
    let mut events = playground.subscribe();
    let mut printer = ReplyPrinter {
        conversation: active,
        printed: String::new(),
    };

    let send = playground.send_with_mode(text, mode);
    tokio::pin!(send);
    let outcome = loop {
        tokio::select! {
            outcome = &mut send => break outcome,
            event = events.recv() => {
                if let Ok(event) = event {
                    printer.apply(&event, out).await?;
                }
            }
        }
    };
    while let Ok(event) = events.try_recv() {
        printer.apply(&event, out).await?;
    }

    match outcome? {
        SessionOutcome::Completed { images, .. } => {
            say(out, "").await?;
            for image in images {
                say(out, &format!("  [image] {}", playground.manager().image_url(&image)?)).await?;
            }
        }
        SessionOutcome::Failed { message } => {
            say(out, "").await?;
            if printer.printed != message {
                say(out, &message).await?;
            }
        }
        SessionOutcome::Cancelled { .. } => say(out, "\n[cancelled]").await?,
    }
    Ok(())
}
