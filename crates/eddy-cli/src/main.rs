//! eddy - terminal client for a streaming chat service

mod commands;
mod config;
mod render;
mod utils;

use std::future::Future;
use std::io::Write;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use eddy_api::{HttpChatApi, MessageId};
use eddy_chat::ChatController;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

use commands::CommandResult;
use render::AnswerPrinter;

/// eddy - chat with a streaming conversational API
#[derive(Parser, Debug)]
#[command(name = "eddy")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Base URL of the chat service (default: http://localhost/v1)
    #[arg(long)]
    base_url: Option<String>,

    /// User id conversations are filed under
    #[arg(short, long)]
    user: Option<String>,

    /// Continue an existing conversation
    #[arg(long)]
    conversation: Option<String>,

    /// Ask a single question, print the answer and exit
    #[arg(short = 'c', long)]
    command: Option<String>,

    /// List conversations and exit
    #[arg(long)]
    conversations: bool,

    /// Print the messages of a conversation and exit
    #[arg(long, value_name = "ID")]
    history: Option<String>,

    /// Initialize config file
    #[arg(long)]
    init_config: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

/// A submission still waiting for the response to start
type PendingSubmit = Pin<Box<dyn Future<Output = eddy_chat::Result<MessageId>>>>;

/// What the interactive loop does after handling a line
enum Flow {
    /// Show the prompt again
    Prompt,
    /// A generation event will arrive; prompt once it finished
    Wait,
    /// Keep polling this submission alongside input and signals
    Submit(PendingSubmit),
    Exit,
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "eddy=debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn build_controller(args: &Args, cfg: &config::Config) -> anyhow::Result<ChatController> {
    let base_url = args
        .base_url
        .clone()
        .or_else(|| cfg.base_url.clone())
        .unwrap_or_else(|| HttpChatApi::DEFAULT_BASE_URL.to_string());
    let user = args
        .user
        .clone()
        .or_else(|| cfg.user.clone())
        .unwrap_or_else(|| config::DEFAULT_USER.to_string());

    let mut api = HttpChatApi::new(base_url)
        .with_page_limit(cfg.history_limit())
        .with_connect_timeout(Duration::from_secs(cfg.timeout_secs()))
        .context("Failed to build HTTP client")?;
    if let Some(key) = cfg.api_key() {
        api = api.with_api_key(key);
    }

    tracing::debug!("Using {} as {}", api.base_url(), user);
    Ok(ChatController::new(Arc::new(api), user))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    // Initialize config and exit
    if args.init_config {
        match config::Config::init() {
            Ok(path) => {
                println!("Config file created at: {}", path.display());
                println!("\nExample config:\n{}", config::example_config());
            }
            Err(e) => {
                eprintln!("Error creating config: {}", e);
                std::process::exit(1);
            }
        }
        return Ok(());
    }

    let cfg = config::Config::load();
    let chat = build_controller(&args, &cfg)?;

    if args.conversations {
        let conversations = chat.list_conversations().await?;
        println!("{}", commands::format_conversations(&conversations, None));
        return Ok(());
    }

    if let Some(ref id) = args.history {
        chat.open_conversation(id)
            .await
            .with_context(|| format!("Failed to load conversation {}", id))?;
        println!("{}", commands::format_history(&chat.messages()));
        return Ok(());
    }

    if let Some(ref id) = args.conversation {
        let count = chat
            .open_conversation(id)
            .await
            .with_context(|| format!("Failed to load conversation {}", id))?;
        tracing::info!("Loaded {} messages from {}", count, id);
    }

    if let Some(ref query) = args.command {
        return run_command(&chat, query).await;
    }

    run_interactive(&chat).await
}

fn print_flush(text: &str) -> std::io::Result<()> {
    let mut stdout = std::io::stdout();
    stdout.write_all(text.as_bytes())?;
    stdout.flush()
}

async fn run_command(chat: &ChatController, query: &str) -> anyhow::Result<()> {
    let mut events = chat.subscribe();
    let mut printer = AnswerPrinter::new();

    let submit = chat.submit(query);
    tokio::pin!(submit);
    loop {
        tokio::select! {
            biased;
            result = &mut submit => {
                result?;
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                chat.stop();
            }
        }
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                chat.stop();
            }
            event = events.recv() => match event {
                Ok(event) => {
                    let terminal = event.is_terminal();
                    if let Some(text) = printer.render(&event) {
                        print_flush(&text)?;
                    }
                    if terminal {
                        break;
                    }
                }
                Err(RecvError::Lagged(n)) => tracing::debug!("Skipped {} events", n),
                Err(RecvError::Closed) => break,
            }
        }
    }

    chat.wait_idle().await;
    Ok(())
}

async fn run_interactive(chat: &ChatController) -> anyhow::Result<()> {
    let mut events = chat.subscribe();
    let mut printer = AnswerPrinter::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    // Show minimal startup info (only if TTY)
    if std::io::IsTerminal::is_terminal(&std::io::stderr()) {
        match chat.conversation_id() {
            Some(id) => eprintln!("eddy ({}) conversation: {}", chat.user(), id),
            None => eprintln!("eddy ({})", chat.user()),
        }
        eprintln!("Type /help for commands.");
        eprintln!();
    }

    let mut pending: Option<PendingSubmit> = None;

    print_flush("> ")?;
    loop {
        tokio::select! {
            result = poll_pending(&mut pending), if pending.is_some() => {
                pending = None;
                if let Flow::Prompt = submission_flow(result) {
                    print_flush("> ")?;
                }
            }
            line = lines.next_line() => {
                // EOF
                let Some(line) = line? else { break };
                let input = line.trim();

                let flow = if input.is_empty() {
                    if chat.is_generating() { Flow::Wait } else { Flow::Prompt }
                } else if let Some(result) = commands::execute_command(input) {
                    handle_command(chat, result).await
                } else {
                    submit(chat, input)
                };

                match flow {
                    Flow::Prompt => print_flush("> ")?,
                    Flow::Wait => {}
                    Flow::Submit(_) if pending.is_some() => println!("{}", eddy_chat::Error::Busy),
                    Flow::Submit(submission) => pending = Some(submission),
                    Flow::Exit => break,
                }
            }
            _ = tokio::signal::ctrl_c() => {
                if chat.stop() {
                    continue;
                }
                // Submitted but not polled yet: nothing reached the server
                if pending.take().is_some() {
                    print_flush("\n> ")?;
                    continue;
                }
                println!();
                break;
            }
            event = events.recv() => match event {
                Ok(event) => {
                    let terminal = event.is_terminal();
                    if let Some(text) = printer.render(&event) {
                        print_flush(&text)?;
                    }
                    if terminal {
                        print_flush("> ")?;
                    }
                }
                Err(RecvError::Lagged(n)) => tracing::debug!("Skipped {} events", n),
                Err(RecvError::Closed) => break,
            }
        }
    }

    chat.stop();
    chat.wait_idle().await;
    Ok(())
}

/// Report a failed submission. Service errors surface through the
/// `Finished` event instead.
fn submission_flow(result: eddy_chat::Result<eddy_api::MessageId>) -> Flow {
    match result {
        Ok(_) | Err(eddy_chat::Error::Api(_)) => Flow::Wait,
        Err(e) => {
            println!("{}", e);
            Flow::Prompt
        }
    }
}

/// Drive the pending submission, if any
async fn poll_pending(pending: &mut Option<PendingSubmit>) -> eddy_chat::Result<MessageId> {
    match pending {
        Some(submission) => submission.await,
        None => std::future::pending().await,
    }
}

fn submit(chat: &ChatController, query: &str) -> Flow {
    let chat = chat.clone();
    let query = query.to_string();
    Flow::Submit(Box::pin(async move { chat.submit(&query).await }))
}

async fn handle_command(chat: &ChatController, result: CommandResult) -> Flow {
    match result {
        CommandResult::Exit => return Flow::Exit,
        CommandResult::Message(msg) => println!("{}", msg),
        CommandResult::Unknown(cmd) => {
            println!("Unknown command: /{}", cmd);
            println!("Type /help for available commands.");
        }
        CommandResult::Stop => {
            if chat.stop() {
                return Flow::Wait;
            }
            println!("Nothing to stop.");
        }
        CommandResult::Resend => {
            let chat = chat.clone();
            return Flow::Submit(Box::pin(async move { chat.resend().await }));
        }
        CommandResult::Feedback { index, rating } => {
            let Some(message) = chat.messages().into_iter().nth(index - 1) else {
                println!("No message {}. See /history.", index);
                return prompt_unless_generating(chat);
            };
            match chat.set_feedback(&message.id, rating).await {
                Ok(Some(rating)) => println!("Rated message {}: {}", index, rating),
                Ok(None) => println!("Cleared rating on message {}", index),
                Err(e) => println!("Error: {}", e),
            }
        }
        CommandResult::History => println!("{}", commands::format_history(&chat.messages())),
        CommandResult::Conversations => match chat.list_conversations().await {
            Ok(conversations) => println!(
                "{}",
                commands::format_conversations(&conversations, chat.conversation_id().as_deref())
            ),
            Err(e) => println!("Error: {}", e),
        },
        CommandResult::Open(id) => {
            let stopped = chat.stop();
            match chat.open_conversation(&id).await {
                Ok(count) => println!("Loaded {} messages from {}", count, id),
                Err(e) => println!("Error: {}", e),
            }
            if stopped {
                return Flow::Wait;
            }
        }
        CommandResult::New => {
            let stopped = chat.stop();
            chat.new_conversation();
            println!("Started a new conversation.");
            if stopped {
                return Flow::Wait;
            }
        }
    }
    prompt_unless_generating(chat)
}

fn prompt_unless_generating(chat: &ChatController) -> Flow {
    if chat.is_generating() {
        Flow::Wait
    } else {
        Flow::Prompt
    }
}
