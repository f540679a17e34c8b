//! Convo CLI entry point

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use clap::{Parser, Subcommand};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tracing_subscriber::EnvFilter;
use anyhow::Result;

use convo::config::Config;
use convo::memory::{FileMemoryStore, MemoryStore};
use convo::session::{
    resolve_mode, HttpTransport, SendReport, SessionEvent, SessionOrchestrator, Transport,
};
use convo::store::JsonlConversationStore;
use convo::tools::ToolRunner;
use convo::ui;

#[derive(Parser)]
#[command(name = "convo")]
#[command(about = "Streaming chat sessions with tool calling")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration and create the workspace
    Init {
        /// Overwrite an existing configuration
        #[arg(long)]
        force: bool,
    },

    /// Show configuration and the mode a send would use
    Status,

    /// Chat with the model
    Chat {
        /// Message to send; interactive when omitted
        #[arg(short, long)]
        message: Option<String>,

        /// Conversation ID
        #[arg(short, long, default_value = "default")]
        conversation: String,
    },

    /// Add a note to long-term memory
    Remember {
        note: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { force } => {
            convo::config::init(force)?;
        }

        Commands::Status => {
            let config = convo::config::load()?;
            print_status(&config)?;
        }

        Commands::Chat { message, conversation } => {
            let config = convo::config::load()?;
            run_chat(&config, message, &conversation).await?;
        }

        Commands::Remember { note } => {
            let config = convo::config::load()?;
            FileMemoryStore::new(&config.workspace).remember(&note)?;
            ui::print_success("Noted.");
        }
    }

    Ok(())
}

fn build_transport(config: &Config) -> HttpTransport {
    HttpTransport::new(config.backend_url.clone(), config.offline_url.clone())
        .with_backend_api_key(config.backend_api_key.clone())
}

fn print_status(config: &Config) -> Result<()> {
    let transport = build_transport(config);
    let mode = resolve_mode(&config.connections, config.offline_mode, transport.backend_reachable());

    ui::print_header(config.model.as_deref(), &mode);
    println!("Workspace: {:?}", config.workspace);
    println!("Offline URL: {}", config.offline_url);
    println!("Backend: {}", config.backend_url.as_deref().unwrap_or("not set"));

    if config.connections.is_empty() {
        println!("Connections: none");
    } else {
        println!("Connections:");
        for c in &config.connections {
            let state = if c.enabled { "enabled" } else { "disabled" };
            println!("  {} {} (priority {}, {})", c.id, c.url, c.priority, state);
        }
    }

    println!(
        "Compression: {:?} at {:.0}% of {} tokens, keeping last {}",
        config.compression.strategy,
        config.compression.threshold * 100.0,
        config.context_limit_tokens,
        config.compression.preserve_last_n
    );

    let memory = FileMemoryStore::new(&config.workspace).get_context()?;
    println!("Memory: {} chars", memory.len());
    Ok(())
}

async fn run_chat(config: &Config, message: Option<String>, conversation: &str) -> Result<()> {
    let (tx, mut rx) = unbounded_channel();
    let settings = Arc::new(RwLock::new(config.connection_settings()));
    let orchestrator = Arc::new(
        SessionOrchestrator::new(
            settings,
            Arc::new(build_transport(config)),
            Arc::new(ToolRunner::new_with_builtins()),
            config.session_config(),
        )
        .with_memory(Arc::new(FileMemoryStore::new(&config.workspace)))
        .with_store(Arc::new(JsonlConversationStore::new(&config.conversations_dir())))
        .with_events(tx),
    );
    orchestrator.switch_to(conversation);
    install_ctrlc(orchestrator.clone());

    if let Some(msg) = message {
        // Single message mode
        let report = send_and_render(&orchestrator, &mut rx, conversation, &msg).await?;
        if let Some(budget) = orchestrator.budget(conversation) {
            ui::print_budget(&budget);
        }
        tracing::debug!("Send finished after {} turn(s)", report.iterations);
        return Ok(());
    }

    run_interactive(&orchestrator, &mut rx, conversation).await
}

/// First Ctrl+C cancels the in-flight stream; a second one with nothing
/// streaming exits.
fn install_ctrlc(orchestrator: Arc<SessionOrchestrator>) {
    let armed = Arc::new(AtomicBool::new(false));

    ctrlc::set_handler(move || {
        let cancelled = orchestrator
            .active()
            .is_some_and(|id| orchestrator.cancel(&id));
        if cancelled {
            return;
        }

        if armed.swap(true, Ordering::SeqCst) {
            println!("\nBye!");
            std::process::exit(0);
        }
        println!("\n⚠️  Press Ctrl+C again to exit");

        // Reset flag after 3 seconds
        let armed = armed.clone();
        std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_secs(3));
            armed.store(false, Ordering::SeqCst);
        });
    })
    .ok();
}

/// Drive a send while rendering its events in order.
async fn send_and_render(
    orchestrator: &SessionOrchestrator,
    rx: &mut UnboundedReceiver<SessionEvent>,
    conversation: &str,
    input: &str,
) -> convo::Result<SendReport> {
    let send = orchestrator.send(conversation, input);
    tokio::pin!(send);

    print!("\n\x1b[1;32mBot\x1b[0m: ");
    let result = loop {
        tokio::select! {
            result = &mut send => break result,
            Some(event) = rx.recv() => render(event),
        }
    };
    while let Ok(event) = rx.try_recv() {
        render(event);
    }

    if let Err(e) = &result {
        println!();
        ui::print_error(&e.to_string());
    }
    result
}

fn render(event: SessionEvent) {
    match event {
        SessionEvent::Delta { text, .. } => ui::print_delta(&text),
        SessionEvent::ToolCall { request, .. } => ui::print_tool_call(&request),
        SessionEvent::ToolResult { message, .. } => ui::print_tool_result(&message),
        SessionEvent::Compressed { strategy, removed, .. } => {
            ui::print_thinking(&format!("Compressed {} messages ({:?})", removed, strategy));
        }
        SessionEvent::TurnFinished { status, .. } => ui::print_turn_end(&status),
        SessionEvent::ModeResolved { mode, .. } => tracing::debug!("Mode: {}", mode.label()),
    }
}

async fn run_interactive(
    orchestrator: &SessionOrchestrator,
    rx: &mut UnboundedReceiver<SessionEvent>,
    conversation: &str,
) -> Result<()> {
    use std::io::{self, Write};

    let mut current = conversation.to_string();
    let history = orchestrator.open_conversation(&current);
    println!("Interactive mode on '{}' ({} messages). /switch <id>, /budget, exit.\n", current, history);

    loop {
        // Blue "You"
        print!("\x1b[1;34mYou\x1b[0m: ");
        io::stdout().flush()?;

        let mut input = String::new();
        if io::stdin().read_line(&mut input)? == 0 {
            break;
        }
        let input = input.trim();

        if input.eq_ignore_ascii_case("exit") || input.eq_ignore_ascii_case("quit") {
            println!("Bye!");
            break;
        }
        if input.is_empty() {
            continue;
        }

        if let Some(target) = input.strip_prefix("/switch ") {
            current = target.trim().to_string();
            orchestrator.switch_to(&current);
            ui::print_step(&format!(
                "Switched to '{}' ({} messages)",
                current,
                orchestrator.messages(&current).len()
            ));
            continue;
        }
        if input == "/budget" {
            match orchestrator.budget(&current) {
                Some(budget) => ui::print_budget(&budget),
                None => ui::print_step("No budget yet"),
            }
            continue;
        }

        // Errors were already printed; the REPL carries on.
        let _ = send_and_render(orchestrator, rx, &current, input).await;
        println!();
    }

    Ok(())
}
