use async_trait::async_trait;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Stdout};
use tokio::sync::broadcast::error::TryRecvError;

use spacechat_core::agent::run_turn;
use spacechat_core::config::{load_config, Config};
use spacechat_core::context::{spawn_active_window_sync, ContextStore, SpaceContext};
use spacechat_core::conversation::{
    ConversationController, SendOutcome, SendRequest, TextDelta, TurnEnd,
};
use spacechat_core::persist::InMemoryEntityStore;
use spacechat_core::stream::HttpTransport;
use spacechat_core::thread::ChatMode;
use spacechat_core::tools::{CommandExecutor, ToolCatalog, ToolDispatcher};
use spacechat_core::window::{describe_context, InMemoryWindowRegistry, WindowRegistry, WindowTargetResolver};

#[derive(Parser)]
#[command(name = "spacechat")]
#[command(about = "SpaceChat CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Chat with the generation endpoint (interactive). Windows come from the config's workspace seed; tool calls are echoed back instead of executed.
    Chat {
        /// Config file path (default: SPACECHAT_CONFIG_PATH or ~/.spacechat/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Chat mode: chat, create, editor or exp1.
        #[arg(long, default_value = "chat")]
        mode: ChatMode,

        /// Model id (default from config).
        #[arg(long)]
        model: Option<String>,
    },

    /// Show which window a tool call would be sent to, given the workspace seed.
    Resolve {
        /// Config file path (default: SPACECHAT_CONFIG_PATH or ~/.spacechat/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Tool name, e.g. pdf_getPage.
        #[arg(long)]
        tool: String,

        /// Tool input as JSON.
        #[arg(long, default_value = "{}")]
        input: String,

        /// Window ids in context (comma separated). Defaults to every seeded window.
        #[arg(long, value_delimiter = ',')]
        context: Vec<String>,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("spacechat {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Chat { config, mode, model }) => {
            if let Err(e) = run_chat(config, mode, model).await {
                log::error!("chat failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Resolve {
            config,
            tool,
            input,
            context,
        }) => {
            if let Err(e) = run_resolve(config, &tool, &input, &context) {
                log::error!("resolve failed: {:#}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

/// Stand-in for the host application: reports what it would have done.
struct EchoExecutor;

#[async_trait]
impl CommandExecutor for EchoExecutor {
    async fn execute(&self, tool_name: &str, input: Value, _context: &SpaceContext) -> Result<Value, String> {
        log::info!("echo executor: {} {}", tool_name, input);
        Ok(json!({
            "tool": tool_name,
            "input": input,
            "note": "no host application attached; nothing was changed"
        }))
    }
}

fn seeded_workspace(config: &Config) -> (Arc<InMemoryWindowRegistry>, String) {
    let seed = &config.workspace;
    let registry = Arc::new(InMemoryWindowRegistry::with_windows(
        seed.windows.clone(),
        seed.active_window_id.clone(),
    ));
    let space_id = seed
        .space_id
        .clone()
        .unwrap_or_else(|| "default".to_string());
    (registry, space_id)
}

fn run_resolve(
    config_path: Option<PathBuf>,
    tool: &str,
    input: &str,
    context_ids: &[String],
) -> anyhow::Result<()> {
    let (config, _) = load_config(config_path)?;
    let input: Value = serde_json::from_str(input)
        .map_err(|e| anyhow::anyhow!("--input is not valid JSON: {}", e))?;
    let (registry, space_id) = seeded_workspace(&config);
    let store = ContextStore::new(registry.clone(), space_id.clone());
    let ids: Vec<String> = if context_ids.is_empty() {
        registry.windows().into_iter().map(|w| w.id).collect()
    } else {
        context_ids.to_vec()
    };
    for id in &ids {
        if !store.add_window_to_context(id) {
            log::warn!("unknown window id {}", id);
        }
    }
    let active = registry.active_window_id();
    let resolver = WindowTargetResolver::new(config.targeting);
    let result = resolver.enhance_tool_input(
        tool,
        &input,
        &store.snapshot(),
        registry.as_ref(),
        active.as_deref(),
        Some(&space_id),
    );
    let out = json!({
        "input": result.input,
        "wasModified": result.was_modified,
        "reason": result.reason,
        "error": result.error,
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

async fn run_chat(
    config_path: Option<PathBuf>,
    mode: ChatMode,
    model: Option<String>,
) -> anyhow::Result<()> {
    let (config, path) = load_config(config_path)?;
    log::info!("loaded config from {}", path.display());

    let (registry, space_id) = seeded_workspace(&config);
    let context = ContextStore::new(registry.clone(), space_id);
    let _sync = spawn_active_window_sync(context.clone(), registry.subscribe_active());

    let transport = Arc::new(HttpTransport::from_config(&config)?);
    let store = Arc::new(InMemoryEntityStore::new());
    let controller = ConversationController::new(
        config.conversation.clone(),
        store,
        transport,
        Arc::new(ToolCatalog::builtin()),
    );
    controller.initialize(&Default::default()).await?;
    let dispatcher = ToolDispatcher::new(
        Arc::new(EchoExecutor),
        WindowTargetResolver::new(config.targeting),
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    let mut thread_id: Option<String> = None;

    println!("spacechat {} ({} mode). /help for commands.", env!("CARGO_PKG_VERSION"), mode);
    loop {
        stdout.write_all(b"> ").await?;
        stdout.flush().await?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if let Some(command) = input.strip_prefix('/') {
            let mut parts = command.splitn(2, ' ');
            let name = parts.next().unwrap_or("");
            let arg = parts.next().map(str::trim).unwrap_or("");
            match name {
                "quit" | "exit" => break,
                "help" => println!("/add <window> /drop <window> /context /state /new /quit"),
                "add" => {
                    if context.add_window_to_context(arg) {
                        println!("added {}", arg);
                    } else {
                        println!("no window or entity {}", arg);
                    }
                }
                "drop" => {
                    context.remove_window_content(arg);
                }
                "context" => {
                    let active = registry.active_window_id();
                    println!(
                        "{}",
                        describe_context(&context.snapshot(), registry.as_ref(), active.as_deref())
                    );
                }
                "state" => println!("{}", serde_json::to_string_pretty(&controller.dump_state())?),
                "new" => {
                    thread_id = Some(controller.create_thread(mode));
                    println!("started a new thread");
                }
                other => println!("unknown command /{}", other),
            }
            continue;
        }

        let mut request = SendRequest::text(input, mode, context.snapshot());
        request.thread_id = thread_id.clone();
        request.model = model.clone();
        let mut deltas = controller.subscribe_text();
        let mut streamed = false;
        let mut turn = {
            let controller = controller.clone();
            let dispatcher = dispatcher.clone();
            let context = context.clone();
            tokio::spawn(async move { run_turn(&controller, &dispatcher, &context, request).await })
        };
        let joined = loop {
            tokio::select! {
                joined = &mut turn => break joined,
                delta = deltas.recv() => {
                    if let Ok(delta) = delta {
                        print_delta(&mut stdout, &delta, &mut streamed).await?;
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    controller.stop_stream().await;
                    break turn.await;
                }
            }
        };
        // The turn can finish before every published delta was received.
        loop {
            match deltas.try_recv() {
                Ok(delta) => print_delta(&mut stdout, &delta, &mut streamed).await?,
                Err(TryRecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
        if streamed {
            println!();
        }
        match joined? {
            Ok(SendOutcome::Rejected(reason)) => println!("(not sent: {:?})", reason),
            Ok(SendOutcome::Finished(end)) => {
                thread_id = Some(end.thread_id().to_string());
                print_turn_end(&controller, &end, streamed);
            }
            Err(e) => eprintln!("chat error: {}", e),
        }
    }

    controller.stop_stream().await;
    Ok(())
}

async fn print_delta(stdout: &mut Stdout, delta: &TextDelta, streamed: &mut bool) -> std::io::Result<()> {
    if !*streamed {
        stdout.write_all(b"< ").await?;
        *streamed = true;
    }
    stdout.write_all(delta.delta.as_bytes()).await?;
    stdout.flush().await
}

/// Summarize how the turn ended. Text already streamed to the terminal is not repeated.
fn print_turn_end(controller: &ConversationController, end: &TurnEnd, streamed: bool) {
    let message_id = match end {
        TurnEnd::Done { message_id, .. }
        | TurnEnd::ToolPending { message_id, .. }
        | TurnEnd::Failed { message_id, .. }
        | TurnEnd::Stopped { message_id, .. } => message_id,
    };
    let text = controller
        .message(message_id)
        .map(|m| m.text())
        .unwrap_or_default();
    match end {
        TurnEnd::Failed { .. } => eprintln!("! {}", text.trim()),
        TurnEnd::Stopped { .. } if streamed => println!("  (stopped)"),
        TurnEnd::Stopped { .. } => println!("< {} (stopped)", text.trim()),
        _ if !streamed => println!("< {}", text.trim()),
        _ => {}
    }
    if let TurnEnd::Done { title: Some(title), .. } = end {
        println!("  [{}]", title);
    }
}
