use base64::Engine;
use clap::{Parser, Subcommand};
use parley::chat::{ChatService, UNAUTHORIZED_NOTICE};
use parley::llm::ChatError;
use parley::persist::JsonFileStore;
use parley::store::ChatStore;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;

#[derive(Parser)]
#[command(name = "parley")]
#[command(about = "Parley CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Create the configuration directory, a default config file, and the data directory.
    Init {
        /// Config file path (default: PARLEY_CONFIG_PATH or ~/.parley/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },

    /// Chat in the active session (interactive). Ctrl-C stops the reply being generated;
    /// type /help for session commands.
    Chat {
        /// Config file path (default: PARLEY_CONFIG_PATH or ~/.parley/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },

    /// List stored sessions.
    Sessions {
        /// Config file path (default: PARLEY_CONFIG_PATH or ~/.parley/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },

    /// Generate an image in the active session and print its URL.
    Image {
        /// Config file path (default: PARLEY_CONFIG_PATH or ~/.parley/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Write base64 image payloads to this file instead of printing them.
        #[arg(long, short, value_name = "FILE")]
        out: Option<PathBuf>,

        /// What to draw.
        prompt: Vec<String>,
    },

    /// Delete all sessions and persisted state.
    Clear {
        /// Config file path (default: PARLEY_CONFIG_PATH or ~/.parley/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    let result = match cli.command {
        Some(Commands::Version) => {
            println!("parley {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Some(Commands::Init { config }) => run_init(config),
        Some(Commands::Chat { config }) => run_chat(config).await,
        Some(Commands::Sessions { config }) => run_sessions(config).await,
        Some(Commands::Image {
            config,
            out,
            prompt,
        }) => run_image(config, out, prompt.join(" ")).await,
        Some(Commands::Clear { config }) => run_clear(config).await,
        None => {
            println!("Run with --help for usage");
            Ok(())
        }
    };
    if let Err(e) = result {
        log::error!("{:#}", e);
        std::process::exit(1);
    }
}

fn run_init(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let path = config_path.unwrap_or_else(parley::config::default_config_path);
    let dir = parley::config::init_config_dir(&path)?;
    println!("initialized configuration at {}", dir.display());
    Ok(())
}

/// Load config and persisted sessions, and build the chat service on top.
async fn open_service(config_path: Option<PathBuf>) -> anyhow::Result<ChatService> {
    let (config, path) = parley::config::load_config(config_path)?;
    let data_dir = parley::config::resolve_data_dir(&config, &path);
    log::debug!("using data directory {}", data_dir.display());
    let store = ChatStore::load(
        Arc::new(JsonFileStore::new(data_dir)),
        config.defaults.clone(),
    )
    .await?;
    Ok(ChatService::from_config(&config, store))
}

async fn print_sessions(service: &ChatService) {
    let current = service.store().current_index().await;
    for (i, s) in service.store().sessions().await.iter().enumerate() {
        let marker = if i == current { '*' } else { ' ' };
        println!(
            "{} {:>3}  {}  ({} messages, {})",
            marker,
            i,
            s.topic,
            s.messages.len(),
            s.last_update.format("%Y-%m-%d %H:%M")
        );
    }
}

async fn run_sessions(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let service = open_service(config_path).await?;
    print_sessions(&service).await;
    Ok(())
}

async fn run_clear(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let service = open_service(config_path).await?;
    service.clear_all_data().await?;
    println!("all sessions deleted");
    Ok(())
}

async fn run_image(
    config_path: Option<PathBuf>,
    out: Option<PathBuf>,
    prompt: String,
) -> anyhow::Result<()> {
    if prompt.trim().is_empty() {
        anyhow::bail!("image prompt is empty");
    }
    let service = open_service(config_path).await?;
    let images = service.generate_image(&prompt).await?;
    for (i, img) in images.iter().enumerate() {
        if let Some(url) = &img.url {
            println!("{}", url);
        } else if let Some(b64) = &img.b64_json {
            let bytes = base64::engine::general_purpose::STANDARD.decode(b64)?;
            match &out {
                Some(path) => {
                    let path = if i == 0 {
                        path.clone()
                    } else {
                        path.with_extension(format!("{}.png", i))
                    };
                    std::fs::write(&path, &bytes)?;
                    println!("wrote {}", path.display());
                }
                None => println!("({} bytes of image data; pass --out to save)", bytes.len()),
            }
        }
        if let Some(revised) = &img.revised_prompt {
            println!("  prompt: {}", revised);
        }
    }
    Ok(())
}

const HELP: &str = "\
/new              start a new session
/list             list sessions
/select N         switch to session N
/delete N         delete session N (undo with /undo for 5 seconds)
/undo             restore the last deleted session
/move FROM TO     reorder sessions
/reset            clear messages and memory of this session
/search on|off    toggle web search for this session
/quit             exit";

/// Handle a slash command. Returns false when the loop should end.
async fn slash_command(service: &ChatService, input: &str) -> anyhow::Result<bool> {
    let mut parts = input.split_whitespace();
    let cmd = parts.next().unwrap_or("");
    let args: Vec<&str> = parts.collect();
    let index = |i: usize| -> anyhow::Result<usize> {
        let raw = args
            .get(i)
            .ok_or_else(|| anyhow::anyhow!("missing session number"))?;
        raw.parse()
            .map_err(|_| anyhow::anyhow!("not a session number: {}", raw))
    };
    match cmd {
        "/quit" | "/exit" => return Ok(false),
        "/help" => println!("{}", HELP),
        "/new" => {
            service.store().new_session().await?;
            println!("started a new session");
        }
        "/list" => print_sessions(service).await,
        "/select" => {
            service.store().select_session(index(0)?).await?;
            let s = service.store().current_session().await;
            println!("now in: {}", s.topic);
        }
        "/delete" => {
            if service.delete_session(index(0)?).await? {
                println!("deleted (/undo to restore)");
            } else {
                println!("no such session");
            }
        }
        "/undo" => {
            if service.store().undo_delete().await? {
                println!("restored");
            } else {
                println!("nothing to undo");
            }
        }
        "/move" => {
            if !service.store().move_session(index(0)?, index(1)?).await? {
                println!("no such session");
            }
        }
        "/reset" => {
            service.reset_session().await?;
            println!("session cleared");
        }
        "/search" => {
            let on = match args.first().copied() {
                Some("on") => true,
                Some("off") => false,
                _ => anyhow::bail!("usage: /search on|off"),
            };
            service
                .store()
                .update_current_session(|s| s.model_config.web_search = on)
                .await;
            service.store().save().await?;
            println!("web search {}", if on { "on" } else { "off" });
        }
        other => println!("unknown command {} (try /help)", other),
    }
    Ok(true)
}

async fn run_chat(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let service = open_service(config_path).await?;
    let stdin = io::stdin();
    let mut stdout = io::stdout();
    let mut last_summary: Option<JoinHandle<parley::memory::SummaryOutcome>> = None;

    println!("{}", service.store().current_session().await.topic);
    loop {
        write!(stdout, "> ")?;
        stdout.flush()?;
        let mut line = String::new();
        if stdin.read_line(&mut line)? == 0 {
            break;
        }
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if input.starts_with('/') {
            match slash_command(&service, input).await {
                Ok(true) => continue,
                Ok(false) => break,
                Err(e) => {
                    eprintln!("{}", e);
                    continue;
                }
            }
        }

        let runner = service.clone();
        let content = input.to_string();
        let mut turn = tokio::spawn(async move {
            let mut printed = 0;
            let mut out = io::stdout();
            runner
                .on_user_input(&content, &mut |text: &str| {
                    if let Some(delta) = text.get(printed..) {
                        let _ = write!(out, "{}", delta);
                        let _ = out.flush();
                    }
                    printed = text.len();
                })
                .await
        });
        let outcome = tokio::select! {
            res = &mut turn => res?,
            _ = tokio::signal::ctrl_c() => {
                service.stop_all().await;
                turn.await?
            }
        };
        println!();
        match outcome {
            Ok(outcome) => {
                match &outcome.error {
                    Some(e) if e.is_aborted() => println!("[stopped]"),
                    Some(ChatError::Unauthorized) => eprintln!("{}", UNAUTHORIZED_NOTICE),
                    Some(e) => eprintln!("error: {}", e),
                    None => {}
                }
                last_summary = Some(outcome.summary);
            }
            Err(e) => eprintln!("chat error: {:#}", e),
        }
    }

    // Let the last topic/memory summary land before exiting.
    if let Some(handle) = last_summary {
        if let Ok(summary) = handle.await {
            if summary.topic_updated {
                println!("saved as: {}", service.store().current_session().await.topic);
            }
        }
    }
    Ok(())
}
