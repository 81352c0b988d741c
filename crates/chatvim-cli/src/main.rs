//! chatvim - answer the chat transcript in a plain text file

mod config;
mod file_host;
mod prompts;

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::bail;
use clap::Parser;
use chatvim_core::{Engine, MainLoop, SessionEvent, SessionHandle, SessionOutcome};
use tokio::sync::broadcast::error::TryRecvError;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::file_host::FileHost;

/// chatvim - stream a model's reply into a chat transcript
#[derive(Parser, Debug)]
#[command(name = "chatvim")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Transcript file to answer
    #[arg(required_unless_present_any = ["list_models", "init_config"])]
    file: Option<PathBuf>,

    /// Line the cursor is on (1-based); the reply goes below it.
    /// Defaults to the last line
    #[arg(short, long)]
    line: Option<usize>,

    /// Model for untagged user turns (overrides the config file)
    #[arg(short, long)]
    model: Option<String>,

    /// System prompt name under ~/.config/chatvim/prompts/
    #[arg(short, long)]
    prompt: Option<String>,

    /// Send no system prompt
    #[arg(long, conflicts_with = "prompt")]
    no_prompt: bool,

    /// Print the request that would be sent and exit
    #[arg(long)]
    dry_run: bool,

    /// List known models
    #[arg(long)]
    list_models: bool,

    /// Initialize config file
    #[arg(long)]
    init_config: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "chatvim=debug" } else { "chatvim=warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    // Initialize config and exit
    if args.init_config {
        match Config::init() {
            Ok(path) => {
                println!("Config file at: {}", path.display());
                println!("Prompts are read from: {}", prompts::prompts_dir().display());
            }
            Err(e) => {
                eprintln!("Error creating config: {}", e);
                std::process::exit(1);
            }
        }
        return Ok(());
    }

    if args.list_models {
        list_models();
        return Ok(());
    }

    let Some(path) = args.file.clone() else {
        bail!("no transcript file given");
    };

    let cfg = Config::load();
    let mut engine_config = cfg.engine_config();
    if let Some(model) = &args.model {
        engine_config.model = model.clone();
    }
    if !args.no_prompt {
        let name = args
            .prompt
            .clone()
            .or_else(|| cfg.prompt.clone())
            .unwrap_or_else(|| "default".to_string());
        engine_config.system_prompt = prompts::load_prompt(&name)?;
    }

    let mut host = FileHost::open(&path)?;
    let cursor = match args.line {
        Some(0) => bail!("line numbers start at 1"),
        Some(line) => line - 1,
        None => host.lines().len().saturating_sub(1),
    };
    host.place_cursor(cursor);

    let (dispatcher, main_loop) = chatvim_core::host::channel();
    let engine = Engine::new(engine_config, Arc::new(cfg.transport()), dispatcher);

    if args.dry_run {
        return dry_run(&engine, &host);
    }

    let Some(handle) = engine.respond(&mut host)? else {
        eprintln!("Nothing to send above line {} of {}", cursor + 1, path.display());
        return Ok(());
    };

    let mut stdout = std::io::stdout();
    match drive(&mut host, main_loop, &engine, handle, &mut stdout).await {
        SessionOutcome::Completed => Ok(()),
        SessionOutcome::Interrupted(reason) => {
            eprintln!("\nInterrupted ({:?}); {} left as is", reason, host.path().display());
            Ok(())
        }
        SessionOutcome::BufferClosed => {
            eprintln!("\n{} went away mid-reply", host.path().display());
            std::process::exit(1);
        }
        // the host already printed the notice
        SessionOutcome::Failed(_) => std::process::exit(1),
    }
}

/// Act as the editor's main loop until the session ends: run marshaled
/// jobs against the file, echo flushed text to `out`, and turn Ctrl-C into
/// an abort.
async fn drive(
    host: &mut FileHost,
    mut main_loop: MainLoop,
    engine: &Engine,
    handle: SessionHandle,
    out: &mut dyn Write,
) -> SessionOutcome {
    let mut events = engine.subscribe();
    let outcome = handle.wait();
    tokio::pin!(outcome);
    let mut aborted = false;

    loop {
        tokio::select! {
            outcome = &mut outcome => {
                main_loop.run_pending(&mut *host);
                // the last deltas may still be queued behind the outcome
                loop {
                    match events.try_recv() {
                        Ok(event) => echo(&event, out),
                        Err(TryRecvError::Lagged(_)) => continue,
                        Err(_) => break,
                    }
                }
                let _ = writeln!(out);
                return outcome;
            }
            Some(job) = main_loop.next_job() => {
                host.sync();
                job(&mut *host);
            }
            Ok(event) = events.recv() => echo(&event, out),
            result = tokio::signal::ctrl_c(), if !aborted => {
                aborted = true;
                match result {
                    Ok(()) => handle.abort(),
                    Err(e) => tracing::warn!("Cannot listen for Ctrl-C: {}", e),
                }
            }
        }
    }
}

fn echo(event: &SessionEvent, out: &mut dyn Write) {
    if let SessionEvent::Flushed { delta, .. } = event {
        let _ = write!(out, "{}", delta);
        let _ = out.flush();
    }
}

fn dry_run(engine: &Engine, host: &FileHost) -> anyhow::Result<()> {
    let Some(request) = engine.request_at_cursor(host)? else {
        eprintln!("Nothing to send");
        return Ok(());
    };
    let preview = serde_json::json!({
        "model": request.model,
        "insert_after_line": request.cursor_line + 1,
        "messages": request.conversation.turns,
    });
    println!("{}", serde_json::to_string_pretty(&preview)?);
    Ok(())
}

fn list_models() {
    for model in chatvim_ai::models::get_all_models() {
        println!(
            "{:<28} {:<10} max {} tokens",
            model.id,
            model.provider.name(),
            model.max_tokens
        );
    }
}
