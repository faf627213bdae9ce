//! Thin operator CLI over `csm-core`'s session manager: create local/SSH
//! sessions, drive them, and inspect state. Bootstrap (debug-gated tracing,
//! profile/config resolution) follows the teacher's CLI `main.rs`.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use csm_core::channel::remote::RemoteAuth;
use csm_core::{Config, JsonFileStore, OsFileSystem, OsRandom, SessionManager, SystemClock};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "csm", version, about = "Drive local and SSH shell sessions through one engine")]
struct Cli {
    #[arg(long, global = true, env = "CSM_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, global = true, env = "CSM_STATE_DIR")]
    state_dir: Option<PathBuf>,

    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a local PTY shell session.
    CreateLocal {
        #[arg(long)]
        description: Option<String>,
    },
    /// Start an SSH shell session against `user@host[:port]`.
    CreateRemote {
        connection: String,
        #[arg(long)]
        password: Option<String>,
        #[arg(long)]
        key: Option<String>,
        #[arg(long)]
        description: Option<String>,
    },
    /// Run a command to completion (or a prompt/timeout boundary).
    Exec {
        session_id: String,
        command: String,
        #[arg(long, default_value_t = 30)]
        timeout_secs: u64,
    },
    /// Answer a prompt a previous exec stopped at.
    Respond {
        session_id: String,
        input: String,
        #[arg(long)]
        mask: bool,
        #[arg(long, default_value_t = 30)]
        timeout_secs: u64,
    },
    /// Run a command, printing output as it arrives instead of waiting for completion.
    ExecStream {
        session_id: String,
        command: String,
        #[arg(long, default_value_t = 30)]
        timeout_secs: u64,
    },
    /// Send an interrupt (Ctrl-C) to a running command.
    Interrupt { session_id: String },
    /// List every live session.
    List,
    /// Close one session.
    Close { session_id: String },
    /// Close every live session.
    CloseAll,
}

fn default_state_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")).join(".csm")
}

async fn load_config(fs: &OsFileSystem, path: Option<&PathBuf>) -> anyhow::Result<Config> {
    let path = match path {
        Some(p) => p.clone(),
        None => default_state_dir().join("config.toml"),
    };
    if csm_core::FileSystem::exists(fs, &path).await {
        Ok(Config::load(fs, &path).await?)
    } else {
        Ok(Config::default())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let state_dir = cli.state_dir.clone().unwrap_or_else(default_state_dir);

    // Guard must be held for the runtime's lifetime so buffered log lines get
    // flushed to disk; dropping it early silently truncates the log.
    let mut _log_guard = None;
    if cli.debug {
        std::fs::create_dir_all(&state_dir).ok();
        let appender = tracing_appender::rolling::never(&state_dir, "csm.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);
        _log_guard = Some(guard);
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "error,csm_core=debug,csm_cli=debug".into()),
            )
            .with(tracing_subscriber::fmt::layer())
            .with(tracing_subscriber::fmt::layer().with_writer(non_blocking).with_ansi(false))
            .init();
    }

    let fs = OsFileSystem;
    let config = load_config(&fs, cli.config.as_ref()).await?;
    let store = Arc::new(JsonFileStore::new(Arc::new(OsFileSystem), state_dir.join("sessions.json")));
    let manager = SessionManager::new(config, Arc::new(OsRandom), Arc::new(SystemClock), store, Arc::new(OsFileSystem))?;

    match cli.command {
        Command::CreateLocal { description } => {
            let session = manager.create_local(description, Vec::new()).await?;
            println!("{}", session.id);
        }
        Command::CreateRemote { connection, password, key, description } => {
            let auth = RemoteAuth {
                password: password.as_deref(),
                private_key_path: key.as_deref(),
            };
            let session = manager.create_remote(&connection, auth, description, Vec::new()).await?;
            println!("{}", session.id);
        }
        Command::Exec { session_id, command, timeout_secs } => {
            let session = manager.get(&session_id).await?;
            let result = session.exec(&command, Duration::from_secs(timeout_secs)).await?;
            print_exec_result(&result);
        }
        Command::Respond { session_id, input, mask, timeout_secs } => {
            let session = manager.get(&session_id).await?;
            let result = session.respond(&input, mask, Duration::from_secs(timeout_secs)).await?;
            print_exec_result(&result);
        }
        Command::ExecStream { session_id, command, timeout_secs } => {
            let session = manager.get(&session_id).await?;
            let (mut rx, handle) = session.exec_streaming(command, Duration::from_secs(timeout_secs)).await?;
            while let Some(chunk) = rx.recv().await {
                print!("{}", chunk.text);
                std::io::stdout().flush().unwrap_or_default();
            }
            let result = handle.await.map_err(|e| anyhow::anyhow!("exec task panicked: {e}"))??;
            println!();
            print_exec_result(&result);
        }
        Command::Interrupt { session_id } => {
            let session = manager.get(&session_id).await?;
            session.interrupt().await?;
            println!("interrupted");
        }
        Command::List => {
            for status in manager.list_detailed().await {
                println!(
                    "{}\t{:?}\t{:?}\t{}\tidle {}",
                    status.id,
                    status.kind,
                    status.state,
                    status.description.as_deref().unwrap_or("-"),
                    status.idle_for_humanized(),
                );
            }
        }
        Command::Close { session_id } => {
            manager.close(&session_id).await?;
            println!("closed {session_id}");
        }
        Command::CloseAll => {
            manager.close_all().await?;
            println!("closed all sessions");
        }
    }

    Ok(())
}

fn print_exec_result(result: &csm_core::ExecResult) {
    println!("status: {:?}", result.status);
    if let Some(code) = result.exit_code {
        println!("exit_code: {code}");
    }
    if let Some(prompt) = &result.prompt {
        println!("awaiting_input: {} ({})", prompt.pattern_name, prompt.kind.hint());
    }
    if result.truncated {
        println!("(output truncated)");
    }
    println!("{}", result.stdout);
}
