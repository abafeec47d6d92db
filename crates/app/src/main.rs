use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use tokio::io::AsyncReadExt;
use tracing_subscriber::EnvFilter;

use forker_config::Settings;
use forker_dispatch::{CommandSpec, Dispatcher, Identity, IoMode};

/// Reserved exit code for internal protocol and launch errors, per the
/// wrapper contract: a child's own exit status always passes through
/// unchanged, signal deaths map to 128 + signal.
const INTERNAL_ERROR_EXIT: i32 = 125;

#[derive(Debug, Parser)]
#[command(
    name = "forker",
    version,
    about = "Local privilege-mediation daemon and process-launch dispatcher"
)]
struct Cli {
    /// Settings file (TOML); missing file means defaults.
    #[arg(long, default_value = "forker.toml")]
    config: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the daemon in the foreground until ctrl-c.
    Daemon,
    /// Launch a command through the dispatcher, propagating its exit code.
    Run {
        /// Run the command as this uid.
        #[arg(long, conflicts_with_all = ["user", "admin"])]
        uid: Option<u32>,
        /// Run the command as this account.
        #[arg(long, conflicts_with = "admin")]
        user: Option<String>,
        /// Run the command as the administrator (uid 0).
        #[arg(long)]
        admin: bool,
        #[arg(long, value_enum, default_value = "default")]
        io: CliIoMode,
        /// Fold the child's stderr into stdout.
        #[arg(long)]
        merge_stderr: bool,
        /// Route through the daemon even without elevation.
        #[arg(long)]
        via_daemon: bool,
        /// Command and arguments to execute.
        #[arg(required = true, trailing_var_arg = true)]
        command: Vec<String>,
    },
    /// Check whether a daemon answers at the configured endpoint.
    Probe,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliIoMode {
    Default,
    Input,
    Output,
    Io,
    Sink,
    System,
}

impl From<CliIoMode> for IoMode {
    fn from(mode: CliIoMode) -> Self {
        match mode {
            CliIoMode::Default => IoMode::Default,
            CliIoMode::Input => IoMode::Input,
            CliIoMode::Output => IoMode::Output,
            CliIoMode::Io => IoMode::Io,
            CliIoMode::Sink => IoMode::Sink,
            CliIoMode::System => IoMode::System,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let settings = Settings::load_from(&cli.config)?;

    match cli.command {
        Commands::Daemon => forker_daemon::run(settings).await,
        Commands::Probe => {
            let dispatcher = Dispatcher::new(settings);
            if dispatcher.daemon_reachable().await {
                println!("daemon reachable");
                Ok(())
            } else {
                eprintln!("daemon unreachable");
                std::process::exit(1);
            }
        }
        Commands::Run {
            uid,
            user,
            admin,
            io,
            merge_stderr,
            via_daemon,
            command,
        } => {
            let identity = if admin {
                Identity::Administrator
            } else if let Some(uid) = uid {
                Identity::Uid(uid)
            } else if let Some(user) = user {
                Identity::Username(user)
            } else {
                Identity::Current
            };
            let spec = CommandSpec::new(&command[0])
                .args(command[1..].iter().cloned())
                .io_mode(io.into())
                .identity(identity)
                .merge_stderr(merge_stderr)
                .prefer_daemon(via_daemon);
            let code = run_and_propagate(settings, spec).await;
            std::process::exit(code);
        }
    }
}

/// Launches, relays captured streams onto the wrapper's own stdio, and maps
/// the child's fate to an exit code.
async fn run_and_propagate(settings: Settings, spec: CommandSpec) -> i32 {
    let dispatcher = Dispatcher::new(settings);
    let mut process = match dispatcher.launch(spec).await {
        Ok(process) => process,
        Err(err) => {
            eprintln!("forker: {err}");
            return INTERNAL_ERROR_EXIT;
        }
    };

    let stdout_pump = process.take_stdout().map(|mut stream| {
        tokio::spawn(async move {
            let _ = tokio::io::copy(&mut stream, &mut tokio::io::stdout()).await;
        })
    });
    let stderr_pump = process.take_stderr().map(|mut stream| {
        tokio::spawn(async move {
            let _ = tokio::io::copy(&mut stream, &mut tokio::io::stderr()).await;
        })
    });
    if let Some(mut stdin) = process.take_stdin() {
        tokio::spawn(async move {
            let mut source = tokio::io::stdin();
            let mut buf = vec![0u8; 8 * 1024];
            loop {
                match source.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if stdin.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                }
            }
            let _ = stdin.close().await;
        });
    }

    let status = match process.wait().await {
        Ok(status) => status,
        Err(err) => {
            eprintln!("forker: {err}");
            return INTERNAL_ERROR_EXIT;
        }
    };
    if let Some(pump) = stdout_pump {
        let _ = pump.await;
    }
    if let Some(pump) = stderr_pump {
        let _ = pump.await;
    }

    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => INTERNAL_ERROR_EXIT,
    }
}
