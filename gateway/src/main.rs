//! # hostlink
//!
//! Gateway CLI for executing shell commands and file operations on remote
//! Unix hosts as if they were local. Hosts are registered once, then every
//! command accepts `--host <name>` and is routed either to the local backend
//! or to an auto-deployed on-host agent over an SSH-tunneled WebSocket.
//!
//! ```text
//! main.rs        — entry point, clap subcommands, output formatting
//! registry.rs    — persisted host registry (hosts.json, atomic saves)
//! remote/
//!   tunnel.rs    — ssh -N -L port forward
//!   bootstrap.rs — stage agent source + deploy.sh, wait for readiness
//!   wire.rs      — authenticated WebSocket RPC client
//!   host.rs      — per-host connection, transport recovery, teardown
//!   manager.rs   — connection pool, resume-then-deploy
//! backend/       — ExecutionBackend trait, Local/Remote impls, router
//! compare.rs     — cross-backend file/dir comparison
//! ```

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};

use hostlink::backend::BackendRouter;
use hostlink::compare::{self, CompareSide};
use hostlink::protocol::RpcResult;
use hostlink::registry::{HostConfig, HostRegistry};
use hostlink::remote::{ConnectOutcome, HostManager};

/// Execute commands and file operations on remote Unix hosts.
#[derive(Parser)]
#[command(name = "hostlink", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage registered hosts.
    Hosts {
        #[command(subcommand)]
        action: HostsAction,
    },
    /// Run a shell command, locally or on a host.
    Exec {
        /// Registered host name; local execution when omitted.
        #[arg(long)]
        host: Option<String>,
        /// Working directory for the command.
        #[arg(long)]
        cwd: Option<String>,
        /// Timeout in seconds.
        #[arg(long, default_value_t = 60)]
        timeout: u64,
        /// The command line to run.
        command: String,
    },
    /// Print a UTF-8 file.
    Read {
        #[arg(long)]
        host: Option<String>,
        path: String,
    },
    /// Write a file atomically.
    Write {
        #[arg(long)]
        host: Option<String>,
        path: String,
        content: String,
    },
    /// Replace a uniquely-occurring text span in a file.
    Edit {
        #[arg(long)]
        host: Option<String>,
        path: String,
        old_text: String,
        new_text: String,
    },
    /// List a directory (non-recursive).
    Ls {
        #[arg(long)]
        host: Option<String>,
        path: String,
    },
    /// Compare files or directories across hosts.
    Compare {
        #[command(subcommand)]
        what: CompareWhat,
    },
}

#[derive(Subcommand)]
enum HostsAction {
    /// Register a host. Does not connect.
    Add {
        name: String,
        /// SSH destination in user@host form.
        ssh_target: String,
        #[arg(long, default_value_t = 22)]
        ssh_port: u16,
        /// Path to an SSH private key (defaults to the agent/keychain).
        #[arg(long)]
        key: Option<String>,
        /// Port the agent binds on the remote loopback.
        #[arg(long, default_value_t = 8765)]
        remote_port: u16,
        /// Shared secret required by the agent.
        #[arg(long)]
        token: Option<String>,
        /// Default working directory on the host.
        #[arg(long)]
        workspace: Option<String>,
    },
    /// Disconnect (if needed) and unregister a host.
    Remove {
        name: String,
        /// Remove the entry even if remote teardown fails.
        #[arg(long)]
        force: bool,
    },
    /// List registered hosts and their connection state.
    List,
    /// Connect (resume a previous session when possible).
    Connect { name: String },
    /// Tear down the remote session and close the tunnel.
    Disconnect { name: String },
    /// Show one host's configuration and state.
    Status { name: String },
}

#[derive(Subcommand)]
enum CompareWhat {
    /// Compare two files byte-for-byte (text diff when applicable).
    File {
        left_path: String,
        right_path: String,
        #[arg(long)]
        left_host: Option<String>,
        #[arg(long)]
        right_host: Option<String>,
    },
    /// Compare two directory listings.
    Dir {
        left_path: String,
        right_path: String,
        #[arg(long)]
        left_host: Option<String>,
        #[arg(long)]
        right_host: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(log_filter)
        .with_writer(std::io::stderr)
        .init();

    let registry = HostRegistry::load(HostRegistry::default_path());
    let manager = Arc::new(HostManager::new(registry));
    let router = BackendRouter::new(Arc::clone(&manager));

    let exit_code = run(cli.command, &manager, &router).await;
    std::process::exit(exit_code);
}

async fn run(command: Commands, manager: &Arc<HostManager>, router: &BackendRouter) -> i32 {
    match command {
        Commands::Hosts { action } => run_hosts(action, manager).await,
        Commands::Exec {
            host,
            cwd,
            timeout,
            command,
        } => {
            let backend = match router.resolve(host.as_deref()).await {
                Ok(backend) => backend,
                Err(e) => return fail(&e.to_string()),
            };
            match backend
                .exec(&command, cwd.as_deref(), Duration::from_secs(timeout))
                .await
            {
                Ok(result) => print_exec(&result),
                Err(e) => fail(&e.to_string()),
            }
        }
        Commands::Read { host, path } => {
            let outcome = with_backend(router, host.as_deref(), |backend| async move {
                backend.read_file(&path).await
            })
            .await;
            finish(outcome, |result| {
                print!("{}", result.content.unwrap_or_default());
            })
        }
        Commands::Write {
            host,
            path,
            content,
        } => {
            let outcome = with_backend(router, host.as_deref(), |backend| async move {
                backend.write_file(&path, &content).await
            })
            .await;
            finish(outcome, |result| {
                println!("wrote {} bytes", result.bytes.unwrap_or(0));
            })
        }
        Commands::Edit {
            host,
            path,
            old_text,
            new_text,
        } => {
            let outcome = with_backend(router, host.as_deref(), |backend| async move {
                backend.edit_file(&path, &old_text, &new_text).await
            })
            .await;
            finish(outcome, |result| {
                println!("edited {}", result.path.unwrap_or_default());
            })
        }
        Commands::Ls { host, path } => {
            let outcome = with_backend(router, host.as_deref(), |backend| async move {
                backend.list_dir(&path).await
            })
            .await;
            finish(outcome, |result| {
                for entry in result.entries.unwrap_or_default() {
                    println!("{:<8} {:>10}  {}", entry.entry_type, entry.size, entry.name);
                }
            })
        }
        Commands::Compare { what } => run_compare(what, router).await,
    }
}

async fn run_hosts(action: HostsAction, manager: &Arc<HostManager>) -> i32 {
    match action {
        HostsAction::Add {
            name,
            ssh_target,
            ssh_port,
            key,
            remote_port,
            token,
            workspace,
        } => {
            let mut config = HostConfig::new(&name, ssh_target);
            config.ssh_port = ssh_port;
            config.ssh_key_path = key;
            config.remote_port = remote_port;
            config.auth_token = token;
            config.workspace = workspace;
            match manager.add_host(config).await {
                Ok(()) => {
                    println!("added host '{name}'; connect with: hostlink hosts connect {name}");
                    0
                }
                Err(e) => fail(&e.to_string()),
            }
        }
        HostsAction::Remove { name, force } => match manager.remove_host(&name, force).await {
            Ok(()) => {
                println!("removed host '{name}'");
                0
            }
            Err(e) => fail(&e.to_string()),
        },
        HostsAction::List => {
            let hosts = manager.list().await;
            if hosts.is_empty() {
                println!("no hosts registered");
                return 0;
            }
            for (config, connected) in hosts {
                let state = if connected {
                    "connected"
                } else if config.active_session.is_some() {
                    "resumable"
                } else {
                    "disconnected"
                };
                println!("{:<20} {:<30} [{state}]", config.name, config.ssh_target);
            }
            0
        }
        HostsAction::Connect { name } => match manager.connect(&name).await {
            Ok((ConnectOutcome::AlreadyConnected, _)) => {
                println!("'{name}' already connected");
                0
            }
            Ok((ConnectOutcome::Resumed, host)) => {
                println!(
                    "resumed session {} on '{name}'",
                    host.session_id().await.unwrap_or_default()
                );
                0
            }
            Ok((ConnectOutcome::NewSession, host)) => {
                println!(
                    "connected '{name}' (new session {})",
                    host.session_id().await.unwrap_or_default()
                );
                0
            }
            Err(e) => fail(&e.to_string()),
        },
        HostsAction::Disconnect { name } => match manager.disconnect(&name).await {
            Ok(true) => {
                println!("disconnected '{name}'");
                0
            }
            Ok(false) => {
                println!("'{name}' is not connected");
                0
            }
            Err(e) => fail(&e.to_string()),
        },
        HostsAction::Status { name } => match manager.get_config(&name).await {
            Some(config) => {
                println!("host: {name}");
                println!("  ssh_target:  {}", config.ssh_target);
                println!("  ssh_port:    {}", config.ssh_port);
                println!("  remote_port: {}", config.remote_port);
                if let Some(ws) = &config.workspace {
                    println!("  workspace:   {ws}");
                }
                match &config.active_session {
                    Some(session) => println!("  session:     {}", session.session_id),
                    None => println!("  session:     none"),
                }
                0
            }
            None => fail(&format!("Host not found: {name}")),
        },
    }
}

async fn run_compare(what: CompareWhat, router: &BackendRouter) -> i32 {
    let (left_path, right_path, left_host, right_host, is_dir) = match what {
        CompareWhat::File {
            left_path,
            right_path,
            left_host,
            right_host,
        } => (left_path, right_path, left_host, right_host, false),
        CompareWhat::Dir {
            left_path,
            right_path,
            left_host,
            right_host,
        } => (left_path, right_path, left_host, right_host, true),
    };

    if left_host.is_none() && right_host.is_none() {
        return fail("local<->local compare is not supported; use diff(1)");
    }

    let left_backend = match router.resolve(left_host.as_deref()).await {
        Ok(backend) => backend,
        Err(e) => return fail(&e.to_string()),
    };
    let right_backend = match router.resolve(right_host.as_deref()).await {
        Ok(backend) => backend,
        Err(e) => return fail(&e.to_string()),
    };

    let left = CompareSide {
        backend: left_backend.as_ref(),
        label: left_host.as_deref().unwrap_or("local"),
        path: &left_path,
    };
    let right = CompareSide {
        backend: right_backend.as_ref(),
        label: right_host.as_deref().unwrap_or("local"),
        path: &right_path,
    };

    let report = if is_dir {
        compare::compare_dir(left, right).await
    } else {
        compare::compare_file(left, right).await
    };
    match report {
        Ok(text) => {
            println!("{text}");
            0
        }
        Err(e) => fail(&e.to_string()),
    }
}

/// Resolve a backend and run one operation against it, flattening transport
/// errors into printable strings.
async fn with_backend<F, Fut>(
    router: &BackendRouter,
    host: Option<&str>,
    op: F,
) -> Result<RpcResult, String>
where
    F: FnOnce(Box<dyn hostlink::ExecutionBackend>) -> Fut,
    Fut: std::future::Future<Output = Result<RpcResult, hostlink::HostError>>,
{
    let backend = router.resolve(host).await.map_err(|e| e.to_string())?;
    op(backend).await.map_err(|e| e.to_string())
}

/// Print a successful result with `on_success`, or the error, and turn the
/// outcome into a process exit code.
fn finish(outcome: Result<RpcResult, String>, on_success: impl FnOnce(RpcResult)) -> i32 {
    match outcome {
        Ok(result) if result.success => {
            on_success(result);
            0
        }
        Ok(result) => fail(&result.error.unwrap_or_else(|| "operation failed".into())),
        Err(e) => fail(&e),
    }
}

fn print_exec(result: &RpcResult) -> i32 {
    if let Some(output) = &result.output {
        print!("{output}");
        if !output.ends_with('\n') && !output.is_empty() {
            println!();
        }
    }
    if !result.success {
        if let Some(error) = &result.error {
            eprintln!("{error}");
        }
    }
    result.exit_code.unwrap_or(i32::from(!result.success))
}

fn fail(message: &str) -> i32 {
    eprintln!("error: {message}");
    1
}
