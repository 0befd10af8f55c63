//! # zkherd CLI Entry Point
//!
//! Runs the supervisor next to a ZooKeeper server, and talks to running
//! supervisors from the shell.
//!
//! ## Usage
//!
//! ```bash
//! # Supervise the local ZooKeeper server, sharing config through a directory
//! zkherd run --hostname zk1 --config-dir /mnt/shared/zkherd --defaults zk.properties
//!
//! # Ensemble status as JSON
//! zkherd status http://zk1:8181
//!
//! # Roll out a new server list, then watch it
//! zkherd rolling http://zk1:8181 --servers "1:zk1,2:zk2,3:zk3"
//! zkherd rolling http://zk1:8181
//!
//! # Any cluster method (outputs raw JSON)
//! zkherd call http://zk1:8181 four_letter_word -a '{"word": "mntr"}'
//! ```

use anyhow::Result;
use argh::FromArgs;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use zkherd_client::ZkherdClient;
use zkherd_common::protocol::ClusterMethod;
use zkherd_core::config::properties::decode_defaults;
use zkherd_core::{
    ConfigStore, FileSystemConfigStore, MemoryConfigStore, Supervisor, SupervisorConfig,
    DEFAULT_PEER_PORT,
};
use zkherd_server::HttpServer;

fn validate_http_url(url: &str, description: &str) -> Result<()> {
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(())
    } else {
        Err(anyhow::anyhow!(
            "Invalid {}: '{}' must start with http:// or https://",
            description,
            url
        ))
    }
}

#[derive(FromArgs)]
/// zkherd - ZooKeeper ensemble supervisor
struct Cli {
    #[argh(subcommand)]
    command: Commands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Run(RunArgs),
    Status(StatusArgs),
    Rolling(RollingArgs),
    Call(CallArgs),
}

/// Arguments for running a supervisor.
///
/// Every instance of an ensemble must point at the same shared config
/// location. Without `--config-dir` the config lives in memory, which is
/// only useful for a single instance.
#[derive(FromArgs)]
#[argh(subcommand, name = "run")]
/// supervise the local ZooKeeper server
struct RunArgs {
    /// address to bind the HTTP server to
    #[argh(option, short = 'b', default = "\"0.0.0.0:8181\".into()")]
    bind: String,

    /// this instance's hostname as it appears in the server list
    ///
    /// Falls back to the ZKHERD_HOSTNAME env var.
    #[argh(option)]
    hostname: Option<String>,

    /// shared directory holding the config and heartbeats
    ///
    /// Falls back to the ZKHERD_CONFIG_DIR env var.
    #[argh(option, long = "config-dir")]
    config_dir: Option<PathBuf>,

    /// properties file used to seed an empty config store
    #[argh(option)]
    defaults: Option<PathBuf>,

    /// port peers are reached on
    #[argh(option, long = "peer-port", default = "DEFAULT_PEER_PORT")]
    peer_port: u16,

    /// directory listed by the backups view
    #[argh(option, long = "backup-dir")]
    backup_dir: Option<PathBuf>,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "status")]
/// print the status of every ensemble member
struct StatusArgs {
    /// address of any supervisor in the ensemble
    #[argh(positional)]
    server_address: String,
}

/// Arguments for the `rolling` command.
///
/// With `--servers`, starts a rolling change to that server list. With
/// `--cancel`, stops the one in progress. With neither, prints its state.
#[derive(FromArgs)]
#[argh(subcommand, name = "rolling")]
/// start, cancel or inspect a rolling config change
struct RollingArgs {
    /// address of any supervisor in the ensemble
    #[argh(positional)]
    server_address: String,

    /// new server list, e.g. "1:zk1,2:zk2,O:3:zk3"
    #[argh(option)]
    servers: Option<String>,

    /// cancel the rolling change: "rollback" or "force-commit"
    #[argh(option)]
    cancel: Option<String>,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "call")]
/// call a cluster method on a supervisor
struct CallArgs {
    /// address of the supervisor to call
    #[argh(positional)]
    server_address: String,

    /// name of the method to call
    #[argh(positional)]
    method: String,

    /// JSON string containing the method parameters
    #[argh(option, short = 'a', long = "args", default = "\"{}\".into()")]
    args: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    // Client commands print JSON only
    if matches!(cli.command, Commands::Run(_)) {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    match cli.command {
        Commands::Run(args) => run_supervisor(args).await,
        Commands::Status(args) => {
            let result = call(&args.server_address, ClusterMethod::ClusterStatus, json!({})).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
        Commands::Rolling(args) => run_rolling(args).await,
        Commands::Call(args) => run_call(args).await,
    }
}

async fn run_supervisor(args: RunArgs) -> Result<()> {
    let hostname = args
        .hostname
        .or_else(|| std::env::var("ZKHERD_HOSTNAME").ok())
        .ok_or_else(|| anyhow::anyhow!("No hostname: pass --hostname or set ZKHERD_HOSTNAME"))?;
    let addr: SocketAddr = args
        .bind
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid bind address {}: {}", args.bind, e))?;

    let store: ConfigStore = match args
        .config_dir
        .or_else(|| std::env::var_os("ZKHERD_CONFIG_DIR").map(PathBuf::from))
    {
        Some(dir) => {
            tracing::info!("Using shared config directory {}", dir.display());
            FileSystemConfigStore::new(dir).into()
        }
        None => {
            tracing::warn!("No config directory given; config is kept in memory");
            MemoryConfigStore::new().into()
        }
    };

    let mut settings = SupervisorConfig::new(hostname.clone());
    settings.peer_port = args.peer_port;
    settings.backup_dir = args.backup_dir;

    let supervisor = Arc::new(Supervisor::new(settings, store).await?);

    if let Some(path) = &args.defaults {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path.display(), e))?;
        let defaults = decode_defaults(&text)?;
        if supervisor.config_manager().seed_if_empty(defaults).await? {
            tracing::info!("Seeded config store from {}", path.display());
        }
    }

    tracing::info!("Starting zkherd for {} on {}", hostname, addr);
    supervisor.start();

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind to {}: {}", addr, e))?;
    let server = HttpServer::new(supervisor.clone());
    server
        .serve(listener, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
        })
        .await?;

    tracing::info!("Shutting down");
    supervisor.shutdown().await;
    Ok(())
}

async fn run_rolling(args: RollingArgs) -> Result<()> {
    let (method, params) = match (&args.servers, &args.cancel) {
        (Some(_), Some(_)) => {
            return Err(anyhow::anyhow!("--servers and --cancel are mutually exclusive"))
        }
        (Some(servers), None) => (
            ClusterMethod::StartRollingConfig,
            json!({"config": {"servers-spec": servers}}),
        ),
        (None, Some(mode)) => (ClusterMethod::CancelRollingConfig, json!({"mode": mode})),
        (None, None) => (ClusterMethod::RollingState, json!({})),
    };
    let result = call(&args.server_address, method, params).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

async fn run_call(args: CallArgs) -> Result<()> {
    validate_http_url(&args.server_address, "server address")?;

    let params: Value = serde_json::from_str(&args.args)
        .map_err(|e| anyhow::anyhow!("Invalid JSON in args: {}", e))?;

    let client = ZkherdClient::new(&args.server_address);
    let result = client.call(&args.method, params).await?;

    println!("{}", serde_json::to_string(&result)?);
    Ok(())
}

async fn call(server_address: &str, method: ClusterMethod, params: Value) -> Result<Value> {
    validate_http_url(server_address, "server address")?;
    let client = ZkherdClient::new(server_address);
    Ok(client.call(method.as_str(), params).await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_run_defaults() {
        let args: Cli = Cli::from_args(&["zkherd"], &["run", "--hostname", "zk1"]).unwrap();
        match args.command {
            Commands::Run(RunArgs {
                bind,
                hostname,
                config_dir,
                defaults,
                peer_port,
                backup_dir,
            }) => {
                assert_eq!(bind, "0.0.0.0:8181");
                assert_eq!(hostname, Some("zk1".to_string()));
                assert!(config_dir.is_none());
                assert!(defaults.is_none());
                assert_eq!(peer_port, 8181);
                assert!(backup_dir.is_none());
            }
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_cli_parse_run_full() {
        let args: Cli = Cli::from_args(
            &["zkherd"],
            &[
                "run",
                "-b", "127.0.0.1:9000",
                "--config-dir", "/mnt/shared",
                "--defaults", "zk.properties",
                "--peer-port", "9000",
                "--backup-dir", "/backups",
            ],
        )
        .unwrap();
        match args.command {
            Commands::Run(RunArgs {
                bind,
                hostname,
                config_dir,
                defaults,
                peer_port,
                backup_dir,
            }) => {
                assert_eq!(bind, "127.0.0.1:9000");
                assert!(hostname.is_none());
                assert_eq!(config_dir, Some(PathBuf::from("/mnt/shared")));
                assert_eq!(defaults, Some(PathBuf::from("zk.properties")));
                assert_eq!(peer_port, 9000);
                assert_eq!(backup_dir, Some(PathBuf::from("/backups")));
            }
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_cli_parse_status() {
        let args: Cli = Cli::from_args(&["zkherd"], &["status", "http://zk1:8181"]).unwrap();
        match args.command {
            Commands::Status(StatusArgs { server_address }) => {
                assert_eq!(server_address, "http://zk1:8181");
            }
            _ => panic!("Expected Status command"),
        }
    }

    #[test]
    fn test_cli_parse_rolling() {
        let args: Cli = Cli::from_args(
            &["zkherd"],
            &["rolling", "http://zk1:8181", "--servers", "1:zk1,2:zk2"],
        )
        .unwrap();
        match args.command {
            Commands::Rolling(RollingArgs {
                server_address,
                servers,
                cancel,
            }) => {
                assert_eq!(server_address, "http://zk1:8181");
                assert_eq!(servers, Some("1:zk1,2:zk2".to_string()));
                assert!(cancel.is_none());
            }
            _ => panic!("Expected Rolling command"),
        }
    }

    #[test]
    fn test_cli_parse_call_with_short_args() {
        let args: Cli = Cli::from_args(
            &["zkherd"],
            &["call", "http://zk1:8181", "four_letter_word", "-a", "{\"word\":\"ruok\"}"],
        )
        .unwrap();
        match args.command {
            Commands::Call(CallArgs {
                server_address,
                method,
                args,
            }) => {
                assert_eq!(server_address, "http://zk1:8181");
                assert_eq!(method, "four_letter_word");
                assert_eq!(args, "{\"word\":\"ruok\"}");
            }
            _ => panic!("Expected Call command"),
        }
    }

    #[test]
    fn test_cli_parse_call_default_args() {
        let args: Cli = Cli::from_args(&["zkherd"], &["call", "http://zk1:8181", "state"]).unwrap();
        match args.command {
            Commands::Call(CallArgs { args, .. }) => assert_eq!(args, "{}"),
            _ => panic!("Expected Call command"),
        }
    }

    #[test]
    fn test_validate_http_url() {
        assert!(validate_http_url("http://zk1:8181", "server address").is_ok());
        assert!(validate_http_url("https://zk1", "server address").is_ok());
        assert!(validate_http_url("zk1:8181", "server address").is_err());
    }

    #[tokio::test]
    async fn test_rolling_flags_are_exclusive() {
        let args = RollingArgs {
            server_address: "http://127.0.0.1:1".into(),
            servers: Some("1:a".into()),
            cancel: Some("rollback".into()),
        };
        assert!(run_rolling(args).await.is_err());
    }
}
