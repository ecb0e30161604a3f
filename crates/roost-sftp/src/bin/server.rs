//! SFTP gateway daemon.
//!
//! Long-running process: reads the control-plane configuration document,
//! resolves the system user owning tenant files, and serves SFTP until
//! terminated by signal. Startup failures (unreadable configuration,
//! missing system user, bind or host-key errors) exit nonzero.

use std::path::{Path, PathBuf};

use clap::Parser;
use roost_sftp::{config, ControlPlane, CredentialOracle, LogFormat, Server, Settings};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Location of the control plane's configuration document
    #[arg(long, default_value = "./config/core.json")]
    config_path: PathBuf,

    /// Address this server should bind to
    #[arg(long, default_value = "0.0.0.0")]
    bind_addr: String,

    /// Port this server should bind to
    #[arg(short, long, default_value_t = 2022)]
    port: u16,

    /// Serve every tenant in read-only mode
    #[arg(long)]
    readonly: bool,

    /// Disable the disk space check on writes
    #[arg(long)]
    disable_disk_check: bool,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Log output format
    #[arg(long, value_enum, default_value = "json")]
    log_format: LogFormat,

    /// Optional log file (daily rotation); stderr when unset
    #[arg(long)]
    log_file: Option<PathBuf>,
}

fn init_logging(args: &Args) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let level = if args.debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if let Some(log_file) = &args.log_file {
        let directory = log_file.parent().unwrap_or_else(|| Path::new("."));
        let file_name = log_file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "roost-sftp.log".to_string());

        if let Err(e) = std::fs::create_dir_all(directory) {
            eprintln!("failed to create log directory: {e}; falling back to stderr");
        } else {
            let appender = tracing_appender::rolling::daily(directory, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);

            match args.log_format {
                LogFormat::Json => tracing_subscriber::fmt()
                    .json()
                    .with_env_filter(filter)
                    .with_writer(writer)
                    .init(),
                LogFormat::Text => tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_writer(writer)
                    .init(),
            }

            return Some(guard);
        }
    }

    match args.log_format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }

    None
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let _log_guard = init_logging(&args);

    info!(
        event = "starting",
        version = env!("CARGO_PKG_VERSION"),
        config_path = ?args.config_path,
        "starting sftp gateway"
    );

    let control_plane = match ControlPlane::load(&args.config_path) {
        Ok(cp) => cp,
        Err(e) => {
            error!(event = "config_error", error = %e, "could not read configuration");
            std::process::exit(1);
        }
    };

    let token = match control_plane.api_token() {
        Ok(token) => token.to_string(),
        Err(e) => {
            error!(event = "config_error", error = %e, "no usable API key");
            std::process::exit(1);
        }
    };

    let username = control_plane.system_username();
    let owner = match config::lookup_system_user(username) {
        Ok(owner) => owner,
        Err(e) => {
            error!(event = "user_lookup_failed", username, error = %e, "failed to look up system user");
            std::process::exit(1);
        }
    };
    info!(
        event = "system_user",
        username,
        uid = owner.uid,
        gid = owner.gid,
        "using system daemon user"
    );

    let base_path = args
        .config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();

    let settings = Settings {
        bind_address: args.bind_addr,
        bind_port: args.port,
        server_data_folder: base_path.join("servers"),
        data_root: control_plane.data_root(),
        base_path,
        read_only: args.readonly,
        disable_disk_check: args.disable_disk_check,
        owner,
    };

    let oracle = match CredentialOracle::new(control_plane.remote_base(), token) {
        Ok(oracle) => oracle,
        Err(e) => {
            error!(event = "oracle_error", error = %e, "could not build oracle client");
            std::process::exit(1);
        }
    };

    let server = match Server::new(settings, oracle).await {
        Ok(server) => server,
        Err(e) => {
            error!(event = "startup_failed", error = %e, "could not start SFTP server");
            std::process::exit(1);
        }
    };

    if let Err(e) = server.run().await {
        error!(event = "server_error", error = %e, "server exited with error");
        std::process::exit(1);
    }
}
