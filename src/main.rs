//! storage-adapter command-line entry point

use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use async_stream::try_stream;
use bytes::BytesMut;
use futures::StreamExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use storage_adapter::backend::{DataStream, FilesystemBackend};
use storage_adapter::config::Config;
use storage_adapter::error::{AdapterError, Result};
use storage_adapter::registry::{self, BackendRegistry};

/// Print usage information
fn print_usage() {
    eprintln!("Usage: storage-adapter <config.yaml> <connection> <command> [args]");
    eprintln!();
    eprintln!("storage-adapter - filesystem operations over object stores and workspaces");
    eprintln!();
    eprintln!("Commands:");
    eprintln!("  ls PATH         List a directory");
    eprintln!("  cat PATH        Write a file to stdout");
    eprintln!("  put PATH        Store stdin as a file");
    eprintln!("  mkdir PATH      Create a directory");
    eprintln!("  rm PATH         Delete a file, or a directory (trailing /) recursively");
    eprintln!("  mv FROM TO      Rename a file");
    eprintln!("  touch PATH      Create an empty file");
    eprintln!("  caps PATH       Show capability flags of a path");
    eprintln!("  form            Show the login form of the connection's backend type");
    eprintln!();
    eprintln!("Example:");
    eprintln!("  storage-adapter /etc/storage-adapter/config.yaml archive ls /my-bucket/");
}

fn stdin_stream() -> DataStream {
    Box::pin(try_stream! {
        let mut stdin = tokio::io::stdin();
        loop {
            let mut buffer = BytesMut::with_capacity(64 * 1024);
            let read = stdin.read_buf(&mut buffer).await.map_err(AdapterError::from)?;
            if read == 0 {
                break;
            }
            yield buffer.freeze();
        }
    })
}

fn format_mtime(mtime: Option<SystemTime>) -> String {
    mtime
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .and_then(|d| chrono::DateTime::from_timestamp(d.as_secs() as i64, 0))
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn arg<'a>(args: &'a [String], index: usize, command: &str) -> Result<&'a str> {
    args.get(index).map(String::as_str).ok_or_else(|| {
        AdapterError::Validation(format!("{}: missing argument {}", command, index + 1))
    })
}

/// Run one operation against a backend
async fn run(backend: &dyn FilesystemBackend, command: &str, args: &[String]) -> Result<()> {
    debug!("running {} {:?}", command, args);
    match command {
        "ls" => {
            for entry in backend.list(arg(args, 0, command)?).await? {
                let kind = if entry.is_dir() { 'd' } else { '-' };
                let size = entry
                    .size
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{} {:>12} {} {}",
                    kind,
                    size,
                    format_mtime(entry.mtime),
                    entry.name
                );
            }
        }
        "cat" => {
            let mut body = backend.read(arg(args, 0, command)?).await?;
            let mut stdout = tokio::io::stdout();
            while let Some(chunk) = body.next().await {
                stdout.write_all(&chunk?).await?;
            }
            stdout.flush().await?;
        }
        "put" => backend.write(arg(args, 0, command)?, stdin_stream()).await?,
        "mkdir" => backend.create_dir(arg(args, 0, command)?).await?,
        "rm" => backend.delete(arg(args, 0, command)?).await?,
        "mv" => {
            backend
                .rename(arg(args, 0, command)?, arg(args, 1, command)?)
                .await?
        }
        "touch" => backend.touch(arg(args, 0, command)?).await?,
        "caps" => {
            let caps = backend.capabilities(arg(args, 0, command)?);
            let yaml = serde_yaml::to_string(&caps)
                .map_err(|e| AdapterError::Upstream(e.to_string()))?;
            print!("{}", yaml);
        }
        other => {
            return Err(AdapterError::Unimplemented(format!(
                "unknown command: {}",
                other
            )))
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    // Parse arguments
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 4 {
        print_usage();
        std::process::exit(1);
    }

    let config_path = PathBuf::from(&args[1]);
    let connection_name = &args[2];
    let command = args[3].as_str();

    // Load configuration
    let config = match Config::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    // Validate configuration
    if let Err(e) = config.validate() {
        eprintln!("Configuration error: {}", e);
        std::process::exit(1);
    }

    // Initialize logging; stdout carries file content
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    info!("Loaded configuration from {:?}", config_path);

    let registry = registry::install(BackendRegistry::from_config(&config))?;

    let Some(connection) = config.connection(connection_name) else {
        eprintln!("Unknown connection: {}", connection_name);
        std::process::exit(1);
    };

    if command == "form" {
        let form = registry.login_form(&connection.backend_type)?;
        print!("{}", serde_yaml::to_string(&form)?);
        return Ok(());
    }

    let backend = match registry
        .init(&connection.backend_type, &connection.params)
        .await
    {
        Ok(b) => b,
        Err(e) => {
            error!("Failed to initialise connection {}: {}", connection_name, e);
            eprintln!("{} (status {})", e, e.status_code());
            std::process::exit(1);
        }
    };

    if let Err(e) = run(backend.as_ref(), command, &args[4..]).await {
        error!("{} failed: {}", command, e);
        eprintln!("{} (status {})", e, e.status_code());
        std::process::exit(1);
    }

    Ok(())
}
