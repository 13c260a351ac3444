//! Command-line entry point: `genca` mints the fake root CA files, `run`
//! serves the intercepting proxy until `/quitquitquit`.

use clap::{Parser, Subcommand};
use hostmasq::{ConnectProxy, FakeCa, HostRouter};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

#[derive(Parser)]
#[command(name = "hostmasq", about = "TLS-intercepting CONNECT proxy for local web-app development")]
struct Cli {
  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand)]
enum Command {
  /// Generate fake CA certificate and private key files
  Genca {
    /// Fake CA certificate output file
    #[arg(long)]
    cert: PathBuf,

    /// Fake CA private key output file
    #[arg(long)]
    key: PathBuf,
  },

  /// Run the proxy
  Run {
    /// HTTP CONNECT proxy address
    #[arg(long, default_value = "127.0.0.1:9999")]
    addr: String,

    /// Fake CA certificate file
    #[arg(long)]
    cert: PathBuf,

    /// Fake CA private key file
    #[arg(long)]
    key: PathBuf,

    /// Redirect host pair '<remote>,<local>' (repeatable)
    #[arg(long = "host-pair")]
    host_pairs: Vec<String>,

    /// Path prefix to forward '<remote>,<prefix>' (repeatable)
    #[arg(long = "prefix-pair")]
    prefix_pairs: Vec<String>,
  },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
  let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("hostmasq=info"));
  tracing_subscriber::fmt().with_env_filter(env_filter).init();

  tokio_rustls::rustls::crypto::ring::default_provider()
    .install_default()
    .map_err(|_| "failed to install crypto provider")?;

  match Cli::parse().command {
    Command::Genca { cert, key } => genca(&cert, &key),
    Command::Run {
      addr,
      cert,
      key,
      host_pairs,
      prefix_pairs,
    } => run(&addr, &cert, &key, &host_pairs, &prefix_pairs).await,
  }
}

fn genca(cert_path: &Path, key_path: &Path) -> Result<(), Box<dyn std::error::Error>> {
  for path in [cert_path, key_path] {
    if let Some(parent) = path.parent() {
      if !parent.as_os_str().is_empty() {
        fs::create_dir_all(parent)?;
      }
    }
  }

  let ca = FakeCa::generate()?;
  fs::write(key_path, ca.key_pem())?;
  fs::write(cert_path, ca.cert_pem())?;

  #[cfg(unix)]
  {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = fs::metadata(key_path)?.permissions();
    perms.set_mode(0o600);
    fs::set_permissions(key_path, perms)?;
  }

  tracing::info!("wrote CA certificate to {}", cert_path.display());
  tracing::info!("wrote CA private key to {}", key_path.display());
  Ok(())
}

async fn run(
  addr: &str,
  cert_path: &Path,
  key_path: &Path,
  host_pairs: &[String],
  prefix_pairs: &[String],
) -> Result<(), Box<dyn std::error::Error>> {
  let key_pem = fs::read_to_string(key_path)?;
  let cert_pem = fs::read_to_string(cert_path)?;
  let ca = FakeCa::from_pem(&key_pem, &cert_pem)?;

  let router = HostRouter::from_flags(host_pairs, prefix_pairs);

  let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
  let proxy = Arc::new(ConnectProxy::new(ca, router, shutdown_tx));

  let listener = TcpListener::bind(addr).await?;
  tracing::info!("starting proxy server at {}", addr);

  loop {
    tokio::select! {
      _ = shutdown_rx.recv() => {
        tracing::info!("shutdown requested, stopping listener");
        break;
      }
      accepted = listener.accept() => {
        match accepted {
          Ok((stream, peer)) => {
            let proxy = proxy.clone();
            tokio::spawn(async move {
              if let Err(e) = proxy.handle_connection(stream).await {
                tracing::debug!("connection from {} ended with error: {}", peer, e);
              }
            });
          }
          Err(e) => tracing::error!("failed to accept connection: {}", e),
        }
      }
    }
  }

  Ok(())
}
