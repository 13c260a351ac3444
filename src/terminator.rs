//! Per-domain TLS-terminating reverse proxy
//!
//! One `TlsTerminator` exists per intercepted domain. It presents the forged
//! leaf certificate on an ephemeral local port, reads each decrypted HTTP/1.1
//! request head, and relays the connection either to the masquerading dev
//! server (plain HTTP) or to the real production host (TLS) when the request
//! path matches a configured prefix.

use crate::ca::LeafCert;
use crate::error::{Error, Result};
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::rustls::crypto::{ring, CryptoProvider};
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{version, CipherSuite, ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// Cap on the decrypted request head, mirroring the dispatcher's limit
const MAX_HEAD_SIZE: usize = 16 * 1024;

/// Explicit cipher preference, ECDHE-RSA-AES256-GCM first. Forged leaves
/// carry ECDSA keys, so against them TLS 1.2 clients negotiate the ECDSA
/// variant; the RSA suite only matches a cert loaded with an RSA key. The
/// TLS 1.3 suites are required for the TLS 1.3 half of the version range.
const PREFERRED_SUITES: [CipherSuite; 4] = [
  CipherSuite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
  CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
  CipherSuite::TLS13_AES_256_GCM_SHA384,
  CipherSuite::TLS13_CHACHA20_POLY1305_SHA256,
];

fn pinned_provider() -> CryptoProvider {
  let base = ring::default_provider();
  let suites = PREFERRED_SUITES
    .iter()
    .filter_map(|want| {
      base
        .cipher_suites
        .iter()
        .copied()
        .find(|suite| suite.suite() == *want)
    })
    .collect();

  let mut provider = base;
  provider.cipher_suites = suites;
  provider
}

/// TLS reverse proxy for one intercepted domain.
pub struct TlsTerminator {
  acceptor: TlsAcceptor,
  connector: TlsConnector,
  masquerade_host: String,
  passthrough_host: String,
  prefixes: Vec<String>,
}

impl TlsTerminator {
  /// Build a terminator from a forged leaf, the masquerading dev host, the
  /// real production host, and the prefixes that must pass through to it.
  pub fn new(
    leaf: &LeafCert,
    masquerade_host: impl Into<String>,
    passthrough_host: impl Into<String>,
    prefixes: Vec<String>,
  ) -> Result<Self> {
    let (cert_chain, key) = leaf.to_der()?;

    let server_config = ServerConfig::builder_with_provider(Arc::new(pinned_provider()))
      .with_protocol_versions(&[&version::TLS13, &version::TLS12])
      .map_err(|e| Error::tls(format!("Failed to pin TLS versions: {}", e)))?
      .with_no_client_auth()
      .with_single_cert(cert_chain, key)
      .map_err(|e| Error::tls(format!("Failed to create TLS server config: {}", e)))?;

    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let client_config = ClientConfig::builder_with_provider(Arc::new(ring::default_provider()))
      .with_safe_default_protocol_versions()
      .map_err(|e| Error::tls(format!("Failed to create TLS client config: {}", e)))?
      .with_root_certificates(roots)
      .with_no_client_auth();

    Ok(Self {
      acceptor: TlsAcceptor::from(Arc::new(server_config)),
      connector: TlsConnector::from(Arc::new(client_config)),
      masquerade_host: masquerade_host.into(),
      passthrough_host: passthrough_host.into(),
      prefixes,
    })
  }

  /// Bind an ephemeral local listener and serve in the background. Returns
  /// the bound address once listening has begun; there is no stop operation,
  /// the task lives until process exit.
  pub async fn start(self) -> Result<(SocketAddr, JoinHandle<()>)> {
    let listener = TcpListener::bind("127.0.0.1:0")
      .await
      .map_err(|e| Error::connection(format!("Failed to bind terminator listener: {}", e)))?;
    let addr = listener.local_addr()?;

    let terminator = Arc::new(self);
    let task = tokio::spawn(async move {
      loop {
        match listener.accept().await {
          Ok((stream, _)) => {
            let terminator = terminator.clone();
            tokio::spawn(async move {
              if let Err(e) = terminator.handle_connection(stream).await {
                tracing::debug!("terminator connection error: {}", e);
              }
            });
          }
          Err(e) => {
            tracing::error!("terminator accept failed: {}", e);
          }
        }
      }
    });

    Ok((addr, task))
  }

  async fn handle_connection(self: Arc<Self>, stream: TcpStream) -> Result<()> {
    let tls_stream = self
      .acceptor
      .accept(stream)
      .await
      .map_err(|e| Error::tls(format!("TLS handshake failed: {}", e)))?;

    let mut reader = BufReader::new(tls_stream);
    let head = read_head(&mut reader).await?;
    let path = head
      .first()
      .and_then(|line| line.split_whitespace().nth(1))
      .unwrap_or("/");

    let passthrough = matches_prefix(&self.prefixes, path);
    let outbound_head = rewrite_head(&head, &self.passthrough_host);

    // Body bytes the reader may have buffered past the head still belong to
    // the upstream.
    let leftover = Bytes::copy_from_slice(reader.buffer());
    let client = reader.into_inner();

    if passthrough {
      tracing::info!("NEXT     {} PATH {}", self.passthrough_host, path);
      let (host, addr) = split_host_port(&self.passthrough_host, 443);
      let tcp = TcpStream::connect(&addr)
        .await
        .map_err(|e| Error::connection(format!("Failed to connect to {}: {}", addr, e)))?;
      let server_name = ServerName::try_from(host.clone())
        .map_err(|_| Error::tls(format!("Invalid upstream server name: {}", host)))?;
      let mut upstream = self
        .connector
        .connect(server_name, tcp)
        .await
        .map_err(|e| Error::tls(format!("Upstream TLS handshake with {} failed: {}", host, e)))?;
      send_head(&mut upstream, &outbound_head, &leftover).await?;
      bridge(client, upstream).await;
    } else {
      tracing::debug!("MASQ     {} PATH {}", self.masquerade_host, path);
      let (_, addr) = split_host_port(&self.masquerade_host, 80);
      let mut upstream = TcpStream::connect(&addr)
        .await
        .map_err(|e| Error::connection(format!("Failed to connect to {}: {}", addr, e)))?;
      send_head(&mut upstream, &outbound_head, &leftover).await?;
      bridge(client, upstream).await;
    }

    Ok(())
  }
}

/// Literal string-prefix test, no globbing.
fn matches_prefix(prefixes: &[String], path: &str) -> bool {
  prefixes.iter().any(|prefix| path.starts_with(prefix.as_str()))
}

/// Read request-line plus header lines up to the blank separator, without
/// line terminators.
async fn read_head<R>(reader: &mut BufReader<R>) -> Result<Vec<String>>
where
  R: AsyncRead + Unpin,
{
  let mut head = Vec::new();
  let mut total = 0usize;
  loop {
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
      return Err(Error::invalid_request("Connection closed before request head"));
    }
    total += n;
    if total > MAX_HEAD_SIZE {
      return Err(Error::invalid_request("Request head exceeds maximum allowed"));
    }
    let line = line.trim_end_matches(['\r', '\n']);
    if line.is_empty() {
      break;
    }
    head.push(line.to_string());
  }
  if head.is_empty() {
    return Err(Error::invalid_request("Empty request head"));
  }
  Ok(head)
}

/// Rebuild the request head for the upstream: `Host` becomes the pass-through
/// host (otherwise the backend sees the intercepted domain and its redirects
/// loop back into this proxy), and `Connection: close` is forced so one
/// connection carries one request.
fn rewrite_head(head: &[String], host: &str) -> Vec<u8> {
  let mut out = String::with_capacity(MAX_HEAD_SIZE.min(1024));
  out.push_str(&head[0]);
  out.push_str("\r\n");
  out.push_str("Host: ");
  out.push_str(host);
  out.push_str("\r\nConnection: close\r\n");
  for line in &head[1..] {
    let name = line.split(':').next().unwrap_or("");
    if name.eq_ignore_ascii_case("host")
      || name.eq_ignore_ascii_case("connection")
      || name.eq_ignore_ascii_case("proxy-connection")
    {
      continue;
    }
    out.push_str(line);
    out.push_str("\r\n");
  }
  out.push_str("\r\n");
  out.into_bytes()
}

fn split_host_port(host: &str, default_port: u16) -> (String, String) {
  match host.rsplit_once(':') {
    Some((name, port)) if port.parse::<u16>().is_ok() => {
      (name.to_string(), host.to_string())
    }
    _ => (host.to_string(), format!("{}:{}", host, default_port)),
  }
}

async fn send_head<W>(upstream: &mut W, head: &[u8], leftover: &[u8]) -> Result<()>
where
  W: AsyncWrite + Unpin,
{
  upstream.write_all(head).await?;
  if !leftover.is_empty() {
    upstream.write_all(leftover).await?;
  }
  upstream.flush().await?;
  Ok(())
}

/// Relay remaining bytes both ways until either side finishes. Each
/// direction shuts down its destination on EOF so a TLS peer receives
/// close_notify; the first direction done tears the other down.
async fn bridge<A, B>(a: A, b: B)
where
  A: AsyncRead + AsyncWrite + Send + Unpin + 'static,
  B: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
  let (mut a_read, mut a_write) = tokio::io::split(a);
  let (mut b_read, mut b_write) = tokio::io::split(b);

  let mut a_to_b = tokio::spawn(async move {
    let _ = tokio::io::copy(&mut a_read, &mut b_write).await;
    let _ = b_write.shutdown().await;
  });
  let mut b_to_a = tokio::spawn(async move {
    let _ = tokio::io::copy(&mut b_read, &mut a_write).await;
    let _ = a_write.shutdown().await;
  });

  tokio::select! {
    _ = &mut a_to_b => b_to_a.abort(),
    _ = &mut b_to_a => a_to_b.abort(),
  }
}
