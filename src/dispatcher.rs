//! HTTP CONNECT front door
//!
//! Accepts every inbound connection on the public listener. CONNECT requests
//! for a mapped production host get a lazily created [`TlsTerminator`] and a
//! raw byte tunnel to it; unmapped CONNECTs tunnel straight to the requested
//! host. Non-CONNECT requests only exist to bounce a dev-server URL to its
//! production HTTPS equivalent.

use crate::ca::{FakeCa, LeafCert};
use crate::error::{Error, Result};
use crate::router::HostRouter;
use crate::terminator::TlsTerminator;
use http::{Method, StatusCode};
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;

/// Reserved path that triggers graceful shutdown regardless of host
pub const SHUTDOWN_PATH: &str = "/quitquitquit";

/// 16KB max for the request head on the plain-HTTP listener
const MAX_HEAD_SIZE: usize = 16 * 1024;

/// Lazily created state for one intercepted domain, keyed by the local host.
/// Inserted exactly once and kept for the life of the process.
pub struct DomainProxyRecord {
  pub addr: SocketAddr,
  pub leaf: LeafCert,
  #[allow(dead_code)]
  task: JoinHandle<()>,
}

#[derive(Debug, PartialEq, Eq)]
struct RequestHead {
  method: Method,
  target: String,
  host: Option<String>,
}

/// The CONNECT-handling proxy server.
pub struct ConnectProxy {
  ca: FakeCa,
  router: HostRouter,
  proxies: RwLock<HashMap<String, DomainProxyRecord>>,
  shutdown: mpsc::Sender<()>,
}

impl ConnectProxy {
  pub fn new(ca: FakeCa, router: HostRouter, shutdown: mpsc::Sender<()>) -> Self {
    Self {
      ca,
      router,
      proxies: RwLock::new(HashMap::new()),
      shutdown,
    }
  }

  /// Handle one accepted client connection end to end.
  pub async fn handle_connection(&self, stream: TcpStream) -> Result<()> {
    let (mut stream, head) = read_request(stream).await?;

    if head.method != Method::CONNECT
      && split_target(&head.target).1.split('?').next() == Some(SHUTDOWN_PATH)
    {
      // Never block the handler on a shutdown already in progress.
      let _ = self.shutdown.try_send(());
      write_response(&mut stream, StatusCode::OK, &[], "").await?;
      return Ok(());
    }

    if head.method != Method::CONNECT {
      return self.redirect_to_https(stream, &head).await;
    }

    self.handle_connect(stream, &head.target).await
  }

  /// Redirect a request for the dev server's own URL to the production host
  /// it masquerades as, upgrading the scheme.
  async fn redirect_to_https(&self, mut stream: TcpStream, head: &RequestHead) -> Result<()> {
    let (authority, path) = split_target(&head.target);
    let host = head.host.as_deref().or(authority).unwrap_or("");
    if let Some(remote) = self.router.remote_for_local(host) {
      let location = format!("https://{}{}", remote, path);
      tracing::info!(
        "{:<8} REDIRECT {} {} => {}",
        head.method.as_str(),
        host,
        path,
        location
      );
      return write_response(
        &mut stream,
        StatusCode::TEMPORARY_REDIRECT,
        &[("Location", &location)],
        "",
      )
      .await;
    }

    write_response(
      &mut stream,
      StatusCode::METHOD_NOT_ALLOWED,
      &[],
      &format!("{:<8} ERROR    {} {}", head.method.as_str(), host, path),
    )
    .await
  }

  /// Resolve the tunnel target for a CONNECT host: `None` means no
  /// interception, tunnel straight to the requested host.
  ///
  /// Safe under concurrent first-requests for the same domain: the common
  /// path is a shared read, and creation re-checks under the write lock so at
  /// most one terminator is ever started per local key. A failure here leaves
  /// the table untouched for future attempts.
  pub async fn ensure_domain_proxy(&self, remote_host: &str) -> Result<Option<SocketAddr>> {
    let Some(local) = self.router.local_for_remote(remote_host) else {
      return Ok(None);
    };

    if let Some(record) = self.proxies.read().await.get(local) {
      return Ok(Some(record.addr));
    }

    let mut proxies = self.proxies.write().await;
    if let Some(record) = proxies.get(local) {
      return Ok(Some(record.addr));
    }

    let hostname = remote_host
      .rsplit_once(':')
      .map(|(host, _)| host)
      .unwrap_or(remote_host)
      .to_string();
    let leaf = self.ca.issue(&[hostname])?;

    let terminator = TlsTerminator::new(
      &leaf,
      local,
      remote_host,
      self.router.prefixes_for(remote_host).to_vec(),
    )?;
    let (addr, task) = terminator.start().await?;
    tracing::info!(
      "started terminating proxy for {} (masquerade {}) at {}",
      remote_host,
      local,
      addr
    );

    proxies.insert(local.to_string(), DomainProxyRecord { addr, leaf, task });
    Ok(Some(addr))
  }

  async fn handle_connect(&self, mut stream: TcpStream, target: &str) -> Result<()> {
    tracing::info!("{:<8} PROXY    {}", Method::CONNECT.as_str(), target);

    let remote_addr = match self.ensure_domain_proxy(target).await {
      Ok(Some(addr)) => {
        tracing::info!("{:<8} FORWARD  {} => {}", Method::CONNECT.as_str(), target, addr);
        addr.to_string()
      }
      Ok(None) => target.to_string(),
      Err(e) => {
        write_response(&mut stream, StatusCode::SERVICE_UNAVAILABLE, &[], &e.to_string())
          .await
          .ok();
        return Err(e);
      }
    };

    tracing::debug!("{:<8} DIAL     {} => {}", Method::CONNECT.as_str(), target, remote_addr);
    let upstream = match TcpStream::connect(&remote_addr).await {
      Ok(upstream) => upstream,
      Err(e) => {
        let err = Error::connection(format!("Failed to dial {}: {}", remote_addr, e));
        write_response(&mut stream, StatusCode::SERVICE_UNAVAILABLE, &[], &err.to_string())
          .await
          .ok();
        return Err(err);
      }
    };

    stream
      .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
      .await?;
    stream.flush().await?;

    tunnel(stream, upstream).await;
    Ok(())
  }

  /// Number of domain proxies created so far.
  pub async fn proxy_count(&self) -> usize {
    self.proxies.read().await.len()
  }
}

/// Bridge two TCP streams until either side is exhausted or errors.
///
/// Each direction runs as its own task: copy until EOF, then shut down the
/// write side it owns. The first direction to finish tears the other down as
/// well, so one endpoint closing always ends the full tunnel.
pub async fn tunnel(client: TcpStream, target: TcpStream) {
  let (client_read, client_write) = client.into_split();
  let (target_read, target_write) = target.into_split();

  let mut up = tokio::spawn(relay(client_read, target_write));
  let mut down = tokio::spawn(relay(target_read, client_write));

  tokio::select! {
    _ = &mut up => down.abort(),
    _ = &mut down => up.abort(),
  }
}

async fn relay(mut src: OwnedReadHalf, mut dst: OwnedWriteHalf) {
  let _ = tokio::io::copy(&mut src, &mut dst).await;
  let _ = dst.shutdown().await;
}

/// Split a request target into its authority and path. Clients speaking
/// through a proxy send the absolute form (`http://host:port/path`); the
/// origin form has no authority and passes through as the path.
fn split_target(target: &str) -> (Option<&str>, &str) {
  let Some(rest) = target.strip_prefix("http://") else {
    return (None, target);
  };
  match rest.find('/') {
    Some(idx) => (Some(&rest[..idx]), &rest[idx..]),
    None => (Some(rest), "/"),
  }
}

/// Read the request line and headers off a fresh client connection.
async fn read_request(stream: TcpStream) -> Result<(TcpStream, RequestHead)> {
  let mut reader = BufReader::new(stream);
  let mut lines = Vec::new();
  let mut total = 0usize;
  loop {
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
      break;
    }
    total += n;
    if total > MAX_HEAD_SIZE {
      return Err(Error::invalid_request("Request head exceeds maximum allowed"));
    }
    let line = line.trim_end_matches(['\r', '\n']);
    if line.is_empty() {
      break;
    }
    lines.push(line.to_string());
  }

  let head = head_from_lines(&lines)?;
  Ok((reader.into_inner(), head))
}

fn head_from_lines(lines: &[String]) -> Result<RequestHead> {
  let request_line = lines
    .first()
    .ok_or_else(|| Error::invalid_request("Empty request"))?;
  let parts: Vec<&str> = request_line.split_whitespace().collect();
  if parts.len() < 3 {
    return Err(Error::invalid_request(format!(
      "Invalid request line: {}",
      request_line
    )));
  }

  let method = parts[0]
    .parse::<Method>()
    .map_err(|_| Error::invalid_request(format!("Invalid method: {}", parts[0])))?;

  let host = lines[1..].iter().find_map(|line| {
    let (name, value) = line.split_once(':')?;
    name
      .trim()
      .eq_ignore_ascii_case("host")
      .then(|| value.trim().to_string())
  });

  Ok(RequestHead {
    method,
    target: parts[1].to_string(),
    host,
  })
}

async fn write_response<W>(
  stream: &mut W,
  status: StatusCode,
  headers: &[(&str, &str)],
  body: &str,
) -> Result<()>
where
  W: AsyncWrite + Unpin,
{
  let mut out = format!(
    "HTTP/1.1 {} {}\r\n",
    status.as_u16(),
    status.canonical_reason().unwrap_or("Unknown")
  );
  for (name, value) in headers {
    out.push_str(name);
    out.push_str(": ");
    out.push_str(value);
    out.push_str("\r\n");
  }
  out.push_str(&format!("Content-Length: {}\r\n\r\n{}", body.len(), body));
  stream.write_all(out.as_bytes()).await?;
  stream.flush().await?;
  Ok(())
}
