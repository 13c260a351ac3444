//! Integration tests for hostmasq

use hostmasq::{tunnel, ConnectProxy, FakeCa, HostRouter, TlsTerminator};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

fn install_provider() {
  tokio_rustls::rustls::crypto::ring::default_provider()
    .install_default()
    .ok();
}

fn test_router() -> HostRouter {
  HostRouter::from_flags(
    &["masq.test:443,127.0.0.1:7777".to_string()],
    &["masq.test:443,/api".to_string()],
  )
}

/// Serve a ConnectProxy on an ephemeral port, returning its address.
async fn serve_proxy(proxy: Arc<ConnectProxy>) -> std::net::SocketAddr {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  tokio::spawn(async move {
    loop {
      let (stream, _) = match listener.accept().await {
        Ok(accepted) => accepted,
        Err(_) => break,
      };
      let proxy = proxy.clone();
      tokio::spawn(async move {
        let _ = proxy.handle_connection(stream).await;
      });
    }
  });
  addr
}

async fn read_until_eof(stream: &mut (impl AsyncReadExt + Unpin)) -> Vec<u8> {
  let mut out = Vec::new();
  let mut buf = [0u8; 4096];
  loop {
    match stream.read(&mut buf).await {
      Ok(0) => break,
      Ok(n) => out.extend_from_slice(&buf[..n]),
      // A peer may drop without close_notify; what arrived is enough.
      Err(_) => break,
    }
  }
  out
}

#[tokio::test]
async fn ca_round_trip_signs_verifiable_leaves() {
  use x509_parser::pem::parse_x509_pem;
  use x509_parser::prelude::*;

  let original = FakeCa::generate().unwrap();
  let reloaded = FakeCa::from_pem(original.key_pem(), original.cert_pem()).unwrap();
  let leaf = reloaded.issue(&["roundtrip.test".to_string()]).unwrap();

  let (_, root_pem) = parse_x509_pem(original.cert_pem().as_bytes()).unwrap();
  let root = root_pem.parse_x509().unwrap();
  let (_, leaf_pem) = parse_x509_pem(leaf.cert_pem.as_bytes()).unwrap();
  let leaf_cert = leaf_pem.parse_x509().unwrap();

  // The reloaded root must sign leaves that verify against the original
  // in-memory root's public key.
  assert_eq!(
    leaf_cert.issuer().to_string(),
    root.subject().to_string()
  );
  leaf_cert
    .verify_signature(Some(root.public_key()))
    .expect("leaf signature must verify against the original root");

  let san_ext = leaf_cert.subject_alternative_name().unwrap().unwrap();
  let has_dns = san_ext
    .value
    .general_names
    .iter()
    .any(|name| matches!(name, GeneralName::DNSName(dns) if *dns == "roundtrip.test"));
  assert!(has_dns, "leaf must carry the requested DNS SAN");
  let has_loopback = san_ext
    .value
    .general_names
    .iter()
    .any(|name| matches!(name, GeneralName::IPAddress(ip) if *ip == &[127u8, 0, 0, 1][..]));
  assert!(has_loopback, "leaf must carry the loopback IP SAN");
}

#[tokio::test]
async fn concurrent_connects_create_exactly_one_terminator() {
  install_provider();
  let proxy = Arc::new(ConnectProxy::new(
    FakeCa::generate().unwrap(),
    test_router(),
    mpsc::channel(1).0,
  ));

  let tasks: Vec<_> = (0..50)
    .map(|_| {
      let proxy = proxy.clone();
      tokio::spawn(async move { proxy.ensure_domain_proxy("masq.test:443").await.unwrap() })
    })
    .collect();

  let addrs: Vec<_> = futures::future::join_all(tasks)
    .await
    .into_iter()
    .map(|joined| joined.unwrap().expect("mapped host must resolve"))
    .collect();

  assert_eq!(proxy.proxy_count().await, 1);
  assert!(addrs.windows(2).all(|pair| pair[0] == pair[1]));
}

#[tokio::test]
async fn unmapped_connect_tunnels_directly_without_issuance() {
  install_provider();

  // Plain echo server standing in for an unmapped remote host.
  let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let echo_addr = echo.local_addr().unwrap();
  tokio::spawn(async move {
    loop {
      let (mut stream, _) = match echo.accept().await {
        Ok(accepted) => accepted,
        Err(_) => break,
      };
      tokio::spawn(async move {
        let (mut read, mut write) = stream.split();
        let _ = tokio::io::copy(&mut read, &mut write).await;
      });
    }
  });

  let proxy = Arc::new(ConnectProxy::new(
    FakeCa::generate().unwrap(),
    test_router(),
    mpsc::channel(1).0,
  ));
  let proxy_addr = serve_proxy(proxy.clone()).await;

  let mut client = TcpStream::connect(proxy_addr).await.unwrap();
  client
    .write_all(format!("CONNECT {echo_addr} HTTP/1.1\r\nHost: {echo_addr}\r\n\r\n").as_bytes())
    .await
    .unwrap();

  let mut buf = [0u8; 256];
  let n = client.read(&mut buf).await.unwrap();
  let response = String::from_utf8_lossy(&buf[..n]).to_string();
  assert!(response.starts_with("HTTP/1.1 200"), "got: {response}");

  client.write_all(b"ping").await.unwrap();
  let mut echoed = [0u8; 4];
  client.read_exact(&mut echoed).await.unwrap();
  assert_eq!(&echoed, b"ping");

  // No mapping means no certificate issuance and no terminator.
  assert_eq!(proxy.proxy_count().await, 0);
}

#[tokio::test]
async fn tunnel_teardown_reaches_the_other_side() {
  let left = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let right = TcpListener::bind("127.0.0.1:0").await.unwrap();

  let left_client = TcpStream::connect(left.local_addr().unwrap());
  let (left_client, left_server) = tokio::join!(left_client, left.accept());
  let mut left_client = left_client.unwrap();
  let (left_server, _) = left_server.unwrap();

  let right_client = TcpStream::connect(right.local_addr().unwrap());
  let (right_client, right_server) = tokio::join!(right_client, right.accept());
  let mut right_client = right_client.unwrap();
  let (right_server, _) = right_server.unwrap();

  let tunnel_task = tokio::spawn(tunnel(left_server, right_server));

  left_client.write_all(b"hello").await.unwrap();
  let mut buf = [0u8; 5];
  right_client.read_exact(&mut buf).await.unwrap();
  assert_eq!(&buf, b"hello");

  // Closing one endpoint must complete the tunnel and EOF the peer.
  drop(left_client);
  tokio::time::timeout(Duration::from_secs(2), tunnel_task)
    .await
    .expect("tunnel must finish once a side closes")
    .unwrap();

  let eof = tokio::time::timeout(Duration::from_secs(2), right_client.read(&mut buf))
    .await
    .expect("peer read must unblock");
  assert_eq!(eof.unwrap_or(0), 0);
}

#[tokio::test]
async fn mapped_local_host_gets_redirected_to_https() {
  install_provider();
  let proxy = Arc::new(ConnectProxy::new(
    FakeCa::generate().unwrap(),
    test_router(),
    mpsc::channel(1).0,
  ));
  let proxy_addr = serve_proxy(proxy).await;

  let mut client = TcpStream::connect(proxy_addr).await.unwrap();
  client
    .write_all(b"GET /some/path HTTP/1.1\r\nHost: 127.0.0.1:7777\r\n\r\n")
    .await
    .unwrap();
  let response = String::from_utf8_lossy(&read_until_eof(&mut client).await).to_string();
  assert!(response.starts_with("HTTP/1.1 307"), "got: {response}");
  assert!(
    response.contains("Location: https://masq.test:443/some/path"),
    "got: {response}"
  );
}

#[tokio::test]
async fn absolute_form_request_gets_redirected_to_https() {
  install_provider();
  let proxy = Arc::new(ConnectProxy::new(
    FakeCa::generate().unwrap(),
    test_router(),
    mpsc::channel(1).0,
  ));
  let proxy_addr = serve_proxy(proxy).await;

  // Browsers speaking through a proxy send the absolute-form target.
  let mut client = TcpStream::connect(proxy_addr).await.unwrap();
  client
    .write_all(
      b"GET http://127.0.0.1:7777/some/path HTTP/1.1\r\nHost: 127.0.0.1:7777\r\n\r\n",
    )
    .await
    .unwrap();
  let response = String::from_utf8_lossy(&read_until_eof(&mut client).await).to_string();
  assert!(response.starts_with("HTTP/1.1 307"), "got: {response}");
  assert!(
    response.contains("Location: https://masq.test:443/some/path"),
    "got: {response}"
  );
}

#[tokio::test]
async fn absolute_form_shutdown_path_signals_the_channel() {
  install_provider();
  let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
  let proxy = Arc::new(ConnectProxy::new(
    FakeCa::generate().unwrap(),
    test_router(),
    shutdown_tx,
  ));
  let proxy_addr = serve_proxy(proxy).await;

  let mut client = TcpStream::connect(proxy_addr).await.unwrap();
  client
    .write_all(
      b"GET http://127.0.0.1:9999/quitquitquit HTTP/1.1\r\nHost: 127.0.0.1:9999\r\n\r\n",
    )
    .await
    .unwrap();
  let response = String::from_utf8_lossy(&read_until_eof(&mut client).await).to_string();
  assert!(response.starts_with("HTTP/1.1 200"), "got: {response}");

  tokio::time::timeout(Duration::from_secs(2), shutdown_rx.recv())
    .await
    .expect("shutdown signal must fire")
    .expect("channel must deliver the signal");
}

#[tokio::test]
async fn unmapped_non_connect_gets_405() {
  install_provider();
  let proxy = Arc::new(ConnectProxy::new(
    FakeCa::generate().unwrap(),
    test_router(),
    mpsc::channel(1).0,
  ));
  let proxy_addr = serve_proxy(proxy).await;

  let mut client = TcpStream::connect(proxy_addr).await.unwrap();
  client
    .write_all(b"GET / HTTP/1.1\r\nHost: other.test\r\n\r\n")
    .await
    .unwrap();
  let response = String::from_utf8_lossy(&read_until_eof(&mut client).await).to_string();
  assert!(response.starts_with("HTTP/1.1 405"), "got: {response}");
}

#[tokio::test]
async fn shutdown_path_signals_the_channel() {
  install_provider();
  let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
  let proxy = Arc::new(ConnectProxy::new(
    FakeCa::generate().unwrap(),
    test_router(),
    shutdown_tx,
  ));
  let proxy_addr = serve_proxy(proxy).await;

  let mut client = TcpStream::connect(proxy_addr).await.unwrap();
  client
    .write_all(b"GET /quitquitquit HTTP/1.1\r\nHost: anything\r\n\r\n")
    .await
    .unwrap();
  let response = String::from_utf8_lossy(&read_until_eof(&mut client).await).to_string();
  assert!(response.starts_with("HTTP/1.1 200"), "got: {response}");

  tokio::time::timeout(Duration::from_secs(2), shutdown_rx.recv())
    .await
    .expect("shutdown signal must fire")
    .expect("channel must deliver the signal");
}

#[tokio::test]
async fn terminator_serves_masquerade_with_rewritten_host() {
  install_provider();

  // Masquerading dev server: capture the request head, answer in plain HTTP.
  let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let backend_addr = backend.local_addr().unwrap();
  let backend_task = tokio::spawn(async move {
    let (mut stream, _) = backend.accept().await.unwrap();
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
      let n = stream.read(&mut buf).await.unwrap();
      head.extend_from_slice(&buf[..n]);
      if head.windows(4).any(|w| w == b"\r\n\r\n") || n == 0 {
        break;
      }
    }
    stream
      .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 9\r\nConnection: close\r\n\r\nmasq-body")
      .await
      .unwrap();
    stream.shutdown().await.ok();
    String::from_utf8_lossy(&head).to_string()
  });

  let ca = FakeCa::generate().unwrap();
  let leaf = ca.issue(&["example.test".to_string()]).unwrap();
  let terminator = TlsTerminator::new(
    &leaf,
    backend_addr.to_string(),
    "example.test:443",
    vec!["/api".to_string()],
  )
  .unwrap();
  let (addr, _task) = terminator.start().await.unwrap();

  // A client that trusts the fake root connects through SNI.
  let mut roots = RootCertStore::empty();
  for cert in rustls_pemfile::certs(&mut ca.cert_pem().as_bytes()) {
    roots.add(cert.unwrap()).unwrap();
  }
  let config = ClientConfig::builder()
    .with_root_certificates(roots)
    .with_no_client_auth();
  let connector = TlsConnector::from(Arc::new(config));

  let tcp = TcpStream::connect(addr).await.unwrap();
  let server_name = ServerName::try_from("example.test".to_string()).unwrap();
  let mut tls = connector
    .connect(server_name, tcp)
    .await
    .expect("client must accept the forged certificate chain");

  tls
    .write_all(b"GET /app HTTP/1.1\r\nHost: example.test\r\nConnection: keep-alive\r\n\r\n")
    .await
    .unwrap();
  let response = String::from_utf8_lossy(&read_until_eof(&mut tls).await).to_string();
  assert!(response.contains("masq-body"), "got: {response}");

  let seen_head = backend_task.await.unwrap();
  // Both routes present the pass-through host to the backend.
  assert!(
    seen_head.contains("Host: example.test:443"),
    "backend saw: {seen_head}"
  );
  assert!(seen_head.contains("Connection: close"), "backend saw: {seen_head}");
  assert!(!seen_head.contains("keep-alive"), "backend saw: {seen_head}");
}
