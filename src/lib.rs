//! TLS-intercepting CONNECT proxy for local web-app development
//!
//! A client is pointed at this proxy and believes it is talking TLS end to
//! end to a production domain; the proxy forges a leaf certificate for that
//! domain (signed by a locally trusted fake root CA), terminates TLS itself,
//! and serves the decrypted requests from a local dev server masquerading as
//! the production host. Requests under configured path prefixes pass through
//! to the real host instead.
//!
//! # Example
//!
//! ```no_run
//! use hostmasq::{ConnectProxy, FakeCa, HostRouter};
//! use std::sync::Arc;
//! use tokio::net::TcpListener;
//! use tokio::sync::mpsc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let ca = FakeCa::generate()?;
//!     let router = HostRouter::from_flags(
//!         &["yoursite.com:443,127.0.0.1:7777".to_string()],
//!         &["yoursite.com:443,/api".to_string()],
//!     );
//!     let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
//!     let proxy = Arc::new(ConnectProxy::new(ca, router, shutdown_tx));
//!
//!     let listener = TcpListener::bind("127.0.0.1:9999").await?;
//!     loop {
//!         tokio::select! {
//!             _ = shutdown_rx.recv() => break,
//!             accepted = listener.accept() => {
//!                 let (stream, _) = accepted?;
//!                 let proxy = proxy.clone();
//!                 tokio::spawn(async move {
//!                     let _ = proxy.handle_connection(stream).await;
//!                 });
//!             }
//!         }
//!     }
//!     Ok(())
//! }
//! ```

mod ca;
mod dispatcher;
mod error;
mod router;
mod terminator;

pub use ca::{FakeCa, LeafCert};
pub use dispatcher::{tunnel, ConnectProxy, DomainProxyRecord, SHUTDOWN_PATH};
pub use error::{Error, Result};
pub use router::{host_key, HostPair, HostRouter, PrefixPair};
pub use terminator::TlsTerminator;
