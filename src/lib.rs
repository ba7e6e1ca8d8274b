//! # periscope
//!
//! The core of a man-in-the-middle HTTP/HTTPS intercepting proxy: a CONNECT
//! dispatcher, an on-the-fly certificate mint, an in-process TLS server fed
//! by hijacked tunnels, and a capture pipeline that decodes response bodies
//! and emits structured [`CaptureRecord`]s to an embedder-owned sink.
//!
//! # How it fits together
//!
//! Clients speak plain HTTP to the proxy. A `CONNECT` for a host in the
//! intercept set is answered with `200`, the client socket is hijacked onto
//! an in-memory pair, and the pair's far end is pushed into a synthetic
//! [`Listener`]. The TLS bridge accepts from that listener, terminates TLS
//! with a leaf certificate minted for the SNI the client presents, and hands
//! every decrypted request to the interceptor, which replays it upstream and
//! captures the exchange. Excluded hosts are tunneled byte-for-byte without
//! ever minting a certificate.
//!
//! # Example
//!
//! ```no_run
//! use periscope::{Proxy, ProxyConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!   let config = ProxyConfig {
//!     include: "*.api.example".to_owned(),
//!     exclude: "login.api.example".to_owned(),
//!     root_cert_pem: std::fs::read("ca_cert.pem")?,
//!     root_key_pem: std::fs::read("ca_key.pem")?,
//!     ..Default::default()
//!   };
//!   let proxy = Proxy::new(config).await?;
//!
//!   let (tx, mut rx) = tokio::sync::mpsc::channel(256);
//!   proxy.set_sink(tx);
//!   tokio::spawn(async move {
//!     while let Some(record) = rx.recv().await {
//!       println!("{} {} -> {}", record.method, record.url, record.status);
//!     }
//!   });
//!
//!   proxy.run("127.0.0.1:8080").await?;
//!   Ok(())
//! }
//! ```

mod bridge;
mod ca;
mod error;
mod filter;
mod http1;
mod intercept;
mod listener;
mod message;
mod proxy;

pub use ca::CertificateMint;
pub use error::{Error, Result};
pub use filter::{HostFilter, Route};
pub use listener::{Listener, TunnelConn};
pub use message::{CaptureRecord, TlsMeta};
pub use proxy::{Proxy, ProxyConfig};
