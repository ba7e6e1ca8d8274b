//! Proxy construction, the frontend dispatcher and CONNECT tunneling

use crate::bridge::TlsBridge;
use crate::ca::CertificateMint;
use crate::error::{Error, Result};
use crate::filter::{strip_port, HostFilter, Route};
use crate::http1;
use crate::intercept::Interceptor;
use crate::listener::{Listener, TunnelConn};
use crate::message::CaptureRecord;
use http::{Method, StatusCode};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};

/// Origin dial timeout for transparent CONNECT tunnels.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
/// Buffer size of each in-memory tunnel socket pair.
const TUNNEL_BUF: usize = 16 * 1024;

/// Configuration for [`Proxy::new`].
#[derive(Clone, Default)]
pub struct ProxyConfig {
  /// `;`-separated include globs; empty means intercept every host
  pub include: String,
  /// `;`-separated exclude globs; matching hosts are tunneled untouched
  pub exclude: String,
  /// Optional upstream proxy URL routing replayed round-trips
  pub upstream_proxy: Option<String>,
  /// Root CA certificate, PEM
  pub root_cert_pem: Vec<u8>,
  /// Root CA private key, PEM
  pub root_key_pem: Vec<u8>,
}

/// What the dispatcher shares with every connection task.
#[derive(Clone)]
struct Shared {
  filter: Arc<HostFilter>,
  listener: Arc<Listener>,
  interceptor: Arc<Interceptor>,
}

/// The intercepting proxy.
///
/// Classifies client traffic against the include/exclude lists, tunnels
/// excluded CONNECTs transparently, terminates TLS for intercepted ones
/// through the in-process bridge, and replays everything else upstream
/// while emitting capture records.
pub struct Proxy {
  shared: Shared,
  mint: Arc<CertificateMint>,
  shutdown: watch::Sender<bool>,
}

impl Proxy {
  /// Parse root material, prepare the mint and the upstream client, and
  /// spawn the TLS bridge. Fails when the root PEM bytes are unusable.
  pub async fn new(config: ProxyConfig) -> Result<Self> {
    // More than one rustls crypto backend may be linked into the final
    // binary; pin the process default so config builders stay unambiguous.
    let _ = tokio_rustls::rustls::crypto::aws_lc_rs::default_provider().install_default();

    let filter = Arc::new(HostFilter::new(&config.include, &config.exclude));
    let mint = Arc::new(CertificateMint::from_pem(
      &config.root_cert_pem,
      &config.root_key_pem,
    )?);
    let interceptor = Arc::new(Interceptor::new(config.upstream_proxy.as_deref())?);
    let listener = Arc::new(Listener::new());

    let bridge = TlsBridge::new(listener.clone(), mint.clone(), interceptor.clone());
    tokio::spawn(bridge.run());

    let (shutdown, _) = watch::channel(false);
    Ok(Self {
      shared: Shared {
        filter,
        listener,
        interceptor,
      },
      mint,
      shutdown,
    })
  }

  /// Bind `addr` and serve until [`close`](Proxy::close).
  pub async fn run(&self, addr: &str) -> Result<()> {
    let listener = TcpListener::bind(addr)
      .await
      .map_err(|e| Error::connection(format!("Failed to bind {}: {}", addr, e)))?;
    self.serve(listener).await
  }

  /// Serve an already-bound listener until [`close`](Proxy::close).
  pub async fn serve(&self, listener: TcpListener) -> Result<()> {
    let mut shutdown = self.shutdown.subscribe();
    if *shutdown.borrow() {
      return Ok(());
    }
    loop {
      tokio::select! {
        accepted = listener.accept() => match accepted {
          Ok((stream, peer)) => {
            let shared = self.shared.clone();
            tokio::spawn(async move {
              if let Err(e) = handle_client(stream, peer, shared).await {
                tracing::error!("client connection failed: {}", e);
              }
            });
          }
          Err(e) => tracing::error!("accept failed: {}", e),
        },
        _ = shutdown.changed() => break,
      }
    }
    Ok(())
  }

  /// Stop accepting clients and close the synthetic listener; the bridge
  /// drains queued tunnels and exits. In-flight tunnels run until their
  /// sockets close.
  pub fn close(&self) {
    self.shared.listener.close();
    self.shutdown.send_replace(true);
  }

  /// Current include patterns.
  pub fn include(&self) -> Vec<String> {
    self.shared.filter.include()
  }

  /// Replace the include list with `;`-separated globs; returns the parsed
  /// patterns.
  pub fn set_include(&self, patterns: &str) -> Vec<String> {
    self.shared.filter.set_include(patterns)
  }

  /// Intercept every host again.
  pub fn clear_include(&self) -> Vec<String> {
    self.shared.filter.clear_include()
  }

  /// Current exclude patterns.
  pub fn exclude(&self) -> Vec<String> {
    self.shared.filter.exclude()
  }

  /// Replace the exclude list with `;`-separated globs; returns the parsed
  /// patterns.
  pub fn set_exclude(&self, patterns: &str) -> Vec<String> {
    self.shared.filter.set_exclude(patterns)
  }

  /// Stop excluding any host.
  pub fn clear_exclude(&self) -> Vec<String> {
    self.shared.filter.clear_exclude()
  }

  /// Route capture records to `sink`.
  pub fn set_sink(&self, sink: mpsc::Sender<CaptureRecord>) {
    self.shared.interceptor.set_sink(sink);
  }

  /// Number of leaf certificates minted so far.
  pub fn certificates_issued(&self) -> u64 {
    self.mint.issued()
  }
}

/// Serve one client connection: classify each request and dispatch it to a
/// tunnel, the interceptor or the transparent forwarder.
async fn handle_client(mut stream: TcpStream, peer: SocketAddr, shared: Shared) -> Result<()> {
  loop {
    let Some(head) = http1::read_head(&mut stream).await? else {
      return Ok(());
    };
    let host_port = head.host();
    let host = strip_port(&host_port).to_owned();
    let route = shared.filter.route(&host);
    tracing::debug!("{} {} -> {:?}", head.method, host, route);

    if head.method == Method::CONNECT {
      return match route {
        Route::Forward => tunnel_transparent(stream, &head.target).await,
        Route::Intercept => tunnel_mitm(stream, peer, &shared.listener).await,
      };
    }

    let body = match http1::read_body(&mut stream, &head.headers).await {
      Ok(body) => body,
      Err(e) => {
        http1::write_error(
          &mut stream,
          StatusCode::INTERNAL_SERVER_ERROR,
          "Failed to read request body",
        )
        .await?;
        return Err(e);
      }
    };
    let keep_alive = match route {
      Route::Intercept => {
        shared
          .interceptor
          .handle(head, body, peer, None, &mut stream)
          .await?
      }
      Route::Forward => shared.interceptor.forward(head, body, &mut stream).await?,
    };
    if !keep_alive {
      return Ok(());
    }
  }
}

/// Dial the origin and splice bytes both ways without looking at them.
async fn tunnel_transparent(mut client: TcpStream, target: &str) -> Result<()> {
  let mut origin = match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(target)).await {
    Ok(Ok(origin)) => origin,
    Ok(Err(e)) => {
      http1::write_error(&mut client, StatusCode::SERVICE_UNAVAILABLE, &e.to_string()).await?;
      return Ok(());
    }
    Err(_) => {
      http1::write_error(
        &mut client,
        StatusCode::SERVICE_UNAVAILABLE,
        &format!("Connecting to {} timed out", target),
      )
      .await?;
      return Ok(());
    }
  };

  client
    .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
    .await?;
  client.flush().await?;

  let (mut client_read, mut client_write) = client.split();
  let (mut origin_read, mut origin_write) = origin.split();
  tokio::select! {
    _ = tokio::io::copy(&mut client_read, &mut origin_write) => {}
    _ = tokio::io::copy(&mut origin_read, &mut client_write) => {}
  }
  // Both sockets drop here; the surviving direction observes EOF.
  Ok(())
}

/// Hijack the client socket into the TLS bridge through an in-memory
/// socket pair pushed onto the synthetic listener.
async fn tunnel_mitm(mut client: TcpStream, peer: SocketAddr, listener: &Listener) -> Result<()> {
  let (client_side, server_side) = tokio::io::duplex(TUNNEL_BUF);
  listener.push(TunnelConn {
    stream: server_side,
    peer,
  });

  client
    .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
    .await?;
  client.flush().await?;

  let (mut client_read, mut client_write) = client.split();
  let (mut pair_read, mut pair_write) = tokio::io::split(client_side);
  tokio::select! {
    _ = tokio::io::copy(&mut client_read, &mut pair_write) => {}
    _ = tokio::io::copy(&mut pair_read, &mut client_write) => {}
  }
  Ok(())
}
