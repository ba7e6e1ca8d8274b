//! In-process TLS server fed by hijacked tunnels
//!
//! The bridge accepts connections from the synthetic [`Listener`], performs
//! the rustls handshake with a certificate minted for the SNI the client
//! presents, and hands every decrypted request to the interceptor.

use crate::ca::{CertificateMint, MintResolver};
use crate::error::{Error, Result};
use crate::http1;
use crate::intercept::Interceptor;
use crate::listener::{Listener, TunnelConn};
use crate::message::TlsMeta;
use http::StatusCode;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;

pub(crate) struct TlsBridge {
  listener: Arc<Listener>,
  acceptor: TlsAcceptor,
  interceptor: Arc<Interceptor>,
}

impl TlsBridge {
  pub(crate) fn new(
    listener: Arc<Listener>,
    mint: Arc<CertificateMint>,
    interceptor: Arc<Interceptor>,
  ) -> Self {
    let mut config = ServerConfig::builder()
      .with_no_client_auth()
      .with_cert_resolver(Arc::new(MintResolver::new(mint)));
    // Origin-side HTTP/2 interception is out of scope; only offer http/1.1.
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Self {
      listener,
      acceptor: TlsAcceptor::from(Arc::new(config)),
      interceptor,
    }
  }

  /// Accept and serve tunnel connections until the listener closes.
  pub(crate) async fn run(self) {
    tracing::debug!("TLS bridge serving {}", self.listener.addr());
    while let Ok(conn) = self.listener.accept().await {
      let acceptor = self.acceptor.clone();
      let interceptor = self.interceptor.clone();
      tokio::spawn(async move {
        if let Err(e) = serve_tunnel(acceptor, interceptor, conn).await {
          tracing::error!("tunnel connection failed: {}", e);
        }
      });
    }
    tracing::debug!("TLS bridge stopped");
  }
}

/// Terminate TLS on one tunnel and serve decrypted requests until the
/// client is done.
async fn serve_tunnel(
  acceptor: TlsAcceptor,
  interceptor: Arc<Interceptor>,
  conn: TunnelConn,
) -> Result<()> {
  let peer = conn.peer;
  let mut tls = acceptor
    .accept(conn.stream)
    .await
    .map_err(|e| Error::tls(format!("TLS handshake failed: {}", e)))?;
  let meta = TlsMeta::from_connection(tls.get_ref().1);

  loop {
    let Some(head) = http1::read_head(&mut tls).await? else {
      break;
    };
    let body = match http1::read_body(&mut tls, &head.headers).await {
      Ok(body) => body,
      Err(e) => {
        let _ = http1::write_error(
          &mut tls,
          StatusCode::INTERNAL_SERVER_ERROR,
          "Failed to read request body",
        )
        .await;
        return Err(e);
      }
    };
    let keep_alive = interceptor
      .handle(head, body, peer, Some(meta.clone()), &mut tls)
      .await?;
    if !keep_alive {
      break;
    }
  }
  let _ = tls.shutdown().await;
  Ok(())
}
