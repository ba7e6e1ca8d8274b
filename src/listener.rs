//! Synthetic connection listener feeding the TLS bridge
//!
//! The bridge terminates TLS on connections that were never accepted from a
//! real socket: the dispatcher hijacks a CONNECT tunnel, builds an in-memory
//! socket pair and pushes one half here. [`Listener`] is the accept-shaped
//! queue between the two.

use crate::error::{Error, Result};
use std::net::SocketAddr;
use std::sync::Mutex;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;

/// A hijacked tunnel connection awaiting TLS termination.
///
/// Carries the peer address of the originating TCP connection so capture
/// records report the real remote rather than an in-memory pipe.
#[derive(Debug)]
pub struct TunnelConn {
  /// Server half of the in-memory socket pair
  pub stream: DuplexStream,
  /// Peer address of the hijacked client socket
  pub peer: SocketAddr,
}

/// An accept-like FIFO of already-connected in-memory sockets.
///
/// One producer per MITM tunnel setup, one consumer (the TLS bridge). Every
/// pushed connection is either returned by exactly one [`accept`] or dropped
/// (closed) on shutdown; none leak.
///
/// [`accept`]: Listener::accept
#[derive(Debug)]
pub struct Listener {
  tx: Mutex<Option<mpsc::UnboundedSender<TunnelConn>>>,
  rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<TunnelConn>>,
}

impl Listener {
  /// Create an open, empty listener.
  pub fn new() -> Self {
    let (tx, rx) = mpsc::unbounded_channel();
    Self {
      tx: Mutex::new(Some(tx)),
      rx: tokio::sync::Mutex::new(rx),
    }
  }

  /// Enqueue a connection. Never blocks.
  ///
  /// If the listener has been closed the connection is dropped, which closes
  /// both halves of the pair; the tunnel peer observes EOF.
  pub fn push(&self, conn: TunnelConn) {
    let guard = self.tx.lock().expect("listener sender lock poisoned");
    match guard.as_ref() {
      Some(tx) => {
        // A send error means the receiver is gone; dropping conn closes it.
        let _ = tx.send(conn);
      }
      None => drop(conn),
    }
  }

  /// Wait for the next connection, FIFO.
  ///
  /// Fails with [`Error::ListenerClosed`] once the listener is closed and
  /// the queue has drained.
  pub async fn accept(&self) -> Result<TunnelConn> {
    let mut rx = self.rx.lock().await;
    rx.recv().await.ok_or(Error::ListenerClosed)
  }

  /// Close the listener. Idempotent.
  ///
  /// Wakes any blocked [`accept`] once the queue drains; connections pushed
  /// afterwards are closed immediately.
  ///
  /// [`accept`]: Listener::accept
  pub fn close(&self) {
    self.tx.lock().expect("listener sender lock poisoned").take();
  }

  /// Synthetic address label, for logging only.
  pub fn addr(&self) -> &'static str {
    "mitm(synthetic)"
  }
}

impl Default for Listener {
  fn default() -> Self {
    Self::new()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::io::{AsyncReadExt, AsyncWriteExt};

  fn conn() -> (TunnelConn, DuplexStream) {
    let (client, server) = tokio::io::duplex(64);
    let peer = "127.0.0.1:9999".parse().unwrap();
    (
      TunnelConn {
        stream: server,
        peer,
      },
      client,
    )
  }

  #[tokio::test]
  async fn accept_returns_pushed_connections_in_order() {
    let listener = Listener::new();
    let (first, mut first_peer) = conn();
    let (second, mut second_peer) = conn();
    listener.push(first);
    listener.push(second);

    let mut a = listener.accept().await.expect("first accept");
    let mut b = listener.accept().await.expect("second accept");

    first_peer.write_all(b"1").await.unwrap();
    second_peer.write_all(b"2").await.unwrap();
    let mut buf = [0u8; 1];
    a.stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"1", "accept must be FIFO");
    b.stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"2", "accept must be FIFO");
  }

  #[tokio::test]
  async fn close_unblocks_pending_accept() {
    let listener = std::sync::Arc::new(Listener::new());
    let waiter = {
      let listener = listener.clone();
      tokio::spawn(async move { listener.accept().await })
    };
    tokio::task::yield_now().await;
    listener.close();
    let result = waiter.await.unwrap();
    assert!(matches!(result, Err(Error::ListenerClosed)));
  }

  #[tokio::test]
  async fn queued_connections_survive_close_until_drained() {
    let listener = Listener::new();
    let (queued, _peer) = conn();
    listener.push(queued);
    listener.close();

    assert!(listener.accept().await.is_ok(), "queued conn still accepted");
    assert!(matches!(
      listener.accept().await,
      Err(Error::ListenerClosed)
    ));
  }

  #[tokio::test]
  async fn push_after_close_closes_the_connection() {
    let listener = Listener::new();
    listener.close();
    let (late, mut peer) = conn();
    listener.push(late);

    let mut buf = [0u8; 1];
    let n = peer.read(&mut buf).await.unwrap();
    assert_eq!(n, 0, "peer must observe EOF for a post-close push");
  }
}
