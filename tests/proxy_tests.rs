//! End-to-end scenarios driving the proxy over real sockets

use periscope::{CaptureRecord, Proxy, ProxyConfig};
use rcgen::{BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName};
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

/// Throwaway root CA: PEM material for the proxy, DER for the client trust
/// store.
fn test_root() -> (String, String, Vec<u8>) {
  let key = KeyPair::generate().unwrap();
  let mut params = CertificateParams::default();
  params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
  let mut dn = DistinguishedName::new();
  dn.push(DnType::CommonName, "periscope test root");
  params.distinguished_name = dn;
  let cert = params.self_signed(&key).unwrap();
  (cert.pem(), key.serialize_pem(), cert.der().to_vec())
}

struct TestProxy {
  proxy: Arc<Proxy>,
  addr: SocketAddr,
  records: mpsc::Receiver<CaptureRecord>,
  root_der: Vec<u8>,
}

async fn start_proxy(include: &str, exclude: &str) -> TestProxy {
  let (cert_pem, key_pem, root_der) = test_root();
  let proxy = Arc::new(
    Proxy::new(ProxyConfig {
      include: include.to_owned(),
      exclude: exclude.to_owned(),
      upstream_proxy: None,
      root_cert_pem: cert_pem.into_bytes(),
      root_key_pem: key_pem.into_bytes(),
    })
    .await
    .expect("proxy construction"),
  );
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  let (tx, records) = mpsc::channel(16);
  proxy.set_sink(tx);
  let serving = proxy.clone();
  tokio::spawn(async move {
    let _ = serving.serve(listener).await;
  });
  TestProxy {
    proxy,
    addr,
    records,
    root_der,
  }
}

/// A canned-response origin: reads one request head per connection and
/// answers with the given bytes.
async fn start_origin(response: Vec<u8>) -> SocketAddr {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  tokio::spawn(async move {
    loop {
      let Ok((mut stream, _)) = listener.accept().await else {
        break;
      };
      let response = response.clone();
      tokio::spawn(async move {
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        loop {
          match stream.read(&mut byte).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {
              head.push(byte[0]);
              if head.ends_with(b"\r\n\r\n") {
                break;
              }
            }
          }
        }
        let _ = stream.write_all(&response).await;
        let _ = stream.shutdown().await;
      });
    }
  });
  addr
}

/// Read one response with `Content-Length` framing.
async fn read_response(stream: &mut TcpStream) -> (String, Vec<u8>) {
  let mut head = Vec::new();
  let mut byte = [0u8; 1];
  loop {
    let n = stream.read(&mut byte).await.unwrap();
    assert!(n > 0, "EOF before end of response head");
    head.push(byte[0]);
    if head.ends_with(b"\r\n\r\n") {
      break;
    }
  }
  let head = String::from_utf8(head).unwrap();
  let length: usize = head
    .lines()
    .find_map(|line| {
      let (name, value) = line.split_once(':')?;
      if name.trim().eq_ignore_ascii_case("content-length") {
        value.trim().parse().ok()
      } else {
        None
      }
    })
    .expect("Content-Length in response");
  let mut body = vec![0u8; length];
  stream.read_exact(&mut body).await.unwrap();
  (head, body)
}

async fn connect_through(proxy: SocketAddr, target: &str, expect: &str) -> TcpStream {
  let mut stream = TcpStream::connect(proxy).await.unwrap();
  stream
    .write_all(format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n\r\n").as_bytes())
    .await
    .unwrap();
  let mut reply = vec![0u8; expect.len()];
  stream.read_exact(&mut reply).await.unwrap();
  assert_eq!(String::from_utf8_lossy(&reply), expect);
  stream
}

#[tokio::test]
async fn transparent_connect_passes_bytes_and_mints_nothing() {
  // Exclude wins even though the include list covers everything.
  let mut harness = start_proxy("*", "127.0.0.1").await;

  let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let origin_addr = origin.local_addr().unwrap();
  let echo = tokio::spawn(async move {
    let (mut stream, _) = origin.accept().await.unwrap();
    let mut blob = vec![0u8; 1024];
    stream.read_exact(&mut blob).await.unwrap();
    stream.write_all(&blob).await.unwrap();
    stream.shutdown().await.unwrap();
    blob
  });

  let mut stream = connect_through(
    harness.addr,
    &origin_addr.to_string(),
    "HTTP/1.1 200 Connection established\r\n\r\n",
  )
  .await;

  let blob: Vec<u8> = (0..1024).map(|i| (i % 251) as u8).collect();
  stream.write_all(&blob).await.unwrap();
  let mut echoed = vec![0u8; 1024];
  stream.read_exact(&mut echoed).await.unwrap();
  assert_eq!(echoed, blob, "tunneled bytes must pass through untouched");
  assert_eq!(echo.await.unwrap(), blob);

  assert_eq!(
    harness.proxy.certificates_issued(),
    0,
    "a tunneled host must never mint a leaf"
  );
  assert!(
    harness.records.try_recv().is_err(),
    "transparent tunnels emit no capture records"
  );
  harness.proxy.close();
}

#[tokio::test]
async fn mitm_connect_terminates_tls_with_minted_leaf() {
  let mut harness = start_proxy("sni.invalid", "").await;

  let stream = connect_through(
    harness.addr,
    "sni.invalid:443",
    "HTTP/1.1 200 Connection Established\r\n\r\n",
  )
  .await;

  let mut roots = RootCertStore::empty();
  roots
    .add(CertificateDer::from(harness.root_der.clone()))
    .unwrap();
  let config = ClientConfig::builder()
    .with_root_certificates(roots)
    .with_no_client_auth();
  let connector = TlsConnector::from(Arc::new(config));
  let server_name = ServerName::try_from("sni.invalid").unwrap();

  let mut tls = connector
    .connect(server_name, stream)
    .await
    .expect("handshake against the minted leaf must validate");
  assert_eq!(harness.proxy.certificates_issued(), 1);

  // The origin does not exist, so the interceptor answers 503 over TLS.
  tls
    .write_all(b"GET /ping HTTP/1.1\r\nHost: sni.invalid\r\nConnection: close\r\n\r\n")
    .await
    .unwrap();
  let mut response = Vec::new();
  let _ = tls.read_to_end(&mut response).await;
  let text = String::from_utf8_lossy(&response);
  assert!(
    text.starts_with("HTTP/1.1 503 Service Unavailable\r\n"),
    "unreachable origin must answer 503, got: {text}"
  );
  assert!(
    harness.records.try_recv().is_err(),
    "failed round-trips emit no capture records"
  );
  harness.proxy.close();
}

#[tokio::test]
async fn plaintext_intercept_captures_the_exchange() {
  let origin = start_origin(
    b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 4\r\n\r\npong".to_vec(),
  )
  .await;
  let mut harness = start_proxy("127.0.0.1", "").await;

  let mut stream = TcpStream::connect(harness.addr).await.unwrap();
  stream
    .write_all(
      format!("GET http://{origin}/ping HTTP/1.1\r\nHost: {origin}\r\n\r\n").as_bytes(),
    )
    .await
    .unwrap();
  let (head, body) = read_response(&mut stream).await;
  assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
  assert_eq!(body, b"pong");

  let record = harness.records.recv().await.expect("capture record");
  assert_eq!(record.method, "GET");
  assert_eq!(record.url, format!("http://{origin}/ping"));
  assert_eq!(record.status, 200);
  assert_eq!(record.size, 4);
  assert_eq!(record.resp_body, "pong");
  assert_eq!(record.content_type, "text/plain");
  assert!(record.tls.is_none(), "plaintext interception has no TLS state");
  assert!(record.req_header.contains_key("host"));
  harness.proxy.close();
}

#[tokio::test]
async fn keep_alive_serves_sequential_requests() {
  let origin = start_origin(
    b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 4\r\n\r\npong".to_vec(),
  )
  .await;
  let mut harness = start_proxy("127.0.0.1", "").await;

  let mut stream = TcpStream::connect(harness.addr).await.unwrap();
  for _ in 0..2 {
    stream
      .write_all(
        format!("GET http://{origin}/ping HTTP/1.1\r\nHost: {origin}\r\n\r\n").as_bytes(),
      )
      .await
      .unwrap();
    let (head, body) = read_response(&mut stream).await;
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert_eq!(body, b"pong");
  }
  assert!(harness.records.recv().await.is_some());
  assert!(harness.records.recv().await.is_some());
  harness.proxy.close();
}

#[tokio::test]
async fn gzip_body_reaches_client_verbatim_and_record_decoded() {
  use flate2::write::GzEncoder;
  use flate2::Compression;
  use std::io::Write;

  let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
  encoder.write_all(b"{\"ok\":true}").unwrap();
  let compressed = encoder.finish().unwrap();

  let mut response = format!(
    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Encoding: gzip\r\nContent-Length: {}\r\n\r\n",
    compressed.len()
  )
  .into_bytes();
  response.extend_from_slice(&compressed);

  let origin = start_origin(response).await;
  let mut harness = start_proxy("127.0.0.1", "").await;

  let mut stream = TcpStream::connect(harness.addr).await.unwrap();
  stream
    .write_all(format!("GET http://{origin}/data HTTP/1.1\r\nHost: {origin}\r\n\r\n").as_bytes())
    .await
    .unwrap();
  let (head, body) = read_response(&mut stream).await;
  assert!(head.to_ascii_lowercase().contains("content-encoding: gzip"));
  assert_eq!(body, compressed, "on-wire bytes must stay encoded");

  let record = harness.records.recv().await.expect("capture record");
  assert_eq!(record.resp_body, "{\"ok\":true}", "record body is decoded");
  assert_eq!(record.size, compressed.len() as u64);
  assert_eq!(record.content_type, "application/json");
  harness.proxy.close();
}

#[tokio::test]
async fn image_bodies_are_streamed_with_size_only_capture() {
  let payload = vec![0xA5u8; 10_000];
  let mut response = format!(
    "HTTP/1.1 200 OK\r\nContent-Type: image/png\r\nContent-Length: {}\r\n\r\n",
    payload.len()
  )
  .into_bytes();
  response.extend_from_slice(&payload);

  let origin = start_origin(response).await;
  let mut harness = start_proxy("127.0.0.1", "").await;

  let mut stream = TcpStream::connect(harness.addr).await.unwrap();
  stream
    .write_all(format!("GET http://{origin}/a.png HTTP/1.1\r\nHost: {origin}\r\n\r\n").as_bytes())
    .await
    .unwrap();
  let (_, body) = read_response(&mut stream).await;
  assert_eq!(body.len(), 10_000);
  assert_eq!(body, payload);

  let record = harness.records.recv().await.expect("capture record");
  assert_eq!(record.size, 10_000);
  assert!(record.resp_body.is_empty(), "image bodies are not captured");
  assert_eq!(record.content_type, "image/png");
  harness.proxy.close();
}

#[tokio::test]
async fn excluded_host_is_forwarded_not_intercepted() {
  let origin = start_origin(
    b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 2\r\n\r\nok".to_vec(),
  )
  .await;
  let mut harness = start_proxy("", "127.0.0.1").await;

  let mut stream = TcpStream::connect(harness.addr).await.unwrap();
  stream
    .write_all(format!("GET http://{origin}/x HTTP/1.1\r\nHost: {origin}\r\n\r\n").as_bytes())
    .await
    .unwrap();
  let (head, body) = read_response(&mut stream).await;
  assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
  assert_eq!(body, b"ok");
  assert!(
    harness.records.try_recv().is_err(),
    "forwarded requests emit no capture records"
  );
  harness.proxy.close();
}
