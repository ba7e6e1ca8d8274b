//! Interception round-trip and capture pipeline
//!
//! A decrypted (or plain) client request is replayed upstream through a
//! pooled client, the response is relayed back byte-for-byte, and a
//! [`CaptureRecord`] is assembled and emitted to the embedder's sink.

use crate::error::Result;
use crate::http1::{self, RequestHead};
use crate::message::{
  first_media_token, header_map, is_image, request_cookies, response_cookies, CaptureRecord,
  TlsMeta,
};
use base64::prelude::{Engine as _, BASE64_STANDARD};
use bytes::Bytes;
use http::header::{
  HeaderValue, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, PROXY_AUTHORIZATION,
  TRANSFER_ENCODING,
};
use http::{HeaderMap, StatusCode};
use std::io::Read;
use std::net::SocketAddr;
use std::sync::RwLock;
use std::time::Instant;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

/// Replays requests upstream and captures the exchange.
pub(crate) struct Interceptor {
  client: reqwest::Client,
  proxy_auth: Option<HeaderValue>,
  sink: RwLock<Option<mpsc::Sender<CaptureRecord>>>,
}

impl Interceptor {
  /// Build the pooled upstream client. Redirects are not followed at this
  /// layer; an upstream proxy, when configured, routes every round-trip and
  /// stamps `Proxy-Authorization` onto the replayed request.
  pub(crate) fn new(upstream_proxy: Option<&str>) -> Result<Self> {
    let mut builder = reqwest::Client::builder().redirect(reqwest::redirect::Policy::none());
    let mut proxy_auth = None;
    if let Some(url) = upstream_proxy.filter(|u| !u.is_empty()) {
      builder = builder.proxy(reqwest::Proxy::all(url)?);
      let basic = format!("Basic {}", BASE64_STANDARD.encode(url));
      proxy_auth = Some(
        HeaderValue::from_str(&basic)
          .map_err(|_| crate::error::Error::invalid_request("Bad upstream proxy URL"))?,
      );
    }
    Ok(Self {
      client: builder.build()?,
      proxy_auth,
      sink: RwLock::new(None),
    })
  }

  /// Route capture records to `sink`. Replaces any previous sink.
  pub(crate) fn set_sink(&self, sink: mpsc::Sender<CaptureRecord>) {
    *self.sink.write().expect("sink lock poisoned") = Some(sink);
  }

  /// Intercept one request: replay upstream, relay the response, emit a
  /// capture record. Returns whether the client connection may be reused.
  pub(crate) async fn handle<S>(
    &self,
    head: RequestHead,
    body: Bytes,
    peer: SocketAddr,
    tls: Option<TlsMeta>,
    stream: &mut S,
  ) -> Result<bool>
  where
    S: AsyncWrite + Unpin,
  {
    let keep_alive = !head.close_requested();
    let url = absolute_url(&head);

    let started = Instant::now();
    let result = self
      .client
      .request(head.method.clone(), &url)
      .headers(self.upstream_headers(&head.headers))
      .body(body.clone())
      .send()
      .await;
    let elapsed = started.elapsed().as_millis() as u64;

    let mut response = match result {
      Ok(response) => response,
      Err(e) => {
        http1::write_error(stream, StatusCode::SERVICE_UNAVAILABLE, &e.to_string()).await?;
        return Ok(keep_alive);
      }
    };

    let status = response.status();
    let resp_headers = response.headers().clone();
    let content_types = resp_headers
      .get(CONTENT_TYPE)
      .and_then(|v| v.to_str().ok())
      .unwrap_or_default()
      .to_owned();

    let size;
    let captured_body;
    let mut clean = true;
    if is_image(&content_types) {
      // Images are relayed without buffering; the record keeps the size only.
      let (streamed, ok) =
        write_streamed(stream, &mut response, client_headers(&resp_headers), status).await?;
      size = streamed;
      clean = ok;
      captured_body = Bytes::new();
    } else {
      let bytes = match response.bytes().await {
        Ok(bytes) => bytes,
        Err(_) => {
          http1::write_error(
            stream,
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to read response body",
          )
          .await?;
          return Ok(keep_alive);
        }
      };

      let mut headers = client_headers(&resp_headers);
      headers.insert(CONTENT_LENGTH, HeaderValue::from(bytes.len()));
      http1::write_head(stream, status, &headers).await?;
      stream.write_all(&bytes).await?;
      stream.flush().await?;
      size = bytes.len() as u64;

      let encoding = resp_headers
        .get(CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
      captured_body = decode_capture_body(&encoding, bytes);
    }

    let record = CaptureRecord {
      url,
      remote_addr: peer.to_string(),
      method: head.method.to_string(),
      content_type: first_media_token(&content_types),
      time: elapsed,
      size,
      status: status.as_u16(),
      req_header: header_map(&head.headers),
      req_cookie: request_cookies(&head.headers),
      req_body: String::from_utf8_lossy(&body).into_owned(),
      resp_header: header_map(&resp_headers),
      resp_cookie: response_cookies(&resp_headers),
      resp_body: String::from_utf8_lossy(&captured_body).into_owned(),
      tls,
    };
    self.emit(record);

    Ok(keep_alive && clean)
  }

  /// Forward one request untouched: replay upstream and relay the response
  /// verbatim. No capture record is emitted.
  pub(crate) async fn forward<S>(
    &self,
    head: RequestHead,
    body: Bytes,
    stream: &mut S,
  ) -> Result<bool>
  where
    S: AsyncWrite + Unpin,
  {
    let keep_alive = !head.close_requested();
    let url = absolute_url(&head);

    let result = self
      .client
      .request(head.method.clone(), &url)
      .headers(self.upstream_headers(&head.headers))
      .body(body)
      .send()
      .await;
    let mut response = match result {
      Ok(response) => response,
      Err(e) => {
        http1::write_error(stream, StatusCode::SERVICE_UNAVAILABLE, &e.to_string()).await?;
        return Ok(keep_alive);
      }
    };

    let status = response.status();
    let headers = client_headers(response.headers());
    let (_, clean) = write_streamed(stream, &mut response, headers, status).await?;
    Ok(keep_alive && clean)
  }

  /// Headers for the upstream replay: hop-by-hop and transport-managed
  /// headers dropped, `Proxy-Authorization` stamped when an upstream proxy
  /// is configured.
  fn upstream_headers(&self, headers: &HeaderMap) -> HeaderMap {
    let mut upstream = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
      let skip = matches!(
        name.as_str(),
        "host"
          | "content-length"
          | "transfer-encoding"
          | "connection"
          | "te"
          | "trailer"
          | "upgrade"
          | "proxy-authorization"
          | "proxy-connection"
          | "keep-alive"
      );
      if !skip {
        upstream.append(name.clone(), value.clone());
      }
    }
    if let Some(auth) = &self.proxy_auth {
      upstream.insert(PROXY_AUTHORIZATION, auth.clone());
    }
    upstream
  }

  /// Hand the record to the sink from a detached task; emission never
  /// delays the client-facing response, but may wait on a full sink.
  fn emit(&self, record: CaptureRecord) {
    let sink = self
      .sink
      .read()
      .expect("sink lock poisoned")
      .as_ref()
      .cloned();
    match sink {
      Some(sink) => {
        tokio::spawn(async move {
          if sink.send(record).await.is_err() {
            tracing::debug!("capture sink receiver dropped, record lost");
          }
        });
      }
      None => tracing::debug!("no capture sink configured, record dropped"),
    }
  }
}

/// The absolute upstream URL for a request: the target itself when it is in
/// absolute form, otherwise `https` against the request host.
fn absolute_url(head: &RequestHead) -> String {
  if head.target.starts_with("http://") || head.target.starts_with("https://") {
    head.target.clone()
  } else {
    format!("https://{}{}", head.host(), head.target)
  }
}

/// Client-facing response headers: everything the origin sent except
/// framing, which is re-established by the writer.
fn client_headers(headers: &HeaderMap) -> HeaderMap {
  let mut out = HeaderMap::with_capacity(headers.len());
  for (name, value) in headers {
    if matches!(name.as_str(), "transfer-encoding" | "connection") {
      continue;
    }
    out.append(name.clone(), value.clone());
  }
  out
}

/// Stream a response body to the client: raw when the origin declared a
/// length, re-framed as chunked otherwise. Returns the payload byte count
/// and whether the body completed; a mid-stream upstream error leaves the
/// connection unusable but is otherwise ignored, as the head is already on
/// the wire.
async fn write_streamed<S>(
  stream: &mut S,
  response: &mut reqwest::Response,
  mut headers: HeaderMap,
  status: StatusCode,
) -> Result<(u64, bool)>
where
  S: AsyncWrite + Unpin,
{
  let known_length = headers.contains_key(CONTENT_LENGTH);
  if !known_length {
    headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
  }
  http1::write_head(stream, status, &headers).await?;

  let mut size: u64 = 0;
  let mut clean = true;
  loop {
    match response.chunk().await {
      Ok(Some(data)) => {
        if known_length {
          stream.write_all(&data).await?;
        } else {
          http1::write_chunk(stream, &data).await?;
        }
        size += data.len() as u64;
      }
      Ok(None) => break,
      Err(e) => {
        tracing::debug!("upstream body ended early: {}", e);
        clean = false;
        break;
      }
    }
  }
  if !known_length && clean {
    http1::finish_chunked(stream).await?;
  }
  stream.flush().await?;
  Ok((size, clean))
}

/// Decode a captured body per its declared `Content-Encoding`. Unknown
/// encodings and decode failures leave the body verbatim; the client has
/// already received the original bytes either way.
fn decode_capture_body(encoding: &str, body: Bytes) -> Bytes {
  let decoded = match encoding {
    "gzip" => decompress_gzip(body.as_ref()),
    "deflate" => decompress_deflate(body.as_ref()),
    "br" => decompress_brotli(body.as_ref()),
    _ => return body,
  };
  match decoded {
    Ok(bytes) => Bytes::from(bytes),
    Err(e) => {
      tracing::debug!("capture decode failed ({}): {}", encoding, e);
      body
    }
  }
}

fn decompress_gzip(input: &[u8]) -> std::io::Result<Vec<u8>> {
  let mut decoder = flate2::read::GzDecoder::new(input);
  let mut out = Vec::new();
  decoder.read_to_end(&mut out)?;
  Ok(out)
}

fn decompress_deflate(input: &[u8]) -> std::io::Result<Vec<u8>> {
  let mut decoder = flate2::read::DeflateDecoder::new(input);
  let mut out = Vec::new();
  decoder.read_to_end(&mut out)?;
  Ok(out)
}

fn decompress_brotli(input: &[u8]) -> std::io::Result<Vec<u8>> {
  let mut decoder = brotli::Decompressor::new(input, 4096);
  let mut out = Vec::new();
  decoder.read_to_end(&mut out)?;
  Ok(out)
}
