//! Hand-rolled HTTP/1.1 wire handling
//!
//! The dispatcher and the TLS bridge both read requests straight off their
//! sockets. Heads are read one byte at a time so a connection that is about
//! to be hijacked into a tunnel never loses bytes to a read buffer.

use crate::error::{Error, Result};
use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, CONNECTION, CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{HeaderMap, Method, StatusCode, Version};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a request head (request line + headers).
const MAX_HEAD: usize = 64 * 1024;
/// Upper bound on a buffered request body.
const MAX_BODY: usize = 64 * 1024 * 1024;

/// A parsed request line and header block.
#[derive(Debug)]
pub(crate) struct RequestHead {
  pub method: Method,
  pub target: String,
  pub version: Version,
  pub headers: HeaderMap,
}

impl RequestHead {
  /// Host for routing: the request target's authority when present,
  /// otherwise the `Host` header.
  pub(crate) fn host(&self) -> String {
    if self.method == Method::CONNECT {
      return self.target.clone();
    }
    if let Some(rest) = self
      .target
      .strip_prefix("http://")
      .or_else(|| self.target.strip_prefix("https://"))
    {
      if let Some(authority) = rest.split('/').next() {
        if !authority.is_empty() {
          return authority.to_owned();
        }
      }
    }
    self
      .headers
      .get(http::header::HOST)
      .and_then(|v| v.to_str().ok())
      .unwrap_or_default()
      .to_owned()
  }

  /// Whether the client asked for the connection to be closed after the
  /// response.
  pub(crate) fn close_requested(&self) -> bool {
    let connection = self
      .headers
      .get(CONNECTION)
      .and_then(|v| v.to_str().ok())
      .unwrap_or_default()
      .to_ascii_lowercase();
    if connection.contains("close") {
      return true;
    }
    self.version == Version::HTTP_10 && !connection.contains("keep-alive")
  }
}

/// Read a request head, one byte at a time, until the blank line.
///
/// Returns `Ok(None)` on a clean EOF before any byte arrives (the client
/// ended a keep-alive connection).
pub(crate) async fn read_head<R>(stream: &mut R) -> Result<Option<RequestHead>>
where
  R: AsyncRead + Unpin,
{
  let mut buf: Vec<u8> = Vec::with_capacity(512);
  let mut byte = [0u8; 1];
  loop {
    let n = stream.read(&mut byte).await?;
    if n == 0 {
      if buf.is_empty() {
        return Ok(None);
      }
      return Err(Error::invalid_request("EOF inside request head"));
    }
    buf.push(byte[0]);
    if buf.len() > MAX_HEAD {
      return Err(Error::invalid_request("Request head exceeds maximum size"));
    }
    if buf.ends_with(b"\r\n\r\n") || buf.ends_with(b"\n\n") {
      break;
    }
  }
  parse_head(&buf).map(Some)
}

fn parse_head(buf: &[u8]) -> Result<RequestHead> {
  let text = String::from_utf8_lossy(buf);
  let mut lines = text.lines();

  let request_line = lines
    .next()
    .ok_or_else(|| Error::invalid_request("Empty request"))?;
  let mut parts = request_line.split_whitespace();
  let method = parts
    .next()
    .ok_or_else(|| Error::invalid_request("Missing method"))?;
  let target = parts
    .next()
    .ok_or_else(|| Error::invalid_request("Missing request target"))?;
  let version = match parts.next() {
    Some("HTTP/1.0") => Version::HTTP_10,
    Some(v) if v.starts_with("HTTP/") => Version::HTTP_11,
    _ => return Err(Error::invalid_request("Missing HTTP version")),
  };

  let method = Method::from_bytes(method.as_bytes())
    .map_err(|_| Error::invalid_request(format!("Bad method: {}", method)))?;

  let mut headers = HeaderMap::new();
  for line in lines {
    if line.is_empty() {
      break;
    }
    let Some(idx) = line.find(':') else {
      return Err(Error::invalid_request(format!("Bad header line: {}", line)));
    };
    let (name, value) = line.split_at(idx);
    let name = HeaderName::from_bytes(name.trim().as_bytes())
      .map_err(|_| Error::invalid_request(format!("Bad header name: {}", name)))?;
    let value = HeaderValue::from_str(value[1..].trim())
      .map_err(|_| Error::invalid_request("Bad header value"))?;
    headers.append(name, value);
  }

  Ok(RequestHead {
    method,
    target: target.to_owned(),
    version,
    headers,
  })
}

/// Read the request body the head describes: `Content-Length` bytes, a
/// chunked stream, or nothing.
pub(crate) async fn read_body<R>(stream: &mut R, headers: &HeaderMap) -> Result<Bytes>
where
  R: AsyncRead + Unpin,
{
  if let Some(value) = headers.get(CONTENT_LENGTH) {
    let len: usize = value
      .to_str()
      .ok()
      .and_then(|v| v.trim().parse().ok())
      .ok_or_else(|| Error::invalid_request("Bad Content-Length"))?;
    if len > MAX_BODY {
      return Err(Error::invalid_request("Request body exceeds maximum size"));
    }
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    return Ok(Bytes::from(body));
  }

  let chunked = headers
    .get(TRANSFER_ENCODING)
    .and_then(|v| v.to_str().ok())
    .map(|v| v.to_ascii_lowercase().contains("chunked"))
    .unwrap_or(false);
  if chunked {
    return read_chunked_body(stream).await;
  }

  Ok(Bytes::new())
}

async fn read_line<R>(stream: &mut R) -> Result<String>
where
  R: AsyncRead + Unpin,
{
  let mut line = Vec::with_capacity(16);
  let mut byte = [0u8; 1];
  loop {
    let n = stream.read(&mut byte).await?;
    if n == 0 {
      return Err(Error::invalid_request("EOF inside chunked body"));
    }
    if byte[0] == b'\n' {
      break;
    }
    line.push(byte[0]);
    if line.len() > 1024 {
      return Err(Error::invalid_request("Chunk size line too long"));
    }
  }
  if line.last() == Some(&b'\r') {
    line.pop();
  }
  Ok(String::from_utf8_lossy(&line).into_owned())
}

async fn read_chunked_body<R>(stream: &mut R) -> Result<Bytes>
where
  R: AsyncRead + Unpin,
{
  let mut body = Vec::new();
  loop {
    let size_line = read_line(stream).await?;
    let size_hex = size_line.split(';').next().unwrap_or("").trim();
    let size = usize::from_str_radix(size_hex, 16)
      .map_err(|_| Error::invalid_request(format!("Bad chunk size: {}", size_hex)))?;
    if size == 0 {
      // Trailers, if any, run until a blank line.
      loop {
        if read_line(stream).await?.is_empty() {
          break;
        }
      }
      return Ok(Bytes::from(body));
    }
    if body.len() + size > MAX_BODY {
      return Err(Error::invalid_request("Request body exceeds maximum size"));
    }
    let start = body.len();
    body.resize(start + size, 0);
    stream.read_exact(&mut body[start..]).await?;
    // Chunk data is followed by its own CRLF.
    let mut crlf = [0u8; 2];
    stream.read_exact(&mut crlf).await?;
  }
}

/// Write a response status line and header block.
pub(crate) async fn write_head<W>(
  stream: &mut W,
  status: StatusCode,
  headers: &HeaderMap,
) -> Result<()>
where
  W: AsyncWrite + Unpin,
{
  let mut head = Vec::with_capacity(256);
  head.extend_from_slice(
    format!(
      "HTTP/1.1 {} {}\r\n",
      status.as_u16(),
      status.canonical_reason().unwrap_or("Unknown")
    )
    .as_bytes(),
  );
  for (name, value) in headers {
    head.extend_from_slice(name.as_str().as_bytes());
    head.extend_from_slice(b": ");
    head.extend_from_slice(value.as_bytes());
    head.extend_from_slice(b"\r\n");
  }
  head.extend_from_slice(b"\r\n");
  stream.write_all(&head).await?;
  Ok(())
}

/// Write a short plain-text error response.
pub(crate) async fn write_error<W>(stream: &mut W, status: StatusCode, message: &str) -> Result<()>
where
  W: AsyncWrite + Unpin,
{
  let body = format!("{}\n", message);
  let mut headers = HeaderMap::new();
  headers.insert(
    http::header::CONTENT_TYPE,
    HeaderValue::from_static("text/plain; charset=utf-8"),
  );
  headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
  write_head(stream, status, &headers).await?;
  stream.write_all(body.as_bytes()).await?;
  stream.flush().await?;
  Ok(())
}

/// Write one chunk of a chunked-encoded response body.
pub(crate) async fn write_chunk<W>(stream: &mut W, data: &[u8]) -> Result<()>
where
  W: AsyncWrite + Unpin,
{
  stream
    .write_all(format!("{:x}\r\n", data.len()).as_bytes())
    .await?;
  stream.write_all(data).await?;
  stream.write_all(b"\r\n").await?;
  Ok(())
}

/// Terminate a chunked-encoded response body.
pub(crate) async fn finish_chunked<W>(stream: &mut W) -> Result<()>
where
  W: AsyncWrite + Unpin,
{
  stream.write_all(b"0\r\n\r\n").await?;
  Ok(())
}
