//! Capture records emitted for every intercepted exchange

use base64::prelude::{Engine as _, BASE64_STANDARD};
use http::header::{COOKIE, SET_COOKIE};
use http::HeaderMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio_rustls::rustls::{ProtocolVersion, ServerConnection};

/// TLS parameters of the decrypted client connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsMeta {
  /// SNI the client presented
  pub server_name: String,
  /// Negotiated ALPN protocol, empty when none
  pub negotiated_protocol: String,
  /// Protocol version label: `1.0` / `1.1` / `1.2` / `1.3`
  pub version: String,
  /// Channel-binding exporter bytes, base64
  pub unique: String,
  /// RFC cipher-suite name, empty for unknown ids
  pub cipher_suite: String,
}

impl TlsMeta {
  /// Snapshot the connection once the handshake has completed.
  pub(crate) fn from_connection(conn: &ServerConnection) -> Self {
    let unique = conn
      .export_keying_material([0u8; 32], b"EXPORTER-Channel-Binding", None)
      .map(|bytes| BASE64_STANDARD.encode(bytes))
      .unwrap_or_default();
    Self {
      server_name: conn.server_name().unwrap_or_default().to_owned(),
      negotiated_protocol: conn
        .alpn_protocol()
        .map(|p| String::from_utf8_lossy(p).into_owned())
        .unwrap_or_default(),
      version: version_label(conn.protocol_version()).to_owned(),
      unique,
      cipher_suite: conn
        .negotiated_cipher_suite()
        .map(|s| cipher_suite_name(u16::from(s.suite())))
        .unwrap_or_default()
        .to_owned(),
    }
  }
}

/// One observed request/response exchange.
///
/// `size` counts the body bytes written to the client as they went over the
/// wire; `resp_body` holds the post-decompression text. Header maps collapse
/// multi-valued headers to their first value; cookies map name to the raw
/// pair or `Set-Cookie` line.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CaptureRecord {
  /// Full request URL
  pub url: String,
  /// Peer address of the originating client socket
  pub remote_addr: String,
  /// Request method
  pub method: String,
  /// Media type of the response, parameters stripped
  pub content_type: String,
  /// Upstream round-trip time in milliseconds
  pub time: u64,
  /// Response body bytes written to the client
  pub size: u64,
  /// Response status code
  pub status: u16,
  /// Request headers, first value per name
  pub req_header: HashMap<String, String>,
  /// Request cookies, name to raw pair
  pub req_cookie: HashMap<String, String>,
  /// Request body
  pub req_body: String,
  /// Response headers, first value per name
  pub resp_header: HashMap<String, String>,
  /// Response cookies, name to raw `Set-Cookie` value
  pub resp_cookie: HashMap<String, String>,
  /// Response body after decoding the declared content encoding
  pub resp_body: String,
  /// TLS parameters, absent for plaintext interception
  pub tls: Option<TlsMeta>,
}

/// Collapse headers to a first-value-only map.
pub(crate) fn header_map(headers: &HeaderMap) -> HashMap<String, String> {
  let mut map = HashMap::with_capacity(headers.keys_len());
  for name in headers.keys() {
    if let Some(value) = headers.get(name) {
      let value = value
        .to_str()
        .map(str::to_owned)
        .unwrap_or_else(|_| String::from_utf8_lossy(value.as_bytes()).into_owned());
      map.insert(name.as_str().to_owned(), value);
    }
  }
  map
}

/// Cookies the client sent, keyed by name, valued by the raw pair.
pub(crate) fn request_cookies(headers: &HeaderMap) -> HashMap<String, String> {
  let mut map = HashMap::new();
  for value in headers.get_all(COOKIE) {
    let Ok(value) = value.to_str() else { continue };
    for pair in value.split(';') {
      let pair = pair.trim();
      if let Ok(parsed) = cookie::Cookie::parse(pair) {
        map.insert(parsed.name().to_owned(), pair.to_owned());
      }
    }
  }
  map
}

/// Cookies the origin set, keyed by name, valued by the raw header line.
pub(crate) fn response_cookies(headers: &HeaderMap) -> HashMap<String, String> {
  let mut map = HashMap::new();
  for value in headers.get_all(SET_COOKIE) {
    let Ok(value) = value.to_str() else { continue };
    if let Ok(parsed) = cookie::Cookie::parse(value) {
      map.insert(parsed.name().to_owned(), value.to_owned());
    }
  }
  map
}

/// First `;`-separated token of a `Content-Type` value that is not a
/// `charset=` directive; the whole value when no token qualifies.
pub(crate) fn first_media_token(content_type: &str) -> String {
  for token in content_type.split(';') {
    let token = token.trim();
    if token.is_empty() {
      continue;
    }
    if token.to_ascii_lowercase().contains("charset=") {
      continue;
    }
    return token.to_owned();
  }
  content_type.to_owned()
}

/// Whether a response should be streamed with size-only capture.
pub(crate) fn is_image(content_type: &str) -> bool {
  content_type
    .get(..6)
    .map(|head| head.eq_ignore_ascii_case("image/"))
    .unwrap_or(false)
}

fn version_label(version: Option<ProtocolVersion>) -> &'static str {
  match version {
    Some(ProtocolVersion::TLSv1_0) => "1.0",
    Some(ProtocolVersion::TLSv1_1) => "1.1",
    Some(ProtocolVersion::TLSv1_2) => "1.2",
    Some(ProtocolVersion::TLSv1_3) => "1.3",
    _ => "Unknown",
  }
}

/// RFC names for the cipher suites the capture schema recognizes; unknown
/// ids map to the empty string.
pub(crate) fn cipher_suite_name(id: u16) -> &'static str {
  match id {
    0x0005 => "TLS_RSA_WITH_RC4_128_SHA",
    0x000a => "TLS_RSA_WITH_3DES_EDE_CBC_SHA",
    0x002f => "TLS_RSA_WITH_AES_128_CBC_SHA",
    0x0035 => "TLS_RSA_WITH_AES_256_CBC_SHA",
    0x003c => "TLS_RSA_WITH_AES_128_CBC_SHA256",
    0x009c => "TLS_RSA_WITH_AES_128_GCM_SHA256",
    0x009d => "TLS_RSA_WITH_AES_256_GCM_SHA384",
    0xc007 => "TLS_ECDHE_ECDSA_WITH_RC4_128_SHA",
    0xc009 => "TLS_ECDHE_ECDSA_WITH_AES_128_CBC_SHA",
    0xc00a => "TLS_ECDHE_ECDSA_WITH_AES_256_CBC_SHA",
    0xc011 => "TLS_ECDHE_RSA_WITH_RC4_128_SHA",
    0xc012 => "TLS_ECDHE_RSA_WITH_3DES_EDE_CBC_SHA",
    0xc013 => "TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA",
    0xc014 => "TLS_ECDHE_RSA_WITH_AES_256_CBC_SHA",
    0xc023 => "TLS_ECDHE_ECDSA_WITH_AES_128_CBC_SHA256",
    0xc027 => "TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA256",
    0xc02b => "TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256",
    0xc02c => "TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384",
    0xc02f => "TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256",
    0xc030 => "TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384",
    0xcca8 => "TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256",
    0xcca9 => "TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256",
    0x1301 => "TLS_AES_128_GCM_SHA256",
    0x1302 => "TLS_AES_256_GCM_SHA384",
    0x1303 => "TLS_CHACHA20_POLY1305_SHA256",
    _ => "",
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use http::header::{HeaderValue, CONTENT_TYPE};

  #[test]
  fn media_token_skips_charset() {
    assert_eq!(first_media_token("text/html; charset=utf-8"), "text/html");
    assert_eq!(
      first_media_token("charset=utf-8; application/json"),
      "application/json"
    );
    assert_eq!(first_media_token("text/plain"), "text/plain");
    assert_eq!(first_media_token(""), "");
    assert_eq!(first_media_token("; charset=utf-8"), "; charset=utf-8");
  }

  #[test]
  fn image_detection_is_prefix_based() {
    assert!(is_image("image/png"));
    assert!(is_image("IMAGE/jpeg"));
    assert!(!is_image("text/html"));
    assert!(!is_image("application/imageset"));
  }

  #[test]
  fn header_map_keeps_first_value_only() {
    let mut headers = HeaderMap::new();
    headers.append(SET_COOKIE, HeaderValue::from_static("a=1"));
    headers.append(SET_COOKIE, HeaderValue::from_static("b=2"));
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    let map = header_map(&headers);
    assert_eq!(map.get("set-cookie").map(String::as_str), Some("a=1"));
    assert_eq!(map.get("content-type").map(String::as_str), Some("text/plain"));
  }

  #[test]
  fn cookies_key_by_name_and_keep_raw() {
    let mut headers = HeaderMap::new();
    headers.insert(COOKIE, HeaderValue::from_static("sid=abc; theme=dark"));
    headers.append(
      SET_COOKIE,
      HeaderValue::from_static("sid=xyz; Path=/; HttpOnly"),
    );
    let req = request_cookies(&headers);
    assert_eq!(req.get("sid").map(String::as_str), Some("sid=abc"));
    assert_eq!(req.get("theme").map(String::as_str), Some("theme=dark"));
    let resp = response_cookies(&headers);
    assert_eq!(
      resp.get("sid").map(String::as_str),
      Some("sid=xyz; Path=/; HttpOnly")
    );
  }

  #[test]
  fn cipher_table_covers_known_and_unknown() {
    assert_eq!(cipher_suite_name(0x1301), "TLS_AES_128_GCM_SHA256");
    assert_eq!(
      cipher_suite_name(0xc02f),
      "TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256"
    );
    assert_eq!(cipher_suite_name(0xbeef), "");
  }

  #[test]
  fn record_serializes() {
    let record = CaptureRecord {
      url: "https://api.example/ping".into(),
      method: "GET".into(),
      status: 200,
      size: 4,
      resp_body: "pong".into(),
      ..Default::default()
    };
    let json = serde_json::to_string(&record).unwrap();
    assert!(json.contains("\"url\":\"https://api.example/ping\""));
    assert!(json.contains("\"status\":200"));
    let back: CaptureRecord = serde_json::from_str(&json).unwrap();
    assert_eq!(back.resp_body, "pong");
  }
}
