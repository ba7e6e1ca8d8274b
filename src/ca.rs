//! On-the-fly certificate mint
//!
//! Root material is supplied by the embedder as PEM bytes and parsed once.
//! A single leaf key pair is generated at startup and reused as the subject
//! key of every minted certificate: leaves are ephemeral, only trusted by
//! clients that installed the root, and key generation is the expensive
//! step. Serial numbers come from an atomic counter and are strictly
//! increasing for the process lifetime.

use crate::error::{Error, Result};
use rcgen::{CertificateParams, DistinguishedName, DnType, Issuer, KeyPair, SanType};
use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tokio_rustls::rustls::crypto::aws_lc_rs::sign::any_supported_type;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::server::{ClientHello, ResolvesServerCert};
use tokio_rustls::rustls::sign::{CertifiedKey, SigningKey};

/// Leaf certificates are backdated one day against clock skew.
const NOT_BEFORE_DAYS: i64 = 1;
/// Leaf certificate lifetime.
const TTL_DAYS: i64 = 365;

/// Issues leaf certificates signed by the embedder-supplied root, keyed by
/// the SNI host a client presents.
pub struct CertificateMint {
  issuer: Issuer<'static, KeyPair>,
  leaf_key: KeyPair,
  signing_key: Arc<dyn SigningKey>,
  serial: AtomicU64,
}

impl CertificateMint {
  /// Parse root material and prepare the shared leaf key.
  ///
  /// Fails if the PEM bytes do not hold a certificate and a matching
  /// private key; the proxy must not start without a working root.
  pub fn from_pem(root_cert_pem: &[u8], root_key_pem: &[u8]) -> Result<Self> {
    let cert_pem = std::str::from_utf8(root_cert_pem)
      .map_err(|_| Error::certificate("Root certificate PEM is not UTF-8"))?;
    let key_pem = std::str::from_utf8(root_key_pem)
      .map_err(|_| Error::certificate("Root key PEM is not UTF-8"))?;

    let root_key = KeyPair::from_pem(key_pem)
      .map_err(|e| Error::certificate(format!("Failed to parse root key: {}", e)))?;
    let issuer = Issuer::from_ca_cert_pem(cert_pem, root_key)
      .map_err(|e| Error::certificate(format!("Failed to parse root certificate: {}", e)))?;

    let leaf_key = KeyPair::generate()
      .map_err(|e| Error::certificate(format!("Failed to generate leaf key: {}", e)))?;
    let leaf_key_der = PrivateKeyDer::try_from(leaf_key.serialize_der())
      .map_err(|_| Error::certificate("Failed to serialize leaf key"))?;
    let signing_key = any_supported_type(&leaf_key_der)
      .map_err(|e| Error::certificate(format!("Leaf key unusable for TLS: {}", e)))?;

    Ok(Self {
      issuer,
      leaf_key,
      signing_key,
      serial: AtomicU64::new(0),
    })
  }

  /// Mint a leaf certificate for `host`.
  ///
  /// Subject CN is the host; the SAN is an IP entry when the host parses as
  /// a literal address, a DNS entry otherwise. The returned bundle carries
  /// the leaf certificate alone, keyed by the shared leaf key.
  pub fn mint(&self, host: &str) -> Result<Arc<CertifiedKey>> {
    let serial = self.serial.fetch_add(1, Ordering::SeqCst) + 1;

    let mut params = CertificateParams::default();
    params.serial_number = Some(serial.into());

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, host);
    params.distinguished_name = dn;

    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::days(NOT_BEFORE_DAYS);
    params.not_after = now + Duration::days(TTL_DAYS);

    params.subject_alt_names = if let Ok(ip) = host.parse::<IpAddr>() {
      vec![SanType::IpAddress(ip)]
    } else {
      vec![SanType::DnsName(host.try_into().map_err(|_| {
        Error::certificate(format!("Invalid SNI host: {}", host))
      })?)]
    };

    let cert = params
      .signed_by(&self.leaf_key, &self.issuer)
      .map_err(|e| Error::certificate(format!("Failed to sign leaf for {}: {}", host, e)))?;

    let chain = vec![CertificateDer::from(cert.der().to_vec())];
    Ok(Arc::new(CertifiedKey::new(chain, self.signing_key.clone())))
  }

  /// Number of certificates issued so far.
  pub fn issued(&self) -> u64 {
    self.serial.load(Ordering::SeqCst)
  }
}

impl fmt::Debug for CertificateMint {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CertificateMint")
      .field("issued", &self.issued())
      .finish_non_exhaustive()
  }
}

/// rustls certificate resolver delegating to the mint with the client's SNI.
///
/// A missing server name or a mint failure resolves to `None`, which aborts
/// the handshake; the client observes a TLS error and the proxy keeps
/// serving other connections.
pub(crate) struct MintResolver {
  mint: Arc<CertificateMint>,
}

impl MintResolver {
  pub(crate) fn new(mint: Arc<CertificateMint>) -> Self {
    Self { mint }
  }
}

impl fmt::Debug for MintResolver {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("MintResolver").finish_non_exhaustive()
  }
}

impl ResolvesServerCert for MintResolver {
  fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
    let host = match client_hello.server_name() {
      Some(name) => name.to_owned(),
      None => {
        tracing::debug!("client hello without SNI, refusing handshake");
        return None;
      }
    };
    match self.mint.mint(&host) {
      Ok(certified) => Some(certified),
      Err(e) => {
        tracing::error!("leaf mint failed for {}: {}", host, e);
        None
      }
    }
  }
}
