//! Fake root certificate authority for signing forged TLS leaf certificates
//!
//! The root is either generated fresh (`genca`) or loaded from PEM files at
//! startup. Leaves are issued on demand for intercepted domains; each call
//! produces an independent key pair — caching is the dispatcher's job.

use crate::error::{Error, Result};
use rcgen::{
  BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
  Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use rand::Rng;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use time::{Duration, OffsetDateTime};
use rustls_pki_types::{CertificateDer, PrivateKeyDer};

/// Root validity: backdated 30 days to survive client clock skew
const ROOT_NOT_BEFORE_DAYS: i64 = 30;
/// Leaf validity: backdated 7 days
const LEAF_NOT_BEFORE_DAYS: i64 = 7;
/// Both root and leaves stay valid 10 years forward
const NOT_AFTER_DAYS: i64 = 3650;

/// Fake root CA for signing fake TLS certificates
pub struct FakeCa {
  issuer: Issuer<'static, KeyPair>,
  cert_pem: String,
  key_pem: String,
}

/// PEM-encoded leaf certificate and private key for one domain
#[derive(Clone)]
pub struct LeafCert {
  pub cert_pem: String,
  pub key_pem: String,
}

fn fake_name() -> DistinguishedName {
  let mut dn = DistinguishedName::new();
  dn.push(DnType::CommonName, "Fake CA");
  dn.push(DnType::OrganizationName, "Fake CA");
  dn.push(DnType::CountryName, "US");
  dn.push(DnType::StateOrProvinceName, "California");
  dn.push(DnType::LocalityName, "San Jose");
  dn
}

impl FakeCa {
  /// Generate a fresh self-signed root CA
  pub fn generate() -> Result<Self> {
    let mut params = CertificateParams::default();
    params.distinguished_name = fake_name();
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
      KeyUsagePurpose::DigitalSignature,
      KeyUsagePurpose::KeyCertSign,
    ];
    params.extended_key_usages = vec![
      ExtendedKeyUsagePurpose::ClientAuth,
      ExtendedKeyUsagePurpose::ServerAuth,
    ];

    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::days(ROOT_NOT_BEFORE_DAYS);
    params.not_after = now + Duration::days(NOT_AFTER_DAYS);

    let key_pair = KeyPair::generate()
      .map_err(|e| Error::certificate(format!("Failed to generate CA key pair: {}", e)))?;

    let cert = params
      .self_signed(&key_pair)
      .map_err(|e| Error::certificate(format!("Failed to self-sign CA certificate: {}", e)))?;

    let cert_pem = cert.pem();
    let key_pem = key_pair.serialize_pem();

    let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)
      .map_err(|e| Error::certificate(format!("Failed to create issuer: {}", e)))?;

    Ok(Self {
      issuer,
      cert_pem,
      key_pem,
    })
  }

  /// Load an existing root CA from PEM-encoded key and certificate
  ///
  /// Rejects missing or malformed blocks with a descriptive error instead of
  /// panicking.
  pub fn from_pem(key_pem: &str, cert_pem: &str) -> Result<Self> {
    let key_pair = KeyPair::from_pem(key_pem)
      .map_err(|e| Error::certificate(format!("Failed to parse CA private key: {}", e)))?;

    let issuer = Issuer::from_ca_cert_pem(cert_pem, key_pair)
      .map_err(|e| Error::certificate(format!("Failed to parse CA certificate: {}", e)))?;

    Ok(Self {
      issuer,
      cert_pem: cert_pem.to_string(),
      key_pem: key_pem.to_string(),
    })
  }

  /// Issue a leaf certificate for the given DNS names, signed by this root
  ///
  /// Loopback IP SANs are always included so local test clients connecting
  /// to 127.0.0.1 / ::1 validate too. Every call generates a new key pair.
  pub fn issue(&self, dns_names: &[String]) -> Result<LeafCert> {
    let mut params = CertificateParams::default();
    params.serial_number = Some(rand::thread_rng().gen::<u64>().into());

    let mut dn = DistinguishedName::new();
    dn.push(
      DnType::CommonName,
      dns_names.first().map(String::as_str).unwrap_or("Fake CA"),
    );
    params.distinguished_name = dn;

    let mut sans = Vec::with_capacity(dns_names.len() + 2);
    for name in dns_names {
      let dns_name = name
        .as_str()
        .try_into()
        .map_err(|_| Error::certificate(format!("Invalid domain name: {}", name)))?;
      sans.push(SanType::DnsName(dns_name));
    }
    sans.push(SanType::IpAddress(IpAddr::V4(Ipv4Addr::LOCALHOST)));
    sans.push(SanType::IpAddress(IpAddr::V6(Ipv6Addr::LOCALHOST)));
    params.subject_alt_names = sans;

    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::days(LEAF_NOT_BEFORE_DAYS);
    params.not_after = now + Duration::days(NOT_AFTER_DAYS);

    params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
    params.extended_key_usages = vec![
      ExtendedKeyUsagePurpose::ClientAuth,
      ExtendedKeyUsagePurpose::ServerAuth,
    ];

    let key_pair = KeyPair::generate()
      .map_err(|e| Error::certificate(format!("Failed to generate leaf key pair: {}", e)))?;

    let cert = params
      .signed_by(&key_pair, &self.issuer)
      .map_err(|e| Error::certificate(format!("Failed to sign leaf certificate: {}", e)))?;

    Ok(LeafCert {
      cert_pem: cert.pem(),
      key_pem: key_pair.serialize_pem(),
    })
  }

  /// Root certificate in PEM form, for persistence and trust-store install
  pub fn cert_pem(&self) -> &str {
    &self.cert_pem
  }

  /// Root private key in PEM form
  pub fn key_pem(&self) -> &str {
    &self.key_pem
  }
}

impl LeafCert {
  /// Parse the PEM pair into the DER types rustls consumes
  pub fn to_der(&self) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let mut cursor = std::io::Cursor::new(self.cert_pem.as_bytes());
    let certs = rustls_pemfile::certs(&mut cursor)
      .collect::<std::result::Result<Vec<_>, _>>()
      .map_err(|e| Error::certificate(format!("Failed to parse leaf certificate PEM: {}", e)))?;
    if certs.is_empty() {
      return Err(Error::certificate("No certificate found in leaf PEM"));
    }

    let mut cursor = std::io::Cursor::new(self.key_pem.as_bytes());
    let key = rustls_pemfile::private_key(&mut cursor)
      .map_err(|e| Error::certificate(format!("Failed to parse leaf key PEM: {}", e)))?
      .ok_or_else(|| Error::certificate("No private key found in leaf PEM"))?;

    Ok((certs, key))
  }
}
