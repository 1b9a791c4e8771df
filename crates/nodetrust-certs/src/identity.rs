//! Node identities and the certificates published under them

use std::fmt;

use thiserror::Error;
use x509_parser::prelude::*;

/// Maximum length of a server name carried in peer tokens.
///
/// Node names longer than this are truncated when deriving a
/// [`NodeIdentity`], so the identity matches what peers put in their tokens.
pub const MAX_SERVER_NAME_LEN: usize = 24;

/// PEM tag accepted for published certificates
pub const CERTIFICATE_PEM_TAG: &str = "CERTIFICATE";

/// Stable identity of a node agent, used as the trust cache key.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeIdentity(String);

impl NodeIdentity {
    /// Derive the identity for a node name, truncating it to
    /// [`MAX_SERVER_NAME_LEN`] bytes on a char boundary.
    pub fn from_node_name(node_name: &str) -> Self {
        Self(truncate_server_name(node_name).to_string())
    }

    /// The identity as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Truncate a node name to the maximum server name length.
pub fn truncate_server_name(name: &str) -> &str {
    if name.len() <= MAX_SERVER_NAME_LEN {
        return name;
    }
    let mut end = MAX_SERVER_NAME_LEN;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

/// Errors for certificates that cannot be accepted
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CertificateError {
    /// Value is not PEM at all
    #[error("invalid PEM: {0}")]
    InvalidPem(String),

    /// PEM block is something other than a certificate
    #[error("unexpected PEM block '{0}', expected {CERTIFICATE_PEM_TAG}")]
    UnexpectedTag(String),
}

/// A PEM-encoded public certificate.
///
/// Equality compares the decoded DER, so formatting differences in the PEM
/// text (line endings, trailing newlines) do not count as a change.
#[derive(Clone)]
pub struct Certificate {
    pem: String,
    der: Vec<u8>,
}

impl Certificate {
    /// Parse and validate a PEM certificate
    pub fn from_pem(pem_data: impl Into<String>) -> Result<Self, CertificateError> {
        let pem_text = pem_data.into();
        let parsed = ::pem::parse(pem_text.as_bytes())
            .map_err(|e| CertificateError::InvalidPem(e.to_string()))?;
        if parsed.tag() != CERTIFICATE_PEM_TAG {
            return Err(CertificateError::UnexpectedTag(parsed.tag().to_string()));
        }
        Ok(Self {
            der: parsed.contents().to_vec(),
            pem: pem_text,
        })
    }

    /// The PEM text exactly as published
    pub fn as_pem(&self) -> &str {
        &self.pem
    }

    /// The decoded DER bytes
    pub fn der(&self) -> &[u8] {
        &self.der
    }

    /// Parse subject and validity for logging. `None` if the DER is not a
    /// well-formed X.509 certificate.
    pub fn info(&self) -> Option<CertificateInfo> {
        CertificateInfo::from_der(&self.der)
    }
}

impl PartialEq for Certificate {
    fn eq(&self, other: &Self) -> bool {
        self.der == other.der
    }
}

impl Eq for Certificate {}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Certificate")
            .field("der_len", &self.der.len())
            .finish()
    }
}

/// Subject and expiry of a certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateInfo {
    /// Subject common name (empty if absent)
    pub common_name: String,
    /// Expiry as a Unix timestamp
    pub not_after: i64,
}

impl CertificateInfo {
    fn from_der(der: &[u8]) -> Option<Self> {
        let (_, cert) = X509Certificate::from_der(der).ok()?;
        let common_name = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .unwrap_or("")
            .to_string();
        Some(Self {
            common_name,
            not_after: cert.validity().not_after.timestamp(),
        })
    }
}
