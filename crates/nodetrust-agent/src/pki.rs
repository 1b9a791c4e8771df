//! Local key material
//!
//! The node's key pair and CA bundle are provisioned onto disk before the
//! agent starts. The agent publishes the certificate; the key and CA are
//! held for the enforcer and never leave the node.

use std::fs;
use std::path::{Path, PathBuf};

use nodetrust_certs::identity::CertificateError;
use nodetrust_certs::Certificate;
use thiserror::Error;
use zeroize::Zeroizing;

/// Private key file name
pub const KEY_FILE: &str = "key.pem";
/// Certificate file name
pub const CERT_FILE: &str = "cert.pem";
/// CA bundle file name
pub const CA_FILE: &str = "ca.pem";

const PRIVATE_KEY_TAGS: &[&str] = &["PRIVATE KEY", "EC PRIVATE KEY", "RSA PRIVATE KEY"];

/// Errors loading local key material
#[derive(Debug, Error)]
pub enum PkiError {
    /// File missing or unreadable
    #[error("failed to read {path}: {source}")]
    Read {
        /// File that failed
        path: PathBuf,
        /// Underlying IO error
        source: std::io::Error,
    },

    /// Certificate or CA file is not a PEM certificate
    #[error("invalid certificate in {path}: {source}")]
    InvalidCertificate {
        /// File that failed
        path: PathBuf,
        /// Why it was rejected
        source: CertificateError,
    },

    /// Key file is not a PEM private key
    #[error("invalid private key in {path}: {message}")]
    InvalidKey {
        /// File that failed
        path: PathBuf,
        /// Why it was rejected
        message: String,
    },
}

/// Key pair and CA loaded from the PKI directory
pub struct LocalPki {
    /// This node's certificate
    pub certificate: Certificate,
    /// This node's private key PEM (zeroized on drop)
    pub key_pem: Zeroizing<String>,
    /// CA certificate that signs node certificates
    pub ca: Certificate,
}

impl LocalPki {
    /// Load `key.pem`, `cert.pem` and `ca.pem` from `dir`
    pub fn load(dir: &Path) -> Result<Self, PkiError> {
        let key_path = dir.join(KEY_FILE);
        let key_pem = Zeroizing::new(read(&key_path)?);
        validate_key(&key_pem).map_err(|message| PkiError::InvalidKey {
            path: key_path,
            message,
        })?;

        Ok(Self {
            certificate: load_certificate(&dir.join(CERT_FILE))?,
            key_pem,
            ca: load_certificate(&dir.join(CA_FILE))?,
        })
    }
}

impl std::fmt::Debug for LocalPki {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalPki")
            .field("certificate", &self.certificate)
            .field("key_pem", &"<redacted>")
            .field("ca", &self.ca)
            .finish()
    }
}

fn read(path: &Path) -> Result<String, PkiError> {
    fs::read_to_string(path).map_err(|source| PkiError::Read {
        path: path.to_path_buf(),
        source,
    })
}

fn load_certificate(path: &Path) -> Result<Certificate, PkiError> {
    Certificate::from_pem(read(path)?).map_err(|source| PkiError::InvalidCertificate {
        path: path.to_path_buf(),
        source,
    })
}

fn validate_key(key_pem: &str) -> Result<(), String> {
    let parsed = pem::parse(key_pem).map_err(|e| e.to_string())?;
    if PRIVATE_KEY_TAGS.contains(&parsed.tag()) {
        Ok(())
    } else {
        Err(format!("unexpected PEM block '{}'", parsed.tag()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_pki(dir: &Path, name: &str) {
        let key = rcgen::KeyPair::generate().unwrap();
        let params = rcgen::CertificateParams::new(vec![name.to_string()]).unwrap();
        let cert = params.self_signed(&key).unwrap();

        let ca_key = rcgen::KeyPair::generate().unwrap();
        let mut ca_params = rcgen::CertificateParams::new(Vec::<String>::new()).unwrap();
        ca_params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        let ca = ca_params.self_signed(&ca_key).unwrap();

        fs::write(dir.join(KEY_FILE), key.serialize_pem()).unwrap();
        fs::write(dir.join(CERT_FILE), cert.pem()).unwrap();
        fs::write(dir.join(CA_FILE), ca.pem()).unwrap();
    }

    #[test]
    fn loads_complete_directory() {
        let dir = TempDir::new().unwrap();
        write_pki(dir.path(), "worker-1");

        let pki = LocalPki::load(dir.path()).unwrap();

        assert!(pki.key_pem.contains("PRIVATE KEY"));
        assert!(pki.certificate.info().is_some());
        assert_ne!(pki.certificate, pki.ca);
    }

    #[test]
    fn missing_file_names_the_path() {
        let dir = TempDir::new().unwrap();
        write_pki(dir.path(), "worker-1");
        fs::remove_file(dir.path().join(CA_FILE)).unwrap();

        let err = LocalPki::load(dir.path()).unwrap_err();

        assert!(matches!(err, PkiError::Read { ref path, .. } if path.ends_with(CA_FILE)));
    }

    #[test]
    fn certificate_in_key_slot_is_rejected() {
        let dir = TempDir::new().unwrap();
        write_pki(dir.path(), "worker-1");
        let cert = fs::read_to_string(dir.path().join(CERT_FILE)).unwrap();
        fs::write(dir.path().join(KEY_FILE), cert).unwrap();

        let err = LocalPki::load(dir.path()).unwrap_err();

        assert!(matches!(err, PkiError::InvalidKey { .. }));
    }

    #[test]
    fn garbage_certificate_is_rejected() {
        let dir = TempDir::new().unwrap();
        write_pki(dir.path(), "worker-1");
        fs::write(dir.path().join(CERT_FILE), "not pem").unwrap();

        let err = LocalPki::load(dir.path()).unwrap_err();

        assert!(matches!(err, PkiError::InvalidCertificate { .. }));
    }

    #[test]
    fn debug_redacts_key() {
        let dir = TempDir::new().unwrap();
        write_pki(dir.path(), "worker-1");
        let pki = LocalPki::load(dir.path()).unwrap();

        assert!(!format!("{pki:?}").contains("BEGIN PRIVATE KEY"));
    }
}
