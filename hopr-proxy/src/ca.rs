//! Certificate authority used to terminate intercepted TLS connections
//!
//! The CA certificate on disk doubles as the proxy's readiness signal: it is
//! written with a temp-file rename, so a reader either sees the complete PEM
//! or nothing.

use crate::error::{ProxyError, Result};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, SerialNumber,
};
use rustls::crypto::ring::default_provider;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

pub const CA_CERT_FILE: &str = "hopr-ca-cert.pem";
pub const CA_KEY_FILE: &str = "hopr-ca-key.pem";

const CA_COMMON_NAME: &str = "hopr interception CA";

/// Issues per-host leaf certificates signed by a locally generated CA
pub struct CertificateAuthority {
    issuer: Certificate,
    issuer_key: KeyPair,
    cert_pem: String,
    cert_der: CertificateDer<'static>,
    leaf_configs: Mutex<HashMap<String, Arc<ServerConfig>>>,
}

impl CertificateAuthority {
    /// Load the CA from `dir`, generating and persisting a new one if absent
    pub fn load_or_create(dir: &Path) -> Result<Self> {
        let cert_path = dir.join(CA_CERT_FILE);
        let key_path = dir.join(CA_KEY_FILE);

        if cert_path.exists() && key_path.exists() {
            Self::load(&cert_path, &key_path)
        } else {
            Self::create(dir, &cert_path, &key_path)
        }
    }

    fn load(cert_path: &Path, key_path: &Path) -> Result<Self> {
        let cert_pem = read_pem(cert_path)?;
        let key_pem = read_pem(key_path)?;

        let issuer_key = KeyPair::from_pem(&key_pem)?;
        // Re-signing the parsed params keeps subject and key identical to the
        // certificate on disk, which is all chain verification looks at.
        let issuer = CertificateParams::from_ca_cert_pem(&cert_pem)?.self_signed(&issuer_key)?;
        let cert_der = CertificateDer::from_pem_slice(cert_pem.as_bytes()).map_err(|e| {
            ProxyError::CaLoad {
                path: cert_path.to_path_buf(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()),
            }
        })?;

        debug!("Loaded CA certificate from {:?}", cert_path);
        Ok(Self::from_parts(issuer, issuer_key, cert_pem, cert_der))
    }

    fn create(dir: &Path, cert_path: &Path, key_path: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;

        let issuer_key = KeyPair::generate()?;
        let mut params = CertificateParams::default();
        let mut name = DistinguishedName::new();
        name.push(DnType::CommonName, CA_COMMON_NAME);
        name.push(DnType::OrganizationName, "hopr");
        params.distinguished_name = name;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.serial_number = Some(random_serial());

        let issuer = params.self_signed(&issuer_key)?;
        let cert_pem = issuer.pem();

        // Key first: the certificate appearing is what readers wait for
        write_atomic(key_path, issuer_key.serialize_pem().as_bytes(), true)?;
        write_atomic(cert_path, cert_pem.as_bytes(), false)?;

        info!("Generated CA certificate at {:?}", cert_path);
        let cert_der = issuer.der().clone();
        Ok(Self::from_parts(issuer, issuer_key, cert_pem, cert_der))
    }

    fn from_parts(
        issuer: Certificate,
        issuer_key: KeyPair,
        cert_pem: String,
        cert_der: CertificateDer<'static>,
    ) -> Self {
        Self {
            issuer,
            issuer_key,
            cert_pem,
            cert_der,
            leaf_configs: Mutex::new(HashMap::new()),
        }
    }

    /// The CA certificate exactly as stored on disk
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// DER form of the certificate on disk, usable as a trust anchor
    pub fn cert_der(&self) -> CertificateDer<'static> {
        self.cert_der.clone()
    }

    /// TLS server configuration presenting a certificate for `host`
    pub fn server_config(&self, host: &str) -> Result<Arc<ServerConfig>> {
        let host = host.to_ascii_lowercase();

        if let Some(config) = self
            .leaf_configs
            .lock()
            .ok()
            .and_then(|cache| cache.get(&host).cloned())
        {
            return Ok(config);
        }

        let config = Arc::new(self.issue_server_config(&host)?);
        if let Ok(mut cache) = self.leaf_configs.lock() {
            cache.insert(host, config.clone());
        }
        Ok(config)
    }

    fn issue_server_config(&self, host: &str) -> Result<ServerConfig> {
        let leaf_key = KeyPair::generate()?;
        let mut params = CertificateParams::new(vec![host.to_string()])?;
        params.distinguished_name.push(DnType::CommonName, host);
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.serial_number = Some(random_serial());

        let leaf = params.signed_by(&leaf_key, &self.issuer, &self.issuer_key)?;
        let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(leaf_key.serialize_der()));

        let mut config = ServerConfig::builder_with_provider(Arc::new(default_provider()))
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(vec![leaf.der().clone()], key_der)?;
        // Only HTTP/1.1 is served inside the tunnel
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        debug!("Issued leaf certificate for {}", host);
        Ok(config)
    }
}

fn random_serial() -> SerialNumber {
    let mut bytes = *uuid::Uuid::new_v4().as_bytes();
    // Keep the DER integer positive
    bytes[0] &= 0x7f;
    SerialNumber::from_slice(&bytes)
}

fn read_pem(path: &Path) -> Result<String> {
    fs::read_to_string(path).map_err(|source| ProxyError::CaLoad {
        path: path.to_path_buf(),
        source,
    })
}

fn write_atomic(path: &Path, contents: &[u8], private: bool) -> Result<()> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp_path = path.with_file_name(format!(".{}.tmp", file_name));

    let mut file = fs::File::create(&tmp_path)?;
    file.write_all(contents)?;
    file.sync_all()?;
    drop(file);

    if private {
        restrict_to_owner(&tmp_path)?;
    }

    fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(unix)]
fn restrict_to_owner(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_to_owner(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_create_writes_material() {
        let dir = TempDir::new().unwrap();
        let ca = CertificateAuthority::load_or_create(dir.path()).unwrap();

        let on_disk = fs::read_to_string(dir.path().join(CA_CERT_FILE)).unwrap();
        assert_eq!(on_disk, ca.cert_pem());
        assert!(on_disk.starts_with("-----BEGIN CERTIFICATE-----"));
        assert!(dir.path().join(CA_KEY_FILE).exists());
        assert!(!dir.path().join(format!(".{}.tmp", CA_CERT_FILE)).exists());
    }

    #[test]
    fn test_reload_keeps_certificate() {
        let dir = TempDir::new().unwrap();
        let first = CertificateAuthority::load_or_create(dir.path()).unwrap();
        let second = CertificateAuthority::load_or_create(dir.path()).unwrap();

        assert_eq!(first.cert_pem(), second.cert_pem());
        assert_eq!(first.cert_der(), second.cert_der());
    }

    #[cfg(unix)]
    #[test]
    fn test_key_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        CertificateAuthority::load_or_create(dir.path()).unwrap();

        let mode = fs::metadata(dir.path().join(CA_KEY_FILE)).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_leaf_configs_are_cached() {
        let dir = TempDir::new().unwrap();
        let ca = CertificateAuthority::load_or_create(dir.path()).unwrap();

        let first = ca.server_config("gamejoin.roblox.com").unwrap();
        let again = ca.server_config("GameJoin.Roblox.com").unwrap();
        let other = ca.server_config("apis.roblox.com").unwrap();

        assert!(Arc::ptr_eq(&first, &again));
        assert!(!Arc::ptr_eq(&first, &other));
        assert_eq!(first.alpn_protocols, vec![b"http/1.1".to_vec()]);
    }
}
