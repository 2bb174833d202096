use std::fs;
use std::path::Path;
use std::sync::OnceLock;

use rustls::pki_types::CertificateDer;
use rustls::{ClientConfig, RootCertStore, ServerConfig};

use crate::error::ServerError;

/// Installs the ring crypto provider as the process default. Safe to call
/// more than once.
pub fn install_default_crypto_provider() {
    static INSTALL: OnceLock<()> = OnceLock::new();
    INSTALL.get_or_init(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Loads a server-side TLS configuration from PEM certificate and key files.
pub fn load_server_config(cert_path: &Path, key_path: &Path) -> Result<ServerConfig, ServerError> {
    let cert_pem = fs::read(cert_path)?;
    let key_pem = fs::read(key_path)?;
    server_config_from_pem(&cert_pem, &key_pem)
}

pub fn server_config_from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<ServerConfig, ServerError> {
    let certs = rustls_pemfile::certs(&mut &cert_pem[..])
        .collect::<Result<Vec<CertificateDer<'static>>, _>>()?;
    if certs.is_empty() {
        return Err(ServerError::Tls("no certificates found".to_string()));
    }
    let key = rustls_pemfile::private_key(&mut &key_pem[..])?
        .ok_or_else(|| ServerError::Tls("no private key found".to_string()))?;

    ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|err| ServerError::Tls(err.to_string()))
}

/// Client-side TLS configuration for dialing upstream origins, trusting the
/// webpki roots.
pub fn client_config() -> ClientConfig {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_config_from_pem_rejects_garbage() {
        assert!(server_config_from_pem(b"not a cert", b"not a key").is_err());
    }

    #[test]
    fn server_config_from_pem_accepts_a_generated_pair() {
        install_default_crypto_provider();
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let cert_pem = cert.cert.pem();
        let key_pem = cert.key_pair.serialize_pem();
        assert!(server_config_from_pem(cert_pem.as_bytes(), key_pem.as_bytes()).is_ok());
    }
}
