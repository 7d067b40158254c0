use std::{
    io::{self, BufReader},
    path::Path,
    sync::Arc,
    time::SystemTime,
};

use rustls::{
    client::{ServerCertVerified, ServerCertVerifier},
    Certificate, PrivateKey, ServerName,
};

/// Certificate chain and key a node's QUIC endpoint serves.
///
/// TLS only encrypts the link. Peers are not authenticated at this layer:
/// payloads that must stay confidential are sealed to the recipient's key
/// before they ever reach the transport.
#[derive(Clone)]
pub struct TlsMaterial {
    certs: Vec<Certificate>,
    key: PrivateKey,
}

impl TlsMaterial {
    /// Generates a throwaway self-signed certificate for `names`.
    pub fn self_signed(names: Vec<String>) -> Result<Self, rcgen::RcgenError> {
        let cert = rcgen::generate_simple_self_signed(names)?;
        Ok(Self {
            certs: vec![Certificate(cert.serialize_der()?)],
            key: PrivateKey(cert.serialize_private_key_der()),
        })
    }

    /// Loads a PEM certificate chain and a PKCS#8 PEM private key.
    pub fn from_pem(cert_path: &Path, key_path: &Path) -> io::Result<Self> {
        let certs = rustls_pemfile::certs(&mut BufReader::new(std::fs::File::open(cert_path)?))?
            .into_iter()
            .map(Certificate)
            .collect::<Vec<_>>();
        let mut keys =
            rustls_pemfile::pkcs8_private_keys(&mut BufReader::new(std::fs::File::open(key_path)?))?;
        if certs.is_empty() || keys.len() != 1 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "expected a certificate chain and exactly one private key",
            ));
        }
        Ok(Self {
            certs,
            key: PrivateKey(keys.remove(0)),
        })
    }

    pub fn server_config(&self) -> Result<rustls::ServerConfig, rustls::Error> {
        let mut config = rustls::ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(self.certs.clone(), self.key.clone())?;
        config.alpn_protocols = vec![ALPN.to_vec()];
        Ok(config)
    }
}

pub const ALPN: &[u8] = b"orbit/1";

/// Client side TLS configuration accepting any server certificate.
pub fn client_config() -> rustls::ClientConfig {
    let mut config = rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
        .with_no_client_auth();
    config.alpn_protocols = vec![ALPN.to_vec()];
    config
}

struct SkipServerVerification;

impl ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn self_signed_material_builds_a_server_config() {
        let material = TlsMaterial::self_signed(vec!["localhost".into()]).unwrap();
        let config = material.server_config().unwrap();
        assert_eq!(config.alpn_protocols, vec![ALPN.to_vec()]);
    }

    #[test]
    fn pem_files_load() {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
        let mut cert_file = tempfile::NamedTempFile::new().unwrap();
        cert_file.write_all(cert.serialize_pem().unwrap().as_bytes()).unwrap();
        let mut key_file = tempfile::NamedTempFile::new().unwrap();
        key_file
            .write_all(cert.serialize_private_key_pem().as_bytes())
            .unwrap();

        let material = TlsMaterial::from_pem(cert_file.path(), key_file.path()).unwrap();
        assert_eq!(material.certs.len(), 1);
        assert!(material.server_config().is_ok());
    }

    #[test]
    fn missing_key_is_invalid_data() {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
        let mut cert_file = tempfile::NamedTempFile::new().unwrap();
        cert_file.write_all(cert.serialize_pem().unwrap().as_bytes()).unwrap();
        let err = TlsMaterial::from_pem(cert_file.path(), cert_file.path())
            .err()
            .unwrap();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
