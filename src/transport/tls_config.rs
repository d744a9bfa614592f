use crate::error::Error;
use rustls::pki_types::CertificateDer;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use rustls_pemfile::{certs, private_key};
use std::fs::File;
use std::io::BufReader;

fn load_certificates(path: &str) -> Result<Vec<CertificateDer<'static>>, Error> {
    let file = File::open(path).map_err(|e| Error::TlsCertificateLoad {
        path: path.to_string(),
        source: e,
    })?;
    let chain = certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| Error::TlsInvalidCertificate(format!("Failed to parse {path}: {e}")))?;

    if chain.is_empty() {
        return Err(Error::TlsInvalidCertificate(format!(
            "No certificates found in {path}"
        )));
    }
    Ok(chain)
}

/// Builds the server side configuration: the certificate chain the relay
/// presents and its private key. Clients are not asked for certificates.
pub fn load_tls_server_config(cert_path: &str, key_path: &str) -> Result<ServerConfig, Error> {
    let cert_chain = load_certificates(cert_path)?;

    let key_file = File::open(key_path).map_err(|e| Error::TlsKeyLoad {
        path: key_path.to_string(),
        source: e,
    })?;
    let key = private_key(&mut BufReader::new(key_file))
        .map_err(|e| Error::TlsInvalidKey(format!("Failed to parse private key: {e}")))?
        .ok_or_else(|| Error::TlsInvalidKey(format!("No private key found in {key_path}")))?;

    ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert_chain, key)
        .map_err(|e| Error::TlsServerConfigBuild(e.to_string()))
}

/// Builds a client configuration that trusts only the roots in
/// `ca_cert_path`.
pub fn load_tls_client_config(ca_cert_path: &str) -> Result<ClientConfig, Error> {
    let mut roots = RootCertStore::empty();
    for cert in load_certificates(ca_cert_path)? {
        roots
            .add(cert)
            .map_err(|e| Error::TlsClientConfigBuild(e.to_string()))?;
    }

    Ok(ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth())
}
