/// Loads rustls configs from PEM files and extracts a peer certificate's
/// common name, used as the RPC subject for authorization. Peer (outgoing,
/// consensus-dial) and server (incoming) configs are independent, per the
/// stream layer's contract.
use std::{fs::File, io::BufReader, sync::Arc};

use anyhow::{Context, Result};
use rustls::{Certificate, PrivateKey, RootCertStore};

#[derive(Debug, Clone)]
pub struct TlsPaths {
  pub cert: String,
  pub key: String,
  pub ca: Option<String>,
}

fn load_certs(path: &str) -> Result<Vec<Certificate>> {
  let file = File::open(path).with_context(|| format!("opening cert file {path}"))?;
  let certs = rustls_pemfile::certs(&mut BufReader::new(file))
    .with_context(|| format!("parsing cert file {path}"))?;

  Ok(certs.into_iter().map(Certificate).collect())
}

fn load_private_key(path: &str) -> Result<PrivateKey> {
  let file = File::open(path).with_context(|| format!("opening key file {path}"))?;
  let mut reader = BufReader::new(file);

  let keys = rustls_pemfile::pkcs8_private_keys(&mut reader)
    .with_context(|| format!("parsing key file {path}"))?;

  let key = keys
    .into_iter()
    .next()
    .with_context(|| format!("no private key found in {path}"))?;

  Ok(PrivateKey(key))
}

fn load_root_store(ca_path: &str) -> Result<RootCertStore> {
  let mut store = RootCertStore::empty();

  for cert in load_certs(ca_path)? {
    store.add(&cert)?;
  }

  Ok(store)
}

/// Server-side config for the stream layer's incoming connections —
/// requires client auth when `ca` is set, so peer certificates carry a
/// verifiable subject.
pub fn load_server_config(paths: &TlsPaths) -> Result<Arc<rustls::ServerConfig>> {
  let certs = load_certs(&paths.cert)?;
  let key = load_private_key(&paths.key)?;

  let builder = rustls::ServerConfig::builder().with_safe_defaults();

  let config = match &paths.ca {
    Some(ca_path) => {
      let roots = load_root_store(ca_path)?;
      let verifier = rustls::server::AllowAnyAuthenticatedClient::new(roots);
      builder
        .with_client_cert_verifier(Arc::new(verifier))
        .with_single_cert(certs, key)?
    }
    None => builder
      .with_no_client_auth()
      .with_single_cert(certs, key)?,
  };

  Ok(Arc::new(config))
}

/// Client-side config used when dialing peers over the consensus
/// transport.
pub fn load_client_config(paths: &TlsPaths) -> Result<Arc<rustls::ClientConfig>> {
  let certs = load_certs(&paths.cert)?;
  let key = load_private_key(&paths.key)?;

  let builder = rustls::ClientConfig::builder().with_safe_defaults();

  let roots = match &paths.ca {
    Some(ca_path) => load_root_store(ca_path)?,
    None => RootCertStore::empty(),
  };

  let config = builder
    .with_root_certificates(roots)
    .with_single_cert(certs, key)?;

  Ok(Arc::new(config))
}

/// Extracts the subject common name from a peer's leaf certificate, used as
/// the authorization subject. Returns `None` when the connection carries no
/// client certificate (no TLS, or TLS without client auth).
pub fn peer_common_name(peer_certificates: Option<&[Certificate]>) -> Option<String> {
  let leaf = peer_certificates?.first()?;

  let (_, parsed) = x509_parser::parse_x509_certificate(leaf.as_ref()).ok()?;

  parsed
    .subject()
    .iter_common_name()
    .next()
    .and_then(|cn| cn.as_str().ok())
    .map(|cn| cn.to_string())
}

#[cfg(test)]
mod tests {
  use super::*;

  fn self_signed_pair(cn: &str) -> (String, String) {
    let cert = rcgen::generate_simple_self_signed(vec![cn.to_string()]).unwrap();

    (
      cert.serialize_pem().unwrap(),
      cert.serialize_private_key_pem(),
    )
  }

  #[test]
  fn peer_common_name_reads_the_subject_cn() {
    let (cert_pem, _) = self_signed_pair("node-1.proglog.internal");

    let mut reader = std::io::Cursor::new(cert_pem.as_bytes());
    let der = rustls_pemfile::certs(&mut reader).unwrap();
    let certs: Vec<Certificate> = der.into_iter().map(Certificate).collect();

    assert_eq!(
      Some("node-1.proglog.internal".to_string()),
      peer_common_name(Some(&certs))
    );
  }

  #[test]
  fn peer_common_name_is_none_without_a_certificate() {
    assert_eq!(None, peer_common_name(None));
    assert_eq!(None, peer_common_name(Some(&[])));
  }

  #[test]
  fn load_server_and_client_configs_from_pem_files() {
    let dir = tempfile::tempdir().unwrap();

    let (cert_pem, key_pem) = self_signed_pair("localhost");

    let cert_path = dir.path().join("cert.pem");
    let key_path = dir.path().join("key.pem");

    std::fs::write(&cert_path, cert_pem).unwrap();
    std::fs::write(&key_path, key_pem).unwrap();

    let paths = TlsPaths {
      cert: cert_path.to_str().unwrap().to_string(),
      key: key_path.to_str().unwrap().to_string(),
      ca: None,
    };

    assert!(load_server_config(&paths).is_ok());
    assert!(load_client_config(&paths).is_ok());
  }
}
