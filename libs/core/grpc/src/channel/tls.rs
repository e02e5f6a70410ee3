use super::config::TlsFiles;
use crate::error::{GrpcError, GrpcResult};
use std::path::{Path, PathBuf};
use tonic::transport::{Certificate, ClientTlsConfig, Identity};

/// Read the certificate files and build the client TLS settings.
///
/// Files are read as raw bytes on every call; nothing is cached.
pub(crate) fn load_tls_config(files: &TlsFiles, domain: &str) -> GrpcResult<ClientTlsConfig> {
  let cert = read_pem("server certificate", files.server_cert.as_ref())?;
  let key = read_pem("server private key", files.server_key.as_ref())?;
  let ca = read_pem("CA certificate", files.ca_cert.as_ref())?;

  Ok(
    ClientTlsConfig::new()
      .domain_name(domain)
      .ca_certificate(Certificate::from_pem(ca))
      .identity(Identity::from_pem(cert, key)),
  )
}

fn read_pem(what: &str, path: Option<&PathBuf>) -> GrpcResult<Vec<u8>> {
  let path = path.ok_or_else(|| {
    GrpcError::InvalidConfig(format!("TLS is enabled but no {what} path is configured"))
  })?;
  read_file(path)
}

fn read_file(path: &Path) -> GrpcResult<Vec<u8>> {
  std::fs::read(path).map_err(|source| GrpcError::CertificateRead {
    path: path.to_path_buf(),
    source,
  })
}
