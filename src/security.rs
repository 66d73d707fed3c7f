//! TLS configuration loading.
//!
//! Key material is read and validated at startup so that a misconfigured
//! deployment fails before the listener is opened, with its own exit
//! status distinct from ordinary argument errors.

use std::io;
use std::path::{Path, PathBuf};

use snafu::{ensure, ResultExt, Snafu};
use tracing::info;

/// Cipher suite family offered to secured peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsCipherSuite {
    /// Authentication only, no encryption.
    Null,
    TripleDes,
    Aes,
}

/// Declarative TLS settings from the command line.
#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub cipher_suite: TlsCipherSuite,
    /// Enabled protocol versions, e.g. `TLSv1.2`.
    pub protocols: Vec<String>,
    pub need_client_auth: bool,
    pub key_file: PathBuf,
    pub cert_file: PathBuf,
    pub trust_file: Option<PathBuf>,
    /// Password unlocking the private key, when it is encrypted.
    pub key_password: Option<String>,
    /// Password unlocking the trust store, when it is encrypted.
    pub trust_password: Option<String>,
}

/// Loaded and validated TLS material.
#[derive(Debug)]
pub struct TlsMaterial {
    pub key_pem: Vec<u8>,
    pub cert_pem: Vec<u8>,
    pub trust_pem: Option<Vec<u8>>,
    pub config: TlsConfig,
}

#[derive(Debug, Snafu)]
pub enum SecurityError {
    #[snafu(display("could not read {} file {}", kind, path.display()))]
    ReadFile {
        kind: &'static str,
        path: PathBuf,
        source: io::Error,
    },

    #[snafu(display("{} does not look like a PEM file", path.display()))]
    NotPem { path: PathBuf },
}

fn read_pem(kind: &'static str, path: &Path) -> Result<Vec<u8>, SecurityError> {
    let bytes = std::fs::read(path).context(ReadFileSnafu { kind, path })?;
    ensure!(
        bytes.windows(10).any(|w| w == b"-----BEGIN"),
        NotPemSnafu { path }
    );
    Ok(bytes)
}

/// Load and validate the key material named by `config`.
pub fn init_tls(config: TlsConfig) -> Result<TlsMaterial, SecurityError> {
    let key_pem = read_pem("key", &config.key_file)?;
    let cert_pem = read_pem("certificate", &config.cert_file)?;
    let trust_pem = config
        .trust_file
        .as_deref()
        .map(|path| read_pem("trust store", path))
        .transpose()?;
    info!(
        cipher_suite = ?config.cipher_suite,
        client_auth = config.need_client_auth,
        "TLS material loaded"
    );
    Ok(TlsMaterial {
        key_pem,
        cert_pem,
        trust_pem,
        config,
    })
}
