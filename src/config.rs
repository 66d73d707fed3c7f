//! Server configuration.
//!
//! All settings are collected into an immutable [`ServerConfig`] that is
//! built once by the bootstrap and passed to the server and handlers at
//! construction time.

use snafu::Snafu;

/// Transfer syntaxes offered during association negotiation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TransferSyntaxPreset {
    /// Implicit and Explicit VR Little Endian.
    #[default]
    NativeLittleEndian,
    /// Only the default transfer syntax (Implicit VR Little Endian).
    DefaultOnly,
    /// All native syntaxes, including Explicit VR Big Endian.
    Native,
}

impl TransferSyntaxPreset {
    pub fn uids(self) -> &'static [&'static str] {
        match self {
            TransferSyntaxPreset::DefaultOnly => &[
                "1.2.840.10008.1.2", // Implicit VR Little Endian
            ],
            TransferSyntaxPreset::NativeLittleEndian => &[
                "1.2.840.10008.1.2.1", // Explicit VR Little Endian
                "1.2.840.10008.1.2",   // Implicit VR Little Endian
            ],
            TransferSyntaxPreset::Native => &[
                "1.2.840.10008.1.2.1", // Explicit VR Little Endian
                "1.2.840.10008.1.2.2", // Explicit VR Big Endian
                "1.2.840.10008.1.2",   // Implicit VR Little Endian
            ],
        }
    }
}

/// Immutable configuration for the Order Filler server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Application Entity title accepted as called AE title.
    pub ae_title: String,
    /// Local address to bind the listener to.
    pub host: String,
    /// TCP port to listen on.
    pub port: u16,
    /// Enforce the maximum PDU length.
    pub strict: bool,
    /// Maximum PDU length in bytes.
    pub max_pdu_length: u32,
    /// Maximum number of simultaneous associations.
    pub max_associations: usize,
    /// Maximum outstanding asynchronous operations per association,
    /// offered to the peer during negotiation. 1 means synchronous.
    pub max_outstanding_ops: u16,
    /// Transfer syntaxes offered to peers.
    pub transfer_syntaxes: TransferSyntaxPreset,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            ae_title: "DCMOF".to_string(),
            host: "0.0.0.0".to_string(),
            port: 11112,
            strict: false,
            max_pdu_length: 16384,
            max_associations: 64,
            max_outstanding_ops: 1,
            transfer_syntaxes: TransferSyntaxPreset::default(),
        }
    }
}

#[derive(Debug, Snafu)]
pub enum EndpointError {
    /// illegal port number `{value}`
    IllegalPort { value: String },
}

/// Parse a listen endpoint of the form `[<aet>[@<host>]:]<port>`.
///
/// Returns `(ae_title, host, port)`; AE title and host fall back to
/// `None` when not given.
pub fn parse_endpoint(s: &str) -> Result<(Option<String>, Option<String>, u16), EndpointError> {
    let (prefix, port_str) = match s.rsplit_once(':') {
        Some((prefix, port)) => (Some(prefix), port),
        None => (None, s),
    };
    let port: u16 = port_str
        .parse()
        .ok()
        .filter(|p| *p > 0)
        .ok_or_else(|| EndpointError::IllegalPort {
            value: port_str.to_string(),
        })?;
    let (aet, host) = match prefix {
        Some(prefix) => match prefix.split_once('@') {
            Some((aet, host)) => (Some(aet.to_string()), Some(host.to_string())),
            None => (Some(prefix.to_string()), None),
        },
        None => (None, None),
    };
    Ok((aet, host, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_endpoint_port_only() {
        assert_eq!(parse_endpoint("11112").unwrap(), (None, None, 11112));
    }

    #[test]
    fn test_parse_endpoint_with_aet() {
        assert_eq!(
            parse_endpoint("DCMOF:11112").unwrap(),
            (Some("DCMOF".to_string()), None, 11112)
        );
    }

    #[test]
    fn test_parse_endpoint_with_aet_and_host() {
        assert_eq!(
            parse_endpoint("DCMOF@127.0.0.1:104").unwrap(),
            (Some("DCMOF".to_string()), Some("127.0.0.1".to_string()), 104)
        );
    }

    #[test]
    fn test_parse_endpoint_rejects_bad_port() {
        assert!(parse_endpoint("DCMOF:notaport").is_err());
        assert!(parse_endpoint("0").is_err());
        assert!(parse_endpoint("70000").is_err());
    }

    #[test]
    fn test_transfer_syntax_presets() {
        assert_eq!(TransferSyntaxPreset::DefaultOnly.uids().len(), 1);
        assert!(TransferSyntaxPreset::Native
            .uids()
            .contains(&"1.2.840.10008.1.2.2"));
        assert!(!TransferSyntaxPreset::NativeLittleEndian
            .uids()
            .contains(&"1.2.840.10008.1.2.2"));
    }
}
