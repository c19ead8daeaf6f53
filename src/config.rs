use std::fs::File;
use std::io::{self, BufReader, ErrorKind};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use pgwire::tokio::TlsAcceptor;
use pgwire::tokio::tokio_rustls::rustls::ServerConfig;

use crate::model::Ms;

const WEEK_MS: Ms = 7 * 24 * 60 * 60 * 1000;

/// Server settings, read once at startup from `STAYDESK_*` variables.
/// Unparseable numbers fall back to the default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub invitation_ttl_ms: Ms,
    pub admin_email: String,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 5434,
            data_dir: PathBuf::from("./data"),
            password: "staydesk".into(),
            max_connections: 256,
            compact_threshold: 1000,
            invitation_ttl_ms: WEEK_MS,
            admin_email: "admin@localhost".into(),
            metrics_port: None,
            tls_cert: None,
            tls_key: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Config::default();
        Self {
            bind: lookup("STAYDESK_BIND").unwrap_or(defaults.bind),
            port: parse_var(&lookup, "STAYDESK_PORT").unwrap_or(defaults.port),
            data_dir: lookup("STAYDESK_DATA_DIR").map_or(defaults.data_dir, PathBuf::from),
            password: lookup("STAYDESK_PASSWORD").unwrap_or(defaults.password),
            max_connections: parse_var(&lookup, "STAYDESK_MAX_CONNECTIONS")
                .unwrap_or(defaults.max_connections),
            compact_threshold: parse_var(&lookup, "STAYDESK_COMPACT_THRESHOLD")
                .unwrap_or(defaults.compact_threshold),
            invitation_ttl_ms: parse_var(&lookup, "STAYDESK_INVITATION_TTL_MS")
                .filter(|ttl: &Ms| *ttl > 0)
                .unwrap_or(defaults.invitation_ttl_ms),
            admin_email: lookup("STAYDESK_ADMIN_EMAIL").unwrap_or(defaults.admin_email),
            metrics_port: parse_var(&lookup, "STAYDESK_METRICS_PORT"),
            tls_cert: lookup("STAYDESK_TLS_CERT"),
            tls_key: lookup("STAYDESK_TLS_KEY"),
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("staydesk.wal")
    }

    pub fn tls_acceptor(&self) -> io::Result<Option<TlsAcceptor>> {
        load_tls_acceptor(self.tls_cert.as_deref(), self.tls_key.as_deref())
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|s| s.trim().parse().ok())
}

pub fn load_tls_acceptor(
    cert_path: Option<&str>,
    key_path: Option<&str>,
) -> io::Result<Option<TlsAcceptor>> {
    let (cert_path, key_path) = match (cert_path, key_path) {
        (None, None) => return Ok(None),
        (Some(c), Some(k)) => (c, k),
        _ => {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                "both STAYDESK_TLS_CERT and STAYDESK_TLS_KEY must be set, or neither",
            ));
        }
    };

    let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(File::open(cert_path)?))
        .collect::<Result<_, _>>()?;

    let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key_path)?))?
        .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, "no private key found in key file"))?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| io::Error::new(ErrorKind::InvalidInput, e))?;

    config.alpn_protocols = vec![b"postgresql".to_vec()];

    Ok(Some(TlsAcceptor::from(Arc::new(config))))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(vars: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        let c = config(&[]);
        assert_eq!(c, Config::default());
        assert_eq!(c.addr(), "0.0.0.0:5434");
        assert_eq!(c.invitation_ttl_ms, 604_800_000);
        assert_eq!(c.wal_path(), PathBuf::from("./data/staydesk.wal"));
    }

    #[test]
    fn reads_overrides() {
        let c = config(&[
            ("STAYDESK_PORT", "6000"),
            ("STAYDESK_DATA_DIR", "/var/lib/staydesk"),
            ("STAYDESK_MAX_CONNECTIONS", "8"),
            ("STAYDESK_INVITATION_TTL_MS", "3600000"),
            ("STAYDESK_ADMIN_EMAIL", "ops@hotel.test"),
            ("STAYDESK_METRICS_PORT", "9100"),
        ]);
        assert_eq!(c.port, 6000);
        assert_eq!(c.data_dir, PathBuf::from("/var/lib/staydesk"));
        assert_eq!(c.max_connections, 8);
        assert_eq!(c.invitation_ttl_ms, 3_600_000);
        assert_eq!(c.admin_email, "ops@hotel.test");
        assert_eq!(c.metrics_port, Some(9100));
    }

    #[test]
    fn bad_numbers_fall_back() {
        let c = config(&[("STAYDESK_PORT", "http"), ("STAYDESK_INVITATION_TTL_MS", "-5")]);
        assert_eq!(c.port, 5434);
        assert_eq!(c.invitation_ttl_ms, WEEK_MS);
    }

    #[test]
    fn tls_needs_both_files() {
        assert!(load_tls_acceptor(None, None).unwrap().is_none());
        assert!(matches!(
            load_tls_acceptor(Some("cert.pem"), None),
            Err(e) if e.kind() == ErrorKind::InvalidInput
        ));
    }
}
