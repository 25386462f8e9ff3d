use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::path::Path;

use crate::error::ConfigError;

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Root configuration file
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Address to accept connections on
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// Line sent to every client
    #[serde(default = "default_greeting")]
    pub greeting: String,

    /// Read/write timeout per connection, including the TLS handshake
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,

    /// [tls] section
    #[serde(default)]
    pub tls: TlsSection,
}

/// [tls] section
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct TlsSection {
    /// Defaults to on whenever a certificate source is configured
    pub enabled: Option<bool>,

    /// PEM file with certificate and key; `%s` selects per-host files
    pub certificate: Option<String>,

    /// Inherited descriptor to read certificate and key from
    pub certificate_fd: Option<RawFd>,

    /// Create self-signed certificates for missing files
    #[serde(default)]
    pub auto_generate: bool,

    #[serde(default)]
    pub generator: GeneratorKind,
}

/// How missing certificates are created
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum GeneratorKind {
    /// Run `openssl req`
    #[default]
    Openssl,
    /// Generate in-process
    Builtin,
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 4433))
}

fn default_greeting() -> String {
    "hello".to_string()
}

fn default_handshake_timeout() -> u64 {
    10
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            greeting: default_greeting(),
            handshake_timeout_secs: default_handshake_timeout(),
            tls: TlsSection::default(),
        }
    }
}

impl ServerConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::FileRead(path.as_ref().to_path_buf(), e))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        let parsed: Self = toml::from_str(content)?;
        Ok(parsed)
    }

    pub fn validate(&self) -> Result<()> {
        if self.handshake_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "handshake_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.greeting.contains('\n') {
            return Err(ConfigError::Validation(
                "greeting must be a single line".to_string(),
            ));
        }
        self.tls.validate()
    }
}

impl TlsSection {
    pub fn is_enabled(&self) -> bool {
        self.enabled
            .unwrap_or(self.certificate.is_some() || self.certificate_fd.is_some())
    }

    pub fn validate(&self) -> Result<()> {
        if self.certificate.is_some() && self.certificate_fd.is_some() {
            return Err(ConfigError::Validation(
                "tls.certificate and tls.certificate_fd are mutually exclusive".to_string(),
            ));
        }
        if let Some(fd) = self.certificate_fd {
            if fd < 0 {
                return Err(ConfigError::Validation(format!(
                    "tls.certificate_fd must be a valid descriptor, got {fd}"
                )));
            }
            if self.auto_generate {
                return Err(ConfigError::Validation(
                    "tls.auto_generate cannot be used with tls.certificate_fd".to_string(),
                ));
            }
        }
        if self.is_enabled() && self.certificate.is_none() && self.certificate_fd.is_none() {
            return Err(ConfigError::Validation(
                "TLS is enabled but neither tls.certificate nor tls.certificate_fd is set"
                    .to_string(),
            ));
        }
        Ok(())
    }
}
