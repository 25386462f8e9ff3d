mod config;
mod error;
mod listener;

use crate::config::{GeneratorKind, ServerConfig, TlsSection};
use crate::error::{ConfigError, ServerError};
use crate::listener::Service;
use clap::Parser;
use std::net::{SocketAddr, TcpListener};
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tessera_tls::{
    CertificateGenerator, OpensslCommand, SelfSignedGenerator, TlsError, TlsSupport,
};
use tracing_subscriber::EnvFilter;

/// Tessera Server - greeting service with optional TLS
#[derive(Parser, Debug)]
#[command(name = "tessera-server")]
#[command(version)]
#[command(about = "Tessera Server - greeting service with optional TLS")]
pub struct Args {
    /// TOML configuration file
    #[arg(long, env = "TESSERA_CONFIG")]
    pub config: Option<PathBuf>,

    /// Address to listen on
    #[arg(long)]
    pub listen: Option<SocketAddr>,

    /// Certificate file; `%s` in the path enables per-host certificates
    #[arg(long)]
    pub cert: Option<String>,

    /// Read certificate and key from this inherited descriptor
    #[arg(long, conflicts_with = "cert")]
    pub cert_fd: Option<RawFd>,

    /// Generate self-signed certificates for missing files
    #[arg(long)]
    pub auto_generate: bool,

    /// Certificate generator
    #[arg(long, value_enum)]
    pub generator: Option<GeneratorKind>,

    /// Serve plaintext only
    #[arg(long, conflicts_with_all = ["cert", "cert_fd", "auto_generate"])]
    pub no_tls: bool,
}

impl Args {
    fn apply(&self, config: &mut ServerConfig) {
        if let Some(listen) = self.listen {
            config.listen = listen;
        }
        if let Some(cert) = &self.cert {
            config.tls.certificate = Some(cert.clone());
            config.tls.certificate_fd = None;
        }
        if let Some(fd) = self.cert_fd {
            config.tls.certificate_fd = Some(fd);
            config.tls.certificate = None;
        }
        if self.auto_generate {
            config.tls.auto_generate = true;
        }
        if let Some(generator) = self.generator {
            config.tls.generator = generator;
        }
        if self.no_tls {
            config.tls.enabled = Some(false);
        }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let args = Args::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> Result<(), ServerError> {
    let mut config = match &args.config {
        Some(path) => ServerConfig::load_from_file(path)?,
        None => ServerConfig::default(),
    };
    args.apply(&mut config);
    config.validate()?;

    // Certificates are loaded before binding so a broken setup never listens.
    let tls = setup_tls(&config.tls)?;

    let listener =
        TcpListener::bind(config.listen).map_err(|e| ServerError::Bind(config.listen, e))?;
    tracing::info!(
        addr = %listener.local_addr()?,
        tls = tls.is_enabled(),
        "Tessera server listening"
    );

    let service = Service {
        greeting: Arc::from(config.greeting.as_str()),
        timeout: Duration::from_secs(config.handshake_timeout_secs),
    };
    listener::serve(listener, Arc::new(tls), service)?;
    Ok(())
}

fn setup_tls(section: &TlsSection) -> Result<TlsSupport, ServerError> {
    let mut tls = TlsSupport::new();
    if !section.is_enabled() {
        tls.set_enabled(false);
        return Ok(tls);
    }
    if !tls.is_available() {
        return Err(TlsError::Unavailable.into());
    }

    if let Some(fd) = section.certificate_fd {
        tls.set_certificate_fd(inherited_fd(fd)?)?;
    } else if let Some(template) = &section.certificate {
        let generator = section.auto_generate.then(|| generator_for(section.generator));
        tls.set_certificate_with(template, generator)?;
    }
    Ok(tls)
}

fn generator_for(kind: GeneratorKind) -> Arc<dyn CertificateGenerator> {
    match kind {
        GeneratorKind::Openssl => Arc::new(OpensslCommand::default()),
        GeneratorKind::Builtin => Arc::new(SelfSignedGenerator),
    }
}

/// Take ownership of a descriptor inherited from the parent process.
fn inherited_fd(fd: RawFd) -> Result<OwnedFd, ConfigError> {
    // SAFETY: F_GETFD only queries descriptor flags.
    if fd < 0 || unsafe { libc::fcntl(fd, libc::F_GETFD) } == -1 {
        return Err(ConfigError::Validation(format!(
            "tls.certificate_fd {fd} is not an open descriptor"
        )));
    }
    // SAFETY: the descriptor is open and nothing else in this process owns it.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}
