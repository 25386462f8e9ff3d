//! Optional TLS for blocking network services.
//!
//! The TLS library is located at run time, so the same binary runs with or
//! without one installed; [`TlsSupport::is_available`] tells which. Once a
//! certificate is configured, accepted sockets are promoted to
//! [`TlsSession`]s. A certificate path containing `%s` enables per-host
//! certificates chosen by the name the client sends during the handshake.
//!
//! ```no_run
//! use std::net::TcpListener;
//! use std::os::fd::AsFd;
//! use tessera_tls::TlsSupport;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut tls = TlsSupport::new();
//! tls.set_certificate("certs/%s.pem", true)?;
//!
//! let listener = TcpListener::bind("127.0.0.1:4433")?;
//! let (stream, _) = listener.accept()?;
//! let session = tls.promote(stream.as_fd(), b"")?;
//! # drop(session);
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod material;
pub mod provider;
mod session;
pub mod store;
mod support;

pub use error::{Result, TlsError};
pub use provider::{TlsProvider, ensure_provider_loaded};
pub use session::{TlsSession, teardown};
pub use store::{
    CertificateGenerator, CertificateStore, GenerateError, Identity, OpensslCommand,
    SelfSignedGenerator, machine_hostname, normalize_hostname,
};
pub use support::TlsSupport;
