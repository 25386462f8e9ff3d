use std::fs::File;
use std::io::{self, Read};
use std::os::fd::{BorrowedFd, OwnedFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{Result, TlsError};
use crate::provider::{self, TlsProvider};
use crate::session::{self, TlsSession};
use crate::store::{CertificateGenerator, CertificateStore, OpensslCommand};

/// TLS support for one service: the provider, the enabled switch and the
/// configured certificates.
pub struct TlsSupport {
    provider: Arc<dyn TlsProvider>,
    enabled: AtomicBool,
    store: Option<Arc<CertificateStore>>,
}

impl TlsSupport {
    /// Bind the process-wide provider. TLS starts out enabled exactly when a
    /// provider library was found.
    pub fn new() -> Self {
        provider::ensure_provider_loaded();
        Self::with_provider(provider::provider())
    }

    pub fn with_provider(provider: Arc<dyn TlsProvider>) -> Self {
        let enabled = AtomicBool::new(provider.is_available());
        Self {
            provider,
            enabled,
            store: None,
        }
    }

    pub fn is_available(&self) -> bool {
        self.provider.is_available()
    }

    pub fn is_enabled(&self) -> bool {
        self.is_available() && self.enabled.load(Ordering::Relaxed)
    }

    /// Switch TLS on or off, returning the previous setting.
    pub fn set_enabled(&self, enabled: bool) -> bool {
        self.enabled.swap(enabled, Ordering::Relaxed)
    }

    /// Load the default certificate from `template` (see
    /// [`CertificateStore::from_template`]), generating missing certificates
    /// with the `openssl` command when `auto_generate` is set.
    pub fn set_certificate(&mut self, template: &str, auto_generate: bool) -> Result<()> {
        let generator = auto_generate
            .then(|| Arc::new(OpensslCommand::default()) as Arc<dyn CertificateGenerator>);
        self.set_certificate_with(template, generator)
    }

    pub fn set_certificate_with(
        &mut self,
        template: &str,
        generator: Option<Arc<dyn CertificateGenerator>>,
    ) -> Result<()> {
        self.install(|provider| CertificateStore::from_template(provider, template, generator))
    }

    /// Load certificate and key from an inherited descriptor, which is
    /// closed afterwards.
    pub fn set_certificate_fd(&mut self, fd: OwnedFd) -> Result<()> {
        self.set_certificate_reader(File::from(fd))
    }

    pub fn set_certificate_reader<R: Read>(&mut self, reader: R) -> Result<()> {
        self.install(|provider| CertificateStore::from_reader(provider, reader))
    }

    fn install<F>(&mut self, build: F) -> Result<()>
    where
        F: FnOnce(Arc<dyn TlsProvider>) -> Result<Arc<CertificateStore>>,
    {
        if !self.provider.is_available() {
            return Err(TlsError::Unavailable);
        }
        if self.store.is_some() {
            return Err(TlsError::AlreadyConfigured);
        }
        self.store = Some(build(self.provider.clone())?);
        Ok(())
    }

    pub fn store(&self) -> Option<&Arc<CertificateStore>> {
        self.store.as_ref()
    }

    /// Start a server-side TLS session on an accepted connection.
    ///
    /// The session holds on to the configured certificates, so it may outlive
    /// `self`. See [`TlsSession`] for ownership of `fd`.
    pub fn promote<'fd>(
        &self,
        fd: BorrowedFd<'fd>,
        prebuffered: &[u8],
    ) -> io::Result<TlsSession<'fd>> {
        let identity = self.store.as_ref().map(|s| s.default_identity());
        let mut session = session::promote(self.provider.clone(), identity, fd, prebuffered)?;
        if let Some(store) = &self.store {
            session.retain_store(store.clone());
        }
        Ok(session)
    }
}

impl Default for TlsSupport {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TlsSupport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsSupport")
            .field("available", &self.is_available())
            .field("enabled", &self.enabled.load(Ordering::Relaxed))
            .field("store", &self.store)
            .finish()
    }
}
