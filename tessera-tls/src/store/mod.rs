//! Certificate store - default identity and per-host identities selected by SNI
//!
//! The default identity is loaded once when the store is built. When the
//! configured certificate path carries a `%s` marker, every hostname a client
//! announces is mapped to its own certificate file, loaded on first use and
//! cached until the store is dropped.

mod generate;

pub use generate::{
    CertificateGenerator, GenerateError, OpensslCommand, SelfSignedGenerator, machine_hostname,
};

use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use crate::error::{Result, TlsError};
use crate::material::{SecretBytes, decode_pem_block, read_all_defensively};
use crate::provider::{ContextRef, KeyKind, SessionRef, SniHook, TlsProvider};

const MARKER: &str = "%s";

/// Outcome of resolving a hostname
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Identity {
    /// Serve the default certificate
    Default,
    /// Serve a context dedicated to this hostname (owned by the store)
    Dedicated(ContextRef),
}

/// Certificate filename template split around its `%s` marker
#[derive(Debug, Clone, PartialEq, Eq)]
struct SniPattern {
    prefix: String,
    suffix: String,
}

impl SniPattern {
    fn path_for(&self, host: &str) -> PathBuf {
        PathBuf::from(format!("{}{}{}", self.prefix, host, self.suffix))
    }
}

/// Split `template` into the default certificate path and an optional
/// per-host pattern.
fn parse_template(template: &str) -> Result<(PathBuf, Option<SniPattern>)> {
    match template.matches('%').count() {
        0 => Ok((PathBuf::from(template), None)),
        1 => {
            let at = template
                .find(MARKER)
                .ok_or_else(|| TlsError::InvalidTemplate(template.to_string()))?;
            let pattern = SniPattern {
                prefix: template[..at].to_string(),
                suffix: template[at + MARKER.len()..].to_string(),
            };
            let default = PathBuf::from(format!("{}{}", pattern.prefix, pattern.suffix));
            Ok((default, Some(pattern)))
        }
        _ => Err(TlsError::InvalidTemplate(template.to_string())),
    }
}

/// Reduce a client-supplied server name to a safe cache key and filename
/// component.
///
/// ASCII letters are lowercased; digits, `.` and `-` are kept; everything
/// else (including non-ASCII) is dropped.
pub fn normalize_hostname(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-'))
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

fn load_pem_file(provider: &dyn TlsProvider, ctx: ContextRef, path: &Path) -> bool {
    provider.use_certificate_file(ctx, path)
        && provider.use_private_key_file(ctx, path)
        && provider.check_private_key(ctx)
}

/// Load `path` into `ctx`, generating a self-signed certificate for
/// `subject` and retrying once when a generator is available.
fn load_or_generate(
    provider: &dyn TlsProvider,
    ctx: ContextRef,
    path: &Path,
    subject: impl FnOnce() -> String,
    generator: Option<&dyn CertificateGenerator>,
) -> bool {
    if load_pem_file(provider, ctx, path) {
        return true;
    }
    let Some(generator) = generator else {
        return false;
    };

    let subject = subject();
    if let Err(e) = generator.generate(path, &subject) {
        tracing::warn!(
            path = %path.display(),
            hostname = %subject,
            error = %e,
            "Failed to generate certificate"
        );
        return false;
    }
    provider.clear_error();
    load_pem_file(provider, ctx, path)
}

/// Default identity plus the lazily populated per-host cache
pub struct CertificateStore {
    provider: Arc<dyn TlsProvider>,
    default_identity: ContextRef,
    pattern: Option<SniPattern>,
    generator: Option<Arc<dyn CertificateGenerator>>,
    /// Held across the whole miss path so each host is loaded at most once
    contexts: Mutex<HashMap<String, Identity>>,
}

impl CertificateStore {
    /// Build a store from a certificate path template.
    ///
    /// `template` names a PEM file holding certificate and private key. If it
    /// contains `%s`, the marker is removed to form the default path and kept
    /// for per-host lookups. With a `generator`, missing certificates are
    /// created on demand.
    pub fn from_template(
        provider: Arc<dyn TlsProvider>,
        template: &str,
        generator: Option<Arc<dyn CertificateGenerator>>,
    ) -> Result<Arc<Self>> {
        let (default_path, pattern) = parse_template(template)?;
        let ctx = provider.new_context().ok_or(TlsError::ContextCreation)?;

        let loaded = load_or_generate(
            provider.as_ref(),
            ctx,
            &default_path,
            machine_hostname,
            generator.as_deref(),
        );
        provider.clear_error();
        if !loaded {
            provider.free_context(ctx);
            return Err(TlsError::NoUsableCertificate(default_path));
        }

        tracing::debug!(
            path = %default_path.display(),
            sni = pattern.is_some(),
            "Loaded default certificate"
        );

        let store = Arc::new(Self {
            provider,
            default_identity: ctx,
            pattern,
            generator,
            contexts: Mutex::new(HashMap::new()),
        });

        if store.pattern.is_some() {
            let hook = Arc::downgrade(&store) as Weak<dyn SniHook>;
            if !store.provider.set_sni_hook(ctx, hook) {
                return Err(TlsError::SniRegistration);
            }
        }

        Ok(store)
    }

    /// Build a store from PEM records read out of `reader`.
    ///
    /// The input must hold a `CERTIFICATE` record and at least one of the
    /// RSA, DSA or EC private key records. Such identities have no per-host
    /// pattern and are never generated.
    pub fn from_reader<R: Read>(provider: Arc<dyn TlsProvider>, reader: R) -> Result<Arc<Self>> {
        let blob = read_all_defensively(reader)?;

        let certificate = decode_pem_block(&blob, "CERTIFICATE")
            .ok_or_else(|| TlsError::InvalidIdentity("missing CERTIFICATE record".to_string()))?;
        let keys: Vec<(KeyKind, SecretBytes)> = [KeyKind::Rsa, KeyKind::Dsa, KeyKind::Ec]
            .into_iter()
            .filter_map(|kind| decode_pem_block(&blob, kind.pem_label()).map(|der| (kind, der)))
            .collect();
        drop(blob);

        if keys.is_empty() {
            return Err(TlsError::InvalidIdentity(
                "missing private key record".to_string(),
            ));
        }

        let ctx = provider.new_context().ok_or(TlsError::ContextCreation)?;
        let loaded = provider.use_certificate_der(ctx, &certificate)
            && keys
                .iter()
                .all(|(kind, der)| provider.use_private_key_der(ctx, *kind, der))
            && provider.check_private_key(ctx);
        provider.clear_error();

        if !loaded {
            provider.free_context(ctx);
            return Err(TlsError::InvalidIdentity(
                "certificate and private key do not match".to_string(),
            ));
        }

        tracing::debug!(keys = keys.len(), "Loaded certificate from descriptor");

        Ok(Arc::new(Self {
            provider,
            default_identity: ctx,
            pattern: None,
            generator: None,
            contexts: Mutex::new(HashMap::new()),
        }))
    }

    /// Context new sessions are created from
    pub fn default_identity(&self) -> ContextRef {
        self.default_identity
    }

    /// Whether per-host certificates are looked up
    pub fn has_sni_pattern(&self) -> bool {
        self.pattern.is_some()
    }

    /// Identity to serve to a client that announced `name`.
    ///
    /// Per-host load failures are not fatal: the host is served the default
    /// certificate, and that outcome is cached like any other.
    pub fn resolve_for_host(&self, name: &str) -> Identity {
        let Some(pattern) = &self.pattern else {
            return Identity::Default;
        };
        let host = normalize_hostname(name);
        if host.is_empty() {
            return Identity::Default;
        }

        let mut contexts = self.contexts.lock();
        if let Some(identity) = contexts.get(&host) {
            return *identity;
        }

        let identity = self.load_host(pattern, &host);
        contexts.insert(host, identity);
        self.provider.clear_error();
        identity
    }

    fn load_host(&self, pattern: &SniPattern, host: &str) -> Identity {
        let path = pattern.path_for(host);
        let Some(ctx) = self.provider.new_context() else {
            tracing::warn!(hostname = %host, "Failed to create TLS context");
            return Identity::Default;
        };

        if load_or_generate(
            self.provider.as_ref(),
            ctx,
            &path,
            || host.to_string(),
            self.generator.as_deref(),
        ) {
            tracing::debug!(hostname = %host, path = %path.display(), "Loaded certificate");
            Identity::Dedicated(ctx)
        } else {
            self.provider.free_context(ctx);
            tracing::warn!(
                hostname = %host,
                path = %path.display(),
                "No usable certificate, using default"
            );
            Identity::Default
        }
    }

    #[cfg(test)]
    pub(crate) fn cached(&self, host: &str) -> Option<Identity> {
        self.contexts.lock().get(host).copied()
    }
}

impl SniHook for CertificateStore {
    fn on_servername(&self, session: SessionRef, name: &str) {
        if let Identity::Dedicated(ctx) = self.resolve_for_host(name) {
            if !self.provider.set_session_context(session, ctx) {
                tracing::warn!(hostname = %name, "Failed to switch session certificate");
            }
        }
    }
}

impl Drop for CertificateStore {
    fn drop(&mut self) {
        for identity in self.contexts.get_mut().values() {
            if let Identity::Dedicated(ctx) = identity {
                self.provider.free_context(*ctx);
            }
        }
        self.provider.free_context(self.default_identity);
    }
}

impl std::fmt::Debug for CertificateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateStore")
            .field("default_identity", &self.default_identity)
            .field("pattern", &self.pattern)
            .finish()
    }
}
