//! Process-wide provider binding

use std::sync::{Arc, OnceLock};

use super::{Disabled, TlsProvider};

#[cfg(unix)]
use super::dynamic::DynamicProvider;

#[cfg(unix)]
static PROVIDER: OnceLock<Option<Arc<DynamicProvider>>> = OnceLock::new();

/// Locate the TLS provider library, once per process.
///
/// Safe to call from any number of threads; only the first call does any
/// work. Returns whether TLS support is available.
pub fn ensure_provider_loaded() -> bool {
    #[cfg(unix)]
    {
        bound().is_some()
    }
    #[cfg(not(unix))]
    {
        false
    }
}

/// The bound provider, or the [`Disabled`] stub when none could be loaded.
pub fn provider() -> Arc<dyn TlsProvider> {
    #[cfg(unix)]
    {
        if let Some(provider) = bound() {
            return provider.clone();
        }
    }
    Arc::new(Disabled)
}

#[cfg(unix)]
fn bound() -> Option<&'static Arc<DynamicProvider>> {
    PROVIDER
        .get_or_init(|| match DynamicProvider::load() {
            Ok(provider) => {
                tracing::debug!("Loaded TLS provider");
                Some(Arc::new(provider))
            }
            Err(missing) => {
                tracing::debug!(symbol = missing, "Failed to load TLS provider");
                None
            }
        })
        .as_ref()
}

/// Bound dynamic provider, for callbacks entered from the library.
#[cfg(unix)]
pub(super) fn dynamic() -> Option<&'static DynamicProvider> {
    PROVIDER.get().and_then(|p| p.as_deref())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn binding_is_idempotent() {
        let first = ensure_provider_loaded();
        assert_eq!(ensure_provider_loaded(), first);
        assert_eq!(provider().is_available(), first);
    }

    #[test]
    fn concurrent_callers_agree() {
        let results: Vec<bool> = (0..8)
            .map(|_| thread::spawn(ensure_provider_loaded))
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| h.join().unwrap())
            .collect();
        assert!(results.windows(2).all(|w| w[0] == w[1]));
    }
}
