//! TLS provider capability interface
//!
//! The rest of the crate talks to the TLS implementation only through
//! [`TlsProvider`]. The real implementation is a system libssl located at
//! run time; when none is found the [`Disabled`] stub stands in, so callers
//! never need to know whether a library was found.

mod binding;
#[cfg(unix)]
mod dynamic;
#[cfg(test)]
pub(crate) mod fake;

pub use binding::{ensure_provider_loaded, provider};

use std::io;
use std::num::NonZeroUsize;
use std::os::fd::RawFd;
use std::path::Path;
use std::sync::Weak;

macro_rules! provider_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name(NonZeroUsize);

        impl $name {
            /// Wrap a provider-specific token.
            pub fn from_raw(raw: NonZeroUsize) -> Self {
                Self(raw)
            }

            pub fn into_raw(self) -> NonZeroUsize {
                self.0
            }

            #[allow(dead_code)]
            pub(crate) fn from_ptr<T>(ptr: *mut T) -> Option<Self> {
                NonZeroUsize::new(ptr as usize).map(Self)
            }

            #[allow(dead_code)]
            pub(crate) fn as_ptr<T>(self) -> *mut T {
                self.0.get() as *mut T
            }
        }
    };
}

provider_handle!(
    /// A provider TLS context (certificate, key and negotiation policy)
    ContextRef
);
provider_handle!(
    /// A provider TLS session bound to one connection
    SessionRef
);
provider_handle!(
    /// A provider byte transport (socket or buffering filter)
    TransportRef
);

/// Private key encodings accepted by [`TlsProvider::use_private_key_der`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    Rsa,
    Dsa,
    Ec,
}

impl KeyKind {
    /// PEM record label carrying this key kind
    pub fn pem_label(self) -> &'static str {
        match self {
            KeyKind::Rsa => "RSA PRIVATE KEY",
            KeyKind::Dsa => "DSA PRIVATE KEY",
            KeyKind::Ec => "EC PRIVATE KEY",
        }
    }
}

/// Receives the server name a client announced during the handshake.
pub trait SniHook: Send + Sync {
    fn on_servername(&self, session: SessionRef, name: &str);
}

/// Operations the subsystem needs from a TLS implementation.
///
/// Handles are plain tokens; ownership rules follow the underlying library:
/// `set_transports` hands both transports to the session and `free_session`
/// releases whatever the session still references.
pub trait TlsProvider: Send + Sync {
    fn is_available(&self) -> bool {
        true
    }

    fn new_context(&self) -> Option<ContextRef>;
    fn free_context(&self, ctx: ContextRef);
    fn use_certificate_file(&self, ctx: ContextRef, path: &Path) -> bool;
    fn use_private_key_file(&self, ctx: ContextRef, path: &Path) -> bool;
    fn use_certificate_der(&self, ctx: ContextRef, der: &[u8]) -> bool;
    fn use_private_key_der(&self, ctx: ContextRef, kind: KeyKind, der: &[u8]) -> bool;
    fn check_private_key(&self, ctx: ContextRef) -> bool;
    fn set_sni_hook(&self, ctx: ContextRef, hook: Weak<dyn SniHook>) -> bool;

    fn new_session(&self, ctx: ContextRef) -> Option<SessionRef>;
    fn free_session(&self, session: SessionRef);
    fn set_session_context(&self, session: SessionRef, ctx: ContextRef) -> bool;
    fn enable_partial_write(&self, session: SessionRef) -> bool;
    fn set_accept_state(&self, session: SessionRef);
    fn servername(&self, session: SessionRef) -> Option<String>;

    /// Socket transport over `fd`; the descriptor is not closed with it.
    fn new_socket_transport(&self, fd: RawFd) -> Option<TransportRef>;
    fn new_buffer_transport(&self) -> Option<TransportRef>;
    fn push_transport(&self, top: TransportRef, below: TransportRef);
    fn set_buffered_read_data(&self, transport: TransportRef, data: &[u8]) -> bool;
    fn set_transports(&self, session: SessionRef, read: TransportRef, write: TransportRef);
    fn read_transport(&self, session: SessionRef) -> Option<TransportRef>;
    fn write_transport(&self, session: SessionRef) -> Option<TransportRef>;
    fn next_transport(&self, transport: TransportRef) -> Option<TransportRef>;
    /// Unlink `transport` from its chain, returning what was below it.
    fn pop_transport(&self, transport: TransportRef) -> Option<TransportRef>;
    /// Number of owners, when the provider exposes it.
    fn owner_count(&self, transport: TransportRef) -> Option<u32>;
    fn free_transport_chain(&self, transport: TransportRef);

    fn read(&self, session: SessionRef, buf: &mut [u8]) -> io::Result<usize>;
    fn write(&self, session: SessionRef, buf: &[u8]) -> io::Result<usize>;
    fn shutdown(&self, session: SessionRef) -> io::Result<()>;

    /// Oldest pending error code, or 0.
    fn peek_error(&self) -> u64;
    fn clear_error(&self);
}

/// Stand-in used when no TLS library could be bound.
#[derive(Debug, Default, Clone, Copy)]
pub struct Disabled;

fn unavailable() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, "TLS support is unavailable")
}

impl TlsProvider for Disabled {
    fn is_available(&self) -> bool {
        false
    }

    fn new_context(&self) -> Option<ContextRef> {
        None
    }

    fn free_context(&self, _ctx: ContextRef) {}

    fn use_certificate_file(&self, _ctx: ContextRef, _path: &Path) -> bool {
        false
    }

    fn use_private_key_file(&self, _ctx: ContextRef, _path: &Path) -> bool {
        false
    }

    fn use_certificate_der(&self, _ctx: ContextRef, _der: &[u8]) -> bool {
        false
    }

    fn use_private_key_der(&self, _ctx: ContextRef, _kind: KeyKind, _der: &[u8]) -> bool {
        false
    }

    fn check_private_key(&self, _ctx: ContextRef) -> bool {
        false
    }

    fn set_sni_hook(&self, _ctx: ContextRef, _hook: Weak<dyn SniHook>) -> bool {
        false
    }

    fn new_session(&self, _ctx: ContextRef) -> Option<SessionRef> {
        None
    }

    fn free_session(&self, _session: SessionRef) {}

    fn set_session_context(&self, _session: SessionRef, _ctx: ContextRef) -> bool {
        false
    }

    fn enable_partial_write(&self, _session: SessionRef) -> bool {
        false
    }

    fn set_accept_state(&self, _session: SessionRef) {}

    fn servername(&self, _session: SessionRef) -> Option<String> {
        None
    }

    fn new_socket_transport(&self, _fd: RawFd) -> Option<TransportRef> {
        None
    }

    fn new_buffer_transport(&self) -> Option<TransportRef> {
        None
    }

    fn push_transport(&self, _top: TransportRef, _below: TransportRef) {}

    fn set_buffered_read_data(&self, _transport: TransportRef, _data: &[u8]) -> bool {
        false
    }

    fn set_transports(&self, _session: SessionRef, _read: TransportRef, _write: TransportRef) {}

    fn read_transport(&self, _session: SessionRef) -> Option<TransportRef> {
        None
    }

    fn write_transport(&self, _session: SessionRef) -> Option<TransportRef> {
        None
    }

    fn next_transport(&self, _transport: TransportRef) -> Option<TransportRef> {
        None
    }

    fn pop_transport(&self, _transport: TransportRef) -> Option<TransportRef> {
        None
    }

    fn owner_count(&self, _transport: TransportRef) -> Option<u32> {
        None
    }

    fn free_transport_chain(&self, _transport: TransportRef) {}

    fn read(&self, _session: SessionRef, _buf: &mut [u8]) -> io::Result<usize> {
        Err(unavailable())
    }

    fn write(&self, _session: SessionRef, _buf: &[u8]) -> io::Result<usize> {
        Err(unavailable())
    }

    fn shutdown(&self, _session: SessionRef) -> io::Result<()> {
        Err(unavailable())
    }

    fn peek_error(&self) -> u64 {
        0
    }

    fn clear_error(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_provider_reports_unavailable() {
        let provider = Disabled;
        assert!(!provider.is_available());
        assert!(provider.new_context().is_none());

        let session = SessionRef::from_raw(NonZeroUsize::MIN);
        let err = provider.read(session, &mut [0; 4]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn key_kinds_map_to_pem_labels() {
        assert_eq!(KeyKind::Rsa.pem_label(), "RSA PRIVATE KEY");
        assert_eq!(KeyKind::Dsa.pem_label(), "DSA PRIVATE KEY");
        assert_eq!(KeyKind::Ec.pem_label(), "EC PRIVATE KEY");
    }

    #[test]
    fn handles_round_trip_through_pointers() {
        let ctx = ContextRef::from_ptr(0x1000 as *mut u8).unwrap();
        assert_eq!(ctx.as_ptr::<u8>() as usize, 0x1000);
        assert!(ContextRef::from_ptr(std::ptr::null_mut::<u8>()).is_none());
    }
}
