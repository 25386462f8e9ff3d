//! Connection lifecycle: promoting an accepted socket to TLS and tearing the
//! session down again

use std::io::{self, Read, Write};
use std::marker::PhantomData;
use std::os::fd::{AsRawFd, BorrowedFd};
use std::sync::Arc;

use crate::provider::{ContextRef, SessionRef, TlsProvider, TransportRef};
use crate::store::CertificateStore;

fn invalid_input(msg: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, msg)
}

/// Blocks `SIGPIPE` on the current thread until dropped.
///
/// A `SIGPIPE` raised while blocked is consumed before the previous mask is
/// restored, so writes to a closed peer surface as `EPIPE` only.
struct SigPipeGuard {
    previous: libc::sigset_t,
    pending_before: bool,
}

fn sigpipe_set() -> libc::sigset_t {
    // SAFETY: sigemptyset initializes the zeroed set.
    unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, libc::SIGPIPE);
        set
    }
}

fn sigpipe_pending() -> bool {
    // SAFETY: the set is initialized by sigpending before it is inspected.
    unsafe {
        let mut pending: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut pending);
        libc::sigpending(&mut pending) == 0 && libc::sigismember(&pending, libc::SIGPIPE) == 1
    }
}

impl SigPipeGuard {
    fn block() -> Self {
        let set = sigpipe_set();
        // SAFETY: both sets are valid for the duration of the call.
        let previous = unsafe {
            let mut previous: libc::sigset_t = std::mem::zeroed();
            libc::pthread_sigmask(libc::SIG_BLOCK, &set, &mut previous);
            previous
        };
        Self {
            previous,
            pending_before: sigpipe_pending(),
        }
    }
}

impl Drop for SigPipeGuard {
    fn drop(&mut self) {
        if !self.pending_before && sigpipe_pending() {
            let set = sigpipe_set();
            let mut signal = 0;
            // SAFETY: SIGPIPE is pending and blocked, so sigwait returns at once.
            unsafe {
                libc::sigwait(&set, &mut signal);
            }
        }
        // SAFETY: previous was filled in by pthread_sigmask in block().
        unsafe {
            libc::pthread_sigmask(libc::SIG_SETMASK, &self.previous, std::ptr::null_mut());
        }
    }
}

/// How a session's read and write transports are linked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransportLinkage {
    /// One transport serves both directions (or none is attached)
    Shared,
    /// A buffering read transport stacked on the write transport
    Buffered {
        read: TransportRef,
        write: TransportRef,
    },
    /// Left behind by an aborted handshake: both sides stacked on one socket
    DoubleStacked {
        read: TransportRef,
        write: TransportRef,
        socket: TransportRef,
    },
    /// The library's handshake write buffer still sits on a shared socket.
    /// Releasing the session unstacks it.
    HandshakeBuffered,
    Unrecognized,
}

fn classify(provider: &dyn TlsProvider, session: SessionRef) -> TransportLinkage {
    let read = provider.read_transport(session);
    let write = provider.write_transport(session);

    match (read, write) {
        (None, None) => TransportLinkage::Shared,
        (Some(read), Some(write)) if read == write => TransportLinkage::Shared,
        (Some(read), Some(write)) => {
            let below_read = provider.next_transport(read);
            if below_read == Some(write) {
                return TransportLinkage::Buffered { read, write };
            }
            match below_read {
                Some(socket) if provider.next_transport(write) == Some(socket) => {
                    TransportLinkage::DoubleStacked {
                        read,
                        write,
                        socket,
                    }
                }
                None if provider.next_transport(write) == Some(read) => {
                    TransportLinkage::HandshakeBuffered
                }
                _ => TransportLinkage::Unrecognized,
            }
        }
        _ => TransportLinkage::Unrecognized,
    }
}

fn assert_sole_owner(provider: &dyn TlsProvider, transport: TransportRef) {
    if let Some(owners) = provider.owner_count(transport) {
        if owners != 1 {
            tracing::error!(owners, "TLS transport is still shared during teardown");
            panic!("TLS transport has {owners} owners during teardown");
        }
    }
}

/// Detach stacked transports so that releasing the session frees each of
/// them exactly once, then release the session.
fn release(provider: &dyn TlsProvider, session: SessionRef) {
    provider.clear_error();

    match classify(provider, session) {
        TransportLinkage::Shared | TransportLinkage::HandshakeBuffered => {}
        TransportLinkage::Buffered { read, write } => {
            provider.pop_transport(read);
            assert_sole_owner(provider, read);
            assert_sole_owner(provider, write);
        }
        TransportLinkage::DoubleStacked {
            read,
            write,
            socket,
        } => {
            provider.pop_transport(read);
            provider.pop_transport(write);
            assert_sole_owner(provider, read);
            assert_sole_owner(provider, write);
            assert_sole_owner(provider, socket);
            provider.free_transport_chain(socket);
        }
        TransportLinkage::Unrecognized => {
            tracing::error!("Unexpected TLS transport layout during teardown");
            panic!("unexpected TLS transport layout during teardown");
        }
    }

    provider.free_session(session);
}

/// Server-side TLS session over a borrowed socket.
///
/// The descriptor stays owned by the caller and must outlive the session.
/// Dropping the session releases it and every transport it created.
pub struct TlsSession<'fd> {
    provider: Arc<dyn TlsProvider>,
    handle: Option<SessionRef>,
    /// Contexts the session may be switched to during the handshake; released
    /// only after the session itself.
    store: Option<Arc<CertificateStore>>,
    _fd: PhantomData<BorrowedFd<'fd>>,
}

impl TlsSession<'_> {
    /// Keep `store` alive for as long as this session.
    pub(crate) fn retain_store(&mut self, store: Arc<CertificateStore>) {
        self.store = Some(store);
    }

    /// Provider handle of this session
    pub fn handle(&self) -> Option<SessionRef> {
        self.handle
    }

    /// Server name the client announced, once the handshake has seen it
    pub fn servername(&self) -> Option<String> {
        self.handle.and_then(|s| self.provider.servername(s))
    }

    /// Send a close-notify alert to the peer.
    pub fn shutdown(&mut self) -> io::Result<()> {
        let session = self.live()?;
        let _sigpipe = SigPipeGuard::block();
        self.provider.shutdown(session)
    }

    fn live(&self) -> io::Result<SessionRef> {
        self.handle
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))
    }
}

impl Read for TlsSession<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let session = self.live()?;
        // Reads drive the handshake, which writes to the peer.
        let _sigpipe = SigPipeGuard::block();
        self.provider.read(session, buf)
    }
}

impl Write for TlsSession<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let session = self.live()?;
        let _sigpipe = SigPipeGuard::block();
        self.provider.write(session, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for TlsSession<'_> {
    fn drop(&mut self) {
        if let Some(session) = self.handle.take() {
            release(self.provider.as_ref(), session);
        }
    }
}

impl std::fmt::Debug for TlsSession<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsSession")
            .field("handle", &self.handle)
            .finish()
    }
}

/// Release the session in `slot`, if any. Calling this on an empty slot does
/// nothing.
pub fn teardown(slot: &mut Option<TlsSession<'_>>) {
    drop(slot.take());
}

/// Start a server-side TLS session on `fd`.
///
/// `prebuffered` holds bytes already read from the socket (for example while
/// sniffing the protocol); the session consumes them before reading from the
/// socket. Fails with `InvalidInput`, leaving `fd` untouched, when TLS is
/// unavailable or no identity is configured.
pub(crate) fn promote<'fd>(
    provider: Arc<dyn TlsProvider>,
    identity: Option<ContextRef>,
    fd: BorrowedFd<'fd>,
    prebuffered: &[u8],
) -> io::Result<TlsSession<'fd>> {
    let _sigpipe = SigPipeGuard::block();

    if !provider.is_available() {
        return Err(invalid_input("TLS support is unavailable"));
    }
    let Some(ctx) = identity else {
        return Err(invalid_input("no TLS identity is configured"));
    };

    let Some(session) = provider.new_session(ctx) else {
        provider.clear_error();
        return Err(invalid_input("failed to create TLS session"));
    };

    let abort = |session: SessionRef, transports: &[TransportRef], msg: &'static str| {
        for transport in transports {
            provider.free_transport_chain(*transport);
        }
        provider.free_session(session);
        provider.clear_error();
        io::Error::other(msg)
    };

    let Some(socket) = provider.new_socket_transport(fd.as_raw_fd()) else {
        return Err(abort(session, &[], "failed to create socket transport"));
    };

    let read = if prebuffered.is_empty() {
        socket
    } else {
        let Some(buffer) = provider.new_buffer_transport() else {
            return Err(abort(session, &[socket], "failed to create buffer transport"));
        };
        if !provider.set_buffered_read_data(buffer, prebuffered) {
            return Err(abort(
                session,
                &[buffer, socket],
                "failed to buffer prefetched data",
            ));
        }
        provider.push_transport(buffer, socket);
        buffer
    };
    provider.set_transports(session, read, socket);

    // From here on the session owns its transports.
    let tls = TlsSession {
        provider: provider.clone(),
        handle: Some(session),
        store: None,
        _fd: PhantomData,
    };

    if !provider.enable_partial_write(session) {
        return Err(io::Error::other("failed to enable partial writes"));
    }
    provider.set_accept_state(session);

    let pending = provider.peek_error();
    if pending != 0 {
        tracing::error!(code = pending, "TLS provider reported an error during session setup");
        provider.clear_error();
        return Err(io::Error::other("TLS session setup left an error pending"));
    }

    tracing::debug!(
        fd = fd.as_raw_fd(),
        prebuffered = prebuffered.len(),
        "Started TLS session"
    );
    Ok(tls)
}
