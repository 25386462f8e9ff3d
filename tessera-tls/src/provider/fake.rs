//! In-memory provider for tests
//!
//! Models contexts, sessions and transport chains closely enough to observe
//! ownership: every allocation and release is counted, and releasing an
//! object twice is recorded instead of corrupting memory.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::io;
use std::num::NonZeroUsize;
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};
use std::sync::Weak;

use super::{ContextRef, KeyKind, SessionRef, SniHook, TlsProvider, TransportRef};

/// Error code queued by failed loads, mimicking the library's error queue.
pub(crate) const LOAD_ERROR: u64 = 0x0a00_0001;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Counters {
    pub contexts_created: usize,
    pub contexts_freed: usize,
    pub sessions_created: usize,
    pub sessions_freed: usize,
    pub transports_created: usize,
    pub transports_freed: usize,
    pub socket_transports: usize,
    pub double_frees: usize,
}

#[derive(Default)]
struct FakeContext {
    certificate: bool,
    key: bool,
    mismatched_key: bool,
    key_kinds: Vec<KeyKind>,
    hook: Option<Weak<dyn SniHook>>,
}

struct FakeSession {
    ctx: ContextRef,
    read: Option<TransportRef>,
    write: Option<TransportRef>,
    partial_write: bool,
    accepting: bool,
    servername: Option<String>,
    inbound: Vec<u8>,
    outbound: Vec<u8>,
    /// Write buffer stacked by an unfinished handshake
    handshake_buffer: Option<TransportRef>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TransportKind {
    Socket(RawFd),
    Buffer,
}

struct FakeTransport {
    kind: TransportKind,
    next: Option<TransportRef>,
    owners: u32,
    buffered: Vec<u8>,
}

#[derive(Default)]
struct State {
    next_id: usize,
    contexts: HashMap<ContextRef, FakeContext>,
    sessions: HashMap<SessionRef, FakeSession>,
    transports: HashMap<TransportRef, FakeTransport>,
    freed: HashSet<usize>,
    file_reads: HashMap<PathBuf, usize>,
    counters: Counters,
    pending_error: u64,
    fail_new_session: bool,
}

impl State {
    fn allocate(&mut self) -> NonZeroUsize {
        self.next_id += 1;
        NonZeroUsize::new(self.next_id).expect("ids start at one")
    }

    fn read_file(&mut self, path: &Path) -> Option<String> {
        *self.file_reads.entry(path.to_path_buf()).or_default() += 1;
        std::fs::read_to_string(path).ok()
    }

    fn fail(&mut self) -> bool {
        self.pending_error = LOAD_ERROR;
        false
    }

    fn free_chain(&mut self, transport: TransportRef) {
        let mut current = Some(transport);
        while let Some(t) = current {
            let Some(entry) = self.transports.get_mut(&t) else {
                if self.freed.contains(&t.into_raw().get()) {
                    self.counters.double_frees += 1;
                }
                return;
            };
            if entry.owners > 1 {
                entry.owners -= 1;
                return;
            }
            current = entry.next;
            self.transports.remove(&t);
            self.freed.insert(t.into_raw().get());
            self.counters.transports_freed += 1;
        }
    }
}

#[derive(Default)]
pub(crate) struct FakeProvider {
    state: Mutex<State>,
}

impl FakeProvider {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn counters(&self) -> Counters {
        self.state.lock().counters
    }

    pub(crate) fn file_reads(&self, path: &Path) -> usize {
        self.state.lock().file_reads.get(path).copied().unwrap_or(0)
    }

    pub(crate) fn total_file_reads(&self) -> usize {
        self.state.lock().file_reads.values().sum()
    }

    pub(crate) fn live_contexts(&self) -> usize {
        self.state.lock().contexts.len()
    }

    pub(crate) fn live_transports(&self) -> usize {
        self.state.lock().transports.len()
    }

    pub(crate) fn fail_new_session(&self, fail: bool) {
        self.state.lock().fail_new_session = fail;
    }

    pub(crate) fn set_pending_error(&self, code: u64) {
        self.state.lock().pending_error = code;
    }

    pub(crate) fn key_kinds(&self, ctx: ContextRef) -> Vec<KeyKind> {
        self.state
            .lock()
            .contexts
            .get(&ctx)
            .map(|c| c.key_kinds.clone())
            .unwrap_or_default()
    }

    pub(crate) fn has_sni_hook(&self, ctx: ContextRef) -> bool {
        self.state
            .lock()
            .contexts
            .get(&ctx)
            .is_some_and(|c| c.hook.is_some())
    }

    pub(crate) fn session_context(&self, session: SessionRef) -> Option<ContextRef> {
        self.state.lock().sessions.get(&session).map(|s| s.ctx)
    }

    pub(crate) fn session_flags(&self, session: SessionRef) -> Option<(bool, bool)> {
        self.state
            .lock()
            .sessions
            .get(&session)
            .map(|s| (s.partial_write, s.accepting))
    }

    pub(crate) fn transport_kind(&self, transport: TransportRef) -> Option<TransportKind> {
        self.state
            .lock()
            .transports
            .get(&transport)
            .map(|t| t.kind.clone())
    }

    pub(crate) fn buffered_data(&self, transport: TransportRef) -> Vec<u8> {
        self.state
            .lock()
            .transports
            .get(&transport)
            .map(|t| t.buffered.clone())
            .unwrap_or_default()
    }

    pub(crate) fn set_owner_count(&self, transport: TransportRef, owners: u32) {
        if let Some(t) = self.state.lock().transports.get_mut(&transport) {
            t.owners = owners;
        }
    }

    pub(crate) fn relink(&self, transport: TransportRef, next: Option<TransportRef>) {
        if let Some(t) = self.state.lock().transports.get_mut(&transport) {
            t.next = next;
        }
    }

    /// Reproduce the chain left behind by an aborted handshake: a write
    /// buffer is placed on top of the socket, which also serves the read
    /// side, directly or below the read buffer.
    pub(crate) fn simulate_aborted_handshake(&self, session: SessionRef) -> TransportRef {
        let mut state = self.state.lock();
        let socket = state.sessions[&session].write.expect("session has transports");
        let extra = TransportRef::from_raw(state.allocate());
        state.transports.insert(
            extra,
            FakeTransport {
                kind: TransportKind::Buffer,
                next: Some(socket),
                owners: 1,
                buffered: Vec::new(),
            },
        );
        state.counters.transports_created += 1;
        let entry = state.sessions.get_mut(&session).unwrap();
        entry.write = Some(extra);
        entry.handshake_buffer = Some(extra);
        extra
    }

    /// Deliver a ClientHello carrying `name` to the session's hook.
    pub(crate) fn client_hello(&self, session: SessionRef, name: &str) {
        let hook = {
            let mut state = self.state.lock();
            let entry = state.sessions.get_mut(&session).expect("live session");
            entry.servername = Some(name.to_string());
            let ctx = entry.ctx;
            state.contexts.get(&ctx).and_then(|c| c.hook.clone())
        };
        if let Some(hook) = hook.and_then(|h| h.upgrade()) {
            hook.on_servername(session, name);
        }
    }

    pub(crate) fn push_inbound(&self, session: SessionRef, data: &[u8]) {
        if let Some(s) = self.state.lock().sessions.get_mut(&session) {
            s.inbound.extend_from_slice(data);
        }
    }

    pub(crate) fn outbound(&self, session: SessionRef) -> Vec<u8> {
        self.state
            .lock()
            .sessions
            .get(&session)
            .map(|s| s.outbound.clone())
            .unwrap_or_default()
    }
}

impl TlsProvider for FakeProvider {
    fn new_context(&self) -> Option<ContextRef> {
        let mut state = self.state.lock();
        let ctx = ContextRef::from_raw(state.allocate());
        state.contexts.insert(ctx, FakeContext::default());
        state.counters.contexts_created += 1;
        Some(ctx)
    }

    fn free_context(&self, ctx: ContextRef) {
        let mut state = self.state.lock();
        if state.contexts.remove(&ctx).is_some() {
            state.counters.contexts_freed += 1;
        } else {
            state.counters.double_frees += 1;
        }
    }

    fn use_certificate_file(&self, ctx: ContextRef, path: &Path) -> bool {
        let mut state = self.state.lock();
        let valid = state
            .read_file(path)
            .is_some_and(|pem| pem.contains("-----BEGIN CERTIFICATE-----"));
        match state.contexts.get_mut(&ctx) {
            Some(c) if valid => {
                c.certificate = true;
                true
            }
            _ => state.fail(),
        }
    }

    fn use_private_key_file(&self, ctx: ContextRef, path: &Path) -> bool {
        let mut state = self.state.lock();
        let pem = state.read_file(path);
        let valid = pem.as_deref().is_some_and(|p| p.contains("PRIVATE KEY-----"));
        let mismatched = pem.as_deref().is_some_and(|p| p.contains("mismatch"));
        match state.contexts.get_mut(&ctx) {
            Some(c) if valid => {
                c.key = true;
                c.mismatched_key = mismatched;
                true
            }
            _ => state.fail(),
        }
    }

    fn use_certificate_der(&self, ctx: ContextRef, der: &[u8]) -> bool {
        let mut state = self.state.lock();
        match state.contexts.get_mut(&ctx) {
            Some(c) if !der.is_empty() => {
                c.certificate = true;
                true
            }
            _ => state.fail(),
        }
    }

    fn use_private_key_der(&self, ctx: ContextRef, kind: KeyKind, der: &[u8]) -> bool {
        let mut state = self.state.lock();
        match state.contexts.get_mut(&ctx) {
            Some(c) if !der.is_empty() => {
                c.key = true;
                c.mismatched_key |= der.starts_with(b"mismatch");
                c.key_kinds.push(kind);
                true
            }
            _ => state.fail(),
        }
    }

    fn check_private_key(&self, ctx: ContextRef) -> bool {
        let mut state = self.state.lock();
        let ok = state
            .contexts
            .get(&ctx)
            .is_some_and(|c| c.certificate && c.key && !c.mismatched_key);
        ok || state.fail()
    }

    fn set_sni_hook(&self, ctx: ContextRef, hook: Weak<dyn SniHook>) -> bool {
        match self.state.lock().contexts.get_mut(&ctx) {
            Some(c) => {
                c.hook = Some(hook);
                true
            }
            None => false,
        }
    }

    fn new_session(&self, ctx: ContextRef) -> Option<SessionRef> {
        let mut state = self.state.lock();
        if state.fail_new_session || !state.contexts.contains_key(&ctx) {
            state.fail();
            return None;
        }
        let session = SessionRef::from_raw(state.allocate());
        state.sessions.insert(
            session,
            FakeSession {
                ctx,
                read: None,
                write: None,
                partial_write: false,
                accepting: false,
                servername: None,
                inbound: Vec::new(),
                outbound: Vec::new(),
                handshake_buffer: None,
            },
        );
        state.counters.sessions_created += 1;
        Some(session)
    }

    fn free_session(&self, session: SessionRef) {
        let mut state = self.state.lock();
        let Some(entry) = state.sessions.remove(&session) else {
            state.counters.double_frees += 1;
            return;
        };
        state.counters.sessions_freed += 1;

        // The library unstacks its own write buffer before anything else.
        let mut write = entry.write;
        if let Some(buffer) = entry.handshake_buffer {
            let below = state.transports.get_mut(&buffer).and_then(|t| t.next.take());
            if write == Some(buffer) {
                write = below;
            }
            state.free_chain(buffer);
        }
        if let Some(write) = write {
            state.free_chain(write);
        }
        if let Some(read) = entry.read {
            state.free_chain(read);
        }
    }

    fn set_session_context(&self, session: SessionRef, ctx: ContextRef) -> bool {
        let mut state = self.state.lock();
        if !state.contexts.contains_key(&ctx) {
            return false;
        }
        match state.sessions.get_mut(&session) {
            Some(s) => {
                s.ctx = ctx;
                true
            }
            None => false,
        }
    }

    fn enable_partial_write(&self, session: SessionRef) -> bool {
        match self.state.lock().sessions.get_mut(&session) {
            Some(s) => {
                s.partial_write = true;
                true
            }
            None => false,
        }
    }

    fn set_accept_state(&self, session: SessionRef) {
        if let Some(s) = self.state.lock().sessions.get_mut(&session) {
            s.accepting = true;
        }
    }

    fn servername(&self, session: SessionRef) -> Option<String> {
        self.state
            .lock()
            .sessions
            .get(&session)
            .and_then(|s| s.servername.clone())
    }

    fn new_socket_transport(&self, fd: RawFd) -> Option<TransportRef> {
        let mut state = self.state.lock();
        let transport = TransportRef::from_raw(state.allocate());
        state.transports.insert(
            transport,
            FakeTransport {
                kind: TransportKind::Socket(fd),
                next: None,
                owners: 1,
                buffered: Vec::new(),
            },
        );
        state.counters.transports_created += 1;
        state.counters.socket_transports += 1;
        Some(transport)
    }

    fn new_buffer_transport(&self) -> Option<TransportRef> {
        let mut state = self.state.lock();
        let transport = TransportRef::from_raw(state.allocate());
        state.transports.insert(
            transport,
            FakeTransport {
                kind: TransportKind::Buffer,
                next: None,
                owners: 1,
                buffered: Vec::new(),
            },
        );
        state.counters.transports_created += 1;
        Some(transport)
    }

    fn push_transport(&self, top: TransportRef, below: TransportRef) {
        if let Some(t) = self.state.lock().transports.get_mut(&top) {
            t.next = Some(below);
        }
    }

    fn set_buffered_read_data(&self, transport: TransportRef, data: &[u8]) -> bool {
        match self.state.lock().transports.get_mut(&transport) {
            Some(t) if t.kind == TransportKind::Buffer => {
                t.buffered = data.to_vec();
                true
            }
            _ => false,
        }
    }

    fn set_transports(&self, session: SessionRef, read: TransportRef, write: TransportRef) {
        let mut state = self.state.lock();
        let Some(s) = state.sessions.get_mut(&session) else {
            return;
        };
        s.read = Some(read);
        s.write = Some(write);
        // One reference for each side, as the library takes them.
        if read == write {
            if let Some(t) = state.transports.get_mut(&read) {
                t.owners += 1;
            }
        }
    }

    fn read_transport(&self, session: SessionRef) -> Option<TransportRef> {
        self.state.lock().sessions.get(&session).and_then(|s| s.read)
    }

    fn write_transport(&self, session: SessionRef) -> Option<TransportRef> {
        self.state.lock().sessions.get(&session).and_then(|s| s.write)
    }

    fn next_transport(&self, transport: TransportRef) -> Option<TransportRef> {
        self.state
            .lock()
            .transports
            .get(&transport)
            .and_then(|t| t.next)
    }

    fn pop_transport(&self, transport: TransportRef) -> Option<TransportRef> {
        self.state
            .lock()
            .transports
            .get_mut(&transport)
            .and_then(|t| t.next.take())
    }

    fn owner_count(&self, transport: TransportRef) -> Option<u32> {
        self.state
            .lock()
            .transports
            .get(&transport)
            .map(|t| t.owners)
    }

    fn free_transport_chain(&self, transport: TransportRef) {
        self.state.lock().free_chain(transport);
    }

    fn read(&self, session: SessionRef, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        let s = state
            .sessions
            .get_mut(&session)
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
        let n = buf.len().min(s.inbound.len());
        buf[..n].copy_from_slice(&s.inbound[..n]);
        s.inbound.drain(..n);
        Ok(n)
    }

    fn write(&self, session: SessionRef, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        let s = state
            .sessions
            .get_mut(&session)
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
        s.outbound.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn shutdown(&self, session: SessionRef) -> io::Result<()> {
        if self.state.lock().sessions.contains_key(&session) {
            Ok(())
        } else {
            Err(io::ErrorKind::NotConnected.into())
        }
    }

    fn peek_error(&self) -> u64 {
        self.state.lock().pending_error
    }

    fn clear_error(&self) {
        self.state.lock().pending_error = 0;
    }
}
