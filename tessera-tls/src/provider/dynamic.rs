//! Provider backed by a system libssl located at run time
//!
//! Every entry point is looked up with `dlsym`, first among the symbols the
//! process already has loaded, then in the provider library itself. The
//! binding is all-or-nothing: a single missing symbol leaves TLS disabled.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::ffi::{CStr, CString, c_char, c_int, c_long, c_ulong, c_void};
use std::io;
use std::os::fd::RawFd;
use std::os::unix::ffi::OsStrExt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::Path;
use std::sync::Weak;

use super::{ContextRef, KeyKind, SessionRef, SniHook, TlsProvider, TransportRef, binding};

type Ptr = *mut c_void;
type ServernameCallback = unsafe extern "C" fn(Ptr, *mut c_int, Ptr) -> c_int;

const LIBRARY_NAMES: &[&CStr] = &[
    c"libssl.so.3",
    c"libssl.so.1.1",
    c"libssl.so",
    c"libssl.3.dylib",
    c"libssl.dylib",
];

const SSL_FILETYPE_PEM: c_int = 1;
const BIO_NOCLOSE: c_int = 0;
const BIO_C_SET_BUFF_READ_DATA: c_int = 122;
const SSL_CTRL_MODE: c_int = 33;
const SSL_MODE_ENABLE_PARTIAL_WRITE: c_long = 0x1;
const SSL_CTRL_SET_TLSEXT_SERVERNAME_CB: c_int = 53;
const SSL_CTRL_SET_TLSEXT_SERVERNAME_ARG: c_int = 54;
const TLSEXT_NAMETYPE_HOST_NAME: c_int = 0;
const SSL_TLSEXT_ERR_OK: c_int = 0;
const SSL_TLSEXT_ERR_ALERT_FATAL: c_int = 2;
const SSL_ERROR_WANT_READ: c_int = 2;
const SSL_ERROR_WANT_WRITE: c_int = 3;
const SSL_ERROR_SYSCALL: c_int = 5;
const SSL_ERROR_ZERO_RETURN: c_int = 6;
const EVP_PKEY_RSA: c_int = 6;
const EVP_PKEY_DSA: c_int = 116;
const EVP_PKEY_EC: c_int = 408;

macro_rules! entry_points {
    ($($field:ident: fn($($arg:ty),*) $(-> $ret:ty)? = [$($symbol:literal),+];)*) => {
        struct EntryPoints {
            $($field: unsafe extern "C" fn($($arg),*) $(-> $ret)?,)*
        }

        impl EntryPoints {
            /// Resolve every entry point, or report the first one missing.
            fn resolve(loader: &mut Loader) -> Result<Self, &'static str> {
                Ok(Self {
                    $($field: {
                        let names = [$($symbol),+];
                        let symbol = loader.find(&names).ok_or(names[0])?;
                        // SAFETY: the provider exports this symbol with this signature.
                        unsafe {
                            std::mem::transmute::<Ptr, unsafe extern "C" fn($($arg),*) $(-> $ret)?>(
                                symbol,
                            )
                        }
                    },)*
                })
            }
        }
    };
}

entry_points! {
    bio_ctrl: fn(Ptr, c_int, c_long, Ptr) -> c_long = ["BIO_ctrl"];
    bio_f_buffer: fn() -> Ptr = ["BIO_f_buffer"];
    bio_free_all: fn(Ptr) = ["BIO_free_all"];
    bio_new: fn(Ptr) -> Ptr = ["BIO_new"];
    bio_new_socket: fn(c_int, c_int) -> Ptr = ["BIO_new_socket"];
    bio_next: fn(Ptr) -> Ptr = ["BIO_next"];
    bio_pop: fn(Ptr) -> Ptr = ["BIO_pop"];
    bio_push: fn(Ptr, Ptr) -> Ptr = ["BIO_push"];
    err_clear_error: fn() = ["ERR_clear_error"];
    err_peek_error: fn() -> c_ulong = ["ERR_peek_error"];
    ctx_callback_ctrl: fn(Ptr, c_int, Option<unsafe extern "C" fn()>) -> c_long
        = ["SSL_CTX_callback_ctrl"];
    ctx_check_private_key: fn(Ptr) -> c_int = ["SSL_CTX_check_private_key"];
    ctx_ctrl: fn(Ptr, c_int, c_long, Ptr) -> c_long = ["SSL_CTX_ctrl"];
    ctx_free: fn(Ptr) = ["SSL_CTX_free"];
    ctx_new: fn(Ptr) -> Ptr = ["SSL_CTX_new"];
    ctx_use_private_key_file: fn(Ptr, *const c_char, c_int) -> c_int
        = ["SSL_CTX_use_PrivateKey_file"];
    ctx_use_private_key_asn1: fn(c_int, Ptr, *const u8, c_long) -> c_int
        = ["SSL_CTX_use_PrivateKey_ASN1"];
    ctx_use_certificate_file: fn(Ptr, *const c_char, c_int) -> c_int
        = ["SSL_CTX_use_certificate_file"];
    ctx_use_certificate_asn1: fn(Ptr, c_int, *const u8) -> c_int
        = ["SSL_CTX_use_certificate_ASN1"];
    ssl_ctrl: fn(Ptr, c_int, c_long, Ptr) -> c_long = ["SSL_ctrl"];
    ssl_free: fn(Ptr) = ["SSL_free"];
    ssl_get_error: fn(Ptr, c_int) -> c_int = ["SSL_get_error"];
    ssl_get_rbio: fn(Ptr) -> Ptr = ["SSL_get_rbio"];
    ssl_get_servername: fn(Ptr, c_int) -> *const c_char = ["SSL_get_servername"];
    ssl_get_wbio: fn(Ptr) -> Ptr = ["SSL_get_wbio"];
    ssl_new: fn(Ptr) -> Ptr = ["SSL_new"];
    ssl_read: fn(Ptr, Ptr, c_int) -> c_int = ["SSL_read"];
    ssl_set_ssl_ctx: fn(Ptr, Ptr) -> Ptr = ["SSL_set_SSL_CTX"];
    ssl_set_accept_state: fn(Ptr) = ["SSL_set_accept_state"];
    ssl_set_bio: fn(Ptr, Ptr, Ptr) = ["SSL_set_bio"];
    ssl_shutdown: fn(Ptr) -> c_int = ["SSL_shutdown"];
    ssl_write: fn(Ptr, *const c_void, c_int) -> c_int = ["SSL_write"];
    server_method: fn() -> Ptr = ["TLS_server_method", "SSLv23_server_method"];
}

/// Library initializer; its signature changed between provider generations.
enum LibraryInit {
    Current(unsafe extern "C" fn(u64, *const c_void) -> c_int),
    Legacy(unsafe extern "C" fn() -> c_int),
}

impl LibraryInit {
    fn resolve(loader: &mut Loader) -> Option<Self> {
        // SAFETY: signatures match the exported symbols.
        unsafe {
            if let Some(symbol) = loader.find(&["OPENSSL_init_ssl"]) {
                return Some(Self::Current(std::mem::transmute::<
                    Ptr,
                    unsafe extern "C" fn(u64, *const c_void) -> c_int,
                >(symbol)));
            }
            loader.find(&["SSL_library_init"]).map(|symbol| {
                Self::Legacy(std::mem::transmute::<Ptr, unsafe extern "C" fn() -> c_int>(
                    symbol,
                ))
            })
        }
    }

    fn run(&self) -> bool {
        // SAFETY: the initializer takes no pointers we own.
        unsafe {
            match self {
                Self::Current(init) => init(0, std::ptr::null()) == 1,
                Self::Legacy(init) => init() == 1,
            }
        }
    }
}

#[derive(Default)]
struct Loader {
    opened: bool,
    library: Option<Ptr>,
}

impl Loader {
    fn find(&mut self, names: &[&str]) -> Option<Ptr> {
        let names: Vec<CString> = names
            .iter()
            .filter_map(|name| CString::new(*name).ok())
            .collect();

        for name in &names {
            // SAFETY: name is NUL-terminated; RTLD_DEFAULT searches loaded objects.
            let symbol = unsafe { libc::dlsym(libc::RTLD_DEFAULT, name.as_ptr()) };
            if !symbol.is_null() {
                return Some(symbol);
            }
        }

        let library = self.library()?;
        names
            .iter()
            // SAFETY: library is a live handle returned by dlopen.
            .map(|name| unsafe { libc::dlsym(library, name.as_ptr()) })
            .find(|symbol| !symbol.is_null())
    }

    fn library(&mut self) -> Option<Ptr> {
        if !self.opened {
            self.opened = true;
            self.library = LIBRARY_NAMES.iter().find_map(|name| open_library(name));
        }
        self.library
    }
}

fn open_library(name: &CStr) -> Option<Ptr> {
    // SAFETY: name is NUL-terminated. The handle is intentionally never closed.
    unsafe {
        let flags = libc::RTLD_LAZY | libc::RTLD_GLOBAL;
        let mut handle = libc::dlopen(name.as_ptr(), flags | libc::RTLD_NOLOAD);
        if handle.is_null() {
            handle = libc::dlopen(name.as_ptr(), flags);
        }
        (!handle.is_null()).then_some(handle)
    }
}

fn c_path(path: &Path) -> Option<CString> {
    CString::new(path.as_os_str().as_bytes()).ok()
}

/// TLS provider implemented by a dynamically located libssl
pub(crate) struct DynamicProvider {
    api: EntryPoints,
    /// Servername hooks by context; boxed so the address handed to the
    /// library stays put until the context is freed.
    hooks: Mutex<HashMap<usize, Box<Weak<dyn SniHook>>>>,
}

impl DynamicProvider {
    /// Bind every entry point and initialise the library.
    ///
    /// Returns the name of the first missing symbol on failure.
    pub(crate) fn load() -> Result<Self, &'static str> {
        let mut loader = Loader::default();
        let api = EntryPoints::resolve(&mut loader)?;
        let init = LibraryInit::resolve(&mut loader).ok_or("SSL_library_init")?;
        if !init.run() {
            return Err("SSL_library_init");
        }

        let provider = Self {
            api,
            hooks: Mutex::new(HashMap::new()),
        };
        let pending = provider.peek_error();
        if pending != 0 {
            tracing::error!(
                error = pending,
                "TLS provider reported an error during initialisation; library linkage is suspect"
            );
            provider.clear_error();
        }
        Ok(provider)
    }

    fn io_result(&self, session: SessionRef, rc: c_int) -> io::Result<usize> {
        // SAFETY: session is a live SSL handle.
        let code = unsafe { (self.api.ssl_get_error)(session.as_ptr(), rc) };
        match code {
            SSL_ERROR_ZERO_RETURN => Ok(0),
            SSL_ERROR_WANT_READ | SSL_ERROR_WANT_WRITE => Err(io::ErrorKind::WouldBlock.into()),
            SSL_ERROR_SYSCALL => {
                let err = io::Error::last_os_error();
                self.clear_error();
                match err.raw_os_error() {
                    Some(0) | None => Err(io::ErrorKind::UnexpectedEof.into()),
                    Some(_) => Err(err),
                }
            }
            _ => {
                let pending = self.peek_error();
                self.clear_error();
                Err(io::Error::other(format!(
                    "TLS provider error {code} ({pending:#x})"
                )))
            }
        }
    }
}

unsafe extern "C" fn servername_callback(ssl: Ptr, _alert: *mut c_int, arg: Ptr) -> c_int {
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        let (Some(provider), Some(session)) = (binding::dynamic(), SessionRef::from_ptr(ssl))
        else {
            return;
        };
        // SAFETY: arg is the boxed hook registered with this context, which
        // outlives the context.
        let hook = unsafe { &*(arg as *const Weak<dyn SniHook>) };
        let Some(hook) = hook.upgrade() else {
            return;
        };
        if let Some(name) = provider.servername(session) {
            hook.on_servername(session, &name);
        }
    }));
    match outcome {
        Ok(()) => SSL_TLSEXT_ERR_OK,
        Err(_) => SSL_TLSEXT_ERR_ALERT_FATAL,
    }
}

// SAFETY (all methods below): handles were produced by this provider and are
// still owned by the caller, as the trait contract requires.
impl TlsProvider for DynamicProvider {
    fn new_context(&self) -> Option<ContextRef> {
        unsafe { ContextRef::from_ptr((self.api.ctx_new)((self.api.server_method)())) }
    }

    fn free_context(&self, ctx: ContextRef) {
        // Sessions may keep the context alive past this call; they must not
        // reach the hook once it is released.
        let hook = self.hooks.lock().remove(&ctx.into_raw().get());
        if hook.is_some() {
            unsafe {
                (self.api.ctx_callback_ctrl)(ctx.as_ptr(), SSL_CTRL_SET_TLSEXT_SERVERNAME_CB, None);
                (self.api.ctx_ctrl)(
                    ctx.as_ptr(),
                    SSL_CTRL_SET_TLSEXT_SERVERNAME_ARG,
                    0,
                    std::ptr::null_mut(),
                );
            }
        }
        unsafe { (self.api.ctx_free)(ctx.as_ptr()) }
        drop(hook);
    }

    fn use_certificate_file(&self, ctx: ContextRef, path: &Path) -> bool {
        let Some(path) = c_path(path) else {
            return false;
        };
        unsafe {
            (self.api.ctx_use_certificate_file)(ctx.as_ptr(), path.as_ptr(), SSL_FILETYPE_PEM)
                == 1
        }
    }

    fn use_private_key_file(&self, ctx: ContextRef, path: &Path) -> bool {
        let Some(path) = c_path(path) else {
            return false;
        };
        unsafe {
            (self.api.ctx_use_private_key_file)(ctx.as_ptr(), path.as_ptr(), SSL_FILETYPE_PEM)
                == 1
        }
    }

    fn use_certificate_der(&self, ctx: ContextRef, der: &[u8]) -> bool {
        let Ok(len) = c_int::try_from(der.len()) else {
            return false;
        };
        unsafe { (self.api.ctx_use_certificate_asn1)(ctx.as_ptr(), len, der.as_ptr()) == 1 }
    }

    fn use_private_key_der(&self, ctx: ContextRef, kind: KeyKind, der: &[u8]) -> bool {
        let Ok(len) = c_long::try_from(der.len()) else {
            return false;
        };
        let kind = match kind {
            KeyKind::Rsa => EVP_PKEY_RSA,
            KeyKind::Dsa => EVP_PKEY_DSA,
            KeyKind::Ec => EVP_PKEY_EC,
        };
        unsafe { (self.api.ctx_use_private_key_asn1)(kind, ctx.as_ptr(), der.as_ptr(), len) == 1 }
    }

    fn check_private_key(&self, ctx: ContextRef) -> bool {
        unsafe { (self.api.ctx_check_private_key)(ctx.as_ptr()) == 1 }
    }

    fn set_sni_hook(&self, ctx: ContextRef, hook: Weak<dyn SniHook>) -> bool {
        let hook = Box::new(hook);
        let arg = &*hook as *const Weak<dyn SniHook> as Ptr;
        self.hooks.lock().insert(ctx.into_raw().get(), hook);

        unsafe {
            let callback =
                std::mem::transmute::<ServernameCallback, unsafe extern "C" fn()>(
                    servername_callback,
                );
            (self.api.ctx_callback_ctrl)(
                ctx.as_ptr(),
                SSL_CTRL_SET_TLSEXT_SERVERNAME_CB,
                Some(callback),
            ) == 1
                && (self.api.ctx_ctrl)(ctx.as_ptr(), SSL_CTRL_SET_TLSEXT_SERVERNAME_ARG, 0, arg)
                    == 1
        }
    }

    fn new_session(&self, ctx: ContextRef) -> Option<SessionRef> {
        unsafe { SessionRef::from_ptr((self.api.ssl_new)(ctx.as_ptr())) }
    }

    fn free_session(&self, session: SessionRef) {
        unsafe { (self.api.ssl_free)(session.as_ptr()) }
    }

    fn set_session_context(&self, session: SessionRef, ctx: ContextRef) -> bool {
        unsafe { !(self.api.ssl_set_ssl_ctx)(session.as_ptr(), ctx.as_ptr()).is_null() }
    }

    fn enable_partial_write(&self, session: SessionRef) -> bool {
        let mode = unsafe {
            (self.api.ssl_ctrl)(
                session.as_ptr(),
                SSL_CTRL_MODE,
                SSL_MODE_ENABLE_PARTIAL_WRITE,
                std::ptr::null_mut(),
            )
        };
        mode & SSL_MODE_ENABLE_PARTIAL_WRITE != 0
    }

    fn set_accept_state(&self, session: SessionRef) {
        unsafe { (self.api.ssl_set_accept_state)(session.as_ptr()) }
    }

    fn servername(&self, session: SessionRef) -> Option<String> {
        let name = unsafe {
            (self.api.ssl_get_servername)(session.as_ptr(), TLSEXT_NAMETYPE_HOST_NAME)
        };
        if name.is_null() {
            return None;
        }
        Some(unsafe { CStr::from_ptr(name) }.to_string_lossy().into_owned())
    }

    fn new_socket_transport(&self, fd: RawFd) -> Option<TransportRef> {
        unsafe { TransportRef::from_ptr((self.api.bio_new_socket)(fd, BIO_NOCLOSE)) }
    }

    fn new_buffer_transport(&self) -> Option<TransportRef> {
        unsafe { TransportRef::from_ptr((self.api.bio_new)((self.api.bio_f_buffer)())) }
    }

    fn push_transport(&self, top: TransportRef, below: TransportRef) {
        unsafe {
            (self.api.bio_push)(top.as_ptr(), below.as_ptr());
        }
    }

    fn set_buffered_read_data(&self, transport: TransportRef, data: &[u8]) -> bool {
        let Ok(len) = c_long::try_from(data.len()) else {
            return false;
        };
        // The buffer filter copies the bytes; the pointer is only read.
        unsafe {
            (self.api.bio_ctrl)(
                transport.as_ptr(),
                BIO_C_SET_BUFF_READ_DATA,
                len,
                data.as_ptr() as Ptr,
            ) == 1
        }
    }

    fn set_transports(&self, session: SessionRef, read: TransportRef, write: TransportRef) {
        unsafe { (self.api.ssl_set_bio)(session.as_ptr(), read.as_ptr(), write.as_ptr()) }
    }

    fn read_transport(&self, session: SessionRef) -> Option<TransportRef> {
        unsafe { TransportRef::from_ptr((self.api.ssl_get_rbio)(session.as_ptr())) }
    }

    fn write_transport(&self, session: SessionRef) -> Option<TransportRef> {
        unsafe { TransportRef::from_ptr((self.api.ssl_get_wbio)(session.as_ptr())) }
    }

    fn next_transport(&self, transport: TransportRef) -> Option<TransportRef> {
        unsafe { TransportRef::from_ptr((self.api.bio_next)(transport.as_ptr())) }
    }

    fn pop_transport(&self, transport: TransportRef) -> Option<TransportRef> {
        unsafe { TransportRef::from_ptr((self.api.bio_pop)(transport.as_ptr())) }
    }

    fn owner_count(&self, _transport: TransportRef) -> Option<u32> {
        // Reference counts are not reachable through the public ABI.
        None
    }

    fn free_transport_chain(&self, transport: TransportRef) {
        unsafe { (self.api.bio_free_all)(transport.as_ptr()) }
    }

    fn read(&self, session: SessionRef, buf: &mut [u8]) -> io::Result<usize> {
        let len = c_int::try_from(buf.len()).unwrap_or(c_int::MAX);
        let rc = unsafe { (self.api.ssl_read)(session.as_ptr(), buf.as_mut_ptr().cast(), len) };
        if rc > 0 {
            return Ok(rc as usize);
        }
        self.io_result(session, rc)
    }

    fn write(&self, session: SessionRef, buf: &[u8]) -> io::Result<usize> {
        let len = c_int::try_from(buf.len()).unwrap_or(c_int::MAX);
        let rc = unsafe { (self.api.ssl_write)(session.as_ptr(), buf.as_ptr().cast(), len) };
        if rc > 0 {
            return Ok(rc as usize);
        }
        self.io_result(session, rc)
    }

    fn shutdown(&self, session: SessionRef) -> io::Result<()> {
        let rc = unsafe { (self.api.ssl_shutdown)(session.as_ptr()) };
        if rc >= 0 {
            return Ok(());
        }
        self.io_result(session, rc).map(|_| ())
    }

    fn peek_error(&self) -> u64 {
        unsafe { (self.api.err_peek_error)() as u64 }
    }

    fn clear_error(&self) {
        unsafe { (self.api.err_clear_error)() }
    }
}
