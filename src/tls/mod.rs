//! TLS overlay: an SSL state machine driven by the plain socket's events.
//!
//! Each TLS socket owns an `SslStream` over a `CipherIo` transport: the
//! plain read path feeds ciphertext into it, and ciphertext produced by
//! OpenSSL is flushed back out through the plain write path after every
//! SSL operation. Wherever a user callback runs, the state is parked back
//! on the socket entry first so the callback may re-enter `write`,
//! `shutdown` or `close` on the same socket.

use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};

use openssl::dh::Dh;
use openssl::error::ErrorStack;
use openssl::pkey::PKey;
use openssl::ssl::{
    ErrorCode, NameType, ShutdownResult, Ssl, SslContext, SslContextBuilder, SslFiletype,
    SslMethod, SslMode, SslOptions, SslVerifyMode, SslVersion,
};
use openssl::x509::store::X509StoreBuilder;
use openssl::x509::{X509VerifyResult, X509};

use crate::context::Callbacks;
use crate::poll::{ContextId, SocketId};
use crate::util::Handle;
use crate::{EventLoop, RECV_BUFFER_LENGTH, RECV_BUFFER_PADDING};

mod sni;
pub use self::sni::SniTree;
use self::sni::SniState;

/// TLS configuration, mirroring the options a context accepts.
#[derive(Default, Clone)]
pub struct TlsContextOptions {
    pub key_file_name: Option<String>,
    pub key: Vec<String>,
    pub cert_file_name: Option<String>,
    pub cert: Vec<String>,
    pub ca_file_name: Option<String>,
    pub ca: Vec<String>,
    pub passphrase: Option<String>,
    pub dh_params_file_name: Option<String>,
    pub ssl_ciphers: Option<String>,
    pub ssl_prefer_low_memory_usage: bool,
    /// Raw `SSL_OP_*` bits OR'd into the context options.
    pub secure_options: u64,
    pub reject_unauthorized: bool,
    pub request_cert: bool,
}

#[derive(Debug)]
pub enum TlsError {
    LoadCaFile,
    InvalidCaFile,
    InvalidCa,
    InvalidCert,
    InvalidKey,
    InvalidDhParams,
    Ssl(ErrorStack),
    Io(io::Error),
}

impl From<ErrorStack> for TlsError {
    fn from(err: ErrorStack) -> TlsError {
        TlsError::Ssl(err)
    }
}

impl From<io::Error> for TlsError {
    fn from(err: io::Error) -> TlsError {
        TlsError::Io(err)
    }
}

impl std::fmt::Display for TlsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TlsError::LoadCaFile => write!(f, "failed to load CA file"),
            TlsError::InvalidCaFile => write!(f, "invalid CA file"),
            TlsError::InvalidCa => write!(f, "invalid CA certificate"),
            TlsError::InvalidCert => write!(f, "invalid certificate"),
            TlsError::InvalidKey => write!(f, "invalid private key"),
            TlsError::InvalidDhParams => write!(f, "invalid DH parameters"),
            TlsError::Ssl(err) => write!(f, "{}", err),
            TlsError::Io(err) => write!(f, "{}", err),
        }
    }
}

impl std::error::Error for TlsError {}

/// Outcome of certificate verification, reported by `on_handshake`.
#[derive(Debug, Clone, Default)]
pub struct VerifyError {
    /// `X509_V_*` error code; 0 is OK.
    pub error: i32,
    pub reason: Option<String>,
}

impl VerifyError {
    fn ok() -> VerifyError {
        VerifyError::default()
    }

    pub fn is_ok(&self) -> bool {
        self.error == 0
    }
}

pub type OnHandshakeFn = fn(&mut EventLoop, SocketId, bool, &VerifyError);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandshakeState {
    Pending,
    Completed,
    /// A mid-stream handshake is in flight on an established session.
    RenegotiationPending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Client,
    Server,
}

/// Per-socket transport between OpenSSL and the plain socket. Reads pull
/// from the ciphertext fed in by the current `on_data`; writes collect
/// ciphertext that the overlay flushes after the SSL call returns. While a
/// flush is backed up, writes report `WouldBlock` so OpenSSL sees
/// WANT_WRITE exactly like it would on a blocked BIO.
struct CipherIo {
    incoming: Vec<u8>,
    in_off: usize,
    outgoing: Vec<u8>,
    blocked: bool,
}

impl CipherIo {
    fn new() -> CipherIo {
        CipherIo {
            incoming: Vec::new(),
            in_off: 0,
            outgoing: Vec::new(),
            blocked: false,
        }
    }

    fn unread(&self) -> usize {
        self.incoming.len() - self.in_off
    }

    fn feed(&mut self, data: &[u8]) {
        if self.in_off == self.incoming.len() {
            self.incoming.clear();
            self.in_off = 0;
        }
        self.incoming.extend_from_slice(data);
    }
}

impl Read for CipherIo {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let avail = self.unread();
        if avail == 0 {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let n = avail.min(buf.len());
        buf[..n].copy_from_slice(&self.incoming[self.in_off..self.in_off + n]);
        self.in_off += n;
        if self.in_off == self.incoming.len() {
            self.incoming.clear();
            self.in_off = 0;
        }
        Ok(n)
    }
}

impl Write for CipherIo {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.blocked {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        self.outgoing.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub(crate) struct TlsSocket {
    stream: openssl::ssl::SslStream<CipherIo>,
    role: Role,
    handshake: HandshakeState,
    write_wants_read: bool,
    read_wants_write: bool,
    fatal_error: bool,
    sent_shutdown: bool,
    received_shutdown: bool,
    last_write_was_msg_more: bool,
}

/// Old-context callbacks kept alive by `wrap_with_tls` so both layers see
/// their events.
pub(crate) struct WrappedCallbacks {
    pub(crate) old: Callbacks,
    pub(crate) tcp_context: Handle,
}

/// TLS extension of a context entry.
pub(crate) struct TlsContextExt {
    pub(crate) ssl_ctx: SslContext,
    /// User-level callbacks; the base table drives the overlay.
    pub(crate) user: Callbacks,
    pub(crate) sni: Option<Arc<Mutex<SniState>>>,
    pub(crate) on_handshake: Option<OnHandshakeFn>,
    pub(crate) wrapped: Option<WrappedCallbacks>,
}

/* Context construction */

fn use_cert_chain_pem(builder: &mut SslContextBuilder, pem: &str) -> Result<(), TlsError> {
    let mut certs = X509::stack_from_pem(pem.as_bytes()).map_err(|_| TlsError::InvalidCert)?;
    if certs.is_empty() {
        return Err(TlsError::InvalidCert);
    }
    let leaf = certs.remove(0);
    builder.set_certificate(&leaf)?;
    for extra in certs {
        builder.add_extra_chain_cert(extra)?;
    }
    Ok(())
}

fn verify_mode(options: &TlsContextOptions) -> SslVerifyMode {
    let mut mode = SslVerifyMode::PEER;
    if options.reject_unauthorized {
        mode |= SslVerifyMode::FAIL_IF_NO_PEER_CERT;
    }
    mode
}

/// Apply options to a fresh `SSL_CTX` builder. Shared by whole contexts
/// and per-SNI-name configurations.
fn configure_builder(options: &TlsContextOptions) -> Result<SslContextBuilder, TlsError> {
    openssl::init();

    let mut builder = SslContext::builder(SslMethod::tls())?;

    /* Defaults our logic relies on */
    builder.set_read_ahead(true);
    // Retried writes may come from a buffer at a different address.
    builder.set_mode(SslMode::ACCEPT_MOVING_WRITE_BUFFER);
    // Anything below TLS 1.2 is disabled.
    builder.set_min_proto_version(Some(SslVersion::TLS1_2))?;

    if options.ssl_prefer_low_memory_usage {
        builder.set_mode(SslMode::RELEASE_BUFFERS);
    }

    if let Some(ref cert_file) = options.cert_file_name {
        builder
            .set_certificate_chain_file(cert_file)
            .map_err(|_| TlsError::InvalidCert)?;
    } else {
        for pem in &options.cert {
            use_cert_chain_pem(&mut builder, pem)?;
        }
    }

    if let Some(ref key_file) = options.key_file_name {
        match options.passphrase {
            Some(ref passphrase) => {
                let pem = std::fs::read(key_file).map_err(|_| TlsError::InvalidKey)?;
                let key = PKey::private_key_from_pem_passphrase(&pem, passphrase.as_bytes())
                    .map_err(|_| TlsError::InvalidKey)?;
                builder.set_private_key(&key)?;
            }
            None => builder
                .set_private_key_file(key_file, SslFiletype::PEM)
                .map_err(|_| TlsError::InvalidKey)?,
        }
    } else {
        for pem in &options.key {
            let key = match options.passphrase {
                Some(ref passphrase) => {
                    PKey::private_key_from_pem_passphrase(pem.as_bytes(), passphrase.as_bytes())
                        .map_err(|_| TlsError::InvalidKey)?
                }
                None => PKey::private_key_from_pem(pem.as_bytes())
                    .map_err(|_| TlsError::InvalidKey)?,
            };
            builder.set_private_key(&key)?;
        }
    }

    if let Some(ref ca_file) = options.ca_file_name {
        builder
            .set_ca_file(ca_file)
            .map_err(|_| TlsError::LoadCaFile)?;
        builder.set_verify_callback(verify_mode(options), |_, _| true);
    } else if !options.ca.is_empty() {
        let mut store = X509StoreBuilder::new().map_err(TlsError::Ssl)?;
        for pem in &options.ca {
            let certs = X509::stack_from_pem(pem.as_bytes()).map_err(|_| TlsError::InvalidCa)?;
            if certs.is_empty() {
                return Err(TlsError::InvalidCa);
            }
            for cert in certs {
                store.add_cert(cert).map_err(|_| TlsError::InvalidCa)?;
            }
        }
        builder.set_cert_store(store.build());
        builder.set_verify_callback(verify_mode(options), |_, _| true);
    } else if options.request_cert {
        builder.set_verify_callback(verify_mode(options), |_, _| true);
    }

    if let Some(ref dh_file) = options.dh_params_file_name {
        let pem = std::fs::read(dh_file).map_err(|_| TlsError::InvalidDhParams)?;
        let dh = Dh::params_from_pem(&pem).map_err(|_| TlsError::InvalidDhParams)?;
        builder
            .set_tmp_dh(&dh)
            .map_err(|_| TlsError::InvalidDhParams)?;
        builder
            .set_cipher_list(
                "DHE-RSA-AES256-GCM-SHA384:DHE-RSA-AES128-GCM-SHA256:\
                 ECDHE-RSA-AES256-GCM-SHA384:ECDHE-RSA-AES128-GCM-SHA256",
            )
            .map_err(|_| TlsError::InvalidDhParams)?;
    }

    if let Some(ref ciphers) = options.ssl_ciphers {
        builder.set_cipher_list(ciphers).map_err(TlsError::Ssl)?;
    }

    if options.secure_options != 0 {
        builder.set_options(SslOptions::from_bits_truncate(options.secure_options as _));
    }

    Ok(builder)
}

/// Build a finished `SSL_CTX` from options.
pub(crate) fn create_ssl_context(options: &TlsContextOptions) -> Result<SslContext, TlsError> {
    configure_builder(options).map(|builder| builder.build())
}

impl EventLoop {
    /// Create a TLS socket context. Its callbacks drive the overlay; the
    /// callbacks registered through `context_on_*` observe plaintext.
    pub fn create_tls_context(
        &mut self,
        options: &TlsContextOptions,
    ) -> Result<ContextId, TlsError> {
        openssl::init();

        let sni = Arc::new(Mutex::new(SniState::new()));

        let mut builder = configure_builder(options)?;
        let sni_for_cb = Arc::clone(&sni);
        builder.set_servername_callback(move |ssl, _alert| {
            if let Some(hostname) = ssl.servername(NameType::HOST_NAME) {
                if !hostname.is_empty() {
                    let hostname = hostname.to_owned();
                    let mut state = sni_for_cb.lock().unwrap();
                    if let Some(resolved) = state.resolve(&hostname) {
                        let _ = ssl.set_ssl_context(&resolved);
                    }
                }
            }
            Ok(())
        });
        let ssl_ctx = builder.build();

        let ctx = self.create_context();
        if let Some(c) = self.contexts.get_mut(ctx.0) {
            c.callbacks = base_tls_callbacks();
            c.tls = Some(Box::new(TlsContextExt {
                ssl_ctx,
                user: Callbacks::default(),
                sni: Some(sni),
                on_handshake: None,
                wrapped: None,
            }));
        }
        Ok(ctx)
    }

    /// Create a context sharing the parent's `SSL_CTX` (certificates and
    /// session caches) but nothing else.
    pub fn create_tls_child_context(&mut self, parent: ContextId) -> Option<ContextId> {
        let ssl_ctx = self
            .contexts
            .get(parent.0)
            .and_then(|c| c.tls.as_ref())
            .map(|tls| tls.ssl_ctx.clone())?;

        let ctx = self.create_context();
        if let Some(c) = self.contexts.get_mut(ctx.0) {
            c.callbacks = base_tls_callbacks();
            c.tls = Some(Box::new(TlsContextExt {
                ssl_ctx,
                user: Callbacks::default(),
                sni: None,
                on_handshake: None,
                wrapped: None,
            }));
        }
        Some(ctx)
    }

    /// One-shot handshake notification: fires exactly once per socket, with
    /// the verification outcome, before any close that may follow.
    pub fn context_on_handshake(&mut self, ctx: ContextId, cb: OnHandshakeFn) {
        if let Some(tls) = self
            .contexts
            .get_mut(ctx.0)
            .and_then(|c| c.tls.as_mut())
        {
            tls.on_handshake = Some(cb);
        }
    }

    /// Register a hostname pattern with its own certificate configuration.
    pub fn context_add_server_name(
        &mut self,
        ctx: ContextId,
        pattern: &str,
        options: &TlsContextOptions,
        user: Option<Arc<dyn std::any::Any + Send + Sync>>,
    ) -> Result<(), TlsError> {
        let sni = self.sni_of(ctx).ok_or(TlsError::InvalidCert)?;
        let mut state = sni.lock().unwrap();
        state.tree.add(pattern, options, user)
    }

    pub fn context_remove_server_name(&mut self, ctx: ContextId, pattern: &str) {
        if let Some(sni) = self.sni_of(ctx) {
            sni.lock().unwrap().tree.remove(pattern);
        }
    }

    /// Hook called when SNI lookup misses; it may add the missing name and
    /// the lookup is retried once.
    pub fn context_on_server_name(&mut self, ctx: ContextId, cb: fn(&mut SniTree, &str)) {
        if let Some(sni) = self.sni_of(ctx) {
            sni.lock().unwrap().on_missing = Some(cb);
        }
    }

    pub fn context_find_server_name_userdata(
        &self,
        ctx: ContextId,
        pattern: &str,
    ) -> Option<Arc<dyn std::any::Any + Send + Sync>> {
        let sni = self.sni_of(ctx)?;
        let state = sni.lock().unwrap();
        state.tree.find_user(pattern)
    }

    fn sni_of(&self, ctx: ContextId) -> Option<Arc<Mutex<SniState>>> {
        self.contexts
            .get(ctx.0)
            .and_then(|c| c.tls.as_ref())
            .and_then(|tls| tls.sni.clone())
    }

    /// Adopt an established plain socket into a freshly-created TLS context
    /// and start the client handshake. The previous context's callbacks
    /// keep firing alongside the new ones.
    pub fn wrap_with_tls(
        &mut self,
        s: SocketId,
        options: &TlsContextOptions,
        events: Callbacks,
    ) -> Result<SocketId, TlsError> {
        let entry = match self.socket_entry(s) {
            Some(e) if !e.closed => e,
            _ => return Err(TlsError::Io(io::ErrorKind::NotConnected.into())),
        };
        let old_ctx = entry.ctx;
        let old_callbacks = self.callbacks_of(old_ctx);
        self.context_ref(old_ctx);

        let ctx = self.create_tls_context(options)?;
        if let Some(tls) = self
            .contexts
            .get_mut(ctx.0)
            .and_then(|c| c.tls.as_mut())
        {
            tls.user = events;
            tls.wrapped = Some(WrappedCallbacks {
                old: old_callbacks,
                tcp_context: old_ctx,
            });
        }

        let s = self.adopt_socket(ctx, s);
        // The socket is already open; run the TLS open path synthetically
        // to kick the client handshake.
        ssl_on_open(self, s, true, &[]);
        Ok(s)
    }

    /// Adopt a plain socket into an existing TLS context, present `sni` to
    /// the server and start the client handshake.
    pub fn upgrade_to_tls(
        &mut self,
        s: SocketId,
        ctx: ContextId,
        sni: Option<&str>,
    ) -> SocketId {
        let s = self.adopt_socket(ctx, s);
        if let Some(hostname) = sni {
            if let Some(e) = self.socket_entry_mut(s) {
                e.sni = Some(hostname.into());
            }
        }
        ssl_on_open(self, s, true, &[]);
        s
    }
}

/// The base callback table of a TLS context: everything routes through the
/// overlay, which then dispatches to the user-level callbacks.
fn base_tls_callbacks() -> Callbacks {
    Callbacks {
        on_open: Some(ssl_on_open_server_or_client),
        on_data: Some(ssl_on_data),
        on_writable: Some(ssl_on_writable),
        on_close: Some(ssl_on_close),
        on_end: Some(ssl_on_end),
        on_timeout: Some(ssl_on_timeout),
        on_long_timeout: Some(ssl_on_long_timeout),
        on_connect_error: Some(ssl_on_connect_error),
        on_socket_connect_error: Some(ssl_on_socket_connect_error),
        is_low_prio: Some(ssl_is_low_prio),
    }
}

/* State juggling helpers. The TLS state is taken out of the entry while
 * OpenSSL runs, and parked back before any user callback. */

fn take(lp: &mut EventLoop, s: SocketId) -> Option<Box<TlsSocket>> {
    lp.socket_entry_mut(s).and_then(|e| e.tls.take())
}

/// Park the state back on the entry. Returns `false` (dropping the state)
/// when the socket closed in the meantime.
fn put_back(lp: &mut EventLoop, s: SocketId, tls: Box<TlsSocket>) -> bool {
    match lp.socket_entry_mut(s) {
        Some(e) if !e.closed => {
            e.tls = Some(tls);
            true
        }
        _ => false,
    }
}

fn tls_ext_of<'a>(lp: &'a EventLoop, s: SocketId) -> Option<&'a TlsContextExt> {
    let ctx = lp.socket_entry(s)?.ctx;
    lp.contexts.get(ctx).and_then(|c| c.tls.as_deref())
}

fn user_callbacks(lp: &EventLoop, s: SocketId) -> Callbacks {
    tls_ext_of(lp, s).map(|t| t.user).unwrap_or_default()
}

fn wrapped_old_callbacks(lp: &EventLoop, s: SocketId) -> Option<Callbacks> {
    tls_ext_of(lp, s).and_then(|t| t.wrapped.as_ref()).map(|w| w.old)
}

/// Push buffered ciphertext out through the plain socket. On a partial
/// write the remainder stays buffered and OpenSSL sees WANT_WRITE until
/// the transport drains.
fn flush_outgoing(lp: &mut EventLoop, s: SocketId, tls: &mut TlsSocket, msg_more: bool) {
    let out = {
        let io = tls.stream.get_mut();
        if io.outgoing.is_empty() {
            return;
        }
        std::mem::take(&mut io.outgoing)
    };

    let written = lp.plain_write(s, &out, msg_more);
    let io = tls.stream.get_mut();
    if written < out.len() {
        io.outgoing = out[written..].to_vec();
        io.blocked = true;
    } else {
        io.blocked = false;
    }
}

fn verify_error_of(tls: &TlsSocket) -> VerifyError {
    let ssl = tls.stream.ssl();
    match ssl.peer_certificate() {
        Some(_) => {
            let result = ssl.verify_result();
            if result == X509VerifyResult::OK {
                VerifyError::ok()
            } else {
                VerifyError {
                    error: result.as_raw(),
                    reason: Some(result.error_string().to_owned()),
                }
            }
        }
        // No peer certificate: plain anonymous-client handshakes, PSK and
        // TLS 1.3 resumption all land here and verify clean. A server that
        // must see a certificate enforces it via FAIL_IF_NO_PEER_CERT.
        None => VerifyError::ok(),
    }
}

/// Flip to Completed and fire the one-shot handshake callback. Returns the
/// re-taken state, or `None` when the callback closed the socket.
fn trigger_handshake_callback(
    lp: &mut EventLoop,
    s: SocketId,
    mut tls: Box<TlsSocket>,
    success: bool,
) -> Option<Box<TlsSocket>> {
    tls.handshake = HandshakeState::Completed;
    let verify = verify_error_of(&tls);
    let cb = tls_ext_of(lp, s).and_then(|t| t.on_handshake);

    if !put_back(lp, s, tls) {
        return None;
    }
    if let Some(cb) = cb {
        cb(lp, s, success, &verify);
    }
    take(lp, s)
}

/// Drive the handshake forward. Returns the state, or `None` when the
/// socket went away.
fn update_handshake(
    lp: &mut EventLoop,
    s: SocketId,
    mut tls: Box<TlsSocket>,
) -> Option<Box<TlsSocket>> {
    if tls.handshake != HandshakeState::Pending {
        return Some(tls);
    }

    let shut_down = lp
        .socket_entry(s)
        .map_or(true, |e| e.closed || e.is_shut_down());
    if shut_down || tls.sent_shutdown || tls.received_shutdown || tls.fatal_error {
        return trigger_handshake_callback(lp, s, tls, false);
    }

    let result = match tls.role {
        Role::Client => tls.stream.connect(),
        Role::Server => tls.stream.accept(),
    };
    // Handshake records (ClientHello, Finished, ...) are now buffered.
    flush_outgoing(lp, s, &mut tls, false);

    match result {
        Ok(()) => {
            tls.write_wants_read = true;
            trigger_handshake_callback(lp, s, tls, true)
        }
        Err(err) => match err.code() {
            ErrorCode::WANT_READ | ErrorCode::WANT_WRITE => {
                tls.write_wants_read = true;
                Some(tls)
            }
            _ => {
                // Fatal; constructing the error drained OpenSSL's
                // per-thread error queue already.
                tls.fatal_error = true;
                trigger_handshake_callback(lp, s, tls, false)
            }
        },
    }
}

fn is_tls_shut_down(entry_shut_down: bool, tls: &TlsSocket) -> bool {
    entry_shut_down || tls.sent_shutdown || tls.fatal_error
}

/* Overlay entry points used by socket.rs */

pub(crate) fn socket_is_shut_down(lp: &EventLoop, s: SocketId) -> bool {
    match lp.socket_entry(s) {
        Some(e) => match e.tls.as_ref() {
            Some(tls) => is_tls_shut_down(e.is_shut_down(), tls),
            None => e.is_shut_down(),
        },
        None => false,
    }
}

pub(crate) fn socket_write(lp: &mut EventLoop, s: SocketId, data: &[u8], msg_more: bool) -> usize {
    if data.is_empty() || lp.is_closed(s) {
        return 0;
    }
    let Some(mut tls) = take(lp, s) else {
        return 0;
    };
    let entry_shut_down = lp.socket_entry(s).map_or(true, |e| e.is_shut_down());
    if is_tls_shut_down(entry_shut_down, &tls) {
        put_back(lp, s, tls);
        return 0;
    }

    // Give a backed-up transport a chance to drain first.
    if tls.stream.get_ref().blocked {
        flush_outgoing(lp, s, &mut tls, msg_more);
    }

    let result = tls.stream.ssl_write(data);
    let was_msg_more = tls.last_write_was_msg_more;
    tls.last_write_was_msg_more = msg_more;
    flush_outgoing(lp, s, &mut tls, msg_more);
    if was_msg_more && !msg_more {
        lp.flush(s);
    }

    let written = match result {
        Ok(n) => n,
        Err(err) => {
            match err.code() {
                ErrorCode::WANT_READ => {
                    // Trigger a writable notification on the next read. A
                    // write wanting a read on an established session means
                    // the peer kicked off a new handshake.
                    tls.write_wants_read = true;
                    if tls.handshake == HandshakeState::Completed {
                        tls.handshake = HandshakeState::RenegotiationPending;
                    }
                }
                ErrorCode::WANT_WRITE => {}
                _ => {
                    tls.fatal_error = true;
                }
            }
            0
        }
    };

    put_back(lp, s, tls);
    written
}

/// Graceful shutdown: send close_notify and await the peer's, which
/// arrives through the read path as a clean close.
pub(crate) fn socket_shutdown(lp: &mut EventLoop, s: SocketId) {
    if lp.is_closed(s) {
        return;
    }
    let Some(mut tls) = take(lp, s) else {
        lp.plain_shutdown(s);
        return;
    };
    let entry_shut_down = lp.socket_entry(s).map_or(true, |e| e.is_shut_down());
    if is_tls_shut_down(entry_shut_down, &tls) {
        put_back(lp, s, tls);
        return;
    }

    if tls.handshake != HandshakeState::Completed {
        // Mid-handshake there is no close_notify to negotiate.
        put_back(lp, s, tls);
        lp.plain_shutdown(s);
        return;
    }

    match tls.stream.shutdown() {
        Ok(ShutdownResult::Sent) => {
            tls.sent_shutdown = true;
            flush_outgoing(lp, s, &mut tls, false);
        }
        Ok(ShutdownResult::Received) => {
            tls.sent_shutdown = true;
            tls.received_shutdown = true;
            flush_outgoing(lp, s, &mut tls, false);
        }
        Err(err) => match err.code() {
            ErrorCode::WANT_READ | ErrorCode::WANT_WRITE => {
                flush_outgoing(lp, s, &mut tls, false);
            }
            _ => {
                tls.fatal_error = true;
                flush_outgoing(lp, s, &mut tls, false);
                put_back(lp, s, tls);
                lp.plain_shutdown(s);
                return;
            }
        },
    }
    put_back(lp, s, tls);
}

/// Finish (or force) the close_notify exchange before tearing down. Returns
/// whether the socket may be closed right now.
fn handle_shutdown(
    lp: &mut EventLoop,
    s: SocketId,
    tls: &mut TlsSocket,
    force_fast: bool,
) -> bool {
    let entry_shut_down = lp.socket_entry(s).map_or(true, |e| e.is_shut_down());
    if entry_shut_down
        || tls.fatal_error
        || tls.handshake != HandshakeState::Completed
        || (tls.sent_shutdown && tls.received_shutdown)
    {
        return true;
    }

    match tls.stream.shutdown() {
        Ok(ShutdownResult::Sent) => {
            tls.sent_shutdown = true;
            flush_outgoing(lp, s, tls, false);
            if !force_fast {
                // Wait for the peer's close_notify; the read path closes.
                return false;
            }
            // Fast shutdown: do not wait for the peer.
            if let Ok(ShutdownResult::Received) = tls.stream.shutdown() {
                tls.received_shutdown = true;
            }
            flush_outgoing(lp, s, tls, false);
            true
        }
        Ok(ShutdownResult::Received) => {
            tls.sent_shutdown = true;
            tls.received_shutdown = true;
            flush_outgoing(lp, s, tls, false);
            true
        }
        Err(err) => match err.code() {
            ErrorCode::WANT_READ | ErrorCode::WANT_WRITE => {
                flush_outgoing(lp, s, tls, false);
                force_fast
            }
            _ => {
                tls.fatal_error = true;
                true
            }
        },
    }
}

pub(crate) fn socket_close(lp: &mut EventLoop, s: SocketId, code: i32) {
    if lp.is_closed(s) {
        return;
    }
    let Some(mut tls) = take(lp, s) else {
        lp.plain_close(s, code);
        return;
    };

    // Any pending handshake concludes (as a failure) before the close, so
    // every socket sees its handshake callback before on_close.
    if tls.handshake != HandshakeState::Completed {
        tls = match trigger_handshake_callback(lp, s, tls, false) {
            Some(tls) => tls,
            None => return,
        };
    }

    // A non-zero close code forces a fast shutdown.
    let can_close = handle_shutdown(lp, s, &mut tls, code != 0);
    if !can_close {
        put_back(lp, s, tls);
        return;
    }
    put_back(lp, s, tls);
    lp.plain_close(s, code);
}

/* Base callbacks installed on TLS contexts */

fn ssl_on_open_server_or_client(lp: &mut EventLoop, s: SocketId, is_client: bool, ip: &[u8]) {
    ssl_on_open(lp, s, is_client, ip);
}

fn ssl_on_open(lp: &mut EventLoop, s: SocketId, is_client: bool, ip: &[u8]) {
    let Some(ext) = tls_ext_of(lp, s) else {
        return;
    };
    let ssl_ctx = ext.ssl_ctx.clone();

    let mut ssl = match Ssl::new(&ssl_ctx) {
        Ok(ssl) => ssl,
        Err(_) => {
            lp.plain_close(s, crate::CLOSE_CODE_CLEAN);
            return;
        }
    };

    let sni = lp.socket_entry_mut(s).and_then(|e| e.sni.take());
    if is_client {
        if let Some(hostname) = sni {
            let _ = ssl.set_hostname(&hostname);
        }
    }

    let stream = match openssl::ssl::SslStream::new(ssl, CipherIo::new()) {
        Ok(stream) => stream,
        Err(_) => {
            lp.plain_close(s, crate::CLOSE_CODE_CLEAN);
            return;
        }
    };

    let tls = Box::new(TlsSocket {
        stream,
        role: if is_client { Role::Client } else { Role::Server },
        handshake: HandshakeState::Pending,
        write_wants_read: false,
        read_wants_write: false,
        fatal_error: false,
        sent_shutdown: false,
        received_shutdown: false,
        last_write_was_msg_more: false,
    });
    if let Some(e) = lp.socket_entry_mut(s) {
        e.tls = Some(tls);
    }

    if let Some(cb) = user_callbacks(lp, s).on_open {
        cb(lp, s, is_client, ip);
    }

    // Always handshake right after open; some peers wait for the first
    // flight before saying anything.
    if let Some(tls) = take(lp, s) {
        if let Some(tls) = update_handshake(lp, s, tls) {
            put_back(lp, s, tls);
        }
    }
}

fn ssl_on_data(lp: &mut EventLoop, s: SocketId, data: &mut [u8]) {
    // A wrapped socket's previous owner still sees the raw bytes.
    if let Some(old) = wrapped_old_callbacks(lp, s) {
        if let Some(cb) = old.on_data {
            cb(lp, s, data);
            if lp.is_closed(s) {
                return;
            }
        }
    }

    let Some(mut tls) = take(lp, s) else {
        return;
    };
    tls.stream.get_mut().feed(data);

    let entry_shut_down = lp.socket_entry(s).map_or(true, |e| e.is_shut_down());
    if is_tls_shut_down(entry_shut_down, &tls) {
        // Data after our close_notify: the peer is finishing the shutdown.
        put_back(lp, s, tls);
        socket_close(lp, s, crate::CLOSE_CODE_CLEAN);
        return;
    }

    if tls.handshake == HandshakeState::Pending {
        tls = match update_handshake(lp, s, tls) {
            Some(tls) => tls,
            None => return,
        };
        if lp.is_closed(s) {
            put_back(lp, s, tls);
            return;
        }
    }

    let mut read = 0usize;
    let mut scratch = std::mem::take(&mut lp.tls_scratch);
    let mut closed = false;

    loop {
        let just_read = match tls
            .stream
            .ssl_read(&mut scratch[RECV_BUFFER_PADDING + read..RECV_BUFFER_PADDING + RECV_BUFFER_LENGTH])
        {
            Ok(n) => n,
            Err(err) => match err.code() {
                ErrorCode::WANT_READ | ErrorCode::WANT_WRITE => {
                    if err.code() == ErrorCode::WANT_WRITE {
                        // Trigger a read retry on the next writable event.
                        tls.read_wants_write = true;
                    }
                    flush_outgoing(lp, s, &mut tls, false);

                    // The input window must be fully consumed here; a
                    // stall with ciphertext left means a broken session.
                    if tls.stream.get_ref().unread() != 0 {
                        closed = true;
                        break;
                    }

                    // Emit what we have (zero-length batches are not a
                    // thing the app sees).
                    if read > 0 {
                        match emit_plaintext(lp, s, tls, &mut scratch, read) {
                            Some(t) => tls = t,
                            None => {
                                lp.tls_scratch = scratch;
                                return;
                            }
                        }
                    }
                    break;
                }
                ErrorCode::ZERO_RETURN => {
                    // Remote close_notify: flush buffered plaintext, then
                    // terminate.
                    tls.received_shutdown = true;
                    if read > 0 {
                        match emit_plaintext(lp, s, tls, &mut scratch, read) {
                            Some(t) => tls = t,
                            None => {
                                lp.tls_scratch = scratch;
                                return;
                            }
                        }
                    }
                    closed = true;
                    break;
                }
                _ => {
                    // SSL or syscall failure; the error queue was drained
                    // into `err` already.
                    tls.fatal_error = true;
                    closed = true;
                    break;
                }
            },
        };

        if tls.handshake == HandshakeState::RenegotiationPending {
            tls = match trigger_handshake_callback(lp, s, tls, true) {
                Some(t) => t,
                None => {
                    lp.tls_scratch = scratch;
                    return;
                }
            };
        }

        read += just_read;
        if read == RECV_BUFFER_LENGTH {
            // Full output buffer: emit and restart.
            match emit_plaintext(lp, s, tls, &mut scratch, read) {
                Some(t) => tls = t,
                None => {
                    lp.tls_scratch = scratch;
                    return;
                }
            }
            read = 0;
        }
    }

    lp.tls_scratch = scratch;

    if closed {
        put_back(lp, s, tls);
        socket_close(lp, s, crate::CLOSE_CODE_CLEAN);
        return;
    }

    // A write stalled on WANT_READ may proceed now that a read happened;
    // surface that as writable. Not when the read itself wants a write:
    // that would ping-pong into a recursive loop.
    if tls.write_wants_read && !tls.read_wants_write {
        tls.write_wants_read = false;
        if !put_back(lp, s, tls) {
            return;
        }
        let on_writable = lp
            .socket_entry(s)
            .map(|e| e.ctx)
            .map(|ctx| lp.callbacks_of(ctx));
        if let Some(Callbacks {
            on_writable: Some(cb),
            ..
        }) = on_writable
        {
            cb(lp, s);
        }
        return;
    }

    put_back(lp, s, tls);
}

/// Hand a batch of decrypted bytes to the user callback, parking the TLS
/// state for the duration. Returns the state, or `None` when the socket
/// closed under us.
fn emit_plaintext(
    lp: &mut EventLoop,
    s: SocketId,
    tls: Box<TlsSocket>,
    scratch: &mut [u8],
    read: usize,
) -> Option<Box<TlsSocket>> {
    if !put_back(lp, s, tls) {
        return None;
    }
    // Re-read the callbacks every time: the callback may adopt the socket
    // into another context.
    if let Some(cb) = user_callbacks(lp, s).on_data {
        cb(
            lp,
            s,
            &mut scratch[RECV_BUFFER_PADDING..RECV_BUFFER_PADDING + read],
        );
    }
    take(lp, s)
}

fn ssl_on_writable(lp: &mut EventLoop, s: SocketId) {
    let Some(mut tls) = take(lp, s) else {
        return;
    };

    // Retry any ciphertext that was backed up on the transport.
    flush_outgoing(lp, s, &mut tls, false);

    if tls.handshake == HandshakeState::Pending {
        tls = match update_handshake(lp, s, tls) {
            Some(t) => t,
            None => return,
        };
    }

    if tls.read_wants_write {
        tls.read_wants_write = false;
        // Nudge the read path; it failed last time because the transport
        // was not writable.
        if !put_back(lp, s, tls) {
            return;
        }
        ssl_on_data(lp, s, &mut []);
        match take(lp, s) {
            Some(t) => tls = t,
            None => return,
        }
    }

    let entry_shut_down = lp.socket_entry(s).map_or(true, |e| e.closed || e.is_shut_down());
    if entry_shut_down || is_tls_shut_down(false, &tls) {
        put_back(lp, s, tls);
        return;
    }

    if tls.handshake == HandshakeState::Completed {
        if !put_back(lp, s, tls) {
            return;
        }
        if let Some(old) = wrapped_old_callbacks(lp, s) {
            if let Some(cb) = old.on_writable {
                cb(lp, s);
            }
            if lp.is_closed(s) {
                return;
            }
        }
        if let Some(cb) = user_callbacks(lp, s).on_writable {
            cb(lp, s);
        }
        return;
    }

    put_back(lp, s, tls);
}

fn ssl_on_close(lp: &mut EventLoop, s: SocketId, code: i32) {
    if let Some(old) = wrapped_old_callbacks(lp, s) {
        if let Some(cb) = old.on_close {
            cb(lp, s, code);
        }
        if let Some(w) = tls_ext_of(lp, s).and_then(|t| t.wrapped.as_ref()) {
            let tcp_context = w.tcp_context;
            if let Some(cb) = user_callbacks(lp, s).on_close {
                cb(lp, s, code);
            }
            lp.context_unref(tcp_context);
            drop_tls_state(lp, s);
            return;
        }
    }

    if let Some(cb) = user_callbacks(lp, s).on_close {
        cb(lp, s, code);
    }
    // Free the SSL after on_close so the callback may still inspect it.
    drop_tls_state(lp, s);
}

fn drop_tls_state(lp: &mut EventLoop, s: SocketId) {
    if let Some(e) = lp.socket_entry_mut(s) {
        e.tls = None;
    }
}

fn ssl_on_end(lp: &mut EventLoop, s: SocketId) {
    if let Some(old) = wrapped_old_callbacks(lp, s) {
        // Wrapped sockets keep the old context's half-open behavior.
        if let Some(cb) = old.on_end {
            cb(lp, s);
        }
        if let Some(cb) = user_callbacks(lp, s).on_end {
            cb(lp, s);
        }
        return;
    }
    // Whatever state we are in, a TCP FIN is an answered shutdown.
    socket_close(lp, s, crate::CLOSE_CODE_CLEAN);
}

fn ssl_on_timeout(lp: &mut EventLoop, s: SocketId) {
    if let Some(old) = wrapped_old_callbacks(lp, s) {
        if let Some(cb) = old.on_timeout {
            cb(lp, s);
        }
    }
    if let Some(cb) = user_callbacks(lp, s).on_timeout {
        cb(lp, s);
    }
}

fn ssl_on_long_timeout(lp: &mut EventLoop, s: SocketId) {
    if let Some(old) = wrapped_old_callbacks(lp, s) {
        if let Some(cb) = old.on_long_timeout {
            cb(lp, s);
        }
    }
    if let Some(cb) = user_callbacks(lp, s).on_long_timeout {
        cb(lp, s);
    }
}

fn ssl_on_connect_error(lp: &mut EventLoop, c: crate::ConnectingId, code: i32) {
    let ctx = match lp.connecting.get(c.0) {
        Some(e) => e.ctx,
        None => return,
    };
    let ext = lp.contexts.get(ctx).and_then(|x| x.tls.as_deref());
    let old = ext.and_then(|t| t.wrapped.as_ref()).map(|w| w.old);
    let user = ext.map(|t| t.user).unwrap_or_default();
    if let Some(old) = old {
        if let Some(cb) = old.on_connect_error {
            cb(lp, c, code);
        }
    }
    if let Some(cb) = user.on_connect_error {
        cb(lp, c, code);
    }
}

fn ssl_on_socket_connect_error(lp: &mut EventLoop, s: SocketId, code: i32) {
    if let Some(old) = wrapped_old_callbacks(lp, s) {
        if let Some(cb) = old.on_socket_connect_error {
            cb(lp, s, code);
        }
    }
    if let Some(cb) = user_callbacks(lp, s).on_socket_connect_error {
        cb(lp, s, code);
    }
}

/// TLS sockets are CPU-expensive while their handshake is incomplete, so
/// they are the ones the low-priority queue throttles.
fn ssl_is_low_prio(lp: &mut EventLoop, s: SocketId) -> bool {
    lp.socket_entry(s)
        .and_then(|e| e.tls.as_ref())
        .map_or(false, |tls| tls.handshake != HandshakeState::Completed)
}
