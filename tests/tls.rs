#![cfg(feature = "tls")]

use std::cell::Cell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::hash::MessageDigest;
use openssl::pkey::PKey;
use openssl::rsa::Rsa;
use openssl::x509::{X509NameBuilder, X509};

use usio::tls::TlsContextOptions;
use usio::{ConnectResult, EventLoop, SocketId};

mod util;

thread_local! {
    static LISTENER: Cell<Option<SocketId>> = Cell::new(None);
}

static SERVER_HANDSHAKES: AtomicUsize = AtomicUsize::new(0);
static SERVER_GOT_WORLD: AtomicUsize = AtomicUsize::new(0);
static CLIENT_GOT_HELLO: AtomicUsize = AtomicUsize::new(0);
static CLEAN_CLOSES: AtomicUsize = AtomicUsize::new(0);

/// Self-signed certificate + key for `common_name`, as PEM strings.
fn generate_identity(common_name: &str) -> (String, String) {
    let rsa = Rsa::generate(2048).unwrap();
    let key = PKey::from_rsa(rsa).unwrap();

    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_text("CN", common_name).unwrap();
    let name = name.build();

    let mut builder = X509::builder().unwrap();
    builder.set_version(2).unwrap();
    let serial = BigNum::from_u32(1)
        .and_then(|bn| bn.to_asn1_integer())
        .unwrap();
    builder.set_serial_number(&serial).unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(&name).unwrap();
    builder.set_pubkey(&key).unwrap();
    builder
        .set_not_before(&Asn1Time::days_from_now(0).unwrap())
        .unwrap();
    builder
        .set_not_after(&Asn1Time::days_from_now(30).unwrap())
        .unwrap();
    builder.sign(&key, MessageDigest::sha256()).unwrap();
    let cert = builder.build();

    (
        String::from_utf8(cert.to_pem().unwrap()).unwrap(),
        String::from_utf8(key.private_key_to_pem_pkcs8().unwrap()).unwrap(),
    )
}

fn server_options(cert: &str, key: &str) -> TlsContextOptions {
    TlsContextOptions {
        cert: vec![cert.to_owned()],
        key: vec![key.to_owned()],
        ..TlsContextOptions::default()
    }
}

#[test]
fn tls_handshake_then_echo_both_ways() {
    util::init();

    let (cert, key) = generate_identity("localhost");

    let mut lp = EventLoop::new().unwrap();

    let server = lp.create_tls_context(&server_options(&cert, &key)).unwrap();
    lp.context_on_handshake(server, |lp, s, success, verify| {
        assert!(success);
        assert!(verify.is_ok());
        SERVER_HANDSHAKES.fetch_add(1, Ordering::SeqCst);
        // Greet through the plaintext API once the session is up.
        lp.write(s, b"hello", false);
    });
    lp.context_on_data(server, |lp, s, data| {
        assert_eq!(&data[..], b"world");
        SERVER_GOT_WORLD.fetch_add(1, Ordering::SeqCst);
        lp.close(s, usio::CLOSE_CODE_CLEAN);
    });
    lp.context_on_close(server, |lp, _, code| {
        assert_eq!(code, usio::CLOSE_CODE_CLEAN);
        CLEAN_CLOSES.fetch_add(1, Ordering::SeqCst);
        let listener = LISTENER.with(|l| l.take()).unwrap();
        lp.close(listener, usio::CLOSE_CODE_CLEAN);
    });

    let listener = lp.listen(server, "127.0.0.1", 0, 0).unwrap();
    let port = lp.local_port(listener).unwrap();
    LISTENER.with(|l| l.set(Some(listener)));

    // The client does not verify the self-signed peer.
    let client = lp
        .create_tls_context(&TlsContextOptions::default())
        .unwrap();
    lp.context_on_data(client, |lp, s, data| {
        assert_eq!(&data[..], b"hello");
        CLIENT_GOT_HELLO.fetch_add(1, Ordering::SeqCst);
        lp.write(s, b"world", false);
    });
    lp.context_on_close(client, |_, _, code| {
        assert_eq!(code, usio::CLOSE_CODE_CLEAN);
        CLEAN_CLOSES.fetch_add(1, Ordering::SeqCst);
    });

    match lp.connect(client, "127.0.0.1", port, None).unwrap() {
        ConnectResult::Socket(_) => {}
        ConnectResult::Resolving(_) => panic!("literal address must not resolve"),
    }

    util::run_until(&mut lp, Duration::from_secs(15), || {
        CLEAN_CLOSES.load(Ordering::SeqCst) == 2
    });

    assert_eq!(SERVER_HANDSHAKES.load(Ordering::SeqCst), 1);
    assert_eq!(CLIENT_GOT_HELLO.load(Ordering::SeqCst), 1);
    assert_eq!(SERVER_GOT_WORLD.load(Ordering::SeqCst), 1);
}

static SNI_HANDSHAKES: AtomicUsize = AtomicUsize::new(0);
static SNI_ECHOED: AtomicUsize = AtomicUsize::new(0);

#[test]
fn sni_routes_to_registered_name() {
    util::init();

    let (default_cert, default_key) = generate_identity("default.invalid");
    let (named_cert, named_key) = generate_identity("localhost");

    let mut lp = EventLoop::new().unwrap();

    let server = lp
        .create_tls_context(&server_options(&default_cert, &default_key))
        .unwrap();
    let marker: Arc<dyn std::any::Any + Send + Sync> = Arc::new(42u32);
    lp.context_add_server_name(
        server,
        "localhost",
        &server_options(&named_cert, &named_key),
        Some(marker),
    )
    .unwrap();

    let user = lp
        .context_find_server_name_userdata(server, "localhost")
        .expect("registered name has user data");
    assert_eq!(user.downcast_ref::<u32>(), Some(&42));

    lp.context_on_handshake(server, |_, _, success, _| {
        assert!(success);
        SNI_HANDSHAKES.fetch_add(1, Ordering::SeqCst);
    });
    lp.context_on_data(server, |lp, s, data| {
        lp.write(s, data, false);
    });
    lp.context_on_end(server, |lp, s| {
        lp.close(s, usio::CLOSE_CODE_CLEAN);
    });
    lp.context_on_close(server, |_, _, _| {});

    let listener = lp.listen(server, "127.0.0.1", 0, 0).unwrap();
    let port = lp.local_port(listener).unwrap();
    LISTENER.with(|l| l.set(Some(listener)));

    let client = lp
        .create_tls_context(&TlsContextOptions::default())
        .unwrap();
    lp.context_on_handshake(client, |lp, s, success, _| {
        assert!(success);
        lp.write(s, b"sni", false);
    });
    lp.context_on_data(client, |lp, s, data| {
        assert_eq!(&data[..], b"sni");
        SNI_ECHOED.fetch_add(1, Ordering::SeqCst);
        lp.close(s, usio::CLOSE_CODE_CLEAN);
        let listener = LISTENER.with(|l| l.take()).unwrap();
        lp.close(listener, usio::CLOSE_CODE_CLEAN);
    });
    lp.context_on_close(client, |_, _, _| {});

    // "localhost" goes through the resolver, and the hostname rides along
    // as the client's SNI.
    match lp.connect(client, "localhost", port, None).unwrap() {
        ConnectResult::Resolving(_) => {}
        ConnectResult::Socket(_) => panic!("hostname must resolve asynchronously"),
    }

    util::run_until(&mut lp, Duration::from_secs(15), || {
        SNI_ECHOED.load(Ordering::SeqCst) == 1
    });

    assert_eq!(SNI_HANDSHAKES.load(Ordering::SeqCst), 1);
}
