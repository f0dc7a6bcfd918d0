use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};

use usio::{ConnectResult, EventLoop};

mod util;

static CONNECT_ERRNO: AtomicI32 = AtomicI32::new(0);
static OPENED: AtomicUsize = AtomicUsize::new(0);

fn free_port() -> u16 {
    // Bind then drop; the port is free again with overwhelming likelihood.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

#[test]
fn direct_connect_refused_reports_socket_connect_error() {
    util::init();
    CONNECT_ERRNO.store(0, Ordering::SeqCst);

    let mut lp = EventLoop::new().unwrap();
    let ctx = lp.create_context();
    lp.context_on_open(ctx, |_, _, _, _| {
        panic!("refused connect must not open");
    });
    lp.context_on_socket_connect_error(ctx, |_, _, errno| {
        CONNECT_ERRNO.store(errno, Ordering::SeqCst);
    });

    let port = free_port();
    match lp.connect(ctx, "127.0.0.1", port, None).unwrap() {
        ConnectResult::Socket(_) => {}
        ConnectResult::Resolving(_) => panic!("literal address must not resolve"),
    }

    lp.run().unwrap();
    assert_eq!(CONNECT_ERRNO.load(Ordering::SeqCst), libc::ECONNREFUSED);
}

#[test]
fn resolving_connect_opens_exactly_once() {
    util::init();
    OPENED.store(0, Ordering::SeqCst);

    // A real listener the winning candidate connects to. The kernel
    // backlog completes the handshake; nobody needs to accept.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let mut lp = EventLoop::new().unwrap();
    let ctx = lp.create_context();
    lp.context_on_open(ctx, |lp, s, is_client, _| {
        assert!(is_client);
        OPENED.fetch_add(1, Ordering::SeqCst);
        lp.close(s, usio::CLOSE_CODE_CLEAN);
    });
    lp.context_on_close(ctx, |_, _, _| {});
    lp.context_on_connect_error(ctx, |_, _, errno| {
        panic!("unexpected connect error: {}", errno);
    });

    // "localhost" resolves (possibly to several addresses, of which only
    // the IPv4 one has a listener); exactly one candidate may win.
    match lp.connect(ctx, "localhost", port, None).unwrap() {
        ConnectResult::Resolving(_) => {}
        ConnectResult::Socket(_) => panic!("hostname must resolve asynchronously"),
    }

    util::run_until(
        &mut lp,
        std::time::Duration::from_secs(10),
        || OPENED.load(Ordering::SeqCst) == 1,
    );
    assert_eq!(OPENED.load(Ordering::SeqCst), 1);
}

#[test]
fn cancelled_connect_reports_econnaborted() {
    util::init();

    static ABORT_ERRNO: AtomicI32 = AtomicI32::new(0);

    let mut lp = EventLoop::new().unwrap();
    let ctx = lp.create_context();
    lp.context_on_connect_error(ctx, |_, _, errno| {
        ABORT_ERRNO.store(errno, Ordering::SeqCst);
    });

    let id = match lp.connect(ctx, "localhost", free_port(), None).unwrap() {
        ConnectResult::Resolving(id) => id,
        ConnectResult::Socket(_) => panic!("hostname must resolve asynchronously"),
    };

    lp.connecting_close(id);
    assert!(lp.connecting_is_closed(id));
    assert_eq!(ABORT_ERRNO.load(Ordering::SeqCst), libc::ECONNABORTED);

    // Closing again is a no-op.
    lp.connecting_close(id);
    assert_eq!(ABORT_ERRNO.load(Ordering::SeqCst), libc::ECONNABORTED);
}
