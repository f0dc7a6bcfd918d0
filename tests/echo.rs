use std::cell::Cell;
use std::sync::atomic::{AtomicUsize, Ordering};

use usio::{ConnectResult, EventLoop, SocketId};

mod util;

thread_local! {
    static LISTENER: Cell<Option<SocketId>> = Cell::new(None);
}

static SERVER_OPENED: AtomicUsize = AtomicUsize::new(0);
static SERVER_GOT: AtomicUsize = AtomicUsize::new(0);
static CLIENT_GOT: AtomicUsize = AtomicUsize::new(0);
static CLOSED: AtomicUsize = AtomicUsize::new(0);

#[test]
fn tcp_echo_roundtrip() {
    util::init();

    let mut lp = EventLoop::new().unwrap();

    let server = lp.create_context();
    lp.context_on_open(server, |_, _, is_client, _| {
        assert!(!is_client);
        SERVER_OPENED.fetch_add(1, Ordering::SeqCst);
    });
    lp.context_on_data(server, |lp, s, data| {
        SERVER_GOT.fetch_add(data.len(), Ordering::SeqCst);
        lp.write(s, data, false);
    });
    lp.context_on_end(server, |lp, s| {
        lp.close(s, usio::CLOSE_CODE_CLEAN);
    });
    lp.context_on_close(server, |_, _, code| {
        assert_eq!(code, usio::CLOSE_CODE_CLEAN);
        CLOSED.fetch_add(1, Ordering::SeqCst);
    });

    let listener = lp.listen(server, "127.0.0.1", 0, 0).unwrap();
    let port = lp.local_port(listener).unwrap();
    LISTENER.with(|l| l.set(Some(listener)));

    let client = lp.create_context();
    lp.context_on_open(client, |lp, s, is_client, _| {
        assert!(is_client);
        lp.write(s, b"abc", false);
    });
    lp.context_on_data(client, |lp, s, data| {
        assert_eq!(&data[..], b"abc");
        CLIENT_GOT.fetch_add(data.len(), Ordering::SeqCst);
        lp.close(s, usio::CLOSE_CODE_CLEAN);
        // All user sockets are done after this; drop the listener so the
        // loop can wind down.
        let listener = LISTENER.with(|l| l.take()).unwrap();
        lp.close(listener, usio::CLOSE_CODE_CLEAN);
    });
    lp.context_on_close(client, |_, _, code| {
        assert_eq!(code, usio::CLOSE_CODE_CLEAN);
        CLOSED.fetch_add(1, Ordering::SeqCst);
    });

    match lp.connect(client, "127.0.0.1", port, None).unwrap() {
        ConnectResult::Socket(_) => {}
        ConnectResult::Resolving(_) => panic!("literal address must not resolve"),
    }

    // Runs until every poll is gone, which is itself part of the test.
    lp.run().unwrap();

    assert_eq!(SERVER_OPENED.load(Ordering::SeqCst), 1);
    assert_eq!(SERVER_GOT.load(Ordering::SeqCst), 3);
    assert_eq!(CLIENT_GOT.load(Ordering::SeqCst), 3);
    // One close per side; the listener never reached on_open so it gets
    // no on_close.
    assert_eq!(CLOSED.load(Ordering::SeqCst), 2);
}
