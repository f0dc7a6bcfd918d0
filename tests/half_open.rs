use std::cell::Cell;
use std::sync::atomic::{AtomicUsize, Ordering};

use usio::{ConnectResult, EventLoop, SocketId};

mod util;

thread_local! {
    static LISTENER: Cell<Option<SocketId>> = Cell::new(None);
}

static PEER_SAW_END: AtomicUsize = AtomicUsize::new(0);
static GOT_BYE: AtomicUsize = AtomicUsize::new(0);
static CLEAN_CLOSES: AtomicUsize = AtomicUsize::new(0);

// A shuts down its write side; B sees on_end, answers "bye" on the still
// open half, then closes. A reads "bye" and its pending FIN completes the
// shutdown cleanly.
#[test]
fn half_open_peer_can_still_write() {
    util::init();

    let mut lp = EventLoop::new().unwrap();

    let server = lp.create_context();
    lp.context_on_end(server, |lp, s| {
        PEER_SAW_END.fetch_add(1, Ordering::SeqCst);
        lp.write(s, b"bye", false);
        lp.close(s, usio::CLOSE_CODE_CLEAN);
    });
    lp.context_on_close(server, |_, _, code| {
        assert_eq!(code, usio::CLOSE_CODE_CLEAN);
        CLEAN_CLOSES.fetch_add(1, Ordering::SeqCst);
    });

    let listener = lp
        .listen(server, "127.0.0.1", 0, usio::listen_options::ALLOW_HALF_OPEN)
        .unwrap();
    let port = lp.local_port(listener).unwrap();
    LISTENER.with(|l| l.set(Some(listener)));

    let client = lp.create_context();
    lp.context_on_open(client, |lp, s, _, _| {
        lp.shutdown(s);
        assert!(lp.is_shut_down(s));
        // Writes after shutdown are rejected outright.
        assert_eq!(lp.write(s, b"nope", false), 0);
    });
    lp.context_on_data(client, |_, _, data| {
        assert_eq!(&data[..], b"bye");
        GOT_BYE.fetch_add(1, Ordering::SeqCst);
    });
    lp.context_on_close(client, |lp, _, code| {
        assert_eq!(code, usio::CLOSE_CODE_CLEAN);
        CLEAN_CLOSES.fetch_add(1, Ordering::SeqCst);
        let listener = LISTENER.with(|l| l.take()).unwrap();
        lp.close(listener, usio::CLOSE_CODE_CLEAN);
    });

    match lp.connect(client, "127.0.0.1", port, None).unwrap() {
        ConnectResult::Socket(_) => {}
        ConnectResult::Resolving(_) => panic!("literal address must not resolve"),
    }

    lp.run().unwrap();

    assert_eq!(PEER_SAW_END.load(Ordering::SeqCst), 1);
    assert_eq!(GOT_BYE.load(Ordering::SeqCst), 1);
    assert_eq!(CLEAN_CLOSES.load(Ordering::SeqCst), 2);
}
