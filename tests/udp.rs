use std::cell::Cell;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use usio::{EventLoop, UdpDatagrams, UdpId};

mod util;

thread_local! {
    static SENDER: Cell<Option<UdpId>> = Cell::new(None);
}

static RECEIVED: AtomicUsize = AtomicUsize::new(0);
static CLOSES: AtomicUsize = AtomicUsize::new(0);

fn on_receiver_data(lp: &mut EventLoop, u: UdpId, datagrams: &UdpDatagrams<'_>) {
    for i in 0..datagrams.len() {
        assert_eq!(datagrams.payload(i), b"ping");
        let peer = datagrams.peer_addr(i).unwrap();
        assert_eq!(peer.ip(), "127.0.0.1".parse::<std::net::IpAddr>().unwrap());
        RECEIVED.fetch_add(1, Ordering::SeqCst);
    }
    if RECEIVED.load(Ordering::SeqCst) >= 2 {
        lp.udp_close(u);
        let sender = SENDER.with(|s| s.take()).unwrap();
        lp.udp_close(sender);
    }
}

fn on_receiver_close(_: &mut EventLoop, _: UdpId) {
    CLOSES.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn udp_batch_roundtrip() {
    util::init();

    let mut lp = EventLoop::new().unwrap();

    let receiver = lp
        .create_udp_socket(
            "127.0.0.1",
            0,
            Some(on_receiver_data),
            None,
            Some(on_receiver_close),
        )
        .unwrap();
    let port = lp.udp_bound_port(receiver).unwrap();
    assert_ne!(port, 0);

    let sender = lp
        .create_udp_socket("127.0.0.1", 0, None, None, None)
        .unwrap();
    SENDER.with(|s| s.set(Some(sender)));

    let dest: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();
    let sent = lp.udp_send(
        sender,
        &[
            (b"ping".as_slice(), Some(dest)),
            (b"ping".as_slice(), Some(dest)),
        ],
    );
    assert_eq!(sent, 2);

    util::run_until(&mut lp, Duration::from_secs(10), || {
        RECEIVED.load(Ordering::SeqCst) >= 2
    });

    assert_eq!(CLOSES.load(Ordering::SeqCst), 1);
    assert!(lp.udp_bound_port(receiver).is_none());
}
