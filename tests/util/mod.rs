// Not all helpers are used by all tests.
#![allow(dead_code)]

use std::sync::Once;
use std::time::{Duration, Instant};

use usio::EventLoop;

pub fn init() {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let _ = env_logger::try_init();
    });
}

/// Drive the loop until `done` reports true, failing the test after
/// `deadline`. Keeps tests from hanging when an expectation is not met.
pub fn run_until(lp: &mut EventLoop, deadline: Duration, done: impl Fn() -> bool) {
    let start = Instant::now();
    while !done() {
        assert!(
            start.elapsed() < deadline,
            "test deadline of {:?} elapsed",
            deadline
        );
        lp.run_tick(Some(Duration::from_millis(50))).unwrap();
    }
}
