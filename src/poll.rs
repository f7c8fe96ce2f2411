//! The readiness dispatch loop.
//!
//! A single thread multiplexes every connection socket through one
//! `mio::Poll`. Each event's token carries the owning connection's handle;
//! classification of the event happens in the core so the state can be
//! consulted under the proper locks.

use std::io;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use mio::Events;

use crate::conn::Inner;

// The poll wakes up periodically to notice shutdown and newly registered
// sockets.
const POLL_TIMEOUT: Duration = Duration::from_millis(100);
const MAX_EVENTS: usize = 64;

pub(crate) fn spawn(inner: Arc<Inner>) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("rdmnet-poll".to_owned())
        .spawn(move || run(inner))
}

fn run(inner: Arc<Inner>) {
    let mut events = Events::with_capacity(MAX_EVENTS);
    let mut scratch = vec![0u8; inner.config.recv_buf_size];

    while inner.running.load(Ordering::Acquire) {
        match inner.poll.poll(&mut events, Some(POLL_TIMEOUT)) {
            Ok(_) => {}
            Err(ref error) if error.kind() == io::ErrorKind::Interrupted => continue,
            Err(error) => {
                warn!("socket poll failed: {}", error);
                break;
            }
        }
        for event in events.iter() {
            inner.socket_activity(event.token(), event.readiness(), &mut scratch);
        }
    }
}
