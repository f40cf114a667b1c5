#![allow(dead_code)]

use snafu::ResultExt;
use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

use ds485_proto::transport::{self, Transport};

type Queue = Mutex<VecDeque<u8>>;

/// An in-memory multidrop line. Every byte written by any endpoint is heard
/// by every attached endpoint, the writer included, like on the real
/// half-duplex bus.
#[derive(Default)]
pub struct SimBus {
    endpoints: Mutex<Vec<Weak<EndpointLink>>>,
}

struct EndpointLink {
    rx: Queue,
    data_available: Condvar,
}

impl SimBus {
    pub fn new() -> Arc<SimBus> {
        Default::default()
    }

    pub fn attach(self: &Arc<Self>) -> Endpoint {
        let link = Arc::new(EndpointLink {
            rx: Default::default(),
            data_available: Condvar::new(),
        });
        self.endpoints.lock().unwrap().push(Arc::downgrade(&link));
        Endpoint {
            bus: Arc::clone(self),
            link,
            fail_writes: false,
            fail_resets: false,
        }
    }

    fn broadcast(&self, byte: u8) {
        let endpoints = self.endpoints.lock().unwrap();
        for weak in endpoints.iter() {
            if let Some(endpoint) = weak.upgrade() {
                endpoint.rx.lock().unwrap().push_back(byte);
                endpoint.data_available.notify_all();
            }
        }
    }
}

/// One station's attachment to a [`SimBus`].
pub struct Endpoint {
    bus: Arc<SimBus>,
    link: Arc<EndpointLink>,
    pub fail_writes: bool,
    pub fail_resets: bool,
}

impl Transport for Endpoint {
    fn reset(&mut self) -> Result<(), transport::Error> {
        if self.fail_resets {
            return Err(io::Error::new(io::ErrorKind::NotFound, "no such device"))
                .context(transport::OpenSnafu);
        }
        self.link.rx.lock().unwrap().clear();
        Ok(())
    }

    fn read_byte(&mut self, timeout: Duration) -> Result<Option<u8>, transport::Error> {
        let deadline = Instant::now() + timeout;
        let mut rx = self.link.rx.lock().expect("rx mutex is poisoned");
        loop {
            if let Some(byte) = rx.pop_front() {
                return Ok(Some(byte));
            }
            let left = match deadline.checked_duration_since(Instant::now()) {
                Some(left) => left,
                None => return Ok(None),
            };
            let (guard, result) = self
                .link
                .data_available
                .wait_timeout(rx, left)
                .expect("rx mutex is poisoned");
            rx = guard;
            if result.timed_out() && rx.is_empty() {
                return Ok(None);
            }
        }
    }

    fn write_byte(&mut self, byte: u8) -> Result<(), transport::Error> {
        if self.fail_writes {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "line down"))
                .context(transport::WriteSnafu);
        }
        self.bus.broadcast(byte);
        Ok(())
    }
}
