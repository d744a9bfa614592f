use super::Channel;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// In-memory channel for unit tests: records writes and yields scripted
/// input, then end of stream.
pub(crate) struct MockChannel {
    input: Mutex<Vec<u8>>,
    sent: Mutex<Vec<u8>>,
    closed: AtomicBool,
    fail_writes: bool,
}

impl MockChannel {
    pub(crate) fn new() -> Self {
        Self {
            input: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            fail_writes: false,
        }
    }

    pub(crate) fn with_input(input: &[u8]) -> Self {
        Self {
            input: Mutex::new(input.to_vec()),
            ..Self::new()
        }
    }

    pub(crate) fn failing() -> Self {
        Self {
            fail_writes: true,
            ..Self::new()
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn sent_text(&self) -> String {
        String::from_utf8_lossy(&self.sent.lock().unwrap()).into_owned()
    }
}

impl Channel for MockChannel {
    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut input = self.input.lock().unwrap();
        let n = buf.len().min(input.len());
        buf[..n].copy_from_slice(&input[..n]);
        input.drain(..n);
        Ok(n)
    }

    fn send(&self, data: &[u8]) -> io::Result<()> {
        if self.fail_writes || self.is_closed() {
            return Err(io::Error::from(io::ErrorKind::BrokenPipe));
        }
        self.sent.lock().unwrap().extend_from_slice(data);
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn peer_addr(&self) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 0))
    }

    fn set_read_timeout(&self, _timeout: Option<Duration>) -> io::Result<()> {
        Ok(())
    }
}
