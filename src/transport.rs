//! Event transport (§6): the out-of-scope collaborator that delivers
//! raw event strings from the kernel. Treated here purely as "a
//! streaming byte source with reconnect" per the distilled spec — the
//! concrete implementation is a local Unix domain stream socket; tests
//! use [`Loopback`].

use crate::event_buffer::ByteSource;
use std::collections::VecDeque;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::Path;

/// Anything the event loop can `poll()` on and read framed events from.
pub trait EventTransport: ByteSource + AsRawFd {}
impl<T: ByteSource + AsRawFd> EventTransport for T {}

fn bytes_available_fd(fd: RawFd) -> io::Result<usize> {
    let mut n: libc::c_int = 0;
    let ret = unsafe { libc::ioctl(fd, libc::FIONREAD as _, &mut n) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n.max(0) as usize)
}

/// Real transport: a connected Unix domain stream socket, set
/// non-blocking so reads return `WouldBlock` rather than stalling the
/// single-threaded loop.
pub struct UnixTransport {
    stream: UnixStream,
}

impl UnixTransport {
    pub fn connect(path: &Path) -> io::Result<Self> {
        let stream = UnixStream::connect(path)?;
        stream.set_nonblocking(true)?;
        Ok(Self { stream })
    }
}

impl AsRawFd for UnixTransport {
    fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}

impl ByteSource for UnixTransport {
    fn bytes_available(&mut self) -> io::Result<usize> {
        bytes_available_fd(self.stream.as_raw_fd())
    }

    fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        use std::io::Read;
        match self.stream.read(dst) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e),
        }
    }
}

/// In-memory transport for tests: an unbounded byte queue fed directly
/// by the test, with no real file descriptor to poll.
#[derive(Default)]
pub struct Loopback {
    pending: VecDeque<u8>,
}

impl Loopback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_line(&mut self, line: &str) {
        self.pending.extend(line.as_bytes());
        if !line.ends_with('\n') {
            self.pending.push_back(b'\n');
        }
    }
}

impl ByteSource for Loopback {
    fn bytes_available(&mut self) -> io::Result<usize> {
        Ok(self.pending.len())
    }

    fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        let n = self.pending.len().min(dst.len());
        for slot in dst.iter_mut().take(n) {
            *slot = self.pending.pop_front().unwrap();
        }
        Ok(n)
    }
}

impl AsRawFd for Loopback {
    /// `Loopback` has no real file descriptor; tests drive it by
    /// calling `extract_event`/`missed_event_detection` directly rather
    /// than through `poll()`, so this is never passed to `poll()`.
    fn as_raw_fd(&self) -> RawFd {
        -1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_buffer::EventBuffer;

    #[test]
    fn loopback_feeds_event_buffer() {
        let mut transport = Loopback::new();
        transport.push_line("!class=a pool_guid=1 vdev_guid=2");
        let mut buf = EventBuffer::new();
        let ev = buf.extract_event(&mut transport).unwrap().unwrap().unwrap();
        assert_eq!(ev.get("class"), Some("a"));
    }
}
