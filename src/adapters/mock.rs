//! Scripted mock transport for tests and dry runs.
//!
//! A [`MockTransport`] pops pre-queued response chunks on each read and logs
//! every write. The paired [`MockHandle`] lets a test queue responses,
//! inspect traffic, and sever the link mid-run to exercise the watchdog.
//! [`MockFactory`] shares one handle across every transport it opens, so a
//! "reconnect" simply hands back a transport over the same scripted state.

use super::{Transport, TransportFactory};
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct MockState {
    reads: VecDeque<Vec<u8>>,
    written: Vec<u8>,
    severed: bool,
    clears: usize,
    fail_writes: usize,
}

/// Test-side control over a mock link.
#[derive(Clone, Default)]
pub struct MockHandle {
    state: Arc<Mutex<MockState>>,
}

impl MockHandle {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        // Mutex poisoning only happens if a test panicked while holding the
        // lock; propagating the panic there is the right outcome.
        #[allow(clippy::unwrap_used)]
        self.state.lock().unwrap()
    }

    /// Queue one chunk to be returned by a future read.
    pub fn queue_response(&self, chunk: &[u8]) {
        self.lock().reads.push_back(chunk.to_vec());
    }

    /// Everything written to the instrument so far.
    pub fn written(&self) -> Vec<u8> {
        self.lock().written.clone()
    }

    /// How many times the OS buffers were flushed.
    pub fn clear_count(&self) -> usize {
        self.lock().clears
    }

    /// Make the next `n` writes fail with an I/O error, reads untouched.
    pub fn fail_writes(&self, n: usize) {
        self.lock().fail_writes = n;
    }

    /// Make every subsequent I/O call fail, as if the cable was pulled.
    pub fn sever(&self) {
        self.lock().severed = true;
    }

    /// Undo [`Self::sever`]; newly opened transports work again.
    pub fn restore(&self) {
        self.lock().severed = false;
    }
}

/// Transport double driven by a [`MockHandle`].
pub struct MockTransport {
    handle: MockHandle,
}

impl MockTransport {
    pub fn new(handle: MockHandle) -> Self {
        Self { handle }
    }
}

fn gone() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "mock link severed")
}

impl Transport for MockTransport {
    fn write_bytes(&mut self, bytes: &[u8]) -> io::Result<()> {
        let mut state = self.handle.lock();
        if state.severed {
            return Err(gone());
        }
        if state.fail_writes > 0 {
            state.fail_writes -= 1;
            return Err(io::Error::new(io::ErrorKind::Other, "mock write fault"));
        }
        state.written.extend_from_slice(bytes);
        Ok(())
    }

    fn read_bytes(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.handle.lock();
        if state.severed {
            return Err(gone());
        }
        let Some(mut chunk) = state.reads.pop_front() else {
            return Ok(0);
        };
        let n = chunk.len().min(buf.len());
        buf[..n].copy_from_slice(&chunk[..n]);
        if n < chunk.len() {
            chunk.drain(..n);
            state.reads.push_front(chunk);
        }
        Ok(n)
    }

    fn clear_buffers(&mut self) -> io::Result<()> {
        let mut state = self.handle.lock();
        if state.severed {
            return Err(gone());
        }
        // Queued chunks model responses the instrument has yet to send, not
        // stale OS-buffer bytes, so they survive a flush.
        state.clears += 1;
        Ok(())
    }

    fn probe(&mut self) -> io::Result<()> {
        if self.handle.lock().severed {
            return Err(gone());
        }
        Ok(())
    }
}

/// Factory producing [`MockTransport`]s over one shared handle.
///
/// `fail_opens(n)` makes the first `n` open attempts fail, for exercising
/// the connect backoff path. Opening a transport also restores a severed
/// link, mirroring a device that re-enumerated after a reset.
pub struct MockFactory {
    handle: MockHandle,
    fail_opens: AtomicUsize,
}

impl MockFactory {
    pub fn new(handle: MockHandle) -> Self {
        Self {
            handle,
            fail_opens: AtomicUsize::new(0),
        }
    }

    pub fn fail_opens(self, n: usize) -> Self {
        self.set_fail_opens(n);
        self
    }

    /// Arrange for the next `n` open attempts to fail.
    pub fn set_fail_opens(&self, n: usize) {
        self.fail_opens.store(n, Ordering::SeqCst);
    }
}

impl TransportFactory for MockFactory {
    fn open(&self) -> anyhow::Result<Box<dyn Transport>> {
        let remaining = self.fail_opens.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_opens.store(remaining - 1, Ordering::SeqCst);
            anyhow::bail!("mock open failure ({remaining} remaining)");
        }
        self.handle.restore();
        Ok(Box::new(MockTransport::new(self.handle.clone())))
    }

    fn describe(&self) -> String {
        "mock transport".to_string()
    }
}
