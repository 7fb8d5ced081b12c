//! Transport adapters for the device link.
//!
//! The link layer talks to hardware through the blocking [`Transport`] trait
//! so the serial port can be swapped for a scripted mock in tests. All
//! blocking calls are made from `spawn_blocking` contexts by the link layer;
//! implementations here never spin up tasks of their own.

pub mod mock;
pub mod serial_adapter;

pub use mock::{MockFactory, MockHandle, MockTransport};
pub use serial_adapter::{SerialFactory, SerialTransport};

use std::io;

/// Byte-stream transport to the instrument.
///
/// `read_bytes` must return within the implementation's own short internal
/// timeout, yielding `Ok(0)` when nothing arrived; callers own the overall
/// deadline and loop until it expires.
pub trait Transport: Send {
    /// Write and flush a full frame.
    fn write_bytes(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Read whatever is available into `buf`, bounded by the internal
    /// timeout. `Ok(0)` means no data arrived yet, not end of stream.
    fn read_bytes(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Discard stale bytes in the OS input and output buffers.
    fn clear_buffers(&mut self) -> io::Result<()>;

    /// Cheap liveness check; an error means the device is gone.
    fn probe(&mut self) -> io::Result<()>;
}

/// Opens transports, so the link can reconnect without knowing what it is
/// connected to. Injected rather than ambient: discovery happens once, up
/// front, and the resulting address lives in the factory.
pub trait TransportFactory: Send + Sync {
    /// Open a fresh transport. Called repeatedly with backoff on failure.
    fn open(&self) -> anyhow::Result<Box<dyn Transport>>;

    /// Human-readable target description for log lines.
    fn describe(&self) -> String;
}
