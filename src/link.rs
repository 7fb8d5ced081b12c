//! The device link: single owner of the physical connection.
//!
//! Every byte to or from the instrument passes through [`DeviceLink`]. The
//! transport sits behind `Arc<tokio::sync::Mutex<...>>` and all blocking I/O
//! runs on `tokio::task::spawn_blocking`, so a slow serial read never stalls
//! the runtime. Handles are cheap clones sharing the same connection.
//!
//! ## Failure semantics
//!
//! Any OS-level I/O error drops the transport and marks the link
//! `Disconnected`. The link never retries on behalf of a caller; bringing
//! the connection back is the watchdog's job (or an explicit
//! [`DeviceLink::connect`]). Callers see failures as error returns they are
//! expected to record, not propagate as fatal.
//!
//! ## Connection-state guard
//!
//! [`LinkState`] lives in an atomic cell. The `Disconnected → Connecting`
//! transition is a compare-and-swap, so when the foreground task and the
//! watchdog both notice a dead link, exactly one of them drives the
//! reconnect and the other waits it out.

use crate::adapters::{Transport, TransportFactory};
use crate::config::LinkSettings;
use crate::error::{AppResult, PispecError};
use crate::parameter::ParameterSet;
use crate::protocol::{self, keys, ProtocolRev};
use log::{debug, info, warn};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Minimum decoded-buffer size for a timed-out read to still count as data.
/// Fixed-byte-count policy; see DESIGN.md for the alternatives considered.
pub const MIN_DATA_BYTES: usize = 96;

/// Initial reconnect backoff; doubles up to [`BACKOFF_CAP`].
const BACKOFF_START: Duration = Duration::from_millis(200);
const BACKOFF_CAP: Duration = Duration::from_secs(1);

/// Pause between empty reads inside the deadline loop.
const READ_POLL: Duration = Duration::from_millis(5);

/// Device link lifecycle. No terminal state: the watchdog retries forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LinkState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
}

/// Atomic holder for [`LinkState`] with CAS-guarded transitions.
#[derive(Debug, Default)]
pub struct LinkStateCell(AtomicU8);

impl LinkStateCell {
    pub fn load(&self) -> LinkState {
        match self.0.load(Ordering::Acquire) {
            1 => LinkState::Connecting,
            2 => LinkState::Connected,
            _ => LinkState::Disconnected,
        }
    }

    pub fn store(&self, state: LinkState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Try to win the `Disconnected → Connecting` transition. Only the
    /// winner may open a new transport; losers wait for `Connected`.
    pub fn begin_connect(&self) -> bool {
        self.0
            .compare_exchange(
                LinkState::Disconnected as u8,
                LinkState::Connecting as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

/// Ownership token for an in-flight `Connecting` claim. Dropping it without
/// calling [`ConnectClaim::complete`] puts the state back to `Disconnected`,
/// so a cancelled reconnect never strands the cell at `Connecting`.
struct ConnectClaim<'a>(&'a LinkStateCell);

impl ConnectClaim<'_> {
    fn complete(self) {
        self.0.store(LinkState::Connected);
        std::mem::forget(self);
    }
}

impl Drop for ConnectClaim<'_> {
    fn drop(&mut self) {
        self.0.store(LinkState::Disconnected);
    }
}

/// How a timeout-bounded read ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// A frame terminator arrived before the deadline.
    Complete,
    /// Deadline hit, but a substantial buffer was collected; treated as
    /// success since the firmware does not terminate large buffers reliably.
    TimedOutWithData,
    /// Deadline hit with little or no data; the instrument was not ready.
    TimedOutShort,
}

/// Result of [`DeviceLink::read_with_timeout`].
#[derive(Debug, Clone)]
pub struct ReadOutcome {
    pub status: ReadStatus,
    /// Decoded text; undecodable fragments are omitted.
    pub buffer: String,
}

impl ReadOutcome {
    pub fn is_data(&self) -> bool {
        matches!(
            self.status,
            ReadStatus::Complete | ReadStatus::TimedOutWithData
        )
    }
}

/// Clonable handle to the instrument connection.
#[derive(Clone)]
pub struct DeviceLink {
    transport: Arc<Mutex<Option<Box<dyn Transport>>>>,
    state: Arc<LinkStateCell>,
    factory: Arc<dyn TransportFactory>,
    rev: ProtocolRev,
    adc_timeout: Duration,
}

impl DeviceLink {
    pub fn new(factory: Arc<dyn TransportFactory>, settings: &LinkSettings) -> Self {
        Self {
            transport: Arc::new(Mutex::new(None)),
            state: Arc::new(LinkStateCell::default()),
            factory,
            rev: settings.protocol_rev,
            adc_timeout: settings.adc_timeout(),
        }
    }

    pub fn state(&self) -> LinkState {
        self.state.load()
    }

    pub fn protocol_rev(&self) -> ProtocolRev {
        self.rev
    }

    pub fn adc_timeout(&self) -> Duration {
        self.adc_timeout
    }

    /// Open the transport, retrying with backoff until success.
    ///
    /// Blocks until connected: no experiment can proceed without a device.
    /// If another task is already connecting, this waits for it to finish
    /// instead of racing it for the port. A connecting task that is dropped
    /// mid-open releases its claim, so a waiting caller takes over.
    pub async fn connect(&self) -> AppResult<()> {
        while !self.state.begin_connect() {
            if self.state.load() == LinkState::Connected {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        // This task now owns the reconnect; the claim reverts the state to
        // Disconnected if the future is dropped before the open completes.
        let claim = ConnectClaim(&self.state);
        info!("connecting to {}", self.factory.describe());
        let mut backoff = BACKOFF_START;
        loop {
            let factory = self.factory.clone();
            match tokio::task::spawn_blocking(move || factory.open()).await {
                Ok(Ok(transport)) => {
                    *self.transport.lock().await = Some(transport);
                    claim.complete();
                    info!("link connected ({})", self.factory.describe());
                    return Ok(());
                }
                Ok(Err(e)) => {
                    debug!("open failed: {e:#}; retrying in {backoff:?}");
                }
                Err(e) => {
                    warn!("open task failed: {e}");
                }
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(BACKOFF_CAP);
        }
    }

    /// Cheap liveness probe. An I/O error here transitions the link to
    /// `Disconnected`. If the foreground task currently holds the transport
    /// (mid-command), the link is assumed alive rather than interrupted.
    pub fn is_connected(&self) -> bool {
        if self.state.load() != LinkState::Connected {
            return false;
        }
        let Ok(mut guard) = self.transport.try_lock() else {
            return true;
        };
        match guard.as_mut() {
            Some(transport) => match transport.probe() {
                Ok(()) => true,
                Err(e) => {
                    warn!("link probe failed: {e}");
                    *guard = None;
                    self.state.store(LinkState::Disconnected);
                    false
                }
            },
            None => {
                self.state.store(LinkState::Disconnected);
                false
            }
        }
    }

    /// Write a framed command; fire-and-forget.
    pub async fn send(&self, key: char, value: u32) -> AppResult<()> {
        self.write_all(protocol::encode(key, value)).await
    }

    /// Push a full parameter set in one write.
    pub async fn send_params(&self, params: &ParameterSet) -> AppResult<()> {
        let pairs = params.wire_pairs(self.rev);
        debug!("pushing parameters: {}", params.canonical_string(self.rev));
        self.write_all(protocol::encode_batch(&pairs)).await
    }

    /// Trigger a hardware-timed trace (`m`).
    pub async fn execute_trace(&self) -> AppResult<()> {
        self.send(keys::EXECUTE, 0).await
    }

    /// Ask for the trace buffer (`g`).
    pub async fn request_data(&self, num_points: u32) -> AppResult<()> {
        self.send(keys::RETRIEVE, num_points).await
    }

    /// Ask the firmware to echo its current parameter set (`d`).
    pub async fn request_parameters(&self) -> AppResult<ReadOutcome> {
        self.send(keys::REQUEST_PARAMS, 0).await?;
        self.read_with_timeout(Duration::from_millis(250)).await
    }

    /// Set the standing actinic intensity, 0-255 (`a`).
    pub async fn set_actinic(&self, intensity: u8) -> AppResult<()> {
        self.send(keys::ACTINIC, u32::from(intensity)).await
    }

    /// Gate the actinic output on or off (`u`).
    pub async fn actinic_gate(&self, on: bool) -> AppResult<()> {
        self.send(keys::ACTINIC_GATE, u32::from(on)).await
    }

    /// Switch the measurement-pulser supply (`q`).
    pub async fn pulser_power(&self, on: bool) -> AppResult<()> {
        self.send(keys::PULSER_POWER, u32::from(on)).await
    }

    /// Discard stale bytes in the OS buffers before a new command sequence,
    /// so a previous trace's trailing bytes cannot corrupt the next read.
    pub async fn flush(&self) -> AppResult<()> {
        let transport = self.transport.clone();
        let state = self.state.clone();
        run_io(move || {
            let mut guard = transport.blocking_lock();
            let t = guard.as_mut().ok_or(PispecError::LinkDisconnected)?;
            if let Err(e) = t.clear_buffers() {
                drop_transport(&mut guard, &state, "flush", &e);
                return Err(PispecError::Io(e));
            }
            Ok(())
        })
        .await
    }

    /// Accumulate bytes until a `;` terminator or the deadline.
    ///
    /// Returns within `timeout` plus one internal read interval regardless
    /// of instrument responsiveness. On timeout the outcome depends on how
    /// much decoded data arrived: at least [`MIN_DATA_BYTES`] means
    /// `TimedOutWithData`, anything less `TimedOutShort`. Undecodable
    /// fragments are dropped from the buffer, never fatal.
    pub async fn read_with_timeout(&self, timeout: Duration) -> AppResult<ReadOutcome> {
        let transport = self.transport.clone();
        let state = self.state.clone();
        run_io(move || {
            let mut guard = transport.blocking_lock();
            let t = guard.as_mut().ok_or(PispecError::LinkDisconnected)?;

            let deadline = Instant::now() + timeout;
            let mut pending: Vec<u8> = Vec::new();
            let mut buffer = String::new();
            let mut chunk = [0u8; 512];

            loop {
                if Instant::now() >= deadline {
                    buffer.push_str(&protocol::decode_chunk(&pending));
                    let status = if buffer.len() >= MIN_DATA_BYTES {
                        ReadStatus::TimedOutWithData
                    } else {
                        ReadStatus::TimedOutShort
                    };
                    debug!("read timed out with {} bytes", buffer.len());
                    return Ok(ReadOutcome { status, buffer });
                }

                match t.read_bytes(&mut chunk) {
                    Ok(0) => std::thread::sleep(READ_POLL),
                    Ok(n) => {
                        pending.extend_from_slice(&chunk[..n]);
                        if pending.contains(&protocol::TERMINATOR) {
                            buffer.push_str(&protocol::decode_chunk(&pending));
                            return Ok(ReadOutcome {
                                status: ReadStatus::Complete,
                                buffer,
                            });
                        }
                        // Flush decoded text out of the byte accumulator in
                        // sizable pieces so one bad fragment costs at most
                        // one piece.
                        if pending.len() >= MIN_DATA_BYTES {
                            buffer.push_str(&protocol::decode_chunk(&pending));
                            pending.clear();
                        }
                    }
                    Err(e) => {
                        drop_transport(&mut guard, &state, "read", &e);
                        return Err(PispecError::Io(e));
                    }
                }
            }
        })
        .await
    }

    async fn write_all(&self, bytes: Vec<u8>) -> AppResult<()> {
        let transport = self.transport.clone();
        let state = self.state.clone();
        run_io(move || {
            let mut guard = transport.blocking_lock();
            let t = guard.as_mut().ok_or(PispecError::LinkDisconnected)?;
            if let Err(e) = t.write_bytes(&bytes) {
                drop_transport(&mut guard, &state, "write", &e);
                return Err(PispecError::Io(e));
            }
            Ok(())
        })
        .await
    }
}

/// Run blocking transport I/O on the blocking pool.
async fn run_io<T, F>(f: F) -> AppResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> AppResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| PispecError::Task(e.to_string()))?
}

fn drop_transport(
    guard: &mut Option<Box<dyn Transport>>,
    state: &LinkStateCell,
    op: &str,
    err: &std::io::Error,
) {
    warn!("serial {op} failed, marking link disconnected: {err}");
    *guard = None;
    state.store(LinkState::Disconnected);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{MockFactory, MockHandle};

    fn mock_link(handle: &MockHandle) -> DeviceLink {
        DeviceLink::new(
            Arc::new(MockFactory::new(handle.clone())),
            &LinkSettings::default(),
        )
    }

    #[tokio::test]
    async fn test_connect_transitions_to_connected() {
        let handle = MockHandle::new();
        let link = mock_link(&handle);
        assert_eq!(link.state(), LinkState::Disconnected);
        link.connect().await.unwrap();
        assert_eq!(link.state(), LinkState::Connected);
        assert!(link.is_connected());
    }

    #[tokio::test]
    async fn test_connect_retries_with_backoff() {
        let handle = MockHandle::new();
        let factory = MockFactory::new(handle.clone()).fail_opens(2);
        let link = DeviceLink::new(Arc::new(factory), &LinkSettings::default());

        let start = Instant::now();
        link.connect().await.unwrap();
        // Two failures cost 200 ms + 400 ms of backoff.
        assert!(start.elapsed() >= Duration::from_millis(600));
        assert_eq!(link.state(), LinkState::Connected);
    }

    #[tokio::test]
    async fn test_send_frames_command() {
        let handle = MockHandle::new();
        let link = mock_link(&handle);
        link.connect().await.unwrap();
        link.send('n', 1000).await.unwrap();
        link.execute_trace().await.unwrap();
        assert_eq!(handle.written(), b"n1000;m0;");
    }

    #[tokio::test]
    async fn test_send_params_writes_canonical_batch() {
        let handle = MockHandle::new();
        let link = mock_link(&handle);
        link.connect().await.unwrap();

        let params = ParameterSet::default();
        link.send_params(&params).await.unwrap();
        let expected = params.canonical_string(ProtocolRev::Rev2);
        assert_eq!(handle.written(), expected.as_bytes());
    }

    #[tokio::test]
    async fn test_read_complete_on_terminator() {
        let handle = MockHandle::new();
        let link = mock_link(&handle);
        link.connect().await.unwrap();

        handle.queue_response(b"0,125,3301\r\n1,250,3290\r\n;");
        let outcome = link
            .read_with_timeout(Duration::from_millis(500))
            .await
            .unwrap();
        assert_eq!(outcome.status, ReadStatus::Complete);
        assert!(outcome.buffer.contains("1,250,3290"));
    }

    #[tokio::test]
    async fn test_read_timeout_short_when_no_data() {
        let handle = MockHandle::new();
        let link = mock_link(&handle);
        link.connect().await.unwrap();

        let outcome = link
            .read_with_timeout(Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(outcome.status, ReadStatus::TimedOutShort);
        assert!(outcome.buffer.is_empty());
    }

    #[tokio::test]
    async fn test_read_timeout_with_substantial_data() {
        let handle = MockHandle::new();
        let link = mock_link(&handle);
        link.connect().await.unwrap();

        // More than MIN_DATA_BYTES of unterminated sample lines.
        let line = b"12,3456,3301\r\n";
        for _ in 0..10 {
            handle.queue_response(line);
        }
        let outcome = link
            .read_with_timeout(Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(outcome.status, ReadStatus::TimedOutWithData);
        assert!(outcome.buffer.len() >= MIN_DATA_BYTES);
    }

    #[tokio::test]
    async fn test_read_latency_is_bounded() {
        let handle = MockHandle::new();
        let link = mock_link(&handle);
        link.connect().await.unwrap();

        let timeout = Duration::from_millis(100);
        let start = Instant::now();
        let _ = link.read_with_timeout(timeout).await.unwrap();
        assert!(start.elapsed() < timeout + Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_bad_utf8_chunk_is_dropped_not_fatal() {
        let handle = MockHandle::new();
        let link = mock_link(&handle);
        link.connect().await.unwrap();

        // A garbled chunk big enough to flush on its own, then good data.
        let mut bad = vec![0xffu8; MIN_DATA_BYTES];
        bad[0] = 0xfe;
        handle.queue_response(&bad);
        handle.queue_response(b"7,875,3280\r\n;");

        let outcome = link
            .read_with_timeout(Duration::from_millis(500))
            .await
            .unwrap();
        assert_eq!(outcome.status, ReadStatus::Complete);
        assert!(outcome.buffer.contains("7,875,3280"));
        assert!(!outcome.buffer.contains('\u{fffd}'));
    }

    #[tokio::test]
    async fn test_io_error_marks_disconnected() {
        let handle = MockHandle::new();
        let link = mock_link(&handle);
        link.connect().await.unwrap();

        handle.sever();
        assert!(link.send('m', 0).await.is_err());
        assert_eq!(link.state(), LinkState::Disconnected);
        assert!(!link.is_connected());
    }

    #[tokio::test]
    async fn test_flush_reaches_transport() {
        let handle = MockHandle::new();
        let link = mock_link(&handle);
        link.connect().await.unwrap();

        link.flush().await.unwrap();
        link.flush().await.unwrap();
        assert_eq!(handle.clear_count(), 2);
    }

    #[tokio::test]
    async fn test_cancelled_connect_releases_claim() {
        let handle = MockHandle::new();
        let factory = Arc::new(MockFactory::new(handle.clone()));
        let link = DeviceLink::new(factory.clone(), &LinkSettings::default());
        link.connect().await.unwrap();

        // Kill the link, then park a reconnect in endless open failures so
        // the state sits at Connecting.
        handle.sever();
        assert!(link.send('m', 0).await.is_err());
        factory.set_fail_opens(usize::MAX);
        let stalled = tokio::spawn({
            let link = link.clone();
            async move { link.connect().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(link.state(), LinkState::Connecting);

        // Cancelling the connecting task must hand the claim back.
        stalled.abort();
        let _ = stalled.await;

        factory.set_fail_opens(0);
        tokio::time::timeout(Duration::from_secs(2), link.connect())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(link.state(), LinkState::Connected);
    }

    #[test]
    fn test_state_cell_cas_single_winner() {
        let cell = LinkStateCell::default();
        assert!(cell.begin_connect());
        assert!(!cell.begin_connect());
        cell.store(LinkState::Connected);
        assert!(!cell.begin_connect());
    }
}
