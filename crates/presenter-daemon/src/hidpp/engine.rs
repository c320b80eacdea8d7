//! HID++ request/reply engine
//!
//! [`HidppEngine`] is the synchronous core: it writes frames, keeps the table
//! of pending requests keyed by `(device_index, sub_id, address)`, resolves
//! them from inbound frames, and expires them on a periodic sweep.
//!
//! [`run_engine`] drives one engine from an async task, multiplexing inbound
//! frames, commands from [`HidppHandle`]s and the sweep timer. Every caller
//! talks to the engine through a handle; nothing else touches the pending
//! table.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::io::{self, Write};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};

use crate::error::{HidppError, SendError};
use crate::hidpp::message::{FrameKind, HidppMessage, RequestKey};

/// Interval of the timeout sweep while requests are pending
pub const SWEEP_INTERVAL: Duration = Duration::from_millis(500);

/// Expiry applied to requests issued through [`HidppHandle::request`]
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

/// Outcome of a single request
pub type RequestResult = Result<HidppMessage, HidppError>;

struct PendingRequest {
    request: HidppMessage,
    expires_at: Instant,
    reply: oneshot::Sender<RequestResult>,
}

impl PendingRequest {
    fn resolve(self, result: RequestResult) {
        // The caller may have stopped waiting; that is not an error here
        let _ = self.reply.send(result);
    }
}

// ============================================================================
// Engine state machine
// ============================================================================

/// Request/reply correlation for one raw-protocol sub-connection
pub struct HidppEngine<W> {
    writer: W,
    /// Transport only accepts long frames (Bluetooth)
    long_only: bool,
    pending: HashMap<RequestKey, VecDeque<PendingRequest>>,
    next_sweep: Option<Instant>,
    subscribers: HashMap<u8, Vec<mpsc::UnboundedSender<HidppMessage>>>,
}

impl<W: Write> HidppEngine<W> {
    /// Create an engine writing to `writer`
    ///
    /// # Arguments
    ///
    /// * `writer` - The raw-protocol node, opened for writing
    /// * `long_only` - Widen every short frame before writing
    pub fn new(writer: W, long_only: bool) -> Self {
        Self {
            writer,
            long_only,
            pending: HashMap::new(),
            next_sweep: None,
            subscribers: HashMap::new(),
        }
    }

    /// Number of requests awaiting a reply
    pub fn pending_count(&self) -> usize {
        self.pending.values().map(VecDeque::len).sum()
    }

    /// When the next timeout sweep is due, if any request is pending
    pub fn next_sweep(&self) -> Option<Instant> {
        self.next_sweep
    }

    fn prepare(&self, message: &HidppMessage) -> HidppMessage {
        if self.long_only && message.kind() == FrameKind::Short {
            message.to_long()
        } else {
            *message
        }
    }

    fn write_frame(&mut self, message: &HidppMessage) -> Result<(), SendError> {
        let frame = self.prepare(message);
        let bytes = frame.as_bytes();
        let written = self.writer.write(bytes).map_err(SendError::Io)?;
        if written != bytes.len() {
            return Err(SendError::ShortWrite {
                written,
                expected: bytes.len(),
            });
        }
        tracing::trace!(frame = %frame, "HID++ frame written");
        Ok(())
    }

    /// Write a frame without waiting for a reply
    ///
    /// # Errors
    ///
    /// Returns [`SendError::ShortWrite`] if the transport accepted fewer
    /// bytes than the frame holds, or [`SendError::Io`] if the write failed.
    pub fn send(&mut self, message: &HidppMessage) -> Result<(), SendError> {
        self.write_frame(message)
    }

    /// Write a request and register it for reply correlation
    ///
    /// The returned receiver resolves exactly once: with the reply, the
    /// device's error reply, [`HidppError::Timeout`], or
    /// [`HidppError::Disconnected`]. If the write fails the receiver is
    /// already resolved with [`HidppError::Write`] and nothing is registered.
    pub fn request(
        &mut self,
        message: HidppMessage,
        timeout: Duration,
        now: Instant,
    ) -> oneshot::Receiver<RequestResult> {
        let (tx, rx) = oneshot::channel();
        self.register(message, timeout, now, tx);
        rx
    }

    fn register(
        &mut self,
        message: HidppMessage,
        timeout: Duration,
        now: Instant,
        reply: oneshot::Sender<RequestResult>,
    ) {
        let pending = PendingRequest {
            request: message,
            expires_at: now + timeout,
            reply,
        };

        if let Err(e) = self.write_frame(&message) {
            tracing::debug!(request = %message, error = %e, "HID++ request write failed");
            pending.resolve(Err(HidppError::Write(e)));
            return;
        }

        self.pending
            .entry(message.request_key())
            .or_default()
            .push_back(pending);
        if self.next_sweep.is_none() {
            self.next_sweep = Some(now + SWEEP_INTERVAL);
        }
    }

    /// Register a subscriber for unsolicited frames of one feature index
    pub fn subscribe(&mut self, feature_index: u8, sender: mpsc::UnboundedSender<HidppMessage>) {
        self.subscribers.entry(feature_index).or_default().push(sender);
    }

    fn take_pending(&mut self, key: &RequestKey) -> Option<PendingRequest> {
        let queue = self.pending.get_mut(key)?;
        let request = queue.pop_front();
        if queue.is_empty() {
            self.pending.remove(key);
        }
        if self.pending.is_empty() {
            self.next_sweep = None;
        }
        request
    }

    /// Dispatch one inbound frame
    pub fn handle_frame(&mut self, bytes: &[u8]) {
        let frame = match HidppMessage::from_bytes(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::trace!(len = bytes.len(), error = %e, "Ignoring non-HID++ report");
                return;
            }
        };

        if let (Some(key), Some(error)) = (frame.error_request_key(), frame.protocol_error()) {
            match self.take_pending(&key) {
                Some(pending) => {
                    tracing::debug!(request = %pending.request, error = %error, "HID++ request failed");
                    pending.resolve(Err(HidppError::Protocol(error)));
                }
                None => {
                    tracing::debug!(frame = %frame, "HID++ error reply matches no pending request");
                }
            }
            return;
        }

        if let Some(pending) = self.take_pending(&frame.request_key()) {
            tracing::trace!(request = %pending.request, reply = %frame, "HID++ request answered");
            pending.resolve(Ok(frame));
            return;
        }

        if let Some(subscribers) = self.subscribers.get_mut(&frame.feature_index()) {
            subscribers.retain(|s| s.send(frame).is_ok());
            if !subscribers.is_empty() {
                return;
            }
        }
        tracing::debug!(frame = %frame, "Discarding unsolicited HID++ frame");
    }

    /// Expire every request whose deadline has passed
    ///
    /// Returns the number of requests that timed out. The next sweep is
    /// scheduled only while requests remain pending.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let mut expired = Vec::new();
        for queue in self.pending.values_mut() {
            let mut kept = VecDeque::with_capacity(queue.len());
            for pending in queue.drain(..) {
                if pending.expires_at <= now {
                    expired.push(pending);
                } else {
                    kept.push_back(pending);
                }
            }
            *queue = kept;
        }
        self.pending.retain(|_, queue| !queue.is_empty());

        let count = expired.len();
        for pending in expired {
            tracing::debug!(request = %pending.request, "HID++ request timed out");
            pending.resolve(Err(HidppError::Timeout));
        }

        self.next_sweep = if self.pending.is_empty() {
            None
        } else {
            Some(now + SWEEP_INTERVAL)
        };
        count
    }

    /// Resolve every pending request with [`HidppError::Disconnected`]
    pub fn cancel_all(&mut self) {
        for (_, queue) in self.pending.drain() {
            for pending in queue {
                pending.resolve(Err(HidppError::Disconnected));
            }
        }
        self.next_sweep = None;
    }

    fn execute(&mut self, command: EngineCommand, now: Instant) {
        match command {
            EngineCommand::Send { message, reply } => {
                let _ = reply.send(self.send(&message));
            }
            EngineCommand::Request {
                message,
                timeout,
                reply,
            } => self.register(message, timeout, now, reply),
            EngineCommand::Subscribe {
                feature_index,
                sender,
            } => self.subscribe(feature_index, sender),
        }
    }
}

// ============================================================================
// Actor
// ============================================================================

/// Source of inbound frames for [`run_engine`]
pub trait FrameSource {
    /// Wait for the next report; an error means the transport is gone
    fn next_frame(&mut self) -> impl Future<Output = io::Result<Vec<u8>>> + Send;
}

/// Commands accepted by a running engine
pub enum EngineCommand {
    Send {
        message: HidppMessage,
        reply: oneshot::Sender<Result<(), SendError>>,
    },
    Request {
        message: HidppMessage,
        timeout: Duration,
        reply: oneshot::Sender<RequestResult>,
    },
    Subscribe {
        feature_index: u8,
        sender: mpsc::UnboundedSender<HidppMessage>,
    },
}

/// Why [`run_engine`] returned
#[derive(Debug)]
pub enum EngineExit {
    /// Shutdown was requested or every handle was dropped
    Closed,
    /// Reading from the transport failed
    ReadError(io::Error),
}

/// Drive an engine until shutdown, handle loss or a read error
///
/// Pending requests are resolved with [`HidppError::Disconnected`] on every
/// exit path.
pub async fn run_engine<W, S>(
    mut engine: HidppEngine<W>,
    mut source: S,
    mut commands: mpsc::Receiver<EngineCommand>,
    mut shutdown: oneshot::Receiver<()>,
) -> EngineExit
where
    W: Write,
    S: FrameSource,
{
    let exit = loop {
        let sweep_at = engine.next_sweep();
        tokio::select! {
            frame = source.next_frame() => match frame {
                Ok(bytes) => engine.handle_frame(&bytes),
                Err(e) => break EngineExit::ReadError(e),
            },
            command = commands.recv() => match command {
                Some(command) => engine.execute(command, Instant::now()),
                None => break EngineExit::Closed,
            },
            _ = sleep_until(sweep_at.unwrap_or_else(Instant::now)), if sweep_at.is_some() => {
                engine.sweep(Instant::now());
            }
            _ = &mut shutdown => break EngineExit::Closed,
        }
    };
    engine.cancel_all();
    exit
}

// ============================================================================
// Handle
// ============================================================================

/// Cloneable client of a running engine
#[derive(Debug, Clone)]
pub struct HidppHandle {
    commands: mpsc::Sender<EngineCommand>,
}

impl HidppHandle {
    /// Create a handle and the command receiver to pass to [`run_engine`]
    pub fn channel() -> (Self, mpsc::Receiver<EngineCommand>) {
        let (tx, rx) = mpsc::channel(32);
        (Self { commands: tx }, rx)
    }

    /// Write a frame without waiting for a reply
    pub async fn send(&self, message: HidppMessage) -> Result<(), SendError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(EngineCommand::Send { message, reply })
            .await
            .map_err(|_| SendError::Closed)?;
        rx.await.unwrap_or(Err(SendError::Closed))
    }

    /// Issue a request with the default timeout and wait for its result
    pub async fn request(&self, message: HidppMessage) -> RequestResult {
        self.request_with_timeout(message, DEFAULT_REQUEST_TIMEOUT).await
    }

    /// Issue a request and wait for its result
    pub async fn request_with_timeout(
        &self,
        message: HidppMessage,
        timeout: Duration,
    ) -> RequestResult {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(EngineCommand::Request {
                message,
                timeout,
                reply,
            })
            .await
            .map_err(|_| HidppError::Disconnected)?;
        rx.await.unwrap_or(Err(HidppError::Disconnected))
    }

    /// Issue requests one after another
    ///
    /// Each request is only written once the previous one has resolved. With
    /// `continue_on_error` false the batch stops at the first failure; the
    /// returned vector holds one result per request actually attempted.
    pub async fn send_batch(
        &self,
        messages: Vec<HidppMessage>,
        continue_on_error: bool,
    ) -> Vec<RequestResult> {
        let mut results = Vec::with_capacity(messages.len());
        for message in messages {
            let result = self.request(message).await;
            let failed = result.is_err();
            results.push(result);
            if failed && !continue_on_error {
                break;
            }
        }
        results
    }

    /// Receive unsolicited frames addressed to `feature_index`
    ///
    /// Returns `None` if the engine is no longer running.
    pub async fn subscribe(
        &self,
        feature_index: u8,
    ) -> Option<mpsc::UnboundedReceiver<HidppMessage>> {
        let (sender, rx) = mpsc::unbounded_channel();
        self.commands
            .send(EngineCommand::Subscribe {
                feature_index,
                sender,
            })
            .await
            .ok()?;
        Some(rx)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory transport for driving the engine in tests

    use std::sync::{Arc, Mutex};

    use super::*;

    /// Writer that records every frame and can be told to misbehave
    #[derive(Clone, Default)]
    pub struct RecordingWriter {
        pub frames: Arc<Mutex<Vec<Vec<u8>>>>,
        /// Accept only this many bytes per write
        pub truncate_to: Option<usize>,
        pub fail: bool,
    }

    impl Write for RecordingWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.fail {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "gone"));
            }
            let n = self.truncate_to.map_or(buf.len(), |t| t.min(buf.len()));
            self.frames.lock().unwrap().push(buf[..n].to_vec());
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Frame source fed from a channel; dropping the sender ends the stream
    pub struct ChannelSource(pub mpsc::UnboundedReceiver<Vec<u8>>);

    impl FrameSource for ChannelSource {
        async fn next_frame(&mut self) -> io::Result<Vec<u8>> {
            self.0
                .recv()
                .await
                .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "closed"))
        }
    }

    /// Spawn an engine on an in-memory transport
    pub fn spawn_engine(
        writer: RecordingWriter,
        long_only: bool,
    ) -> (
        HidppHandle,
        mpsc::UnboundedSender<Vec<u8>>,
        oneshot::Sender<()>,
        tokio::task::JoinHandle<EngineExit>,
    ) {
        let (handle, commands) = HidppHandle::channel();
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let engine = HidppEngine::new(writer, long_only);
        let task = tokio::spawn(run_engine(
            engine,
            ChannelSource(frames_rx),
            commands,
            shutdown_rx,
        ));
        (handle, frames_tx, shutdown_tx, task)
    }

    /// Build the reply a device would send for `request`
    pub fn reply_to(request: &HidppMessage, payload: &[u8]) -> Vec<u8> {
        HidppMessage::long(
            request.device_index(),
            request.feature_index(),
            request.function(),
            request.software_id(),
            payload,
        )
        .as_bytes()
        .to_vec()
    }

    /// Build a HID++ 2.0 error reply for `request`
    pub fn error_reply_to(request: &HidppMessage, code: u8) -> Vec<u8> {
        let mut bytes = vec![0u8; 20];
        bytes[0] = 0x11;
        bytes[1] = request.device_index();
        bytes[2] = 0xff;
        bytes[3] = request.feature_index();
        bytes[4] = request.address();
        bytes[5] = code;
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::error::ErrorVersion;

    fn feature_query(feature_index: u8) -> HidppMessage {
        HidppMessage::short(0x01, feature_index, 0x0, 0x7, [0x10, 0x00, 0x00])
    }

    fn engine(writer: RecordingWriter, long_only: bool) -> HidppEngine<RecordingWriter> {
        HidppEngine::new(writer, long_only)
    }

    #[test]
    fn test_send_writes_short_frame_on_short_capable_transport() {
        let writer = RecordingWriter::default();
        let mut engine = engine(writer.clone(), false);
        engine.send(&feature_query(0x00)).unwrap();

        let frames = writer.frames.lock().unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].len(), 7);
    }

    #[test]
    fn test_send_widens_on_long_only_transport() {
        let writer = RecordingWriter::default();
        let mut engine = engine(writer.clone(), true);
        engine.send(&feature_query(0x00)).unwrap();

        let frames = writer.frames.lock().unwrap();
        assert_eq!(frames[0].len(), 20);
        assert_eq!(frames[0][0], 0x11);
        assert_eq!(&frames[0][1..7], &[0x01, 0x00, 0x07, 0x10, 0x00, 0x00]);
    }

    #[test]
    fn test_short_write_is_send_error() {
        let writer = RecordingWriter {
            truncate_to: Some(5),
            ..Default::default()
        };
        let mut engine = engine(writer, false);
        let err = engine.send(&feature_query(0x00)).unwrap_err();
        assert!(matches!(
            err,
            SendError::ShortWrite {
                written: 5,
                expected: 7
            }
        ));
    }

    #[tokio::test]
    async fn test_request_write_failure_resolves_immediately() {
        let writer = RecordingWriter {
            fail: true,
            ..Default::default()
        };
        let mut engine = engine(writer, false);
        let rx = engine.request(feature_query(0x00), DEFAULT_REQUEST_TIMEOUT, Instant::now());

        assert_eq!(engine.pending_count(), 0);
        assert_eq!(engine.next_sweep(), None);
        assert!(matches!(rx.await.unwrap(), Err(HidppError::Write(SendError::Io(_)))));
    }

    #[tokio::test]
    async fn test_reply_resolves_matching_request() {
        let mut engine = engine(RecordingWriter::default(), false);
        let request = feature_query(0x00);
        let rx = engine.request(request, DEFAULT_REQUEST_TIMEOUT, Instant::now());
        assert_eq!(engine.pending_count(), 1);
        assert!(engine.next_sweep().is_some());

        engine.handle_frame(&reply_to(&request, &[0x04, 0x02]));
        let reply = rx.await.unwrap().unwrap();
        assert_eq!(&reply.payload()[..2], &[0x04, 0x02]);
        assert_eq!(engine.pending_count(), 0);
        assert_eq!(engine.next_sweep(), None);
    }

    #[tokio::test]
    async fn test_malformed_inbound_frames_are_ignored() {
        let mut engine = engine(RecordingWriter::default(), false);
        let request = feature_query(0x00);
        let rx = engine.request(request, DEFAULT_REQUEST_TIMEOUT, Instant::now());

        // Wrong length, then a long-sized buffer carrying the short report id
        engine.handle_frame(&[0x11, 0x01, 0x00]);
        let mut mislabelled = reply_to(&request, &[0x04]);
        mislabelled[0] = 0x10;
        engine.handle_frame(&mislabelled);
        assert_eq!(engine.pending_count(), 1);

        engine.handle_frame(&reply_to(&request, &[0x04]));
        assert_eq!(rx.await.unwrap().unwrap().payload()[0], 0x04);
    }

    #[tokio::test]
    async fn test_error_reply_resolves_with_protocol_error() {
        let mut engine = engine(RecordingWriter::default(), false);
        let request = feature_query(0x05);
        let rx = engine.request(request, DEFAULT_REQUEST_TIMEOUT, Instant::now());

        engine.handle_frame(&error_reply_to(&request, 0x02));
        match rx.await.unwrap() {
            Err(HidppError::Protocol(e)) => {
                assert_eq!(e.version, ErrorVersion::Hidpp20);
                assert_eq!(e.code, 0x02);
            }
            other => panic!("expected protocol error, got {:?}", other),
        }
        assert_eq!(engine.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_keys_resolve_fifo() {
        let mut engine = engine(RecordingWriter::default(), false);
        let request = feature_query(0x00);
        let now = Instant::now();
        let mut first = engine.request(request, DEFAULT_REQUEST_TIMEOUT, now);
        let mut second = engine.request(request, DEFAULT_REQUEST_TIMEOUT, now);

        engine.handle_frame(&reply_to(&request, &[0x01]));
        assert_eq!(first.try_recv().unwrap().unwrap().payload()[0], 0x01);
        assert!(second.try_recv().is_err());

        engine.handle_frame(&reply_to(&request, &[0x02]));
        assert_eq!(second.try_recv().unwrap().unwrap().payload()[0], 0x02);
    }

    #[tokio::test]
    async fn test_unmatched_frame_goes_to_subscriber() {
        let mut engine = engine(RecordingWriter::default(), false);
        let (tx, mut rx) = mpsc::unbounded_channel();
        engine.subscribe(0x04, tx);

        let notification = HidppMessage::long(0x01, 0x04, 0x0, 0x0, &[0x50]);
        engine.handle_frame(notification.as_bytes());
        assert_eq!(rx.try_recv().unwrap(), notification);

        // No subscriber for this feature index: dropped without effect
        engine.handle_frame(HidppMessage::long(0x01, 0x09, 0x0, 0x0, &[]).as_bytes());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_sweep_expires_only_due_requests() {
        let mut engine = engine(RecordingWriter::default(), false);
        let start = Instant::now();
        let mut short = engine.request(feature_query(0x01), Duration::from_millis(300), start);
        let mut long = engine.request(feature_query(0x02), Duration::from_secs(5), start);
        assert_eq!(engine.next_sweep(), Some(start + SWEEP_INTERVAL));

        assert_eq!(engine.sweep(start + SWEEP_INTERVAL), 1);
        assert!(matches!(short.try_recv().unwrap(), Err(HidppError::Timeout)));
        assert!(long.try_recv().is_err());
        assert_eq!(engine.next_sweep(), Some(start + SWEEP_INTERVAL * 2));

        assert_eq!(engine.sweep(start + Duration::from_secs(6)), 1);
        assert!(matches!(long.try_recv().unwrap(), Err(HidppError::Timeout)));
        assert_eq!(engine.next_sweep(), None);
    }

    #[tokio::test]
    async fn test_cancel_all_resolves_disconnected() {
        let mut engine = engine(RecordingWriter::default(), false);
        let now = Instant::now();
        let a = engine.request(feature_query(0x01), DEFAULT_REQUEST_TIMEOUT, now);
        let b = engine.request(feature_query(0x02), DEFAULT_REQUEST_TIMEOUT, now);

        engine.cancel_all();
        assert!(matches!(a.await.unwrap(), Err(HidppError::Disconnected)));
        assert!(matches!(b.await.unwrap(), Err(HidppError::Disconnected)));
        assert_eq!(engine.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_resolution_happens_once() {
        let mut engine = engine(RecordingWriter::default(), false);
        let request = feature_query(0x00);
        let start = Instant::now();
        let rx = engine.request(request, Duration::from_millis(100), start);

        engine.handle_frame(&reply_to(&request, &[0x07]));
        // Later events for the same key find nothing to resolve
        engine.handle_frame(&error_reply_to(&request, 0x01));
        engine.sweep(start + Duration::from_secs(1));
        engine.cancel_all();

        assert_eq!(rx.await.unwrap().unwrap().payload()[0], 0x07);
    }

    #[tokio::test(start_paused = true)]
    async fn test_actor_widened_request_gets_long_reply() {
        let writer = RecordingWriter::default();
        let (handle, frames, _shutdown, _task) = spawn_engine(writer.clone(), true);
        let request = feature_query(0x00);

        let pending = tokio::spawn({
            let handle = handle.clone();
            async move { handle.request(request).await }
        });
        tokio::task::yield_now().await;
        while writer.frames.lock().unwrap().is_empty() {
            tokio::task::yield_now().await;
        }
        assert_eq!(writer.frames.lock().unwrap()[0].len(), 20);

        frames.send(reply_to(&request, &[0x04, 0x02])).unwrap();
        let reply = pending.await.unwrap().unwrap();
        assert_eq!(reply.kind(), FrameKind::Long);
        assert_eq!(&reply.payload()[..2], &[0x04, 0x02]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_actor_reports_short_write_to_sender() {
        let writer = RecordingWriter {
            truncate_to: Some(12),
            ..Default::default()
        };
        let (handle, _frames, _shutdown, _task) = spawn_engine(writer, true);

        let result = handle.send(feature_query(0x00)).await;
        assert!(matches!(
            result,
            Err(SendError::ShortWrite {
                written: 12,
                expected: 20
            })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_actor_times_out_unanswered_request() {
        let (handle, _frames, _shutdown, _task) = spawn_engine(RecordingWriter::default(), false);
        let result = handle
            .request_with_timeout(feature_query(0x00), Duration::from_millis(200))
            .await;
        assert!(matches!(result, Err(HidppError::Timeout)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_actor_shutdown_disconnects_pending() {
        let (handle, _frames, shutdown, task) = spawn_engine(RecordingWriter::default(), false);
        let pending = tokio::spawn({
            let handle = handle.clone();
            async move { handle.request(feature_query(0x00)).await }
        });
        tokio::task::yield_now().await;
        shutdown.send(()).unwrap();

        assert!(matches!(task.await.unwrap(), EngineExit::Closed));
        assert!(matches!(pending.await.unwrap(), Err(HidppError::Disconnected)));
        assert!(handle.send(feature_query(0x00)).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_actor_read_error_ends_engine() {
        let (_handle, frames, _shutdown, task) = spawn_engine(RecordingWriter::default(), false);
        drop(frames);
        assert!(matches!(task.await.unwrap(), EngineExit::ReadError(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_stops_at_first_error() {
        let writer = RecordingWriter::default();
        let (handle, frames, _shutdown, _task) = spawn_engine(writer.clone(), false);
        let requests = vec![feature_query(0x01), feature_query(0x02), feature_query(0x03)];

        // Answer the first, fail the second
        let responder = tokio::spawn({
            let writer = writer.clone();
            let requests = requests.clone();
            async move {
                for (i, request) in requests.iter().take(2).enumerate() {
                    while writer.frames.lock().unwrap().len() <= i {
                        tokio::task::yield_now().await;
                    }
                    let bytes = if i == 0 {
                        reply_to(request, &[0x01])
                    } else {
                        error_reply_to(request, 0x05)
                    };
                    frames.send(bytes).unwrap();
                }
                frames
            }
        });

        let results = handle.send_batch(requests, false).await;
        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(HidppError::Protocol(_))));
        // Third request never written
        assert_eq!(writer.frames.lock().unwrap().len(), 2);
        drop(responder.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_continue_on_error_attempts_all() {
        let writer = RecordingWriter::default();
        let (handle, _frames, _shutdown, _task) = spawn_engine(writer.clone(), false);
        let requests = vec![feature_query(0x01), feature_query(0x02), feature_query(0x03)];

        // Nobody answers: every request times out in turn
        let results = handle.send_batch(requests, true).await;
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| matches!(r, Err(HidppError::Timeout))));
        assert_eq!(writer.frames.lock().unwrap().len(), 3);
    }
}
