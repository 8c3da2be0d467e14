//! Hand-off between the capture callback and the network sender.
//!
//! The bridge owns the stream state and the outbound queue under a single
//! mutex. The capture side offers frames through [`FrameObserver`]; the
//! network side pulls them with [`StreamBridge::next_frame`] and hands
//! them back with [`StreamBridge::release`]. Every frame that enters the
//! bridge leaves it again through the return channel, whether it was sent,
//! evicted, or refused.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;

use super::queue::{BoundedQueue, OverflowPolicy, Push};
use crate::capture::{Frame, FrameObserver};

/// Phase of a stream, shared by the capture and network threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    /// No client. Incoming frames go straight back to the camera.
    Init,
    /// A client connected; the next frame starts the stream.
    StartRequested,
    /// Frames are queued for the connected client.
    Streaming,
    /// The stream failed (send error or timeout) and waits for a new client.
    StoppedOnError,
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "init",
            Self::StartRequested => "start_requested",
            Self::Streaming => "streaming",
            Self::StoppedOnError => "stopped_on_error",
        };
        f.write_str(name)
    }
}

/// Why [`StreamBridge::next_frame`] returned without a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RecvError {
    #[error("no frame arrived in time")]
    Timeout,
    #[error("stream is not active ({0})")]
    NotStreaming(StreamState),
}

/// How a connection ended, as reported by the network side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Finish {
    /// The client went away or the server is stopping.
    Disconnected,
    /// Sending failed or no frames arrived.
    Failed,
}

#[derive(Debug, Default)]
struct Counters {
    queued: AtomicU64,
    sent: AtomicU64,
    bytes_sent: AtomicU64,
    dropped: AtomicU64,
    rejected: AtomicU64,
    returned: AtomicU64,
}

/// Point-in-time view of a stream.
#[derive(Debug, Clone, Serialize)]
pub struct StreamStats {
    pub state: StreamState,
    pub queue_len: usize,
    pub queue_capacity: usize,
    /// Frames accepted into the queue.
    pub queued: u64,
    /// Frames written to a client.
    pub sent: u64,
    pub bytes_sent: u64,
    /// Frames evicted by the drop-oldest policy.
    pub dropped: u64,
    /// Frames refused because the stream was not active or the queue
    /// stayed full.
    pub rejected: u64,
    /// Frames handed back to the capture layer.
    pub returned: u64,
}

struct Inner {
    state: StreamState,
    queue: BoundedQueue<Frame>,
}

/// Producer/consumer bridge for one camera stream.
pub struct StreamBridge {
    name: String,
    policy: OverflowPolicy,
    inner: Mutex<Inner>,
    not_empty: Condvar,
    not_full: Condvar,
    returns: Sender<Frame>,
    returned: Receiver<Frame>,
    counters: Counters,
}

impl StreamBridge {
    pub fn new(name: impl Into<String>, capacity: usize, policy: OverflowPolicy) -> Self {
        let (returns, returned) = crossbeam_channel::unbounded();
        Self {
            name: name.into(),
            policy,
            inner: Mutex::new(Inner {
                state: StreamState::Init,
                queue: BoundedQueue::new(capacity),
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            returns,
            returned,
            counters: Counters::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    pub fn state(&self) -> StreamState {
        self.inner.lock().state
    }

    pub fn queue_len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Receiving end of the return path. The capture layer re-queues every
    /// frame it receives here.
    pub fn returned(&self) -> Receiver<Frame> {
        self.returned.clone()
    }

    /// Called by the network side when a client connects.
    ///
    /// Frames left over from an earlier client are returned; the stream
    /// becomes active with the next frame the camera delivers.
    pub fn request_start(&self) {
        let stale = {
            let mut inner = self.inner.lock();
            inner.state = StreamState::StartRequested;
            inner.queue.drain()
        };
        self.not_full.notify_all();
        tracing::info!(stream = %self.name, stale = stale.len(), "Start of stream requested");
        self.give_back_all(stale);
    }

    /// Waits up to `timeout` for the next frame, oldest first.
    pub fn next_frame(&self, timeout: Duration) -> Result<Frame, RecvError> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        let mut timed_out = false;
        loop {
            match inner.state {
                StreamState::Streaming => {
                    if let Some(frame) = inner.queue.pop() {
                        drop(inner);
                        self.not_full.notify_one();
                        return Ok(frame);
                    }
                }
                StreamState::StartRequested => {}
                state => return Err(RecvError::NotStreaming(state)),
            }
            if timed_out {
                return Err(RecvError::Timeout);
            }
            timed_out = self.not_empty.wait_until(&mut inner, deadline).timed_out();
        }
    }

    /// Records a frame as sent to the client.
    pub fn record_sent(&self, frame: &Frame) {
        self.counters.sent.fetch_add(1, Ordering::Relaxed);
        self.counters
            .bytes_sent
            .fetch_add(frame.buffer_size() as u64, Ordering::Relaxed);
    }

    /// Hands a frame taken with [`next_frame`](Self::next_frame) back to
    /// the capture layer.
    pub fn release(&self, frame: Frame) {
        self.give_back(frame);
    }

    /// Ends the current connection's stream and returns queued frames.
    pub fn finish(&self, how: Finish) {
        let (previous, stale) = {
            let mut inner = self.inner.lock();
            let previous = inner.state;
            inner.state = match how {
                Finish::Disconnected => StreamState::Init,
                Finish::Failed => StreamState::StoppedOnError,
            };
            (previous, inner.queue.drain())
        };
        self.not_empty.notify_all();
        self.not_full.notify_all();
        tracing::info!(
            stream = %self.name,
            from = %previous,
            outcome = ?how,
            returned = stale.len(),
            "Stream finished"
        );
        self.give_back_all(stale);
    }

    /// Parks the stream in `Init` and returns every queued frame.
    pub fn shutdown(&self) {
        self.finish(Finish::Disconnected);
    }

    pub fn snapshot(&self) -> StreamStats {
        let (state, queue_len, queue_capacity) = {
            let inner = self.inner.lock();
            (inner.state, inner.queue.len(), inner.queue.capacity())
        };
        let c = &self.counters;
        StreamStats {
            state,
            queue_len,
            queue_capacity,
            queued: c.queued.load(Ordering::Relaxed),
            sent: c.sent.load(Ordering::Relaxed),
            bytes_sent: c.bytes_sent.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            returned: c.returned.load(Ordering::Relaxed),
        }
    }

    fn offer(&self, frame: Frame) {
        let mut inner = self.inner.lock();
        match inner.state {
            StreamState::Init | StreamState::StoppedOnError => {
                drop(inner);
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                self.give_back(frame);
                return;
            }
            StreamState::StartRequested => {
                // request_start already emptied the queue
                inner.state = StreamState::Streaming;
                tracing::info!(stream = %self.name, first_frame = frame.frame_id(), "Streaming started");
            }
            StreamState::Streaming => {}
        }

        let outcome = match self.policy {
            OverflowPolicy::DropOldest => inner.queue.push(frame, true),
            OverflowPolicy::Block { timeout } => {
                let deadline = Instant::now() + timeout;
                while inner.queue.is_full() && inner.state == StreamState::Streaming {
                    if self.not_full.wait_until(&mut inner, deadline).timed_out() {
                        break;
                    }
                }
                if inner.state != StreamState::Streaming {
                    Push::Full(frame)
                } else {
                    let pushed = inner.queue.push(frame, false);
                    if matches!(pushed, Push::Full(_)) {
                        inner.state = StreamState::StoppedOnError;
                        tracing::warn!(
                            stream = %self.name,
                            timeout_ms = timeout.as_millis() as u64,
                            "Queue full (time out), stop streaming"
                        );
                    }
                    pushed
                }
            }
        };
        drop(inner);

        match outcome {
            Push::Queued => {
                self.counters.queued.fetch_add(1, Ordering::Relaxed);
                self.not_empty.notify_one();
            }
            Push::Evicted(oldest) => {
                self.counters.queued.fetch_add(1, Ordering::Relaxed);
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                self.not_empty.notify_one();
                tracing::debug!(stream = %self.name, frame = oldest.frame_id(), "Dropped oldest frame");
                self.give_back(oldest);
            }
            Push::Full(frame) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                // wake the sender so it notices the state change
                self.not_empty.notify_all();
                self.give_back(frame);
            }
        }
    }

    fn give_back(&self, frame: Frame) {
        self.counters.returned.fetch_add(1, Ordering::Relaxed);
        // The bridge holds a receiver itself, so the channel never disconnects.
        if self.returns.send(frame).is_err() {
            tracing::error!(stream = %self.name, "Return channel closed");
        }
    }

    fn give_back_all(&self, frames: Vec<Frame>) {
        for frame in frames {
            self.give_back(frame);
        }
    }
}

impl FrameObserver for StreamBridge {
    fn frame_received(&self, frame: Frame) {
        tracing::trace!(stream = %self.name, frame = frame.frame_id(), "New frame");
        self.offer(frame);
    }
}

impl fmt::Debug for StreamBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamBridge")
            .field("name", &self.name)
            .field("policy", &self.policy)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::PixelFormat;
    use std::sync::Arc;

    fn frame(id: u64) -> Frame {
        Frame::new(vec![id as u8; 4], 2, 2, PixelFormat::MONO8, id, id * 10)
    }

    fn returned_ids(bridge: &StreamBridge) -> Vec<u64> {
        bridge.returned().try_iter().map(|f| f.frame_id()).collect()
    }

    #[test]
    fn test_frames_refused_until_client_connects() {
        let bridge = StreamBridge::new("cam", 2, OverflowPolicy::DropOldest);
        bridge.frame_received(frame(1));
        bridge.frame_received(frame(2));
        assert_eq!(bridge.queue_len(), 0);
        assert_eq!(returned_ids(&bridge), vec![1, 2]);
        assert_eq!(bridge.snapshot().rejected, 2);
    }

    #[test]
    fn test_first_frame_starts_stream() {
        let bridge = StreamBridge::new("cam", 2, OverflowPolicy::DropOldest);
        bridge.request_start();
        assert_eq!(bridge.state(), StreamState::StartRequested);
        assert_eq!(
            bridge.next_frame(Duration::from_millis(10)).unwrap_err(),
            RecvError::Timeout
        );

        bridge.frame_received(frame(1));
        assert_eq!(bridge.state(), StreamState::Streaming);
        let got = bridge.next_frame(Duration::from_millis(10)).unwrap();
        assert_eq!(got.frame_id(), 1);
        bridge.release(got);
        assert_eq!(returned_ids(&bridge), vec![1]);
    }

    #[test]
    fn test_drop_oldest_returns_evicted_frame() {
        let bridge = StreamBridge::new("cam", 2, OverflowPolicy::DropOldest);
        bridge.request_start();
        for id in 1..=5 {
            bridge.frame_received(frame(id));
        }
        assert_eq!(bridge.queue_len(), 2);
        assert_eq!(returned_ids(&bridge), vec![1, 2, 3]);
        assert_eq!(bridge.next_frame(Duration::ZERO).unwrap().frame_id(), 4);
        assert_eq!(bridge.next_frame(Duration::ZERO).unwrap().frame_id(), 5);
        let stats = bridge.snapshot();
        assert_eq!(stats.dropped, 3);
        assert_eq!(stats.queued, 5);
    }

    #[test]
    fn test_block_policy_times_out_into_error() {
        let bridge = StreamBridge::new(
            "cam",
            1,
            OverflowPolicy::Block {
                timeout: Duration::from_millis(20),
            },
        );
        bridge.request_start();
        bridge.frame_received(frame(1));
        bridge.frame_received(frame(2));
        assert_eq!(bridge.state(), StreamState::StoppedOnError);
        assert_eq!(returned_ids(&bridge), vec![2]);
        assert_eq!(
            bridge.next_frame(Duration::from_millis(10)).unwrap_err(),
            RecvError::NotStreaming(StreamState::StoppedOnError)
        );
        // Frames after the failure go straight back.
        bridge.frame_received(frame(3));
        assert_eq!(returned_ids(&bridge), vec![3]);
    }

    #[test]
    fn test_block_policy_waits_for_consumer() {
        let bridge = Arc::new(StreamBridge::new(
            "cam",
            1,
            OverflowPolicy::Block {
                timeout: Duration::from_secs(5),
            },
        ));
        bridge.request_start();
        bridge.frame_received(frame(1));

        let consumer = {
            let bridge = Arc::clone(&bridge);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(30));
                let mut ids = Vec::new();
                for _ in 0..2 {
                    let f = bridge.next_frame(Duration::from_secs(2)).unwrap();
                    ids.push(f.frame_id());
                    bridge.release(f);
                }
                ids
            })
        };
        // Blocks until the consumer makes room.
        bridge.frame_received(frame(2));
        assert_eq!(consumer.join().unwrap(), vec![1, 2]);
        assert_eq!(bridge.state(), StreamState::Streaming);
        assert_eq!(bridge.snapshot().dropped, 0);
    }

    #[test]
    fn test_finish_returns_queued_frames() {
        let bridge = StreamBridge::new("cam", 3, OverflowPolicy::DropOldest);
        bridge.request_start();
        bridge.frame_received(frame(1));
        bridge.frame_received(frame(2));
        bridge.finish(Finish::Failed);
        assert_eq!(bridge.state(), StreamState::StoppedOnError);
        assert_eq!(bridge.queue_len(), 0);
        assert_eq!(returned_ids(&bridge), vec![1, 2]);

        // A new client may restart a failed stream.
        bridge.request_start();
        bridge.frame_received(frame(3));
        assert_eq!(bridge.state(), StreamState::Streaming);
        bridge.shutdown();
        assert_eq!(bridge.state(), StreamState::Init);
        assert_eq!(returned_ids(&bridge), vec![3]);
        assert_eq!(bridge.snapshot().returned, 3);
    }

    #[test]
    fn test_waiting_consumer_wakes_on_finish() {
        let bridge = Arc::new(StreamBridge::new("cam", 1, OverflowPolicy::DropOldest));
        bridge.request_start();
        let waiter = {
            let bridge = Arc::clone(&bridge);
            std::thread::spawn(move || bridge.next_frame(Duration::from_secs(10)))
        };
        std::thread::sleep(Duration::from_millis(20));
        let started = Instant::now();
        bridge.finish(Finish::Disconnected);
        let result = waiter.join().unwrap();
        assert_eq!(
            result.unwrap_err(),
            RecvError::NotStreaming(StreamState::Init)
        );
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
