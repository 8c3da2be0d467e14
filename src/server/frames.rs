//! Connection handler that streams camera frames to a client.

use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{Connection, ConnectionError, ConnectionHandler};
use crate::stream::header::write_frame;
use crate::stream::{Finish, HeaderFormat, RecvError, StreamBridge, StreamState};

/// Interval at which a waiting sender re-checks the stop flag.
const TICK: Duration = Duration::from_millis(100);

/// Sends every frame the bridge hands out, header first, until the client
/// goes away, the stream fails, or the server stops.
pub struct FrameStreamHandler {
    bridge: Arc<StreamBridge>,
    format: HeaderFormat,
    frame_timeout: Duration,
    tick: Duration,
}

impl FrameStreamHandler {
    pub fn new(bridge: Arc<StreamBridge>, format: HeaderFormat, frame_timeout: Duration) -> Self {
        Self {
            bridge,
            format,
            frame_timeout,
            tick: TICK.min(frame_timeout),
        }
    }

    pub fn bridge(&self) -> &Arc<StreamBridge> {
        &self.bridge
    }
}

impl ConnectionHandler for FrameStreamHandler {
    fn handle(&mut self, conn: &mut Connection<'_>) -> Result<(), ConnectionError> {
        let bridge = &self.bridge;
        bridge.request_start();
        let mut last_frame = Instant::now();
        let mut sent = 0u64;

        let outcome = loop {
            if conn.should_stop() {
                break Ok(());
            }
            match bridge.next_frame(self.tick) {
                Ok(frame) => {
                    let result = write_frame(conn.stream(), &frame, self.format);
                    if result.is_ok() {
                        bridge.record_sent(&frame);
                    }
                    // The buffer goes back to the camera whether or not it was sent.
                    bridge.release(frame);
                    if let Err(e) = result {
                        break if conn.should_stop() { Ok(()) } else { Err(e.into()) };
                    }
                    sent += 1;
                    last_frame = Instant::now();
                }
                Err(RecvError::Timeout) => {
                    if last_frame.elapsed() >= self.frame_timeout {
                        break Err(ConnectionError::FrameTimeout(self.frame_timeout));
                    }
                }
                Err(RecvError::NotStreaming(StreamState::Init)) => break Ok(()),
                Err(RecvError::NotStreaming(state)) => {
                    break Err(ConnectionError::StreamStopped(state));
                }
            }
        };

        match &outcome {
            Ok(()) => bridge.finish(Finish::Disconnected),
            Err(e) => {
                tracing::warn!(
                    stream = %bridge.name(),
                    peer = %conn.peer(),
                    error = %e,
                    "Stop streaming"
                );
                bridge.finish(Finish::Failed);
            }
        }
        tracing::info!(stream = %bridge.name(), peer = %conn.peer(), frames = sent, "Streaming session ended");
        outcome
    }
}
