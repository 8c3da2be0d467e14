//! Frame hand-off between capture and network threads.
//!
//! ```text
//! camera thread ──frame_received──▶ StreamBridge ──next_frame──▶ sender
//!       ▲                               │                          │
//!       └──────── returned() ◀──────────┴───────── release ◀───────┘
//! ```
//!
//! [`header`] holds the binary format written ahead of every payload.

mod bridge;
pub mod header;
mod queue;

pub use bridge::{Finish, RecvError, StreamBridge, StreamState, StreamStats};
pub use header::{FrameHeader, HeaderError, HeaderFormat, LegacyHeader};
pub use queue::{BoundedQueue, OverflowPolicy, Push};
