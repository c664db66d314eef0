//! Frame access core for video files, sitting between an editing/preview
//! host and an external `ffmpeg`-family decoder binary.
//!
//! One [`VideoSession`] per file serves decoded BGRA frames by timestamp
//! under two conflicting workloads: low-latency random access while the
//! user scrubs, and sustained frame-rate throughput during playback. The
//! session keeps a bounded time-quantized frame cache, one persistent
//! sequential decoder child throttled purely by channel back-pressure, and
//! a request coordinator that classifies every request, adapts its
//! look-ahead to the observed playback speed and falls back to single-shot
//! decodes when the worker cannot keep up.
//!
//! [`FrameServer`] is the multi-file entry point: one session per path.

mod cache;
mod config;
mod decoder;
mod error;
mod frame;
mod pool;
mod probe;
mod registry;
mod session;
mod signal;
mod sink;
mod time;
mod worker;

pub use cache::FrameCache;
pub use config::{load_settings, HwAccelApi, Options};
pub use error::Error;
pub use frame::Frame;
pub use pool::{Bitmap, BitmapPool};
pub use probe::{probe, VideoMeta, DEFAULT_FRAME_RATE};
pub use registry::FrameServer;
pub use session::VideoSession;
pub use time::{Ticks, TICKS_PER_SECOND};
