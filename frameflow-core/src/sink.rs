use std::{path::PathBuf, sync::{Arc, Mutex}};

use tokio::sync::mpsc;

use crate::{
    frame::Frame,
    pool::{Bitmap, BitmapPool},
    time::Ticks,
};

/// Collects exactly one raw BGRA frame from the decoder pipe.
///
/// `write` fills the rented buffer and silently drops surplus bytes; the
/// buffer can be taken once when complete. Dropped without a take, the
/// buffer returns to the pool.
pub(crate) struct SingleFrameSink {
    inner: Mutex<SingleFrameInner>,
}

struct SingleFrameInner {
    bitmap: Option<Bitmap>,
    filled: usize,
}

impl SingleFrameSink {
    pub(crate) fn new(pool: &BitmapPool) -> SingleFrameSink {
        SingleFrameSink {
            inner: Mutex::new(SingleFrameInner {
                bitmap: Some(pool.rent()),
                filled: 0,
            }),
        }
    }

    pub(crate) fn write(&self, bytes: &[u8]) {
        let mut inner = self.inner.lock().unwrap();
        let filled = inner.filled;
        let Some(bitmap) = inner.bitmap.as_mut() else {
            return;
        };
        let n = bytes.len().min(bitmap.len() - filled);
        bitmap.data_mut()[filled..filled + n].copy_from_slice(&bytes[..n]);
        inner.filled = filled + n;
    }

    pub(crate) fn has_frame(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner
            .bitmap
            .as_ref()
            .map_or(false, |bitmap| inner.filled == bitmap.len())
    }

    /// Bytes received so far, for truncation diagnostics.
    pub(crate) fn bytes_written(&self) -> usize {
        self.inner.lock().unwrap().filled
    }

    /// The completed buffer, once; None while incomplete.
    pub(crate) fn take_bitmap(&self) -> Option<Bitmap> {
        let mut inner = self.inner.lock().unwrap();
        if inner.bitmap.as_ref().is_some_and(|b| inner.filled == b.len()) {
            inner.bitmap.take()
        } else {
            None
        }
    }
}

/// The consumer side of the chunk sink dropped its channel.
#[derive(Debug)]
pub(crate) struct ChannelClosed;

/// Reassembles full frames out of arbitrarily chunked pipe reads and
/// publishes each one to the bounded frame channel.
///
/// The publish is a synchronous blocking send on the pipe-reader thread:
/// a full channel stalls the reader, the reader stops draining the pipe,
/// and the decoder child blocks on its write. That is the whole
/// back-pressure path from the cache down to the child process.
pub(crate) struct ChunkSink {
    pool: BitmapPool,
    frames: mpsc::Sender<Frame>,
    path: Arc<PathBuf>,
    start_time: Ticks,
    frame_rate: f64,
    current: Option<Bitmap>,
    filled: usize,
    published: u64,
}

impl ChunkSink {
    pub(crate) fn new(
        pool: BitmapPool,
        frames: mpsc::Sender<Frame>,
        path: Arc<PathBuf>,
        start_time: Ticks,
        frame_rate: f64,
    ) -> ChunkSink {
        assert!(frame_rate > 0.0, "chunk sink needs an effective frame rate");
        ChunkSink {
            pool,
            frames,
            path,
            start_time,
            frame_rate,
            current: None,
            filled: 0,
            published: 0,
        }
    }

    pub(crate) fn frames_published(&self) -> u64 {
        self.published
    }

    pub(crate) fn write(&mut self, mut bytes: &[u8]) -> Result<(), ChannelClosed> {
        while !bytes.is_empty() {
            if self.current.is_none() {
                self.current = Some(self.pool.rent());
            }
            let bitmap = self.current.as_mut().unwrap();
            let n = bytes.len().min(bitmap.len() - self.filled);
            bitmap.data_mut()[self.filled..self.filled + n].copy_from_slice(&bytes[..n]);
            self.filled += n;
            bytes = &bytes[n..];
            if self.filled == bitmap.len() {
                self.publish()?;
            }
        }
        Ok(())
    }

    fn publish(&mut self) -> Result<(), ChannelClosed> {
        let bitmap = self.current.take().unwrap();
        self.filled = 0;
        let offset = Ticks::from_secs_f64(self.published as f64 / self.frame_rate);
        let time = self.start_time.saturating_add(offset);
        self.published += 1;
        let frame = Frame::new(self.path.clone(), time, bitmap);
        self.frames.blocking_send(frame).map_err(|_| ChannelClosed)
    }
}
