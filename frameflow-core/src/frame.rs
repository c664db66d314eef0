use std::{fmt, path::{Path, PathBuf}, sync::Arc};

use crate::{pool::Bitmap, time::Ticks};

/// A single decoded picture: source path, timestamp and a pooled BGRA
/// buffer (premultiplied alpha, tightly packed `width·4`-byte rows).
///
/// The pixel buffer goes back to its pool when the last owner of the frame
/// drops it, whether that is the cache evicting the entry or the host
/// letting go of a returned frame.
pub struct Frame {
    path: Arc<PathBuf>,
    time: Ticks,
    bitmap: Bitmap,
}

impl Frame {
    pub(crate) fn new(path: Arc<PathBuf>, time: Ticks, bitmap: Bitmap) -> Frame {
        Frame { path, time, bitmap }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn time(&self) -> Ticks {
        self.time
    }

    pub fn data(&self) -> &[u8] {
        self.bitmap.data()
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("path", &self.path)
            .field("time", &self.time)
            .field("len", &self.bitmap.len())
            .finish()
    }
}
