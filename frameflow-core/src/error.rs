use std::path::PathBuf;

use thiserror::Error;

use crate::time::Ticks;

#[derive(Debug, Error)]
pub enum Error {
    #[error("no video stream found in {0}")]
    NoVideoStream(PathBuf),

    #[error("failed to probe {path}")]
    ProbeFailed {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to decode frame of {path} at {at}")]
    DecodeFailed { path: PathBuf, at: Ticks },

    #[error("frame rate of {0} is unknown, frames cannot be addressed by index")]
    UnknownFrameRate(PathBuf),

    #[error("video session disposed")]
    Disposed,

    #[error("operation cancelled")]
    Cancelled,
}
