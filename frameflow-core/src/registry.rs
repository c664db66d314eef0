use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use tracing::debug;

use crate::{config::Options, error::Error, frame::Frame, session::VideoSession, time::Ticks};

/// One [`VideoSession`] per media path, created on first use.
pub struct FrameServer {
    options: Options,
    sessions: Mutex<HashMap<PathBuf, VideoSession>>,
}

impl FrameServer {
    pub fn new(options: Options) -> FrameServer {
        FrameServer {
            options,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get_frame(&self, path: &Path, at: Ticks) -> Result<Arc<Frame>, Error> {
        self.session(path).await?.frame_at(at).await
    }

    pub async fn get_frame_at_index(&self, path: &Path, index: u32) -> Result<Arc<Frame>, Error> {
        self.session(path).await?.frame_at_index(index).await
    }

    /// The session for `path`, opening one when none exists yet. A racing
    /// open of the same path keeps the first registered session; the loser
    /// is torn down again.
    pub async fn session(&self, path: &Path) -> Result<VideoSession, Error> {
        if let Some(session) = self.sessions.lock().unwrap().get(path) {
            return Ok(session.clone());
        }
        let fresh = VideoSession::open(path, self.options.clone()).await?;
        let raced = {
            let mut sessions = self.sessions.lock().unwrap();
            match sessions.get(path) {
                Some(existing) => Some(existing.clone()),
                None => {
                    sessions.insert(path.to_owned(), fresh.clone());
                    None
                }
            }
        };
        match raced {
            Some(existing) => {
                fresh.shutdown().await;
                Ok(existing)
            }
            None => Ok(fresh),
        }
    }

    /// Tears down every session.
    pub async fn shutdown(&self) {
        let sessions: Vec<VideoSession> = {
            let mut map = self.sessions.lock().unwrap();
            map.drain().map(|(_, session)| session).collect()
        };
        debug!(count = sessions.len(), "disposing all video sessions");
        for session in sessions {
            session.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        decoder::{fake::FakeDecoder, FRAME_CHANNEL_CAPACITY},
        pool::BitmapPool,
        probe::VideoMeta,
    };

    fn fake_session(path: &Path) -> VideoSession {
        let meta = VideoMeta {
            width: 8,
            height: 8,
            frame_rate: 25.0,
            duration: Ticks::from_secs_f64(10.0),
        };
        let capacity = 16;
        let pool = BitmapPool::new(meta.width, meta.height, capacity + FRAME_CHANNEL_CAPACITY + 4);
        let decoder = FakeDecoder::new(pool.clone(), &meta);
        VideoSession::assemble(
            Arc::new(path.to_owned()),
            meta,
            capacity,
            pool,
            Arc::new(decoder),
        )
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_registered_session_is_shared_and_disposed() {
        let server = FrameServer::new(Options::default());
        let path = PathBuf::from("clip.mp4");
        let session = fake_session(&path);
        server
            .sessions
            .lock()
            .unwrap()
            .insert(path.clone(), session.clone());

        let frame = server.get_frame(&path, Ticks::from_millis(200)).await.unwrap();
        assert!(frame.time() <= Ticks::from_millis(240));
        let frame = server.get_frame_at_index(&path, 5).await.unwrap();
        assert_eq!(frame.time(), Ticks::from_secs_f64(5.0 / 25.0));

        server.shutdown().await;
        assert!(server.sessions.lock().unwrap().is_empty());
        // The map dropped its handle and the session is disposed.
        assert!(matches!(
            session.frame_at(Ticks::ZERO).await,
            Err(Error::Disposed)
        ));
    }
}
