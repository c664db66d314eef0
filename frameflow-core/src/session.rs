use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering::SeqCst},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::{
    cache::FrameCache,
    config::Options,
    decoder::{Decode, FfmpegDecoder, FRAME_CHANNEL_CAPACITY},
    error::Error,
    frame::Frame,
    pool::BitmapPool,
    probe,
    probe::VideoMeta,
    signal::FrameSignal,
    time::{self, Ticks},
    worker::SequentialWorker,
};

/// Media-time gap up to which a request still counts as sequential:
/// `max(10 · frame_duration, 500 ms)`.
const SEQUENTIAL_WINDOW_FLOOR: Ticks = Ticks::from_millis(500);
const SEQUENTIAL_WINDOW_FRAMES: i64 = 10;

/// A forward gap beyond the sequential window but under this limit is a
/// catchup: restarting the worker there beats a single-shot decode.
const CATCHUP_LIMIT: Ticks = Ticks::from_millis(2500);
const CATCHUP_WAIT: Duration = Duration::from_millis(120);

const SEQUENTIAL_WAIT: Duration = Duration::from_millis(45);
/// Wider wait while recovering from a recent fallback streak.
const RECOVERY_WAIT: Duration = Duration::from_millis(120);
/// Consecutive sequential fallbacks that force a worker restart.
const FALLBACK_RESTART_STREAK: u32 = 2;

/// Attempts to resolve add/lookup races on the single-frame path.
const SINGLE_DECODE_ATTEMPTS: u32 = 3;

const SPEED_EMA_ALPHA: f64 = 0.25;
const SPEED_MIN: f64 = 0.35;
const SPEED_MAX: f64 = 4.0;
/// Media-time jumps past this reset the estimate outright.
const SPEED_RESET_DELTA: Ticks = Ticks::from_millis(4000);
const SPEED_WALL_WINDOW: Duration = Duration::from_millis(1200);

/// Headroom below 8 frames grows the horizon, above 1.4× the current
/// target it shrinks.
const HEADROOM_GROW_FRAMES: i64 = 8;
const HEADROOM_SHRINK_RATIO: f64 = 1.4;
const LOOK_AHEAD_GROW: f64 = 1.45;
const CHUNK_GROW: f64 = 1.18;
const HORIZON_SHRINK: f64 = 0.85;
/// Tuning drifts under this are not worth re-instructing the worker.
const STRATEGY_EPSILON: Ticks = Ticks::from_millis(18);

const WORKER_STOP_PATIENCE: Duration = Duration::from_secs(2);

/// Look-ahead/chunk bands derived from the cache capacity.
#[derive(Debug, Clone, Copy)]
struct StrategyBands {
    look_min: Ticks,
    look_max: Ticks,
    chunk_min: Ticks,
    chunk_max: Ticks,
}

fn strategy_bands(frame_duration: Ticks, cache_capacity: usize) -> StrategyBands {
    let n = cache_capacity as f64;
    let lo_frames = (0.18 * n).clamp(8.0, 72.0);
    let hi_frames = (0.9 * n).clamp(30.0, 220.0);
    let look_min = frame_duration.saturating_mul_f64(lo_frames);
    let look_max = frame_duration.saturating_mul_f64(hi_frames).max(look_min);
    StrategyBands {
        look_min,
        look_max,
        chunk_min: frame_duration.saturating_mul_f64(lo_frames / 2.0),
        chunk_max: frame_duration.saturating_mul_f64(hi_frames / 2.0),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestKind {
    Seek,
    Sequential,
}

#[derive(Debug, Clone, Copy)]
struct Motion {
    kind: RequestKind,
    /// Media-time delta against the previous request; zero on the first.
    delta: Ticks,
    has_signal: bool,
}

/// Coordinator state under the session state lock. Critical sections stay
/// narrow and never block on I/O.
struct PlaybackState {
    last_request: Option<(Ticks, Instant)>,
    worker_target: Option<Ticks>,
    worker_needs_restart: bool,
    smoothed_speed: Option<f64>,
    last_delta: Ticks,
    last_has_signal: bool,
    decode_chunk: Ticks,
    look_ahead: Ticks,
    fallback_streak: u32,
}

/// One frame-access session per video file.
///
/// The hot path is [`frame_at`](Self::frame_at): it classifies the request
/// against the previous one, serves from the cache when possible, keeps
/// one persistent sequential decoder fed during playback, and falls back
/// to single-shot decodes when the worker cannot keep up. Cheap to clone;
/// all clones share one session.
#[derive(Clone)]
pub struct VideoSession {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    path: Arc<PathBuf>,
    meta: VideoMeta,
    frame_duration: Ticks,
    seek_tolerance: Ticks,
    sequential_window: Ticks,
    bands: StrategyBands,
    cache: Arc<FrameCache>,
    pool: BitmapPool,
    decoder: Arc<dyn Decode>,
    worker: SequentialWorker,
    signal: Arc<FrameSignal>,
    state: Mutex<PlaybackState>,
    cancel: CancellationToken,
    disposed: AtomicBool,
}

impl VideoSession {
    /// Probes the stream and assembles a session around it. The sequential
    /// worker starts lazily on first use.
    pub async fn open(path: impl Into<PathBuf>, options: Options) -> Result<VideoSession, Error> {
        let path = Arc::new(path.into());
        let meta = probe::probe(&path).await?;
        let capacity = options.cache_capacity(meta.width, meta.height);
        let pool = BitmapPool::new(
            meta.width,
            meta.height,
            capacity + FRAME_CHANNEL_CAPACITY + 4,
        );
        let decoder: Arc<dyn Decode> = Arc::new(FfmpegDecoder::new(
            path.clone(),
            meta,
            pool.clone(),
            &options,
        ));
        debug!(path = %path.display(), ?meta, capacity, "opened video session");
        Ok(Self::assemble(path, meta, capacity, pool, decoder))
    }

    pub(crate) fn assemble(
        path: Arc<PathBuf>,
        meta: VideoMeta,
        cache_capacity: usize,
        pool: BitmapPool,
        decoder: Arc<dyn Decode>,
    ) -> VideoSession {
        let frame_duration = meta.frame_duration();
        let bands = strategy_bands(frame_duration, cache_capacity);
        let cache = Arc::new(FrameCache::new(
            time::quantum_for(frame_duration),
            cache_capacity,
        ));
        let signal = Arc::new(FrameSignal::new());
        let worker = SequentialWorker::new(
            decoder.clone(),
            cache.clone(),
            signal.clone(),
            meta.duration,
            frame_duration,
            bands.chunk_min,
            bands.look_min,
        );
        VideoSession {
            inner: Arc::new(SessionInner {
                path,
                meta,
                frame_duration,
                seek_tolerance: time::seek_tolerance(frame_duration),
                sequential_window: frame_duration
                    .saturating_mul(SEQUENTIAL_WINDOW_FRAMES)
                    .max(SEQUENTIAL_WINDOW_FLOOR),
                bands,
                cache,
                pool,
                decoder,
                worker,
                signal,
                state: Mutex::new(PlaybackState {
                    last_request: None,
                    worker_target: None,
                    worker_needs_restart: false,
                    smoothed_speed: None,
                    last_delta: Ticks::ZERO,
                    last_has_signal: false,
                    decode_chunk: bands.chunk_min,
                    look_ahead: bands.look_min,
                    fallback_streak: 0,
                }),
                cancel: CancellationToken::new(),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn metadata(&self) -> VideoMeta {
        self.inner.meta
    }

    /// The frame whose timestamp is within the seek tolerance of `at`.
    #[instrument(level = "trace", skip(self), err)]
    pub async fn frame_at(&self, at: Ticks) -> Result<Arc<Frame>, Error> {
        self.inner.frame_at(at).await
    }

    /// Frame by index, `index / frame_rate`; requires a probed frame rate.
    pub async fn frame_at_index(&self, index: u32) -> Result<Arc<Frame>, Error> {
        if self.inner.meta.frame_rate <= 0.0 {
            return Err(Error::UnknownFrameRate(self.inner.path.as_ref().clone()));
        }
        let at = Ticks::from_secs_f64(index as f64 / self.inner.meta.frame_rate);
        self.inner.frame_at(at).await
    }

    /// Idempotent teardown: cancels in-flight work, stops the worker with
    /// bounded patience and drains the cache back into the pool.
    pub async fn shutdown(&self) {
        if self.inner.disposed.swap(true, SeqCst) {
            return;
        }
        self.inner.cancel.cancel();
        if tokio::time::timeout(WORKER_STOP_PATIENCE, self.inner.worker.stop())
            .await
            .is_err()
        {
            warn!(path = %self.inner.path.display(), "sequential worker outlived its stop patience");
        }
        self.inner.cache.dispose();
        debug!(
            path = %self.inner.path.display(),
            buffers_idle = self.inner.pool.idle(),
            "video session disposed"
        );
    }

    #[cfg(test)]
    pub(crate) fn fallback_streak(&self) -> u32 {
        self.inner.state.lock().unwrap().fallback_streak
    }

    #[cfg(test)]
    pub(crate) fn worker(&self) -> &SequentialWorker {
        &self.inner.worker
    }
}

impl SessionInner {
    fn ensure_live(&self) -> Result<(), Error> {
        if self.disposed.load(SeqCst) {
            return Err(Error::Disposed);
        }
        Ok(())
    }

    async fn frame_at(&self, requested: Ticks) -> Result<Arc<Frame>, Error> {
        self.ensure_live()?;
        let upper = (self.meta.duration - self.frame_duration).max(Ticks::ZERO);
        let target = requested.clamp(Ticks::ZERO, upper);

        let motion = {
            let mut state = self.state.lock().unwrap();
            self.observe_request(&mut state, target)
        };

        if let Some(frame) = self.cache.try_get(target, self.seek_tolerance) {
            {
                let mut state = self.state.lock().unwrap();
                state.fallback_streak = 0;
                if motion.kind == RequestKind::Seek {
                    state.worker_needs_restart = true;
                    state.smoothed_speed = None;
                }
            }
            if motion.kind == RequestKind::Sequential {
                self.ensure_worker_ready(target);
            }
            self.finish_request(target);
            return Ok(frame);
        }

        let frame = match motion.kind {
            RequestKind::Seek => self.serve_seek(target, &motion).await?,
            RequestKind::Sequential => self.serve_sequential(target).await?,
        };
        self.finish_request(target);
        Ok(frame)
    }

    /// Steps 1–2 of the request algorithm: classify against the previous
    /// request and fold the instantaneous speed into the estimate.
    fn observe_request(&self, state: &mut PlaybackState, target: Ticks) -> Motion {
        let now = Instant::now();
        let Some((last_time, last_at)) = state.last_request else {
            state.last_delta = Ticks::ZERO;
            state.last_has_signal = false;
            return Motion {
                kind: RequestKind::Seek,
                delta: Ticks::ZERO,
                has_signal: false,
            };
        };
        let delta = target - last_time;
        let kind = if delta >= Ticks::ZERO && delta <= self.sequential_window {
            RequestKind::Sequential
        } else {
            RequestKind::Seek
        };
        let has_signal = update_speed_estimate(state, delta, now - last_at);
        Motion {
            kind,
            delta,
            has_signal,
        }
    }

    async fn serve_seek(&self, target: Ticks, motion: &Motion) -> Result<Arc<Frame>, Error> {
        if motion.delta > self.sequential_window && motion.delta <= CATCHUP_LIMIT {
            // Close enough ahead that restarting the worker there and
            // letting it fill the cache beats a one-shot decode.
            self.state.lock().unwrap().worker_needs_restart = true;
            self.ensure_worker_ready(target);
            if let Some(frame) = self.wait_for_cached_frame(target, CATCHUP_WAIT).await? {
                return Ok(frame);
            }
            debug!(at = %target, "catchup window expired, taking the single-frame path");
        }

        let frame = self.decode_single_and_cache(target).await?;
        self.state.lock().unwrap().worker_needs_restart = true;
        // Prime the worker at the new position so an immediate
        // play-from-here starts against a warm decoder.
        self.ensure_worker_ready(target);
        Ok(frame)
    }

    async fn serve_sequential(&self, target: Ticks) -> Result<Arc<Frame>, Error> {
        self.ensure_worker_ready(target);
        let recovering = self.state.lock().unwrap().fallback_streak > 0;
        let wait = if recovering { RECOVERY_WAIT } else { SEQUENTIAL_WAIT };
        if let Some(frame) = self.wait_for_cached_frame(target, wait).await? {
            self.state.lock().unwrap().fallback_streak = 0;
            return Ok(frame);
        }

        let streak = {
            let mut state = self.state.lock().unwrap();
            state.fallback_streak += 1;
            state.fallback_streak
        };
        debug!(streak, at = %target, "sequential miss, falling back to single-frame decode");
        let frame = self.decode_single_and_cache(target).await?;
        if streak >= FALLBACK_RESTART_STREAK {
            {
                let mut state = self.state.lock().unwrap();
                state.worker_needs_restart = true;
                state.fallback_streak = 0;
            }
            self.ensure_worker_ready(target);
        } else {
            self.worker.update_demand(target);
        }
        Ok(frame)
    }

    /// Bounded wait for the worker (or a racing single-frame decode) to
    /// land a matching cache entry. None on timeout — flow control, not an
    /// error.
    async fn wait_for_cached_frame(
        &self,
        target: Ticks,
        wait: Duration,
    ) -> Result<Option<Arc<Frame>>, Error> {
        let deadline = Instant::now() + wait;
        let _waiter = self.signal.register();
        loop {
            if let Some(frame) = self.cache.try_get(target, self.seek_tolerance) {
                return Ok(Some(frame));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(deadline - now) => {}
                _ = self.signal.acquire() => {}
            }
        }
    }

    /// Single-shot decode, inserted into the cache. Retries both decode
    /// failures and the add/lookup race where a concurrent producer owns
    /// the bin.
    async fn decode_single_and_cache(&self, target: Ticks) -> Result<Arc<Frame>, Error> {
        for _ in 0..SINGLE_DECODE_ATTEMPTS {
            self.ensure_live()?;
            let pending = self.decoder.start_single(target, &self.cancel);
            match pending.wait().await {
                Ok(Some(frame)) => {
                    let frame = Arc::new(frame);
                    if self.cache.add(frame.clone()) {
                        self.signal.notify();
                        return Ok(frame);
                    }
                    // Lost the insert race; serve the cached copy and let
                    // ours drain back into the pool.
                    if let Some(existing) = self.cache.try_get(target, self.seek_tolerance) {
                        return Ok(existing);
                    }
                    // The winning entry was evicted in between; try again.
                }
                Ok(None) => {
                    if self.cancel.is_cancelled() {
                        return Err(Error::Cancelled);
                    }
                    warn!(at = %target, "single-frame decode produced nothing");
                }
                Err(e) => warn!(%e, at = %target, "single-frame decode failed"),
            }
        }
        self.ensure_live()?;
        Err(Error::DecodeFailed {
            path: self.path.as_ref().clone(),
            at: target,
        })
    }

    /// Retunes the worker and (re)starts it when the restart predicate
    /// holds. A running worker with a valid target is left alone even when
    /// the request ran ahead of `decoded_until`.
    fn ensure_worker_ready(&self, at: Ticks) {
        self.apply_adaptive_strategy(at);
        let restart = {
            let mut state = self.state.lock().unwrap();
            let restart = state.worker_needs_restart
                || state.worker_target.is_none()
                || !self.worker.is_running();
            if restart {
                state.worker_needs_restart = false;
                state.worker_target = Some(at);
            } else {
                state.worker_target = Some(state.worker_target.unwrap_or(at).max(at));
            }
            restart
        };
        if restart {
            debug!(at = %at, "restarting sequential worker");
            self.worker.ensure_started_at(at, &self.cancel);
        } else {
            self.worker.update_demand(at);
        }
    }

    /// Adapts look-ahead and chunk length to the current headroom and the
    /// smoothed playback speed, then instructs the worker when the result
    /// drifted far enough from what it was last told.
    fn apply_adaptive_strategy(&self, at: Ticks) {
        let decoded_until = self.worker.decoded_until();
        let mut state = self.state.lock().unwrap();

        let mut speed = state
            .smoothed_speed
            .unwrap_or(1.0)
            .abs()
            .clamp(SPEED_MIN, SPEED_MAX);
        if state.last_has_signal && state.last_delta < Ticks::ZERO {
            speed = SPEED_MIN;
        }

        let headroom = decoded_until
            .map(|decoded| (decoded - at).max(Ticks::ZERO))
            .unwrap_or(Ticks::ZERO);

        let mut look_ahead = state.look_ahead;
        let mut chunk = state.decode_chunk;
        if headroom <= self.frame_duration.saturating_mul(HEADROOM_GROW_FRAMES) {
            look_ahead = look_ahead.saturating_mul_f64(LOOK_AHEAD_GROW);
            chunk = chunk.saturating_mul_f64(CHUNK_GROW);
        } else if headroom >= state.look_ahead.saturating_mul_f64(HEADROOM_SHRINK_RATIO) {
            look_ahead = look_ahead.saturating_mul_f64(HORIZON_SHRINK);
            chunk = chunk.saturating_mul_f64(HORIZON_SHRINK);
        }

        // The speed scales the floor of the horizon: playing at 2× needs
        // twice the buffered media time for the same wall-clock cover.
        let bands = &self.bands;
        look_ahead = look_ahead
            .max(bands.look_min.saturating_mul_f64(speed))
            .clamp(bands.look_min, bands.look_max);
        chunk = chunk
            .max(bands.chunk_min.saturating_mul_f64(speed))
            .clamp(bands.chunk_min, bands.chunk_max);

        let drift = look_ahead
            .abs_diff(state.look_ahead)
            .max(chunk.abs_diff(state.decode_chunk));
        if drift >= STRATEGY_EPSILON {
            state.look_ahead = look_ahead;
            state.decode_chunk = chunk;
            drop(state);
            self.worker.update_strategy(chunk, look_ahead);
        }
    }

    fn finish_request(&self, target: Ticks) {
        let mut state = self.state.lock().unwrap();
        state.last_request = Some((target, Instant::now()));
    }
}

/// Folds one observation into the speed EMA and reports whether it was a
/// usable signal. The estimate only moves when both deltas are inside
/// plausible windows; a wild media jump resets it outright.
fn update_speed_estimate(state: &mut PlaybackState, delta: Ticks, wall: Duration) -> bool {
    let mut has_signal = false;
    if delta.abs() > SPEED_RESET_DELTA {
        state.smoothed_speed = Some(1.0);
    } else if wall > Duration::ZERO && wall <= SPEED_WALL_WINDOW {
        let instantaneous =
            (delta.as_secs_f64() / wall.as_secs_f64()).clamp(-2.0 * SPEED_MAX, 2.0 * SPEED_MAX);
        let smoothed = state.smoothed_speed.unwrap_or(1.0);
        state.smoothed_speed =
            Some(smoothed * (1.0 - SPEED_EMA_ALPHA) + instantaneous * SPEED_EMA_ALPHA);
        has_signal = true;
    }
    state.last_delta = delta;
    state.last_has_signal = has_signal;
    has_signal
}
