use std::sync::{
    atomic::{AtomicI64, Ordering::Relaxed},
    Arc, Mutex,
};

use tokio::{sync::Notify, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::{cache::FrameCache, decoder::Decode, signal::FrameSignal, time::Ticks};

/// `decoded_until` sentinel: nothing produced by this generation yet.
const UNDECODED: i64 = i64::MIN;

/// Long-lived decode task feeding the frame cache.
///
/// One persistent decoder child serves an arbitrarily long continuous
/// playback: the run loop publishes each frame, then parks on the demand
/// signal once it is far enough ahead of the last request. While parked it
/// stops draining the frame channel, the pipe thread blocks on its send,
/// and the child blocks on its pipe write. The child is never killed to
/// throttle it; it simply stalls.
///
/// Restart swaps in a new generation without awaiting the old one; the old
/// decoder tears down on a detached observer so callers never block on it.
#[derive(Clone)]
pub(crate) struct SequentialWorker {
    inner: Arc<WorkerInner>,
}

struct WorkerInner {
    decoder: Arc<dyn Decode>,
    cache: Arc<FrameCache>,
    signal: Arc<FrameSignal>,
    media_duration: Ticks,
    frame_duration: Ticks,
    /// Highest request time signalled by the coordinator, in ticks.
    demand: AtomicI64,
    /// Highest frame timestamp produced by the current generation.
    decoded_until: AtomicI64,
    decode_chunk: AtomicI64,
    look_ahead: AtomicI64,
    wake: Notify,
    lifecycle: Mutex<Lifecycle>,
}

#[derive(Default)]
struct Lifecycle {
    task: Option<JoinHandle<()>>,
    cancel: Option<CancellationToken>,
}

impl SequentialWorker {
    pub(crate) fn new(
        decoder: Arc<dyn Decode>,
        cache: Arc<FrameCache>,
        signal: Arc<FrameSignal>,
        media_duration: Ticks,
        frame_duration: Ticks,
        decode_chunk: Ticks,
        look_ahead: Ticks,
    ) -> SequentialWorker {
        SequentialWorker {
            inner: Arc::new(WorkerInner {
                decoder,
                cache,
                signal,
                media_duration,
                frame_duration,
                demand: AtomicI64::new(0),
                decoded_until: AtomicI64::new(UNDECODED),
                decode_chunk: AtomicI64::new(decode_chunk.get()),
                look_ahead: AtomicI64::new(look_ahead.get()),
                wake: Notify::new(),
                lifecycle: Mutex::new(Lifecycle::default()),
            }),
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.inner
            .lifecycle
            .lock()
            .unwrap()
            .task
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    pub(crate) fn decoded_until(&self) -> Option<Ticks> {
        match self.inner.decoded_until.load(Relaxed) {
            UNDECODED => None,
            ticks => Some(Ticks::from_ticks(ticks)),
        }
    }

    /// Starts a fresh generation decoding continuously from `start`. The
    /// previous generation is cancelled but *not* awaited here; its
    /// shutdown is observed on a detached task.
    pub(crate) fn ensure_started_at(&self, start: Ticks, session_cancel: &CancellationToken) {
        let previous = {
            let mut lifecycle = self.inner.lifecycle.lock().unwrap();
            let previous = std::mem::take(&mut *lifecycle);
            let cancel = session_cancel.child_token();
            self.inner.decoded_until.store(UNDECODED, Relaxed);
            self.inner.demand.store(start.get(), Relaxed);
            let task = tokio::spawn(run(self.inner.clone(), start, cancel.clone()));
            *lifecycle = Lifecycle {
                task: Some(task),
                cancel: Some(cancel),
            };
            previous
        };
        self.inner.wake.notify_one();

        if let Some(cancel) = previous.cancel {
            cancel.cancel();
        }
        if let Some(task) = previous.task {
            tokio::spawn(async move {
                // Cancellation-induced errors from the outgoing generation
                // are nobody's problem.
                let _ = task.await;
            });
        }
    }

    /// Advances the demand horizon; never regresses it.
    pub(crate) fn update_demand(&self, at: Ticks) {
        self.inner.demand.fetch_max(at.get(), Relaxed);
        self.inner.wake.notify_one();
    }

    /// Instructs new tuning. The look-ahead is kept at least one chunk and
    /// two frames wide so the run loop cannot starve itself.
    pub(crate) fn update_strategy(&self, decode_chunk: Ticks, look_ahead: Ticks) {
        let floor = decode_chunk.max(self.inner.frame_duration.saturating_mul(2));
        self.inner.decode_chunk.store(decode_chunk.get(), Relaxed);
        self.inner.look_ahead.store(look_ahead.max(floor).get(), Relaxed);
        self.inner.wake.notify_one();
    }

    pub(crate) fn strategy(&self) -> (Ticks, Ticks) {
        (
            Ticks::from_ticks(self.inner.decode_chunk.load(Relaxed)),
            Ticks::from_ticks(self.inner.look_ahead.load(Relaxed)),
        )
    }

    /// Cancels the current generation and awaits its completion.
    pub(crate) async fn stop(&self) {
        let Lifecycle { task, cancel } = std::mem::take(&mut *self.inner.lifecycle.lock().unwrap());
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

async fn run(inner: Arc<WorkerInner>, start: Ticks, cancel: CancellationToken) {
    let mut stream = match inner.decoder.start_stream(start, None) {
        Ok(stream) => stream,
        Err(e) => {
            error!(%e, start = %start, "failed to start sequential decoder");
            return;
        }
    };
    debug!(start = %start, "sequential worker started");
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = stream.next() => frame,
        };
        let Some(frame) = frame else {
            debug!("sequential decode stream ended");
            break;
        };
        let time = frame.time();
        if inner.cache.add(Arc::new(frame)) {
            inner.signal.notify();
        }
        // A duplicate just drops; its buffer goes back to the pool.
        inner.decoded_until.fetch_max(time.get(), Relaxed);

        while inner.should_wait_for_demand() {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = inner.wake.notified() => {}
            }
        }
    }
}

impl WorkerInner {
    /// True once this generation is a full look-ahead past the demand
    /// horizon. Clamped to the media duration so a worker near end of
    /// stream drains to EOF instead of parking on demand that can never
    /// rise.
    fn should_wait_for_demand(&self) -> bool {
        let decoded = self.decoded_until.load(Relaxed);
        if decoded == UNDECODED {
            return false;
        }
        let demand = Ticks::from_ticks(self.demand.load(Relaxed));
        let horizon = Ticks::from_ticks(
            self.look_ahead.load(Relaxed).max(self.decode_chunk.load(Relaxed)),
        );
        let threshold = demand.saturating_add(horizon).min(self.media_duration);
        Ticks::from_ticks(decoded) >= threshold
    }
}
