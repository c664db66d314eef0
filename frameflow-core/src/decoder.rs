use std::{
    ffi::OsString,
    io::Read,
    path::PathBuf,
    process::{Child, Command, Stdio},
    sync::{
        atomic::{AtomicBool, Ordering::Relaxed},
        Arc, Mutex,
    },
    thread,
};

use anyhow::{anyhow, bail, Context, Result};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::{
    config::{HwAccelApi, Options},
    frame::Frame,
    pool::BitmapPool,
    probe::VideoMeta,
    sink::{ChannelClosed, ChunkSink, SingleFrameSink},
    time::Ticks,
};

/// Capacity of the decoded-frame channel. Bounds pixel memory at the
/// decoder output: a full channel blocks the pipe-reader thread, which in
/// turn stalls the child process on its pipe write.
pub(crate) const FRAME_CHANNEL_CAPACITY: usize = 8;

const MIN_PIPE_READ: usize = 256 * 1024;
const MAX_PIPE_READ: usize = 8 * 1024 * 1024;

/// Contract over the external decoder process.
pub(crate) trait Decode: Send + Sync + 'static {
    /// Launches a decode of exactly one frame at `at`.
    fn start_single(&self, at: Ticks, cancel: &CancellationToken) -> PendingFrame;

    /// Launches a decode from `start` running for `max_len` of media time,
    /// or to end of stream when `max_len` is None. Exactly one child
    /// process per call; dropping the stream kills it.
    fn start_stream(&self, start: Ticks, max_len: Option<Ticks>) -> Result<FrameStream>;
}

/// Kill handle shared between the consumer and the pipe-reader thread.
/// `fire` is sticky so a retry attempt after cancellation is skipped.
#[derive(Clone, Default)]
pub(crate) struct KillSwitch {
    child: Arc<Mutex<Option<Child>>>,
    fired: Arc<AtomicBool>,
}

impl KillSwitch {
    fn arm(&self, child: Child) {
        let mut slot = self.child.lock().unwrap();
        let mut child = child;
        if self.fired.load(Relaxed) {
            // Lost the race against fire(); do not leave a live child behind.
            let _ = child.kill();
        }
        *slot = Some(child);
    }

    pub(crate) fn fire(&self) {
        self.fired.store(true, Relaxed);
        if let Some(child) = self.child.lock().unwrap().as_mut() {
            let _ = child.kill();
        }
    }

    fn fired(&self) -> bool {
        self.fired.load(Relaxed)
    }

    /// Reaps the child; the exit status, if it was still ours to collect.
    fn reap(&self) -> Option<std::process::ExitStatus> {
        let child = self.child.lock().unwrap().take();
        child.and_then(|mut child| child.wait().ok())
    }
}

/// A single-frame decode in flight on a pipe-reader thread.
pub(crate) struct PendingFrame {
    result: oneshot::Receiver<Result<Option<Frame>>>,
    kill: KillSwitch,
    cancel: CancellationToken,
}

impl PendingFrame {
    pub(crate) fn new(
        result: oneshot::Receiver<Result<Option<Frame>>>,
        kill: KillSwitch,
        cancel: CancellationToken,
    ) -> PendingFrame {
        PendingFrame { result, kill, cancel }
    }

    /// None on decode failure *or* cancellation; the caller decides which
    /// by consulting its own token.
    pub(crate) async fn wait(mut self) -> Result<Option<Frame>> {
        tokio::select! {
            _ = self.cancel.cancelled() => {
                self.kill.fire();
                Ok(None)
            }
            outcome = &mut self.result => match outcome {
                Ok(result) => result,
                Err(_) => Ok(None),
            },
        }
    }
}

/// Lazily consumed sequence of decoded frames backed by one child process.
pub(crate) struct FrameStream {
    frames: mpsc::Receiver<Frame>,
    kill: KillSwitch,
}

impl FrameStream {
    pub(crate) fn new(frames: mpsc::Receiver<Frame>, kill: KillSwitch) -> FrameStream {
        FrameStream { frames, kill }
    }

    /// Next frame in decode order; None once the stream ended (end of
    /// media, decoder failure, or kill).
    pub(crate) async fn next(&mut self) -> Option<Frame> {
        self.frames.recv().await
    }
}

impl Drop for FrameStream {
    fn drop(&mut self) {
        self.kill.fire();
        // Unblocks a pipe thread stuck in blocking_send; frames still
        // buffered in the channel drain their buffers back to the pool.
        self.frames.close();
    }
}

enum OutputSpan {
    Single,
    Length(Ticks),
    Continuous,
}

/// Drives the external `ffmpeg`-family binary. Cheap to clone; the input
/// geometry comes from the stream probe at session construction and never
/// changes.
#[derive(Clone)]
pub(crate) struct FfmpegDecoder {
    inner: Arc<DecoderInner>,
}

struct DecoderInner {
    binary: PathBuf,
    media: Arc<PathBuf>,
    meta: VideoMeta,
    pool: BitmapPool,
    hardware: Option<HwAccelApi>,
    /// Latched after a runtime hardware failure; later calls go straight
    /// to software.
    hardware_failed: AtomicBool,
    pipe_read_len: usize,
}

impl FfmpegDecoder {
    pub(crate) fn new(
        media: Arc<PathBuf>,
        meta: VideoMeta,
        pool: BitmapPool,
        options: &Options,
    ) -> FfmpegDecoder {
        FfmpegDecoder {
            inner: Arc::new(DecoderInner {
                binary: PathBuf::from("ffmpeg"),
                media,
                meta,
                pool,
                hardware: options.hardware_decode.then_some(options.hardware_decode_api),
                hardware_failed: AtomicBool::new(false),
                pipe_read_len: meta.frame_len().clamp(MIN_PIPE_READ, MAX_PIPE_READ),
            }),
        }
    }
}

impl Decode for FfmpegDecoder {
    fn start_single(&self, at: Ticks, cancel: &CancellationToken) -> PendingFrame {
        let (tx, rx) = oneshot::channel();
        let kill = KillSwitch::default();
        let inner = self.inner.clone();
        let thread_kill = kill.clone();
        thread::spawn(move || {
            let _ = tx.send(inner.run_single(at, &thread_kill));
        });
        PendingFrame::new(rx, kill, cancel.clone())
    }

    fn start_stream(&self, start: Ticks, max_len: Option<Ticks>) -> Result<FrameStream> {
        let (tx, rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
        let kill = KillSwitch::default();
        let inner = self.inner.clone();
        let thread_kill = kill.clone();
        thread::Builder::new()
            .name("frameflow-pipe".into())
            .spawn(move || inner.run_stream(tx, start, max_len, &thread_kill))
            .context("failed to spawn pipe-reader thread")?;
        Ok(FrameStream::new(rx, kill))
    }
}

impl DecoderInner {
    fn hardware_api(&self) -> Option<HwAccelApi> {
        self.hardware.filter(|_| !self.hardware_failed.load(Relaxed))
    }

    fn latch_software(&self, error: &anyhow::Error) {
        if !self.hardware_failed.swap(true, Relaxed) {
            warn!(%error, "hardware decode failed, falling back to software");
        }
    }

    fn args(&self, hardware: Option<HwAccelApi>, start: Ticks, span: &OutputSpan) -> Vec<OsString> {
        let mut args: Vec<OsString> = Vec::new();
        if let Some(api) = hardware {
            args.push("-hwaccel".into());
            args.push(api.as_arg().into());
        }
        // Input-side seek for fast keyframe-relative positioning.
        args.push("-ss".into());
        args.push(format!("{:.6}", start.as_secs_f64()).into());
        args.push("-i".into());
        args.push(self.media.as_os_str().to_owned());
        match span {
            OutputSpan::Single => {
                args.push("-frames:v".into());
                args.push("1".into());
            }
            OutputSpan::Length(length) => {
                args.push("-t".into());
                args.push(format!("{:.6}", length.as_secs_f64()).into());
            }
            OutputSpan::Continuous => {}
        }
        args.extend(
            ["-f", "rawvideo", "-preset", "ultrafast", "-pix_fmt", "bgra", "-an", "-sn", "-dn", "-"]
                .into_iter()
                .map(OsString::from),
        );
        args
    }

    fn spawn_child(
        &self,
        hardware: Option<HwAccelApi>,
        start: Ticks,
        span: &OutputSpan,
        kill: &KillSwitch,
    ) -> Result<std::process::ChildStdout> {
        let mut child = Command::new(&self.binary)
            .args(self.args(hardware, start, span))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("failed to launch {}", self.binary.display()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("decoder stdout not piped"))?;
        kill.arm(child);
        Ok(stdout)
    }

    fn wait_for_exit(&self, kill: &KillSwitch) -> Result<std::process::ExitStatus> {
        kill.reap()
            .ok_or_else(|| anyhow!("decoder child already reaped"))
    }

    /// One single-frame attempt: spawn, drain the pipe into the sink, reap.
    fn single_attempt(
        &self,
        hardware: Option<HwAccelApi>,
        at: Ticks,
        kill: &KillSwitch,
    ) -> Result<Frame> {
        let mut stdout = self.spawn_child(hardware, at, &OutputSpan::Single, kill)?;
        let sink = SingleFrameSink::new(&self.pool);
        let mut buf = vec![0; self.pipe_read_len];
        loop {
            match stdout.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => sink.write(&buf[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => {
                    let _ = kill.reap();
                    return Err(e).context("decoder pipe read failed");
                }
            }
        }
        let status = self.wait_for_exit(kill)?;
        if !status.success() {
            bail!("decoder exited with {status}");
        }
        match sink.take_bitmap() {
            Some(bitmap) => Ok(Frame::new(self.media.clone(), at, bitmap)),
            None => bail!(
                "truncated frame: {} of {} bytes",
                sink.bytes_written(),
                self.pool.frame_len()
            ),
        }
    }

    fn run_single(&self, at: Ticks, kill: &KillSwitch) -> Result<Option<Frame>> {
        let hardware = self.hardware_api();
        match self.single_attempt(hardware, at, kill) {
            Ok(frame) => Ok(Some(frame)),
            Err(_) if kill.fired() => Ok(None),
            Err(e) if hardware.is_some() => {
                self.latch_software(&e);
                self.single_attempt(None, at, kill).map(Some)
            }
            Err(e) => Err(e),
        }
    }

    /// One streaming attempt. Frames published before a failure stay
    /// published.
    fn stream_attempt(
        &self,
        hardware: Option<HwAccelApi>,
        frames: &mpsc::Sender<Frame>,
        start: Ticks,
        max_len: Option<Ticks>,
        kill: &KillSwitch,
    ) -> Result<u64> {
        let span = match max_len {
            Some(length) => OutputSpan::Length(length),
            None => OutputSpan::Continuous,
        };
        let mut stdout = self.spawn_child(hardware, start, &span, kill)?;
        let mut sink = ChunkSink::new(
            self.pool.clone(),
            frames.clone(),
            self.media.clone(),
            start,
            self.meta.effective_frame_rate(),
        );
        let mut buf = vec![0; self.pipe_read_len];
        loop {
            match stdout.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if let Err(ChannelClosed) = sink.write(&buf[..n]) {
                        // Consumer gone; tear the child down quietly.
                        kill.fire();
                        let _ = kill.reap();
                        return Ok(sink.frames_published());
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => {
                    let _ = kill.reap();
                    return Err(e).context("decoder pipe read failed");
                }
            }
        }
        let published = sink.frames_published();
        let status = self.wait_for_exit(kill)?;
        if !status.success() && published == 0 {
            bail!("decoder exited with {status} before producing a frame");
        }
        if !status.success() {
            debug!(%status, published, "decoder exited mid-stream");
        }
        Ok(published)
    }

    fn run_stream(
        &self,
        frames: mpsc::Sender<Frame>,
        start: Ticks,
        max_len: Option<Ticks>,
        kill: &KillSwitch,
    ) {
        let hardware = self.hardware_api();
        let outcome = match self.stream_attempt(hardware, &frames, start, max_len, kill) {
            Err(e) if !kill.fired() && hardware.is_some() => {
                self.latch_software(&e);
                self.stream_attempt(None, &frames, start, max_len, kill)
            }
            outcome => outcome,
        };
        match outcome {
            Ok(published) => debug!(published, start = %start, "decode stream finished"),
            Err(e) if kill.fired() => debug!(%e, "decode stream cancelled"),
            Err(e) => error!(%e, start = %start, "decode stream failed"),
        }
    }
}

/// Scripted in-process decoder for worker/session tests: produces frames
/// on the session cadence without any child process and counts how many
/// times each entry point ran.
#[cfg(test)]
pub(crate) mod fake {
    use std::{sync::atomic::AtomicUsize, time::Duration};

    use super::*;

    #[derive(Clone)]
    pub(crate) struct FakeDecoder {
        pool: BitmapPool,
        media: Arc<PathBuf>,
        frame_rate: f64,
        duration: Ticks,
        /// Wall-clock pacing per streamed frame.
        pub frame_delay: Duration,
        /// The next N single-frame decodes report failure.
        pub fail_singles: Arc<AtomicUsize>,
        pub streams_started: Arc<AtomicUsize>,
        pub singles_started: Arc<AtomicUsize>,
    }

    impl FakeDecoder {
        pub(crate) fn new(pool: BitmapPool, meta: &VideoMeta) -> FakeDecoder {
            FakeDecoder {
                pool,
                media: Arc::new(PathBuf::from("fake.mp4")),
                frame_rate: meta.effective_frame_rate(),
                duration: meta.duration,
                frame_delay: Duration::ZERO,
                fail_singles: Arc::new(AtomicUsize::new(0)),
                streams_started: Arc::new(AtomicUsize::new(0)),
                singles_started: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn frame_at(&self, time: Ticks) -> Frame {
            Frame::new(self.media.clone(), time, self.pool.rent())
        }
    }

    impl Decode for FakeDecoder {
        fn start_single(&self, at: Ticks, cancel: &CancellationToken) -> PendingFrame {
            self.singles_started.fetch_add(1, Relaxed);
            let (tx, rx) = oneshot::channel();
            let fail = self
                .fail_singles
                .fetch_update(Relaxed, Relaxed, |n| n.checked_sub(1))
                .is_ok();
            let result = if fail {
                Ok(None)
            } else {
                Ok(Some(self.frame_at(at)))
            };
            let _ = tx.send(result);
            PendingFrame::new(rx, KillSwitch::default(), cancel.clone())
        }

        fn start_stream(&self, start: Ticks, max_len: Option<Ticks>) -> Result<FrameStream> {
            self.streams_started.fetch_add(1, Relaxed);
            let (tx, rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
            let end = match max_len {
                Some(length) => start.saturating_add(length).min(self.duration),
                None => self.duration,
            };
            let decoder = self.clone();
            tokio::spawn(async move {
                for index in 0.. {
                    let offset = Ticks::from_secs_f64(index as f64 / decoder.frame_rate);
                    let time = start.saturating_add(offset);
                    if time >= end {
                        break;
                    }
                    if !decoder.frame_delay.is_zero() {
                        tokio::time::sleep(decoder.frame_delay).await;
                    }
                    if tx.send(decoder.frame_at(time)).await.is_err() {
                        break;
                    }
                }
            });
            Ok(FrameStream::new(rx, KillSwitch::default()))
        }
    }
}
