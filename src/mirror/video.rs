use std::io::{BufRead, BufReader, Read, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::adb::directory::DeviceDirectory;
use crate::adb::env::{expand_home, normalize_command_path};
use crate::adb::runner::run_command_with_timeout;
use crate::adb::screenshot::ScreenshotGrabber;
use crate::adb::scrcpy::{offscreen_window_title, raw_stream_args, window_capture_args};
use crate::config::{MirrorSettings, ScrcpySettings};
use crate::mirror::frame::{MirrorFrame, PngStreamSplitter};
use crate::mirror::sleep_with_stop;
use crate::models::ScrcpyInfo;

const DECODER_PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const FRAME_QUEUE_DEPTH: usize = 2;
const RECV_SLICE: Duration = Duration::from_millis(250);
const POLL_ERROR_BACKOFF: Duration = Duration::from_millis(500);
const WINDOW_SETTLE: Duration = Duration::from_millis(800);

/// The video stages, best first. A session starts at the highest stage it can
/// build and only ever moves down this list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoMode {
    RawStream,
    WindowCapture,
    Polling,
}

impl VideoMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            VideoMode::RawStream => "raw-stream",
            VideoMode::WindowCapture => "window-capture",
            VideoMode::Polling => "polling",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            VideoMode::RawStream => "Raw stream",
            VideoMode::WindowCapture => "Window capture",
            VideoMode::Polling => "Screenshot polling",
        }
    }

    pub fn next_stage(self) -> Option<VideoMode> {
        match self {
            VideoMode::RawStream => Some(VideoMode::WindowCapture),
            VideoMode::WindowCapture => Some(VideoMode::Polling),
            VideoMode::Polling => None,
        }
    }
}

/// One running video backend. `next_frame` blocks up to the grace window;
/// `None` from a non-polling source means it has gone silent.
pub trait VideoSource: Send {
    fn mode(&self) -> VideoMode;
    fn next_frame(&mut self, grace: Duration) -> Option<MirrorFrame>;
    fn stop(&mut self);
}

/// Locates a usable ffmpeg binary the same way scrcpy is located: environment
/// overrides first, then PATH, then the usual install locations.
pub fn detect_ffmpeg() -> Option<String> {
    let mut candidates: Vec<String> = Vec::new();
    for var in ["DROIDGLASS_FFMPEG", "FFMPEG"] {
        if let Ok(value) = std::env::var(var) {
            let trimmed = normalize_command_path(&value);
            if !trimmed.is_empty() {
                candidates.push(expand_home(&trimmed));
            }
        }
    }
    candidates.push("ffmpeg".to_string());

    let system = std::env::consts::OS;
    let common_paths = if system == "macos" {
        vec!["/opt/homebrew/bin/ffmpeg", "/usr/local/bin/ffmpeg"]
    } else if system == "windows" {
        vec![
            "C:\\ffmpeg\\bin\\ffmpeg.exe",
            "C:\\Program Files\\ffmpeg\\bin\\ffmpeg.exe",
        ]
    } else {
        vec![
            "/usr/bin/ffmpeg",
            "/usr/local/bin/ffmpeg",
            "/snap/bin/ffmpeg",
            "~/.local/bin/ffmpeg",
        ]
    };
    for path in common_paths {
        let expanded = expand_home(path);
        if Path::new(&expanded).exists() {
            candidates.push(expanded);
        }
    }

    candidates.into_iter().find(|candidate| decoder_answers(candidate))
}

fn decoder_answers(command: &str) -> bool {
    let output = run_command_with_timeout(command, &["-version".to_string()], DECODER_PROBE_TIMEOUT);
    output.success() && output.stdout.to_lowercase().contains("ffmpeg")
}

/// Everything needed to build any video stage for one device.
pub struct VideoChain {
    pub serial: String,
    pub scrcpy: ScrcpyInfo,
    pub ffmpeg: Option<String>,
    pub scrcpy_settings: ScrcpySettings,
    pub mirror: MirrorSettings,
    pub display: Option<String>,
    pub grabber: Arc<ScreenshotGrabber>,
    pub directory: Arc<DeviceDirectory>,
    pub stop: Arc<AtomicBool>,
}

impl VideoChain {
    pub fn build(&self, mode: VideoMode) -> Result<Box<dyn VideoSource>, String> {
        match mode {
            VideoMode::RawStream => {
                if !self.scrcpy.available {
                    return Err("scrcpy is not available".to_string());
                }
                let decoder = self
                    .ffmpeg
                    .as_deref()
                    .ok_or_else(|| "no stream decoder (ffmpeg) found".to_string())?;
                RawStreamSource::start(self, decoder)
                    .map(|source| Box::new(source) as Box<dyn VideoSource>)
            }
            VideoMode::WindowCapture => {
                if std::env::consts::OS != "windows" {
                    return Err(
                        "window capture uses the gdigrab desktop backend, only wired up on Windows"
                            .to_string(),
                    );
                }
                if !self.scrcpy.available {
                    return Err("scrcpy is not available".to_string());
                }
                let decoder = self
                    .ffmpeg
                    .as_deref()
                    .ok_or_else(|| "no desktop grabber (ffmpeg) found".to_string())?;
                WindowCaptureSource::start(self, decoder)
                    .map(|source| Box::new(source) as Box<dyn VideoSource>)
            }
            VideoMode::Polling => Ok(Box::new(PollingSource::new(self))),
        }
    }

    /// Walks down the stage list from `from` and returns the first stage that
    /// starts. Polling has no external requirements, so this always succeeds.
    pub fn first_available(&self, from: VideoMode) -> (VideoMode, Box<dyn VideoSource>) {
        let mut mode = from;
        loop {
            match self.build(mode) {
                Ok(source) => return (mode, source),
                Err(reason) => {
                    warn!(
                        serial = %self.serial,
                        stage = mode.as_str(),
                        reason = %reason,
                        "video stage unavailable, falling back"
                    );
                    match mode.next_stage() {
                        Some(next) => mode = next,
                        None => {
                            return (VideoMode::Polling, Box::new(PollingSource::new(self)))
                        }
                    }
                }
            }
        }
    }
}

fn image_pipe_to_stdout(args: &mut Vec<String>) {
    for part in ["-f", "image2pipe", "-codec:v", "png", "-"] {
        args.push(part.to_string());
    }
}

/// Pulls frames off a bounded channel in short slices so a stop request is
/// honored well inside the grace window.
fn recv_frame(
    receiver: &Receiver<MirrorFrame>,
    stop: &AtomicBool,
    grace: Duration,
) -> Option<MirrorFrame> {
    let deadline = Instant::now() + grace;
    loop {
        if stop.load(Ordering::Relaxed) {
            return None;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return None;
        }
        match receiver.recv_timeout(remaining.min(RECV_SLICE)) {
            Ok(frame) => return Some(frame),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => return None,
        }
    }
}

/// Reads a PNG image stream off a child's stdout and turns complete images
/// into frames. When the consumer lags the newest frame is dropped; the queue
/// stays shallow so the picture never runs far behind the device.
fn spawn_frame_reader(mut source: ChildStdout) -> (Receiver<MirrorFrame>, JoinHandle<()>) {
    let (sender, receiver) = mpsc::sync_channel::<MirrorFrame>(FRAME_QUEUE_DEPTH);
    let handle = thread::spawn(move || {
        let mut splitter = PngStreamSplitter::new();
        let mut buf = [0u8; 8192];
        loop {
            match source.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    for image in splitter.push(&buf[..n]) {
                        let Some(frame) = MirrorFrame::from_png(image) else {
                            continue;
                        };
                        match sender.try_send(frame) {
                            Ok(()) => {}
                            Err(TrySendError::Full(_)) => {}
                            Err(TrySendError::Disconnected(_)) => return,
                        }
                    }
                }
            }
        }
    });
    (receiver, handle)
}

/// Copies the encoded stream from scrcpy into the decoder. Ends when either
/// side closes its pipe; dropping the sink lets the decoder flush and exit.
fn spawn_stream_pump(mut source: ChildStdout, mut sink: ChildStdin) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut buf = [0u8; 8192];
        loop {
            match source.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if sink.write_all(&buf[..n]).is_err() {
                        break;
                    }
                }
            }
        }
    })
}

/// Logs the first thing a child says on stderr, then drains the rest so the
/// child never blocks on a full pipe.
fn spawn_stderr_logger(
    name: &'static str,
    serial: String,
    stderr: std::process::ChildStderr,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let reader = BufReader::new(stderr);
        let mut reported = false;
        for line in reader.lines() {
            let Ok(line) = line else { break };
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            if !reported {
                warn!(serial = %serial, source = name, message = %trimmed, "video child stderr");
                reported = true;
            } else {
                debug!(serial = %serial, source = name, message = %trimmed, "video child stderr");
            }
        }
    })
}

fn kill_and_reap(child: &mut Option<Child>) {
    if let Some(mut child) = child.take() {
        let _ = child.kill();
        let _ = child.wait();
    }
}

/// Highest stage: scrcpy writes the raw encoded stream to stdout and an
/// ffmpeg child decodes it into a PNG image stream.
pub struct RawStreamSource {
    receiver: Receiver<MirrorFrame>,
    scrcpy: Option<Child>,
    decoder: Option<Child>,
    threads: Vec<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
}

impl RawStreamSource {
    fn start(chain: &VideoChain, decoder_path: &str) -> Result<Self, String> {
        let args = raw_stream_args(
            &chain.serial,
            &chain.scrcpy_settings,
            &chain.mirror,
            chain.scrcpy.major_version,
            chain.display.as_deref(),
        );
        debug!(serial = %chain.serial, ?args, "starting scrcpy raw stream");
        let mut scrcpy = Command::new(&chain.scrcpy.command_path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| format!("failed to start scrcpy: {err}"))?;
        let Some(stream_out) = scrcpy.stdout.take() else {
            kill_and_reap(&mut Some(scrcpy));
            return Err("scrcpy stdout was not captured".to_string());
        };
        let scrcpy_err = scrcpy.stderr.take();

        let mut decoder_args = vec![
            "-hide_banner".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
            "-f".to_string(),
            "h264".to_string(),
            "-i".to_string(),
            "-".to_string(),
        ];
        image_pipe_to_stdout(&mut decoder_args);
        let mut decoder = match Command::new(decoder_path)
            .args(&decoder_args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
        {
            Ok(child) => child,
            Err(err) => {
                kill_and_reap(&mut Some(scrcpy));
                return Err(format!("failed to start the stream decoder: {err}"));
            }
        };
        let (Some(decoder_in), Some(decoder_out)) = (decoder.stdin.take(), decoder.stdout.take())
        else {
            kill_and_reap(&mut Some(scrcpy));
            kill_and_reap(&mut Some(decoder));
            return Err("decoder pipes were not captured".to_string());
        };

        let mut threads = Vec::new();
        if let Some(stderr) = scrcpy_err {
            threads.push(spawn_stderr_logger("scrcpy", chain.serial.clone(), stderr));
        }
        threads.push(spawn_stream_pump(stream_out, decoder_in));
        let (receiver, reader) = spawn_frame_reader(decoder_out);
        threads.push(reader);

        Ok(Self {
            receiver,
            scrcpy: Some(scrcpy),
            decoder: Some(decoder),
            threads,
            stop: chain.stop.clone(),
        })
    }
}

impl VideoSource for RawStreamSource {
    fn mode(&self) -> VideoMode {
        VideoMode::RawStream
    }

    fn next_frame(&mut self, grace: Duration) -> Option<MirrorFrame> {
        recv_frame(&self.receiver, &self.stop, grace)
    }

    fn stop(&mut self) {
        kill_and_reap(&mut self.scrcpy);
        kill_and_reap(&mut self.decoder);
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for RawStreamSource {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Middle stage: a real scrcpy window parked far off screen, grabbed by title
/// with ffmpeg's desktop capture and re-encoded into a PNG image stream.
pub struct WindowCaptureSource {
    receiver: Receiver<MirrorFrame>,
    scrcpy: Option<Child>,
    grabber: Option<Child>,
    threads: Vec<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
}

impl WindowCaptureSource {
    fn start(chain: &VideoChain, decoder_path: &str) -> Result<Self, String> {
        let title = offscreen_window_title(&chain.serial);
        let args = window_capture_args(
            &chain.serial,
            &chain.scrcpy_settings,
            &chain.mirror,
            chain.scrcpy.major_version,
            &title,
        );
        debug!(serial = %chain.serial, title = %title, "starting off-screen scrcpy window");
        let mut scrcpy = Command::new(&chain.scrcpy.command_path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| format!("failed to start scrcpy: {err}"))?;
        let scrcpy_err = scrcpy.stderr.take();

        // The grabber matches by title, so the window must exist first.
        sleep_with_stop(WINDOW_SETTLE, &chain.stop, None);
        if let Ok(Some(status)) = scrcpy.try_wait() {
            return Err(format!("scrcpy window exited immediately ({status})"));
        }

        let framerate = chain.mirror.max_fps.clamp(1, 30);
        let mut grab_args = vec![
            "-hide_banner".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
            "-f".to_string(),
            "gdigrab".to_string(),
            "-framerate".to_string(),
            framerate.to_string(),
            "-i".to_string(),
            format!("title={title}"),
        ];
        image_pipe_to_stdout(&mut grab_args);
        let mut grabber = match Command::new(decoder_path)
            .args(&grab_args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
        {
            Ok(child) => child,
            Err(err) => {
                kill_and_reap(&mut Some(scrcpy));
                return Err(format!("failed to start the window grabber: {err}"));
            }
        };
        let Some(grabber_out) = grabber.stdout.take() else {
            kill_and_reap(&mut Some(scrcpy));
            kill_and_reap(&mut Some(grabber));
            return Err("grabber stdout was not captured".to_string());
        };

        let mut threads = Vec::new();
        if let Some(stderr) = scrcpy_err {
            threads.push(spawn_stderr_logger("scrcpy", chain.serial.clone(), stderr));
        }
        let (receiver, reader) = spawn_frame_reader(grabber_out);
        threads.push(reader);

        Ok(Self {
            receiver,
            scrcpy: Some(scrcpy),
            grabber: Some(grabber),
            threads,
            stop: chain.stop.clone(),
        })
    }
}

impl VideoSource for WindowCaptureSource {
    fn mode(&self) -> VideoMode {
        VideoMode::WindowCapture
    }

    fn next_frame(&mut self, grace: Duration) -> Option<MirrorFrame> {
        recv_frame(&self.receiver, &self.stop, grace)
    }

    fn stop(&mut self) {
        kill_and_reap(&mut self.scrcpy);
        kill_and_reap(&mut self.grabber);
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for WindowCaptureSource {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Floor stage: periodic screenshots. Always constructible, never downgraded
/// past, and a capture failure just backs off until the next poll.
pub struct PollingSource {
    serial: String,
    grabber: Arc<ScreenshotGrabber>,
    directory: Arc<DeviceDirectory>,
    interval: Duration,
    stop: Arc<AtomicBool>,
    last_attempt: Option<Instant>,
}

impl PollingSource {
    fn new(chain: &VideoChain) -> Self {
        Self {
            serial: chain.serial.clone(),
            grabber: chain.grabber.clone(),
            directory: chain.directory.clone(),
            interval: Duration::from_millis(chain.mirror.poll_interval_ms.max(1)),
            stop: chain.stop.clone(),
            last_attempt: None,
        }
    }
}

impl VideoSource for PollingSource {
    fn mode(&self) -> VideoMode {
        VideoMode::Polling
    }

    fn next_frame(&mut self, _grace: Duration) -> Option<MirrorFrame> {
        if let Some(last) = self.last_attempt {
            let since = last.elapsed();
            if since < self.interval && sleep_with_stop(self.interval - since, &self.stop, None) {
                return None;
            }
        }
        if self.stop.load(Ordering::Relaxed) {
            return None;
        }
        self.last_attempt = Some(Instant::now());
        match self.grabber.capture_best(&self.serial, &self.directory) {
            Ok((_, bytes)) => match MirrorFrame::from_png(bytes) {
                Some(frame) => Some(frame),
                None => {
                    debug!(serial = %self.serial, "screenshot poll returned data without PNG dimensions");
                    None
                }
            },
            Err(err) => {
                debug!(serial = %self.serial, error = %err, "screenshot poll failed");
                sleep_with_stop(POLL_ERROR_BACKOFF, &self.stop, None);
                None
            }
        }
    }

    fn stop(&mut self) {}
}

// Keeps a child process slot other threads can reach, so a stop request can
// kill a child that a reader thread is blocked on.
pub(crate) type ChildSlot = Arc<Mutex<Option<Child>>>;

pub(crate) fn store_child(slot: &ChildSlot, child: Child) {
    if let Ok(mut guard) = slot.lock() {
        *guard = Some(child);
    }
}

pub(crate) fn kill_stored_child(slot: &ChildSlot) {
    if let Ok(mut guard) = slot.lock() {
        if let Some(child) = guard.as_mut() {
            let _ = child.kill();
            let _ = child.wait();
        }
        *guard = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adb::runner::testing::ScriptedRunner;
    use crate::adb::runner::CommandRunner;
    use crate::mirror::frame::test_support::tiny_png;

    fn missing_scrcpy() -> ScrcpyInfo {
        ScrcpyInfo {
            available: false,
            version_output: String::new(),
            major_version: 2,
            command_path: "scrcpy".to_string(),
        }
    }

    fn chain_with(runner: &ScriptedRunner) -> VideoChain {
        let shared: Arc<dyn CommandRunner> = Arc::new(runner.clone_handle());
        VideoChain {
            serial: "ABC".to_string(),
            scrcpy: missing_scrcpy(),
            ffmpeg: None,
            scrcpy_settings: ScrcpySettings::default(),
            mirror: MirrorSettings::default(),
            display: None,
            grabber: Arc::new(ScreenshotGrabber::new(shared.clone(), Duration::from_secs(5))),
            directory: Arc::new(DeviceDirectory::new(shared, Duration::from_secs(5))),
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    #[test]
    fn stages_downgrade_in_one_direction() {
        assert_eq!(VideoMode::RawStream.next_stage(), Some(VideoMode::WindowCapture));
        assert_eq!(VideoMode::WindowCapture.next_stage(), Some(VideoMode::Polling));
        assert_eq!(VideoMode::Polling.next_stage(), None);
    }

    #[test]
    fn chain_falls_through_to_polling_without_scrcpy() {
        let runner = ScriptedRunner::new();
        let chain = chain_with(&runner);
        let (mode, mut source) = chain.first_available(VideoMode::RawStream);
        assert_eq!(mode, VideoMode::Polling);
        assert_eq!(source.mode(), VideoMode::Polling);
        source.stop();
    }

    #[test]
    fn polling_source_delivers_scripted_screenshots() {
        let runner = ScriptedRunner::new();
        runner.respond_bytes("exec-out screencap -p -d 0", tiny_png(4, 2));
        let chain = chain_with(&runner);
        chain.directory.remember_best_display("ABC", "0");
        let mut source = PollingSource::new(&chain);
        let frame = source.next_frame(Duration::from_secs(2)).expect("frame");
        assert_eq!((frame.width, frame.height), (4, 2));
    }

    #[test]
    fn polling_failure_backs_off_and_returns_none() {
        let runner = ScriptedRunner::new();
        let chain = chain_with(&runner);
        let mut source = PollingSource::new(&chain);
        let started = Instant::now();
        assert!(source.next_frame(Duration::from_secs(2)).is_none());
        assert!(started.elapsed() < Duration::from_millis(2500));
    }

    #[test]
    fn stop_flag_cuts_the_grace_wait_short() {
        let (_sender, receiver) = mpsc::sync_channel::<MirrorFrame>(1);
        let stop = AtomicBool::new(true);
        let started = Instant::now();
        assert!(recv_frame(&receiver, &stop, Duration::from_secs(5)).is_none());
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
