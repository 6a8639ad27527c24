use std::io::{BufRead, BufReader};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::adb::directory::DeviceDirectory;
use crate::adb::env::current_env;
use crate::adb::input;
use crate::adb::runner::CommandRunner;
use crate::adb::screenshot::ScreenshotGrabber;
use crate::config::{AppConfig, UixSettings};
use crate::error::AppError;
use crate::mirror::frame::MirrorFrame;
use crate::mirror::sleep_with_stop;
use crate::mirror::video::{kill_stored_child, store_child, ChildSlot, VideoChain, VideoMode};
use crate::models::{resolve_trace_id, ScrcpyInfo};
use crate::uix::extract::HierarchyExtractor;
use crate::uix::parser::{parse_uix, UiTree};

const LOG_RESTART_FLOOR: Duration = Duration::from_millis(200);
const LOG_RESTART_CEILING: Duration = Duration::from_millis(5000);
const JOIN_LIMIT: Duration = Duration::from_secs(10);

/// What a running session tells its consumer. Loop failures degrade into
/// events; the session itself stays up until stopped.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Frame(MirrorFrame),
    Tree {
        tree: Arc<UiTree>,
        /// False only for a forced re-emit of an unchanged hierarchy.
        changed: bool,
        /// The tree came from a rescued on-device file and may lag the screen.
        stale: bool,
    },
    LogLine(String),
    FocusChanged(String),
    DumpError(String),
}

pub type SessionEmitter = Arc<dyn Fn(SessionEvent) + Send + Sync>;

/// A live mirror of one device: a video loop with a one-directional fallback
/// chain, a hierarchy loop gated on content hash, a streamed logcat loop and
/// a focus poll, all feeding one emitter. Input injection is fire-and-forget
/// and nudges the hierarchy loop to refresh early.
#[derive(Debug)]
pub struct MirrorSession {
    serial: String,
    trace_id: String,
    stop: Arc<AtomicBool>,
    refresh: Arc<AtomicBool>,
    mode: Arc<Mutex<VideoMode>>,
    logcat_child: ChildSlot,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl MirrorSession {
    #[allow(clippy::too_many_arguments)]
    pub fn start(
        config: &AppConfig,
        runner: Arc<dyn CommandRunner>,
        directory: Arc<DeviceDirectory>,
        scrcpy: ScrcpyInfo,
        ffmpeg: Option<String>,
        serial: &str,
        emitter: SessionEmitter,
        trace_id: Option<String>,
    ) -> Result<Self, AppError> {
        let trace_id = resolve_trace_id(trace_id);
        let serial = serial.trim().to_string();
        if serial.is_empty() {
            return Err(AppError::validation("Device serial is empty", trace_id));
        }

        let stop = Arc::new(AtomicBool::new(false));
        let refresh = Arc::new(AtomicBool::new(false));
        let mode = Arc::new(Mutex::new(VideoMode::Polling));
        let logcat_child: ChildSlot = Arc::new(Mutex::new(None));
        let timeout = Duration::from_secs(config.adb.command_timeout_secs);
        let display_override = (config.screenshot.display_id >= 0)
            .then(|| config.screenshot.display_id.to_string());

        let chain = VideoChain {
            serial: serial.clone(),
            scrcpy,
            ffmpeg,
            scrcpy_settings: config.scrcpy.clone(),
            mirror: config.mirror.clone(),
            display: display_override.clone(),
            grabber: Arc::new(ScreenshotGrabber::new(runner.clone(), timeout)),
            directory: directory.clone(),
            stop: stop.clone(),
        };

        let mut threads = Vec::with_capacity(4);
        threads.push(spawn_video_loop(
            chain,
            Duration::from_millis(config.mirror.video_grace_ms),
            mode.clone(),
            emitter.clone(),
        ));
        threads.push(spawn_hierarchy_loop(
            serial.clone(),
            runner.clone(),
            directory.clone(),
            config.uix.clone(),
            Duration::from_millis(config.mirror.hierarchy_interval_ms),
            display_override,
            stop.clone(),
            refresh.clone(),
            emitter.clone(),
        ));
        threads.push(spawn_log_loop(
            serial.clone(),
            runner,
            config.mirror.clear_log_on_start,
            timeout,
            stop.clone(),
            logcat_child.clone(),
            emitter.clone(),
        ));
        threads.push(spawn_focus_loop(
            serial.clone(),
            directory,
            Duration::from_millis(config.mirror.focus_interval_ms),
            stop.clone(),
            emitter,
        ));

        info!(serial = %serial, trace_id = %trace_id, "mirror session started");
        Ok(Self {
            serial,
            trace_id,
            stop,
            refresh,
            mode,
            logcat_child,
            threads: Mutex::new(threads),
        })
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    /// The stage the video loop is currently on. Only ever moves down.
    pub fn video_mode(&self) -> VideoMode {
        self.mode
            .lock()
            .map(|guard| *guard)
            .unwrap_or(VideoMode::Polling)
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    /// Asks the hierarchy loop to dump again now instead of waiting out its
    /// interval. An unchanged tree is still re-emitted, flagged accordingly.
    pub fn request_refresh(&self) {
        self.refresh.store(true, Ordering::Relaxed);
    }

    pub fn tap(&self, x: i32, y: i32) {
        input::send_tap(&self.serial, x, y);
        self.request_refresh();
    }

    pub fn swipe(&self, x1: i32, y1: i32, x2: i32, y2: i32, duration_ms: u32) {
        input::send_swipe(&self.serial, x1, y1, x2, y2, duration_ms);
        self.request_refresh();
    }

    pub fn key_event(&self, keycode: &str) {
        input::send_keyevent(&self.serial, keycode);
        self.request_refresh();
    }

    /// Idempotent. Signals every loop, kills the streamed logcat child so a
    /// blocked reader wakes up, then joins the loops with a bounded wait.
    pub fn stop(&self) {
        let already = self.stop.swap(true, Ordering::Relaxed);
        kill_stored_child(&self.logcat_child);
        if already {
            return;
        }
        let handles: Vec<JoinHandle<()>> = self
            .threads
            .lock()
            .map(|mut guard| guard.drain(..).collect())
            .unwrap_or_default();
        for handle in handles {
            join_bounded(handle, JOIN_LIMIT);
        }
        info!(serial = %self.serial, trace_id = %self.trace_id, "mirror session stopped");
    }
}

impl Drop for MirrorSession {
    fn drop(&mut self) {
        // No joining here; a consumer that forgot to stop still gets the
        // children killed and the loops signalled.
        self.stop.store(true, Ordering::Relaxed);
        kill_stored_child(&self.logcat_child);
    }
}

fn join_bounded(handle: JoinHandle<()>, limit: Duration) {
    let deadline = Instant::now() + limit;
    while !handle.is_finished() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(50));
    }
    if handle.is_finished() {
        let _ = handle.join();
    } else {
        warn!("capture loop did not wind down in time, detaching");
    }
}

fn spawn_video_loop(
    chain: VideoChain,
    grace: Duration,
    mode_slot: Arc<Mutex<VideoMode>>,
    emitter: SessionEmitter,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let (mut mode, mut source) = chain.first_available(VideoMode::RawStream);
        set_mode(&mode_slot, mode);
        info!(serial = %chain.serial, stage = mode.as_str(), "video pipeline started");
        loop {
            if chain.stop.load(Ordering::Relaxed) {
                break;
            }
            match source.next_frame(grace) {
                Some(frame) => emitter(SessionEvent::Frame(frame)),
                None => {
                    if chain.stop.load(Ordering::Relaxed) {
                        break;
                    }
                    if mode == VideoMode::Polling {
                        continue;
                    }
                    warn!(
                        serial = %chain.serial,
                        stage = mode.as_str(),
                        grace_ms = grace.as_millis() as u64,
                        "video stage went silent, downgrading"
                    );
                    source.stop();
                    let next = mode.next_stage().unwrap_or(VideoMode::Polling);
                    let (new_mode, new_source) = chain.first_available(next);
                    mode = new_mode;
                    source = new_source;
                    set_mode(&mode_slot, mode);
                }
            }
        }
        source.stop();
        debug!(serial = %chain.serial, "video loop ended");
    })
}

fn set_mode(slot: &Mutex<VideoMode>, mode: VideoMode) {
    if let Ok(mut guard) = slot.lock() {
        *guard = mode;
    }
}

#[allow(clippy::too_many_arguments)]
fn spawn_hierarchy_loop(
    serial: String,
    runner: Arc<dyn CommandRunner>,
    directory: Arc<DeviceDirectory>,
    settings: UixSettings,
    interval: Duration,
    display_override: Option<String>,
    stop: Arc<AtomicBool>,
    refresh: Arc<AtomicBool>,
    emitter: SessionEmitter,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let extractor = HierarchyExtractor::new(runner, settings);
        let mut last_hash: Option<u64> = None;
        let mut forced = false;
        loop {
            if stop.load(Ordering::Relaxed) {
                break;
            }
            let preferred = display_override
                .clone()
                .or_else(|| directory.best_display(&serial));
            match extractor.extract(&serial, &directory, preferred.as_deref()) {
                Ok(outcome) => {
                    let tree = parse_uix(&outcome.raw);
                    if tree.root().is_none() {
                        emitter(SessionEvent::DumpError(
                            "hierarchy dump parsed to an empty tree".to_string(),
                        ));
                    } else {
                        let hash = tree.source_hash;
                        let changed = last_hash != Some(hash);
                        if changed || forced {
                            last_hash = Some(hash);
                            emitter(SessionEvent::Tree {
                                tree: Arc::new(tree),
                                changed,
                                stale: outcome.stale,
                            });
                        }
                    }
                }
                Err(failure) => {
                    emitter(SessionEvent::DumpError(failure.reason().to_string()));
                }
            }
            forced = false;
            let interrupted = sleep_with_stop(interval, &stop, Some(&refresh));
            if stop.load(Ordering::Relaxed) {
                break;
            }
            // An interrupt that was not a stop came from the refresh flag.
            forced = interrupted;
        }
        debug!(serial = %serial, "hierarchy loop ended");
    })
}

fn spawn_log_loop(
    serial: String,
    runner: Arc<dyn CommandRunner>,
    clear_on_start: bool,
    timeout: Duration,
    stop: Arc<AtomicBool>,
    child_slot: ChildSlot,
    emitter: SessionEmitter,
) -> JoinHandle<()> {
    thread::spawn(move || {
        if clear_on_start {
            let cleared = runner.run(
                &[
                    "-s".to_string(),
                    serial.clone(),
                    "logcat".to_string(),
                    "-c".to_string(),
                ],
                timeout,
            );
            if !cleared.success() {
                debug!(serial = %serial, stderr = %cleared.stderr.trim(), "logcat clear failed");
            }
        }

        let mut backoff = LOG_RESTART_FLOOR;
        loop {
            if stop.load(Ordering::Relaxed) {
                break;
            }
            let env = current_env();
            let (program, args) = env.adb_invocation(&[
                "-s".to_string(),
                serial.clone(),
                "logcat".to_string(),
                "-v".to_string(),
                "time".to_string(),
            ]);
            match Command::new(&program)
                .args(&args)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::null())
                .spawn()
            {
                Ok(mut child) => {
                    let stdout = child.stdout.take();
                    store_child(&child_slot, child);
                    let mut streamed_any = false;
                    if let Some(stdout) = stdout {
                        let reader = BufReader::new(stdout);
                        for line in reader.lines() {
                            if stop.load(Ordering::Relaxed) {
                                break;
                            }
                            let Ok(line) = line else { break };
                            let trimmed = line.trim();
                            if trimmed.is_empty() {
                                continue;
                            }
                            streamed_any = true;
                            emitter(SessionEvent::LogLine(trimmed.to_string()));
                        }
                    }
                    kill_stored_child(&child_slot);
                    if streamed_any {
                        backoff = LOG_RESTART_FLOOR;
                    }
                }
                Err(err) => {
                    warn!(serial = %serial, error = %err, "failed to start logcat");
                }
            }
            if stop.load(Ordering::Relaxed) {
                break;
            }
            debug!(serial = %serial, backoff_ms = backoff.as_millis() as u64, "logcat stream ended, restarting");
            if sleep_with_stop(backoff, &stop, None) {
                break;
            }
            backoff = (backoff * 2).min(LOG_RESTART_CEILING);
        }
        kill_stored_child(&child_slot);
        debug!(serial = %serial, "log loop ended");
    })
}

fn spawn_focus_loop(
    serial: String,
    directory: Arc<DeviceDirectory>,
    interval: Duration,
    stop: Arc<AtomicBool>,
    emitter: SessionEmitter,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut last_focus = String::new();
        loop {
            if stop.load(Ordering::Relaxed) {
                break;
            }
            let focus = directory
                .focused_window(&serial)
                .unwrap_or_else(|| "Unknown".to_string());
            if focus != last_focus {
                last_focus = focus.clone();
                emitter(SessionEvent::FocusChanged(focus));
            }
            if sleep_with_stop(interval, &stop, None) {
                break;
            }
        }
        debug!(serial = %serial, "focus loop ended");
    })
}
