use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use droidglass::adb::directory::DeviceDirectory;
use droidglass::adb::env::apply_environment;
use droidglass::adb::runner::{AdbRunner, CommandRunner};
use droidglass::adb::scrcpy::check_scrcpy;
use droidglass::config::load_config;
use droidglass::logging::init_logging;
use droidglass::mirror::video::detect_ffmpeg;
use droidglass::models::DeviceState;
use droidglass::{MirrorSession, SessionEmitter, SessionEvent};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct Args {
    serial: Option<String>,
    out_dir: Option<PathBuf>,
    duration_secs: u64,
    session_secs: u64,
    json: bool,
}

#[derive(Serialize)]
struct SoakReport {
    tool: &'static str,
    status: &'static str,
    trace_id: String,
    serial: String,
    adb_program: String,
    out_dir: String,
    iterations: usize,
    failures: usize,
    warnings: usize,
    rounds: Vec<RoundRecord>,
}

#[derive(Serialize)]
struct RoundRecord {
    index: usize,
    status: &'static str, // pass|warn|fail
    duration_ms: u128,
    video_mode: String,
    frames: usize,
    trees: usize,
    tree_changes: usize,
    log_lines: usize,
    focus_changes: usize,
    dump_errors: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Default)]
struct EventTally {
    frames: AtomicUsize,
    trees: AtomicUsize,
    tree_changes: AtomicUsize,
    log_lines: AtomicUsize,
    focus_changes: AtomicUsize,
    dump_errors: AtomicUsize,
}

impl EventTally {
    fn record(&self, event: SessionEvent) {
        match event {
            SessionEvent::Frame(_) => {
                self.frames.fetch_add(1, Ordering::Relaxed);
            }
            SessionEvent::Tree { changed, .. } => {
                self.trees.fetch_add(1, Ordering::Relaxed);
                if changed {
                    self.tree_changes.fetch_add(1, Ordering::Relaxed);
                }
            }
            SessionEvent::LogLine(_) => {
                self.log_lines.fetch_add(1, Ordering::Relaxed);
            }
            SessionEvent::FocusChanged(_) => {
                self.focus_changes.fetch_add(1, Ordering::Relaxed);
            }
            SessionEvent::DumpError(_) => {
                self.dump_errors.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

fn take_value(it: &mut impl Iterator<Item = String>, flag: &str) -> Result<String, String> {
    it.next()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| format!("{flag} requires a value"))
}

fn take_number(it: &mut impl Iterator<Item = String>, flag: &str) -> Result<u64, String> {
    take_value(it, flag)?
        .parse::<u64>()
        .map_err(|_| format!("{flag} must be a number"))
}

fn parse_args() -> Result<Args, String> {
    let mut args = Args {
        serial: std::env::var("ANDROID_SERIAL")
            .ok()
            .filter(|s| !s.trim().is_empty()),
        out_dir: None,
        duration_secs: 120,
        session_secs: 6,
        json: false,
    };

    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--serial" => args.serial = Some(take_value(&mut it, "--serial")?),
            "--out" => args.out_dir = Some(PathBuf::from(take_value(&mut it, "--out")?)),
            "--duration-secs" => args.duration_secs = take_number(&mut it, "--duration-secs")?,
            "--session-secs" => args.session_secs = take_number(&mut it, "--session-secs")?,
            "--json" => args.json = true,
            "-h" | "--help" => {
                return Err("Usage: cargo run --bin soak -- [--serial SERIAL] [--out DIR] [--duration-secs N] [--session-secs N] [--json]\n".to_string());
            }
            other => return Err(format!("Unknown arg: {other}")),
        }
    }

    args.duration_secs = args.duration_secs.max(10);
    args.session_secs = args.session_secs.clamp(2, 60);
    Ok(args)
}

fn pick_single_device(directory: &DeviceDirectory) -> Result<String, String> {
    let devices = directory.list_devices().map_err(|err| err.to_string())?;
    let online: Vec<_> = devices
        .into_iter()
        .filter(|d| d.state == DeviceState::Online)
        .collect();
    match online.len() {
        0 => Err("No online adb devices found.".to_string()),
        1 => Ok(online[0].serial.clone()),
        _ => {
            let serials = online
                .into_iter()
                .map(|d| d.serial)
                .collect::<Vec<_>>()
                .join(", ");
            Err(format!(
                "Multiple online devices found ({serials}). Set ANDROID_SERIAL or pass --serial."
            ))
        }
    }
}

fn main() {
    let args = match parse_args() {
        Ok(v) => v,
        Err(msg) => {
            eprintln!("{msg}");
            std::process::exit(2);
        }
    };
    init_logging();

    let trace_id = Uuid::new_v4().to_string();
    let out_dir = args
        .out_dir
        .clone()
        .unwrap_or_else(|| std::env::temp_dir().join(format!("droidglass_soak_{trace_id}")));
    let _ = fs::create_dir_all(&out_dir);

    let config = match load_config() {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("Failed to load config: {err}");
            std::process::exit(1);
        }
    };
    let env = apply_environment(&config);
    let runner: Arc<dyn CommandRunner> = Arc::new(AdbRunner);
    let directory = Arc::new(DeviceDirectory::new(
        Arc::clone(&runner),
        Duration::from_secs(config.adb.command_timeout_secs),
    ));

    let serial = match args.serial.clone() {
        Some(s) => s,
        None => match pick_single_device(&directory) {
            Ok(s) => s,
            Err(err) => {
                eprintln!("{err}");
                std::process::exit(1);
            }
        },
    };

    let deadline = Instant::now() + Duration::from_secs(args.duration_secs);
    let half_session = Duration::from_millis(args.session_secs * 500);

    let mut rounds: Vec<RoundRecord> = Vec::new();
    let mut failures = 0usize;
    let mut warnings = 0usize;
    let mut index = 0usize;

    while Instant::now() < deadline {
        index += 1;
        let round_start = Instant::now();
        let mut status = "pass";
        let mut error: Option<String> = None;
        let mut video_mode = String::from("none");

        let tally = Arc::new(EventTally::default());
        let sink = Arc::clone(&tally);
        let emitter: SessionEmitter = Arc::new(move |event| sink.record(event));

        match MirrorSession::start(
            &config,
            Arc::clone(&runner),
            Arc::clone(&directory),
            check_scrcpy(&config.scrcpy),
            detect_ffmpeg(),
            &serial,
            emitter,
            Some(format!("{trace_id}-r{index}")),
        ) {
            Ok(session) => {
                // Let the loops settle, then force a hierarchy re-emit. An
                // unchanged screen must still answer the forced refresh.
                std::thread::sleep(half_session);
                session.request_refresh();
                std::thread::sleep(half_session);
                video_mode = session.video_mode().as_str().to_string();
                session.stop();

                let dump_errors = tally.dump_errors.load(Ordering::Relaxed);
                if tally.frames.load(Ordering::Relaxed) == 0 {
                    status = "warn";
                    warnings += 1;
                    error = Some("session delivered no frames".to_string());
                } else if tally.trees.load(Ordering::Relaxed) == 0 {
                    status = "warn";
                    warnings += 1;
                    error = Some("session delivered no hierarchy trees".to_string());
                } else if dump_errors > 0 {
                    status = "warn";
                    warnings += 1;
                    error = Some(format!("session logged {dump_errors} dump errors"));
                }
            }
            Err(err) => {
                status = "fail";
                failures += 1;
                error = Some(format!("session start failed: {err}"));
            }
        }

        rounds.push(RoundRecord {
            index,
            status,
            duration_ms: round_start.elapsed().as_millis(),
            video_mode,
            frames: tally.frames.load(Ordering::Relaxed),
            trees: tally.trees.load(Ordering::Relaxed),
            tree_changes: tally.tree_changes.load(Ordering::Relaxed),
            log_lines: tally.log_lines.load(Ordering::Relaxed),
            focus_changes: tally.focus_changes.load(Ordering::Relaxed),
            dump_errors: tally.dump_errors.load(Ordering::Relaxed),
            error,
        });
    }

    // Full per-round details for later inspection.
    let details_path = out_dir.join("soak_rounds.json");
    let _ = fs::write(
        &details_path,
        serde_json::to_string_pretty(&rounds).unwrap_or_default(),
    );

    let overall = if failures > 0 { "fail" } else { "pass" };
    let report = SoakReport {
        tool: "droidglass_soak",
        status: overall,
        trace_id,
        serial,
        adb_program: env.adb_program,
        out_dir: out_dir.to_string_lossy().to_string(),
        iterations: rounds.len(),
        failures,
        warnings,
        rounds,
    };

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).unwrap_or_default()
        );
    } else {
        println!(
            "status: {}\niterations: {}\nfailures: {}\nwarnings: {}\nout: {}",
            report.status, report.iterations, report.failures, report.warnings, report.out_dir
        );
    }

    if overall != "pass" {
        std::process::exit(1);
    }
}
