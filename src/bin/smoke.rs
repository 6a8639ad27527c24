use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use droidglass::adb::directory::DeviceDirectory;
use droidglass::adb::env::apply_environment;
use droidglass::adb::runner::{AdbRunner, CommandRunner};
use droidglass::adb::screenshot::{looks_like_png, ScreenshotGrabber};
use droidglass::adb::scrcpy::check_scrcpy;
use droidglass::config::load_config;
use droidglass::logging::init_logging;
use droidglass::mirror::video::detect_ffmpeg;
use droidglass::models::DeviceState;
use droidglass::snapshot::capture_snapshot;
use droidglass::uix::extract::HierarchyExtractor;
use droidglass::uix::parser::{parse_uix, UiTree};
use droidglass::uix::suggest::suggest_locators;
use droidglass::{MirrorSession, SessionEmitter, SessionEvent};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct Args {
    serial: Option<String>,
    out_dir: Option<PathBuf>,
    json: bool,
    with_mirror: bool,
    mirror_secs: u64,
}

#[derive(Serialize)]
struct Summary {
    tool: &'static str,
    status: &'static str,
    trace_id: String,
    serial: Option<String>,
    adb_program: Option<String>,
    out_dir: String,
    artifacts: HashMap<String, String>,
    steps: Vec<StepRecord>,
}

#[derive(Serialize)]
struct StepRecord {
    name: &'static str,
    status: &'static str, // pass|warn|fail|skip
    duration_ms: u128,
    artifacts: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_code: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl StepRecord {
    fn skipped(name: &'static str) -> Self {
        StepRecord {
            name,
            status: "skip",
            duration_ms: 0,
            artifacts: vec![],
            error_code: None,
            error: None,
        }
    }
}

/// What a step hands back when it ran to the end. A warning downgrades the
/// step to "warn" without counting as a failure.
struct StepReport {
    artifacts: Vec<String>,
    warning: Option<String>,
}

impl StepReport {
    fn clean(artifacts: Vec<String>) -> Self {
        StepReport {
            artifacts,
            warning: None,
        }
    }

    fn warned(artifacts: Vec<String>, warning: String) -> Self {
        StepReport {
            artifacts,
            warning: Some(warning),
        }
    }
}

#[derive(Serialize)]
struct MirrorTally {
    video_mode: String,
    frames: usize,
    trees: usize,
    tree_changes: usize,
    log_lines: usize,
    focus_changes: usize,
    dump_errors: usize,
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
        json: false,
        with_mirror: false,
        mirror_secs: 5,
    };

    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--serial" => args.serial = Some(take_value(&mut it, "--serial")?),
            "--out" => args.out_dir = Some(PathBuf::from(take_value(&mut it, "--out")?)),
            "--json" => args.json = true,
            "--with-mirror" => args.with_mirror = true,
            "--mirror-secs" => args.mirror_secs = take_number(&mut it, "--mirror-secs")?,
            "-h" | "--help" => {
                return Err(
                    "Usage: cargo run --bin smoke -- [--serial SERIAL] [--out DIR] [--json] [--with-mirror] [--mirror-secs N]\n"
                        .to_string(),
                );
            }
            other => return Err(format!("Unknown arg: {other}")),
        }
    }

    args.mirror_secs = args.mirror_secs.clamp(2, 60);
    Ok(args)
}

fn ensure_dir(path: &Path) -> Result<(), String> {
    fs::create_dir_all(path)
        .map_err(|err| format!("Failed to create dir {}: {err}", path.display()))
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

/// The leaf a tester would most likely inspect first: anchorable, visible,
/// and big.
fn pick_locator_target(tree: &UiTree) -> Option<usize> {
    tree.nodes()
        .iter()
        .filter(|node| node.children.is_empty() && node.has_valid_bounds() && !node.naf)
        .max_by_key(|node| node.rect.as_ref().map(|r| r.area()).unwrap_or(0))
        .map(|node| node.index)
}

/// Runs one step and records it. A required step that errors marks the run
/// failed; an optional one only warns. Returns false when the run should be
/// considered failed because of this step.
fn run_step<F>(steps: &mut Vec<StepRecord>, name: &'static str, required: bool, f: F) -> bool
where
    F: FnOnce() -> Result<StepReport, (&'static str, String)>,
{
    let start = Instant::now();
    let record = match f() {
        Ok(report) => StepRecord {
            name,
            status: if report.warning.is_some() {
                "warn"
            } else {
                "pass"
            },
            duration_ms: start.elapsed().as_millis(),
            artifacts: report.artifacts,
            error_code: report.warning.as_ref().map(|_| "WARN"),
            error: report.warning,
        },
        Err((code, message)) => StepRecord {
            name,
            status: if required { "fail" } else { "warn" },
            duration_ms: start.elapsed().as_millis(),
            artifacts: vec![],
            error_code: Some(code),
            error: Some(message),
        },
    };
    let ok = record.status != "fail";
    steps.push(record);
    ok
}

fn finish(summary: Summary, json: bool) -> ! {
    let output = if json {
        serde_json::to_string_pretty(&summary).unwrap_or_else(|_| "{}".to_string())
    } else {
        format!(
            "status: {}\ntrace_id: {}\nout: {}\n",
            summary.status, summary.trace_id, summary.out_dir
        )
    };
    println!("{output}");
    std::process::exit(if summary.status == "pass" { 0 } else { 1 });
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
    let out_dir = args.out_dir.clone().unwrap_or_else(|| {
        std::env::temp_dir().join(format!("droidglass_smoke_{trace_id}"))
    });
    if let Err(err) = ensure_dir(&out_dir) {
        eprintln!("{err}");
        std::process::exit(1);
    }
    let out_str = out_dir.to_string_lossy().to_string();

    let mut artifacts: HashMap<String, String> = HashMap::new();
    let mut steps: Vec<StepRecord> = Vec::new();
    let mut status = "pass";

    let config = match load_config() {
        Ok(cfg) => cfg,
        Err(err) => {
            steps.push(StepRecord {
                name: "load_config",
                status: "fail",
                duration_ms: 0,
                artifacts: vec![],
                error_code: Some("ERR_CONFIG"),
                error: Some(err.to_string()),
            });
            finish(
                Summary {
                    tool: "droidglass_smoke",
                    status: "fail",
                    trace_id,
                    serial: args.serial,
                    adb_program: None,
                    out_dir: out_str,
                    artifacts,
                    steps,
                },
                args.json,
            );
        }
    };
    let env = apply_environment(&config);
    let adb_program = env.adb_program.clone();
    let timeout = Duration::from_secs(config.adb.command_timeout_secs);
    let runner: Arc<dyn CommandRunner> = Arc::new(AdbRunner);
    let directory = Arc::new(DeviceDirectory::new(Arc::clone(&runner), timeout));

    // Everything below talks through adb, so this one is required.
    if !run_step(&mut steps, "check_adb", true, || {
        let info = directory.check_adb();
        if !info.available {
            return Err((
                "ERR_CHECK_ADB",
                info.error
                    .unwrap_or_else(|| "adb is not available".to_string()),
            ));
        }
        let path = out_dir.join("check_adb.txt");
        fs::write(&path, &info.version_output)
            .map_err(|err| ("ERR_IO", format!("Failed to write adb version: {err}")))?;
        artifacts.insert("check_adb".to_string(), path.to_string_lossy().to_string());
        Ok(StepReport::clean(vec![path.to_string_lossy().to_string()]))
    }) {
        status = "fail";
    }

    // Mirroring degrades without scrcpy, it does not break.
    run_step(&mut steps, "check_scrcpy", false, || {
        let info = check_scrcpy(&config.scrcpy);
        let path = out_dir.join("check_scrcpy.json");
        let body = serde_json::to_string_pretty(&info)
            .map_err(|err| ("ERR_IO", format!("Failed to serialize scrcpy info: {err}")))?;
        fs::write(&path, body)
            .map_err(|err| ("ERR_IO", format!("Failed to write scrcpy info: {err}")))?;
        artifacts.insert(
            "check_scrcpy".to_string(),
            path.to_string_lossy().to_string(),
        );
        let paths = vec![path.to_string_lossy().to_string()];
        if info.available {
            Ok(StepReport::clean(paths))
        } else {
            Ok(StepReport::warned(
                paths,
                "scrcpy not available (optional).".to_string(),
            ))
        }
    });

    // Same for ffmpeg: stream decode falls back to polling without it.
    run_step(&mut steps, "detect_ffmpeg", false, || match detect_ffmpeg() {
        Some(path) => {
            let out_path = out_dir.join("ffmpeg.txt");
            fs::write(&out_path, &path)
                .map_err(|err| ("ERR_IO", format!("Failed to write ffmpeg path: {err}")))?;
            artifacts.insert("ffmpeg".to_string(), out_path.to_string_lossy().to_string());
            Ok(StepReport::clean(vec![out_path
                .to_string_lossy()
                .to_string()]))
        }
        None => Ok(StepReport::warned(
            vec![],
            "ffmpeg not found (optional).".to_string(),
        )),
    });

    let serial = match args.serial.clone() {
        Some(s) => s,
        None => match pick_single_device(&directory) {
            Ok(s) => s,
            Err(err) => {
                steps.push(StepRecord {
                    name: "pick_device",
                    status: "fail",
                    duration_ms: 0,
                    artifacts: vec![],
                    error_code: Some("ERR_PICK_DEVICE"),
                    error: Some(err),
                });
                finish(
                    Summary {
                        tool: "droidglass_smoke",
                        status: "fail",
                        trace_id,
                        serial: None,
                        adb_program: Some(adb_program),
                        out_dir: out_str,
                        artifacts,
                        steps,
                    },
                    args.json,
                );
            }
        },
    };

    if !run_step(&mut steps, "device_detail", true, || {
        let detail = directory
            .device_detail(&serial)
            .map_err(|err| ("ERR_DEVICE_DETAIL", err.to_string()))?;
        let path = out_dir.join("device_detail.json");
        let body = serde_json::to_string_pretty(&detail)
            .map_err(|err| ("ERR_IO", format!("Failed to serialize device detail: {err}")))?;
        fs::write(&path, body)
            .map_err(|err| ("ERR_IO", format!("Failed to write device detail: {err}")))?;
        artifacts.insert(
            "device_detail".to_string(),
            path.to_string_lossy().to_string(),
        );
        Ok(StepReport::clean(vec![path.to_string_lossy().to_string()]))
    }) {
        status = "fail";
    }

    // Screenshot capture probes ids 0..=5 blind, so an empty discovery is a
    // warning, not a failure.
    run_step(&mut steps, "list_displays", false, || {
        let displays = directory.displays(&serial);
        let path = out_dir.join("displays.json");
        let body = serde_json::to_string_pretty(&displays)
            .map_err(|err| ("ERR_IO", format!("Failed to serialize displays: {err}")))?;
        fs::write(&path, body)
            .map_err(|err| ("ERR_IO", format!("Failed to write displays: {err}")))?;
        artifacts.insert("displays".to_string(), path.to_string_lossy().to_string());
        let paths = vec![path.to_string_lossy().to_string()];
        if displays.is_empty() {
            Ok(StepReport::warned(
                paths,
                "No displays discovered.".to_string(),
            ))
        } else {
            Ok(StepReport::clean(paths))
        }
    });

    if !run_step(&mut steps, "capture_screenshot", true, || {
        let grabber = ScreenshotGrabber::new(Arc::clone(&runner), timeout);
        let (display, bytes) = grabber
            .capture_best(&serial, &directory)
            .map_err(|err| ("ERR_SCREENSHOT", err.to_string()))?;
        if !looks_like_png(&bytes) {
            return Err((
                "ERR_SCREENSHOT_EMPTY",
                format!("Display {display} answered with something that is not a PNG"),
            ));
        }
        let path = out_dir.join("screenshot.png");
        fs::write(&path, &bytes)
            .map_err(|err| ("ERR_IO", format!("Failed to write screenshot: {err}")))?;
        artifacts.insert("screenshot".to_string(), path.to_string_lossy().to_string());
        Ok(StepReport::clean(vec![path.to_string_lossy().to_string()]))
    }) {
        status = "fail";
    }

    let mut parsed_tree: Option<UiTree> = None;
    if !run_step(&mut steps, "ui_dump", true, || {
        let display_override =
            (config.screenshot.display_id >= 0).then(|| config.screenshot.display_id.to_string());
        let preferred = display_override.or_else(|| directory.best_display(&serial));
        let extractor = HierarchyExtractor::new(Arc::clone(&runner), config.uix.clone());
        let outcome = extractor
            .extract(&serial, &directory, preferred.as_deref())
            .map_err(|failure| ("ERR_UI_DUMP", failure.reason().to_string()))?;
        let path = out_dir.join("ui_dump.xml");
        fs::write(&path, &outcome.raw)
            .map_err(|err| ("ERR_IO", format!("Failed to write ui dump: {err}")))?;
        artifacts.insert("ui_dump".to_string(), path.to_string_lossy().to_string());

        let tree = parse_uix(&outcome.raw);
        if tree.root().is_none() {
            return Err((
                "ERR_UI_DUMP_EMPTY",
                "Dump parsed to an empty tree".to_string(),
            ));
        }
        let stale = outcome.stale;
        parsed_tree = Some(tree);
        let paths = vec![path.to_string_lossy().to_string()];
        if stale {
            Ok(StepReport::warned(
                paths,
                "Dump was rescued from a stale on-device file.".to_string(),
            ))
        } else {
            Ok(StepReport::clean(paths))
        }
    }) {
        status = "fail";
    }

    // Offline once the dump exists; works on whatever the device produced.
    run_step(&mut steps, "locator_suggestions", false, || {
        let Some(tree) = parsed_tree.as_ref() else {
            return Ok(StepReport::warned(
                vec![],
                "No parsed tree to suggest from.".to_string(),
            ));
        };
        let Some(target) = pick_locator_target(tree) else {
            return Ok(StepReport::warned(
                vec![],
                "No anchorable leaf nodes in the tree.".to_string(),
            ));
        };
        let suggestions = suggest_locators(tree, target);
        let path = out_dir.join("locators.json");
        let body = serde_json::to_string_pretty(&suggestions)
            .map_err(|err| ("ERR_IO", format!("Failed to serialize suggestions: {err}")))?;
        fs::write(&path, body)
            .map_err(|err| ("ERR_IO", format!("Failed to write suggestions: {err}")))?;
        artifacts.insert("locators".to_string(), path.to_string_lossy().to_string());
        let paths = vec![path.to_string_lossy().to_string()];
        if suggestions.is_empty() {
            Ok(StepReport::warned(
                paths,
                "No locator strategy applied to the chosen node.".to_string(),
            ))
        } else {
            Ok(StepReport::clean(paths))
        }
    });

    if !run_step(&mut steps, "snapshot", true, || {
        let result = capture_snapshot(
            Arc::clone(&runner),
            &directory,
            &config,
            &serial,
            &out_dir,
            Some(trace_id.clone()),
        )
        .map_err(|err| ("ERR_SNAPSHOT", err.to_string()))?
        .data;
        artifacts.insert("snapshot".to_string(), result.directory.clone());
        let mut degraded = Vec::new();
        if !result.meta.screenshot_ok {
            degraded.push("screenshot");
        }
        if !result.meta.dump_ok {
            degraded.push("dump");
        }
        if !result.meta.logcat_ok {
            degraded.push("logcat");
        }
        if degraded.is_empty() {
            Ok(StepReport::clean(vec![result.directory]))
        } else {
            Ok(StepReport::warned(
                vec![result.directory],
                format!("Snapshot degraded: {} failed.", degraded.join(", ")),
            ))
        }
    }) {
        status = "fail";
    }

    if args.with_mirror {
        if !run_step(&mut steps, "mirror_session", true, || {
            let tally = Arc::new(EventTally::default());
            let sink = Arc::clone(&tally);
            let emitter: SessionEmitter = Arc::new(move |event| sink.record(event));

            let session = MirrorSession::start(
                &config,
                Arc::clone(&runner),
                Arc::clone(&directory),
                check_scrcpy(&config.scrcpy),
                detect_ffmpeg(),
                &serial,
                emitter,
                Some(trace_id.clone()),
            )
            .map_err(|err| ("ERR_MIRROR", err.to_string()))?;

            std::thread::sleep(Duration::from_secs(args.mirror_secs));
            let video_mode = session.video_mode();
            session.stop();

            let summary = MirrorTally {
                video_mode: video_mode.as_str().to_string(),
                frames: tally.frames.load(Ordering::Relaxed),
                trees: tally.trees.load(Ordering::Relaxed),
                tree_changes: tally.tree_changes.load(Ordering::Relaxed),
                log_lines: tally.log_lines.load(Ordering::Relaxed),
                focus_changes: tally.focus_changes.load(Ordering::Relaxed),
                dump_errors: tally.dump_errors.load(Ordering::Relaxed),
            };
            let path = out_dir.join("mirror_summary.json");
            let body = serde_json::to_string_pretty(&summary)
                .map_err(|err| ("ERR_IO", format!("Failed to serialize mirror tally: {err}")))?;
            fs::write(&path, body)
                .map_err(|err| ("ERR_IO", format!("Failed to write mirror tally: {err}")))?;
            artifacts.insert(
                "mirror_summary".to_string(),
                path.to_string_lossy().to_string(),
            );

            let paths = vec![path.to_string_lossy().to_string()];
            if summary.frames == 0 {
                Ok(StepReport::warned(
                    paths,
                    "Mirror delivered no frames.".to_string(),
                ))
            } else if summary.trees == 0 {
                Ok(StepReport::warned(
                    paths,
                    "Mirror delivered no hierarchy trees.".to_string(),
                ))
            } else {
                Ok(StepReport::clean(paths))
            }
        }) {
            status = "fail";
        }
    } else {
        steps.push(StepRecord::skipped("mirror_session"));
    }

    finish(
        Summary {
            tool: "droidglass_smoke",
            status,
            trace_id,
            serial: Some(serial),
            adb_program: Some(adb_program),
            out_dir: out_str,
            artifacts,
            steps,
        },
        args.json,
    );
}
