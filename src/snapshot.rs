use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::adb::directory::DeviceDirectory;
use crate::adb::runner::CommandRunner;
use crate::adb::screenshot::ScreenshotGrabber;
use crate::config::AppConfig;
use crate::error::AppError;
use crate::mirror::frame::png_data_url;
use crate::models::{resolve_trace_id, CommandResponse};
use crate::uix::extract::HierarchyExtractor;

/// Written into `dump.uix` when every extraction strategy failed, so the
/// folder always carries all four artifacts.
pub const DUMP_ERROR_PLACEHOLDER: &str = "<error>Failed to capture dump</error>";

const LOGCAT_TAIL_LINES: &str = "500";

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotMeta {
    pub timestamp: String,
    pub serial: String,
    pub model: Option<String>,
    pub android_version: Option<String>,
    pub focused_window: Option<String>,
    pub power_state: String,
    pub displays: Vec<String>,
    /// Display the screenshot was taken from, when one answered.
    pub capture_display: Option<String>,
    pub screenshot_ok: bool,
    pub dump_ok: bool,
    pub dump_stale: bool,
    pub logcat_ok: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotResult {
    pub directory: String,
    pub meta: SnapshotMeta,
}

/// One-shot inspection payload: the raw dump plus the screenshot as a
/// `data:` URL, ready for immediate display without touching disk.
#[derive(Debug, Clone, Serialize)]
pub struct UiPreview {
    pub xml: String,
    pub screenshot: Option<String>,
    pub display: Option<String>,
    pub stale: bool,
}

/// Captures one atomic inspection folder: screenshot, raw hierarchy dump,
/// log tail and a metadata record. Artifacts are independent; a failed one
/// is flagged in the metadata instead of sinking the whole capture.
pub fn capture_snapshot(
    runner: Arc<dyn CommandRunner>,
    directory: &DeviceDirectory,
    config: &AppConfig,
    serial: &str,
    parent_dir: &Path,
    trace_id: Option<String>,
) -> Result<CommandResponse<SnapshotResult>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    let serial = serial.trim();
    if serial.is_empty() {
        return Err(AppError::validation("Device serial is empty", trace_id));
    }

    let stamp = Utc::now().format("%Y%m%d_%H%M%S");
    let folder = parent_dir.join(format!("snapshot_{stamp}"));
    fs::create_dir_all(&folder).map_err(|err| {
        AppError::system(
            format!("Failed to create snapshot dir: {err}"),
            trace_id.as_str(),
        )
    })?;

    let timeout = Duration::from_secs(config.adb.command_timeout_secs);
    let grabber = ScreenshotGrabber::new(runner.clone(), timeout);

    let mut capture_display = None;
    let screenshot_ok = match grabber.capture_best(serial, directory) {
        Ok((display, bytes)) => {
            capture_display = Some(display);
            match fs::write(folder.join("screenshot.png"), bytes) {
                Ok(()) => true,
                Err(err) => {
                    warn!(serial, error = %err, "could not write snapshot screenshot");
                    false
                }
            }
        }
        Err(err) => {
            warn!(serial, error = %err, "snapshot screenshot failed");
            false
        }
    };

    let extractor = HierarchyExtractor::new(runner.clone(), config.uix.clone());
    let preferred = preferred_display(config, directory, serial);
    let (dump_ok, dump_stale) = match extractor.extract(serial, directory, preferred.as_deref()) {
        Ok(outcome) => {
            let written = fs::write(folder.join("dump.uix"), &outcome.raw);
            if let Err(err) = written {
                warn!(serial, error = %err, "could not write snapshot dump");
                (false, outcome.stale)
            } else {
                (true, outcome.stale)
            }
        }
        Err(failure) => {
            warn!(serial, reason = failure.reason(), "snapshot dump failed");
            let _ = fs::write(folder.join("dump.uix"), DUMP_ERROR_PLACEHOLDER);
            (false, false)
        }
    };

    let log_tail = runner.run(
        &[
            "-s".to_string(),
            serial.to_string(),
            "logcat".to_string(),
            "-d".to_string(),
            "-t".to_string(),
            LOGCAT_TAIL_LINES.to_string(),
        ],
        timeout,
    );
    let logcat_ok = if log_tail.success() {
        fs::write(folder.join("logcat.txt"), &log_tail.stdout).is_ok()
    } else {
        debug!(serial, stderr = %log_tail.stderr.trim(), "snapshot log tail failed");
        false
    };

    let detail = directory.device_detail(serial).ok();
    let meta = SnapshotMeta {
        timestamp: Utc::now().to_rfc3339(),
        serial: serial.to_string(),
        model: detail.as_ref().and_then(|d| d.model.clone()),
        android_version: detail.as_ref().and_then(|d| d.android_version.clone()),
        focused_window: directory.focused_window(serial),
        power_state: directory.wakefulness(serial).as_str().to_string(),
        displays: directory
            .displays(serial)
            .into_iter()
            .map(|display| display.id)
            .collect(),
        capture_display,
        screenshot_ok,
        dump_ok,
        dump_stale,
        logcat_ok,
    };
    let payload = serde_json::to_string_pretty(&meta).map_err(|err| {
        AppError::system(
            format!("Failed to serialize snapshot meta: {err}"),
            trace_id.as_str(),
        )
    })?;
    fs::write(folder.join("meta.json"), payload).map_err(|err| {
        AppError::system(
            format!("Failed to write snapshot meta: {err}"),
            trace_id.as_str(),
        )
    })?;

    info!(
        serial,
        trace_id = %trace_id,
        directory = %folder.display(),
        "snapshot captured"
    );
    Ok(CommandResponse {
        trace_id,
        data: SnapshotResult {
            directory: folder.to_string_lossy().to_string(),
            meta,
        },
    })
}

/// File-less capture for immediate display. The dump is required; the
/// screenshot rides along when a display answers.
pub fn capture_preview(
    runner: Arc<dyn CommandRunner>,
    directory: &DeviceDirectory,
    config: &AppConfig,
    serial: &str,
    trace_id: Option<String>,
) -> Result<CommandResponse<UiPreview>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    let serial = serial.trim();
    if serial.is_empty() {
        return Err(AppError::validation("Device serial is empty", trace_id));
    }

    let extractor = HierarchyExtractor::new(runner.clone(), config.uix.clone());
    let preferred = preferred_display(config, directory, serial);
    let outcome = extractor
        .extract(serial, directory, preferred.as_deref())
        .map_err(|failure| {
            AppError::dependency(failure.reason().to_string(), trace_id.as_str())
        })?;

    let timeout = Duration::from_secs(config.adb.command_timeout_secs);
    let grabber = ScreenshotGrabber::new(runner, timeout);
    let mut display = outcome.display.clone();
    let screenshot = match grabber.capture_best(serial, directory) {
        Ok((answered, bytes)) => {
            display = Some(answered);
            match png_data_url(&bytes) {
                Ok(url) => Some(url),
                Err(reason) => {
                    warn!(serial, reason = %reason, "preview screenshot unusable");
                    None
                }
            }
        }
        Err(err) => {
            warn!(serial, error = %err, "preview screenshot failed");
            None
        }
    };

    Ok(CommandResponse {
        trace_id,
        data: UiPreview {
            xml: outcome.raw,
            screenshot,
            display,
            stale: outcome.stale,
        },
    })
}

fn preferred_display(
    config: &AppConfig,
    directory: &DeviceDirectory,
    serial: &str,
) -> Option<String> {
    if config.screenshot.display_id >= 0 {
        return Some(config.screenshot.display_id.to_string());
    }
    directory.best_display(serial)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adb::runner::testing::ScriptedRunner;
    use crate::adb::screenshot::looks_like_png;
    use crate::error::ErrorCode;
    use crate::mirror::frame::test_support::tiny_png;

    fn sizeable_dump() -> String {
        let node = "<node class=\"android.widget.TextView\" text=\"row\" bounds=\"[0,0][100,40]\"/>";
        format!("<hierarchy>{}</hierarchy>", node.repeat(4))
    }

    fn fast_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.adb.command_timeout_secs = 2;
        config.uix.dump_timeout_secs = 2;
        config.uix.file_settle_ms = 10;
        config.uix.killed_retries = 0;
        config
    }

    fn script_device(runner: &ScriptedRunner) {
        runner.respond("which uiautomator", "/system/bin/uiautomator\n");
        runner.respond(
            "uiautomator dump /sdcard/window_dump.xml",
            "UI hierchary dumped to: /sdcard/window_dump.xml\n",
        );
        runner.respond("du -b", "48211\t/sdcard/window_dump.xml\n");
        runner.respond("exec-out cat", &sizeable_dump());
        runner.respond_bytes("exec-out screencap -p -d 0", tiny_png(8, 4));
        runner.respond(
            "logcat -d -t 500",
            "08-22 10:01:02.123 I/ActivityManager( 812): Start proc\n",
        );
        runner.respond(
            "dumpsys window windows",
            "mCurrentFocus=Window{9f u0 com.example.app/.MainActivity}\n",
        );
        runner.respond("dumpsys power", "mWakefulness=Awake\n");
        runner.respond(
            "getprop",
            "[ro.product.model]: [Pixel 8]\n[ro.build.version.release]: [14]\n",
        );
    }

    fn setup(runner: &ScriptedRunner) -> (Arc<dyn CommandRunner>, DeviceDirectory) {
        let shared: Arc<dyn CommandRunner> = Arc::new(runner.clone_handle());
        let directory = DeviceDirectory::new(shared.clone(), Duration::from_secs(2));
        directory.remember_best_display("SER", "0");
        (shared, directory)
    }

    #[test]
    fn writes_all_four_artifacts() {
        let runner = ScriptedRunner::new();
        script_device(&runner);
        let (shared, directory) = setup(&runner);
        let parent = tempfile::tempdir().expect("tempdir");

        let response = capture_snapshot(
            shared,
            &directory,
            &fast_config(),
            "SER",
            parent.path(),
            Some("trace-snap".to_string()),
        )
        .expect("snapshot");
        assert_eq!(response.trace_id, "trace-snap");
        let result = response.data;
        let folder = Path::new(&result.directory);

        let shot = fs::read(folder.join("screenshot.png")).expect("screenshot");
        assert!(looks_like_png(&shot));
        let dump = fs::read_to_string(folder.join("dump.uix")).expect("dump");
        assert!(dump.contains("<hierarchy"));
        let log = fs::read_to_string(folder.join("logcat.txt")).expect("logcat");
        assert!(log.contains("ActivityManager"));
        let meta: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(folder.join("meta.json")).expect("meta"))
                .expect("meta json");
        assert_eq!(meta["serial"], "SER");
        assert_eq!(meta["model"], "Pixel 8");
        assert_eq!(meta["power_state"], "Awake");
        assert_eq!(meta["focused_window"], "com.example.app/.MainActivity");
        assert!(result.meta.screenshot_ok);
        assert!(result.meta.dump_ok);
        assert!(result.meta.logcat_ok);
        assert!(!result.meta.dump_stale);
    }

    #[test]
    fn failed_dump_leaves_a_placeholder_and_a_flag() {
        let runner = ScriptedRunner::new();
        runner.respond_exit("which uiautomator", "", "", 1);
        runner.respond_bytes("exec-out screencap -p -d 0", tiny_png(8, 4));
        runner.respond("logcat -d -t 500", "ok\n");
        let (shared, directory) = setup(&runner);
        let parent = tempfile::tempdir().expect("tempdir");

        let result =
            capture_snapshot(shared, &directory, &fast_config(), "SER", parent.path(), None)
                .expect("snapshot")
                .data;
        assert!(!result.meta.dump_ok);
        assert!(result.meta.screenshot_ok);
        let dump = fs::read_to_string(Path::new(&result.directory).join("dump.uix")).expect("dump");
        assert_eq!(dump, DUMP_ERROR_PLACEHOLDER);
    }

    #[test]
    fn preview_pairs_dump_with_data_url() {
        let runner = ScriptedRunner::new();
        script_device(&runner);
        let (shared, directory) = setup(&runner);

        let preview = capture_preview(shared, &directory, &fast_config(), "SER", None)
            .expect("preview")
            .data;
        assert!(preview.xml.contains("<hierarchy"));
        let url = preview.screenshot.expect("data url");
        assert!(url.starts_with("data:image/png;base64,"));
        assert_eq!(preview.display.as_deref(), Some("0"));
    }

    #[test]
    fn preview_requires_a_dump() {
        let runner = ScriptedRunner::new();
        runner.respond_exit("which uiautomator", "", "", 1);
        let (shared, directory) = setup(&runner);

        let err = capture_preview(shared, &directory, &fast_config(), "SER", None)
            .expect_err("no dump, no preview");
        assert_eq!(err.code, ErrorCode::Dependency);
        assert!(!err.trace_id.is_empty());
    }

    #[test]
    fn rejects_an_empty_serial() {
        let runner = ScriptedRunner::new();
        let (shared, directory) = setup(&runner);
        let parent = tempfile::tempdir().expect("tempdir");
        let err = capture_snapshot(shared, &directory, &fast_config(), " ", parent.path(), None)
            .expect_err("blank serial");
        assert_eq!(err.code, ErrorCode::Validation);
    }
}
