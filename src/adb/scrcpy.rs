use std::path::Path;
use std::time::Duration;

use uuid::Uuid;

use crate::adb::env::{expand_home, normalize_command_path};
use crate::adb::runner::run_command_with_timeout;
use crate::config::{MirrorSettings, ScrcpySettings};
use crate::models::ScrcpyInfo;

const VERSION_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Locates a usable scrcpy binary: configured path first, then environment
/// overrides, then PATH, then the usual install locations.
pub fn check_scrcpy(settings: &ScrcpySettings) -> ScrcpyInfo {
    let mut result = ScrcpyInfo {
        available: false,
        version_output: String::new(),
        major_version: 2,
        command_path: "scrcpy".to_string(),
    };

    let mut candidates: Vec<String> = Vec::new();
    let configured = normalize_command_path(&settings.command_path);
    if !configured.is_empty() {
        candidates.push(expand_home(&configured));
    }
    for var in ["DROIDGLASS_SCRCPY", "SCRCPY"] {
        if let Ok(value) = std::env::var(var) {
            let trimmed = normalize_command_path(&value);
            if !trimmed.is_empty() {
                candidates.push(expand_home(&trimmed));
            }
        }
    }
    candidates.push("scrcpy".to_string());

    let system = std::env::consts::OS;
    let common_paths = if system == "macos" {
        vec![
            "/opt/homebrew/bin/scrcpy",
            "/usr/local/bin/scrcpy",
            "~/Applications/scrcpy.app/Contents/MacOS/scrcpy",
        ]
    } else if system == "windows" {
        vec![
            "C:\\Program Files\\scrcpy\\scrcpy.exe",
            "C:\\scrcpy\\scrcpy.exe",
        ]
    } else {
        vec![
            "/usr/bin/scrcpy",
            "/usr/local/bin/scrcpy",
            "/snap/bin/scrcpy",
            "~/.local/bin/scrcpy",
            "/opt/scrcpy/scrcpy",
        ]
    };
    for path in common_paths {
        let expanded = expand_home(path);
        if Path::new(&expanded).exists() {
            candidates.push(expanded);
        }
    }

    for candidate in candidates {
        if let Some(output) = try_version(&candidate) {
            result.available = true;
            result.version_output = output.lines().next().unwrap_or("").trim().to_string();
            result.major_version = parse_scrcpy_major(&output);
            result.command_path = candidate;
            return result;
        }
    }

    result
}

fn try_version(command: &str) -> Option<String> {
    let output = run_command_with_timeout(
        command,
        &["--version".to_string()],
        VERSION_PROBE_TIMEOUT,
    );
    if output.success() && !output.stdout.trim().is_empty() {
        Some(output.stdout.trim().to_string())
    } else {
        None
    }
}

pub fn parse_scrcpy_major(output: &str) -> i32 {
    let lower = output.to_lowercase();
    for token in lower.split_whitespace() {
        let token = token.trim_start_matches('v');
        if let Some(major) = token.split('.').next() {
            if let Ok(value) = major.parse::<i32>() {
                return value;
            }
        }
    }
    2
}

/// Unique window title so the capture side can find exactly this instance.
pub fn offscreen_window_title(serial: &str) -> String {
    format!("droidglass-{}-{}", serial, Uuid::new_v4().simple())
}

/// Arguments for the raw-stream mode: no local window, no audio, the encoded
/// video written to stdout for an external decoder to consume.
pub fn raw_stream_args(
    serial: &str,
    settings: &ScrcpySettings,
    mirror: &MirrorSettings,
    major_version: i32,
    display: Option<&str>,
) -> Vec<String> {
    let mut args = vec!["-s".to_string(), serial.to_string()];
    if major_version >= 2 {
        args.push("--no-playback".to_string());
        args.push("--no-audio".to_string());
    } else {
        args.push("--no-display".to_string());
    }
    args.push("--record".to_string());
    args.push("-".to_string());
    args.push("--record-format".to_string());
    args.push("h264".to_string());
    push_tuning(&mut args, settings, mirror, major_version);
    if let Some(id) = display {
        if major_version >= 2 {
            args.push("--display-id".to_string());
        } else {
            args.push("--display".to_string());
        }
        args.push(id.to_string());
    }
    push_extra(&mut args, settings);
    args
}

/// Arguments for the off-screen window mode: a real scrcpy window parked far
/// outside the visible desktop, identified by title for screen capture.
pub fn window_capture_args(
    serial: &str,
    settings: &ScrcpySettings,
    mirror: &MirrorSettings,
    major_version: i32,
    window_title: &str,
) -> Vec<String> {
    let mut args = vec![
        "-s".to_string(),
        serial.to_string(),
        "--window-title".to_string(),
        window_title.to_string(),
        "--window-x".to_string(),
        "-32000".to_string(),
        "--window-y".to_string(),
        "-32000".to_string(),
        "--window-borderless".to_string(),
    ];
    if major_version >= 2 {
        args.push("--no-audio".to_string());
    }
    push_tuning(&mut args, settings, mirror, major_version);
    push_extra(&mut args, settings);
    args
}

fn push_tuning(
    args: &mut Vec<String>,
    settings: &ScrcpySettings,
    mirror: &MirrorSettings,
    major_version: i32,
) {
    if settings.bit_rate_mbps > 0 {
        if major_version >= 2 {
            args.push("--video-bit-rate".to_string());
        } else {
            args.push("--bit-rate".to_string());
        }
        args.push(format!("{}M", settings.bit_rate_mbps));
    }
    if settings.max_size > 0 {
        args.push("--max-size".to_string());
        args.push(settings.max_size.to_string());
    }
    if mirror.max_fps > 0 {
        args.push("--max-fps".to_string());
        args.push(mirror.max_fps.to_string());
    }
}

fn push_extra(args: &mut Vec<String>, settings: &ScrcpySettings) {
    if !settings.extra_args.trim().is_empty() {
        args.extend(
            settings
                .extra_args
                .split_whitespace()
                .map(|part| part.to_string()),
        );
    }
}
