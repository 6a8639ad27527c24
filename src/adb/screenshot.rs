use std::fs;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::adb::directory::DeviceDirectory;
use crate::adb::runner::CommandRunner;
use crate::error::AppError;

pub const PNG_SIGNATURE: [u8; 8] = [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];

const REMOTE_STAGING_PATH: &str = "/data/local/tmp/droidglass_screencap.png";

pub fn looks_like_png(bytes: &[u8]) -> bool {
    bytes.len() > PNG_SIGNATURE.len() && bytes.starts_with(&PNG_SIGNATURE)
}

/// Captures device screenshots. The fast path streams PNG bytes over
/// `exec-out`; when that transport mangles or refuses the payload the image
/// is staged on the device and pulled instead.
pub struct ScreenshotGrabber {
    runner: Arc<dyn CommandRunner>,
    timeout: Duration,
}

impl ScreenshotGrabber {
    pub fn new(runner: Arc<dyn CommandRunner>, timeout: Duration) -> Self {
        Self { runner, timeout }
    }

    pub fn capture(&self, serial: &str, display: Option<&str>) -> Result<Vec<u8>, AppError> {
        if let Some(bytes) = self.capture_exec_out(serial, display) {
            return Ok(bytes);
        }
        debug!(serial, "exec-out screencap failed, staging through pull");
        self.capture_via_pull(serial, display)
    }

    fn capture_exec_out(&self, serial: &str, display: Option<&str>) -> Option<Vec<u8>> {
        let mut args = vec![
            "-s".to_string(),
            serial.to_string(),
            "exec-out".to_string(),
            "screencap".to_string(),
            "-p".to_string(),
        ];
        if let Some(id) = display {
            args.push("-d".to_string());
            args.push(id.to_string());
        }
        let output = self.runner.run_raw(&args, self.timeout);
        if output.success() && looks_like_png(&output.stdout) {
            Some(output.stdout)
        } else {
            None
        }
    }

    fn capture_via_pull(&self, serial: &str, display: Option<&str>) -> Result<Vec<u8>, AppError> {
        let mut screencap = vec![
            "-s".to_string(),
            serial.to_string(),
            "shell".to_string(),
            "screencap".to_string(),
            "-p".to_string(),
        ];
        if let Some(id) = display {
            screencap.push("-d".to_string());
            screencap.push(id.to_string());
        }
        screencap.push(REMOTE_STAGING_PATH.to_string());
        let staged = self.runner.run(&screencap, self.timeout);
        if !staged.success() {
            return Err(AppError::dependency(
                format!("screencap failed on {serial}: {}", staged.stderr.trim()),
                "",
            ));
        }

        let staging_dir = tempfile::tempdir()
            .map_err(|err| AppError::system(format!("Failed to create staging dir: {err}"), ""))?;
        let local_path = staging_dir.path().join("screencap.png");
        let local = local_path.to_string_lossy().to_string();
        let pulled = self.runner.run(
            &[
                "-s".to_string(),
                serial.to_string(),
                "pull".to_string(),
                REMOTE_STAGING_PATH.to_string(),
                local.clone(),
            ],
            self.timeout,
        );
        // Best effort, the staging file is tiny and overwritten next time.
        let _ = self.runner.run(
            &[
                "-s".to_string(),
                serial.to_string(),
                "shell".to_string(),
                "rm".to_string(),
                "-f".to_string(),
                REMOTE_STAGING_PATH.to_string(),
            ],
            self.timeout,
        );
        if !pulled.success() {
            return Err(AppError::dependency(
                format!("pull failed on {serial}: {}", pulled.stderr.trim()),
                "",
            ));
        }
        let bytes = fs::read(&local_path)
            .map_err(|err| AppError::system(format!("Failed to read pulled screenshot: {err}"), ""))?;
        if !looks_like_png(&bytes) {
            return Err(AppError::dependency(
                format!("screencap on {serial} did not produce a PNG"),
                "",
            ));
        }
        Ok(bytes)
    }

    /// Finds the display whose screenshot carries the most image data. Blank
    /// or secure displays produce near-empty PNGs, so byte count is a usable
    /// proxy for "the display the tester is looking at". A previously probed
    /// winner is reused directly; only a full probe rewrites the hint.
    pub fn capture_best(
        &self,
        serial: &str,
        directory: &DeviceDirectory,
    ) -> Result<(String, Vec<u8>), AppError> {
        if let Some(preferred) = directory.best_display(serial) {
            if let Some(bytes) = self.capture_exec_out(serial, Some(&preferred)) {
                return Ok((preferred, bytes));
            }
            debug!(serial, display = %preferred, "remembered display stopped answering, reprobing");
        }

        let mut candidates: Vec<String> = directory
            .displays(serial)
            .iter()
            .map(|display| display.id.clone())
            .collect();
        for extra in 0..=5u32 {
            let id = extra.to_string();
            if !candidates.contains(&id) {
                candidates.push(id);
            }
        }

        let mut best: Option<(String, Vec<u8>)> = None;
        for candidate in candidates {
            let Some(bytes) = self.capture_exec_out(serial, Some(&candidate)) else {
                continue;
            };
            let better = best
                .as_ref()
                .map(|(_, current)| bytes.len() > current.len())
                .unwrap_or(true);
            if better {
                best = Some((candidate, bytes));
            }
        }

        if let Some((winner, bytes)) = best {
            directory.remember_best_display(serial, &winner);
            return Ok((winner, bytes));
        }

        warn!(serial, "no display answered the probe, trying an untargeted capture");
        let bytes = self.capture(serial, None)?;
        directory.remember_best_display(serial, "0");
        Ok(("0".to_string(), bytes))
    }
}
