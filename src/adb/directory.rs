use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, warn};

use crate::adb::env::current_env;
use crate::adb::parse;
use crate::adb::runner::CommandRunner;
use crate::error::AppError;
use crate::history::{history_path, record_device, DeviceRecord};
use crate::models::{
    AdbInfo, CompositorLayer, Device, DeviceDetail, DeviceState, DisplayInfo, RootStatus,
    Wakefulness,
};

/// Per-device facts learned at runtime. Probes consult these before paying
/// for another round trip; entries are dropped wholesale on `forget`.
#[derive(Debug, Default, Clone)]
pub struct DeviceHints {
    pub best_display: Option<String>,
    pub displays: Option<Vec<DisplayInfo>>,
    pub screen_size: Option<(u32, u32)>,
    pub dump_service_available: Option<bool>,
}

/// Front door for everything the engine asks a device: enumeration, wireless
/// connect, property lookups, display topology, and power state.
pub struct DeviceDirectory {
    runner: Arc<dyn CommandRunner>,
    timeout: Duration,
    history_limit: Option<usize>,
    hints: Mutex<HashMap<String, DeviceHints>>,
}

impl DeviceDirectory {
    pub fn new(runner: Arc<dyn CommandRunner>, timeout: Duration) -> Self {
        Self {
            runner,
            timeout,
            history_limit: None,
            hints: Mutex::new(HashMap::new()),
        }
    }

    /// Enables connection-history recording for devices seen online.
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = Some(limit);
        self
    }

    fn run(&self, args: &[&str]) -> crate::adb::runner::CommandOutput {
        let owned: Vec<String> = args.iter().map(|value| value.to_string()).collect();
        self.runner.run(&owned, self.timeout)
    }

    fn shell(&self, serial: &str, args: &[&str]) -> crate::adb::runner::CommandOutput {
        let mut full = vec!["-s", serial, "shell"];
        full.extend_from_slice(args);
        self.run(&full)
    }

    pub fn check_adb(&self) -> AdbInfo {
        let output = self.run(&["version"]);
        let env = current_env();
        if output.success() {
            AdbInfo {
                available: true,
                version_output: output.stdout.lines().next().unwrap_or("").trim().to_string(),
                command_path: env.adb_program,
                error: None,
            }
        } else {
            AdbInfo {
                available: false,
                version_output: String::new(),
                command_path: env.adb_program,
                error: Some(output.stderr.trim().to_string()),
            }
        }
    }

    pub fn list_devices(&self) -> Result<Vec<Device>, AppError> {
        let output = self.run(&["devices", "-l"]);
        if !output.success() {
            warn!(stderr = %output.stderr.trim(), "device enumeration failed");
            return Err(AppError::dependency(
                format!("adb devices failed: {}", output.stderr.trim()),
                "",
            ));
        }
        let devices = parse::parse_adb_devices(&output.stdout);
        if let Some(limit) = self.history_limit {
            for device in devices.iter().filter(|d| d.state == DeviceState::Online) {
                let address = device.serial.contains(':').then(|| device.serial.clone());
                let record = DeviceRecord::new(&device.serial, &device.model, address);
                if let Err(err) = record_device(&history_path(), record, limit) {
                    debug!(error = %err, "could not record device history");
                }
            }
        }
        Ok(devices)
    }

    pub fn connect(&self, address: &str) -> Result<bool, AppError> {
        let trimmed = address.trim();
        if trimmed.is_empty() {
            return Err(AppError::validation("Connect address is empty", ""));
        }
        let output = self.run(&["connect", trimmed]);
        let combined = format!("{}\n{}", output.stdout, output.stderr);
        Ok(parse::parse_connect_result(&combined))
    }

    pub fn disconnect(&self, address: &str) -> Result<bool, AppError> {
        let trimmed = address.trim();
        if trimmed.is_empty() {
            return Err(AppError::validation("Disconnect address is empty", ""));
        }
        let output = self.run(&["disconnect", trimmed]);
        let combined = format!("{}\n{}", output.stdout, output.stderr);
        Ok(parse::parse_disconnect_result(&combined))
    }

    /// Single `getprop` value, trimmed. Failed or empty lookups yield `None`.
    pub fn property(&self, serial: &str, key: &str) -> Option<String> {
        let output = self.shell(serial, &["getprop", key]);
        if !output.success() {
            return None;
        }
        let value = output.stdout.trim();
        (!value.is_empty()).then(|| value.to_string())
    }

    pub fn device_detail(&self, serial: &str) -> Result<DeviceDetail, AppError> {
        let output = self.shell(serial, &["getprop"]);
        if !output.success() && output.stdout.trim().is_empty() {
            return Err(AppError::dependency(
                format!("getprop failed for {serial}: {}", output.stderr.trim()),
                "",
            ));
        }
        let map = parse::parse_getprop_map(&output.stdout);
        let mut detail = parse::build_device_detail(serial, &map);
        let battery = self.shell(serial, &["dumpsys", "battery"]);
        detail.battery_level = parse::parse_battery_level(&battery.stdout);
        if let Some((width, height)) = self.screen_size(serial) {
            detail.screen_width = Some(width);
            detail.screen_height = Some(height);
        }
        Ok(detail)
    }

    /// Display topology via a three-tier probe. Later tiers only run when the
    /// earlier ones yield nothing; a bare display 0 stands in when every tier
    /// comes back empty.
    pub fn displays(&self, serial: &str) -> Vec<DisplayInfo> {
        if let Some(cached) = self.hint(serial, |h| h.displays.clone()) {
            return cached;
        }
        let mut displays = {
            let output = self.shell(serial, &["cmd", "display", "get-displays"]);
            parse::parse_display_list(&output.stdout)
        };
        if displays.is_empty() {
            let output = self.shell(serial, &["dumpsys", "display"]);
            displays = parse::parse_display_viewports(&output.stdout);
        }
        if displays.is_empty() {
            let output = self.shell(serial, &["dumpsys", "SurfaceFlinger", "--display-id"]);
            displays = parse::parse_surfaceflinger_displays(&output.stdout);
        }
        if displays.is_empty() {
            debug!(serial, "no display probe succeeded, assuming display 0");
            displays = vec![DisplayInfo {
                id: "0".to_string(),
                label: "Default display".to_string(),
                width: 0,
                height: 0,
            }];
        }
        self.update_hint(serial, |h| h.displays = Some(displays.clone()));
        displays
    }

    pub fn screen_size(&self, serial: &str) -> Option<(u32, u32)> {
        if let Some(cached) = self.hint(serial, |h| h.screen_size) {
            return Some(cached);
        }
        let wm = self.shell(serial, &["wm", "size"]);
        let mut size = parse::parse_wm_size(&wm.stdout);
        if size.is_none() {
            let dump = self.shell(serial, &["dumpsys", "display"]);
            size = parse::parse_display_device_size(&dump.stdout);
        }
        if let Some(found) = size {
            self.update_hint(serial, |h| h.screen_size = Some(found));
        } else {
            warn!(serial, "screen size could not be determined");
        }
        size
    }

    pub fn wakefulness(&self, serial: &str) -> Wakefulness {
        let output = self.shell(serial, &["dumpsys", "power"]);
        parse::parse_wakefulness(&output.stdout)
    }

    pub fn focused_window(&self, serial: &str) -> Option<String> {
        let output = self.shell(serial, &["dumpsys", "window", "windows"]);
        parse::parse_focused_window(&output.stdout)
    }

    pub fn compositor_layers(&self, serial: &str) -> Vec<CompositorLayer> {
        let output = self.shell(serial, &["dumpsys", "SurfaceFlinger"]);
        parse::parse_compositor_layers(&output.stdout)
    }

    /// True when any compositor layer carries the secure flag, which blanks
    /// screenshots and raw video for that content.
    pub fn has_secure_layer(&self, serial: &str) -> bool {
        self.compositor_layers(serial)
            .iter()
            .any(|layer| layer.secure)
    }

    pub fn restart_as_root(&self, serial: &str) -> RootStatus {
        let output = self.run(&["-s", serial, "root"]);
        let combined = format!("{}\n{}", output.stdout, output.stderr);
        RootStatus::from_output(&combined)
    }

    pub fn best_display(&self, serial: &str) -> Option<String> {
        self.hint(serial, |h| h.best_display.clone())
    }

    pub fn remember_best_display(&self, serial: &str, display_id: &str) {
        self.update_hint(serial, |h| h.best_display = Some(display_id.to_string()));
    }

    pub fn dump_service_available(&self, serial: &str) -> Option<bool> {
        self.hint(serial, |h| h.dump_service_available)
    }

    pub fn remember_dump_service(&self, serial: &str, available: bool) {
        self.update_hint(serial, |h| h.dump_service_available = Some(available));
    }

    /// Drops every cached hint for a device. Called after reconnects, when
    /// topology may have changed under us.
    pub fn forget(&self, serial: &str) {
        if let Ok(mut hints) = self.hints.lock() {
            hints.remove(serial);
        }
    }

    fn hint<T>(&self, serial: &str, read: impl FnOnce(&DeviceHints) -> Option<T>) -> Option<T> {
        let hints = self.hints.lock().ok()?;
        hints.get(serial).and_then(|entry| read(entry))
    }

    fn update_hint(&self, serial: &str, write: impl FnOnce(&mut DeviceHints)) {
        if let Ok(mut hints) = self.hints.lock() {
            write(hints.entry(serial.to_string()).or_default());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adb::runner::testing::ScriptedRunner;

    fn directory(runner: ScriptedRunner) -> DeviceDirectory {
        DeviceDirectory::new(Arc::new(runner), Duration::from_secs(5))
    }

    #[test]
    fn lists_devices() {
        let runner = ScriptedRunner::new();
        runner.respond(
            "devices -l",
            "List of devices attached\nABC123 device model:Pixel_7\n",
        );
        let dir = directory(runner);
        let devices = dir.list_devices().unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].model, "Pixel 7");
    }

    #[test]
    fn enumeration_failure_is_an_error() {
        let runner = ScriptedRunner::new();
        runner.respond_exit("devices -l", "", "adb: no server running", 1);
        let dir = directory(runner);
        assert!(dir.list_devices().is_err());
    }

    #[test]
    fn display_probe_falls_through_tiers_and_caches() {
        let runner = ScriptedRunner::new();
        runner.respond_exit("cmd display get-displays", "", "Unknown command: get-displays", 255);
        runner.respond(
            "dumpsys display",
            "mViewports=[DisplayViewport{displayId=0, uniqueId='local:123', logicalFrame=Rect(0, 0 - 1080, 2400)}]",
        );
        let dir = directory(runner.clone_handle());
        let first = dir.displays("ABC");
        assert_eq!(first.len(), 1);
        assert_eq!((first[0].width, first[0].height), (1080, 2400));
        let before = runner.invocations().len();
        let second = dir.displays("ABC");
        assert_eq!(second, first);
        assert_eq!(runner.invocations().len(), before);
    }

    #[test]
    fn display_probe_assumes_display_zero_when_everything_fails() {
        let runner = ScriptedRunner::new();
        runner.respond_exit("cmd display get-displays", "", "failed", 1);
        runner.respond_exit("dumpsys display", "", "failed", 1);
        runner.respond_exit("dumpsys SurfaceFlinger --display-id", "", "failed", 1);
        let dir = directory(runner);
        let displays = dir.displays("ABC");
        assert_eq!(displays.len(), 1);
        assert_eq!(displays[0].id, "0");
        assert!(!displays[0].has_bounds());
    }

    #[test]
    fn screen_size_prefers_wm_then_falls_back() {
        let runner = ScriptedRunner::new();
        runner.respond_exit("wm size", "", "service not running", 1);
        runner.respond(
            "dumpsys display",
            "DisplayDeviceInfo{deviceWidth=720, deviceHeight=1600}",
        );
        let dir = directory(runner);
        assert_eq!(dir.screen_size("ABC"), Some((720, 1600)));
    }

    #[test]
    fn assembles_device_detail() {
        let runner = ScriptedRunner::new();
        runner.respond(
            "shell getprop",
            "[ro.product.brand]: [google]\n[ro.product.model]: [Pixel 7]\n[ro.build.version.release]: [14]\n[ro.secure]: [1]\n",
        );
        runner.respond("dumpsys battery", "level: 55\n");
        runner.respond("wm size", "Physical size: 1080x2400\n");
        let dir = directory(runner);
        let detail = dir.device_detail("ABC").unwrap();
        assert_eq!(detail.model.as_deref(), Some("Pixel 7"));
        assert_eq!(detail.battery_level, Some(55));
        assert_eq!(detail.screen_width, Some(1080));
        assert!(detail.secure);
    }

    #[test]
    fn reports_root_status() {
        let runner = ScriptedRunner::new();
        runner.respond("root", "restarting adbd as root\n");
        let dir = directory(runner);
        assert_eq!(dir.restart_as_root("ABC"), RootStatus::Restarting);
    }

    #[test]
    fn single_property_lookup_trims_the_value() {
        let runner = ScriptedRunner::new();
        runner.respond("getprop ro.product.model", "Pixel 6\n");
        let dir = directory(runner);
        assert_eq!(
            dir.property("ABC", "ro.product.model").as_deref(),
            Some("Pixel 6")
        );
        assert_eq!(dir.property("ABC", "ro.missing"), None);
    }

    #[test]
    fn wireless_connect_judges_client_output() {
        let runner = ScriptedRunner::new();
        runner.respond("connect 192.168.0.10:5555", "connected to 192.168.0.10:5555\n");
        let dir = directory(runner);
        assert!(dir.connect("192.168.0.10:5555").unwrap());
        assert!(dir.connect("   ").is_err());
    }

    #[test]
    fn secure_layers_are_surfaced() {
        let runner = ScriptedRunner::new();
        runner.respond(
            "dumpsys SurfaceFlinger",
            "+ Layer 0x1 (StatusBar#0)\n    isOpaque=1\n+ Layer 0x2 (com.bank.app/.PinActivity#0)\n    isSecure=1\n",
        );
        let dir = directory(runner);
        assert!(dir.has_secure_layer("ABC"));
    }

    #[test]
    fn forget_clears_hints() {
        let runner = ScriptedRunner::new();
        let dir = directory(runner);
        dir.remember_best_display("ABC", "2");
        assert_eq!(dir.best_display("ABC").as_deref(), Some("2"));
        dir.forget("ABC");
        assert_eq!(dir.best_display("ABC"), None);
    }
}
