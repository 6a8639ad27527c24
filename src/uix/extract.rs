use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::adb::directory::DeviceDirectory;
use crate::adb::parse::parse_du_size;
use crate::adb::runner::{CommandOutput, CommandRunner};
use crate::config::UixSettings;

pub const DUMP_REMOTE_PATH: &str = "/sdcard/window_dump.xml";

/// Dumps below this size captured only a root placeholder and are treated
/// as trash.
pub const MIN_DUMP_BYTES: usize = 200;

const SERVICE_MISSING: &str = "uiautomator is not available on this device build";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpStrategy {
    StagedFile,
    DirectPipe,
    AlternateShell,
    ExistingFile,
}

impl DumpStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            DumpStrategy::StagedFile => "staged-file",
            DumpStrategy::DirectPipe => "direct-pipe",
            DumpStrategy::AlternateShell => "alternate-shell",
            DumpStrategy::ExistingFile => "existing-file",
        }
    }
}

#[derive(Debug, Clone)]
pub struct DumpOutcome {
    pub raw: String,
    pub display: Option<String>,
    pub compressed: bool,
    pub strategy: DumpStrategy,
    /// True when the dump was rescued from a prior on-device file and may
    /// not reflect the current screen.
    pub stale: bool,
}

/// Terminal failure of one extraction cycle. The chain is exhausted
/// internally; callers see exactly one of these per cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DumpFailure {
    /// The relay or device is unreachable.
    Transport(String),
    /// The dump capability is not registered on this build. Cached, so the
    /// chain is not re-walked every cycle.
    CapabilityAbsent(String),
    /// The device actively killed the dump, usually under memory pressure.
    Refused(String),
    /// No usable output and no explicit error either.
    TransientEmpty(String),
}

impl DumpFailure {
    pub fn reason(&self) -> &str {
        match self {
            DumpFailure::Transport(reason)
            | DumpFailure::CapabilityAbsent(reason)
            | DumpFailure::Refused(reason)
            | DumpFailure::TransientEmpty(reason) => reason,
        }
    }
}

impl std::fmt::Display for DumpFailure {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "{}", self.reason())
    }
}

enum ServiceProbe {
    Present,
    Absent,
    Unreachable(String),
    Inconclusive,
}

/// Multi-strategy hierarchy extraction. The on-device dump service gets
/// killed under memory pressure, is missing on some builds and sometimes
/// writes truncated files, so every cycle walks a fallback chain:
/// staged file, direct pipe, alternate shell surface, each across
/// display-candidate and compression combinations, ending with a rescue
/// read of whatever dump file already exists on the device.
pub struct HierarchyExtractor {
    runner: Arc<dyn CommandRunner>,
    settings: UixSettings,
}

impl HierarchyExtractor {
    pub fn new(runner: Arc<dyn CommandRunner>, settings: UixSettings) -> Self {
        Self { runner, settings }
    }

    pub fn extract(
        &self,
        serial: &str,
        directory: &DeviceDirectory,
        preferred_display: Option<&str>,
    ) -> Result<DumpOutcome, DumpFailure> {
        match directory.dump_service_available(serial) {
            Some(false) => return Err(DumpFailure::CapabilityAbsent(SERVICE_MISSING.to_string())),
            Some(true) => {}
            None => match self.probe_dump_service(serial) {
                ServiceProbe::Present => directory.remember_dump_service(serial, true),
                ServiceProbe::Absent => {
                    directory.remember_dump_service(serial, false);
                    return Err(DumpFailure::CapabilityAbsent(SERVICE_MISSING.to_string()));
                }
                ServiceProbe::Unreachable(reason) => {
                    return Err(DumpFailure::Transport(reason));
                }
                ServiceProbe::Inconclusive => {}
            },
        }

        let candidates = self.display_candidates(serial, directory, preferred_display);
        let mut last_failure =
            DumpFailure::TransientEmpty("no dump strategy produced output".to_string());

        for display in &candidates {
            for compressed in [false, true] {
                for strategy in [
                    DumpStrategy::StagedFile,
                    DumpStrategy::DirectPipe,
                    DumpStrategy::AlternateShell,
                ] {
                    match self.attempt(serial, display.as_deref(), compressed, strategy) {
                        Ok(raw) => {
                            return Ok(DumpOutcome {
                                raw,
                                display: display.clone(),
                                compressed,
                                strategy,
                                stale: false,
                            });
                        }
                        Err(failure) => {
                            let display_id = display.as_deref().unwrap_or("-");
                            debug!(
                                serial,
                                strategy = strategy.as_str(),
                                display = display_id,
                                compressed,
                                reason = failure.reason(),
                                "dump strategy failed"
                            );
                            last_failure = failure;
                        }
                    }
                }
            }
        }

        match self.run_strategy(serial, None, false, DumpStrategy::ExistingFile) {
            Ok(raw) => {
                warn!(serial, "serving a possibly stale on-device dump");
                Ok(DumpOutcome {
                    raw,
                    display: None,
                    compressed: false,
                    strategy: DumpStrategy::ExistingFile,
                    stale: true,
                })
            }
            Err(_) => Err(last_failure),
        }
    }

    /// One strategy attempt, retried with backoff while the device keeps
    /// killing the dump process.
    fn attempt(
        &self,
        serial: &str,
        display: Option<&str>,
        compressed: bool,
        strategy: DumpStrategy,
    ) -> Result<String, DumpFailure> {
        let mut tries: u32 = 0;
        loop {
            let result = self.run_strategy(serial, display, compressed, strategy);
            match result {
                Err(DumpFailure::Refused(reason)) if tries < self.settings.killed_retries => {
                    tries += 1;
                    warn!(serial, reason = %reason, attempt = tries, "dump killed, backing off");
                    thread::sleep(Duration::from_millis(200 * u64::from(tries)));
                }
                other => return other,
            }
        }
    }

    fn run_strategy(
        &self,
        serial: &str,
        display: Option<&str>,
        compressed: bool,
        strategy: DumpStrategy,
    ) -> Result<String, DumpFailure> {
        match strategy {
            DumpStrategy::StagedFile => self.staged_file(serial, display, compressed),
            DumpStrategy::DirectPipe => self.direct_pipe(serial, display, compressed),
            DumpStrategy::AlternateShell => self.alternate_shell(serial, display, compressed),
            DumpStrategy::ExistingFile => self.read_existing(serial),
        }
    }

    fn staged_file(
        &self,
        serial: &str,
        display: Option<&str>,
        compressed: bool,
    ) -> Result<String, DumpFailure> {
        let _ = self.shell(serial, &["rm", "-f", DUMP_REMOTE_PATH]);
        let dump = self.run_dump_to(serial, display, compressed, DUMP_REMOTE_PATH);
        if let Some(DumpFailure::Refused(reason)) = classify_failure(&dump) {
            return Err(DumpFailure::Refused(reason));
        }

        let mut size = self.staged_size(serial);
        if size < MIN_DUMP_BYTES {
            // The service occasionally reports success before the file is
            // fully flushed. One settle-and-redo before giving up.
            thread::sleep(Duration::from_millis(self.settings.file_settle_ms));
            let redo = self.run_dump_to(serial, display, compressed, DUMP_REMOTE_PATH);
            if let Some(DumpFailure::Refused(reason)) = classify_failure(&redo) {
                return Err(DumpFailure::Refused(reason));
            }
            size = self.staged_size(serial);
        }
        if size < MIN_DUMP_BYTES {
            return Err(classify_failure(&dump).unwrap_or_else(|| {
                DumpFailure::TransientEmpty(format!(
                    "dump file stayed below {MIN_DUMP_BYTES} bytes"
                ))
            }));
        }

        let content = self.runner.run(
            &owned(&["-s", serial, "exec-out", "cat", DUMP_REMOTE_PATH]),
            self.timeout(),
        );
        if let Some(failure) = classify_failure(&content) {
            return Err(failure);
        }
        ensure_usable(&content.stdout, "staged dump file")
    }

    fn direct_pipe(
        &self,
        serial: &str,
        display: Option<&str>,
        compressed: bool,
    ) -> Result<String, DumpFailure> {
        let output = self.run_dump_to(serial, display, compressed, "/dev/tty");
        if let Some(failure) = classify_failure(&output) {
            return Err(failure);
        }
        // The service appends its "dumped to:" banner after the XML.
        let mut raw = output.stdout;
        if let Some(marker) = raw.rfind("UI hierchary dumped to:") {
            raw.truncate(marker);
        }
        ensure_usable(raw.trim(), "direct pipe")
    }

    fn alternate_shell(
        &self,
        serial: &str,
        display: Option<&str>,
        compressed: bool,
    ) -> Result<String, DumpFailure> {
        let mut command = String::from("uiautomator dump");
        if compressed {
            command.push_str(" --compressed");
        }
        if let Some(id) = display {
            command.push_str(" --display-id ");
            command.push_str(id);
        }
        command.push(' ');
        command.push_str(DUMP_REMOTE_PATH);
        command.push_str(" >/dev/null 2>&1; cat ");
        command.push_str(DUMP_REMOTE_PATH);

        let output = self.runner.run(
            &owned(&["-s", serial, "shell", &command]),
            self.timeout(),
        );
        if let Some(failure) = classify_failure(&output) {
            return Err(failure);
        }
        ensure_usable(output.stdout.trim(), "alternate shell surface")
    }

    fn read_existing(&self, serial: &str) -> Result<String, DumpFailure> {
        let output = self.runner.run(
            &owned(&["-s", serial, "exec-out", "cat", DUMP_REMOTE_PATH]),
            self.timeout(),
        );
        if let Some(failure) = classify_failure(&output) {
            return Err(failure);
        }
        ensure_usable(output.stdout.trim(), "prior on-device dump")
    }

    fn run_dump_to(
        &self,
        serial: &str,
        display: Option<&str>,
        compressed: bool,
        target: &str,
    ) -> CommandOutput {
        let mut args = vec![
            "-s".to_string(),
            serial.to_string(),
            "shell".to_string(),
            "uiautomator".to_string(),
            "dump".to_string(),
        ];
        if compressed {
            args.push("--compressed".to_string());
        }
        if let Some(id) = display {
            args.push("--display-id".to_string());
            args.push(id.to_string());
        }
        args.push(target.to_string());
        self.runner.run(&args, self.timeout())
    }

    fn staged_size(&self, serial: &str) -> usize {
        let output = self.shell(serial, &["du", "-b", DUMP_REMOTE_PATH]);
        parse_du_size(&output.stdout).unwrap_or(0) as usize
    }

    fn probe_dump_service(&self, serial: &str) -> ServiceProbe {
        let output = self.shell(serial, &["which", "uiautomator"]);
        if output.exit_code == Some(-1) {
            return ServiceProbe::Unreachable(output.stderr.trim().to_string());
        }
        if output.success() && !output.stdout.trim().is_empty() {
            return ServiceProbe::Present;
        }
        if output.exit_code == Some(1)
            && output.stdout.trim().is_empty()
            && output.stderr.trim().is_empty()
        {
            return ServiceProbe::Absent;
        }
        // `which` itself may be missing on minimal builds. Not evidence
        // either way; let the dump attempts decide.
        ServiceProbe::Inconclusive
    }

    fn display_candidates(
        &self,
        serial: &str,
        directory: &DeviceDirectory,
        preferred: Option<&str>,
    ) -> Vec<Option<String>> {
        let mut candidates: Vec<Option<String>> = Vec::new();
        if let Some(id) = preferred {
            candidates.push(Some(id.to_string()));
        }
        candidates.push(None);
        for display in directory.displays(serial) {
            if preferred != Some(display.id.as_str()) {
                candidates.push(Some(display.id));
            }
        }
        candidates
    }

    fn shell(&self, serial: &str, args: &[&str]) -> CommandOutput {
        let mut full = vec!["-s", serial, "shell"];
        full.extend_from_slice(args);
        self.runner.run(&owned(&full), self.timeout())
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.settings.dump_timeout_secs)
    }
}

fn owned(args: &[&str]) -> Vec<String> {
    args.iter().map(|value| value.to_string()).collect()
}

fn ensure_usable(raw: &str, source: &str) -> Result<String, DumpFailure> {
    if raw.len() >= MIN_DUMP_BYTES && (raw.contains("<hierarchy") || raw.contains("<node")) {
        Ok(raw.to_string())
    } else {
        Err(DumpFailure::TransientEmpty(format!(
            "{source} returned no usable dump"
        )))
    }
}

fn classify_failure(output: &CommandOutput) -> Option<DumpFailure> {
    if output.exit_code == Some(-1) {
        return Some(DumpFailure::Transport(output.stderr.trim().to_string()));
    }
    if output.exit_code == Some(137)
        || output.stdout.contains("Killed")
        || output.stderr.contains("Killed")
    {
        return Some(DumpFailure::Refused(
            "dump process was killed by the device".to_string(),
        ));
    }
    if !output.success() {
        let detail = if output.stderr.trim().is_empty() {
            format!("dump command failed with code {:?}", output.exit_code)
        } else {
            output.stderr.trim().to_string()
        };
        return Some(DumpFailure::TransientEmpty(detail));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adb::runner::testing::ScriptedRunner;

    fn fast_settings() -> UixSettings {
        UixSettings {
            dump_timeout_secs: 2,
            file_settle_ms: 10,
            killed_retries: 2,
        }
    }

    fn sizeable_dump() -> String {
        let node = "<node class=\"android.widget.TextView\" text=\"row\" bounds=\"[0,0][100,40]\"/>";
        format!("<hierarchy>{}</hierarchy>", node.repeat(4))
    }

    fn extractor(runner: &ScriptedRunner) -> HierarchyExtractor {
        HierarchyExtractor::new(Arc::new(runner.clone_handle()), fast_settings())
    }

    fn directory(runner: &ScriptedRunner) -> DeviceDirectory {
        DeviceDirectory::new(Arc::new(runner.clone_handle()), Duration::from_secs(2))
    }

    #[test]
    fn staged_file_strategy_wins_when_healthy() {
        let runner = ScriptedRunner::new();
        runner.respond("which uiautomator", "/system/bin/uiautomator\n");
        runner.respond(
            "uiautomator dump /sdcard/window_dump.xml",
            "UI hierchary dumped to: /sdcard/window_dump.xml\n",
        );
        runner.respond("du -b", "48211\t/sdcard/window_dump.xml\n");
        runner.respond("exec-out cat", &sizeable_dump());

        let outcome = extractor(&runner)
            .extract("SER", &directory(&runner), None)
            .expect("dump");
        assert_eq!(outcome.strategy, DumpStrategy::StagedFile);
        assert!(!outcome.stale);
        assert!(!outcome.compressed);
        assert!(outcome.raw.contains("<hierarchy"));
    }

    #[test]
    fn missing_service_short_circuits_and_is_cached() {
        let runner = ScriptedRunner::new();
        runner.respond_exit("which uiautomator", "", "", 1);
        let extractor = extractor(&runner);
        let dir = directory(&runner);

        let first = extractor.extract("SER", &dir, None);
        assert!(matches!(first, Err(DumpFailure::CapabilityAbsent(_))));
        let second = extractor.extract("SER", &dir, None);
        assert!(matches!(second, Err(DumpFailure::CapabilityAbsent(_))));
        assert_eq!(runner.invocations_matching("which uiautomator"), 1);
        assert_eq!(runner.invocations_matching("uiautomator dump"), 0);
    }

    #[test]
    fn killed_dump_is_retried_with_backoff() {
        let runner = ScriptedRunner::new();
        runner.respond("which uiautomator", "/system/bin/uiautomator\n");
        runner.respond_exit_once("uiautomator dump", "", "Killed", 137);
        runner.respond_exit_once("uiautomator dump", "", "Killed", 137);
        runner.respond(
            "uiautomator dump /sdcard/window_dump.xml",
            "UI hierchary dumped to: /sdcard/window_dump.xml\n",
        );
        runner.respond("du -b", "9000\t/sdcard/window_dump.xml\n");
        runner.respond("exec-out cat", &sizeable_dump());

        let outcome = extractor(&runner)
            .extract("SER", &directory(&runner), None)
            .expect("dump after retries");
        assert_eq!(outcome.strategy, DumpStrategy::StagedFile);
        assert_eq!(runner.invocations_matching("uiautomator dump /sdcard"), 3);
    }

    #[test]
    fn exhausted_chain_rescues_prior_file_as_stale() {
        let runner = ScriptedRunner::new();
        runner.respond("which uiautomator", "/system/bin/uiautomator\n");
        runner.respond_exit("uiautomator dump", "", "ERROR: could not get idle state", 1);
        runner.respond("du -b", "96\t/sdcard/window_dump.xml\n");
        runner.respond("exec-out cat", &sizeable_dump());

        let outcome = extractor(&runner)
            .extract("SER", &directory(&runner), None)
            .expect("stale rescue");
        assert_eq!(outcome.strategy, DumpStrategy::ExistingFile);
        assert!(outcome.stale);
    }

    #[test]
    fn total_failure_reports_a_specific_reason() {
        let runner = ScriptedRunner::new();
        runner.respond("which uiautomator", "/system/bin/uiautomator\n");
        runner.respond_exit("exec-out cat", "", "cat: no such file", 1);

        let failure = extractor(&runner)
            .extract("SER", &directory(&runner), None)
            .expect_err("nothing to extract");
        assert!(!failure.reason().is_empty());
    }

    #[test]
    fn preferred_display_is_tried_first() {
        let runner = ScriptedRunner::new();
        runner.respond("which uiautomator", "/system/bin/uiautomator\n");
        runner.respond_exit("exec-out cat", "", "cat: no such file", 1);

        let _ = extractor(&runner).extract("SER", &directory(&runner), Some("7"));
        let first_dump = runner
            .invocations()
            .into_iter()
            .find(|call| call.contains("uiautomator dump"))
            .expect("at least one dump attempt");
        assert!(first_dump.contains("--display-id 7"));
    }
}
