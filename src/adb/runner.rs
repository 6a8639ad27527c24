use std::io::Read;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use crate::adb::env::current_env;

/// Result of one child-process invocation. Failure is always a value: spawn
/// errors and timeouts come back as exit code -1 with the reason in stderr,
/// so retry loops never need unwind handling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    fn synthetic_failure(reason: String) -> Self {
        Self {
            stdout: String::new(),
            stderr: reason,
            exit_code: Some(-1),
        }
    }
}

/// Binary-output variant; stdout is untouched bytes (screenshots, pulled
/// files), stderr stays text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawOutput {
    pub stdout: Vec<u8>,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

impl RawOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    fn synthetic_failure(reason: String) -> Self {
        Self {
            stdout: Vec::new(),
            stderr: reason,
            exit_code: Some(-1),
        }
    }
}

enum ChildOutcome {
    Completed {
        stdout: Vec<u8>,
        stderr: Vec<u8>,
        exit_code: Option<i32>,
    },
    Failed(String),
}

fn drain_thread(mut reader: impl Read + Send + 'static) -> std::thread::JoinHandle<Vec<u8>> {
    std::thread::spawn(move || {
        let mut buffer = Vec::<u8>::new();
        let mut temp = [0u8; 4096];
        loop {
            match reader.read(&mut temp) {
                Ok(0) => break,
                Ok(count) => buffer.extend_from_slice(&temp[..count]),
                Err(_) => break,
            }
        }
        buffer
    })
}

fn run_child(program: &str, args: &[String], timeout: Duration) -> ChildOutcome {
    let mut child = match Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
    {
        Ok(child) => child,
        Err(err) => return ChildOutcome::Failed(format!("Failed to spawn command: {err}")),
    };

    // Drain stdout/stderr in parallel; a chatty child blocks once the pipe
    // buffer fills, and the wait loop below would misread that as a hang.
    let Some(stdout) = child.stdout.take() else {
        let _ = child.kill();
        let _ = child.wait();
        return ChildOutcome::Failed("Failed to capture stdout".to_string());
    };
    let Some(stderr) = child.stderr.take() else {
        let _ = child.kill();
        let _ = child.wait();
        return ChildOutcome::Failed("Failed to capture stderr".to_string());
    };
    let stdout_handle = drain_thread(stdout);
    let stderr_handle = drain_thread(stderr);

    let start = Instant::now();
    let exit_code = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status.code(),
            Ok(None) => {
                if start.elapsed() > timeout {
                    let _ = child.kill();
                    let _ = child.wait();
                    let _ = stdout_handle.join();
                    let _ = stderr_handle.join();
                    return ChildOutcome::Failed(format!(
                        "Command timed out after {}s",
                        timeout.as_secs_f32()
                    ));
                }
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(err) => {
                let _ = child.kill();
                let _ = child.wait();
                let _ = stdout_handle.join();
                let _ = stderr_handle.join();
                return ChildOutcome::Failed(format!("Failed to poll command: {err}"));
            }
        }
    };

    ChildOutcome::Completed {
        stdout: stdout_handle.join().unwrap_or_default(),
        stderr: stderr_handle.join().unwrap_or_default(),
        exit_code,
    }
}

pub fn run_command_with_timeout(
    program: &str,
    args: &[String],
    timeout: Duration,
) -> CommandOutput {
    match run_child(program, args, timeout) {
        ChildOutcome::Completed {
            stdout,
            stderr,
            exit_code,
        } => CommandOutput {
            stdout: String::from_utf8_lossy(&stdout).to_string(),
            stderr: String::from_utf8_lossy(&stderr).to_string(),
            exit_code,
        },
        ChildOutcome::Failed(reason) => CommandOutput::synthetic_failure(reason),
    }
}

pub fn run_raw_with_timeout(program: &str, args: &[String], timeout: Duration) -> RawOutput {
    match run_child(program, args, timeout) {
        ChildOutcome::Completed {
            stdout,
            stderr,
            exit_code,
        } => RawOutput {
            stdout,
            stderr: String::from_utf8_lossy(&stderr).to_string(),
            exit_code,
        },
        ChildOutcome::Failed(reason) => RawOutput::synthetic_failure(reason),
    }
}

/// Seam between device-facing logic and the real adb client. Orchestration
/// code (directory, extractor, capture loops) talks to this so tests can
/// script device behavior without a device.
pub trait CommandRunner: Send + Sync {
    fn run(&self, args: &[String], timeout: Duration) -> CommandOutput;
    fn run_raw(&self, args: &[String], timeout: Duration) -> RawOutput;
}

/// Production runner: applies the command environment (binary path, remote
/// redirect) on every call.
pub struct AdbRunner;

impl CommandRunner for AdbRunner {
    fn run(&self, args: &[String], timeout: Duration) -> CommandOutput {
        let (program, full_args) = current_env().adb_invocation(args);
        run_command_with_timeout(&program, &full_args, timeout)
    }

    fn run_raw(&self, args: &[String], timeout: Duration) -> RawOutput {
        let (program, full_args) = current_env().adb_invocation(args);
        run_raw_with_timeout(&program, &full_args, timeout)
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct Rule {
        needle: String,
        stdout: Vec<u8>,
        stderr: String,
        exit_code: Option<i32>,
        once: bool,
    }

    #[derive(Default)]
    struct ScriptedState {
        rules: Mutex<Vec<Rule>>,
        invocations: Mutex<Vec<String>>,
    }

    /// Scripted stand-in for a device: responds to the first rule whose
    /// needle appears in the joined arg string, records every invocation.
    /// Cloned handles share the same rule table and call log.
    #[derive(Default, Clone)]
    pub struct ScriptedRunner {
        inner: Arc<ScriptedState>,
    }

    impl ScriptedRunner {
        pub fn new() -> Self {
            Self::default()
        }

        /// Second handle onto the same script, for asserting on invocations
        /// after ownership moved into the code under test.
        pub fn clone_handle(&self) -> Self {
            self.clone()
        }

        pub fn respond(&self, needle: &str, stdout: &str) {
            self.push_rule(needle, stdout.as_bytes().to_vec(), "", Some(0), false);
        }

        pub fn respond_once(&self, needle: &str, stdout: &str) {
            self.push_rule(needle, stdout.as_bytes().to_vec(), "", Some(0), true);
        }

        pub fn respond_bytes(&self, needle: &str, stdout: Vec<u8>) {
            self.push_rule(needle, stdout, "", Some(0), false);
        }

        pub fn respond_exit(&self, needle: &str, stdout: &str, stderr: &str, exit_code: i32) {
            self.push_rule(
                needle,
                stdout.as_bytes().to_vec(),
                stderr,
                Some(exit_code),
                false,
            );
        }

        pub fn respond_exit_once(&self, needle: &str, stdout: &str, stderr: &str, exit_code: i32) {
            self.push_rule(
                needle,
                stdout.as_bytes().to_vec(),
                stderr,
                Some(exit_code),
                true,
            );
        }

        fn push_rule(
            &self,
            needle: &str,
            stdout: Vec<u8>,
            stderr: &str,
            exit_code: Option<i32>,
            once: bool,
        ) {
            self.inner.rules.lock().expect("rules lock").push(Rule {
                needle: needle.to_string(),
                stdout,
                stderr: stderr.to_string(),
                exit_code,
                once,
            });
        }

        pub fn invocations(&self) -> Vec<String> {
            self.inner
                .invocations
                .lock()
                .expect("invocations lock")
                .clone()
        }

        pub fn invocations_matching(&self, needle: &str) -> usize {
            self.invocations()
                .iter()
                .filter(|call| call.contains(needle))
                .count()
        }

        fn respond_to(&self, args: &[String]) -> (Vec<u8>, String, Option<i32>) {
            let joined = args.join(" ");
            self.inner
                .invocations
                .lock()
                .expect("invocations lock")
                .push(joined.clone());
            let mut rules = self.inner.rules.lock().expect("rules lock");
            if let Some(position) = rules.iter().position(|rule| joined.contains(&rule.needle)) {
                let outcome = (
                    rules[position].stdout.clone(),
                    rules[position].stderr.clone(),
                    rules[position].exit_code,
                );
                if rules[position].once {
                    rules.remove(position);
                }
                return outcome;
            }
            (
                Vec::new(),
                format!("no scripted response for: {joined}"),
                Some(1),
            )
        }
    }

    impl CommandRunner for ScriptedRunner {
        fn run(&self, args: &[String], _timeout: Duration) -> CommandOutput {
            let (stdout, stderr, exit_code) = self.respond_to(args);
            CommandOutput {
                stdout: String::from_utf8_lossy(&stdout).to_string(),
                stderr,
                exit_code,
            }
        }

        fn run_raw(&self, args: &[String], _timeout: Duration) -> RawOutput {
            let (stdout, stderr, exit_code) = self.respond_to(args);
            RawOutput {
                stdout,
                stderr,
                exit_code,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn large_stdout_does_not_deadlock() {
        // Regression: without drain threads the child blocks when the pipe
        // buffer fills and an otherwise-fast command runs into the timeout.
        let (program, args) = if cfg!(windows) {
            (
                "cmd.exe".to_string(),
                vec![
                    "/C".to_string(),
                    "for /L %i in (1,1,100000) do @echo 1234567890".to_string(),
                ],
            )
        } else {
            (
                "sh".to_string(),
                vec![
                    "-c".to_string(),
                    "i=0; while [ $i -lt 100000 ]; do echo 1234567890; i=$((i+1)); done"
                        .to_string(),
                ],
            )
        };

        let output = run_command_with_timeout(&program, &args, Duration::from_secs(20));
        assert_eq!(output.exit_code, Some(0));
        assert!(output.stdout.len() >= 1_000_000);
    }

    #[test]
    fn timeout_returns_synthetic_result() {
        let (program, args) = if cfg!(windows) {
            (
                "cmd.exe".to_string(),
                vec!["/C".to_string(), "ping -n 30 127.0.0.1 >nul".to_string()],
            )
        } else {
            ("sleep".to_string(), vec!["30".to_string()])
        };
        let output = run_command_with_timeout(&program, &args, Duration::from_millis(200));
        assert_eq!(output.exit_code, Some(-1));
        assert!(output.stderr.contains("timed out"));
        assert!(!output.success());
    }

    #[test]
    fn spawn_failure_returns_synthetic_result() {
        let output = run_command_with_timeout(
            "/definitely/not/a/real/binary",
            &[],
            Duration::from_secs(1),
        );
        assert_eq!(output.exit_code, Some(-1));
        assert!(output.stderr.contains("Failed to spawn"));
    }

    #[test]
    fn raw_variant_preserves_bytes() {
        let (program, args) = if cfg!(windows) {
            (
                "cmd.exe".to_string(),
                vec!["/C".to_string(), "echo|set /p=abc".to_string()],
            )
        } else {
            (
                "printf".to_string(),
                vec!["abc".to_string()],
            )
        };
        let output = run_raw_with_timeout(&program, &args, Duration::from_secs(5));
        assert!(output.success());
        assert_eq!(output.stdout, b"abc".to_vec());
    }

    #[test]
    fn scripted_runner_matches_in_order_and_consumes_once_rules() {
        use testing::ScriptedRunner;

        let runner = ScriptedRunner::new();
        runner.respond_exit_once("uiautomator dump", "", "Killed", 137);
        runner.respond("uiautomator dump", "<hierarchy></hierarchy>");

        let args = vec![
            "-s".to_string(),
            "SER".to_string(),
            "shell".to_string(),
            "uiautomator".to_string(),
            "dump".to_string(),
        ];
        let first = runner.run(&args, Duration::from_secs(1));
        assert_eq!(first.exit_code, Some(137));
        let second = runner.run(&args, Duration::from_secs(1));
        assert!(second.success());
        assert_eq!(runner.invocations_matching("uiautomator dump"), 2);
    }
}
