use std::process::{Command, Stdio};

use tracing::{debug, warn};

use crate::adb::env::current_env;

/// Input injection is fire-and-forget: the gesture is handed to adb and the
/// caller moves on. A blocked or slow `input` binary must never stall a
/// capture loop, so nothing here waits for completion or reports failure
/// beyond a log line.
fn dispatch(serial: &str, shell_args: &[String]) {
    let mut args = vec![
        "-s".to_string(),
        serial.to_string(),
        "shell".to_string(),
        "input".to_string(),
    ];
    args.extend_from_slice(shell_args);
    let env = current_env();
    let (program, full_args) = env.adb_invocation(&args);
    match Command::new(&program)
        .args(&full_args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
    {
        Ok(mut child) => {
            debug!(serial, args = %shell_args.join(" "), "dispatched input event");
            // Reap off-thread so the child never lingers as a zombie.
            std::thread::spawn(move || {
                let _ = child.wait();
            });
        }
        Err(err) => {
            warn!(serial, error = %err, "failed to dispatch input event");
        }
    }
}

pub fn tap_args(x: i32, y: i32) -> Vec<String> {
    vec!["tap".to_string(), x.to_string(), y.to_string()]
}

pub fn swipe_args(x1: i32, y1: i32, x2: i32, y2: i32, duration_ms: u32) -> Vec<String> {
    let mut args = vec![
        "swipe".to_string(),
        x1.to_string(),
        y1.to_string(),
        x2.to_string(),
        y2.to_string(),
    ];
    if duration_ms > 0 {
        args.push(duration_ms.to_string());
    }
    args
}

pub fn keyevent_args(keycode: &str) -> Vec<String> {
    vec!["keyevent".to_string(), keycode.trim().to_string()]
}

pub fn send_tap(serial: &str, x: i32, y: i32) {
    dispatch(serial, &tap_args(x, y));
}

pub fn send_swipe(serial: &str, x1: i32, y1: i32, x2: i32, y2: i32, duration_ms: u32) {
    dispatch(serial, &swipe_args(x1, y1, x2, y2, duration_ms));
}

pub fn send_keyevent(serial: &str, keycode: &str) {
    let trimmed = keycode.trim();
    if trimmed.is_empty() {
        warn!(serial, "ignoring empty keycode");
        return;
    }
    dispatch(serial, &keyevent_args(trimmed));
}
