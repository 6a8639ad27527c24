use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

pub mod coords;
pub mod frame;
pub mod session;
pub mod video;

/// Sleeps in short slices so a stop (or an optional wake signal) interrupts
/// within one slice. Returns true when the sleep was cut short.
pub(crate) fn sleep_with_stop(
    total: Duration,
    stop: &AtomicBool,
    wake: Option<&AtomicBool>,
) -> bool {
    const SLICE: Duration = Duration::from_millis(100);
    let mut remaining = total;
    while !remaining.is_zero() {
        if stop.load(Ordering::Relaxed) {
            return true;
        }
        if let Some(flag) = wake {
            if flag.swap(false, Ordering::Relaxed) {
                return true;
            }
        }
        let slice = remaining.min(SLICE);
        std::thread::sleep(slice);
        remaining = remaining.saturating_sub(slice);
    }
    stop.load(Ordering::Relaxed)
}
