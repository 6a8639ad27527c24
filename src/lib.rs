//! DroidGlass: a device mirroring and hierarchy inspection engine for
//! Android QA. Talks to devices through adb (and scrcpy for streamed video),
//! extracts UIX view-hierarchy dumps with a multi-strategy fallback chain,
//! and runs live mirror sessions that feed frames, trees, log lines and
//! focus changes to a consumer.

pub mod adb;
pub mod config;
pub mod error;
pub mod history;
pub mod logging;
pub mod mirror;
pub mod models;
pub mod snapshot;
pub mod uix;

pub use error::{AppError, ErrorCode};
pub use mirror::session::{MirrorSession, SessionEmitter, SessionEvent};
pub use mirror::video::VideoMode;
pub use uix::parser::{parse_uix, UiTree};
