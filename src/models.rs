use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Connection state reported by the device-list command.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeviceState {
    Online,
    Unauthorized,
    Offline,
}

impl DeviceState {
    /// Maps a raw state token; anything unrecognized counts as offline.
    pub fn from_token(token: &str) -> Self {
        match token {
            "device" => DeviceState::Online,
            "unauthorized" => DeviceState::Unauthorized,
            _ => DeviceState::Offline,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceState::Online => "online",
            DeviceState::Unauthorized => "unauthorized",
            DeviceState::Offline => "offline",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Device {
    pub serial: String,
    pub model: String,
    pub state: DeviceState,
    /// ro.secure on the build; discovery leaves this false until detail
    /// assembly confirms it.
    pub secure: bool,
}

/// One output surface of a device. Tier-3 discovery knows ids and labels but
/// not sizes; zero bounds mean "unknown", not "empty".
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DisplayInfo {
    pub id: String,
    pub label: String,
    pub width: u32,
    pub height: u32,
}

impl DisplayInfo {
    pub fn has_bounds(&self) -> bool {
        self.width > 0 && self.height > 0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceDetail {
    pub serial: String,
    pub brand: Option<String>,
    pub model: Option<String>,
    pub android_version: Option<String>,
    pub api_level: Option<String>,
    pub battery_level: Option<u8>,
    pub screen_width: Option<u32>,
    pub screen_height: Option<u32>,
    pub secure: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AdbInfo {
    pub available: bool,
    pub version_output: String,
    pub command_path: String,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScrcpyInfo {
    pub available: bool,
    pub version_output: String,
    pub major_version: i32,
    pub command_path: String,
}

/// Compositor layer as reported by the low-level display dump. Secure layers
/// black out in screenshots and mirrors; callers surface them as warnings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CompositorLayer {
    pub name: String,
    pub secure: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Wakefulness {
    Awake,
    Asleep,
    Dreaming,
    Dozing,
    Unknown,
}

impl Wakefulness {
    pub fn from_token(token: &str) -> Self {
        match token {
            "Awake" => Wakefulness::Awake,
            "Asleep" => Wakefulness::Asleep,
            "Dreaming" => Wakefulness::Dreaming,
            "Dozing" => Wakefulness::Dozing,
            _ => Wakefulness::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Wakefulness::Awake => "Awake",
            Wakefulness::Asleep => "Asleep",
            Wakefulness::Dreaming => "Dreaming",
            Wakefulness::Dozing => "Dozing",
            Wakefulness::Unknown => "Unknown",
        }
    }
}

/// Outcome of the root-elevation command, pattern-matched from its output.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RootStatus {
    AlreadyRoot,
    Restarting,
    Refused,
    Unknown,
}

impl RootStatus {
    pub fn from_output(output: &str) -> Self {
        let lower = output.to_lowercase();
        if lower.contains("already running as root") {
            return RootStatus::AlreadyRoot;
        }
        if lower.contains("cannot run as root") {
            return RootStatus::Refused;
        }
        if lower.contains("restarting adbd") {
            return RootStatus::Restarting;
        }
        RootStatus::Unknown
    }

    pub fn description(&self) -> &'static str {
        match self {
            RootStatus::AlreadyRoot => "adbd already running as root",
            RootStatus::Restarting => "adbd restarting with elevated access",
            RootStatus::Refused => "production build refuses root",
            RootStatus::Unknown => "unrecognized root-elevation response",
        }
    }

    pub fn elevated(&self) -> bool {
        matches!(self, RootStatus::AlreadyRoot | RootStatus::Restarting)
    }
}

/// Envelope returned by one-shot operations: the payload plus the trace id
/// that produced it, so callers can correlate results with logs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandResponse<T> {
    pub trace_id: String,
    pub data: T,
}

/// Callers may supply their own correlation id; blank or missing ids get a
/// fresh v4.
pub fn resolve_trace_id(trace_id: Option<String>) -> String {
    match trace_id {
        Some(value) if !value.trim().is_empty() => value,
        _ => Uuid::new_v4().to_string(),
    }
}
