use std::collections::HashMap;

use regex::Regex;

use crate::models::{CompositorLayer, Device, DeviceDetail, DeviceState, DisplayInfo, Wakefulness};

/// Parses `adb devices -l`. Missing or malformed attribute fields never fail
/// a row; the model defaults to "Unknown".
pub fn parse_adb_devices(output: &str) -> Vec<Device> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter(|line| !line.trim_start().starts_with('*'))
        .filter(|line| !line.to_lowercase().contains("list of devices"))
        .filter_map(|line| {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            if tokens.len() < 2 {
                return None;
            }
            let serial = tokens[0].to_string();
            let state = DeviceState::from_token(tokens[1]);
            let mut model = String::new();
            for token in tokens.iter().skip(2) {
                if let Some(value) = token.strip_prefix("model:") {
                    model = value.replace('_', " ");
                }
            }
            if model.trim().is_empty() {
                model = "Unknown".to_string();
            }
            Some(Device {
                serial,
                model,
                state,
                secure: false,
            })
        })
        .collect()
}

pub fn parse_getprop_map(output: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in output.lines() {
        let trimmed = line.trim();
        if !trimmed.starts_with('[') {
            continue;
        }
        let Some((key_part, value_part)) = trimmed.split_once("]: [") else {
            continue;
        };
        let key = key_part.trim_start_matches('[').trim();
        let value = value_part.trim_end_matches(']').trim();
        if !key.is_empty() {
            map.insert(key.to_string(), value.to_string());
        }
    }
    map
}

pub fn build_device_detail(serial: &str, getprop_map: &HashMap<String, String>) -> DeviceDetail {
    DeviceDetail {
        serial: serial.to_string(),
        brand: getprop_map.get("ro.product.brand").cloned(),
        model: getprop_map.get("ro.product.model").cloned(),
        android_version: getprop_map.get("ro.build.version.release").cloned(),
        api_level: getprop_map.get("ro.build.version.sdk").cloned(),
        battery_level: None,
        screen_width: None,
        screen_height: None,
        secure: getprop_map.get("ro.secure").map(String::as_str) == Some("1"),
    }
}

pub fn parse_battery_level(output: &str) -> Option<u8> {
    for line in output.lines() {
        let trimmed = line.trim();
        if let Some(value) = trimmed.strip_prefix("level:") {
            if let Ok(level) = value.trim().parse::<u8>() {
                return Some(level);
            }
        }
    }
    None
}

/// Tier 1 display discovery: `cmd display get-displays`. One line per
/// display; the size rides in the same DisplayInfo blob.
pub fn parse_display_list(output: &str) -> Vec<DisplayInfo> {
    let Ok(head_re) = Regex::new(r#"Display id (\d+): DisplayInfo\{"([^"]*)""#) else {
        return Vec::new();
    };
    let Ok(size_re) = Regex::new(r"real (\d+) x (\d+)") else {
        return Vec::new();
    };
    output
        .lines()
        .filter_map(|line| {
            let caps = head_re.captures(line)?;
            let (width, height) = size_re
                .captures(line)
                .and_then(|size| {
                    Some((size[1].parse::<u32>().ok()?, size[2].parse::<u32>().ok()?))
                })
                .unwrap_or((0, 0));
            Some(DisplayInfo {
                id: caps[1].to_string(),
                label: caps[2].to_string(),
                width,
                height,
            })
        })
        .collect()
}

/// Tier 2 display discovery: viewport records inside `dumpsys display`.
/// Several viewports can share one long line, so matching walks the whole
/// text instead of line by line.
pub fn parse_display_viewports(output: &str) -> Vec<DisplayInfo> {
    let Ok(viewport_re) = Regex::new(
        r"displayId=(\d+), uniqueId='([^']*)'.*?logicalFrame=Rect\(-?\d+, -?\d+ - (\d+), (\d+)\)",
    ) else {
        return Vec::new();
    };
    viewport_re
        .captures_iter(output)
        .filter_map(|caps| {
            Some(DisplayInfo {
                id: caps[1].to_string(),
                label: caps[2].to_string(),
                width: caps[3].parse::<u32>().ok()?,
                height: caps[4].parse::<u32>().ok()?,
            })
        })
        .collect()
}

/// Tier 3 display discovery: `dumpsys SurfaceFlinger --display-id`. Only ids
/// and names come back; bounds stay unknown.
pub fn parse_surfaceflinger_displays(output: &str) -> Vec<DisplayInfo> {
    let Ok(display_re) = Regex::new(r#"(?m)^Display (\d+) \([^)]*\).*?displayName="([^"]*)""#)
    else {
        return Vec::new();
    };
    display_re
        .captures_iter(output)
        .map(|caps| {
            let id = caps[1].to_string();
            let label = if caps[2].is_empty() {
                format!("Display {id}")
            } else {
                caps[2].to_string()
            };
            DisplayInfo {
                id,
                label,
                width: 0,
                height: 0,
            }
        })
        .collect()
}

/// Tier 1 screen size: `wm size`. An override size reflects what the device
/// is actually rendering at, so it wins over the physical size.
pub fn parse_wm_size(output: &str) -> Option<(u32, u32)> {
    let size_re = Regex::new(r"(\d+)x(\d+)").ok()?;
    let mut physical = None;
    for line in output.lines() {
        let trimmed = line.trim();
        let Some(caps) = size_re.captures(trimmed) else {
            continue;
        };
        let parsed = (caps[1].parse::<u32>().ok()?, caps[2].parse::<u32>().ok()?);
        if trimmed.starts_with("Override size:") {
            return Some(parsed);
        }
        if trimmed.starts_with("Physical size:") && physical.is_none() {
            physical = Some(parsed);
        }
    }
    physical
}

/// Tier 2 screen size: device dimensions inside `dumpsys display`.
pub fn parse_display_device_size(output: &str) -> Option<(u32, u32)> {
    let size_re = Regex::new(r"deviceWidth=(\d+), deviceHeight=(\d+)").ok()?;
    let caps = size_re.captures(output)?;
    Some((caps[1].parse::<u32>().ok()?, caps[2].parse::<u32>().ok()?))
}

pub fn parse_wakefulness(output: &str) -> Wakefulness {
    let Ok(wake_re) = Regex::new(r"mWakefulness=(\w+)") else {
        return Wakefulness::Unknown;
    };
    match wake_re.captures(output) {
        Some(caps) => Wakefulness::from_token(&caps[1]),
        None => Wakefulness::Unknown,
    }
}

/// Walks a SurfaceFlinger dump, collecting layer names and whether each
/// section claims the secure flag. Firmware wording varies, so several
/// spellings count.
pub fn parse_compositor_layers(output: &str) -> Vec<CompositorLayer> {
    let Ok(header_re) = Regex::new(r"^\s*[+*]\s+\S*[Ll]ayer\b.*\(([^)]+)\)\s*$") else {
        return Vec::new();
    };
    let mut layers: Vec<CompositorLayer> = Vec::new();
    for line in output.lines() {
        if let Some(caps) = header_re.captures(line) {
            layers.push(CompositorLayer {
                name: caps[1].to_string(),
                secure: false,
            });
            continue;
        }
        let Some(current) = layers.last_mut() else {
            continue;
        };
        let lower = line.to_lowercase();
        if lower.contains("issecure=1")
            || lower.contains("issecure=true")
            || lower.contains("secure=true")
            || lower.contains("flag_secure")
        {
            current.secure = true;
        }
    }
    layers
}

/// Focused window from `dumpsys window windows`; falls back to the focused
/// app record when no window has focus (e.g. during transitions).
pub fn parse_focused_window(output: &str) -> Option<String> {
    let focus_re = Regex::new(r"mCurrentFocus=Window\{\S+ \S+ ([^}]+)\}").ok()?;
    if let Some(caps) = focus_re.captures(output) {
        return Some(caps[1].trim().to_string());
    }
    let app_re = Regex::new(r"mFocusedApp=.*?(\S+/[^\s}]+)").ok()?;
    app_re
        .captures(output)
        .map(|caps| caps[1].trim().to_string())
}

/// First numeric token of `du -b <path>` output.
pub fn parse_du_size(output: &str) -> Option<u64> {
    output
        .split_whitespace()
        .next()
        .and_then(|token| token.parse::<u64>().ok())
}

pub fn parse_connect_result(output: &str) -> bool {
    let lower = output.to_lowercase();
    if lower.contains("cannot connect")
        || lower.contains("failed to connect")
        || lower.contains("unable to connect")
    {
        return false;
    }
    lower.contains("connected to")
}

pub fn parse_disconnect_result(output: &str) -> bool {
    let lower = output.to_lowercase();
    if lower.contains("error") || lower.contains("no such device") {
        return false;
    }
    lower.contains("disconnected") || lower.trim().is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_adb_devices_output() {
        let output = "List of devices attached\n0123456789ABCDEF device product:sdk_gphone64_arm64 model:Pixel_7 device:emu64a transport_id:1\nemulator-5554 unauthorized transport_id:2\n192.168.0.12:5555 offline\n";
        let parsed = parse_adb_devices(output);
        assert_eq!(parsed.len(), 3);
        assert_eq!(parsed[0].serial, "0123456789ABCDEF");
        assert_eq!(parsed[0].state, DeviceState::Online);
        assert_eq!(parsed[0].model, "Pixel 7");
        assert_eq!(parsed[1].state, DeviceState::Unauthorized);
        assert_eq!(parsed[1].model, "Unknown");
        assert_eq!(parsed[2].serial, "192.168.0.12:5555");
        assert_eq!(parsed[2].state, DeviceState::Offline);
    }

    #[test]
    fn malformed_model_defaults_to_unknown() {
        let output = "SERIAL123 device product:gen model:\n";
        let parsed = parse_adb_devices(output);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].model, "Unknown");
    }

    #[test]
    fn parses_getprop_and_detail() {
        let output = "[ro.product.brand]: [google]\n[ro.product.model]: [Pixel 7]\n[ro.build.version.release]: [14]\n[ro.build.version.sdk]: [34]\n[ro.secure]: [1]\n";
        let map = parse_getprop_map(output);
        let detail = build_device_detail("ABC", &map);
        assert_eq!(detail.brand.as_deref(), Some("google"));
        assert_eq!(detail.android_version.as_deref(), Some("14"));
        assert_eq!(detail.api_level.as_deref(), Some("34"));
        assert!(detail.secure);
    }

    #[test]
    fn parses_battery_level() {
        let output = "AC powered: false\nlevel: 87\nstatus: 2\n";
        assert_eq!(parse_battery_level(output), Some(87));
    }

    #[test]
    fn parses_display_list_tier_one() {
        let output = "Displays:\n  Display id 0: DisplayInfo{\"Built-in Screen\", displayId 0\", FLAG_TRUSTED, real 1080 x 2400, largest app 1080 x 2400}\n  Display id 2: DisplayInfo{\"HDMI Screen\", displayId 2\", real 1920 x 1080}\n";
        let displays = parse_display_list(output);
        assert_eq!(displays.len(), 2);
        assert_eq!(displays[0].id, "0");
        assert_eq!(displays[0].label, "Built-in Screen");
        assert_eq!((displays[0].width, displays[0].height), (1080, 2400));
        assert_eq!(displays[1].id, "2");
        assert_eq!((displays[1].width, displays[1].height), (1920, 1080));
    }

    #[test]
    fn parses_display_viewports_tier_two() {
        let output = "mViewports=[DisplayViewport{type=INTERNAL, valid=true, isActive=true, displayId=0, uniqueId='local:4619827259835644672', physicalPort=0, orientation=0, logicalFrame=Rect(0, 0 - 1080, 2400), deviceWidth=1080, deviceHeight=2400}, DisplayViewport{type=EXTERNAL, valid=true, isActive=true, displayId=5, uniqueId='local:4619827551948147201', physicalPort=1, orientation=0, logicalFrame=Rect(0, 0 - 1920, 1080), deviceWidth=1920, deviceHeight=1080}]";
        let displays = parse_display_viewports(output);
        assert_eq!(displays.len(), 2);
        assert_eq!(displays[0].id, "0");
        assert_eq!(displays[0].label, "local:4619827259835644672");
        assert_eq!((displays[0].width, displays[0].height), (1080, 2400));
        assert_eq!(displays[1].id, "5");
        assert_eq!((displays[1].width, displays[1].height), (1920, 1080));
    }

    #[test]
    fn parses_surfaceflinger_tier_three() {
        let output = "Display 4619827259835644672 (HWC display 0): port=0, pnpId=GGL, displayName=\"EMU_display_0\"\nDisplay 4619827551948147201 (HWC display 1): port=1, pnpId=GGL, displayName=\"\"\n";
        let displays = parse_surfaceflinger_displays(output);
        assert_eq!(displays.len(), 2);
        assert_eq!(displays[0].id, "4619827259835644672");
        assert_eq!(displays[0].label, "EMU_display_0");
        assert!(!displays[0].has_bounds());
        assert_eq!(displays[1].label, "Display 4619827551948147201");
    }

    #[test]
    fn wm_size_prefers_override() {
        let physical_only = "Physical size: 1080x2400\n";
        assert_eq!(parse_wm_size(physical_only), Some((1080, 2400)));
        let with_override = "Physical size: 1080x2400\nOverride size: 720x1600\n";
        assert_eq!(parse_wm_size(with_override), Some((720, 1600)));
        assert_eq!(parse_wm_size("garbage"), None);
    }

    #[test]
    fn parses_display_device_size() {
        let output = "DisplayDeviceInfo{..., deviceWidth=1080, deviceHeight=2400, ...}";
        assert_eq!(parse_display_device_size(output), Some((1080, 2400)));
    }

    #[test]
    fn parses_wakefulness() {
        assert_eq!(
            parse_wakefulness("mWakefulness=Awake\nmWakeLockSummary=0x0"),
            Wakefulness::Awake
        );
        assert_eq!(parse_wakefulness("mWakefulness=Dozing"), Wakefulness::Dozing);
        assert_eq!(parse_wakefulness("no such field"), Wakefulness::Unknown);
    }

    #[test]
    fn flags_secure_layers() {
        let output = "+ Layer 0x7fa0c8000b40 (StatusBar#0)\n    isOpaque=1, alpha=1.000\n+ Layer 0x7fa0c8001c50 (com.bank.app/com.bank.app.PinActivity#0)\n    isSecure=1, alpha=1.000\n";
        let layers = parse_compositor_layers(output);
        assert_eq!(layers.len(), 2);
        assert_eq!(layers[0].name, "StatusBar#0");
        assert!(!layers[0].secure);
        assert!(layers[1].secure);
        assert!(layers[1].name.contains("PinActivity"));
    }

    #[test]
    fn parses_focused_window() {
        let output = "  mCurrentFocus=Window{7e3e20f u0 com.example.app/com.example.app.MainActivity}\n";
        assert_eq!(
            parse_focused_window(output).as_deref(),
            Some("com.example.app/com.example.app.MainActivity")
        );
        let fallback = "mCurrentFocus=null\n  mFocusedApp=ActivityRecord{1234 u0 com.example.app/.MainActivity t42}\n";
        assert_eq!(
            parse_focused_window(fallback).as_deref(),
            Some("com.example.app/.MainActivity")
        );
        assert_eq!(parse_focused_window("mCurrentFocus=null"), None);
    }

    #[test]
    fn parses_du_size() {
        assert_eq!(parse_du_size("48211\t/sdcard/window_dump.xml\n"), Some(48211));
        assert_eq!(parse_du_size(""), None);
        assert_eq!(
            parse_du_size("du: /sdcard/window_dump.xml: No such file or directory"),
            None
        );
    }

    #[test]
    fn judges_connect_output() {
        assert!(parse_connect_result("connected to 192.168.0.10:5555"));
        assert!(parse_connect_result("already connected to 192.168.0.10:5555"));
        assert!(!parse_connect_result(
            "cannot connect to 192.168.0.10:5555: Connection refused"
        ));
        assert!(parse_disconnect_result("disconnected 192.168.0.10:5555"));
        assert!(!parse_disconnect_result("error: no such device"));
    }
}
