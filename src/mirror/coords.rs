use crate::uix::parser::{Bounds, UiTree};

/// Reconciles the three coordinate spaces of a live session: dump-space
/// (hierarchy-reported), device-space (physical display) and frame-space
/// (rendered pixels). Pure computation; callers feed it whatever bounds
/// they currently know.
#[derive(Debug, Clone, Default)]
pub struct CoordinateMapper {
    dump_bounds: Option<Bounds>,
    device_size: Option<(u32, u32)>,
    frame_size: Option<(u32, u32)>,
}

impl CoordinateMapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Root rectangle of the latest hierarchy dump. Preferred authority,
    /// because taps computed from it land exactly where the dump says a
    /// node is.
    pub fn set_dump_bounds(&mut self, bounds: Option<Bounds>) {
        self.dump_bounds = bounds;
    }

    /// Physical display size, the fallback authority when a dump carries
    /// no usable root bounds.
    pub fn set_device_size(&mut self, size: Option<(u32, u32)>) {
        self.device_size = size;
    }

    pub fn set_frame_size(&mut self, width: u32, height: u32) {
        if width > 0 && height > 0 {
            self.frame_size = Some((width, height));
        }
    }

    pub fn frame_size(&self) -> Option<(u32, u32)> {
        self.frame_size
    }

    fn authority(&self) -> Option<(f64, f64, f64)> {
        if let Some(bounds) = self.dump_bounds {
            return Some((bounds.x as f64, bounds.y as f64, bounds.width as f64));
        }
        let (width, _) = self.device_size?;
        if width == 0 {
            return None;
        }
        Some((0.0, 0.0, width as f64))
    }

    /// Uniform frame-to-authority scale. One factor for both axes; mirrors
    /// preserve aspect ratio, so the width ratio is authoritative.
    fn scale(&self) -> Option<f64> {
        let (_, _, auth_width) = self.authority()?;
        let (frame_width, _) = self.frame_size?;
        if frame_width == 0 {
            return None;
        }
        Some(auth_width / frame_width as f64)
    }

    /// Frame pixel to device/dump coordinates, for input injection and
    /// hit-testing. `None` until both a frame and an authority are known.
    pub fn screen_to_device(&self, x: f64, y: f64) -> Option<(i32, i32)> {
        let scale = self.scale()?;
        let (origin_x, origin_y, _) = self.authority()?;
        Some((
            (origin_x + x * scale).round() as i32,
            (origin_y + y * scale).round() as i32,
        ))
    }

    /// Node rectangle back into frame pixels, for overlay drawing.
    pub fn device_to_screen(&self, rect: Bounds) -> Option<(f64, f64, f64, f64)> {
        let scale = self.scale()?;
        if scale == 0.0 {
            return None;
        }
        let (origin_x, origin_y, _) = self.authority()?;
        Some((
            (rect.x as f64 - origin_x) / scale,
            (rect.y as f64 - origin_y) / scale,
            rect.width as f64 / scale,
            rect.height as f64 / scale,
        ))
    }

    /// Innermost valid node under a frame-space point: among containing
    /// candidates the smallest area wins.
    pub fn hit_test(&self, tree: &UiTree, frame_x: f64, frame_y: f64) -> Option<usize> {
        let (x, y) = self.screen_to_device(frame_x, frame_y)?;
        hit_test_dump_space(tree, x, y)
    }
}

/// Hit-testing in dump coordinates directly, independent of any frame.
pub fn hit_test_dump_space(tree: &UiTree, x: i32, y: i32) -> Option<usize> {
    tree.nodes()
        .iter()
        .filter_map(|node| {
            let rect = node.rect?;
            rect.contains(x, y).then(|| (node.index, rect.area()))
        })
        .min_by_key(|(_, area)| *area)
        .map(|(index, _)| index)
}
