use std::time::Instant;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::adb::screenshot::{looks_like_png, PNG_SIGNATURE};

/// One rendered frame, always PNG-encoded. Dimensions come straight from
/// the IHDR header so no decoder is needed.
#[derive(Debug, Clone)]
pub struct MirrorFrame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub captured_at: Instant,
}

impl MirrorFrame {
    pub fn from_png(data: Vec<u8>) -> Option<Self> {
        let (width, height) = png_dimensions(&data)?;
        Some(Self {
            data,
            width,
            height,
            captured_at: Instant::now(),
        })
    }
}

/// Width and height out of the IHDR chunk, which the PNG format pins to the
/// first 8 bytes after the signature.
pub fn png_dimensions(bytes: &[u8]) -> Option<(u32, u32)> {
    if !looks_like_png(bytes) || bytes.len() < 24 {
        return None;
    }
    if &bytes[12..16] != b"IHDR" {
        return None;
    }
    let width = u32::from_be_bytes([bytes[16], bytes[17], bytes[18], bytes[19]]);
    let height = u32::from_be_bytes([bytes[20], bytes[21], bytes[22], bytes[23]]);
    if width == 0 || height == 0 {
        return None;
    }
    Some((width, height))
}

pub fn png_data_url(bytes: &[u8]) -> Result<String, String> {
    if bytes.len() < PNG_SIGNATURE.len() {
        return Err("Screenshot data is empty".to_string());
    }
    if !bytes.starts_with(&PNG_SIGNATURE) {
        return Err("Screenshot data is not a PNG".to_string());
    }
    let encoded = STANDARD.encode(bytes);
    Ok(format!("data:image/png;base64,{encoded}"))
}

/// Reassembles whole PNG images out of an arbitrary byte stream, as produced
/// by an external decoder writing `image2pipe` output. Bytes arrive in
/// whatever chunk sizes the pipe delivers; images are emitted only once
/// their IEND chunk is complete.
#[derive(Debug, Default)]
pub struct PngStreamSplitter {
    buffer: Vec<u8>,
}

impl PngStreamSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();
        loop {
            self.discard_leading_garbage();
            match self.complete_image_len() {
                Some(total) => {
                    let image: Vec<u8> = self.buffer.drain(..total).collect();
                    frames.push(image);
                }
                None => break,
            }
        }
        frames
    }

    /// Anything before the next signature is decoder noise. Keeps the last
    /// few bytes in case a signature straddles a chunk boundary.
    fn discard_leading_garbage(&mut self) {
        if self.buffer.starts_with(&PNG_SIGNATURE) {
            return;
        }
        if let Some(position) = self
            .buffer
            .windows(PNG_SIGNATURE.len())
            .position(|window| window == PNG_SIGNATURE)
        {
            self.buffer.drain(..position);
        } else {
            let keep = self.buffer.len().min(PNG_SIGNATURE.len() - 1);
            self.buffer.drain(..self.buffer.len() - keep);
        }
    }

    /// Walks chunk headers from the signature; `Some(total)` once a full
    /// image through IEND is buffered.
    fn complete_image_len(&self) -> Option<usize> {
        if !self.buffer.starts_with(&PNG_SIGNATURE) {
            return None;
        }
        let mut position = PNG_SIGNATURE.len();
        loop {
            if position + 8 > self.buffer.len() {
                return None;
            }
            let length = u32::from_be_bytes([
                self.buffer[position],
                self.buffer[position + 1],
                self.buffer[position + 2],
                self.buffer[position + 3],
            ]) as usize;
            let chunk_type = &self.buffer[position + 4..position + 8];
            let chunk_end = position + 8 + length + 4;
            if chunk_end > self.buffer.len() {
                return None;
            }
            if chunk_type == b"IEND" {
                return Some(chunk_end);
            }
            position = chunk_end;
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::tiny_png;
    use super::*;

    #[test]
    fn reads_dimensions_from_ihdr() {
        let png = tiny_png(1080, 2400);
        assert_eq!(png_dimensions(&png), Some((1080, 2400)));
        assert_eq!(png_dimensions(b"not a png"), None);
    }

    #[test]
    fn frame_carries_its_dimensions() {
        let frame = MirrorFrame::from_png(tiny_png(320, 640)).expect("frame");
        assert_eq!((frame.width, frame.height), (320, 640));
    }

    #[test]
    fn data_url_rejects_non_png() {
        assert!(png_data_url(&[]).is_err());
        assert!(png_data_url(b"plainly not an image").is_err());
        let url = png_data_url(&tiny_png(2, 2)).expect("encode");
        assert!(url.starts_with("data:image/png;base64,"));
    }

    #[test]
    fn splitter_reassembles_images_across_chunk_boundaries() {
        let first = tiny_png(100, 200);
        let second = tiny_png(300, 400);
        let mut stream = Vec::new();
        stream.extend_from_slice(&first);
        stream.extend_from_slice(&second);

        let mut splitter = PngStreamSplitter::new();
        let mut frames = Vec::new();
        for piece in stream.chunks(7) {
            frames.extend(splitter.push(piece));
        }
        assert_eq!(frames.len(), 2);
        assert_eq!(png_dimensions(&frames[0]), Some((100, 200)));
        assert_eq!(png_dimensions(&frames[1]), Some((300, 400)));
    }

    #[test]
    fn splitter_skips_leading_noise_and_waits_for_iend() {
        let png = tiny_png(64, 64);
        let mut splitter = PngStreamSplitter::new();
        assert!(splitter.push(b"ffmpeg version banner noise").is_empty());
        let (head, tail) = png.split_at(20);
        assert!(splitter.push(head).is_empty());
        let frames = splitter.push(tail);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0], png);
    }
}
