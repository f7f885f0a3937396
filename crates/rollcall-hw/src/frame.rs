//! Frame type and pixel operations: format conversion, equalisation,
//! mirroring, box drawing and JPEG encoding.

use image::codecs::jpeg::JpegEncoder;
use image::{Rgb, RgbImage};

/// A captured RGB camera frame.
#[derive(Clone)]
pub struct Frame {
    /// Packed RGB8 pixels (width * height * 3 bytes).
    pub rgb: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub sequence: u32,
    pub timestamp: std::time::Instant,
}

impl Frame {
    pub fn new(rgb: Vec<u8>, width: u32, height: u32, sequence: u32) -> Self {
        Self {
            rgb,
            width,
            height,
            sequence,
            timestamp: std::time::Instant::now(),
        }
    }

    /// Flip horizontally in place (selfie view).
    pub fn mirror(&mut self) {
        let row_bytes = self.width as usize * 3;
        if row_bytes == 0 {
            return;
        }
        for row in self.rgb.chunks_exact_mut(row_bytes) {
            let pixels = row.len() / 3;
            for i in 0..pixels / 2 {
                let j = pixels - 1 - i;
                for c in 0..3 {
                    row.swap(i * 3 + c, j * 3 + c);
                }
            }
        }
    }

    /// Consume the frame as an [`RgbImage`]; `None` if the buffer is short.
    pub fn into_image(self) -> Option<RgbImage> {
        RgbImage::from_raw(self.width, self.height, self.rgb)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid {format} length: expected {expected}, got {actual}")]
    InvalidLength {
        format: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("decode failed: {0}")]
    Decode(String),
    #[error("encode failed: {0}")]
    Encode(#[from] image::ImageError),
}

fn check_len(format: &'static str, buf: &[u8], expected: usize) -> Result<(), FrameError> {
    if buf.len() < expected {
        return Err(FrameError::InvalidLength {
            format,
            expected,
            actual: buf.len(),
        });
    }
    Ok(())
}

/// Convert packed YUYV 4:2:2 to RGB (BT.601, limited range).
///
/// Each 4-byte group [Y0, U, Y1, V] yields two pixels sharing U and V.
pub fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let pixels = (width * height) as usize;
    check_len("YUYV", yuyv, pixels * 2)?;

    let mut rgb = Vec::with_capacity(pixels * 3);
    for group in yuyv[..pixels * 2].chunks_exact(4) {
        let (u, v) = (group[1] as f32 - 128.0, group[3] as f32 - 128.0);
        for y in [group[0], group[2]] {
            let c = 1.164 * (y as f32 - 16.0);
            rgb.push((c + 1.596 * v).round().clamp(0.0, 255.0) as u8);
            rgb.push((c - 0.392 * u - 0.813 * v).round().clamp(0.0, 255.0) as u8);
            rgb.push((c + 2.017 * u).round().clamp(0.0, 255.0) as u8);
        }
    }
    Ok(rgb)
}

/// Replicate an 8-bit grayscale buffer into RGB.
pub fn gray_to_rgb(gray: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let pixels = (width * height) as usize;
    check_len("GREY", gray, pixels)?;
    Ok(gray[..pixels].iter().flat_map(|&g| [g, g, g]).collect())
}

/// Decode a motion-JPEG buffer to RGB, returning `(rgb, width, height)`.
pub fn mjpeg_to_rgb(jpeg: &[u8]) -> Result<(Vec<u8>, u32, u32), FrameError> {
    let decoded = image::load_from_memory_with_format(jpeg, image::ImageFormat::Jpeg)
        .map_err(|e| FrameError::Decode(e.to_string()))?
        .to_rgb8();
    let (w, h) = decoded.dimensions();
    Ok((decoded.into_raw(), w, h))
}

/// BT.601 luma: 0.299 R + 0.587 G + 0.114 B.
pub fn rgb_to_gray(rgb: &[u8]) -> Vec<u8> {
    rgb.chunks_exact(3)
        .map(|p| {
            let y = 0.299 * p[0] as f32 + 0.587 * p[1] as f32 + 0.114 * p[2] as f32;
            y.round().clamp(0.0, 255.0) as u8
        })
        .collect()
}

/// Global histogram equalisation in place.
///
/// Maps each level through the normalised CDF so the output spreads over
/// 0–255. A single-level image is left unchanged.
pub fn equalize_histogram(gray: &mut [u8]) {
    let mut hist = [0u32; 256];
    for &p in gray.iter() {
        hist[p as usize] += 1;
    }

    let total = gray.len() as u32;
    let Some(cdf_min) = hist.iter().copied().find(|&c| c > 0) else {
        return;
    };
    if cdf_min == total {
        return;
    }

    let mut lut = [0u8; 256];
    let mut cdf = 0u32;
    let scale = 255.0 / (total - cdf_min) as f32;
    for (level, &count) in hist.iter().enumerate() {
        cdf += count;
        lut[level] = ((cdf.saturating_sub(cdf_min)) as f32 * scale)
            .round()
            .clamp(0.0, 255.0) as u8;
    }

    for p in gray.iter_mut() {
        *p = lut[*p as usize];
    }
}

/// Draw a rectangle outline, clipped to the image.
pub fn draw_box(
    image: &mut RgbImage,
    x: i32,
    y: i32,
    w: u32,
    h: u32,
    color: Rgb<u8>,
    thickness: u32,
) {
    let (iw, ih) = (image.width() as i32, image.height() as i32);
    let (x1, y1) = (x + w as i32 - 1, y + h as i32 - 1);
    let t = thickness as i32;

    let mut put = |px: i32, py: i32| {
        if px >= 0 && py >= 0 && px < iw && py < ih {
            image.put_pixel(px as u32, py as u32, color);
        }
    };

    for d in 0..t {
        for px in x..=x1 {
            put(px, y + d);
            put(px, y1 - d);
        }
        for py in y..=y1 {
            put(x + d, py);
            put(x1 - d, py);
        }
    }
}

/// Encode as baseline JPEG.
pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>, FrameError> {
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, quality).encode_image(image)?;
    Ok(out)
}
