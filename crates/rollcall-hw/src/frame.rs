//! Grayscale frame type and conditioning — YUYV conversion, dark detection, CLAHE.

use std::time::Instant;

/// Fraction of near-black pixels above which a frame counts as dark.
pub const DEFAULT_DARK_PCT: f32 = 0.95;
/// CLAHE grid used before detection (tiles per axis).
pub const CLAHE_TILES: u32 = 8;
/// CLAHE clip limit as a fraction of the tile's pixel count.
pub const CLAHE_CLIP: f32 = 0.02;

/// A captured grayscale camera frame. Lives for one loop iteration.
#[derive(Clone)]
pub struct Frame {
    /// Grayscale pixel data (width * height bytes).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub timestamp: Instant,
    pub sequence: u32,
    pub is_dark: bool,
}

impl Frame {
    /// Wrap already-grayscale pixels, classifying darkness up front.
    pub fn from_gray(data: Vec<u8>, width: u32, height: u32, sequence: u32) -> Self {
        let is_dark = is_dark_frame(&data, DEFAULT_DARK_PCT);
        Self {
            data,
            width,
            height,
            timestamp: Instant::now(),
            sequence,
            is_dark,
        }
    }

    /// Average pixel brightness (0.0–255.0).
    pub fn avg_brightness(&self) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        self.data.iter().map(|&b| b as f32).sum::<f32>() / self.data.len() as f32
    }

    /// Apply CLAHE with the default grid and clip limit.
    pub fn equalize(&mut self) {
        clahe_enhance(&mut self.data, self.width, self.height, CLAHE_TILES, CLAHE_CLIP);
    }
}

/// Convert packed YUYV (4:2:2) to grayscale by extracting the Y channel.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V].
pub fn yuyv_to_grayscale(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = (width * height * 2) as usize;
    if yuyv.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: yuyv.len(),
        });
    }
    Ok(yuyv[..expected].iter().step_by(2).copied().collect())
}

/// True if more than `threshold_pct` of pixels are below 32.
pub fn is_dark_frame(gray: &[u8], threshold_pct: f32) -> bool {
    if gray.is_empty() {
        return true;
    }
    let dark_count = gray.iter().filter(|&&p| p < 32).count();
    (dark_count as f32 / gray.len() as f32) > threshold_pct
}

/// Contrast-Limited Adaptive Histogram Equalization, in place.
///
/// Builds a clipped CDF per tile of a `tiles × tiles` grid and maps each pixel
/// by bilinear interpolation between the four nearest tile CDFs, which evens
/// out classroom lighting (windows on one side, projector glare) before the
/// detector and the LBP histograms see the frame.
pub fn clahe_enhance(gray: &mut [u8], width: u32, height: u32, tiles: u32, clip_limit: f32) {
    let w = width as usize;
    let h = height as usize;
    let t = tiles as usize;
    if w == 0 || h == 0 || t == 0 || gray.len() < w * h {
        return;
    }
    let tile_w = w / t;
    let tile_h = h / t;
    if tile_w == 0 || tile_h == 0 {
        return;
    }

    let mut cdfs: Vec<[f32; 256]> = Vec::with_capacity(t * t);
    for row in 0..t {
        for col in 0..t {
            cdfs.push(tile_cdf(gray, w, col * tile_w, row * tile_h, tile_w, tile_h, clip_limit));
        }
    }

    for y in 0..h {
        let fy = ((y as f32 / tile_h as f32) - 0.5).clamp(0.0, (t - 1) as f32);
        let r0 = fy as usize;
        let r1 = (r0 + 1).min(t - 1);
        let dy = fy - r0 as f32;

        for x in 0..w {
            let fx = ((x as f32 / tile_w as f32) - 0.5).clamp(0.0, (t - 1) as f32);
            let c0 = fx as usize;
            let c1 = (c0 + 1).min(t - 1);
            let dx = fx - c0 as f32;

            let pixel = gray[y * w + x] as usize;
            let top = cdfs[r0 * t + c0][pixel] * (1.0 - dx) + cdfs[r0 * t + c1][pixel] * dx;
            let bot = cdfs[r1 * t + c0][pixel] * (1.0 - dx) + cdfs[r1 * t + c1][pixel] * dx;
            gray[y * w + x] = (top * (1.0 - dy) + bot * dy).round().clamp(0.0, 255.0) as u8;
        }
    }
}

/// Clipped, redistributed, 0–255 normalized CDF of one tile.
fn tile_cdf(
    gray: &[u8],
    stride: usize,
    x0: usize,
    y0: usize,
    tile_w: usize,
    tile_h: usize,
    clip_limit: f32,
) -> [f32; 256] {
    let tile_pixels = tile_w * tile_h;
    let mut hist = [0u32; 256];
    for y in y0..y0 + tile_h {
        for &p in &gray[y * stride + x0..y * stride + x0 + tile_w] {
            hist[p as usize] += 1;
        }
    }

    let clip = (clip_limit * tile_pixels as f32) as u32;
    let mut excess = 0u32;
    for bin in hist.iter_mut() {
        if *bin > clip {
            excess += *bin - clip;
            *bin = clip;
        }
    }
    let redist = excess / 256;
    let leftover = (excess % 256) as usize;
    for (i, bin) in hist.iter_mut().enumerate() {
        *bin += redist + u32::from(i < leftover);
    }

    let mut cdf = [0f32; 256];
    let mut running = 0f32;
    for (slot, &count) in cdf.iter_mut().zip(hist.iter()) {
        running += count as f32;
        *slot = running;
    }
    let cdf_min = cdf.iter().copied().find(|&v| v > 0.0).unwrap_or(0.0);
    let denom = tile_pixels as f32 - cdf_min;
    if denom > 0.0 {
        for v in cdf.iter_mut() {
            *v = ((*v - cdf_min) / denom * 255.0).clamp(0.0, 255.0);
        }
    }
    cdf
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid YUYV length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}
