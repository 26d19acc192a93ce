/// Borrowed row-major 8-bit grayscale buffer.
#[derive(Clone, Copy, Debug)]
pub struct GrayImageView<'a> {
    pub width: usize,
    pub height: usize,
    pub data: &'a [u8], // len = w*h
}

impl<'a> GrayImageView<'a> {
    /// Wrap a raw buffer; `None` when the length does not match the dimensions.
    pub fn new(width: usize, height: usize, data: &'a [u8]) -> Option<Self> {
        (width.checked_mul(height)? == data.len()).then_some(Self {
            width,
            height,
            data,
        })
    }

    #[inline]
    pub fn contains(&self, x: f64, y: f64) -> bool {
        x >= 0.0
            && y >= 0.0
            && x <= self.width.saturating_sub(1) as f64
            && y <= self.height.saturating_sub(1) as f64
    }
}

/// Pixel lookup with edge clamping.
#[inline]
fn get_gray_clamped(src: &GrayImageView<'_>, x: i64, y: i64) -> u8 {
    let xi = x.clamp(0, src.width as i64 - 1) as usize;
    let yi = y.clamp(0, src.height as i64 - 1) as usize;
    src.data[yi * src.width + xi]
}

/// Bilinear sample at a continuous position; out-of-bounds taps replicate the edge.
#[inline]
pub fn sample_bilinear(src: &GrayImageView<'_>, x: f64, y: f64) -> f64 {
    if src.width == 0 || src.height == 0 {
        return 0.0;
    }
    let x0 = x.floor() as i64;
    let y0 = y.floor() as i64;
    let fx = x - x0 as f64;
    let fy = y - y0 as f64;

    let p00 = get_gray_clamped(src, x0, y0) as f64;
    let p10 = get_gray_clamped(src, x0 + 1, y0) as f64;
    let p01 = get_gray_clamped(src, x0, y0 + 1) as f64;
    let p11 = get_gray_clamped(src, x0 + 1, y0 + 1) as f64;

    let a = p00 + fx * (p10 - p00);
    let b = p01 + fx * (p11 - p01);
    a + fy * (b - a)
}
