/// Borrowed single-channel 8-bit image.
#[derive(Clone, Copy, Debug)]
pub struct GrayImageView<'a> {
    pub width: usize,
    pub height: usize,
    pub data: &'a [u8], // row-major, len = w*h
}

/// Owned single-channel 8-bit image.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GrayImage {
    pub width: usize,
    pub height: usize,
    pub data: Vec<u8>,
}

impl GrayImage {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            data: vec![0; width * height],
        }
    }

    pub fn view(&self) -> GrayImageView<'_> {
        GrayImageView {
            width: self.width,
            height: self.height,
            data: &self.data,
        }
    }
}

/// Owned interleaved RGB8 frame as delivered by a capture device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ColorFrame {
    pub width: usize,
    pub height: usize,
    pub data: Vec<u8>, // row-major, len = w*h*3
}

impl ColorFrame {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            data: vec![0; width * height * 3],
        }
    }

    /// Wrap an existing RGB8 buffer. Returns `None` if the length does not
    /// match the dimensions.
    pub fn from_rgb(width: usize, height: usize, data: Vec<u8>) -> Option<Self> {
        let expected = width.checked_mul(height)?.checked_mul(3)?;
        (data.len() == expected).then_some(Self {
            width,
            height,
            data,
        })
    }

    #[inline]
    pub fn pixel(&self, x: usize, y: usize) -> [u8; 3] {
        let i = (y * self.width + x) * 3;
        [self.data[i], self.data[i + 1], self.data[i + 2]]
    }

    #[inline]
    pub fn put_pixel(&mut self, x: usize, y: usize, rgb: [u8; 3]) {
        let i = (y * self.width + x) * 3;
        self.data[i..i + 3].copy_from_slice(&rgb);
    }

    /// Luma conversion with the ITU-R BT.601 weights in 14-bit fixed point,
    /// which is what OpenCV's `COLOR_BGR2GRAY` computes.
    pub fn to_gray(&self) -> GrayImage {
        const R: u32 = 4899;
        const G: u32 = 9617;
        const B: u32 = 1868;
        const SHIFT: u32 = 14;

        let data = self
            .data
            .chunks_exact(3)
            .map(|px| {
                let y = px[0] as u32 * R + px[1] as u32 * G + px[2] as u32 * B;
                ((y + (1 << (SHIFT - 1))) >> SHIFT) as u8
            })
            .collect();
        GrayImage {
            width: self.width,
            height: self.height,
            data,
        }
    }

    /// Bilinear sample of all three channels; out-of-bounds taps read black.
    #[inline]
    pub fn sample_bilinear(&self, x: f32, y: f32) -> [u8; 3] {
        let x0 = x.floor() as i32;
        let y0 = y.floor() as i32;
        let fx = x - x0 as f32;
        let fy = y - y0 as f32;

        let mut out = [0u8; 3];
        for (c, slot) in out.iter_mut().enumerate() {
            let p00 = self.get(x0, y0, c);
            let p10 = self.get(x0 + 1, y0, c);
            let p01 = self.get(x0, y0 + 1, c);
            let p11 = self.get(x0 + 1, y0 + 1, c);
            let a = p00 + fx * (p10 - p00);
            let b = p01 + fx * (p11 - p01);
            *slot = (a + fy * (b - a)).round().clamp(0.0, 255.0) as u8;
        }
        out
    }

    #[inline]
    fn get(&self, x: i32, y: i32, c: usize) -> f32 {
        if x < 0 || y < 0 || x >= self.width as i32 || y >= self.height as i32 {
            return 0.0;
        }
        self.data[(y as usize * self.width + x as usize) * 3 + c] as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gray_weights_match_bt601() {
        let frame = ColorFrame::from_rgb(4, 1, vec![255, 0, 0, 0, 255, 0, 0, 0, 255, 255, 255, 255])
            .expect("frame");
        let gray = frame.to_gray();
        assert_eq!(gray.data, vec![76, 150, 29, 255]);
    }

    #[test]
    fn from_rgb_rejects_bad_length() {
        assert!(ColorFrame::from_rgb(2, 2, vec![0; 11]).is_none());
        assert!(ColorFrame::from_rgb(2, 2, vec![0; 12]).is_some());
    }

    #[test]
    fn bilinear_midpoint_blends_neighbours() {
        let mut frame = ColorFrame::new(2, 1);
        frame.put_pixel(0, 0, [0, 100, 200]);
        frame.put_pixel(1, 0, [100, 200, 0]);
        assert_eq!(frame.sample_bilinear(0.5, 0.0), [50, 150, 100]);
        assert_eq!(frame.sample_bilinear(0.0, 0.0), [0, 100, 200]);
    }

    #[test]
    fn color_sampling_reads_black_outside() {
        let frame = ColorFrame::from_rgb(1, 1, vec![200, 100, 50]).expect("frame");
        assert_eq!(frame.sample_bilinear(-2.0, 0.0), [0, 0, 0]);
        assert_eq!(frame.sample_bilinear(0.5, 0.0), [100, 50, 25]);
    }
}
