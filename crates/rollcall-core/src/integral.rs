//! Summed-area tables for O(1) rectangle sums.

use image::GrayImage;

/// Integral and squared-integral images of a grayscale frame.
///
/// Both tables are `(width + 1) × (height + 1)` with a zero first row and column.
pub struct IntegralImage {
    width: u32,
    height: u32,
    sum: Vec<u64>,
    sq_sum: Vec<u64>,
}

impl IntegralImage {
    pub fn new(gray: &GrayImage) -> Self {
        let (width, height) = gray.dimensions();
        let w = width as usize;
        let h = height as usize;
        let stride = w + 1;
        let mut sum = vec![0u64; stride * (h + 1)];
        let mut sq_sum = vec![0u64; stride * (h + 1)];
        let raw = gray.as_raw();

        for y in 0..h {
            let mut row_sum = 0u64;
            let mut row_sq = 0u64;
            for x in 0..w {
                let v = raw[y * w + x] as u64;
                row_sum += v;
                row_sq += v * v;
                sum[(y + 1) * stride + x + 1] = sum[y * stride + x + 1] + row_sum;
                sq_sum[(y + 1) * stride + x + 1] = sq_sum[y * stride + x + 1] + row_sq;
            }
        }

        Self {
            width,
            height,
            sum,
            sq_sum,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Sum of pixel values in `[x, x+w) × [y, y+h)`. The rectangle must lie inside the image.
    pub fn rect_sum(&self, x: u32, y: u32, w: u32, h: u32) -> u64 {
        Self::lookup(&self.sum, self.width, x, y, w, h)
    }

    /// Sum of squared pixel values in `[x, x+w) × [y, y+h)`.
    pub fn rect_sq_sum(&self, x: u32, y: u32, w: u32, h: u32) -> u64 {
        Self::lookup(&self.sq_sum, self.width, x, y, w, h)
    }

    fn lookup(table: &[u64], width: u32, x: u32, y: u32, w: u32, h: u32) -> u64 {
        let stride = width as usize + 1;
        let (x0, y0) = (x as usize, y as usize);
        let (x1, y1) = (x0 + w as usize, y0 + h as usize);
        table[y1 * stride + x1] + table[y0 * stride + x0]
            - table[y0 * stride + x1]
            - table[y1 * stride + x0]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rect_sum_matches_brute_force() {
        let img = GrayImage::from_fn(13, 7, |x, y| image::Luma([((x * 17 + y * 31) % 256) as u8]));
        let ii = IntegralImage::new(&img);

        for (x, y, w, h) in [(0, 0, 13, 7), (2, 1, 5, 4), (12, 6, 1, 1), (3, 0, 0, 7)] {
            let mut expected = 0u64;
            let mut expected_sq = 0u64;
            for yy in y..y + h {
                for xx in x..x + w {
                    let v = img.get_pixel(xx, yy).0[0] as u64;
                    expected += v;
                    expected_sq += v * v;
                }
            }
            assert_eq!(ii.rect_sum(x, y, w, h), expected);
            assert_eq!(ii.rect_sq_sum(x, y, w, h), expected_sq);
        }
    }

    #[test]
    fn test_uniform_image() {
        let img = GrayImage::from_pixel(10, 10, image::Luma([3]));
        let ii = IntegralImage::new(&img);
        assert_eq!(ii.rect_sum(0, 0, 10, 10), 300);
        assert_eq!(ii.rect_sq_sum(0, 0, 10, 10), 900);
    }
}
