//! Grayscale raster helpers shared by the locator and extractor.

/// Bilinear resize of a grayscale image.
///
/// Uses half-pixel-centered sampling for sub-pixel accuracy.
pub(crate) fn resize_bilinear(
    src: &[u8],
    src_w: usize,
    src_h: usize,
    dst_w: usize,
    dst_h: usize,
) -> Vec<u8> {
    let mut dst = vec![0u8; dst_w * dst_h];
    if src_w == 0 || src_h == 0 || dst_w == 0 || dst_h == 0 {
        return dst;
    }

    let scale_x = src_w as f32 / dst_w as f32;
    let scale_y = src_h as f32 / dst_h as f32;

    for y in 0..dst_h {
        let src_y = (y as f32 + 0.5) * scale_y - 0.5;
        let y0 = (src_y.floor() as i32).clamp(0, src_h as i32 - 1) as usize;
        let y1 = (y0 + 1).min(src_h - 1);
        let fy = (src_y - src_y.floor()).clamp(0.0, 1.0);

        for x in 0..dst_w {
            let src_x = (x as f32 + 0.5) * scale_x - 0.5;
            let x0 = (src_x.floor() as i32).clamp(0, src_w as i32 - 1) as usize;
            let x1 = (x0 + 1).min(src_w - 1);
            let fx = (src_x - src_x.floor()).clamp(0.0, 1.0);

            let tl = src[y0 * src_w + x0] as f32;
            let tr = src[y0 * src_w + x1] as f32;
            let bl = src[y1 * src_w + x0] as f32;
            let br = src[y1 * src_w + x1] as f32;

            let val = tl * (1.0 - fx) * (1.0 - fy)
                + tr * fx * (1.0 - fy)
                + bl * (1.0 - fx) * fy
                + br * fx * fy;

            dst[y * dst_w + x] = val.round().clamp(0.0, 255.0) as u8;
        }
    }

    dst
}

/// Copy a rectangle out of a grayscale image.
///
/// The caller must have validated that the rectangle lies within bounds.
pub(crate) fn crop(
    src: &[u8],
    src_w: usize,
    x0: usize,
    y0: usize,
    crop_w: usize,
    crop_h: usize,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(crop_w * crop_h);
    for row in y0..y0 + crop_h {
        let start = row * src_w + x0;
        out.extend_from_slice(&src[start..start + crop_w]);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resize_uniform_stays_uniform() {
        let src = vec![128u8; 50 * 40];
        let dst = resize_bilinear(&src, 50, 40, 100, 80);
        assert_eq!(dst.len(), 100 * 80);
        assert!(dst.iter().all(|&p| p == 128));
    }

    #[test]
    fn test_resize_identity_dimensions() {
        let src: Vec<u8> = (0..16).map(|i| i as u8 * 16).collect();
        let dst = resize_bilinear(&src, 4, 4, 4, 4);
        assert_eq!(dst, src);
    }

    #[test]
    fn test_crop_extracts_rectangle() {
        // 4x4 image with row-major values 0..16
        let src: Vec<u8> = (0..16).collect();
        let out = crop(&src, 4, 1, 1, 2, 2);
        assert_eq!(out, vec![5, 6, 9, 10]);
    }

    #[test]
    fn test_crop_full_image() {
        let src: Vec<u8> = (0..12).collect();
        let out = crop(&src, 4, 0, 0, 4, 3);
        assert_eq!(out, src);
    }
}
