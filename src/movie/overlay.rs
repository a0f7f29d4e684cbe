use image::{Rgb, RgbImage};

/// Frame dimensions are padded up to a multiple of this for codec macroblock alignment.
pub const MACROBLOCK_SIZE: u32 = 16;

/// The arm length of spot crosses in pixels.
pub const CROSS_ARM: i64 = 3;

/// The colour of spot crosses.
pub const CROSS_COLOR: Rgb<u8> = Rgb([255, 0, 0]);

/// Round `n` up to the next multiple of [`MACROBLOCK_SIZE`].
#[must_use]
pub fn padded_dimension(n: u32) -> u32 {
    n.div_ceil(MACROBLOCK_SIZE) * MACROBLOCK_SIZE
}

/// Draw a cross centred on the rounded `(y, x)`. Pixels outside the image are skipped.
pub fn draw_cross(image: &mut RgbImage, y: f64, x: f64) {
    if !y.is_finite() || !x.is_finite() {
        return;
    }
    #[allow(clippy::cast_possible_truncation)]
    let (cy, cx) = (y.round() as i64, x.round() as i64);
    let (width, height) = (i64::from(image.width()), i64::from(image.height()));
    let horizontal = (-CROSS_ARM..=CROSS_ARM).map(|d| (cy, cx + d));
    let vertical = (-CROSS_ARM..=CROSS_ARM).map(|d| (cy + d, cx));
    for (py, px) in horizontal.chain(vertical) {
        if (0..height).contains(&py) && (0..width).contains(&px) {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            image.put_pixel(px as u32, py as u32, CROSS_COLOR);
        }
    }
}

/// Centre `image` on a black canvas with dimensions padded by [`padded_dimension`].
#[must_use]
pub fn letterbox(image: &RgbImage) -> RgbImage {
    let (width, height) = image.dimensions();
    let (padded_width, padded_height) = (padded_dimension(width), padded_dimension(height));
    if (padded_width, padded_height) == (width, height) {
        return image.clone();
    }
    let mut canvas = RgbImage::new(padded_width, padded_height);
    image::imageops::replace(
        &mut canvas,
        image,
        i64::from((padded_width - width) / 2),
        i64::from((padded_height - height) / 2),
    );
    canvas
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn padded_dimensions() {
        assert_eq!(padded_dimension(1), 16);
        assert_eq!(padded_dimension(16), 16);
        assert_eq!(padded_dimension(17), 32);
        assert_eq!(padded_dimension(100), 112);
    }

    #[test]
    fn cross_drawn_and_clipped() {
        let mut image = RgbImage::new(10, 10);
        draw_cross(&mut image, 4.6, 5.2);
        assert_eq!(*image.get_pixel(5, 5), CROSS_COLOR);
        assert_eq!(*image.get_pixel(2, 5), CROSS_COLOR);
        assert_eq!(*image.get_pixel(8, 5), CROSS_COLOR);
        assert_eq!(*image.get_pixel(5, 8), CROSS_COLOR);
        assert_eq!(*image.get_pixel(1, 5), Rgb([0, 0, 0]));
        assert_eq!(*image.get_pixel(6, 6), Rgb([0, 0, 0]));
        let lit = image.pixels().filter(|p| **p == CROSS_COLOR).count();
        assert_eq!(lit, 13);

        let mut image = RgbImage::new(10, 10);
        draw_cross(&mut image, 0.0, 0.0);
        let lit = image.pixels().filter(|p| **p == CROSS_COLOR).count();
        assert_eq!(lit, 7);

        let mut image = RgbImage::new(10, 10);
        draw_cross(&mut image, -20.0, 3.0);
        draw_cross(&mut image, f64::NAN, 3.0);
        assert!(image.pixels().all(|p| *p == Rgb([0, 0, 0])));
    }

    #[test]
    fn letterbox_centres_frame() {
        let image = RgbImage::from_pixel(12, 14, Rgb([9, 9, 9]));
        let padded = letterbox(&image);
        assert_eq!(padded.dimensions(), (16, 16));
        assert_eq!(*padded.get_pixel(0, 0), Rgb([0, 0, 0]));
        assert_eq!(*padded.get_pixel(1, 0), Rgb([0, 0, 0]));
        assert_eq!(*padded.get_pixel(2, 1), Rgb([9, 9, 9]));
        assert_eq!(*padded.get_pixel(13, 14), Rgb([9, 9, 9]));
        assert_eq!(*padded.get_pixel(14, 14), Rgb([0, 0, 0]));
        assert_eq!(*padded.get_pixel(13, 15), Rgb([0, 0, 0]));

        let aligned = RgbImage::new(32, 16);
        assert_eq!(letterbox(&aligned).dimensions(), (32, 16));
    }
}
