use image::{GrayImage, RgbImage};

/// Scale every channel of an RGB image into `[0, 1]`, row-major HWC order.
pub fn normalize_image(image: &RgbImage) -> Vec<f32> {
    image.as_raw().iter().map(|&v| v as f32 / 255.0).collect()
}

/// Map a grayscale mask to `{0, 1}` labels.
pub fn binarize_mask(mask: &GrayImage) -> Vec<u8> {
    mask.as_raw().iter().map(|&v| binarize_value(v)).collect()
}

/// `round(v / 255)` with ties to even.
pub fn binarize_value(value: u8) -> u8 {
    (value as f32 / 255.0).round_ties_even() as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Luma, Rgb};

    #[test]
    fn binary_masks_map_to_exact_labels() {
        let mask = GrayImage::from_fn(4, 4, |x, y| Luma([if (x + y) % 2 == 0 { 255 } else { 0 }]));

        let labels = binarize_mask(&mask);

        assert_eq!(labels.len(), 16);
        assert!(labels.iter().all(|&v| v == 0 || v == 1));
        assert_eq!(labels.iter().filter(|&&v| v == 1).count(), 8);
        assert_eq!(labels[0], 1);
        assert_eq!(labels[1], 0);
    }

    #[test]
    fn intermediate_values_round_to_nearest_label() {
        assert_eq!(binarize_value(0), 0);
        assert_eq!(binarize_value(127), 0);
        assert_eq!(binarize_value(128), 1);
        assert_eq!(binarize_value(255), 1);
    }

    #[test]
    fn images_are_scaled_to_unit_range() {
        let image = RgbImage::from_pixel(2, 2, Rgb([0, 51, 255]));

        let values = normalize_image(&image);

        assert_eq!(values.len(), 12);
        assert_eq!(&values[..3], &[0.0, 0.2, 1.0]);
        assert!(values.iter().all(|v| (0.0..=1.0).contains(v)));
    }
}
