use std::fmt;
use std::str::FromStr;

use image::imageops::{self, FilterType};
use image::{DynamicImage, Rgb, RgbImage};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::ReidError;

pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Crop views first enlarge the image by this factor.
const CROP_SCALE: f32 = 1.125;

/// Training augmentation: resize, random flip, zero pad and random crop.
#[derive(Debug, Clone)]
pub struct TrainTransform {
    pub size: [usize; 2],
    pub flip_prob: f64,
    pub padding: u32,
}

impl TrainTransform {
    pub fn new(size: [usize; 2]) -> Self {
        Self {
            size,
            flip_prob: 0.5,
            padding: 10,
        }
    }

    pub fn apply<R: Rng>(&self, img: &DynamicImage, rng: &mut R) -> RgbImage {
        let [height, width] = self.size;
        let mut rgb = resize(img, height as u32, width as u32);

        if rng.gen_bool(self.flip_prob) {
            rgb = imageops::flip_horizontal(&rgb);
        }

        if self.padding > 0 {
            let pad = self.padding;
            let mut padded =
                RgbImage::from_pixel(width as u32 + 2 * pad, height as u32 + 2 * pad, Rgb([0, 0, 0]));
            imageops::overlay(&mut padded, &rgb, pad as i64, pad as i64);

            let x = rng.gen_range(0..=2 * pad);
            let y = rng.gen_range(0..=2 * pad);
            rgb = imageops::crop_imm(&padded, x, y, width as u32, height as u32).to_image();
        }

        rgb
    }
}

/// Deterministic test-time view. Features of several views are summed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestView {
    Plain,
    Flip,
    Center,
    /// Left top.
    Lt,
    Rt,
    Lb,
    Rb,
}

impl TestView {
    pub const ALL: [TestView; 7] = [
        TestView::Plain,
        TestView::Flip,
        TestView::Center,
        TestView::Lt,
        TestView::Rt,
        TestView::Lb,
        TestView::Rb,
    ];

    pub fn apply(&self, img: &DynamicImage, size: [usize; 2]) -> RgbImage {
        let [height, width] = size;
        let (height, width) = (height as u32, width as u32);

        match self {
            Self::Plain => resize(img, height, width),
            Self::Flip => imageops::flip_horizontal(&resize(img, height, width)),
            crop => {
                let big_h = (height as f32 * CROP_SCALE).round() as u32;
                let big_w = (width as f32 * CROP_SCALE).round() as u32;
                let big = resize(img, big_h, big_w);
                let (dy, dx) = (big_h - height, big_w - width);

                let (x, y) = match crop {
                    Self::Center => (dx / 2, dy / 2),
                    Self::Lt => (0, 0),
                    Self::Rt => (dx, 0),
                    Self::Lb => (0, dy),
                    _ => (dx, dy),
                };
                imageops::crop_imm(&big, x, y, width, height).to_image()
            }
        }
    }
}

impl FromStr for TestView {
    type Err = ReidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|view| view.to_string() == s)
            .ok_or_else(|| ReidError::UnknownTestView(s.to_string()))
    }
}

impl fmt::Display for TestView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Plain => "plain",
            Self::Flip => "flip",
            Self::Center => "center",
            Self::Lt => "lt",
            Self::Rt => "rt",
            Self::Lb => "lb",
            Self::Rb => "rb",
        };
        write!(f, "{name}")
    }
}

fn resize(img: &DynamicImage, height: u32, width: u32) -> RgbImage {
    img.resize_exact(width, height, FilterType::Triangle).to_rgb8()
}

/// Append the image as ImageNet-normalized CHW floats.
pub fn normalize_into(rgb: &RgbImage, out: &mut Vec<f32>) {
    let (width, height) = rgb.dimensions();
    out.reserve(3 * (width * height) as usize);

    for c in 0..3 {
        for y in 0..height {
            for x in 0..width {
                let value = rgb.get_pixel(x, y)[c] as f32 / 255.0;
                out.push((value - IMAGENET_MEAN[c]) / IMAGENET_STD[c]);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn gradient(width: u32, height: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x * 10) as u8, (y * 5) as u8, 128])
        }))
    }

    #[test]
    fn train_transform_keeps_size() {
        let transform = TrainTransform::new([32, 16]);
        let mut rng = StdRng::seed_from_u64(0);

        for _ in 0..5 {
            let out = transform.apply(&gradient(20, 40), &mut rng);
            assert_eq!(out.dimensions(), (16, 32));
        }
    }

    #[test]
    fn every_view_produces_the_target_size() {
        let img = gradient(24, 48);
        for view in TestView::ALL {
            assert_eq!(view.apply(&img, [64, 32]).dimensions(), (32, 64), "{view}");
        }
    }

    #[test]
    fn flip_mirrors_plain() {
        let img = gradient(16, 32);
        let plain = TestView::Plain.apply(&img, [32, 16]);
        let flip = TestView::Flip.apply(&img, [32, 16]);

        assert_eq!(plain.get_pixel(0, 3), flip.get_pixel(15, 3));
    }

    #[test]
    fn views_round_trip_through_names() {
        for view in TestView::ALL {
            assert_eq!(view.to_string().parse::<TestView>().unwrap(), view);
        }
        assert!("top".parse::<TestView>().is_err());
    }

    #[test]
    fn normalization_is_channel_major() {
        let rgb = RgbImage::from_pixel(2, 1, Rgb([255, 0, 0]));
        let mut out = Vec::new();
        normalize_into(&rgb, &mut out);

        assert_eq!(out.len(), 6);
        let red = (1.0 - IMAGENET_MEAN[0]) / IMAGENET_STD[0];
        assert!((out[0] - red).abs() < 1e-6);
        assert!((out[1] - red).abs() < 1e-6);
        assert!(out[2] < 0.0);
    }
}
