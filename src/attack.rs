//! Image-degrading attack families.
//!
//! Every attack is a pure transform `image x severity -> image` that keeps the
//! input dimensions. Graded attacks are parameterized by a native severity value
//! whose unit and polarity differ per family; binary attacks (`upscale`,
//! `denoising`) have a single fixed strength.
//!
//! The only source of randomness is the Gaussian noise attack, which draws from
//! a [`ChaCha8Rng`] seeded from [`Attack::seed`] and the severity, so a sweep is
//! reproducible for a fixed seed.

use std::f64::consts::PI;
use std::fmt;
use std::io::Cursor;
use std::str::FromStr;

use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::{ImageFormat, Rgb, RgbImage};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Reserved `attack_type` value of the unattacked row in every sweep.
pub const CLEAN: &str = "clean";

/// Sigma of the Gaussian blur used by the denoising attack.
const DENOISE_SIGMA: f32 = 1.0;

/// Upscale factor of the upscale round trip.
const UPSCALE_FACTOR: u32 = 2;

/// How an attack's native severity relates to the damage it does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Polarity {
    /// Larger native values damage the image more (noise sigma, mask fraction).
    HigherIsMoreSevere,
    /// Smaller native values damage the image more (JPEG quality, crop ratio).
    LowerIsMoreSevere,
}

/// The attack families exercised by the harness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttackKind {
    /// Brightness factor above 1.0.
    IncreaseBrightness,
    /// Brightness factor below 1.0.
    DecreaseBrightness,
    /// Central crop, resized back to the original size.
    Crop,
    /// JPEG recompression.
    Jpeg,
    /// Black centered square covering a fraction of the area.
    Mask,
    /// Additive Gaussian noise.
    Noise,
    /// Semi-transparent overlay image.
    Overlay,
    /// Downscale then upscale back.
    Resize,
    /// Rotation about the image center.
    Rotate,
    /// Upscale then rescale round trip (binary).
    Upscale,
    /// Gaussian-blur denoising (binary).
    #[serde(rename = "denoising")]
    Denoise,
}

impl AttackKind {
    /// Every attack family, graded ones first.
    pub const ALL: [AttackKind; 11] = [
        AttackKind::IncreaseBrightness,
        AttackKind::DecreaseBrightness,
        AttackKind::Crop,
        AttackKind::Jpeg,
        AttackKind::Mask,
        AttackKind::Noise,
        AttackKind::Overlay,
        AttackKind::Resize,
        AttackKind::Rotate,
        AttackKind::Upscale,
        AttackKind::Denoise,
    ];

    /// Stable name used in directory names, CSV rows and configuration.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            AttackKind::IncreaseBrightness => "increase_brightness",
            AttackKind::DecreaseBrightness => "decrease_brightness",
            AttackKind::Crop => "crop",
            AttackKind::Jpeg => "jpeg",
            AttackKind::Mask => "mask",
            AttackKind::Noise => "noise",
            AttackKind::Overlay => "overlay",
            AttackKind::Resize => "resize",
            AttackKind::Rotate => "rotate",
            AttackKind::Upscale => "upscale",
            AttackKind::Denoise => "denoising",
        }
    }

    /// Whether the attack has a single fixed strength instead of a severity sweep.
    #[must_use]
    pub fn is_binary(self) -> bool {
        matches!(self, AttackKind::Upscale | AttackKind::Denoise)
    }

    /// Direction in which the native severity increases damage.
    #[must_use]
    pub fn polarity(self) -> Polarity {
        match self {
            AttackKind::Crop
            | AttackKind::Jpeg
            | AttackKind::DecreaseBrightness
            | AttackKind::Resize => Polarity::LowerIsMoreSevere,
            _ => Polarity::HigherIsMoreSevere,
        }
    }

    /// Name of the native severity column in the decode table.
    #[must_use]
    pub fn severity_column(self) -> &'static str {
        match self {
            AttackKind::IncreaseBrightness | AttackKind::DecreaseBrightness => "brightness_factor",
            AttackKind::Crop => "crop_ratio",
            AttackKind::Jpeg => "jpeg_quality",
            AttackKind::Mask => "mask_fraction",
            AttackKind::Noise => "std_dev",
            AttackKind::Overlay => "alpha",
            AttackKind::Resize => "scale",
            AttackKind::Rotate => "angle",
            AttackKind::Upscale | AttackKind::Denoise => self.name(),
        }
    }

    /// Default severities, ordered mildest to harshest. Empty for binary attacks.
    #[must_use]
    pub fn default_schedule(self) -> Vec<f64> {
        match self {
            AttackKind::IncreaseBrightness => (5..=10).map(|i| f64::from(i) / 5.0).collect(),
            AttackKind::DecreaseBrightness => (1..=5).rev().map(|i| f64::from(i) / 5.0).collect(),
            AttackKind::Crop => (4..=10).rev().map(|i| f64::from(i) / 10.0).collect(),
            AttackKind::Jpeg => (1..=10).rev().map(|i| f64::from(i * 10)).collect(),
            AttackKind::Mask => (0..=20).map(|i| f64::from(i) / 20.0).collect(),
            AttackKind::Noise => (0..=7).map(|i| f64::from(i * 5)).collect(),
            AttackKind::Overlay => (0..=10).map(|i| f64::from(i) / 10.0).collect(),
            AttackKind::Resize => (1..=10).rev().map(|i| f64::from(i) / 10.0).collect(),
            AttackKind::Rotate => (0..10).map(|i| f64::from(i * 2)).collect(),
            AttackKind::Upscale | AttackKind::Denoise => Vec::new(),
        }
    }

    /// File name of the degraded image persisted for a trial.
    ///
    /// The severity is encoded numerically so older tooling can recover it from
    /// the name alone; the sweep manifest stores it as data as well.
    #[must_use]
    pub fn file_name(self, severity: Option<f64>) -> String {
        let s = severity.unwrap_or(0.0);
        match self {
            AttackKind::IncreaseBrightness | AttackKind::DecreaseBrightness => {
                format!("brightness_{s:.2}.png")
            }
            AttackKind::Crop => format!("crop_ratio_{s:.2}.png"),
            AttackKind::Jpeg => format!("jpeg_quality{}.png", plain_number(s)),
            AttackKind::Mask => format!("mask_frac{}.png", plain_number((s * 100.0).round())),
            AttackKind::Noise => format!("gaussian_std{}.png", plain_number(s)),
            AttackKind::Overlay => format!("overlay_alpha{s:.2}.png"),
            AttackKind::Resize => format!("resize_scale{s:.2}.png"),
            AttackKind::Rotate => format!("rotate_{}.png", plain_number(s)),
            AttackKind::Upscale => "upscaled.png".to_string(),
            AttackKind::Denoise => "denoised.png".to_string(),
        }
    }
}

impl fmt::Display for AttackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for AttackKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        AttackKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.name() == s)
            .ok_or_else(|| Error::UnknownAttack(s.to_string()))
    }
}

/// Integers without a fractional part, everything else as-is.
fn plain_number(v: f64) -> String {
    if v.fract() == 0.0 && v.abs() < 1e15 {
        #[allow(clippy::cast_possible_truncation)]
        let n = v as i64;
        n.to_string()
    } else {
        v.to_string()
    }
}

/// A configured attack: the family plus whatever state it needs.
#[derive(Debug, Clone)]
pub struct Attack {
    kind: AttackKind,
    seed: u64,
    overlay: Option<RgbImage>,
}

impl Attack {
    /// Create an attack with seed 0 and the built-in overlay logo.
    #[must_use]
    pub fn new(kind: AttackKind) -> Self {
        Self {
            kind,
            seed: 0,
            overlay: None,
        }
    }

    /// Seed for the noise attack. Other attacks ignore it.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Image blended in by the overlay attack.
    #[must_use]
    pub fn with_overlay(mut self, overlay: RgbImage) -> Self {
        self.overlay = Some(overlay);
        self
    }

    /// The attack family.
    #[must_use]
    pub fn kind(&self) -> AttackKind {
        self.kind
    }

    /// The noise seed.
    #[must_use]
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Apply the attack at `severity`.
    ///
    /// Binary attacks ignore the severity. A graded attack without a severity
    /// returns the image unchanged.
    ///
    /// # Errors
    ///
    /// Returns an error if the JPEG round trip fails to encode or decode.
    pub fn apply(&self, image: &RgbImage, severity: Option<f64>) -> Result<RgbImage> {
        let attacked = match (self.kind, severity) {
            (AttackKind::Upscale, _) => upscale_round_trip(image),
            (AttackKind::Denoise, _) => imageops::blur(image, DENOISE_SIGMA),
            (_, None) => image.clone(),
            (AttackKind::IncreaseBrightness | AttackKind::DecreaseBrightness, Some(s)) => {
                adjust_brightness(image, s)
            }
            (AttackKind::Crop, Some(s)) => center_crop(image, s),
            (AttackKind::Jpeg, Some(s)) => jpeg_round_trip(image, s)?,
            (AttackKind::Mask, Some(s)) => mask_center(image, s),
            (AttackKind::Noise, Some(s)) => {
                let mut rng = ChaCha8Rng::seed_from_u64(self.seed ^ s.to_bits());
                gaussian_noise(image, s, &mut rng)
            }
            (AttackKind::Overlay, Some(s)) => match &self.overlay {
                Some(overlay) => blend_overlay(image, overlay, s),
                None => blend_overlay(image, &default_overlay(), s),
            },
            (AttackKind::Resize, Some(s)) => resize_round_trip(image, s),
            (AttackKind::Rotate, Some(s)) => rotate(image, s),
        };
        Ok(attacked)
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn to_u8(v: f64) -> u8 {
    v.round().clamp(0.0, 255.0) as u8
}

#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
fn scaled_dim(dim: u32, factor: f64) -> u32 {
    ((f64::from(dim) * factor).floor() as u32).clamp(1, dim.max(1))
}

/// Multiply every channel by `factor`.
#[must_use]
pub fn adjust_brightness(image: &RgbImage, factor: f64) -> RgbImage {
    let mut out = image.clone();
    for px in out.pixels_mut() {
        for ch in 0..3 {
            px[ch] = to_u8(f64::from(px[ch]) * factor);
        }
    }
    out
}

/// Keep the central `ratio` of each side and resize back to full size.
#[must_use]
pub fn center_crop(image: &RgbImage, ratio: f64) -> RgbImage {
    let (w, h) = image.dimensions();
    let ratio = ratio.clamp(0.0, 1.0);
    let crop_w = scaled_dim(w, ratio);
    let crop_h = scaled_dim(h, ratio);
    let x = (w - crop_w) / 2;
    let y = (h - crop_h) / 2;
    let cropped = imageops::crop_imm(image, x, y, crop_w, crop_h).to_image();
    imageops::resize(&cropped, w, h, FilterType::Triangle)
}

/// Encode as JPEG at `quality` (1..=100) and decode again.
///
/// # Errors
///
/// Returns an error if the encoder or decoder fails.
pub fn jpeg_round_trip(image: &RgbImage, quality: f64) -> Result<RgbImage> {
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let quality = quality.round().clamp(1.0, 100.0) as u8;
    let mut buf = Vec::new();
    JpegEncoder::new_with_quality(&mut buf, quality).encode_image(image)?;
    let decoded = image::load(Cursor::new(buf), ImageFormat::Jpeg)?;
    Ok(decoded.to_rgb8())
}

/// Black out a centered square covering `fraction` of the image area.
#[must_use]
pub fn mask_center(image: &RgbImage, fraction: f64) -> RgbImage {
    let (w, h) = image.dimensions();
    let area = (f64::from(w) * f64::from(h) * fraction.clamp(0.0, 1.0)).floor();
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let side = area.sqrt().floor() as u32;

    let mut out = image.clone();
    let x0 = (w / 2).saturating_sub(side / 2);
    let y0 = (h / 2).saturating_sub(side / 2);
    let x1 = (x0 + side).min(w);
    let y1 = (y0 + side).min(h);
    for y in y0..y1 {
        for x in x0..x1 {
            out.put_pixel(x, y, Rgb([0, 0, 0]));
        }
    }
    out
}

/// Draw a standard normal sample (Box-Muller).
fn standard_normal<R: Rng>(rng: &mut R) -> f64 {
    let u1: f64 = 1.0 - rng.gen::<f64>();
    let u2: f64 = rng.gen::<f64>();
    (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos()
}

/// Add zero-mean Gaussian noise with standard deviation `std_dev`.
#[must_use]
pub fn gaussian_noise<R: Rng>(image: &RgbImage, std_dev: f64, rng: &mut R) -> RgbImage {
    let mut out = image.clone();
    if std_dev <= 0.0 {
        return out;
    }
    for px in out.pixels_mut() {
        for ch in 0..3 {
            px[ch] = to_u8(f64::from(px[ch]) + std_dev * standard_normal(rng));
        }
    }
    out
}

/// Alpha-blend `overlay` (resized to fit) over `image`.
#[must_use]
pub fn blend_overlay(image: &RgbImage, overlay: &RgbImage, alpha: f64) -> RgbImage {
    let (w, h) = image.dimensions();
    let resized = imageops::resize(overlay, w, h, FilterType::Triangle);
    let alpha = alpha.clamp(0.0, 1.0);
    let mut out = image.clone();
    for (px, over) in out.pixels_mut().zip(resized.pixels()) {
        for ch in 0..3 {
            px[ch] = to_u8(alpha * f64::from(over[ch]) + (1.0 - alpha) * f64::from(px[ch]));
        }
    }
    out
}

/// Built-in overlay logo: a light ring with diagonal stripes on a dark field.
#[must_use]
pub fn default_overlay() -> RgbImage {
    const SIZE: u32 = 128;
    let c = f64::from(SIZE) / 2.0;
    RgbImage::from_fn(SIZE, SIZE, |x, y| {
        let dx = f64::from(x) - c;
        let dy = f64::from(y) - c;
        let r = (dx * dx + dy * dy).sqrt();
        if (36.0..48.0).contains(&r) {
            Rgb([240, 240, 240])
        } else if (x + y) % 16 < 4 {
            Rgb([200, 60, 60])
        } else {
            Rgb([30, 30, 60])
        }
    })
}

/// Downscale by `scale` and upscale back to the original size.
#[must_use]
pub fn resize_round_trip(image: &RgbImage, scale: f64) -> RgbImage {
    let (w, h) = image.dimensions();
    let scale = scale.max(0.0);
    let small = imageops::resize(image, scaled_dim(w, scale), scaled_dim(h, scale), FilterType::Triangle);
    imageops::resize(&small, w, h, FilterType::Triangle)
}

/// Upscale by a fixed factor and rescale to the original size.
#[must_use]
pub fn upscale_round_trip(image: &RgbImage) -> RgbImage {
    let (w, h) = image.dimensions();
    let big = imageops::resize(
        image,
        w * UPSCALE_FACTOR,
        h * UPSCALE_FACTOR,
        FilterType::CatmullRom,
    );
    imageops::resize(&big, w, h, FilterType::Lanczos3)
}

/// Mirror an out-of-range index back into `0..n` (`fedcba|abcdef|fedcba`).
fn reflect(mut i: i64, n: i64) -> i64 {
    if n == 1 {
        return 0;
    }
    loop {
        if i < 0 {
            i = -i - 1;
        } else if i >= n {
            i = 2 * n - i - 1;
        } else {
            return i;
        }
    }
}

/// Rotate counter-clockwise by `angle` degrees about the center.
///
/// Output keeps the input size; uncovered corners are filled by reflecting the
/// image across its borders.
#[must_use]
pub fn rotate(image: &RgbImage, angle: f64) -> RgbImage {
    let (w, h) = image.dimensions();
    let cx = f64::from(w / 2);
    let cy = f64::from(h / 2);
    let (sin, cos) = angle.to_radians().sin_cos();
    let (wi, hi) = (i64::from(w), i64::from(h));

    RgbImage::from_fn(w, h, |x, y| {
        let dx = f64::from(x) - cx;
        let dy = f64::from(y) - cy;
        let sx = cos * dx - sin * dy + cx;
        let sy = sin * dx + cos * dy + cy;

        let fx = sx.floor();
        let fy = sy.floor();
        let tx = sx - fx;
        let ty = sy - fy;
        #[allow(clippy::cast_possible_truncation)]
        let (x0, y0) = (fx as i64, fy as i64);

        let sample = |xx: i64, yy: i64| {
            #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
            let p = image.get_pixel(reflect(xx, wi) as u32, reflect(yy, hi) as u32);
            *p
        };
        let p00 = sample(x0, y0);
        let p10 = sample(x0 + 1, y0);
        let p01 = sample(x0, y0 + 1);
        let p11 = sample(x0 + 1, y0 + 1);

        let mut out = [0u8; 3];
        for ch in 0..3 {
            let top = f64::from(p00[ch]) * (1.0 - tx) + f64::from(p10[ch]) * tx;
            let bottom = f64::from(p01[ch]) * (1.0 - tx) + f64::from(p11[ch]) * tx;
            out[ch] = to_u8(top * (1.0 - ty) + bottom * ty);
        }
        Rgb(out)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[allow(clippy::cast_possible_truncation)]
    fn gradient(w: u32, h: u32) -> RgbImage {
        RgbImage::from_fn(w, h, |x, y| {
            Rgb([(x * 3 % 256) as u8, (y * 5 % 256) as u8, ((x + y) % 256) as u8])
        })
    }

    #[test]
    fn names_round_trip_through_from_str() {
        for kind in AttackKind::ALL {
            assert_eq!(kind.name().parse::<AttackKind>().unwrap(), kind);
        }
        assert!("clean".parse::<AttackKind>().is_err());
        assert!("blur".parse::<AttackKind>().is_err());
    }

    #[test]
    fn polarity_matches_reversal_set() {
        let reversed: Vec<_> = AttackKind::ALL
            .iter()
            .filter(|k| k.polarity() == Polarity::LowerIsMoreSevere)
            .map(|k| k.name())
            .collect();
        assert_eq!(reversed, ["decrease_brightness", "crop", "jpeg", "resize"]);
    }

    #[test]
    fn default_schedules_follow_polarity() {
        for kind in AttackKind::ALL {
            let schedule = kind.default_schedule();
            assert_eq!(schedule.is_empty(), kind.is_binary(), "{kind}");
            for pair in schedule.windows(2) {
                match kind.polarity() {
                    Polarity::HigherIsMoreSevere => assert!(pair[0] < pair[1], "{kind}"),
                    Polarity::LowerIsMoreSevere => assert!(pair[0] > pair[1], "{kind}"),
                }
            }
        }
        assert_eq!(AttackKind::Jpeg.default_schedule()[0], 100.0);
        assert_eq!(AttackKind::Mask.default_schedule()[3], 0.15);
    }

    #[test]
    fn file_names_encode_severity() {
        assert_eq!(AttackKind::Crop.file_name(Some(0.4)), "crop_ratio_0.40.png");
        assert_eq!(AttackKind::Jpeg.file_name(Some(90.0)), "jpeg_quality90.png");
        assert_eq!(AttackKind::Mask.file_name(Some(0.25)), "mask_frac25.png");
        assert_eq!(AttackKind::Mask.file_name(Some(0.29)), "mask_frac29.png");
        assert_eq!(AttackKind::Noise.file_name(Some(2.5)), "gaussian_std2.5.png");
        assert_eq!(AttackKind::Rotate.file_name(Some(4.0)), "rotate_4.png");
        assert_eq!(
            AttackKind::DecreaseBrightness.file_name(Some(0.2)),
            "brightness_0.20.png"
        );
        assert_eq!(AttackKind::Upscale.file_name(None), "upscaled.png");
    }

    #[test]
    fn identity_severities_leave_image_unchanged() {
        let img = gradient(40, 30);
        let cases = [
            (AttackKind::IncreaseBrightness, 1.0),
            (AttackKind::Mask, 0.0),
            (AttackKind::Noise, 0.0),
            (AttackKind::Overlay, 0.0),
            (AttackKind::Rotate, 0.0),
        ];
        for (kind, s) in cases {
            let out = Attack::new(kind).apply(&img, Some(s)).unwrap();
            assert_eq!(out, img, "{kind} at {s}");
        }
    }

    #[test]
    fn attacks_preserve_dimensions() {
        let img = gradient(37, 23);
        for kind in AttackKind::ALL {
            let severity = kind.default_schedule().last().copied();
            let out = Attack::new(kind).apply(&img, severity).unwrap();
            assert_eq!(out.dimensions(), img.dimensions(), "{kind}");
        }
    }

    #[test]
    fn full_mask_blacks_out_square_image() {
        let img = RgbImage::from_pixel(20, 20, Rgb([200, 200, 200]));
        let out = mask_center(&img, 1.0);
        assert!(out.pixels().all(|p| p.0 == [0, 0, 0]));

        let quarter = mask_center(&img, 0.25);
        let black = quarter.pixels().filter(|p| p.0 == [0, 0, 0]).count();
        assert_eq!(black, 100);
    }

    #[test]
    fn brightness_scales_and_clamps() {
        let img = RgbImage::from_pixel(2, 2, Rgb([100, 200, 10]));
        let out = adjust_brightness(&img, 1.5);
        assert_eq!(out.get_pixel(0, 0).0, [150, 255, 15]);
        let dark = adjust_brightness(&img, 0.0);
        assert_eq!(dark.get_pixel(1, 1).0, [0, 0, 0]);
    }

    #[test]
    fn noise_is_reproducible_for_a_seed() {
        let img = gradient(32, 32);
        let a = Attack::new(AttackKind::Noise).with_seed(7);
        let first = a.apply(&img, Some(10.0)).unwrap();
        let second = a.apply(&img, Some(10.0)).unwrap();
        assert_eq!(first, second);
        assert_ne!(first, img);

        let other = Attack::new(AttackKind::Noise)
            .with_seed(8)
            .apply(&img, Some(10.0))
            .unwrap();
        assert_ne!(first, other);
    }

    #[test]
    fn full_overlay_replaces_image() {
        let img = gradient(16, 16);
        let overlay = RgbImage::from_pixel(4, 4, Rgb([9, 99, 199]));
        let out = blend_overlay(&img, &overlay, 1.0);
        assert!(out.pixels().all(|p| p.0 == [9, 99, 199]));
    }

    #[test]
    fn jpeg_round_trip_degrades_with_quality() {
        let img = gradient(64, 64);
        let diff = |other: &RgbImage| -> u64 {
            img.as_raw()
                .iter()
                .zip(other.as_raw())
                .map(|(a, b)| u64::from(a.abs_diff(*b)))
                .sum()
        };
        let high = jpeg_round_trip(&img, 100.0).unwrap();
        let low = jpeg_round_trip(&img, 5.0).unwrap();
        assert!(diff(&high) < diff(&low));
    }

    #[test]
    fn reflect_mirrors_indices() {
        assert_eq!(reflect(-1, 5), 0);
        assert_eq!(reflect(-2, 5), 1);
        assert_eq!(reflect(5, 5), 4);
        assert_eq!(reflect(6, 5), 3);
        assert_eq!(reflect(3, 5), 3);
        assert_eq!(reflect(-7, 1), 0);
    }
}
