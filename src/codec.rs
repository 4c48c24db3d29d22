//! Watermark embed/decode oracles.
//!
//! The harness treats a watermarking method as a black box that can embed a
//! short ASCII payload and later try to read it back. [`WatermarkCodec`] is that
//! seam. Methods come in two payload widths: 32-bit methods carry 4 bytes,
//! 64-bit methods carry 8.
//!
//! [`DctQimCodec`] is the built-in method: quantization index modulation of
//! mid-frequency coefficients of 8x8 block DCTs of the luma plane, with a keyed
//! dither. Each payload bit is spread round-robin over all blocks and recovered
//! by a soft majority vote.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use image::RgbImage;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rustdct::{DctPlanner, TransformType2And3};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Side of a DCT block.
const BLOCK: usize = 8;

/// Mid-frequency coefficients (row-major index in the block) carrying each bit.
const CARRIERS: [usize; 3] = [BLOCK + 2, 2 * BLOCK + 1, 2 * BLOCK + 2];

/// Default quantization step in unnormalized DCT units.
pub const DEFAULT_STEP: f32 = 40.0;

/// Default dither key.
pub const DEFAULT_KEY: u64 = 0x5eed_0f_7a7e;

/// Number of payload bits carried by a method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadWidth {
    /// 4 ASCII bytes.
    Bits32,
    /// 8 ASCII bytes.
    Bits64,
}

impl PayloadWidth {
    /// Payload capacity in bytes.
    #[must_use]
    pub fn bytes(self) -> usize {
        match self {
            PayloadWidth::Bits32 => 4,
            PayloadWidth::Bits64 => 8,
        }
    }

    /// Payload capacity in bits.
    #[must_use]
    pub fn bits(self) -> usize {
        self.bytes() * 8
    }

    /// Fit `payload` to this width.
    ///
    /// 32-bit methods keep the first 4 characters; 64-bit methods reject
    /// payloads longer than 8.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPayload`] for empty, non-ASCII or (64-bit)
    /// over-long payloads.
    pub fn prepare(self, payload: &str) -> Result<String> {
        let invalid = |reason: &str| Error::InvalidPayload {
            payload: payload.to_string(),
            reason: reason.to_string(),
        };
        if payload.is_empty() {
            return Err(invalid("payload is empty"));
        }
        if !payload.is_ascii() {
            return Err(invalid("payload must be ASCII"));
        }
        match self {
            PayloadWidth::Bits32 => Ok(payload.chars().take(self.bytes()).collect()),
            PayloadWidth::Bits64 if payload.len() > self.bytes() => {
                Err(invalid("payload longer than 8 bytes"))
            }
            PayloadWidth::Bits64 => Ok(payload.to_string()),
        }
    }
}

/// Outcome of a decode attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    /// Recovered payload (possibly garbage).
    pub payload: String,
    /// Whether the recovered payload equals the expected one.
    pub success: bool,
}

/// A watermarking method: embed a payload, later try to read it back.
pub trait WatermarkCodec: Send + Sync {
    /// Method name as used in result directories.
    fn name(&self) -> &str;

    /// Payload width carried by the method.
    fn width(&self) -> PayloadWidth;

    /// Embed `payload` into a copy of `image`.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload does not fit or the image is too small.
    fn embed(&self, image: &RgbImage, payload: &str) -> Result<RgbImage>;

    /// Decode `image` and compare against `expected`.
    fn decode(&self, image: &RgbImage, expected: &str) -> Decoded;
}

impl fmt::Debug for dyn WatermarkCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatermarkCodec")
            .field("name", &self.name())
            .field("width", &self.width())
            .finish()
    }
}

/// Block-DCT quantization index modulation on luma.
#[derive(Debug, Clone)]
pub struct DctQimCodec {
    name: String,
    width: PayloadWidth,
    key: u64,
    step: f32,
}

impl DctQimCodec {
    /// Create a codec with the default step.
    #[must_use]
    pub fn new(name: impl Into<String>, width: PayloadWidth, key: u64) -> Self {
        Self {
            name: name.into(),
            width,
            key,
            step: DEFAULT_STEP,
        }
    }

    /// Override the quantization step. Larger steps survive more damage but
    /// are more visible.
    #[must_use]
    pub fn with_step(mut self, step: f32) -> Self {
        self.step = step;
        self
    }

    fn dither(&self, blocks: usize) -> Vec<f32> {
        let mut rng = ChaCha8Rng::seed_from_u64(self.key);
        (0..blocks * CARRIERS.len())
            .map(|_| rng.gen_range(0.0..self.step))
            .collect()
    }
}

/// 8x8 block DCT over a single plane.
struct BlockDct {
    transform: Arc<dyn TransformType2And3<f32>>,
}

impl BlockDct {
    fn new() -> Self {
        let mut planner = DctPlanner::new();
        Self {
            transform: planner.plan_dct2(BLOCK),
        }
    }

    fn transpose(block: &mut [f32; BLOCK * BLOCK]) {
        for i in 0..BLOCK {
            for j in (i + 1)..BLOCK {
                block.swap(i * BLOCK + j, j * BLOCK + i);
            }
        }
    }

    fn forward(&self, block: &mut [f32; BLOCK * BLOCK]) {
        for row in block.chunks_mut(BLOCK) {
            self.transform.process_dct2(row);
        }
        Self::transpose(block);
        for row in block.chunks_mut(BLOCK) {
            self.transform.process_dct2(row);
        }
        Self::transpose(block);
    }

    fn inverse(&self, block: &mut [f32; BLOCK * BLOCK]) {
        for row in block.chunks_mut(BLOCK) {
            self.transform.process_dct3(row);
        }
        Self::transpose(block);
        for row in block.chunks_mut(BLOCK) {
            self.transform.process_dct3(row);
        }
        Self::transpose(block);
        #[allow(clippy::cast_precision_loss)]
        let coeff = 4.0 / (BLOCK * BLOCK) as f32;
        for v in block.iter_mut() {
            *v *= coeff;
        }
    }
}

/// Luma plane in `[0, 255]`, row-major.
fn luma(image: &RgbImage) -> Vec<f32> {
    image
        .pixels()
        .map(|p| 0.299 * f32::from(p[0]) + 0.587 * f32::from(p[1]) + 0.114 * f32::from(p[2]))
        .collect()
}

fn block_grid(image: &RgbImage) -> (usize, usize) {
    (image.width() as usize / BLOCK, image.height() as usize / BLOCK)
}

fn read_block(plane: &[f32], stride: usize, bx: usize, by: usize) -> [f32; BLOCK * BLOCK] {
    let mut block = [0f32; BLOCK * BLOCK];
    for j in 0..BLOCK {
        let start = (by * BLOCK + j) * stride + bx * BLOCK;
        block[j * BLOCK..(j + 1) * BLOCK].copy_from_slice(&plane[start..start + BLOCK]);
    }
    block
}

fn write_block(plane: &mut [f32], stride: usize, bx: usize, by: usize, block: &[f32; BLOCK * BLOCK]) {
    for j in 0..BLOCK {
        let start = (by * BLOCK + j) * stride + bx * BLOCK;
        plane[start..start + BLOCK].copy_from_slice(&block[j * BLOCK..(j + 1) * BLOCK]);
    }
}

fn payload_bits(payload: &str, width: PayloadWidth) -> Vec<bool> {
    let mut bytes = payload.as_bytes().to_vec();
    bytes.resize(width.bytes(), 0);
    bytes
        .iter()
        .flat_map(|b| (0..8).rev().map(move |i| (b >> i) & 1 == 1))
        .collect()
}

fn bits_to_payload(bits: &[bool]) -> String {
    let bytes: Vec<u8> = bits
        .chunks(8)
        .map(|chunk| chunk.iter().fold(0u8, |acc, &b| (acc << 1) | u8::from(b)))
        .collect();
    String::from_utf8_lossy(&bytes)
        .trim_end_matches('\0')
        .to_string()
}

/// Position of `x` relative to the lattice `offset + k*step`, as a fraction of
/// the step in `[0, 0.5]`.
fn lattice_distance(x: f32, offset: f32, step: f32) -> f32 {
    let r = (x - offset) / step;
    (r - r.round()).abs()
}

impl WatermarkCodec for DctQimCodec {
    fn name(&self) -> &str {
        &self.name
    }

    fn width(&self) -> PayloadWidth {
        self.width
    }

    fn embed(&self, image: &RgbImage, payload: &str) -> Result<RgbImage> {
        let payload = self.width.prepare(payload)?;
        let bits = payload_bits(&payload, self.width);
        let (bw, bh) = block_grid(image);
        let blocks = bw * bh;
        if blocks < bits.len() {
            return Err(Error::ImageTooSmall {
                width: image.width(),
                height: image.height(),
                bits: bits.len(),
            });
        }

        let stride = image.width() as usize;
        let original = luma(image);
        let mut marked = original.clone();
        let dither = self.dither(blocks);
        let dct = BlockDct::new();

        for by in 0..bh {
            for bx in 0..bw {
                let b = by * bw + bx;
                let bit = bits[b % bits.len()];
                let mut block = read_block(&marked, stride, bx, by);
                dct.forward(&mut block);
                for (c, &idx) in CARRIERS.iter().enumerate() {
                    let offset = dither[b * CARRIERS.len() + c] + if bit { self.step / 2.0 } else { 0.0 };
                    let x = block[idx];
                    block[idx] = self.step * ((x - offset) / self.step).round() + offset;
                }
                dct.inverse(&mut block);
                write_block(&mut marked, stride, bx, by, &block);
            }
        }

        let mut out = image.clone();
        for ((px, before), after) in out.pixels_mut().zip(&original).zip(&marked) {
            let delta = after - before;
            for ch in 0..3 {
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                {
                    px[ch] = (f32::from(px[ch]) + delta).round().clamp(0.0, 255.0) as u8;
                }
            }
        }
        Ok(out)
    }

    fn decode(&self, image: &RgbImage, expected: &str) -> Decoded {
        let nbits = self.width.bits();
        let (bw, bh) = block_grid(image);
        let blocks = bw * bh;
        if blocks < nbits {
            log::debug!(
                "{}: {}x{} image has too few blocks to decode",
                self.name,
                image.width(),
                image.height()
            );
            return Decoded {
                payload: String::new(),
                success: false,
            };
        }

        let stride = image.width() as usize;
        let plane = luma(image);
        let dither = self.dither(blocks);
        let dct = BlockDct::new();
        let mut votes = vec![0f32; nbits];

        for by in 0..bh {
            for bx in 0..bw {
                let b = by * bw + bx;
                let mut block = read_block(&plane, stride, bx, by);
                dct.forward(&mut block);
                for (c, &idx) in CARRIERS.iter().enumerate() {
                    let d = lattice_distance(block[idx], dither[b * CARRIERS.len() + c], self.step);
                    votes[b % nbits] += d - 0.25;
                }
            }
        }

        let bits: Vec<bool> = votes.iter().map(|&v| v > 0.0).collect();
        let payload = bits_to_payload(&bits);
        let success = payload == expected;
        Decoded { payload, success }
    }
}

/// Watermarking methods by name.
#[derive(Clone, Default)]
pub struct CodecRegistry {
    codecs: BTreeMap<String, Arc<dyn WatermarkCodec>>,
}

impl fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.codecs.keys()).finish()
    }
}

impl CodecRegistry {
    /// Registry holding the built-in `dctQim` (64-bit) and `dctQim32` (32-bit) methods.
    #[must_use]
    pub fn with_builtin(key: u64) -> Self {
        let mut registry = Self::default();
        registry.register(Arc::new(DctQimCodec::new("dctQim", PayloadWidth::Bits64, key)));
        registry.register(Arc::new(DctQimCodec::new("dctQim32", PayloadWidth::Bits32, key)));
        registry
    }

    /// Add or replace a method.
    pub fn register(&mut self, codec: Arc<dyn WatermarkCodec>) {
        self.codecs.insert(codec.name().to_string(), codec);
    }

    /// Look up a method by name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownMethod`] if no method has that name.
    pub fn get(&self, name: &str) -> Result<Arc<dyn WatermarkCodec>> {
        self.codecs
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownMethod(name.to_string()))
    }

    /// Registered method names.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.codecs.keys().map(String::as_str)
    }
}
