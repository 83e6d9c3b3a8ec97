//! Dark-field (background) estimation and correction.
//!
//! The background map is the per-pixel dark level `x0`, averaged from frames
//! acquired with the source off. Correction follows `y = k * (x - x0) + b`,
//! either with one global gain `k` or a per-pixel gain map.

use crate::depth::{max_value, quantize};
use crate::error::{Error, Result};

/// Per-pixel dark-field map with scalar-gain and gain-map correction.
pub struct BackgroundMap {
    width: usize,
    height: usize,
    offset: Vec<f32>,
}

impl BackgroundMap {
    /// Create a zeroed background map for the given geometry.
    pub fn new(width: usize, height: usize) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(Error::InvalidArgument("image dimensions must be non-zero"));
        }
        let pixels = width * height;
        let mut offset = Vec::new();
        offset
            .try_reserve_exact(pixels)
            .map_err(|_| Error::Allocation(pixels * std::mem::size_of::<f32>()))?;
        offset.resize(pixels, 0.0);
        Ok(BackgroundMap {
            width,
            height,
            offset,
        })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn offset(&self) -> &[f32] {
        &self.offset
    }

    /// Replace the map with externally computed values.
    pub fn set_offset(&mut self, values: &[f32]) -> Result<()> {
        self.check_len(values.len())?;
        self.offset.copy_from_slice(values);
        Ok(())
    }

    /// Average full dark frames into the map.
    pub fn calibrate(&mut self, frames: &[&[u16]]) -> Result<()> {
        if frames.is_empty() {
            return Err(Error::InvalidArgument("at least one dark frame required"));
        }
        let pixels = self.width * self.height;
        for frame in frames {
            self.check_len(frame.len())?;
        }

        let mut accumulator = vec![0.0f64; pixels];
        for frame in frames {
            for (acc, &v) in accumulator.iter_mut().zip(frame.iter()) {
                *acc += v as f64;
            }
        }
        let inv = 1.0 / frames.len() as f64;
        for (dst, acc) in self.offset.iter_mut().zip(accumulator.iter()) {
            *dst = (acc * inv) as f32;
        }
        Ok(())
    }

    /// Average dark lines into a per-column profile, replicated across rows.
    ///
    /// Line-scan variant: each input slice is one detector line of `width`
    /// pixels.
    pub fn calibrate_lines(&mut self, lines: &[&[u16]]) -> Result<()> {
        if lines.is_empty() {
            return Err(Error::InvalidArgument("at least one dark line required"));
        }
        for line in lines {
            if line.len() != self.width {
                return Err(Error::DimensionMismatch {
                    expected: self.width,
                    actual: line.len(),
                });
            }
        }

        let mut accumulator = vec![0.0f64; self.width];
        for line in lines {
            for (acc, &v) in accumulator.iter_mut().zip(line.iter()) {
                *acc += v as f64;
            }
        }
        let inv = 1.0 / lines.len() as f64;
        for row in 0..self.height {
            for col in 0..self.width {
                self.offset[row * self.width + col] = (accumulator[col] * inv) as f32;
            }
        }
        Ok(())
    }

    /// Apply `y = gain * (x - x0) + bias` with one global gain.
    pub fn apply(
        &self,
        input: &[u16],
        output: &mut [u16],
        gain: f32,
        bias: f32,
        bit_depth: u8,
    ) -> Result<()> {
        self.check_len(input.len())?;
        self.check_len(output.len())?;
        let max = max_value(bit_depth)?;

        for i in 0..input.len() {
            let corrected = gain * (input[i] as f32 - self.offset[i]) + bias;
            output[i] = quantize(corrected, max);
        }
        Ok(())
    }

    /// Apply `y = gain[i] * (x - x0[i]) + bias` with a per-pixel gain map.
    pub fn apply_gain_map(
        &self,
        input: &[u16],
        output: &mut [u16],
        gain_map: &[f32],
        bias: f32,
        bit_depth: u8,
    ) -> Result<()> {
        self.check_len(input.len())?;
        self.check_len(output.len())?;
        self.check_len(gain_map.len())?;
        let max = max_value(bit_depth)?;

        for i in 0..input.len() {
            let corrected = gain_map[i] * (input[i] as f32 - self.offset[i]) + bias;
            output[i] = quantize(corrected, max);
        }
        Ok(())
    }

    fn check_len(&self, len: usize) -> Result<()> {
        let expected = self.width * self.height;
        if len != expected {
            return Err(Error::DimensionMismatch {
                expected,
                actual: len,
            });
        }
        Ok(())
    }
}
