//! Single-detector flat-field correction (offset + gain + baseline).
//!
//! Calibration workflow: average dark lines into the per-pixel offset table,
//! derive per-pixel gain from one bright-field acquisition against a target
//! value, optionally average a corrected reference into the baseline table.
//! Application runs `y = (x - offset) * gain - baseline + target_baseline`
//! with each stage individually switchable.

use crate::depth::{max_value, quantize};
use crate::error::{Error, Result};
use crate::stats::Statistics;

/// Gain coefficients are clamped into this range during calibration.
pub const GAIN_MIN: f32 = 0.1;
pub const GAIN_MAX: f32 = 10.0;

/// Fraction of pixels allowed to carry an unusable gain (1 / 1000).
const MAX_INVALID_FRACTION: usize = 1000;

/// Per-pixel offset/gain/baseline tables for one detector.
pub struct FlatField {
    width: usize,
    height: usize,
    bit_depth: u8,
    max_value: u16,

    offset: Vec<u16>,
    gain: Vec<f32>,
    baseline: Vec<u16>,

    enable_offset: bool,
    enable_gain: bool,
    enable_baseline: bool,
    target_baseline: u16,
}

impl FlatField {
    /// Create identity tables (offset 0, gain 1, baseline 0).
    pub fn new(width: usize, height: usize, bit_depth: u8) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(Error::InvalidArgument("image dimensions must be non-zero"));
        }
        let max = max_value(bit_depth)?;
        let pixels = width * height;

        let mut offset = Vec::new();
        offset
            .try_reserve_exact(pixels)
            .map_err(|_| Error::Allocation(pixels * std::mem::size_of::<u16>()))?;
        offset.resize(pixels, 0);

        let mut gain = Vec::new();
        gain.try_reserve_exact(pixels)
            .map_err(|_| Error::Allocation(pixels * std::mem::size_of::<f32>()))?;
        gain.resize(pixels, 1.0);

        let baseline = offset.clone();

        Ok(FlatField {
            width,
            height,
            bit_depth,
            max_value: max,
            offset,
            gain,
            baseline,
            enable_offset: true,
            enable_gain: true,
            enable_baseline: false,
            target_baseline: 0,
        })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn bit_depth(&self) -> u8 {
        self.bit_depth
    }

    pub fn offset(&self) -> &[u16] {
        &self.offset
    }

    pub fn gain(&self) -> &[f32] {
        &self.gain
    }

    pub fn baseline(&self) -> &[u16] {
        &self.baseline
    }

    pub fn target_baseline(&self) -> u16 {
        self.target_baseline
    }

    /// Select which stages run during application.
    pub fn set_flags(&mut self, offset: bool, gain: bool, baseline: bool) {
        self.enable_offset = offset;
        self.enable_gain = gain;
        self.enable_baseline = baseline;
    }

    pub fn set_target_baseline(&mut self, target: u16) {
        self.target_baseline = target;
    }

    pub fn set_offset(&mut self, values: &[u16]) -> Result<()> {
        self.check_len(values.len())?;
        self.offset.copy_from_slice(values);
        Ok(())
    }

    pub fn set_gain(&mut self, values: &[f32]) -> Result<()> {
        self.check_len(values.len())?;
        self.gain.copy_from_slice(values);
        Ok(())
    }

    pub fn set_baseline(&mut self, values: &[u16]) -> Result<()> {
        self.check_len(values.len())?;
        self.baseline.copy_from_slice(values);
        Ok(())
    }

    /// Average dark frames into the offset table, rounded to the nearest
    /// integer with `(sum + n/2) / n`.
    pub fn calibrate_offset(&mut self, frames: &[&[u16]]) -> Result<()> {
        if frames.is_empty() {
            return Err(Error::InvalidArgument("at least one dark frame required"));
        }
        let pixels = self.width * self.height;
        for frame in frames {
            self.check_len(frame.len())?;
        }

        let n = frames.len() as u64;
        let mut accumulator = vec![0u64; pixels];
        for frame in frames {
            for (acc, &v) in accumulator.iter_mut().zip(frame.iter()) {
                *acc += v as u64;
            }
        }
        for (dst, acc) in self.offset.iter_mut().zip(accumulator.iter()) {
            *dst = ((acc + n / 2) / n) as u16;
        }
        Ok(())
    }

    /// Line-scan variant: average dark lines of `width` pixels into a
    /// per-column offset replicated across all rows.
    pub fn calibrate_offset_lines(&mut self, lines: &[&[u16]]) -> Result<()> {
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

        let n = lines.len() as u64;
        let mut accumulator = vec![0u64; self.width];
        for line in lines {
            for (acc, &v) in accumulator.iter_mut().zip(line.iter()) {
                *acc += v as u64;
            }
        }
        for col in 0..self.width {
            let avg = ((accumulator[col] + n / 2) / n) as u16;
            for row in 0..self.height {
                self.offset[row * self.width + col] = avg;
            }
        }
        Ok(())
    }

    /// Derive per-pixel gain from a bright-field frame against `target`.
    ///
    /// Pixels whose offset-corrected response is zero keep gain 1.0; all
    /// coefficients are clamped into `[GAIN_MIN, GAIN_MAX]`.
    pub fn calibrate_gain(&mut self, bright_field: &[u16], target: u16) -> Result<()> {
        self.check_len(bright_field.len())?;
        if target == 0 {
            return Err(Error::InvalidArgument("gain target must be non-zero"));
        }

        for i in 0..bright_field.len() {
            let corrected = bright_field[i] as i32 - self.offset[i] as i32;
            let gain = if corrected > 0 {
                target as f32 / corrected as f32
            } else {
                1.0
            };
            self.gain[i] = gain.clamp(GAIN_MIN, GAIN_MAX);
        }
        Ok(())
    }

    /// Average offset/gain-corrected reference frames into the baseline
    /// table.
    pub fn calibrate_baseline(&mut self, frames: &[&[u16]]) -> Result<()> {
        if frames.is_empty() {
            return Err(Error::InvalidArgument(
                "at least one reference frame required",
            ));
        }
        let pixels = self.width * self.height;
        for frame in frames {
            self.check_len(frame.len())?;
        }

        let n = frames.len() as u64;
        let mut accumulator = vec![0u64; pixels];
        for frame in frames {
            for i in 0..pixels {
                let corrected = frame[i] as f32 - self.offset[i] as f32;
                let gained = (corrected * self.gain[i]).clamp(0.0, self.max_value as f32);
                accumulator[i] += (gained + 0.5) as u64;
            }
        }
        for (dst, acc) in self.baseline.iter_mut().zip(accumulator.iter()) {
            *dst = ((acc + n / 2) / n) as u16;
        }
        Ok(())
    }

    /// Correct a full frame.
    pub fn apply(&self, input: &[u16], output: &mut [u16]) -> Result<()> {
        self.check_len(input.len())?;
        self.check_len(output.len())?;
        for i in 0..input.len() {
            output[i] = self.correct_pixel(input[i], i);
        }
        Ok(())
    }

    /// Correct one line against the tables of row `line_index`.
    pub fn apply_line(&self, input: &[u16], output: &mut [u16], line_index: usize) -> Result<()> {
        if input.len() != self.width || output.len() != self.width {
            return Err(Error::DimensionMismatch {
                expected: self.width,
                actual: input.len(),
            });
        }
        if line_index >= self.height {
            return Err(Error::InvalidArgument("line index beyond table height"));
        }
        let base = line_index * self.width;
        for x in 0..self.width {
            output[x] = self.correct_pixel(input[x], base + x);
        }
        Ok(())
    }

    #[inline]
    fn correct_pixel(&self, value: u16, i: usize) -> u16 {
        let mut corrected = value as f32;
        if self.enable_offset {
            corrected -= self.offset[i] as f32;
        }
        if self.enable_gain {
            corrected *= self.gain[i];
        }
        if self.enable_baseline {
            corrected -= self.baseline[i] as f32;
        }
        corrected += self.target_baseline as f32;
        quantize(corrected, self.max_value)
    }

    pub fn offset_statistics(&self) -> Statistics {
        Statistics::from_u16(&self.offset)
    }

    pub fn gain_statistics(&self) -> Statistics {
        Statistics::from_f32(&self.gain)
    }

    /// Check the gain table for unusable coefficients.
    ///
    /// A coefficient is unusable when it is non-finite, non-positive or
    /// above 100. Up to 0.1% of the pixels may fail before the whole table
    /// is rejected.
    pub fn validate(&self) -> bool {
        let invalid = self
            .gain
            .iter()
            .filter(|g| !g.is_finite() || **g <= 0.0 || **g > 100.0)
            .count();
        let limit = self.gain.len() / MAX_INVALID_FRACTION;
        if invalid > 0 {
            log::warn!(
                "flat-field gain table has {} invalid coefficients (limit {})",
                invalid,
                limit
            );
        }
        invalid < limit.max(1)
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

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn identity(width: usize, height: usize) -> FlatField {
        FlatField::new(width, height, 14).unwrap()
    }

    #[test]
    fn gain_only_identity_passes_values_through() {
        let mut ff = identity(4, 1);
        ff.set_flags(true, true, true);
        let input = [0u16, 1, 1234, 16383];
        let mut output = [0u16; 4];
        ff.apply(&input, &mut output).unwrap();
        assert_eq!(output, input);
    }

    #[test]
    fn offset_identity_with_matching_target() {
        let mut ff = identity(4, 1);
        ff.set_offset(&[100, 100, 100, 100]).unwrap();
        ff.set_target_baseline(100);
        ff.set_flags(true, false, false);
        let input = [500u16, 1000, 0, 16383];
        let mut output = [0u16; 4];
        ff.apply(&input, &mut output).unwrap();
        // (x - 100) + 100 == x, except where the subtraction clamps
        assert_eq!(output, [500, 1000, 100, 16383]);
    }

    #[test]
    fn dark_frame_average_rounds_to_nearest() {
        let mut ff = identity(2, 1);
        let a = [10u16, 11];
        let b = [11u16, 12];
        ff.calibrate_offset(&[&a, &b]).unwrap();
        // (21 + 1) / 2 = 11, (23 + 1) / 2 = 12
        assert_eq!(ff.offset(), &[11, 12]);
    }

    #[test]
    fn bright_field_gain_and_clamping() {
        let mut ff = identity(4, 1);
        ff.set_offset(&[0, 0, 0, 1000]).unwrap();
        ff.calibrate_gain(&[8000, 700, 0, 1000], 8000).unwrap();
        assert_relative_eq!(ff.gain()[0], 1.0);
        assert_relative_eq!(ff.gain()[1], 10.0); // clamped
        assert_relative_eq!(ff.gain()[2], 1.0); // zero response keeps identity
        assert_relative_eq!(ff.gain()[3], 1.0); // offset eats the signal
    }

    #[test]
    fn line_apply_uses_row_tables() {
        let mut ff = identity(2, 2);
        ff.set_offset(&[0, 0, 50, 50]).unwrap();
        ff.set_flags(true, false, false);
        let line = [100u16, 200];
        let mut out = [0u16; 2];
        ff.apply_line(&line, &mut out, 1).unwrap();
        assert_eq!(out, [50, 150]);
        assert!(ff.apply_line(&line, &mut out, 2).is_err());
    }

    #[test]
    fn saturation_bounds_hold_for_extreme_tables() {
        let mut ff = identity(2, 1);
        ff.set_gain(&[10.0, 10.0]).unwrap();
        ff.set_target_baseline(16000);
        let input = [16383u16, 0];
        let mut output = [0u16; 2];
        ff.apply(&input, &mut output).unwrap();
        assert!(output.iter().all(|&v| v <= 16383));
    }

    #[test]
    fn validation_tolerates_sparse_damage() {
        let mut ff = identity(100, 100);
        assert!(ff.validate());
        let mut gain = vec![1.0f32; 100 * 100];
        for g in gain.iter_mut().take(9) {
            *g = f32::NAN;
        }
        ff.set_gain(&gain).unwrap();
        assert!(ff.validate());
        for g in gain.iter_mut().take(11) {
            *g = f32::NAN;
        }
        ff.set_gain(&gain).unwrap();
        assert!(!ff.validate());
    }
}
