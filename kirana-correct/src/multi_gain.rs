//! Multi-gain correction with threshold-based mode selection.
//!
//! Detectors that switch analog gain per intensity range carry one
//! offset/gain table pair per gain mode plus a shared baseline. A pixel is
//! corrected with the tables of the mode its raw value falls into;
//! `thresholds[k]` is the exclusive upper edge of mode `k`, the last mode
//! catches everything above. Optional blending linearly mixes the two
//! adjacent modes inside a band around each threshold to hide the gain step.

use crate::depth::{max_value, quantize};
use crate::error::{Error, Result};
use crate::stats::Statistics;
use crate::flat_field::{GAIN_MAX, GAIN_MIN};

/// Maximum number of gain modes the hardware supports.
pub const MAX_MODES: usize = 8;

const MAX_INVALID_FRACTION: usize = 1000;

/// Per-mode correction tables with automatic mode selection.
pub struct MultiGain {
    width: usize,
    height: usize,
    bit_depth: u8,
    max_value: u16,

    modes: usize,
    offset: Vec<Vec<u16>>,
    gain: Vec<Vec<f32>>,
    baseline: Vec<u16>,
    thresholds: Vec<u16>,
}

impl MultiGain {
    /// Create identity tables for `modes` gain modes with evenly spread
    /// thresholds.
    pub fn new(width: usize, height: usize, bit_depth: u8, modes: usize) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(Error::InvalidArgument("image dimensions must be non-zero"));
        }
        if modes == 0 || modes > MAX_MODES {
            return Err(Error::InvalidArgument("gain mode count must be 1..=8"));
        }
        let max = max_value(bit_depth)?;
        let pixels = width * height;

        let mut offset = Vec::with_capacity(modes);
        let mut gain = Vec::with_capacity(modes);
        for _ in 0..modes {
            let mut o = Vec::new();
            o.try_reserve_exact(pixels)
                .map_err(|_| Error::Allocation(pixels * std::mem::size_of::<u16>()))?;
            o.resize(pixels, 0);
            offset.push(o);

            let mut g = Vec::new();
            g.try_reserve_exact(pixels)
                .map_err(|_| Error::Allocation(pixels * std::mem::size_of::<f32>()))?;
            g.resize(pixels, 1.0);
            gain.push(g);
        }

        // Evenly spread upper edges over the dynamic range
        let thresholds = (0..modes)
            .map(|k| ((max as u32 * (k as u32 + 1)) / modes as u32) as u16)
            .collect();

        Ok(MultiGain {
            width,
            height,
            bit_depth,
            max_value: max,
            modes,
            offset,
            gain,
            baseline: vec![0; pixels],
            thresholds,
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

    pub fn modes(&self) -> usize {
        self.modes
    }

    pub fn thresholds(&self) -> &[u16] {
        &self.thresholds
    }

    /// Replace the threshold vector. Edges below the last mode must be
    /// strictly increasing.
    pub fn set_thresholds(&mut self, thresholds: &[u16]) -> Result<()> {
        if thresholds.len() != self.modes {
            return Err(Error::DimensionMismatch {
                expected: self.modes,
                actual: thresholds.len(),
            });
        }
        for pair in thresholds[..self.modes.saturating_sub(1)].windows(2) {
            if pair[0] >= pair[1] {
                return Err(Error::InvalidArgument(
                    "thresholds must be strictly increasing",
                ));
            }
        }
        self.thresholds.copy_from_slice(thresholds);
        Ok(())
    }

    pub fn set_mode_offset(&mut self, mode: usize, values: &[u16]) -> Result<()> {
        self.check_mode(mode)?;
        self.check_len(values.len())?;
        self.offset[mode].copy_from_slice(values);
        Ok(())
    }

    pub fn set_mode_gain(&mut self, mode: usize, values: &[f32]) -> Result<()> {
        self.check_mode(mode)?;
        self.check_len(values.len())?;
        self.gain[mode].copy_from_slice(values);
        Ok(())
    }

    pub fn set_baseline(&mut self, values: &[u16]) -> Result<()> {
        self.check_len(values.len())?;
        self.baseline.copy_from_slice(values);
        Ok(())
    }

    pub fn mode_offset(&self, mode: usize) -> Result<&[u16]> {
        self.check_mode(mode)?;
        Ok(&self.offset[mode])
    }

    pub fn mode_gain(&self, mode: usize) -> Result<&[f32]> {
        self.check_mode(mode)?;
        Ok(&self.gain[mode])
    }

    /// Average dark frames captured in one gain mode into its offset table.
    pub fn calibrate_offset(&mut self, mode: usize, frames: &[&[u16]]) -> Result<()> {
        self.check_mode(mode)?;
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
        for (dst, acc) in self.offset[mode].iter_mut().zip(accumulator.iter()) {
            *dst = ((acc + n / 2) / n) as u16;
        }
        Ok(())
    }

    /// Derive the gain table of one mode from a bright-field frame captured
    /// in that mode.
    pub fn calibrate_gain(&mut self, mode: usize, bright_field: &[u16], target: u16) -> Result<()> {
        self.check_mode(mode)?;
        self.check_len(bright_field.len())?;
        if target == 0 {
            return Err(Error::InvalidArgument("gain target must be non-zero"));
        }

        for i in 0..bright_field.len() {
            let corrected = bright_field[i] as i32 - self.offset[mode][i] as i32;
            let gain = if corrected > 0 {
                target as f32 / corrected as f32
            } else {
                1.0
            };
            self.gain[mode][i] = gain.clamp(GAIN_MIN, GAIN_MAX);
        }
        Ok(())
    }

    /// Gain mode for a raw value: smallest `k` with `value < thresholds[k]`,
    /// else the last mode.
    #[inline]
    pub fn select_mode(&self, value: u16) -> usize {
        for k in 0..self.modes - 1 {
            if value < self.thresholds[k] {
                return k;
            }
        }
        self.modes - 1
    }

    /// Correct a frame. `fixed_mode` bypasses automatic selection.
    pub fn apply(&self, input: &[u16], output: &mut [u16], fixed_mode: Option<usize>) -> Result<()> {
        self.check_len(input.len())?;
        self.check_len(output.len())?;
        if let Some(mode) = fixed_mode {
            self.check_mode(mode)?;
        }

        for i in 0..input.len() {
            let mode = fixed_mode.unwrap_or_else(|| self.select_mode(input[i]));
            output[i] = quantize(self.correct_pixel(input[i], i, mode), self.max_value);
        }
        Ok(())
    }

    /// Correct a frame, blending the two adjacent modes within `blend_width`
    /// counts of each threshold.
    pub fn apply_blended(&self, input: &[u16], output: &mut [u16], blend_width: u16) -> Result<()> {
        if blend_width == 0 {
            return self.apply(input, output, None);
        }
        self.check_len(input.len())?;
        self.check_len(output.len())?;

        for i in 0..input.len() {
            let value = input[i];
            let mode = self.select_mode(value);

            // Find an adjacent mode whose threshold is within the band
            let mut blend = None;
            if mode > 0 {
                let dist = value as i32 - self.thresholds[mode - 1] as i32;
                if (0..blend_width as i32).contains(&dist) {
                    blend = Some((mode - 1, dist as f32 / blend_width as f32));
                }
            }
            if blend.is_none() && mode < self.modes - 1 {
                let dist = self.thresholds[mode] as i32 - value as i32;
                if (0..blend_width as i32).contains(&dist) {
                    blend = Some((mode + 1, dist as f32 / blend_width as f32));
                }
            }

            let result = match blend {
                Some((other, factor)) => {
                    let own = self.correct_pixel(value, i, mode);
                    let adjacent = self.correct_pixel(value, i, other);
                    own * factor + adjacent * (1.0 - factor)
                }
                None => self.correct_pixel(value, i, mode),
            };
            output[i] = quantize(result, self.max_value);
        }
        Ok(())
    }

    #[inline]
    fn correct_pixel(&self, value: u16, i: usize, mode: usize) -> f32 {
        let corrected = value as f32 - self.offset[mode][i] as f32 - self.baseline[i] as f32;
        corrected * self.gain[mode][i]
    }

    /// Place the thresholds at equal percentiles of an intensity histogram.
    ///
    /// `histogram[v]` counts pixels of value `v`. The edge of mode `k` lands
    /// on the `(k+1)/modes` percentile, found by binary search over the
    /// cumulative distribution.
    pub fn tune_thresholds(&mut self, histogram: &[u32]) -> Result<()> {
        if histogram.is_empty() {
            return Err(Error::InvalidArgument("histogram must be non-empty"));
        }
        if self.modes < 2 {
            return Ok(());
        }

        let mut cumulative = vec![0u64; histogram.len()];
        let mut total = 0u64;
        for (i, &count) in histogram.iter().enumerate() {
            total += count as u64;
            cumulative[i] = total;
        }
        if total == 0 {
            return Err(Error::InvalidArgument("histogram is all zeros"));
        }

        for k in 0..self.modes - 1 {
            let target = total * (k as u64 + 1) / self.modes as u64;
            let mut left = 0usize;
            let mut right = cumulative.len() - 1;
            while left < right {
                let mid = (left + right) / 2;
                if cumulative[mid] < target {
                    left = mid + 1;
                } else {
                    right = mid;
                }
            }
            self.thresholds[k] = left as u16;
        }
        Ok(())
    }

    /// Count how many pixels of `input` each gain mode would serve.
    pub fn mode_histogram(&self, input: &[u16]) -> Result<Vec<u32>> {
        self.check_len(input.len())?;
        let mut histogram = vec![0u32; self.modes];
        for &v in input {
            histogram[self.select_mode(v)] += 1;
        }
        Ok(histogram)
    }

    pub fn mode_statistics(&self, mode: usize) -> Result<Statistics> {
        self.check_mode(mode)?;
        Ok(Statistics::from_f32(&self.gain[mode]))
    }

    /// Validate threshold ordering and gain sanity across all modes.
    pub fn validate(&self) -> bool {
        for pair in self.thresholds[..self.modes.saturating_sub(1)].windows(2) {
            if pair[0] >= pair[1] {
                log::warn!("multi-gain thresholds are not strictly increasing");
                return false;
            }
        }

        let pixels = self.width * self.height;
        let mut invalid = 0usize;
        for gain in &self.gain {
            invalid += gain
                .iter()
                .filter(|g| !g.is_finite() || **g <= 0.0 || **g > 100.0)
                .count();
        }
        let limit = (pixels * self.modes) / MAX_INVALID_FRACTION;
        if invalid > 0 {
            log::warn!(
                "multi-gain tables have {} invalid coefficients (limit {})",
                invalid,
                limit
            );
        }
        invalid < limit.max(1)
    }

    fn check_mode(&self, mode: usize) -> Result<()> {
        if mode >= self.modes {
            return Err(Error::InvalidArgument("gain mode out of range"));
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_selection_is_monotonic() {
        let mut mg = MultiGain::new(4, 1, 12, 3).unwrap();
        mg.set_thresholds(&[1000, 3000, 4095]).unwrap();
        let mut last = 0;
        for value in (0..4096).step_by(7) {
            let mode = mg.select_mode(value as u16);
            assert!(mode >= last, "mode regressed at value {}", value);
            last = mode;
        }
        assert_eq!(mg.select_mode(999), 0);
        assert_eq!(mg.select_mode(1000), 1);
        assert_eq!(mg.select_mode(4095), 2);
    }

    #[test]
    fn fixed_mode_bypasses_thresholds() {
        let mut mg = MultiGain::new(2, 1, 12, 2).unwrap();
        mg.set_mode_gain(0, &[2.0, 2.0]).unwrap();
        mg.set_mode_gain(1, &[1.0, 1.0]).unwrap();
        let input = [100u16, 4000];
        let mut output = [0u16; 2];
        mg.apply(&input, &mut output, Some(0)).unwrap();
        assert_eq!(output, [200, 4095]);
    }

    #[test]
    fn blending_band_mixes_adjacent_modes() {
        let mut mg = MultiGain::new(1, 1, 12, 2).unwrap();
        mg.set_thresholds(&[2000, 4095]).unwrap();
        mg.set_mode_gain(0, &[1.0]).unwrap();
        mg.set_mode_gain(1, &[0.5]).unwrap();

        // Just above the threshold: adjacent (lower) mode dominates
        let mut out = [0u16; 1];
        mg.apply_blended(&[2000], &mut out, 100).unwrap();
        assert_eq!(out[0], 2000);

        // Far from any threshold: pure mode correction
        mg.apply_blended(&[3000], &mut out, 100).unwrap();
        assert_eq!(out[0], 1500);
    }

    #[test]
    fn threshold_tuning_hits_percentiles() {
        let mut mg = MultiGain::new(4, 1, 12, 2).unwrap();
        // Half the mass below 100, half above 3000
        let mut histogram = vec![0u32; 4096];
        histogram[50] = 500;
        histogram[3500] = 500;
        mg.tune_thresholds(&histogram).unwrap();
        assert_eq!(mg.thresholds()[0], 50);
    }

    #[test]
    fn usage_histogram_counts_every_pixel() {
        let mut mg = MultiGain::new(4, 1, 12, 2).unwrap();
        mg.set_thresholds(&[2048, 4095]).unwrap();
        let histogram = mg.mode_histogram(&[0, 1, 3000, 4095]).unwrap();
        assert_eq!(histogram, vec![2, 2]);
    }

    #[test]
    fn non_monotonic_thresholds_rejected() {
        let mut mg = MultiGain::new(2, 1, 12, 3).unwrap();
        assert!(mg.set_thresholds(&[2000, 1000, 4000]).is_err());
    }
}
