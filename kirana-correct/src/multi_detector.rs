//! Multi-detector flat-field correction and stitching.
//!
//! Systems built from several detectors correct each detector with its own
//! tables, equalise brightness across detectors with a normalization factor
//! derived from the mean gains, and composite everything into one output
//! image at configured placements. Where neighbouring detectors overlap in x
//! the seam can be hidden with a linear cross-fade.

use crate::depth::{max_value, quantize};
use crate::error::{Error, Result};
use crate::flat_field::{GAIN_MAX, GAIN_MIN};
use crate::stats::Statistics;

/// Maximum number of detectors in one array.
pub const MAX_DETECTORS: usize = 16;

const MAX_INVALID_FRACTION: usize = 1000;

/// Correction tables and placement of one detector in the array.
pub struct DetectorTables {
    pub id: u32,
    width: usize,
    height: usize,
    x_offset: i32,
    y_offset: i32,
    active: bool,
    normalization: f32,
    offset: Vec<u16>,
    gain: Vec<f32>,
    baseline: Vec<u16>,
}

impl DetectorTables {
    fn new(id: u32, width: usize, height: usize) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(Error::InvalidArgument(
                "detector dimensions must be non-zero",
            ));
        }
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

        Ok(DetectorTables {
            id,
            width,
            height,
            x_offset: 0,
            y_offset: 0,
            active: true,
            normalization: 1.0,
            offset,
            gain,
            baseline,
        })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn x_offset(&self) -> i32 {
        self.x_offset
    }

    pub fn y_offset(&self) -> i32 {
        self.y_offset
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn normalization(&self) -> f32 {
        self.normalization
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

/// An array of detectors correcting and compositing into one image.
pub struct DetectorArray {
    bit_depth: u8,
    max_value: u16,
    detectors: Vec<DetectorTables>,

    enable_offset: bool,
    enable_gain: bool,
    enable_baseline: bool,
    target_baseline: u16,
    overlap_blending: bool,
}

impl DetectorArray {
    /// Create an array of identity-corrected detectors placed side by side.
    pub fn new(dimensions: &[(usize, usize)], bit_depth: u8) -> Result<Self> {
        if dimensions.is_empty() || dimensions.len() > MAX_DETECTORS {
            return Err(Error::InvalidArgument("detector count must be 1..=16"));
        }
        let max = max_value(bit_depth)?;

        let mut detectors = Vec::with_capacity(dimensions.len());
        let mut next_x = 0i32;
        for (i, &(w, h)) in dimensions.iter().enumerate() {
            let mut tables = DetectorTables::new(i as u32, w, h)?;
            // Default horizontal arrangement
            tables.x_offset = next_x;
            next_x += w as i32;
            detectors.push(tables);
        }

        Ok(DetectorArray {
            bit_depth,
            max_value: max,
            detectors,
            enable_offset: true,
            enable_gain: true,
            enable_baseline: false,
            target_baseline: 0,
            overlap_blending: false,
        })
    }

    pub fn bit_depth(&self) -> u8 {
        self.bit_depth
    }

    pub fn len(&self) -> usize {
        self.detectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.detectors.is_empty()
    }

    pub fn detector(&self, index: usize) -> Result<&DetectorTables> {
        self.detectors
            .get(index)
            .ok_or(Error::InvalidArgument("detector index out of range"))
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

    pub fn set_overlap_blending(&mut self, enable: bool) {
        self.overlap_blending = enable;
    }

    pub fn set_position(&mut self, index: usize, x_offset: i32, y_offset: i32) -> Result<()> {
        let det = self.detector_mut(index)?;
        det.x_offset = x_offset;
        det.y_offset = y_offset;
        Ok(())
    }

    pub fn set_active(&mut self, index: usize, active: bool) -> Result<()> {
        self.detector_mut(index)?.active = active;
        Ok(())
    }

    pub fn set_normalization(&mut self, index: usize, factor: f32) -> Result<()> {
        if factor <= 0.0 || factor > 10.0 {
            return Err(Error::InvalidArgument(
                "normalization factor must be in (0, 10]",
            ));
        }
        self.detector_mut(index)?.normalization = factor;
        Ok(())
    }

    pub fn set_offset(&mut self, index: usize, values: &[u16]) -> Result<()> {
        let det = self.detector_mut(index)?;
        det.check_len(values.len())?;
        det.offset.copy_from_slice(values);
        Ok(())
    }

    pub fn set_gain(&mut self, index: usize, values: &[f32]) -> Result<()> {
        let det = self.detector_mut(index)?;
        det.check_len(values.len())?;
        det.gain.copy_from_slice(values);
        Ok(())
    }

    pub fn set_baseline(&mut self, index: usize, values: &[u16]) -> Result<()> {
        let det = self.detector_mut(index)?;
        det.check_len(values.len())?;
        det.baseline.copy_from_slice(values);
        Ok(())
    }

    /// Average dark frames into one detector's offset table.
    pub fn calibrate_offset(&mut self, index: usize, frames: &[&[u16]]) -> Result<()> {
        let det = self.detector_mut(index)?;
        if frames.is_empty() {
            return Err(Error::InvalidArgument("at least one dark frame required"));
        }
        for frame in frames {
            det.check_len(frame.len())?;
        }

        let pixels = det.width * det.height;
        let n = frames.len() as u64;
        let mut accumulator = vec![0u64; pixels];
        for frame in frames {
            for (acc, &v) in accumulator.iter_mut().zip(frame.iter()) {
                *acc += v as u64;
            }
        }
        for (dst, acc) in det.offset.iter_mut().zip(accumulator.iter()) {
            *dst = ((acc + n / 2) / n) as u16;
        }
        Ok(())
    }

    /// Derive one detector's gain table from a bright-field frame.
    pub fn calibrate_gain(&mut self, index: usize, bright_field: &[u16], target: u16) -> Result<()> {
        if target == 0 {
            return Err(Error::InvalidArgument("gain target must be non-zero"));
        }
        let det = self.detector_mut(index)?;
        det.check_len(bright_field.len())?;

        for i in 0..bright_field.len() {
            let corrected = bright_field[i] as i32 - det.offset[i] as i32;
            let gain = if corrected > 0 {
                target as f32 / corrected as f32
            } else {
                1.0
            };
            det.gain[i] = gain.clamp(GAIN_MIN, GAIN_MAX);
        }
        Ok(())
    }

    /// Equalise brightness across the array.
    ///
    /// Sets each active detector's normalization factor to
    /// `global_mean_gain / detector_mean_gain` so that normalized mean gains
    /// coincide.
    pub fn normalize_cross_detector(&mut self) -> Result<()> {
        let mut means = vec![1.0f32; self.detectors.len()];
        let mut global = 0.0f32;
        let mut active = 0usize;

        for (i, det) in self.detectors.iter().enumerate() {
            if !det.active {
                continue;
            }
            let sum: f64 = det.gain.iter().map(|&g| g as f64).sum();
            means[i] = (sum / det.gain.len() as f64) as f32;
            global += means[i];
            active += 1;
        }
        if active == 0 {
            return Err(Error::InvalidArgument("no active detectors"));
        }
        global /= active as f32;

        for (i, det) in self.detectors.iter_mut().enumerate() {
            if det.active && means[i] > 0.0 {
                det.normalization = global / means[i];
            }
        }
        log::debug!(
            "cross-detector normalization: global mean gain {:.4} over {} detectors",
            global,
            active
        );
        Ok(())
    }

    /// Correct every active detector independently.
    ///
    /// `inputs[i]` and `outputs[i]` must match detector `i`'s geometry;
    /// inactive detectors are left untouched.
    pub fn apply(&self, inputs: &[&[u16]], outputs: &mut [Vec<u16>]) -> Result<()> {
        if inputs.len() != self.detectors.len() || outputs.len() != self.detectors.len() {
            return Err(Error::DimensionMismatch {
                expected: self.detectors.len(),
                actual: inputs.len().min(outputs.len()),
            });
        }

        for (i, det) in self.detectors.iter().enumerate() {
            if !det.active {
                continue;
            }
            det.check_len(inputs[i].len())?;
            det.check_len(outputs[i].len())?;
            for (p, (&raw, out)) in inputs[i].iter().zip(outputs[i].iter_mut()).enumerate() {
                *out = quantize(self.correct_pixel(det, raw, p), self.max_value);
            }
        }
        Ok(())
    }

    /// Correct and composite every active detector into one stitched image.
    ///
    /// The output is zero-initialised; each detector's corrected pixels land
    /// at `(x_offset + x, y_offset + y)` when in bounds. With overlap
    /// blending enabled, a detector cross-fades linearly against what the
    /// previous detector left in the shared x-band.
    pub fn apply_stitched(
        &self,
        inputs: &[&[u16]],
        output: &mut [u16],
        stitched_width: usize,
        stitched_height: usize,
    ) -> Result<()> {
        if inputs.len() != self.detectors.len() {
            return Err(Error::DimensionMismatch {
                expected: self.detectors.len(),
                actual: inputs.len(),
            });
        }
        if stitched_width == 0 || stitched_height == 0 {
            return Err(Error::InvalidArgument("stitched dimensions must be non-zero"));
        }
        if output.len() != stitched_width * stitched_height {
            return Err(Error::DimensionMismatch {
                expected: stitched_width * stitched_height,
                actual: output.len(),
            });
        }

        output.fill(0);

        for (i, det) in self.detectors.iter().enumerate() {
            if !det.active {
                continue;
            }
            det.check_len(inputs[i].len())?;

            // Cross-fade band shared with the previous active detector
            let overlap = if self.overlap_blending && i > 0 && self.detectors[i - 1].active {
                let prev = &self.detectors[i - 1];
                let prev_end = prev.x_offset + prev.width as i32;
                if det.x_offset < prev_end {
                    Some((det.x_offset, prev_end))
                } else {
                    None
                }
            } else {
                None
            };

            for y in 0..det.height {
                let out_y = det.y_offset + y as i32;
                if out_y < 0 || out_y as usize >= stitched_height {
                    continue;
                }
                for x in 0..det.width {
                    let out_x = det.x_offset + x as i32;
                    if out_x < 0 || out_x as usize >= stitched_width {
                        continue;
                    }

                    let raw = inputs[i][y * det.width + x];
                    let mut corrected = self.correct_pixel(det, raw, y * det.width + x);

                    if let Some((start, end)) = overlap {
                        if out_x >= start && out_x < end {
                            let span = end - start;
                            let t = if span > 1 {
                                (out_x - start) as f32 / (span - 1) as f32
                            } else {
                                1.0
                            };
                            let out_idx = out_y as usize * stitched_width + out_x as usize;
                            let existing = output[out_idx] as f32;
                            corrected = existing * (1.0 - t) + corrected * t;
                        }
                    }

                    output[out_y as usize * stitched_width + out_x as usize] =
                        quantize(corrected, self.max_value);
                }
            }
        }
        Ok(())
    }

    #[inline]
    fn correct_pixel(&self, det: &DetectorTables, value: u16, i: usize) -> f32 {
        let mut corrected = value as f32;
        if self.enable_offset {
            corrected -= det.offset[i] as f32;
        }
        if self.enable_gain {
            corrected *= det.gain[i];
        }
        corrected *= det.normalization;
        if self.enable_baseline {
            corrected -= det.baseline[i] as f32;
        }
        corrected + self.target_baseline as f32
    }

    /// Mean-gain uniformity across active detectors: `1 - std / mean`,
    /// clamped to `[0, 1]`. Fewer than two active detectors are trivially
    /// uniform.
    pub fn uniformity(&self) -> f32 {
        let means: Vec<f32> = self
            .detectors
            .iter()
            .filter(|d| d.active)
            .map(|d| {
                let sum: f64 = d.gain.iter().map(|&g| g as f64).sum();
                (sum / d.gain.len() as f64) as f32
            })
            .collect();
        if means.len() < 2 {
            return 1.0;
        }

        let global = means.iter().sum::<f32>() / means.len() as f32;
        let var = means.iter().map(|m| (m - global) * (m - global)).sum::<f32>() / means.len() as f32;
        let std_dev = var.sqrt();
        if global <= 0.0 {
            return 0.0;
        }
        (1.0 - std_dev / global).clamp(0.0, 1.0)
    }

    pub fn detector_statistics(&self, index: usize) -> Result<(Statistics, Statistics)> {
        let det = self.detector(index)?;
        Ok((
            Statistics::from_u16(&det.offset),
            Statistics::from_f32(&det.gain),
        ))
    }

    /// Validate gain sanity per active detector (same tolerance as the
    /// single-detector tables).
    pub fn validate(&self) -> bool {
        for det in &self.detectors {
            if !det.active {
                continue;
            }
            let invalid = det
                .gain
                .iter()
                .filter(|g| !g.is_finite() || **g <= 0.0 || **g > 100.0)
                .count();
            let limit = det.gain.len() / MAX_INVALID_FRACTION;
            if invalid >= limit.max(1) {
                log::warn!(
                    "detector {} gain table has {} invalid coefficients",
                    det.id,
                    invalid
                );
                return false;
            }
        }
        true
    }

    fn detector_mut(&mut self, index: usize) -> Result<&mut DetectorTables> {
        self.detectors
            .get_mut(index)
            .ok_or(Error::InvalidArgument("detector index out of range"))
    }

    pub(crate) fn detectors(&self) -> &[DetectorTables] {
        &self.detectors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn normalization_equalises_mean_gains() {
        let mut array = DetectorArray::new(&[(4, 1), (4, 1)], 14).unwrap();
        array.set_gain(0, &[1.0; 4]).unwrap();
        array.set_gain(1, &[3.0; 4]).unwrap();
        array.normalize_cross_detector().unwrap();

        // Global mean is 2.0; normalized mean gain matches it on both
        let n0 = array.detector(0).unwrap().normalization();
        let n1 = array.detector(1).unwrap().normalization();
        assert_relative_eq!(n0 * 1.0, 2.0, epsilon = 1e-5);
        assert_relative_eq!(n1 * 3.0, 2.0, epsilon = 1e-5);
    }

    #[test]
    fn inactive_detectors_are_skipped() {
        let mut array = DetectorArray::new(&[(2, 1), (2, 1)], 14).unwrap();
        array.set_active(1, false).unwrap();
        let a = [100u16, 100];
        let b = [200u16, 200];
        let inputs = [&a[..], &b[..]];
        let mut outputs = vec![vec![0u16; 2], vec![0u16; 2]];
        array.apply(&inputs, &mut outputs).unwrap();
        assert_eq!(outputs[0], vec![100, 100]);
        assert_eq!(outputs[1], vec![0, 0]);
    }

    #[test]
    fn stitched_placement_without_overlap() {
        let mut array = DetectorArray::new(&[(2, 1), (2, 1)], 14).unwrap();
        array.set_position(1, 2, 0).unwrap();
        let a = [10u16, 20];
        let b = [30u16, 40];
        let inputs = [&a[..], &b[..]];
        let mut output = vec![0u16; 4];
        array.apply_stitched(&inputs, &mut output, 4, 1).unwrap();
        assert_eq!(output, vec![10, 20, 30, 40]);
    }

    #[test]
    fn out_of_bounds_pixels_are_dropped() {
        let mut array = DetectorArray::new(&[(2, 2)], 14).unwrap();
        array.set_position(0, -1, 1).unwrap();
        let a = [1u16, 2, 3, 4];
        let inputs = [&a[..]];
        let mut output = vec![0u16; 4];
        array.apply_stitched(&inputs, &mut output, 2, 2).unwrap();
        // Only the x=1 column survives, shifted down one row
        assert_eq!(output, vec![0, 0, 2, 0]);
    }

    #[test]
    fn uniformity_of_identical_detectors_is_one() {
        let array = DetectorArray::new(&[(4, 1), (4, 1)], 14).unwrap();
        assert_relative_eq!(array.uniformity(), 1.0);
    }
}
