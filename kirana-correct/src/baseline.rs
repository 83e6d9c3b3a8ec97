//! Baseline (reference value) correction.
//!
//! The detector rests at a per-pixel level that drifts with temperature.
//! Calibration averages reference frames into `measured[i]` and derives
//! additive coefficients `coeff[i] = target - measured[i]`; application
//! shifts every pixel onto the target level.

use crate::depth::{max_value, quantize};
use crate::error::{Error, Result};

/// Per-pixel additive baseline alignment toward a target level.
pub struct BaselineCorrection {
    width: usize,
    height: usize,
    target: f32,
    measured: Vec<f32>,
    coeff: Vec<f32>,
}

impl BaselineCorrection {
    pub fn new(width: usize, height: usize) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(Error::InvalidArgument("image dimensions must be non-zero"));
        }
        let pixels = width * height;
        let mut measured = Vec::new();
        measured
            .try_reserve_exact(pixels)
            .map_err(|_| Error::Allocation(pixels * std::mem::size_of::<f32>()))?;
        measured.resize(pixels, 0.0);
        let coeff = measured.clone();
        Ok(BaselineCorrection {
            width,
            height,
            target: 0.0,
            measured,
            coeff,
        })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn target(&self) -> f32 {
        self.target
    }

    /// Set the target level. Must fit the given bit depth.
    ///
    /// Changing the target rebuilds the coefficients from the last
    /// calibration.
    pub fn set_target(&mut self, target: f32, bit_depth: u8) -> Result<()> {
        let max = max_value(bit_depth)?;
        if target < 0.0 || target > max as f32 {
            return Err(Error::InvalidArgument("target exceeds bit depth range"));
        }
        self.target = target;
        for (c, &m) in self.coeff.iter_mut().zip(self.measured.iter()) {
            *c = target - m;
        }
        Ok(())
    }

    /// Average reference frames and derive coefficients.
    pub fn calibrate(&mut self, frames: &[&[u16]]) -> Result<()> {
        if frames.is_empty() {
            return Err(Error::InvalidArgument(
                "at least one reference frame required",
            ));
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
        for i in 0..pixels {
            self.measured[i] = (accumulator[i] * inv) as f32;
            self.coeff[i] = self.target - self.measured[i];
        }
        Ok(())
    }

    /// Average reference lines into a per-column profile replicated across
    /// rows, then derive coefficients.
    pub fn calibrate_lines(&mut self, lines: &[&[u16]]) -> Result<()> {
        if lines.is_empty() {
            return Err(Error::InvalidArgument(
                "at least one reference line required",
            ));
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
                let i = row * self.width + col;
                self.measured[i] = (accumulator[col] * inv) as f32;
                self.coeff[i] = self.target - self.measured[i];
            }
        }
        Ok(())
    }

    /// Apply `y = clamp(x + coeff)`.
    pub fn apply(&self, input: &[u16], output: &mut [u16], bit_depth: u8) -> Result<()> {
        self.check_len(input.len())?;
        self.check_len(output.len())?;
        let max = max_value(bit_depth)?;
        for i in 0..input.len() {
            output[i] = quantize(input[i] as f32 + self.coeff[i], max);
        }
        Ok(())
    }

    /// In-place variant of [`apply`](Self::apply).
    pub fn apply_in_place(&self, data: &mut [u16], bit_depth: u8) -> Result<()> {
        self.check_len(data.len())?;
        let max = max_value(bit_depth)?;
        for i in 0..data.len() {
            data[i] = quantize(data[i] as f32 + self.coeff[i], max);
        }
        Ok(())
    }

    /// Apply `y = clamp((x + coeff) * scale)`.
    pub fn apply_scaled(
        &self,
        input: &[u16],
        output: &mut [u16],
        scale: f32,
        bit_depth: u8,
    ) -> Result<()> {
        self.check_len(input.len())?;
        self.check_len(output.len())?;
        if scale <= 0.0 {
            return Err(Error::InvalidArgument("scale must be positive"));
        }
        let max = max_value(bit_depth)?;
        for i in 0..input.len() {
            output[i] = quantize((input[i] as f32 + self.coeff[i]) * scale, max);
        }
        Ok(())
    }

    pub fn coefficients(&self) -> &[f32] {
        &self.coeff
    }

    /// Import externally computed coefficients.
    pub fn set_coefficients(&mut self, coefficients: &[f32]) -> Result<()> {
        self.check_len(coefficients.len())?;
        self.coeff.copy_from_slice(coefficients);
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
    fn coefficients_track_target_minus_measured() {
        let mut bl = BaselineCorrection::new(2, 1).unwrap();
        bl.set_target(2048.0, 12).unwrap();
        let frame = [2000u16, 2100];
        bl.calibrate(&[&frame]).unwrap();
        assert_eq!(bl.coefficients(), &[48.0, -52.0]);
    }

    #[test]
    fn apply_shifts_onto_target() {
        let mut bl = BaselineCorrection::new(2, 1).unwrap();
        bl.set_target(2048.0, 12).unwrap();
        let frame = [2000u16, 2100];
        bl.calibrate(&[&frame]).unwrap();

        let mut out = [0u16; 2];
        bl.apply(&frame, &mut out, 12).unwrap();
        assert_eq!(out, [2048, 2048]);
    }

    #[test]
    fn scaled_apply() {
        let mut bl = BaselineCorrection::new(1, 1).unwrap();
        bl.set_coefficients(&[10.0]).unwrap();
        let mut out = [0u16; 1];
        bl.apply_scaled(&[90], &mut out, 2.0, 12).unwrap();
        assert_eq!(out, [200]);
    }

    #[test]
    fn retargeting_rebuilds_coefficients() {
        let mut bl = BaselineCorrection::new(1, 1).unwrap();
        let frame = [100u16];
        bl.calibrate(&[&frame]).unwrap();
        bl.set_target(300.0, 12).unwrap();
        assert_eq!(bl.coefficients(), &[200.0]);
    }

    #[test]
    fn target_out_of_range_is_rejected() {
        let mut bl = BaselineCorrection::new(1, 1).unwrap();
        assert!(bl.set_target(5000.0, 12).is_err());
    }
}
