//! Dual-energy image fusion.
//!
//! Combines co-registered high-energy and low-energy acquisitions into one
//! image for material discrimination. Four modes: plain weighted average,
//! material decomposition (`H + c * (H - L)`), logarithmic fusion for
//! transmission imaging, and adaptive fusion driven by local variance.

use crate::depth::{max_value, quantize};
use crate::error::{Error, Result};

/// Fusion strategies for dual-energy processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FusionMode {
    WeightedAverage,
    MaterialDecomposition,
    Logarithmic,
    Adaptive,
}

/// Guards `log(0)` in logarithmic fusion.
const LOG_EPSILON: f32 = 1.0;

/// Dual-energy fusion engine for one image geometry.
pub struct DualEnergyFusion {
    width: usize,
    height: usize,
    high_weight: f32,
    low_weight: f32,
    mode: FusionMode,
    material_coeff: f32,
    window: usize,
}

impl DualEnergyFusion {
    pub fn new(width: usize, height: usize) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(Error::InvalidArgument("image dimensions must be non-zero"));
        }
        Ok(DualEnergyFusion {
            width,
            height,
            high_weight: 0.5,
            low_weight: 0.5,
            mode: FusionMode::WeightedAverage,
            material_coeff: 1.0,
            window: 5,
        })
    }

    pub fn mode(&self) -> FusionMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: FusionMode) {
        self.mode = mode;
    }

    pub fn weights(&self) -> (f32, f32) {
        (self.high_weight, self.low_weight)
    }

    /// Set fusion weights; they are renormalised to sum to 1.
    pub fn set_weights(&mut self, high: f32, low: f32) -> Result<()> {
        if !(0.0..=1.0).contains(&high) || !(0.0..=1.0).contains(&low) {
            return Err(Error::InvalidArgument("weights must be within [0, 1]"));
        }
        let sum = high + low;
        if sum > 0.0 {
            self.high_weight = high / sum;
            self.low_weight = low / sum;
        } else {
            self.high_weight = 0.5;
            self.low_weight = 0.5;
        }
        Ok(())
    }

    /// Material decomposition coefficient `c` in `H + c * (H - L)`.
    pub fn set_material_coeff(&mut self, coeff: f32) {
        self.material_coeff = coeff;
    }

    /// Window for adaptive fusion; forced odd and at least 3.
    pub fn set_window(&mut self, window: usize) {
        self.window = if window < 3 || window % 2 == 0 {
            5
        } else {
            window
        };
    }

    /// Fuse with the configured mode.
    pub fn fuse(
        &self,
        high: &[u16],
        low: &[u16],
        output: &mut [u16],
        bit_depth: u8,
    ) -> Result<()> {
        match self.mode {
            FusionMode::WeightedAverage => self.fuse_weighted(high, low, output, bit_depth),
            FusionMode::MaterialDecomposition => {
                self.fuse_material(high, low, output, bit_depth, self.material_coeff)
            }
            FusionMode::Logarithmic => self.fuse_logarithmic(high, low, output, bit_depth),
            FusionMode::Adaptive => self.fuse_adaptive(high, low, output, bit_depth, self.window),
        }
    }

    /// `y = w_H * H + w_L * L`
    pub fn fuse_weighted(
        &self,
        high: &[u16],
        low: &[u16],
        output: &mut [u16],
        bit_depth: u8,
    ) -> Result<()> {
        self.check_inputs(high, low, output)?;
        let max = max_value(bit_depth)?;
        for i in 0..output.len() {
            let fused = self.high_weight * high[i] as f32 + self.low_weight * low[i] as f32;
            output[i] = quantize(fused, max);
        }
        Ok(())
    }

    /// `y = H + c * (H - L)` - emphasises the energy-dependent difference.
    pub fn fuse_material(
        &self,
        high: &[u16],
        low: &[u16],
        output: &mut [u16],
        bit_depth: u8,
        coeff: f32,
    ) -> Result<()> {
        self.check_inputs(high, low, output)?;
        let max = max_value(bit_depth)?;
        for i in 0..output.len() {
            let h = high[i] as f32;
            let l = low[i] as f32;
            output[i] = quantize(h + coeff * (h - l), max);
        }
        Ok(())
    }

    /// `y = exp(w_H * ln(H + eps) + w_L * ln(L + eps)) - eps`
    pub fn fuse_logarithmic(
        &self,
        high: &[u16],
        low: &[u16],
        output: &mut [u16],
        bit_depth: u8,
    ) -> Result<()> {
        self.check_inputs(high, low, output)?;
        let max = max_value(bit_depth)?;
        for i in 0..output.len() {
            let h = high[i] as f32 + LOG_EPSILON;
            let l = low[i] as f32 + LOG_EPSILON;
            let fused = (self.high_weight * h.ln() + self.low_weight * l.ln()).exp() - LOG_EPSILON;
            output[i] = quantize(fused, max);
        }
        Ok(())
    }

    /// Per-pixel weights from local variance in an odd window: the noisier
    /// channel contributes less.
    pub fn fuse_adaptive(
        &self,
        high: &[u16],
        low: &[u16],
        output: &mut [u16],
        bit_depth: u8,
        window: usize,
    ) -> Result<()> {
        self.check_inputs(high, low, output)?;
        let max = max_value(bit_depth)?;
        let window = if window < 3 || window % 2 == 0 {
            5
        } else {
            window
        };
        let half = (window / 2) as isize;

        for y in 0..self.height {
            for x in 0..self.width {
                let mut mean_h = 0.0f32;
                let mut mean_l = 0.0f32;
                let mut count = 0u32;

                for wy in -half..=half {
                    for wx in -half..=half {
                        let ny = y as isize + wy;
                        let nx = x as isize + wx;
                        if ny < 0 || nx < 0 || ny >= self.height as isize || nx >= self.width as isize
                        {
                            continue;
                        }
                        let idx = ny as usize * self.width + nx as usize;
                        mean_h += high[idx] as f32;
                        mean_l += low[idx] as f32;
                        count += 1;
                    }
                }
                mean_h /= count as f32;
                mean_l /= count as f32;

                let mut var_h = 0.0f32;
                let mut var_l = 0.0f32;
                for wy in -half..=half {
                    for wx in -half..=half {
                        let ny = y as isize + wy;
                        let nx = x as isize + wx;
                        if ny < 0 || nx < 0 || ny >= self.height as isize || nx >= self.width as isize
                        {
                            continue;
                        }
                        let idx = ny as usize * self.width + nx as usize;
                        let dh = high[idx] as f32 - mean_h;
                        let dl = low[idx] as f32 - mean_l;
                        var_h += dh * dh;
                        var_l += dl * dl;
                    }
                }
                var_h /= count as f32;
                var_l /= count as f32;

                let total = var_h + var_l + 1e-6;
                let w_h = var_h / total;
                let w_l = var_l / total;

                let idx = y * self.width + x;
                let fused = w_h * high[idx] as f32 + w_l * low[idx] as f32;
                output[idx] = quantize(fused, max);
            }
        }
        Ok(())
    }

    /// Weights proportional to each channel's SNR proxy `mean^2 / variance`,
    /// renormalised to sum to 1.
    pub fn optimal_weights(&self, high: &[u16], low: &[u16]) -> Result<(f32, f32)> {
        self.check_len(high.len())?;
        self.check_len(low.len())?;

        let pixels = high.len() as f64;
        let mut mean_h = 0.0f64;
        let mut mean_l = 0.0f64;
        for i in 0..high.len() {
            mean_h += high[i] as f64;
            mean_l += low[i] as f64;
        }
        mean_h /= pixels;
        mean_l /= pixels;

        let mut var_h = 0.0f64;
        let mut var_l = 0.0f64;
        for i in 0..high.len() {
            let dh = high[i] as f64 - mean_h;
            let dl = low[i] as f64 - mean_l;
            var_h += dh * dh;
            var_l += dl * dl;
        }
        var_h /= pixels;
        var_l /= pixels;

        let snr_h = if var_h > 0.0 {
            mean_h * mean_h / var_h
        } else {
            1.0
        };
        let snr_l = if var_l > 0.0 {
            mean_l * mean_l / var_l
        } else {
            1.0
        };

        let total = snr_h + snr_l;
        Ok(((snr_h / total) as f32, (snr_l / total) as f32))
    }

    /// Material-specific images: organic `clamp(L - 0.5 * H)`, inorganic
    /// `clamp(H - 0.3 * (H - L))`.
    pub fn decompose(
        &self,
        high: &[u16],
        low: &[u16],
        organic: &mut [u16],
        inorganic: &mut [u16],
        bit_depth: u8,
    ) -> Result<()> {
        self.check_len(high.len())?;
        self.check_len(low.len())?;
        self.check_len(organic.len())?;
        self.check_len(inorganic.len())?;
        let max = max_value(bit_depth)?;

        for i in 0..high.len() {
            let h = high[i] as f32;
            let l = low[i] as f32;
            organic[i] = quantize(l - 0.5 * h, max);
            inorganic[i] = quantize(h - 0.3 * (h - l), max);
        }
        Ok(())
    }

    fn check_inputs(&self, high: &[u16], low: &[u16], output: &[u16]) -> Result<()> {
        self.check_len(high.len())?;
        self.check_len(low.len())?;
        self.check_len(output.len())
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

    #[test]
    fn weights_are_renormalised() {
        let mut fusion = DualEnergyFusion::new(2, 1).unwrap();
        fusion.set_weights(0.6, 0.2).unwrap();
        let (h, l) = fusion.weights();
        assert_relative_eq!(h, 0.75);
        assert_relative_eq!(l, 0.25);
        assert_relative_eq!(h + l, 1.0);
    }

    #[test]
    fn weighted_average_of_equal_inputs_is_identity() {
        let fusion = DualEnergyFusion::new(4, 1).unwrap();
        let data = [100u16, 2000, 8000, 16383];
        let mut output = [0u16; 4];
        fusion.fuse_weighted(&data, &data, &mut output, 14).unwrap();
        assert_eq!(output, data);
    }

    #[test]
    fn material_mode_amplifies_difference() {
        let fusion = DualEnergyFusion::new(1, 1).unwrap();
        let mut output = [0u16; 1];
        fusion
            .fuse_material(&[1000], &[600], &mut output, 14, 1.0)
            .unwrap();
        // 1000 + 1.0 * (1000 - 600) = 1400
        assert_eq!(output, [1400]);
    }

    #[test]
    fn logarithmic_of_equal_inputs_is_identity() {
        let fusion = DualEnergyFusion::new(1, 1).unwrap();
        let mut output = [0u16; 1];
        fusion
            .fuse_logarithmic(&[4000], &[4000], &mut output, 14)
            .unwrap();
        assert_eq!(output, [4000]);
    }

    #[test]
    fn optimal_weights_favour_higher_snr() {
        let fusion = DualEnergyFusion::new(4, 1).unwrap();
        // High channel: mildly noisy. Low channel: very noisy, same mean.
        let high = [990u16, 1010, 990, 1010];
        let low = [400u16, 1600, 400, 1600];
        let (w_h, w_l) = fusion.optimal_weights(&high, &low).unwrap();
        assert!(w_h > w_l);
        assert_relative_eq!(w_h + w_l, 1.0, epsilon = 1e-5);
    }

    #[test]
    fn decomposition_clamps_to_range() {
        let fusion = DualEnergyFusion::new(2, 1).unwrap();
        let mut organic = [0u16; 2];
        let mut inorganic = [0u16; 2];
        fusion
            .decompose(&[4000, 100], &[1000, 3000], &mut organic, &mut inorganic, 12)
            .unwrap();
        // organic: 1000 - 2000 -> 0; 3000 - 50 -> 2950
        assert_eq!(organic, [0, 2950]);
        // inorganic: 4000 - 0.3*3000 = 3100; 100 - 0.3*(-2900) = 970
        assert_eq!(inorganic, [3100, 970]);
    }

    #[test]
    fn adaptive_window_is_forced_odd() {
        let fusion = DualEnergyFusion::new(8, 8).unwrap();
        let high = vec![500u16; 64];
        let low = vec![1500u16; 64];
        let mut output = vec![0u16; 64];
        // Even window falls back to 5; uniform inputs fuse to a stable value
        fusion
            .fuse_adaptive(&high, &low, &mut output, 14, 4)
            .unwrap();
        for &v in &output {
            assert!(v <= 1500);
        }
    }
}
