//! Bit-depth helpers shared by all correction stages.

use crate::error::{Error, Result};

/// Output bit depths the pipeline supports.
pub const SUPPORTED_DEPTHS: [u8; 3] = [12, 14, 16];

/// Saturation ceiling for a bit depth: `(1 << depth) - 1`.
///
/// Rejects depths other than 12, 14 and 16.
pub fn max_value(depth: u8) -> Result<u16> {
    if !SUPPORTED_DEPTHS.contains(&depth) {
        return Err(Error::InvalidArgument("bit depth must be 12, 14 or 16"));
    }
    Ok(((1u32 << depth) - 1) as u16)
}

/// Conventional target baseline for a bit depth (mid-scale).
pub fn default_target_baseline(depth: u8) -> Result<u16> {
    max_value(depth)?;
    Ok((1u32 << (depth - 1)) as u16)
}

/// Clamp to `[0, max]` and round half-up.
#[inline]
pub fn quantize(value: f32, max: u16) -> u16 {
    if value <= 0.0 {
        0
    } else if value >= max as f32 {
        max
    } else {
        (value + 0.5) as u16
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_value_per_depth() {
        assert_eq!(max_value(12).unwrap(), 4095);
        assert_eq!(max_value(14).unwrap(), 16383);
        assert_eq!(max_value(16).unwrap(), 65535);
        assert!(max_value(10).is_err());
        assert!(max_value(18).is_err());
    }

    #[test]
    fn target_baseline_is_mid_scale() {
        assert_eq!(default_target_baseline(12).unwrap(), 2048);
        assert_eq!(default_target_baseline(14).unwrap(), 8192);
        assert_eq!(default_target_baseline(16).unwrap(), 32768);
    }

    #[test]
    fn quantize_rounds_half_up_and_saturates() {
        assert_eq!(quantize(-3.0, 4095), 0);
        assert_eq!(quantize(0.49, 4095), 0);
        assert_eq!(quantize(0.5, 4095), 1);
        assert_eq!(quantize(100.5, 4095), 101);
        assert_eq!(quantize(5000.0, 4095), 4095);
    }
}
