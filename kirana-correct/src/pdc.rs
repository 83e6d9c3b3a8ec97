//! Pixel discontinuity correction (PDC) at module boundaries.
//!
//! Adjacent detector modules leave narrow insensitive columns in the stitched
//! line. Two repair strategies exist: `Fill` interpolates across each gap
//! in-row and keeps the image width, `Remove` rebuilds a narrower image by
//! resampling only the live columns.

use crate::depth::quantize;
use crate::error::{Error, Result};

/// Margin kept clear of the image edges during automatic detection.
const EDGE_GUARD: usize = 50;

/// A gap's smoothed variance must fall below this fraction of both
/// neighbours to count as a discontinuity.
const DETECT_THRESHOLD: f32 = 0.5;

/// One insensitive column run: columns `[position, position + width)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Gap {
    pub position: usize,
    pub width: usize,
}

/// Gap repair strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GapMode {
    /// Interpolate across each gap; output keeps the input width.
    Fill,
    /// Drop gap columns and resample; output width shrinks by the summed
    /// gap widths.
    Remove,
}

/// Module-boundary correction for one detector geometry.
pub struct GapCorrector {
    width: usize,
    height: usize,
    mode: GapMode,
    gaps: Vec<Gap>,
}

impl GapCorrector {
    pub fn new(width: usize, height: usize, mode: GapMode) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(Error::InvalidArgument("image dimensions must be non-zero"));
        }
        Ok(GapCorrector {
            width,
            height,
            mode,
            gaps: Vec::new(),
        })
    }

    /// Geometry helper for evenly built detectors: `modules` modules of
    /// `pixels_per_module` live columns separated by `gap_width` dead ones.
    pub fn with_uniform_gaps(
        width: usize,
        height: usize,
        mode: GapMode,
        modules: usize,
        pixels_per_module: usize,
        gap_width: usize,
    ) -> Result<Self> {
        let mut corrector = Self::new(width, height, mode)?;
        if modules < 2 || gap_width == 0 {
            return Ok(corrector);
        }
        let mut gaps = Vec::with_capacity(modules - 1);
        for i in 0..modules - 1 {
            gaps.push(Gap {
                position: (i + 1) * pixels_per_module + i * gap_width,
                width: gap_width,
            });
        }
        corrector.set_gaps(gaps)?;
        Ok(corrector)
    }

    pub fn mode(&self) -> GapMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: GapMode) {
        self.mode = mode;
    }

    pub fn gaps(&self) -> &[Gap] {
        &self.gaps
    }

    /// Replace the gap table. Gaps must be sorted, non-overlapping and
    /// inside the image.
    pub fn set_gaps(&mut self, gaps: Vec<Gap>) -> Result<()> {
        let mut end = 0usize;
        for gap in &gaps {
            if gap.width == 0 {
                return Err(Error::InvalidArgument("gap width must be non-zero"));
            }
            if gap.position < end {
                return Err(Error::InvalidArgument("gaps must be sorted and disjoint"));
            }
            end = gap.position + gap.width;
            if end > self.width {
                return Err(Error::InvalidArgument("gap extends beyond image width"));
            }
        }
        self.gaps = gaps;
        Ok(())
    }

    /// Width of the corrected output for the current mode.
    pub fn output_width(&self) -> usize {
        match self.mode {
            GapMode::Fill => self.width,
            GapMode::Remove => {
                let dead: usize = self.gaps.iter().map(|g| g.width).sum();
                self.width - dead
            }
        }
    }

    /// Locate gap columns automatically from image content.
    ///
    /// Computes per-column variance, smooths it with a 5-tap box filter
    /// (edge margins copied from the nearest smoothed column) and takes
    /// local minima at least [`EDGE_GUARD`] pixels from either edge that
    /// drop below [`DETECT_THRESHOLD`] of both neighbours. Detected gaps are
    /// recorded with the given `gap_width` and also returned as a count.
    pub fn detect(&mut self, input: &[u16], max_gaps: usize, gap_width: usize) -> Result<usize> {
        self.check_len(input.len())?;
        if gap_width == 0 {
            return Err(Error::InvalidArgument("gap width must be non-zero"));
        }
        if self.width < 2 * EDGE_GUARD + 1 || max_gaps == 0 {
            self.gaps.clear();
            return Ok(0);
        }

        let mut variance = vec![0.0f32; self.width];
        for x in 0..self.width {
            let mut mean = 0.0f64;
            for y in 0..self.height {
                mean += input[y * self.width + x] as f64;
            }
            mean /= self.height as f64;

            let mut var = 0.0f64;
            for y in 0..self.height {
                let d = input[y * self.width + x] as f64 - mean;
                var += d * d;
            }
            variance[x] = (var / self.height as f64) as f32;
        }

        let mut smoothed = vec![0.0f32; self.width];
        for x in 2..self.width - 2 {
            smoothed[x] =
                (variance[x - 2] + variance[x - 1] + variance[x] + variance[x + 1] + variance[x + 2])
                    / 5.0;
        }
        // The box filter cannot reach the margins; seed them from the
        // nearest smoothed column before the minima scan.
        smoothed[0] = smoothed[2];
        smoothed[1] = smoothed[2];
        smoothed[self.width - 2] = smoothed[self.width - 3];
        smoothed[self.width - 1] = smoothed[self.width - 3];

        let mut gaps = Vec::new();
        let mut x = EDGE_GUARD;
        while x < self.width - EDGE_GUARD && gaps.len() < max_gaps {
            if smoothed[x] < DETECT_THRESHOLD * smoothed[x - 1]
                && smoothed[x] < DETECT_THRESHOLD * smoothed[x + 1]
            {
                let position = x.saturating_sub(gap_width / 2);
                if position + gap_width <= self.width {
                    gaps.push(Gap {
                        position,
                        width: gap_width,
                    });
                }
                // Skip past this gap so one wide minimum is not reported twice
                x += gap_width.max(1);
            } else {
                x += 1;
            }
        }

        let count = gaps.len();
        self.set_gaps(gaps)?;
        Ok(count)
    }

    /// Repair the image. The output vector is resized to
    /// `output_width() * height`.
    pub fn apply(&self, input: &[u16], output: &mut Vec<u16>) -> Result<()> {
        self.check_len(input.len())?;
        match self.mode {
            GapMode::Fill => {
                output.clear();
                output
                    .try_reserve_exact(input.len())
                    .map_err(|_| Error::Allocation(input.len() * 2))?;
                output.extend_from_slice(input);
                self.fill_in_place(output);
                Ok(())
            }
            GapMode::Remove => self.remove_resample(input, output),
        }
    }

    /// `Fill` repair directly in a caller-owned buffer.
    pub fn fill_in_place(&self, data: &mut [u16]) {
        for y in 0..self.height {
            let row = &mut data[y * self.width..(y + 1) * self.width];
            for gap in &self.gaps {
                let start = gap.position;
                let end = gap.position + gap.width;
                if start == 0 || end >= self.width {
                    continue;
                }
                let left = row[start - 1] as f32;
                let right = row[end] as f32;
                for (k, cell) in row[start..end].iter_mut().enumerate() {
                    let t = (k + 1) as f32 / (gap.width + 1) as f32;
                    *cell = (left + t * (right - left) + 0.5) as u16;
                }
            }
        }
    }

    fn remove_resample(&self, input: &[u16], output: &mut Vec<u16>) -> Result<()> {
        let out_width = self.output_width();
        if out_width == 0 {
            return Err(Error::InvalidArgument("gaps cover the whole image"));
        }

        // Source column for every output column, skipping gap columns
        let mut mapping = Vec::with_capacity(out_width);
        let mut next_gap = 0usize;
        for x in 0..self.width {
            if next_gap < self.gaps.len() {
                let gap = self.gaps[next_gap];
                if x >= gap.position && x < gap.position + gap.width {
                    if x + 1 == gap.position + gap.width {
                        next_gap += 1;
                    }
                    continue;
                }
            }
            mapping.push(x as f32);
        }

        let total = out_width * self.height;
        output.clear();
        output
            .try_reserve_exact(total)
            .map_err(|_| Error::Allocation(total * 2))?;
        for y in 0..self.height {
            for &src_x in &mapping {
                let value = bilinear(input, self.width, self.height, src_x, y as f32);
                output.push(quantize(value, u16::MAX));
            }
        }
        Ok(())
    }

    /// Fill-mode repair quality: reduction of gradient energy around the
    /// gaps, clamped to `[0, 1]`.
    pub fn quality(&self, original: &[u16], corrected: &[u16]) -> Result<f32> {
        self.check_len(original.len())?;
        self.check_len(corrected.len())?;

        let sample_width = 20usize;
        let mut original_energy = 0.0f64;
        let mut corrected_energy = 0.0f64;
        let mut samples = 0usize;

        for gap in &self.gaps {
            let center = gap.position + gap.width / 2;
            for y in (0..self.height).step_by(10) {
                let row = y * self.width;
                let lo = center.saturating_sub(sample_width);
                let hi = (center + sample_width).min(self.width);
                for x in lo..hi {
                    let prev = x.saturating_sub(1);
                    let og = (original[row + x] as i32 - original[row + prev] as i32).abs() as f64;
                    let cg = (corrected[row + x] as i32 - corrected[row + prev] as i32).abs() as f64;
                    original_energy += og * og;
                    corrected_energy += cg * cg;
                    samples += 1;
                }
            }
        }

        if samples == 0 || original_energy == 0.0 {
            return Ok(0.0);
        }
        let quality = 1.0 - (corrected_energy / original_energy) as f32;
        Ok(quality.clamp(0.0, 1.0))
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

/// Bilinear sample with edge clamping.
fn bilinear(data: &[u16], width: usize, height: usize, x: f32, y: f32) -> f32 {
    let x = x.clamp(0.0, width as f32 - 1.001);
    let y = y.clamp(0.0, height as f32 - 1.001);

    let x0 = x as usize;
    let y0 = y as usize;
    let x1 = (x0 + 1).min(width - 1);
    let y1 = (y0 + 1).min(height - 1);
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    let v00 = data[y0 * width + x0] as f32;
    let v10 = data[y0 * width + x1] as f32;
    let v01 = data[y1 * width + x0] as f32;
    let v11 = data[y1 * width + x1] as f32;

    let top = v00 + fx * (v10 - v00);
    let bottom = v01 + fx * (v11 - v01);
    top + fy * (bottom - top)
}
