//! Ordinal scale: fused 0–1 value → completeness band 1..=5.

use crate::error::EngineError;

pub const BAND_MIN: u8 = 1;
pub const BAND_MAX: u8 = 5;

#[derive(Debug, Clone, PartialEq)]
pub struct ScaleMapper {
    boundaries: [f64; 4],
}

impl Default for ScaleMapper {
    fn default() -> Self {
        Self {
            boundaries: [0.2, 0.4, 0.6, 0.8],
        }
    }
}

impl ScaleMapper {
    /// Four finite, strictly ascending boundaries inside (0,1).
    pub fn new(boundaries: &[f64]) -> Result<Self, EngineError> {
        let b: [f64; 4] = boundaries.try_into().map_err(|_| {
            EngineError::config(format!(
                "scale needs 4 boundaries, got {}",
                boundaries.len()
            ))
        })?;
        if b.iter().any(|x| !x.is_finite() || *x <= 0.0 || *x >= 1.0) {
            return Err(EngineError::config("scale boundaries must lie in (0,1)"));
        }
        if b.windows(2).any(|w| w[0] >= w[1]) {
            return Err(EngineError::config(
                "scale boundaries must be strictly ascending",
            ));
        }
        Ok(Self { boundaries: b })
    }

    /// A value sitting exactly on a boundary belongs to the upper band. NaN → 1.
    pub fn band(&self, value: f64) -> u8 {
        if value.is_nan() {
            return BAND_MIN;
        }
        // at most 4, fits u8
        let above = self.boundaries.iter().filter(|b| value >= **b).count() as u8;
        BAND_MIN + above
    }
}
