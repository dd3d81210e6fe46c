//! Storage precision for weights and activations.
//!
//! All arithmetic runs in `f32`. A [`DType`] decides what a value is rounded to when it is
//! *stored*: parameters after init and after every optimizer update, and q/k/v, attention outputs
//! and cache entries as they are produced. Rounding to `bf16` goes through `half::bf16`, which
//! rounds to nearest-even.

use half::bf16;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    #[default]
    F32,
    Bf16,
}

impl DType {
    /// Rounds a single value to this precision, returning it widened back to `f32`.
    #[inline]
    pub fn round(self, x: f32) -> f32 {
        match self {
            DType::F32 => x,
            DType::Bf16 => bf16::from_f32(x).to_f32(),
        }
    }

    /// Rounds every element of `values` in place.
    pub fn round_slice(self, values: &mut [f32]) {
        if self == DType::F32 {
            return;
        }
        values.par_iter_mut().for_each(|x| *x = self.round(*x));
    }

    /// Bytes per element when serialized.
    pub fn size_in_bytes(self) -> usize {
        match self {
            DType::F32 => 4,
            DType::Bf16 => 2,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            DType::F32 => "f32",
            DType::Bf16 => "bf16",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_f32_is_identity() {
        let x = 1.0f32 / 3.0;
        assert_eq!(DType::F32.round(x), x);
    }

    #[test]
    fn test_bf16_rounding() {
        // bf16 keeps 8 significant bits: 257 is not representable and rounds to 256.
        assert_eq!(DType::Bf16.round(257.0), 256.0);
        assert_eq!(DType::Bf16.round(1.0), 1.0);

        let mut values = vec![1.0 + 1.0 / 512.0, -3.0];
        DType::Bf16.round_slice(&mut values);
        assert_eq!(values, vec![1.0, -3.0]);
    }

    #[test]
    fn test_serde_names() {
        let json = serde_json::to_string(&DType::Bf16).unwrap();
        assert_eq!(json, "\"bf16\"");
        let back: DType = serde_json::from_str("\"f32\"").unwrap();
        assert_eq!(back, DType::F32);
    }
}
