//! Model configuration.

use crate::error::{Error, Result};
use crate::tensor::TensorElem;
use num_traits::Float;
use serde::{Deserialize, Serialize};

/// Configuration of a block stack.
///
/// Unset JSON fields take the defaults below (Llama-2-7B-like).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Channel width of the activations.
    pub dim: usize,
    /// Number of transformer blocks.
    pub n_layers: usize,
    /// Number of query heads.
    pub n_heads: usize,
    /// Number of key/value heads. `None` means `n_heads` (plain multi-head attention).
    pub n_kv_heads: Option<usize>,
    /// Requested feed-forward width before the 2/3 shrink. `None` means `4 * dim`.
    pub hidden_dim: Option<usize>,
    /// Feed-forward width alignment.
    pub multiple_of: usize,
    /// RMSNorm epsilon.
    pub norm_eps: f64,
    /// Longest sequence the rotary table covers.
    pub max_seq_len: usize,
    /// Dropout probability, used only in training mode.
    pub dropout: f64,
    /// Rotary base frequency.
    pub rope_theta: f64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            dim: 4096,
            n_layers: 32,
            n_heads: 32,
            n_kv_heads: None,
            hidden_dim: None,
            multiple_of: 256,
            norm_eps: 1e-5,
            max_seq_len: 2048,
            dropout: 0.0,
            rope_theta: 10000.0,
        }
    }
}

impl ModelConfig {
    /// Parses a JSON configuration. Missing fields take their defaults.
    ///
    /// The result is not validated; call [`ModelConfig::validate`] or build a stack from it.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn n_kv_heads(&self) -> usize {
        self.n_kv_heads.unwrap_or(self.n_heads)
    }

    /// Width of one attention head, `dim / n_heads`.
    pub fn head_dim(&self) -> usize {
        self.dim / self.n_heads.max(1)
    }

    /// How many query heads share one key/value head.
    pub fn n_rep(&self) -> usize {
        self.n_heads / self.n_kv_heads().max(1)
    }

    /// Derived feed-forward width (see [`ffn_hidden_dim`](crate::nn::transformer::ffn_hidden_dim)).
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidConfig` if `multiple_of` is zero or the width overflows `usize`.
    pub fn ffn_hidden_dim(&self) -> Result<usize> {
        let requested = match self.hidden_dim {
            Some(hidden) => Some(hidden),
            None => self.dim.checked_mul(4),
        };
        requested
            .and_then(|r| crate::nn::transformer::ffn_hidden_dim(r, self.multiple_of))
            .ok_or_else(|| {
                Error::InvalidConfig(format!(
                    "feed-forward width overflows (dim {}, hidden_dim {:?}, multiple_of {})",
                    self.dim, self.hidden_dim, self.multiple_of
                ))
            })
    }

    /// `norm_eps` in the element type of the weights.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidConfig` if the value is not representable or rounds to zero in `T`.
    pub fn norm_eps_as<T: TensorElem + Float>(&self) -> Result<T> {
        match T::from_f64(self.norm_eps) {
            Some(eps) if eps > T::zero() && eps.is_finite() => Ok(eps),
            _ => Err(Error::InvalidConfig(format!(
                "norm_eps {} is not a positive value in the element type",
                self.norm_eps
            ))),
        }
    }

    /// Checks every structural invariant.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidConfig` naming the first violated rule.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| -> Result<()> { Err(Error::InvalidConfig(msg)) };

        if self.dim == 0 {
            return invalid("dim must be > 0".into());
        }
        if self.n_heads == 0 {
            return invalid("n_heads must be > 0".into());
        }
        let n_kv_heads = self.n_kv_heads();
        if n_kv_heads == 0 {
            return invalid("n_kv_heads must be > 0".into());
        }
        if self.dim % self.n_heads != 0 {
            return invalid(format!(
                "dim ({}) must be divisible by n_heads ({})",
                self.dim, self.n_heads
            ));
        }
        if self.n_heads % n_kv_heads != 0 {
            return invalid(format!(
                "n_heads ({}) must be divisible by n_kv_heads ({})",
                self.n_heads, n_kv_heads
            ));
        }
        if self.head_dim() % 2 != 0 {
            return invalid(format!(
                "head_dim ({}) must be even for rotary embeddings",
                self.head_dim()
            ));
        }
        if self.multiple_of == 0 {
            return invalid("multiple_of must be > 0".into());
        }
        if self.hidden_dim == Some(0) {
            return invalid("hidden_dim must be > 0".into());
        }
        if self.max_seq_len == 0 {
            return invalid("max_seq_len must be > 0".into());
        }
        if !self.dropout.is_finite() || !(0.0..1.0).contains(&self.dropout) {
            return invalid(format!("dropout must be in [0, 1), got {}", self.dropout));
        }
        if !self.norm_eps.is_finite() || self.norm_eps <= 0.0 {
            return invalid(format!(
                "norm_eps must be finite and > 0, got {}",
                self.norm_eps
            ));
        }
        if !self.rope_theta.is_finite() || self.rope_theta <= 0.0 {
            return invalid(format!(
                "rope_theta must be finite and > 0, got {}",
                self.rope_theta
            ));
        }
        self.ffn_hidden_dim()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> ModelConfig {
        ModelConfig {
            dim: 8,
            n_layers: 1,
            n_heads: 2,
            n_kv_heads: Some(1),
            multiple_of: 4,
            max_seq_len: 16,
            ..ModelConfig::default()
        }
    }

    #[test]
    fn test_defaults() {
        let config = ModelConfig::default();
        assert_eq!(config.n_kv_heads(), 32);
        assert_eq!(config.head_dim(), 128);
        assert_eq!(config.n_rep(), 1);
        // 2 * 16384 / 3 = 10922 -> next multiple of 256
        assert_eq!(config.ffn_hidden_dim().unwrap(), 11008);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_derived_values() {
        let config = small();
        assert_eq!(config.head_dim(), 4);
        assert_eq!(config.n_rep(), 2);
        // 4 * 8 = 32 -> 21 -> 24
        assert_eq!(config.ffn_hidden_dim().unwrap(), 24);

        let config = ModelConfig {
            hidden_dim: Some(12),
            ..small()
        };
        // 12 -> 8 -> 8
        assert_eq!(config.ffn_hidden_dim().unwrap(), 8);
    }

    #[test]
    fn test_validate_rejects() {
        #[rustfmt::skip]
        let cases = [
            ModelConfig { dim: 0, ..small() },
            ModelConfig { n_heads: 0, ..small() },
            ModelConfig { n_kv_heads: Some(0), ..small() },
            ModelConfig { n_heads: 3, n_kv_heads: Some(3), dim: 8, ..small() },
            ModelConfig { n_heads: 4, n_kv_heads: Some(3), dim: 8, ..small() },
            // head_dim = 12 / 4 = 3 is odd
            ModelConfig { dim: 12, n_heads: 4, n_kv_heads: Some(2), ..small() },
            ModelConfig { multiple_of: 0, ..small() },
            ModelConfig { hidden_dim: Some(0), ..small() },
            ModelConfig { max_seq_len: 0, ..small() },
            ModelConfig { dropout: 1.0, ..small() },
            ModelConfig { dropout: -0.5, ..small() },
            ModelConfig { norm_eps: f64::NAN, ..small() },
            ModelConfig { norm_eps: 0.0, ..small() },
            ModelConfig { norm_eps: -1e-6, ..small() },
            // 2 * hidden_dim overflows
            ModelConfig { hidden_dim: Some(usize::MAX / 2 + 10), ..small() },
            // 4 * dim overflows
            ModelConfig { dim: usize::MAX / 2 - 1, n_heads: 1, n_kv_heads: Some(1), ..small() },
            ModelConfig { rope_theta: 0.0, ..small() },
        ];
        for config in cases {
            assert!(
                matches!(config.validate(), Err(Error::InvalidConfig(_))),
                "{:?} should be rejected",
                config
            );
        }
    }

    #[test]
    fn test_overflowing_hidden_dim_is_an_error() {
        let config = ModelConfig {
            hidden_dim: Some(usize::MAX / 2 + 10),
            ..small()
        };
        assert!(matches!(config.ffn_hidden_dim(), Err(Error::InvalidConfig(_))));
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));

        let config = ModelConfig {
            dim: usize::MAX / 2 - 1,
            n_heads: 1,
            n_kv_heads: Some(1),
            ..small()
        };
        assert!(matches!(config.ffn_hidden_dim(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_norm_eps_in_element_type() {
        let config = small();
        assert_eq!(config.norm_eps_as::<f64>().unwrap(), 1e-5);
        assert!(config.norm_eps_as::<f32>().unwrap() > 0.0);

        // 1e-30 is below the smallest f16 subnormal.
        let tiny = ModelConfig {
            norm_eps: 1e-30,
            ..small()
        };
        assert!(tiny.validate().is_ok());
        assert!(tiny.norm_eps_as::<f32>().is_ok());
        assert!(matches!(
            tiny.norm_eps_as::<half::f16>(),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_zero_layers_is_valid() {
        let config = ModelConfig {
            n_layers: 0,
            ..small()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_json_partial() {
        let config =
            ModelConfig::from_json(r#"{"dim": 8, "n_heads": 2, "n_kv_heads": 1, "n_layers": 3}"#)
                .unwrap();
        assert_eq!(config.dim, 8);
        assert_eq!(config.n_layers, 3);
        assert_eq!(config.n_kv_heads(), 1);
        assert_eq!(config.multiple_of, 256);
        assert_eq!(config.max_seq_len, 2048);
        assert_eq!(config.hidden_dim, None);
    }

    #[test]
    fn test_from_json_roundtrip_and_errors() {
        let config = small();
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(ModelConfig::from_json(&json).unwrap(), config);

        assert!(matches!(
            ModelConfig::from_json("{\"dim\": \"eight\"}"),
            Err(Error::ConfigParse(_))
        ));
    }
}
