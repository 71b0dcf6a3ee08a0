//! Activation functions.
//!
//! Only SiLU (Swish) is needed here: it is the gate nonlinearity of the SwiGLU feed-forward.

use crate::error::Result;
use crate::tensor::{Tensor, TensorElem};
use num_traits::Float;
use rayon::prelude::*;

/// SiLU (Sigmoid Linear Unit), also known as Swish.
///
/// `silu(x) = x * sigmoid(x) = x / (1 + e^-x)`, evaluated in `f64`.
pub fn silu<T: TensorElem + Float>(x: T) -> T {
    let val = x.to_f64().unwrap_or(0.0);
    let sig = 1.0 / (1.0 + (-val).exp());
    T::from_f64(val * sig).unwrap_or(T::zero())
}

/// Activation functions namespace.
pub struct Activation;

impl Activation {
    /// Applies SiLU element-wise.
    pub fn silu<const RANK: usize, T: TensorElem + Float>(x: &Tensor<T, RANK>) -> Tensor<T, RANK> {
        x.map(silu)
    }

    /// SwiGLU gating: `silu(gate) * up`, element-wise.
    ///
    /// Fuses the activation and the product into one pass over the hidden activations.
    pub fn swiglu<const RANK: usize, T: TensorElem + Float>(
        gate: &Tensor<T, RANK>,
        up: &Tensor<T, RANK>,
    ) -> Result<Tensor<T, RANK>> {
        if gate.shape() != up.shape() {
            return Err(crate::error::Error::ShapeMismatch {
                expected: gate.shape().to_vec(),
                got: up.shape().to_vec(),
            });
        }

        let mut out = Tensor::zeros(*gate.shape());
        out.data_mut()
            .par_iter_mut()
            .zip(gate.data().par_iter().zip(up.data().par_iter()))
            .for_each(|(o, (&g, &u))| *o = silu(g) * u);
        Ok(out)
    }
}
