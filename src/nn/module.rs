use crate::tensor::TensorElem;
use std::fmt::Debug;

/// Common interface of every layer in the crate.
///
/// `Send + Sync` lets a model be shared across the `rayon` pool; `Debug` keeps the structure of
/// any model printable.
pub trait Module<T: TensorElem>: Debug + Send + Sync {
    /// Number of scalar weights owned by this module and its children.
    fn num_parameters(&self) -> usize;
}
