//! Convert PyTorch checkpoints into the safetensors format.
//!
//! The pipeline loads a zip-based checkpoint with a restricted unpickler,
//! drops tensors that alias the same memory, makes every tensor contiguous,
//! writes a `.safetensors` file and verifies it by size and by reloading.

pub mod checkpoint;
pub mod convert;
pub mod dedup;
pub mod error;
pub mod normalize;
pub mod pickle;
pub mod serialize;
pub mod tensor;
pub mod validate;

#[cfg(any(test, feature = "fixtures"))]
pub mod fixture;

pub use convert::{convert_file, ConversionReport, ConvertOptions};
pub use error::{ConvertError, Result};
pub use tensor::{Dtype, Tensor, TensorMap};
