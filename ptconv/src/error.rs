//! Error type shared by every stage of the conversion.

use std::path::PathBuf;

use thiserror::Error;

use crate::pickle::PickleError;

#[derive(Error, Debug)]
pub enum ConvertError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Zip archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("Pickle error: {0}")]
    Pickle(#[from] PickleError),

    #[error("Safetensors error: {0}")]
    Safetensors(#[from] safetensors::SafeTensorError),

    #[error("{0} is not a zip-based PyTorch checkpoint (legacy torch.save format is unsupported)")]
    LegacyFormat(PathBuf),

    #[error("Malformed checkpoint: {0}")]
    Malformed(String),

    #[error("Entry {0:?} is not a tensor")]
    NotATensor(String),

    #[error("Unsupported dtype: {0}")]
    UnsupportedDtype(String),

    #[error("Invalid tensor layout: {0}")]
    InvalidLayout(String),

    #[error("Tensor {0:?} is not contiguous")]
    NotContiguous(String),

    #[error("Some tensors share memory and cannot be stored separately: {0:?}")]
    SharedStorage(Vec<Vec<String>>),

    #[error(
        "Output file size differs by more than {tolerance_pct}%:\n - {}: {sf_size}\n - {}: {pt_size}",
        .sf_path.display(),
        .pt_path.display()
    )]
    SizeMismatch {
        sf_path: PathBuf,
        sf_size: u64,
        pt_path: PathBuf,
        pt_size: u64,
        tolerance_pct: f64,
    },

    #[error("The output tensors do not match for key {0}")]
    ContentMismatch(String),
}

pub type Result<T> = std::result::Result<T, ConvertError>;
