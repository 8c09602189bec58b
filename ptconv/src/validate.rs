//! Post-write sanity checks on a converted file.

use std::fs;
use std::path::Path;

use tracing::debug;

use crate::error::{ConvertError, Result};
use crate::serialize;
use crate::tensor::TensorMap;

/// Fail when the safetensors file grew by more than `tolerance` (a fraction)
/// relative to the checkpoint it was converted from. A smaller output is
/// expected since the checkpoint carries zip and pickle overhead.
pub fn check_file_size(sf_path: &Path, pt_path: &Path, tolerance: f64) -> Result<()> {
    let sf_size = fs::metadata(sf_path)?.len();
    let pt_size = fs::metadata(pt_path)?.len();

    let grew_too_much = if pt_size == 0 {
        sf_size > 0
    } else {
        (sf_size as f64 - pt_size as f64) / pt_size as f64 > tolerance
    };
    if grew_too_much {
        return Err(ConvertError::SizeMismatch {
            sf_path: sf_path.to_path_buf(),
            sf_size,
            pt_path: pt_path.to_path_buf(),
            pt_size,
            tolerance_pct: tolerance * 100.0,
        });
    }
    debug!(sf_size, pt_size, "file size check passed");
    Ok(())
}

/// Reload `sf_path` and require every tensor of `expected` to come back
/// element-wise identical.
pub fn check_reload(expected: &TensorMap, sf_path: &Path) -> Result<()> {
    let reloaded = serialize::load_file(sf_path)?;
    for (name, tensor) in expected.iter() {
        match reloaded.get(name) {
            Some(back) if back.equal(tensor) => {}
            _ => return Err(ConvertError::ContentMismatch(name.to_string())),
        }
    }
    debug!(tensors = expected.len(), "reload check passed");
    Ok(())
}
