//! End-to-end conversion of one checkpoint into a safetensors file.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::checkpoint::load_checkpoint;
use crate::dedup::{remove_duplicates, shared_pointers};
use crate::error::Result;
use crate::normalize::make_contiguous;
use crate::serialize::save_file;
use crate::validate::{check_file_size, check_reload};

/// Knobs for [`convert_file`]. The defaults reproduce the fixed behavior
/// of the command-line tool.
#[derive(Clone, Debug)]
pub struct ConvertOptions {
    /// Top-level key whose dictionary replaces the checkpoint root when present.
    pub state_dict_key: String,
    /// Allowed relative growth of the output over the input file.
    pub size_tolerance: f64,
    /// Header metadata written into the safetensors file.
    pub metadata: HashMap<String, String>,
}

impl Default for ConvertOptions {
    fn default() -> Self {
        Self {
            state_dict_key: "state_dict".to_string(),
            size_tolerance: 0.01,
            metadata: HashMap::from([("format".to_string(), "pt".to_string())]),
        }
    }
}

/// What a successful conversion did.
#[derive(Clone, Debug, PartialEq)]
pub struct ConversionReport {
    pub output: PathBuf,
    pub tensors_written: usize,
    pub aliases_removed: Vec<String>,
    pub made_contiguous: usize,
    pub input_size: u64,
    pub output_size: u64,
}

/// Convert the checkpoint at `pt_path` into `sf_path`.
///
/// The output file is left in place when a validation step fails.
pub fn convert_file(pt_path: &Path, sf_path: &Path, options: &ConvertOptions) -> Result<ConversionReport> {
    info!(input = %pt_path.display(), output = %sf_path.display(), "converting checkpoint");

    let mut loaded = load_checkpoint(pt_path, &options.state_dict_key)?;

    let shared = shared_pointers(&loaded);
    let aliases_removed = remove_duplicates(&mut loaded, &shared);
    if !aliases_removed.is_empty() {
        info!(groups = shared.len(), removed = aliases_removed.len(), "removed aliased tensors");
    }

    let (loaded, made_contiguous) = make_contiguous(loaded);

    if let Some(dir) = sf_path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        fs::create_dir_all(dir)?;
    }
    save_file(&loaded, sf_path, &options.metadata)?;

    check_file_size(sf_path, pt_path, options.size_tolerance)?;
    check_reload(&loaded, sf_path)?;

    let report = ConversionReport {
        output: sf_path.to_path_buf(),
        tensors_written: loaded.len(),
        aliases_removed,
        made_contiguous,
        input_size: fs::metadata(pt_path)?.len(),
        output_size: fs::metadata(sf_path)?.len(),
    };
    info!(
        tensors = report.tensors_written,
        input_size = report.input_size,
        output_size = report.output_size,
        "conversion verified"
    );
    Ok(report)
}
