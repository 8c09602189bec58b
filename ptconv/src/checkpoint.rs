//! Load tensors from zip-based PyTorch checkpoints (`torch.save` >= 1.6).

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info};
use zip::ZipArchive;

use crate::error::{ConvertError, Result};
use crate::pickle::{self, StorageRef, Value};
use crate::tensor::{Storage, Tensor, TensorMap};

const ZIP_MAGIC: &[u8; 4] = b"PK\x03\x04";

/// An opened checkpoint archive.
///
/// Records live under a common prefix (usually `archive/`): the pickled
/// object graph in `data.pkl` and one raw little-endian record per storage
/// in `data/<key>`.
pub struct Archive {
    zip: ZipArchive<BufReader<File>>,
    prefix: String,
    path: PathBuf,
}

impl Archive {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::open(&path)?;

        let mut magic = [0u8; 4];
        let n = file.read(&mut magic)?;
        if n < magic.len() || &magic != ZIP_MAGIC {
            return Err(ConvertError::LegacyFormat(path));
        }
        drop(file);

        let mut zip = ZipArchive::new(BufReader::new(File::open(&path)?))?;
        let prefix = zip
            .file_names()
            .filter_map(|name| name.strip_suffix("data.pkl"))
            .filter(|prefix| prefix.is_empty() || prefix.ends_with('/'))
            .min_by_key(|prefix| prefix.len())
            .map(str::to_string)
            .ok_or_else(|| ConvertError::Malformed(format!("{} has no data.pkl record", path.display())))?;

        let byteorder_name = format!("{prefix}byteorder");
        if zip.file_names().any(|name| name == byteorder_name) {
            let mut order = String::new();
            zip.by_name(&byteorder_name)?.read_to_string(&mut order)?;
            if order.trim() != "little" {
                return Err(ConvertError::Malformed(format!(
                    "unsupported byte order {:?}",
                    order.trim()
                )));
            }
        }

        debug!(path = %path.display(), prefix = %prefix, records = zip.len(), "opened checkpoint archive");
        Ok(Self { zip, prefix, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_record(&mut self, name: &str) -> Result<Vec<u8>> {
        let full = format!("{}{}", self.prefix, name);
        let mut record = self.zip.by_name(&full)?;
        let mut buf = Vec::with_capacity(record.size() as usize);
        record.read_to_end(&mut buf)?;
        Ok(buf)
    }

    /// Raw bytes of the pickled object graph.
    pub fn read_pickle(&mut self) -> Result<Vec<u8>> {
        self.read_record("data.pkl")
    }

    /// Raw bytes of one storage record.
    pub fn read_storage(&mut self, key: &str) -> Result<Vec<u8>> {
        self.read_record(&format!("data/{key}"))
    }
}

/// Read a checkpoint into a [`TensorMap`], keeping the order in which the
/// entries were saved.
///
/// When the top-level dictionary holds `state_dict_key`, that nested
/// dictionary is returned instead. Tensors rebuilt from the same storage
/// record share one [`Storage`].
pub fn load_checkpoint<P: AsRef<Path>>(path: P, state_dict_key: &str) -> Result<TensorMap> {
    let mut archive = Archive::open(path)?;
    let root = pickle::load(&archive.read_pickle()?)?;
    let entries = unwrap_state_dict(root, state_dict_key)?;

    let mut storages: HashMap<String, (StorageRef, Arc<Storage>)> = HashMap::new();
    let mut tensors = TensorMap::new();
    for (key, value) in entries {
        let Value::Str(name) = key else {
            return Err(ConvertError::Malformed(format!("non-string key of type {}", key.kind())));
        };
        let Value::Tensor(tref) = value else {
            return Err(ConvertError::NotATensor(name));
        };

        let storage = match storages.get(&tref.storage.key) {
            Some((seen, storage)) => {
                if seen.dtype != tref.storage.dtype {
                    return Err(ConvertError::Malformed(format!(
                        "storage {} used as both {} and {}",
                        seen.key, seen.dtype, tref.storage.dtype
                    )));
                }
                storage.clone()
            }
            None => {
                let storage = read_storage(&mut archive, &tref.storage)?;
                storages.insert(tref.storage.key.clone(), (tref.storage.clone(), storage.clone()));
                storage
            }
        };

        let tensor = Tensor::view(
            storage,
            tref.storage.dtype,
            tref.shape,
            tref.strides,
            tref.offset,
        )
        .map_err(|e| ConvertError::Malformed(format!("tensor {name:?}: {e}")))?;
        debug!(
            name = %name,
            dtype = %tensor.dtype(),
            shape = ?tensor.shape(),
            storage = %tref.storage.key,
            "loaded tensor"
        );
        tensors.insert(name, tensor);
    }

    info!(
        path = %archive.path().display(),
        tensors = tensors.len(),
        storages = storages.len(),
        "loaded checkpoint"
    );
    Ok(tensors)
}

fn read_storage(archive: &mut Archive, record: &StorageRef) -> Result<Arc<Storage>> {
    let bytes = archive.read_storage(&record.key)?;
    let needed = record
        .numel
        .checked_mul(record.dtype.size())
        .ok_or_else(|| ConvertError::Malformed(format!("storage {} is too large", record.key)))?;
    if bytes.len() < needed {
        return Err(ConvertError::Malformed(format!(
            "storage {} holds {} bytes, expected {needed}",
            record.key,
            bytes.len()
        )));
    }
    Ok(Storage::new(bytes))
}

fn unwrap_state_dict(root: Value, key: &str) -> Result<Vec<(Value, Value)>> {
    let Some(mut items) = root.into_dict_items() else {
        return Err(ConvertError::Malformed("checkpoint root is not a dictionary".into()));
    };
    let Some(pos) = items.iter().position(|(k, _)| k.as_str() == Some(key)) else {
        return Ok(items);
    };
    let (_, nested) = items.swap_remove(pos);
    let kind = nested.kind();
    match nested.into_dict_items() {
        Some(inner) => {
            debug!(key, entries = inner.len(), "unwrapped nested state dict");
            Ok(inner)
        }
        None => Err(ConvertError::Malformed(format!("{key:?} entry is a {kind}, not a dictionary"))),
    }
}
