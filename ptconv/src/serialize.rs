//! Read and write `.safetensors` files.

use std::borrow::Cow;
use std::collections::HashMap;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use memmap2::MmapOptions;
use safetensors::SafeTensors;
use tracing::debug;

use crate::error::{ConvertError, Result};
use crate::tensor::{Dtype, Tensor, TensorMap};

/// Borrowing adapter handing a [`Tensor`] to the safetensors serializer.
struct SafetensorsView<'a>(&'a Tensor);

impl safetensors::View for SafetensorsView<'_> {
    fn dtype(&self) -> safetensors::Dtype {
        self.0.dtype().to_safetensors()
    }

    fn shape(&self) -> &[usize] {
        self.0.shape()
    }

    fn data(&self) -> Cow<'_, [u8]> {
        self.0.contiguous_bytes()
    }

    fn data_len(&self) -> usize {
        self.0.nbytes()
    }
}

/// Names of tensors whose bytes overlap inside a shared storage, one group
/// per run of overlapping views. Disjoint views of one buffer (a fused
/// projection saved as separate slices) are not reported.
pub fn overlapping_views(tensors: &TensorMap) -> Vec<Vec<String>> {
    let mut order = Vec::new();
    let mut by_storage: HashMap<usize, Vec<(usize, usize, &str)>> = HashMap::new();
    for (name, tensor) in tensors.iter() {
        if tensor.nbytes() == 0 {
            continue;
        }
        let id = Arc::as_ptr(tensor.storage()) as usize;
        let start = tensor.offset() * tensor.dtype().size();
        by_storage
            .entry(id)
            .or_insert_with(|| {
                order.push(id);
                Vec::new()
            })
            .push((start, start + tensor.nbytes(), name));
    }

    let mut groups = Vec::new();
    for id in order {
        let Some(mut spans) = by_storage.remove(&id) else {
            continue;
        };
        if spans.len() < 2 {
            continue;
        }
        spans.sort_by_key(|&(start, end, _)| (start, end));

        let mut run: Vec<String> = Vec::new();
        let mut run_end = 0;
        for (start, end, name) in spans {
            if !run.is_empty() && start >= run_end {
                if run.len() > 1 {
                    groups.push(std::mem::take(&mut run));
                }
                run.clear();
            }
            run_end = if run.is_empty() { end } else { run_end.max(end) };
            run.push(name.to_string());
        }
        if run.len() > 1 {
            groups.push(run);
        }
    }
    groups
}

/// Serialize `tensors` to `path` with the given header metadata.
///
/// Every tensor must be contiguous. Tensors may share a storage as long as
/// their byte ranges are disjoint; overlapping views are refused.
pub fn save_file<P: AsRef<Path>>(
    tensors: &TensorMap,
    path: P,
    metadata: &HashMap<String, String>,
) -> Result<()> {
    if let Some((name, _)) = tensors.iter().find(|(_, t)| !t.is_contiguous()) {
        return Err(ConvertError::NotContiguous(name.to_string()));
    }
    let overlapping = overlapping_views(tensors);
    if !overlapping.is_empty() {
        return Err(ConvertError::SharedStorage(overlapping));
    }

    let views = tensors.iter().map(|(name, t)| (name, SafetensorsView(t)));
    safetensors::serialize_to_file(views, Some(metadata.clone()), path.as_ref())?;
    debug!(path = %path.as_ref().display(), tensors = tensors.len(), "wrote safetensors file");
    Ok(())
}

/// Load every tensor of a safetensors file into owned memory, sorted by name.
pub fn load_file<P: AsRef<Path>>(path: P) -> Result<TensorMap> {
    let file = File::open(path.as_ref())?;
    let mmap = unsafe { MmapOptions::new().map(&file)? };
    let st = SafeTensors::deserialize(&mmap)?;

    let mut entries = st.tensors();
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    let mut tensors = TensorMap::new();
    for (name, view) in entries {
        let dtype = Dtype::from_safetensors(view.dtype())?;
        let tensor = Tensor::from_bytes(dtype, view.shape().to_vec(), view.data().to_vec())?;
        tensors.insert(name, tensor);
    }
    Ok(tensors)
}

/// The free-form `__metadata__` map from a safetensors header.
pub fn read_metadata<P: AsRef<Path>>(path: P) -> Result<HashMap<String, String>> {
    let file = File::open(path.as_ref())?;
    let mmap = unsafe { MmapOptions::new().map(&file)? };
    let (_, metadata) = SafeTensors::read_metadata(&mmap)?;
    Ok(metadata.metadata().clone().unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::make_contiguous;
    use proptest::prelude::*;

    fn pt_metadata() -> HashMap<String, String> {
        HashMap::from([("format".to_string(), "pt".to_string())])
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.safetensors");

        let mut map = TensorMap::new();
        map.insert("b", Tensor::from_slice(Dtype::BF16, vec![2], &[0x3f80u16, 0x4000]).unwrap());
        map.insert("a", Tensor::from_slice(Dtype::Bool, vec![3], &[1u8, 0, 1]).unwrap());
        save_file(&map, &path, &pt_metadata()).unwrap();

        let loaded = load_file(&path).unwrap();
        assert_eq!(loaded.keys().collect::<Vec<_>>(), vec!["a", "b"]);
        for (name, tensor) in map.iter() {
            assert!(loaded.get(name).unwrap().equal(tensor));
        }
        assert_eq!(read_metadata(&path).unwrap(), pt_metadata());
    }

    #[test]
    fn test_non_contiguous_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let base = Tensor::from_slice(Dtype::F32, vec![2, 2], &[0f32; 4]).unwrap();
        let mut map = TensorMap::new();
        map.insert("t", base.transpose(0, 1).unwrap());

        let err = save_file(&map, dir.path().join("x.safetensors"), &pt_metadata()).unwrap_err();
        assert!(matches!(err, ConvertError::NotContiguous(name) if name == "t"));
    }

    #[test]
    fn test_disjoint_views_of_one_storage_are_written() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lohi.safetensors");
        let base = Tensor::from_slice(Dtype::F32, vec![4], &[1f32, 2.0, 3.0, 4.0]).unwrap();
        let mut map = TensorMap::new();
        map.insert("hi", base.as_strided(vec![2], vec![1], 2).unwrap());
        map.insert("lo", base.as_strided(vec![2], vec![1], 0).unwrap());

        save_file(&map, &path, &pt_metadata()).unwrap();
        let loaded = load_file(&path).unwrap();
        for (name, tensor) in map.iter() {
            assert!(loaded.get(name).unwrap().equal(tensor), "{name} differs");
        }
    }

    #[test]
    fn test_overlapping_views_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let base = Tensor::from_slice(Dtype::F32, vec![8], &[0f32; 8]).unwrap();
        let mut map = TensorMap::new();
        map.insert("head", base.as_strided(vec![3], vec![1], 0).unwrap());
        map.insert("tail", base.as_strided(vec![2], vec![1], 6).unwrap());
        map.insert("middle", base.as_strided(vec![3], vec![1], 2).unwrap());

        match save_file(&map, dir.path().join("x.safetensors"), &pt_metadata()) {
            Err(ConvertError::SharedStorage(groups)) => {
                assert_eq!(groups, vec![vec!["head".to_string(), "middle".to_string()]]);
            }
            other => panic!("expected SharedStorage, got {other:?}"),
        }
    }

    #[test]
    fn test_overlap_chains_form_one_group() {
        let base = Tensor::from_slice(Dtype::U8, vec![10], &[0u8; 10]).unwrap();
        let mut map = TensorMap::new();
        map.insert("a", base.as_strided(vec![4], vec![1], 0).unwrap());
        map.insert("b", base.as_strided(vec![4], vec![1], 3).unwrap());
        map.insert("c", base.as_strided(vec![2], vec![1], 6).unwrap());
        map.insert("d", base.as_strided(vec![2], vec![1], 8).unwrap());
        map.insert("own", Tensor::from_slice(Dtype::U8, vec![1], &[1u8]).unwrap());

        assert_eq!(
            overlapping_views(&map),
            vec![vec!["a".to_string(), "b".to_string(), "c".to_string()]]
        );
    }

    #[test]
    fn test_empty_tensors_do_not_count_as_shared() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.safetensors");
        let empty = Tensor::from_bytes(Dtype::F32, vec![0], Vec::new()).unwrap();
        let mut map = TensorMap::new();
        map.insert("a", empty.clone());
        map.insert("b", empty);

        save_file(&map, &path, &pt_metadata()).unwrap();
        assert_eq!(load_file(&path).unwrap().len(), 2);
    }

    fn pattern(dtype: Dtype, numel: usize) -> Vec<u8> {
        (0..numel * dtype.size())
            .map(|i| match dtype {
                Dtype::Bool => (i % 2) as u8,
                _ => (i * 31 % 251) as u8,
            })
            .collect()
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn normalized_tensors_survive_a_file_round_trip(
            dtype in proptest::sample::select(vec![
                Dtype::Bool, Dtype::U8, Dtype::I8, Dtype::U16, Dtype::I16, Dtype::I32,
                Dtype::U64, Dtype::I64, Dtype::F8E4M3, Dtype::F16, Dtype::BF16, Dtype::F32, Dtype::F64,
            ]),
            (dims, perm) in proptest::collection::vec(0usize..4, 0..4).prop_flat_map(|dims| {
                let order: Vec<usize> = (0..dims.len()).collect();
                (Just(dims), Just(order).prop_shuffle())
            }),
        ) {
            let numel = dims.iter().product();
            let base = Tensor::from_bytes(dtype, dims.clone(), pattern(dtype, numel)).unwrap();
            let shape = perm.iter().map(|&p| base.shape()[p]).collect();
            let strides = perm.iter().map(|&p| base.strides()[p]).collect();

            let mut map = TensorMap::new();
            map.insert("view", base.as_strided(shape, strides, 0).unwrap());
            map.insert("scalar", Tensor::from_bytes(dtype, vec![], pattern(dtype, 1)).unwrap());
            let (normalized, _) = make_contiguous(map.clone());

            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("prop.safetensors");
            save_file(&normalized, &path, &pt_metadata()).unwrap();
            let loaded = load_file(&path).unwrap();

            prop_assert_eq!(loaded.len(), map.len());
            for (name, tensor) in map.iter() {
                prop_assert!(loaded.get(name).unwrap().equal(tensor), "{} differs", name);
            }
        }
    }
}
