//! Minimal CPU tensor with PyTorch-style strided views.
//!
//! A [`Tensor`] is a view (shape, strides, element offset) onto a shared,
//! reference-counted [`Storage`]. Several tensors may point at the same
//! storage, which is exactly how a checkpoint encodes tied weights. The
//! storage allocation address doubles as the identity used for alias
//! detection.

use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use ndarray::{Dimension, IxDyn};

use crate::error::{ConvertError, Result};

/// Element type of a tensor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Dtype {
    Bool,
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    U64,
    I64,
    F8E4M3,
    F8E5M2,
    F16,
    BF16,
    F32,
    F64,
}

impl Dtype {
    /// Size of one element in bytes.
    pub fn size(self) -> usize {
        match self {
            Dtype::Bool | Dtype::U8 | Dtype::I8 | Dtype::F8E4M3 | Dtype::F8E5M2 => 1,
            Dtype::U16 | Dtype::I16 | Dtype::F16 | Dtype::BF16 => 2,
            Dtype::U32 | Dtype::I32 | Dtype::F32 => 4,
            Dtype::U64 | Dtype::I64 | Dtype::F64 => 8,
        }
    }

    /// Map a legacy PyTorch storage class name (`FloatStorage`, ...) to a dtype.
    pub fn from_storage_class(name: &str) -> Option<Self> {
        let dtype = match name {
            "BoolStorage" => Dtype::Bool,
            "ByteStorage" => Dtype::U8,
            "CharStorage" => Dtype::I8,
            "UInt16Storage" => Dtype::U16,
            "ShortStorage" => Dtype::I16,
            "UInt32Storage" => Dtype::U32,
            "IntStorage" => Dtype::I32,
            "UInt64Storage" => Dtype::U64,
            "LongStorage" => Dtype::I64,
            "Float8_e4m3fnStorage" => Dtype::F8E4M3,
            "Float8_e5m2Storage" => Dtype::F8E5M2,
            "HalfStorage" => Dtype::F16,
            "BFloat16Storage" => Dtype::BF16,
            "FloatStorage" => Dtype::F32,
            "DoubleStorage" => Dtype::F64,
            _ => return None,
        };
        Some(dtype)
    }

    /// The storage class name PyTorch pickles for this dtype.
    pub fn storage_class(self) -> &'static str {
        match self {
            Dtype::Bool => "BoolStorage",
            Dtype::U8 => "ByteStorage",
            Dtype::I8 => "CharStorage",
            Dtype::U16 => "UInt16Storage",
            Dtype::I16 => "ShortStorage",
            Dtype::U32 => "UInt32Storage",
            Dtype::I32 => "IntStorage",
            Dtype::U64 => "UInt64Storage",
            Dtype::I64 => "LongStorage",
            Dtype::F8E4M3 => "Float8_e4m3fnStorage",
            Dtype::F8E5M2 => "Float8_e5m2Storage",
            Dtype::F16 => "HalfStorage",
            Dtype::BF16 => "BFloat16Storage",
            Dtype::F32 => "FloatStorage",
            Dtype::F64 => "DoubleStorage",
        }
    }

    pub fn to_safetensors(self) -> safetensors::Dtype {
        match self {
            Dtype::Bool => safetensors::Dtype::BOOL,
            Dtype::U8 => safetensors::Dtype::U8,
            Dtype::I8 => safetensors::Dtype::I8,
            Dtype::U16 => safetensors::Dtype::U16,
            Dtype::I16 => safetensors::Dtype::I16,
            Dtype::U32 => safetensors::Dtype::U32,
            Dtype::I32 => safetensors::Dtype::I32,
            Dtype::U64 => safetensors::Dtype::U64,
            Dtype::I64 => safetensors::Dtype::I64,
            Dtype::F8E4M3 => safetensors::Dtype::F8_E4M3,
            Dtype::F8E5M2 => safetensors::Dtype::F8_E5M2,
            Dtype::F16 => safetensors::Dtype::F16,
            Dtype::BF16 => safetensors::Dtype::BF16,
            Dtype::F32 => safetensors::Dtype::F32,
            Dtype::F64 => safetensors::Dtype::F64,
        }
    }

    pub fn from_safetensors(dtype: safetensors::Dtype) -> Result<Self> {
        let dtype = match dtype {
            safetensors::Dtype::BOOL => Dtype::Bool,
            safetensors::Dtype::U8 => Dtype::U8,
            safetensors::Dtype::I8 => Dtype::I8,
            safetensors::Dtype::U16 => Dtype::U16,
            safetensors::Dtype::I16 => Dtype::I16,
            safetensors::Dtype::U32 => Dtype::U32,
            safetensors::Dtype::I32 => Dtype::I32,
            safetensors::Dtype::U64 => Dtype::U64,
            safetensors::Dtype::I64 => Dtype::I64,
            safetensors::Dtype::F8_E4M3 => Dtype::F8E4M3,
            safetensors::Dtype::F8_E5M2 => Dtype::F8E5M2,
            safetensors::Dtype::F16 => Dtype::F16,
            safetensors::Dtype::BF16 => Dtype::BF16,
            safetensors::Dtype::F32 => Dtype::F32,
            safetensors::Dtype::F64 => Dtype::F64,
            other => return Err(ConvertError::UnsupportedDtype(format!("{other:?}"))),
        };
        Ok(dtype)
    }
}

impl fmt::Display for Dtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Owned byte buffer backing one or more tensors.
pub struct Storage {
    bytes: Vec<u8>,
}

impl Storage {
    pub fn new(bytes: Vec<u8>) -> Arc<Self> {
        Arc::new(Self { bytes })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl fmt::Debug for Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Storage").field("len", &self.bytes.len()).finish()
    }
}

/// Address of a tensor's first element: storage identity plus byte offset.
///
/// Two tensors with equal `DataPtr`s start at the same byte of the same
/// allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DataPtr {
    storage: usize,
    byte_offset: usize,
}

/// Strided view onto a shared [`Storage`].
#[derive(Clone, Debug)]
pub struct Tensor {
    dtype: Dtype,
    shape: Vec<usize>,
    strides: Vec<usize>,
    offset: usize,
    storage: Arc<Storage>,
}

/// Row-major strides (in elements) for `shape`.
pub fn contiguous_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![0; shape.len()];
    let mut acc = 1;
    for (stride, &dim) in strides.iter_mut().zip(shape).rev() {
        *stride = acc;
        acc *= dim;
    }
    strides
}

impl Tensor {
    /// Build a view onto `storage`, checking that every addressed element
    /// lies inside the buffer.
    pub fn view(
        storage: Arc<Storage>,
        dtype: Dtype,
        shape: Vec<usize>,
        strides: Vec<usize>,
        offset: usize,
    ) -> Result<Self> {
        if shape.len() != strides.len() {
            return Err(ConvertError::InvalidLayout(format!(
                "shape {shape:?} and stride {strides:?} have different ranks"
            )));
        }
        let numel = checked_numel(&shape)?;
        if numel > 0 {
            let mut last = offset;
            for (&dim, &stride) in shape.iter().zip(&strides) {
                last = (dim - 1)
                    .checked_mul(stride)
                    .and_then(|span| span.checked_add(last))
                    .ok_or_else(|| ConvertError::InvalidLayout("element index overflows".into()))?;
            }
            let available = storage.len() / dtype.size();
            if last >= available {
                return Err(ConvertError::InvalidLayout(format!(
                    "view of shape {shape:?} stride {strides:?} offset {offset} needs {} elements, storage holds {available}",
                    last + 1
                )));
            }
        }
        Ok(Self {
            dtype,
            shape,
            strides,
            offset,
            storage,
        })
    }

    /// Take ownership of row-major bytes.
    pub fn from_bytes(dtype: Dtype, shape: Vec<usize>, bytes: Vec<u8>) -> Result<Self> {
        let expected = checked_numel(&shape)? * dtype.size();
        if bytes.len() != expected {
            return Err(ConvertError::InvalidLayout(format!(
                "{} bytes given for shape {shape:?} of {dtype}, expected {expected}",
                bytes.len()
            )));
        }
        let strides = contiguous_strides(&shape);
        Self::view(Storage::new(bytes), dtype, shape, strides, 0)
    }

    /// Copy a typed slice into a fresh row-major tensor.
    pub fn from_slice<T: bytemuck::Pod>(dtype: Dtype, shape: Vec<usize>, data: &[T]) -> Result<Self> {
        Self::from_bytes(dtype, shape, bytemuck::cast_slice(data).to_vec())
    }

    /// Another view onto the same storage.
    pub fn as_strided(&self, shape: Vec<usize>, strides: Vec<usize>, offset: usize) -> Result<Self> {
        Self::view(self.storage.clone(), self.dtype, shape, strides, offset)
    }

    /// Swap two dimensions without copying.
    pub fn transpose(&self, dim0: usize, dim1: usize) -> Result<Self> {
        let rank = self.shape.len();
        if dim0 >= rank || dim1 >= rank {
            return Err(ConvertError::InvalidLayout(format!(
                "cannot transpose dims {dim0} and {dim1} of a rank-{rank} tensor"
            )));
        }
        let mut shape = self.shape.clone();
        let mut strides = self.strides.clone();
        shape.swap(dim0, dim1);
        strides.swap(dim0, dim1);
        self.as_strided(shape, strides, self.offset)
    }

    pub fn dtype(&self) -> Dtype {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    /// Size of the logical contents in bytes.
    pub fn nbytes(&self) -> usize {
        self.numel() * self.dtype.size()
    }

    pub fn data_ptr(&self) -> DataPtr {
        DataPtr {
            storage: Arc::as_ptr(&self.storage) as usize,
            byte_offset: self.offset * self.dtype.size(),
        }
    }

    /// True when both tensors are views onto the same allocation.
    pub fn shares_storage(&self, other: &Tensor) -> bool {
        Arc::ptr_eq(&self.storage, &other.storage)
    }

    /// Row-major layout check. Size-1 dimensions may carry any stride and an
    /// empty tensor is always contiguous.
    pub fn is_contiguous(&self) -> bool {
        if self.numel() == 0 {
            return true;
        }
        let mut expected = 1;
        for (&dim, &stride) in self.shape.iter().zip(&self.strides).rev() {
            if dim == 1 {
                continue;
            }
            if stride != expected {
                return false;
            }
            expected *= dim;
        }
        true
    }

    /// Return a row-major tensor with the same contents. Already contiguous
    /// tensors are returned as-is and keep sharing their storage.
    pub fn contiguous(&self) -> Tensor {
        if self.is_contiguous() {
            return self.clone();
        }
        let bytes = self.gather();
        let strides = contiguous_strides(&self.shape);
        Tensor {
            dtype: self.dtype,
            shape: self.shape.clone(),
            strides,
            offset: 0,
            storage: Storage::new(bytes),
        }
    }

    /// Logical contents in row-major order, borrowed when the layout allows.
    pub fn contiguous_bytes(&self) -> Cow<'_, [u8]> {
        if self.is_contiguous() {
            let start = self.offset * self.dtype.size();
            Cow::Borrowed(&self.storage.as_bytes()[start..start + self.nbytes()])
        } else {
            Cow::Owned(self.gather())
        }
    }

    /// Element-wise equality: same dtype, same shape, identical bytes.
    pub fn equal(&self, other: &Tensor) -> bool {
        self.dtype == other.dtype
            && self.shape == other.shape
            && self.contiguous_bytes() == other.contiguous_bytes()
    }

    fn gather(&self) -> Vec<u8> {
        let item = self.dtype.size();
        let src = self.storage.as_bytes();
        let mut out = Vec::with_capacity(self.nbytes());
        if self.numel() == 0 {
            return out;
        }
        for index in ndarray::indices(IxDyn(&self.shape)) {
            let elem = self.offset
                + index
                    .slice()
                    .iter()
                    .zip(&self.strides)
                    .map(|(i, s)| i * s)
                    .sum::<usize>();
            out.extend_from_slice(&src[elem * item..(elem + 1) * item]);
        }
        out
    }
}

fn checked_numel(shape: &[usize]) -> Result<usize> {
    shape
        .iter()
        .try_fold(1usize, |acc, &d| acc.checked_mul(d))
        .ok_or_else(|| ConvertError::InvalidLayout(format!("shape {shape:?} overflows")))
}

/// Insertion-ordered mapping from tensor name to tensor.
#[derive(Clone, Debug, Default)]
pub struct TensorMap {
    entries: Vec<(String, Tensor)>,
    index: HashMap<String, usize>,
}

impl TensorMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace. A replaced entry keeps its position.
    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) -> Option<Tensor> {
        let name = name.into();
        match self.index.get(&name) {
            Some(&pos) => Some(std::mem::replace(&mut self.entries[pos].1, tensor)),
            None => {
                self.index.insert(name.clone(), self.entries.len());
                self.entries.push((name, tensor));
                None
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.index.get(name).map(|&pos| &self.entries[pos].1)
    }

    /// Remove an entry, keeping the order of the others.
    pub fn remove(&mut self, name: &str) -> Option<Tensor> {
        let pos = self.index.remove(name)?;
        let (_, tensor) = self.entries.remove(pos);
        for (key, _) in &self.entries[pos..] {
            if let Some(slot) = self.index.get_mut(key) {
                *slot -= 1;
            }
        }
        Some(tensor)
    }

    pub fn contains_key(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.entries.iter().map(|(k, t)| (k.as_str(), t))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<(String, Tensor)> for TensorMap {
    fn from_iter<I: IntoIterator<Item = (String, Tensor)>>(iter: I) -> Self {
        let mut map = TensorMap::new();
        for (name, tensor) in iter {
            map.insert(name, tensor);
        }
        map
    }
}

impl IntoIterator for TensorMap {
    type Item = (String, Tensor);
    type IntoIter = std::vec::IntoIter<(String, Tensor)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}
