//! Writer for small PyTorch-layout checkpoints, used by tests.
//!
//! Produces the same archive shape `torch.save` does: a zip with
//! `archive/data.pkl` (protocol 2 pickle of an `OrderedDict`),
//! `archive/byteorder`, one `archive/data/<key>` record per storage and
//! `archive/version`. Tensors sharing a [`Storage`](crate::tensor::Storage)
//! are written against one storage record, so aliasing round-trips.

use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::error::Result;
use crate::pickle::op;
use crate::tensor::{Tensor, TensorMap};

pub struct CheckpointBuilder {
    tensors: TensorMap,
    wrap_state_dict: bool,
    alias_key: Option<String>,
    int_entries: Vec<(String, i64)>,
    parameters: bool,
    module_metadata: bool,
}

impl CheckpointBuilder {
    pub fn new(tensors: TensorMap) -> Self {
        Self {
            tensors,
            wrap_state_dict: false,
            alias_key: None,
            int_entries: Vec::new(),
            parameters: false,
            module_metadata: false,
        }
    }

    /// Nest the tensors under a top-level `"state_dict"` key.
    pub fn wrapped_in_state_dict(mut self) -> Self {
        self.wrap_state_dict = true;
        self
    }

    /// Nest the tensors under `key` and also under `"state_dict"`, pickling
    /// the second entry as a memo reference to the first.
    pub fn also_referenced_as(mut self, key: &str) -> Self {
        self.wrap_state_dict = true;
        self.alias_key = Some(key.to_string());
        self
    }

    /// Pickle every tensor as an `nn.Parameter` (`_rebuild_parameter`).
    pub fn as_parameters(mut self) -> Self {
        self.parameters = true;
        self
    }

    /// Attach the `_metadata` attribute `Module.state_dict()` sets, which
    /// pickles as a BUILD after the items.
    pub fn with_module_metadata(mut self) -> Self {
        self.module_metadata = true;
        self
    }

    /// Add an integer entry to the top-level dictionary.
    pub fn with_int_entry(mut self, key: &str, value: i64) -> Self {
        self.int_entries.push((key.to_string(), value));
        self
    }

    pub fn write<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let (pickle, storages) = self.encode();
        let records: Vec<(String, &[u8])> = storages
            .iter()
            .map(|(key, tensor)| (key.clone(), tensor.storage().as_bytes()))
            .collect();
        write_archive(path, &pickle, &records)
    }

    fn encode(&self) -> (Vec<u8>, Vec<(String, Tensor)>) {
        let mut enc = Encoder::default();
        enc.out.extend_from_slice(&[op::PROTO, 2]);

        enc.parameters = self.parameters;
        enc.module_metadata = self.module_metadata;
        if self.wrap_state_dict {
            enc.out.push(op::EMPTY_DICT);
            enc.memoize();
            enc.out.push(op::MARK);
            match &self.alias_key {
                Some(key) => {
                    enc.string(key);
                    let memo = enc.tensor_dict(&self.tensors, &[]);
                    enc.string("state_dict");
                    enc.get(memo);
                }
                None => {
                    enc.string("state_dict");
                    enc.tensor_dict(&self.tensors, &[]);
                }
            }
            enc.int_items(&self.int_entries);
            enc.out.push(op::SETITEMS);
        } else {
            enc.tensor_dict(&self.tensors, &self.int_entries);
        }
        enc.out.push(op::STOP);
        (enc.out, enc.storages)
    }
}

#[derive(Default)]
struct Encoder {
    out: Vec<u8>,
    memo_len: u32,
    storage_memo: HashMap<usize, u32>,
    storages: Vec<(String, Tensor)>,
    parameters: bool,
    module_metadata: bool,
}

impl Encoder {
    fn memoize(&mut self) -> u32 {
        let key = self.memo_len;
        self.out.push(op::LONG_BINPUT);
        self.out.extend_from_slice(&key.to_le_bytes());
        self.memo_len += 1;
        key
    }

    fn get(&mut self, memo: u32) {
        self.out.push(op::LONG_BINGET);
        self.out.extend_from_slice(&memo.to_le_bytes());
    }

    fn string(&mut self, s: &str) {
        self.out.push(op::BINUNICODE);
        self.out.extend_from_slice(&(s.len() as u32).to_le_bytes());
        self.out.extend_from_slice(s.as_bytes());
    }

    fn int(&mut self, v: i64) {
        match v {
            0..=0xff => self.out.extend_from_slice(&[op::BININT1, v as u8]),
            0x100..=0xffff => {
                self.out.push(op::BININT2);
                self.out.extend_from_slice(&(v as u16).to_le_bytes());
            }
            _ if i32::try_from(v).is_ok() => {
                self.out.push(op::BININT);
                self.out.extend_from_slice(&(v as i32).to_le_bytes());
            }
            _ => {
                self.out.extend_from_slice(&[op::LONG1, 8]);
                self.out.extend_from_slice(&v.to_le_bytes());
            }
        }
    }

    fn global(&mut self, module: &str, name: &str) {
        self.out.push(op::GLOBAL);
        self.out.extend_from_slice(module.as_bytes());
        self.out.push(b'\n');
        self.out.extend_from_slice(name.as_bytes());
        self.out.push(b'\n');
    }

    fn int_tuple(&mut self, values: &[usize]) {
        self.out.push(op::MARK);
        for &v in values {
            self.int(v as i64);
        }
        self.out.push(op::TUPLE);
    }

    fn int_items(&mut self, items: &[(String, i64)]) {
        for (key, value) in items {
            self.string(key);
            self.int(*value);
        }
    }

    fn empty_ordered_dict(&mut self) -> u32 {
        self.global("collections", "OrderedDict");
        self.out.push(op::EMPTY_TUPLE);
        self.out.push(op::REDUCE);
        self.memoize()
    }

    /// Returns the memo key of the dictionary.
    fn tensor_dict(&mut self, tensors: &TensorMap, extra: &[(String, i64)]) -> u32 {
        let memo = self.empty_ordered_dict();
        self.out.push(op::MARK);
        for (name, tensor) in tensors.iter() {
            self.string(name);
            if self.parameters {
                self.parameter(tensor);
            } else {
                self.tensor(tensor);
            }
        }
        self.int_items(extra);
        self.out.push(op::SETITEMS);
        if self.module_metadata {
            self.metadata_state();
        }
        memo
    }

    /// `{"_metadata": OrderedDict([("", {"version": 1})])}` followed by BUILD.
    fn metadata_state(&mut self) {
        self.out.push(op::EMPTY_DICT);
        self.memoize();
        self.string("_metadata");
        self.empty_ordered_dict();
        self.out.push(op::MARK);
        self.string("");
        self.out.push(op::EMPTY_DICT);
        self.memoize();
        self.string("version");
        self.int(1);
        self.out.push(op::SETITEM);
        self.out.push(op::SETITEMS);
        self.out.push(op::SETITEM);
        self.out.push(op::BUILD);
    }

    fn parameter(&mut self, tensor: &Tensor) {
        self.global("torch._utils", "_rebuild_parameter");
        self.out.push(op::MARK);
        self.tensor(tensor);
        self.out.push(op::NEWTRUE);
        self.empty_ordered_dict();
        self.out.push(op::TUPLE);
        self.out.push(op::REDUCE);
        self.memoize();
    }

    fn storage(&mut self, tensor: &Tensor) {
        let identity = Arc::as_ptr(tensor.storage()) as usize;
        if let Some(&memo) = self.storage_memo.get(&identity) {
            self.get(memo);
            return;
        }
        let key = self.storages.len().to_string();
        let dtype = tensor.dtype();
        self.out.push(op::MARK);
        self.string("storage");
        self.global("torch", dtype.storage_class());
        self.string(&key);
        self.string("cpu");
        self.int((tensor.storage().len() / dtype.size()) as i64);
        self.out.push(op::TUPLE);
        self.out.push(op::BINPERSID);
        let memo = self.memoize();
        self.storage_memo.insert(identity, memo);
        self.storages.push((key, tensor.clone()));
    }

    fn tensor(&mut self, tensor: &Tensor) {
        self.global("torch._utils", "_rebuild_tensor_v2");
        self.out.push(op::MARK);
        self.storage(tensor);
        self.int(tensor.offset() as i64);
        self.int_tuple(tensor.shape());
        self.int_tuple(tensor.strides());
        self.out.push(op::NEWFALSE);
        self.empty_ordered_dict();
        self.out.push(op::TUPLE);
        self.out.push(op::REDUCE);
        self.memoize();
    }
}

/// Write a checkpoint archive from a ready-made pickle stream and storage
/// records (`(key, bytes)`).
pub fn write_archive<P: AsRef<Path>>(path: P, pickle: &[u8], storages: &[(String, &[u8])]) -> Result<()> {
    let file = File::create(path)?;
    let mut zip = ZipWriter::new(file);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);

    zip.start_file("archive/data.pkl", options)?;
    zip.write_all(pickle)?;
    zip.start_file("archive/byteorder", options)?;
    zip.write_all(b"little")?;
    for (key, bytes) in storages {
        zip.start_file(format!("archive/data/{key}"), options)?;
        zip.write_all(bytes)?;
    }
    zip.start_file("archive/version", options)?;
    zip.write_all(b"3\n")?;
    zip.finish()?;
    Ok(())
}
