//! Restricted unpickler for PyTorch checkpoints.
//!
//! Only the opcodes `torch.save` emits for state dicts are understood, and
//! only an allow-list of globals can be resolved. Allow-listed callables are
//! interpreted here (building dictionaries, tensor and storage references);
//! nothing named by the stream is ever executed. This matches the trust
//! boundary of `torch.load(..., weights_only=True)`.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use thiserror::Error;

use crate::tensor::Dtype;

#[derive(Error, Debug)]
pub enum PickleError {
    #[error("unexpected end of pickle stream")]
    Eof,

    #[error("unsupported opcode 0x{opcode:02x} at byte {pos}")]
    UnknownOpcode { opcode: u8, pos: usize },

    #[error("unsupported pickle protocol {0}")]
    Protocol(u8),

    #[error("stack underflow")]
    StackUnderflow,

    #[error("no MARK on the stack")]
    MissingMark,

    #[error("memo key {0} not found")]
    MissingMemo(u32),

    #[error("global {module}.{name} is not allowed when loading weights")]
    UnsupportedGlobal { module: String, name: String },

    #[error("invalid pickle data: {0}")]
    Invalid(String),
}

type Result<T> = std::result::Result<T, PickleError>;

/// Opcodes of the pickle virtual machine that this module reads or writes.
pub(crate) mod op {
    pub const MARK: u8 = b'(';
    pub const STOP: u8 = b'.';
    pub const POP: u8 = b'0';
    pub const POP_MARK: u8 = b'1';
    pub const DUP: u8 = b'2';
    pub const INT: u8 = b'I';
    pub const BININT: u8 = b'J';
    pub const BININT1: u8 = b'K';
    pub const BININT2: u8 = b'M';
    pub const NONE: u8 = b'N';
    pub const BINPERSID: u8 = b'Q';
    pub const REDUCE: u8 = b'R';
    pub const BINUNICODE: u8 = b'X';
    pub const BINBYTES: u8 = b'B';
    pub const SHORT_BINBYTES: u8 = b'C';
    pub const APPEND: u8 = b'a';
    pub const BUILD: u8 = b'b';
    pub const GLOBAL: u8 = b'c';
    pub const DICT: u8 = b'd';
    pub const EMPTY_DICT: u8 = b'}';
    pub const APPENDS: u8 = b'e';
    pub const BINGET: u8 = b'h';
    pub const LONG_BINGET: u8 = b'j';
    pub const LIST: u8 = b'l';
    pub const EMPTY_LIST: u8 = b']';
    pub const BINPUT: u8 = b'q';
    pub const LONG_BINPUT: u8 = b'r';
    pub const SETITEM: u8 = b's';
    pub const TUPLE: u8 = b't';
    pub const EMPTY_TUPLE: u8 = b')';
    pub const SETITEMS: u8 = b'u';
    pub const BINFLOAT: u8 = b'G';
    pub const PROTO: u8 = 0x80;
    pub const TUPLE1: u8 = 0x85;
    pub const TUPLE2: u8 = 0x86;
    pub const TUPLE3: u8 = 0x87;
    pub const NEWTRUE: u8 = 0x88;
    pub const NEWFALSE: u8 = 0x89;
    pub const LONG1: u8 = 0x8a;
    pub const SHORT_BINUNICODE: u8 = 0x8c;
    pub const BINUNICODE8: u8 = 0x8d;
    pub const BINBYTES8: u8 = 0x8e;
    pub const STACK_GLOBAL: u8 = 0x93;
    pub const MEMOIZE: u8 = 0x94;
    pub const FRAME: u8 = 0x95;
}

/// Callables a weights-only load may reference.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Global {
    OrderedDict,
    RebuildTensorV2,
    RebuildParameter,
    RebuildParameterWithState,
    StorageClass(Dtype),
}

impl Global {
    fn resolve(module: &str, name: &str) -> Result<Self> {
        let global = match (module, name) {
            ("collections", "OrderedDict") => Global::OrderedDict,
            ("torch._utils", "_rebuild_tensor_v2") => Global::RebuildTensorV2,
            ("torch._utils", "_rebuild_parameter") => Global::RebuildParameter,
            ("torch._utils", "_rebuild_parameter_with_state") => Global::RebuildParameterWithState,
            ("torch", class) => match Dtype::from_storage_class(class) {
                Some(dtype) => Global::StorageClass(dtype),
                None => return Err(unsupported(module, name)),
            },
            _ => return Err(unsupported(module, name)),
        };
        Ok(global)
    }
}

fn unsupported(module: &str, name: &str) -> PickleError {
    PickleError::UnsupportedGlobal {
        module: module.to_string(),
        name: name.to_string(),
    }
}

/// A storage record referenced through a persistent id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StorageRef {
    /// Record name under `data/` in the archive.
    pub key: String,
    pub dtype: Dtype,
    pub numel: usize,
}

/// Arguments of a `_rebuild_tensor_v2` call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TensorRef {
    pub storage: StorageRef,
    pub offset: usize,
    pub shape: Vec<usize>,
    pub strides: Vec<usize>,
}

/// Mutable container shared between the stack and the memo.
pub type Shared<T> = Rc<RefCell<T>>;

/// Decoded pickle object.
///
/// Lists and dictionaries are shared handles: the stream memoizes a
/// container before filling it, and every later reference must see the
/// filled container.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Tuple(Vec<Value>),
    List(Shared<Vec<Value>>),
    Dict(Shared<Vec<(Value, Value)>>),
    Global(Global),
    Storage(StorageRef),
    Tensor(TensorRef),
}

impl Value {
    pub fn new_list(items: Vec<Value>) -> Self {
        Value::List(Rc::new(RefCell::new(items)))
    }

    pub fn new_dict(items: Vec<(Value, Value)>) -> Self {
        Value::Dict(Rc::new(RefCell::new(items)))
    }

    /// Short type name for error messages. Containers may be cyclic, so
    /// errors never print them in full.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::None => "None",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::Bytes(_) => "bytes",
            Value::Tuple(_) => "tuple",
            Value::List(_) => "list",
            Value::Dict(_) => "dict",
            Value::Global(_) => "global",
            Value::Storage(_) => "storage",
            Value::Tensor(_) => "tensor",
        }
    }

    /// Lists and dictionaries (or tuples holding them) cannot be keys.
    fn is_hashable(&self) -> bool {
        match self {
            Value::List(_) | Value::Dict(_) => false,
            Value::Tuple(items) => items.iter().all(Value::is_hashable),
            _ => true,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    fn as_usize(&self) -> Result<usize> {
        match self {
            Value::Int(i) if *i >= 0 => Ok(*i as usize),
            Value::Int(i) => Err(PickleError::Invalid(format!("expected a non-negative int, got {i}"))),
            other => Err(PickleError::Invalid(format!("expected an int, got {}", other.kind()))),
        }
    }

    fn as_usize_tuple(&self) -> Result<Vec<usize>> {
        match self {
            Value::Tuple(items) => items.iter().map(Value::as_usize).collect(),
            Value::List(items) => items.borrow().iter().map(Value::as_usize).collect(),
            other => Err(PickleError::Invalid(format!("expected a tuple of ints, got {}", other.kind()))),
        }
    }

    /// Look up a string key in a dictionary value.
    pub fn get(&self, key: &str) -> Option<Value> {
        match self {
            Value::Dict(items) => items
                .borrow()
                .iter()
                .find(|(k, _)| k.as_str() == Some(key))
                .map(|(_, v)| v.clone()),
            _ => None,
        }
    }

    /// The entries of a dictionary value, in insertion order.
    pub fn into_dict_items(self) -> Option<Vec<(Value, Value)>> {
        match self {
            Value::Dict(items) => Some(match Rc::try_unwrap(items) {
                Ok(cell) => cell.into_inner(),
                Err(shared) => shared.as_ref().clone().into_inner(),
            }),
            _ => None,
        }
    }
}

/// Decode a pickle stream.
pub fn load(data: &[u8]) -> Result<Value> {
    Unpickler::new(data).run()
}

struct Unpickler<'a> {
    data: &'a [u8],
    pos: usize,
    stack: Vec<Value>,
    marks: Vec<usize>,
    memo: HashMap<u32, Value>,
}

impl<'a> Unpickler<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            stack: Vec::new(),
            marks: Vec::new(),
            memo: HashMap::new(),
        }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(n).ok_or(PickleError::Eof)?;
        let data = self.data;
        let bytes = data.get(self.pos..end).ok_or(PickleError::Eof)?;
        self.pos = end;
        Ok(bytes)
    }

    fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn read_u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn read_u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(b);
        Ok(u64::from_le_bytes(buf))
    }

    fn read_line(&mut self) -> Result<&'a str> {
        let data = self.data;
        let rest = &data[self.pos..];
        let len = rest.iter().position(|&b| b == b'\n').ok_or(PickleError::Eof)?;
        let line = &rest[..len];
        self.pos += len + 1;
        std::str::from_utf8(line).map_err(|e| PickleError::Invalid(e.to_string()))
    }

    fn read_string(&mut self, len: usize) -> Result<String> {
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|e| PickleError::Invalid(e.to_string()))
    }

    fn pop(&mut self) -> Result<Value> {
        self.stack.pop().ok_or(PickleError::StackUnderflow)
    }

    fn top(&mut self) -> Result<&mut Value> {
        self.stack.last_mut().ok_or(PickleError::StackUnderflow)
    }

    fn pop_mark(&mut self) -> Result<Vec<Value>> {
        let mark = self.marks.pop().ok_or(PickleError::MissingMark)?;
        if mark > self.stack.len() {
            return Err(PickleError::StackUnderflow);
        }
        Ok(self.stack.split_off(mark))
    }

    fn memo_get(&self, key: u32) -> Result<Value> {
        self.memo.get(&key).cloned().ok_or(PickleError::MissingMemo(key))
    }

    fn memo_put(&mut self, key: u32) -> Result<()> {
        let value = self.stack.last().ok_or(PickleError::StackUnderflow)?.clone();
        self.memo.insert(key, value);
        Ok(())
    }

    fn run(mut self) -> Result<Value> {
        loop {
            let at = self.pos;
            let opcode = self.read_u8()?;
            match opcode {
                op::PROTO => {
                    let version = self.read_u8()?;
                    if !(2..=5).contains(&version) {
                        return Err(PickleError::Protocol(version));
                    }
                }
                op::FRAME => {
                    self.read_u64()?;
                }
                op::STOP => return self.pop(),
                op::MARK => self.marks.push(self.stack.len()),
                op::POP => {
                    self.pop()?;
                }
                op::POP_MARK => {
                    self.pop_mark()?;
                }
                op::DUP => {
                    let top = self.top()?.clone();
                    self.stack.push(top);
                }
                op::NONE => self.stack.push(Value::None),
                op::NEWTRUE => self.stack.push(Value::Bool(true)),
                op::NEWFALSE => self.stack.push(Value::Bool(false)),
                op::INT => {
                    let value = match self.read_line()? {
                        "00" => Value::Bool(false),
                        "01" => Value::Bool(true),
                        text => Value::Int(
                            text.parse()
                                .map_err(|_| PickleError::Invalid(format!("bad INT {text:?}")))?,
                        ),
                    };
                    self.stack.push(value);
                }
                op::BININT => {
                    let v = self.read_u32()? as i32;
                    self.stack.push(Value::Int(v as i64));
                }
                op::BININT1 => {
                    let v = self.read_u8()?;
                    self.stack.push(Value::Int(v as i64));
                }
                op::BININT2 => {
                    let v = self.read_u16()?;
                    self.stack.push(Value::Int(v as i64));
                }
                op::LONG1 => {
                    let n = self.read_u8()? as usize;
                    let bytes = self.take(n)?;
                    self.stack.push(Value::Int(decode_long(bytes)?));
                }
                op::BINFLOAT => {
                    let b = self.take(8)?;
                    let mut buf = [0u8; 8];
                    buf.copy_from_slice(b);
                    self.stack.push(Value::Float(f64::from_be_bytes(buf)));
                }
                op::SHORT_BINUNICODE => {
                    let n = self.read_u8()? as usize;
                    let s = self.read_string(n)?;
                    self.stack.push(Value::Str(s));
                }
                op::BINUNICODE => {
                    let n = self.read_u32()? as usize;
                    let s = self.read_string(n)?;
                    self.stack.push(Value::Str(s));
                }
                op::BINUNICODE8 => {
                    let n = self.read_u64()? as usize;
                    let s = self.read_string(n)?;
                    self.stack.push(Value::Str(s));
                }
                op::SHORT_BINBYTES => {
                    let n = self.read_u8()? as usize;
                    let b = self.take(n)?.to_vec();
                    self.stack.push(Value::Bytes(b));
                }
                op::BINBYTES => {
                    let n = self.read_u32()? as usize;
                    let b = self.take(n)?.to_vec();
                    self.stack.push(Value::Bytes(b));
                }
                op::BINBYTES8 => {
                    let n = self.read_u64()? as usize;
                    let b = self.take(n)?.to_vec();
                    self.stack.push(Value::Bytes(b));
                }
                op::EMPTY_TUPLE => self.stack.push(Value::Tuple(Vec::new())),
                op::TUPLE => {
                    let items = self.pop_mark()?;
                    self.stack.push(Value::Tuple(items));
                }
                op::TUPLE1 | op::TUPLE2 | op::TUPLE3 => {
                    let n = (opcode - op::TUPLE1 + 1) as usize;
                    if self.stack.len() < n {
                        return Err(PickleError::StackUnderflow);
                    }
                    let items = self.stack.split_off(self.stack.len() - n);
                    self.stack.push(Value::Tuple(items));
                }
                op::EMPTY_LIST => self.stack.push(Value::new_list(Vec::new())),
                op::LIST => {
                    let items = self.pop_mark()?;
                    self.stack.push(Value::new_list(items));
                }
                op::EMPTY_DICT => self.stack.push(Value::new_dict(Vec::new())),
                op::DICT => {
                    let items = self.pop_mark()?;
                    let dict = Value::new_dict(Vec::new());
                    set_items(&dict, items)?;
                    self.stack.push(dict);
                }
                op::APPEND => {
                    let item = self.pop()?;
                    append(self.top()?, vec![item])?;
                }
                op::APPENDS => {
                    let items = self.pop_mark()?;
                    append(self.top()?, items)?;
                }
                op::SETITEM => {
                    let value = self.pop()?;
                    let key = self.pop()?;
                    set_items(self.top()?, vec![key, value])?;
                }
                op::SETITEMS => {
                    let items = self.pop_mark()?;
                    set_items(self.top()?, items)?;
                }
                op::BINPUT => {
                    let key = self.read_u8()? as u32;
                    self.memo_put(key)?;
                }
                op::LONG_BINPUT => {
                    let key = self.read_u32()?;
                    self.memo_put(key)?;
                }
                op::MEMOIZE => {
                    let key = self.memo.len() as u32;
                    self.memo_put(key)?;
                }
                op::BINGET => {
                    let key = self.read_u8()? as u32;
                    let value = self.memo_get(key)?;
                    self.stack.push(value);
                }
                op::LONG_BINGET => {
                    let key = self.read_u32()?;
                    let value = self.memo_get(key)?;
                    self.stack.push(value);
                }
                op::GLOBAL => {
                    let module = self.read_line()?;
                    let name = self.read_line()?;
                    self.stack.push(Value::Global(Global::resolve(module, name)?));
                }
                op::STACK_GLOBAL => {
                    let name = self.pop()?;
                    let module = self.pop()?;
                    match (module.as_str(), name.as_str()) {
                        (Some(module), Some(name)) => {
                            self.stack.push(Value::Global(Global::resolve(module, name)?))
                        }
                        _ => return Err(PickleError::Invalid("STACK_GLOBAL expects two strings".into())),
                    }
                }
                op::REDUCE => {
                    let args = self.pop()?;
                    let callable = self.pop()?;
                    self.stack.push(reduce(callable, args)?);
                }
                op::BUILD => {
                    let _state = self.pop()?;
                    match self.top()? {
                        Value::Dict(_) | Value::Tensor(_) => {}
                        other => {
                            return Err(PickleError::Invalid(format!("cannot BUILD on a {}", other.kind())))
                        }
                    }
                }
                op::BINPERSID => {
                    let pid = self.pop()?;
                    self.stack.push(persistent_load(pid)?);
                }
                _ => return Err(PickleError::UnknownOpcode { opcode, pos: at }),
            }
        }
    }
}

fn decode_long(bytes: &[u8]) -> Result<i64> {
    if bytes.is_empty() {
        return Ok(0);
    }
    if bytes.len() > 8 {
        return Err(PickleError::Invalid(format!("{}-byte integer does not fit in i64", bytes.len())));
    }
    let fill = if bytes[bytes.len() - 1] & 0x80 != 0 { 0xff } else { 0 };
    let mut buf = [fill; 8];
    buf[..bytes.len()].copy_from_slice(bytes);
    Ok(i64::from_le_bytes(buf))
}

fn append(target: &Value, items: Vec<Value>) -> Result<()> {
    match target {
        Value::List(list) => {
            list.borrow_mut().extend(items);
            Ok(())
        }
        other => Err(PickleError::Invalid(format!("cannot append to a {}", other.kind()))),
    }
}

fn set_items(target: &Value, items: Vec<Value>) -> Result<()> {
    let Value::Dict(dict) = target else {
        return Err(PickleError::Invalid(format!("cannot set items on a {}", target.kind())));
    };
    if items.len() % 2 != 0 {
        return Err(PickleError::Invalid("odd number of dict items".into()));
    }
    let mut dict = dict
        .try_borrow_mut()
        .map_err(|_| PickleError::Invalid("dictionary modified while being read".into()))?;
    let mut items = items.into_iter();
    while let (Some(key), Some(value)) = (items.next(), items.next()) {
        if !key.is_hashable() {
            return Err(PickleError::Invalid(format!("unhashable {} used as a key", key.kind())));
        }
        match dict.iter_mut().find(|(k, _)| *k == key) {
            Some((_, slot)) => *slot = value,
            None => dict.push((key, value)),
        }
    }
    Ok(())
}

fn reduce(callable: Value, args: Value) -> Result<Value> {
    let Value::Global(global) = callable else {
        return Err(PickleError::Invalid(format!("cannot call a {}", callable.kind())));
    };
    let Value::Tuple(mut args) = args else {
        return Err(PickleError::Invalid(format!("call arguments must be a tuple, got a {}", args.kind())));
    };
    match global {
        Global::OrderedDict => {
            let dict = Value::new_dict(Vec::new());
            if let Some(Value::List(pairs)) = args.pop() {
                let pairs = pairs.borrow().clone();
                for pair in pairs {
                    match pair {
                        Value::Tuple(kv) if kv.len() == 2 => set_items(&dict, kv)?,
                        other => {
                            return Err(PickleError::Invalid(format!("bad OrderedDict item of type {}", other.kind())))
                        }
                    }
                }
            }
            Ok(dict)
        }
        Global::RebuildTensorV2 => {
            if args.len() < 4 {
                return Err(PickleError::Invalid(format!(
                    "_rebuild_tensor_v2 takes at least 4 arguments, got {}",
                    args.len()
                )));
            }
            let Value::Storage(storage) = &args[0] else {
                return Err(PickleError::Invalid(format!("expected a storage, got a {}", args[0].kind())));
            };
            Ok(Value::Tensor(TensorRef {
                storage: storage.clone(),
                offset: args[1].as_usize()?,
                shape: args[2].as_usize_tuple()?,
                strides: args[3].as_usize_tuple()?,
            }))
        }
        Global::RebuildParameter | Global::RebuildParameterWithState => match args.into_iter().next() {
            Some(tensor @ Value::Tensor(_)) => Ok(tensor),
            Some(other) => Err(PickleError::Invalid(format!("expected a tensor parameter, got a {}", other.kind()))),
            None => Err(PickleError::Invalid("parameter without data".into())),
        },
        Global::StorageClass(dtype) => Err(PickleError::Invalid(format!(
            "storage class {} cannot be called",
            dtype.storage_class()
        ))),
    }
}

fn persistent_load(pid: Value) -> Result<Value> {
    let Value::Tuple(parts) = pid else {
        return Err(PickleError::Invalid(format!("persistent id must be a tuple, got a {}", pid.kind())));
    };
    match parts.as_slice() {
        [Value::Str(kind), Value::Global(Global::StorageClass(dtype)), key, _location, numel]
            if kind == "storage" =>
        {
            let key = match key {
                Value::Str(s) => s.clone(),
                Value::Int(i) => i.to_string(),
                other => return Err(PickleError::Invalid(format!("bad storage key of type {}", other.kind()))),
            };
            Ok(Value::Storage(StorageRef {
                key,
                dtype: *dtype,
                numel: numel.as_usize()?,
            }))
        }
        _ => Err(PickleError::Invalid(format!("unsupported persistent id of length {}", parts.len()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn short_str(out: &mut Vec<u8>, s: &str) {
        out.push(op::SHORT_BINUNICODE);
        out.push(s.len() as u8);
        out.extend_from_slice(s.as_bytes());
    }

    #[test]
    fn test_plain_dict() {
        let mut p = vec![op::PROTO, 2, op::EMPTY_DICT, op::BINPUT, 0, op::MARK];
        short_str(&mut p, "a");
        p.extend_from_slice(&[op::BININT1, 7]);
        short_str(&mut p, "b");
        p.extend_from_slice(&[op::NEWTRUE, op::SETITEMS, op::STOP]);

        let value = load(&p).unwrap();
        assert_eq!(value.get("a"), Some(Value::Int(7)));
        assert_eq!(value.get("b"), Some(Value::Bool(true)));
        assert_eq!(value.get("c"), None);
    }

    #[test]
    fn test_disallowed_global_is_rejected() {
        let mut p = vec![op::PROTO, 2, op::GLOBAL];
        p.extend_from_slice(b"os\nsystem\n");
        p.push(op::STOP);
        match load(&p) {
            Err(PickleError::UnsupportedGlobal { module, name }) => {
                assert_eq!(module, "os");
                assert_eq!(name, "system");
            }
            other => panic!("expected UnsupportedGlobal, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_opcode_reports_position() {
        let p = vec![op::PROTO, 2, 0xff];
        assert!(matches!(
            load(&p),
            Err(PickleError::UnknownOpcode { opcode: 0xff, pos: 2 })
        ));
    }

    #[test]
    fn test_truncated_stream() {
        let p = vec![op::PROTO, 2, op::BININT];
        assert!(matches!(load(&p), Err(PickleError::Eof)));
    }

    #[test]
    fn test_long1_sign_extension() {
        assert_eq!(decode_long(&[0xff]).unwrap(), -1);
        assert_eq!(decode_long(&[0x00, 0x01]).unwrap(), 256);
        assert_eq!(decode_long(&[]).unwrap(), 0);
    }

    fn empty_ordered_dict(out: &mut Vec<u8>) {
        out.push(op::GLOBAL);
        out.extend_from_slice(b"collections\nOrderedDict\n");
        out.extend_from_slice(&[op::EMPTY_TUPLE, op::REDUCE]);
    }

    /// A `[2, 3]` half tensor with column-major strides over storage "0".
    fn half_tensor(p: &mut Vec<u8>) {
        p.push(op::GLOBAL);
        p.extend_from_slice(b"torch._utils\n_rebuild_tensor_v2\n");
        p.push(op::MARK);
        p.push(op::MARK);
        short_str(p, "storage");
        p.push(op::GLOBAL);
        p.extend_from_slice(b"torch\nHalfStorage\n");
        short_str(p, "0");
        short_str(p, "cpu");
        p.extend_from_slice(&[op::BININT1, 6, op::TUPLE, op::BINPERSID]);
        p.extend_from_slice(&[op::BININT1, 0]);
        p.extend_from_slice(&[op::BININT1, 2, op::BININT1, 3, op::TUPLE2]);
        p.extend_from_slice(&[op::BININT1, 1, op::BININT1, 2, op::TUPLE2]);
        p.push(op::NEWFALSE);
        empty_ordered_dict(p);
        p.extend_from_slice(&[op::TUPLE, op::REDUCE]);
    }

    #[test]
    fn test_rebuild_tensor_from_persistent_storage() {
        let mut p = vec![op::PROTO, 2];
        half_tensor(&mut p);
        p.push(op::STOP);

        let Value::Tensor(t) = load(&p).unwrap() else {
            panic!("expected a tensor");
        };
        assert_eq!(t.storage.key, "0");
        assert_eq!(t.storage.dtype, Dtype::F16);
        assert_eq!(t.storage.numel, 6);
        assert_eq!(t.shape, vec![2, 3]);
        assert_eq!(t.strides, vec![1, 2]);
    }

    #[test]
    fn test_parameters_unwrap_to_their_tensor() {
        let mut plain = vec![op::PROTO, 2];
        half_tensor(&mut plain);
        plain.push(op::STOP);
        let expected = load(&plain).unwrap();

        for (name, with_state) in [("_rebuild_parameter", false), ("_rebuild_parameter_with_state", true)] {
            let mut p = vec![op::PROTO, 2, op::GLOBAL];
            p.extend_from_slice(format!("torch._utils\n{name}\n").as_bytes());
            p.push(op::MARK);
            half_tensor(&mut p);
            p.push(op::NEWTRUE);
            empty_ordered_dict(&mut p);
            if with_state {
                p.push(op::EMPTY_DICT);
            }
            p.extend_from_slice(&[op::TUPLE, op::REDUCE, op::STOP]);
            assert_eq!(load(&p).unwrap(), expected, "{name}");
        }
    }

    #[test]
    fn test_build_state_after_items_keeps_entries() {
        let mut p = vec![op::PROTO, 2];
        empty_ordered_dict(&mut p);
        p.extend_from_slice(&[op::BINPUT, 0, op::MARK]);
        short_str(&mut p, "w");
        p.extend_from_slice(&[op::BININT1, 1, op::SETITEMS]);
        p.push(op::EMPTY_DICT);
        short_str(&mut p, "_metadata");
        empty_ordered_dict(&mut p);
        p.extend_from_slice(&[op::SETITEM, op::BUILD, op::STOP]);

        let value = load(&p).unwrap();
        assert_eq!(value.get("w"), Some(Value::Int(1)));
        assert_eq!(value.get("_metadata"), None);
    }

    #[test]
    fn test_memoized_dict_sees_later_items() {
        let mut p = vec![op::PROTO, 2, op::EMPTY_DICT, op::BINPUT, 0, op::MARK];
        short_str(&mut p, "model");
        p.extend_from_slice(&[op::EMPTY_DICT, op::BINPUT, 1]);
        short_str(&mut p, "x");
        p.extend_from_slice(&[op::BININT1, 1, op::SETITEM]);
        short_str(&mut p, "state_dict");
        p.extend_from_slice(&[op::BINGET, 1, op::SETITEMS, op::STOP]);

        let root = load(&p).unwrap();
        let model = root.get("model").unwrap();
        let state_dict = root.get("state_dict").unwrap();
        assert_eq!(state_dict.get("x"), Some(Value::Int(1)));
        assert_eq!(model, state_dict);
    }

    #[test]
    fn test_memoized_list_sees_later_appends() {
        let mut p = vec![op::PROTO, 2, op::EMPTY_LIST, op::BINPUT, 0, op::MARK];
        p.extend_from_slice(&[op::BININT1, 4, op::BININT1, 5, op::APPENDS]);
        p.extend_from_slice(&[op::BINGET, 0, op::TUPLE2, op::STOP]);

        let Value::Tuple(items) = load(&p).unwrap() else {
            panic!("expected a tuple");
        };
        for item in &items {
            assert_eq!(item.as_usize_tuple().unwrap(), vec![4, 5]);
        }
    }

    #[test]
    fn test_self_referencing_list_is_not_a_key() {
        // l = []; l.append(l); {l: 1}
        let mut p = vec![op::PROTO, 2, op::EMPTY_DICT];
        p.extend_from_slice(&[op::EMPTY_LIST, op::BINPUT, 0, op::BINGET, 0, op::APPEND]);
        p.extend_from_slice(&[op::BININT1, 1, op::SETITEM, op::STOP]);
        match load(&p) {
            Err(PickleError::Invalid(msg)) => assert!(msg.contains("unhashable list"), "{msg}"),
            other => panic!("expected an unhashable key error, got {:?}", other.map(|v| v.kind())),
        }
    }

    #[test]
    fn test_memo_round_trip() {
        let mut p = vec![op::PROTO, 2];
        short_str(&mut p, "shared");
        p.extend_from_slice(&[op::BINPUT, 3, op::POP, op::BINGET, 3, op::STOP]);
        assert_eq!(load(&p).unwrap(), Value::Str("shared".into()));
    }
}
