//! Pyc container reader: header, marshal stream, code records.

use std::rc::Rc;

use bitflags::bitflags;
use byteorder::{ByteOrder, LittleEndian};

use crate::tables::Version;
use crate::DepycError;

pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    pub fn get_u8(&mut self) -> Result<u8, DepycError> {
        if self.remaining() < 1 {
            return Err(DepycError::Eof);
        }
        let v = self.buf[self.pos];
        self.pos += 1;
        Ok(v)
    }

    pub fn get_u16(&mut self) -> Result<u16, DepycError> {
        if self.remaining() < 2 {
            return Err(DepycError::Eof);
        }
        let v = LittleEndian::read_u16(&self.buf[self.pos..self.pos + 2]);
        self.pos += 2;
        Ok(v)
    }

    pub fn get_u32(&mut self) -> Result<u32, DepycError> {
        if self.remaining() < 4 {
            return Err(DepycError::Eof);
        }
        let v = LittleEndian::read_u32(&self.buf[self.pos..self.pos + 4]);
        self.pos += 4;
        Ok(v)
    }

    pub fn get_i32(&mut self) -> Result<i32, DepycError> {
        Ok(self.get_u32()? as i32)
    }

    pub fn get_i64(&mut self) -> Result<i64, DepycError> {
        if self.remaining() < 8 {
            return Err(DepycError::Eof);
        }
        let v = LittleEndian::read_i64(&self.buf[self.pos..self.pos + 8]);
        self.pos += 8;
        Ok(v)
    }

    pub fn get_f64(&mut self) -> Result<f64, DepycError> {
        if self.remaining() < 8 {
            return Err(DepycError::Eof);
        }
        let v = LittleEndian::read_f64(&self.buf[self.pos..self.pos + 8]);
        self.pos += 8;
        Ok(v)
    }

    pub fn get_bytes(&mut self, n: usize) -> Result<&'a [u8], DepycError> {
        if self.remaining() < n {
            return Err(DepycError::Eof);
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }
}

bitflags! {
    /// Code-record flags bitset.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CodeFlags: u32 {
        const OPTIMIZED = 0x1;
        const NEWLOCALS = 0x2;
        const VARARGS = 0x4;
        const VARKEYWORDS = 0x8;
        const NESTED = 0x10;
        const GENERATOR = 0x20;
        const NOFREE = 0x40;
        const COROUTINE = 0x80;
        const ITERABLE_COROUTINE = 0x100;
        const ASYNC_GENERATOR = 0x200;
    }
}

// 3.11+ localspluskinds bits.
const FAST_LOCAL: u8 = 0x20;
const FAST_CELL: u8 = 0x40;
const FAST_FREE: u8 = 0x80;

/// A constant from the pool.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    None,
    Ellipsis,
    StopIteration,
    Bool(bool),
    Int(i64),
    Long { negative: bool, decimal: String },
    Float(f64),
    Complex(f64, f64),
    Str(String),
    Unicode(String),
    Bytes(Vec<u8>),
    Tuple(Vec<Value>),
    List(Vec<Value>),
    Set(Vec<Value>),
    FrozenSet(Vec<Value>),
    Dict(Vec<(Value, Value)>),
    Code(Rc<CodeObject>),
}

impl Value {
    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) | Value::Unicode(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_code(&self) -> Option<&Rc<CodeObject>> {
        match self {
            Value::Code(c) => Some(c),
            _ => None,
        }
    }
}

/// One compiled scope: the runtime's representation of a module, function,
/// class body or comprehension. Immutable once read.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CodeObject {
    pub arg_count: u32,
    pub posonly_arg_count: u32,
    pub kwonly_arg_count: u32,
    pub num_locals: u32,
    pub stack_size: u32,
    pub flags: CodeFlags,
    pub code: Vec<u8>,
    pub consts: Vec<Value>,
    pub names: Vec<String>,
    pub var_names: Vec<String>,
    pub free_vars: Vec<String>,
    pub cell_vars: Vec<String>,
    /// 3.11+ frame slot names; empty for earlier versions.
    pub locals_plus: Vec<String>,
    pub file_name: String,
    pub name: String,
    pub qual_name: String,
    pub first_line: u32,
    pub line_table: Vec<u8>,
    pub exception_table: Vec<u8>,
}

impl CodeObject {
    pub fn get_const(&self, idx: u32) -> Option<&Value> {
        self.consts.get(idx as usize)
    }

    pub fn name_at(&self, idx: u32) -> Option<&str> {
        self.names.get(idx as usize).map(String::as_str)
    }

    /// Fast-local name. 3.11 indexes frame slots directly.
    pub fn local_at(&self, idx: u32) -> Option<&str> {
        if !self.locals_plus.is_empty() {
            self.locals_plus.get(idx as usize).map(String::as_str)
        } else {
            self.var_names.get(idx as usize).map(String::as_str)
        }
    }

    /// Cell/free name for the deref opcodes: cells first, then frees, except
    /// on 3.11+ where the operand indexes frame slots.
    pub fn deref_at(&self, idx: u32) -> Option<&str> {
        if !self.locals_plus.is_empty() {
            return self.locals_plus.get(idx as usize).map(String::as_str);
        }
        let idx = idx as usize;
        if idx < self.cell_vars.len() {
            self.cell_vars.get(idx).map(String::as_str)
        } else {
            self.free_vars.get(idx - self.cell_vars.len()).map(String::as_str)
        }
    }

    pub fn docstring(&self) -> Option<&Value> {
        match self.consts.first() {
            Some(v @ (Value::Str(_) | Value::Unicode(_))) => Some(v),
            _ => None,
        }
    }

    pub fn is_lambda(&self) -> bool {
        self.name == "<lambda>"
    }

    pub fn comprehension_kind(&self) -> Option<ComprehensionKind> {
        match self.name.as_str() {
            "<listcomp>" => Some(ComprehensionKind::List),
            "<setcomp>" => Some(ComprehensionKind::Set),
            "<dictcomp>" => Some(ComprehensionKind::Dict),
            "<genexpr>" => Some(ComprehensionKind::Generator),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComprehensionKind {
    List,
    Set,
    Dict,
    Generator,
}

/// A parsed pyc file: version triple plus the root code record.
#[derive(Debug, Clone)]
pub struct PycModule {
    pub version: Version,
    pub code: Rc<CodeObject>,
}

pub fn version_from_magic(magic: u32) -> Option<Version> {
    // The 1.0/1.1 magics predate the "\r\n" suffix convention.
    match magic {
        0x0099_9902 => return Some(Version::new(1, 0)),
        0x0099_9903 => return Some(Version::new(1, 1)),
        _ => {}
    }
    if magic >> 16 != 0x0A0D {
        return None;
    }
    let low = (magic & 0xFFFF) as u16;
    let v = match low {
        11913 => Version::new(1, 3),
        5892 => Version::new(1, 4),
        20121 => Version::new(1, 5),
        50428 => Version::new(1, 6),
        50823 => Version::new(2, 0),
        60202 => Version::new(2, 1),
        60717 => Version::new(2, 2),
        62011..=62021 => Version::new(2, 3),
        62041..=62061 => Version::new(2, 4),
        62071..=62131 => Version::new(2, 5),
        62151..=62161 => Version::new(2, 6),
        62171..=62211 => Version::new(2, 7),
        3000..=3131 => Version::new(3, 0),
        3141..=3151 => Version::new(3, 1),
        3160..=3180 => Version::new(3, 2),
        3190..=3230 => Version::new(3, 3),
        3250..=3310 => Version::new(3, 4),
        3320..=3351 => Version::new(3, 5),
        3360..=3379 => Version::new(3, 6),
        3390..=3399 => Version::new(3, 7),
        3400..=3419 => Version::new(3, 8),
        3420..=3429 => Version::new(3, 9),
        3430..=3449 => Version::new(3, 10),
        3450..=3499 => Version::new(3, 11),
        3500..=3549 => Version::new(3, 12),
        _ => return None,
    };
    Some(v)
}

/// Parse a whole `.pyc` file.
pub fn read_module(data: &[u8]) -> Result<PycModule, DepycError> {
    let mut r = Reader::new(data);
    let magic = r.get_u32()?;
    let version = version_from_magic(magic).ok_or(DepycError::BadMagic(magic))?;

    if version.at_least(3, 7) {
        let bits = r.get_u32()?;
        if bits & 0x1 != 0 {
            let _hash = r.get_bytes(8)?;
        } else {
            let _mtime = r.get_u32()?;
            let _size = r.get_u32()?;
        }
    } else if version.at_least(3, 3) {
        let _mtime = r.get_u32()?;
        let _size = r.get_u32()?;
    } else {
        let _mtime = r.get_u32()?;
    }

    let mut m = MarshalReader::new(r, version);
    let root = m.read_object()?;
    match root {
        Value::Code(code) => Ok(PycModule { version, code }),
        other => Err(DepycError::BadRoot(type_name(&other))),
    }
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::None => "None",
        Value::Ellipsis => "Ellipsis",
        Value::StopIteration => "StopIteration",
        Value::Bool(_) => "bool",
        Value::Int(_) | Value::Long { .. } => "int",
        Value::Float(_) => "float",
        Value::Complex(..) => "complex",
        Value::Str(_) | Value::Unicode(_) => "str",
        Value::Bytes(_) => "bytes",
        Value::Tuple(_) => "tuple",
        Value::List(_) => "list",
        Value::Set(_) => "set",
        Value::FrozenSet(_) => "frozenset",
        Value::Dict(_) => "dict",
        Value::Code(_) => "code",
    }
}

const FLAG_REF: u8 = 0x80;

pub struct MarshalReader<'a> {
    r: Reader<'a>,
    version: Version,
    refs: Vec<Value>,
    interned: Vec<String>,
}

impl<'a> MarshalReader<'a> {
    pub fn new(r: Reader<'a>, version: Version) -> Self {
        Self {
            r,
            version,
            refs: Vec::new(),
            interned: Vec::new(),
        }
    }

    pub fn read_object(&mut self) -> Result<Value, DepycError> {
        self.read_opt()?.ok_or(DepycError::UnexpectedNull)
    }

    /// `None` means the TYPE_NULL terminator (only legal inside dicts).
    fn read_opt(&mut self) -> Result<Option<Value>, DepycError> {
        let raw = self.r.get_u8()?;
        let flag_ref = self.version.at_least(3, 4) && (raw & FLAG_REF) != 0;
        let tag = raw & !FLAG_REF;

        // Reserve the back-reference slot before reading the payload, so
        // nested values keep their numbering aligned with the writer's.
        let ref_idx = if flag_ref {
            self.refs.push(Value::None);
            Some(self.refs.len() - 1)
        } else {
            None
        };

        let value = match tag {
            b'0' => return Ok(None),
            b'N' => Value::None,
            b'T' => Value::Bool(true),
            b'F' => Value::Bool(false),
            b'S' => Value::StopIteration,
            b'.' => Value::Ellipsis,
            b'i' => Value::Int(self.r.get_i32()? as i64),
            b'I' => Value::Int(self.r.get_i64()?),
            b'l' => self.read_long()?,
            b'f' => {
                let len = self.r.get_u8()? as usize;
                let text = String::from_utf8_lossy(self.r.get_bytes(len)?).into_owned();
                Value::Float(text.parse().unwrap_or(f64::NAN))
            }
            b'g' => Value::Float(self.r.get_f64()?),
            b'x' => {
                let re_len = self.r.get_u8()? as usize;
                let re: f64 = String::from_utf8_lossy(self.r.get_bytes(re_len)?)
                    .parse()
                    .unwrap_or(f64::NAN);
                let im_len = self.r.get_u8()? as usize;
                let im: f64 = String::from_utf8_lossy(self.r.get_bytes(im_len)?)
                    .parse()
                    .unwrap_or(f64::NAN);
                Value::Complex(re, im)
            }
            b'y' => Value::Complex(self.r.get_f64()?, self.r.get_f64()?),
            b's' => {
                let len = self.r.get_u32()? as usize;
                let bytes = self.r.get_bytes(len)?.to_vec();
                if self.version.major >= 3 {
                    Value::Bytes(bytes)
                } else {
                    match String::from_utf8(bytes) {
                        Ok(s) => Value::Str(s),
                        Err(e) => Value::Bytes(e.into_bytes()),
                    }
                }
            }
            b't' => {
                let len = self.r.get_u32()? as usize;
                let s = String::from_utf8_lossy(self.r.get_bytes(len)?).into_owned();
                self.interned.push(s.clone());
                Value::Str(s)
            }
            b'R' => {
                let idx = self.r.get_u32()? as usize;
                let s = self
                    .interned
                    .get(idx)
                    .ok_or(DepycError::BadRef(idx as u32))?;
                Value::Str(s.clone())
            }
            b'r' => {
                let idx = self.r.get_u32()?;
                self.refs
                    .get(idx as usize)
                    .cloned()
                    .ok_or(DepycError::BadRef(idx))?
            }
            b'u' => {
                let len = self.r.get_u32()? as usize;
                let s = String::from_utf8_lossy(self.r.get_bytes(len)?).into_owned();
                if self.version.major >= 3 {
                    Value::Str(s)
                } else {
                    Value::Unicode(s)
                }
            }
            b'a' | b'A' => {
                let len = self.r.get_u32()? as usize;
                Value::Str(String::from_utf8_lossy(self.r.get_bytes(len)?).into_owned())
            }
            b'z' | b'Z' => {
                let len = self.r.get_u8()? as usize;
                Value::Str(String::from_utf8_lossy(self.r.get_bytes(len)?).into_owned())
            }
            b'(' => {
                let n = self.r.get_u32()? as usize;
                Value::Tuple(self.read_seq(n)?)
            }
            b')' => {
                let n = self.r.get_u8()? as usize;
                Value::Tuple(self.read_seq(n)?)
            }
            b'[' => {
                let n = self.r.get_u32()? as usize;
                Value::List(self.read_seq(n)?)
            }
            b'<' => {
                let n = self.r.get_u32()? as usize;
                Value::Set(self.read_seq(n)?)
            }
            b'>' => {
                let n = self.r.get_u32()? as usize;
                Value::FrozenSet(self.read_seq(n)?)
            }
            b'{' => {
                let mut pairs = Vec::new();
                loop {
                    let key = match self.read_opt()? {
                        Some(k) => k,
                        None => break,
                    };
                    let value = self.read_object()?;
                    pairs.push((key, value));
                }
                Value::Dict(pairs)
            }
            b'c' => Value::Code(Rc::new(self.read_code()?)),
            other => return Err(DepycError::UnknownTypeCode(other)),
        };

        if let Some(idx) = ref_idx {
            self.refs[idx] = value.clone();
        }
        Ok(Some(value))
    }

    fn read_seq(&mut self, n: usize) -> Result<Vec<Value>, DepycError> {
        let mut out = Vec::with_capacity(n.min(4096));
        for _ in 0..n {
            out.push(self.read_object()?);
        }
        Ok(out)
    }

    fn read_long(&mut self) -> Result<Value, DepycError> {
        let count = self.r.get_i32()?;
        let negative = count < 0;
        let n = count.unsigned_abs() as usize;
        let mut digits = Vec::with_capacity(n.min(4096));
        for _ in 0..n {
            digits.push(self.r.get_u16()?);
        }
        Ok(Value::Long {
            negative,
            decimal: long_to_decimal(&digits),
        })
    }

    fn read_code(&mut self) -> Result<CodeObject, DepycError> {
        let v = self.version;
        let mut out = CodeObject::default();

        if v.at_least(2, 3) {
            out.arg_count = self.r.get_u32()?;
            if v.at_least(3, 8) {
                out.posonly_arg_count = self.r.get_u32()?;
            }
            if v.major >= 3 {
                out.kwonly_arg_count = self.r.get_u32()?;
            }
            if v.before(3, 11) {
                out.num_locals = self.r.get_u32()?;
            }
            out.stack_size = self.r.get_u32()?;
            out.flags = CodeFlags::from_bits_retain(self.r.get_u32()?);
        } else if v.at_least(1, 3) {
            out.arg_count = self.r.get_u16()? as u32;
            out.num_locals = self.r.get_u16()? as u32;
            if v.at_least(1, 5) {
                out.stack_size = self.r.get_u16()? as u32;
            }
            out.flags = CodeFlags::from_bits_retain(self.r.get_u16()? as u32);
        }

        out.code = self.read_byte_buffer()?;
        out.consts = self.read_value_tuple()?;
        out.names = self.read_str_tuple()?;
        if v.at_least(3, 11) {
            out.locals_plus = self.read_str_tuple()?;
            let kinds = self.read_byte_buffer()?;
            for (name, kind) in out.locals_plus.iter().zip(kinds.iter()) {
                if kind & FAST_LOCAL != 0 {
                    out.var_names.push(name.clone());
                }
                if kind & FAST_CELL != 0 {
                    out.cell_vars.push(name.clone());
                }
                if kind & FAST_FREE != 0 {
                    out.free_vars.push(name.clone());
                }
            }
        } else {
            if v.at_least(1, 3) {
                out.var_names = self.read_str_tuple()?;
            }
            if v.at_least(2, 1) {
                out.free_vars = self.read_str_tuple()?;
                out.cell_vars = self.read_str_tuple()?;
            }
        }
        out.file_name = self.read_str()?;
        out.name = self.read_str()?;
        if v.at_least(3, 11) {
            out.qual_name = self.read_str()?;
        } else {
            out.qual_name = out.name.clone();
        }
        if v.at_least(2, 3) {
            out.first_line = self.r.get_u32()?;
            out.line_table = self.read_byte_buffer()?;
        } else if v.at_least(1, 5) {
            out.first_line = self.r.get_u16()? as u32;
            out.line_table = self.read_byte_buffer()?;
        }
        if v.at_least(3, 11) {
            out.exception_table = self.read_byte_buffer()?;
        }
        Ok(out)
    }

    fn read_byte_buffer(&mut self) -> Result<Vec<u8>, DepycError> {
        match self.read_object()? {
            Value::Bytes(b) => Ok(b),
            Value::Str(s) => Ok(s.into_bytes()),
            other => Err(DepycError::BadRoot(type_name(&other))),
        }
    }

    fn read_str(&mut self) -> Result<String, DepycError> {
        match self.read_object()? {
            Value::Str(s) | Value::Unicode(s) => Ok(s),
            Value::Bytes(b) => Ok(String::from_utf8_lossy(&b).into_owned()),
            Value::None => Ok(String::new()),
            other => Err(DepycError::BadRoot(type_name(&other))),
        }
    }

    fn read_value_tuple(&mut self) -> Result<Vec<Value>, DepycError> {
        match self.read_object()? {
            Value::Tuple(v) | Value::List(v) => Ok(v),
            other => Err(DepycError::BadRoot(type_name(&other))),
        }
    }

    fn read_str_tuple(&mut self) -> Result<Vec<String>, DepycError> {
        let values = self.read_value_tuple()?;
        let mut out = Vec::with_capacity(values.len());
        for v in values {
            match v {
                Value::Str(s) | Value::Unicode(s) => out.push(s),
                Value::Bytes(b) => out.push(String::from_utf8_lossy(&b).into_owned()),
                other => return Err(DepycError::BadRoot(type_name(&other))),
            }
        }
        Ok(out)
    }
}

/// Convert marshal's 15-bit digit representation to a decimal string.
fn long_to_decimal(digits: &[u16]) -> String {
    // Accumulate in base 1e9 limbs, most significant digit first.
    let mut limbs: Vec<u64> = vec![0];
    for &d in digits.iter().rev() {
        let mut carry = d as u64 & 0x7FFF;
        for limb in limbs.iter_mut() {
            let v = *limb * 32768 + carry;
            *limb = v % 1_000_000_000;
            carry = v / 1_000_000_000;
        }
        while carry > 0 {
            limbs.push(carry % 1_000_000_000);
            carry /= 1_000_000_000;
        }
    }
    let mut out = String::new();
    for (i, limb) in limbs.iter().rev().enumerate() {
        if i == 0 {
            out.push_str(&limb.to_string());
        } else {
            out.push_str(&format!("{limb:09}"));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_one(version: Version, bytes: &[u8]) -> Value {
        let mut m = MarshalReader::new(Reader::new(bytes), version);
        m.read_object().unwrap()
    }

    #[test]
    fn singletons_and_ints() {
        let v38 = Version::new(3, 8);
        assert_eq!(read_one(v38, b"N"), Value::None);
        assert_eq!(read_one(v38, b"T"), Value::Bool(true));
        let mut buf = vec![b'i'];
        buf.extend_from_slice(&(-5i32).to_le_bytes());
        assert_eq!(read_one(v38, &buf), Value::Int(-5));
    }

    #[test]
    fn short_ascii_and_small_tuple() {
        let v38 = Version::new(3, 8);
        // ('hi', 1) as small tuple of short ascii + int32
        let mut buf = vec![b')', 2, b'z', 2, b'h', b'i', b'i'];
        buf.extend_from_slice(&1i32.to_le_bytes());
        assert_eq!(
            read_one(v38, &buf),
            Value::Tuple(vec![Value::Str("hi".into()), Value::Int(1)])
        );
    }

    #[test]
    fn py2_string_is_text() {
        let v27 = Version::new(2, 7);
        let mut buf = vec![b's'];
        buf.extend_from_slice(&3u32.to_le_bytes());
        buf.extend_from_slice(b"abc");
        assert_eq!(read_one(v27, &buf), Value::Str("abc".into()));
    }

    #[test]
    fn interned_backrefs() {
        let v27 = Version::new(2, 7);
        // ('x' interned, stringref 0)
        let mut buf = vec![b'(', 2, 0, 0, 0, b't'];
        buf.extend_from_slice(&1u32.to_le_bytes());
        buf.push(b'x');
        buf.push(b'R');
        buf.extend_from_slice(&0u32.to_le_bytes());
        assert_eq!(
            read_one(v27, &buf),
            Value::Tuple(vec![Value::Str("x".into()), Value::Str("x".into())])
        );
    }

    #[test]
    fn object_backrefs() {
        let v38 = Version::new(3, 8);
        // (X, ref 0) where X = 'ab' short ascii with the ref flag set
        let mut buf = vec![b'(', 2, 0, 0, 0, b'z' | 0x80, 2, b'a', b'b', b'r'];
        buf.extend_from_slice(&0u32.to_le_bytes());
        assert_eq!(
            read_one(v38, &buf),
            Value::Tuple(vec![Value::Str("ab".into()), Value::Str("ab".into())])
        );
    }

    #[test]
    fn long_decimal_conversion() {
        assert_eq!(long_to_decimal(&[]), "0");
        assert_eq!(long_to_decimal(&[1]), "1");
        // 2**15 = 32768 -> digits [0, 1]
        assert_eq!(long_to_decimal(&[0, 1]), "32768");
        // 123456789012345 = digits in base 2**15
        let n: u64 = 123_456_789_012_345;
        let digits = [
            (n & 0x7FFF) as u16,
            ((n >> 15) & 0x7FFF) as u16,
            ((n >> 30) & 0x7FFF) as u16,
            ((n >> 45) & 0x7FFF) as u16,
        ];
        assert_eq!(long_to_decimal(&digits), "123456789012345");
    }

    #[test]
    fn magic_table() {
        assert_eq!(version_from_magic(0x0A0D0D55), Some(Version::new(3, 8)));
        assert_eq!(version_from_magic(0x0A0DF303), Some(Version::new(2, 7)));
        assert_eq!(version_from_magic(0x0A0D0DCB), Some(Version::new(3, 12)));
        assert_eq!(version_from_magic(0xDEADBEEF), None);
    }

    #[test]
    fn dict_reads_until_null() {
        let v27 = Version::new(2, 7);
        let mut buf = vec![b'{', b'z', 1, b'k', b'i'];
        buf.extend_from_slice(&7i32.to_le_bytes());
        buf.push(b'0');
        assert_eq!(
            read_one(v27, &buf),
            Value::Dict(vec![(Value::Str("k".into()), Value::Int(7))])
        );
    }
}
