use std::fmt;

use anyhow::{Context as _, Result};
use fxhash::FxHashMap;
use wasmparser::Operator;

use crate::error::TranslateError;

/// The four numeric value kinds a module can compute with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ValKind {
    I32,
    I64,
    F32,
    F64,
}

impl fmt::Display for ValKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ValKind::I32 => "i32",
            ValKind::I64 => "i64",
            ValKind::F32 => "f32",
            ValKind::F64 => "f64",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
}

impl Value {
    pub fn kind(&self) -> ValKind {
        match self {
            Value::I32(_) => ValKind::I32,
            Value::I64(_) => ValKind::I64,
            Value::F32(_) => ValKind::F32,
            Value::F64(_) => ValKind::F64,
        }
    }

    pub fn to_u64(&self) -> u64 {
        match self {
            Value::I32(v) => *v as u32 as u64,
            Value::I64(v) => *v as u64,
            Value::F32(v) => f32::to_bits(*v) as u64,
            Value::F64(v) => f64::to_bits(*v),
        }
    }

    pub fn from_u64(bits: u64, kind: ValKind) -> Value {
        match kind {
            ValKind::I32 => Value::I32(bits as i32),
            ValKind::I64 => Value::I64(bits as i64),
            ValKind::F32 => Value::F32(f32::from_bits(bits as u32)),
            ValKind::F64 => Value::F64(f64::from_bits(bits)),
        }
    }

    pub fn zero(kind: ValKind) -> Value {
        Value::from_u64(0, kind)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct FuncType {
    pub params: Vec<ValKind>,
    pub results: Vec<ValKind>,
}

impl fmt::Display for FuncType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |kinds: &[ValKind]| {
            kinds
                .iter()
                .map(ValKind::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        };
        write!(f, "({}) -> ({})", join(&self.params), join(&self.results))
    }
}

/// Declared signatures folded into a table of structurally distinct ones.
#[derive(Debug, Clone, Default)]
pub struct Signatures {
    unique: Vec<FuncType>,
    canonical: Vec<u32>,
}

impl Signatures {
    pub fn new(declared: &[FuncType]) -> Signatures {
        let mut seen: FxHashMap<&FuncType, u32> = FxHashMap::default();
        let mut signatures = Signatures::default();
        for ty in declared {
            let index = *seen.entry(ty).or_insert_with(|| {
                signatures.unique.push(ty.clone());
                signatures.unique.len() as u32 - 1
            });
            signatures.canonical.push(index);
        }
        signatures
    }

    /// The deduplicated signatures, in order of first declaration.
    pub fn unique(&self) -> &[FuncType] {
        &self.unique
    }

    /// Maps a declared type index to its canonical signature index.
    pub fn canonical(&self, type_index: u32) -> Option<u32> {
        self.canonical.get(type_index as usize).copied()
    }
}

/// One decoded instruction and the byte offset it was read from.
#[derive(Debug, Clone)]
pub struct Instr<'a> {
    pub op: Operator<'a>,
    pub offset: usize,
}

#[derive(Debug, Clone, Default)]
pub struct Body<'a> {
    /// Declared locals, excluding parameters, one entry per local.
    pub locals: Vec<ValKind>,
    pub instrs: Vec<Instr<'a>>,
    pub offset: usize,
}

#[derive(Debug, Clone)]
pub enum FuncKind<'a> {
    Import { module: String, name: String },
    Defined(Body<'a>),
}

/// An entry of the function index space.
///
/// Imports occupy the first indices, defined functions follow in declaration
/// order; `index` always equals the entry's position in [`Module::funcs`].
#[derive(Debug, Clone)]
pub struct FuncDesc<'a> {
    pub index: u32,
    pub type_index: u32,
    pub name: Option<String>,
    pub kind: FuncKind<'a>,
}

impl<'a> FuncDesc<'a> {
    pub fn is_import(&self) -> bool {
        matches!(self.kind, FuncKind::Import { .. })
    }

    pub fn body(&self) -> Option<&Body<'a>> {
        match &self.kind {
            FuncKind::Defined(body) => Some(body),
            FuncKind::Import { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Global {
    pub kind: ValKind,
    pub mutable: bool,
    pub init: Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Table {
    pub min: u32,
    pub max: Option<u32>,
    /// Slots filled from active element segments; `None` is a null slot.
    pub entries: Vec<Option<u32>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Memory {
    pub min_pages: u32,
    pub max_pages: Option<u32>,
}

pub const PAGE_SIZE: u64 = 65536;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataSegment {
    pub offset: u32,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportKind {
    Func,
    Table,
    Memory,
    Global,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Export {
    pub name: String,
    pub kind: ExportKind,
    pub index: u32,
}

#[derive(Debug, Clone, Default)]
pub struct Module<'a> {
    pub types: Vec<FuncType>,
    pub signatures: Signatures,
    pub funcs: Vec<FuncDesc<'a>>,
    pub import_count: u32,
    pub globals: Vec<Global>,
    pub tables: Vec<Table>,
    pub memory: Option<Memory>,
    pub exports: Vec<Export>,
    pub data: Vec<DataSegment>,
    pub start: Option<u32>,
}

impl<'a> Module<'a> {
    pub fn func(&self, index: u32) -> Result<&FuncDesc<'a>> {
        self.funcs.get(index as usize).with_context(|| {
            TranslateError::malformed(0, format!("function index {index} out of bounds"))
        })
    }

    pub fn type_at(&self, type_index: u32) -> Result<&FuncType> {
        self.types.get(type_index as usize).with_context(|| {
            TranslateError::malformed(0, format!("type index {type_index} out of bounds"))
        })
    }

    pub fn func_type(&self, index: u32) -> Result<&FuncType> {
        let func = self.func(index)?;
        self.type_at(func.type_index)
    }

    /// Canonical signature index of a function.
    pub fn func_signature(&self, index: u32) -> Result<u32> {
        let func = self.func(index)?;
        self.signatures.canonical(func.type_index).with_context(|| {
            TranslateError::malformed(0, format!("type index {} out of bounds", func.type_index))
        })
    }

    pub fn imported_funcs(&self) -> impl Iterator<Item = &FuncDesc<'a>> {
        self.funcs[..self.import_count as usize].iter()
    }

    pub fn defined_funcs(&self) -> &[FuncDesc<'a>] {
        &self.funcs[self.import_count as usize..]
    }

    pub fn export(&self, name: &str) -> Option<&Export> {
        self.exports.iter().find(|export| export.name == name)
    }
}
