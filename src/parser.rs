use anyhow::Result;
use fxhash::FxHashMap;
use log::{debug, warn};
use wasmparser::{
    ConstExpr, DataKind, ElementItems, ElementKind, Encoding, ExternalKind, KnownCustom, Name,
    NameSectionReader, Operator, Parser, Payload::*, TableInit, TypeRef, ValType,
};

use crate::error::TranslateError;
use crate::wasm::{
    Body, DataSegment, Export, ExportKind, FuncDesc, FuncKind, FuncType, Global, Instr, Memory,
    Module, Signatures, Table, ValKind, Value, PAGE_SIZE,
};

type DecodeResult<T> = std::result::Result<T, TranslateError>;

const MAX_LOCALS: usize = 50_000;
const MAX_TABLE_SIZE: u32 = 10_000_000;

/// Decodes a binary module into the translator's data model.
///
/// Only structural well-formedness is checked here; stack discipline of the
/// function bodies is left to the translator.
pub fn parse(buf: &[u8]) -> Result<Module<'_>> {
    Ok(Decoder::default().decode(buf)?)
}

struct PendingElement {
    offset: usize,
    table: u32,
    start: u32,
    funcs: Vec<Option<u32>>,
}

struct PendingData {
    offset: usize,
    start: u32,
    bytes: Vec<u8>,
}

#[derive(Default)]
struct Decoder<'a> {
    module: Module<'a>,
    /// Byte offset of each import and function declaration, by function index.
    func_offsets: Vec<usize>,
    declared: Vec<u32>,
    bodies: Vec<Body<'a>>,
    exports: Vec<(usize, Export)>,
    elements: Vec<PendingElement>,
    data: Vec<PendingData>,
    start: Option<(usize, u32)>,
    names: FxHashMap<u32, String>,
}

impl<'a> Decoder<'a> {
    fn decode(mut self, buf: &'a [u8]) -> DecodeResult<Module<'a>> {
        for payload in Parser::new(0).parse_all(buf) {
            match payload? {
                Version {
                    encoding, range, ..
                } => {
                    if encoding != Encoding::Module {
                        return Err(TranslateError::unsupported(range.start, "components"));
                    }
                }
                TypeSection(types) => {
                    let offset = types.range().start;
                    for ty in types.into_iter_err_on_gc_types() {
                        let ty = ty?;
                        self.module.types.push(FuncType {
                            params: val_kinds(ty.params(), offset)?,
                            results: val_kinds(ty.results(), offset)?,
                        });
                    }
                }
                ImportSection(imports) => {
                    for import in imports.into_iter_with_offsets() {
                        let (offset, import) = import?;
                        let TypeRef::Func(type_index) = import.ty else {
                            return Err(TranslateError::unsupported(
                                offset,
                                format!(
                                    "non-function import {}.{} ({:?})",
                                    import.module, import.name, import.ty
                                ),
                            ));
                        };
                        self.module.funcs.push(FuncDesc {
                            index: self.module.funcs.len() as u32,
                            type_index,
                            name: None,
                            kind: FuncKind::Import {
                                module: import.module.to_string(),
                                name: import.name.to_string(),
                            },
                        });
                        self.module.import_count += 1;
                        self.func_offsets.push(offset);
                    }
                }
                FunctionSection(funcs) => {
                    for func in funcs.into_iter_with_offsets() {
                        let (offset, type_index) = func?;
                        self.declared.push(type_index);
                        self.func_offsets.push(offset);
                    }
                }
                TableSection(tables) => {
                    for table in tables.into_iter_with_offsets() {
                        let (offset, table) = table?;
                        if !table.ty.element_type.is_func_ref() {
                            return Err(TranslateError::unsupported(
                                offset,
                                "tables of non-function references",
                            ));
                        }
                        if !matches!(table.init, TableInit::RefNull) {
                            return Err(TranslateError::unsupported(
                                offset,
                                "table initializer expressions",
                            ));
                        }
                        let min = u32::try_from(table.ty.initial)
                            .ok()
                            .filter(|min| *min <= MAX_TABLE_SIZE)
                            .ok_or_else(|| {
                                TranslateError::unsupported(offset, "table larger than 10M slots")
                            })?;
                        let max = table
                            .ty
                            .maximum
                            .map(|max| u32::try_from(max).unwrap_or(u32::MAX));
                        self.module.tables.push(Table {
                            min,
                            max,
                            entries: vec![None; min as usize],
                        });
                    }
                }
                MemorySection(memories) => {
                    for memory in memories.into_iter_with_offsets() {
                        let (offset, memory) = memory?;
                        if self.module.memory.is_some() {
                            return Err(TranslateError::unsupported(offset, "multiple memories"));
                        }
                        if memory.memory64 {
                            return Err(TranslateError::unsupported(offset, "64-bit memory"));
                        }
                        if memory.shared {
                            return Err(TranslateError::unsupported(offset, "shared memory"));
                        }
                        let min_pages = u32::try_from(memory.initial)
                            .map_err(|_| TranslateError::malformed(offset, "memory too large"))?;
                        let max_pages = memory
                            .maximum
                            .map(|max| u32::try_from(max).unwrap_or(u32::MAX));
                        self.module.memory = Some(Memory {
                            min_pages,
                            max_pages,
                        });
                    }
                }
                GlobalSection(globals) => {
                    for global in globals.into_iter_with_offsets() {
                        let (offset, global) = global?;
                        let kind = val_kind(global.ty.content_type, offset)?;
                        let init = const_value(&global.init_expr)?;
                        if init.kind() != kind {
                            return Err(TranslateError::malformed(
                                offset,
                                format!(
                                    "global of kind {kind} initialized with {}",
                                    init.kind()
                                ),
                            ));
                        }
                        self.module.globals.push(Global {
                            kind,
                            mutable: global.ty.mutable,
                            init,
                        });
                    }
                }
                ExportSection(exports) => {
                    for export in exports.into_iter_with_offsets() {
                        let (offset, export) = export?;
                        let kind = match export.kind {
                            ExternalKind::Func => ExportKind::Func,
                            ExternalKind::Table => ExportKind::Table,
                            ExternalKind::Memory => ExportKind::Memory,
                            ExternalKind::Global => ExportKind::Global,
                            ExternalKind::Tag => {
                                return Err(TranslateError::unsupported(offset, "tag exports"))
                            }
                        };
                        self.exports.push((
                            offset,
                            Export {
                                name: export.name.to_string(),
                                kind,
                                index: export.index,
                            },
                        ));
                    }
                }
                StartSection { func, range } => self.start = Some((range.start, func)),
                ElementSection(elements) => {
                    for element in elements.into_iter_with_offsets() {
                        let (offset, element) = element?;
                        let ElementKind::Active {
                            table_index,
                            offset_expr,
                        } = element.kind
                        else {
                            debug!("skipping passive or declared element segment at {offset:#x}");
                            continue;
                        };
                        let start = const_address(&offset_expr)?;
                        let funcs = match element.items {
                            ElementItems::Functions(funcs) => funcs
                                .into_iter()
                                .map(|func| func.map(Some))
                                .collect::<std::result::Result<Vec<_>, _>>()?,
                            ElementItems::Expressions(_, exprs) => {
                                let mut funcs = Vec::new();
                                for expr in exprs {
                                    funcs.push(const_func_ref(&expr?)?);
                                }
                                funcs
                            }
                        };
                        self.elements.push(PendingElement {
                            offset,
                            table: table_index.unwrap_or(0),
                            start,
                            funcs,
                        });
                    }
                }
                DataSection(data) => {
                    for segment in data.into_iter_with_offsets() {
                        let (offset, segment) = segment?;
                        match segment.kind {
                            DataKind::Active {
                                memory_index,
                                offset_expr,
                            } => {
                                if memory_index != 0 {
                                    return Err(TranslateError::malformed(
                                        offset,
                                        format!("data segment targets memory {memory_index}"),
                                    ));
                                }
                                self.data.push(PendingData {
                                    offset,
                                    start: const_address(&offset_expr)?,
                                    bytes: segment.data.to_vec(),
                                });
                            }
                            DataKind::Passive => {
                                return Err(TranslateError::unsupported(
                                    offset,
                                    "passive data segments",
                                ))
                            }
                        }
                    }
                }
                CodeSectionStart { count, range, .. } => {
                    if count as usize != self.declared.len() {
                        return Err(TranslateError::malformed(
                            range.start,
                            format!(
                                "code section has {count} entries but {} functions are declared",
                                self.declared.len()
                            ),
                        ));
                    }
                }
                CodeSectionEntry(body) => {
                    let offset = body.range().start;
                    let mut locals = Vec::new();
                    let mut reader = body.get_locals_reader()?;
                    for _ in 0..reader.get_count() {
                        let position = reader.original_position();
                        let (count, ty) = reader.read()?;
                        let kind = val_kind(ty, position)?;
                        if locals.len() + count as usize > MAX_LOCALS {
                            return Err(TranslateError::malformed(position, "too many locals"));
                        }
                        locals.extend(std::iter::repeat(kind).take(count as usize));
                    }
                    let mut reader = body.get_operators_reader()?;
                    let mut instrs = Vec::new();
                    while !reader.eof() {
                        let (op, offset) = reader.read_with_offset()?;
                        instrs.push(Instr { op, offset });
                    }
                    self.bodies.push(Body {
                        locals,
                        instrs,
                        offset,
                    });
                }
                CustomSection(reader) => {
                    if let KnownCustom::Name(names) = reader.as_known() {
                        self.read_names(names);
                    }
                }
                TagSection(tags) => {
                    return Err(TranslateError::unsupported(
                        tags.range().start,
                        "exception tags",
                    ))
                }
                UnknownSection { id, range, .. } => {
                    return Err(TranslateError::malformed(
                        range.start,
                        format!("unknown section id {id}"),
                    ))
                }
                End(offset) => return self.finish(offset),
                _ => {}
            }
        }
        Err(TranslateError::malformed(buf.len(), "unexpected end of module"))
    }

    fn read_names(&mut self, names: NameSectionReader<'_>) {
        for subsection in names {
            match subsection {
                Ok(Name::Function(map)) => {
                    for naming in map {
                        match naming {
                            Ok(naming) => {
                                self.names.insert(naming.index, naming.name.to_string());
                            }
                            Err(error) => {
                                warn!("ignoring malformed function name: {error}");
                                return;
                            }
                        }
                    }
                }
                Ok(_) => {}
                Err(error) => {
                    warn!("ignoring malformed name section: {error}");
                    return;
                }
            }
        }
    }

    fn finish(mut self, end: usize) -> DecodeResult<Module<'a>> {
        if self.declared.len() != self.bodies.len() {
            return Err(TranslateError::malformed(
                end,
                format!(
                    "{} functions declared but {} bodies present",
                    self.declared.len(),
                    self.bodies.len()
                ),
            ));
        }
        let declared = std::mem::take(&mut self.declared);
        let bodies = std::mem::take(&mut self.bodies);
        for (type_index, body) in declared.into_iter().zip(bodies) {
            self.module.funcs.push(FuncDesc {
                index: self.module.funcs.len() as u32,
                type_index,
                name: None,
                kind: FuncKind::Defined(body),
            });
        }
        let type_count = self.module.types.len();
        for (func, offset) in self.module.funcs.iter_mut().zip(&self.func_offsets) {
            if func.type_index as usize >= type_count {
                return Err(TranslateError::malformed(
                    *offset,
                    format!("type index {} out of bounds", func.type_index),
                ));
            }
            func.name = self.names.remove(&func.index);
        }
        self.module.signatures = Signatures::new(&self.module.types);

        for (offset, export) in std::mem::take(&mut self.exports) {
            let count = match export.kind {
                ExportKind::Func => self.module.funcs.len(),
                ExportKind::Table => self.module.tables.len(),
                ExportKind::Memory => self.module.memory.iter().len(),
                ExportKind::Global => self.module.globals.len(),
            };
            if export.index as usize >= count {
                return Err(TranslateError::malformed(
                    offset,
                    format!("export {:?} refers to missing {:?}", export.name, export.kind),
                ));
            }
            self.module.exports.push(export);
        }

        if let Some((offset, func)) = self.start {
            let ty = self
                .module
                .funcs
                .get(func as usize)
                .map(|func| &self.module.types[func.type_index as usize])
                .ok_or_else(|| {
                    TranslateError::malformed(offset, format!("start function {func} out of bounds"))
                })?;
            if !ty.params.is_empty() || !ty.results.is_empty() {
                return Err(TranslateError::malformed(
                    offset,
                    format!("start function has type {ty}"),
                ));
            }
            self.module.start = Some(func);
        }

        for element in std::mem::take(&mut self.elements) {
            self.apply_element(element)?;
        }
        for data in std::mem::take(&mut self.data) {
            self.apply_data(data)?;
        }
        Ok(self.module)
    }

    fn apply_element(&mut self, element: PendingElement) -> DecodeResult<()> {
        let func_count = self.module.funcs.len();
        let table = self
            .module
            .tables
            .get_mut(element.table as usize)
            .ok_or_else(|| {
                TranslateError::malformed(
                    element.offset,
                    format!("element segment targets missing table {}", element.table),
                )
            })?;
        let start = element.start as usize;
        let end = start + element.funcs.len();
        if end > table.entries.len() {
            return Err(TranslateError::malformed(
                element.offset,
                format!(
                    "element segment [{start}, {end}) does not fit table of {} slots",
                    table.entries.len()
                ),
            ));
        }
        for (slot, func) in table.entries[start..end].iter_mut().zip(element.funcs) {
            if let Some(func) = func {
                if func as usize >= func_count {
                    return Err(TranslateError::malformed(
                        element.offset,
                        format!("element segment refers to missing function {func}"),
                    ));
                }
            }
            *slot = func;
        }
        Ok(())
    }

    fn apply_data(&mut self, data: PendingData) -> DecodeResult<()> {
        let memory = self.module.memory.ok_or_else(|| {
            TranslateError::malformed(data.offset, "data segment without a memory")
        })?;
        let end = data.start as u64 + data.bytes.len() as u64;
        if end > memory.min_pages as u64 * PAGE_SIZE {
            return Err(TranslateError::malformed(
                data.offset,
                format!("data segment ends at {end:#x}, past the initial memory size"),
            ));
        }
        self.module.data.push(DataSegment {
            offset: data.start,
            bytes: data.bytes,
        });
        Ok(())
    }
}

fn val_kind(ty: ValType, offset: usize) -> DecodeResult<ValKind> {
    match ty {
        ValType::I32 => Ok(ValKind::I32),
        ValType::I64 => Ok(ValKind::I64),
        ValType::F32 => Ok(ValKind::F32),
        ValType::F64 => Ok(ValKind::F64),
        ValType::V128 => Err(TranslateError::unsupported(offset, "simd values")),
        ValType::Ref(_) => Err(TranslateError::unsupported(offset, "reference values")),
    }
}

pub(crate) fn val_kinds(types: &[ValType], offset: usize) -> DecodeResult<Vec<ValKind>> {
    types.iter().map(|ty| val_kind(*ty, offset)).collect()
}

fn const_value(expr: &ConstExpr<'_>) -> DecodeResult<Value> {
    let mut reader = expr.get_operators_reader();
    let (op, offset) = reader.read_with_offset()?;
    let value = match op {
        Operator::I32Const { value } => Value::I32(value),
        Operator::I64Const { value } => Value::I64(value),
        Operator::F32Const { value } => Value::F32(f32::from_bits(value.bits())),
        Operator::F64Const { value } => Value::F64(f64::from_bits(value.bits())),
        Operator::GlobalGet { .. } => {
            return Err(TranslateError::unsupported(
                offset,
                "global.get in constant expression",
            ))
        }
        other => {
            return Err(TranslateError::unsupported(
                offset,
                format!("{other:?} in constant expression"),
            ))
        }
    };
    match reader.read_with_offset()? {
        (Operator::End, _) => Ok(value),
        (_, offset) => Err(TranslateError::unsupported(
            offset,
            "extended constant expression",
        )),
    }
}

fn const_address(expr: &ConstExpr<'_>) -> DecodeResult<u32> {
    match const_value(expr)? {
        Value::I32(value) => Ok(value as u32),
        other => Err(TranslateError::malformed(
            expr.get_binary_reader().original_position(),
            format!("segment offset of kind {}", other.kind()),
        )),
    }
}

fn const_func_ref(expr: &ConstExpr<'_>) -> DecodeResult<Option<u32>> {
    let mut reader = expr.get_operators_reader();
    let (op, offset) = reader.read_with_offset()?;
    match op {
        Operator::RefFunc { function_index } => Ok(Some(function_index)),
        Operator::RefNull { .. } => Ok(None),
        other => Err(TranslateError::unsupported(
            offset,
            format!("{other:?} in element expression"),
        )),
    }
}
