//! Renders translated functions and module metadata as C# source units.

#[macro_use]
pub(crate) mod writer;
pub mod runtime;

use anyhow::Result;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use fxhash::FxHashSet;
use log::debug;

use crate::ir::{self, Expr, Jump, Stmt, Target};
use crate::mapper::{cs_type, literal};
use crate::shim::{parameters, qualified_name, return_type, ResolvedImport};
use crate::translator::translate_function;
use crate::wasm::{ExportKind, FuncDesc, FuncKind, Module};

use self::writer::Writer;

const HEADER: &str = "// Code generated by wasm2cs. DO NOT EDIT.";

/// Types and members the generated units refer to by simple name.
const RESERVED: &[&str] = &[
    "Inst", "IImport", "Import", "Initialize", "Mem", "TrapException", "Numerics", "IHost",
    "ValueTable", "Math", "MathF", "BitConverter", "BitOperations", "Convert", "Console",
    "System", "Type",
];

pub(crate) const KEYWORDS: &[&str] = &[
    "abstract", "as", "base", "bool", "break", "byte", "case", "catch", "char", "checked",
    "class", "const", "continue", "decimal", "default", "delegate", "do", "double", "else",
    "enum", "event", "explicit", "extern", "false", "finally", "fixed", "float", "for",
    "foreach", "goto", "if", "implicit", "in", "int", "interface", "internal", "is", "lock",
    "long", "namespace", "new", "null", "object", "operator", "out", "override", "params",
    "private", "protected", "public", "readonly", "ref", "return", "sbyte", "sealed", "short",
    "sizeof", "stackalloc", "static", "string", "struct", "switch", "this", "throw", "true",
    "try", "typeof", "uint", "ulong", "unchecked", "unsafe", "ushort", "using", "virtual",
    "void", "volatile", "while",
];

/// Turns an arbitrary export or import name into a C# identifier.
///
/// Names ending in `_` are reserved for generated members, so such names get
/// an `export` suffix.
pub fn identifier(name: &str) -> String {
    let mut ident: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if ident.is_empty() || ident.starts_with(|c: char| c.is_ascii_digit()) {
        ident.insert(0, '_');
    }
    if ident.ends_with('_') {
        ident.push_str("export");
    }
    if KEYWORDS.contains(&ident.as_str()) {
        ident.insert(0, '@');
    }
    ident
}

#[derive(Debug, Default)]
struct Namer {
    used: FxHashSet<String>,
}

impl Namer {
    fn reserve(&mut self, name: String) {
        self.used.insert(name);
    }

    fn unique(&mut self, name: &str) -> String {
        let base = identifier(name);
        if self.used.insert(base.clone()) {
            return base;
        }
        let mut n = 2;
        loop {
            let candidate = format!("{base}{n}");
            if self.used.insert(candidate.clone()) {
                return candidate;
            }
            n += 1;
        }
    }
}

/// C# identifiers of exports and imported functions, fixed for one module.
#[derive(Debug)]
pub struct Names {
    exports: Vec<String>,
    imports: Vec<String>,
}

impl Names {
    pub fn new(module: &Module<'_>) -> Names {
        let mut members = Namer::default();
        for name in RESERVED {
            members.reserve(name.to_string());
        }
        for index in 0..module.signatures.unique().len() {
            members.reserve(format!("Type{index}"));
            members.reserve(format!("indirect_Type{index}"));
        }
        let exports = module
            .exports
            .iter()
            .map(|export| members.unique(&export.name))
            .collect();

        let mut methods = Namer::default();
        for name in RESERVED {
            methods.reserve(name.to_string());
        }
        let imports = module
            .imported_funcs()
            .map(|func| match &func.kind {
                FuncKind::Import { module, name } => methods.unique(&qualified_name(module, name)),
                FuncKind::Defined(_) => methods.unique(&format!("f{}", func.index)),
            })
            .collect();
        Names { exports, imports }
    }

    /// Identifier of the export at `position` in the export section.
    pub fn export(&self, position: usize) -> &str {
        &self.exports[position]
    }

    pub fn import(&self, func: u32) -> Option<&str> {
        self.imports.get(func as usize).map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnitKind {
    /// Function bodies of one group.
    Functions(usize),
    Exports,
    Bootstrap,
    Memory,
    Imports,
}

impl UnitKind {
    pub fn file_name(self) -> String {
        match self {
            UnitKind::Functions(group) => format!("Inst.Funcs{group}.cs"),
            UnitKind::Exports => "Inst.Exports.cs".to_string(),
            UnitKind::Bootstrap => "Inst.Init.cs".to_string(),
            UnitKind::Memory => "Mem.cs".to_string(),
            UnitKind::Imports => "Import.cs".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unit {
    pub kind: UnitKind,
    pub contents: String,
}

impl Unit {
    pub fn file_name(&self) -> String {
        self.kind.file_name()
    }
}

pub struct Emitter<'m, 'a> {
    module: &'m Module<'a>,
    namespace: String,
    names: Names,
    imports: Vec<ResolvedImport>,
}

impl<'m, 'a> Emitter<'m, 'a> {
    pub fn new(module: &'m Module<'a>, namespace: &str, imports: Vec<ResolvedImport>) -> Self {
        Emitter {
            module,
            namespace: namespace.to_string(),
            names: Names::new(module),
            imports,
        }
    }

    fn begin(&self, w: &mut Writer, usings: &[&str]) {
        code! { w; "{HEADER}"; "" };
        if !usings.is_empty() {
            for using in usings {
                code! { w; "using {using};" };
            }
            w.blank();
        }
        w.open(format!("namespace {}", self.namespace));
    }

    fn unit(&self, kind: UnitKind, mut w: Writer) -> Unit {
        w.close();
        let contents = w.finish();
        debug!("rendered {} ({} bytes)", kind.file_name(), contents.len());
        Unit { kind, contents }
    }

    /// Translates and renders one group of defined functions.
    pub fn functions_unit(&self, group: usize, funcs: &[FuncDesc<'a>]) -> Result<Unit> {
        let mut w = Writer::new();
        code! { w;
            "{HEADER}";
            "";
            "#pragma warning disable 162 // unreachable code";
            "#pragma warning disable 164 // unreferenced label";
            "#pragma warning disable 219 // unused local variables";
        };
        w.blank();
        code! { w; "using System;"; "using System.Numerics;" };
        w.blank();
        w.open(format!("namespace {}", self.namespace));
        w.open("sealed partial class Inst");
        for (i, desc) in funcs.iter().enumerate() {
            let func = translate_function(self.module, desc.index)?;
            if i > 0 {
                w.blank();
            }
            self.render_function(&func, &mut w);
        }
        w.close();
        Ok(self.unit(UnitKind::Functions(group), w))
    }

    fn render_function(&self, func: &ir::Function, w: &mut Writer) {
        if let Some(name) = &func.name {
            code! { w; "// {}", name.replace(['\r', '\n'], " ") };
        }
        w.open(format!(
            "private {} f{}_({})",
            func.results.first().map_or("void", |kind| cs_type(*kind)),
            func.index,
            parameters(&func.params)
        ));
        let first = func.params.len();
        for (i, kind) in func.locals.iter().enumerate() {
            code! { w; "{} local{} = 0;", cs_type(*kind), first + i };
        }
        for slot in &func.slots {
            code! { w; "{} {slot} = 0;", cs_type(slot.kind) };
        }
        self.render_block(&func.body, w);
        w.close();
    }

    fn render_block(&self, stmts: &[Stmt], w: &mut Writer) {
        for stmt in stmts {
            self.render_stmt(stmt, w);
        }
    }

    fn render_stmt(&self, stmt: &Stmt, w: &mut Writer) {
        match stmt {
            Stmt::Assign(slot, expr) => code! { w; "{slot} = {};", self.expr(expr) },
            Stmt::Effect(expr) => code! { w; "{};", self.expr(expr) },
            Stmt::SetLocal(index, slot) => code! { w; "local{index} = {slot};" },
            Stmt::SetGlobal(index, slot) => code! { w; "global{index}_ = {slot};" },
            Stmt::Store {
                op,
                addr,
                offset,
                value,
            } => code! { w;
                "{};", op.render("mem_", &addr.to_string(), *offset, &value.to_string())
            },
            Stmt::MemoryCopy { dst, src, len } => code! { w; "mem_.Copy({dst}, {src}, {len});" },
            Stmt::MemoryFill { dst, value, len } => {
                code! { w; "mem_.Fill({dst}, {value}, {len});" }
            }
            Stmt::Block { label, body } => {
                self.render_block(body, w);
                if let Some(label) = label {
                    code! { w; "b{}: ;", label.0 };
                }
            }
            Stmt::Loop { label, body } => {
                if let Some(label) = label {
                    code! { w; "l{}: ;", label.0 };
                }
                self.render_block(body, w);
            }
            Stmt::If {
                label,
                cond,
                then,
                otherwise,
            } => {
                w.open(format!("if ({cond} != 0)"));
                self.render_block(then, w);
                w.close();
                if !otherwise.is_empty() {
                    w.open("else");
                    self.render_block(otherwise, w);
                    w.close();
                }
                if let Some(label) = label {
                    code! { w; "b{}: ;", label.0 };
                }
            }
            Stmt::Jump(jump) => self.render_jump(jump, w),
            Stmt::BranchIf { cond, jump } => {
                w.open(format!("if ({cond} != 0)"));
                self.render_jump(jump, w);
                w.close();
            }
            Stmt::Switch {
                index,
                targets,
                default,
            } => {
                w.open(format!("switch ({index})"));
                for (case, jump) in targets.iter().enumerate() {
                    code! { w; "case {case}:" };
                    w.indent();
                    self.render_jump(jump, w);
                    w.dedent();
                }
                code! { w; "default:" };
                w.indent();
                self.render_jump(default, w);
                w.dedent();
                w.close();
            }
            Stmt::Trap(message) => code! { w; "throw new TrapException(\"{message}\");" },
        }
    }

    fn render_jump(&self, jump: &Jump, w: &mut Writer) {
        for mv in &jump.moves {
            code! { w; "{} = {};", mv.to, mv.from };
        }
        match jump.target {
            Target::Exit(label) => code! { w; "goto b{};", label.0 },
            Target::Continue(label) => code! { w; "goto l{};", label.0 },
            Target::Return(Some(slot)) => code! { w; "return {slot};" },
            Target::Return(None) => code! { w; "return;" },
        }
    }

    fn expr(&self, expr: &Expr) -> String {
        match expr {
            Expr::Local(index) => format!("local{index}"),
            Expr::Global(index) => format!("global{index}_"),
            Expr::Const(value) => literal(*value),
            Expr::Numeric(op, args) => {
                let args: Vec<String> = args.iter().map(ToString::to_string).collect();
                let args: Vec<&str> = args.iter().map(String::as_str).collect();
                op.render(&args)
            }
            Expr::Load { op, addr, offset } => op.render("mem_", &addr.to_string(), *offset),
            Expr::Select { cond, then, other } => format!("{cond} != 0 ? {then} : {other}"),
            Expr::MemorySize => "mem_.Size".to_string(),
            Expr::MemoryGrow(delta) => format!("mem_.Grow({delta})"),
            Expr::Call { func, args } => format!("{}({})", self.callee(*func), join(args)),
            Expr::CallIndirect {
                signature,
                table,
                index,
                args,
            } => format!(
                "indirect_Type{signature}({table}, {index})({})",
                join(args)
            ),
        }
    }

    fn callee(&self, func: u32) -> String {
        match self.names.import(func) {
            Some(ident) => format!("import_.{ident}"),
            None => format!("f{func}_"),
        }
    }

    /// Public members adapting the host calling convention to internal functions.
    pub fn exports_unit(&self) -> Result<Unit> {
        let mut w = Writer::new();
        self.begin(&mut w, &[]);
        w.open("sealed partial class Inst");
        for (position, export) in self.module.exports.iter().enumerate() {
            let name = self.names.export(position);
            let index = export.index;
            match export.kind {
                ExportKind::Func => {
                    let ty = self.module.func_type(index)?;
                    let args: Vec<String> =
                        (0..ty.params.len()).map(|i| format!("local{i}")).collect();
                    code! { w;
                        "public {} {name}({}) => {}({});",
                        return_type(ty),
                        parameters(&ty.params),
                        self.callee(index),
                        args.join(", ")
                    };
                }
                ExportKind::Global => {
                    let global = &self.module.globals[index as usize];
                    let ty = cs_type(global.kind);
                    if global.mutable {
                        code! { w;
                            "public {ty} {name} {{ get => global{index}_; set => global{index}_ = value; }}"
                        };
                    } else {
                        code! { w; "public {ty} {name} => global{index}_;" };
                    }
                }
                ExportKind::Memory => code! { w; "public Mem {name} => mem_;" },
                ExportKind::Table => code! { w; "public uint?[] {name} => table_[{index}];" },
            }
        }
        w.close();
        Ok(self.unit(UnitKind::Exports, w))
    }

    /// The constructor, dispatch table, signatures, tables, globals and data.
    pub fn bootstrap_unit(&self) -> Result<Unit> {
        let module = self.module;
        let mut w = Writer::new();
        self.begin(&mut w, &["System"]);

        w.open("interface IImport");
        code! { w; "void Initialize(Inst inst, Mem mem);" };
        for import in &self.imports {
            let ident = self.import_ident(import);
            code! { w; "{};", import.declaration(ident) };
        }
        w.close();
        w.blank();

        w.open("sealed partial class Inst");
        w.open("public Inst(IImport import)");
        match module.memory {
            Some(memory) => code! { w;
                "mem_ = new Mem({}, {});",
                memory.min_pages,
                memory.max_pages.map_or("null".to_string(), |max| max.to_string())
            },
            None => code! { w; "mem_ = new Mem(0, 0);" },
        }
        code! { w;
            "import_ = import;";
            "initializeFuncs_();";
            "initializeMemory_();";
            "import_.Initialize(this, mem_);";
        };
        if let Some(start) = module.start {
            code! { w; "{}();", self.callee(start) };
        }
        w.close();
        w.blank();

        w.open("private void initializeFuncs_()");
        w.open("funcs_ = new object[]");
        for func in &module.funcs {
            let signature = module.func_signature(func.index)?;
            if self.callable(signature) {
                code! { w; "(Type{signature}){},", self.callee(func.index) };
            } else {
                code! { w; "null," };
            }
        }
        w.close_with("};");
        w.close();
        w.blank();

        w.open("private void initializeMemory_()");
        for segment in &module.data {
            code! { w;
                "mem_.Write({}, Convert.FromBase64String(\"{}\"));",
                segment.offset as i32,
                STANDARD.encode(&segment.bytes)
            };
        }
        w.close();
        w.blank();

        for (index, ty) in module.signatures.unique().iter().enumerate() {
            if self.callable(index as u32) {
                code! { w;
                    "private delegate {} Type{index}({});",
                    return_type(ty),
                    parameters(&ty.params)
                };
            }
        }
        for index in 0..module.signatures.unique().len() {
            if self.callable(index as u32) {
                w.blank();
                render_indirect(index, &mut w);
            }
        }
        w.blank();

        w.open("private static readonly uint?[][] table_ =");
        for table in &module.tables {
            let entries: Vec<String> = table
                .entries
                .iter()
                .map(|entry| entry.map_or("null".to_string(), |func| func.to_string()))
                .collect();
            if entries.is_empty() {
                code! { w; "new uint?[0]," };
            } else {
                code! { w; "new uint?[] {{ {} }},", entries.join(", ") };
            }
        }
        w.close_with("};");
        w.blank();

        for (index, global) in module.globals.iter().enumerate() {
            code! { w;
                "private {}{} global{index}_ = {};",
                if global.mutable { "" } else { "readonly " },
                cs_type(global.kind),
                literal(global.init)
            };
        }
        code! { w;
            "private object[] funcs_;";
            "private Mem mem_;";
            "private IImport import_;";
        };
        w.close();
        Ok(self.unit(UnitKind::Bootstrap, w))
    }

    /// Signatures with more than one result have no delegate type.
    fn callable(&self, signature: u32) -> bool {
        self.module.signatures.unique()[signature as usize].results.len() <= 1
    }

    fn import_ident<'s>(&'s self, import: &'s ResolvedImport) -> &'s str {
        self.names.import(import.func).unwrap_or(&import.name)
    }

    pub fn memory_unit(&self) -> Unit {
        let mut w = Writer::new();
        self.begin(&mut w, &["System", "System.Buffers.Binary", "System.Text"]);
        w.lines(runtime::MEM);
        self.unit(UnitKind::Memory, w)
    }

    /// The host interface, the Go value table and one method per resolved import.
    pub fn imports_unit(&self) -> Unit {
        let mut w = Writer::new();
        self.begin(
            &mut w,
            &["System", "System.Collections.Generic", "System.Text"],
        );
        w.lines(runtime::HOST);
        w.blank();
        w.open("sealed class Import : IImport");
        w.open("public Import(IHost host)");
        code! { w; "host_ = host;"; "values_ = new ValueTable(host);" };
        w.close();
        w.blank();
        w.open("public void Initialize(Inst inst, Mem mem)");
        code! { w; "inst_ = inst;"; "mem_ = mem;" };
        w.close();
        for import in &self.imports {
            w.blank();
            import.render(self.import_ident(import), &mut w);
        }
        w.blank();
        code! { w;
            "private readonly IHost host_;";
            "private readonly ValueTable values_;";
            "private Inst inst_;";
            "private Mem mem_;";
        };
        w.close();
        self.unit(UnitKind::Imports, w)
    }
}

fn render_indirect(signature: usize, w: &mut Writer) {
    w.open(format!(
        "private Type{signature} indirect_Type{signature}(int table, int index)"
    ));
    code! { w; "var entries = table_[table];" };
    w.open("if ((uint)index >= (uint)entries.Length)");
    code! { w; "throw new TrapException(\"undefined element\");" };
    w.close();
    code! { w; "var func = entries[index];" };
    w.open("if (func == null)");
    code! { w; "throw new TrapException(\"uninitialized element\");" };
    w.close();
    w.open(format!("if (!(funcs_[func.Value] is Type{signature} target))"));
    code! { w; "throw new TrapException(\"indirect call type mismatch\");" };
    w.close();
    code! { w; "return target;" };
    w.close();
}

fn join(slots: &[ir::Slot]) -> String {
    slots
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;
    use crate::shim::resolve_imports;

    fn module(source: &str) -> Module<'static> {
        let bytes = wat::parse_str(source).unwrap();
        parse(Box::leak(bytes.into_boxed_slice())).unwrap()
    }

    #[test]
    fn identifiers_are_sanitized() {
        assert_eq!(identifier("syscall/js.valueGet"), "syscall_js_valueGet");
        assert_eq!(identifier("1st"), "_1st");
        assert_eq!(identifier("class"), "@class");
        assert_eq!(identifier("run_"), "run_export");
        assert_eq!(identifier(""), "_export");
    }

    #[test]
    fn colliding_exports_get_suffixes() {
        let module = module(
            r#"(module
                (func $f)
                (export "a.b" (func $f))
                (export "a_b" (func $f))
                (export "Inst" (func $f)))"#,
        );
        let names = Names::new(&module);
        assert_eq!(names.export(0), "a_b");
        assert_eq!(names.export(1), "a_b2");
        assert_eq!(names.export(2), "Inst2");
    }

    #[test]
    fn runtime_type_names_are_reserved() {
        let module = module(
            r#"(module
                (import "env" "Mem" (func (param i32)))
                (func $f)
                (export "Mem" (func $f))
                (export "Numerics" (func $f))
                (export "TrapException" (func $f))
                (export "Math" (func $f)))"#,
        );
        let names = Names::new(&module);
        assert_eq!(names.export(0), "Mem2");
        assert_eq!(names.export(1), "Numerics2");
        assert_eq!(names.export(2), "TrapException2");
        assert_eq!(names.export(3), "Math2");
        assert_eq!(names.import(0), Some("env_Mem"));
    }

    #[test]
    fn function_body_renders_labels_and_gotos() {
        let module = module(
            r#"(module (func $count (param i32) (result i32) (local i32)
                (block
                    (loop
                        local.get 0
                        i32.eqz
                        br_if 1
                        local.get 0
                        i32.const 1
                        i32.sub
                        local.set 0
                        local.get 1
                        i32.const 1
                        i32.add
                        local.set 1
                        br 0))
                local.get 1))"#,
        );
        let emitter = Emitter::new(&module, "Wasm", Vec::new());
        let unit = emitter.functions_unit(0, module.defined_funcs()).unwrap();
        let lines: Vec<_> = unit.contents.lines().map(str::trim).collect();
        let body_start = lines
            .iter()
            .position(|line| *line == "private int f0_(int local0)")
            .unwrap();
        assert_eq!(lines[body_start - 1], "// count");
        assert_eq!(
            &lines[body_start..],
            [
                "private int f0_(int local0)",
                "{",
                "int local1 = 0;",
                "int s0_i32 = 0;",
                "int s1_i32 = 0;",
                "l2: ;",
                "s0_i32 = local0;",
                "s0_i32 = s0_i32 == 0 ? 1 : 0;",
                "if (s0_i32 != 0)",
                "{",
                "goto b1;",
                "}",
                "s0_i32 = local0;",
                "s1_i32 = 1;",
                "s0_i32 = s0_i32 - s1_i32;",
                "local0 = s0_i32;",
                "s0_i32 = local1;",
                "s1_i32 = 1;",
                "s0_i32 = s0_i32 + s1_i32;",
                "local1 = s0_i32;",
                "goto l2;",
                "b1: ;",
                "s0_i32 = local1;",
                "return s0_i32;",
                "}",
                "}",
                "}",
            ]
        );
    }

    #[test]
    fn bootstrap_wires_tables_globals_and_data() {
        let module = module(
            r#"(module
                (type $debug (func (param i32)))
                (type $bin (func (param i32 i32) (result i32)))
                (import "go" "debug" (func $debug (type $debug)))
                (table 3 funcref)
                (memory 1)
                (global (mut i64) (i64.const -5))
                (global f32 (f32.const 0.5))
                (func $add (type $bin) local.get 0 local.get 1 i32.add)
                (func $init)
                (elem (i32.const 1) $add)
                (data (i32.const 8) "hi")
                (start $init))"#,
        );
        let imports = resolve_imports(&module, &Default::default()).unwrap();
        let emitter = Emitter::new(&module, "Demo", imports);
        let unit = emitter.bootstrap_unit().unwrap();
        let text = unit.contents;
        assert!(text.starts_with(HEADER));
        assert!(text.contains("namespace Demo"));
        assert!(text.contains("void debug(int local0);"));
        assert!(text.contains("mem_ = new Mem(1, null);"));
        assert!(text.contains("(Type0)import_.debug,"));
        assert!(text.contains("(Type1)f1_,"));
        assert!(text.contains("private delegate int Type1(int local0, int local1);"));
        assert!(text.contains("new uint?[] { null, 1, null },"));
        assert!(text.contains("private long global0_ = -5L;"));
        assert!(text.contains("private readonly float global1_ = 0.5f;"));
        assert!(text.contains("mem_.Write(8, Convert.FromBase64String(\"aGk=\"));"));
        assert!(text.contains("f2_();"));
        assert!(text.contains("private Type1 indirect_Type1(int table, int index)"));
    }

    #[test]
    fn exports_adapt_to_internal_members() {
        let module = module(
            r#"(module
                (memory 1)
                (table 1 funcref)
                (global $n (mut i32) (i32.const 0))
                (func $f (param i64) (result f64) f64.const 1)
                (export "f" (func $f))
                (export "n" (global $n))
                (export "mem" (memory 0))
                (export "table" (table 0)))"#,
        );
        let emitter = Emitter::new(&module, "Wasm", Vec::new());
        let text = emitter.exports_unit().unwrap().contents;
        assert!(text.contains("public double f(long local0) => f0_(local0);"));
        assert!(text.contains("public int n { get => global0_; set => global0_ = value; }"));
        assert!(text.contains("public Mem mem => mem_;"));
        assert!(text.contains("public uint?[] table => table_[0];"));
    }
}
