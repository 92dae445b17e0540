//! Hand-written replacements for the host functions a Go module imports.
//!
//! Every catalog entry is called with the Go stack pointer as its only
//! argument (`local0`) and reads its arguments from, and writes its results
//! to, fixed offsets relative to it. Strings take 16 bytes (pointer, length),
//! slices 24 bytes (pointer, length, capacity), and value refs 8 bytes.

use anyhow::Result;
use fxhash::FxHashMap;
use log::debug;

use crate::emitter::writer::Writer;
use crate::error::TranslateError;
use crate::mapper::cs_type;
use crate::wasm::{ExportKind, FuncKind, FuncType, Module, ValKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    I32,
    U32,
    I64,
    /// `[]byte`, loaded as an `ArraySegment<byte>` over linear memory.
    Slice,
    String,
    Ref,
    /// `[]ref`, loaded as `object[]`.
    Refs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultKind {
    I32,
    I64,
    Ref,
    /// Stored as a single byte.
    Bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Arg {
    pub name: &'static str,
    pub offset: u32,
    pub kind: ArgKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Res {
    pub name: &'static str,
    pub offset: u32,
    pub kind: ResultKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    pub args: &'static [Arg],
    pub results: &'static [Res],
    /// The call may grow the Go stack, so `sp` is re-read before results are stored.
    pub reloads_sp: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// C# statements run between loading the arguments and storing the results.
    Body(&'static str),
    Nop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shim {
    pub name: &'static str,
    /// Go declaration of the imported function.
    pub signature: &'static str,
    pub layout: Layout,
    pub strategy: Strategy,
}

const fn arg(name: &'static str, offset: u32, kind: ArgKind) -> Arg {
    Arg { name, offset, kind }
}

const fn res(name: &'static str, offset: u32, kind: ResultKind) -> Res {
    Res { name, offset, kind }
}

const fn shim(
    name: &'static str,
    signature: &'static str,
    args: &'static [Arg],
    results: &'static [Res],
    reloads_sp: bool,
    body: &'static str,
) -> Shim {
    Shim {
        name,
        signature,
        layout: Layout {
            args,
            results,
            reloads_sp,
        },
        strategy: Strategy::Body(body),
    }
}

const WALLTIME_RESULTS: &[Res] = &[
    res("sec", 8, ResultKind::I64),
    res("nsec", 16, ResultKind::I32),
];
const WALLTIME_BODY: &str = "var now = host_.UnixNowInMilliseconds();
sec = (long)(now / 1000);
nsec = (int)((now % 1000) * 1_000_000);";

pub static CATALOG: &[Shim] = &[
    shim(
        "runtime.wasmExit",
        "func wasmExit(code int32)",
        &[arg("code", 8, ArgKind::I32)],
        &[],
        false,
        "host_.Exit(code);",
    ),
    shim(
        "runtime.wasmWrite",
        "func wasmWrite(fd uintptr, p unsafe.Pointer, n int32)",
        &[
            arg("fd", 8, ArgKind::I64),
            arg("p", 16, ArgKind::I64),
            arg("n", 24, ArgKind::I32),
        ],
        &[],
        false,
        "if (fd != 1 && fd != 2)
{
    throw new NotImplementedException($\"fd for runtime.wasmWrite must be 1 or 2 but {fd}\");
}
host_.DebugWrite(mem_.LoadSliceDirectly(p, n));",
    ),
    Shim {
        name: "runtime.resetMemoryDataView",
        signature: "func resetMemoryDataView()",
        layout: Layout {
            args: &[],
            results: &[],
            reloads_sp: false,
        },
        strategy: Strategy::Nop,
    },
    shim(
        "runtime.nanotime1",
        "func nanotime1() int64",
        &[],
        &[res("now", 8, ResultKind::I64)],
        false,
        "now = host_.PreciseNowInNanoseconds();",
    ),
    shim(
        "runtime.walltime1",
        "func walltime1() (sec int64, nsec int32)",
        &[],
        WALLTIME_RESULTS,
        false,
        WALLTIME_BODY,
    ),
    shim(
        "runtime.walltime",
        "func walltime() (sec int64, nsec int32)",
        &[],
        WALLTIME_RESULTS,
        false,
        WALLTIME_BODY,
    ),
    shim(
        "runtime.scheduleTimeoutEvent",
        "func scheduleTimeoutEvent(delay int64) int32",
        &[arg("delay", 8, ArgKind::I64)],
        &[res("id", 16, ResultKind::I32)],
        false,
        "id = host_.SetTimeout((double)delay);",
    ),
    shim(
        "runtime.clearTimeoutEvent",
        "func clearTimeoutEvent(id int32)",
        &[arg("id", 8, ArgKind::I32)],
        &[],
        false,
        "host_.ClearTimeout(id);",
    ),
    shim(
        "runtime.getRandomData",
        "func getRandomData(r []byte)",
        &[arg("r", 8, ArgKind::Slice)],
        &[],
        false,
        "var bytes = host_.GetRandomBytes(r.Count);
Array.Copy(bytes, 0, r.Array, r.Offset, r.Count);",
    ),
    shim(
        "syscall/js.finalizeRef",
        "func finalizeRef(v ref)",
        &[arg("id", 8, ArgKind::U32)],
        &[],
        false,
        "values_.Release((int)id);",
    ),
    shim(
        "syscall/js.stringVal",
        "func stringVal(value string) ref",
        &[arg("value", 8, ArgKind::String)],
        &[res("result", 24, ResultKind::Ref)],
        false,
        "result = value;",
    ),
    shim(
        "syscall/js.valueGet",
        "func valueGet(v ref, p string) ref",
        &[arg("v", 8, ArgKind::Ref), arg("p", 16, ArgKind::String)],
        &[res("result", 32, ResultKind::Ref)],
        true,
        "result = host_.ReflectGet(v, p);",
    ),
    shim(
        "syscall/js.valueSet",
        "func valueSet(v ref, p string, x ref)",
        &[
            arg("v", 8, ArgKind::Ref),
            arg("p", 16, ArgKind::String),
            arg("x", 32, ArgKind::Ref),
        ],
        &[],
        false,
        "host_.ReflectSet(v, p, x);",
    ),
    shim(
        "syscall/js.valueDelete",
        "func valueDelete(v ref, p string)",
        &[arg("v", 8, ArgKind::Ref), arg("p", 16, ArgKind::String)],
        &[],
        false,
        "host_.ReflectDelete(v, p);",
    ),
    shim(
        "syscall/js.valueIndex",
        "func valueIndex(v ref, i int) ref",
        &[arg("v", 8, ArgKind::Ref), arg("i", 16, ArgKind::I64)],
        &[res("result", 24, ResultKind::Ref)],
        false,
        "result = host_.ReflectGet(v, i.ToString());",
    ),
    shim(
        "syscall/js.valueSetIndex",
        "func valueSetIndex(v ref, i int, x ref)",
        &[
            arg("v", 8, ArgKind::Ref),
            arg("i", 16, ArgKind::I64),
            arg("x", 24, ArgKind::Ref),
        ],
        &[],
        false,
        "host_.ReflectSet(v, i.ToString(), x);",
    ),
    shim(
        "syscall/js.valueCall",
        "func valueCall(v ref, m string, args []ref) (ref, bool)",
        &[
            arg("v", 8, ArgKind::Ref),
            arg("m", 16, ArgKind::String),
            arg("args", 32, ArgKind::Refs),
        ],
        &[
            res("result", 56, ResultKind::Ref),
            res("ok", 64, ResultKind::Bool),
        ],
        true,
        "var method = host_.ReflectGet(v, m);
result = host_.ReflectApply(method, v, args);
ok = true;",
    ),
    shim(
        "syscall/js.valueInvoke",
        "func valueInvoke(v ref, args []ref) (ref, bool)",
        &[arg("v", 8, ArgKind::Ref), arg("args", 16, ArgKind::Refs)],
        &[
            res("result", 40, ResultKind::Ref),
            res("ok", 48, ResultKind::Bool),
        ],
        true,
        "result = host_.ReflectApply(v, host_.Undefined, args);
ok = true;",
    ),
    shim(
        "syscall/js.valueNew",
        "func valueNew(v ref, args []ref) (ref, bool)",
        &[arg("v", 8, ArgKind::Ref), arg("args", 16, ArgKind::Refs)],
        &[
            res("result", 40, ResultKind::Ref),
            res("ok", 48, ResultKind::Bool),
        ],
        true,
        "result = host_.ReflectConstruct(v, args);
ok = result != null;",
    ),
    shim(
        "syscall/js.valueLength",
        "func valueLength(v ref) int",
        &[arg("v", 8, ArgKind::Ref)],
        &[res("length", 16, ResultKind::I64)],
        false,
        "length = ((System.Collections.ICollection)v).Count;",
    ),
    shim(
        "syscall/js.valuePrepareString",
        "func valuePrepareString(v ref) (ref, int)",
        &[arg("v", 8, ArgKind::Ref)],
        &[
            res("str", 16, ResultKind::Ref),
            res("length", 24, ResultKind::I64),
        ],
        false,
        "var bytes = Encoding.UTF8.GetBytes(v.ToString());
str = bytes;
length = bytes.Length;",
    ),
    shim(
        "syscall/js.valueLoadString",
        "func valueLoadString(v ref, b []byte)",
        &[arg("v", 8, ArgKind::Ref), arg("b", 16, ArgKind::Slice)],
        &[],
        false,
        "var src = (byte[])v;
Array.Copy(src, 0, b.Array, b.Offset, Math.Min(b.Count, src.Length));",
    ),
    shim(
        "syscall/js.copyBytesToGo",
        "func copyBytesToGo(dst []byte, src ref) (int, bool)",
        &[arg("dst", 8, ArgKind::Slice), arg("src", 32, ArgKind::Ref)],
        &[
            res("n", 40, ResultKind::I64),
            res("ok", 48, ResultKind::Bool),
        ],
        false,
        "if (src is byte[] bytes)
{
    n = Math.Min(dst.Count, bytes.Length);
    Array.Copy(bytes, 0, dst.Array, dst.Offset, (int)n);
    ok = true;
}",
    ),
    shim(
        "syscall/js.copyBytesToJS",
        "func copyBytesToJS(dst ref, src []byte) (int, bool)",
        &[arg("dst", 8, ArgKind::Ref), arg("src", 16, ArgKind::Slice)],
        &[
            res("n", 40, ResultKind::I64),
            res("ok", 48, ResultKind::Bool),
        ],
        false,
        "if (dst is byte[] bytes)
{
    n = Math.Min(bytes.Length, src.Count);
    Array.Copy(src.Array, src.Offset, bytes, 0, (int)n);
    ok = true;
}",
    ),
    // Takes a raw value rather than a stack pointer.
    shim(
        "debug",
        "func debug(value int32)",
        &[],
        &[],
        false,
        "Console.WriteLine(local0);",
    ),
];

pub fn lookup(name: &str) -> Option<&'static Shim> {
    CATALOG.iter().find(|shim| shim.name == name)
}

/// The key an import is looked up by, in the catalog and in overrides.
pub fn qualified_name(module: &str, name: &str) -> String {
    match module {
        "go" | "gojs" => name.to_string(),
        _ => format!("{module}.{name}"),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Shim(&'static Shim),
    /// A caller-supplied C# method body.
    Override(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedImport {
    pub func: u32,
    pub module: String,
    pub name: String,
    pub qualified: String,
    pub ty: FuncType,
    pub resolution: Resolution,
}

/// Binds every imported function to an override or a catalog entry.
///
/// Fails on the first import that has neither, before anything is emitted.
pub fn resolve_imports(
    module: &Module<'_>,
    overrides: &FxHashMap<String, String>,
) -> Result<Vec<ResolvedImport>> {
    let mut resolved = Vec::with_capacity(module.import_count as usize);
    for func in module.imported_funcs() {
        let FuncKind::Import {
            module: import_module,
            name,
        } = &func.kind
        else {
            continue;
        };
        let qualified = qualified_name(import_module, name);
        let ty = module.type_at(func.type_index)?.clone();
        if ty.results.len() > 1 {
            return Err(TranslateError::unsupported(
                0,
                format!("import {qualified} with multiple results"),
            )
            .into());
        }
        let resolution = if let Some(body) = overrides.get(&qualified) {
            Resolution::Override(body.clone())
        } else if let Some(shim) = lookup(&qualified) {
            check_shim(module, func.index, shim, &ty)?;
            Resolution::Shim(shim)
        } else {
            return Err(TranslateError::UnresolvedImport {
                module: import_module.clone(),
                name: name.clone(),
            }
            .into());
        };
        debug!(
            "import {} resolved to {}",
            qualified,
            match resolution {
                Resolution::Shim(_) => "the shim catalog",
                Resolution::Override(_) => "an override",
            }
        );
        resolved.push(ResolvedImport {
            func: func.index,
            module: import_module.clone(),
            name: name.clone(),
            qualified,
            ty,
            resolution,
        });
    }
    Ok(resolved)
}

fn check_shim(module: &Module<'_>, func: u32, shim: &Shim, ty: &FuncType) -> Result<()> {
    if ty.params != [ValKind::I32] || !ty.results.is_empty() {
        return Err(TranslateError::CallSignatureMismatch {
            func,
            offset: 0,
            detail: format!("import {} has type {ty}, its shim expects (i32) -> ()", shim.name),
        }
        .into());
    }
    if shim.layout.reloads_sp {
        let getsp = module
            .export("getsp")
            .filter(|export| export.kind == ExportKind::Func)
            .map(|export| module.func_type(export.index))
            .transpose()?;
        let valid = getsp.is_some_and(|ty| ty.params.is_empty() && ty.results == [ValKind::I32]);
        if !valid {
            return Err(TranslateError::unsupported(
                0,
                format!(
                    "{} needs an exported getsp function of type () -> (i32)",
                    shim.name
                ),
            )
            .into());
        }
    }
    Ok(())
}

fn arg_loader(kind: ArgKind) -> &'static str {
    match kind {
        ArgKind::I32 => "mem_.LoadInt32",
        ArgKind::U32 => "mem_.LoadUint32",
        ArgKind::I64 => "mem_.LoadInt64",
        ArgKind::Slice => "mem_.LoadSlice",
        ArgKind::String => "mem_.LoadString",
        ArgKind::Ref => "values_.Load",
        ArgKind::Refs => "values_.LoadSlice",
    }
}

impl Shim {
    fn render_body(&self, w: &mut Writer) {
        for arg in self.layout.args {
            let address = format!("local0 + {}", arg.offset);
            match arg.kind {
                ArgKind::Ref | ArgKind::Refs => code! { w;
                    "var {} = {}(mem_, {address});", arg.name, arg_loader(arg.kind)
                },
                _ => code! { w;
                    "var {} = {}({address});", arg.name, arg_loader(arg.kind)
                },
            }
        }
        for res in self.layout.results {
            let (ty, default) = match res.kind {
                ResultKind::I32 => ("int", "0"),
                ResultKind::I64 => ("long", "0"),
                ResultKind::Ref => ("object", "null"),
                ResultKind::Bool => ("bool", "false"),
            };
            code! { w; "{ty} {} = {default};", res.name };
        }
        match self.strategy {
            Strategy::Body(body) => w.lines(body),
            Strategy::Nop => code! { w; "// Nothing to do." },
        }
        if self.layout.reloads_sp {
            code! { w; "local0 = inst_.getsp();" };
        }
        for res in self.layout.results {
            let address = format!("local0 + {}", res.offset);
            match res.kind {
                ResultKind::I32 => code! { w; "mem_.StoreInt32({address}, {});", res.name },
                ResultKind::I64 => code! { w; "mem_.StoreInt64({address}, {});", res.name },
                ResultKind::Ref => code! { w; "values_.Store(mem_, {address}, {});", res.name },
                ResultKind::Bool => code! { w;
                    "mem_.StoreInt8({address}, (sbyte)({} ? 1 : 0));", res.name
                },
            }
        }
    }
}

/// C# parameter list `int local0, long local1` for a signature.
pub fn parameters(kinds: &[ValKind]) -> String {
    kinds
        .iter()
        .enumerate()
        .map(|(i, kind)| format!("{} local{i}", cs_type(*kind)))
        .collect::<Vec<_>>()
        .join(", ")
}

pub fn return_type(ty: &FuncType) -> &'static str {
    ty.results.first().map_or("void", |kind| cs_type(*kind))
}

impl ResolvedImport {
    /// The `IImport` method declaration, without a body.
    pub fn declaration(&self, ident: &str) -> String {
        format!(
            "{} {ident}({})",
            return_type(&self.ty),
            parameters(&self.ty.params)
        )
    }

    /// Renders the implementing method of the `Import` class.
    pub fn render(&self, ident: &str, w: &mut Writer) {
        match &self.resolution {
            Resolution::Shim(shim) => code! { w; "// {}", shim.signature },
            Resolution::Override(_) => code! { w; "// {} (override)", self.qualified },
        }
        w.open(format!("public {}", self.declaration(ident)));
        match &self.resolution {
            Resolution::Shim(shim) => shim.render_body(w),
            Resolution::Override(body) => w.lines(body.trim_end()),
        }
        w.close();
    }
}
