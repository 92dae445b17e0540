//! A small interpreter for translated function bodies.
//!
//! It runs the structured form directly, following the same slot and label
//! rules the generated C# relies on, so scenarios can check results without a
//! C# toolchain.

#![allow(dead_code)]

use std::collections::HashMap;

use anyhow::{anyhow, bail, Result};
use wasm2cs::ir::{Expr, Function, Jump, Label, Slot, Stmt, Target};
use wasm2cs::mapper::{LoadOp, NumOp, StoreOp};
use wasm2cs::parser::parse;
use wasm2cs::translator::translate_function;
use wasm2cs::wasm::{Module, Value, PAGE_SIZE};

pub fn wasm(source: &str) -> Vec<u8> {
    wat::parse_str(source).unwrap()
}

pub fn module(source: &str) -> Module<'static> {
    let bytes = wasm(source);
    parse(Box::leak(bytes.into_boxed_slice())).unwrap()
}

enum Flow {
    Normal,
    Exit(Label),
    Continue(Label),
    Return(Option<Value>),
}

struct Frame {
    locals: Vec<Value>,
    slots: HashMap<Slot, Value>,
}

impl Frame {
    fn get(&self, slot: Slot) -> Value {
        self.slots
            .get(&slot)
            .copied()
            .unwrap_or(Value::zero(slot.kind))
    }
}

pub struct Machine<'m> {
    module: &'m Module<'static>,
    functions: HashMap<u32, Function>,
    pub globals: Vec<Value>,
    pub memory: Vec<u8>,
    /// Values passed to imported functions, in call order.
    pub host_calls: Vec<(u32, Vec<Value>)>,
}

impl<'m> Machine<'m> {
    pub fn new(module: &'m Module<'static>) -> Self {
        let pages = module.memory.map_or(0, |memory| memory.min_pages as u64);
        let mut memory = vec![0; (pages * PAGE_SIZE) as usize];
        for segment in &module.data {
            let start = segment.offset as usize;
            memory[start..start + segment.bytes.len()].copy_from_slice(&segment.bytes);
        }
        Machine {
            module,
            functions: HashMap::new(),
            globals: module.globals.iter().map(|global| global.init).collect(),
            memory,
            host_calls: Vec::new(),
        }
    }

    pub fn invoke(&mut self, name: &str, args: &[Value]) -> Result<Option<Value>> {
        let export = self
            .module
            .export(name)
            .ok_or_else(|| anyhow!("no export named {name}"))?;
        self.call(export.index, args.to_vec())
    }

    pub fn call(&mut self, index: u32, args: Vec<Value>) -> Result<Option<Value>> {
        let desc = self.module.func(index)?;
        if desc.is_import() {
            self.host_calls.push((index, args));
            return Ok(None);
        }
        if !self.functions.contains_key(&index) {
            let func = translate_function(self.module, index)?;
            self.functions.insert(index, func);
        }
        let func = self.functions[&index].clone();
        let mut frame = Frame {
            locals: args
                .into_iter()
                .chain(func.locals.iter().map(|kind| Value::zero(*kind)))
                .collect(),
            slots: HashMap::new(),
        };
        match self.run(&func.body, &mut frame)? {
            Flow::Return(value) => Ok(value),
            Flow::Normal => Ok(None),
            Flow::Exit(label) | Flow::Continue(label) => {
                bail!("branch to label {} escaped function {index}", label.0)
            }
        }
    }

    fn run(&mut self, stmts: &[Stmt], frame: &mut Frame) -> Result<Flow> {
        for stmt in stmts {
            let flow = self.exec(stmt, frame)?;
            if !matches!(flow, Flow::Normal) {
                return Ok(flow);
            }
        }
        Ok(Flow::Normal)
    }

    fn exec(&mut self, stmt: &Stmt, frame: &mut Frame) -> Result<Flow> {
        match stmt {
            Stmt::Assign(slot, expr) => {
                let value = self
                    .eval(expr, frame)?
                    .ok_or_else(|| anyhow!("{expr:?} produced no value"))?;
                frame.slots.insert(*slot, value);
            }
            Stmt::Effect(expr) => {
                self.eval(expr, frame)?;
            }
            Stmt::SetLocal(index, slot) => frame.locals[*index as usize] = frame.get(*slot),
            Stmt::SetGlobal(index, slot) => self.globals[*index as usize] = frame.get(*slot),
            Stmt::Store {
                op,
                addr,
                offset,
                value,
            } => {
                let bits = frame.get(*value).to_u64();
                let width = match op {
                    StoreOp::I32Store8 | StoreOp::I64Store8 => 1,
                    StoreOp::I32Store16 | StoreOp::I64Store16 => 2,
                    StoreOp::I32Store | StoreOp::F32Store | StoreOp::I64Store32 => 4,
                    StoreOp::I64Store | StoreOp::F64Store => 8,
                };
                let start = self.address(frame.get(*addr), *offset, width)?;
                self.memory[start..start + width].copy_from_slice(&bits.to_le_bytes()[..width]);
            }
            Stmt::MemoryCopy { dst, src, len } => {
                let len = i32_of(frame.get(*len)) as u32 as usize;
                let src = self.address(frame.get(*src), 0, len)?;
                let dst = self.address(frame.get(*dst), 0, len)?;
                self.memory.copy_within(src..src + len, dst);
            }
            Stmt::MemoryFill { dst, value, len } => {
                let len = i32_of(frame.get(*len)) as u32 as usize;
                let dst = self.address(frame.get(*dst), 0, len)?;
                let byte = i32_of(frame.get(*value)) as u8;
                self.memory[dst..dst + len].fill(byte);
            }
            Stmt::Block { label, body } => {
                return Ok(match self.run(body, frame)? {
                    Flow::Exit(target) if Some(target) == *label => Flow::Normal,
                    flow => flow,
                });
            }
            Stmt::Loop { label, body } => loop {
                match self.run(body, frame)? {
                    Flow::Continue(target) if Some(target) == *label => continue,
                    flow => return Ok(flow),
                }
            },
            Stmt::If {
                label,
                cond,
                then,
                otherwise,
            } => {
                let body = if i32_of(frame.get(*cond)) != 0 {
                    then
                } else {
                    otherwise
                };
                return Ok(match self.run(body, frame)? {
                    Flow::Exit(target) if Some(target) == *label => Flow::Normal,
                    flow => flow,
                });
            }
            Stmt::Jump(jump) => return Ok(take(jump, frame)),
            Stmt::BranchIf { cond, jump } => {
                if i32_of(frame.get(*cond)) != 0 {
                    return Ok(take(jump, frame));
                }
            }
            Stmt::Switch {
                index,
                targets,
                default,
            } => {
                let index = i32_of(frame.get(*index)) as u32 as usize;
                return Ok(take(targets.get(index).unwrap_or(default), frame));
            }
            Stmt::Trap(message) => bail!("trap: {message}"),
        }
        Ok(Flow::Normal)
    }

    fn eval(&mut self, expr: &Expr, frame: &mut Frame) -> Result<Option<Value>> {
        let value = match expr {
            Expr::Local(index) => frame.locals[*index as usize],
            Expr::Global(index) => self.globals[*index as usize],
            Expr::Const(value) => *value,
            Expr::Numeric(op, args) => {
                let args: Vec<Value> = args.iter().map(|slot| frame.get(*slot)).collect();
                numeric(*op, &args)?
            }
            Expr::Load { op, addr, offset } => self.load(*op, frame.get(*addr), *offset)?,
            Expr::Select { cond, then, other } => {
                if i32_of(frame.get(*cond)) != 0 {
                    frame.get(*then)
                } else {
                    frame.get(*other)
                }
            }
            Expr::MemorySize => Value::I32((self.memory.len() as u64 / PAGE_SIZE) as i32),
            Expr::MemoryGrow(delta) => {
                let old = self.memory.len() as u64 / PAGE_SIZE;
                let delta = i32_of(frame.get(*delta)) as u32 as u64;
                let max = self
                    .module
                    .memory
                    .and_then(|memory| memory.max_pages)
                    .map_or(65536, u64::from);
                if old + delta > max {
                    Value::I32(-1)
                } else {
                    self.memory.resize(((old + delta) * PAGE_SIZE) as usize, 0);
                    Value::I32(old as i32)
                }
            }
            Expr::Call { func, args } => {
                let args = args.iter().map(|slot| frame.get(*slot)).collect();
                return self.call(*func, args);
            }
            Expr::CallIndirect {
                signature,
                table,
                index,
                args,
            } => {
                let slot = i32_of(frame.get(*index)) as u32 as usize;
                let callee = self.module.tables[*table as usize]
                    .entries
                    .get(slot)
                    .copied()
                    .ok_or_else(|| anyhow!("trap: undefined element"))?
                    .ok_or_else(|| anyhow!("trap: uninitialized element"))?;
                if self.module.func_signature(callee)? != *signature {
                    bail!("trap: indirect call type mismatch");
                }
                let args = args.iter().map(|slot| frame.get(*slot)).collect();
                return self.call(callee, args);
            }
        };
        Ok(Some(value))
    }

    fn address(&self, addr: Value, offset: u64, width: usize) -> Result<usize> {
        let start = i32_of(addr) as u32 as u64 + offset;
        if start + width as u64 > self.memory.len() as u64 {
            bail!("trap: out of bounds memory access");
        }
        Ok(start as usize)
    }

    fn load(&self, op: LoadOp, addr: Value, offset: u64) -> Result<Value> {
        let (width, signed) = match op {
            LoadOp::I32Load8S | LoadOp::I64Load8S => (1, true),
            LoadOp::I32Load8U | LoadOp::I64Load8U => (1, false),
            LoadOp::I32Load16S | LoadOp::I64Load16S => (2, true),
            LoadOp::I32Load16U | LoadOp::I64Load16U => (2, false),
            LoadOp::I32Load | LoadOp::F32Load | LoadOp::I64Load32S => (4, true),
            LoadOp::I64Load32U => (4, false),
            LoadOp::I64Load | LoadOp::F64Load => (8, true),
        };
        let start = self.address(addr, offset, width)?;
        let mut bytes = [0u8; 8];
        bytes[..width].copy_from_slice(&self.memory[start..start + width]);
        let mut bits = u64::from_le_bytes(bytes);
        if signed && width < 8 {
            let shift = 64 - 8 * width as u32;
            bits = (((bits << shift) as i64) >> shift) as u64;
        }
        Ok(Value::from_u64(bits, op.result()))
    }
}

fn take(jump: &Jump, frame: &mut Frame) -> Flow {
    for mv in &jump.moves {
        let value = frame.get(mv.from);
        frame.slots.insert(mv.to, value);
    }
    match jump.target {
        Target::Exit(label) => Flow::Exit(label),
        Target::Continue(label) => Flow::Continue(label),
        Target::Return(slot) => Flow::Return(slot.map(|slot| frame.get(slot))),
    }
}

fn i32_of(value: Value) -> i32 {
    match value {
        Value::I32(v) => v,
        other => panic!("expected an i32, got {other:?}"),
    }
}

fn i64_of(value: Value) -> i64 {
    match value {
        Value::I64(v) => v,
        other => panic!("expected an i64, got {other:?}"),
    }
}

fn f32_of(value: Value) -> f32 {
    match value {
        Value::F32(v) => v,
        other => panic!("expected an f32, got {other:?}"),
    }
}

fn f64_of(value: Value) -> f64 {
    match value {
        Value::F64(v) => v,
        other => panic!("expected an f64, got {other:?}"),
    }
}

fn flag(condition: bool) -> Value {
    Value::I32(condition as i32)
}

/// Integer operations, sign extension, saturating truncation and the common
/// float arithmetic and comparisons.
fn numeric(op: NumOp, args: &[Value]) -> Result<Value> {
    let a = args[0];
    let b = args.get(1).copied();
    let i32s = || (i32_of(a), i32_of(b.unwrap_or(Value::I32(0))));
    let i64s = || (i64_of(a), i64_of(b.unwrap_or(Value::I64(0))));
    Ok(match op {
        NumOp::I32Eqz => flag(i32_of(a) == 0),
        NumOp::I32Eq => flag(i32s().0 == i32s().1),
        NumOp::I32Ne => flag(i32s().0 != i32s().1),
        NumOp::I32LtS => flag(i32s().0 < i32s().1),
        NumOp::I32LtU => flag((i32s().0 as u32) < (i32s().1 as u32)),
        NumOp::I32GtS => flag(i32s().0 > i32s().1),
        NumOp::I32GtU => flag((i32s().0 as u32) > (i32s().1 as u32)),
        NumOp::I32LeS => flag(i32s().0 <= i32s().1),
        NumOp::I32GeS => flag(i32s().0 >= i32s().1),
        NumOp::I32Add => Value::I32(i32s().0.wrapping_add(i32s().1)),
        NumOp::I32Sub => Value::I32(i32s().0.wrapping_sub(i32s().1)),
        NumOp::I32Mul => Value::I32(i32s().0.wrapping_mul(i32s().1)),
        NumOp::I32DivS => {
            let (a, b) = i32s();
            if b == 0 {
                bail!("trap: integer divide by zero");
            }
            Value::I32(a.wrapping_div(b))
        }
        NumOp::I32RemS => {
            let (a, b) = i32s();
            if b == 0 {
                bail!("trap: integer divide by zero");
            }
            Value::I32(a.wrapping_rem(b))
        }
        NumOp::I32And => Value::I32(i32s().0 & i32s().1),
        NumOp::I32Or => Value::I32(i32s().0 | i32s().1),
        NumOp::I32Xor => Value::I32(i32s().0 ^ i32s().1),
        NumOp::I32Shl => Value::I32(i32s().0.wrapping_shl(i32s().1 as u32)),
        NumOp::I32ShrS => Value::I32(i32s().0.wrapping_shr(i32s().1 as u32)),
        NumOp::I32ShrU => Value::I32(((i32s().0 as u32).wrapping_shr(i32s().1 as u32)) as i32),
        NumOp::I64Eqz => flag(i64_of(a) == 0),
        NumOp::I64Eq => flag(i64s().0 == i64s().1),
        NumOp::I64LtS => flag(i64s().0 < i64s().1),
        NumOp::I64GtS => flag(i64s().0 > i64s().1),
        NumOp::I64Add => Value::I64(i64s().0.wrapping_add(i64s().1)),
        NumOp::I64Sub => Value::I64(i64s().0.wrapping_sub(i64s().1)),
        NumOp::I64Mul => Value::I64(i64s().0.wrapping_mul(i64s().1)),
        NumOp::I32WrapI64 => Value::I32(i64_of(a) as i32),
        NumOp::I64ExtendI32S => Value::I64(i32_of(a) as i64),
        NumOp::I64ExtendI32U => Value::I64(i32_of(a) as u32 as i64),
        NumOp::I32Extend8S => Value::I32(i32_of(a) as i8 as i32),
        NumOp::I32Extend16S => Value::I32(i32_of(a) as i16 as i32),
        NumOp::I64Extend8S => Value::I64(i64_of(a) as i8 as i64),
        NumOp::I64Extend16S => Value::I64(i64_of(a) as i16 as i64),
        NumOp::I64Extend32S => Value::I64(i64_of(a) as i32 as i64),
        // `as` from float to int saturates and maps NaN to zero.
        NumOp::I32TruncSatF32S => Value::I32(f32_of(a) as i32),
        NumOp::I32TruncSatF32U => Value::I32(f32_of(a) as u32 as i32),
        NumOp::I32TruncSatF64S => Value::I32(f64_of(a) as i32),
        NumOp::I32TruncSatF64U => Value::I32(f64_of(a) as u32 as i32),
        NumOp::I64TruncSatF32S => Value::I64(f32_of(a) as i64),
        NumOp::I64TruncSatF32U => Value::I64(f32_of(a) as u64 as i64),
        NumOp::I64TruncSatF64S => Value::I64(f64_of(a) as i64),
        NumOp::I64TruncSatF64U => Value::I64(f64_of(a) as u64 as i64),
        NumOp::F64ConvertI32S => Value::F64(i32_of(a) as f64),
        NumOp::F64PromoteF32 => Value::F64(f32_of(a) as f64),
        NumOp::F32Eq | NumOp::F32Ne | NumOp::F32Lt | NumOp::F32Gt | NumOp::F32Le
        | NumOp::F32Ge => {
            let (x, y) = (f32_of(a), f32_of(b.unwrap_or(Value::F32(0.0))));
            flag(match op {
                NumOp::F32Eq => x == y,
                NumOp::F32Ne => x != y,
                NumOp::F32Lt => x < y,
                NumOp::F32Gt => x > y,
                NumOp::F32Le => x <= y,
                _ => x >= y,
            })
        }
        NumOp::F64Eq | NumOp::F64Ne | NumOp::F64Lt | NumOp::F64Gt | NumOp::F64Le
        | NumOp::F64Ge => {
            let (x, y) = (f64_of(a), f64_of(b.unwrap_or(Value::F64(0.0))));
            flag(match op {
                NumOp::F64Eq => x == y,
                NumOp::F64Ne => x != y,
                NumOp::F64Lt => x < y,
                NumOp::F64Gt => x > y,
                NumOp::F64Le => x <= y,
                _ => x >= y,
            })
        }
        NumOp::F32Neg => Value::F32(-f32_of(a)),
        NumOp::F32Abs => Value::F32(f32_of(a).abs()),
        NumOp::F32Sqrt => Value::F32(f32_of(a).sqrt()),
        NumOp::F32Add | NumOp::F32Sub | NumOp::F32Mul | NumOp::F32Div | NumOp::F32Min
        | NumOp::F32Max => {
            let (x, y) = (f32_of(a), f32_of(b.unwrap_or(Value::F32(0.0))));
            Value::F32(match op {
                NumOp::F32Add => x + y,
                NumOp::F32Sub => x - y,
                NumOp::F32Mul => x * y,
                NumOp::F32Div => x / y,
                NumOp::F32Min => x.min(y),
                _ => x.max(y),
            })
        }
        NumOp::F64Neg => Value::F64(-f64_of(a)),
        NumOp::F64Abs => Value::F64(f64_of(a).abs()),
        NumOp::F64Sqrt => Value::F64(f64_of(a).sqrt()),
        NumOp::F64Add | NumOp::F64Sub | NumOp::F64Mul | NumOp::F64Div | NumOp::F64Min
        | NumOp::F64Max => {
            let (x, y) = (f64_of(a), f64_of(b.unwrap_or(Value::F64(0.0))));
            Value::F64(match op {
                NumOp::F64Add => x + y,
                NumOp::F64Sub => x - y,
                NumOp::F64Mul => x * y,
                NumOp::F64Div => x / y,
                NumOp::F64Min => x.min(y),
                _ => x.max(y),
            })
        }
        other => bail!("{other:?} is not supported by the test interpreter"),
    })
}
