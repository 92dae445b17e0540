//! Recovers structured control flow from a function's instruction stream.

mod stack;

use anyhow::Result;
use log::trace;
use wasmparser::{BlockType, Operator};

use crate::error::TranslateError;
use crate::ir::{self, Expr, Jump, Label, Move, Slot, Stmt, Target};
use crate::mapper::{LoadOp, NumOp, StoreOp};
use crate::parser::val_kinds;
use crate::wasm::{FuncType, Module, ValKind, Value};

use self::stack::ValueStack;

type TranslateResult<T> = std::result::Result<T, TranslateError>;

/// Translates the defined function at `index` of the function index space.
pub fn translate_function(module: &Module<'_>, index: u32) -> Result<ir::Function> {
    let desc = module.func(index)?;
    let body = desc.body().ok_or_else(|| {
        TranslateError::malformed(0, format!("function {index} is imported and has no body"))
    })?;
    let ty = module.func_type(index)?;
    if ty.results.len() > 1 {
        return Err(TranslateError::unsupported(body.offset, "functions with multiple results").into());
    }

    let mut translator = Translator::new(module, index, ty, &body.locals);
    for instr in &body.instrs {
        if translator.finished.is_some() {
            return Err(TranslateError::malformed(
                instr.offset,
                "instructions after the end of the function body",
            )
            .into());
        }
        translator.stack.at(instr.offset);
        translator.step(&instr.op, instr.offset)?;
    }
    let Some(stmts) = translator.finished.take() else {
        return Err(TranslateError::malformed(body.offset, "function body is not terminated").into());
    };
    let slots = translator.stack.into_slots();
    trace!(
        "translated function {index} ({} instructions, {} slots)",
        body.instrs.len(),
        slots.len()
    );

    Ok(ir::Function {
        index,
        name: desc.name.clone(),
        signature: module.func_signature(index)?,
        params: ty.params.clone(),
        results: ty.results.clone(),
        locals: body.locals.clone(),
        slots,
        body: stmts,
    })
}

#[derive(Debug)]
enum FrameKind {
    Function,
    Block,
    Loop,
    If { cond: Slot },
    Else { cond: Slot, then: Vec<Stmt> },
}

#[derive(Debug)]
struct Frame {
    kind: FrameKind,
    label: Label,
    params: Vec<ValKind>,
    results: Vec<ValKind>,
    /// Stack height below the frame's parameters.
    height: usize,
    unreachable: bool,
    /// Structured instructions opened inside dead code, still waiting for `end`.
    dead_nesting: u32,
    targeted: bool,
    body: Vec<Stmt>,
}

impl Frame {
    /// Kinds a branch to this frame carries.
    fn branch_kinds(&self) -> &[ValKind] {
        match self.kind {
            FrameKind::Loop => &self.params,
            _ => &self.results,
        }
    }
}

struct Translator<'m, 'a> {
    module: &'m Module<'a>,
    func: u32,
    locals: Vec<ValKind>,
    stack: ValueStack,
    controls: Vec<Frame>,
    next_label: u32,
    finished: Option<Vec<Stmt>>,
}

impl<'m, 'a> Translator<'m, 'a> {
    fn new(module: &'m Module<'a>, func: u32, ty: &FuncType, locals: &[ValKind]) -> Self {
        let mut translator = Translator {
            module,
            func,
            locals: ty.params.iter().chain(locals).copied().collect(),
            stack: ValueStack::new(func),
            controls: Vec::new(),
            next_label: 0,
            finished: None,
        };
        translator.push_frame(FrameKind::Function, Vec::new(), ty.results.clone(), 0);
        translator
    }

    fn push_frame(
        &mut self,
        kind: FrameKind,
        params: Vec<ValKind>,
        results: Vec<ValKind>,
        height: usize,
    ) {
        let label = Label(self.next_label);
        self.next_label += 1;
        self.stack.set_floor(height);
        self.controls.push(Frame {
            kind,
            label,
            params,
            results,
            height,
            unreachable: false,
            dead_nesting: 0,
            targeted: false,
            body: Vec::new(),
        });
    }

    fn top(&mut self) -> TranslateResult<&mut Frame> {
        let stack = &self.stack;
        self.controls
            .last_mut()
            .ok_or_else(|| stack.imbalance("control stack is empty".to_string()))
    }

    fn emit(&mut self, stmt: Stmt) -> TranslateResult<()> {
        self.top()?.body.push(stmt);
        Ok(())
    }

    /// Marks the rest of the current frame dead after an unconditional transfer.
    fn terminate(&mut self) -> TranslateResult<()> {
        let frame = self.top()?;
        frame.unreachable = true;
        let height = frame.height;
        self.stack.truncate(height);
        Ok(())
    }

    fn step(&mut self, op: &Operator<'a>, offset: usize) -> TranslateResult<()> {
        let frame = self.top()?;
        if frame.unreachable {
            match op {
                Operator::Block { .. } | Operator::Loop { .. } | Operator::If { .. } => {
                    frame.dead_nesting += 1;
                    return Ok(());
                }
                Operator::Else | Operator::End if frame.dead_nesting > 0 => {
                    if matches!(op, Operator::End) {
                        frame.dead_nesting -= 1;
                    }
                    return Ok(());
                }
                Operator::Else | Operator::End => {}
                _ => return Ok(()),
            }
        }

        if let Some(op) = NumOp::from_operator(op) {
            let (args, result) = self.stack.apply(op.params(), op.result())?;
            return self.emit(Stmt::Assign(result, Expr::Numeric(op, args)));
        }
        if let Some((op, mem_offset, memory)) = LoadOp::from_operator(op) {
            self.check_memory(memory, offset)?;
            let (args, result) = self.stack.apply(&[ValKind::I32], op.result())?;
            return self.emit(Stmt::Assign(
                result,
                Expr::Load {
                    op,
                    addr: args[0],
                    offset: mem_offset,
                },
            ));
        }
        if let Some((op, mem_offset, memory)) = StoreOp::from_operator(op) {
            self.check_memory(memory, offset)?;
            let args = self.stack.pop_many(&[ValKind::I32, op.value()])?;
            return self.emit(Stmt::Store {
                op,
                addr: args[0],
                offset: mem_offset,
                value: args[1],
            });
        }

        match op {
            Operator::Unreachable => {
                self.emit(Stmt::Trap("unreachable"))?;
                self.terminate()
            }
            Operator::Nop => Ok(()),
            Operator::Block { blockty } => {
                let (params, results) = self.block_type(*blockty, offset)?;
                self.stack.peek(&params)?;
                let height = self.stack.height() - params.len();
                self.push_frame(FrameKind::Block, params, results, height);
                Ok(())
            }
            Operator::Loop { blockty } => {
                let (params, results) = self.block_type(*blockty, offset)?;
                self.stack.peek(&params)?;
                let height = self.stack.height() - params.len();
                self.stack.forget_constants(height);
                self.push_frame(FrameKind::Loop, params, results, height);
                Ok(())
            }
            Operator::If { blockty } => {
                let (params, results) = self.block_type(*blockty, offset)?;
                if !params.is_empty() {
                    return Err(TranslateError::unsupported(offset, "if with block parameters"));
                }
                let cond = self.stack.pop(ValKind::I32)?;
                let height = self.stack.height();
                self.push_frame(FrameKind::If { cond }, params, results, height);
                Ok(())
            }
            Operator::Else => self.begin_else(offset),
            Operator::End => self.end_frame(),
            Operator::Br { relative_depth } => {
                let jump = self.jump_to(*relative_depth)?;
                self.emit(Stmt::Jump(jump))?;
                self.terminate()
            }
            Operator::BrIf { relative_depth } => {
                let cond = self.stack.pop(ValKind::I32)?;
                let jump = self.jump_to(*relative_depth)?;
                self.emit(Stmt::BranchIf { cond, jump })
            }
            Operator::BrTable { targets } => {
                let index = self.stack.pop(ValKind::I32)?;
                let mut jumps = Vec::with_capacity(targets.len() as usize);
                for depth in targets.targets() {
                    jumps.push(self.jump_to(depth?)?);
                }
                let default = self.jump_to(targets.default())?;
                self.emit(Stmt::Switch {
                    index,
                    targets: jumps,
                    default,
                })?;
                self.terminate()
            }
            Operator::Return => {
                let depth = self.controls.len() as u32 - 1;
                let jump = self.jump_to(depth)?;
                self.emit(Stmt::Jump(jump))?;
                self.terminate()
            }
            Operator::Call { function_index } => {
                let module = self.module;
                let ty = module
                    .funcs
                    .get(*function_index as usize)
                    .and_then(|func| module.types.get(func.type_index as usize))
                    .ok_or_else(|| {
                        TranslateError::malformed(
                            offset,
                            format!("call to missing function {function_index}"),
                        )
                    })?;
                self.call(ty, offset, |args| Expr::Call {
                    func: *function_index,
                    args,
                })
            }
            Operator::CallIndirect {
                type_index,
                table_index,
                ..
            } => self.call_indirect(*type_index, *table_index, offset),
            Operator::Drop => self.stack.pop_any().map(drop),
            Operator::Select => self.select(None),
            Operator::TypedSelect { ty } => {
                let kind = val_kinds(&[*ty], offset)?[0];
                self.select(Some(kind))
            }
            Operator::LocalGet { local_index } => {
                let kind = self.local(*local_index, offset)?;
                let slot = self.stack.push(kind);
                self.emit(Stmt::Assign(slot, Expr::Local(*local_index)))
            }
            Operator::LocalSet { local_index } => {
                let kind = self.local(*local_index, offset)?;
                let value = self.stack.pop(kind)?;
                self.emit(Stmt::SetLocal(*local_index, value))
            }
            Operator::LocalTee { local_index } => {
                let kind = self.local(*local_index, offset)?;
                let value = self.stack.pop(kind)?;
                self.stack.push(kind);
                self.emit(Stmt::SetLocal(*local_index, value))
            }
            Operator::GlobalGet { global_index } => {
                let kind = self.global(*global_index, offset)?.kind;
                let slot = self.stack.push(kind);
                self.emit(Stmt::Assign(slot, Expr::Global(*global_index)))
            }
            Operator::GlobalSet { global_index } => {
                let global = self.global(*global_index, offset)?;
                if !global.mutable {
                    return Err(TranslateError::malformed(
                        offset,
                        format!("global {global_index} is immutable"),
                    ));
                }
                let kind = global.kind;
                let value = self.stack.pop(kind)?;
                self.emit(Stmt::SetGlobal(*global_index, value))
            }
            Operator::MemorySize { mem } => {
                self.check_memory(*mem, offset)?;
                let slot = self.stack.push(ValKind::I32);
                self.emit(Stmt::Assign(slot, Expr::MemorySize))
            }
            Operator::MemoryGrow { mem } => {
                self.check_memory(*mem, offset)?;
                let (args, result) = self.stack.apply(&[ValKind::I32], ValKind::I32)?;
                self.emit(Stmt::Assign(result, Expr::MemoryGrow(args[0])))
            }
            Operator::MemoryCopy { dst_mem, src_mem } => {
                self.check_memory(*dst_mem, offset)?;
                self.check_memory(*src_mem, offset)?;
                let args = self.stack.pop_many(&[ValKind::I32; 3])?;
                self.emit(Stmt::MemoryCopy {
                    dst: args[0],
                    src: args[1],
                    len: args[2],
                })
            }
            Operator::MemoryFill { mem } => {
                self.check_memory(*mem, offset)?;
                let args = self.stack.pop_many(&[ValKind::I32; 3])?;
                self.emit(Stmt::MemoryFill {
                    dst: args[0],
                    value: args[1],
                    len: args[2],
                })
            }
            Operator::I32Const { value } => self.constant(Value::I32(*value)),
            Operator::I64Const { value } => self.constant(Value::I64(*value)),
            Operator::F32Const { value } => self.constant(Value::F32(f32::from_bits(value.bits()))),
            Operator::F64Const { value } => self.constant(Value::F64(f64::from_bits(value.bits()))),
            other => Err(TranslateError::unsupported(
                offset,
                format!("instruction {other:?}"),
            )),
        }
    }

    fn constant(&mut self, value: Value) -> TranslateResult<()> {
        let slot = self.stack.push_const(value);
        self.emit(Stmt::Assign(slot, Expr::Const(value)))
    }

    fn select(&mut self, kind: Option<ValKind>) -> TranslateResult<()> {
        let cond = self.stack.pop(ValKind::I32)?;
        let other = match kind {
            Some(kind) => self.stack.pop(kind)?,
            None => self.stack.pop_any()?,
        };
        let then = self.stack.pop(other.kind)?;
        let slot = self.stack.push(other.kind);
        self.emit(Stmt::Assign(slot, Expr::Select { cond, then, other }))
    }

    fn call(
        &mut self,
        ty: &FuncType,
        offset: usize,
        call: impl FnOnce(Vec<Slot>) -> Expr,
    ) -> TranslateResult<()> {
        if ty.results.len() > 1 {
            return Err(TranslateError::unsupported(offset, "calls with multiple results"));
        }
        let args = self.stack.pop_many(&ty.params)?;
        match ty.results.first() {
            Some(kind) => {
                let slot = self.stack.push(*kind);
                self.emit(Stmt::Assign(slot, call(args)))
            }
            None => self.emit(Stmt::Effect(call(args))),
        }
    }

    fn call_indirect(&mut self, type_index: u32, table: u32, offset: usize) -> TranslateResult<()> {
        let module = self.module;
        if module.tables.get(table as usize).is_none() {
            return Err(TranslateError::malformed(
                offset,
                format!("call_indirect through missing table {table}"),
            ));
        }
        let (ty, signature) = module
            .types
            .get(type_index as usize)
            .zip(module.signatures.canonical(type_index))
            .ok_or_else(|| {
                TranslateError::malformed(offset, format!("type index {type_index} out of bounds"))
            })?;
        let (index, constant) = self.stack.pop_constant(ValKind::I32)?;
        if let Some(slot) = constant {
            self.check_indirect_call(table, slot, signature, offset)?;
        }
        self.call(ty, offset, |args| Expr::CallIndirect {
            signature,
            table,
            index,
            args,
        })
    }

    /// Resolves a statically known table slot against the call site's signature.
    fn check_indirect_call(
        &self,
        table: u32,
        slot: i32,
        signature: u32,
        offset: usize,
    ) -> TranslateResult<()> {
        let mismatch = |detail: String| TranslateError::CallSignatureMismatch {
            func: self.func,
            offset,
            detail,
        };
        let entries = &self.module.tables[table as usize].entries;
        let callee = entries
            .get(slot as u32 as usize)
            .copied()
            .ok_or_else(|| {
                mismatch(format!(
                    "slot {} is outside table {table} of {} entries",
                    slot as u32,
                    entries.len()
                ))
            })?
            .ok_or_else(|| mismatch(format!("slot {} of table {table} is null", slot as u32)))?;
        let actual = self
            .module
            .func_signature(callee)
            .map_err(|_| mismatch(format!("slot {} refers to missing function {callee}", slot as u32)))?;
        if actual != signature {
            let expected = &self.module.signatures.unique()[signature as usize];
            let found = &self.module.signatures.unique()[actual as usize];
            return Err(mismatch(format!(
                "function {callee} in slot {} has type {found}, call site expects {expected}",
                slot as u32
            )));
        }
        Ok(())
    }

    fn jump_to(&mut self, depth: u32) -> TranslateResult<Jump> {
        let position = depth
            .checked_add(1)
            .and_then(|levels| (self.controls.len() as u32).checked_sub(levels))
            .ok_or_else(|| {
                self.stack.imbalance(format!(
                    "branch depth {depth} exceeds {} enclosing blocks",
                    self.controls.len()
                ))
            })? as usize;
        let frame = &self.controls[position];
        let values = self.stack.peek(frame.branch_kinds())?;
        let label = frame.label;
        let height = frame.height;
        let target = match frame.kind {
            FrameKind::Function => {
                return Ok(Jump {
                    moves: Vec::new(),
                    target: Target::Return(values.first().copied()),
                })
            }
            FrameKind::Loop => Target::Continue(label),
            _ => Target::Exit(label),
        };
        self.controls[position].targeted = true;

        let mut moves = Vec::new();
        for (i, from) in values.into_iter().enumerate() {
            let to = Slot {
                depth: (height + i) as u32,
                kind: from.kind,
            };
            self.stack.record(to);
            if from != to {
                moves.push(Move { from, to });
            }
        }
        Ok(Jump { moves, target })
    }

    fn begin_else(&mut self, offset: usize) -> TranslateResult<()> {
        let frame = self.top()?;
        let FrameKind::If { cond } = frame.kind else {
            return Err(TranslateError::malformed(offset, "else without a matching if"));
        };
        let (height, reachable) = (frame.height, !frame.unreachable);
        if reachable {
            let results = frame.results.clone();
            self.stack.expect_exact(height, &results)?;
        }
        let frame = self.top()?;
        let then = std::mem::take(&mut frame.body);
        frame.kind = FrameKind::Else { cond, then };
        frame.unreachable = false;
        frame.dead_nesting = 0;
        let params = frame.params.clone();
        self.stack.reset(height, &params);
        Ok(())
    }

    fn end_frame(&mut self) -> TranslateResult<()> {
        let frame = self
            .controls
            .pop()
            .ok_or_else(|| self.stack.imbalance("end without an open block".to_string()))?;
        if !frame.unreachable {
            self.stack.expect_exact(frame.height, &frame.results)?;
        }
        if matches!(frame.kind, FrameKind::If { .. }) && frame.params != frame.results {
            return Err(self.stack.imbalance(format!(
                "if without else yields {} values but takes none",
                frame.results.len()
            )));
        }
        self.stack.reset(frame.height, &frame.results);
        if let Some(parent) = self.controls.last() {
            self.stack.set_floor(parent.height);
        }

        let label = frame.targeted.then_some(frame.label);
        let stmt = match frame.kind {
            FrameKind::Function => {
                let mut body = frame.body;
                if !frame.unreachable && !frame.results.is_empty() {
                    let result = self.stack.peek(&frame.results)?;
                    body.push(Stmt::Jump(Jump {
                        moves: Vec::new(),
                        target: Target::Return(result.first().copied()),
                    }));
                }
                self.finished = Some(body);
                return Ok(());
            }
            FrameKind::Block => Stmt::Block {
                label,
                body: frame.body,
            },
            FrameKind::Loop => Stmt::Loop {
                label,
                body: frame.body,
            },
            FrameKind::If { cond } => Stmt::If {
                label,
                cond,
                then: frame.body,
                otherwise: Vec::new(),
            },
            FrameKind::Else { cond, then } => Stmt::If {
                label,
                cond,
                then,
                otherwise: frame.body,
            },
        };
        self.emit(stmt)
    }

    fn block_type(
        &self,
        ty: BlockType,
        offset: usize,
    ) -> TranslateResult<(Vec<ValKind>, Vec<ValKind>)> {
        match ty {
            BlockType::Empty => Ok((Vec::new(), Vec::new())),
            BlockType::Type(ty) => Ok((Vec::new(), val_kinds(&[ty], offset)?)),
            BlockType::FuncType(index) => {
                let ty = self.module.types.get(index as usize).ok_or_else(|| {
                    TranslateError::malformed(offset, format!("block type {index} out of bounds"))
                })?;
                Ok((ty.params.clone(), ty.results.clone()))
            }
        }
    }

    fn local(&self, index: u32, offset: usize) -> TranslateResult<ValKind> {
        self.locals.get(index as usize).copied().ok_or_else(|| {
            TranslateError::malformed(offset, format!("local index {index} out of bounds"))
        })
    }

    fn global(&self, index: u32, offset: usize) -> TranslateResult<&crate::wasm::Global> {
        self.module.globals.get(index as usize).ok_or_else(|| {
            TranslateError::malformed(offset, format!("global index {index} out of bounds"))
        })
    }

    fn check_memory(&self, memory: u32, offset: usize) -> TranslateResult<()> {
        if memory != 0 || self.module.memory.is_none() {
            return Err(TranslateError::malformed(
                offset,
                format!("memory {memory} is not defined"),
            ));
        }
        Ok(())
    }
}
