//! Mapping of value kinds, numeric instructions and linear-memory accesses
//! onto C# types and expressions.
//!
//! Storage cells carry no signedness: each operator reinterprets its operands
//! through explicit casts, so `i32.lt_u` and `i32.lt_s` read the same `int`
//! slots differently.

use wasmparser::Operator;

use crate::wasm::{ValKind, Value};

pub fn cs_type(kind: ValKind) -> &'static str {
    match kind {
        ValKind::I32 => "int",
        ValKind::I64 => "long",
        ValKind::F32 => "float",
        ValKind::F64 => "double",
    }
}

/// Renders a constant as a C# expression that evaluates to the exact same bits.
pub fn literal(value: Value) -> String {
    match value {
        Value::I32(v) => v.to_string(),
        Value::I64(v) => format!("{v}L"),
        Value::F32(v) if v.is_finite() => format!("{v:?}f"),
        Value::F32(v) => format!("BitConverter.Int32BitsToSingle({})", v.to_bits() as i32),
        Value::F64(v) if v.is_finite() => format!("{v:?}d"),
        Value::F64(v) => format!("BitConverter.Int64BitsToDouble({}L)", v.to_bits() as i64),
    }
}

fn substitute(template: &str, operands: &[&str]) -> String {
    let mut out = template.to_string();
    for (placeholder, operand) in ["$a", "$b"].iter().zip(operands) {
        out = out.replace(placeholder, operand);
    }
    out
}

macro_rules! numeric_ops {
    ($($name:ident($($param:ident),+) -> $result:ident = $template:literal;)+) => {
        /// A numeric instruction: pops its `params`, pushes one `result`.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum NumOp {
            $($name,)+
        }

        impl NumOp {
            pub const ALL: &'static [NumOp] = &[$(NumOp::$name,)+];

            pub fn from_operator(op: &Operator<'_>) -> Option<NumOp> {
                match op {
                    $(Operator::$name => Some(NumOp::$name),)+
                    _ => None,
                }
            }

            pub fn params(self) -> &'static [ValKind] {
                match self {
                    $(NumOp::$name => &[$(ValKind::$param),+],)+
                }
            }

            pub fn result(self) -> ValKind {
                match self {
                    $(NumOp::$name => ValKind::$result,)+
                }
            }

            fn template(self) -> &'static str {
                match self {
                    $(NumOp::$name => $template,)+
                }
            }
        }
    };
}

numeric_ops! {
    I32Eqz(I32) -> I32 = "$a == 0 ? 1 : 0";
    I32Eq(I32, I32) -> I32 = "$a == $b ? 1 : 0";
    I32Ne(I32, I32) -> I32 = "$a != $b ? 1 : 0";
    I32LtS(I32, I32) -> I32 = "$a < $b ? 1 : 0";
    I32LtU(I32, I32) -> I32 = "(uint)$a < (uint)$b ? 1 : 0";
    I32GtS(I32, I32) -> I32 = "$a > $b ? 1 : 0";
    I32GtU(I32, I32) -> I32 = "(uint)$a > (uint)$b ? 1 : 0";
    I32LeS(I32, I32) -> I32 = "$a <= $b ? 1 : 0";
    I32LeU(I32, I32) -> I32 = "(uint)$a <= (uint)$b ? 1 : 0";
    I32GeS(I32, I32) -> I32 = "$a >= $b ? 1 : 0";
    I32GeU(I32, I32) -> I32 = "(uint)$a >= (uint)$b ? 1 : 0";

    I64Eqz(I64) -> I32 = "$a == 0L ? 1 : 0";
    I64Eq(I64, I64) -> I32 = "$a == $b ? 1 : 0";
    I64Ne(I64, I64) -> I32 = "$a != $b ? 1 : 0";
    I64LtS(I64, I64) -> I32 = "$a < $b ? 1 : 0";
    I64LtU(I64, I64) -> I32 = "(ulong)$a < (ulong)$b ? 1 : 0";
    I64GtS(I64, I64) -> I32 = "$a > $b ? 1 : 0";
    I64GtU(I64, I64) -> I32 = "(ulong)$a > (ulong)$b ? 1 : 0";
    I64LeS(I64, I64) -> I32 = "$a <= $b ? 1 : 0";
    I64LeU(I64, I64) -> I32 = "(ulong)$a <= (ulong)$b ? 1 : 0";
    I64GeS(I64, I64) -> I32 = "$a >= $b ? 1 : 0";
    I64GeU(I64, I64) -> I32 = "(ulong)$a >= (ulong)$b ? 1 : 0";

    F32Eq(F32, F32) -> I32 = "$a == $b ? 1 : 0";
    F32Ne(F32, F32) -> I32 = "$a != $b ? 1 : 0";
    F32Lt(F32, F32) -> I32 = "$a < $b ? 1 : 0";
    F32Gt(F32, F32) -> I32 = "$a > $b ? 1 : 0";
    F32Le(F32, F32) -> I32 = "$a <= $b ? 1 : 0";
    F32Ge(F32, F32) -> I32 = "$a >= $b ? 1 : 0";

    F64Eq(F64, F64) -> I32 = "$a == $b ? 1 : 0";
    F64Ne(F64, F64) -> I32 = "$a != $b ? 1 : 0";
    F64Lt(F64, F64) -> I32 = "$a < $b ? 1 : 0";
    F64Gt(F64, F64) -> I32 = "$a > $b ? 1 : 0";
    F64Le(F64, F64) -> I32 = "$a <= $b ? 1 : 0";
    F64Ge(F64, F64) -> I32 = "$a >= $b ? 1 : 0";

    I32Clz(I32) -> I32 = "BitOperations.LeadingZeroCount((uint)$a)";
    I32Ctz(I32) -> I32 = "BitOperations.TrailingZeroCount((uint)$a)";
    I32Popcnt(I32) -> I32 = "BitOperations.PopCount((uint)$a)";
    I32Add(I32, I32) -> I32 = "$a + $b";
    I32Sub(I32, I32) -> I32 = "$a - $b";
    I32Mul(I32, I32) -> I32 = "$a * $b";
    I32DivS(I32, I32) -> I32 = "$a / $b";
    I32DivU(I32, I32) -> I32 = "(int)((uint)$a / (uint)$b)";
    I32RemS(I32, I32) -> I32 = "$b == -1 ? 0 : $a % $b";
    I32RemU(I32, I32) -> I32 = "(int)((uint)$a % (uint)$b)";
    I32And(I32, I32) -> I32 = "$a & $b";
    I32Or(I32, I32) -> I32 = "$a | $b";
    I32Xor(I32, I32) -> I32 = "$a ^ $b";
    I32Shl(I32, I32) -> I32 = "$a << $b";
    I32ShrS(I32, I32) -> I32 = "$a >> $b";
    I32ShrU(I32, I32) -> I32 = "(int)((uint)$a >> $b)";
    I32Rotl(I32, I32) -> I32 = "(int)BitOperations.RotateLeft((uint)$a, $b)";
    I32Rotr(I32, I32) -> I32 = "(int)BitOperations.RotateRight((uint)$a, $b)";

    I64Clz(I64) -> I64 = "(long)BitOperations.LeadingZeroCount((ulong)$a)";
    I64Ctz(I64) -> I64 = "(long)BitOperations.TrailingZeroCount((ulong)$a)";
    I64Popcnt(I64) -> I64 = "(long)BitOperations.PopCount((ulong)$a)";
    I64Add(I64, I64) -> I64 = "$a + $b";
    I64Sub(I64, I64) -> I64 = "$a - $b";
    I64Mul(I64, I64) -> I64 = "$a * $b";
    I64DivS(I64, I64) -> I64 = "$a / $b";
    I64DivU(I64, I64) -> I64 = "(long)((ulong)$a / (ulong)$b)";
    I64RemS(I64, I64) -> I64 = "$b == -1L ? 0L : $a % $b";
    I64RemU(I64, I64) -> I64 = "(long)((ulong)$a % (ulong)$b)";
    I64And(I64, I64) -> I64 = "$a & $b";
    I64Or(I64, I64) -> I64 = "$a | $b";
    I64Xor(I64, I64) -> I64 = "$a ^ $b";
    I64Shl(I64, I64) -> I64 = "$a << (int)$b";
    I64ShrS(I64, I64) -> I64 = "$a >> (int)$b";
    I64ShrU(I64, I64) -> I64 = "(long)((ulong)$a >> (int)$b)";
    I64Rotl(I64, I64) -> I64 = "(long)BitOperations.RotateLeft((ulong)$a, (int)$b)";
    I64Rotr(I64, I64) -> I64 = "(long)BitOperations.RotateRight((ulong)$a, (int)$b)";

    F32Abs(F32) -> F32 = "BitConverter.Int32BitsToSingle(BitConverter.SingleToInt32Bits($a) & 0x7FFFFFFF)";
    F32Neg(F32) -> F32 = "BitConverter.Int32BitsToSingle(BitConverter.SingleToInt32Bits($a) ^ int.MinValue)";
    F32Ceil(F32) -> F32 = "MathF.Ceiling($a)";
    F32Floor(F32) -> F32 = "MathF.Floor($a)";
    F32Trunc(F32) -> F32 = "MathF.Truncate($a)";
    F32Nearest(F32) -> F32 = "MathF.Round($a, MidpointRounding.ToEven)";
    F32Sqrt(F32) -> F32 = "MathF.Sqrt($a)";
    F32Add(F32, F32) -> F32 = "$a + $b";
    F32Sub(F32, F32) -> F32 = "$a - $b";
    F32Mul(F32, F32) -> F32 = "$a * $b";
    F32Div(F32, F32) -> F32 = "$a / $b";
    F32Min(F32, F32) -> F32 = "MathF.Min($a, $b)";
    F32Max(F32, F32) -> F32 = "MathF.Max($a, $b)";
    F32Copysign(F32, F32) -> F32 = "MathF.CopySign($a, $b)";

    F64Abs(F64) -> F64 = "BitConverter.Int64BitsToDouble(BitConverter.DoubleToInt64Bits($a) & long.MaxValue)";
    F64Neg(F64) -> F64 = "BitConverter.Int64BitsToDouble(BitConverter.DoubleToInt64Bits($a) ^ long.MinValue)";
    F64Ceil(F64) -> F64 = "Math.Ceiling($a)";
    F64Floor(F64) -> F64 = "Math.Floor($a)";
    F64Trunc(F64) -> F64 = "Math.Truncate($a)";
    F64Nearest(F64) -> F64 = "Math.Round($a, MidpointRounding.ToEven)";
    F64Sqrt(F64) -> F64 = "Math.Sqrt($a)";
    F64Add(F64, F64) -> F64 = "$a + $b";
    F64Sub(F64, F64) -> F64 = "$a - $b";
    F64Mul(F64, F64) -> F64 = "$a * $b";
    F64Div(F64, F64) -> F64 = "$a / $b";
    F64Min(F64, F64) -> F64 = "Math.Min($a, $b)";
    F64Max(F64, F64) -> F64 = "Math.Max($a, $b)";
    F64Copysign(F64, F64) -> F64 = "Math.CopySign($a, $b)";

    I32WrapI64(I64) -> I32 = "(int)$a";
    I32TruncF32S(F32) -> I32 = "checked((int)$a)";
    I32TruncF32U(F32) -> I32 = "(int)checked((uint)$a)";
    I32TruncF64S(F64) -> I32 = "checked((int)$a)";
    I32TruncF64U(F64) -> I32 = "(int)checked((uint)$a)";
    I64ExtendI32S(I32) -> I64 = "(long)$a";
    I64ExtendI32U(I32) -> I64 = "(long)(uint)$a";
    I64TruncF32S(F32) -> I64 = "checked((long)$a)";
    I64TruncF32U(F32) -> I64 = "(long)checked((ulong)$a)";
    I64TruncF64S(F64) -> I64 = "checked((long)$a)";
    I64TruncF64U(F64) -> I64 = "(long)checked((ulong)$a)";
    F32ConvertI32S(I32) -> F32 = "(float)$a";
    F32ConvertI32U(I32) -> F32 = "(float)(uint)$a";
    F32ConvertI64S(I64) -> F32 = "(float)$a";
    F32ConvertI64U(I64) -> F32 = "(float)(ulong)$a";
    F32DemoteF64(F64) -> F32 = "(float)$a";
    F64ConvertI32S(I32) -> F64 = "(double)$a";
    F64ConvertI32U(I32) -> F64 = "(double)(uint)$a";
    F64ConvertI64S(I64) -> F64 = "(double)$a";
    F64ConvertI64U(I64) -> F64 = "(double)(ulong)$a";
    F64PromoteF32(F32) -> F64 = "(double)$a";
    I32ReinterpretF32(F32) -> I32 = "BitConverter.SingleToInt32Bits($a)";
    I64ReinterpretF64(F64) -> I64 = "BitConverter.DoubleToInt64Bits($a)";
    F32ReinterpretI32(I32) -> F32 = "BitConverter.Int32BitsToSingle($a)";
    F64ReinterpretI64(I64) -> F64 = "BitConverter.Int64BitsToDouble($a)";

    I32Extend8S(I32) -> I32 = "(int)(sbyte)$a";
    I32Extend16S(I32) -> I32 = "(int)(short)$a";
    I64Extend8S(I64) -> I64 = "(long)(sbyte)$a";
    I64Extend16S(I64) -> I64 = "(long)(short)$a";
    I64Extend32S(I64) -> I64 = "(long)(int)$a";

    I32TruncSatF32S(F32) -> I32 = "Numerics.TruncSatInt32($a)";
    I32TruncSatF32U(F32) -> I32 = "Numerics.TruncSatUint32($a)";
    I32TruncSatF64S(F64) -> I32 = "Numerics.TruncSatInt32($a)";
    I32TruncSatF64U(F64) -> I32 = "Numerics.TruncSatUint32($a)";
    I64TruncSatF32S(F32) -> I64 = "Numerics.TruncSatInt64($a)";
    I64TruncSatF32U(F32) -> I64 = "Numerics.TruncSatUint64($a)";
    I64TruncSatF64S(F64) -> I64 = "Numerics.TruncSatInt64($a)";
    I64TruncSatF64U(F64) -> I64 = "Numerics.TruncSatUint64($a)";
}

impl NumOp {
    /// Renders the operation over already-evaluated operand expressions.
    pub fn render(self, operands: &[&str]) -> String {
        debug_assert_eq!(operands.len(), self.params().len());
        substitute(self.template(), operands)
    }
}

macro_rules! memory_ops {
    (
        loads { $($load:ident -> $loaded:ident = $reader:literal;)+ }
        stores { $($store:ident($stored:ident) = $writer:literal, $narrow:literal;)+ }
    ) => {
        /// A linear-memory read; each width and signedness has its own accessor.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum LoadOp {
            $($load,)+
        }

        impl LoadOp {
            /// Returns the load with its static offset and memory index.
            pub fn from_operator(op: &Operator<'_>) -> Option<(LoadOp, u64, u32)> {
                match op {
                    $(Operator::$load { memarg } => {
                        Some((LoadOp::$load, memarg.offset, memarg.memory))
                    })+
                    _ => None,
                }
            }

            pub fn result(self) -> ValKind {
                match self {
                    $(LoadOp::$load => ValKind::$loaded,)+
                }
            }

            pub fn accessor(self) -> &'static str {
                match self {
                    $(LoadOp::$load => $reader,)+
                }
            }
        }

        /// A linear-memory write, narrowing the stored value where needed.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum StoreOp {
            $($store,)+
        }

        impl StoreOp {
            pub fn from_operator(op: &Operator<'_>) -> Option<(StoreOp, u64, u32)> {
                match op {
                    $(Operator::$store { memarg } => {
                        Some((StoreOp::$store, memarg.offset, memarg.memory))
                    })+
                    _ => None,
                }
            }

            pub fn value(self) -> ValKind {
                match self {
                    $(StoreOp::$store => ValKind::$stored,)+
                }
            }

            pub fn accessor(self) -> &'static str {
                match self {
                    $(StoreOp::$store => $writer,)+
                }
            }

            fn narrowing(self) -> &'static str {
                match self {
                    $(StoreOp::$store => $narrow,)+
                }
            }
        }
    };
}

memory_ops! {
    loads {
        I32Load -> I32 = "LoadInt32";
        I64Load -> I64 = "LoadInt64";
        F32Load -> F32 = "LoadFloat32";
        F64Load -> F64 = "LoadFloat64";
        I32Load8S -> I32 = "LoadInt8";
        I32Load8U -> I32 = "LoadUint8";
        I32Load16S -> I32 = "LoadInt16";
        I32Load16U -> I32 = "LoadUint16";
        I64Load8S -> I64 = "LoadInt8";
        I64Load8U -> I64 = "LoadUint8";
        I64Load16S -> I64 = "LoadInt16";
        I64Load16U -> I64 = "LoadUint16";
        I64Load32S -> I64 = "LoadInt32";
        I64Load32U -> I64 = "LoadUint32";
    }
    stores {
        I32Store(I32) = "StoreInt32", "";
        I64Store(I64) = "StoreInt64", "";
        F32Store(F32) = "StoreFloat32", "";
        F64Store(F64) = "StoreFloat64", "";
        I32Store8(I32) = "StoreInt8", "(sbyte)";
        I32Store16(I32) = "StoreInt16", "(short)";
        I64Store8(I64) = "StoreInt8", "(sbyte)";
        I64Store16(I64) = "StoreInt16", "(short)";
        I64Store32(I64) = "StoreInt32", "(int)";
    }
}

fn address(addr: &str, offset: u64) -> String {
    if offset == 0 {
        addr.to_string()
    } else {
        format!("{addr}, {offset}u")
    }
}

impl LoadOp {
    /// Narrow results widen implicitly into the `int`/`long` slot.
    pub fn render(self, memory: &str, addr: &str, offset: u64) -> String {
        format!("{memory}.{}({})", self.accessor(), address(addr, offset))
    }
}

impl StoreOp {
    pub fn render(self, memory: &str, addr: &str, offset: u64, value: &str) -> String {
        format!(
            "{memory}.{}({}, {}{value})",
            self.accessor(),
            address(addr, offset),
            self.narrowing()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_template_uses_each_operand() {
        for op in NumOp::ALL {
            let arity = op.params().len();
            assert!((1..=2).contains(&arity), "{op:?}");
            let template = op.template();
            assert!(template.contains("$a"), "{op:?}");
            assert_eq!(template.contains("$b"), arity == 2, "{op:?}");
        }
    }

    #[test]
    fn unsigned_ops_reinterpret_operands() {
        assert_eq!(
            NumOp::I32LtU.render(&["s0_i32", "s1_i32"]),
            "(uint)s0_i32 < (uint)s1_i32 ? 1 : 0"
        );
        assert_eq!(
            NumOp::I64ShrU.render(&["s0_i64", "s1_i64"]),
            "(long)((ulong)s0_i64 >> (int)s1_i64)"
        );
        assert_eq!(
            NumOp::I64ExtendI32U.render(&["s0_i32"]),
            "(long)(uint)s0_i32"
        );
    }

    #[test]
    fn signed_remainder_avoids_overflow_trap() {
        assert_eq!(
            NumOp::I32RemS.render(&["s0_i32", "s1_i32"]),
            "s1_i32 == -1 ? 0 : s0_i32 % s1_i32"
        );
    }

    #[test]
    fn operator_lookup_matches_names() {
        assert_eq!(
            NumOp::from_operator(&Operator::I32Add),
            Some(NumOp::I32Add)
        );
        assert_eq!(
            NumOp::from_operator(&Operator::F64PromoteF32),
            Some(NumOp::F64PromoteF32)
        );
        assert_eq!(NumOp::from_operator(&Operator::Nop), None);
        assert_eq!(NumOp::I64Eqz.result(), ValKind::I32);
        assert_eq!(NumOp::I32WrapI64.params(), &[ValKind::I64]);
    }

    #[test]
    fn literals_are_bit_exact() {
        assert_eq!(literal(Value::I32(i32::MIN)), "-2147483648");
        assert_eq!(literal(Value::I64(-1)), "-1L");
        assert_eq!(literal(Value::F32(1.5)), "1.5f");
        assert_eq!(literal(Value::F32(-0.0)), "-0.0f");
        assert_eq!(literal(Value::F64(0.1)), "0.1d");
        assert_eq!(
            literal(Value::F32(f32::NAN)),
            format!("BitConverter.Int32BitsToSingle({})", f32::NAN.to_bits() as i32)
        );
        assert_eq!(
            literal(Value::F64(f64::NEG_INFINITY)),
            "BitConverter.Int64BitsToDouble(-4503599627370496L)"
        );
    }

    #[test]
    fn memory_accessors_carry_offsets_and_narrowing() {
        assert_eq!(
            LoadOp::I64Load32U.render("mem_", "s0_i32", 0),
            "mem_.LoadUint32(s0_i32)"
        );
        assert_eq!(
            LoadOp::I32Load8S.render("mem_", "s3_i32", 16),
            "mem_.LoadInt8(s3_i32, 16u)"
        );
        assert_eq!(
            StoreOp::I64Store16.render("mem_", "s0_i32", 8, "s1_i64"),
            "mem_.StoreInt16(s0_i32, 8u, (short)s1_i64)"
        );
        assert_eq!(StoreOp::F32Store.value(), ValKind::F32);
        assert_eq!(LoadOp::I32Load16U.result(), ValKind::I32);
    }
}
