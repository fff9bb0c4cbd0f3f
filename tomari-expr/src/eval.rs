//! 式の評価
//!
//! 評価中に読み取った値はすべて値チェーンに記録されます。
//! ウォッチポイントはこのチェーンから監視すべきメモリ領域を決めます。

use crate::error::EvalError;
use crate::expr::{BinaryOp, Expression, Node, UnaryOp};
use crate::symbol::{Symbol, SymbolStorage};
use crate::value::Value;
use crate::MemoryReader;

/// 式評価に必要なターゲットへのアクセス
pub trait EvalContext: MemoryReader {
    /// 名前でレジスタを読み取る
    fn read_register(&self, name: &str) -> anyhow::Result<u64>;

    /// ターゲットのレジスタ番号でレジスタを読み取る（バイトコード実行用）
    fn read_register_by_number(&self, number: u16) -> anyhow::Result<u64> {
        Err(anyhow::anyhow!("Register number {} is not available", number))
    }

    /// 選択フレームのフレームベース。フレームがなければ `None`
    fn frame_base(&self) -> Option<u64>;
}

/// 値チェーン付きの評価結果
#[derive(Debug, Clone)]
pub struct Evaluation {
    /// 式の値。メモリ読み取りに失敗した場合は `None`
    pub value: Option<Value>,
    /// 評価中に生成された値（評価順）
    pub chain: Vec<Value>,
}

struct Evaluator<'a> {
    ctx: &'a dyn EvalContext,
    chain: Vec<Value>,
}

impl<'a> Evaluator<'a> {
    fn read_memory(&self, address: u64, len: usize) -> Result<Vec<u8>, EvalError> {
        self.ctx
            .read(address, len)
            .map_err(|source| EvalError::Memory { address, source })
    }

    fn read_register(&self, name: &str) -> Result<u64, EvalError> {
        self.ctx
            .read_register(name)
            .map_err(|source| EvalError::Register {
                name: name.to_string(),
                source,
            })
    }

    fn symbol_address(&self, sym: &Symbol) -> Result<Option<u64>, EvalError> {
        match &sym.storage {
            SymbolStorage::Static(addr) => Ok(Some(*addr)),
            SymbolStorage::FrameOffset(offset) => {
                let base = self.ctx.frame_base().ok_or(EvalError::NoFrame)?;
                Ok(Some(base.wrapping_add(*offset as u64)))
            }
            SymbolStorage::Register(_) => Ok(None),
        }
    }

    fn record(&mut self, value: Value) -> Value {
        self.chain.push(value.clone());
        value
    }

    /// メモリから値を読み取る。失敗した場合も未読の値としてチェーンに残す
    fn fetch(&mut self, address: u64, len: usize, signed: bool) -> Result<Value, EvalError> {
        match self.read_memory(address, len) {
            Ok(bytes) => Ok(self.record(Value::from_memory(address, bytes, signed))),
            Err(e) => {
                self.record(Value::lazy_memory(address, len));
                Err(e)
            }
        }
    }

    fn eval(&mut self, node: &Node) -> Result<Value, EvalError> {
        match node {
            Node::Const(v) => Ok(self.record(Value::scalar(*v, false))),
            Node::Symbol(sym) => match self.symbol_address(sym)? {
                Some(address) => self.fetch(address, sym.size, sym.signed),
                None => {
                    let reg = match &sym.storage {
                        SymbolStorage::Register(reg) => reg.as_str(),
                        _ => sym.name.as_str(),
                    };
                    let v = self.read_register(reg)?;
                    Ok(self.record(Value::from_register(reg, v)))
                }
            },
            Node::Register { name, .. } => {
                let v = self.read_register(name)?;
                Ok(self.record(Value::from_register(name, v)))
            }
            Node::Deref { ty, operand } => {
                let address = self.eval(operand)?.as_u64()?;
                self.fetch(address, ty.size(), ty.is_signed())
            }
            Node::AddressOf(operand) => {
                let address = match operand.as_ref() {
                    Node::Symbol(sym) => {
                        let address =
                            self.symbol_address(sym)?.ok_or(EvalError::NotAddressable)?;
                        self.record(Value::lazy_memory(address, sym.size));
                        address
                    }
                    Node::Deref { ty, operand } => {
                        let address = self.eval(operand)?.as_u64()?;
                        self.record(Value::lazy_memory(address, ty.size()));
                        address
                    }
                    other => self.eval(other)?.as_u64()?,
                };
                Ok(self.record(Value::scalar(address, false)))
            }
            Node::Unary { op, operand } => {
                let v = self.eval(operand)?;
                let result = match op {
                    UnaryOp::Neg => Value::scalar((v.as_u64()? as i64).wrapping_neg() as u64, true),
                    UnaryOp::Not => Value::scalar((!v.is_true()?) as u64, false),
                    UnaryOp::BitNot => Value::scalar(!v.as_u64()?, v.signed),
                };
                Ok(self.record(result))
            }
            Node::Binary { op, lhs, rhs } => {
                let result = self.eval_binary(*op, lhs, rhs)?;
                Ok(self.record(result))
            }
        }
    }

    fn eval_binary(&mut self, op: BinaryOp, lhs: &Node, rhs: &Node) -> Result<Value, EvalError> {
        // 論理演算は短絡評価
        let op = match ArithOp::from_binary(op) {
            Some(op) => op,
            None => {
                let l = self.eval(lhs)?.is_true()?;
                let result = match op {
                    BinaryOp::LogAnd => l && self.eval(rhs)?.is_true()?,
                    _ => l || self.eval(rhs)?.is_true()?,
                };
                return Ok(Value::scalar(result as u64, false));
            }
        };

        let l = self.eval(lhs)?;
        let r = self.eval(rhs)?;
        let signed = l.signed || r.signed;
        let a = l.as_u64()?;
        let b = r.as_u64()?;

        let bool_value = |cond: bool| Value::scalar(cond as u64, false);

        let value = match op {
            ArithOp::Add => Value::scalar(a.wrapping_add(b), signed),
            ArithOp::Sub => Value::scalar(a.wrapping_sub(b), signed),
            ArithOp::Mul => Value::scalar(a.wrapping_mul(b), signed),
            ArithOp::Div | ArithOp::Rem => {
                if b == 0 {
                    return Err(EvalError::DivisionByZero);
                }
                let v = match (op, signed) {
                    (ArithOp::Div, true) => (a as i64).wrapping_div(b as i64) as u64,
                    (ArithOp::Div, false) => a / b,
                    (_, true) => (a as i64).wrapping_rem(b as i64) as u64,
                    (_, false) => a % b,
                };
                Value::scalar(v, signed)
            }
            ArithOp::Shl => Value::scalar(a.wrapping_shl(b as u32), signed),
            ArithOp::Shr => {
                let v = if signed {
                    (a as i64).wrapping_shr(b as u32) as u64
                } else {
                    a.wrapping_shr(b as u32)
                };
                Value::scalar(v, signed)
            }
            ArithOp::BitAnd => Value::scalar(a & b, signed),
            ArithOp::BitOr => Value::scalar(a | b, signed),
            ArithOp::BitXor => Value::scalar(a ^ b, signed),
            ArithOp::Eq => bool_value(a == b),
            ArithOp::Ne => bool_value(a != b),
            ArithOp::Lt | ArithOp::Le | ArithOp::Gt | ArithOp::Ge => {
                let ord = if signed {
                    (a as i64).cmp(&(b as i64))
                } else {
                    a.cmp(&b)
                };
                bool_value(match op {
                    ArithOp::Lt => ord.is_lt(),
                    ArithOp::Le => ord.is_le(),
                    ArithOp::Gt => ord.is_gt(),
                    _ => ord.is_ge(),
                })
            }
        };

        Ok(value)
    }
}

/// 両辺を評価してから計算する二項演算
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Shl,
    Shr,
    BitAnd,
    BitOr,
    BitXor,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl ArithOp {
    /// 短絡評価する論理演算は `None`
    fn from_binary(op: BinaryOp) -> Option<Self> {
        Some(match op {
            BinaryOp::Add => ArithOp::Add,
            BinaryOp::Sub => ArithOp::Sub,
            BinaryOp::Mul => ArithOp::Mul,
            BinaryOp::Div => ArithOp::Div,
            BinaryOp::Rem => ArithOp::Rem,
            BinaryOp::Shl => ArithOp::Shl,
            BinaryOp::Shr => ArithOp::Shr,
            BinaryOp::BitAnd => ArithOp::BitAnd,
            BinaryOp::BitOr => ArithOp::BitOr,
            BinaryOp::BitXor => ArithOp::BitXor,
            BinaryOp::Eq => ArithOp::Eq,
            BinaryOp::Ne => ArithOp::Ne,
            BinaryOp::Lt => ArithOp::Lt,
            BinaryOp::Le => ArithOp::Le,
            BinaryOp::Gt => ArithOp::Gt,
            BinaryOp::Ge => ArithOp::Ge,
            BinaryOp::LogAnd | BinaryOp::LogOr => return None,
        })
    }
}

/// 式を評価して値を返す
pub fn evaluate(expr: &Expression, ctx: &dyn EvalContext) -> Result<Value, EvalError> {
    let mut evaluator = Evaluator {
        ctx,
        chain: Vec::new(),
    };
    evaluator.eval(&expr.root)
}

/// 式を評価し、値チェーンも返す
///
/// メモリ読み取りの失敗はエラーにせず、`value` を `None` にして
/// それまでに読み取れた値のチェーンを返します。それ以外のエラーは伝播します。
pub fn fetch_value_chain(
    expr: &Expression,
    ctx: &dyn EvalContext,
) -> Result<Evaluation, EvalError> {
    let mut evaluator = Evaluator {
        ctx,
        chain: Vec::new(),
    };
    match evaluator.eval(&expr.root) {
        Ok(value) => Ok(Evaluation {
            value: Some(value),
            chain: evaluator.chain,
        }),
        Err(e) if e.is_memory_error() => {
            tracing::debug!("Value chain of '{}' stopped at memory error: {}", expr, e);
            Ok(Evaluation {
                value: None,
                chain: evaluator.chain,
            })
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::parse::parse_expression;
    use crate::symbol::{Scope, SymbolTable};
    use crate::value::Lval;
    use std::collections::HashMap;

    /// テスト用の評価コンテキスト
    pub(crate) struct FakeContext {
        pub memory: HashMap<u64, u8>,
        pub registers: HashMap<String, u64>,
        pub frame_base: Option<u64>,
    }

    impl FakeContext {
        pub fn new() -> Self {
            Self {
                memory: HashMap::new(),
                registers: HashMap::new(),
                frame_base: None,
            }
        }

        pub fn poke(&mut self, addr: u64, bytes: &[u8]) {
            for (i, b) in bytes.iter().enumerate() {
                self.memory.insert(addr + i as u64, *b);
            }
        }
    }

    impl MemoryReader for FakeContext {
        fn read(&self, addr: u64, size: usize) -> anyhow::Result<Vec<u8>> {
            (0..size as u64)
                .map(|i| {
                    self.memory
                        .get(&(addr + i))
                        .copied()
                        .ok_or_else(|| anyhow::anyhow!("unmapped 0x{:x}", addr + i))
                })
                .collect()
        }
    }

    impl EvalContext for FakeContext {
        fn read_register(&self, name: &str) -> anyhow::Result<u64> {
            self.registers
                .get(name)
                .copied()
                .ok_or_else(|| anyhow::anyhow!("no register {}", name))
        }

        fn read_register_by_number(&self, number: u16) -> anyhow::Result<u64> {
            let name = if number == 0 { "pc" } else { "sp" };
            self.read_register(name)
        }

        fn frame_base(&self) -> Option<u64> {
            self.frame_base
        }
    }

    pub(crate) fn table() -> SymbolTable {
        let mut table = SymbolTable::new();
        table.add(Symbol::global("counter", 0x1000, 4));
        table.add(Symbol::global("ptr", 0x1008, 8));
        table.add(Symbol::global("arr", 0x2000, 16));
        table.add(Symbol::global("neg", 0x1010, 2).signed());
        table.add(Symbol::local("i", -8, 4, Scope::new(0x400, 0x480)));
        table.add_register("pc");
        table.add_register("sp");
        table
    }

    pub(crate) fn context() -> FakeContext {
        let mut ctx = FakeContext::new();
        ctx.poke(0x1000, &5u32.to_le_bytes());
        ctx.poke(0x1008, &0x2000u64.to_le_bytes());
        ctx.poke(0x2000, &[0u8; 16]);
        ctx.poke(0x1010, &(-2i16).to_le_bytes());
        ctx.registers.insert("pc".to_string(), 0x410);
        ctx.registers.insert("sp".to_string(), 0x7ff0);
        ctx
    }

    fn eval_str(text: &str, ctx: &FakeContext) -> Result<Value, EvalError> {
        let expr = parse_expression(text, &table(), Some(0x410)).unwrap();
        evaluate(&expr, ctx)
    }

    #[test]
    fn test_arithmetic() {
        let ctx = context();
        assert_eq!(eval_str("counter * 2 + 1", &ctx).unwrap().as_u64().unwrap(), 11);
        assert_eq!(eval_str("counter % 3", &ctx).unwrap().as_u64().unwrap(), 2);
        assert_eq!(eval_str("1 << 4 | 1", &ctx).unwrap().as_u64().unwrap(), 17);
        assert!(matches!(
            eval_str("counter / 0", &ctx).unwrap_err(),
            EvalError::DivisionByZero
        ));
    }

    #[test]
    fn test_signed_comparison() {
        let ctx = context();
        assert!(eval_str("neg < 0", &ctx).unwrap().is_true().unwrap());
        assert!(!eval_str("counter < 0", &ctx).unwrap().is_true().unwrap());
        assert_eq!(eval_str("neg", &ctx).unwrap().as_i64().unwrap(), -2);
    }

    #[test]
    fn test_short_circuit_skips_unreadable() {
        let ctx = context();
        let v = eval_str("counter == 0 && {u32} 0xdead0000", &ctx).unwrap();
        assert!(!v.is_true().unwrap());
    }

    #[test]
    fn test_logical_operators_yield_boolean() {
        let ctx = context();
        assert_eq!(eval_str("counter && 7", &ctx).unwrap().as_u64().unwrap(), 1);
        assert_eq!(eval_str("0 || counter", &ctx).unwrap().as_u64().unwrap(), 1);
        assert_eq!(eval_str("0 || 0", &ctx).unwrap().as_u64().unwrap(), 0);
        let v = eval_str("counter == 5 || {u32} 0xdead0000", &ctx).unwrap();
        assert!(v.is_true().unwrap());
    }

    #[test]
    fn test_frame_local_requires_frame() {
        let mut ctx = context();
        assert!(matches!(eval_str("i", &ctx).unwrap_err(), EvalError::NoFrame));

        ctx.frame_base = Some(0x7000);
        ctx.poke(0x7000 - 8, &9u32.to_le_bytes());
        assert_eq!(eval_str("i", &ctx).unwrap().as_u64().unwrap(), 9);
    }

    #[test]
    fn test_value_chain_records_memory_reads() {
        let ctx = context();
        let expr = parse_expression("*ptr + counter", &table(), None).unwrap();
        let evaluation = fetch_value_chain(&expr, &ctx).unwrap();

        let regions: Vec<(u64, usize)> = evaluation
            .chain
            .iter()
            .filter_map(|v| v.memory_range())
            .collect();
        assert_eq!(regions, vec![(0x1008, 8), (0x2000, 8), (0x1000, 4)]);
        assert_eq!(evaluation.value.unwrap().lval, Lval::NotLval);
    }

    #[test]
    fn test_value_chain_tolerates_memory_error() {
        let mut ctx = context();
        ctx.poke(0x1008, &0xdead0000u64.to_le_bytes());
        let expr = parse_expression("*ptr", &table(), None).unwrap();
        let evaluation = fetch_value_chain(&expr, &ctx).unwrap();

        assert!(evaluation.value.is_none());
        assert_eq!(evaluation.chain.len(), 2);
        assert_eq!(evaluation.chain[0].memory_range(), Some((0x1008, 8)));
        // 読めなかった領域も未読の値として残る
        assert!(evaluation.chain[1].lazy);
        assert_eq!(evaluation.chain[1].memory_range(), Some((0xdead0000, 8)));
    }

    #[test]
    fn test_address_of_is_lazy() {
        let ctx = context();
        let expr = parse_expression("{u32} (&arr + 12)", &table(), None).unwrap();
        let evaluation = fetch_value_chain(&expr, &ctx).unwrap();

        assert!(evaluation.chain[0].lazy);
        assert_eq!(evaluation.chain[0].memory_range(), Some((0x2000, 16)));
        let value = evaluation.value.unwrap();
        assert_eq!(value.memory_range(), Some((0x200c, 4)));
        assert_eq!(value.as_u64().unwrap(), 0);
    }
}
