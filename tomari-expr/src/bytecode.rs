//! エージェント用バイトコード
//!
//! ターゲット側で条件式やdprintfを評価するためのスタックマシン命令列です。
//! オペコードの値はエージェント式の慣例に合わせています。

use crate::error::EvalError;
use crate::eval::EvalContext;
use crate::expr::{BinaryOp, Expression, Node, ScalarType, UnaryOp};
use crate::symbol::SymbolStorage;

/// 実行ステップ数の上限
const STEP_LIMIT: usize = 10_000;

/// バイトコード命令
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Add,
    Sub,
    Mul,
    DivSigned,
    DivUnsigned,
    RemSigned,
    RemUnsigned,
    Lsh,
    RshSigned,
    RshUnsigned,
    LogNot,
    BitAnd,
    BitOr,
    BitXor,
    BitNot,
    Equal,
    LessSigned,
    LessUnsigned,
    /// 下位 n ビットから符号拡張
    Ext(u8),
    Ref8,
    Ref16,
    Ref32,
    Ref64,
    /// スタックトップが非ゼロなら命令インデックスへ分岐
    IfGoto(u16),
    Goto(u16),
    Const8(u8),
    Const16(u16),
    Const32(u32),
    Const64(u64),
    Reg(u16),
    End,
    Swap,
    /// スタックから `nargs` 個の値を取り出して書式化する
    Printf { format: String, nargs: u8 },
}

impl Op {
    /// オペコード
    pub fn opcode(&self) -> u8 {
        match self {
            Op::Add => 0x02,
            Op::Sub => 0x03,
            Op::Mul => 0x04,
            Op::DivSigned => 0x05,
            Op::DivUnsigned => 0x06,
            Op::RemSigned => 0x07,
            Op::RemUnsigned => 0x08,
            Op::Lsh => 0x09,
            Op::RshSigned => 0x0a,
            Op::RshUnsigned => 0x0b,
            Op::LogNot => 0x0e,
            Op::BitAnd => 0x0f,
            Op::BitOr => 0x10,
            Op::BitXor => 0x11,
            Op::BitNot => 0x12,
            Op::Equal => 0x13,
            Op::LessSigned => 0x14,
            Op::LessUnsigned => 0x15,
            Op::Ext(_) => 0x16,
            Op::Ref8 => 0x17,
            Op::Ref16 => 0x18,
            Op::Ref32 => 0x19,
            Op::Ref64 => 0x1a,
            Op::IfGoto(_) => 0x20,
            Op::Goto(_) => 0x21,
            Op::Const8(_) => 0x22,
            Op::Const16(_) => 0x23,
            Op::Const32(_) => 0x24,
            Op::Const64(_) => 0x25,
            Op::Reg(_) => 0x26,
            Op::End => 0x27,
            Op::Swap => 0x2b,
            Op::Printf { .. } => 0x34,
        }
    }
}

/// バイトコード列
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Bytecode {
    pub ops: Vec<Op>,
}

/// バイトコード実行結果
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RunOutcome {
    /// 終了時のスタックトップ
    pub top: Option<u64>,
    /// printf の出力
    pub output: Vec<String>,
}

impl RunOutcome {
    /// 条件式として真かどうか（空スタックは偽）
    pub fn is_true(&self) -> bool {
        self.top.map(|v| v != 0).unwrap_or(false)
    }
}

fn ref_op(ty: ScalarType) -> Op {
    match ty.size() {
        1 => Op::Ref8,
        2 => Op::Ref16,
        4 => Op::Ref32,
        _ => Op::Ref64,
    }
}

fn const_op(v: u64) -> Op {
    if v <= u8::MAX as u64 {
        Op::Const8(v as u8)
    } else if v <= u16::MAX as u64 {
        Op::Const16(v as u16)
    } else if v <= u32::MAX as u64 {
        Op::Const32(v as u32)
    } else {
        Op::Const64(v)
    }
}

fn scalar_for_size(size: usize, signed: bool) -> Option<ScalarType> {
    let ty = match (size, signed) {
        (1, false) => ScalarType::U8,
        (2, false) => ScalarType::U16,
        (4, false) => ScalarType::U32,
        (8, false) => ScalarType::U64,
        (1, true) => ScalarType::I8,
        (2, true) => ScalarType::I16,
        (4, true) => ScalarType::I32,
        (8, true) => ScalarType::I64,
        _ => return None,
    };
    Some(ty)
}

struct Compiler {
    ops: Vec<Op>,
}

impl Compiler {
    fn emit(&mut self, op: Op) -> usize {
        self.ops.push(op);
        self.ops.len() - 1
    }

    fn here(&self) -> u16 {
        self.ops.len() as u16
    }

    fn patch(&mut self, at: usize, target: u16) {
        match self.ops.get_mut(at) {
            Some(Op::IfGoto(t)) | Some(Op::Goto(t)) => *t = target,
            _ => {}
        }
    }

    fn load(&mut self, ty: ScalarType) {
        self.emit(ref_op(ty));
        if ty.is_signed() && ty.size() < 8 {
            self.emit(Op::Ext((ty.size() * 8) as u8));
        }
    }

    fn compile(&mut self, node: &Node) -> Option<()> {
        match node {
            Node::Const(v) => {
                self.emit(const_op(*v));
            }
            Node::Symbol(sym) => match sym.storage {
                SymbolStorage::Static(addr) => {
                    let ty = scalar_for_size(sym.size, sym.signed)?;
                    self.emit(Op::Const64(addr));
                    self.load(ty);
                }
                _ => return None,
            },
            Node::Register { number, .. } => {
                self.emit(Op::Reg((*number)?));
            }
            Node::Deref { ty, operand } => {
                self.compile(operand)?;
                self.load(*ty);
            }
            Node::AddressOf(operand) => match operand.as_ref() {
                Node::Symbol(sym) => match sym.storage {
                    SymbolStorage::Static(addr) => {
                        self.emit(Op::Const64(addr));
                    }
                    _ => return None,
                },
                Node::Deref { operand, .. } => self.compile(operand)?,
                _ => return None,
            },
            Node::Unary { op, operand } => match op {
                UnaryOp::Neg => {
                    self.emit(Op::Const8(0));
                    self.compile(operand)?;
                    self.emit(Op::Sub);
                }
                UnaryOp::Not => {
                    self.compile(operand)?;
                    self.emit(Op::LogNot);
                }
                UnaryOp::BitNot => {
                    self.compile(operand)?;
                    self.emit(Op::BitNot);
                }
            },
            Node::Binary { op, lhs, rhs } => self.compile_binary(*op, lhs, rhs)?,
        }
        Some(())
    }

    fn compile_binary(&mut self, op: BinaryOp, lhs: &Node, rhs: &Node) -> Option<()> {
        let signed = lhs.is_signed() || rhs.is_signed();

        match op {
            BinaryOp::LogAnd => {
                // lhs; if_goto L; const 0; goto END; L: rhs; !; !; END:
                self.compile(lhs)?;
                let to_rhs = self.emit(Op::IfGoto(0));
                self.emit(Op::Const8(0));
                let to_end = self.emit(Op::Goto(0));
                let rhs_start = self.here();
                self.patch(to_rhs, rhs_start);
                self.compile(rhs)?;
                self.emit(Op::LogNot);
                self.emit(Op::LogNot);
                let end = self.here();
                self.patch(to_end, end);
                return Some(());
            }
            BinaryOp::LogOr => {
                // lhs; if_goto L; rhs; !; !; goto END; L: const 1; END:
                self.compile(lhs)?;
                let to_true = self.emit(Op::IfGoto(0));
                self.compile(rhs)?;
                self.emit(Op::LogNot);
                self.emit(Op::LogNot);
                let to_end = self.emit(Op::Goto(0));
                let true_start = self.here();
                self.patch(to_true, true_start);
                self.emit(Op::Const8(1));
                let end = self.here();
                self.patch(to_end, end);
                return Some(());
            }
            // a > b は b < a、a <= b は !(b < a)
            BinaryOp::Gt | BinaryOp::Le => {
                self.compile(rhs)?;
                self.compile(lhs)?;
            }
            _ => {
                self.compile(lhs)?;
                self.compile(rhs)?;
            }
        }

        let less = if signed {
            Op::LessSigned
        } else {
            Op::LessUnsigned
        };

        match op {
            BinaryOp::Add => {
                self.emit(Op::Add);
            }
            BinaryOp::Sub => {
                self.emit(Op::Sub);
            }
            BinaryOp::Mul => {
                self.emit(Op::Mul);
            }
            BinaryOp::Div => {
                self.emit(if signed { Op::DivSigned } else { Op::DivUnsigned });
            }
            BinaryOp::Rem => {
                self.emit(if signed { Op::RemSigned } else { Op::RemUnsigned });
            }
            BinaryOp::Shl => {
                self.emit(Op::Lsh);
            }
            BinaryOp::Shr => {
                self.emit(if signed { Op::RshSigned } else { Op::RshUnsigned });
            }
            BinaryOp::BitAnd => {
                self.emit(Op::BitAnd);
            }
            BinaryOp::BitOr => {
                self.emit(Op::BitOr);
            }
            BinaryOp::BitXor => {
                self.emit(Op::BitXor);
            }
            BinaryOp::Eq => {
                self.emit(Op::Equal);
            }
            BinaryOp::Ne => {
                self.emit(Op::Equal);
                self.emit(Op::LogNot);
            }
            BinaryOp::Lt | BinaryOp::Gt => {
                self.emit(less);
            }
            BinaryOp::Le | BinaryOp::Ge => {
                self.emit(less);
                self.emit(Op::LogNot);
            }
            BinaryOp::LogAnd | BinaryOp::LogOr => {}
        }
        Some(())
    }
}

/// 式をエージェント用バイトコードにコンパイルする
///
/// フレーム相対のシンボルやターゲット番号を持たないレジスタを含む式は
/// ターゲット側で評価できないので `None` を返します。
pub fn compile_for_target(expr: &Expression) -> Option<Bytecode> {
    let mut compiler = Compiler { ops: Vec::new() };
    if compiler.compile(&expr.root).is_none() {
        tracing::debug!("Expression '{}' is not compilable for the target", expr);
        return None;
    }
    compiler.emit(Op::End);
    Some(Bytecode { ops: compiler.ops })
}

/// printf 形式の文字列を書式化する
///
/// `%d` `%i` `%u` `%x` `%c` `%%` と `l` 修飾子を扱います。
pub fn format_printf(format: &str, args: &[u64]) -> String {
    let mut out = String::new();
    let mut args = args.iter();
    let mut chars = format.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        while matches!(chars.peek(), Some('l')) {
            chars.next();
        }
        match chars.next() {
            Some('%') => out.push('%'),
            Some('d') | Some('i') => {
                out.push_str(&args.next().map(|v| (*v as i64).to_string()).unwrap_or_default())
            }
            Some('u') => out.push_str(&args.next().map(|v| v.to_string()).unwrap_or_default()),
            Some('x') => {
                out.push_str(&args.next().map(|v| format!("{:x}", v)).unwrap_or_default())
            }
            Some('c') => {
                if let Some(v) = args.next() {
                    out.push(char::from(*v as u8));
                }
            }
            Some(other) => {
                out.push('%');
                out.push(other);
            }
            None => out.push('%'),
        }
    }

    out
}

impl Bytecode {
    /// dprintf 用のコマンドバイトコードを作成する
    ///
    /// 引数のいずれかがターゲットで評価できなければ `None` を返します。
    pub fn printf(format: &str, args: &[Expression]) -> Option<Bytecode> {
        let mut compiler = Compiler { ops: Vec::new() };
        for arg in args {
            compiler.compile(&arg.root)?;
        }
        compiler.emit(Op::Printf {
            format: format.to_string(),
            nargs: u8::try_from(args.len()).ok()?,
        });
        compiler.emit(Op::End);
        Some(Bytecode { ops: compiler.ops })
    }

    /// 命令数
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// ワイヤー形式のバイト列に変換する（オペランドはビッグエンディアン）
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for op in &self.ops {
            out.push(op.opcode());
            match op {
                Op::Ext(bits) => out.push(*bits),
                Op::IfGoto(t) | Op::Goto(t) | Op::Const16(t) | Op::Reg(t) => {
                    out.extend_from_slice(&t.to_be_bytes())
                }
                Op::Const8(v) => out.push(*v),
                Op::Const32(v) => out.extend_from_slice(&v.to_be_bytes()),
                Op::Const64(v) => out.extend_from_slice(&v.to_be_bytes()),
                Op::Printf { format, nargs } => {
                    out.push(*nargs);
                    out.extend_from_slice(&(format.len() as u16 + 1).to_be_bytes());
                    out.extend_from_slice(format.as_bytes());
                    out.push(0);
                }
                _ => {}
            }
        }
        out
    }

    /// バイトコードを実行する
    pub fn run(&self, ctx: &dyn EvalContext) -> Result<RunOutcome, EvalError> {
        let mut stack: Vec<u64> = Vec::new();
        let mut output = Vec::new();
        let mut pc = 0usize;
        let mut steps = 0usize;

        fn pop(stack: &mut Vec<u64>) -> Result<u64, EvalError> {
            stack
                .pop()
                .ok_or_else(|| EvalError::Bytecode("stack underflow".to_string()))
        }

        loop {
            steps += 1;
            if steps > STEP_LIMIT {
                return Err(EvalError::Bytecode("step limit exceeded".to_string()));
            }

            let op = self
                .ops
                .get(pc)
                .ok_or_else(|| EvalError::Bytecode(format!("pc {} out of range", pc)))?;
            pc += 1;

            match op {
                Op::End => {
                    return Ok(RunOutcome {
                        top: stack.last().copied(),
                        output,
                    })
                }
                Op::Const8(v) => stack.push(*v as u64),
                Op::Const16(v) => stack.push(*v as u64),
                Op::Const32(v) => stack.push(*v as u64),
                Op::Const64(v) => stack.push(*v),
                Op::Reg(n) => {
                    let v = ctx.read_register_by_number(*n).map_err(|source| {
                        EvalError::Register {
                            name: format!("#{}", n),
                            source,
                        }
                    })?;
                    stack.push(v);
                }
                Op::Ref8 | Op::Ref16 | Op::Ref32 | Op::Ref64 => {
                    let address = pop(&mut stack)?;
                    let size = match op {
                        Op::Ref8 => 1,
                        Op::Ref16 => 2,
                        Op::Ref32 => 4,
                        _ => 8,
                    };
                    let bytes = ctx
                        .read(address, size)
                        .map_err(|source| EvalError::Memory { address, source })?;
                    let n = size.min(bytes.len());
                    let mut buf = [0u8; 8];
                    buf[..n].copy_from_slice(&bytes[..n]);
                    stack.push(u64::from_le_bytes(buf));
                }
                Op::Ext(bits) => {
                    let v = pop(&mut stack)?;
                    if *bits == 0 || *bits >= 64 {
                        stack.push(v);
                    } else {
                        let shift = 64 - *bits as u32;
                        stack.push((((v << shift) as i64) >> shift) as u64);
                    }
                }
                Op::LogNot => {
                    let v = pop(&mut stack)?;
                    stack.push((v == 0) as u64);
                }
                Op::BitNot => {
                    let v = pop(&mut stack)?;
                    stack.push(!v);
                }
                Op::Swap => {
                    let b = pop(&mut stack)?;
                    let a = pop(&mut stack)?;
                    stack.push(b);
                    stack.push(a);
                }
                Op::IfGoto(target) => {
                    if pop(&mut stack)? != 0 {
                        pc = *target as usize;
                    }
                }
                Op::Goto(target) => pc = *target as usize,
                Op::Printf { format, nargs } => {
                    let n = *nargs as usize;
                    if stack.len() < n {
                        return Err(EvalError::Bytecode("stack underflow".to_string()));
                    }
                    let args = stack.split_off(stack.len() - n);
                    output.push(format_printf(format, &args));
                }
                binary => {
                    let b = pop(&mut stack)?;
                    let a = pop(&mut stack)?;
                    let v = match binary {
                        Op::Add => a.wrapping_add(b),
                        Op::Sub => a.wrapping_sub(b),
                        Op::Mul => a.wrapping_mul(b),
                        Op::DivSigned | Op::DivUnsigned | Op::RemSigned | Op::RemUnsigned
                            if b == 0 =>
                        {
                            return Err(EvalError::DivisionByZero)
                        }
                        Op::DivSigned => (a as i64).wrapping_div(b as i64) as u64,
                        Op::DivUnsigned => a / b,
                        Op::RemSigned => (a as i64).wrapping_rem(b as i64) as u64,
                        Op::RemUnsigned => a % b,
                        Op::Lsh => a.wrapping_shl(b as u32),
                        Op::RshSigned => (a as i64).wrapping_shr(b as u32) as u64,
                        Op::RshUnsigned => a.wrapping_shr(b as u32),
                        Op::BitAnd => a & b,
                        Op::BitOr => a | b,
                        Op::BitXor => a ^ b,
                        Op::Equal => (a == b) as u64,
                        Op::LessSigned => ((a as i64) < (b as i64)) as u64,
                        Op::LessUnsigned => (a < b) as u64,
                        other => {
                            return Err(EvalError::Bytecode(format!(
                                "unexpected opcode 0x{:02x}",
                                other.opcode()
                            )))
                        }
                    };
                    stack.push(v);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::evaluate;
    use crate::eval::tests::{context, table};
    use crate::parse::parse_expression;

    fn compile(text: &str) -> Option<Bytecode> {
        let expr = parse_expression(text, &table(), Some(0x410)).unwrap();
        compile_for_target(&expr)
    }

    #[test]
    fn test_bytecode_matches_host_evaluation() {
        let ctx = context();
        for text in [
            "counter == 5",
            "counter != 5",
            "counter > 4 && counter <= 5",
            "counter < 3 || counter >= 5",
            "neg < 0",
            "neg / 2 == -1",
            "-counter + 10",
            "(counter << 2) >> 1",
            "~0 & 0xff",
            "!counter",
            "*ptr == 0",
            "$pc == 0x410",
        ] {
            let expr = parse_expression(text, &table(), Some(0x410)).unwrap();
            let host = evaluate(&expr, &ctx).unwrap().as_u64().unwrap();
            let code = compile_for_target(&expr).unwrap();
            let outcome = code.run(&ctx).unwrap();
            assert_eq!(outcome.top, Some(host), "mismatch for '{}'", text);
        }
    }

    #[test]
    fn test_frame_local_not_compilable() {
        assert!(compile("i == 3").is_none());
        assert!(compile("$fp == 0").is_none());
        assert!(compile("counter == 3").is_some());
    }

    #[test]
    fn test_printf_bytecode() {
        let ctx = context();
        let args = vec![parse_expression("counter", &table(), None).unwrap()];
        let code = Bytecode::printf("counter=%d\n", &args).unwrap();
        let outcome = code.run(&ctx).unwrap();
        assert_eq!(outcome.output, vec!["counter=5\n".to_string()]);
    }

    #[test]
    fn test_format_printf() {
        assert_eq!(format_printf("%d %u %x %%", &[(-1i64) as u64, 7, 255]), "-1 7 ff %");
        assert_eq!(format_printf("%ld %c", &[3, 65]), "3 A");
    }

    #[test]
    fn test_to_bytes_encoding() {
        let code = compile("counter == 5").unwrap();
        let bytes = code.to_bytes();
        assert_eq!(bytes[0], 0x25);
        assert_eq!(&bytes[1..9], &0x1000u64.to_be_bytes());
        assert_eq!(bytes[9], 0x19);
        assert_eq!(*bytes.last().unwrap(), 0x27);
    }
}
