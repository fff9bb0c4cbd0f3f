//! 式の抽象構文木

use crate::symbol::{Scope, Symbol};
use std::fmt;

/// `{u32} addr` のような型付き参照に使うスカラー型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarType {
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
}

impl ScalarType {
    /// 型名から変換する
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "u8" => Some(ScalarType::U8),
            "u16" => Some(ScalarType::U16),
            "u32" => Some(ScalarType::U32),
            "u64" => Some(ScalarType::U64),
            "i8" => Some(ScalarType::I8),
            "i16" => Some(ScalarType::I16),
            "i32" => Some(ScalarType::I32),
            "i64" => Some(ScalarType::I64),
            _ => None,
        }
    }

    /// バイト数
    pub fn size(&self) -> usize {
        match self {
            ScalarType::U8 | ScalarType::I8 => 1,
            ScalarType::U16 | ScalarType::I16 => 2,
            ScalarType::U32 | ScalarType::I32 => 4,
            ScalarType::U64 | ScalarType::I64 => 8,
        }
    }

    pub fn is_signed(&self) -> bool {
        matches!(
            self,
            ScalarType::I8 | ScalarType::I16 | ScalarType::I32 | ScalarType::I64
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            ScalarType::U8 => "u8",
            ScalarType::U16 => "u16",
            ScalarType::U32 => "u32",
            ScalarType::U64 => "u64",
            ScalarType::I8 => "i8",
            ScalarType::I16 => "i16",
            ScalarType::I32 => "i32",
            ScalarType::I64 => "i64",
        }
    }
}

/// 単項演算子
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    /// `-x`
    Neg,
    /// `!x`
    Not,
    /// `~x`
    BitNot,
}

/// 二項演算子
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Mul,
    Div,
    Rem,
    Add,
    Sub,
    Shl,
    Shr,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    BitAnd,
    BitXor,
    BitOr,
    LogAnd,
    LogOr,
}

impl BinaryOp {
    /// 結合の強さ（大きいほど強い）
    pub fn precedence(&self) -> u8 {
        match self {
            BinaryOp::LogOr => 1,
            BinaryOp::LogAnd => 2,
            BinaryOp::BitOr => 3,
            BinaryOp::BitXor => 4,
            BinaryOp::BitAnd => 5,
            BinaryOp::Eq | BinaryOp::Ne => 6,
            BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => 7,
            BinaryOp::Shl | BinaryOp::Shr => 8,
            BinaryOp::Add | BinaryOp::Sub => 9,
            BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => 10,
        }
    }

    /// 比較演算子かどうか（結果は常に0か1）
    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            BinaryOp::Lt
                | BinaryOp::Le
                | BinaryOp::Gt
                | BinaryOp::Ge
                | BinaryOp::Eq
                | BinaryOp::Ne
                | BinaryOp::LogAnd
                | BinaryOp::LogOr
        )
    }
}

/// 式のノード
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    /// 整数リテラル
    Const(u64),
    /// パース時に束縛されたシンボル
    Symbol(Symbol),
    /// レジスタ。ターゲット側の番号が分かる場合は `number` に入る
    Register { name: String, number: Option<u16> },
    /// `*p` / `{type} p`
    Deref { ty: ScalarType, operand: Box<Node> },
    /// `&x`
    AddressOf(Box<Node>),
    Unary { op: UnaryOp, operand: Box<Node> },
    Binary {
        op: BinaryOp,
        lhs: Box<Node>,
        rhs: Box<Node>,
    },
}

impl Node {
    /// 評価結果が符号付きになるかどうか
    pub fn is_signed(&self) -> bool {
        match self {
            Node::Const(_) | Node::Register { .. } | Node::AddressOf(_) => false,
            Node::Symbol(sym) => sym.signed,
            Node::Deref { ty, .. } => ty.is_signed(),
            Node::Unary { op, operand } => match op {
                UnaryOp::Neg => true,
                UnaryOp::Not => false,
                UnaryOp::BitNot => operand.is_signed(),
            },
            Node::Binary { op, lhs, rhs } => {
                !op.is_comparison() && (lhs.is_signed() || rhs.is_signed())
            }
        }
    }

    /// 式中のシンボルを走査する
    pub fn visit_symbols<'a>(&'a self, f: &mut dyn FnMut(&'a Symbol)) {
        match self {
            Node::Symbol(sym) => f(sym),
            Node::Const(_) | Node::Register { .. } => {}
            Node::Deref { operand, .. }
            | Node::AddressOf(operand)
            | Node::Unary { operand, .. } => operand.visit_symbols(f),
            Node::Binary { lhs, rhs, .. } => {
                lhs.visit_symbols(f);
                rhs.visit_symbols(f);
            }
        }
    }
}

/// パース済みの式
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expression {
    /// 元のテキスト
    pub text: String,
    pub root: Node,
    scope: Option<Scope>,
}

impl Expression {
    pub fn new(text: &str, root: Node) -> Self {
        let mut scope: Option<Scope> = None;
        root.visit_symbols(&mut |sym| {
            if let Some(s) = sym.scope {
                scope = match scope {
                    Some(cur) if cur.len() <= s.len() => Some(cur),
                    _ => Some(s),
                };
            }
        });

        Self {
            text: text.to_string(),
            root,
            scope,
        }
    }

    /// 式が参照するローカルシンボルのうち最も内側のスコープ
    ///
    /// グローバルなシンボルだけを使う式では `None` を返します。
    pub fn innermost_scope(&self) -> Option<Scope> {
        self.scope
    }

    /// フレームに依存する式かどうか
    pub fn is_frame_local(&self) -> bool {
        self.scope.is_some()
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_innermost_scope_picks_narrowest() {
        let outer = Symbol::local("a", -8, 4, Scope::new(0x100, 0x200));
        let inner = Symbol::local("b", -16, 4, Scope::new(0x140, 0x160));
        let root = Node::Binary {
            op: BinaryOp::Add,
            lhs: Box::new(Node::Symbol(outer)),
            rhs: Box::new(Node::Symbol(inner)),
        };
        let expr = Expression::new("a + b", root);
        assert_eq!(expr.innermost_scope(), Some(Scope::new(0x140, 0x160)));
        assert!(expr.is_frame_local());
    }

    #[test]
    fn test_global_expression_has_no_scope() {
        let expr = Expression::new("g", Node::Symbol(Symbol::global("g", 0x1000, 4)));
        assert_eq!(expr.innermost_scope(), None);
        assert!(!expr.is_frame_local());
    }

    #[test]
    fn test_signedness() {
        let node = Node::Unary {
            op: UnaryOp::Neg,
            operand: Box::new(Node::Const(1)),
        };
        assert!(node.is_signed());

        let cmp = Node::Binary {
            op: BinaryOp::Lt,
            lhs: Box::new(node),
            rhs: Box::new(Node::Const(0)),
        };
        assert!(!cmp.is_signed());
    }
}
