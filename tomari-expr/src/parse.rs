//! 式のパーサー
//!
//! C風の式を優先順位上昇法でパースします。識別子はパース時に
//! [`SymbolLookup`] を使ってシンボルに束縛されるため、同じテキストでも
//! パースする位置（スコープ）によって有効・無効が変わります。

use crate::error::ParseError;
use crate::expr::{BinaryOp, Expression, Node, ScalarType, UnaryOp};
use crate::symbol::{SymbolLookup, SymbolStorage};

/// トークン
#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Num(u64),
    Ident(String),
    Reg(String),
    Op(&'static str),
    LParen,
    RParen,
    LBrace,
    RBrace,
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::Num(n) => n.to_string(),
            Token::Ident(s) => s.clone(),
            Token::Reg(s) => format!("${}", s),
            Token::Op(op) => op.to_string(),
            Token::LParen => "(".to_string(),
            Token::RParen => ")".to_string(),
            Token::LBrace => "{".to_string(),
            Token::RBrace => "}".to_string(),
        }
    }
}

const TWO_CHAR_OPS: [&str; 8] = ["<<", ">>", "<=", ">=", "==", "!=", "&&", "||"];
const ONE_CHAR_OPS: [&str; 12] = ["+", "-", "*", "/", "%", "&", "|", "^", "~", "!", "<", ">"];

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// 字句解析
fn tokenize(text: &str) -> Result<Vec<(usize, Token)>, ParseError> {
    let chars: Vec<(usize, char)> = text.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let (pos, c) = chars[i];

        if c.is_whitespace() {
            i += 1;
            continue;
        }

        if c.is_ascii_digit() {
            while i < chars.len() && is_ident_char(chars[i].1) {
                i += 1;
            }
            let end = chars.get(i).map(|(p, _)| *p).unwrap_or(text.len());
            let lexeme = &text[pos..end];
            let value = if let Some(hex) = lexeme
                .strip_prefix("0x")
                .or_else(|| lexeme.strip_prefix("0X"))
            {
                u64::from_str_radix(hex, 16)
            } else {
                lexeme.parse::<u64>()
            }
            .map_err(|_| ParseError::InvalidNumber(lexeme.to_string()))?;
            tokens.push((pos, Token::Num(value)));
            continue;
        }

        if c.is_ascii_alphabetic() || c == '_' || c == '$' {
            let is_reg = c == '$';
            if is_reg {
                i += 1;
            }
            let name_start = chars.get(i).map(|(p, _)| *p).unwrap_or(text.len());
            while i < chars.len() && is_ident_char(chars[i].1) {
                i += 1;
            }
            let end = chars.get(i).map(|(p, _)| *p).unwrap_or(text.len());
            let name = text[name_start..end].to_string();
            if is_reg {
                if name.is_empty() {
                    return Err(ParseError::UnexpectedChar { pos, ch: '$' });
                }
                tokens.push((pos, Token::Reg(name)));
            } else {
                tokens.push((pos, Token::Ident(name)));
            }
            continue;
        }

        let rest = &text[pos..];
        if let Some(op) = TWO_CHAR_OPS.iter().find(|op| rest.starts_with(**op)) {
            tokens.push((pos, Token::Op(*op)));
            i += 2;
            continue;
        }
        if let Some(op) = ONE_CHAR_OPS.iter().find(|op| rest.starts_with(**op)) {
            tokens.push((pos, Token::Op(*op)));
            i += 1;
            continue;
        }

        let token = match c {
            '(' => Token::LParen,
            ')' => Token::RParen,
            '{' => Token::LBrace,
            '}' => Token::RBrace,
            _ => return Err(ParseError::UnexpectedChar { pos, ch: c }),
        };
        tokens.push((pos, token));
        i += 1;
    }

    Ok(tokens)
}

fn binary_op(op: &str) -> Option<BinaryOp> {
    let op = match op {
        "*" => BinaryOp::Mul,
        "/" => BinaryOp::Div,
        "%" => BinaryOp::Rem,
        "+" => BinaryOp::Add,
        "-" => BinaryOp::Sub,
        "<<" => BinaryOp::Shl,
        ">>" => BinaryOp::Shr,
        "<" => BinaryOp::Lt,
        "<=" => BinaryOp::Le,
        ">" => BinaryOp::Gt,
        ">=" => BinaryOp::Ge,
        "==" => BinaryOp::Eq,
        "!=" => BinaryOp::Ne,
        "&" => BinaryOp::BitAnd,
        "^" => BinaryOp::BitXor,
        "|" => BinaryOp::BitOr,
        "&&" => BinaryOp::LogAnd,
        "||" => BinaryOp::LogOr,
        _ => return None,
    };
    Some(op)
}

struct Parser<'a> {
    text: &'a str,
    tokens: Vec<(usize, Token)>,
    pos: usize,
    lookup: &'a dyn SymbolLookup,
    scope_pc: Option<u64>,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn next(&mut self) -> Option<(usize, Token)> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, expected: Token) -> Result<(), ParseError> {
        match self.next() {
            Some((_, t)) if t == expected => Ok(()),
            Some((pos, t)) => Err(ParseError::UnexpectedToken {
                pos,
                found: t.describe(),
            }),
            None => Err(ParseError::UnexpectedEnd),
        }
    }

    fn parse_binary(&mut self, min_prec: u8) -> Result<Node, ParseError> {
        let mut lhs = self.parse_unary()?;

        loop {
            let op = match self.peek() {
                Some(Token::Op(op)) => match binary_op(op) {
                    Some(op) => op,
                    None => break,
                },
                _ => break,
            };
            if op.precedence() < min_prec {
                break;
            }
            self.pos += 1;
            let rhs = self.parse_binary(op.precedence() + 1)?;
            lhs = Node::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }

        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Node, ParseError> {
        match self.peek() {
            Some(Token::Op("-")) => {
                self.pos += 1;
                Ok(Node::Unary {
                    op: UnaryOp::Neg,
                    operand: Box::new(self.parse_unary()?),
                })
            }
            Some(Token::Op("!")) => {
                self.pos += 1;
                Ok(Node::Unary {
                    op: UnaryOp::Not,
                    operand: Box::new(self.parse_unary()?),
                })
            }
            Some(Token::Op("~")) => {
                self.pos += 1;
                Ok(Node::Unary {
                    op: UnaryOp::BitNot,
                    operand: Box::new(self.parse_unary()?),
                })
            }
            Some(Token::Op("*")) => {
                self.pos += 1;
                Ok(Node::Deref {
                    ty: ScalarType::U64,
                    operand: Box::new(self.parse_unary()?),
                })
            }
            Some(Token::Op("&")) => {
                self.pos += 1;
                let operand = self.parse_unary()?;
                let addressable = match &operand {
                    Node::Symbol(sym) => !matches!(sym.storage, SymbolStorage::Register(_)),
                    Node::Deref { .. } => true,
                    _ => false,
                };
                if !addressable {
                    return Err(ParseError::NotAddressable);
                }
                Ok(Node::AddressOf(Box::new(operand)))
            }
            Some(Token::LBrace) => {
                self.pos += 1;
                let ty = match self.next() {
                    Some((_, Token::Ident(name))) => {
                        ScalarType::from_name(&name).ok_or(ParseError::UnknownType(name))?
                    }
                    Some((pos, t)) => {
                        return Err(ParseError::UnexpectedToken {
                            pos,
                            found: t.describe(),
                        })
                    }
                    None => return Err(ParseError::UnexpectedEnd),
                };
                self.expect(Token::RBrace)?;
                Ok(Node::Deref {
                    ty,
                    operand: Box::new(self.parse_unary()?),
                })
            }
            _ => self.parse_primary(),
        }
    }

    fn parse_primary(&mut self) -> Result<Node, ParseError> {
        match self.next() {
            Some((_, Token::Num(n))) => Ok(Node::Const(n)),
            Some((_, Token::Ident(name))) => {
                let sym = self
                    .lookup
                    .lookup_symbol(&name, self.scope_pc)
                    .ok_or(ParseError::UnknownSymbol(name))?;
                match &sym.storage {
                    SymbolStorage::Register(reg) => Ok(Node::Register {
                        name: reg.clone(),
                        number: self.lookup.register_number(reg),
                    }),
                    _ => Ok(Node::Symbol(sym)),
                }
            }
            Some((_, Token::Reg(name))) => {
                let number = self.lookup.register_number(&name);
                Ok(Node::Register { name, number })
            }
            Some((_, Token::LParen)) => {
                let node = self.parse_binary(1)?;
                self.expect(Token::RParen)?;
                Ok(node)
            }
            Some((pos, t)) => Err(ParseError::UnexpectedToken {
                pos,
                found: t.describe(),
            }),
            None => Err(ParseError::UnexpectedEnd),
        }
    }
}

/// 式をパースする
///
/// `scope_pc` はシンボル検索に使うPCです。ローカル変数はこのPCを含む
/// スコープでのみ見つかります。
pub fn parse_expression(
    text: &str,
    lookup: &dyn SymbolLookup,
    scope_pc: Option<u64>,
) -> Result<Expression, ParseError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(ParseError::Empty);
    }

    let tokens = tokenize(trimmed)?;
    let mut parser = Parser {
        text: trimmed,
        tokens,
        pos: 0,
        lookup,
        scope_pc,
    };

    let root = parser.parse_binary(1)?;

    if let Some((pos, _)) = parser.tokens.get(parser.pos) {
        return Err(ParseError::Junk(parser.text[*pos..].to_string()));
    }

    Ok(Expression::new(trimmed, root))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbol::{Scope, Symbol, SymbolTable};

    fn table() -> SymbolTable {
        let mut table = SymbolTable::new();
        table.add(Symbol::global("counter", 0x1000, 4));
        table.add(Symbol::global("arr", 0x2000, 16));
        table.add(Symbol::local("i", -8, 4, Scope::new(0x400, 0x480)).signed());
        table.add_register("pc");
        table
    }

    #[test]
    fn test_parse_precedence() {
        let t = table();
        let expr = parse_expression("1 + 2 * 3", &t, None).unwrap();
        match expr.root {
            Node::Binary { op, lhs, rhs } => {
                assert_eq!(op, BinaryOp::Add);
                assert_eq!(*lhs, Node::Const(1));
                assert!(matches!(*rhs, Node::Binary { op: BinaryOp::Mul, .. }));
            }
            other => panic!("Expected Binary, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_left_associative() {
        let t = table();
        let expr = parse_expression("10 - 4 - 3", &t, None).unwrap();
        match expr.root {
            Node::Binary { op, lhs, rhs } => {
                assert_eq!(op, BinaryOp::Sub);
                assert!(matches!(*lhs, Node::Binary { op: BinaryOp::Sub, .. }));
                assert_eq!(*rhs, Node::Const(3));
            }
            other => panic!("Expected Binary, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_symbols_and_registers() {
        let t = table();
        let expr = parse_expression("counter == 0x10 && $pc != 0", &t, None).unwrap();
        assert!(!expr.is_frame_local());

        let expr = parse_expression("$pc", &t, None).unwrap();
        assert_eq!(
            expr.root,
            Node::Register {
                name: "pc".to_string(),
                number: Some(0)
            }
        );
    }

    #[test]
    fn test_parse_local_depends_on_scope() {
        let t = table();
        let expr = parse_expression("i > 3", &t, Some(0x410)).unwrap();
        assert_eq!(expr.innermost_scope(), Some(Scope::new(0x400, 0x480)));

        let err = parse_expression("i > 3", &t, Some(0x900)).unwrap_err();
        assert_eq!(err, ParseError::UnknownSymbol("i".to_string()));
    }

    #[test]
    fn test_parse_typed_deref_and_address_of() {
        let t = table();
        let expr = parse_expression("{u32} (&arr + 4)", &t, None).unwrap();
        match expr.root {
            Node::Deref { ty, operand } => {
                assert_eq!(ty, ScalarType::U32);
                assert!(matches!(*operand, Node::Binary { op: BinaryOp::Add, .. }));
            }
            other => panic!("Expected Deref, got {:?}", other),
        }

        assert_eq!(
            parse_expression("{float} counter", &t, None).unwrap_err(),
            ParseError::UnknownType("float".to_string())
        );
        assert_eq!(
            parse_expression("&3", &t, None).unwrap_err(),
            ParseError::NotAddressable
        );
    }

    #[test]
    fn test_parse_errors() {
        let t = table();
        assert_eq!(parse_expression("   ", &t, None).unwrap_err(), ParseError::Empty);
        assert_eq!(
            parse_expression("counter 5", &t, None).unwrap_err(),
            ParseError::Junk("5".to_string())
        );
        assert_eq!(
            parse_expression("(1 + 2", &t, None).unwrap_err(),
            ParseError::UnexpectedEnd
        );
        assert!(matches!(
            parse_expression("1 # 2", &t, None).unwrap_err(),
            ParseError::UnexpectedChar { ch: '#', .. }
        ));
        assert_eq!(
            parse_expression("12ab", &t, None).unwrap_err(),
            ParseError::InvalidNumber("12ab".to_string())
        );
        assert_eq!(
            parse_expression("nosuch + 1", &t, None).unwrap_err(),
            ParseError::UnknownSymbol("nosuch".to_string())
        );
    }
}
