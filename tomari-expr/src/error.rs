//! 式のパース・評価エラー

use thiserror::Error;

/// パースエラー
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("Empty expression")]
    Empty,
    #[error("Invalid character '{ch}' at offset {pos}")]
    UnexpectedChar { pos: usize, ch: char },
    #[error("Unexpected token '{found}' at offset {pos}")]
    UnexpectedToken { pos: usize, found: String },
    #[error("Unexpected end of expression")]
    UnexpectedEnd,
    #[error("Invalid number '{0}'")]
    InvalidNumber(String),
    #[error("No symbol \"{0}\" in current context.")]
    UnknownSymbol(String),
    #[error("No type named {0}.")]
    UnknownType(String),
    #[error("Attempt to take address of value not located in memory.")]
    NotAddressable,
    #[error("Junk at end of expression: '{0}'")]
    Junk(String),
}

/// 評価エラー
#[derive(Debug, Error)]
pub enum EvalError {
    #[error("Cannot access memory at address 0x{address:x}")]
    Memory {
        address: u64,
        #[source]
        source: anyhow::Error,
    },
    #[error("No frame selected.")]
    NoFrame,
    #[error("Unable to read register ${name}")]
    Register {
        name: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("Attempt to take address of value not located in memory.")]
    NotAddressable,
    #[error("Division by zero")]
    DivisionByZero,
    #[error("Value of {0} bytes cannot be used as a scalar")]
    NotScalar(usize),
    #[error("Bytecode error: {0}")]
    Bytecode(String),
}

impl EvalError {
    /// メモリ読み取りの失敗かどうか
    pub fn is_memory_error(&self) -> bool {
        matches!(self, EvalError::Memory { .. })
    }
}
