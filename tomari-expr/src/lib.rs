//! tomari 式評価エンジン
//!
//! ブレークポイント条件とウォッチポイント式のパース・評価・バイトコード化を行います。
//! 評価中に生成された値は値チェーンとして記録され、
//! ウォッチポイントが監視すべきメモリ領域の決定に使われます。

pub mod bytecode;
pub mod error;
pub mod eval;
pub mod expr;
pub mod parse;
pub mod symbol;
pub mod value;

pub use bytecode::{compile_for_target, format_printf, Bytecode, Op, RunOutcome};
pub use error::{EvalError, ParseError};
pub use eval::{evaluate, fetch_value_chain, EvalContext, Evaluation};
pub use expr::{BinaryOp, Expression, Node, ScalarType, UnaryOp};
pub use parse::parse_expression;
pub use symbol::{Scope, Symbol, SymbolLookup, SymbolStorage, SymbolTable};
pub use value::{Lval, Value};

/// ターゲットメモリを読み取るためのトレイト
///
/// ターゲット制御層が実装し、式評価やバイトコード実行から使われます。
pub trait MemoryReader {
    /// 指定アドレスから `size` バイト読み取る
    fn read(&self, addr: u64, size: usize) -> anyhow::Result<Vec<u8>>;

    fn read_u8(&self, addr: u64) -> anyhow::Result<u8> {
        let bytes = self.read(addr, 1)?;
        bytes
            .first()
            .copied()
            .ok_or_else(|| anyhow::anyhow!("Cannot read u8 from empty bytes"))
    }

    fn read_u64(&self, addr: u64) -> anyhow::Result<u64> {
        let bytes = self.read(addr, 8)?;
        let array: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
            anyhow::anyhow!(
                "Failed to convert {} bytes to u64 array (expected 8 bytes)",
                bytes.len()
            )
        })?;
        Ok(u64::from_le_bytes(array))
    }
}
