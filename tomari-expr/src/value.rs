//! 評価結果の値

use crate::error::EvalError;
use std::fmt;

/// 値の置き場所
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Lval {
    /// ターゲットメモリ上の領域
    Memory { address: u64, len: usize },
    /// レジスタ
    Register(String),
    /// 計算結果や定数
    NotLval,
}

/// 値
///
/// 中身はリトルエンディアンのバイト列で保持します。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Value {
    pub bytes: Vec<u8>,
    pub lval: Lval,
    pub signed: bool,
    /// 中身を読み取っていない場合は true（`&x` のオペランドなど）
    pub lazy: bool,
}

impl Value {
    /// 8バイトの計算結果を作成する
    pub fn scalar(v: u64, signed: bool) -> Self {
        Self {
            bytes: v.to_le_bytes().to_vec(),
            lval: Lval::NotLval,
            signed,
            lazy: false,
        }
    }

    /// メモリから読み取った値を作成する
    pub fn from_memory(address: u64, bytes: Vec<u8>, signed: bool) -> Self {
        let len = bytes.len();
        Self {
            bytes,
            lval: Lval::Memory { address, len },
            signed,
            lazy: false,
        }
    }

    /// 読み取っていないメモリ上の値を作成する
    pub fn lazy_memory(address: u64, len: usize) -> Self {
        Self {
            bytes: Vec::new(),
            lval: Lval::Memory { address, len },
            signed: false,
            lazy: true,
        }
    }

    /// レジスタの値を作成する
    pub fn from_register(name: &str, v: u64) -> Self {
        Self {
            bytes: v.to_le_bytes().to_vec(),
            lval: Lval::Register(name.to_string()),
            signed: false,
            lazy: false,
        }
    }

    pub fn len(&self) -> usize {
        match (&self.lval, self.lazy) {
            (Lval::Memory { len, .. }, true) => *len,
            _ => self.bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 配列・構造体のようにスカラーとして扱えない値かどうか
    pub fn is_aggregate(&self) -> bool {
        self.len() > 8
    }

    /// メモリ上のアドレスと長さ
    pub fn memory_range(&self) -> Option<(u64, usize)> {
        match self.lval {
            Lval::Memory { address, len } => Some((address, len)),
            _ => None,
        }
    }

    /// スカラーとして u64 に変換する（符号付きなら符号拡張）
    pub fn as_u64(&self) -> Result<u64, EvalError> {
        if self.bytes.is_empty() || self.bytes.len() > 8 {
            return Err(EvalError::NotScalar(self.len()));
        }

        let mut buf = [0u8; 8];
        buf[..self.bytes.len()].copy_from_slice(&self.bytes);
        let raw = u64::from_le_bytes(buf);

        let bits = (self.bytes.len() * 8) as u32;
        if self.signed && bits < 64 {
            let shift = 64 - bits;
            Ok((((raw << shift) as i64) >> shift) as u64)
        } else {
            Ok(raw)
        }
    }

    pub fn as_i64(&self) -> Result<i64, EvalError> {
        self.as_u64().map(|v| v as i64)
    }

    /// 条件式として真かどうか
    pub fn is_true(&self) -> Result<bool, EvalError> {
        if self.is_aggregate() {
            return Ok(self.bytes.iter().any(|b| *b != 0));
        }
        Ok(self.as_u64()? != 0)
    }

    /// 中身の比較
    ///
    /// 置き場所ではなくバイト列を比較するので、配列や構造体の一部の変化も検出できます。
    pub fn contents_eq(&self, other: &Value) -> bool {
        !self.lazy && !other.lazy && self.bytes == other.bytes
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.lazy {
            return write!(f, "<not fetched>");
        }
        if self.is_aggregate() {
            let parts: Vec<String> = self.bytes.iter().map(|b| format!("0x{:02x}", b)).collect();
            return write!(f, "{{{}}}", parts.join(", "));
        }
        match self.as_u64() {
            Ok(v) if self.signed => write!(f, "{}", v as i64),
            Ok(v) => write!(f, "{}", v),
            Err(_) => write!(f, "<unavailable>"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_extension() {
        let v = Value::from_memory(0x1000, vec![0xff, 0xff], true);
        assert_eq!(v.as_i64().unwrap(), -1);

        let v = Value::from_memory(0x1000, vec![0xff, 0xff], false);
        assert_eq!(v.as_u64().unwrap(), 0xffff);
    }

    #[test]
    fn test_contents_eq_for_aggregates() {
        let old = Value::from_memory(0x2000, vec![0u8; 16], false);
        let mut bytes = vec![0u8; 16];
        bytes[12] = 7;
        let new = Value::from_memory(0x2000, bytes, false);

        assert_eq!(old.lval, new.lval);
        assert!(!old.contents_eq(&new));
        assert!(old.contents_eq(&old.clone()));
        assert!(new.is_aggregate());
        assert!(new.as_u64().is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(Value::scalar(42, false).to_string(), "42");
        assert_eq!(Value::scalar((-3i64) as u64, true).to_string(), "-3");
        assert_eq!(
            Value::from_memory(0, vec![1u8; 9], false).to_string(),
            "{0x01, 0x01, 0x01, 0x01, 0x01, 0x01, 0x01, 0x01, 0x01}"
        );
    }
}
