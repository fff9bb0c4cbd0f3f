//! ブレークポイント管理のエラー

use std::fmt;
use thiserror::Error;
use tomari_expr::ParseError;
use tomari_target::TargetError;

/// ハードウェア資源が足りないかもしれないことを伝える最後の一行
pub const HW_RESOURCE_HINT: &str =
    "Could not insert hardware breakpoints:\nYou may have requested too many hardware breakpoints/watchpoints.";

/// ブレークポイント操作のエラー
#[derive(Debug, Error)]
pub enum BreakpointError {
    /// ハードウェアのスロットが足りない
    #[error("{0}")]
    ResourceExhausted(String),
    /// ターゲットがこの種類のハードウェア資源に対応していない
    #[error("{0}")]
    HwUnsupported(String),
    /// ターゲットが挿入・削除を拒否した
    #[error("Cannot insert breakpoint {number} at 0x{address:x}: {source}")]
    TargetRejected {
        number: i32,
        address: u64,
        #[source]
        source: TargetError,
    },
    /// 条件式をどのロケーションでもパースできない
    #[error("{0}")]
    ConditionParse(#[from] ParseError),
    #[error("No breakpoint number {0}.")]
    NotFound(i32),
    #[error("{0}")]
    BadLocation(String),
    /// スレッド・タスク・インフェリアの制限が衝突している
    #[error("{0}")]
    RestrictionConflict(String),
    #[error("{0}")]
    Watchpoint(String),
    #[error("{0}")]
    InvalidSetting(String),
    /// 再調整パスの失敗をまとめたもの
    #[error("{0}")]
    Reconcile(ReconcileReport),
}

/// 再調整パスで起きた1件の失敗
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileFailure {
    /// ブレークポイント番号
    pub breakpoint: i32,
    /// 失敗したロケーションのアドレス
    pub address: Option<u64>,
    pub message: String,
}

/// 1回の再調整パスで起きた失敗の一覧
///
/// 1つのロケーションの失敗で残りの処理を止めないよう、失敗はここに集めてから
/// まとめて報告します。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub failures: Vec<ReconcileFailure>,
    /// ハードウェアブレークポイント・ウォッチポイントの挿入に失敗した
    pub hw_error: bool,
    /// ハードウェアの失敗にターゲットからの説明があった
    pub hw_explained: bool,
}

impl ReconcileReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_ok(&self) -> bool {
        self.failures.is_empty() && !self.hw_error
    }

    pub(crate) fn push(&mut self, breakpoint: i32, address: Option<u64>, message: String) {
        self.failures.push(ReconcileFailure {
            breakpoint,
            address,
            message,
        });
    }

    /// 別のパスの結果を取り込む
    pub(crate) fn merge(&mut self, other: ReconcileReport) {
        self.failures.extend(other.failures);
        self.hw_error |= other.hw_error;
        self.hw_explained |= other.hw_explained;
    }

    /// 失敗があればエラーに変換する
    pub fn into_result(self) -> Result<()> {
        if self.is_ok() {
            Ok(())
        } else {
            Err(BreakpointError::Reconcile(self))
        }
    }
}

impl fmt::Display for ReconcileReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut lines: Vec<&str> = self.failures.iter().map(|e| e.message.as_str()).collect();
        if self.hw_error && !self.hw_explained {
            lines.push(HW_RESOURCE_HINT);
        }
        f.write_str(&lines.join("\n"))
    }
}

/// ブレークポイント管理の結果型
pub type Result<T> = std::result::Result<T, BreakpointError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_display() {
        let mut report = ReconcileReport::new();
        assert!(report.is_ok());

        report.push(
            1,
            Some(0x1000),
            "Cannot insert breakpoint 1.\nCannot access memory at address 0x1000".to_string(),
        );
        report.push(2, None, "Could not insert hardware watchpoint 2.".to_string());
        report.hw_error = true;

        let text = report.to_string();
        assert!(text.starts_with("Cannot insert breakpoint 1."));
        assert!(text.contains("Could not insert hardware watchpoint 2."));
        assert!(text.ends_with("You may have requested too many hardware breakpoints/watchpoints."));

        report.hw_explained = true;
        assert!(!report.to_string().contains("too many"));
        assert!(matches!(
            report.into_result(),
            Err(BreakpointError::Reconcile(_))
        ));
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(BreakpointError::NotFound(7).to_string(), "No breakpoint number 7.");
        let e = BreakpointError::TargetRejected {
            number: 3,
            address: 0x401000,
            source: TargetError::MemoryAccess { address: 0x401000 },
        };
        assert_eq!(
            e.to_string(),
            "Cannot insert breakpoint 3 at 0x401000: Cannot access memory at address 0x401000"
        );
    }
}
