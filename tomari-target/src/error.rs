//! ターゲット操作のエラー

use thiserror::Error;

/// ターゲット操作のエラー
#[derive(Debug, Error)]
pub enum TargetError {
    #[error("Cannot access memory at address 0x{address:x}")]
    MemoryAccess { address: u64 },
    #[error("Cannot insert breakpoint in read-only memory at 0x{address:x}")]
    ReadOnlyMemory { address: u64 },
    #[error("Could not insert hardware breakpoint or watchpoint at 0x{address:x}: no free debug register")]
    HwResources { address: u64 },
    #[error("Target does not support {0}")]
    Unsupported(String),
    #[error("Nothing is inserted at 0x{address:x}")]
    NotInserted { address: u64 },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TargetError {
    /// ハードウェア資源に関するエラーかどうか
    pub fn is_hardware(&self) -> bool {
        matches!(
            self,
            TargetError::HwResources { .. } | TargetError::Unsupported(_)
        )
    }
}
