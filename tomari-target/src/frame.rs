//! スタックフレーム

/// フレームID（フレームのCFA）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameId(pub u64);

/// 呼び出し元フレームの情報
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallerInfo {
    pub id: FrameId,
    /// 呼び出し元で実行が再開されるアドレス
    pub resume_pc: u64,
}

/// フレーム情報
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    pub id: FrameId,
    pub pc: u64,
    /// ローカル変数のベースアドレス
    pub base: u64,
    pub caller: Option<CallerInfo>,
}
