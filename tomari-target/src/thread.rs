//! スレッド管理

/// スレッドID
pub type ThreadId = i32;

/// インフェリア（デバッグ対象プロセス）ID
pub type InferiorId = i32;

/// タスクID
pub type TaskId = i32;

/// 停止したスレッドの情報
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadInfo {
    pub tid: ThreadId,
    pub inferior: InferiorId,
    pub task: Option<TaskId>,
}

impl ThreadInfo {
    pub fn new(tid: ThreadId, inferior: InferiorId) -> Self {
        Self {
            tid,
            inferior,
            task: None,
        }
    }
}
