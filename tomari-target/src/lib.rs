//! tomari ターゲット制御層
//!
//! ブレークポイント管理コアが物理的なトラップの挿入・削除や停止理由の問い合わせに使う
//! ターゲットの契約 [`Target`] と、その実装を提供します。
//!
//! - [`SimTarget`]: メモリ上で完結する決定的なシミュレーションターゲット
//! - `PtraceTarget`: Linux の ptrace を使う実プロセス用ターゲット（x86_64 のみ）

pub mod breakpoint;
pub mod error;
pub mod frame;
pub mod process;
pub mod sim;
pub mod thread;

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub mod memory;
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub mod ptrace;
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub mod registers;

pub use breakpoint::{CatchKind, HwCapability, HwKind, TargetBreakpoint, WatchKind};
pub use error::TargetError;
pub use frame::{CallerInfo, FrameId, FrameInfo};
pub use process::{StopReason, TargetEvent};
pub use sim::{SimCapabilities, SimTarget, TargetCall};
pub use thread::{InferiorId, TaskId, ThreadId, ThreadInfo};

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub use ptrace::PtraceTarget;

use tomari_expr::{Bytecode, EvalContext};

/// ターゲット制御の結果型
pub type Result<T> = std::result::Result<T, TargetError>;

/// ブレークポイント管理コアから見たターゲット
///
/// メモリとレジスタの読み取りは [`EvalContext`] として提供し、
/// 式評価やバイトコード実行にそのまま渡せるようにします。
pub trait Target: EvalContext {
    /// ソフトウェアブレークポイントを挿入する
    ///
    /// 成功時は `bp.shadow` に退避した元のバイト列、`bp.placed_address` に
    /// 実際の挿入アドレスが入ります。
    fn insert_sw_breakpoint(&mut self, bp: &mut TargetBreakpoint) -> Result<()>;

    /// ソフトウェアブレークポイントを削除する
    fn remove_sw_breakpoint(&mut self, bp: &mut TargetBreakpoint) -> Result<()>;

    /// ハードウェアブレークポイントを挿入する
    fn insert_hw_breakpoint(&mut self, bp: &mut TargetBreakpoint) -> Result<()>;

    /// ハードウェアブレークポイントを削除する
    fn remove_hw_breakpoint(&mut self, bp: &mut TargetBreakpoint) -> Result<()>;

    /// ハードウェアウォッチポイントを挿入する
    fn insert_watchpoint(
        &mut self,
        addr: u64,
        len: usize,
        kind: WatchKind,
        cond: Option<&Bytecode>,
    ) -> Result<()>;

    /// ハードウェアウォッチポイントを削除する
    fn remove_watchpoint(
        &mut self,
        addr: u64,
        len: usize,
        kind: WatchKind,
        cond: Option<&Bytecode>,
    ) -> Result<()>;

    /// マスク付きウォッチポイントを挿入する
    fn insert_masked_watchpoint(&mut self, _addr: u64, _mask: u64, _kind: WatchKind) -> Result<()> {
        Err(TargetError::Unsupported("masked watchpoints".to_string()))
    }

    /// マスク付きウォッチポイントを削除する
    fn remove_masked_watchpoint(&mut self, _addr: u64, _mask: u64, _kind: WatchKind) -> Result<()> {
        Err(TargetError::Unsupported("masked watchpoints".to_string()))
    }

    /// `kind` のハードウェア資源を `count` 個使えるか
    ///
    /// `other_in_use` は他の種類のハードウェアウォッチポイントが使っている数です。
    fn can_use_hw_watchpoint(&self, kind: HwKind, count: usize, other_in_use: usize) -> HwCapability;

    /// 指定領域を監視するのに必要なデバッグレジスタ数（0は監視不可）
    fn region_ok_for_hw_watchpoint(&self, _addr: u64, len: usize) -> usize {
        if len <= 8 {
            1
        } else {
            0
        }
    }

    /// マスク付きウォッチポイントに必要なレジスタ数。対応していなければ `None`
    fn masked_watch_num_registers(&self, _addr: u64, _mask: u64) -> Option<usize> {
        None
    }

    /// ウォッチポイントの条件をターゲット側で高速に評価できるか
    fn can_accel_watchpoint_condition(
        &self,
        _addr: u64,
        _len: usize,
        _kind: WatchKind,
        _cond: &Bytecode,
    ) -> bool {
        false
    }

    /// ブレークポイント条件をターゲット側で評価できるか
    fn supports_target_side_conditions(&self) -> bool {
        false
    }

    /// ブレークポイントコマンドをターゲット側で実行できるか
    fn supports_target_side_commands(&self) -> bool {
        false
    }

    /// 挿入済みブレークポイントの条件・コマンド列を送り直す
    fn download_conditions(&mut self, _bp: &TargetBreakpoint) -> Result<()> {
        Ok(())
    }

    /// ソフトウェアブレークポイントによる停止を報告できるか
    fn supports_stopped_by_sw_breakpoint(&self) -> bool {
        false
    }

    /// ハードウェアブレークポイントによる停止を報告できるか
    fn supports_stopped_by_hw_breakpoint(&self) -> bool {
        false
    }

    /// 直前の停止がウォッチポイントによるものか
    fn stopped_by_watchpoint(&self) -> bool {
        false
    }

    /// ウォッチポイントを発火させたデータアドレス
    fn stopped_data_address(&self) -> Option<u64> {
        None
    }

    /// `addr` が `[start, start + len)` の範囲に入るか
    fn watchpoint_addr_within_range(&self, addr: u64, start: u64, len: usize) -> bool {
        addr >= start && addr < start.wrapping_add(len as u64)
    }

    /// ブレークポイントがアドレス空間をまたいで共有されるか
    fn has_global_breakpoints(&self) -> bool {
        false
    }

    /// non-stop モードで動作しているか
    fn is_non_stop(&self) -> bool {
        false
    }

    /// 実行中のプロセスがあるか
    fn has_execution(&self) -> bool;

    /// 生存しているスレッド数。分からなければ `None`
    fn thread_count(&self) -> Option<usize>;

    /// アドレスが書き込み可能メモリか。分からなければ `None`
    fn memory_writable(&self, _addr: u64) -> Option<bool> {
        None
    }

    /// メモリに書き込む
    fn write_memory(&mut self, addr: u64, data: &[u8]) -> anyhow::Result<()>;

    /// キャッチポイントを有効化する
    fn insert_catchpoint(&mut self, _kind: &CatchKind) -> Result<()> {
        Ok(())
    }

    /// キャッチポイントを無効化する
    fn remove_catchpoint(&mut self, _kind: &CatchKind) -> Result<()> {
        Ok(())
    }

    /// 停止したスレッド
    fn current_thread(&self) -> ThreadInfo;

    /// 選択中のフレーム
    fn selected_frame(&self) -> Option<FrameInfo>;

    /// フレームがまだスタック上に存在するか
    fn frame_exists(&self, id: FrameId) -> bool;

    /// 挿入状態を別のロケーションへ付け替えても安全か
    ///
    /// false の場合、重複グループのプライマリが入れ替わるときは
    /// 削除してから挿入し直します。
    fn tolerates_insertion_swap(&self) -> bool {
        true
    }
}
