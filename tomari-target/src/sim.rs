//! シミュレーションターゲット
//!
//! 疎なバイトメモリ、読み取り専用領域、デバッグレジスタの数、フレームスタック、
//! レジスタを持つ決定的なターゲットです。挿入・削除・ダウンロードの呼び出しは
//! すべて [`TargetCall`] として記録されるので、テストから物理的な操作を検証できます。

use crate::breakpoint::{CatchKind, HwCapability, HwKind, TargetBreakpoint, WatchKind};
use crate::frame::{CallerInfo, FrameId, FrameInfo};
use crate::process::StopReason;
use crate::thread::ThreadInfo;
use crate::{Result, Target, TargetError};
use std::collections::{BTreeMap, HashMap, HashSet};
use tomari_expr::{Bytecode, EvalContext, MemoryReader};
use tracing::debug;

/// シミュレーションターゲットの能力
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimCapabilities {
    /// デバッグレジスタの数。`None` ならハードウェア資源なし
    pub debug_registers: Option<usize>,
    pub target_side_conditions: bool,
    pub target_side_commands: bool,
    pub non_stop: bool,
    pub global_breakpoints: bool,
    pub reports_sw_breakpoint: bool,
    pub reports_hw_breakpoint: bool,
    pub swap_tolerant: bool,
    pub accel_watch_conditions: bool,
    pub masked_watchpoints: bool,
    pub read_watchpoints: bool,
}

impl Default for SimCapabilities {
    fn default() -> Self {
        Self {
            debug_registers: Some(4),
            target_side_conditions: false,
            target_side_commands: false,
            non_stop: false,
            global_breakpoints: false,
            reports_sw_breakpoint: false,
            reports_hw_breakpoint: false,
            swap_tolerant: true,
            accel_watch_conditions: false,
            masked_watchpoints: true,
            read_watchpoints: true,
        }
    }
}

/// 記録されるターゲット操作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetCall {
    InsertSw(u64),
    RemoveSw(u64),
    InsertHw(u64),
    RemoveHw(u64),
    InsertWatch {
        addr: u64,
        len: usize,
        kind: WatchKind,
    },
    RemoveWatch {
        addr: u64,
        len: usize,
        kind: WatchKind,
    },
    InsertMasked {
        addr: u64,
        mask: u64,
        kind: WatchKind,
    },
    RemoveMasked {
        addr: u64,
        mask: u64,
        kind: WatchKind,
    },
    Download {
        addr: u64,
        conditions: usize,
        commands: usize,
    },
    InsertCatch(CatchKind),
    RemoveCatch(CatchKind),
}

/// シミュレーションターゲット
#[derive(Debug, Default)]
pub struct SimTarget {
    pub caps: SimCapabilities,
    memory: BTreeMap<u64, u8>,
    read_only: Vec<(u64, u64)>,
    registers: HashMap<String, u64>,
    register_numbers: Vec<String>,
    frames: Vec<FrameInfo>,
    sw_inserted: BTreeMap<u64, TargetBreakpoint>,
    hw_inserted: BTreeMap<u64, TargetBreakpoint>,
    watchpoints: Vec<(u64, usize, WatchKind)>,
    masked: Vec<(u64, u64, WatchKind)>,
    catchpoints: Vec<CatchKind>,
    calls: Vec<TargetCall>,
    fail_insert: HashSet<u64>,
    fail_remove: HashSet<u64>,
    thread: Option<ThreadInfo>,
    thread_count: Option<usize>,
    exited: bool,
    stopped_data_address: Option<u64>,
    output: Vec<String>,
}

impl SimTarget {
    /// 新しいシミュレーションターゲットを作成する
    pub fn new() -> Self {
        Self::with_caps(SimCapabilities::default())
    }

    pub fn with_caps(caps: SimCapabilities) -> Self {
        Self {
            caps,
            thread: Some(ThreadInfo::new(1, 1)),
            thread_count: Some(1),
            ..Default::default()
        }
    }

    /// 書き込み可能なメモリを配置する
    pub fn map(&mut self, addr: u64, bytes: &[u8]) {
        for (i, b) in bytes.iter().enumerate() {
            self.memory.insert(addr + i as u64, *b);
        }
    }

    /// 読み取り専用メモリを配置する
    pub fn map_read_only(&mut self, addr: u64, bytes: &[u8]) {
        self.map(addr, bytes);
        self.read_only.push((addr, addr + bytes.len() as u64));
    }

    /// 領域を取り除く（共有ライブラリのアンロード）
    ///
    /// 領域内に挿入されていたトラップも一緒に消えます。
    pub fn unmap(&mut self, addr: u64, len: u64) {
        let end = addr + len;
        self.memory.retain(|a, _| *a < addr || *a >= end);
        self.sw_inserted.retain(|a, _| *a < addr || *a >= end);
        self.hw_inserted.retain(|a, _| *a < addr || *a >= end);
    }

    /// 領域の読み取り専用属性を切り替える
    pub fn set_read_only(&mut self, addr: u64, len: u64, read_only: bool) {
        self.read_only.retain(|(s, e)| !(*s == addr && *e == addr + len));
        if read_only {
            self.read_only.push((addr, addr + len));
        }
    }

    fn is_read_only(&self, addr: u64) -> bool {
        self.read_only.iter().any(|(s, e)| addr >= *s && addr < *e)
    }

    fn is_mapped(&self, addr: u64, len: usize) -> bool {
        (0..len as u64).all(|i| self.memory.contains_key(&(addr + i)))
    }

    /// トラップ命令を含む生のメモリ内容
    pub fn peek(&self, addr: u64, len: usize) -> Vec<u8> {
        (0..len as u64)
            .map(|i| self.memory.get(&(addr + i)).copied().unwrap_or(0))
            .collect()
    }

    /// 読み取り専用属性を無視してメモリを書き換える
    pub fn poke(&mut self, addr: u64, bytes: &[u8]) {
        self.map(addr, bytes);
    }

    /// レジスタを設定する（初めての名前は次の番号で登録される）
    pub fn set_register(&mut self, name: &str, value: u64) {
        if !self.register_numbers.iter().any(|r| r == name) {
            self.register_numbers.push(name.to_string());
        }
        self.registers.insert(name.to_string(), value);
    }

    /// レジスタ番号
    pub fn register_number(&self, name: &str) -> Option<u16> {
        self.register_numbers
            .iter()
            .position(|r| r == name)
            .map(|p| p as u16)
    }

    /// フレームを積む
    ///
    /// 呼び出し元は直前の最内フレームで、その PC で実行が再開されるものとします。
    pub fn push_frame(&mut self, pc: u64, base: u64) -> FrameId {
        let caller = self.frames.last().map(|f| CallerInfo {
            id: f.id,
            resume_pc: f.pc,
        });
        let id = FrameId(base + 16);
        self.frames.push(FrameInfo {
            id,
            pc,
            base,
            caller,
        });
        id
    }

    /// 最内フレームを取り除く
    pub fn pop_frame(&mut self) -> Option<FrameInfo> {
        self.frames.pop()
    }

    /// 最内フレームのPCを変更する
    pub fn set_pc(&mut self, pc: u64) {
        if let Some(frame) = self.frames.last_mut() {
            frame.pc = pc;
        }
    }

    /// 停止スレッドを設定する
    pub fn set_thread(&mut self, thread: ThreadInfo) {
        self.thread = Some(thread);
    }

    pub fn set_thread_count(&mut self, count: Option<usize>) {
        self.thread_count = count;
    }

    pub fn set_exited(&mut self, exited: bool) {
        self.exited = exited;
    }

    /// 指定アドレスへの挿入を失敗させる
    pub fn fail_insert_at(&mut self, addr: u64) {
        self.fail_insert.insert(addr);
    }

    /// 指定アドレスからの削除を失敗させる
    pub fn fail_remove_at(&mut self, addr: u64) {
        self.fail_remove.insert(addr);
    }

    pub fn clear_faults(&mut self) {
        self.fail_insert.clear();
        self.fail_remove.clear();
    }

    /// 記録された操作
    pub fn calls(&self) -> &[TargetCall] {
        &self.calls
    }

    /// 記録された操作を取り出してクリアする
    pub fn take_calls(&mut self) -> Vec<TargetCall> {
        std::mem::take(&mut self.calls)
    }

    /// ソフトウェアブレークポイントが挿入されているか
    pub fn sw_inserted_at(&self, addr: u64) -> bool {
        self.sw_inserted.contains_key(&addr)
    }

    /// ハードウェアブレークポイントが挿入されているか
    pub fn hw_inserted_at(&self, addr: u64) -> bool {
        self.hw_inserted.contains_key(&addr)
    }

    /// 挿入されているブレークポイントの記録
    pub fn inserted_breakpoint(&self, addr: u64) -> Option<&TargetBreakpoint> {
        self.sw_inserted
            .get(&addr)
            .or_else(|| self.hw_inserted.get(&addr))
    }

    /// 挿入されているウォッチポイント
    pub fn watchpoints(&self) -> &[(u64, usize, WatchKind)] {
        &self.watchpoints
    }

    /// 有効なキャッチポイント
    pub fn catchpoints(&self) -> &[CatchKind] {
        &self.catchpoints
    }

    /// 使用中のデバッグレジスタ数
    pub fn debug_registers_used(&self) -> usize {
        self.hw_inserted.len() + self.watchpoints.len() + self.masked.len() * 2
    }

    /// ターゲット側で実行された dprintf の出力
    pub fn take_output(&mut self) -> Vec<String> {
        std::mem::take(&mut self.output)
    }

    /// プログラムが `addr` に到達したときの動作をシミュレートする
    ///
    /// トラップが挿入されていなければ `None`。ターゲット側の条件式がある場合は
    /// そのいずれかが真（または評価エラー）のときだけ停止を報告します。
    pub fn hit(&mut self, addr: u64) -> Option<StopReason> {
        self.stopped_data_address = None;
        self.set_pc(addr);

        let bp = self.inserted_breakpoint(addr)?.clone();

        if !bp.conditions.is_empty() {
            let any_true = bp
                .conditions
                .iter()
                .any(|cond| cond.run(&*self).map(|o| o.is_true()).unwrap_or(true));
            if !any_true {
                debug!("Target-side conditions at 0x{:x} are all false", addr);
                return None;
            }
        }

        for cmd in &bp.commands {
            if let Ok(outcome) = cmd.run(&*self) {
                self.output.extend(outcome.output);
            }
        }

        Some(StopReason::Breakpoint)
    }

    /// メモリを書き換え、監視されていればウォッチポイントの発火を報告する
    pub fn write_watched(&mut self, addr: u64, bytes: &[u8]) -> Option<StopReason> {
        self.poke(addr, bytes);
        self.access(addr, bytes.len(), true)
    }

    /// メモリアクセスをシミュレートする
    pub fn access(&mut self, addr: u64, len: usize, write: bool) -> Option<StopReason> {
        let end = addr + len as u64;
        let covers = |start: u64, wlen: u64| addr < start + wlen && start < end;

        let hit = self.watchpoints.iter().find(|(start, wlen, kind)| {
            covers(*start, *wlen as u64)
                && match kind {
                    WatchKind::Write => write,
                    WatchKind::Read => !write,
                    WatchKind::Access => true,
                }
        });

        let data_address = match hit {
            Some((start, _, _)) => addr.max(*start),
            None => {
                let masked_hit = self.masked.iter().any(|(maddr, mask, kind)| {
                    (addr & mask) == (*maddr & mask)
                        && (*kind == WatchKind::Access || write == (*kind == WatchKind::Write))
                });
                if !masked_hit {
                    return None;
                }
                addr
            }
        };

        self.stopped_data_address = Some(data_address);
        Some(StopReason::Watchpoint {
            data_address: Some(data_address),
        })
    }

    fn hw_slots(&self) -> Result<usize> {
        self.caps
            .debug_registers
            .ok_or_else(|| TargetError::Unsupported("hardware debug registers".to_string()))
    }

    fn check_fault(&self, addr: u64, set: &HashSet<u64>) -> Result<()> {
        if set.contains(&addr) {
            return Err(TargetError::Other(anyhow::anyhow!(
                "Remote communication error at 0x{:x}",
                addr
            )));
        }
        Ok(())
    }
}

impl MemoryReader for SimTarget {
    fn read(&self, addr: u64, size: usize) -> anyhow::Result<Vec<u8>> {
        (0..size as u64)
            .map(|i| {
                self.memory
                    .get(&(addr + i))
                    .copied()
                    .ok_or_else(|| anyhow::anyhow!("Cannot access memory at address 0x{:x}", addr + i))
            })
            .collect()
    }
}

impl EvalContext for SimTarget {
    fn read_register(&self, name: &str) -> anyhow::Result<u64> {
        if name == "pc" {
            if let Some(frame) = self.frames.last() {
                return Ok(frame.pc);
            }
        }
        self.registers
            .get(name)
            .copied()
            .ok_or_else(|| anyhow::anyhow!("Invalid register `{}'", name))
    }

    fn read_register_by_number(&self, number: u16) -> anyhow::Result<u64> {
        let name = self
            .register_numbers
            .get(number as usize)
            .ok_or_else(|| anyhow::anyhow!("Invalid register number {}", number))?;
        self.read_register(name)
    }

    fn frame_base(&self) -> Option<u64> {
        self.frames.last().map(|f| f.base)
    }
}

impl Target for SimTarget {
    fn insert_sw_breakpoint(&mut self, bp: &mut TargetBreakpoint) -> Result<()> {
        let addr = bp.requested_address;
        self.calls.push(TargetCall::InsertSw(addr));
        self.check_fault(addr, &self.fail_insert)?;

        if self.is_read_only(addr) {
            return Err(TargetError::ReadOnlyMemory { address: addr });
        }
        if !self.is_mapped(addr, 1) {
            return Err(TargetError::MemoryAccess { address: addr });
        }

        bp.place_trap(self)?;
        self.sw_inserted.insert(bp.placed_address, bp.clone());
        Ok(())
    }

    fn remove_sw_breakpoint(&mut self, bp: &mut TargetBreakpoint) -> Result<()> {
        let addr = bp.placed_address;
        self.calls.push(TargetCall::RemoveSw(addr));
        self.check_fault(addr, &self.fail_remove)?;

        if self.sw_inserted.remove(&addr).is_none() {
            return Err(TargetError::NotInserted { address: addr });
        }
        // 読み取り専用属性に関係なく元に戻す
        let shadow = std::mem::take(&mut bp.shadow);
        self.poke(addr, &shadow);
        Ok(())
    }

    fn insert_hw_breakpoint(&mut self, bp: &mut TargetBreakpoint) -> Result<()> {
        let addr = bp.requested_address;
        self.calls.push(TargetCall::InsertHw(addr));
        self.check_fault(addr, &self.fail_insert)?;

        let slots = self.hw_slots()?;
        let used = self.debug_registers_used();
        if used >= slots {
            return Err(TargetError::HwResources { address: addr });
        }

        bp.placed_address = addr;
        bp.placed_size = bp.length.max(1);
        bp.handle = Some(used as u64);
        self.hw_inserted.insert(addr, bp.clone());
        Ok(())
    }

    fn remove_hw_breakpoint(&mut self, bp: &mut TargetBreakpoint) -> Result<()> {
        let addr = bp.placed_address;
        self.calls.push(TargetCall::RemoveHw(addr));
        self.check_fault(addr, &self.fail_remove)?;

        if self.hw_inserted.remove(&addr).is_none() {
            return Err(TargetError::NotInserted { address: addr });
        }
        bp.handle = None;
        Ok(())
    }

    fn insert_watchpoint(
        &mut self,
        addr: u64,
        len: usize,
        kind: WatchKind,
        _cond: Option<&Bytecode>,
    ) -> Result<()> {
        self.calls.push(TargetCall::InsertWatch { addr, len, kind });
        self.check_fault(addr, &self.fail_insert)?;

        let slots = self.hw_slots()?;
        if kind == WatchKind::Read && !self.caps.read_watchpoints {
            return Err(TargetError::Unsupported("read watchpoints".to_string()));
        }
        if len > 8 {
            return Err(TargetError::Unsupported(format!("watching {} bytes", len)));
        }
        if self.debug_registers_used() >= slots {
            return Err(TargetError::HwResources { address: addr });
        }

        self.watchpoints.push((addr, len, kind));
        Ok(())
    }

    fn remove_watchpoint(
        &mut self,
        addr: u64,
        len: usize,
        kind: WatchKind,
        _cond: Option<&Bytecode>,
    ) -> Result<()> {
        self.calls.push(TargetCall::RemoveWatch { addr, len, kind });
        self.check_fault(addr, &self.fail_remove)?;

        let pos = self
            .watchpoints
            .iter()
            .position(|w| *w == (addr, len, kind))
            .ok_or(TargetError::NotInserted { address: addr })?;
        self.watchpoints.remove(pos);
        Ok(())
    }

    fn insert_masked_watchpoint(&mut self, addr: u64, mask: u64, kind: WatchKind) -> Result<()> {
        self.calls.push(TargetCall::InsertMasked { addr, mask, kind });
        if !self.caps.masked_watchpoints {
            return Err(TargetError::Unsupported("masked watchpoints".to_string()));
        }
        let slots = self.hw_slots()?;
        if self.debug_registers_used() + 2 > slots {
            return Err(TargetError::HwResources { address: addr });
        }
        self.masked.push((addr, mask, kind));
        Ok(())
    }

    fn remove_masked_watchpoint(&mut self, addr: u64, mask: u64, kind: WatchKind) -> Result<()> {
        self.calls.push(TargetCall::RemoveMasked { addr, mask, kind });
        let pos = self
            .masked
            .iter()
            .position(|w| *w == (addr, mask, kind))
            .ok_or(TargetError::NotInserted { address: addr })?;
        self.masked.remove(pos);
        Ok(())
    }

    fn can_use_hw_watchpoint(&self, kind: HwKind, count: usize, other_in_use: usize) -> HwCapability {
        let slots = match self.caps.debug_registers {
            Some(n) => n,
            None => return HwCapability::Unsupported,
        };
        if kind == HwKind::Watchpoint(WatchKind::Read) && !self.caps.read_watchpoints {
            return HwCapability::Unsupported;
        }
        if count + other_in_use > slots {
            HwCapability::Exceeded
        } else {
            HwCapability::Yes
        }
    }

    fn masked_watch_num_registers(&self, _addr: u64, _mask: u64) -> Option<usize> {
        self.caps.masked_watchpoints.then_some(2)
    }

    fn can_accel_watchpoint_condition(
        &self,
        _addr: u64,
        _len: usize,
        _kind: WatchKind,
        _cond: &Bytecode,
    ) -> bool {
        self.caps.accel_watch_conditions
    }

    fn supports_target_side_conditions(&self) -> bool {
        self.caps.target_side_conditions
    }

    fn supports_target_side_commands(&self) -> bool {
        self.caps.target_side_commands
    }

    fn download_conditions(&mut self, bp: &TargetBreakpoint) -> Result<()> {
        let addr = bp.placed_address;
        self.calls.push(TargetCall::Download {
            addr,
            conditions: bp.conditions.len(),
            commands: bp.commands.len(),
        });
        let slot = self
            .sw_inserted
            .get_mut(&addr)
            .or_else(|| self.hw_inserted.get_mut(&addr))
            .ok_or(TargetError::NotInserted { address: addr })?;
        slot.conditions = bp.conditions.clone();
        slot.commands = bp.commands.clone();
        Ok(())
    }

    fn supports_stopped_by_sw_breakpoint(&self) -> bool {
        self.caps.reports_sw_breakpoint
    }

    fn supports_stopped_by_hw_breakpoint(&self) -> bool {
        self.caps.reports_hw_breakpoint
    }

    fn stopped_by_watchpoint(&self) -> bool {
        self.stopped_data_address.is_some()
    }

    fn stopped_data_address(&self) -> Option<u64> {
        self.stopped_data_address
    }

    fn has_global_breakpoints(&self) -> bool {
        self.caps.global_breakpoints
    }

    fn is_non_stop(&self) -> bool {
        self.caps.non_stop
    }

    fn has_execution(&self) -> bool {
        !self.exited
    }

    fn thread_count(&self) -> Option<usize> {
        self.thread_count
    }

    fn memory_writable(&self, addr: u64) -> Option<bool> {
        if !self.memory.contains_key(&addr) {
            return None;
        }
        Some(!self.is_read_only(addr))
    }

    fn write_memory(&mut self, addr: u64, data: &[u8]) -> anyhow::Result<()> {
        if !self.is_mapped(addr, data.len()) {
            return Err(anyhow::anyhow!("Cannot access memory at address 0x{:x}", addr));
        }
        if (0..data.len() as u64).any(|i| self.is_read_only(addr + i)) {
            return Err(anyhow::anyhow!("Cannot write to read-only memory at 0x{:x}", addr));
        }
        self.map(addr, data);
        Ok(())
    }

    fn insert_catchpoint(&mut self, kind: &CatchKind) -> Result<()> {
        self.calls.push(TargetCall::InsertCatch(kind.clone()));
        self.catchpoints.push(kind.clone());
        Ok(())
    }

    fn remove_catchpoint(&mut self, kind: &CatchKind) -> Result<()> {
        self.calls.push(TargetCall::RemoveCatch(kind.clone()));
        if let Some(pos) = self.catchpoints.iter().position(|c| c == kind) {
            self.catchpoints.remove(pos);
        }
        Ok(())
    }

    fn current_thread(&self) -> ThreadInfo {
        self.thread.unwrap_or(ThreadInfo::new(1, 1))
    }

    fn selected_frame(&self) -> Option<FrameInfo> {
        self.frames.last().copied()
    }

    fn frame_exists(&self, id: FrameId) -> bool {
        self.frames.iter().any(|f| f.id == id)
    }

    fn tolerates_insertion_swap(&self) -> bool {
        self.caps.swap_tolerant
    }
}
