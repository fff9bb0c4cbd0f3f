//! ptrace を使う実プロセス用ターゲット
//!
//! ソフトウェアブレークポイント（INT3）のみ対応し、ハードウェアブレークポイントと
//! ウォッチポイントは未対応として報告します。

use crate::breakpoint::{HwCapability, HwKind, TargetBreakpoint, WatchKind};
use crate::frame::{CallerInfo, FrameId, FrameInfo};
use crate::memory::Memory;
use crate::process::{Process, StopReason};
use crate::registers::Registers;
use crate::thread::ThreadInfo;
use crate::{Result, Target, TargetError};
use std::path::Path;
use tomari_expr::{Bytecode, EvalContext, MemoryReader};

/// フレームポインタをたどる上限
const MAX_FRAME_WALK: usize = 256;

/// ptrace ターゲット
pub struct PtraceTarget {
    process: Process,
    memory: Memory,
    registers: Registers,
}

impl PtraceTarget {
    /// 実行可能ファイルを起動する
    pub fn spawn<P: AsRef<Path>>(program: P, args: &[String]) -> anyhow::Result<Self> {
        let process = Process::spawn(program, args)?;
        Ok(Self::from_process(process))
    }

    /// 既存のプロセスにアタッチする
    pub fn attach(pid: i32) -> anyhow::Result<Self> {
        let process = Process::attach(pid)?;
        Ok(Self::from_process(process))
    }

    fn from_process(process: Process) -> Self {
        let pid = process.pid();
        Self {
            process,
            memory: Memory::new(pid),
            registers: Registers::new(pid),
        }
    }

    pub fn pid(&self) -> i32 {
        self.process.pid()
    }

    /// プログラムカウンタを取得する
    pub fn pc(&self) -> anyhow::Result<u64> {
        self.registers.get_pc()
    }

    /// 実行を再開し、停止理由と停止アドレスを返す
    ///
    /// トラップで停止した場合はPCをトラップ命令の位置に巻き戻します。
    pub fn resume(&mut self) -> anyhow::Result<(StopReason, u64)> {
        let reason = self.process.continue_and_wait()?;
        if matches!(reason, StopReason::Exited(_)) {
            return Ok((reason, 0));
        }

        let mut pc = self.registers.get_pc()?;
        if reason == StopReason::Breakpoint {
            pc -= crate::breakpoint::TRAP_LEN as u64;
            self.registers.set_pc(pc)?;
        }
        Ok((reason, pc))
    }

    /// 1命令だけ実行する
    pub fn single_step(&mut self) -> anyhow::Result<StopReason> {
        self.process.step()
    }

    fn frame_at(&self, rbp: u64, pc: u64) -> FrameInfo {
        let caller = match (self.read_u64(rbp), self.read_u64(rbp + 8)) {
            (Ok(saved_rbp), Ok(ret)) if saved_rbp > rbp => Some(CallerInfo {
                id: FrameId(saved_rbp + 16),
                resume_pc: ret,
            }),
            _ => None,
        };
        FrameInfo {
            id: FrameId(rbp + 16),
            pc,
            base: rbp,
            caller,
        }
    }
}

impl MemoryReader for PtraceTarget {
    fn read(&self, addr: u64, size: usize) -> anyhow::Result<Vec<u8>> {
        self.memory.read(addr, size)
    }
}

impl EvalContext for PtraceTarget {
    fn read_register(&self, name: &str) -> anyhow::Result<u64> {
        self.registers.get_by_name(name)
    }

    fn read_register_by_number(&self, number: u16) -> anyhow::Result<u64> {
        self.registers.get_by_number(number)
    }

    fn frame_base(&self) -> Option<u64> {
        self.registers.get_by_name("rbp").ok()
    }
}

impl Target for PtraceTarget {
    fn insert_sw_breakpoint(&mut self, bp: &mut TargetBreakpoint) -> Result<()> {
        bp.place_trap(self)
    }

    fn remove_sw_breakpoint(&mut self, bp: &mut TargetBreakpoint) -> Result<()> {
        bp.lift_trap(self)
    }

    fn insert_hw_breakpoint(&mut self, _bp: &mut TargetBreakpoint) -> Result<()> {
        Err(TargetError::Unsupported("hardware breakpoints".to_string()))
    }

    fn remove_hw_breakpoint(&mut self, _bp: &mut TargetBreakpoint) -> Result<()> {
        Err(TargetError::Unsupported("hardware breakpoints".to_string()))
    }

    fn insert_watchpoint(
        &mut self,
        _addr: u64,
        _len: usize,
        _kind: WatchKind,
        _cond: Option<&Bytecode>,
    ) -> Result<()> {
        Err(TargetError::Unsupported("hardware watchpoints".to_string()))
    }

    fn remove_watchpoint(
        &mut self,
        _addr: u64,
        _len: usize,
        _kind: WatchKind,
        _cond: Option<&Bytecode>,
    ) -> Result<()> {
        Err(TargetError::Unsupported("hardware watchpoints".to_string()))
    }

    fn can_use_hw_watchpoint(&self, _kind: HwKind, _count: usize, _other: usize) -> HwCapability {
        HwCapability::Unsupported
    }

    fn has_execution(&self) -> bool {
        !self.process.has_exited()
    }

    fn thread_count(&self) -> Option<usize> {
        Some(1)
    }

    fn memory_writable(&self, addr: u64) -> Option<bool> {
        self.memory.is_writable(addr)
    }

    fn write_memory(&mut self, addr: u64, data: &[u8]) -> anyhow::Result<()> {
        self.memory.write(addr, data)
    }

    fn current_thread(&self) -> ThreadInfo {
        let pid = self.process.pid();
        ThreadInfo::new(pid, pid)
    }

    fn selected_frame(&self) -> Option<FrameInfo> {
        let regs = self.registers.read().ok()?;
        Some(self.frame_at(regs.rbp, regs.rip))
    }

    fn frame_exists(&self, id: FrameId) -> bool {
        let mut rbp = match self.registers.get_by_name("rbp") {
            Ok(rbp) => rbp,
            Err(_) => return false,
        };

        for _ in 0..MAX_FRAME_WALK {
            if rbp == 0 {
                return false;
            }
            if rbp + 16 == id.0 {
                return true;
            }
            match self.read_u64(rbp) {
                Ok(next) if next > rbp => rbp = next,
                _ => return false,
            }
        }
        false
    }
}
