//! REPL から操作するターゲット

use anyhow::Result;
use tomari_core::{LocationResolver, ProgramSpaceId, ResolvedLocation, StopReason, Target};
use tomari_expr::{Scope, Symbol, SymbolTable};
use tomari_target::{SimCapabilities, SimTarget};

/// 実行の再開と1命令実行ができるターゲット
pub trait Backend: Target {
    /// 実行を再開して次の停止を待つ
    ///
    /// シミュレーションターゲットは自分では進まないので `None` を返します。
    fn resume_target(&mut self) -> Result<Option<(StopReason, u64)>>;

    fn step_target(&mut self) -> Result<()>;

    /// シミュレーションターゲットならそれを返す
    fn sim(&mut self) -> Option<&mut SimTarget> {
        None
    }
}

impl Backend for SimTarget {
    fn resume_target(&mut self) -> Result<Option<(StopReason, u64)>> {
        Ok(None)
    }

    fn step_target(&mut self) -> Result<()> {
        Ok(())
    }

    fn sim(&mut self) -> Option<&mut SimTarget> {
        Some(self)
    }
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
impl Backend for tomari_target::PtraceTarget {
    fn resume_target(&mut self) -> Result<Option<(StopReason, u64)>> {
        Ok(Some(self.resume()?))
    }

    fn step_target(&mut self) -> Result<()> {
        self.single_step()?;
        Ok(())
    }
}

// シミュレートするプログラムのメモリ配置
pub const TEXT_START: u64 = 0x401000;
pub const RODATA_START: u64 = 0x402000;
pub const DATA_START: u64 = 0x601000;
pub const STACK_BASE: u64 = 0x7fff_0100;

/// シミュレートするプログラムの関数
const FUNCTIONS: &[(&str, u64)] = &[
    ("main", TEXT_START),
    ("compute", TEXT_START + 0x40),
    ("worker", TEXT_START + 0x100),
    ("rodata_hook", RODATA_START),
];

/// 関数名とアドレスだけを解決する
pub struct FunctionTable;

impl LocationResolver for FunctionTable {
    fn resolve(&self, spec: &str, pspace: ProgramSpaceId) -> Vec<ResolvedLocation> {
        FUNCTIONS
            .iter()
            .filter(|(name, _)| *name == spec)
            .map(|(name, addr)| ResolvedLocation::new(*addr).function(name).in_pspace(pspace))
            .collect()
    }
}

/// 小さなプログラムを載せたシミュレーションターゲットを作る
pub fn simulated_program(caps: SimCapabilities) -> (SimTarget, SymbolTable) {
    let mut target = SimTarget::with_caps(caps);
    target.map(TEXT_START, &[0x90; 0x200]);
    target.map_read_only(RODATA_START, &[0x90; 0x40]);
    target.map(DATA_START, &[0; 0x100]);
    target.map(STACK_BASE - 0x100, &[0; 0x200]);
    target.poke(DATA_START + 0x10, &DATA_START.to_le_bytes());
    target.push_frame(TEXT_START, STACK_BASE);

    let mut symbols = SymbolTable::new();
    symbols.add(Symbol::global("counter", DATA_START, 4));
    symbols.add(Symbol::global("ptr", DATA_START + 0x10, 8));
    symbols.add(Symbol::global("buffer", DATA_START + 0x20, 32));
    symbols.add(Symbol::local(
        "local",
        -8,
        4,
        Scope::new(TEXT_START, TEXT_START + 0x40),
    ));
    (target, symbols)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_function_table() {
        let resolved = FunctionTable.resolve("compute", ProgramSpaceId::INITIAL);
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].address, TEXT_START + 0x40);
        assert!(FunctionTable
            .resolve("missing", ProgramSpaceId::INITIAL)
            .is_empty());
    }

    #[test]
    fn test_simulated_program_layout() {
        let (target, _) = simulated_program(SimCapabilities::default());
        assert_eq!(target.peek(TEXT_START, 1), vec![0x90]);
        assert_eq!(
            target.peek(DATA_START + 0x10, 8),
            DATA_START.to_le_bytes().to_vec()
        );
        assert_eq!(target.selected_frame().map(|f| f.pc), Some(TEXT_START));
    }
}
