//! ハードウェアのデバッグ資源の集計

use crate::breakpoint::{Breakpoint, BreakpointId};
use crate::debugger::Debugger;
use crate::kind::BreakpointKind;
use tomari_expr::{Lval, Value};
use tomari_target::Target;

/// ハードウェアウォッチポイントの資源の使用状況
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SlotUsage {
    /// 指定した種類が使っている数
    pub same_kind: usize,
    /// 他の種類のハードウェアウォッチポイントが使っている数
    pub other_kinds: usize,
}

impl<T: Target> Debugger<T> {
    /// 有効なハードウェアブレークポイントが使っているロケーション数
    pub fn hw_breakpoints_in_use(&self) -> usize {
        self.hw_breakpoints_excluding(None)
    }

    pub(crate) fn hw_breakpoints_excluding(&self, except: Option<BreakpointId>) -> usize {
        self.breakpoints
            .iter()
            .filter(|b| b.kind == BreakpointKind::HwBreakpoint)
            .filter(|b| b.is_enabled() && Some(b.id) != except)
            .map(|b| b.locations.len())
            .sum()
    }

    /// 1つのウォッチポイントが使うデバッグレジスタ数
    pub(crate) fn hw_watchpoint_use_count(&self, bp: &Breakpoint) -> usize {
        if !bp.is_enabled() {
            return 0;
        }
        let mask = bp.watch().and_then(|w| w.mask);
        bp.locations
            .iter()
            .filter_map(|l| self.arena.get(*l))
            .map(|loc| match mask {
                Some(mask) => self
                    .target
                    .masked_watch_num_registers(loc.address, mask)
                    .unwrap_or(0),
                None => self
                    .target
                    .region_ok_for_hw_watchpoint(loc.address, loc.length),
            })
            .sum()
    }

    /// `kind` のウォッチポイントと、それ以外のハードウェア資源の使用数
    pub fn hw_watchpoint_slots(&self, kind: BreakpointKind) -> SlotUsage {
        self.hw_watchpoint_slots_excluding(None, kind)
    }

    /// `except` を除いて集計する
    ///
    /// 他の種類の数にはハードウェアブレークポイントも含めます。
    pub fn hw_watchpoint_slots_excluding(
        &self,
        except: Option<BreakpointId>,
        kind: BreakpointKind,
    ) -> SlotUsage {
        let mut usage = SlotUsage::default();
        for bp in &self.breakpoints {
            if Some(bp.id) == except || !bp.kind.is_hardware_watchpoint() {
                continue;
            }
            let count = self.hw_watchpoint_use_count(bp);
            if bp.kind == kind {
                usage.same_kind += count;
            } else {
                usage.other_kinds += count;
            }
        }
        usage.other_kinds += self.hw_breakpoints_in_use();
        usage
    }

    /// ハードウェアウォッチポイントとブレークポイントが使う資源の合計
    pub(crate) fn hw_watchpoint_use_all(&self) -> usize {
        self.breakpoints
            .iter()
            .filter(|b| b.kind.is_hardware_watchpoint())
            .map(|b| self.hw_watchpoint_use_count(b))
            .sum()
    }

    /// 値チェーンをハードウェアで監視するのに必要なレジスタ数
    ///
    /// 0 ならハードウェアでは監視できません（レジスタを含む、監視できない領域がある、
    /// またはハードウェアウォッチポイントの使用が禁止されている）。
    pub(crate) fn can_use_hardware_watchpoint(&self, chain: &[Value]) -> usize {
        if !self.settings.can_use_hw_watchpoints {
            return 0;
        }
        let Some(head) = chain.len().checked_sub(1) else {
            return 0;
        };

        let mut found = 0;
        for (i, v) in chain.iter().enumerate() {
            match &v.lval {
                Lval::Memory { address, len } => {
                    if i != head && v.lazy {
                        // アドレスだけ使って中身を読まなかった値
                        continue;
                    }
                    if i == head || !v.is_aggregate() {
                        let regs = self.target.region_ok_for_hw_watchpoint(*address, *len);
                        if regs == 0 {
                            return 0;
                        }
                        found += regs;
                    }
                }
                Lval::Register(_) => return 0,
                Lval::NotLval => {}
            }
        }
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tomari_target::SimTarget;

    #[test]
    fn test_value_chain_registers() {
        let dbg = Debugger::new(SimTarget::new());
        let chain = vec![
            Value::from_memory(0x1000, vec![0; 8], false),
            Value::from_memory(0x2000, vec![0; 4], false),
        ];
        assert_eq!(dbg.can_use_hardware_watchpoint(&chain), 2);

        let with_register = vec![
            Value::from_register("rax", 0x1000),
            Value::from_memory(0x1000, vec![0; 4], false),
        ];
        assert_eq!(dbg.can_use_hardware_watchpoint(&with_register), 0);
    }

    #[test]
    fn test_lazy_intermediate_is_skipped() {
        let dbg = Debugger::new(SimTarget::new());
        let chain = vec![
            Value::lazy_memory(0x1000, 64),
            Value::from_memory(0x1008, vec![0; 4], false),
        ];
        assert_eq!(dbg.can_use_hardware_watchpoint(&chain), 1);
    }

    #[test]
    fn test_aggregate_result_cannot_use_hardware() {
        let dbg = Debugger::new(SimTarget::new());
        let chain = vec![Value::from_memory(0x1000, vec![0; 64], false)];
        assert_eq!(dbg.can_use_hardware_watchpoint(&chain), 0);
    }

    #[test]
    fn test_disabled_by_setting() {
        let mut dbg = Debugger::new(SimTarget::new());
        dbg.set_setting("can-use-hw-watchpoints", "off").unwrap();
        let chain = vec![Value::from_memory(0x1000, vec![0; 4], false)];
        assert_eq!(dbg.can_use_hardware_watchpoint(&chain), 0);
    }
}
