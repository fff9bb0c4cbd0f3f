//! シャドウを考慮したメモリアクセスとアドレスの問い合わせ
//!
//! ソフトウェアブレークポイントを挿入するとターゲットのメモリにはトラップ命令が
//! 書き込まれています。デバッガ側の読み書きはロケーションが退避した元のバイト列
//! （シャドウ）を通して行い、トラップが見えないようにします。

use crate::debugger::Debugger;
use crate::kind::{BreakpointKind, LocKind};
use crate::location::{location_address_match, Location};
use crate::pspace::AddressSpaceId;
use tomari_expr::{EvalContext, MemoryReader};
use tomari_target::Target;

/// アドレスにあるブレークポイントの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakpointHere {
    None,
    Ordinary,
    /// プログラム自体のトラップ命令
    Permanent,
}

/// シャドウを通してターゲットを読む評価コンテキスト
pub struct ShadowView<'a, T: Target> {
    debugger: &'a Debugger<T>,
}

impl<'a, T: Target> ShadowView<'a, T> {
    pub fn new(debugger: &'a Debugger<T>) -> Self {
        Self { debugger }
    }
}

impl<T: Target> MemoryReader for ShadowView<'_, T> {
    fn read(&self, addr: u64, size: usize) -> anyhow::Result<Vec<u8>> {
        self.debugger.read_memory(addr, size)
    }
}

impl<T: Target> EvalContext for ShadowView<'_, T> {
    fn read_register(&self, name: &str) -> anyhow::Result<u64> {
        self.debugger.target.read_register(name)
    }

    fn read_register_by_number(&self, number: u16) -> anyhow::Result<u64> {
        self.debugger.target.read_register_by_number(number)
    }

    fn frame_base(&self) -> Option<u64> {
        self.debugger.target.frame_base()
    }
}

/// `[start, start + len)` と重なる部分（ロケーションのシャドウ内のオフセット、
/// バッファ内のオフセット、長さ）
fn overlap(shadow_addr: u64, shadow_len: usize, start: u64, len: usize) -> Option<(usize, usize, usize)> {
    let lo = shadow_addr.max(start);
    let hi = shadow_addr
        .saturating_add(shadow_len as u64)
        .min(start.saturating_add(len as u64));
    if lo >= hi {
        return None;
    }
    Some((
        (lo - shadow_addr) as usize,
        (lo - start) as usize,
        (hi - lo) as usize,
    ))
}

impl<T: Target> Debugger<T> {
    /// トラップ命令を置き換えたシャドウを持つロケーション
    fn shadowed_locations(&self) -> impl Iterator<Item = &Location> {
        self.registry
            .global
            .iter()
            .chain(self.registry.stuck.iter())
            .filter_map(|lid| self.arena.get(*lid))
            .filter(|loc| {
                loc.inserted
                    && loc.kind == LocKind::SwBreakpoint
                    && !loc.permanent
                    && !loc.target_info.shadow.is_empty()
            })
    }

    /// ターゲットのメモリを読む（挿入済みトラップの場所は元のバイト列を返す）
    pub fn read_memory(&self, addr: u64, len: usize) -> anyhow::Result<Vec<u8>> {
        let mut buf = self.target.read(addr, len)?;
        for loc in self.shadowed_locations() {
            let info = &loc.target_info;
            if let Some((from, to, n)) = overlap(info.placed_address, info.shadow.len(), addr, len) {
                buf[to..to + n].copy_from_slice(&info.shadow[from..from + n]);
            }
        }
        Ok(buf)
    }

    /// ターゲットのメモリに書く
    ///
    /// 挿入済みトラップの場所はトラップを残したままシャドウを更新します。
    pub fn write_memory(&mut self, addr: u64, data: &[u8]) -> anyhow::Result<()> {
        let mut buf = data.to_vec();
        let mut touched = Vec::new();
        for lid in self.registry.global.iter().chain(self.registry.stuck.iter()) {
            let Some(loc) = self.arena.get(*lid) else {
                continue;
            };
            if !loc.inserted || loc.kind != LocKind::SwBreakpoint || loc.permanent {
                continue;
            }
            let info = &loc.target_info;
            if let Some((_, to, n)) = overlap(info.placed_address, info.shadow.len(), addr, data.len()) {
                // 現在のトラップ命令をそのまま書き戻す
                let current = self.target.read(addr + to as u64, n)?;
                buf[to..to + n].copy_from_slice(&current);
                touched.push(*lid);
            }
        }

        self.target.write_memory(addr, &buf)?;

        for lid in touched {
            if let Some(loc) = self.arena.get_mut(lid) {
                let info = &mut loc.target_info;
                if let Some((from, to, n)) =
                    overlap(info.placed_address, info.shadow.len(), addr, data.len())
                {
                    info.shadow[from..from + n].copy_from_slice(&data[to..to + n]);
                }
            }
        }
        Ok(())
    }

    /// アドレスに有効なコードブレークポイントがあるか
    pub fn breakpoint_here(&self, aspace: AddressSpaceId, address: u64) -> BreakpointHere {
        let global = self.target.has_global_breakpoints();
        let mut any = false;
        for lid in &self.registry.global {
            let Some(loc) = self.arena.get(*lid) else {
                continue;
            };
            if !loc.is_code() || !loc.is_usable() {
                continue;
            }
            if !self.owner_of(*lid).map(|b| b.is_enabled()).unwrap_or(false) {
                continue;
            }
            if !location_address_match(loc, aspace, address, global) {
                continue;
            }
            if loc.permanent {
                return BreakpointHere::Permanent;
            }
            any = true;
        }
        if any {
            BreakpointHere::Ordinary
        } else {
            BreakpointHere::None
        }
    }

    /// アドレスにトラップが挿入されているか
    pub fn breakpoint_inserted_here(&self, aspace: AddressSpaceId, address: u64) -> bool {
        let global = self.target.has_global_breakpoints();
        self.registry.global.iter().any(|lid| {
            self.arena
                .get(*lid)
                .map(|loc| {
                    loc.is_code()
                        && loc.inserted
                        && !loc.duplicate
                        && location_address_match(loc, aspace, address, global)
                })
                .unwrap_or(false)
        })
    }

    /// アドレスに moribund ロケーションがあるか
    pub fn moribund_breakpoint_here(&self, aspace: AddressSpaceId, address: u64) -> bool {
        let global = self.target.has_global_breakpoints();
        self.registry.moribund.iter().any(|lid| {
            self.arena
                .get(*lid)
                .map(|loc| location_address_match(loc, aspace, address, global))
                .unwrap_or(false)
        })
    }

    /// 有効なソフトウェアウォッチポイントがあるか
    pub fn software_watchpoint_active(&self) -> bool {
        self.breakpoints.iter().any(|b| {
            b.kind == BreakpointKind::Watchpoint && b.is_enabled() && !b.locations.is_empty()
        })
    }

    /// 1命令ずつ実行する必要があるか
    pub fn should_step(&self) -> bool {
        self.software_watchpoint_active()
    }
}
