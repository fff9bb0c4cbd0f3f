//! グローバルロケーションリスト
//!
//! 全ブレークポイントのロケーションをソートした索引です。ロケーション自体は
//! アリーナが持ち、ここでは ID だけを保持します。

use crate::location::{location_order, LocationArena, LocationId};
use crate::pspace::ProgramSpaceId;

/// ロケーションの索引
#[derive(Debug, Default)]
pub struct Registry {
    /// ソート済みのグローバルロケーションリスト
    pub(crate) global: Vec<LocationId>,
    /// 所有者を失い、遅れて届くトラップの説明のために残しているロケーション
    pub(crate) moribund: Vec<LocationId>,
    /// 削除に失敗したまま所有者を失ったロケーション（次のパスで再試行）
    pub(crate) stuck: Vec<LocationId>,
    /// 所有者から外され、まだ解放されていないロケーション
    pub(crate) detached: Vec<LocationId>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 新しいロケーション一覧をソートして置き換え、古いリストを返す
    pub fn rebuild(&mut self, arena: &LocationArena, mut ids: Vec<LocationId>) -> Vec<LocationId> {
        ids.retain(|id| arena.contains(*id));
        ids.sort_by(|a, b| match (arena.get(*a), arena.get(*b)) {
            (Some(la), Some(lb)) => location_order((la, *a), (lb, *b)),
            _ => a.cmp(b),
        });
        ids.dedup();
        std::mem::replace(&mut self.global, ids)
    }

    /// ソート済みのグローバルロケーションリスト
    pub fn locations(&self) -> &[LocationId] {
        &self.global
    }

    pub fn moribund(&self) -> &[LocationId] {
        &self.moribund
    }

    pub fn stuck(&self) -> &[LocationId] {
        &self.stuck
    }

    fn address_of(arena: &LocationArena, id: LocationId) -> u64 {
        arena.get(id).map(|l| l.address).unwrap_or(u64::MAX)
    }

    /// アドレスが `[start, end)` に入るロケーション
    pub fn in_range(&self, arena: &LocationArena, start: u64, end: u64) -> &[LocationId] {
        let lo = self
            .global
            .partition_point(|id| Self::address_of(arena, *id) < start);
        let hi = self
            .global
            .partition_point(|id| Self::address_of(arena, *id) < end);
        &self.global[lo..hi.max(lo)]
    }

    /// アドレスが一致するロケーション（プログラム空間は問わない）
    pub fn at_address(&self, arena: &LocationArena, address: u64) -> &[LocationId] {
        self.in_range(arena, address, address.saturating_add(1))
    }

    /// アドレスとプログラム空間が一致するロケーション
    pub fn duplicates_at(
        &self,
        arena: &LocationArena,
        address: u64,
        pspace: ProgramSpaceId,
    ) -> Vec<LocationId> {
        self.at_address(arena, address)
            .iter()
            .copied()
            .filter(|id| arena.get(*id).map(|l| l.pspace == pspace).unwrap_or(false))
            .collect()
    }

    /// グローバルリストに含まれるか
    pub fn contains(&self, arena: &LocationArena, id: LocationId) -> bool {
        match arena.get(id) {
            Some(loc) => self.at_address(arena, loc.address).contains(&id),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breakpoint::BreakpointId;
    use crate::kind::BreakpointKind;
    use crate::location::Location;
    use crate::pspace::AddressSpaceId;

    fn add(arena: &mut LocationArena, owner: i32, addr: u64, pspace: u32) -> LocationId {
        arena.alloc(Location::new(
            BreakpointId(owner),
            BreakpointKind::Breakpoint,
            addr,
            ProgramSpaceId(pspace),
            AddressSpaceId(pspace),
        ))
    }

    #[test]
    fn test_rebuild_sorts() {
        let mut arena = LocationArena::new();
        let c = add(&mut arena, 3, 0x30, 1);
        let a = add(&mut arena, 2, 0x10, 1);
        let b = add(&mut arena, 1, 0x10, 1);

        let mut registry = Registry::new();
        let old = registry.rebuild(&arena, vec![c, a, b]);
        assert!(old.is_empty());
        assert_eq!(registry.locations(), &[b, a, c]);

        let old = registry.rebuild(&arena, vec![c]);
        assert_eq!(old, vec![b, a, c]);
        assert_eq!(registry.locations(), &[c]);
    }

    #[test]
    fn test_queries() {
        let mut arena = LocationArena::new();
        let a = add(&mut arena, 1, 0x10, 1);
        let b = add(&mut arena, 2, 0x10, 2);
        let c = add(&mut arena, 3, 0x18, 1);
        let d = add(&mut arena, 4, 0x40, 1);

        let mut registry = Registry::new();
        registry.rebuild(&arena, vec![a, b, c, d]);

        assert_eq!(registry.at_address(&arena, 0x10), &[a, b]);
        assert_eq!(registry.duplicates_at(&arena, 0x10, ProgramSpaceId(2)), vec![b]);
        assert_eq!(registry.in_range(&arena, 0x11, 0x40), &[c]);
        assert!(registry.at_address(&arena, 0x20).is_empty());
        assert!(registry.contains(&arena, d));

        arena.remove(d);
        assert!(!registry.contains(&arena, d));
    }
}
