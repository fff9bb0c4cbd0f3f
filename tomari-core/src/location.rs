//! ブレークポイントのロケーションとその置き場所（アリーナ）
//!
//! ロケーションはアリーナに置かれ、安定した [`LocationId`] で参照されます。
//! 所有者を失った moribund ロケーションも同じアリーナに残り、
//! 寿命が尽きたときに停止イベントの処理が解放します。

use crate::breakpoint::BreakpointId;
use crate::kind::{BreakpointKind, LocKind};
use crate::pspace::{AddressSpaceId, ProgramSpaceId};
use std::cmp::Ordering;
use std::fmt;
use tomari_expr::{Bytecode, Expression};
use tomari_target::{CatchKind, TargetBreakpoint, WatchKind};

/// ロケーションID（アリーナ内のインデックス）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocationId(pub usize);

impl fmt::Display for LocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// 条件式の変更状態（ターゲット側評価用）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionChange {
    Unchanged,
    /// このロケーションの条件式が変わった
    Modified,
    /// 同じアドレスの別のロケーションの変更に伴って更新が必要
    Updated,
}

/// ブレークポイントのロケーション
#[derive(Debug, Clone)]
pub struct Location {
    /// 所有するブレークポイント。moribund なら `None`
    pub owner: Option<BreakpointId>,
    /// 所有者の種類と番号（所有者を失った後も使う）
    pub owner_kind: BreakpointKind,
    pub owner_number: i32,
    pub kind: LocKind,
    pub requested_address: u64,
    pub address: u64,
    /// 範囲ブレークポイントの範囲、ウォッチポイントの監視領域の長さ
    pub length: usize,
    pub pspace: ProgramSpaceId,
    pub aspace: AddressSpaceId,
    /// ハードウェアウォッチポイントとして挿入するアクセス種別
    pub watch_kind: Option<WatchKind>,
    /// マスク付きウォッチポイントのマスク
    pub mask: Option<u64>,
    /// キャッチポイントが捕捉するイベント
    pub catch: Option<CatchKind>,
    pub enabled: bool,
    /// 条件式が不正なため無効
    pub disabled_by_cond: bool,
    /// 同じ場所の別のロケーションが挿入を担当している
    pub duplicate: bool,
    pub inserted: bool,
    /// ライブラリがアンロードされたため無効
    pub shlib_disabled: bool,
    /// プログラム自体にトラップ命令がある
    pub permanent: bool,
    /// 挿入済みだが条件・コマンドを送り直す必要がある
    pub needs_update: bool,
    pub condition_changed: ConditionChange,
    pub cond: Option<Expression>,
    pub cond_bytecode: Option<Bytecode>,
    pub cmd_bytecode: Option<Bytecode>,
    pub target_info: TargetBreakpoint,
    /// moribund ロケーションが解放されるまでの停止イベント数
    pub events_till_retirement: usize,
    pub function: Option<String>,
    pub line: Option<u32>,
}

impl Location {
    pub fn new(
        owner: BreakpointId,
        owner_kind: BreakpointKind,
        address: u64,
        pspace: ProgramSpaceId,
        aspace: AddressSpaceId,
    ) -> Self {
        let kind = owner_kind.traits().loc_kind;
        Self {
            owner: Some(owner),
            owner_kind,
            owner_number: owner.0,
            kind,
            requested_address: address,
            address,
            length: 0,
            pspace,
            aspace,
            watch_kind: None,
            mask: None,
            catch: None,
            enabled: true,
            disabled_by_cond: false,
            duplicate: false,
            inserted: false,
            shlib_disabled: false,
            permanent: false,
            needs_update: false,
            condition_changed: ConditionChange::Unchanged,
            cond: None,
            cond_bytecode: None,
            cmd_bytecode: None,
            target_info: TargetBreakpoint::default(),
            events_till_retirement: 0,
            function: None,
            line: None,
        }
    }

    /// アドレスに意味があるか（キャッチポイントのロケーションは持たない）
    pub fn address_is_meaningful(&self) -> bool {
        self.kind != LocKind::Other
    }

    pub fn is_code(&self) -> bool {
        matches!(self.kind, LocKind::SwBreakpoint | LocKind::HwBreakpoint)
    }

    pub fn is_moribund(&self) -> bool {
        self.owner.is_none()
    }

    /// 挿入できる状態か（重複フラグは見ない）
    pub fn is_usable(&self) -> bool {
        self.enabled && !self.disabled_by_cond && !self.shlib_disabled
    }
}

/// グローバルロケーションリストのソート順
///
/// アドレス、プログラム空間、永続トラップが先、ロケーションの種類、長さ、
/// 所有者の番号、最後にアリーナのインデックスで全順序にします。
pub fn location_order(a: (&Location, LocationId), b: (&Location, LocationId)) -> Ordering {
    let (la, ia) = a;
    let (lb, ib) = b;
    la.address
        .cmp(&lb.address)
        .then(la.pspace.cmp(&lb.pspace))
        .then(lb.permanent.cmp(&la.permanent))
        .then(la.kind.cmp(&lb.kind))
        .then(la.length.cmp(&lb.length))
        .then(la.owner_number.cmp(&lb.owner_number))
        .then(ia.cmp(&ib))
}

/// 2つのアドレスが同じ場所を指すか
pub fn address_match(
    aspace1: AddressSpaceId,
    addr1: u64,
    aspace2: AddressSpaceId,
    addr2: u64,
    global_breakpoints: bool,
) -> bool {
    (global_breakpoints || aspace1 == aspace2) && addr1 == addr2
}

/// ロケーションがアドレスに当たるか（範囲ブレークポイントは範囲内）
pub fn location_address_match(
    loc: &Location,
    aspace: AddressSpaceId,
    addr: u64,
    global_breakpoints: bool,
) -> bool {
    if address_match(loc.aspace, loc.address, aspace, addr, global_breakpoints) {
        return true;
    }
    loc.length > 0
        && (global_breakpoints || loc.aspace == aspace)
        && addr >= loc.address
        && addr < loc.address.wrapping_add(loc.length as u64)
}

/// コード・トレースポイントのロケーションが重複しているか
///
/// ハードウェアウォッチポイントの条件式の高速評価は見ないので、
/// 呼び出し側で確認します。
pub fn locations_match(
    a: &Location,
    b: &Location,
    global_breakpoints: bool,
    sw_hw_match: bool,
) -> bool {
    let hw_a = a.owner_kind.is_hardware_watchpoint();
    let hw_b = b.owner_kind.is_hardware_watchpoint();
    if hw_a != hw_b {
        return false;
    }
    if hw_a {
        // 所有者の種類で比べる（read を access で代用しているロケーションも重複とみなす）
        return a.owner_kind == b.owner_kind
            && a.aspace == b.aspace
            && a.address == b.address
            && a.length == b.length;
    }
    // トレースポイントは何とも重複しない
    if a.owner_kind.is_tracepoint() || b.owner_kind.is_tracepoint() {
        return false;
    }
    address_match(a.aspace, a.address, b.aspace, b.address, global_breakpoints)
        && (a.kind == b.kind || sw_hw_match)
        && a.length == b.length
}

/// ロケーションのアリーナ
#[derive(Debug, Default)]
pub struct LocationArena {
    slots: Vec<Option<Location>>,
    free: Vec<usize>,
}

impl LocationArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// ロケーションを置き、IDを返す
    pub fn alloc(&mut self, loc: Location) -> LocationId {
        match self.free.pop() {
            Some(index) => {
                self.slots[index] = Some(loc);
                LocationId(index)
            }
            None => {
                self.slots.push(Some(loc));
                LocationId(self.slots.len() - 1)
            }
        }
    }

    pub fn get(&self, id: LocationId) -> Option<&Location> {
        self.slots.get(id.0).and_then(|s| s.as_ref())
    }

    pub fn get_mut(&mut self, id: LocationId) -> Option<&mut Location> {
        self.slots.get_mut(id.0).and_then(|s| s.as_mut())
    }

    /// ロケーションを解放する
    pub fn remove(&mut self, id: LocationId) -> Option<Location> {
        let loc = self.slots.get_mut(id.0).and_then(|s| s.take());
        if loc.is_some() {
            self.free.push(id.0);
        }
        loc
    }

    pub fn contains(&self, id: LocationId) -> bool {
        self.get(id).is_some()
    }

    /// 生きているロケーションの数
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (LocationId, &Location)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|l| (LocationId(i), l)))
    }

    /// 2つのロケーションを同時に可変で借りる
    pub fn pair_mut(
        &mut self,
        a: LocationId,
        b: LocationId,
    ) -> Option<(&mut Location, &mut Location)> {
        if a == b || a.0 >= self.slots.len() || b.0 >= self.slots.len() {
            return None;
        }
        let (first, second, swapped) = if a.0 < b.0 { (a.0, b.0, false) } else { (b.0, a.0, true) };
        let (left, right) = self.slots.split_at_mut(second);
        let x = left[first].as_mut()?;
        let y = right[0].as_mut()?;
        if swapped {
            Some((y, x))
        } else {
            Some((x, y))
        }
    }
}
