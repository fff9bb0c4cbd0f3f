//! グローバルロケーションリストの再調整とターゲットへの反映
//!
//! ブレークポイントの追加・削除・有効化などの後に [`Debugger::update_global_location_list`]
//! を呼び、ソート済みのリストを作り直して次の順で処理します。
//!
//! 1. 前回削除に失敗した所有者なしのロケーションを再試行する
//! 2. 不要になった挿入済みロケーションを削除する（同じ場所の後継があれば挿入状態を付け替える）
//! 3. 重複グループごとにプライマリを決め、他を重複としてマークする
//! 4. 必要なら挿入する
//!
//! 1つのロケーションの失敗で残りの処理は止めず、失敗は [`ReconcileReport`] に集めます。

use crate::breakpoint::{BreakpointId, Disposition, EnableState, Restriction};
use crate::debugger::{Debugger, Notify};
use crate::errors::{BreakpointError, ReconcileReport, Result};
use crate::kind::{BreakpointKind, LocKind};
use crate::location::{address_match, locations_match, ConditionChange, LocationId};
use crate::settings::DprintfStyle;
use std::collections::HashSet;
use tomari_expr::{compile_for_target, parse_expression, Bytecode, Expression};
use tomari_target::{Target, TargetError, WatchKind};
use tracing::{debug, warn};

/// 再調整パスで挿入まで行うか
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertMode {
    /// 挿入しない（挿入済みのものの条件更新だけ行う）
    DontInsert,
    /// 挿入すべき状況なら挿入する
    MayInsert,
    /// 常に挿入する
    Insert,
}

#[derive(Debug, Default)]
struct InsertState {
    /// 共有ライブラリのブレークポイントを一時的に無効にした
    disabled_breaks: bool,
}

impl<T: Target> Debugger<T> {
    /// ロケーションを挿入すべきか
    pub fn should_insert(&self, lid: LocationId) -> bool {
        self.should_be_inserted(lid, false)
    }

    pub(crate) fn should_be_inserted(&self, lid: LocationId, ignore_duplicate: bool) -> bool {
        let Some(loc) = self.arena.get(lid) else {
            return false;
        };
        let Some(owner) = loc.owner.and_then(|id| self.bp(id)) else {
            return false;
        };
        if !owner.is_enabled() || owner.disposition == Disposition::DeleteAtNextStop {
            return false;
        }
        if !loc.is_usable() {
            return false;
        }
        if !ignore_duplicate && loc.duplicate {
            return false;
        }
        if owner.id.is_user()
            && self
                .program_space(loc.pspace)
                .map(|p| p.executing_startup)
                .unwrap_or(false)
        {
            return false;
        }
        if owner.kind.is_tracepoint() {
            return false;
        }

        // 踏み越え中のアドレスには挿入しない（踏み越えているスレッドのシングルステップは除く）
        if loc.is_code() {
            if let Some(step) = &self.step_over {
                let global = self.target.has_global_breakpoints();
                if address_match(loc.aspace, loc.address, step.aspace, step.address, global)
                    && !(owner.kind == BreakpointKind::SingleStep
                        && owner.restriction == Restriction::Thread(step.thread))
                {
                    debug!(
                        "Stepping past breakpoint {} at 0x{:x}, not inserting",
                        owner.id, loc.address
                    );
                    return false;
                }
            }
        }

        if loc.kind == LocKind::HwWatchpoint && self.stepping_past_watchpoint {
            return false;
        }
        true
    }

    /// 停止中もブレークポイントを挿入しておくべきか
    pub fn breakpoints_should_be_inserted_now(&self) -> bool {
        if self.target.has_global_breakpoints() {
            return true;
        }
        if !self.target.has_execution() {
            return false;
        }
        self.settings.always_inserted || self.threads_executing
    }

    /// 2つのロケーションが同じ物理的な挿入を共有できるか
    pub(crate) fn locations_match(&self, a: LocationId, b: LocationId) -> bool {
        let (Some(la), Some(lb)) = (self.arena.get(a), self.arena.get(b)) else {
            return false;
        };
        if la.owner_kind.is_hardware_watchpoint() && lb.owner_kind.is_hardware_watchpoint() {
            // ターゲット側で条件を評価するウォッチポイントは共有できない
            if self.watch_condition_accelerated(a) || self.watch_condition_accelerated(b) {
                return false;
            }
        }
        locations_match(la, lb, self.target.has_global_breakpoints(), false)
    }

    fn watch_condition_accelerated(&self, lid: LocationId) -> bool {
        let Some(loc) = self.arena.get(lid) else {
            return false;
        };
        let Some(cond) = self
            .owner_of(lid)
            .and_then(|b| b.watch())
            .and_then(|w| w.cond_expr.as_ref())
        else {
            return false;
        };
        match compile_for_target(cond) {
            Some(code) => self.target.can_accel_watchpoint_condition(
                loc.address,
                loc.length,
                loc.watch_kind.unwrap_or(WatchKind::Write),
                &code,
            ),
            None => false,
        }
    }

    /// 全ブレークポイントを再調整する
    pub fn reconcile(&mut self) -> Result<()> {
        self.update_global_location_list(InsertMode::MayInsert)
            .into_result()
    }

    /// 実行再開前に全てのブレークポイントを挿入する
    pub fn insert_breakpoints(&mut self) -> Result<()> {
        let watchpoints: Vec<BreakpointId> = self
            .breakpoints
            .iter()
            .filter(|b| b.kind.is_hardware_watchpoint())
            .map(|b| b.id)
            .collect();
        for id in watchpoints {
            if let Err(e) = self.update_watchpoint(id, false) {
                self.warn(e.to_string());
            }
        }
        self.threads_executing = true;
        self.update_global_location_list(InsertMode::Insert)
            .into_result()
    }

    /// 挿入済みの全ロケーションをターゲットから削除する
    ///
    /// 最初に失敗したロケーションのエラーを返しますが、残りの削除は続けます。
    pub fn remove_breakpoints(&mut self) -> Result<()> {
        let mut first_error = None;
        for lid in self.registry.global.clone() {
            let Some(loc) = self.arena.get(lid) else {
                continue;
            };
            if !loc.inserted || loc.owner_kind.is_tracepoint() {
                continue;
            }
            let (number, address) = (loc.owner_number, loc.address);
            if let Err(source) = self.remove_location(lid) {
                first_error.get_or_insert(BreakpointError::TargetRejected {
                    number,
                    address,
                    source,
                });
            }
        }
        self.threads_executing = false;
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// グローバルロケーションリストを作り直し、ターゲットの状態を合わせる
    pub(crate) fn update_global_location_list(&mut self, mode: InsertMode) -> ReconcileReport {
        let mut report = ReconcileReport::new();
        self.retry_stuck_locations(&mut report);

        let ids: Vec<LocationId> = self
            .breakpoints
            .iter()
            .flat_map(|b| b.locations.iter().copied())
            .collect();
        let old = self.registry.rebuild(&self.arena, ids);
        let current: HashSet<LocationId> = self.registry.global.iter().copied().collect();

        if self.target_side_conditions_active() {
            self.force_condition_reinsertion(&old, &current);
        }

        self.remove_superseded(&old, &current, &mut report);
        self.mark_duplicates(&mut report);

        if mode == InsertMode::Insert || self.breakpoints_should_be_inserted_now() {
            if mode != InsertMode::DontInsert {
                self.insert_breakpoint_locations(&mut report);
            } else {
                self.update_inserted_breakpoint_locations(&mut report);
            }
        }

        for lid in std::mem::take(&mut self.registry.detached) {
            if current.contains(&lid)
                || self.registry.moribund.contains(&lid)
                || self.registry.stuck.contains(&lid)
            {
                continue;
            }
            self.arena.remove(lid);
        }

        if !report.is_ok() {
            self.warn(report.to_string());
        }
        self.last_report = report.clone();
        report
    }

    fn retry_stuck_locations(&mut self, report: &mut ReconcileReport) {
        for lid in std::mem::take(&mut self.registry.stuck) {
            let Some((number, address)) = self.arena.get(lid).map(|l| (l.owner_number, l.address))
            else {
                continue;
            };
            match self.remove_location(lid) {
                Ok(()) => {
                    debug!("Removed stuck location of breakpoint {} at 0x{:x}", number, address);
                    self.arena.remove(lid);
                }
                Err(e) => {
                    report.push(
                        number,
                        Some(address),
                        format!("Cannot remove breakpoint {}: {}", number, e),
                    );
                    self.registry.stuck.push(lid);
                }
            }
        }
    }

    /// ターゲット側で条件を評価する場合、変更のあったアドレスの全ロケーションに
    /// 条件の送り直しを要求する
    fn force_condition_reinsertion(&mut self, old: &[LocationId], current: &HashSet<LocationId>) {
        let mut touched = Vec::new();
        for lid in &self.registry.global {
            if let Some(loc) = self.arena.get(*lid) {
                if loc.owner_kind.is_breakpoint() && loc.condition_changed == ConditionChange::Modified
                {
                    touched.push((loc.address, loc.pspace));
                }
            }
        }
        for lid in old {
            if current.contains(lid) {
                continue;
            }
            if let Some(loc) = self.arena.get(*lid) {
                if loc.owner_kind.is_breakpoint() {
                    touched.push((loc.address, loc.pspace));
                }
            }
        }
        touched.sort();
        touched.dedup();

        for (address, pspace) in touched {
            for lid in self.registry.duplicates_at(&self.arena, address, pspace) {
                if let Some(loc) = self.arena.get_mut(lid) {
                    if loc.owner_kind.is_breakpoint() {
                        loc.condition_changed = ConditionChange::Updated;
                        loc.cond_bytecode = None;
                    }
                }
            }
        }
    }

    /// 同じ場所を担当できる、挿入されていない後継ロケーション
    fn find_insertion_successor(&self, old_id: LocationId) -> Option<LocationId> {
        let loc = self.arena.get(old_id)?;
        self.registry
            .at_address(&self.arena, loc.address)
            .iter()
            .copied()
            .find(|cand| {
                *cand != old_id
                    && self.arena.get(*cand).map(|c| !c.permanent).unwrap_or(false)
                    && self.locations_match(*cand, old_id)
                    && self.should_be_inserted(*cand, true)
            })
    }

    /// 2つのロケーションの挿入状態を入れ替える
    pub(crate) fn swap_insertion(&mut self, left: LocationId, right: LocationId) {
        if let Some((l, r)) = self.arena.pair_mut(left, right) {
            std::mem::swap(&mut l.inserted, &mut r.inserted);
            std::mem::swap(&mut l.duplicate, &mut r.duplicate);
            std::mem::swap(&mut l.needs_update, &mut r.needs_update);
            std::mem::swap(&mut l.target_info, &mut r.target_info);
            debug!(
                "Swapped insertion of breakpoint {} and {} at 0x{:x}",
                l.owner_number, r.owner_number, l.address
            );
        }
    }

    fn remove_superseded(
        &mut self,
        old: &[LocationId],
        current: &HashSet<LocationId>,
        report: &mut ReconcileReport,
    ) {
        let swap_ok = self.target.tolerates_insertion_swap();
        for &old_id in old {
            let Some(loc) = self.arena.get(old_id) else {
                continue;
            };
            let found = current.contains(&old_id);
            let (inserted, meaningful, permanent) =
                (loc.inserted, loc.address_is_meaningful(), loc.permanent);
            let (number, address, hw_watch) = (
                loc.owner_number,
                loc.address,
                loc.owner_kind.is_hardware_watchpoint(),
            );
            let mut removed = false;
            let mut stuck = false;

            if inserted {
                let mut keep_in_target = found && self.should_be_inserted(old_id, false);

                if !keep_in_target && meaningful && swap_ok && !permanent {
                    if let Some(successor) = self.find_insertion_successor(old_id) {
                        self.swap_insertion(old_id, successor);
                        if hw_watch {
                            let watch_kind = self.arena.get(old_id).and_then(|l| l.watch_kind);
                            if let Some(s) = self.arena.get_mut(successor) {
                                s.watch_kind = watch_kind;
                            }
                        }
                        keep_in_target = true;
                    }
                }

                if !keep_in_target {
                    match self.remove_location(old_id) {
                        Ok(()) => removed = true,
                        Err(e) => {
                            report.push(
                                number,
                                Some(address),
                                format!("Cannot remove breakpoint {}: {}", number, e),
                            );
                            stuck = !found;
                        }
                    }
                }
            }

            if found {
                continue;
            }
            if stuck {
                self.registry.stuck.push(old_id);
            } else if removed && self.target.is_non_stop() && self.needs_moribund(old_id) {
                let budget = self.moribund_budget();
                if let Some(loc) = self.arena.get_mut(old_id) {
                    loc.owner = None;
                    loc.events_till_retirement = budget;
                }
                debug!(
                    "Breakpoint {} at 0x{:x} is moribund for {} stop(s)",
                    number, address, budget
                );
                self.registry.moribund.push(old_id);
            } else if !self.registry.moribund.contains(&old_id) {
                self.arena.remove(old_id);
            }
        }
    }

    /// 遅れて届くトラップを説明するために残す必要があるか
    pub(crate) fn needs_moribund(&self, lid: LocationId) -> bool {
        match self.arena.get(lid).map(|l| l.kind) {
            Some(LocKind::SwBreakpoint) => !self.target.supports_stopped_by_sw_breakpoint(),
            Some(LocKind::HwBreakpoint) => !self.target.supports_stopped_by_hw_breakpoint(),
            _ => false,
        }
    }

    fn moribund_budget(&self) -> usize {
        match self.target.thread_count() {
            Some(n) => self.settings.moribund_factor * (n + 1),
            None => 1,
        }
    }

    /// 重複グループごとにプライマリを決める
    ///
    /// ソート済みリストで最初に現れたロケーションがプライマリになり、
    /// 後続の挿入済みロケーションの挿入状態はプライマリへ移します。
    fn mark_duplicates(&mut self, report: &mut ReconcileReport) {
        // ハードウェアブレークポイント・読み取り・アクセス・その他で別々に追う
        let mut firsts: [Option<LocationId>; 4] = [None; 4];
        let swap_ok = self.target.tolerates_insertion_swap();

        for lid in self.registry.global.clone() {
            let qualifies = self.should_be_inserted(lid, true);
            let Some(loc) = self.arena.get(lid) else {
                continue;
            };
            if !qualifies || !loc.address_is_meaningful() || loc.owner_kind.is_tracepoint() {
                if let Some(loc) = self.arena.get_mut(lid) {
                    loc.condition_changed = ConditionChange::Unchanged;
                }
                continue;
            }

            let slot = match loc.owner_kind {
                BreakpointKind::HwBreakpoint => 0,
                BreakpointKind::ReadWatchpoint => 1,
                BreakpointKind::AccessWatchpoint => 2,
                _ => 3,
            };
            let first = match firsts[slot] {
                Some(f) if self.locations_match(lid, f) => f,
                _ => {
                    firsts[slot] = Some(lid);
                    if let Some(loc) = self.arena.get_mut(lid) {
                        loc.duplicate = false;
                        if loc.owner_kind.is_breakpoint()
                            && loc.condition_changed != ConditionChange::Unchanged
                        {
                            loc.needs_update = true;
                            loc.condition_changed = ConditionChange::Unchanged;
                        }
                    }
                    continue;
                }
            };

            let (inserted, permanent, number, address) =
                (loc.inserted, loc.permanent, loc.owner_number, loc.address);
            if inserted {
                let first_permanent = self.arena.get(first).map(|f| f.permanent).unwrap_or(false);
                if swap_ok && !permanent && !first_permanent {
                    self.swap_insertion(lid, first);
                } else if let Err(e) = self.remove_location(lid) {
                    report.push(
                        number,
                        Some(address),
                        format!("Cannot remove breakpoint {}: {}", number, e),
                    );
                }
            }
            if let Some(loc) = self.arena.get_mut(lid) {
                loc.duplicate = true;
                loc.condition_changed = ConditionChange::Unchanged;
            }
        }
    }

    fn insert_breakpoint_locations(&mut self, report: &mut ReconcileReport) {
        let global_bps = self.target.has_global_breakpoints();
        if !global_bps && !self.target.has_execution() {
            return;
        }

        let mut state = InsertState::default();
        for lid in self.registry.global.clone() {
            if !self.should_be_inserted(lid, false) {
                continue;
            }
            let Some(loc) = self.arena.get(lid) else {
                continue;
            };
            if loc.inserted && !loc.needs_update {
                continue;
            }
            self.insert_bp_location(lid, report, &mut state);
        }

        // ハードウェアウォッチポイントは全てのロケーションが入るか、何も入らないか
        let watchpoints: Vec<(BreakpointId, Vec<LocationId>)> = self
            .breakpoints
            .iter()
            .filter(|b| b.kind.is_hardware_watchpoint() && b.is_enabled())
            .filter(|b| b.disposition != Disposition::DeleteAtNextStop)
            .map(|b| (b.id, b.locations.clone()))
            .collect();
        for (id, locs) in watchpoints {
            let some_failed = locs.iter().any(|l| {
                self.should_be_inserted(*l, false)
                    && !self.arena.get(*l).map(|x| x.inserted).unwrap_or(true)
            });
            if !some_failed {
                continue;
            }
            for lid in &locs {
                let Some((inserted, address)) = self.arena.get(*lid).map(|l| (l.inserted, l.address))
                else {
                    continue;
                };
                if !inserted {
                    continue;
                }
                if let Err(e) = self.remove_location(*lid) {
                    warn!(
                        "Failed to remove hardware watchpoint {} at 0x{:x}: {}",
                        id, address, e
                    );
                    report.push(
                        id.0,
                        Some(address),
                        format!("Cannot remove hardware watchpoint {}: {}", id, e),
                    );
                }
            }
            report.hw_error = true;
            report.push(
                id.0,
                None,
                format!("Could not insert hardware watchpoint {}.", id),
            );
        }
    }

    /// 挿入済みロケーションの条件・コマンドだけ送り直す
    fn update_inserted_breakpoint_locations(&mut self, report: &mut ReconcileReport) {
        let global_bps = self.target.has_global_breakpoints();
        let mut state = InsertState::default();
        for lid in self.registry.global.clone() {
            let Some(loc) = self.arena.get(lid) else {
                continue;
            };
            if !loc.owner_kind.is_breakpoint() || !loc.inserted || !loc.needs_update {
                continue;
            }
            if !global_bps && !self.target.has_execution() {
                continue;
            }
            self.insert_bp_location(lid, report, &mut state);
        }
    }

    /// 1つのロケーションを挿入する。失敗を報告したら true
    fn insert_bp_location(
        &mut self,
        lid: LocationId,
        report: &mut ReconcileReport,
        state: &mut InsertState,
    ) -> bool {
        let Some(loc) = self.arena.get_mut(lid) else {
            return false;
        };
        loc.target_info.requested_address = loc.address;
        loc.target_info.length = loc.length;
        let (owner_kind, kind) = (loc.owner_kind, loc.kind);

        if owner_kind.is_breakpoint() {
            self.build_target_condition_list(lid);
            self.build_target_command_list(lid);
            if let Some(loc) = self.arena.get_mut(lid) {
                loc.needs_update = false;
            }
        }

        match kind {
            LocKind::SwBreakpoint | LocKind::HwBreakpoint => {
                self.insert_code_location(lid, report, state)
            }
            LocKind::HwWatchpoint => {
                let deleting = self
                    .owner_of(lid)
                    .map(|b| b.disposition == Disposition::DeleteAtNextStop)
                    .unwrap_or(true);
                if !deleting {
                    self.insert_watch_location(lid);
                }
                false
            }
            LocKind::Other => {
                self.insert_catch_location(lid);
                false
            }
            LocKind::SwWatchpoint | LocKind::Tracepoint => false,
        }
    }

    fn location_in_library(&self, lid: LocationId) -> bool {
        let Some(loc) = self.arena.get(lid) else {
            return false;
        };
        self.program_space(loc.pspace)
            .and_then(|p| p.library_at(loc.address))
            .is_some()
    }

    fn insert_code_location(
        &mut self,
        lid: LocationId,
        report: &mut ReconcileReport,
        state: &mut InsertState,
    ) -> bool {
        let Some(loc) = self.arena.get(lid) else {
            return false;
        };
        let (number, address, owner_kind, inserted) =
            (loc.owner_number, loc.address, loc.owner_kind, loc.inserted);

        if loc.permanent {
            if let Some(loc) = self.arena.get_mut(lid) {
                loc.inserted = true;
            }
            return false;
        }

        // 挿入済みなら条件・コマンドの送り直しだけ
        if inserted {
            let info = loc.target_info.clone();
            return match self.target.download_conditions(&info) {
                Ok(()) => false,
                Err(e) => {
                    report.push(
                        number,
                        Some(address),
                        format!("Cannot update conditions of breakpoint {}: {}", number, e),
                    );
                    true
                }
            };
        }

        if owner_kind != BreakpointKind::HwBreakpoint {
            if let Some(writable) = self.target.memory_writable(address) {
                let current = loc.kind;
                if self.settings.auto_hw {
                    let wanted = if writable {
                        LocKind::SwBreakpoint
                    } else {
                        LocKind::HwBreakpoint
                    };
                    if wanted != current {
                        if let Some(loc) = self.arena.get_mut(lid) {
                            loc.kind = wanted;
                        }
                        if wanted == LocKind::HwBreakpoint && !self.said_auto_hw {
                            self.said_auto_hw = true;
                            self.message(
                                "Note: automatically using hardware breakpoints for read-only addresses."
                                    .to_string(),
                            );
                        }
                    }
                } else if current == LocKind::SwBreakpoint && !writable {
                    report.push(
                        number,
                        Some(address),
                        format!(
                            "Cannot insert breakpoint {}.\nCannot set software breakpoint at read-only address 0x{:x}",
                            number, address
                        ),
                    );
                    return true;
                }
            }
        }

        let Some(loc) = self.arena.get(lid) else {
            return false;
        };
        let hardware = loc.kind == LocKind::HwBreakpoint;
        let mut info = loc.target_info.clone();
        let result = if hardware {
            self.target.insert_hw_breakpoint(&mut info)
        } else {
            self.target.insert_sw_breakpoint(&mut info)
        };

        match result {
            Ok(()) => {
                if let Some(loc) = self.arena.get_mut(lid) {
                    loc.target_info = info;
                    loc.inserted = true;
                }
                debug!(
                    "Inserted {} breakpoint {} at 0x{:x}",
                    if hardware { "hardware" } else { "software" },
                    number,
                    address
                );
                false
            }
            Err(e) if !hardware && self.location_in_library(lid) => {
                debug!("Insert into shared library failed: {}", e);
                if let Some(loc) = self.arena.get_mut(lid) {
                    loc.shlib_disabled = true;
                }
                if let Some(owner) = self.owner_of(lid).map(|b| b.id) {
                    self.notify(owner, Notify::Modified);
                }
                if !state.disabled_breaks {
                    self.warn(format!(
                        "Cannot insert breakpoint {}.\nTemporarily disabling shared library breakpoints:",
                        number
                    ));
                }
                state.disabled_breaks = true;
                self.warn(format!("breakpoint #{}", number));
                false
            }
            Err(e) if hardware => {
                report.hw_error = true;
                match e {
                    TargetError::HwResources { .. } => report.push(
                        number,
                        Some(address),
                        format!("Cannot insert hardware breakpoint {}.", number),
                    ),
                    other => {
                        report.hw_explained = true;
                        report.push(
                            number,
                            Some(address),
                            format!("Cannot insert hardware breakpoint {}:\n{}", number, other),
                        );
                    }
                }
                true
            }
            Err(e) => {
                let message = match e {
                    TargetError::MemoryAccess { address } => format!(
                        "Cannot insert breakpoint {}.\nCannot access memory at address 0x{:x}",
                        number, address
                    ),
                    other => format!("Cannot insert breakpoint {}.\n{}", number, other),
                };
                report.push(number, Some(address), message);
                true
            }
        }
    }

    fn watch_condition_bytecode(&self, lid: LocationId) -> Option<Bytecode> {
        self.owner_of(lid)
            .and_then(|b| b.watch())
            .and_then(|w| w.cond_expr.as_ref())
            .and_then(compile_for_target)
    }

    fn insert_watch_raw(
        &mut self,
        address: u64,
        len: usize,
        kind: WatchKind,
        mask: Option<u64>,
        cond: Option<&Bytecode>,
    ) -> std::result::Result<(), TargetError> {
        match mask {
            Some(mask) => self.target.insert_masked_watchpoint(address, mask, kind),
            None => self.target.insert_watchpoint(address, len, kind, cond),
        }
    }

    fn insert_watch_location(&mut self, lid: LocationId) {
        let Some(loc) = self.arena.get(lid) else {
            return;
        };
        let (address, len, mask, number) = (loc.address, loc.length, loc.mask, loc.owner_number);
        let kind = loc.watch_kind.unwrap_or(WatchKind::Write);
        let cond = self.watch_condition_bytecode(lid);

        let mut result = self.insert_watch_raw(address, len, kind, mask, cond.as_ref());

        // 読み取りウォッチポイントに対応していなければアクセスウォッチポイントで代用する
        if matches!(result, Err(TargetError::Unsupported(_))) && kind == WatchKind::Read {
            let shared = self.registry.global.iter().copied().find(|other| {
                *other != lid
                    && self.arena.get(*other).and_then(|o| o.watch_kind) == Some(WatchKind::Access)
                    && self.locations_match(lid, *other)
            });
            if let Some(other) = shared {
                let info = self.arena.get(other).map(|o| o.target_info.clone());
                if let Some(loc) = self.arena.get_mut(lid) {
                    loc.duplicate = true;
                    loc.inserted = true;
                    loc.watch_kind = Some(WatchKind::Access);
                    if let Some(info) = info {
                        loc.target_info = info;
                    }
                }
                return;
            }
            result = self.insert_watch_raw(address, len, WatchKind::Access, mask, cond.as_ref());
            if result.is_ok() {
                if let Some(loc) = self.arena.get_mut(lid) {
                    loc.watch_kind = Some(WatchKind::Access);
                }
            }
        }

        match &result {
            Ok(()) => debug!(
                "Inserted hardware watchpoint {} at 0x{:x} ({} bytes)",
                number, address, len
            ),
            Err(e) => debug!("Hardware watchpoint {} at 0x{:x}: {}", number, address, e),
        }
        if let Some(loc) = self.arena.get_mut(lid) {
            loc.inserted = result.is_ok();
        }
    }

    fn insert_catch_location(&mut self, lid: LocationId) {
        let Some(kind) = self.arena.get(lid).and_then(|l| l.catch.clone()) else {
            return;
        };
        match self.target.insert_catchpoint(&kind) {
            Ok(()) => {
                if let Some(loc) = self.arena.get_mut(lid) {
                    loc.inserted = true;
                }
            }
            Err(e) => {
                let owner = self.owner_of(lid).map(|b| b.id);
                if let Some(id) = owner {
                    if let Some(bp) = self.bp_mut(id) {
                        bp.enable_state = EnableState::Disabled;
                    }
                    self.warn(format!("Error inserting catchpoint {}: {}", id, e));
                    self.notify(id, Notify::Modified);
                }
            }
        }
    }

    /// 1つのロケーションをターゲットから削除する
    pub(crate) fn remove_location(&mut self, lid: LocationId) -> std::result::Result<(), TargetError> {
        let Some(loc) = self.arena.get(lid) else {
            return Ok(());
        };
        let (kind, number, address) = (loc.kind, loc.owner_number, loc.address);

        match kind {
            LocKind::SwBreakpoint | LocKind::HwBreakpoint => {
                if loc.permanent {
                    if let Some(loc) = self.arena.get_mut(lid) {
                        loc.inserted = false;
                    }
                    return Ok(());
                }
                let mut info = loc.target_info.clone();
                let shlib = loc.shlib_disabled;
                let result = if kind == LocKind::HwBreakpoint {
                    self.target.remove_hw_breakpoint(&mut info)
                } else {
                    self.target.remove_sw_breakpoint(&mut info)
                };
                match result {
                    Ok(()) => {
                        if let Some(loc) = self.arena.get_mut(lid) {
                            loc.target_info = info;
                            loc.inserted = false;
                        }
                        debug!("Removed breakpoint {} at 0x{:x}", number, address);
                        Ok(())
                    }
                    // アンロード済みのライブラリにあったトラップは消えたものとみなす
                    Err(e)
                        if kind == LocKind::SwBreakpoint
                            && (shlib || self.location_in_library(lid)) =>
                    {
                        debug!("Ignoring removal failure in shared library: {}", e);
                        if let Some(loc) = self.arena.get_mut(lid) {
                            loc.inserted = false;
                        }
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
            LocKind::HwWatchpoint => {
                let (len, mask) = (loc.length, loc.mask);
                let watch_kind = loc.watch_kind.unwrap_or(WatchKind::Write);
                let cond = self.watch_condition_bytecode(lid);
                if let Some(loc) = self.arena.get_mut(lid) {
                    loc.inserted = false;
                }
                let result = match mask {
                    Some(mask) => self.target.remove_masked_watchpoint(address, mask, watch_kind),
                    None => self
                        .target
                        .remove_watchpoint(address, len, watch_kind, cond.as_ref()),
                };
                if result.is_err() {
                    self.warn(format!("Could not remove hardware watchpoint {}.", number));
                }
                result
            }
            LocKind::Other => {
                let catch = loc.catch.clone();
                if let Some(loc) = self.arena.get_mut(lid) {
                    loc.inserted = false;
                }
                match catch {
                    Some(kind) => self.target.remove_catchpoint(&kind),
                    None => Ok(()),
                }
            }
            LocKind::SwWatchpoint | LocKind::Tracepoint => {
                if let Some(loc) = self.arena.get_mut(lid) {
                    loc.inserted = false;
                }
                Ok(())
            }
        }
    }

    /// 同じアドレスのコードブレークポイントの条件を集めてターゲット用の条件リストを作る
    ///
    /// どれか1つでもターゲット用にコンパイルできなければ、そのアドレスの条件は全て
    /// デバッガ側で評価します。
    pub(crate) fn build_target_condition_list(&mut self, lid: LocationId) {
        let Some(loc) = self.arena.get_mut(lid) else {
            return;
        };
        loc.target_info.conditions.clear();
        let (address, pspace) = (loc.address, loc.pspace);
        if !self.target_side_conditions_active() {
            return;
        }

        let group: Vec<LocationId> = self
            .registry
            .duplicates_at(&self.arena, address, pspace)
            .into_iter()
            .filter(|l| {
                self.arena
                    .get(*l)
                    .map(|x| x.owner.is_some() && x.owner_kind.is_breakpoint())
                    .unwrap_or(false)
            })
            .collect();

        // 条件のない有効なロケーションが1つでもあれば、ターゲットは無条件に停止する必要がある
        let mut all_compiled = true;
        for member in &group {
            let active = self.owner_of(*member).map(|b| b.is_enabled()).unwrap_or(false);
            let Some(loc) = self.arena.get_mut(*member) else {
                continue;
            };
            if !active || !loc.is_usable() {
                continue;
            }
            match &loc.cond {
                Some(cond) => {
                    if loc.cond_bytecode.is_none() {
                        loc.cond_bytecode = compile_for_target(cond);
                    }
                    if loc.cond_bytecode.is_none() {
                        all_compiled = false;
                    }
                }
                None => all_compiled = false,
            }
        }

        if !all_compiled {
            debug!(
                "Condition at 0x{:x} cannot be evaluated by the target, evaluating on host",
                address
            );
            for member in &group {
                if let Some(loc) = self.arena.get_mut(*member) {
                    loc.cond_bytecode = None;
                }
            }
            return;
        }

        let conditions: Vec<Bytecode> = group
            .iter()
            .filter(|m| {
                self.owner_of(**m).map(|b| b.is_enabled()).unwrap_or(false)
                    && self.arena.get(**m).map(|l| l.is_usable()).unwrap_or(false)
            })
            .filter_map(|m| self.arena.get(*m).and_then(|l| l.cond_bytecode.clone()))
            .collect();
        if let Some(loc) = self.arena.get_mut(lid) {
            loc.target_info.conditions = conditions;
        }
    }

    fn compile_dprintf(&self, lid: LocationId) -> Option<Bytecode> {
        let loc = self.arena.get(lid)?;
        let data = self.owner_of(lid)?.dprintf()?;
        let args: Vec<Expression> = data
            .args
            .iter()
            .map(|a| parse_expression(a, &*self.symbols, Some(loc.address)).ok())
            .collect::<Option<_>>()?;
        Bytecode::printf(&data.format, &args)
    }

    /// dprintf をターゲット側で実行させるためのコマンドリストを作る
    ///
    /// 同じアドレスのブレークポイントが全て dprintf の場合だけ送ります。
    pub(crate) fn build_target_command_list(&mut self, lid: LocationId) {
        let Some(loc) = self.arena.get_mut(lid) else {
            return;
        };
        loc.target_info.commands.clear();
        loc.target_info.persist = false;
        let (address, pspace) = (loc.address, loc.pspace);
        if !self.target.supports_target_side_commands()
            || self.settings.dprintf_style != DprintfStyle::Agent
        {
            return;
        }

        let group: Vec<LocationId> = self
            .registry
            .duplicates_at(&self.arena, address, pspace)
            .into_iter()
            .filter(|l| {
                self.arena
                    .get(*l)
                    .map(|x| x.owner.is_some() && x.owner_kind.is_breakpoint())
                    .unwrap_or(false)
            })
            .collect();
        if group
            .iter()
            .any(|l| self.arena.get(*l).map(|x| x.owner_kind) != Some(BreakpointKind::Dprintf))
        {
            return;
        }

        let compiled: Vec<(LocationId, Option<Bytecode>)> =
            group.iter().map(|l| (*l, self.compile_dprintf(*l))).collect();
        let all_compiled = compiled.iter().all(|(_, c)| c.is_some());
        for (member, code) in compiled {
            if let Some(loc) = self.arena.get_mut(member) {
                loc.cmd_bytecode = if all_compiled { code } else { None };
            }
        }
        if !all_compiled {
            return;
        }

        let commands: Vec<Bytecode> = group
            .iter()
            .filter(|m| {
                self.owner_of(**m).map(|b| b.is_enabled()).unwrap_or(false)
                    && self.arena.get(**m).map(|l| l.is_usable()).unwrap_or(false)
            })
            .filter_map(|m| self.arena.get(*m).and_then(|l| l.cmd_bytecode.clone()))
            .collect();
        if let Some(loc) = self.arena.get_mut(lid) {
            loc.target_info.commands = commands;
            loc.target_info.persist = true;
        }
    }
}
