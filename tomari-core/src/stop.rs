//! 停止イベントの判定
//!
//! ターゲットが停止を報告したら、停止を説明しうるロケーションのチェーンを作り、
//! ノードごとにフレーム・スレッド制限、ウォッチポイントの値、条件式、無視回数を
//! 評価します。最後に各ノードの結果を優先度の表でまとめて、次の動作を1つに決めます。

use crate::breakpoint::{BreakpointId, Disposition, EnableState, Restriction, WatchTriggered};
use crate::debugger::{Debugger, Notify};
use crate::insert::InsertMode;
use crate::kind::{BreakpointKind, MainAction};
use crate::location::{location_address_match, LocationId};
use crate::memory::ShadowView;
use crate::pspace::{AddressSpaceId, ProgramSpaceId};
use crate::watchpoint::{mention, WatchCheck};
use regex::Regex;
use tomari_expr::{evaluate, format_printf, parse_expression, Value};
use tomari_target::process::SIGTRAP;
use tomari_target::{CatchKind, FrameId, StopReason, Target, TargetEvent, ThreadInfo, WatchKind};
use tracing::debug;

const SIGINT: i32 = 2;

/// 停止を説明する1つのノード
#[derive(Debug, Clone)]
pub struct StopNode {
    pub location: LocationId,
    /// moribund ロケーションなら `None`
    pub breakpoint: Option<BreakpointId>,
    pub kind: BreakpointKind,
    pub stop: bool,
    pub print: bool,
    /// ウォッチポイントの値が変わった
    pub changed: bool,
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
    /// スコープを抜けて削除予定になった（通知は済んでいる）
    pub out_of_scope: bool,
    pub condition_error: Option<String>,
}

impl StopNode {
    fn new(location: LocationId, breakpoint: Option<BreakpointId>, kind: BreakpointKind) -> Self {
        Self {
            location,
            breakpoint,
            kind,
            stop: true,
            print: true,
            changed: false,
            old_value: None,
            new_value: None,
            out_of_scope: false,
            condition_error: None,
        }
    }

    fn reject(&mut self) {
        self.stop = false;
        self.print = false;
    }
}

/// 1回の停止イベントのチェーン
#[derive(Debug, Clone)]
pub struct StopRecord {
    pub address: u64,
    pub reason: StopReason,
    pub nodes: Vec<StopNode>,
}

impl StopRecord {
    /// 停止を引き起こしたノードがあるか
    pub fn causes_stop(&self) -> bool {
        self.nodes.iter().any(|n| n.stop)
    }

    /// シグナル `sig` をこのチェーンで説明できるか
    ///
    /// moribund ロケーションとウォッチポイントはトラップしか説明しません。
    /// シグナルのキャッチポイントは捕まえたシグナルだけを説明します。
    pub fn explains_signal(&self, sig: i32) -> bool {
        self.nodes.iter().any(|node| match (node.breakpoint, node.kind) {
            (None, _) => sig == SIGTRAP,
            (Some(_), kind) if kind.is_watchpoint() => sig == SIGTRAP,
            (Some(_), BreakpointKind::Catchpoint) => match self.reason {
                StopReason::Signal(s) => s == sig,
                _ => true,
            },
            _ => true,
        })
    }
}

/// 停止判定の結果
#[derive(Debug, Clone)]
pub struct Verdict {
    pub action: MainAction,
    pub stop: bool,
    pub print: bool,
    pub record: StopRecord,
    /// 停止の報告
    pub report: Vec<String>,
}

fn pattern_matches(pattern: &Option<String>, name: &str) -> bool {
    match pattern {
        None => true,
        Some(p) => Regex::new(p).map(|re| re.is_match(name)).unwrap_or(false),
    }
}

/// キャッチポイントが停止理由のイベントを捕まえるか
pub fn catch_matches(kind: &CatchKind, reason: &StopReason) -> bool {
    match (kind, reason) {
        (CatchKind::Fork, StopReason::Event(TargetEvent::Fork { .. })) => true,
        (CatchKind::Vfork, StopReason::Event(TargetEvent::Vfork { .. })) => true,
        (CatchKind::Exec, StopReason::Event(TargetEvent::Exec { .. })) => true,
        (
            CatchKind::Syscall(nums),
            StopReason::Event(TargetEvent::SyscallEntry(n) | TargetEvent::SyscallReturn(n)),
        ) => nums.is_empty() || nums.contains(n),
        (CatchKind::Signal(sigs), StopReason::Signal(sig)) => {
            if sigs.is_empty() {
                // デバッガ自身が使うシグナルは除く
                *sig != SIGTRAP && *sig != SIGINT
            } else {
                sigs.contains(sig)
            }
        }
        (CatchKind::Load(pattern), StopReason::Event(TargetEvent::LibraryLoaded(name))) => {
            pattern_matches(pattern, name)
        }
        (CatchKind::Unload(pattern), StopReason::Event(TargetEvent::LibraryUnloaded(name))) => {
            pattern_matches(pattern, name)
        }
        _ => false,
    }
}

fn describe_catch(number: i32, reason: &StopReason) -> Vec<String> {
    let detail = match reason {
        StopReason::Event(TargetEvent::Fork { child }) => format!("forked process {}", child),
        StopReason::Event(TargetEvent::Vfork { child }) => format!("vforked process {}", child),
        StopReason::Event(TargetEvent::Exec { path }) => format!("exec'd {}", path),
        StopReason::Event(TargetEvent::SyscallEntry(n)) => format!("call to syscall {}", n),
        StopReason::Event(TargetEvent::SyscallReturn(n)) => format!("returned from syscall {}", n),
        StopReason::Signal(sig) => format!("signal {}", sig),
        StopReason::Event(TargetEvent::LibraryLoaded(name)) => {
            return vec![
                format!("Catchpoint {}", number),
                format!("  Inferior loaded {}", name),
            ]
        }
        StopReason::Event(TargetEvent::LibraryUnloaded(name)) => {
            return vec![
                format!("Catchpoint {}", number),
                format!("  Inferior unloaded {}", name),
            ]
        }
        _ => return vec![format!("Catchpoint {}", number)],
    };
    vec![format!("Catchpoint {} ({})", number, detail)]
}

fn value_text(value: &Option<Value>) -> String {
    match value {
        Some(v) => v.to_string(),
        None => "<unreadable>".to_string(),
    }
}

impl<T: Target> Debugger<T> {
    /// ターゲットの停止を処理して次の動作を決める
    pub fn on_target_stop(
        &mut self,
        address: u64,
        pspace: ProgramSpaceId,
        reason: StopReason,
    ) -> Verdict {
        self.threads_executing = false;
        let aspace = self.aspace_of(pspace);

        self.watchpoints_triggered(&reason);
        let mut record = self.build_candidates(aspace, address, reason);
        self.retire_moribund_locations();
        self.evaluate_chain(&mut record);

        let action = self.verdict(&record);
        let stop = record.causes_stop();
        let print = record.nodes.iter().any(|n| n.stop && n.print);
        let report = if stop {
            self.describe_stop(&record)
        } else {
            Vec::new()
        };
        debug!(
            "Stop at 0x{:x}: {} node(s), action {:?}",
            address,
            record.nodes.len(),
            action
        );

        if matches!(
            action,
            MainAction::StopSilent | MainAction::StopNoisy | MainAction::PopCallDummy
        ) {
            self.breakpoint_auto_delete(&record);
        }

        Verdict {
            action,
            stop,
            print,
            record,
            report,
        }
    }

    /// 停止を説明しうるロケーションのチェーンを作る
    pub fn build_candidates(
        &mut self,
        aspace: AddressSpaceId,
        address: u64,
        reason: StopReason,
    ) -> StopRecord {
        let global = self.target.has_global_breakpoints();
        let trap = reason.signal() == Some(SIGTRAP);

        // スコープブレークポイントに当たったらウォッチポイントのスコープ脱出を確認させる
        let scope_hits: Vec<BreakpointId> = self
            .breakpoints
            .iter()
            .filter(|b| b.kind == BreakpointKind::WatchpointScope && b.is_enabled() && trap)
            .filter(|b| {
                b.locations.iter().filter_map(|l| self.arena.get(*l)).any(|loc| {
                    loc.is_usable() && location_address_match(loc, aspace, address, global)
                })
            })
            .filter_map(|b| b.related)
            .collect();
        for id in scope_hits {
            if let Some(w) = self.bp_mut(id).and_then(|b| b.watch_mut()) {
                w.triggered = WatchTriggered::Yes;
            }
        }

        let mut nodes = Vec::new();
        for bp in &self.breakpoints {
            if !bp.is_enabled() {
                continue;
            }
            if bp.kind.is_watchpoint() && bp.disposition == Disposition::DeleteAtNextStop {
                continue;
            }
            // ハードウェアウォッチポイントは式全体で判定するので最初のロケーションだけ見る
            let locations = if bp.kind.is_hardware_watchpoint() {
                &bp.locations[..bp.locations.len().min(1)]
            } else {
                &bp.locations[..]
            };
            for lid in locations {
                let Some(loc) = self.arena.get(*lid) else {
                    continue;
                };
                if !loc.is_usable() {
                    continue;
                }
                let hit = match bp.kind {
                    kind if kind.is_tracepoint() => false,
                    BreakpointKind::Catchpoint => bp
                        .catch_kind()
                        .map(|c| catch_matches(c, &reason))
                        .unwrap_or(false),
                    BreakpointKind::Watchpoint => true,
                    kind if kind.is_hardware_watchpoint() => bp
                        .watch()
                        .map(|w| w.triggered != WatchTriggered::No)
                        .unwrap_or(false),
                    _ => trap && location_address_match(loc, aspace, address, global),
                };
                if hit {
                    nodes.push(StopNode::new(*lid, Some(bp.id), bp.kind));
                }
            }
        }

        // 停止理由を区別できないターゲットでは、削除済みのトラップが遅れて届くことがある
        if !self.target.supports_stopped_by_sw_breakpoint()
            || !self.target.supports_stopped_by_hw_breakpoint()
        {
            for lid in &self.registry.moribund {
                let Some(loc) = self.arena.get(*lid) else {
                    continue;
                };
                if location_address_match(loc, aspace, address, global) && self.needs_moribund(*lid)
                {
                    let mut node = StopNode::new(*lid, None, loc.owner_kind);
                    node.reject();
                    nodes.push(node);
                }
            }
        }

        StopRecord {
            address,
            reason,
            nodes,
        }
    }

    /// moribund ロケーションの寿命を1つ減らし、尽きたものを解放する
    pub(crate) fn retire_moribund_locations(&mut self) {
        let mut retired = Vec::new();
        for lid in &self.registry.moribund {
            if let Some(loc) = self.arena.get_mut(*lid) {
                loc.events_till_retirement = loc.events_till_retirement.saturating_sub(1);
                if loc.events_till_retirement == 0 {
                    retired.push(*lid);
                }
            }
        }
        if retired.is_empty() {
            return;
        }
        self.registry.moribund.retain(|l| !retired.contains(l));
        for lid in retired {
            debug!("Retired moribund location {}", lid);
            self.arena.remove(lid);
        }
    }

    /// チェーンの各ノードを評価する
    pub fn evaluate_chain(&mut self, record: &mut StopRecord) {
        let thread = self.target.current_thread();
        let frame = self.target.selected_frame().map(|f| f.id);

        let mut removed_any = false;
        for node in record.nodes.iter_mut() {
            if node.breakpoint.is_none() {
                continue;
            }
            removed_any |= self.evaluate_node(node, thread, frame);
        }

        // 停止しないならポインタの先が変わっているかもしれないので監視領域を作り直す
        if !record.causes_stop() {
            let ids: Vec<BreakpointId> = record
                .nodes
                .iter()
                .filter_map(|n| n.breakpoint)
                .filter(|id| {
                    self.bp(*id)
                        .map(|b| b.kind.is_hardware_watchpoint())
                        .unwrap_or(false)
                })
                .collect();
            if !ids.is_empty() {
                self.refresh_hardware_watchpoints(&ids);
                self.update_global_location_list(InsertMode::MayInsert);
                return;
            }
        }
        if removed_any {
            self.update_global_location_list(InsertMode::DontInsert);
        }
    }

    /// 1つのノードを評価する。ブレークポイントを無効にしたかを返す
    fn evaluate_node(
        &mut self,
        node: &mut StopNode,
        thread: ThreadInfo,
        frame: Option<FrameId>,
    ) -> bool {
        let Some(id) = node.breakpoint else {
            return false;
        };
        let Some((bp_frame, restriction, kind)) =
            self.bp(id).map(|b| (b.frame, b.restriction, b.kind))
        else {
            node.reject();
            return false;
        };

        if let Some(f) = bp_frame {
            if Some(f) != frame {
                node.reject();
                return false;
            }
        }

        let in_scope = match restriction {
            Restriction::Any => true,
            Restriction::Thread(t) => t == thread.tid,
            Restriction::Task(t) => thread.task == Some(t),
            Restriction::Inferior(i) => i == thread.inferior,
        };
        if !in_scope {
            node.reject();
            return false;
        }

        if kind.is_watchpoint() {
            self.check_watchpoint_node(node, id, kind);
            if !node.stop {
                return false;
            }
        }

        let disposition = self.bp(id).map(|b| b.disposition);
        if disposition != Some(Disposition::DeleteAtNextStop) && !self.condition_says_stop(node, id)
        {
            node.reject();
            return false;
        }

        let Some(bp) = self.bp_mut(id) else {
            return false;
        };
        if bp.ignore_count > 0 {
            bp.ignore_count -= 1;
            bp.hit_count += 1;
            node.reject();
            self.notify(id, Notify::Modified);
            return false;
        }

        bp.hit_count += 1;
        let mut removed = false;
        if bp.disposition == Disposition::Disable {
            bp.enable_count = bp.enable_count.saturating_sub(1);
            if bp.enable_count == 0 {
                bp.enable_state = EnableState::Disabled;
                removed = true;
            }
        }
        if bp.silent {
            node.print = false;
        }
        self.notify(id, Notify::Modified);

        if kind == BreakpointKind::Dprintf {
            self.dprintf_after_hit(node.location, id);
            node.stop = false;
        }
        removed
    }

    /// ウォッチポイントのノードを判定する
    fn check_watchpoint_node(&mut self, node: &mut StopNode, id: BreakpointId, kind: BreakpointKind) {
        let triggered = self
            .bp(id)
            .and_then(|b| b.watch())
            .map(|w| w.triggered)
            .unwrap_or(WatchTriggered::No);
        let must_check = kind == BreakpointKind::Watchpoint
            || triggered == WatchTriggered::Yes
            || (triggered == WatchTriggered::Unknown && kind == BreakpointKind::HwWatchpoint);
        if !must_check {
            // 別のウォッチポイントが発火した
            node.reject();
            return;
        }

        match self.watchpoint_check(id) {
            WatchCheck::Deleted => {
                node.out_of_scope = true;
            }
            WatchCheck::Ignore => node.reject(),
            WatchCheck::ValueChanged { old, new } => {
                node.changed = true;
                node.old_value = old;
                node.new_value = new;
                if kind == BreakpointKind::ReadWatchpoint && self.read_trap_was_write(node.location) {
                    node.reject();
                }
            }
            WatchCheck::NotChanged => {
                if matches!(kind, BreakpointKind::HwWatchpoint | BreakpointKind::Watchpoint) {
                    node.reject();
                } else {
                    node.new_value = self.bp(id).and_then(|b| b.watch()).and_then(|w| w.value.clone());
                }
            }
        }
    }

    /// 値が変わった読み取りウォッチポイントの発火が書き込みによるものか
    ///
    /// 同じメモリを書き込みで監視しているウォッチポイントが発火しているか、
    /// 読み取りをアクセスウォッチポイントで代用している場合は書き込みとみなします。
    fn read_trap_was_write(&self, lid: LocationId) -> bool {
        let watch_kind = self.arena.get(lid).and_then(|l| l.watch_kind);
        if watch_kind == Some(WatchKind::Access) {
            return true;
        }
        watch_kind == Some(WatchKind::Read)
            && self.breakpoints.iter().any(|b| {
                matches!(
                    b.kind,
                    BreakpointKind::HwWatchpoint | BreakpointKind::AccessWatchpoint
                ) && b.watch().map(|w| w.triggered) == Some(WatchTriggered::Yes)
            })
    }

    /// ターゲットがこのロケーションの条件式だけを評価して停止したか
    fn condition_proven_by_target(&self, lid: LocationId) -> bool {
        if !self.target_side_conditions_active() {
            return false;
        }
        let Some(loc) = self.arena.get(lid) else {
            return false;
        };
        let Some(code) = &loc.cond_bytecode else {
            return false;
        };
        self.registry
            .duplicates_at(&self.arena, loc.address, loc.pspace)
            .into_iter()
            .filter_map(|l| self.arena.get(l))
            .find(|l| l.inserted && !l.duplicate && l.is_code())
            .map(|primary| primary.target_info.conditions.as_slice() == std::slice::from_ref(code))
            .unwrap_or(false)
    }

    /// 条件式を評価する。評価できなければ停止する
    fn condition_says_stop(&mut self, node: &mut StopNode, id: BreakpointId) -> bool {
        let cond = match self.bp(id) {
            Some(bp) if bp.kind.is_watchpoint() => bp.watch().and_then(|w| w.cond_expr.clone()),
            Some(_) => self.arena.get(node.location).and_then(|l| l.cond.clone()),
            None => None,
        };
        let Some(cond) = cond else {
            return true;
        };
        if !node.kind.is_watchpoint() && self.condition_proven_by_target(node.location) {
            return true;
        }

        match evaluate(&cond, &ShadowView::new(self)).and_then(|v| v.is_true()) {
            Ok(result) => result,
            Err(e) => {
                self.warn(format!(
                    "Error in testing breakpoint condition {}:\n{}",
                    id, e
                ));
                node.condition_error = Some(e.to_string());
                true
            }
        }
    }

    /// dprintf の出力をデバッガ側で整形する
    ///
    /// コマンドをターゲットに送ってあればターゲットが出力済みです。
    fn dprintf_after_hit(&mut self, lid: LocationId, id: BreakpointId) {
        let Some(loc) = self.arena.get(lid) else {
            return;
        };
        let (address, pspace) = (loc.address, loc.pspace);
        let downloaded = self
            .registry
            .duplicates_at(&self.arena, address, pspace)
            .into_iter()
            .filter_map(|l| self.arena.get(l))
            .any(|l| l.inserted && !l.target_info.commands.is_empty());
        if downloaded {
            return;
        }
        let Some(data) = self.bp(id).and_then(|b| b.dprintf()).cloned() else {
            return;
        };

        let mut args = Vec::with_capacity(data.args.len());
        for text in &data.args {
            let value = parse_expression(text, &*self.symbols, Some(address))
                .map_err(|e| e.to_string())
                .and_then(|expr| {
                    evaluate(&expr, &ShadowView::new(self))
                        .and_then(|v| v.as_u64())
                        .map_err(|e| e.to_string())
                });
            match value {
                Ok(v) => args.push(v),
                Err(e) => {
                    self.warn(format!("dprintf {}: {}", id, e));
                    return;
                }
            }
        }
        self.message(format_printf(&data.format, &args));
    }

    /// 各ノードの動作をまとめる（優先度の最も高いもの）
    pub fn verdict(&self, record: &StopRecord) -> MainAction {
        record
            .nodes
            .iter()
            .filter(|n| n.breakpoint.is_some())
            .map(|n| match n.kind {
                BreakpointKind::ShlibEvent if self.settings.stop_on_solib_events => {
                    MainAction::StopNoisy
                }
                BreakpointKind::ShlibEvent => MainAction::Single,
                kind => kind.action(n.stop, n.print),
            })
            .max()
            .unwrap_or(MainAction::KeepChecking)
    }

    /// 停止の報告を作る
    pub fn describe_stop(&self, record: &StopRecord) -> Vec<String> {
        let mut lines = Vec::new();
        for node in record.nodes.iter().filter(|n| n.stop && n.print && !n.out_of_scope) {
            let Some(bp) = node.breakpoint.and_then(|id| self.bp(id)) else {
                continue;
            };
            match bp.kind {
                kind if kind.is_watchpoint() => {
                    let Some(w) = bp.watch() else {
                        continue;
                    };
                    lines.push(format!(
                        "{} {}: {}",
                        mention(kind, w.mask.is_some()),
                        bp.id,
                        w.expr_text
                    ));
                    lines.push(String::new());
                    if w.mask.is_some() {
                        lines.push(
                            "Check the underlying instruction at PC for the memory address and value which triggered this watchpoint."
                                .to_string(),
                        );
                    } else if kind == BreakpointKind::ReadWatchpoint
                        || (kind == BreakpointKind::AccessWatchpoint && !node.changed)
                    {
                        lines.push(format!("Value = {}", value_text(&node.new_value)));
                    } else {
                        lines.push(format!("Old value = {}", value_text(&node.old_value)));
                        lines.push(format!("New value = {}", value_text(&node.new_value)));
                    }
                }
                BreakpointKind::Catchpoint => {
                    lines.extend(describe_catch(bp.number(), &record.reason));
                }
                _ if !bp.id.is_user() => {}
                _ => {
                    let head = if bp.disposition == Disposition::Delete {
                        "Temporary breakpoint"
                    } else {
                        "Breakpoint"
                    };
                    let loc = self.arena.get(node.location);
                    let addr = loc.map(|l| l.address).unwrap_or(record.address);
                    match loc.and_then(|l| l.function.as_deref()) {
                        Some(func) => lines.push(format!("{} {}, 0x{:x} in {} ()", head, bp.id, addr, func)),
                        None => lines.push(format!("{} {}, 0x{:x}", head, bp.id, addr)),
                    }
                }
            }
        }
        lines
    }

    /// 報告した停止の後に削除すべきブレークポイントを削除する
    pub fn breakpoint_auto_delete(&mut self, record: &StopRecord) {
        let mut doomed: Vec<BreakpointId> = record
            .nodes
            .iter()
            .filter(|n| n.stop)
            .filter_map(|n| n.breakpoint)
            .filter(|id| self.bp(*id).map(|b| b.disposition) == Some(Disposition::Delete))
            .collect();
        doomed.extend(
            self.breakpoints
                .iter()
                .filter(|b| b.disposition == Disposition::DeleteAtNextStop)
                .map(|b| b.id),
        );

        for id in doomed {
            if self.bp(id).is_none() {
                continue;
            }
            if let Err(e) = self.delete_breakpoint(id) {
                debug!("Failed to auto-delete breakpoint {}: {}", id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breakpoint::{BreakpointRequest, WatchRequest};
    use tomari_expr::{Scope, Symbol, SymbolTable};
    use tomari_target::{SimCapabilities, SimTarget};

    const COUNTER: u64 = 0x601000;
    const PSPACE: ProgramSpaceId = ProgramSpaceId::INITIAL;

    fn debugger(caps: SimCapabilities) -> Debugger<SimTarget> {
        let mut target = SimTarget::with_caps(caps);
        target.map(0x401000, &[0x90; 0x2000]);
        target.map(0x601000, &[0; 0x100]);
        target.map(0x7ff000, &[0; 0x100]);

        let mut symbols = SymbolTable::new();
        symbols.add(Symbol::global("counter", COUNTER, 4));
        symbols.add(Symbol::local("local", -8, 4, Scope::new(0x401000, 0x401100)));

        let mut dbg = Debugger::new(target);
        dbg.set_symbols(Box::new(symbols));
        dbg.set_setting("always-inserted", "on").unwrap();
        dbg
    }

    fn breakpoint_at(dbg: &mut Debugger<SimTarget>, req: BreakpointRequest) -> BreakpointId {
        dbg.create_breakpoint(req).unwrap()
    }

    fn hit(dbg: &mut Debugger<SimTarget>, addr: u64) -> Verdict {
        dbg.on_target_stop(addr, PSPACE, StopReason::Breakpoint)
    }

    #[test]
    fn test_plain_breakpoint_stops() {
        let mut dbg = debugger(SimCapabilities::default());
        let id = breakpoint_at(&mut dbg, BreakpointRequest::new(BreakpointKind::Breakpoint).at(0x401000));

        let verdict = hit(&mut dbg, 0x401000);
        assert_eq!(verdict.action, MainAction::StopNoisy);
        assert!(verdict.stop && verdict.print);
        assert_eq!(verdict.report, vec!["Breakpoint 1, 0x401000".to_string()]);
        assert_eq!(dbg.breakpoint(id).unwrap().hit_count, 1);

        let miss = hit(&mut dbg, 0x401004);
        assert!(miss.record.nodes.is_empty());
        assert_eq!(miss.action, MainAction::KeepChecking);
    }

    #[test]
    fn test_ignore_count() {
        let mut dbg = debugger(SimCapabilities::default());
        let id = breakpoint_at(
            &mut dbg,
            BreakpointRequest::new(BreakpointKind::Breakpoint)
                .at(0x401000)
                .ignore_count(2),
        );

        let stops: Vec<bool> = (0..3).map(|_| hit(&mut dbg, 0x401000).stop).collect();
        assert_eq!(stops, vec![false, false, true]);
        let bp = dbg.breakpoint(id).unwrap();
        assert_eq!(bp.hit_count, 3);
        assert_eq!(bp.ignore_count, 0);
    }

    #[test]
    fn test_ignored_hit_single_steps() {
        let mut dbg = debugger(SimCapabilities::default());
        breakpoint_at(
            &mut dbg,
            BreakpointRequest::new(BreakpointKind::Breakpoint)
                .at(0x401000)
                .ignore_count(1),
        );
        assert_eq!(hit(&mut dbg, 0x401000).action, MainAction::Single);
    }

    #[test]
    fn test_condition() {
        let mut dbg = debugger(SimCapabilities::default());
        let id = breakpoint_at(
            &mut dbg,
            BreakpointRequest::new(BreakpointKind::Breakpoint)
                .at(0x401000)
                .condition("counter == 5"),
        );

        assert!(!hit(&mut dbg, 0x401000).stop);
        assert_eq!(dbg.breakpoint(id).unwrap().hit_count, 0);

        dbg.target_mut().poke(COUNTER, &[5, 0, 0, 0]);
        assert!(hit(&mut dbg, 0x401000).stop);
        assert_eq!(dbg.breakpoint(id).unwrap().hit_count, 1);
    }

    #[test]
    fn test_condition_error_still_stops() {
        let mut dbg = debugger(SimCapabilities::default());
        breakpoint_at(
            &mut dbg,
            BreakpointRequest::new(BreakpointKind::Breakpoint)
                .at(0x401000)
                .condition("{u32} 0x10 == 1"),
        );
        dbg.take_warnings();

        let verdict = hit(&mut dbg, 0x401000);
        assert!(verdict.stop);
        assert!(verdict.record.nodes[0].condition_error.is_some());
        let warnings = dbg.take_warnings();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].starts_with("Error in testing breakpoint condition 1:\n"));
    }

    #[test]
    fn test_thread_restriction() {
        let mut dbg = debugger(SimCapabilities::default());
        breakpoint_at(
            &mut dbg,
            BreakpointRequest::new(BreakpointKind::Breakpoint)
                .at(0x401000)
                .thread(2),
        );

        let verdict = hit(&mut dbg, 0x401000);
        assert!(!verdict.stop);
        assert_eq!(verdict.action, MainAction::Single);

        dbg.target_mut().set_thread(ThreadInfo::new(2, 1));
        assert!(hit(&mut dbg, 0x401000).stop);
    }

    #[test]
    fn test_frame_restriction() {
        let mut dbg = debugger(SimCapabilities::default());
        let outer = dbg.target_mut().push_frame(0x402000, 0x7ff080);
        dbg.target_mut().push_frame(0x401010, 0x7ff040);
        breakpoint_at(
            &mut dbg,
            BreakpointRequest::new(BreakpointKind::Finish)
                .at(0x402000)
                .frame(outer),
        );

        assert!(!hit(&mut dbg, 0x402000).stop);
        dbg.target_mut().pop_frame();
        assert_eq!(hit(&mut dbg, 0x402000).action, MainAction::StopNoisy);
    }

    #[test]
    fn test_enable_once() {
        let mut dbg = debugger(SimCapabilities::default());
        let id = breakpoint_at(&mut dbg, BreakpointRequest::new(BreakpointKind::Breakpoint).at(0x401000));
        dbg.enable_once(id).unwrap();

        assert!(hit(&mut dbg, 0x401000).stop);
        assert_eq!(dbg.breakpoint(id).unwrap().enable_state, EnableState::Disabled);
        assert!(!dbg.target().sw_inserted_at(0x401000));
    }

    #[test]
    fn test_temporary_breakpoint_is_deleted() {
        let mut dbg = debugger(SimCapabilities::default());
        breakpoint_at(
            &mut dbg,
            BreakpointRequest::new(BreakpointKind::Breakpoint)
                .at(0x401000)
                .temporary(),
        );

        let verdict = hit(&mut dbg, 0x401000);
        assert_eq!(verdict.report, vec!["Temporary breakpoint 1, 0x401000".to_string()]);
        assert_eq!(dbg.breakpoints().count(), 0);
        assert!(!dbg.target().sw_inserted_at(0x401000));
    }

    #[test]
    fn test_silent_breakpoint() {
        let mut dbg = debugger(SimCapabilities::default());
        breakpoint_at(
            &mut dbg,
            BreakpointRequest::new(BreakpointKind::Breakpoint)
                .at(0x401000)
                .silent(),
        );
        let verdict = hit(&mut dbg, 0x401000);
        assert_eq!(verdict.action, MainAction::StopSilent);
        assert!(verdict.stop && !verdict.print);
        assert!(verdict.report.is_empty());
    }

    #[test]
    fn test_priority_of_internal_breakpoints() {
        let mut dbg = debugger(SimCapabilities::default());
        dbg.set_internal_breakpoint(BreakpointKind::LongjmpMaster, 0x401000)
            .unwrap();
        dbg.set_momentary_breakpoint(BreakpointKind::StepResume, 0x401000, None, None)
            .unwrap();
        breakpoint_at(&mut dbg, BreakpointRequest::new(BreakpointKind::Breakpoint).at(0x401000));

        let verdict = hit(&mut dbg, 0x401000);
        assert_eq!(verdict.record.nodes.len(), 3);
        assert_eq!(verdict.action, MainAction::StopNoisy);
        assert_eq!(verdict.report, vec!["Breakpoint 1, 0x401000".to_string()]);
    }

    #[test]
    fn test_call_dummy_pops_frame() {
        let mut dbg = debugger(SimCapabilities::default());
        breakpoint_at(&mut dbg, BreakpointRequest::new(BreakpointKind::Breakpoint).at(0x401000));
        dbg.set_momentary_breakpoint(BreakpointKind::CallDummy, 0x401000, None, None)
            .unwrap();

        let verdict = hit(&mut dbg, 0x401000);
        assert_eq!(verdict.action, MainAction::PopCallDummy);
        assert!(verdict.stop);
        // 一時的なブレークポイントは停止後に消える
        assert_eq!(dbg.breakpoints().count(), 1);
    }

    #[test]
    fn test_hardware_watchpoint_reports_change() {
        let mut dbg = debugger(SimCapabilities::default());
        dbg.watch(WatchRequest::new("counter", WatchKind::Write)).unwrap();

        let reason = dbg.target_mut().write_watched(COUNTER, &[7, 0, 0, 0]).unwrap();
        let verdict = dbg.on_target_stop(0x401020, PSPACE, reason);
        assert_eq!(verdict.action, MainAction::StopNoisy);
        assert_eq!(
            verdict.report,
            vec![
                "Hardware watchpoint 1: counter".to_string(),
                String::new(),
                "Old value = 0".to_string(),
                "New value = 7".to_string(),
            ]
        );

        // 同じ値の書き込みでは止まらない
        let reason = dbg.target_mut().write_watched(COUNTER, &[7, 0, 0, 0]).unwrap();
        let verdict = dbg.on_target_stop(0x401024, PSPACE, reason);
        assert!(!verdict.stop);
        assert_eq!(verdict.action, MainAction::KeepChecking);
    }

    #[test]
    fn test_watchpoint_condition() {
        let mut dbg = debugger(SimCapabilities::default());
        let id = dbg
            .watch(WatchRequest::new("counter", WatchKind::Write).condition("counter > 10"))
            .unwrap();

        let reason = dbg.target_mut().write_watched(COUNTER, &[3, 0, 0, 0]).unwrap();
        assert!(!dbg.on_target_stop(0x401020, PSPACE, reason).stop);

        let reason = dbg.target_mut().write_watched(COUNTER, &[11, 0, 0, 0]).unwrap();
        assert!(dbg.on_target_stop(0x401020, PSPACE, reason).stop);
        assert_eq!(dbg.breakpoint(id).unwrap().hit_count, 1);
    }

    #[test]
    fn test_read_watchpoint_reports_value() {
        let mut dbg = debugger(SimCapabilities::default());
        dbg.watch(WatchRequest::new("counter", WatchKind::Read)).unwrap();

        let reason = dbg.target_mut().access(COUNTER, 4, false).unwrap();
        let verdict = dbg.on_target_stop(0x401020, PSPACE, reason);
        assert!(verdict.stop);
        assert_eq!(
            verdict.report,
            vec![
                "Hardware read watchpoint 1: counter".to_string(),
                String::new(),
                "Value = 0".to_string(),
            ]
        );
    }

    #[test]
    fn test_watchpoint_scope_exit() {
        let mut dbg = debugger(SimCapabilities::default());
        dbg.target_mut().push_frame(0x402000, 0x7ff080);
        dbg.target_mut().push_frame(0x401010, 0x7ff040);
        let id = dbg.watch(WatchRequest::new("local", WatchKind::Write)).unwrap();
        dbg.take_messages();

        dbg.target_mut().pop_frame();
        let reason = dbg.target_mut().hit(0x402000).unwrap();
        let verdict = dbg.on_target_stop(0x402000, PSPACE, reason);

        assert!(verdict.stop);
        assert!(verdict.record.nodes.iter().any(|n| n.breakpoint == Some(id) && n.out_of_scope));
        assert!(verdict.report.is_empty());
        assert_eq!(
            dbg.take_messages(),
            vec![format!(
                "\nWatchpoint {} deleted because the program has left the block in\nwhich its expression is valid.",
                id
            )]
        );
        assert_eq!(dbg.breakpoints().count(), 0);
        assert!(dbg.target().watchpoints().is_empty());
        assert!(!dbg.target().sw_inserted_at(0x402000));
    }

    #[test]
    fn test_catch_matching() {
        assert!(catch_matches(
            &CatchKind::Syscall(vec![]),
            &StopReason::Event(TargetEvent::SyscallEntry(60))
        ));
        assert!(!catch_matches(
            &CatchKind::Syscall(vec![1]),
            &StopReason::Event(TargetEvent::SyscallReturn(60))
        ));
        assert!(catch_matches(&CatchKind::Signal(vec![]), &StopReason::Signal(11)));
        assert!(!catch_matches(&CatchKind::Signal(vec![]), &StopReason::Signal(SIGTRAP)));
        assert!(!catch_matches(&CatchKind::Signal(vec![]), &StopReason::Signal(SIGINT)));
        assert!(catch_matches(&CatchKind::Signal(vec![2]), &StopReason::Signal(SIGINT)));
        assert!(catch_matches(
            &CatchKind::Load(Some("^libm\\.so".to_string())),
            &StopReason::Event(TargetEvent::LibraryLoaded("libm.so.6".to_string()))
        ));
        assert!(!catch_matches(
            &CatchKind::Load(Some("^libm\\.so".to_string())),
            &StopReason::Event(TargetEvent::LibraryLoaded("libc.so.6".to_string()))
        ));
        assert!(!catch_matches(
            &CatchKind::Unload(None),
            &StopReason::Event(TargetEvent::LibraryLoaded("libc.so.6".to_string()))
        ));
    }

    #[test]
    fn test_explains_signal() {
        let mut dbg = debugger(SimCapabilities::default());
        breakpoint_at(&mut dbg, BreakpointRequest::new(BreakpointKind::Breakpoint).at(0x401000));
        let verdict = hit(&mut dbg, 0x401000);
        assert!(verdict.record.explains_signal(SIGTRAP));
        assert!(verdict.record.explains_signal(11));

        let mut dbg = debugger(SimCapabilities::default());
        dbg.watch(WatchRequest::new("counter", WatchKind::Write)).unwrap();
        let reason = dbg.target_mut().write_watched(COUNTER, &[1, 0, 0, 0]).unwrap();
        let verdict = dbg.on_target_stop(0x401020, PSPACE, reason);
        assert!(verdict.record.explains_signal(SIGTRAP));
        assert!(!verdict.record.explains_signal(11));
    }
}
