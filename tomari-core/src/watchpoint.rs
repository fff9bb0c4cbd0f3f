//! ウォッチポイントの作成と再評価
//!
//! 監視する式を評価して値チェーンを取り、実際に読み取ったメモリ領域ごとに
//! ロケーションを作ります。ハードウェア資源が足りなければソフトウェア
//! ウォッチポイントに格下げします。

use crate::breakpoint::{
    Breakpoint, BreakpointId, BreakpointRequest, Disposition, EnableState, KindData,
    ResolvedLocation, WatchData, WatchRequest, WatchState, WatchTriggered,
};
use crate::debugger::{restriction_for, Debugger, Notify};
use crate::errors::{BreakpointError, Result};
use crate::insert::InsertMode;
use crate::kind::BreakpointKind;
use crate::memory::ShadowView;
use tomari_expr::{evaluate, fetch_value_chain, parse_expression, Expression, Lval, Node, Value};
use tomari_target::{HwCapability, HwKind, StopReason, Target, WatchKind};
use tracing::{debug, warn};

/// 停止時のウォッチポイントの確認結果
#[derive(Debug, Clone, PartialEq)]
pub enum WatchCheck {
    /// スコープを抜けたので削除予定
    Deleted,
    /// 別スレッドの停止なので判定しない
    Ignore,
    ValueChanged {
        old: Option<Value>,
        new: Option<Value>,
    },
    NotChanged,
}

/// 定数式か（メモリもレジスタも参照しない）
fn is_constant(node: &Node) -> bool {
    match node {
        Node::Const(_) => true,
        Node::Symbol(_) | Node::Register { .. } | Node::Deref { .. } => false,
        // アドレスは変わらない
        Node::AddressOf(_) => true,
        Node::Unary { operand, .. } => is_constant(operand),
        Node::Binary { lhs, rhs, .. } => is_constant(lhs) && is_constant(rhs),
    }
}

/// 値チェーンから監視するメモリ領域を取り出す
///
/// 最終結果は常に、途中の値は実際に読み取ったスカラーだけを監視します。
fn watched_regions(chain: &[Value], have_result: bool) -> Vec<(u64, usize)> {
    let Some(head) = chain.len().checked_sub(1) else {
        return Vec::new();
    };
    let mut regions: Vec<(u64, usize)> = Vec::new();
    for (i, v) in chain.iter().enumerate() {
        let Lval::Memory { address, len } = v.lval else {
            continue;
        };
        if i != head && v.lazy {
            continue;
        }
        if (i == head && have_result) || !v.is_aggregate() {
            if !regions.contains(&(address, len)) {
                regions.push((address, len));
            }
        }
    }
    regions
}

pub(crate) fn mention(kind: BreakpointKind, masked: bool) -> &'static str {
    match kind {
        _ if masked => "Masked hardware watchpoint",
        BreakpointKind::HwWatchpoint => "Hardware watchpoint",
        BreakpointKind::ReadWatchpoint => "Hardware read watchpoint",
        BreakpointKind::AccessWatchpoint => "Hardware access (read/write) watchpoint",
        _ => "Watchpoint",
    }
}

impl<T: Target> Debugger<T> {
    /// ウォッチポイントを作成する
    pub fn watch(&mut self, req: WatchRequest) -> Result<BreakpointId> {
        let restriction = restriction_for(req.thread, req.task, None)?;
        let frame = self.target.selected_frame();
        let scope_pc = frame.map(|f| f.pc);

        let expr = parse_expression(&req.expr, &*self.symbols, scope_pc)
            .map_err(|e| BreakpointError::Watchpoint(e.to_string()))?;
        if is_constant(&expr.root) {
            return Err(BreakpointError::Watchpoint(format!(
                "Cannot watch constant value `{}'.",
                expr
            )));
        }

        if let Some(mask) = req.mask {
            let value = evaluate(&expr, &ShadowView::new(self))
                .map_err(|e| BreakpointError::Watchpoint(e.to_string()))?;
            let Some((address, _)) = value.memory_range() else {
                return Err(BreakpointError::Watchpoint(format!(
                    "Cannot watch constant value `{}'.",
                    expr
                )));
            };
            match self.target.masked_watch_num_registers(address, mask) {
                None => {
                    return Err(BreakpointError::HwUnsupported(
                        "This target does not support masked watchpoints.".to_string(),
                    ))
                }
                Some(0) => {
                    return Err(BreakpointError::Watchpoint(
                        "Invalid mask or memory region.".to_string(),
                    ))
                }
                Some(_) => {}
            }
        }

        let local_frame = if expr.is_frame_local() {
            Some(frame.ok_or_else(|| {
                BreakpointError::Watchpoint("No frame selected.".to_string())
            })?)
        } else {
            None
        };

        let cond_expr = match &req.condition {
            Some(cond) => Some(parse_expression(cond, &*self.symbols, scope_pc)?),
            None => None,
        };

        // フレームローカルな式はフレームを抜けたことを呼び出し元で捕まえる
        let scope_bp = match local_frame.and_then(|f| f.caller) {
            Some(caller) => Some(
                self.create_breakpoint(
                    BreakpointRequest::new(BreakpointKind::WatchpointScope)
                        .at(caller.resume_pc)
                        .frame(caller.id)
                        .temporary(),
                )?,
            ),
            None => None,
        };

        let kind = match req.access {
            WatchKind::Write => BreakpointKind::HwWatchpoint,
            access => BreakpointKind::hw_watchpoint(access),
        };
        let id = self.allocate_id(false);
        let mut bp = Breakpoint::new(id, kind, self.current_pspace);
        bp.restriction = restriction;
        bp.cond_string = req.condition.clone();
        bp.related = scope_bp;

        let mut data = WatchData::new(req.access, expr);
        data.scope_pc = scope_pc;
        data.cond_expr = cond_expr;
        data.mask = req.mask;
        if let Some(f) = local_frame {
            data.frame = Some(f.id);
            data.thread = Some(self.target.current_thread().tid);
        }
        bp.data = KindData::Watch(Box::new(data));
        self.breakpoints.push(bp);

        if let Some(scope) = scope_bp {
            if let Some(s) = self.bp_mut(scope) {
                s.related = Some(id);
            }
        }

        if let Err(e) = self.update_watchpoint(id, true) {
            if let Some(scope) = scope_bp {
                if let Some(s) = self.bp_mut(scope) {
                    s.related = None;
                }
                if let Err(del) = self.delete_breakpoint(scope) {
                    warn!("Failed to delete scope breakpoint {}: {}", scope, del);
                }
            }
            self.detach_locations(id);
            self.breakpoints.retain(|b| b.id != id);
            self.release_id(id);
            self.update_global_location_list(InsertMode::DontInsert);
            return Err(e);
        }

        let (kind, masked, text) = match self.bp(id) {
            Some(bp) => (
                bp.kind,
                bp.is_masked_watchpoint(),
                bp.watch().map(|w| w.expr_text.clone()).unwrap_or_default(),
            ),
            None => return Err(BreakpointError::NotFound(id.0)),
        };
        self.notify(id, Notify::Created);
        self.message(format!("{} {}: {}", mention(kind, masked), id, text));
        self.update_global_location_list(InsertMode::MayInsert);
        Ok(id)
    }

    /// ウォッチポイントのロケーションと種類を作り直す
    ///
    /// `reparse` のときは式を再パースし、ハードウェアで監視できるかを判定し直します。
    pub(crate) fn update_watchpoint(&mut self, id: BreakpointId, reparse: bool) -> Result<()> {
        let (disposition, thread, frame, scope_pc) = {
            let bp = self.bp(id).ok_or(BreakpointError::NotFound(id.0))?;
            let Some(w) = bp.watch() else {
                return Ok(());
            };
            (bp.disposition, w.thread, w.frame, w.scope_pc)
        };

        if let Some(t) = thread {
            if t != self.target.current_thread().tid {
                return Ok(());
            }
        }
        if disposition == Disposition::DeleteAtNextStop {
            return Ok(());
        }

        let within_scope = frame.map(|f| self.target.frame_exists(f)).unwrap_or(true);
        if !within_scope {
            self.message(format!(
                "Watchpoint {} deleted because the program has left the block in\nwhich its expression is valid.",
                id
            ));
            self.watchpoint_del_at_next_stop(id);
            return Ok(());
        }

        if reparse {
            self.reparse_watchpoint(id, scope_pc)?;
        }

        if !self.target.has_execution() {
            // 実行中でなければメモリは変わらないので、ロケーションは作らない
            if !self.settings.can_use_hw_watchpoints {
                self.downgrade_or_reject(id)?;
            }
            return Ok(());
        }

        let Some(expr) = self.bp(id).and_then(|b| b.watch()).and_then(|w| w.expr.clone()) else {
            return Ok(());
        };
        let evaluation = fetch_value_chain(&expr, &ShadowView::new(self))
            .map_err(|e| BreakpointError::Watchpoint(e.to_string()))?;

        let (access, mask, pspace) = {
            let bp = self.bp_mut(id).ok_or(BreakpointError::NotFound(id.0))?;
            let pspace = bp.pspace;
            let Some(w) = bp.watch_mut() else {
                return Ok(());
            };
            if !w.value_valid && w.mask.is_none() {
                w.value = evaluation.value.clone();
                w.value_valid = true;
            }
            (w.access, w.mask, pspace)
        };

        self.detach_locations(id);
        let regions = watched_regions(&evaluation.chain, evaluation.value.is_some());
        for (address, len) in &regions {
            let resolved = ResolvedLocation::new(*address).in_pspace(pspace);
            if let Some(lid) = self.add_location(id, &resolved, *len) {
                if let Some(loc) = self.arena.get_mut(lid) {
                    loc.watch_kind = Some(access);
                    loc.mask = mask;
                }
            }
        }

        if reparse {
            let registers = self.can_use_hardware_watchpoint(&evaluation.chain);
            if registers > 0 {
                self.choose_hardware_kind(id)?;
            } else {
                self.downgrade_or_reject(id)?;
            }
        }

        let needs_dummy = self
            .bp(id)
            .map(|b| b.kind == BreakpointKind::Watchpoint && b.locations.is_empty())
            .unwrap_or(false);
        if needs_dummy {
            // 何も読まない式でも停止判定の対象になるようロケーションを1つ持たせる
            let resolved = ResolvedLocation::new(0).in_pspace(pspace);
            self.add_location(id, &resolved, 0);
        }

        if let Some(w) = self.bp_mut(id).and_then(|b| b.watch_mut()) {
            w.state = WatchState::InScope;
        }
        Ok(())
    }

    fn reparse_watchpoint(&mut self, id: BreakpointId, scope_pc: Option<u64>) -> Result<()> {
        let (text, cond) = match self.bp(id) {
            Some(bp) => (
                bp.watch().map(|w| w.expr_text.clone()).unwrap_or_default(),
                bp.cond_string.clone(),
            ),
            None => return Err(BreakpointError::NotFound(id.0)),
        };
        let expr = parse_expression(&text, &*self.symbols, scope_pc)
            .map_err(|e| BreakpointError::Watchpoint(e.to_string()))?;
        let cond_expr = match &cond {
            Some(c) => Some(parse_expression(c, &*self.symbols, scope_pc)?),
            None => None,
        };
        if let Some(w) = self.bp_mut(id).and_then(|b| b.watch_mut()) {
            w.valid_scope = expr.innermost_scope();
            w.expr = Some(expr);
            w.cond_expr = cond_expr;
            w.value = None;
            w.value_valid = false;
        }
        Ok(())
    }

    /// ハードウェア資源が足りればハードウェアウォッチポイントにする
    fn choose_hardware_kind(&mut self, id: BreakpointId) -> Result<()> {
        let (current, access) = match self.bp(id) {
            Some(bp) => (bp.kind, bp.watch().map(|w| w.access).unwrap_or(WatchKind::Write)),
            None => return Err(BreakpointError::NotFound(id.0)),
        };
        let wanted = match current {
            BreakpointKind::Watchpoint => BreakpointKind::HwWatchpoint,
            other => other,
        };
        let usage = self.hw_watchpoint_slots_excluding(Some(id), wanted);
        let own = self.bp(id).map(|b| self.hw_watchpoint_use_count(b)).unwrap_or(0);
        let capability = self.target.can_use_hw_watchpoint(
            HwKind::Watchpoint(wanted.watch_kind().unwrap_or(access)),
            usage.same_kind + own,
            usage.other_kinds,
        );

        match capability {
            HwCapability::Yes => {
                self.set_watch_kind(id, wanted);
                Ok(())
            }
            failure => {
                let sw_mode = self
                    .bp(id)
                    .and_then(|b| b.watch())
                    .map(|w| w.works_in_software_mode())
                    .unwrap_or(false);
                if !sw_mode {
                    let message = match failure {
                        HwCapability::Unsupported => {
                            "Target does not support this type of hardware watchpoint."
                        }
                        _ => "There are not enough available hardware resources for this watchpoint.",
                    };
                    return Err(BreakpointError::ResourceExhausted(message.to_string()));
                }
                self.downgrade(id);
                Ok(())
            }
        }
    }

    /// ソフトウェアウォッチポイントにするか、できなければエラー
    fn downgrade_or_reject(&mut self, id: BreakpointId) -> Result<()> {
        let sw_mode = self
            .bp(id)
            .and_then(|b| b.watch())
            .map(|w| w.works_in_software_mode())
            .unwrap_or(false);
        if !sw_mode {
            let message = if !self.settings.can_use_hw_watchpoints {
                "Can't set read/access watchpoint when hardware watchpoints are disabled."
            } else {
                "Expression cannot be implemented with read/access watchpoint."
            };
            return Err(BreakpointError::HwUnsupported(message.to_string()));
        }
        self.set_watch_kind(id, BreakpointKind::Watchpoint);
        Ok(())
    }

    /// 資源不足によるソフトウェアへの格下げ（ウォッチポイントごとに1度だけ警告）
    fn downgrade(&mut self, id: BreakpointId) {
        let was_hardware = self.bp(id).map(|b| b.kind.is_hardware_watchpoint()).unwrap_or(false);
        self.set_watch_kind(id, BreakpointKind::Watchpoint);
        let first = match self.bp_mut(id).and_then(|b| b.watch_mut()) {
            Some(w) if was_hardware && !w.downgrade_warned => {
                w.downgrade_warned = true;
                true
            }
            _ => false,
        };
        if first {
            self.warn(format!("Watchpoint {} downgraded to software watchpoint", id));
        }
    }

    fn set_watch_kind(&mut self, id: BreakpointId, kind: BreakpointKind) {
        let locs = match self.bp_mut(id) {
            Some(bp) => {
                if bp.kind != kind {
                    debug!("Watchpoint {} is now a {}", id, kind);
                }
                bp.kind = kind;
                bp.locations.clone()
            }
            None => return,
        };
        for lid in locs {
            if let Some(loc) = self.arena.get_mut(lid) {
                loc.owner_kind = kind;
                loc.kind = kind.traits().loc_kind;
            }
        }
    }

    /// 停止時に監視している値を読み直して比較する
    pub fn watchpoint_check(&mut self, id: BreakpointId) -> WatchCheck {
        let Some((frame, thread, masked, expr, old)) = self.bp(id).and_then(|b| {
            let w = b.watch()?;
            Some((w.frame, w.thread, w.mask.is_some(), w.expr.clone(), w.value.clone()))
        }) else {
            return WatchCheck::Ignore;
        };

        if let Some(t) = thread {
            if t != self.target.current_thread().tid {
                return WatchCheck::Ignore;
            }
        }

        let within_scope = frame.map(|f| self.target.frame_exists(f)).unwrap_or(true);
        if !within_scope {
            self.message(format!(
                "\nWatchpoint {} deleted because the program has left the block in\nwhich its expression is valid.",
                id
            ));
            self.watchpoint_del_at_next_stop(id);
            return WatchCheck::Deleted;
        }

        // マスク付きは発火したアドレスが正確に分からないので常に変化ありとする
        if masked {
            return WatchCheck::ValueChanged { old: None, new: None };
        }

        let Some(expr) = expr else {
            return WatchCheck::NotChanged;
        };
        let new = match fetch_value_chain(&expr, &ShadowView::new(self)) {
            Ok(evaluation) => evaluation.value,
            Err(e) => {
                debug!("Watchpoint {} could not be evaluated: {}", id, e);
                None
            }
        };

        let changed = match (&old, &new) {
            (Some(a), Some(b)) => !a.contents_eq(b),
            (None, None) => false,
            _ => true,
        };
        if !changed {
            return WatchCheck::NotChanged;
        }
        if let Some(w) = self.bp_mut(id).and_then(|b| b.watch_mut()) {
            w.value = new.clone();
            w.value_valid = true;
        }
        WatchCheck::ValueChanged { old, new }
    }

    /// 停止理由からハードウェアウォッチポイントの発火を記録する
    ///
    /// ウォッチポイントによる停止だったかを返します。
    pub fn watchpoints_triggered(&mut self, reason: &StopReason) -> bool {
        let by_watchpoint =
            matches!(reason, StopReason::Watchpoint { .. }) || self.target.stopped_by_watchpoint();
        let data_address = match reason {
            StopReason::Watchpoint {
                data_address: Some(addr),
            } => Some(*addr),
            _ => self.target.stopped_data_address(),
        };

        let ids: Vec<BreakpointId> = self
            .breakpoints
            .iter()
            .filter(|b| b.kind.is_hardware_watchpoint())
            .map(|b| b.id)
            .collect();

        for id in ids {
            let triggered = match (by_watchpoint, data_address) {
                (false, _) => WatchTriggered::No,
                (true, None) => WatchTriggered::Unknown,
                (true, Some(addr)) => {
                    let hit = self.bp(id).map(|bp| {
                        let mask = bp.watch().and_then(|w| w.mask);
                        bp.locations.iter().filter_map(|l| self.arena.get(*l)).any(|loc| {
                            match mask {
                                Some(mask) => addr & mask == loc.address & mask,
                                None => self.target.watchpoint_addr_within_range(
                                    addr,
                                    loc.address,
                                    loc.length,
                                ),
                            }
                        })
                    });
                    if hit.unwrap_or(false) {
                        WatchTriggered::Yes
                    } else {
                        WatchTriggered::No
                    }
                }
            };
            if let Some(w) = self.bp_mut(id).and_then(|b| b.watch_mut()) {
                w.triggered = triggered;
            }
        }
        by_watchpoint
    }

    /// 次の停止でウォッチポイントとスコープブレークポイントを削除する
    pub(crate) fn watchpoint_del_at_next_stop(&mut self, id: BreakpointId) {
        let related = match self.bp(id) {
            Some(bp) => bp.related,
            None => return,
        };
        if let Some(rel) = related {
            if let Some(scope) = self.bp_mut(rel) {
                scope.disposition = Disposition::DeleteAtNextStop;
                scope.related = None;
            }
        }
        if let Some(bp) = self.bp_mut(id) {
            bp.related = None;
            bp.disposition = Disposition::DeleteAtNextStop;
            if let Some(w) = bp.watch_mut() {
                w.state = WatchState::OutOfScope;
            }
        }
    }

    /// 関数呼び出しの間、有効なウォッチポイントを無効にする
    pub fn begin_inferior_call(&mut self) {
        let mut changed = false;
        for bp in self.breakpoints.iter_mut() {
            if bp.kind.is_watchpoint() && bp.enable_state == EnableState::Enabled {
                bp.enable_state = EnableState::CallDisabled;
                changed = true;
            }
        }
        if changed {
            self.update_global_location_list(InsertMode::DontInsert);
        }
    }

    /// 関数呼び出しで無効にしたウォッチポイントを戻す
    pub fn end_inferior_call(&mut self) {
        let mut changed = false;
        for bp in self.breakpoints.iter_mut() {
            if bp.kind.is_watchpoint() && bp.enable_state == EnableState::CallDisabled {
                bp.enable_state = EnableState::Enabled;
                changed = true;
            }
        }
        if changed {
            self.update_global_location_list(InsertMode::MayInsert);
        }
    }

    /// ハードウェアウォッチポイントの値チェーンを評価し直す
    ///
    /// ポインタが指す先が変わるとロケーションも変わるため、停止しなかった後に使います。
    pub(crate) fn refresh_hardware_watchpoints(&mut self, ids: &[BreakpointId]) {
        for id in ids {
            if let Err(e) = self.update_watchpoint(*id, false) {
                warn!("Cannot update watchpoint {}: {}", id, e);
            }
        }
    }

    /// 監視している式のテキスト
    pub fn watch_expression(&self, id: BreakpointId) -> Option<&Expression> {
        self.bp(id).and_then(|b| b.watch()).and_then(|w| w.expr.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tomari_expr::{Scope, Symbol, SymbolTable};
    use tomari_target::{SimCapabilities, SimTarget, TargetCall};

    const COUNTER: u64 = 0x601000;
    const PTR: u64 = 0x601010;
    const BUFFER: u64 = 0x601020;

    fn debugger(caps: SimCapabilities) -> Debugger<SimTarget> {
        let mut target = SimTarget::with_caps(caps);
        target.map(0x401000, &[0x90; 0x2000]);
        target.map(0x601000, &[0; 0x100]);
        target.poke(PTR, &COUNTER.to_le_bytes());
        target.map(0x7ff000, &[0; 0x100]);

        let mut symbols = SymbolTable::new();
        symbols.add(Symbol::global("counter", COUNTER, 4));
        symbols.add(Symbol::global("ptr", PTR, 8));
        symbols.add(Symbol::global("buffer", BUFFER, 32));
        symbols.add(Symbol::local("local", -8, 4, Scope::new(0x401000, 0x401100)));

        let mut dbg = Debugger::new(target);
        dbg.set_symbols(Box::new(symbols));
        dbg.set_setting("always-inserted", "on").unwrap();
        dbg
    }

    #[test]
    fn test_hardware_watchpoint_location() {
        let mut dbg = debugger(SimCapabilities::default());
        let id = dbg.watch(WatchRequest::new("counter", WatchKind::Write)).unwrap();

        let bp = dbg.breakpoint(id).unwrap();
        assert_eq!(bp.kind, BreakpointKind::HwWatchpoint);
        let locs = dbg.locations_of(id);
        assert_eq!(locs.len(), 1);
        assert_eq!((locs[0].address, locs[0].length), (COUNTER, 4));
        assert!(locs[0].inserted);
        assert_eq!(
            dbg.take_messages(),
            vec!["Hardware watchpoint 1: counter".to_string()]
        );
    }

    #[test]
    fn test_pointer_chain_watches_both_regions() {
        let mut dbg = debugger(SimCapabilities::default());
        let id = dbg.watch(WatchRequest::new("{u32} ptr", WatchKind::Write)).unwrap();
        let mut addrs: Vec<u64> = dbg.locations_of(id).iter().map(|l| l.address).collect();
        addrs.sort();
        assert_eq!(addrs, vec![COUNTER, PTR]);
    }

    #[test]
    fn test_failed_rollback_is_reported() {
        let mut dbg = debugger(SimCapabilities::default());
        let id = dbg.watch(WatchRequest::new("{u32} ptr", WatchKind::Write)).unwrap();
        dbg.disable(id).unwrap();
        assert!(dbg.target().watchpoints().is_empty());

        // counter は入らず、入った ptr も外せない
        dbg.target_mut().fail_insert_at(COUNTER);
        dbg.target_mut().fail_remove_at(PTR);
        let _ = dbg.enable(id);

        let messages: Vec<&str> = dbg
            .last_report()
            .failures
            .iter()
            .map(|f| f.message.as_str())
            .collect();
        assert!(messages
            .iter()
            .any(|m| m.starts_with("Cannot remove hardware watchpoint 1")));
        assert!(messages.contains(&"Could not insert hardware watchpoint 1."));
    }

    #[test]
    fn test_aggregate_is_software() {
        let mut dbg = debugger(SimCapabilities::default());
        let id = dbg.watch(WatchRequest::new("buffer", WatchKind::Write)).unwrap();
        assert_eq!(dbg.breakpoint(id).unwrap().kind, BreakpointKind::Watchpoint);
        assert!(dbg.should_step());
        assert!(dbg.take_warnings().is_empty());
    }

    #[test]
    fn test_read_watchpoint_on_aggregate_is_rejected() {
        let mut dbg = debugger(SimCapabilities::default());
        let err = dbg.watch(WatchRequest::new("buffer", WatchKind::Read)).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Expression cannot be implemented with read/access watchpoint."
        );
        assert_eq!(dbg.breakpoints().count(), 0);

        let id = dbg.watch(WatchRequest::new("counter", WatchKind::Write)).unwrap();
        assert_eq!(id, BreakpointId(1));
    }

    #[test]
    fn test_constant_cannot_be_watched() {
        let mut dbg = debugger(SimCapabilities::default());
        let err = dbg.watch(WatchRequest::new("1 + 2", WatchKind::Write)).unwrap_err();
        assert_eq!(err.to_string(), "Cannot watch constant value `1 + 2'.");
    }

    #[test]
    fn test_downgrade_when_slots_exhausted() {
        let caps = SimCapabilities {
            debug_registers: Some(1),
            ..Default::default()
        };
        let mut dbg = debugger(caps);
        dbg.watch(WatchRequest::new("counter", WatchKind::Write)).unwrap();
        let second = dbg.watch(WatchRequest::new("ptr", WatchKind::Write)).unwrap();

        assert_eq!(dbg.breakpoint(second).unwrap().kind, BreakpointKind::Watchpoint);
        assert_eq!(
            dbg.take_warnings(),
            vec!["Watchpoint 2 downgraded to software watchpoint".to_string()]
        );
    }

    #[test]
    fn test_access_watchpoint_without_slots_fails() {
        let caps = SimCapabilities {
            debug_registers: Some(1),
            ..Default::default()
        };
        let mut dbg = debugger(caps);
        dbg.watch(WatchRequest::new("counter", WatchKind::Write)).unwrap();
        let err = dbg.watch(WatchRequest::new("ptr", WatchKind::Access)).unwrap_err();
        assert_eq!(
            err.to_string(),
            "There are not enough available hardware resources for this watchpoint."
        );
    }

    #[test]
    fn test_value_change_detected() {
        let mut dbg = debugger(SimCapabilities::default());
        let id = dbg.watch(WatchRequest::new("counter", WatchKind::Write)).unwrap();
        assert_eq!(dbg.watchpoint_check(id), WatchCheck::NotChanged);

        dbg.target_mut().poke(COUNTER, &[7, 0, 0, 0]);
        match dbg.watchpoint_check(id) {
            WatchCheck::ValueChanged { old, new } => {
                assert_eq!(old.unwrap().as_u64().unwrap(), 0);
                assert_eq!(new.unwrap().as_u64().unwrap(), 7);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(dbg.watchpoint_check(id), WatchCheck::NotChanged);
    }

    #[test]
    fn test_triggered_by_data_address() {
        let mut dbg = debugger(SimCapabilities::default());
        let a = dbg.watch(WatchRequest::new("counter", WatchKind::Write)).unwrap();
        let b = dbg.watch(WatchRequest::new("ptr", WatchKind::Write)).unwrap();

        let reason = dbg.target_mut().write_watched(COUNTER + 1, &[1]).unwrap();
        assert!(dbg.watchpoints_triggered(&reason));
        assert_eq!(triggered(&dbg, a), WatchTriggered::Yes);
        assert_eq!(triggered(&dbg, b), WatchTriggered::No);
    }

    fn triggered(dbg: &Debugger<SimTarget>, id: BreakpointId) -> WatchTriggered {
        dbg.breakpoint(id).unwrap().watch().unwrap().triggered
    }

    #[test]
    fn test_unknown_data_address() {
        let mut dbg = debugger(SimCapabilities::default());
        let id = dbg.watch(WatchRequest::new("counter", WatchKind::Write)).unwrap();
        assert!(dbg.watchpoints_triggered(&StopReason::Watchpoint { data_address: None }));
        assert_eq!(triggered(&dbg, id), WatchTriggered::Unknown);
    }

    #[test]
    fn test_local_watchpoint_scope() {
        let mut dbg = debugger(SimCapabilities::default());
        dbg.target_mut().push_frame(0x402000, 0x7ff080);
        dbg.target_mut().push_frame(0x401010, 0x7ff040);

        let id = dbg.watch(WatchRequest::new("local", WatchKind::Write)).unwrap();
        let scope = dbg.breakpoint(id).unwrap().related.unwrap();
        let scope_bp = dbg.breakpoint(scope).unwrap();
        assert_eq!(scope_bp.kind, BreakpointKind::WatchpointScope);
        assert_eq!(scope_bp.related, Some(id));
        assert_eq!(dbg.locations_of(scope)[0].address, 0x402000);
        assert_eq!(dbg.locations_of(id)[0].address, 0x7ff038);

        dbg.target_mut().pop_frame();
        assert_eq!(dbg.watchpoint_check(id), WatchCheck::Deleted);
        assert_eq!(
            dbg.breakpoint(id).unwrap().disposition,
            Disposition::DeleteAtNextStop
        );
        assert_eq!(
            dbg.breakpoint(scope).unwrap().disposition,
            Disposition::DeleteAtNextStop
        );
    }

    #[test]
    fn test_failed_local_watchpoint_removes_scope_breakpoint() {
        let caps = SimCapabilities {
            debug_registers: Some(1),
            ..Default::default()
        };
        let mut dbg = debugger(caps);
        dbg.target_mut().push_frame(0x402000, 0x7ff080);
        dbg.target_mut().push_frame(0x401010, 0x7ff040);
        dbg.watch(WatchRequest::new("counter", WatchKind::Write)).unwrap();

        let err = dbg.watch(WatchRequest::new("local", WatchKind::Access)).unwrap_err();
        assert!(matches!(err, BreakpointError::ResourceExhausted(_)));
        assert!(dbg
            .breakpoints()
            .all(|b| b.kind != BreakpointKind::WatchpointScope));
        assert!(!dbg.target().sw_inserted_at(0x402000));
    }

    #[test]
    fn test_local_watchpoint_requires_frame() {
        let mut dbg = debugger(SimCapabilities::default());
        let err = dbg.watch(WatchRequest::new("local", WatchKind::Write)).unwrap_err();
        assert!(matches!(err, BreakpointError::Watchpoint(_)));
    }

    #[test]
    fn test_inferior_call_disables_watchpoints() {
        let mut dbg = debugger(SimCapabilities::default());
        let id = dbg.watch(WatchRequest::new("counter", WatchKind::Write)).unwrap();
        dbg.target_mut().take_calls();

        dbg.begin_inferior_call();
        assert_eq!(dbg.breakpoint(id).unwrap().enable_state, EnableState::CallDisabled);
        assert!(dbg.target().watchpoints().is_empty());

        dbg.end_inferior_call();
        assert_eq!(dbg.breakpoint(id).unwrap().enable_state, EnableState::Enabled);
        assert_eq!(
            dbg.target().calls().last(),
            Some(&TargetCall::InsertWatch {
                addr: COUNTER,
                len: 4,
                kind: WatchKind::Write
            })
        );
    }

    #[test]
    fn test_masked_watchpoint() {
        let mut dbg = debugger(SimCapabilities::default());
        let id = dbg
            .watch(WatchRequest::new("counter", WatchKind::Write).mask(0xffff_ff00))
            .unwrap();
        assert!(dbg.breakpoint(id).unwrap().is_masked_watchpoint());
        assert_eq!(dbg.target().debug_registers_used(), 2);

        let caps = SimCapabilities {
            masked_watchpoints: false,
            ..Default::default()
        };
        let mut dbg = debugger(caps);
        let err = dbg
            .watch(WatchRequest::new("counter", WatchKind::Write).mask(0xff00))
            .unwrap_err();
        assert_eq!(err.to_string(), "This target does not support masked watchpoints.");
    }

    #[test]
    fn test_regions_skip_lazy_intermediates() {
        let chain = vec![
            Value::lazy_memory(0x1000, 64),
            Value::scalar(0x1008, false),
            Value::from_memory(0x1008, vec![0; 4], false),
        ];
        assert_eq!(watched_regions(&chain, true), vec![(0x1008, 4)]);
    }
}
