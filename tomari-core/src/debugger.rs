//! ブレークポイント管理の本体
//!
//! [`Debugger`] はブレークポイントの一覧、ロケーションのアリーナ、
//! グローバルロケーションリストを持ち、ターゲットへの挿入・削除と停止時の判定を行います。
//! 処理はモジュールごとに `impl` ブロックを分けています。
//!
//! - `insert`: グローバルロケーションリストの再調整とターゲットへの反映
//! - `watchpoint`: ウォッチポイントの作成・再評価
//! - `stop`: 停止時の判定
//! - `lifecycle`: ライブラリ・スレッド・プロセスのイベント
//! - `memory`: シャドウを考慮したメモリアクセスと問い合わせ

use crate::breakpoint::{
    Breakpoint, BreakpointId, BreakpointRequest, Disposition, EnableState, KindData,
    LocationResolver, ResolvedLocation, Restriction,
};
use crate::errors::{BreakpointError, ReconcileReport, Result};
use crate::insert::InsertMode;
use crate::kind::BreakpointKind;
use crate::location::{ConditionChange, Location, LocationArena, LocationId};
use crate::notify::BreakpointObserver;
use crate::pspace::{AddressSpaceId, ProgramSpace, ProgramSpaceId};
use crate::registry::Registry;
use crate::settings::{BreakpointSettings, ConditionEvaluation, PendingMode};
use tomari_expr::{parse_expression, SymbolLookup, SymbolTable};
use tomari_target::breakpoint::{TRAP_LEN, TRAP_OPCODE};
use tomari_target::{HwCapability, HwKind, InferiorId, TaskId, Target, ThreadId};
use tracing::{debug, info, warn};

/// ブレークポイントを踏み越えている最中のスレッドと場所
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepOver {
    pub thread: ThreadId,
    pub aspace: AddressSpaceId,
    pub address: u64,
}

/// 通知の種類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Notify {
    Created,
    Modified,
}

/// ブレークポイント管理
pub struct Debugger<T: Target> {
    pub(crate) target: T,
    pub(crate) settings: BreakpointSettings,
    /// 作成順のブレークポイント
    pub(crate) breakpoints: Vec<Breakpoint>,
    pub(crate) arena: LocationArena,
    pub(crate) registry: Registry,
    pub(crate) pspaces: Vec<ProgramSpace>,
    pub(crate) current_pspace: ProgramSpaceId,
    next_number: i32,
    next_internal: i32,
    pub(crate) step_over: Option<StepOver>,
    /// ウォッチポイントを踏み越えている最中
    pub(crate) stepping_past_watchpoint: bool,
    /// スレッドが実行中（停止イベントの処理待ち）
    pub(crate) threads_executing: bool,
    pub(crate) symbols: Box<dyn SymbolLookup>,
    pub(crate) resolver: Option<Box<dyn LocationResolver>>,
    pub(crate) observers: Vec<Box<dyn BreakpointObserver>>,
    pub(crate) warnings: Vec<String>,
    pub(crate) messages: Vec<String>,
    pub(crate) last_report: ReconcileReport,
    /// 自動ハードウェアブレークポイントの注意を表示済み
    pub(crate) said_auto_hw: bool,
}

pub(crate) fn restriction_for(
    thread: Option<ThreadId>,
    task: Option<TaskId>,
    inferior: Option<InferiorId>,
) -> Result<Restriction> {
    match (thread, task, inferior) {
        (Some(_), Some(_), _) => Err(BreakpointError::RestrictionConflict(
            "You can specify only one of thread or task.".to_string(),
        )),
        (Some(_), _, Some(_)) => Err(BreakpointError::RestrictionConflict(
            "You can specify only one of thread or inferior.".to_string(),
        )),
        (_, Some(_), Some(_)) => Err(BreakpointError::RestrictionConflict(
            "You can specify only one of inferior or task.".to_string(),
        )),
        (Some(t), None, None) => Ok(Restriction::Thread(t)),
        (None, Some(t), None) => Ok(Restriction::Task(t)),
        (None, None, Some(i)) => Ok(Restriction::Inferior(i)),
        (None, None, None) => Ok(Restriction::Any),
    }
}

impl<T: Target> Debugger<T> {
    /// 新しいブレークポイント管理を作成する
    pub fn new(target: T) -> Self {
        Self::with_settings(target, BreakpointSettings::default())
    }

    pub fn with_settings(target: T, settings: BreakpointSettings) -> Self {
        let initial = ProgramSpace::new(ProgramSpaceId::INITIAL, AddressSpaceId(1));
        Self {
            target,
            settings,
            breakpoints: Vec::new(),
            arena: LocationArena::new(),
            registry: Registry::new(),
            pspaces: vec![initial],
            current_pspace: ProgramSpaceId::INITIAL,
            next_number: 1,
            next_internal: -1,
            step_over: None,
            stepping_past_watchpoint: false,
            threads_executing: false,
            symbols: Box::new(SymbolTable::new()),
            resolver: None,
            observers: Vec::new(),
            warnings: Vec::new(),
            messages: Vec::new(),
            last_report: ReconcileReport::new(),
            said_auto_hw: false,
        }
    }

    /// 式のパースに使うシンボル解決層を設定する
    pub fn set_symbols(&mut self, symbols: Box<dyn SymbolLookup>) {
        self.symbols = symbols;
    }

    /// 場所の指定の再解決に使う解決層を設定する
    pub fn set_resolver(&mut self, resolver: Box<dyn LocationResolver>) {
        self.resolver = Some(resolver);
    }

    pub fn add_observer(&mut self, observer: Box<dyn BreakpointObserver>) {
        self.observers.push(observer);
    }

    pub fn target(&self) -> &T {
        &self.target
    }

    pub fn target_mut(&mut self) -> &mut T {
        &mut self.target
    }

    pub fn settings(&self) -> &BreakpointSettings {
        &self.settings
    }

    /// 設定を変更する
    ///
    /// 条件式の評価場所が変わった場合はロケーションの条件を送り直し、
    /// `always-inserted` が変わった場合は再調整します。
    pub fn set_setting(&mut self, name: &str, value: &str) -> Result<()> {
        let was_target_side = self.target_side_conditions_active();
        let was_always_inserted = self.settings.always_inserted;
        self.settings.set(name, value)?;

        if name == "condition-evaluation" {
            if self.settings.condition_evaluation == ConditionEvaluation::Target
                && !self.target.supports_target_side_conditions()
            {
                self.warn(
                    "Target does not support breakpoint condition evaluation.\nUsing host evaluation mode instead."
                        .to_string(),
                );
                self.settings.condition_evaluation = ConditionEvaluation::Host;
            }
            let now_target_side = self.target_side_conditions_active();
            if was_target_side != now_target_side {
                let ids = self.registry.global.clone();
                for lid in ids {
                    self.mark_location_modified(lid, true);
                }
                self.update_global_location_list(InsertMode::MayInsert);
            }
        } else if name == "always-inserted" && was_always_inserted != self.settings.always_inserted {
            self.update_global_location_list(InsertMode::MayInsert);
        }
        Ok(())
    }

    /// プログラム空間を追加する
    pub fn add_program_space(&mut self, aspace: AddressSpaceId) -> ProgramSpaceId {
        let next = self.pspaces.iter().map(|p| p.id.0).max().unwrap_or(0) + 1;
        let id = ProgramSpaceId(next);
        self.pspaces.push(ProgramSpace::new(id, aspace));
        id
    }

    pub fn set_current_pspace(&mut self, pspace: ProgramSpaceId) {
        self.current_pspace = pspace;
    }

    /// 起動処理中かどうかを設定する（起動中はユーザーのブレークポイントを挿入しない）
    pub fn set_executing_startup(&mut self, pspace: ProgramSpaceId, executing: bool) {
        if let Some(ps) = self.pspaces.iter_mut().find(|p| p.id == pspace) {
            ps.executing_startup = executing;
        }
    }

    pub fn program_space(&self, id: ProgramSpaceId) -> Option<&ProgramSpace> {
        self.pspaces.iter().find(|p| p.id == id)
    }

    pub(crate) fn aspace_of(&self, pspace: ProgramSpaceId) -> AddressSpaceId {
        self.program_space(pspace)
            .map(|p| p.aspace)
            .unwrap_or(AddressSpaceId(pspace.0))
    }

    /// 作成順のブレークポイント一覧
    pub fn breakpoints(&self) -> impl Iterator<Item = &Breakpoint> {
        self.breakpoints.iter()
    }

    pub fn breakpoint(&self, id: BreakpointId) -> Result<&Breakpoint> {
        self.bp(id).ok_or(BreakpointError::NotFound(id.0))
    }

    pub fn location(&self, id: LocationId) -> Option<&Location> {
        self.arena.get(id)
    }

    /// ブレークポイントのロケーション（アドレス順）
    pub fn locations_of(&self, id: BreakpointId) -> Vec<&Location> {
        self.bp(id)
            .map(|bp| bp.locations.iter().filter_map(|l| self.arena.get(*l)).collect())
            .unwrap_or_default()
    }

    /// ソート済みのグローバルロケーションリスト
    pub fn global_locations(&self) -> &[LocationId] {
        self.registry.locations()
    }

    pub fn moribund_locations(&self) -> &[LocationId] {
        self.registry.moribund()
    }

    /// 直前の再調整パスの結果
    pub fn last_report(&self) -> &ReconcileReport {
        &self.last_report
    }

    /// 溜まった警告を取り出す
    pub fn take_warnings(&mut self) -> Vec<String> {
        std::mem::take(&mut self.warnings)
    }

    /// 溜まったメッセージを取り出す
    pub fn take_messages(&mut self) -> Vec<String> {
        std::mem::take(&mut self.messages)
    }

    pub(crate) fn warn(&mut self, message: String) {
        warn!("{}", message);
        self.warnings.push(message);
    }

    pub(crate) fn message(&mut self, message: String) {
        info!("{}", message);
        self.messages.push(message);
    }

    pub(crate) fn bp(&self, id: BreakpointId) -> Option<&Breakpoint> {
        self.breakpoints.iter().find(|b| b.id == id)
    }

    pub(crate) fn bp_mut(&mut self, id: BreakpointId) -> Option<&mut Breakpoint> {
        self.breakpoints.iter_mut().find(|b| b.id == id)
    }

    /// ロケーションの所有者
    pub(crate) fn owner_of(&self, lid: LocationId) -> Option<&Breakpoint> {
        self.arena
            .get(lid)
            .and_then(|l| l.owner)
            .and_then(|id| self.bp(id))
    }

    pub(crate) fn notify(&mut self, id: BreakpointId, event: Notify) {
        let Some(bp) = self.breakpoints.iter().find(|b| b.id == id) else {
            return;
        };
        for observer in self.observers.iter_mut() {
            match event {
                Notify::Created => observer.breakpoint_created(bp),
                Notify::Modified => observer.breakpoint_modified(bp),
            }
        }
    }

    fn notify_deleted(&mut self, bp: &Breakpoint) {
        for observer in self.observers.iter_mut() {
            observer.breakpoint_deleted(bp);
        }
    }

    pub(crate) fn allocate_id(&mut self, internal: bool) -> BreakpointId {
        if internal {
            let id = BreakpointId(self.next_internal);
            self.next_internal -= 1;
            id
        } else {
            let id = BreakpointId(self.next_number);
            self.next_number += 1;
            id
        }
    }

    /// 作成に失敗したユーザー番号を返却する
    pub(crate) fn release_id(&mut self, id: BreakpointId) {
        if id.is_user() && id.0 + 1 == self.next_number {
            self.next_number -= 1;
        }
    }

    /// ターゲット側で条件式を評価するか
    pub(crate) fn target_side_conditions_active(&self) -> bool {
        self.target.supports_target_side_conditions()
            && self.settings.condition_evaluation != ConditionEvaluation::Host
    }

    /// ロケーションの条件式が変わったことを記録する
    pub(crate) fn mark_location_modified(&mut self, lid: LocationId, force: bool) {
        if !force && !self.target_side_conditions_active() {
            return;
        }
        if let Some(loc) = self.arena.get_mut(lid) {
            if loc.owner_kind.is_breakpoint() {
                loc.condition_changed = ConditionChange::Modified;
            }
        }
    }

    pub(crate) fn mark_breakpoint_modified(&mut self, id: BreakpointId) {
        let locs = match self.bp(id) {
            Some(bp) if bp.kind.is_breakpoint() => bp.locations.clone(),
            _ => return,
        };
        for lid in locs {
            self.mark_location_modified(lid, false);
        }
    }

    /// プログラム自体が `address` にトラップ命令を持っているか
    pub(crate) fn program_breakpoint_here(&self, address: u64) -> bool {
        match self.read_memory(address, TRAP_LEN) {
            Ok(bytes) => bytes == [TRAP_OPCODE],
            Err(_) => false,
        }
    }

    /// ブレークポイントにロケーションを追加する
    pub(crate) fn add_location(
        &mut self,
        id: BreakpointId,
        resolved: &ResolvedLocation,
        length: usize,
    ) -> Option<LocationId> {
        let (kind, catch) = {
            let bp = self.bp(id)?;
            (bp.kind, bp.catch_kind().cloned())
        };
        let aspace = self.aspace_of(resolved.pspace);
        let mut loc = Location::new(id, kind, resolved.address, resolved.pspace, aspace);
        loc.length = length;
        loc.function = resolved.function.clone();
        loc.line = resolved.line;
        loc.catch = catch;
        if loc.is_code() {
            loc.permanent = self.program_breakpoint_here(resolved.address);
        }
        let address = loc.address;
        let lid = self.arena.alloc(loc);
        self.mark_location_modified(lid, false);

        let arena = &self.arena;
        let bp = self.breakpoints.iter_mut().find(|b| b.id == id)?;
        let pos = bp
            .locations
            .partition_point(|l| arena.get(*l).map(|x| x.address <= address).unwrap_or(true));
        bp.locations.insert(pos, lid);
        Some(lid)
    }

    /// ブレークポイントのロケーションを全て所有者から外す
    pub(crate) fn detach_locations(&mut self, id: BreakpointId) {
        let locs = match self.bp_mut(id) {
            Some(bp) => std::mem::take(&mut bp.locations),
            None => return,
        };
        for lid in locs {
            if let Some(loc) = self.arena.get_mut(lid) {
                loc.owner = None;
            }
            self.registry.detached.push(lid);
        }
    }

    /// ハードウェアブレークポイントを `extra` 個増やせるか
    pub(crate) fn check_hw_breakpoint_capacity(
        &self,
        except: Option<BreakpointId>,
        extra: usize,
    ) -> Result<()> {
        let used = self.hw_breakpoints_excluding(except);
        let other = self.hw_watchpoint_use_all();
        match self
            .target
            .can_use_hw_watchpoint(HwKind::Breakpoint, used + extra, other)
        {
            HwCapability::Yes => Ok(()),
            HwCapability::Unsupported => Err(BreakpointError::HwUnsupported(
                "No hardware breakpoint support in the target.".to_string(),
            )),
            HwCapability::Exceeded => Err(BreakpointError::ResourceExhausted(
                "Hardware breakpoints used exceeds limit.".to_string(),
            )),
        }
    }

    /// コードブレークポイントを作成する
    ///
    /// 解決済みのロケーションがなければ保留中のブレークポイントになります
    /// （`pending` 設定が off ならエラー）。
    pub fn create_breakpoint(&mut self, req: BreakpointRequest) -> Result<BreakpointId> {
        self.create_with_data(req, KindData::None)
    }

    /// 種類固有のデータ付きでコードブレークポイントを作成する
    pub(crate) fn create_with_data(
        &mut self,
        req: BreakpointRequest,
        data: KindData,
    ) -> Result<BreakpointId> {
        if req.kind.is_watchpoint() || req.kind.is_catchpoint() {
            return Err(BreakpointError::BadLocation(format!(
                "Cannot create a {} without an expression or event.",
                req.kind
            )));
        }
        let restriction = restriction_for(req.thread, req.task, req.inferior)?;

        let mut req = req;
        if req.locations.is_empty() {
            if let (Some(spec), Some(resolver)) = (&req.location_spec, &self.resolver) {
                req.locations = resolver.resolve(spec, self.current_pspace);
            }
        }

        if req.locations.is_empty() {
            match (&req.location_spec, self.settings.pending) {
                (None, _) => {
                    return Err(BreakpointError::BadLocation(
                        "No location specified.".to_string(),
                    ))
                }
                (Some(spec), PendingMode::Off) => {
                    return Err(BreakpointError::BadLocation(format!(
                        "Function \"{}\" not defined.",
                        spec
                    )))
                }
                (Some(spec), _) => {
                    self.message(format!(
                        "Breakpoint on \"{}\" pending on future shared library load.",
                        spec
                    ));
                }
            }
        }

        if req.kind == BreakpointKind::HwBreakpoint && req.enabled {
            self.check_hw_breakpoint_capacity(None, req.locations.len().max(1))?;
        }

        // 強制しない限り、どのロケーションでもパースできない条件式は受け付けない
        if let Some(cond) = &req.condition {
            if !req.force_condition && !req.locations.is_empty() {
                let mut last_error = None;
                let any_valid = req.locations.iter().any(|rl| {
                    match parse_expression(cond, &*self.symbols, Some(rl.address)) {
                        Ok(_) => true,
                        Err(e) => {
                            last_error = Some(e);
                            false
                        }
                    }
                });
                if !any_valid {
                    if let Some(e) = last_error {
                        return Err(e.into());
                    }
                }
            }
        }

        let internal = req.kind.traits().internal;
        let id = self.allocate_id(internal);
        let pspace = req
            .locations
            .first()
            .map(|l| l.pspace)
            .unwrap_or(self.current_pspace);
        let mut bp = Breakpoint::new(id, req.kind, pspace);
        bp.enable_state = if req.enabled {
            EnableState::Enabled
        } else {
            EnableState::Disabled
        };
        bp.disposition = req.disposition;
        bp.ignore_count = req.ignore_count;
        bp.restriction = restriction;
        bp.frame = req.frame;
        bp.silent = req.silent;
        bp.location_spec = req.location_spec.clone();
        bp.cond_string = req.condition.clone();
        bp.data = data;
        self.breakpoints.push(bp);

        for resolved in &req.locations {
            self.add_location(id, resolved, req.length);
        }
        if let Some(cond) = &req.condition {
            self.apply_condition(id, cond);
        }

        debug!("Created {} {} with {} location(s)", req.kind, id, req.locations.len());
        self.notify(id, Notify::Created);
        self.update_global_location_list(InsertMode::MayInsert);
        Ok(id)
    }

    /// ブレークポイントを削除する
    pub fn delete_breakpoint(&mut self, id: BreakpointId) -> Result<()> {
        let (kind, related) = {
            let bp = self.bp(id).ok_or(BreakpointError::NotFound(id.0))?;
            (bp.kind, bp.related)
        };

        // ウォッチポイントとスコープブレークポイントは一緒に片付ける
        if let Some(rel) = related {
            if kind == BreakpointKind::WatchpointScope {
                self.watchpoint_del_at_next_stop(rel);
            } else if self.bp(rel).map(|b| b.kind) == Some(BreakpointKind::WatchpointScope) {
                self.watchpoint_del_at_next_stop(id);
            }
            if let Some(other) = self.bp_mut(rel) {
                if other.related == Some(id) {
                    other.related = None;
                }
            }
        }

        self.detach_locations(id);
        let Some(pos) = self.breakpoints.iter().position(|b| b.id == id) else {
            return Err(BreakpointError::NotFound(id.0));
        };
        let bp = self.breakpoints.remove(pos);
        debug!("Deleted {} {}", bp.kind, bp.id);
        self.notify_deleted(&bp);
        self.update_global_location_list(InsertMode::DontInsert);
        Ok(())
    }

    /// ブレークポイントを無効にする
    ///
    /// ウォッチポイントのスコープブレークポイントは無効にできません。
    pub fn disable(&mut self, id: BreakpointId) -> Result<()> {
        let bp = self.bp_mut(id).ok_or(BreakpointError::NotFound(id.0))?;
        if bp.kind == BreakpointKind::WatchpointScope {
            return Ok(());
        }
        bp.enable_state = EnableState::Disabled;
        self.mark_breakpoint_modified(id);
        self.update_global_location_list(InsertMode::DontInsert);
        self.notify(id, Notify::Modified);
        Ok(())
    }

    /// ブレークポイントを有効にする（処理方法はそのまま）
    pub fn enable(&mut self, id: BreakpointId) -> Result<()> {
        let disposition = self
            .bp(id)
            .map(|b| b.disposition)
            .ok_or(BreakpointError::NotFound(id.0))?;
        self.enable_with(id, disposition, 0)
    }

    /// 次の1回だけ停止する（停止後に無効になる）
    pub fn enable_once(&mut self, id: BreakpointId) -> Result<()> {
        self.enable_with(id, Disposition::Disable, 1)
    }

    /// `count` 回停止したら無効になる
    pub fn enable_count(&mut self, id: BreakpointId, count: u32) -> Result<()> {
        self.enable_with(id, Disposition::Disable, count)
    }

    /// 停止したら削除する
    pub fn enable_delete(&mut self, id: BreakpointId) -> Result<()> {
        self.enable_with(id, Disposition::Delete, 1)
    }

    fn enable_with(&mut self, id: BreakpointId, disposition: Disposition, count: u32) -> Result<()> {
        let (kind, orig_state, nlocs) = {
            let bp = self.bp(id).ok_or(BreakpointError::NotFound(id.0))?;
            (bp.kind, bp.enable_state, bp.locations.len())
        };

        if kind == BreakpointKind::HwBreakpoint {
            self.check_hw_breakpoint_capacity(Some(id), nlocs.max(1))?;
        }

        if kind.is_watchpoint() {
            if let Some(bp) = self.bp_mut(id) {
                bp.enable_state = EnableState::Enabled;
            }
            if let Err(e) = self.update_watchpoint(id, true) {
                if let Some(bp) = self.bp_mut(id) {
                    bp.enable_state = orig_state;
                }
                return Err(BreakpointError::Watchpoint(format!(
                    "Cannot enable watchpoint {}: {}",
                    id, e
                )));
            }
        }

        if let Some(bp) = self.bp_mut(id) {
            bp.disposition = disposition;
            bp.enable_count = count;
            bp.enable_state = EnableState::Enabled;
        }
        self.mark_breakpoint_modified(id);
        self.update_global_location_list(InsertMode::MayInsert);
        self.notify(id, Notify::Modified);
        Ok(())
    }

    fn location_index(&self, id: BreakpointId, index: usize) -> Result<LocationId> {
        let bp = self.bp(id).ok_or(BreakpointError::NotFound(id.0))?;
        index
            .checked_sub(1)
            .and_then(|i| bp.locations.get(i))
            .copied()
            .ok_or_else(|| {
                BreakpointError::BadLocation(format!("Bad breakpoint location number '{}'", index))
            })
    }

    /// ロケーションを有効にする（番号は1から）
    pub fn enable_location(&mut self, id: BreakpointId, index: usize) -> Result<()> {
        let lid = self.location_index(id, index)?;
        if self.arena.get(lid).map(|l| l.disabled_by_cond).unwrap_or(false) {
            return Err(BreakpointError::BadLocation(format!(
                "Breakpoint {}'s condition is invalid at location {}, cannot enable.",
                id, index
            )));
        }
        self.set_location_enabled(id, lid, true, InsertMode::MayInsert);
        Ok(())
    }

    /// ロケーションを無効にする（番号は1から）
    pub fn disable_location(&mut self, id: BreakpointId, index: usize) -> Result<()> {
        let lid = self.location_index(id, index)?;
        self.set_location_enabled(id, lid, false, InsertMode::DontInsert);
        Ok(())
    }

    fn set_location_enabled(
        &mut self,
        id: BreakpointId,
        lid: LocationId,
        enabled: bool,
        mode: InsertMode,
    ) {
        if let Some(loc) = self.arena.get_mut(lid) {
            if loc.enabled == enabled {
                return;
            }
            loc.enabled = enabled;
        }
        self.mark_location_modified(lid, false);
        self.update_global_location_list(mode);
        self.notify(id, Notify::Modified);
    }

    /// 次の `count` 回のヒットを無視する
    pub fn set_ignore_count(&mut self, id: BreakpointId, count: u32) -> Result<()> {
        let bp = self.bp_mut(id).ok_or(BreakpointError::NotFound(id.0))?;
        bp.ignore_count = count;
        let message = match count {
            0 => format!("Will stop next time breakpoint {} is reached.", id),
            1 => format!("Will ignore next crossing of breakpoint {}.", id),
            n => format!("Will ignore next {} crossings of breakpoint {}.", n, id),
        };
        self.message(message);
        self.notify(id, Notify::Modified);
        Ok(())
    }

    /// 1つのロケーションに条件式を設定する。パースできたかを返す
    fn set_location_condition(&mut self, lid: LocationId, number: i32, index: usize, text: &str) -> bool {
        let Some(address) = self.arena.get(lid).map(|l| l.address) else {
            return false;
        };
        let parsed = parse_expression(text, &*self.symbols, Some(address));
        let Some(loc) = self.arena.get_mut(lid) else {
            return false;
        };
        match parsed {
            Ok(expr) => {
                loc.cond = Some(expr);
                loc.cond_bytecode = None;
                let revived = loc.disabled_by_cond && loc.enabled;
                loc.disabled_by_cond = false;
                if revived {
                    self.message(format!(
                        "Breakpoint {}'s condition is now valid at location {}, enabling.",
                        number, index
                    ));
                }
                true
            }
            Err(e) => {
                loc.cond = None;
                loc.cond_bytecode = None;
                let was_enabled = loc.enabled && !loc.disabled_by_cond;
                loc.disabled_by_cond = true;
                if was_enabled {
                    self.warn(format!(
                        "failed to validate condition at location {}.{}, disabling:\n  {}",
                        number, index, e
                    ));
                }
                false
            }
        }
    }

    /// 全ロケーションに条件式を設定する
    pub(crate) fn apply_condition(&mut self, id: BreakpointId, text: &str) {
        let locs = match self.bp(id) {
            Some(bp) => bp.locations.clone(),
            None => return,
        };
        for (i, lid) in locs.into_iter().enumerate() {
            self.set_location_condition(lid, id.0, i + 1, text);
        }
    }

    /// 条件式を設定・解除する
    ///
    /// `force` でなければ、少なくとも1つのロケーションでパースできない条件式は拒否します。
    /// パースできないロケーションは無効になります。
    pub fn set_condition(&mut self, id: BreakpointId, text: Option<&str>, force: bool) -> Result<()> {
        let (kind, locs, scope_pc) = {
            let bp = self.bp(id).ok_or(BreakpointError::NotFound(id.0))?;
            (
                bp.kind,
                bp.locations.clone(),
                bp.watch().and_then(|w| w.scope_pc),
            )
        };
        let text = text.map(str::trim).filter(|t| !t.is_empty());

        match text {
            None => {
                if let Some(bp) = self.bp_mut(id) {
                    bp.cond_string = None;
                    if let Some(w) = bp.watch_mut() {
                        w.cond_expr = None;
                    }
                }
                for (i, lid) in locs.iter().enumerate() {
                    let Some(loc) = self.arena.get_mut(*lid) else {
                        continue;
                    };
                    loc.cond = None;
                    loc.cond_bytecode = None;
                    let revived = loc.disabled_by_cond && loc.enabled;
                    loc.disabled_by_cond = false;
                    if revived {
                        self.message(format!(
                            "Breakpoint {}'s condition is now valid at location {}, enabling.",
                            id,
                            i + 1
                        ));
                    }
                }
                self.message(format!("Breakpoint {} now unconditional.", id));
            }
            Some(text) if kind.is_watchpoint() => {
                let expr = parse_expression(text, &*self.symbols, scope_pc)?;
                if let Some(bp) = self.bp_mut(id) {
                    bp.cond_string = Some(text.to_string());
                    if let Some(w) = bp.watch_mut() {
                        w.cond_expr = Some(expr);
                    }
                }
            }
            Some(text) => {
                if !force && !locs.is_empty() {
                    let mut last_error = None;
                    for lid in &locs {
                        let Some(address) = self.arena.get(*lid).map(|l| l.address) else {
                            continue;
                        };
                        match parse_expression(text, &*self.symbols, Some(address)) {
                            Ok(_) => {
                                last_error = None;
                                break;
                            }
                            Err(e) => last_error = Some(e),
                        }
                    }
                    if let Some(e) = last_error {
                        return Err(e.into());
                    }
                }
                if let Some(bp) = self.bp_mut(id) {
                    bp.cond_string = Some(text.to_string());
                }
                self.apply_condition(id, text);
            }
        }

        self.mark_breakpoint_modified(id);
        self.notify(id, Notify::Modified);
        if kind.is_breakpoint() {
            self.update_global_location_list(InsertMode::MayInsert);
        }
        Ok(())
    }

    /// 内部用のブレークポイントを設定する
    pub fn set_internal_breakpoint(
        &mut self,
        kind: BreakpointKind,
        address: u64,
    ) -> Result<BreakpointId> {
        self.create_breakpoint(BreakpointRequest::new(kind).at(address))
    }

    /// 特定のスレッド・フレームでだけ止まる一時的なブレークポイントを設定する
    pub fn set_momentary_breakpoint(
        &mut self,
        kind: BreakpointKind,
        address: u64,
        frame: Option<tomari_target::FrameId>,
        thread: Option<ThreadId>,
    ) -> Result<BreakpointId> {
        let mut req = BreakpointRequest::new(kind).at(address);
        req.frame = frame;
        req.thread = thread;
        req.disposition = Disposition::Delete;
        self.create_breakpoint(req)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tomari_target::SimTarget;

    fn debugger() -> Debugger<SimTarget> {
        let mut target = SimTarget::new();
        target.map(0x401000, &[0x90; 0x100]);
        Debugger::new(target)
    }

    #[test]
    fn test_numbering() {
        let mut dbg = debugger();
        let a = dbg
            .create_breakpoint(BreakpointRequest::new(BreakpointKind::Breakpoint).at(0x401000))
            .unwrap();
        let internal = dbg
            .set_internal_breakpoint(BreakpointKind::LongjmpMaster, 0x401010)
            .unwrap();
        let b = dbg
            .create_breakpoint(BreakpointRequest::new(BreakpointKind::Breakpoint).at(0x401020))
            .unwrap();
        assert_eq!(a, BreakpointId(1));
        assert_eq!(b, BreakpointId(2));
        assert_eq!(internal, BreakpointId(-1));
    }

    #[test]
    fn test_restriction_conflict() {
        let mut dbg = debugger();
        let err = dbg
            .create_breakpoint(
                BreakpointRequest::new(BreakpointKind::Breakpoint)
                    .at(0x401000)
                    .thread(1)
                    .task(2),
            )
            .unwrap_err();
        assert!(matches!(err, BreakpointError::RestrictionConflict(_)));
        assert_eq!(dbg.breakpoints().count(), 0);
    }

    #[test]
    fn test_pending_breakpoint() {
        let mut dbg = debugger();
        let id = dbg
            .create_breakpoint(BreakpointRequest::new(BreakpointKind::Breakpoint).spec("foo"))
            .unwrap();
        assert!(dbg.breakpoint(id).unwrap().is_pending());

        dbg.set_setting("pending", "off").unwrap();
        let err = dbg
            .create_breakpoint(BreakpointRequest::new(BreakpointKind::Breakpoint).spec("bar"))
            .unwrap_err();
        assert_eq!(err.to_string(), "Function \"bar\" not defined.");
    }

    #[test]
    fn test_locations_sorted_by_address() {
        let mut dbg = debugger();
        let id = dbg
            .create_breakpoint(
                BreakpointRequest::new(BreakpointKind::Breakpoint)
                    .at(0x401030)
                    .at(0x401010),
            )
            .unwrap();
        let addrs: Vec<u64> = dbg.locations_of(id).iter().map(|l| l.address).collect();
        assert_eq!(addrs, vec![0x401010, 0x401030]);
    }

    #[test]
    fn test_ignore_count_message() {
        let mut dbg = debugger();
        let id = dbg
            .create_breakpoint(BreakpointRequest::new(BreakpointKind::Breakpoint).at(0x401000))
            .unwrap();
        dbg.set_ignore_count(id, 2).unwrap();
        assert_eq!(
            dbg.take_messages(),
            vec!["Will ignore next 2 crossings of breakpoint 1.".to_string()]
        );
        assert!(matches!(
            dbg.set_ignore_count(BreakpointId(9), 1),
            Err(BreakpointError::NotFound(9))
        ));
    }

    #[test]
    fn test_permanent_location() {
        let mut target = SimTarget::new();
        target.map(0x401000, &[0x90, 0xCC, 0x90]);
        let mut dbg = Debugger::new(target);
        let id = dbg
            .create_breakpoint(BreakpointRequest::new(BreakpointKind::Breakpoint).at(0x401001))
            .unwrap();
        assert!(dbg.locations_of(id)[0].permanent);
    }
}
