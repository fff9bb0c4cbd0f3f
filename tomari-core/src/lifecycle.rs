//! 共有ライブラリ・スレッド・プロセスのイベントとセッションの状態
//!
//! ライブラリのロードではロケーションを再解決し、アンロードではそのライブラリの
//! ロケーションを一時的に無効にします。スレッドやインフェリアがなくなったら、
//! それに限定したブレークポイントを削除します。

use crate::breakpoint::{
    Breakpoint, BreakpointId, BreakpointRequest, Disposition, DprintfData, KindData,
    ResolvedLocation, Restriction, WatchState,
};
use crate::debugger::{Debugger, Notify, StepOver};
use crate::errors::{BreakpointError, Result};
use crate::insert::InsertMode;
use crate::kind::BreakpointKind;
use crate::pspace::{AddressSpaceId, Library, ProgramSpaceId};
use regex::Regex;
use tomari_target::{CatchKind, InferiorId, Target, ThreadId};
use tracing::debug;

/// プロセスと一緒に消える一時的なブレークポイントか
fn dies_with_process(kind: BreakpointKind) -> bool {
    use BreakpointKind::*;
    matches!(
        kind,
        SingleStep
            | Until
            | Finish
            | Longjmp
            | LongjmpResume
            | LongjmpCallDummy
            | Exception
            | ExceptionResume
            | StepResume
            | HpStepResume
            | WatchpointScope
            | CallDummy
            | StdTerminate
            | ShlibEvent
            | GnuIfuncResolverReturn
    )
}

impl<T: Target> Debugger<T> {
    /// 共有ライブラリがロードされた
    ///
    /// 場所の指定を持つブレークポイントを再解決し、保留中のものはここで解決されます。
    /// アドレスで指定されたロケーションは、ライブラリの範囲内なら無効を解除します。
    pub fn on_library_loaded(&mut self, pspace: ProgramSpaceId, library: Library) {
        debug!(
            "Library {} loaded at 0x{:x}..0x{:x}",
            library.name, library.start, library.end
        );
        let range = (library.start, library.end);
        if let Some(ps) = self.pspaces.iter_mut().find(|p| p.id == pspace) {
            ps.libraries.push(library);
        }

        let specs: Vec<(BreakpointId, Option<String>)> = self
            .breakpoints
            .iter()
            .filter(|b| b.pspace == pspace)
            .map(|b| (b.id, b.location_spec.clone()))
            .collect();

        let mut changed = Vec::new();
        for (id, spec) in specs {
            match spec {
                Some(spec) => {
                    let resolved = match &self.resolver {
                        Some(resolver) => resolver.resolve(&spec, pspace),
                        None => continue,
                    };
                    if !resolved.is_empty() && self.re_set_locations(id, &resolved) {
                        changed.push(id);
                    }
                }
                None => {
                    let locs = self.bp(id).map(|b| b.locations.clone()).unwrap_or_default();
                    let mut revived = false;
                    for lid in locs {
                        if let Some(loc) = self.arena.get_mut(lid) {
                            if loc.shlib_disabled && loc.address >= range.0 && loc.address < range.1
                            {
                                loc.shlib_disabled = false;
                                revived = true;
                            }
                        }
                    }
                    if revived {
                        changed.push(id);
                    }
                }
            }
        }

        for id in changed {
            self.notify(id, Notify::Modified);
        }
        self.update_global_location_list(InsertMode::MayInsert);
    }

    /// ブレークポイントのロケーションを解決結果で置き換える。変わったかを返す
    ///
    /// 同じアドレスのロケーションの有効状態は引き継ぎ、条件式はパースし直します。
    fn re_set_locations(&mut self, id: BreakpointId, resolved: &[ResolvedLocation]) -> bool {
        let Some(bp) = self.bp(id) else {
            return false;
        };
        let cond = bp.cond_string.clone();
        let old: Vec<(u64, bool, bool, usize)> = bp
            .locations
            .iter()
            .filter_map(|l| self.arena.get(*l))
            .map(|l| (l.address, l.enabled, l.shlib_disabled, l.length))
            .collect();

        let mut old_addrs: Vec<u64> = old.iter().map(|o| o.0).collect();
        let mut new_addrs: Vec<u64> = resolved.iter().map(|r| r.address).collect();
        old_addrs.sort_unstable();
        new_addrs.sort_unstable();
        if old_addrs == new_addrs && old.iter().all(|o| !o.2) {
            return false;
        }

        let length = old.first().map(|o| o.3).unwrap_or(0);
        let was_pending = old.is_empty();
        self.detach_locations(id);
        for r in resolved {
            let Some(lid) = self.add_location(id, r, length) else {
                continue;
            };
            if let Some((_, enabled, _, _)) = old.iter().find(|o| o.0 == r.address) {
                if let Some(loc) = self.arena.get_mut(lid) {
                    loc.enabled = *enabled;
                }
            }
        }
        if let Some(cond) = cond {
            self.apply_condition(id, &cond);
        }
        if was_pending {
            debug!("Pending breakpoint {} resolved to {} location(s)", id, resolved.len());
        }
        true
    }

    /// 共有ライブラリがアンロードされた
    ///
    /// ライブラリ内のコードブレークポイントとトレースポイントのロケーションを
    /// 無効にします。トラップはライブラリと一緒に消えているので削除はしません。
    pub fn on_library_unloaded(&mut self, pspace: ProgramSpaceId, name: &str) {
        let Some(library) = self
            .program_space(pspace)
            .and_then(|p| p.libraries.iter().find(|l| l.name == name))
            .cloned()
        else {
            debug!("Unknown library {} unloaded", name);
            return;
        };

        let mut warned = false;
        let mut changed = Vec::new();
        for lid in self.registry.global.clone() {
            let Some(owner) = self.owner_of(lid).map(|b| (b.id, b.kind)) else {
                continue;
            };
            let Some(loc) = self.arena.get_mut(lid) else {
                continue;
            };
            let eligible = (matches!(
                owner.1,
                BreakpointKind::Breakpoint | BreakpointKind::HwBreakpoint | BreakpointKind::JitEvent
            ) && loc.is_code())
                || owner.1.is_tracepoint();
            if loc.pspace != pspace
                || loc.shlib_disabled
                || !eligible
                || !library.contains(loc.address)
            {
                continue;
            }
            loc.shlib_disabled = true;
            loc.inserted = false;
            if !warned {
                self.warn(format!(
                    "Temporarily disabling breakpoints for unloaded shared library \"{}\"",
                    name
                ));
                warned = true;
            }
            if !changed.contains(&owner.0) {
                changed.push(owner.0);
            }
        }

        for id in changed {
            self.notify(id, Notify::Modified);
        }
        if let Some(ps) = self.pspaces.iter_mut().find(|p| p.id == pspace) {
            ps.libraries.retain(|l| l.name != name);
        }
    }

    /// スレッドが終了した
    pub fn on_thread_exited(&mut self, thread: ThreadId) {
        let doomed: Vec<BreakpointId> = self
            .breakpoints
            .iter()
            .filter(|b| b.id.is_user() && b.restriction == Restriction::Thread(thread))
            .map(|b| b.id)
            .collect();
        for id in doomed {
            self.message(format!(
                "Thread-specific breakpoint {} deleted - thread {} no longer in the thread list.",
                id, thread
            ));
            if let Err(e) = self.delete_breakpoint(id) {
                debug!("Failed to delete breakpoint {}: {}", id, e);
            }
        }
        if self.step_over.map(|s| s.thread) == Some(thread) {
            self.step_over = None;
        }
    }

    /// インフェリアが取り除かれた
    pub fn on_inferior_removed(&mut self, inferior: InferiorId) {
        let doomed: Vec<BreakpointId> = self
            .breakpoints
            .iter()
            .filter(|b| b.id.is_user() && b.restriction == Restriction::Inferior(inferior))
            .map(|b| b.id)
            .collect();
        for id in doomed {
            self.message(format!(
                "Inferior-specific breakpoint {} deleted - inferior {} has been removed.",
                id, inferior
            ));
            if let Err(e) = self.delete_breakpoint(id) {
                debug!("Failed to delete breakpoint {}: {}", id, e);
            }
        }
    }

    /// プロセスが終了した、または新しいターゲットに接続したときに状態を戻す
    ///
    /// トラップはプロセスと一緒に消えているのでターゲットには何も送りません。
    /// 一時的な内部ブレークポイントとローカル変数のウォッチポイントは削除し、
    /// 他のウォッチポイントは次の実行で値を読み直します。
    pub fn reset(&mut self) {
        for lid in self.registry.global.clone() {
            if let Some(loc) = self.arena.get_mut(lid) {
                loc.inserted = false;
                loc.duplicate = false;
            }
        }
        for lid in std::mem::take(&mut self.registry.moribund)
            .into_iter()
            .chain(std::mem::take(&mut self.registry.stuck))
        {
            self.arena.remove(lid);
        }
        self.step_over = None;
        self.stepping_past_watchpoint = false;
        self.threads_executing = false;

        let doomed: Vec<BreakpointId> = self
            .breakpoints
            .iter()
            .filter(|b| {
                dies_with_process(b.kind)
                    || b.disposition == Disposition::DeleteAtNextStop
                    || b.watch().map(|w| w.frame.is_some()).unwrap_or(false)
            })
            .map(|b| b.id)
            .collect();
        for id in doomed {
            if self.bp(id).is_none() {
                continue;
            }
            if let Err(e) = self.delete_breakpoint(id) {
                debug!("Failed to delete breakpoint {}: {}", id, e);
            }
        }

        let watchpoints: Vec<BreakpointId> = self
            .breakpoints
            .iter()
            .filter(|b| b.kind.is_watchpoint())
            .map(|b| b.id)
            .collect();
        for id in watchpoints {
            self.detach_locations(id);
            if let Some(w) = self.bp_mut(id).and_then(|b| b.watch_mut()) {
                w.value = None;
                w.value_valid = false;
                w.state = WatchState::Unevaluated;
            }
        }
        self.update_global_location_list(InsertMode::DontInsert);
    }

    /// ブレークポイントを踏み越え始める
    pub fn begin_step_over(&mut self, thread: ThreadId, aspace: AddressSpaceId, address: u64) {
        self.step_over = Some(StepOver {
            thread,
            aspace,
            address,
        });
    }

    pub fn end_step_over(&mut self) {
        self.step_over = None;
    }

    /// ウォッチポイントを踏み越えている間はハードウェアウォッチポイントを挿入しない
    pub fn set_stepping_past_watchpoint(&mut self, stepping: bool) {
        self.stepping_past_watchpoint = stepping;
    }

    /// キャッチポイントを作成する
    pub fn catch(&mut self, kind: CatchKind, temporary: bool) -> Result<BreakpointId> {
        if let CatchKind::Load(Some(pattern)) | CatchKind::Unload(Some(pattern)) = &kind {
            Regex::new(pattern)
                .map_err(|e| BreakpointError::BadLocation(format!("Invalid regexp: {}", e)))?;
        }

        let id = self.allocate_id(false);
        let pspace = self.current_pspace;
        let mut bp = Breakpoint::new(id, BreakpointKind::Catchpoint, pspace);
        if temporary {
            bp.disposition = Disposition::Delete;
        }
        bp.data = KindData::Catch(kind.clone());
        self.breakpoints.push(bp);
        self.add_location(id, &ResolvedLocation::new(0).in_pspace(pspace), 0);

        self.notify(id, Notify::Created);
        self.message(format!("Catchpoint {} ({})", id, kind));
        self.update_global_location_list(InsertMode::MayInsert);
        Ok(id)
    }

    /// dprintf を作成する
    ///
    /// ヒットしても停止せず、書式化したメッセージを出力します。
    pub fn dprintf(
        &mut self,
        mut req: BreakpointRequest,
        format: &str,
        args: &[&str],
    ) -> Result<BreakpointId> {
        if format.is_empty() {
            return Err(BreakpointError::BadLocation(
                "Format string required".to_string(),
            ));
        }
        req.kind = BreakpointKind::Dprintf;
        let data = DprintfData {
            format: format.to_string(),
            args: args.iter().map(|a| a.trim().to_string()).collect(),
        };
        self.create_with_data(req, KindData::Dprintf(data))
    }
}
