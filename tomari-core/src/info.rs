//! ブレークポイント一覧（info breakpoints）

use crate::breakpoint::{Breakpoint, BreakpointId, Disposition, KindData, Restriction};
use crate::debugger::Debugger;
use crate::kind::BreakpointKind;
use crate::location::Location;
use std::fmt;
use tomari_target::Target;

/// 一覧の1ロケーション分
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocationInfo {
    /// `N.M` 形式の番号
    pub number: String,
    pub enabled: bool,
    /// 条件式が不正なため無効
    pub disabled_by_cond: bool,
    pub address: u64,
    pub function: Option<String>,
    pub inserted: bool,
    pub shlib_disabled: bool,
}

/// 一覧の1ブレークポイント分
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakpointInfo {
    pub id: BreakpointId,
    pub kind: BreakpointKind,
    pub disposition: Disposition,
    pub enabled: bool,
    /// ウォッチ式、キャッチするイベント、保留中の場所の指定など
    pub what: String,
    pub condition: Option<String>,
    pub restriction: Restriction,
    pub hit_count: u32,
    pub ignore_count: u32,
    pub locations: Vec<LocationInfo>,
}

impl BreakpointInfo {
    fn from_breakpoint<'a>(bp: &Breakpoint, locs: impl Iterator<Item = &'a Location>) -> Self {
        let what = match &bp.data {
            KindData::Watch(w) => w.expr_text.clone(),
            KindData::Catch(c) => c.to_string(),
            KindData::Dprintf(d) => {
                let mut s = format!("\"{}\"", d.format);
                for arg in &d.args {
                    s.push(',');
                    s.push_str(arg);
                }
                s
            }
            KindData::None => bp.location_spec.clone().unwrap_or_default(),
        };
        let locations = if bp.kind.is_watchpoint() || bp.kind.is_catchpoint() {
            Vec::new()
        } else {
            locs.enumerate()
                .map(|(i, loc)| LocationInfo {
                    number: format!("{}.{}", bp.id, i + 1),
                    enabled: loc.enabled,
                    disabled_by_cond: loc.disabled_by_cond,
                    address: loc.address,
                    function: loc.function.clone(),
                    inserted: loc.inserted,
                    shlib_disabled: loc.shlib_disabled,
                })
                .collect()
        };
        Self {
            id: bp.id,
            kind: bp.kind,
            disposition: bp.disposition,
            enabled: bp.is_enabled(),
            what,
            condition: bp.cond_string.clone(),
            restriction: bp.restriction,
            hit_count: bp.hit_count,
            ignore_count: bp.ignore_count,
            locations,
        }
    }

    /// ロケーションを持てる種類なのにまだ解決されていない
    pub fn is_pending(&self) -> bool {
        !self.kind.is_watchpoint() && !self.kind.is_catchpoint() && self.locations.is_empty()
    }
}

fn yes_no(enabled: bool) -> &'static str {
    if enabled {
        "y"
    } else {
        "n"
    }
}

fn location_what(loc: &LocationInfo) -> String {
    let mut what = match &loc.function {
        Some(f) => format!("in {}", f),
        None => String::new(),
    };
    if loc.shlib_disabled {
        if !what.is_empty() {
            what.push(' ');
        }
        what.push_str("<shlib unloaded>");
    }
    what
}

impl fmt::Display for BreakpointInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:<7} {:<14} {:<4} {:<3} ",
            self.id.to_string(),
            self.kind.to_string(),
            self.disposition.short_name(),
            yes_no(self.enabled)
        )?;
        match self.locations.as_slice() {
            [] if self.is_pending() => write!(f, "{:<18} {}", "<PENDING>", self.what)?,
            [] => write!(f, "{:<18} {}", "", self.what)?,
            [loc] => write!(f, "0x{:016x} {}", loc.address, location_what(loc))?,
            _ => write!(f, "{:<18} {}", "<MULTIPLE>", self.what)?,
        }

        match self.restriction {
            Restriction::Any => {}
            Restriction::Thread(t) => write!(f, "\n\tstop only in thread {}", t)?,
            Restriction::Task(t) => write!(f, "\n\tstop only in task {}", t)?,
            Restriction::Inferior(i) => write!(f, "\n\tstop only in inferior {}", i)?,
        }
        if let Some(cond) = &self.condition {
            write!(f, "\n\tstop only if {}", cond)?;
        }
        match self.hit_count {
            0 => {}
            1 => write!(f, "\n\tbreakpoint already hit 1 time")?,
            n => write!(f, "\n\tbreakpoint already hit {} times", n)?,
        }
        if self.ignore_count > 0 {
            write!(
                f,
                "\n\tWill ignore next {} crossings of breakpoint.",
                self.ignore_count
            )?;
        }

        if self.locations.len() > 1 {
            for loc in &self.locations {
                let enb = if loc.disabled_by_cond {
                    "N*"
                } else {
                    yes_no(loc.enabled)
                };
                write!(
                    f,
                    "\n{:<7} {:<14} {:<4} {:<3} 0x{:016x} {}",
                    loc.number,
                    "",
                    "",
                    enb,
                    loc.address,
                    location_what(loc)
                )?;
            }
        }
        Ok(())
    }
}

/// 一覧を表にする
pub fn render_breakpoint_table(infos: &[BreakpointInfo]) -> String {
    if infos.is_empty() {
        return "No breakpoints or watchpoints.".to_string();
    }
    let mut out = format!(
        "{:<7} {:<14} {:<4} {:<3} {:<18} {}",
        "Num", "Type", "Disp", "Enb", "Address", "What"
    );
    for info in infos {
        out.push('\n');
        out.push_str(&info.to_string());
    }
    out
}

impl<T: Target> Debugger<T> {
    /// ブレークポイントの一覧（`include_internal` なら内部用も含める）
    pub fn info_breakpoints(&self, include_internal: bool) -> Vec<BreakpointInfo> {
        self.breakpoints
            .iter()
            .filter(|b| include_internal || b.id.is_user())
            .map(|b| {
                BreakpointInfo::from_breakpoint(
                    b,
                    b.locations.iter().filter_map(|l| self.arena.get(*l)),
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breakpoint::{BreakpointRequest, ResolvedLocation, WatchRequest};
    use tomari_expr::{Symbol, SymbolTable};
    use tomari_target::{CatchKind, SimTarget, WatchKind};

    fn debugger() -> Debugger<SimTarget> {
        let mut target = SimTarget::new();
        target.map(0x401000, &[0x90; 0x100]);
        target.map(0x601000, &[0; 0x10]);
        let mut symbols = SymbolTable::new();
        symbols.add(Symbol::global("counter", 0x601000, 4));
        let mut dbg = Debugger::new(target);
        dbg.set_symbols(Box::new(symbols));
        dbg
    }

    #[test]
    fn test_empty_table() {
        let dbg = debugger();
        assert_eq!(
            render_breakpoint_table(&dbg.info_breakpoints(false)),
            "No breakpoints or watchpoints."
        );
    }

    #[test]
    fn test_single_location() {
        let mut dbg = debugger();
        dbg.create_breakpoint(
            BreakpointRequest::new(BreakpointKind::Breakpoint)
                .location(ResolvedLocation::new(0x401000).function("main"))
                .condition("counter == 3")
                .ignore_count(2),
        )
        .unwrap();

        let infos = dbg.info_breakpoints(false);
        assert_eq!(infos.len(), 1);
        assert_eq!(
            infos[0].to_string(),
            "1       breakpoint     keep y   0x0000000000401000 in main\n\
             \tstop only if counter == 3\n\
             \tWill ignore next 2 crossings of breakpoint."
        );
    }

    #[test]
    fn test_multiple_locations() {
        let mut dbg = debugger();
        let id = dbg
            .create_breakpoint(
                BreakpointRequest::new(BreakpointKind::Breakpoint)
                    .at(0x401000)
                    .at(0x401040),
            )
            .unwrap();
        dbg.disable_location(id, 2).unwrap();

        let info = &dbg.info_breakpoints(false)[0];
        assert_eq!(info.locations.len(), 2);
        assert_eq!(info.locations[1].number, "1.2");
        assert!(!info.locations[1].enabled);
        let text = info.to_string();
        assert!(text.contains("<MULTIPLE>"));
        assert!(text.contains("\n1.2"));
    }

    #[test]
    fn test_other_kinds() {
        let mut dbg = debugger();
        dbg.watch(WatchRequest::new("counter", WatchKind::Write)).unwrap();
        dbg.catch(CatchKind::Fork, true).unwrap();
        dbg.create_breakpoint(BreakpointRequest::new(BreakpointKind::Breakpoint).spec("later"))
            .unwrap();
        dbg.set_internal_breakpoint(BreakpointKind::LongjmpMaster, 0x401080)
            .unwrap();

        let infos = dbg.info_breakpoints(false);
        assert_eq!(infos.len(), 3);
        assert_eq!(infos[0].what, "counter");
        assert_eq!(infos[1].what, "fork");
        assert_eq!(infos[1].disposition, Disposition::Delete);
        assert!(infos[2].is_pending());
        assert!(infos[2].to_string().contains("<PENDING>"));

        assert_eq!(dbg.info_breakpoints(true).len(), 4);
    }
}
