//! 停止判定とウォッチポイントのテスト

use tomari_core::{
    BreakpointError, BreakpointKind, BreakpointRequest, Debugger, MainAction, ProgramSpaceId,
    StopReason, WatchKind, WatchRequest,
};
use tomari_expr::{Symbol, SymbolTable};
use tomari_target::{SimCapabilities, SimTarget};

const ADDR: u64 = 0x401020;
const COUNTER: u64 = 0x601000;
const PTR: u64 = 0x601010;
const BUFFER: u64 = 0x601020;
const PSPACE: ProgramSpaceId = ProgramSpaceId::INITIAL;

fn debugger(caps: SimCapabilities) -> Debugger<SimTarget> {
    let mut target = SimTarget::with_caps(caps);
    target.map(0x401000, &[0x90; 0x200]);
    target.map(0x601000, &[0; 0x100]);
    target.poke(PTR, &COUNTER.to_le_bytes());

    let mut symbols = SymbolTable::new();
    symbols.add(Symbol::global("counter", COUNTER, 4));
    symbols.add(Symbol::global("ptr", PTR, 8));
    symbols.add(Symbol::global("buffer", BUFFER, 32));

    let mut dbg = Debugger::new(target);
    dbg.set_symbols(Box::new(symbols));
    dbg.set_setting("always-inserted", "on")
        .expect("Failed to enable always-inserted");
    dbg
}

#[test]
fn test_ignore_count_scenario() {
    let mut dbg = debugger(SimCapabilities::default());
    let id = dbg
        .create_breakpoint(
            BreakpointRequest::new(BreakpointKind::Breakpoint)
                .at(ADDR)
                .ignore_count(2),
        )
        .expect("Failed to create breakpoint");

    let mut stops = Vec::new();
    for _ in 0..3 {
        let reason = dbg.target_mut().hit(ADDR).expect("Trap should be inserted");
        stops.push(dbg.on_target_stop(ADDR, PSPACE, reason).stop);
    }
    assert_eq!(stops, vec![false, false, true]);

    let bp = dbg.breakpoint(id).expect("Breakpoint should exist");
    assert_eq!(bp.hit_count, 3);
    assert_eq!(bp.ignore_count, 0);
}

#[test]
fn test_ignore_count_holds_for_any_count() {
    for n in 0..5u32 {
        let mut dbg = debugger(SimCapabilities::default());
        let id = dbg
            .create_breakpoint(
                BreakpointRequest::new(BreakpointKind::Breakpoint)
                    .at(ADDR)
                    .ignore_count(n),
            )
            .expect("Failed to create breakpoint");

        for _ in 0..n {
            let verdict = dbg.on_target_stop(ADDR, PSPACE, StopReason::Breakpoint);
            assert!(!verdict.stop);
            assert_eq!(verdict.action, MainAction::Single);
        }
        let verdict = dbg.on_target_stop(ADDR, PSPACE, StopReason::Breakpoint);
        assert!(verdict.stop);
        assert_eq!(dbg.breakpoint(id).map(|b| b.hit_count).ok(), Some(n + 1));
    }
}

#[test]
fn test_invalid_condition_disables_location() {
    let mut dbg = debugger(SimCapabilities::default());
    let id = dbg
        .create_breakpoint(BreakpointRequest::new(BreakpointKind::Breakpoint).at(ADDR))
        .expect("Failed to create breakpoint");

    // 強制しなければ拒否され、何も変わらない
    let err = dbg.set_condition(id, Some("no_such_symbol == 1"), false);
    assert!(matches!(err, Err(BreakpointError::ConditionParse(_))));
    assert!(!dbg.locations_of(id)[0].disabled_by_cond);

    dbg.set_condition(id, Some("no_such_symbol == 1"), true)
        .expect("Forced condition should be accepted");
    let loc = dbg.locations_of(id)[0];
    assert!(loc.disabled_by_cond);
    assert!(!loc.inserted);
    assert!(dbg.breakpoint(id).is_ok());
    assert!(!dbg.target().sw_inserted_at(ADDR));

    // 条件を外すと有効に戻る
    dbg.set_condition(id, None, false)
        .expect("Failed to clear condition");
    assert!(!dbg.locations_of(id)[0].disabled_by_cond);
    assert!(dbg.target().sw_inserted_at(ADDR));
}

#[test]
fn test_aggregate_watch_detects_field_change() {
    let mut dbg = debugger(SimCapabilities::default());
    let id = dbg
        .watch(WatchRequest::new("buffer", WatchKind::Write))
        .expect("Failed to watch buffer");
    assert_eq!(
        dbg.breakpoint(id).map(|b| b.kind).ok(),
        Some(BreakpointKind::Watchpoint)
    );
    assert!(dbg.should_step());

    // 変化がなければ止まらない
    let verdict = dbg.on_target_stop(0x401000, PSPACE, StopReason::Step);
    assert!(!verdict.stop);

    // 同じ領域の途中の1バイトだけを書き換える
    dbg.target_mut().poke(BUFFER + 20, &[5]);
    let verdict = dbg.on_target_stop(0x401004, PSPACE, StopReason::Step);
    assert!(verdict.stop);
    assert_eq!(verdict.report[0], "Watchpoint 1: buffer");
    let old = verdict
        .report
        .iter()
        .find(|l| l.starts_with("Old value = "))
        .expect("Old value line");
    let new = verdict
        .report
        .iter()
        .find(|l| l.starts_with("New value = "))
        .expect("New value line");
    assert_ne!(old[12..], new[12..]);

    let node = &verdict.record.nodes[0];
    assert!(node.changed);
    let (old, new) = (
        node.old_value.as_ref().expect("old value"),
        node.new_value.as_ref().expect("new value"),
    );
    assert_eq!(old.memory_range(), new.memory_range());
    assert!(!old.contents_eq(new));
}

#[test]
fn test_hardware_watchpoint_downgrade_warns_once() {
    let caps = SimCapabilities {
        debug_registers: Some(1),
        ..Default::default()
    };
    let mut dbg = debugger(caps);
    dbg.watch(WatchRequest::new("counter", WatchKind::Write))
        .expect("Failed to watch counter");
    let second = dbg
        .watch(WatchRequest::new("ptr", WatchKind::Write))
        .expect("Failed to watch ptr");

    assert_eq!(
        dbg.breakpoint(second).map(|b| b.kind).ok(),
        Some(BreakpointKind::Watchpoint)
    );
    assert_eq!(
        dbg.take_warnings(),
        vec!["Watchpoint 2 downgraded to software watchpoint".to_string()]
    );

    dbg.insert_breakpoints().expect("Failed to insert breakpoints");
    dbg.insert_breakpoints().expect("Failed to insert breakpoints");
    assert!(dbg.take_warnings().is_empty());
    assert_eq!(dbg.target().watchpoints().len(), 1);
}

#[test]
fn test_hardware_watchpoint_hit_through_target() {
    let mut dbg = debugger(SimCapabilities::default());
    let id = dbg
        .watch(WatchRequest::new("counter", WatchKind::Write))
        .expect("Failed to watch counter");

    let reason = dbg
        .target_mut()
        .write_watched(COUNTER, &[9, 0, 0, 0])
        .expect("Write should trigger the watchpoint");
    let verdict = dbg.on_target_stop(0x401008, PSPACE, reason);
    assert!(verdict.stop);
    assert_eq!(verdict.action, MainAction::StopNoisy);
    assert_eq!(
        verdict.report,
        vec![
            "Hardware watchpoint 1: counter".to_string(),
            String::new(),
            "Old value = 0".to_string(),
            "New value = 9".to_string(),
        ]
    );
    assert_eq!(dbg.breakpoint(id).map(|b| b.hit_count).ok(), Some(1));
}
