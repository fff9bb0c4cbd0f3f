//! シミュレーションターゲットに対する挿入の再調整のテスト

use tomari_core::{BreakpointKind, BreakpointRequest, Debugger, ProgramSpaceId, StopReason};
use tomari_expr::{Scope, Symbol, SymbolTable};
use tomari_target::{SimCapabilities, SimTarget, TargetCall};

const ADDR: u64 = 0x401010;
const COUNTER: u64 = 0x601000;
const SIGTRAP: i32 = 5;

fn debugger(caps: SimCapabilities) -> Debugger<SimTarget> {
    let mut target = SimTarget::with_caps(caps);
    target.map(0x401000, &[0x90; 0x200]);
    target.map(0x601000, &[0; 0x40]);

    let mut symbols = SymbolTable::new();
    symbols.add(Symbol::global("counter", COUNTER, 4));
    symbols.add(Symbol::local("local", -8, 4, Scope::new(0x401000, 0x401100)));

    let mut dbg = Debugger::new(target);
    dbg.set_symbols(Box::new(symbols));
    dbg.set_setting("always-inserted", "on")
        .expect("Failed to enable always-inserted");
    dbg
}

fn brk(dbg: &mut Debugger<SimTarget>, req: BreakpointRequest) -> tomari_core::BreakpointId {
    dbg.create_breakpoint(req)
        .expect("Failed to create breakpoint")
}

/// 同じアドレスのロケーションのうち、挿入を担当するものがちょうど1つであること
fn assert_one_primary(dbg: &Debugger<SimTarget>, address: u64) {
    let group: Vec<_> = dbg
        .global_locations()
        .iter()
        .filter_map(|l| dbg.location(*l))
        .filter(|l| l.address == address)
        .collect();
    let primaries: Vec<_> = group.iter().filter(|l| !l.duplicate).collect();
    assert_eq!(primaries.len(), 1, "Exactly one primary expected at 0x{:x}", address);
    assert!(primaries[0].inserted);
    assert!(group.iter().filter(|l| l.duplicate).all(|l| !l.inserted));
}

fn count_calls(dbg: &Debugger<SimTarget>, pred: impl Fn(&TargetCall) -> bool) -> usize {
    dbg.target().calls().iter().filter(|c| pred(c)).count()
}

#[test]
fn test_duplicates_keep_trap_inserted() {
    let mut dbg = debugger(SimCapabilities::default());
    let a = brk(&mut dbg, BreakpointRequest::new(BreakpointKind::Breakpoint).at(ADDR));
    let b = brk(&mut dbg, BreakpointRequest::new(BreakpointKind::Breakpoint).at(ADDR));
    let c = brk(&mut dbg, BreakpointRequest::new(BreakpointKind::Breakpoint).at(ADDR));
    assert_one_primary(&dbg, ADDR);

    // プライマリを順に削除してもトラップが消える瞬間はない
    for id in [a, b] {
        dbg.delete_breakpoint(id)
            .expect("Failed to delete breakpoint");
        assert!(dbg.target().sw_inserted_at(ADDR));
        assert_one_primary(&dbg, ADDR);
    }
    assert_eq!(count_calls(&dbg, |c| matches!(c, TargetCall::InsertSw(_))), 1);
    assert_eq!(count_calls(&dbg, |c| matches!(c, TargetCall::RemoveSw(_))), 0);

    dbg.delete_breakpoint(c)
        .expect("Failed to delete breakpoint");
    assert!(!dbg.target().sw_inserted_at(ADDR));
    assert_eq!(count_calls(&dbg, |c| matches!(c, TargetCall::InsertSw(_))), 1);
    assert_eq!(count_calls(&dbg, |c| matches!(c, TargetCall::RemoveSw(_))), 1);
    assert_eq!(dbg.target().peek(ADDR, 1), vec![0x90]);
}

#[test]
fn test_disable_primary_promotes_duplicate() {
    let mut dbg = debugger(SimCapabilities::default());
    let a = brk(&mut dbg, BreakpointRequest::new(BreakpointKind::Breakpoint).at(ADDR));
    let b = brk(&mut dbg, BreakpointRequest::new(BreakpointKind::Breakpoint).at(ADDR));

    dbg.disable(a).expect("Failed to disable breakpoint");
    assert!(dbg.target().sw_inserted_at(ADDR));
    let lb = dbg.locations_of(b)[0];
    assert!(lb.inserted && !lb.duplicate);
    assert!(!dbg.locations_of(a)[0].inserted);

    dbg.enable(a).expect("Failed to enable breakpoint");
    assert_one_primary(&dbg, ADDR);
    assert_eq!(count_calls(&dbg, |c| matches!(c, TargetCall::RemoveSw(_))), 0);
}

#[test]
fn test_moribund_location_retires_after_budget() {
    let caps = SimCapabilities {
        non_stop: true,
        ..Default::default()
    };
    let mut dbg = debugger(caps);
    let id = brk(&mut dbg, BreakpointRequest::new(BreakpointKind::Breakpoint).at(ADDR));
    dbg.delete_breakpoint(id)
        .expect("Failed to delete breakpoint");
    assert_eq!(dbg.moribund_locations().len(), 1);

    // スレッド1つなら 3 * (1 + 1) 回の停止まで説明する
    for _ in 0..6 {
        let verdict = dbg.on_target_stop(ADDR, ProgramSpaceId::INITIAL, StopReason::Breakpoint);
        assert!(!verdict.stop);
        assert!(verdict.record.explains_signal(SIGTRAP));
    }
    assert!(dbg.moribund_locations().is_empty());

    let verdict = dbg.on_target_stop(ADDR, ProgramSpaceId::INITIAL, StopReason::Breakpoint);
    assert!(verdict.record.nodes.is_empty());
    assert!(!verdict.record.explains_signal(SIGTRAP));
}

#[test]
fn test_moribund_budget_without_thread_count() {
    let caps = SimCapabilities {
        non_stop: true,
        ..Default::default()
    };
    let mut dbg = debugger(caps);
    dbg.target_mut().set_thread_count(None);
    let id = brk(&mut dbg, BreakpointRequest::new(BreakpointKind::Breakpoint).at(ADDR));
    dbg.delete_breakpoint(id)
        .expect("Failed to delete breakpoint");

    let verdict = dbg.on_target_stop(ADDR, ProgramSpaceId::INITIAL, StopReason::Breakpoint);
    assert!(verdict.record.explains_signal(SIGTRAP));
    assert!(dbg.moribund_locations().is_empty());
}

#[test]
fn test_no_moribund_when_target_reports_trap_kind() {
    let caps = SimCapabilities {
        non_stop: true,
        reports_sw_breakpoint: true,
        reports_hw_breakpoint: true,
        ..Default::default()
    };
    let mut dbg = debugger(caps);
    let id = brk(&mut dbg, BreakpointRequest::new(BreakpointKind::Breakpoint).at(ADDR));
    dbg.delete_breakpoint(id)
        .expect("Failed to delete breakpoint");
    assert!(dbg.moribund_locations().is_empty());
}

#[test]
fn test_target_side_conditions_are_aggregated() {
    let caps = SimCapabilities {
        target_side_conditions: true,
        ..Default::default()
    };
    let mut dbg = debugger(caps);
    brk(
        &mut dbg,
        BreakpointRequest::new(BreakpointKind::Breakpoint)
            .at(ADDR)
            .condition("counter == 1"),
    );
    let second = brk(
        &mut dbg,
        BreakpointRequest::new(BreakpointKind::Breakpoint)
            .at(ADDR)
            .condition("counter == 2"),
    );

    let placed = dbg
        .target()
        .inserted_breakpoint(ADDR)
        .expect("Trap should be inserted");
    assert_eq!(placed.conditions.len(), 2);

    // どちらの条件も偽ならターゲットは停止を報告しない
    assert_eq!(dbg.target_mut().hit(ADDR), None);

    dbg.target_mut().poke(COUNTER, &[2, 0, 0, 0]);
    let reason = dbg.target_mut().hit(ADDR).expect("Target should stop");
    let verdict = dbg.on_target_stop(ADDR, ProgramSpaceId::INITIAL, reason);
    assert!(verdict.stop);
    let stopped: Vec<_> = verdict
        .record
        .nodes
        .iter()
        .filter(|n| n.stop)
        .filter_map(|n| n.breakpoint)
        .collect();
    assert_eq!(stopped, vec![second]);
}

#[test]
fn test_uncompilable_condition_falls_back_to_host() {
    let caps = SimCapabilities {
        target_side_conditions: true,
        ..Default::default()
    };
    let mut dbg = debugger(caps);
    brk(
        &mut dbg,
        BreakpointRequest::new(BreakpointKind::Breakpoint)
            .at(ADDR)
            .condition("counter == 1"),
    );
    assert_eq!(
        dbg.target()
            .inserted_breakpoint(ADDR)
            .map(|b| b.conditions.len()),
        Some(1)
    );

    // フレーム相対のシンボルはターゲットで評価できない
    brk(
        &mut dbg,
        BreakpointRequest::new(BreakpointKind::Breakpoint)
            .at(ADDR)
            .condition("local == 0"),
    );
    let placed = dbg
        .target()
        .inserted_breakpoint(ADDR)
        .expect("Trap should be inserted");
    assert!(placed.conditions.is_empty());
    assert!(dbg.target_mut().hit(ADDR).is_some());
}

#[test]
fn test_host_evaluation_setting_disables_download() {
    let caps = SimCapabilities {
        target_side_conditions: true,
        ..Default::default()
    };
    let mut dbg = debugger(caps);
    dbg.set_setting("condition-evaluation", "host")
        .expect("Failed to set condition-evaluation");
    brk(
        &mut dbg,
        BreakpointRequest::new(BreakpointKind::Breakpoint)
            .at(ADDR)
            .condition("counter == 1"),
    );
    assert_eq!(
        dbg.target()
            .inserted_breakpoint(ADDR)
            .map(|b| b.conditions.len()),
        Some(0)
    );
}

#[test]
fn test_failed_removal_is_retried() {
    let mut dbg = debugger(SimCapabilities::default());
    let id = brk(&mut dbg, BreakpointRequest::new(BreakpointKind::Breakpoint).at(ADDR));
    dbg.target_mut().fail_remove_at(ADDR);

    dbg.delete_breakpoint(id)
        .expect("Deletion itself should succeed");
    assert!(!dbg.last_report().is_ok());
    assert!(dbg.target().sw_inserted_at(ADDR));
    // 読み出しはトラップを隠したまま
    assert_eq!(dbg.read_memory(ADDR, 1).expect("Failed to read memory"), vec![0x90]);

    dbg.target_mut().clear_faults();
    dbg.reconcile().expect("Retry should succeed");
    assert!(!dbg.target().sw_inserted_at(ADDR));
    assert_eq!(dbg.target().peek(ADDR, 1), vec![0x90]);
}

#[test]
fn test_unconditional_breakpoint_keeps_conditions_on_host() {
    let caps = SimCapabilities {
        target_side_conditions: true,
        ..Default::default()
    };
    let mut dbg = debugger(caps);
    let plain = brk(&mut dbg, BreakpointRequest::new(BreakpointKind::Breakpoint).at(ADDR));
    brk(
        &mut dbg,
        BreakpointRequest::new(BreakpointKind::Breakpoint)
            .at(ADDR)
            .condition("counter == 1"),
    );

    // 条件のないブレークポイントがあるので、ターゲットには条件を送らない
    let placed = dbg
        .target()
        .inserted_breakpoint(ADDR)
        .expect("Trap should be inserted");
    assert!(placed.conditions.is_empty());

    // counter は 0 のままでも停止が報告される
    let reason = dbg
        .target_mut()
        .hit(ADDR)
        .expect("Unconditional breakpoint should stop");
    let verdict = dbg.on_target_stop(ADDR, ProgramSpaceId::INITIAL, reason);
    assert!(verdict.stop);
    let stopped: Vec<_> = verdict
        .record
        .nodes
        .iter()
        .filter(|n| n.stop)
        .filter_map(|n| n.breakpoint)
        .collect();
    assert_eq!(stopped, vec![plain]);
}

#[test]
fn test_conditions_withdrawn_when_unconditional_breakpoint_added() {
    let caps = SimCapabilities {
        target_side_conditions: true,
        ..Default::default()
    };
    let mut dbg = debugger(caps);
    brk(
        &mut dbg,
        BreakpointRequest::new(BreakpointKind::Breakpoint)
            .at(ADDR)
            .condition("counter == 1"),
    );
    assert_eq!(
        dbg.target()
            .inserted_breakpoint(ADDR)
            .map(|b| b.conditions.len()),
        Some(1)
    );

    brk(&mut dbg, BreakpointRequest::new(BreakpointKind::Breakpoint).at(ADDR));
    assert_eq!(
        dbg.target()
            .inserted_breakpoint(ADDR)
            .map(|b| b.conditions.len()),
        Some(0)
    );
    assert!(dbg.target_mut().hit(ADDR).is_some());
}
