//! Tomari CLI - コマンドラインインターフェース
//!
//! ブレークポイント・ウォッチポイント管理コア tomari のREPLインターフェース

mod backend;

use anyhow::{anyhow, Result};
use backend::{simulated_program, Backend, FunctionTable};
use clap::{Args, Parser, Subcommand};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use tomari_core::command::{parse_number, BreakCommand, BreakpointRef, EnableMode};
use tomari_core::{
    render_breakpoint_table, BreakpointId, BreakpointKind, BreakpointRequest, Command, Debugger,
    ProgramSpaceId, StopReason, Verdict, WatchRequest,
};
use tomari_target::{SimCapabilities, SimTarget};
use tracing::{debug, Level};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Tomari - Breakpoint and Watchpoint Manager
#[derive(Parser)]
#[command(name = "tomari")]
#[command(version = "0.1.0")]
#[command(about = "Breakpoint, watchpoint and catchpoint manager for native debugging", long_about = None)]
struct Cli {
    /// Log level used when RUST_LOG is not set
    #[arg(long, default_value = "warn")]
    log_level: Level,

    #[command(flatten)]
    settings: SettingsArgs,

    #[command(subcommand)]
    command: DebugCommand,
}

/// 起動時に適用するブレークポイント設定
#[derive(Args)]
struct SettingsArgs {
    /// Keep breakpoints inserted while the program is stopped
    #[arg(long)]
    always_inserted: bool,

    /// Where breakpoint conditions are evaluated (auto, host, target)
    #[arg(long, value_name = "MODE")]
    condition_evaluation: Option<String>,

    /// How dprintf output is produced (gdb, agent)
    #[arg(long, value_name = "STYLE")]
    dprintf_style: Option<String>,

    /// Whether unresolved locations become pending breakpoints (auto, on, off)
    #[arg(long, value_name = "MODE")]
    pending: Option<String>,

    /// Never use hardware watchpoints
    #[arg(long)]
    no_hw_watchpoints: bool,
}

impl SettingsArgs {
    fn pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::new();
        if self.always_inserted {
            pairs.push(("always-inserted", "on".to_string()));
        }
        if let Some(mode) = &self.condition_evaluation {
            pairs.push(("condition-evaluation", mode.clone()));
        }
        if let Some(style) = &self.dprintf_style {
            pairs.push(("dprintf-style", style.clone()));
        }
        if let Some(mode) = &self.pending {
            pairs.push(("pending", mode.clone()));
        }
        if self.no_hw_watchpoints {
            pairs.push(("can-use-hw-watchpoints", "0".to_string()));
        }
        pairs
    }
}

#[derive(Subcommand)]
enum DebugCommand {
    /// Drive a simulated program from the REPL
    Sim {
        /// Number of hardware debug registers (0 for none)
        #[arg(long, default_value_t = 4)]
        debug_registers: usize,

        /// Let the target evaluate breakpoint conditions
        #[arg(long)]
        target_conditions: bool,

        /// Run the target in non-stop mode
        #[arg(long)]
        non_stop: bool,
    },

    /// Launch and debug an executable
    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    Run {
        /// Path to the executable binary
        binary: String,

        /// Arguments to pass to the program
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Attach to an existing process
    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    Attach {
        /// Process ID to attach to
        #[arg(short, long)]
        pid: i32,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level);

    println!("Tomari - Breakpoint Manager");
    println!("Version 0.1.0");
    println!();

    match cli.command {
        DebugCommand::Sim {
            debug_registers,
            target_conditions,
            non_stop,
        } => {
            let caps = SimCapabilities {
                debug_registers: (debug_registers > 0).then_some(debug_registers),
                target_side_conditions: target_conditions,
                target_side_commands: target_conditions,
                non_stop,
                ..Default::default()
            };
            let (target, symbols) = simulated_program(caps);
            let mut debugger = Debugger::new(target);
            debugger.set_symbols(Box::new(symbols));
            debugger.set_resolver(Box::new(FunctionTable));
            apply_settings(&mut debugger, &cli.settings)?;
            println!("Simulated program loaded (functions: main, compute, worker, rodata_hook)");
            println!("Globals: counter, ptr, buffer; frame-local: local");
            run_repl(&mut debugger)
        }
        #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
        DebugCommand::Run { binary, args } => {
            let target = tomari_target::PtraceTarget::spawn(&binary, &args)?;
            println!("Process {} spawned and stopped at first instruction", target.pid());
            println!("Set breakpoints by address and use 'continue' to continue execution");
            let mut debugger = Debugger::new(target);
            apply_settings(&mut debugger, &cli.settings)?;
            run_repl(&mut debugger)
        }
        #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
        DebugCommand::Attach { pid } => {
            let target = tomari_target::PtraceTarget::attach(pid)?;
            println!("Attached to process {}", pid);
            let mut debugger = Debugger::new(target);
            apply_settings(&mut debugger, &cli.settings)?;
            run_repl(&mut debugger)
        }
    }
}

/// ログ出力を初期化する（RUST_LOG が優先）
fn init_tracing(level: Level) {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(level).into())
        .from_env_lossy();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn apply_settings<T: Backend>(debugger: &mut Debugger<T>, settings: &SettingsArgs) -> Result<()> {
    for (name, value) in settings.pairs() {
        debugger.set_setting(name, &value)?;
        debug!("{} = {}", name, value);
    }
    Ok(())
}

/// REPLループを実行する
fn run_repl<T: Backend>(debugger: &mut Debugger<T>) -> Result<()> {
    println!("Type 'help' for available commands, 'quit' to exit.");
    println!();

    let mut rl = DefaultEditor::new()?;

    loop {
        let readline = rl.readline("(tomari) ");
        match readline {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                rl.add_history_entry(line)?;

                match handle_command(debugger, line) {
                    Ok(true) => break,
                    Ok(false) => {}
                    Err(e) => eprintln!("Error: {}", e),
                }
                print_notes(debugger);
            }
            Err(ReadlineError::Interrupted) => {
                println!("CTRL-C");
                break;
            }
            Err(ReadlineError::Eof) => {
                println!("CTRL-D");
                break;
            }
            Err(err) => {
                eprintln!("Error: {:?}", err);
                break;
            }
        }
    }

    Ok(())
}

/// コマンドを1つ処理する（終了するなら `true`）
fn handle_command<T: Backend>(debugger: &mut Debugger<T>, line: &str) -> Result<bool> {
    let Some(command) = Command::parse(line) else {
        println!("Unknown or malformed command: {}", line);
        println!("Type 'help' for available commands.");
        return Ok(false);
    };

    match command {
        Command::Help => print_help(),
        Command::Quit => {
            println!("Goodbye!");
            return Ok(true);
        }
        Command::Break {
            kind,
            location,
            thread,
            condition,
        } => handle_break(debugger, kind, &location, thread, condition.as_deref())?,
        Command::Watch { access, expr } => {
            debugger.watch(WatchRequest::new(&expr, access))?;
        }
        Command::Dprintf {
            location,
            format,
            args,
        } => {
            let args: Vec<&str> = args.iter().map(String::as_str).collect();
            let id = debugger.dprintf(location_request(BreakpointKind::Dprintf, &location), &format, &args)?;
            announce(debugger, "Dprintf", id);
        }
        Command::Catch { kind, temporary } => {
            debugger.catch(kind, temporary)?;
        }
        Command::Delete(numbers) => handle_delete(debugger, &numbers)?,
        Command::Enable { mode, target } => handle_enable(debugger, mode, target)?,
        Command::Disable(target) => {
            let id = BreakpointId(target.number);
            match target.location {
                Some(index) => debugger.disable_location(id, index)?,
                None => debugger.disable(id)?,
            }
        }
        Command::Condition {
            number,
            condition,
            force,
        } => {
            let id = BreakpointId(number);
            debugger.set_condition(id, condition.as_deref(), force)?;
            if condition.is_none() {
                println!("Breakpoint {} now unconditional.", number);
            }
        }
        Command::Ignore { number, count } => {
            debugger.set_ignore_count(BreakpointId(number), count)?;
            match count {
                0 => println!("Will stop next time breakpoint {} is reached.", number),
                1 => println!("Will ignore next crossing of breakpoint {}.", number),
                n => println!("Will ignore next {} crossings of breakpoint {}.", n, number),
            }
        }
        Command::InfoBreakpoints { internal } => {
            println!("{}", render_breakpoint_table(&debugger.info_breakpoints(internal)));
        }
        Command::Set { name, value } => debugger.set_setting(&name, &value)?,
        Command::Continue => handle_continue(debugger)?,
        Command::Stop(address) => handle_stop(debugger, address)?,
        Command::Poke {
            address,
            value,
            size,
        } => handle_poke(debugger, address, value, size)?,
        Command::FramePush { pc, base } => {
            let id = sim_target(debugger)?.push_frame(pc, base);
            println!("Entered frame 0x{:x} at pc 0x{:x}", id.0, pc);
        }
        Command::FramePop => match sim_target(debugger)?.pop_frame() {
            Some(frame) => println!("Left frame 0x{:x}", frame.id.0),
            None => println!("No frame to pop"),
        },
    }

    Ok(false)
}

/// アドレスまたは関数名からブレークポイント要求を作る
fn location_request(kind: BreakpointKind, location: &str) -> BreakpointRequest {
    let req = BreakpointRequest::new(kind);
    match parse_number(location) {
        Some(address) => req.at(address),
        None => req.spec(location),
    }
}

/// Breakコマンドを処理する
fn handle_break<T: Backend>(
    debugger: &mut Debugger<T>,
    kind: BreakCommand,
    location: &str,
    thread: Option<i32>,
    condition: Option<&str>,
) -> Result<()> {
    let (bp_kind, label) = match kind {
        BreakCommand::Break => (BreakpointKind::Breakpoint, "Breakpoint"),
        BreakCommand::Tbreak => (BreakpointKind::Breakpoint, "Temporary breakpoint"),
        BreakCommand::Hbreak => (BreakpointKind::HwBreakpoint, "Hardware assisted breakpoint"),
    };
    let mut req = location_request(bp_kind, location);
    if let Some(thread) = thread {
        req = req.thread(thread);
    }
    if let Some(cond) = condition {
        req = req.condition(cond);
    }
    if kind == BreakCommand::Tbreak {
        req = req.temporary();
    }

    let id = debugger.create_breakpoint(req)?;
    announce(debugger, label, id);
    Ok(())
}

/// 作成したブレークポイントの場所を表示する
fn announce<T: Backend>(debugger: &Debugger<T>, label: &str, id: BreakpointId) {
    let Some(info) = debugger
        .info_breakpoints(true)
        .into_iter()
        .find(|i| i.id == id)
    else {
        return;
    };
    match info.locations.as_slice() {
        [] => println!("{} {} ({}) pending.", label, id, info.what),
        [loc] => match &loc.function {
            Some(function) => println!("{} {} at 0x{:x}: {}", label, id, loc.address, function),
            None => println!("{} {} at 0x{:x}", label, id, loc.address),
        },
        locs => println!("{} {} at {} ({} locations)", label, id, info.what, locs.len()),
    }
}

fn handle_delete<T: Backend>(debugger: &mut Debugger<T>, numbers: &[i32]) -> Result<()> {
    let ids: Vec<BreakpointId> = if numbers.is_empty() {
        debugger
            .breakpoints()
            .filter(|b| b.id.is_user())
            .map(|b| b.id)
            .collect()
    } else {
        numbers.iter().map(|n| BreakpointId(*n)).collect()
    };
    for id in ids {
        debugger.delete_breakpoint(id)?;
    }
    Ok(())
}

fn handle_enable<T: Backend>(
    debugger: &mut Debugger<T>,
    mode: EnableMode,
    target: BreakpointRef,
) -> Result<()> {
    let id = BreakpointId(target.number);
    if let Some(index) = target.location {
        if mode != EnableMode::Keep {
            return Err(anyhow!("Locations can only be enabled or disabled"));
        }
        debugger.enable_location(id, index)?;
        return Ok(());
    }
    match mode {
        EnableMode::Keep => debugger.enable(id)?,
        EnableMode::Once => debugger.enable_once(id)?,
        EnableMode::Delete => debugger.enable_delete(id)?,
        EnableMode::Count(count) => debugger.enable_count(id, count)?,
    }
    Ok(())
}

/// Continueコマンドを処理する
///
/// 停止しないブレークポイントに当たった場合は、トラップを外して1命令進めてから再開します。
fn handle_continue<T: Backend>(debugger: &mut Debugger<T>) -> Result<()> {
    loop {
        debugger.insert_breakpoints()?;
        print_notes(debugger);

        let Some((reason, pc)) = debugger.target_mut().resume_target()? else {
            println!("Continuing.");
            println!("Use 'stop', 'poke' or 'frame' to drive the simulated program.");
            return Ok(());
        };
        if let StopReason::Exited(code) = reason {
            println!("[Inferior 1 exited with code {:02o}]", code);
            debugger.reset();
            return Ok(());
        }

        let signal = match reason {
            StopReason::Signal(sig) => Some(sig),
            _ => None,
        };
        let verdict = debugger.on_target_stop(pc, ProgramSpaceId::INITIAL, reason);
        print_notes(debugger);
        if verdict.stop {
            print_verdict(&verdict, pc);
            return finish_stop(debugger);
        }
        if let Some(sig) = signal {
            if !verdict.record.explains_signal(sig) {
                println!("Program received signal {}.", sig);
                return finish_stop(debugger);
            }
        }

        debug!("Stepping over 0x{:x}", pc);
        debugger.remove_breakpoints()?;
        debugger.target_mut().step_target()?;
    }
}

/// 停止後にトラップを外す（always-inserted なら残す）
fn finish_stop<T: Backend>(debugger: &mut Debugger<T>) -> Result<()> {
    if !debugger.settings().always_inserted {
        debugger.remove_breakpoints()?;
    }
    Ok(())
}

fn sim_target<T: Backend>(debugger: &mut Debugger<T>) -> Result<&mut SimTarget> {
    debugger
        .target_mut()
        .sim()
        .ok_or_else(|| anyhow!("This command needs the simulated target"))
}

/// シミュレートしたプログラムを `address` まで進めて停止を処理する
fn handle_stop<T: Backend>(debugger: &mut Debugger<T>, address: u64) -> Result<()> {
    let reason = sim_target(debugger)?.hit(address).unwrap_or(StopReason::Step);
    report_stop(debugger, address, reason)
}

fn handle_poke<T: Backend>(
    debugger: &mut Debugger<T>,
    address: u64,
    value: u64,
    size: usize,
) -> Result<()> {
    let pc = debugger.target().selected_frame().map(|f| f.pc).unwrap_or(0);
    let bytes = value.to_le_bytes();
    let reason = sim_target(debugger)?.write_watched(address, &bytes[..size]);
    match reason {
        Some(reason) => report_stop(debugger, pc, reason),
        None if debugger.should_step() => report_stop(debugger, pc, StopReason::Step),
        None => {
            println!("Wrote {} byte(s) at 0x{:x}", size, address);
            Ok(())
        }
    }
}

fn report_stop<T: Backend>(debugger: &mut Debugger<T>, pc: u64, reason: StopReason) -> Result<()> {
    let verdict = debugger.on_target_stop(pc, ProgramSpaceId::INITIAL, reason);
    if let Some(sim) = debugger.target_mut().sim() {
        for line in sim.take_output() {
            print!("{}", line);
        }
    }
    print_notes(debugger);
    if verdict.stop {
        print_verdict(&verdict, pc);
        finish_stop(debugger)
    } else {
        debug!("Not stopping at 0x{:x}: {:?}", pc, verdict.action);
        println!("Continuing.");
        Ok(())
    }
}

fn print_verdict(verdict: &Verdict, pc: u64) {
    if !verdict.print {
        return;
    }
    if verdict.report.is_empty() {
        println!("Stopped at 0x{:x}", pc);
    }
    for line in &verdict.report {
        println!("{}", line);
    }
}

/// コアが溜めたメッセージと警告を表示する
fn print_notes<T: Backend>(debugger: &mut Debugger<T>) {
    for message in debugger.take_messages() {
        println!("{}", message);
    }
    for warning in debugger.take_warnings() {
        eprintln!("warning: {}", warning);
    }
}

/// ヘルプを表示する
fn print_help() {
    println!("Available commands:");
    println!();
    println!("  help           - Show this help message");
    println!("  quit/exit/q    - Exit the debugger");
    println!();
    println!("Breakpoint commands:");
    println!("  break <loc> [thread N] [if COND]  - Set breakpoint at function or address");
    println!("  tbreak <loc>   - Set a temporary breakpoint");
    println!("  hbreak <loc>   - Set a hardware breakpoint");
    println!("  watch <expr>   - Stop when expr changes (rwatch/awatch for reads)");
    println!("  dprintf <loc>,\"fmt\",args - Print without stopping");
    println!("  catch <event>  - fork, vfork, exec, syscall [N..], signal [N..], load/unload [re]");
    println!("  tcatch <event> - Temporary catchpoint");
    println!("  delete [N..]   - Delete breakpoints (all when no number is given)");
    println!("  enable [once|delete|count N] <N[.L]> - Enable breakpoint or location");
    println!("  disable <N[.L]> - Disable breakpoint or location");
    println!("  condition [-force] N [COND] - Set or clear a condition");
    println!("  ignore N COUNT - Ignore the next COUNT hits");
    println!("  info breakpoints (info internal) - List breakpoints");
    println!("  set <name> <value> - Change a breakpoint setting");
    println!();
    println!("Execution commands:");
    println!("  continue (c)   - Continue execution");
    println!();
    println!("Simulated target commands:");
    println!("  stop <addr>    - Report that the program reached addr");
    println!("  poke <addr> <value> [size] - Write memory as the program would");
    println!("  frame push <pc> <base> / frame pop - Enter or leave a frame");
    println!();
    println!("Examples:");
    println!("  break main");
    println!("  break 0x401040 if counter == 3");
    println!("  watch counter");
    println!("  poke 0x601000 7");
}
