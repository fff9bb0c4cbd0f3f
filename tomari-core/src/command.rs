//! デバッガコマンド

use tomari_target::{CatchKind, WatchKind};

/// `break` 系コマンドの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakCommand {
    Break,
    /// 一時ブレークポイント
    Tbreak,
    /// ハードウェアブレークポイント
    Hbreak,
}

/// `N` または `N.L` 形式のブレークポイント・ロケーション番号
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakpointRef {
    pub number: i32,
    /// ロケーション番号（1から）
    pub location: Option<usize>,
}

impl BreakpointRef {
    pub fn parse(text: &str) -> Option<Self> {
        match text.split_once('.') {
            Some((n, l)) => Some(Self {
                number: n.parse().ok()?,
                location: Some(l.parse().ok()?),
            }),
            None => Some(Self {
                number: text.parse().ok()?,
                location: None,
            }),
        }
    }
}

/// `enable` の動作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnableMode {
    Keep,
    Once,
    Delete,
    Count(u32),
}

/// デバッガコマンド
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// ブレークポイントを設定
    Break {
        kind: BreakCommand,
        location: String,
        thread: Option<i32>,
        condition: Option<String>,
    },
    /// ウォッチポイントを設定
    Watch { access: WatchKind, expr: String },
    Dprintf {
        location: String,
        format: String,
        args: Vec<String>,
    },
    Catch {
        kind: CatchKind,
        temporary: bool,
    },
    /// 番号の指定がなければ全て削除
    Delete(Vec<i32>),
    Enable {
        mode: EnableMode,
        target: BreakpointRef,
    },
    Disable(BreakpointRef),
    Condition {
        number: i32,
        condition: Option<String>,
        force: bool,
    },
    Ignore { number: i32, count: u32 },
    /// ブレークポイント一覧
    InfoBreakpoints { internal: bool },
    Set { name: String, value: String },
    /// 実行継続
    Continue,
    /// シミュレーションターゲットをアドレスで停止させる
    Stop(u64),
    /// シミュレーションターゲットのメモリに書き込む
    Poke { address: u64, value: u64, size: usize },
    FramePush { pc: u64, base: u64 },
    FramePop,
    /// ヘルプ表示
    Help,
    /// 終了
    Quit,
}

/// 10進数または `0x` 付きの16進数
pub fn parse_number(text: &str) -> Option<u64> {
    let text = text.trim();
    match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => text.parse().ok(),
    }
}

/// `catch` の引数をパースする
pub fn parse_catch(args: &[&str]) -> Option<CatchKind> {
    let (event, rest) = args.split_first()?;
    let pattern = || (!rest.is_empty()).then(|| rest.join(" "));
    match *event {
        "fork" => Some(CatchKind::Fork),
        "vfork" => Some(CatchKind::Vfork),
        "exec" => Some(CatchKind::Exec),
        "syscall" => rest
            .iter()
            .map(|s| s.parse().ok())
            .collect::<Option<Vec<u32>>>()
            .map(CatchKind::Syscall),
        "signal" => rest
            .iter()
            .map(|s| s.parse().ok())
            .collect::<Option<Vec<i32>>>()
            .map(CatchKind::Signal),
        "load" => Some(CatchKind::Load(pattern())),
        "unload" => Some(CatchKind::Unload(pattern())),
        _ => None,
    }
}

/// `LOC [thread N] [if COND]` をパースする
fn parse_break(kind: BreakCommand, args: &[&str]) -> Option<Command> {
    let (location, mut rest) = args.split_first()?;
    let mut thread = None;
    let mut condition = None;
    while let Some((word, tail)) = rest.split_first() {
        match *word {
            "thread" => {
                let (n, tail) = tail.split_first()?;
                thread = Some(n.parse().ok()?);
                rest = tail;
            }
            "if" => {
                if tail.is_empty() {
                    return None;
                }
                condition = Some(tail.join(" "));
                rest = &[];
            }
            _ => return None,
        }
    }
    Some(Command::Break {
        kind,
        location: location.to_string(),
        thread,
        condition,
    })
}

/// `LOC,"format",arg,...` をパースする
fn parse_dprintf(text: &str) -> Option<Command> {
    let (location, rest) = text.split_once(',')?;
    let rest = rest.trim().strip_prefix('"')?;
    let end = rest.find('"')?;
    let format = rest[..end].replace("\\n", "\n");
    let args = rest[end + 1..]
        .split(',')
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .map(str::to_string)
        .collect();
    Some(Command::Dprintf {
        location: location.trim().to_string(),
        format,
        args,
    })
}

fn parse_enable(args: &[&str]) -> Option<Command> {
    let (mode, rest) = match args {
        ["once", rest @ ..] => (EnableMode::Once, rest),
        ["delete", rest @ ..] => (EnableMode::Delete, rest),
        ["count", n, rest @ ..] => (EnableMode::Count(n.parse().ok()?), rest),
        rest => (EnableMode::Keep, rest),
    };
    let [target] = rest else {
        return None;
    };
    Some(Command::Enable {
        mode,
        target: BreakpointRef::parse(target)?,
    })
}

fn parse_condition(args: &[&str]) -> Option<Command> {
    let (force, args) = match args {
        ["-force", rest @ ..] => (true, rest),
        rest => (false, rest),
    };
    let (number, cond) = args.split_first()?;
    Some(Command::Condition {
        number: number.parse().ok()?,
        condition: (!cond.is_empty()).then(|| cond.join(" ")),
        force,
    })
}

impl Command {
    /// コマンド文字列をパースする
    pub fn parse(input: &str) -> Option<Self> {
        let input = input.trim();
        let parts: Vec<&str> = input.split_whitespace().collect();
        if parts.is_empty() {
            return None;
        }
        let args = &parts[1..];

        match parts[0] {
            "break" | "b" => parse_break(BreakCommand::Break, args),
            "tbreak" => parse_break(BreakCommand::Tbreak, args),
            "hbreak" => parse_break(BreakCommand::Hbreak, args),
            "watch" | "rwatch" | "awatch" => {
                if args.is_empty() {
                    return None;
                }
                let access = match parts[0] {
                    "rwatch" => WatchKind::Read,
                    "awatch" => WatchKind::Access,
                    _ => WatchKind::Write,
                };
                Some(Command::Watch {
                    access,
                    expr: args.join(" "),
                })
            }
            "dprintf" => parse_dprintf(input.strip_prefix("dprintf")?),
            "catch" | "tcatch" => Some(Command::Catch {
                kind: parse_catch(args)?,
                temporary: parts[0] == "tcatch",
            }),
            "delete" | "d" => args
                .iter()
                .map(|a| a.parse().ok())
                .collect::<Option<Vec<i32>>>()
                .map(Command::Delete),
            "enable" => parse_enable(args),
            "disable" => match args {
                [target] => Some(Command::Disable(BreakpointRef::parse(target)?)),
                _ => None,
            },
            "condition" => parse_condition(args),
            "ignore" => match args {
                [n, count] => Some(Command::Ignore {
                    number: n.parse().ok()?,
                    count: count.parse().ok()?,
                }),
                _ => None,
            },
            "info" => match args {
                ["breakpoints" | "break" | "b"] => Some(Command::InfoBreakpoints { internal: false }),
                ["internal"] => Some(Command::InfoBreakpoints { internal: true }),
                _ => None,
            },
            "set" => match args {
                [name, value] => Some(Command::Set {
                    name: name.to_string(),
                    value: value.to_string(),
                }),
                _ => None,
            },
            "continue" | "c" => Some(Command::Continue),
            "stop" => match args {
                [addr] => Some(Command::Stop(parse_number(addr)?)),
                _ => None,
            },
            "poke" => {
                let (address, value, size) = match args {
                    [addr, value] => (addr, value, 4),
                    [addr, value, size] => (addr, value, size.parse().ok()?),
                    _ => return None,
                };
                if !(1..=8).contains(&size) {
                    return None;
                }
                Some(Command::Poke {
                    address: parse_number(address)?,
                    value: parse_number(value)?,
                    size,
                })
            }
            "frame" => match args {
                ["push", pc, base] => Some(Command::FramePush {
                    pc: parse_number(pc)?,
                    base: parse_number(base)?,
                }),
                ["pop"] => Some(Command::FramePop),
                _ => None,
            },
            "help" | "h" | "?" => Some(Command::Help),
            "quit" | "q" | "exit" => Some(Command::Quit),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!(Command::parse("continue"), Some(Command::Continue));
        assert_eq!(Command::parse("c"), Some(Command::Continue));
        assert_eq!(Command::parse("quit"), Some(Command::Quit));
        assert_eq!(Command::parse("delete"), Some(Command::Delete(vec![])));
        assert_eq!(Command::parse("delete 1 3"), Some(Command::Delete(vec![1, 3])));
        assert_eq!(Command::parse("frobnicate"), None);
    }

    #[test]
    fn test_parse_break() {
        assert_eq!(
            Command::parse("b 0x401000 thread 2 if x > 3"),
            Some(Command::Break {
                kind: BreakCommand::Break,
                location: "0x401000".to_string(),
                thread: Some(2),
                condition: Some("x > 3".to_string()),
            })
        );
        assert_eq!(Command::parse("tbreak main if"), None);
        assert_eq!(Command::parse("break"), None);
    }

    #[test]
    fn test_parse_enable() {
        assert_eq!(
            Command::parse("enable count 3 2.1"),
            Some(Command::Enable {
                mode: EnableMode::Count(3),
                target: BreakpointRef {
                    number: 2,
                    location: Some(1),
                },
            })
        );
        assert_eq!(
            Command::parse("enable once 4"),
            Some(Command::Enable {
                mode: EnableMode::Once,
                target: BreakpointRef {
                    number: 4,
                    location: None,
                },
            })
        );
    }

    #[test]
    fn test_parse_dprintf() {
        assert_eq!(
            Command::parse("dprintf 0x401000,\"x=%d y=%d\\n\", x, y"),
            Some(Command::Dprintf {
                location: "0x401000".to_string(),
                format: "x=%d y=%d\n".to_string(),
                args: vec!["x".to_string(), "y".to_string()],
            })
        );
    }

    #[test]
    fn test_parse_catch_and_condition() {
        assert_eq!(
            Command::parse("catch syscall 1 60"),
            Some(Command::Catch {
                kind: CatchKind::Syscall(vec![1, 60]),
                temporary: false,
            })
        );
        assert_eq!(
            Command::parse("tcatch load libm"),
            Some(Command::Catch {
                kind: CatchKind::Load(Some("libm".to_string())),
                temporary: true,
            })
        );
        assert_eq!(
            Command::parse("condition -force 1 y == 2"),
            Some(Command::Condition {
                number: 1,
                condition: Some("y == 2".to_string()),
                force: true,
            })
        );
        assert_eq!(
            Command::parse("condition 1"),
            Some(Command::Condition {
                number: 1,
                condition: None,
                force: false,
            })
        );
    }

    #[test]
    fn test_parse_number() {
        assert_eq!(parse_number("0x10"), Some(16));
        assert_eq!(parse_number("42"), Some(42));
        assert_eq!(parse_number("zz"), None);
    }
}
