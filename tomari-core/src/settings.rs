//! ブレークポイント管理の設定

use crate::errors::{BreakpointError, Result};
use std::fmt;

/// 条件式をどこで評価するか
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionEvaluation {
    /// ターゲットが対応していればターゲット側
    Auto,
    Host,
    Target,
}

/// 解決できない場所へのブレークポイントを保留にするか
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingMode {
    Auto,
    On,
    Off,
}

/// dprintf の出力方法
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DprintfStyle {
    /// デバッガ側で整形して出力する
    Host,
    /// ターゲット側のエージェントに出力させる
    Agent,
}

/// ブレークポイント管理の設定
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakpointSettings {
    /// 停止中もブレークポイントを挿入したままにする
    pub always_inserted: bool,
    /// 読み取り専用メモリには自動でハードウェアブレークポイントを使う
    pub auto_hw: bool,
    pub condition_evaluation: ConditionEvaluation,
    pub can_use_hw_watchpoints: bool,
    pub pending: PendingMode,
    pub dprintf_style: DprintfStyle,
    /// moribund ロケーションの寿命の係数
    pub moribund_factor: usize,
    /// 共有ライブラリのイベントで停止する
    pub stop_on_solib_events: bool,
}

impl Default for BreakpointSettings {
    fn default() -> Self {
        Self {
            always_inserted: false,
            auto_hw: true,
            condition_evaluation: ConditionEvaluation::Auto,
            can_use_hw_watchpoints: true,
            pending: PendingMode::Auto,
            dprintf_style: DprintfStyle::Host,
            moribund_factor: 3,
            stop_on_solib_events: false,
        }
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value {
        "on" | "1" | "yes" | "enable" => Ok(true),
        "off" | "0" | "no" | "disable" => Ok(false),
        _ => Err(BreakpointError::InvalidSetting(format!(
            "\"on\" or \"off\" expected for {}, got \"{}\".",
            name, value
        ))),
    }
}

fn invalid_value(name: &str, value: &str, expected: &str) -> BreakpointError {
    BreakpointError::InvalidSetting(format!(
        "Undefined item: \"{}\" for {} (expected {}).",
        value, name, expected
    ))
}

impl BreakpointSettings {
    /// 設定名の一覧
    pub const NAMES: [&'static str; 8] = [
        "always-inserted",
        "auto-hw",
        "condition-evaluation",
        "can-use-hw-watchpoints",
        "pending",
        "dprintf-style",
        "moribund-factor",
        "stop-on-solib-events",
    ];

    /// `set NAME VALUE` 形式の設定を反映する
    pub fn set(&mut self, name: &str, value: &str) -> Result<()> {
        let value = value.trim();
        match name {
            "always-inserted" => self.always_inserted = parse_bool(name, value)?,
            "auto-hw" => self.auto_hw = parse_bool(name, value)?,
            "can-use-hw-watchpoints" => self.can_use_hw_watchpoints = parse_bool(name, value)?,
            "stop-on-solib-events" => self.stop_on_solib_events = parse_bool(name, value)?,
            "condition-evaluation" => {
                self.condition_evaluation = match value {
                    "auto" => ConditionEvaluation::Auto,
                    "host" => ConditionEvaluation::Host,
                    "target" => ConditionEvaluation::Target,
                    _ => return Err(invalid_value(name, value, "auto, host or target")),
                }
            }
            "pending" => {
                self.pending = match value {
                    "auto" => PendingMode::Auto,
                    "on" => PendingMode::On,
                    "off" => PendingMode::Off,
                    _ => return Err(invalid_value(name, value, "auto, on or off")),
                }
            }
            "dprintf-style" => {
                self.dprintf_style = match value {
                    "gdb" | "host" => DprintfStyle::Host,
                    "agent" => DprintfStyle::Agent,
                    _ => return Err(invalid_value(name, value, "host or agent")),
                }
            }
            "moribund-factor" => {
                self.moribund_factor = value
                    .parse()
                    .map_err(|_| invalid_value(name, value, "an integer"))?
            }
            _ => {
                return Err(BreakpointError::InvalidSetting(format!(
                    "Undefined set breakpoint command: \"{}\".",
                    name
                )))
            }
        }
        Ok(())
    }

    /// 設定値を文字列で取得する
    pub fn get(&self, name: &str) -> Option<String> {
        fn on_off(b: bool) -> String {
            if b { "on" } else { "off" }.to_string()
        }
        let value = match name {
            "always-inserted" => on_off(self.always_inserted),
            "auto-hw" => on_off(self.auto_hw),
            "can-use-hw-watchpoints" => on_off(self.can_use_hw_watchpoints),
            "stop-on-solib-events" => on_off(self.stop_on_solib_events),
            "condition-evaluation" => match self.condition_evaluation {
                ConditionEvaluation::Auto => "auto",
                ConditionEvaluation::Host => "host",
                ConditionEvaluation::Target => "target",
            }
            .to_string(),
            "pending" => match self.pending {
                PendingMode::Auto => "auto",
                PendingMode::On => "on",
                PendingMode::Off => "off",
            }
            .to_string(),
            "dprintf-style" => match self.dprintf_style {
                DprintfStyle::Host => "host",
                DprintfStyle::Agent => "agent",
            }
            .to_string(),
            "moribund-factor" => self.moribund_factor.to_string(),
            _ => return None,
        };
        Some(value)
    }
}

impl fmt::Display for BreakpointSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for name in Self::NAMES {
            if let Some(value) = self.get(name) {
                writeln!(f, "{:<24}{}", name, value)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let s = BreakpointSettings::default();
        assert!(!s.always_inserted);
        assert!(s.auto_hw);
        assert_eq!(s.condition_evaluation, ConditionEvaluation::Auto);
        assert_eq!(s.moribund_factor, 3);
    }

    #[test]
    fn test_set_values() {
        let mut s = BreakpointSettings::default();
        s.set("always-inserted", "on").unwrap();
        s.set("condition-evaluation", "target").unwrap();
        s.set("dprintf-style", "agent").unwrap();
        s.set("moribund-factor", "5").unwrap();
        assert!(s.always_inserted);
        assert_eq!(s.condition_evaluation, ConditionEvaluation::Target);
        assert_eq!(s.dprintf_style, DprintfStyle::Agent);
        assert_eq!(s.moribund_factor, 5);
        assert_eq!(s.get("pending").as_deref(), Some("auto"));
    }

    #[test]
    fn test_set_invalid() {
        let mut s = BreakpointSettings::default();
        assert!(matches!(
            s.set("auto-hw", "maybe"),
            Err(BreakpointError::InvalidSetting(_))
        ));
        assert!(matches!(
            s.set("no-such-knob", "on"),
            Err(BreakpointError::InvalidSetting(_))
        ));
        assert!(s.set("moribund-factor", "x").is_err());
        assert_eq!(s, BreakpointSettings::default());
    }
}
