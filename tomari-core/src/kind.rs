//! ブレークポイントの種類と種類ごとの性質の表
//!
//! 種類ごとに異なる振る舞い（ロケーションの種類、停止判定の結果の読み替え、
//! 表示名）は [`BreakpointKind::traits`] の静的な表で引きます。

use std::fmt;
use tomari_target::WatchKind;

/// ブレークポイントの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BreakpointKind {
    /// 通常のコードブレークポイント
    Breakpoint,
    /// ハードウェアブレークポイント
    HwBreakpoint,
    /// ステップ実行用の一時ブレークポイント
    SingleStep,
    Until,
    Finish,
    /// ソフトウェアウォッチポイント
    Watchpoint,
    /// ハードウェア書き込みウォッチポイント
    HwWatchpoint,
    ReadWatchpoint,
    AccessWatchpoint,
    Longjmp,
    LongjmpResume,
    LongjmpCallDummy,
    Exception,
    ExceptionResume,
    StepResume,
    HpStepResume,
    /// フレームローカルなウォッチポイントのスコープ脱出を捕まえる
    WatchpointScope,
    CallDummy,
    StdTerminate,
    ShlibEvent,
    ThreadEvent,
    OverlayEvent,
    JitEvent,
    LongjmpMaster,
    StdTerminateMaster,
    ExceptionMaster,
    Tracepoint,
    FastTracepoint,
    StaticTracepoint,
    StaticMarkerTracepoint,
    Dprintf,
    Catchpoint,
    GnuIfuncResolver,
    GnuIfuncResolverReturn,
}

/// ロケーションの種類
///
/// 並び順はグローバルロケーションリストのソート順に使われます。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LocKind {
    SwBreakpoint,
    HwBreakpoint,
    SwWatchpoint,
    HwWatchpoint,
    Tracepoint,
    /// アドレスを持たない（キャッチポイント）
    Other,
}

/// 停止判定の結果から次の動作への読み替え方
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopClass {
    /// 停止なら報告、そうでなければ命令をまたぐ
    Ordinary,
    /// 停止なら報告、そうでなければ判定を続ける
    Watch,
    /// キャッチポイント
    Catch,
    /// 停止せず出力だけする
    Dprintf,
    Longjmp,
    LongjmpResume,
    StepResume,
    HpStepResume,
    CallDummy,
    StdTerminate,
    /// 常に判定を続ける
    KeepChecking,
    /// 常に命令をまたぐ
    Single,
}

/// 停止判定の後にデバッガが取る動作
///
/// 並び順が優先度です。チェーン全体の結果は各ノードの最大値になります。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MainAction {
    /// 何の情報もない
    KeepChecking,
    /// ブレークポイントを外して1命令だけ進める
    Single,
    SetLongjmpResume,
    ClearLongjmpResume,
    StepResume,
    /// 報告せずに停止する
    StopSilent,
    /// 停止して報告する
    StopNoisy,
    /// 停止して関数呼び出し用のダミーフレームを取り除く
    PopCallDummy,
    HpStepResume,
}

/// 種類ごとの性質
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KindTraits {
    pub name: &'static str,
    pub loc_kind: LocKind,
    pub stop_class: StopClass,
    /// 内部用（負の番号を持つ）
    pub internal: bool,
}

const fn traits(
    name: &'static str,
    loc_kind: LocKind,
    stop_class: StopClass,
    internal: bool,
) -> KindTraits {
    KindTraits {
        name,
        loc_kind,
        stop_class,
        internal,
    }
}

impl BreakpointKind {
    /// 種類ごとの性質を引く
    pub const fn traits(self) -> KindTraits {
        use BreakpointKind::*;
        use LocKind::{HwBreakpoint as Hw, HwWatchpoint as HwW, Other, SwBreakpoint as Sw};
        use StopClass as C;

        match self {
            Breakpoint => traits("breakpoint", Sw, C::Ordinary, false),
            HwBreakpoint => traits("hw breakpoint", Hw, C::Ordinary, false),
            SingleStep => traits("single step", Sw, C::Ordinary, true),
            Until => traits("until", Sw, C::Ordinary, true),
            Finish => traits("finish", Sw, C::Ordinary, true),
            Watchpoint => traits("watchpoint", LocKind::SwWatchpoint, C::Watch, false),
            HwWatchpoint => traits("hw watchpoint", HwW, C::Watch, false),
            ReadWatchpoint => traits("read watchpoint", HwW, C::Watch, false),
            AccessWatchpoint => traits("acc watchpoint", HwW, C::Watch, false),
            Longjmp => traits("longjmp", Sw, C::Longjmp, true),
            LongjmpResume => traits("longjmp resume", Sw, C::LongjmpResume, true),
            LongjmpCallDummy => traits("longjmp for call dummy", Sw, C::Longjmp, true),
            Exception => traits("exception", Sw, C::Longjmp, true),
            ExceptionResume => traits("exception resume", Sw, C::LongjmpResume, true),
            StepResume => traits("step resume", Sw, C::StepResume, true),
            HpStepResume => traits("high-priority step resume", Sw, C::HpStepResume, true),
            WatchpointScope => traits("watchpoint scope", Sw, C::KeepChecking, true),
            CallDummy => traits("call dummy", Sw, C::CallDummy, true),
            StdTerminate => traits("std::terminate", Sw, C::StdTerminate, true),
            ShlibEvent => traits("shlib events", Sw, C::Ordinary, true),
            ThreadEvent => traits("thread events", Sw, C::KeepChecking, true),
            OverlayEvent => traits("overlay events", Sw, C::KeepChecking, true),
            JitEvent => traits("jit events", Sw, C::Single, true),
            LongjmpMaster => traits("longjmp master", Sw, C::KeepChecking, true),
            StdTerminateMaster => traits("std::terminate master", Sw, C::KeepChecking, true),
            ExceptionMaster => traits("exception master", Sw, C::KeepChecking, true),
            Tracepoint => traits("tracepoint", LocKind::Tracepoint, C::KeepChecking, false),
            FastTracepoint => traits("fast tracepoint", LocKind::Tracepoint, C::KeepChecking, false),
            StaticTracepoint => {
                traits("static tracepoint", LocKind::Tracepoint, C::KeepChecking, false)
            }
            StaticMarkerTracepoint => traits(
                "static marker tracepoint",
                LocKind::Tracepoint,
                C::KeepChecking,
                false,
            ),
            Dprintf => traits("dprintf", Sw, C::Dprintf, false),
            Catchpoint => traits("catchpoint", Other, C::Catch, false),
            GnuIfuncResolver => traits("STT_GNU_IFUNC resolver", Sw, C::Single, true),
            GnuIfuncResolverReturn => {
                traits("STT_GNU_IFUNC resolver return", Sw, C::KeepChecking, true)
            }
        }
    }

    /// 停止判定の結果からこのノードの動作を決める
    pub fn action(self, stop: bool, print: bool) -> MainAction {
        let report = if print {
            MainAction::StopNoisy
        } else {
            MainAction::StopSilent
        };
        match self.traits().stop_class {
            StopClass::Ordinary => {
                if stop {
                    report
                } else {
                    MainAction::Single
                }
            }
            StopClass::Watch => {
                if stop {
                    report
                } else {
                    MainAction::KeepChecking
                }
            }
            StopClass::Catch => {
                if stop {
                    report
                } else {
                    MainAction::KeepChecking
                }
            }
            StopClass::Dprintf => {
                if stop {
                    MainAction::StopSilent
                } else {
                    MainAction::Single
                }
            }
            StopClass::Longjmp => {
                if stop {
                    MainAction::SetLongjmpResume
                } else {
                    MainAction::Single
                }
            }
            StopClass::LongjmpResume => {
                if stop {
                    MainAction::ClearLongjmpResume
                } else {
                    MainAction::Single
                }
            }
            StopClass::StepResume => {
                if stop {
                    MainAction::StepResume
                } else {
                    MainAction::Single
                }
            }
            StopClass::HpStepResume => {
                if stop {
                    MainAction::HpStepResume
                } else {
                    MainAction::Single
                }
            }
            StopClass::CallDummy => MainAction::PopCallDummy,
            StopClass::StdTerminate => MainAction::StopSilent,
            StopClass::KeepChecking => MainAction::KeepChecking,
            StopClass::Single => MainAction::Single,
        }
    }

    /// ソフトウェア・ハードウェアを問わずウォッチポイントか
    pub fn is_watchpoint(self) -> bool {
        matches!(
            self,
            BreakpointKind::Watchpoint
                | BreakpointKind::HwWatchpoint
                | BreakpointKind::ReadWatchpoint
                | BreakpointKind::AccessWatchpoint
        )
    }

    pub fn is_hardware_watchpoint(self) -> bool {
        matches!(
            self,
            BreakpointKind::HwWatchpoint
                | BreakpointKind::ReadWatchpoint
                | BreakpointKind::AccessWatchpoint
        )
    }

    pub fn is_tracepoint(self) -> bool {
        matches!(
            self,
            BreakpointKind::Tracepoint
                | BreakpointKind::FastTracepoint
                | BreakpointKind::StaticTracepoint
                | BreakpointKind::StaticMarkerTracepoint
        )
    }

    /// 条件式を持ち、ターゲット側で評価できるコードブレークポイントか
    pub fn is_breakpoint(self) -> bool {
        matches!(
            self,
            BreakpointKind::Breakpoint | BreakpointKind::HwBreakpoint | BreakpointKind::Dprintf
        )
    }

    pub fn is_catchpoint(self) -> bool {
        self == BreakpointKind::Catchpoint
    }

    /// longjmp 系か（例外系は含まない）
    pub fn is_longjmp(self) -> bool {
        matches!(
            self,
            BreakpointKind::Longjmp | BreakpointKind::LongjmpCallDummy
        )
    }

    /// ハードウェアウォッチポイントの種類に対応するアクセス種別
    pub fn watch_kind(self) -> Option<WatchKind> {
        match self {
            BreakpointKind::Watchpoint | BreakpointKind::HwWatchpoint => Some(WatchKind::Write),
            BreakpointKind::ReadWatchpoint => Some(WatchKind::Read),
            BreakpointKind::AccessWatchpoint => Some(WatchKind::Access),
            _ => None,
        }
    }

    /// アクセス種別からハードウェアウォッチポイントの種類を決める
    pub fn hw_watchpoint(kind: WatchKind) -> Self {
        match kind {
            WatchKind::Write => BreakpointKind::HwWatchpoint,
            WatchKind::Read => BreakpointKind::ReadWatchpoint,
            WatchKind::Access => BreakpointKind::AccessWatchpoint,
        }
    }
}

impl fmt::Display for BreakpointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.traits().name)
    }
}
