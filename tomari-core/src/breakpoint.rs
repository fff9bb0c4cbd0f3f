//! ブレークポイント

use crate::kind::BreakpointKind;
use crate::location::LocationId;
use crate::pspace::ProgramSpaceId;
use std::fmt;
use tomari_expr::{Expression, Scope, Value};
use tomari_target::{CatchKind, FrameId, InferiorId, TaskId, ThreadId, WatchKind};

/// ブレークポイント番号（負の番号は内部用）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BreakpointId(pub i32);

impl BreakpointId {
    /// ユーザーが作成したブレークポイントか
    pub fn is_user(self) -> bool {
        self.0 > 0
    }
}

impl fmt::Display for BreakpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 有効状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnableState {
    Enabled,
    Disabled,
    /// 関数呼び出しの間だけ無効
    CallDisabled,
}

/// ヒット時の処理
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Keep,
    /// 停止したら削除する
    Delete,
    /// 次の停止で削除する
    DeleteAtNextStop,
    /// 停止したら無効にする（`enable_count` 回目で）
    Disable,
}

impl Disposition {
    pub fn short_name(self) -> &'static str {
        match self {
            Disposition::Keep => "keep",
            Disposition::Delete => "del",
            Disposition::DeleteAtNextStop => "dstp",
            Disposition::Disable => "dis",
        }
    }
}

/// スレッド・タスク・インフェリアによる制限（同時に1つまで）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Restriction {
    Any,
    Thread(ThreadId),
    Task(TaskId),
    Inferior(InferiorId),
}

/// ウォッチポイントの状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    Unevaluated,
    InScope,
    OutOfScope,
    Deleted,
}

/// ハードウェアウォッチポイントが直前の停止で発火したか
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchTriggered {
    No,
    Yes,
    /// 発火したが対象のアドレスが分からない
    Unknown,
}

/// ウォッチポイント固有のデータ
#[derive(Debug, Clone)]
pub struct WatchData {
    /// 要求されたアクセス種別
    pub access: WatchKind,
    pub expr_text: String,
    pub expr: Option<Expression>,
    /// 式が有効なレキシカルスコープ
    pub valid_scope: Option<Scope>,
    /// 式をパースしたPC
    pub scope_pc: Option<u64>,
    /// 式が参照するフレーム
    pub frame: Option<FrameId>,
    /// 式が参照するスレッド
    pub thread: Option<ThreadId>,
    pub cond_expr: Option<Expression>,
    /// 直前に確認した値
    pub value: Option<Value>,
    pub value_valid: bool,
    pub state: WatchState,
    pub triggered: WatchTriggered,
    pub mask: Option<u64>,
    /// ソフトウェアへの格下げを警告済み
    pub downgrade_warned: bool,
}

impl WatchData {
    pub fn new(access: WatchKind, expr: Expression) -> Self {
        Self {
            access,
            expr_text: expr.text.clone(),
            valid_scope: expr.innermost_scope(),
            expr: Some(expr),
            scope_pc: None,
            frame: None,
            thread: None,
            cond_expr: None,
            value: None,
            value_valid: false,
            state: WatchState::Unevaluated,
            triggered: WatchTriggered::No,
            mask: None,
            downgrade_warned: false,
        }
    }

    /// ソフトウェアウォッチポイントとしても動作できるか
    pub fn works_in_software_mode(&self) -> bool {
        self.access == WatchKind::Write && self.mask.is_none()
    }
}

/// dprintf の書式と引数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DprintfData {
    pub format: String,
    pub args: Vec<String>,
}

/// 種類固有のデータ
#[derive(Debug, Clone)]
pub enum KindData {
    None,
    Watch(Box<WatchData>),
    Dprintf(DprintfData),
    Catch(CatchKind),
}

/// ブレークポイント
#[derive(Debug, Clone)]
pub struct Breakpoint {
    pub id: BreakpointId,
    pub kind: BreakpointKind,
    pub enable_state: EnableState,
    pub disposition: Disposition,
    /// `Disable` のとき、無効になるまでの停止回数
    pub enable_count: u32,
    pub cond_string: Option<String>,
    pub ignore_count: u32,
    pub hit_count: u32,
    pub restriction: Restriction,
    /// 特定のフレームでのみ停止する
    pub frame: Option<FrameId>,
    /// 停止を報告しない
    pub silent: bool,
    /// 再解決に使う場所の指定
    pub location_spec: Option<String>,
    /// 解決先のプログラム空間
    pub pspace: ProgramSpaceId,
    /// 関連するブレークポイント（ウォッチポイントとそのスコープブレークポイント）
    pub related: Option<BreakpointId>,
    /// アドレス順のロケーション
    pub locations: Vec<LocationId>,
    pub data: KindData,
}

impl Breakpoint {
    pub fn new(id: BreakpointId, kind: BreakpointKind, pspace: ProgramSpaceId) -> Self {
        Self {
            id,
            kind,
            enable_state: EnableState::Enabled,
            disposition: Disposition::Keep,
            enable_count: 0,
            cond_string: None,
            ignore_count: 0,
            hit_count: 0,
            restriction: Restriction::Any,
            frame: None,
            silent: false,
            location_spec: None,
            pspace,
            related: None,
            locations: Vec::new(),
            data: KindData::None,
        }
    }

    pub fn number(&self) -> i32 {
        self.id.0
    }

    pub fn is_enabled(&self) -> bool {
        self.enable_state == EnableState::Enabled
    }

    /// ロケーションを持たない保留中のブレークポイントか
    pub fn is_pending(&self) -> bool {
        self.locations.is_empty()
    }

    pub fn watch(&self) -> Option<&WatchData> {
        match &self.data {
            KindData::Watch(w) => Some(w),
            _ => None,
        }
    }

    pub fn watch_mut(&mut self) -> Option<&mut WatchData> {
        match &mut self.data {
            KindData::Watch(w) => Some(w),
            _ => None,
        }
    }

    pub fn dprintf(&self) -> Option<&DprintfData> {
        match &self.data {
            KindData::Dprintf(d) => Some(d),
            _ => None,
        }
    }

    pub fn catch_kind(&self) -> Option<&CatchKind> {
        match &self.data {
            KindData::Catch(c) => Some(c),
            _ => None,
        }
    }

    pub fn is_masked_watchpoint(&self) -> bool {
        self.watch().map(|w| w.mask.is_some()).unwrap_or(false)
    }
}

/// シンボル解決層が返す1つの解決結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedLocation {
    pub address: u64,
    pub pspace: ProgramSpaceId,
    pub function: Option<String>,
    pub line: Option<u32>,
}

impl ResolvedLocation {
    pub fn new(address: u64) -> Self {
        Self {
            address,
            pspace: ProgramSpaceId::INITIAL,
            function: None,
            line: None,
        }
    }

    pub fn in_pspace(mut self, pspace: ProgramSpaceId) -> Self {
        self.pspace = pspace;
        self
    }

    pub fn function(mut self, name: &str) -> Self {
        self.function = Some(name.to_string());
        self
    }
}

/// 場所の指定を解決するシンボル解決層
pub trait LocationResolver {
    /// 場所の指定をアドレスの一覧に解決する（見つからなければ空）
    fn resolve(&self, spec: &str, pspace: ProgramSpaceId) -> Vec<ResolvedLocation>;
}

/// コードブレークポイントの作成要求
#[derive(Debug, Clone)]
pub struct BreakpointRequest {
    pub kind: BreakpointKind,
    pub locations: Vec<ResolvedLocation>,
    pub location_spec: Option<String>,
    pub condition: Option<String>,
    /// どのロケーションでも条件式が不正でも作成する
    pub force_condition: bool,
    pub thread: Option<ThreadId>,
    pub task: Option<TaskId>,
    pub inferior: Option<InferiorId>,
    pub ignore_count: u32,
    pub disposition: Disposition,
    pub enabled: bool,
    pub frame: Option<FrameId>,
    /// 範囲ブレークポイントの長さ
    pub length: usize,
    pub silent: bool,
}

impl BreakpointRequest {
    pub fn new(kind: BreakpointKind) -> Self {
        Self {
            kind,
            locations: Vec::new(),
            location_spec: None,
            condition: None,
            force_condition: false,
            thread: None,
            task: None,
            inferior: None,
            ignore_count: 0,
            disposition: Disposition::Keep,
            enabled: true,
            frame: None,
            length: 0,
            silent: false,
        }
    }

    /// アドレスにロケーションを追加する
    pub fn at(mut self, address: u64) -> Self {
        self.locations.push(ResolvedLocation::new(address));
        self
    }

    pub fn location(mut self, loc: ResolvedLocation) -> Self {
        self.locations.push(loc);
        self
    }

    pub fn spec(mut self, spec: &str) -> Self {
        self.location_spec = Some(spec.to_string());
        self
    }

    pub fn condition(mut self, cond: &str) -> Self {
        self.condition = Some(cond.to_string());
        self
    }

    pub fn force_condition(mut self) -> Self {
        self.force_condition = true;
        self
    }

    pub fn thread(mut self, thread: ThreadId) -> Self {
        self.thread = Some(thread);
        self
    }

    pub fn task(mut self, task: TaskId) -> Self {
        self.task = Some(task);
        self
    }

    pub fn inferior(mut self, inferior: InferiorId) -> Self {
        self.inferior = Some(inferior);
        self
    }

    pub fn ignore_count(mut self, count: u32) -> Self {
        self.ignore_count = count;
        self
    }

    /// 一時ブレークポイント（停止したら削除）
    pub fn temporary(mut self) -> Self {
        self.disposition = Disposition::Delete;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn frame(mut self, frame: FrameId) -> Self {
        self.frame = Some(frame);
        self
    }

    pub fn length(mut self, length: usize) -> Self {
        self.length = length;
        self
    }

    pub fn silent(mut self) -> Self {
        self.silent = true;
        self
    }
}

/// ウォッチポイントの作成要求
#[derive(Debug, Clone)]
pub struct WatchRequest {
    pub expr: String,
    pub access: WatchKind,
    pub condition: Option<String>,
    pub thread: Option<ThreadId>,
    pub task: Option<TaskId>,
    pub mask: Option<u64>,
}

impl WatchRequest {
    pub fn new(expr: &str, access: WatchKind) -> Self {
        Self {
            expr: expr.to_string(),
            access,
            condition: None,
            thread: None,
            task: None,
            mask: None,
        }
    }

    pub fn condition(mut self, cond: &str) -> Self {
        self.condition = Some(cond.to_string());
        self
    }

    pub fn thread(mut self, thread: ThreadId) -> Self {
        self.thread = Some(thread);
        self
    }

    pub fn task(mut self, task: TaskId) -> Self {
        self.task = Some(task);
        self
    }

    /// アドレスをマスクして比較する
    pub fn mask(mut self, mask: u64) -> Self {
        self.mask = Some(mask);
        self
    }
}
