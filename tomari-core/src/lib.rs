//! tomari ブレークポイント管理コア
//!
//! ユーザーと内部のブレークポイント・ウォッチポイント・キャッチポイントを管理し、
//! 論理的なブレークポイントの集合とターゲットに実際に挿入されたトラップを一致させます。
//! ターゲットが停止したときには、どのブレークポイントが停止を説明するかを判定し、
//! 停止するか・報告するか・実行を続けるかを決めます。
//!
//! - [`Debugger`]: ブレークポイントの登録簿とターゲットを持つセッション
//! - 挿入の再調整: [`Debugger::reconcile`], [`Debugger::insert_breakpoints`]
//! - 停止の判定: [`Debugger::on_target_stop`]

pub mod breakpoint;
pub mod command;
pub mod debugger;
pub mod errors;
pub mod info;
pub mod insert;
pub mod kind;
pub mod lifecycle;
pub mod location;
pub mod memory;
pub mod notify;
pub mod pspace;
pub mod registry;
pub mod resources;
pub mod settings;
pub mod stop;
pub mod watchpoint;

pub use breakpoint::{
    Breakpoint, BreakpointId, BreakpointRequest, Disposition, EnableState, LocationResolver,
    ResolvedLocation, Restriction, WatchRequest, WatchState,
};
pub use command::Command;
pub use debugger::Debugger;
pub use errors::{BreakpointError, ReconcileReport, Result};
pub use info::{render_breakpoint_table, BreakpointInfo, LocationInfo};
pub use kind::{BreakpointKind, MainAction};
pub use location::{Location, LocationId};
pub use memory::BreakpointHere;
pub use notify::{BreakpointEvent, BreakpointObserver, EventLog};
pub use pspace::{AddressSpaceId, Library, ProgramSpaceId};
pub use settings::BreakpointSettings;
pub use stop::{StopNode, StopRecord, Verdict};
pub use watchpoint::WatchCheck;

// 他のクレートから使用するために再エクスポート
pub use tomari_target::{CatchKind, StopReason, Target, TargetEvent, WatchKind};
