//! ブレークポイントの変更通知

use crate::breakpoint::{Breakpoint, BreakpointId};
use std::cell::RefCell;
use std::rc::Rc;

/// 作成・変更・削除の通知を受け取る
///
/// フロントエンドが表示を更新するために使います。戻り値はありません。
pub trait BreakpointObserver {
    fn breakpoint_created(&mut self, _bp: &Breakpoint) {}
    fn breakpoint_modified(&mut self, _bp: &Breakpoint) {}
    fn breakpoint_deleted(&mut self, _bp: &Breakpoint) {}
}

/// 通知の種類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakpointEvent {
    Created(BreakpointId),
    Modified(BreakpointId),
    Deleted(BreakpointId),
}

/// 通知を記録するだけのオブザーバ
///
/// クローンは同じ記録を共有するので、一方をデバッガに登録して
/// もう一方から読み出せます。
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    events: Rc<RefCell<Vec<BreakpointEvent>>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// 記録された通知を取り出す
    pub fn take(&self) -> Vec<BreakpointEvent> {
        std::mem::take(&mut *self.events.borrow_mut())
    }

    pub fn len(&self) -> usize {
        self.events.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BreakpointObserver for EventLog {
    fn breakpoint_created(&mut self, bp: &Breakpoint) {
        self.events.borrow_mut().push(BreakpointEvent::Created(bp.id));
    }

    fn breakpoint_modified(&mut self, bp: &Breakpoint) {
        self.events.borrow_mut().push(BreakpointEvent::Modified(bp.id));
    }

    fn breakpoint_deleted(&mut self, bp: &Breakpoint) {
        self.events.borrow_mut().push(BreakpointEvent::Deleted(bp.id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kind::BreakpointKind;
    use crate::pspace::ProgramSpaceId;

    #[test]
    fn test_event_log_shares_records() {
        let log = EventLog::new();
        let mut observer: Box<dyn BreakpointObserver> = Box::new(log.clone());
        let bp = Breakpoint::new(
            BreakpointId(1),
            BreakpointKind::Breakpoint,
            ProgramSpaceId::INITIAL,
        );

        observer.breakpoint_created(&bp);
        observer.breakpoint_deleted(&bp);

        assert_eq!(
            log.take(),
            vec![
                BreakpointEvent::Created(BreakpointId(1)),
                BreakpointEvent::Deleted(BreakpointId(1))
            ]
        );
        assert!(log.is_empty());
    }
}
