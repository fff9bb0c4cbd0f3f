//! ターゲット上のブレークポイント・ウォッチポイント

use crate::{Result, Target, TargetError};
use tomari_expr::Bytecode;

/// トラップ命令（INT3）のオペコード
pub const TRAP_OPCODE: u8 = 0xCC;

/// トラップ命令のバイト数
pub const TRAP_LEN: usize = 1;

/// ターゲットに挿入されたブレークポイントの状態
///
/// 重複グループのプライマリが入れ替わる際は、この構造体ごと付け替えます。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetBreakpoint {
    /// 要求されたアドレス
    pub requested_address: u64,
    /// 実際にトラップを置いたアドレス
    pub placed_address: u64,
    /// トラップのバイト数
    pub placed_size: usize,
    /// 範囲ブレークポイントの長さ
    pub length: usize,
    /// トラップで上書きした元のバイト列
    pub shadow: Vec<u8>,
    /// ハードウェアスロット番号などターゲット固有の識別子
    pub handle: Option<u64>,
    /// ターゲット側で評価する条件式
    pub conditions: Vec<Bytecode>,
    /// ターゲット側で実行するコマンド
    pub commands: Vec<Bytecode>,
    /// デバッガ切断後もコマンドを残すか
    pub persist: bool,
}

impl TargetBreakpoint {
    /// 新しい挿入要求を作成する
    pub fn new(address: u64, length: usize) -> Self {
        Self {
            requested_address: address,
            placed_address: address,
            length,
            ..Default::default()
        }
    }

    /// トラップ命令を書き込む
    ///
    /// 元のバイトを `shadow` に退避してから 0xCC で置き換えます。
    pub fn place_trap<T: Target + ?Sized>(&mut self, target: &mut T) -> Result<()> {
        let address = self.requested_address;

        let original = target
            .read(address, TRAP_LEN)
            .map_err(|_| TargetError::MemoryAccess { address })?;

        target
            .write_memory(address, &[TRAP_OPCODE])
            .map_err(|_| TargetError::MemoryAccess { address })?;

        self.placed_address = address;
        self.placed_size = TRAP_LEN;
        self.shadow = original;
        Ok(())
    }

    /// トラップ命令を元のバイトに戻す
    pub fn lift_trap<T: Target + ?Sized>(&mut self, target: &mut T) -> Result<()> {
        if self.shadow.is_empty() {
            return Err(TargetError::NotInserted {
                address: self.placed_address,
            });
        }

        let address = self.placed_address;
        target
            .write_memory(address, &self.shadow)
            .map_err(|_| TargetError::MemoryAccess { address })?;

        self.shadow.clear();
        Ok(())
    }
}

/// ウォッチポイントのアクセス種別
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchKind {
    /// 書き込み
    Write,
    /// 読み取り
    Read,
    /// 読み書き
    Access,
}

impl std::fmt::Display for WatchKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WatchKind::Write => "write",
            WatchKind::Read => "read",
            WatchKind::Access => "access",
        };
        f.write_str(s)
    }
}

/// ハードウェア資源の種類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HwKind {
    Breakpoint,
    Watchpoint(WatchKind),
}

/// ハードウェア資源の問い合わせ結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HwCapability {
    /// 使用可能
    Yes,
    /// 数が足りない
    Exceeded,
    /// この種類には対応していない
    Unsupported,
}

/// キャッチポイントで捕捉するイベント
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatchKind {
    Fork,
    Vfork,
    Exec,
    /// 指定なしなら全てのシステムコール
    Syscall(Vec<u32>),
    /// 指定なしなら全てのシグナル
    Signal(Vec<i32>),
    Load(Option<String>),
    Unload(Option<String>),
}

impl std::fmt::Display for CatchKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fn list<T: std::fmt::Display>(items: &[T]) -> String {
            items
                .iter()
                .map(|i| i.to_string())
                .collect::<Vec<_>>()
                .join(" ")
        }
        match self {
            CatchKind::Fork => write!(f, "fork"),
            CatchKind::Vfork => write!(f, "vfork"),
            CatchKind::Exec => write!(f, "exec"),
            CatchKind::Syscall(nums) if nums.is_empty() => write!(f, "syscall"),
            CatchKind::Syscall(nums) => write!(f, "syscall {}", list(nums)),
            CatchKind::Signal(sigs) if sigs.is_empty() => write!(f, "signal"),
            CatchKind::Signal(sigs) => write!(f, "signal {}", list(sigs)),
            CatchKind::Load(Some(re)) => write!(f, "load {}", re),
            CatchKind::Load(None) => write!(f, "load"),
            CatchKind::Unload(Some(re)) => write!(f, "unload {}", re),
            CatchKind::Unload(None) => write!(f, "unload"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimTarget;

    #[test]
    fn test_place_and_lift_trap() {
        let mut target = SimTarget::new();
        target.map(0x1000, &[0x55, 0x48, 0x89]);

        let mut bp = TargetBreakpoint::new(0x1001, 1);
        bp.place_trap(&mut target).unwrap();
        assert_eq!(bp.shadow, vec![0x48]);
        assert_eq!(target.peek(0x1001, 1), vec![TRAP_OPCODE]);

        bp.lift_trap(&mut target).unwrap();
        assert_eq!(target.peek(0x1001, 1), vec![0x48]);
        assert!(bp.shadow.is_empty());

        assert!(matches!(
            bp.lift_trap(&mut target),
            Err(TargetError::NotInserted { .. })
        ));
    }

    #[test]
    fn test_catch_kind_display() {
        assert_eq!(CatchKind::Syscall(vec![1, 60]).to_string(), "syscall 1 60");
        assert_eq!(CatchKind::Signal(vec![]).to_string(), "signal");
        assert_eq!(CatchKind::Load(Some("libm".into())).to_string(), "load libm");
    }
}
