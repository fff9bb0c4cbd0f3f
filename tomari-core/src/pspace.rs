//! プログラム空間とアドレス空間

use std::fmt;

/// プログラム空間（1つの実行イメージのアドレスの名前空間）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProgramSpaceId(pub u32);

impl ProgramSpaceId {
    /// セッション開始時に作られるプログラム空間
    pub const INITIAL: ProgramSpaceId = ProgramSpaceId(1);
}

impl fmt::Display for ProgramSpaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// アドレス空間（複数のプログラム空間で共有されることがある）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AddressSpaceId(pub u32);

/// ロードされている共有ライブラリ
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Library {
    pub name: String,
    /// コード領域 `[start, end)`
    pub start: u64,
    pub end: u64,
}

impl Library {
    pub fn new(name: &str, start: u64, end: u64) -> Self {
        Self {
            name: name.to_string(),
            start,
            end,
        }
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }
}

/// プログラム空間
#[derive(Debug, Clone)]
pub struct ProgramSpace {
    pub id: ProgramSpaceId,
    pub aspace: AddressSpaceId,
    pub libraries: Vec<Library>,
    /// 起動処理中はユーザーのブレークポイントを挿入しない
    pub executing_startup: bool,
}

impl ProgramSpace {
    pub fn new(id: ProgramSpaceId, aspace: AddressSpaceId) -> Self {
        Self {
            id,
            aspace,
            libraries: Vec::new(),
            executing_startup: false,
        }
    }

    /// アドレスを含むライブラリ
    pub fn library_at(&self, addr: u64) -> Option<&Library> {
        self.libraries.iter().find(|lib| lib.contains(addr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_lookup() {
        let mut ps = ProgramSpace::new(ProgramSpaceId::INITIAL, AddressSpaceId(1));
        ps.libraries.push(Library::new("libfoo.so", 0x7f00_0000, 0x7f01_0000));
        assert_eq!(
            ps.library_at(0x7f00_1000).map(|l| l.name.as_str()),
            Some("libfoo.so")
        );
        assert!(ps.library_at(0x7f01_0000).is_none());
    }
}
