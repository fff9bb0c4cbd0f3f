//! シンボルとスコープ

/// シンボルの格納場所
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SymbolStorage {
    /// 固定アドレス（グローバル変数）
    Static(u64),
    /// 選択フレームのフレームベースからのオフセット（ローカル変数）
    FrameOffset(i64),
    /// レジスタ
    Register(String),
}

/// レキシカルスコープ（PC範囲 `[start, end)`）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Scope {
    pub start: u64,
    pub end: u64,
}

impl Scope {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, pc: u64) -> bool {
        pc >= self.start && pc < self.end
    }

    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// シンボル情報
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    pub name: String,
    pub storage: SymbolStorage,
    /// バイト数（8を超えるものは配列・構造体として扱う）
    pub size: usize,
    /// ローカルシンボルのスコープ。グローバルなら `None`
    pub scope: Option<Scope>,
    pub signed: bool,
}

impl Symbol {
    pub fn global(name: &str, address: u64, size: usize) -> Self {
        Self {
            name: name.to_string(),
            storage: SymbolStorage::Static(address),
            size,
            scope: None,
            signed: false,
        }
    }

    pub fn local(name: &str, frame_offset: i64, size: usize, scope: Scope) -> Self {
        Self {
            name: name.to_string(),
            storage: SymbolStorage::FrameOffset(frame_offset),
            size,
            scope: Some(scope),
            signed: false,
        }
    }

    /// 符号付きとしてマークする
    pub fn signed(mut self) -> Self {
        self.signed = true;
        self
    }

    /// 配列・構造体のような集成型かどうか
    pub fn is_aggregate(&self) -> bool {
        self.size > 8
    }
}

/// シンボル検索
///
/// シンボル解決層が実装します。パースはこのトレイト越しに識別子を束縛します。
pub trait SymbolLookup {
    /// `scope_pc` で可視なシンボルを名前で検索する
    fn lookup_symbol(&self, name: &str, scope_pc: Option<u64>) -> Option<Symbol>;

    /// レジスタ名をターゲットのレジスタ番号に変換する
    fn register_number(&self, _name: &str) -> Option<u16> {
        None
    }
}

/// 単純なシンボルテーブル
#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    symbols: Vec<Symbol>,
    registers: Vec<String>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// シンボルを追加する
    pub fn add(&mut self, symbol: Symbol) {
        self.symbols.push(symbol);
    }

    /// レジスタを登録する（登録順がレジスタ番号になる）
    pub fn add_register(&mut self, name: &str) -> u16 {
        if let Some(pos) = self.registers.iter().position(|r| r == name) {
            return pos as u16;
        }
        self.registers.push(name.to_string());
        (self.registers.len() - 1) as u16
    }

    /// 全てのシンボルを取得する
    pub fn symbols(&self) -> impl Iterator<Item = &Symbol> {
        self.symbols.iter()
    }
}

impl SymbolLookup for SymbolTable {
    fn lookup_symbol(&self, name: &str, scope_pc: Option<u64>) -> Option<Symbol> {
        // 最も内側のスコープのローカルシンボルを優先する
        let local = scope_pc.and_then(|pc| {
            self.symbols
                .iter()
                .filter(|s| s.name == name)
                .filter(|s| s.scope.map(|scope| scope.contains(pc)).unwrap_or(false))
                .min_by_key(|s| s.scope.map(|scope| scope.len()).unwrap_or(u64::MAX))
        });

        local
            .or_else(|| {
                self.symbols
                    .iter()
                    .find(|s| s.name == name && s.scope.is_none())
            })
            .cloned()
    }

    fn register_number(&self, name: &str) -> Option<u16> {
        self.registers
            .iter()
            .position(|r| r == name)
            .map(|pos| pos as u16)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_shadows_global() {
        let mut table = SymbolTable::new();
        table.add(Symbol::global("x", 0x1000, 4));
        table.add(Symbol::local("x", -8, 4, Scope::new(0x400, 0x500)));

        let inside = table.lookup_symbol("x", Some(0x410)).unwrap();
        assert_eq!(inside.storage, SymbolStorage::FrameOffset(-8));

        let outside = table.lookup_symbol("x", Some(0x600)).unwrap();
        assert_eq!(outside.storage, SymbolStorage::Static(0x1000));

        let no_pc = table.lookup_symbol("x", None).unwrap();
        assert_eq!(no_pc.storage, SymbolStorage::Static(0x1000));
    }

    #[test]
    fn test_local_not_visible_outside_scope() {
        let mut table = SymbolTable::new();
        table.add(Symbol::local("tmp", -16, 8, Scope::new(0x400, 0x500)));
        assert!(table.lookup_symbol("tmp", Some(0x500)).is_none());
        assert!(table.lookup_symbol("tmp", None).is_none());
    }

    #[test]
    fn test_register_numbers() {
        let mut table = SymbolTable::new();
        assert_eq!(table.add_register("pc"), 0);
        assert_eq!(table.add_register("sp"), 1);
        assert_eq!(table.add_register("pc"), 0);
        assert_eq!(table.register_number("sp"), Some(1));
        assert_eq!(table.register_number("fp"), None);
    }
}
