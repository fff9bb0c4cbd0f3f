//! 実プロセスのメモリアクセス

use nix::unistd::Pid;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read as _, Seek, SeekFrom, Write as _};

/// メモリマッピング情報
#[derive(Debug, Clone)]
pub struct MemoryMapping {
    pub start: u64,
    pub end: u64,
    pub readable: bool,
    pub writable: bool,
    pub executable: bool,
}

impl MemoryMapping {
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }
}

/// /proc/pid/maps の1行をパースする
///
/// フォーマット: "address perms offset dev inode pathname"
fn parse_mapping(line: &str) -> Option<MemoryMapping> {
    let mut parts = line.split_whitespace();
    let range = parts.next()?;
    let perms = parts.next()?;

    let (start, end) = range.split_once('-')?;
    let start = u64::from_str_radix(start, 16).ok()?;
    let end = u64::from_str_radix(end, 16).ok()?;

    let mut flags = perms.chars();
    Some(MemoryMapping {
        start,
        end,
        readable: flags.next() == Some('r'),
        writable: flags.next() == Some('w'),
        executable: flags.next() == Some('x'),
    })
}

/// メモリアクセス
pub struct Memory {
    pid: Pid,
}

impl Memory {
    pub fn new(pid: i32) -> Self {
        Self {
            pid: Pid::from_raw(pid),
        }
    }

    fn mem_path(&self) -> String {
        format!("/proc/{}/mem", self.pid)
    }

    /// メモリからデータを読み取る
    ///
    /// /proc/pid/mem が使えない場合（EIO）は PTRACE_PEEKDATA にフォールバックします。
    pub fn read(&self, addr: u64, size: usize) -> anyhow::Result<Vec<u8>> {
        match self.read_via_proc_mem(addr, size) {
            Ok(data) => Ok(data),
            Err(e) => {
                if let Some(io_err) = e.downcast_ref::<std::io::Error>() {
                    if io_err.raw_os_error() == Some(nix::libc::EIO) {
                        return self.read_via_ptrace(addr, size);
                    }
                }
                Err(e)
            }
        }
    }

    fn read_via_proc_mem(&self, addr: u64, size: usize) -> anyhow::Result<Vec<u8>> {
        let mut file = File::open(self.mem_path())?;
        file.seek(SeekFrom::Start(addr))?;
        let mut buffer = vec![0u8; size];
        file.read_exact(&mut buffer)?;
        Ok(buffer)
    }

    /// PTRACE_PEEKDATA でワード単位に読み取る
    pub fn read_via_ptrace(&self, addr: u64, size: usize) -> anyhow::Result<Vec<u8>> {
        use nix::sys::ptrace;

        let mut data = Vec::with_capacity(size);
        let word_size = std::mem::size_of::<usize>();

        for offset in (0..size).step_by(word_size) {
            let word_addr = (addr + offset as u64) as *mut std::ffi::c_void;
            let word = ptrace::read(self.pid, word_addr).map_err(|e| {
                anyhow::anyhow!(
                    "Failed to read via ptrace at 0x{:x}: {}",
                    addr + offset as u64,
                    e
                )
            })?;
            let bytes = word.to_ne_bytes();
            let copy_size = (size - offset).min(word_size);
            data.extend_from_slice(&bytes[..copy_size]);
        }

        Ok(data)
    }

    /// メモリにデータを書き込む
    pub fn write(&self, addr: u64, data: &[u8]) -> anyhow::Result<()> {
        let mem_path = self.mem_path();
        let mut file = OpenOptions::new()
            .write(true)
            .open(&mem_path)
            .map_err(|e| anyhow::anyhow!("Failed to open {} for writing: {}", mem_path, e))?;

        file.seek(SeekFrom::Start(addr))
            .map_err(|e| anyhow::anyhow!("Failed to seek to address 0x{:x}: {}", addr, e))?;

        file.write_all(data).map_err(|e| {
            anyhow::anyhow!("Failed to write {} bytes to 0x{:x}: {}", data.len(), addr, e)
        })?;

        Ok(())
    }

    /// /proc/pid/maps を解析してメモリマッピング情報を取得する
    pub fn get_mappings(&self) -> anyhow::Result<Vec<MemoryMapping>> {
        let maps_path = format!("/proc/{}/maps", self.pid);
        let file = File::open(&maps_path)
            .map_err(|e| anyhow::anyhow!("Failed to open {}: {}", maps_path, e))?;

        let mut mappings = Vec::new();
        for line in BufReader::new(file).lines() {
            if let Some(mapping) = parse_mapping(&line?) {
                mappings.push(mapping);
            }
        }
        Ok(mappings)
    }

    /// アドレスを含むマッピングが書き込み可能か
    pub fn is_writable(&self, addr: u64) -> Option<bool> {
        let mappings = self.get_mappings().ok()?;
        mappings
            .iter()
            .find(|m| m.contains(addr))
            .map(|m| m.writable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mapping() {
        let m = parse_mapping("7f1234567000-7f1234568000 r-xp 00000000 08:01 123456 /lib/libc.so")
            .unwrap();
        assert_eq!(m.start, 0x7f1234567000);
        assert_eq!(m.end, 0x7f1234568000);
        assert!(m.readable);
        assert!(!m.writable);
        assert!(m.executable);
        assert!(m.contains(0x7f1234567800));
        assert!(parse_mapping("garbage").is_none());
    }
}
