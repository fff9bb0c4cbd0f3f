//! 実プロセスのレジスタアクセス

use nix::unistd::Pid;

/// 名前で参照できるレジスタ（登録順がレジスタ番号）
pub const REGISTER_NAMES: [&str; 18] = [
    "rax", "rbx", "rcx", "rdx", "rsi", "rdi", "rbp", "rsp", "r8", "r9", "r10", "r11", "r12",
    "r13", "r14", "r15", "rip", "eflags",
];

/// レジスタ情報
pub struct Registers {
    pid: Pid,
}

impl Registers {
    pub fn new(pid: i32) -> Self {
        Self {
            pid: Pid::from_raw(pid),
        }
    }

    pub fn read(&self) -> anyhow::Result<nix::libc::user_regs_struct> {
        Ok(nix::sys::ptrace::getregs(self.pid)?)
    }

    pub fn write(&self, regs: nix::libc::user_regs_struct) -> anyhow::Result<()> {
        nix::sys::ptrace::setregs(self.pid, regs)?;
        Ok(())
    }

    /// プログラムカウンタ（RIP）を取得する
    pub fn get_pc(&self) -> anyhow::Result<u64> {
        Ok(self.read()?.rip)
    }

    /// プログラムカウンタ（RIP）を設定する
    pub fn set_pc(&self, pc: u64) -> anyhow::Result<()> {
        let mut regs = self.read()?;
        regs.rip = pc;
        self.write(regs)
    }

    /// 名前でレジスタを読み取る（`pc` `sp` `fp` の別名も使える）
    pub fn get_by_name(&self, name: &str) -> anyhow::Result<u64> {
        let regs = self.read()?;
        let value = match name {
            "rax" => regs.rax,
            "rbx" => regs.rbx,
            "rcx" => regs.rcx,
            "rdx" => regs.rdx,
            "rsi" => regs.rsi,
            "rdi" => regs.rdi,
            "rbp" | "fp" => regs.rbp,
            "rsp" | "sp" => regs.rsp,
            "r8" => regs.r8,
            "r9" => regs.r9,
            "r10" => regs.r10,
            "r11" => regs.r11,
            "r12" => regs.r12,
            "r13" => regs.r13,
            "r14" => regs.r14,
            "r15" => regs.r15,
            "rip" | "pc" => regs.rip,
            "eflags" => regs.eflags,
            _ => return Err(anyhow::anyhow!("Unknown register '{}'", name)),
        };
        Ok(value)
    }

    /// レジスタ番号で読み取る
    pub fn get_by_number(&self, number: u16) -> anyhow::Result<u64> {
        let name = REGISTER_NAMES
            .get(number as usize)
            .ok_or_else(|| anyhow::anyhow!("Unknown register number {}", number))?;
        self.get_by_name(name)
    }
}
