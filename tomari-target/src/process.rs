//! 停止理由とプロセス制御

/// SIGTRAP のシグナル番号
pub const SIGTRAP: i32 = 5;

/// 停止を引き起こしたターゲットイベント
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetEvent {
    Fork { child: i32 },
    Vfork { child: i32 },
    Exec { path: String },
    SyscallEntry(u32),
    SyscallReturn(u32),
    LibraryLoaded(String),
    LibraryUnloaded(String),
}

/// 停止イベントの種類
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// ブレークポイントヒット（SIGTRAP）
    Breakpoint,
    /// ステップ実行完了（SIGTRAP）
    Step,
    /// ウォッチポイントの発火
    Watchpoint { data_address: Option<u64> },
    /// シグナル受信
    Signal(i32),
    /// fork/exec/システムコール/ライブラリのロードなど
    Event(TargetEvent),
    /// プロセス終了
    Exited(i32),
    /// その他の停止
    Other,
}

impl StopReason {
    /// トラップ由来の停止かどうか
    pub fn is_trap(&self) -> bool {
        matches!(
            self,
            StopReason::Breakpoint | StopReason::Step | StopReason::Watchpoint { .. }
        ) || *self == StopReason::Signal(SIGTRAP)
    }

    /// 停止時のシグナル番号
    pub fn signal(&self) -> Option<i32> {
        match self {
            StopReason::Breakpoint | StopReason::Step | StopReason::Watchpoint { .. } => {
                Some(SIGTRAP)
            }
            StopReason::Signal(sig) => Some(*sig),
            _ => None,
        }
    }
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub use self::linux::Process;

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
mod linux {
    use super::StopReason;
    use nix::sys::signal::Signal;
    use nix::sys::wait::WaitStatus;
    use std::ffi::CString;
    use std::path::Path;

    /// デバッグ対象のプロセス
    pub struct Process {
        pid: nix::unistd::Pid,
        exited: bool,
    }

    fn stop_reason_from(status: WaitStatus, trap: StopReason) -> StopReason {
        match status {
            WaitStatus::Stopped(_, Signal::SIGTRAP) => trap,
            WaitStatus::Stopped(_, signal) => StopReason::Signal(signal as i32),
            WaitStatus::Exited(_, code) => StopReason::Exited(code),
            WaitStatus::Signaled(_, signal, _) => StopReason::Signal(signal as i32),
            _ => StopReason::Other,
        }
    }

    impl Process {
        /// 実行可能ファイルを起動してデバッグ対象プロセスを開始する
        ///
        /// forkした子プロセスで PTRACE_TRACEME を設定してから execve します。
        /// プロセスは execve 直後に停止した状態で返されます。
        pub fn spawn<P: AsRef<Path>>(program: P, args: &[String]) -> anyhow::Result<Self> {
            use nix::sys::ptrace;
            use nix::sys::wait::waitpid;
            use nix::unistd::{execve, fork, ForkResult};

            let program_path = program
                .as_ref()
                .to_str()
                .ok_or_else(|| anyhow::anyhow!("Invalid program path"))?;
            let program_cstring = CString::new(program_path)?;

            let mut cstring_args = vec![program_cstring.clone()];
            for arg in args {
                cstring_args.push(CString::new(arg.as_str())?);
            }

            // 環境変数は親プロセスから継承
            let env: Vec<CString> = std::env::vars()
                .map(|(key, val)| {
                    CString::new(format!("{}={}", key, val)).map_err(anyhow::Error::from)
                })
                .collect::<anyhow::Result<Vec<_>>>()?;

            match unsafe { fork()? } {
                ForkResult::Parent { child } => match waitpid(child, None)? {
                    WaitStatus::Stopped(_, _) => Ok(Self {
                        pid: child,
                        exited: false,
                    }),
                    status => Err(anyhow::anyhow!(
                        "Unexpected wait status after execve: {:?}",
                        status
                    )),
                },
                ForkResult::Child => {
                    if ptrace::traceme().is_err() {
                        std::process::exit(127);
                    }
                    let _ = execve(&program_cstring, &cstring_args, &env);
                    // execve が失敗した場合のみここに到達する
                    std::process::exit(127);
                }
            }
        }

        /// 既存のプロセスにアタッチする
        pub fn attach(pid: i32) -> anyhow::Result<Self> {
            let pid = nix::unistd::Pid::from_raw(pid);
            nix::sys::ptrace::attach(pid)?;
            nix::sys::wait::waitpid(pid, None)?;
            Ok(Self { pid, exited: false })
        }

        /// プロセスIDを取得する
        pub fn pid(&self) -> i32 {
            self.pid.as_raw()
        }

        /// プロセスが終了したか
        pub fn has_exited(&self) -> bool {
            self.exited
        }

        /// プロセスを実行継続して停止イベントを待機する
        pub fn continue_and_wait(&mut self) -> anyhow::Result<StopReason> {
            nix::sys::ptrace::cont(self.pid, None)?;
            let status = nix::sys::wait::waitpid(self.pid, None)?;
            let reason = stop_reason_from(status, StopReason::Breakpoint);
            self.exited = matches!(reason, StopReason::Exited(_));
            Ok(reason)
        }

        /// 1命令だけ実行して停止する
        pub fn step(&mut self) -> anyhow::Result<StopReason> {
            nix::sys::ptrace::step(self.pid, None)?;
            let status = nix::sys::wait::waitpid(self.pid, None)?;
            let reason = stop_reason_from(status, StopReason::Step);
            self.exited = matches!(reason, StopReason::Exited(_));
            Ok(reason)
        }
    }

    impl Drop for Process {
        fn drop(&mut self) {
            if !self.exited {
                let _ = nix::sys::ptrace::detach(self.pid, None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trap_classification() {
        assert!(StopReason::Breakpoint.is_trap());
        assert!(StopReason::Signal(SIGTRAP).is_trap());
        assert!(!StopReason::Signal(11).is_trap());
        assert!(!StopReason::Event(TargetEvent::Fork { child: 2 }).is_trap());
        assert_eq!(StopReason::Watchpoint { data_address: None }.signal(), Some(SIGTRAP));
        assert_eq!(StopReason::Exited(0).signal(), None);
    }
}
