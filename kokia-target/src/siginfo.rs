//! PTRACE_GETSIGINFO の結果と si_code の定数

use nix::libc;

pub use libc::{SIGBUS, SIGFPE, SIGILL, SIGKILL, SIGSEGV, SIGSTOP, SIGTRAP};

/// ユーザプロセスからの kill(2)
pub const SI_USER: i32 = 0;
/// カーネルが生成したシグナル
pub const SI_KERNEL: i32 = 0x80;
/// tkill(2) / tgkill(2)
pub const SI_TKILL: i32 = -6;

/// ソフトウェアブレークポイント
pub const TRAP_BRKPT: i32 = 1;
/// シングルステップ
pub const TRAP_TRACE: i32 = 2;
/// ハードウェアブレークポイント / ウォッチポイント
pub const TRAP_HWBKPT: i32 = 4;

pub const PTRACE_EVENT_CLONE: i32 = libc::PTRACE_EVENT_CLONE;
pub const PTRACE_EVENT_EXEC: i32 = libc::PTRACE_EVENT_EXEC;
pub const PTRACE_EVENT_EXIT: i32 = libc::PTRACE_EVENT_EXIT;

/// 停止したスレッドのシグナル情報
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalInfo {
    pub signo: i32,
    pub code: i32,
    /// 送信元プロセスの pid（カーネル生成なら 0）
    pub sender_pid: i32,
}

impl SignalInfo {
    pub fn new(signo: i32, code: i32, sender_pid: i32) -> Self {
        Self { signo, code, sender_pid }
    }

    /// `SIGTRAP | (event << 8)` 形式の ptrace イベント番号を取り出す
    pub fn ptrace_event(&self) -> Option<i32> {
        if self.signo == libc::SIGTRAP
            && (self.code & 0xff) == libc::SIGTRAP
            && (self.code >> 8) != 0
        {
            Some(self.code >> 8)
        } else {
            None
        }
    }

    /// カーネル由来（クラッシュの可能性がある）シグナルかどうか
    pub fn is_kernel_generated(&self) -> bool {
        self.code > 0
    }

    /// clone 直後の新スレッドが受け取る初回 SIGSTOP かどうか
    pub fn is_new_thread_stop(&self) -> bool {
        self.sender_pid == 0 && self.code == SI_USER
    }
}

impl From<&libc::siginfo_t> for SignalInfo {
    fn from(info: &libc::siginfo_t) -> Self {
        // si_pid は共用体のフィールドなので si_code に関係なく読み出す
        let sender_pid = unsafe { info.si_pid() };
        Self::new(info.si_signo, info.si_code, sender_pid)
    }
}

/// 待機ステータス（waitpid / PTRACE_EVENT_EXIT のメッセージ）の分類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitDisposition {
    Exited(i32),
    Signaled(i32),
    Other,
}

impl ExitDisposition {
    pub fn from_status(status: i32) -> Self {
        if libc::WIFEXITED(status) {
            ExitDisposition::Exited(libc::WEXITSTATUS(status))
        } else if libc::WIFSIGNALED(status) {
            ExitDisposition::Signaled(libc::WTERMSIG(status))
        } else {
            ExitDisposition::Other
        }
    }

    /// 終了させたシグナルがあれば返す
    pub fn terminating_signal(&self) -> Option<i32> {
        match self {
            ExitDisposition::Signaled(signo) => Some(*signo),
            _ => None,
        }
    }
}
