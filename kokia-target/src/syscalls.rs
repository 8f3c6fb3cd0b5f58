//! カーネルのトレース機能への境界

use crate::error::{AttachError, LaunchError, TraceError};
use crate::launch::LaunchInfo;
use crate::memory::WordAccess;
use crate::registers::Registers;
use crate::siginfo::SignalInfo;
use crate::thread::ThreadId;

/// waitpid(2) が報告するスレッドの状態変化
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitEvent {
    /// exit(2) による終了
    Exited { tid: ThreadId, status: i32 },
    /// シグナルによる終了
    Signaled { tid: ThreadId, signal: i32 },
    /// トレース停止
    Stopped { tid: ThreadId, signal: i32 },
    /// 子プロセスがもう存在しない
    NoChildren,
    /// 上記以外（continued など）
    Other { tid: ThreadId, status: i32 },
}

/// トレース系システムコールの集合
///
/// `launch` / `attach` を実行したスレッドがトレーサになるため、
/// `kill_process` / `kill_thread` / `wait_for_event` / `memory_maps` 以外は
/// 必ずそのスレッドから呼び出す必要があります。
pub trait TraceSyscalls: WordAccess + Send + Sync + 'static {
    /// fork + PTRACE_TRACEME + exec し、初回停止まで待つ
    fn launch(&self, info: &LaunchInfo) -> Result<ThreadId, LaunchError>;

    /// プロセスの全スレッドにアタッチする（先頭がメインスレッド）
    fn attach(&self, pid: ThreadId) -> Result<Vec<ThreadId>, AttachError>;

    fn detach(&self, tid: ThreadId) -> Result<(), TraceError>;

    /// PTRACE_CONT
    fn resume(&self, tid: ThreadId, signal: Option<i32>) -> Result<(), TraceError>;

    /// PTRACE_SINGLESTEP
    fn single_step(&self, tid: ThreadId, signal: Option<i32>) -> Result<(), TraceError>;

    fn get_registers(&self, tid: ThreadId) -> Result<Registers, TraceError>;

    fn set_registers(&self, tid: ThreadId, regs: &Registers) -> Result<(), TraceError>;

    /// 浮動小数点 / ベクタレジスタ領域（アーキテクチャ依存のバイト列）
    fn get_extended_registers(&self, tid: ThreadId) -> Result<Vec<u8>, TraceError>;

    fn set_extended_registers(&self, tid: ThreadId, data: &[u8]) -> Result<(), TraceError>;

    fn get_signal_info(&self, tid: ThreadId) -> Result<SignalInfo, TraceError>;

    fn get_event_message(&self, tid: ThreadId) -> Result<u64, TraceError>;

    /// TRACECLONE | TRACEEXEC | TRACEEXIT を設定する
    fn set_options(&self, tid: ThreadId) -> Result<(), TraceError>;

    /// 任意の子スレッドの状態変化を待つ
    fn wait_for_event(&self) -> Result<WaitEvent, TraceError>;

    /// kill(2)
    fn kill_process(&self, pid: ThreadId, signal: i32) -> Result<(), TraceError>;

    /// tgkill(2)
    fn kill_thread(&self, pid: ThreadId, tid: ThreadId, signal: i32) -> Result<(), TraceError>;

    /// /proc/pid/maps の内容
    fn memory_maps(&self, pid: ThreadId) -> Result<String, TraceError>;

    /// 自プロセスの pid（自分が送ったシグナルの判別に使う）
    fn own_pid(&self) -> i32;
}
