//! 上位（デバッガセッション）への通知

/// プロセス全体の状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Launching,
    Attaching,
    Running,
    Stopped,
    Exited,
    Detached,
    Crashed,
}

impl ProcessState {
    /// もう実行を再開できない状態かどうか
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessState::Exited | ProcessState::Detached | ProcessState::Crashed)
    }
}

/// 終了の種類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitType {
    Exited,
    SignaledKilled,
    StoppedNotExited,
}

/// 終了ステータス
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    pub exit_type: ExitType,
    pub code: i32,
}

/// 状態変化を受け取るデリゲート
///
/// コールバックはモニタスレッドやコーディネータスレッドから呼ばれるため、
/// 中で `NativeProcess` の操作を同期的に呼び出してはいけません。
pub trait ProcessDelegate: Send + Sync {
    fn on_process_state_changed(&self, state: ProcessState);

    fn on_exit_status(&self, exit_type: ExitType, code: i32);

    /// exec でプロセスイメージが置き換わった
    fn on_did_exec(&self) {}
}
