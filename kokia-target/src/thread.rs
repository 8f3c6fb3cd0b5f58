//! スレッドの状態モデル

/// スレッドID（カーネルの tid）
pub type ThreadId = i32;

/// スレッドが停止した理由
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// シグナル受信
    Signal(i32),
    /// ソフトウェアブレークポイントのトラップ
    Breakpoint,
    /// ウォッチポイントのヒット（デバッグレジスタのインデックス）
    Watchpoint(u32),
    /// シングルステップ完了
    SingleStepTrace,
    /// exec 直後の停止
    Exec,
    /// 他スレッドの停止に巻き込まれただけの停止
    None,
}

/// スレッドのライフサイクル状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// clone イベントと新スレッドの初回停止の片方だけを観測した状態
    Launching,
    Running,
    Stepping,
    Stopped(StopReason),
}

impl ThreadState {
    /// 停止状態かどうか
    pub fn is_stopped(&self) -> bool {
        matches!(self, ThreadState::Stopped(_))
    }

    /// 実行中（ステップ実行を含む）かどうか
    pub fn is_running(&self) -> bool {
        matches!(self, ThreadState::Running | ThreadState::Stepping)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_predicates() {
        assert!(ThreadState::Stopped(StopReason::Exec).is_stopped());
        assert!(ThreadState::Stepping.is_running());
        assert!(!ThreadState::Launching.is_running());
        assert!(!ThreadState::Launching.is_stopped());
    }
}
