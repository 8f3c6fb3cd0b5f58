//! クライアントからのスレッドごとの再開指示

use kokia_target::ThreadId;
use std::collections::HashMap;

/// 1スレッドに対する再開指示
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeAction {
    /// 実行を継続する
    Run { signal: Option<i32> },
    /// 1命令だけ実行する
    Step { signal: Option<i32> },
    /// 停止したままにする
    Stop,
}

/// 再開指示の一覧
///
/// 個別の指示がないスレッドには既定の指示（なければ何もしない）を使います。
#[derive(Debug, Clone, Default)]
pub struct ResumeActionList {
    actions: HashMap<ThreadId, ResumeAction>,
    default_action: Option<ResumeAction>,
}

impl ResumeActionList {
    pub fn new() -> Self {
        Self::default()
    }

    /// 全スレッドを実行継続する
    pub fn run_all() -> Self {
        Self::new().with_default(ResumeAction::Run { signal: None })
    }

    pub fn with_default(mut self, action: ResumeAction) -> Self {
        self.default_action = Some(action);
        self
    }

    pub fn with(mut self, tid: ThreadId, action: ResumeAction) -> Self {
        self.actions.insert(tid, action);
        self
    }

    pub fn set(&mut self, tid: ThreadId, action: ResumeAction) {
        self.actions.insert(tid, action);
    }

    /// スレッドへの指示を取得する
    pub fn action_for(&self, tid: ThreadId) -> Option<ResumeAction> {
        self.actions.get(&tid).copied().or(self.default_action)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_fallback() {
        let actions = ResumeActionList::run_all().with(2, ResumeAction::Step { signal: None });
        assert_eq!(actions.action_for(1), Some(ResumeAction::Run { signal: None }));
        assert_eq!(actions.action_for(2), Some(ResumeAction::Step { signal: None }));
        assert_eq!(ResumeActionList::new().action_for(1), None);
    }
}
