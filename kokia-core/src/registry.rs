//! スレッドごとのメタデータ

use kokia_target::{RegisterContext, StopReason, ThreadId, ThreadState};
use std::sync::Arc;

/// スレッドのメタデータ
#[derive(Clone)]
pub struct ThreadRecord {
    pub tid: ThreadId,
    pub state: ThreadState,
    pub register_context: Arc<dyn RegisterContext>,
}

impl std::fmt::Debug for ThreadRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadRecord")
            .field("tid", &self.tid)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl ThreadRecord {
    pub fn new(
        tid: ThreadId,
        state: ThreadState,
        register_context: Arc<dyn RegisterContext>,
    ) -> Self {
        Self {
            tid,
            state,
            register_context,
        }
    }

    pub fn set_stopped(&mut self, reason: StopReason) {
        self.state = ThreadState::Stopped(reason);
    }
}

/// クライアントへの報告用のスレッド情報
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadInfo {
    pub tid: ThreadId,
    pub state: ThreadState,
}

/// スレッド一覧
///
/// 呼び出し側が `Mutex` で保護して使います。
#[derive(Debug, Default)]
pub struct ThreadRegistry {
    threads: Vec<ThreadRecord>,
}

impl ThreadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    pub fn contains(&self, tid: ThreadId) -> bool {
        self.threads.iter().any(|t| t.tid == tid)
    }

    pub fn get(&self, tid: ThreadId) -> Option<&ThreadRecord> {
        self.threads.iter().find(|t| t.tid == tid)
    }

    pub fn get_mut(&mut self, tid: ThreadId) -> Option<&mut ThreadRecord> {
        self.threads.iter_mut().find(|t| t.tid == tid)
    }

    /// 追加する（既にあれば何もしない）
    pub fn add(&mut self, record: ThreadRecord) -> bool {
        if self.contains(record.tid) {
            return false;
        }
        self.threads.push(record);
        true
    }

    /// 取得し、なければ `make` で作成する。作成したかどうかも返す
    pub fn get_or_create<F>(&mut self, tid: ThreadId, make: F) -> (&mut ThreadRecord, bool)
    where
        F: FnOnce() -> ThreadRecord,
    {
        match self.threads.iter().position(|t| t.tid == tid) {
            Some(index) => (&mut self.threads[index], false),
            None => {
                self.threads.push(make());
                let last = self.threads.len() - 1;
                (&mut self.threads[last], true)
            }
        }
    }

    /// 取り除く（見つかったかどうかを返す）
    pub fn remove(&mut self, tid: ThreadId) -> bool {
        let before = self.threads.len();
        self.threads.retain(|t| t.tid != tid);
        before != self.threads.len()
    }

    /// 指定したスレッド以外を破棄する（exec 時）
    pub fn retain_only(&mut self, tid: ThreadId) {
        self.threads.retain(|t| t.tid == tid);
    }

    pub fn iter(&self) -> impl Iterator<Item = &ThreadRecord> {
        self.threads.iter()
    }

    pub fn tids(&self) -> Vec<ThreadId> {
        self.threads.iter().map(|t| t.tid).collect()
    }

    pub fn snapshot(&self) -> Vec<ThreadInfo> {
        self.threads
            .iter()
            .map(|t| ThreadInfo {
                tid: t.tid,
                state: t.state,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kokia_target::NoWatchpoints;

    fn record(tid: ThreadId) -> ThreadRecord {
        ThreadRecord::new(tid, ThreadState::Launching, Arc::new(NoWatchpoints))
    }

    #[test]
    fn test_get_or_create() {
        let mut registry = ThreadRegistry::new();
        let (_, created) = registry.get_or_create(5, || record(5));
        assert!(created);
        let (rec, created) = registry.get_or_create(5, || record(5));
        assert!(!created);
        rec.set_stopped(StopReason::Signal(19));
        assert_eq!(
            registry.get(5).map(|r| r.state),
            Some(ThreadState::Stopped(StopReason::Signal(19)))
        );
    }

    #[test]
    fn test_remove_and_retain() {
        let mut registry = ThreadRegistry::new();
        for tid in [1, 2, 3] {
            assert!(registry.add(record(tid)));
        }
        assert!(!registry.add(record(2)));
        assert!(registry.remove(2));
        assert!(!registry.remove(2));
        registry.retain_only(1);
        assert_eq!(registry.tids(), vec![1]);
    }
}
