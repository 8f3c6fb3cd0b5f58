//! スレッド状態コーディネータ
//!
//! 各スレッドの実行／停止状態と「指定したスレッド群が全て停止したら通知する」
//! 要求を1つだけ管理します。全ての状態変化は単一のイベントキューを通して
//! 1つのスレッドで順番に適用されるため、判定ロジック自体にロックは不要です。
//!
//! 遅延実行はクロージャではなく [`StopNotice`] や [`ResumeRequest`] といった
//! 値として運び、実際の処理は [`CoordinatorHandler`] が行います。

use crate::errors::CoordinatorError;
use crossbeam_channel::{unbounded, Receiver, Sender};
use kokia_target::{ThreadId, TraceError};
use std::collections::{HashMap, HashSet};

/// コーディネータが信じているスレッドの状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Running,
    Stopped,
}

/// 再開の方法
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeKind {
    Continue,
    Step,
}

/// スレッド再開の要求
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResumeRequest {
    pub kind: ResumeKind,
    /// 再開時に配送するシグナル
    pub signal: Option<i32>,
    /// 成功したらプロセス状態を Running として通知する
    pub announce: bool,
}

impl ResumeRequest {
    pub fn continue_with(signal: Option<i32>) -> Self {
        Self {
            kind: ResumeKind::Continue,
            signal,
            announce: false,
        }
    }

    pub fn step_with(signal: Option<i32>) -> Self {
        Self {
            kind: ResumeKind::Step,
            signal,
            announce: false,
        }
    }

    pub fn announced(mut self) -> Self {
        self.announce = true;
        self
    }
}

/// 既に実行中のスレッドへの再開要求をどう扱うか
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumePolicy {
    /// 実行中なら契約違反
    Strict,
    /// 実行中なら何もしない
    AsNeeded,
}

/// 全スレッド停止後に行う報告の内容
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopNotice {
    /// 各スレッドに記録済みの停止理由のまま停止を報告する
    Report,
    /// 起点スレッドの停止理由を指定シグナルにしてから報告する
    DeferredSignal(i32),
    /// クラッシュとして報告する
    Crash,
}

/// 待ち合わせ対象
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitTarget {
    /// 指定したスレッド群
    Explicit(HashSet<ThreadId>),
    /// 現在実行中の全スレッド（`skip` には停止要求を送らない）
    AllRunning { skip: HashSet<ThreadId> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NotificationMode {
    ExplicitSet,
    AllRunning,
}

#[derive(Debug)]
struct PendingNotification {
    triggering_tid: ThreadId,
    wait_for: HashSet<ThreadId>,
    original_wait_for: HashSet<ThreadId>,
    skip: HashSet<ThreadId>,
    mode: NotificationMode,
    notice: StopNotice,
}

/// キューに積まれるイベント
#[derive(Debug, Clone)]
pub enum CoordinatorEvent {
    ThreadCreate { tid: ThreadId, is_stopped: bool },
    ThreadDeath { tid: ThreadId },
    ThreadStop { tid: ThreadId, requested: bool },
    RequestResume {
        tid: ThreadId,
        request: ResumeRequest,
        policy: ResumePolicy,
    },
    CallAfterThreadsStop {
        triggering_tid: ThreadId,
        target: WaitTarget,
        notice: StopNotice,
    },
    ResetForExec,
    Shutdown,
}

/// イベント処理の結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventLoopResult {
    Continue,
    Done,
}

/// コーディネータが副作用を依頼する先
pub trait CoordinatorHandler: Send {
    /// 実行中スレッドに停止を要求する（通常は tgkill で SIGSTOP）
    fn request_thread_stop(&mut self, tid: ThreadId) -> Result<(), TraceError>;

    /// スレッドを再開する
    fn resume_thread(&mut self, tid: ThreadId, request: &ResumeRequest) -> Result<(), TraceError>;

    /// 待ち合わせていたスレッドが全て停止した
    fn threads_stopped(&mut self, triggering_tid: ThreadId, notice: StopNotice);

    /// 内部不変条件違反
    fn report_error(&mut self, error: CoordinatorError);
}

/// コーディネータへイベントを送るハンドル
///
/// どのスレッドからでも送信でき、送信は即座に戻ります。
#[derive(Debug, Clone)]
pub struct CoordinatorHandle {
    sender: Sender<CoordinatorEvent>,
}

impl CoordinatorHandle {
    fn post(&self, event: CoordinatorEvent) {
        if self.sender.send(event).is_err() {
            tracing::debug!("Thread state coordinator is gone, dropping event");
        }
    }

    pub fn notify_thread_create(&self, tid: ThreadId, is_stopped: bool) {
        self.post(CoordinatorEvent::ThreadCreate { tid, is_stopped });
    }

    pub fn notify_thread_death(&self, tid: ThreadId) {
        self.post(CoordinatorEvent::ThreadDeath { tid });
    }

    pub fn notify_thread_stop(&self, tid: ThreadId) {
        self.post(CoordinatorEvent::ThreadStop { tid, requested: false });
    }

    /// 自分が送った停止要求（tgkill の SIGSTOP）による停止を通知する
    pub fn notify_requested_stop(&self, tid: ThreadId) {
        self.post(CoordinatorEvent::ThreadStop { tid, requested: true });
    }

    /// 再開を要求する（既に実行中なら契約違反）
    pub fn request_thread_resume(&self, tid: ThreadId, request: ResumeRequest) {
        self.post(CoordinatorEvent::RequestResume {
            tid,
            request,
            policy: ResumePolicy::Strict,
        });
    }

    /// 再開を要求する（既に実行中なら何もしない）
    pub fn request_thread_resume_as_needed(&self, tid: ThreadId, request: ResumeRequest) {
        self.post(CoordinatorEvent::RequestResume {
            tid,
            request,
            policy: ResumePolicy::AsNeeded,
        });
    }

    pub fn call_after_threads_stop(
        &self,
        triggering_tid: ThreadId,
        wait_for: HashSet<ThreadId>,
        notice: StopNotice,
    ) {
        self.post(CoordinatorEvent::CallAfterThreadsStop {
            triggering_tid,
            target: WaitTarget::Explicit(wait_for),
            notice,
        });
    }

    pub fn call_after_running_threads_stop(&self, triggering_tid: ThreadId, notice: StopNotice) {
        self.call_after_running_threads_stop_with_skip(triggering_tid, HashSet::new(), notice);
    }

    pub fn call_after_running_threads_stop_with_skip(
        &self,
        triggering_tid: ThreadId,
        skip: HashSet<ThreadId>,
        notice: StopNotice,
    ) {
        self.post(CoordinatorEvent::CallAfterThreadsStop {
            triggering_tid,
            target: WaitTarget::AllRunning { skip },
            notice,
        });
    }

    pub fn reset_for_exec(&self) {
        self.post(CoordinatorEvent::ResetForExec);
    }

    pub fn stop_coordinator(&self) {
        self.post(CoordinatorEvent::Shutdown);
    }
}

/// スレッド状態コーディネータ本体
pub struct ThreadStateCoordinator<H: CoordinatorHandler> {
    events: Receiver<CoordinatorEvent>,
    handler: H,
    threads: HashMap<ThreadId, RunState>,
    /// 最後に成功した再開の方法
    last_resume: HashMap<ThreadId, ResumeKind>,
    pending: Option<PendingNotification>,
}

impl<H: CoordinatorHandler> ThreadStateCoordinator<H> {
    /// コーディネータと、そこへイベントを送るハンドルを作成する
    pub fn new(handler: H) -> (Self, CoordinatorHandle) {
        let (sender, events) = unbounded();
        let coordinator = Self {
            events,
            handler,
            threads: HashMap::new(),
            last_resume: HashMap::new(),
            pending: None,
        };
        (coordinator, CoordinatorHandle { sender })
    }

    /// 次のイベントを待って処理する
    pub fn process_next_event(&mut self) -> EventLoopResult {
        match self.events.recv() {
            Ok(event) => self.apply(event),
            // 全てのハンドルが破棄された
            Err(_) => EventLoopResult::Done,
        }
    }

    /// `Done` になるまでイベントを処理し続ける
    pub fn run(mut self) {
        while self.process_next_event() == EventLoopResult::Continue {}
        tracing::debug!("Thread state coordinator stopped");
    }

    /// キューに溜まっているイベントをブロックせずに全て処理する
    pub fn drain(&mut self) -> EventLoopResult {
        while let Ok(event) = self.events.try_recv() {
            if self.apply(event) == EventLoopResult::Done {
                return EventLoopResult::Done;
            }
        }
        EventLoopResult::Continue
    }

    /// 1つのイベントを適用する
    pub fn apply(&mut self, event: CoordinatorEvent) -> EventLoopResult {
        tracing::trace!("coordinator: {:?}", event);
        match event {
            CoordinatorEvent::ThreadCreate { tid, is_stopped } => {
                self.thread_was_created(tid, is_stopped)
            }
            CoordinatorEvent::ThreadDeath { tid } => self.thread_did_die(tid),
            CoordinatorEvent::ThreadStop { tid, requested } => self.thread_did_stop(tid, requested),
            CoordinatorEvent::RequestResume {
                tid,
                request,
                policy,
            } => self.resume(tid, request, policy),
            CoordinatorEvent::CallAfterThreadsStop {
                triggering_tid,
                target,
                notice,
            } => self.set_pending_notification(triggering_tid, target, notice),
            CoordinatorEvent::ResetForExec => self.reset_now(),
            CoordinatorEvent::Shutdown => return EventLoopResult::Done,
        }
        EventLoopResult::Continue
    }

    /// 既知スレッドの状態一覧（tid 順）
    pub fn thread_states(&self) -> Vec<(ThreadId, RunState)> {
        let mut states: Vec<_> = self
            .threads
            .iter()
            .map(|(&tid, &state)| (tid, state))
            .collect();
        states.sort_unstable_by_key(|&(tid, _)| tid);
        states
    }

    pub fn has_pending_notification(&self) -> bool {
        self.pending.is_some()
    }

    /// 待ち合わせ中のスレッド（tid 順）
    pub fn pending_wait_set(&self) -> Vec<ThreadId> {
        let mut tids: Vec<_> = self
            .pending
            .as_ref()
            .map(|p| p.wait_for.iter().copied().collect())
            .unwrap_or_default();
        tids.sort_unstable();
        tids
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    fn thread_was_created(&mut self, tid: ThreadId, is_stopped: bool) {
        if self.threads.contains_key(&tid) {
            self.handler.report_error(CoordinatorError::AlreadyTracked(tid));
            return;
        }

        let state = if is_stopped { RunState::Stopped } else { RunState::Running };
        self.threads.insert(tid, state);

        // 全停止を待っている間に走り出したスレッドも止める
        if !is_stopped {
            if let Some(pending) = self.pending.as_mut() {
                if pending.mode == NotificationMode::AllRunning {
                    pending.wait_for.insert(tid);
                    pending.original_wait_for.insert(tid);
                    if let Err(e) = self.handler.request_thread_stop(tid) {
                        tracing::debug!("Stop request for new thread {} failed: {}", tid, e);
                    }
                }
            }
        }
    }

    fn thread_did_die(&mut self, tid: ThreadId) {
        self.last_resume.remove(&tid);
        if self.threads.remove(&tid).is_none() {
            // exec でリセット済みのスレッドは後から死亡を報告してくる
            tracing::debug!("Death reported for untracked thread {}", tid);
        }
        self.mark_satisfied(tid);
    }

    fn thread_did_stop(&mut self, tid: ThreadId, requested: bool) {
        if !self.threads.contains_key(&tid) {
            self.handler.report_error(CoordinatorError::UnknownThread(tid));
            return;
        }

        if requested && !self.awaits_requested_stop(tid) {
            if self.threads.get(&tid) == Some(&RunState::Running) {
                self.discard_stale_stop(tid);
            } else {
                tracing::debug!("Late stop request of already stopped thread {}", tid);
            }
            return;
        }

        self.threads.insert(tid, RunState::Stopped);
        self.mark_satisfied(tid);
    }

    /// 待ち合わせ中で、かつ停止要求を送ったスレッドか
    fn awaits_requested_stop(&self, tid: ThreadId) -> bool {
        self.pending
            .as_ref()
            .is_some_and(|p| p.wait_for.contains(&tid) && !p.skip.contains(&tid))
    }

    /// 停止要求より先に別の理由で止まっていたスレッドに、後から SIGSTOP が届いた
    ///
    /// 誰も待っていない停止なので、シグナルを捨てて直前と同じ方法で再開します。
    fn discard_stale_stop(&mut self, tid: ThreadId) {
        let kind = self
            .last_resume
            .get(&tid)
            .copied()
            .unwrap_or(ResumeKind::Continue);
        tracing::debug!("Discarding late stop request of thread {}, resuming ({:?})", tid, kind);

        let request = ResumeRequest {
            kind,
            signal: None,
            announce: false,
        };
        self.threads.insert(tid, RunState::Running);
        if let Err(e) = self.handler.resume_thread(tid, &request) {
            tracing::warn!("Failed to resume thread {} after a late stop: {}", tid, e);
            self.threads.insert(tid, RunState::Stopped);
        }
    }

    fn resume(&mut self, tid: ThreadId, request: ResumeRequest, policy: ResumePolicy) {
        let state = match self.threads.get_mut(&tid) {
            Some(state) => state,
            None => {
                self.handler.report_error(CoordinatorError::UnknownThread(tid));
                return;
            }
        };

        if *state == RunState::Running {
            match policy {
                ResumePolicy::Strict => {
                    self.handler.report_error(CoordinatorError::AlreadyRunning(tid))
                }
                ResumePolicy::AsNeeded => tracing::trace!("Thread {} already running", tid),
            }
            return;
        }

        *state = RunState::Running;
        match self.handler.resume_thread(tid, &request) {
            Ok(()) => {
                self.last_resume.insert(tid, request.kind);
            }
            Err(e) => {
                tracing::warn!("Failed to resume thread {}: {}", tid, e);
                self.threads.insert(tid, RunState::Stopped);
            }
        }
    }

    fn set_pending_notification(
        &mut self,
        triggering_tid: ThreadId,
        target: WaitTarget,
        notice: StopNotice,
    ) {
        if let Some(pending) = &self.pending {
            self.handler
                .report_error(CoordinatorError::NotificationPending(pending.triggering_tid));
            return;
        }

        let (mode, candidates, skip) = match target {
            WaitTarget::Explicit(tids) => {
                if let Some(&unknown) = tids.iter().find(|tid| !self.threads.contains_key(*tid)) {
                    self.handler.report_error(CoordinatorError::UnknownThread(unknown));
                    return;
                }
                (NotificationMode::ExplicitSet, tids, HashSet::new())
            }
            WaitTarget::AllRunning { skip } => {
                let running = self
                    .threads
                    .iter()
                    .filter(|(_, state)| **state == RunState::Running)
                    .map(|(&tid, _)| tid)
                    .collect();
                (NotificationMode::AllRunning, running, skip)
            }
        };

        // 既に停止しているスレッドは待たない
        let wait_for: HashSet<ThreadId> = candidates
            .into_iter()
            .filter(|tid| self.threads.get(tid) == Some(&RunState::Running))
            .collect();

        let mut stop_targets: Vec<ThreadId> = wait_for
            .iter()
            .copied()
            .filter(|tid| !skip.contains(tid))
            .collect();
        stop_targets.sort_unstable();
        for tid in stop_targets {
            if let Err(e) = self.handler.request_thread_stop(tid) {
                tracing::debug!("Stop request for thread {} failed: {}", tid, e);
            }
        }

        if wait_for.is_empty() {
            self.handler.threads_stopped(triggering_tid, notice);
            return;
        }

        tracing::debug!(
            "Waiting for {} threads to stop before notifying (trigger {})",
            wait_for.len(),
            triggering_tid
        );
        self.pending = Some(PendingNotification {
            triggering_tid,
            original_wait_for: wait_for.clone(),
            wait_for,
            skip,
            mode,
            notice,
        });
    }

    /// 待ち合わせ集合から外し、空になったら通知する
    fn mark_satisfied(&mut self, tid: ThreadId) {
        let fire = match self.pending.as_mut() {
            Some(pending) => pending.wait_for.remove(&tid) && pending.wait_for.is_empty(),
            None => false,
        };
        if !fire {
            return;
        }

        if let Some(pending) = self.pending.take() {
            tracing::debug!(
                "All {} awaited threads stopped (trigger {}, skipped {})",
                pending.original_wait_for.len(),
                pending.triggering_tid,
                pending.skip.len()
            );
            self.handler.threads_stopped(pending.triggering_tid, pending.notice);
        }
    }

    fn reset_now(&mut self) {
        tracing::debug!("Resetting thread state coordinator for exec");
        self.threads.clear();
        self.last_resume.clear();
        self.pending = None;
    }
}
