//! モニタが受け取った waitpid イベントの振り分け
//!
//! スレッド一覧の更新とコーディネータへの通知をここで行います。
//! プロセスの Stopped / Crashed への遷移はコーディネータの待ち合わせが
//! 揃ったときにだけ起こります。

use crate::coordinator::{ResumeRequest, StopNotice};
use crate::delegate::{ExitType, ProcessState};
use crate::monitor::MonitorControl;
use crate::process::{lock, ProcessShared};
use kokia_target::siginfo::{
    PTRACE_EVENT_CLONE, PTRACE_EVENT_EXEC, PTRACE_EVENT_EXIT, SIGBUS, SIGFPE, SIGILL, SIGSEGV,
    SIGSTOP, SIGTRAP, SI_KERNEL, SI_TKILL, TRAP_BRKPT, TRAP_HWBKPT, TRAP_TRACE,
};
use kokia_target::{
    ExitDisposition, SignalInfo, StopReason, ThreadId, ThreadState, TraceSyscalls, WaitEvent,
};

impl<B: TraceSyscalls> ProcessShared<B> {
    pub(crate) fn handle_wait_event(&self, event: WaitEvent) -> MonitorControl {
        match event {
            WaitEvent::Exited { tid, status } => {
                self.handle_thread_exit(tid, ExitType::Exited, status)
            }
            WaitEvent::Signaled { tid, signal } => {
                self.handle_thread_exit(tid, ExitType::SignaledKilled, signal)
            }
            WaitEvent::Stopped { tid, signal } => self.handle_thread_stop(tid, signal),
            WaitEvent::NoChildren => MonitorControl::Stop,
            WaitEvent::Other { tid, status } => {
                tracing::trace!("Ignoring wait status 0x{:x} for thread {}", status, tid);
                MonitorControl::Continue
            }
        }
    }

    fn handle_thread_exit(&self, tid: ThreadId, exit_type: ExitType, code: i32) -> MonitorControl {
        let tracked = lock(&self.threads).remove(tid);
        tracing::debug!(
            "Thread {} exited ({:?}, {}), tracked: {}",
            tid,
            exit_type,
            code,
            tracked
        );
        self.coordinator.notify_thread_death(tid);

        if tid != self.pid {
            return MonitorControl::Continue;
        }

        // Crashed の後に kill された場合も Exited として報告する
        self.finish_exit(exit_type, code);
        MonitorControl::Stop
    }

    fn handle_thread_stop(&self, tid: ThreadId, signal: i32) -> MonitorControl {
        match self.ops.signal_info(tid) {
            Ok(info) if info.signo == SIGTRAP => self.handle_sigtrap(tid, &info),
            Ok(info) => self.handle_signal(tid, &info),
            Err(e) if e.is_group_stop() => {
                tracing::debug!("Thread {} entered group-stop ({})", tid, signal);
                self.set_thread_stopped(tid, StopReason::Signal(signal));
                self.notify_stopped(tid);
            }
            Err(e) => {
                // GETSIGINFO に失敗したら消えたスレッドとして扱う
                tracing::debug!("Thread {} vanished while stopped by {}: {}", tid, signal, e);
                lock(&self.threads).remove(tid);
                self.coordinator.notify_thread_death(tid);
                if tid == self.pid {
                    self.finish_exit(ExitType::StoppedNotExited, signal);
                    return MonitorControl::Stop;
                }
            }
        }
        MonitorControl::Continue
    }

    /// コーディネータが把握しているスレッドか
    fn is_coordinated(&self, tid: ThreadId) -> bool {
        let known = lock(&self.threads)
            .get(tid)
            .is_some_and(|t| t.state != ThreadState::Launching);
        if !known {
            tracing::debug!("Stop of untracked thread {} ignored", tid);
        }
        known
    }

    fn notify_stopped(&self, tid: ThreadId) {
        if self.is_coordinated(tid) {
            self.coordinator.notify_thread_stop(tid);
        }
    }

    fn set_thread_stopped(&self, tid: ThreadId, reason: StopReason) {
        if let Some(record) = lock(&self.threads).get_mut(tid) {
            record.set_stopped(reason);
        }
    }

    fn handle_sigtrap(&self, tid: ThreadId, info: &SignalInfo) {
        match info.ptrace_event() {
            Some(PTRACE_EVENT_CLONE) => self.handle_clone(tid),
            Some(PTRACE_EVENT_EXEC) => self.handle_exec(tid),
            Some(PTRACE_EVENT_EXIT) => self.handle_exit_event(tid),
            Some(event) => {
                tracing::warn!("Unexpected ptrace event {} on thread {}", event, tid);
                self.notify_stopped(tid);
                self.coordinator
                    .request_thread_resume(tid, ResumeRequest::continue_with(None));
            }
            None => self.handle_trap_code(tid, info.code),
        }
    }

    fn handle_trap_code(&self, tid: ThreadId, code: i32) {
        // x86_64 はシングルステップ完了も TRAP_BRKPT で報告する
        let stepping = lock(&self.threads)
            .get(tid)
            .is_some_and(|t| t.state == ThreadState::Stepping);

        match code {
            0 | TRAP_TRACE | TRAP_HWBKPT => self.handle_trace_trap(tid),
            TRAP_BRKPT if stepping => self.handle_trace_trap(tid),
            SI_KERNEL | TRAP_BRKPT => {
                self.set_thread_stopped(tid, StopReason::Breakpoint);
                if let Err(e) = self.fix_breakpoint_pc(tid) {
                    tracing::error!("Failed to fix up pc of thread {}: {}", tid, e);
                }
                self.notify_stopped(tid);
                self.gather_stop(tid, StopNotice::Report);
            }
            c if c == SIGTRAP || c == (SIGTRAP | 0x80) => {
                // 要求していない syscall 停止など
                tracing::debug!(
                    "Spurious SIGTRAP (code 0x{:x}) on thread {}, resuming",
                    c,
                    tid
                );
                self.set_thread_stopped(tid, StopReason::Signal(SIGTRAP));
                self.notify_stopped(tid);
                self.coordinator
                    .request_thread_resume(tid, ResumeRequest::continue_with(None));
            }
            c => {
                tracing::warn!("Unexpected SIGTRAP code 0x{:x} on thread {}", c, tid);
                self.set_thread_stopped(tid, StopReason::Signal(SIGTRAP));
                self.notify_stopped(tid);
                self.gather_stop(tid, StopNotice::Report);
            }
        }
    }

    /// シングルステップかウォッチポイントによるトラップ
    fn handle_trace_trap(&self, tid: ThreadId) {
        let context = lock(&self.threads)
            .get(tid)
            .map(|t| t.register_context.clone());
        let hit = match context {
            Some(context) => context.watchpoint_hit_index(tid).unwrap_or_else(|e| {
                tracing::warn!("Failed to query watchpoints of thread {}: {}", tid, e);
                None
            }),
            None => None,
        };
        let reason = match hit {
            Some(index) => {
                tracing::debug!("Thread {} hit watchpoint {}", tid, index);
                StopReason::Watchpoint(index)
            }
            None => StopReason::SingleStepTrace,
        };
        self.set_thread_stopped(tid, reason);
        self.notify_stopped(tid);
        self.gather_stop(tid, StopNotice::Report);
    }

    /// 新しいスレッドの clone イベントと初回停止のどちらかを観測した
    ///
    /// 先に観測した側はスレッドを Launching として記録するだけで、
    /// 後に観測した側がコーディネータに登録して実行を再開させます。
    fn observe_new_thread(&self, new_tid: ThreadId) {
        let second_sighting = {
            let mut threads = lock(&self.threads);
            let (record, created) = threads.get_or_create(new_tid, || {
                self.new_record(new_tid, ThreadState::Launching)
            });
            if !created {
                record.set_stopped(StopReason::None);
            }
            !created
        };

        if second_sighting {
            tracing::debug!("New thread {} ready", new_tid);
            self.coordinator.notify_thread_create(new_tid, true);
            self.coordinator
                .request_thread_resume(new_tid, ResumeRequest::continue_with(None));
        } else {
            tracing::debug!("New thread {} launching", new_tid);
        }
    }

    fn handle_clone(&self, tid: ThreadId) {
        self.set_thread_stopped(tid, StopReason::Signal(SIGTRAP));
        self.notify_stopped(tid);

        match self.ops.event_message(tid) {
            Ok(message) => self.observe_new_thread(message as ThreadId),
            Err(e) => tracing::warn!("Failed to read clone event of thread {}: {}", tid, e),
        }

        self.coordinator
            .request_thread_resume(tid, ResumeRequest::continue_with(None));
    }

    fn handle_exec(&self, tid: ThreadId) {
        tracing::info!("Process {} exec'd (reported by thread {})", self.pid, tid);
        self.coordinator.reset_for_exec();

        {
            let mut threads = lock(&self.threads);
            threads.retain_only(self.pid);
            let (main, _) = threads.get_or_create(self.pid, || {
                self.new_record(self.pid, ThreadState::Launching)
            });
            main.set_stopped(StopReason::Exec);
        }

        // 新しいイメージにはトラップ命令が残っていない
        lock(&self.breakpoints).forget_all();

        self.forget_gathering();
        self.set_current_thread(self.pid);
        self.coordinator.notify_thread_create(self.pid, true);
        self.delegate.on_did_exec();
        self.gather_stop(self.pid, StopNotice::Report);
    }

    fn handle_exit_event(&self, tid: ThreadId) {
        self.notify_stopped(tid);

        let disposition = match self.ops.event_message(tid) {
            Ok(message) => ExitDisposition::from_status(message as i32),
            Err(e) => {
                tracing::warn!("Failed to read exit status of thread {}: {}", tid, e);
                ExitDisposition::Other
            }
        };
        tracing::debug!("Thread {} exiting: {:?}", tid, disposition);

        if tid == self.pid {
            match disposition {
                ExitDisposition::Exited(code) => {
                    self.record_exit_status(ExitType::Exited, code)
                }
                ExitDisposition::Signaled(signo) => {
                    self.record_exit_status(ExitType::SignaledKilled, signo)
                }
                ExitDisposition::Other => {}
            }
        }

        self.coordinator.request_thread_resume(
            tid,
            ResumeRequest::continue_with(disposition.terminating_signal()),
        );
    }

    fn handle_signal(&self, tid: ThreadId, info: &SignalInfo) {
        let signo = info.signo;

        let launching = lock(&self.threads)
            .get(tid)
            .map_or(true, |t| t.state == ThreadState::Launching);
        if info.is_new_thread_stop() && launching {
            self.observe_new_thread(tid);
            return;
        }

        // コーディネータが送った停止要求。誰も待っていなければコーディネータが再開させる
        let from_us = info.sender_pid == self.backend.own_pid();
        if from_us && info.code == SI_TKILL && signo == SIGSTOP {
            if let Some(record) = lock(&self.threads).get_mut(tid) {
                if !record.state.is_stopped() {
                    record.set_stopped(StopReason::None);
                }
            }
            if self.is_coordinated(tid) {
                self.coordinator.notify_requested_stop(tid);
            }
            return;
        }

        self.notify_stopped(tid);

        let notice = match signo {
            SIGSTOP => {
                // 外部からの SIGSTOP はそのまま配送し、グループ停止させる
                self.coordinator
                    .request_thread_resume(tid, ResumeRequest::continue_with(Some(SIGSTOP)));
                StopNotice::Report
            }
            SIGSEGV | SIGILL | SIGFPE | SIGBUS => {
                self.set_thread_stopped(tid, StopReason::Signal(signo));
                // si_pid は si_addr と共用体なので、送り主はコードだけで判定する
                if info.is_kernel_generated() {
                    tracing::info!("Thread {} crashed with signal {}", tid, signo);
                    StopNotice::Crash
                } else {
                    StopNotice::Report
                }
            }
            _ => {
                self.set_thread_stopped(tid, StopReason::Signal(signo));
                StopNotice::Report
            }
        };

        if self.state() == ProcessState::Exited {
            return;
        }
        self.gather_stop(tid, notice);
    }
}
