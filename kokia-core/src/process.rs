//! デバッグ対象プロセスの制御
//!
//! [`NativeProcess`] はファネル（[`OperationChannel`]）、モニタスレッド、
//! スレッド状態コーディネータ、スレッド一覧を束ね、起動・アタッチ・再開・停止・
//! メモリ／レジスタアクセス・ブレークポイントを提供します。
//!
//! プロセスの状態遷移は Launching/Attaching → Running ⇄ Stopped →
//! {Exited, Detached, Crashed} です。Stopped へは、待ち合わせていた全スレッドの
//! 停止が揃ったときにだけ遷移します。

use crate::breakpoint::{Breakpoint, BreakpointId, BreakpointManager};
use crate::coordinator::{
    CoordinatorHandle, CoordinatorHandler, ResumeKind, ResumeRequest, StopNotice,
    ThreadStateCoordinator,
};
use crate::delegate::{ExitStatus, ExitType, ProcessDelegate, ProcessState};
use crate::errors::{CoordinatorError, ProcessError};
use crate::monitor::InferiorMonitor;
use crate::operation::{OperationChannel, Startup};
use crate::registry::{ThreadInfo, ThreadRecord, ThreadRegistry};
use crate::resume::{ResumeAction, ResumeActionList};
use crate::Result;
use kokia_target::memory::{find_region, parse_maps};
use kokia_target::registers::{program_counter, set_program_counter};
use kokia_target::{
    host_architecture, ArchitectureInfo, Errno, LaunchInfo, LinuxTracer, MemoryAccess,
    MemoryRegionInfo, NoWatchpoints, RegisterContext, Registers, StopReason, ThreadId, ThreadState,
    TraceError, TraceSyscalls,
};
use kokia_target::siginfo::{SIGKILL, SIGSTOP, SIGTRAP};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, JoinHandle};

/// スレッドごとのレジスタコンテキストを作るファクトリ
pub type RegisterContextFactory = Arc<dyn Fn(ThreadId) -> Arc<dyn RegisterContext> + Send + Sync>;

/// プロセス制御の設定
#[derive(Clone)]
pub struct ProcessOptions {
    pub architecture: Arc<dyn ArchitectureInfo>,
    pub register_context: RegisterContextFactory,
}

impl Default for ProcessOptions {
    fn default() -> Self {
        Self {
            architecture: host_architecture(),
            register_context: Arc::new(|_: ThreadId| -> Arc<dyn RegisterContext> {
                Arc::new(NoWatchpoints)
            }),
        }
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug)]
pub(crate) struct ProcessStatus {
    pub(crate) state: ProcessState,
    pub(crate) exit_status: Option<ExitStatus>,
    pub(crate) stop_id: u32,
    pub(crate) current_tid: Option<ThreadId>,
}

#[derive(Debug, Default)]
struct RegionCache {
    regions: Vec<MemoryRegionInfo>,
    supported: Option<bool>,
}

/// 各スレッドから共有されるプロセスの状態
pub(crate) struct ProcessShared<B: TraceSyscalls> {
    pub(crate) pid: ThreadId,
    pub(crate) backend: Arc<B>,
    pub(crate) ops: OperationChannel,
    pub(crate) coordinator: CoordinatorHandle,
    pub(crate) threads: Mutex<ThreadRegistry>,
    pub(crate) status: Mutex<ProcessStatus>,
    pub(crate) delegate: Arc<dyn ProcessDelegate>,
    pub(crate) arch: Arc<dyn ArchitectureInfo>,
    pub(crate) register_context: RegisterContextFactory,
    pub(crate) breakpoints: Mutex<BreakpointManager>,
    regions: Mutex<RegionCache>,
    /// 全スレッド停止の待ち合わせをコーディネータに登録済み
    gathering: AtomicBool,
}

impl<B: TraceSyscalls> ProcessShared<B> {
    pub(crate) fn new_record(&self, tid: ThreadId, state: ThreadState) -> ThreadRecord {
        ThreadRecord::new(tid, state, (self.register_context)(tid))
    }

    pub(crate) fn state(&self) -> ProcessState {
        lock(&self.status).state
    }

    /// プロセス状態を変更し、デリゲートに通知する
    ///
    /// Stopped に入るたびに stop id を進め、メモリ領域キャッシュを捨てます。
    pub(crate) fn set_state(&self, state: ProcessState) {
        {
            let mut status = lock(&self.status);
            if status.state == state {
                return;
            }
            let leaving_final =
                matches!(status.state, ProcessState::Exited | ProcessState::Detached);
            if leaving_final {
                tracing::debug!("Ignoring state change {:?} -> {:?}", status.state, state);
                return;
            }
            tracing::debug!("Process {} state {:?} -> {:?}", self.pid, status.state, state);
            status.state = state;
            if state == ProcessState::Stopped {
                status.stop_id = status.stop_id.wrapping_add(1);
            }
        }

        if state == ProcessState::Stopped {
            let mut cache = lock(&self.regions);
            cache.regions.clear();
        }

        self.delegate.on_process_state_changed(state);
    }

    /// 全スレッドの停止を待ってから停止を報告する
    ///
    /// 既に待ち合わせ中なら新たに登録せず、その待ち合わせの完了時に
    /// まとめて報告されます。
    pub(crate) fn gather_stop(&self, triggering_tid: ThreadId, notice: StopNotice) {
        if self.gathering.swap(true, Ordering::AcqRel) {
            tracing::debug!(
                "Stop of thread {} joins the stop already being gathered",
                triggering_tid
            );
            return;
        }
        self.coordinator.call_after_running_threads_stop(triggering_tid, notice);
    }

    /// exec でコーディネータの待ち合わせが破棄された
    pub(crate) fn forget_gathering(&self) {
        self.gathering.store(false, Ordering::Release);
    }

    pub(crate) fn set_current_thread(&self, tid: ThreadId) {
        lock(&self.status).current_tid = Some(tid);
    }

    /// 終了ステータスを記録する（既に記録済みなら何もしない）
    pub(crate) fn record_exit_status(&self, exit_type: ExitType, code: i32) {
        let mut status = lock(&self.status);
        if status.exit_status.is_none() {
            status.exit_status = Some(ExitStatus { exit_type, code });
        }
    }

    /// メインスレッドの終了を報告する
    pub(crate) fn finish_exit(&self, exit_type: ExitType, code: i32) {
        let recorded = {
            let mut status = lock(&self.status);
            if matches!(status.state, ProcessState::Exited | ProcessState::Detached) {
                return;
            }
            *status.exit_status.get_or_insert(ExitStatus { exit_type, code })
        };

        tracing::info!(
            "Process {} exited ({:?}, {})",
            self.pid,
            recorded.exit_type,
            recorded.code
        );
        self.delegate.on_exit_status(recorded.exit_type, recorded.code);
        self.set_state(ProcessState::Exited);
    }

    /// メモリアクセスに使うスレッド
    fn memory_tid(&self) -> ThreadId {
        lock(&self.status).current_tid.unwrap_or(self.pid)
    }

    /// ブレークポイントのトラップ後の PC を補正する
    ///
    /// PC がトラップ命令の直後を指していて、そこにブレークポイントがあれば
    /// PC をブレークポイントのアドレスに戻します。何度呼んでも結果は同じです。
    pub(crate) fn fix_breakpoint_pc(&self, tid: ThreadId) -> std::result::Result<bool, TraceError> {
        let offset = self.arch.breakpoint_pc_offset() as u64;
        if offset == 0 {
            return Ok(false);
        }

        let mut regs = self.ops.read_registers(tid)?;
        let pc = program_counter(&regs);
        let Some(bp_addr) = pc.checked_sub(offset) else {
            return Ok(false);
        };

        if lock(&self.breakpoints).find_by_address(bp_addr).is_none() {
            tracing::trace!("No breakpoint at 0x{:x}, leaving pc 0x{:x}", bp_addr, pc);
            return Ok(false);
        }

        tracing::debug!("Rewinding pc of thread {} from 0x{:x} to 0x{:x}", tid, pc, bp_addr);
        set_program_counter(&mut regs, bp_addr);
        self.ops.write_registers(tid, &regs)?;
        Ok(true)
    }
}

impl<B: TraceSyscalls> MemoryAccess for ProcessShared<B> {
    fn read_memory(&self, addr: u64, len: usize) -> std::result::Result<Vec<u8>, TraceError> {
        self.ops.read_memory(self.memory_tid(), addr, len)
    }

    fn write_memory(&self, addr: u64, data: &[u8]) -> std::result::Result<(), TraceError> {
        self.ops.write_memory(self.memory_tid(), addr, data)
    }
}

/// コーディネータからの依頼を実行するハンドラ
struct ProcessCoordinatorHandler<B: TraceSyscalls> {
    shared: Weak<ProcessShared<B>>,
}

impl<B: TraceSyscalls> ProcessCoordinatorHandler<B> {
    fn shared(&self) -> std::result::Result<Arc<ProcessShared<B>>, TraceError> {
        self.shared
            .upgrade()
            .ok_or(TraceError::new("process gone", Errno::ESRCH))
    }
}

impl<B: TraceSyscalls> CoordinatorHandler for ProcessCoordinatorHandler<B> {
    fn request_thread_stop(&mut self, tid: ThreadId) -> std::result::Result<(), TraceError> {
        let shared = self.shared()?;
        tracing::debug!("Requesting stop of thread {}", tid);
        shared.backend.kill_thread(shared.pid, tid, SIGSTOP)
    }

    fn resume_thread(
        &mut self,
        tid: ThreadId,
        request: &ResumeRequest,
    ) -> std::result::Result<(), TraceError> {
        let shared = self.shared()?;

        let running = match request.kind {
            ResumeKind::Continue => ThreadState::Running,
            ResumeKind::Step => ThreadState::Stepping,
        };
        let previous = {
            let mut threads = lock(&shared.threads);
            threads
                .get_mut(tid)
                .map(|record| std::mem::replace(&mut record.state, running))
        };

        let result = match request.kind {
            ResumeKind::Continue => shared.ops.resume(tid, request.signal),
            ResumeKind::Step => shared.ops.single_step(tid, request.signal),
        };

        match result {
            Ok(()) => {
                if request.announce {
                    shared.set_state(ProcessState::Running);
                }
                Ok(())
            }
            Err(e) => {
                if let Some(previous) = previous {
                    if let Some(record) = lock(&shared.threads).get_mut(tid) {
                        record.state = previous;
                    }
                }
                Err(e)
            }
        }
    }

    fn threads_stopped(&mut self, triggering_tid: ThreadId, notice: StopNotice) {
        let Ok(shared) = self.shared() else {
            return;
        };

        shared.forget_gathering();
        shared.set_current_thread(triggering_tid);
        match notice {
            StopNotice::Report => shared.set_state(ProcessState::Stopped),
            StopNotice::DeferredSignal(signo) => {
                if let Some(record) = lock(&shared.threads).get_mut(triggering_tid) {
                    record.set_stopped(StopReason::Signal(signo));
                }
                shared.set_state(ProcessState::Stopped);
            }
            StopNotice::Crash => shared.set_state(ProcessState::Crashed),
        }
    }

    fn report_error(&mut self, error: CoordinatorError) {
        tracing::error!("Thread state coordinator contract violation: {}", error);
        debug_assert!(false, "thread state coordinator contract violation: {}", error);
    }
}

/// デバッグ対象プロセス
pub struct NativeProcess<B: TraceSyscalls = LinuxTracer> {
    shared: Arc<ProcessShared<B>>,
    coordinator_thread: Option<JoinHandle<()>>,
    _monitor: InferiorMonitor,
}

impl NativeProcess<LinuxTracer> {
    /// プログラムを起動してデバッグ対象にする
    pub fn launch(info: LaunchInfo, delegate: Arc<dyn ProcessDelegate>) -> Result<Self> {
        Self::launch_with(Arc::new(LinuxTracer::new()), info, delegate, ProcessOptions::default())
    }

    /// 既存のプロセスにアタッチする
    pub fn attach(pid: ThreadId, delegate: Arc<dyn ProcessDelegate>) -> Result<Self> {
        Self::attach_with(Arc::new(LinuxTracer::new()), pid, delegate, ProcessOptions::default())
    }
}

impl<B: TraceSyscalls> NativeProcess<B> {
    pub fn launch_with(
        backend: Arc<B>,
        info: LaunchInfo,
        delegate: Arc<dyn ProcessDelegate>,
        options: ProcessOptions,
    ) -> Result<Self> {
        delegate.on_process_state_changed(ProcessState::Launching);
        Self::start(backend, Startup::Launch(info), delegate, options)
    }

    pub fn attach_with(
        backend: Arc<B>,
        pid: ThreadId,
        delegate: Arc<dyn ProcessDelegate>,
        options: ProcessOptions,
    ) -> Result<Self> {
        delegate.on_process_state_changed(ProcessState::Attaching);
        Self::start(backend, Startup::Attach(pid), delegate, options)
    }

    fn start(
        backend: Arc<B>,
        startup: Startup,
        delegate: Arc<dyn ProcessDelegate>,
        options: ProcessOptions,
    ) -> Result<Self> {
        let (initial_state, initial_reason) = match &startup {
            Startup::Launch(_) => (ProcessState::Launching, StopReason::Signal(SIGTRAP)),
            Startup::Attach(_) => (ProcessState::Attaching, StopReason::Signal(SIGSTOP)),
        };

        // 起動に失敗した場合はモニタもコーディネータも作らない
        let (ops, tids) = OperationChannel::start(Arc::clone(&backend), startup)?;
        let pid = tids
            .first()
            .copied()
            .ok_or(TraceError::new("startup", Errno::ESRCH))?;

        for &tid in &tids {
            match ops.set_options(tid) {
                Ok(()) => {}
                // アタッチ後に終了したスレッドは終了イベントで片付く
                Err(e) if e.is_no_such_process() && tid != pid => {
                    tracing::debug!("Thread {} exited before options were set", tid);
                }
                Err(e) => return Err(e.into()),
            }
        }

        let mut coordinator_slot = None;
        let shared = Arc::new_cyclic(|weak: &Weak<ProcessShared<B>>| {
            let (coordinator, handle) = ThreadStateCoordinator::new(ProcessCoordinatorHandler {
                shared: weak.clone(),
            });
            coordinator_slot = Some(coordinator);
            ProcessShared {
                pid,
                backend: Arc::clone(&backend),
                ops,
                coordinator: handle,
                threads: Mutex::new(ThreadRegistry::new()),
                status: Mutex::new(ProcessStatus {
                    state: initial_state,
                    exit_status: None,
                    stop_id: 0,
                    current_tid: Some(pid),
                }),
                delegate,
                arch: options.architecture,
                register_context: options.register_context,
                breakpoints: Mutex::new(BreakpointManager::new()),
                regions: Mutex::new(RegionCache::default()),
                gathering: AtomicBool::new(false),
            }
        });
        let coordinator = coordinator_slot.ok_or(TraceError::new("startup", Errno::EINVAL))?;

        {
            let mut threads = lock(&shared.threads);
            for &tid in &tids {
                threads.add(shared.new_record(tid, ThreadState::Stopped(initial_reason)));
                shared.coordinator.notify_thread_create(tid, true);
            }
        }

        let coordinator_thread = thread::Builder::new()
            .name("kokia-coordinator".to_string())
            .spawn(move || coordinator.run())
            .map_err(|source| ProcessError::ThreadSpawn {
                name: "coordinator",
                source,
            })?;

        shared.set_state(ProcessState::Stopped);

        let monitor = InferiorMonitor::spawn(Arc::downgrade(&shared), Arc::clone(&backend))?;

        tracing::info!("Debugging pid {} with {} thread(s)", pid, tids.len());
        Ok(Self {
            shared,
            coordinator_thread: Some(coordinator_thread),
            _monitor: monitor,
        })
    }

    pub fn pid(&self) -> ThreadId {
        self.shared.pid
    }

    pub fn state(&self) -> ProcessState {
        self.shared.state()
    }

    pub fn exit_status(&self) -> Option<ExitStatus> {
        lock(&self.shared.status).exit_status
    }

    pub fn stop_id(&self) -> u32 {
        lock(&self.shared.status).stop_id
    }

    /// 最後に停止を引き起こしたスレッド
    pub fn current_thread(&self) -> Option<ThreadId> {
        lock(&self.shared.status).current_tid
    }

    pub fn threads(&self) -> Vec<ThreadInfo> {
        lock(&self.shared.threads).snapshot()
    }

    pub fn architecture(&self) -> &dyn ArchitectureInfo {
        self.shared.arch.as_ref()
    }

    fn reject_if(&self, operation: &'static str, rejected: &[ProcessState]) -> Result<()> {
        let state = self.state();
        if rejected.contains(&state) {
            return Err(ProcessError::InvalidState { operation, state });
        }
        Ok(())
    }

    fn ensure_live(&self, operation: &'static str) -> Result<()> {
        self.reject_if(operation, &[ProcessState::Exited, ProcessState::Detached])
    }

    fn ensure_thread(&self, tid: ThreadId) -> Result<()> {
        if lock(&self.shared.threads).contains(tid) {
            Ok(())
        } else {
            Err(ProcessError::NoSuchThread(tid))
        }
    }

    /// スレッドごとの指示に従って実行を再開する
    ///
    /// 停止したままのスレッドがあり、かつステップ実行するスレッドがない場合は、
    /// 他のスレッドが止まった時点で停止を報告します。
    pub fn resume(&self, actions: &ResumeActionList) -> Result<()> {
        self.reject_if(
            "resume",
            &[ProcessState::Exited, ProcessState::Crashed, ProcessState::Detached],
        )?;

        let threads = lock(&self.shared.threads).snapshot();
        let mut deferred_tid = None;
        let mut stepping = false;

        for thread in threads {
            // clone の片側しか観測していないスレッドはまだ動かせない
            if thread.state == ThreadState::Launching {
                continue;
            }

            match actions.action_for(thread.tid) {
                None => tracing::debug!("No resume action for thread {}", thread.tid),
                Some(ResumeAction::Run { signal }) => {
                    self.shared
                        .coordinator
                        .request_thread_resume_as_needed(
                            thread.tid,
                            ResumeRequest::continue_with(signal).announced(),
                        );
                }
                Some(ResumeAction::Step { signal }) => {
                    self.shared
                        .coordinator
                        .request_thread_resume(
                            thread.tid,
                            ResumeRequest::step_with(signal).announced(),
                        );
                    stepping = true;
                }
                Some(ResumeAction::Stop) => {
                    deferred_tid.get_or_insert(thread.tid);
                }
            }
        }

        // ステップ実行するスレッドは自分のトラップで停止を報告する
        if let (Some(tid), false) = (deferred_tid, stepping) {
            self.shared.gather_stop(tid, StopNotice::DeferredSignal(SIGSTOP));
        }
        Ok(())
    }

    /// プロセスに SIGSTOP を送る
    pub fn halt(&self) -> Result<()> {
        self.reject_if(
            "halt",
            &[ProcessState::Exited, ProcessState::Crashed, ProcessState::Detached],
        )?;
        self.shared.backend.kill_process(self.shared.pid, SIGSTOP)?;
        Ok(())
    }

    /// 実行中のスレッド（なければ生きている停止中のスレッド）を起点に全スレッドを止める
    pub fn interrupt(&self) -> Result<()> {
        self.reject_if(
            "interrupt",
            &[ProcessState::Exited, ProcessState::Crashed, ProcessState::Detached],
        )?;

        let target = {
            let threads = lock(&self.shared.threads);
            let running = threads.iter().find(|t| t.state.is_running()).map(|t| t.tid);
            running.or_else(|| threads.iter().find(|t| t.state.is_stopped()).map(|t| t.tid))
        };
        let tid = target.ok_or(ProcessError::NoInterruptTarget)?;

        tracing::debug!("Interrupting process {} via thread {}", self.shared.pid, tid);
        self.shared.gather_stop(tid, StopNotice::DeferredSignal(SIGSTOP));
        Ok(())
    }

    /// プロセスにシグナルを送る
    pub fn signal(&self, signo: i32) -> Result<()> {
        self.ensure_live("signal")?;
        tracing::debug!("Sending signal {} to pid {}", signo, self.shared.pid);
        self.shared.backend.kill_process(self.shared.pid, signo)?;
        Ok(())
    }

    /// プロセスを強制終了する
    pub fn kill(&self) -> Result<()> {
        if matches!(self.state(), ProcessState::Exited | ProcessState::Detached) {
            return Ok(());
        }
        self.shared.backend.kill_process(self.shared.pid, SIGKILL)?;
        Ok(())
    }

    /// 全スレッドからデタッチする
    pub fn detach(&self) -> Result<()> {
        self.reject_if(
            "detach",
            &[ProcessState::Exited, ProcessState::Detached, ProcessState::Running],
        )?;

        // ブレークポイントを残したまま離れるとトラップで落ちる
        let removed: Vec<Breakpoint> = {
            let mut breakpoints = lock(&self.shared.breakpoints);
            let ids: Vec<BreakpointId> = breakpoints.all().map(|bp| bp.id).collect();
            ids.into_iter()
                .filter_map(|id| breakpoints.remove_and_disable(id, self.shared.as_ref()).ok())
                .collect()
        };
        tracing::debug!("Removed {} breakpoints before detaching", removed.len());

        let tids = lock(&self.shared.threads).tids();
        for tid in tids {
            match self.shared.ops.detach(tid) {
                Ok(()) => {}
                Err(e) if e.is_no_such_process() => tracing::debug!("Thread {} already gone", tid),
                Err(e) => return Err(e.into()),
            }
        }

        self.shared.set_state(ProcessState::Detached);
        self.shared.coordinator.stop_coordinator();
        self.shared.ops.shutdown();
        Ok(())
    }

    pub fn read_memory(&self, addr: u64, len: usize) -> Result<Vec<u8>> {
        self.ensure_live("read memory")?;
        Ok(self.shared.read_memory(addr, len)?)
    }

    pub fn write_memory(&self, addr: u64, data: &[u8]) -> Result<()> {
        self.ensure_live("write memory")?;
        Ok(self.shared.write_memory(addr, data)?)
    }

    pub fn read_registers(&self, tid: ThreadId) -> Result<Registers> {
        self.ensure_live("read registers")?;
        self.ensure_thread(tid)?;
        Ok(self.shared.ops.read_registers(tid)?)
    }

    pub fn write_registers(&self, tid: ThreadId, regs: &Registers) -> Result<()> {
        self.ensure_live("write registers")?;
        self.ensure_thread(tid)?;
        Ok(self.shared.ops.write_registers(tid, regs)?)
    }

    pub fn read_extended_registers(&self, tid: ThreadId) -> Result<Vec<u8>> {
        self.ensure_live("read extended registers")?;
        self.ensure_thread(tid)?;
        Ok(self.shared.ops.read_extended_registers(tid)?)
    }

    pub fn write_extended_registers(&self, tid: ThreadId, data: &[u8]) -> Result<()> {
        self.ensure_live("write extended registers")?;
        self.ensure_thread(tid)?;
        Ok(self.shared.ops.write_extended_registers(tid, data)?)
    }

    pub fn program_counter(&self, tid: ThreadId) -> Result<u64> {
        Ok(program_counter(&self.read_registers(tid)?))
    }

    pub fn set_program_counter(&self, tid: ThreadId, pc: u64) -> Result<()> {
        let mut regs = self.read_registers(tid)?;
        set_program_counter(&mut regs, pc);
        self.write_registers(tid, &regs)
    }

    /// ブレークポイントのトラップ後の PC 補正（補正したら true）
    pub fn fix_breakpoint_pc(&self, tid: ThreadId) -> Result<bool> {
        self.ensure_live("fix breakpoint pc")?;
        self.ensure_thread(tid)?;
        Ok(self.shared.fix_breakpoint_pc(tid)?)
    }

    pub fn set_breakpoint(&self, addr: u64) -> Result<BreakpointId> {
        self.ensure_live("set breakpoint")?;
        let id = lock(&self.shared.breakpoints).add_and_enable(
            addr,
            self.shared.as_ref(),
            self.shared.arch.as_ref(),
        )?;
        tracing::info!("Breakpoint {} set at 0x{:x}", id, addr);
        Ok(id)
    }

    pub fn remove_breakpoint(&self, id: BreakpointId) -> Result<()> {
        self.ensure_live("remove breakpoint")?;
        let bp = lock(&self.shared.breakpoints).remove_and_disable(id, self.shared.as_ref())?;
        tracing::info!("Breakpoint {} at 0x{:x} removed", bp.id, bp.address);
        Ok(())
    }

    pub fn breakpoints(&self) -> Vec<Breakpoint> {
        lock(&self.shared.breakpoints).all().copied().collect()
    }

    /// アドレスを含むメモリ領域を返す
    ///
    /// /proc/pid/maps は最初の問い合わせで読み込み、次の停止まで使い回します。
    /// 読み込みに一度失敗すると、以降は常に未対応として扱います。
    pub fn memory_region_info(&self, addr: u64) -> Result<MemoryRegionInfo> {
        let mut cache = lock(&self.shared.regions);

        if cache.supported == Some(false) {
            return Err(ProcessError::MemoryRegion("unsupported".to_string()));
        }

        if cache.regions.is_empty() {
            let regions = self
                .shared
                .backend
                .memory_maps(self.shared.pid)
                .map_err(|e| e.to_string())
                .and_then(|contents| parse_maps(&contents).map_err(|e| e.to_string()));

            match regions {
                Ok(regions) if !regions.is_empty() => {
                    cache.regions = regions;
                    cache.supported = Some(true);
                }
                Ok(_) => {
                    cache.supported = Some(false);
                    return Err(ProcessError::MemoryRegion("not supported".to_string()));
                }
                Err(e) => {
                    cache.supported = Some(false);
                    return Err(ProcessError::MemoryRegion(e));
                }
            }
        }

        find_region(&cache.regions, addr)
            .ok_or_else(|| {
                ProcessError::MemoryRegion("address comes after final region".to_string())
            })
    }
}

impl<B: TraceSyscalls> Drop for NativeProcess<B> {
    fn drop(&mut self) {
        self.shared.coordinator.stop_coordinator();
        if let Some(handle) = self.coordinator_thread.take() {
            if handle.join().is_err() {
                tracing::error!("Thread state coordinator panicked");
            }
        }
        // ファネルスレッドの終了でカーネルが残りのトレース関係を解除する
        self.shared.ops.shutdown();
    }
}
