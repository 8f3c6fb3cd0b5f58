//! 実プロセスを使わずにプロセス制御を動かすための台本付きバックエンド

#![allow(dead_code)]

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use kokia_core::{ExitType, ProcessDelegate, ProcessState};
use kokia_target::registers::zeroed_registers;
use kokia_target::siginfo::{SIGSTOP, SIGTRAP, SI_TKILL};
use kokia_target::{
    AttachError, Errno, LaunchError, LaunchInfo, Registers, SignalInfo, ThreadId, TraceError,
    TraceSyscalls, WaitEvent, WordAccess,
};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const TIMEOUT: Duration = Duration::from_secs(5);
pub const QUIET: Duration = Duration::from_millis(200);

/// デバッガ自身の pid として振る舞う値
pub const OWN_PID: i32 = 4242;

/// バックエンドに対して行われた呼び出し
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Call {
    Resume { tid: ThreadId, signal: Option<i32> },
    Step { tid: ThreadId, signal: Option<i32> },
    KillThread { tid: ThreadId, signal: i32 },
    KillProcess { signal: i32 },
    Detach { tid: ThreadId },
}

pub struct ScriptedBackend {
    startup_tids: Vec<ThreadId>,
    events: Receiver<WaitEvent>,
    calls: Sender<Call>,
    signal_info: Mutex<HashMap<ThreadId, SignalInfo>>,
    /// GETSIGINFO が EINVAL を返す（グループ停止中の）スレッド
    group_stopped: Mutex<HashSet<ThreadId>>,
    options_set: Mutex<Vec<ThreadId>>,
    event_messages: Mutex<HashMap<ThreadId, u64>>,
    registers: Mutex<HashMap<ThreadId, Registers>>,
    memory: Mutex<HashMap<u64, u8>>,
    maps: Mutex<Option<String>>,
    resume_errno: Mutex<Option<Errno>>,
    executing_threads: Mutex<Vec<Option<String>>>,
}

impl ScriptedBackend {
    fn record(&self, call: Call) {
        self.note_thread();
        let _ = self.calls.send(call);
    }

    fn note_thread(&self) {
        let name = std::thread::current().name().map(str::to_string);
        self.executing_threads.lock().unwrap().push(name);
    }

    /// ptrace 相当の呼び出しを実行したスレッド名の一覧
    pub fn executing_threads(&self) -> Vec<Option<String>> {
        self.executing_threads.lock().unwrap().clone()
    }

    pub fn set_signal_info(&self, tid: ThreadId, info: SignalInfo) {
        self.signal_info.lock().unwrap().insert(tid, info);
    }

    /// トレースオプションを設定したスレッド（設定順）
    pub fn options_set(&self) -> Vec<ThreadId> {
        self.options_set.lock().unwrap().clone()
    }

    pub fn set_event_message(&self, tid: ThreadId, message: u64) {
        self.event_messages.lock().unwrap().insert(tid, message);
    }

    pub fn set_registers(&self, tid: ThreadId, regs: Registers) {
        self.registers.lock().unwrap().insert(tid, regs);
    }

    pub fn registers_of(&self, tid: ThreadId) -> Registers {
        self.registers
            .lock()
            .unwrap()
            .get(&tid)
            .copied()
            .unwrap_or_else(zeroed_registers)
    }

    pub fn poke_bytes(&self, addr: u64, bytes: &[u8]) {
        let mut memory = self.memory.lock().unwrap();
        for (i, byte) in bytes.iter().enumerate() {
            memory.insert(addr + i as u64, *byte);
        }
    }

    pub fn byte_at(&self, addr: u64) -> u8 {
        self.memory.lock().unwrap().get(&addr).copied().unwrap_or(0)
    }

    pub fn set_maps(&self, maps: Option<&str>) {
        *self.maps.lock().unwrap() = maps.map(str::to_string);
    }

    pub fn fail_resumes_with(&self, errno: Option<Errno>) {
        *self.resume_errno.lock().unwrap() = errno;
    }
}

impl WordAccess for ScriptedBackend {
    fn peek_word(&self, _tid: ThreadId, addr: u64) -> Result<u64, TraceError> {
        let memory = self.memory.lock().unwrap();
        let mut bytes = [0u8; 8];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = memory.get(&(addr + i as u64)).copied().unwrap_or(0);
        }
        Ok(u64::from_ne_bytes(bytes))
    }

    fn poke_word(&self, _tid: ThreadId, addr: u64, word: u64) -> Result<(), TraceError> {
        let mut memory = self.memory.lock().unwrap();
        for (i, byte) in word.to_ne_bytes().iter().enumerate() {
            memory.insert(addr + i as u64, *byte);
        }
        Ok(())
    }
}

impl TraceSyscalls for ScriptedBackend {
    fn launch(&self, info: &LaunchInfo) -> Result<ThreadId, LaunchError> {
        if info.program.as_os_str().is_empty() {
            return Err(LaunchError::InvalidArgument("empty program path".to_string()));
        }
        self.note_thread();
        Ok(self.startup_tids[0])
    }

    fn attach(&self, pid: ThreadId) -> Result<Vec<ThreadId>, AttachError> {
        if pid != self.startup_tids[0] {
            return Err(AttachError::NoSuchProcess(pid));
        }
        Ok(self.startup_tids.clone())
    }

    fn detach(&self, tid: ThreadId) -> Result<(), TraceError> {
        self.record(Call::Detach { tid });
        Ok(())
    }

    fn resume(&self, tid: ThreadId, signal: Option<i32>) -> Result<(), TraceError> {
        if let Some(errno) = *self.resume_errno.lock().unwrap() {
            return Err(TraceError::new("PTRACE_CONT", errno));
        }
        self.record(Call::Resume { tid, signal });
        Ok(())
    }

    fn single_step(&self, tid: ThreadId, signal: Option<i32>) -> Result<(), TraceError> {
        self.record(Call::Step { tid, signal });
        Ok(())
    }

    fn get_registers(&self, tid: ThreadId) -> Result<Registers, TraceError> {
        self.note_thread();
        Ok(self.registers_of(tid))
    }

    fn set_registers(&self, tid: ThreadId, regs: &Registers) -> Result<(), TraceError> {
        self.registers.lock().unwrap().insert(tid, *regs);
        Ok(())
    }

    fn get_extended_registers(&self, _tid: ThreadId) -> Result<Vec<u8>, TraceError> {
        Ok(vec![0; 512])
    }

    fn set_extended_registers(&self, _tid: ThreadId, _data: &[u8]) -> Result<(), TraceError> {
        Ok(())
    }

    fn get_signal_info(&self, tid: ThreadId) -> Result<SignalInfo, TraceError> {
        if self.group_stopped.lock().unwrap().remove(&tid) {
            return Err(TraceError::new("PTRACE_GETSIGINFO", Errno::EINVAL));
        }
        self.signal_info
            .lock()
            .unwrap()
            .remove(&tid)
            .ok_or(TraceError::new("PTRACE_GETSIGINFO", Errno::ESRCH))
    }

    fn get_event_message(&self, tid: ThreadId) -> Result<u64, TraceError> {
        self.event_messages
            .lock()
            .unwrap()
            .remove(&tid)
            .ok_or(TraceError::new("PTRACE_GETEVENTMSG", Errno::ESRCH))
    }

    fn set_options(&self, tid: ThreadId) -> Result<(), TraceError> {
        self.note_thread();
        self.options_set.lock().unwrap().push(tid);
        Ok(())
    }

    fn wait_for_event(&self) -> Result<WaitEvent, TraceError> {
        // 台本が破棄されたら子プロセスがいなくなったものとする
        Ok(self.events.recv().unwrap_or(WaitEvent::NoChildren))
    }

    fn kill_process(&self, _pid: ThreadId, signal: i32) -> Result<(), TraceError> {
        self.record(Call::KillProcess { signal });
        Ok(())
    }

    fn kill_thread(&self, _pid: ThreadId, tid: ThreadId, signal: i32) -> Result<(), TraceError> {
        self.record(Call::KillThread { tid, signal });
        Ok(())
    }

    fn memory_maps(&self, _pid: ThreadId) -> Result<String, TraceError> {
        self.maps
            .lock()
            .unwrap()
            .clone()
            .ok_or(TraceError::new("read /proc/pid/maps", Errno::ENOENT))
    }

    fn own_pid(&self) -> i32 {
        OWN_PID
    }
}

/// テスト側から台本を進めるためのハンドル
pub struct Script {
    pub backend: Arc<ScriptedBackend>,
    events: Sender<WaitEvent>,
    calls: Receiver<Call>,
}

impl Script {
    /// `tids[0]` を pid とするバックエンドを作る
    pub fn new(tids: &[ThreadId]) -> Self {
        let (event_tx, event_rx) = unbounded();
        let (call_tx, call_rx) = unbounded();
        let backend = Arc::new(ScriptedBackend {
            startup_tids: tids.to_vec(),
            events: event_rx,
            calls: call_tx,
            signal_info: Mutex::new(HashMap::new()),
            group_stopped: Mutex::new(HashSet::new()),
            options_set: Mutex::new(Vec::new()),
            event_messages: Mutex::new(HashMap::new()),
            registers: Mutex::new(HashMap::new()),
            memory: Mutex::new(HashMap::new()),
            maps: Mutex::new(None),
            resume_errno: Mutex::new(None),
            executing_threads: Mutex::new(Vec::new()),
        });
        Self {
            backend,
            events: event_tx,
            calls: call_rx,
        }
    }

    /// シグナル情報を設定してからトレース停止を報告する
    pub fn stop(&self, tid: ThreadId, info: SignalInfo) {
        self.backend.set_signal_info(tid, info);
        self.events.send(WaitEvent::Stopped { tid, signal: info.signo }).unwrap();
    }

    /// コーディネータが送った SIGSTOP による停止
    pub fn stop_requested(&self, tid: ThreadId) {
        self.stop(tid, SignalInfo::new(SIGSTOP, SI_TKILL, OWN_PID));
    }

    /// グループ停止の報告
    pub fn group_stop(&self, tid: ThreadId, signal: i32) {
        self.backend.group_stopped.lock().unwrap().insert(tid);
        self.events.send(WaitEvent::Stopped { tid, signal }).unwrap();
    }

    /// SIGTRAP による停止
    pub fn trap(&self, tid: ThreadId, code: i32) {
        self.stop(tid, SignalInfo::new(SIGTRAP, code, 0));
    }

    pub fn event(&self, event: WaitEvent) {
        self.events.send(event).unwrap();
    }

    /// 次の呼び出しを待つ
    pub fn next_call(&self) -> Call {
        match self.calls.recv_timeout(TIMEOUT) {
            Ok(call) => call,
            Err(RecvTimeoutError::Timeout) => panic!("timed out waiting for a backend call"),
            Err(RecvTimeoutError::Disconnected) => panic!("backend dropped"),
        }
    }

    /// 指定した数の呼び出しを集める（順序は問わない用途向けにソート済み）
    pub fn calls(&self, count: usize) -> Vec<Call> {
        let mut calls: Vec<Call> = (0..count).map(|_| self.next_call()).collect();
        calls.sort_by_key(|call| format!("{:?}", call));
        calls
    }

    /// しばらく呼び出しがないことを確認する
    pub fn assert_quiet(&self) {
        if let Ok(call) = self.calls.recv_timeout(QUIET) {
            panic!("unexpected backend call: {:?}", call);
        }
    }
}

/// 状態変化と終了ステータスを記録するデリゲート
pub struct RecordingDelegate {
    states: Sender<ProcessState>,
    state_rx: Receiver<ProcessState>,
    exits: Mutex<Vec<(ExitType, i32)>>,
    execs: Mutex<usize>,
}

impl RecordingDelegate {
    pub fn new() -> Arc<Self> {
        let (states, state_rx) = unbounded();
        Arc::new(Self {
            states,
            state_rx,
            exits: Mutex::new(Vec::new()),
            execs: Mutex::new(0),
        })
    }

    /// 次に通知された状態
    pub fn next_state(&self) -> ProcessState {
        self.state_rx
            .recv_timeout(TIMEOUT)
            .unwrap_or_else(|_| panic!("timed out waiting for a state change"))
    }

    /// 指定した状態が通知されるまで待つ（途中の状態は読み捨てる）
    pub fn wait_for(&self, state: ProcessState) {
        while self.next_state() != state {}
    }

    pub fn assert_no_state_change(&self) {
        if let Ok(state) = self.state_rx.recv_timeout(QUIET) {
            panic!("unexpected state change: {:?}", state);
        }
    }

    pub fn exits(&self) -> Vec<(ExitType, i32)> {
        self.exits.lock().unwrap().clone()
    }

    pub fn exec_count(&self) -> usize {
        *self.execs.lock().unwrap()
    }
}

impl ProcessDelegate for RecordingDelegate {
    fn on_process_state_changed(&self, state: ProcessState) {
        let _ = self.states.send(state);
    }

    fn on_exit_status(&self, exit_type: ExitType, code: i32) {
        self.exits.lock().unwrap().push((exit_type, code));
    }

    fn on_did_exec(&self) {
        *self.execs.lock().unwrap() += 1;
    }
}
