//! ptrace 操作を単一スレッドに集約するファネル
//!
//! カーネルはトレース関係を確立したスレッド以外からの ptrace 要求を拒否するため、
//! 起動（launch / attach）から全ての操作までを専用スレッド上で実行します。
//! 呼び出し側は `submit` で操作を渡し、完了するまでブロックします。

use crate::errors::ProcessError;
use crossbeam_channel::{bounded, Receiver, Sender};
use kokia_target::memory::{read_words, write_words};
use kokia_target::{Errno, LaunchInfo, Registers, SignalInfo, ThreadId, TraceError, TraceSyscalls};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

/// ファネルスレッドで実行する操作
#[derive(Debug, Clone)]
pub enum Operation {
    ReadMemory { tid: ThreadId, addr: u64, len: usize },
    WriteMemory { tid: ThreadId, addr: u64, data: Vec<u8> },
    ReadRegisters { tid: ThreadId },
    WriteRegisters { tid: ThreadId, regs: RegisterSet },
    ReadExtendedRegisters { tid: ThreadId },
    WriteExtendedRegisters { tid: ThreadId, data: Vec<u8> },
    Resume { tid: ThreadId, signal: Option<i32> },
    SingleStep { tid: ThreadId, signal: Option<i32> },
    GetSignalInfo { tid: ThreadId },
    GetEventMessage { tid: ThreadId },
    SetOptions { tid: ThreadId },
    Detach { tid: ThreadId },
}

/// `Registers` を Debug 可能に包む
#[derive(Clone, Copy)]
pub struct RegisterSet(pub Registers);

impl std::fmt::Debug for RegisterSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisterSet")
            .field("pc", &format_args!("0x{:x}", kokia_target::registers::program_counter(&self.0)))
            .finish_non_exhaustive()
    }
}

/// 操作の結果
#[derive(Debug, Clone)]
pub enum OperationOutput {
    Unit,
    Bytes(Vec<u8>),
    Registers(RegisterSet),
    SignalInfo(SignalInfo),
    EventMessage(u64),
}

impl Operation {
    fn name(&self) -> &'static str {
        match self {
            Operation::ReadMemory { .. } => "read memory",
            Operation::WriteMemory { .. } => "write memory",
            Operation::ReadRegisters { .. } => "read registers",
            Operation::WriteRegisters { .. } => "write registers",
            Operation::ReadExtendedRegisters { .. } => "read extended registers",
            Operation::WriteExtendedRegisters { .. } => "write extended registers",
            Operation::Resume { .. } => "resume",
            Operation::SingleStep { .. } => "single step",
            Operation::GetSignalInfo { .. } => "get signal info",
            Operation::GetEventMessage { .. } => "get event message",
            Operation::SetOptions { .. } => "set options",
            Operation::Detach { .. } => "detach",
        }
    }

    fn execute<B: TraceSyscalls + ?Sized>(
        self,
        backend: &B,
    ) -> Result<OperationOutput, TraceError> {
        match self {
            Operation::ReadMemory { tid, addr, len } => {
                read_words(backend, tid, addr, len).map(OperationOutput::Bytes)
            }
            Operation::WriteMemory { tid, addr, data } => {
                write_words(backend, tid, addr, &data).map(|_| OperationOutput::Unit)
            }
            Operation::ReadRegisters { tid } => backend
                .get_registers(tid)
                .map(|regs| OperationOutput::Registers(RegisterSet(regs))),
            Operation::WriteRegisters { tid, regs } => {
                backend.set_registers(tid, &regs.0).map(|_| OperationOutput::Unit)
            }
            Operation::ReadExtendedRegisters { tid } => {
                backend.get_extended_registers(tid).map(OperationOutput::Bytes)
            }
            Operation::WriteExtendedRegisters { tid, data } => backend
                .set_extended_registers(tid, &data)
                .map(|_| OperationOutput::Unit),
            Operation::Resume { tid, signal } => {
                backend.resume(tid, signal).map(|_| OperationOutput::Unit)
            }
            Operation::SingleStep { tid, signal } => {
                backend.single_step(tid, signal).map(|_| OperationOutput::Unit)
            }
            Operation::GetSignalInfo { tid } => {
                backend.get_signal_info(tid).map(OperationOutput::SignalInfo)
            }
            Operation::GetEventMessage { tid } => {
                backend.get_event_message(tid).map(OperationOutput::EventMessage)
            }
            Operation::SetOptions { tid } => {
                backend.set_options(tid).map(|_| OperationOutput::Unit)
            }
            Operation::Detach { tid } => backend.detach(tid).map(|_| OperationOutput::Unit),
        }
    }
}

/// ファネルスレッドが最初に実行する起動処理
#[derive(Debug, Clone)]
pub enum Startup {
    Launch(LaunchInfo),
    Attach(ThreadId),
}

enum Job {
    Run(Operation),
    Shutdown,
}

type JobResult = Result<OperationOutput, TraceError>;

struct Lanes {
    jobs: Sender<Job>,
    done: Receiver<JobResult>,
}

/// 操作チャネル（ファネル）
pub struct OperationChannel {
    // 同時に1つの操作しか流さないため、送信と完了待ちをまとめてロックする
    lanes: Mutex<Lanes>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

fn funnel_gone() -> TraceError {
    TraceError::new("operation funnel", Errno::ESRCH)
}

fn unexpected_output(op: &'static str) -> TraceError {
    tracing::error!("operation '{}' produced a mismatched result", op);
    TraceError::new("operation funnel", Errno::EINVAL)
}

impl OperationChannel {
    /// ファネルスレッドを起動し、その上で起動処理を実行する
    ///
    /// 起動処理が失敗した場合、スレッドは終了し、エラーを返します。
    pub fn start<B: TraceSyscalls>(
        backend: Arc<B>,
        startup: Startup,
    ) -> Result<(Self, Vec<ThreadId>), ProcessError> {
        let (job_tx, job_rx) = bounded::<Job>(1);
        let (done_tx, done_rx) = bounded::<JobResult>(1);
        let (startup_tx, startup_rx) = bounded::<Result<Vec<ThreadId>, ProcessError>>(1);

        let worker = thread::Builder::new()
            .name("kokia-funnel".to_string())
            .spawn(move || {
                let outcome = match startup {
                    Startup::Launch(info) => backend
                        .launch(&info)
                        .map(|pid| vec![pid])
                        .map_err(ProcessError::from),
                    Startup::Attach(pid) => backend.attach(pid).map_err(ProcessError::from),
                };
                let started = outcome.is_ok();
                if startup_tx.send(outcome).is_err() || !started {
                    return;
                }
                serve(backend.as_ref(), job_rx, done_tx);
            })
            .map_err(|source| ProcessError::ThreadSpawn { name: "funnel", source })?;

        let tids = match startup_rx.recv() {
            Ok(Ok(tids)) => tids,
            Ok(Err(e)) => {
                let _ = worker.join();
                return Err(e);
            }
            Err(_) => {
                let _ = worker.join();
                return Err(funnel_gone().into());
            }
        };

        let channel = Self {
            lanes: Mutex::new(Lanes {
                jobs: job_tx,
                done: done_rx,
            }),
            worker: Mutex::new(Some(worker)),
        };
        Ok((channel, tids))
    }

    /// 操作を実行し、完了まで待つ
    pub fn submit(&self, op: Operation) -> JobResult {
        let lanes = self.lanes.lock().unwrap_or_else(PoisonError::into_inner);
        let name = op.name();
        lanes.jobs.send(Job::Run(op)).map_err(|_| funnel_gone())?;
        let result = lanes.done.recv().map_err(|_| funnel_gone())?;
        if let Err(e) = &result {
            tracing::debug!("Operation '{}' failed: {}", name, e);
        }
        result
    }

    /// 終了センチネルを送り、スレッドを join する
    pub fn shutdown(&self) {
        let handle = self.worker.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some(handle) = handle else {
            return;
        };

        {
            let lanes = self.lanes.lock().unwrap_or_else(PoisonError::into_inner);
            let _ = lanes.jobs.send(Job::Shutdown);
        }
        if handle.join().is_err() {
            tracing::error!("Operation funnel thread panicked");
        }
        tracing::debug!("Operation funnel stopped");
    }

    pub fn read_memory(&self, tid: ThreadId, addr: u64, len: usize) -> Result<Vec<u8>, TraceError> {
        match self.submit(Operation::ReadMemory { tid, addr, len })? {
            OperationOutput::Bytes(bytes) => Ok(bytes),
            _ => Err(unexpected_output("read memory")),
        }
    }

    pub fn write_memory(&self, tid: ThreadId, addr: u64, data: &[u8]) -> Result<(), TraceError> {
        self.submit(Operation::WriteMemory {
            tid,
            addr,
            data: data.to_vec(),
        })
        .map(drop)
    }

    pub fn read_registers(&self, tid: ThreadId) -> Result<Registers, TraceError> {
        match self.submit(Operation::ReadRegisters { tid })? {
            OperationOutput::Registers(regs) => Ok(regs.0),
            _ => Err(unexpected_output("read registers")),
        }
    }

    pub fn write_registers(&self, tid: ThreadId, regs: &Registers) -> Result<(), TraceError> {
        self.submit(Operation::WriteRegisters {
            tid,
            regs: RegisterSet(*regs),
        })
        .map(drop)
    }

    pub fn read_extended_registers(&self, tid: ThreadId) -> Result<Vec<u8>, TraceError> {
        match self.submit(Operation::ReadExtendedRegisters { tid })? {
            OperationOutput::Bytes(bytes) => Ok(bytes),
            _ => Err(unexpected_output("read extended registers")),
        }
    }

    pub fn write_extended_registers(&self, tid: ThreadId, data: &[u8]) -> Result<(), TraceError> {
        self.submit(Operation::WriteExtendedRegisters {
            tid,
            data: data.to_vec(),
        })
        .map(drop)
    }

    pub fn resume(&self, tid: ThreadId, signal: Option<i32>) -> Result<(), TraceError> {
        self.submit(Operation::Resume { tid, signal }).map(drop)
    }

    pub fn single_step(&self, tid: ThreadId, signal: Option<i32>) -> Result<(), TraceError> {
        self.submit(Operation::SingleStep { tid, signal }).map(drop)
    }

    pub fn signal_info(&self, tid: ThreadId) -> Result<SignalInfo, TraceError> {
        match self.submit(Operation::GetSignalInfo { tid })? {
            OperationOutput::SignalInfo(info) => Ok(info),
            _ => Err(unexpected_output("get signal info")),
        }
    }

    pub fn event_message(&self, tid: ThreadId) -> Result<u64, TraceError> {
        match self.submit(Operation::GetEventMessage { tid })? {
            OperationOutput::EventMessage(msg) => Ok(msg),
            _ => Err(unexpected_output("get event message")),
        }
    }

    pub fn set_options(&self, tid: ThreadId) -> Result<(), TraceError> {
        self.submit(Operation::SetOptions { tid }).map(drop)
    }

    pub fn detach(&self, tid: ThreadId) -> Result<(), TraceError> {
        self.submit(Operation::Detach { tid }).map(drop)
    }
}

impl Drop for OperationChannel {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// ファネルスレッドのループ
fn serve<B: TraceSyscalls + ?Sized>(backend: &B, jobs: Receiver<Job>, done: Sender<JobResult>) {
    while let Ok(job) = jobs.recv() {
        match job {
            Job::Shutdown => break,
            Job::Run(op) => {
                tracing::trace!("funnel: {:?}", op);
                if done.send(op.execute(backend)).is_err() {
                    break;
                }
            }
        }
    }
}
