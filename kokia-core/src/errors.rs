//! エラー型

use crate::delegate::ProcessState;
use kokia_target::{AttachError, LaunchError, ThreadId, TraceError};
use thiserror::Error;

/// コーディネータの内部不変条件違反
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CoordinatorError {
    #[error("thread {0} is already tracked")]
    AlreadyTracked(ThreadId),

    #[error("thread {0} is not tracked")]
    UnknownThread(ThreadId),

    #[error("thread {0} is already running")]
    AlreadyRunning(ThreadId),

    #[error("a stop notification is already pending (triggered by thread {0})")]
    NotificationPending(ThreadId),
}

/// プロセス制御のエラー
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error(transparent)]
    Trace(#[from] TraceError),

    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error(transparent)]
    Attach(#[from] AttachError),

    #[error("cannot {operation} while the process is {state:?}")]
    InvalidState {
        operation: &'static str,
        state: ProcessState,
    },

    #[error("no such thread: {0}")]
    NoSuchThread(ThreadId),

    #[error("a breakpoint already exists at 0x{0:x}")]
    BreakpointExists(u64),

    #[error("breakpoint {0} not found")]
    BreakpointNotFound(usize),

    #[error("memory region lookup failed: {0}")]
    MemoryRegion(String),

    #[error("found no running/stepping or live stopped threads as target for interrupt")]
    NoInterruptTarget,

    #[error("failed to spawn {name} thread: {source}")]
    ThreadSpawn {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },
}
