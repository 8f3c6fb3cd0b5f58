//! Kokia デバッガのコア機能
//!
//! このクレートは、Linux 上のトレース対象プロセスを制御する中核ロジックを提供します。
//!
//! - [`operation`]: 全ての ptrace 呼び出しを1つのスレッドに集めるファネル
//! - [`coordinator`]: 全スレッドの停止を待ち合わせるスレッド状態コーディネータ
//! - [`process`]: 起動・アタッチ・再開・停止・メモリとレジスタのアクセス
//! - [`breakpoint`]: ソフトウェアブレークポイントの管理

pub mod breakpoint;
pub mod command;
pub mod coordinator;
pub mod delegate;
mod dispatch;
pub mod errors;
mod monitor;
pub mod operation;
pub mod parse;
pub mod process;
pub mod registry;
pub mod resume;

pub use breakpoint::{Breakpoint, BreakpointId, BreakpointManager};
pub use command::{Command, CommandError};
pub use coordinator::{
    CoordinatorEvent, CoordinatorHandle, CoordinatorHandler, ResumeKind, ResumePolicy,
    ResumeRequest, RunState, StopNotice, ThreadStateCoordinator, WaitTarget,
};
pub use delegate::{ExitStatus, ExitType, ProcessDelegate, ProcessState};
pub use errors::{CoordinatorError, ProcessError};
pub use operation::{Operation, OperationChannel, OperationOutput, Startup};
pub use process::{NativeProcess, ProcessOptions, RegisterContextFactory};
pub use registry::{ThreadInfo, ThreadRecord, ThreadRegistry};
pub use resume::{ResumeAction, ResumeActionList};

// 他のクレートから使用するために再エクスポート
pub use kokia_target::{LaunchInfo, MemoryRegionInfo, StopReason, ThreadId, ThreadState};

/// コア機能の結果型
pub type Result<T> = std::result::Result<T, ProcessError>;
