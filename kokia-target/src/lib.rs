//! Kokia ターゲットプロセス制御
//!
//! このクレートは、デバッグ対象のプロセスを制御するための低レベル機能を提供します。
//! ptrace システムコールの境界（[`TraceSyscalls`]）とその Linux 実装、
//! ワード単位のメモリアクセス、レジスタ、ブレークポイント命令などを扱います。

pub mod breakpoint;
pub mod error;
pub mod launch;
pub mod linux;
pub mod memory;
pub mod registers;
pub mod siginfo;
pub mod syscalls;
pub mod thread;

pub use breakpoint::{host_architecture, Aarch64, ArchitectureInfo, SoftwareBreakpoint, X86_64};
pub use error::{AttachError, LaunchError, TraceError};
pub use launch::LaunchInfo;
pub use linux::LinuxTracer;
pub use memory::{MemoryAccess, MemoryRegionInfo, WordAccess};
pub use registers::{NoWatchpoints, RegisterContext, Registers};
pub use siginfo::{ExitDisposition, SignalInfo};
pub use syscalls::{TraceSyscalls, WaitEvent};
pub use thread::{StopReason, ThreadId, ThreadState};

pub use nix::errno::Errno;
