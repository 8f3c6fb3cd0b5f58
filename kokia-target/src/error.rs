//! トレース系システムコールのエラー型

use nix::errno::Errno;
use std::path::PathBuf;
use thiserror::Error;

/// トレース関連のシステムコールが失敗したことを表すエラー
///
/// 失敗したリクエスト名と OS のエラーコードを保持します。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{request} failed: {errno}")]
pub struct TraceError {
    request: &'static str,
    errno: Errno,
}

impl TraceError {
    /// エラーを作成する
    pub fn new(request: &'static str, errno: Errno) -> Self {
        Self { request, errno }
    }

    /// 失敗したリクエスト名
    pub fn request(&self) -> &'static str {
        self.request
    }

    /// OS のエラーコード
    pub fn errno(&self) -> Errno {
        self.errno
    }

    /// スレッドが既に存在しない（ESRCH）かどうか
    pub fn is_no_such_process(&self) -> bool {
        self.errno == Errno::ESRCH
    }

    /// PTRACE_GETSIGINFO がグループストップを示している（EINVAL）かどうか
    pub fn is_group_stop(&self) -> bool {
        self.errno == Errno::EINVAL
    }
}

/// 起動処理のエラー
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("working directory {} does not exist", .0.display())]
    MissingWorkingDirectory(PathBuf),

    #[error("invalid launch argument: {0}")]
    InvalidArgument(String),

    #[error("fork failed: {0}")]
    Fork(Errno),

    #[error("child failed to enable tracing")]
    ChildTraceMe,

    #[error("child failed to redirect stdin")]
    ChildDupStdin,

    #[error("child failed to redirect stdout")]
    ChildDupStdout,

    #[error("child failed to redirect stderr")]
    ChildDupStderr,

    #[error("child failed to change working directory")]
    ChildChdir,

    #[error("child failed to exec the program")]
    ChildExec,

    #[error("child failed to reset its group id")]
    ChildSetGid,

    #[error("child exited with unexpected status {0}")]
    ChildExited(i32),

    #[error("unexpected wait status after launch: {0}")]
    UnexpectedStatus(String),

    #[error(transparent)]
    Trace(#[from] TraceError),
}

/// アタッチ処理のエラー
#[derive(Debug, Error)]
pub enum AttachError {
    #[error("attaching to pid {0} is not allowed")]
    NotAllowed(i32),

    #[error("no such process: {0}")]
    NoSuchProcess(i32),

    #[error("failed to enumerate threads of pid {pid}: {source}")]
    ThreadList {
        pid: i32,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Trace(#[from] TraceError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_classification() {
        let gone = TraceError::new("PTRACE_GETSIGINFO", Errno::ESRCH);
        assert!(gone.is_no_such_process());
        assert!(!gone.is_group_stop());

        let group = TraceError::new("PTRACE_GETSIGINFO", Errno::EINVAL);
        assert!(group.is_group_stop());
        assert_eq!(group.request(), "PTRACE_GETSIGINFO");
    }

    #[test]
    fn test_display_includes_request() {
        let err = TraceError::new("PTRACE_CONT", Errno::EPERM);
        assert!(err.to_string().starts_with("PTRACE_CONT failed"));
    }
}
