//! 起動パラメータ

use std::path::{Path, PathBuf};

/// デバッグ対象を起動するための設定
///
/// `env` の各エントリは親プロセスの環境変数に上書き追加されます。
#[derive(Debug, Clone, Default)]
pub struct LaunchInfo {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub working_dir: Option<PathBuf>,
    pub stdin: Option<PathBuf>,
    pub stdout: Option<PathBuf>,
    pub stderr: Option<PathBuf>,
    /// ASLR を無効化して起動する
    pub disable_aslr: bool,
}

impl LaunchInfo {
    pub fn new<P: AsRef<Path>>(program: P) -> Self {
        Self {
            program: program.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_working_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.working_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn with_stdout<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.stdout = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn with_stderr<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.stderr = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn with_stdin<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.stdin = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn with_aslr_disabled(mut self, disable: bool) -> Self {
        self.disable_aslr = disable;
        self
    }

    /// 親プロセスの環境変数に `env` を重ねた一覧を返す
    pub fn merged_environment(&self) -> Vec<(String, String)> {
        let mut merged: Vec<(String, String)> = std::env::vars()
            .filter(|(key, _)| !self.env.iter().any(|(k, _)| k == key))
            .collect();
        merged.extend(self.env.iter().cloned());
        merged
    }
}
