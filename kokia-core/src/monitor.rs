//! waitpid でトレース対象のイベントを待つモニタスレッド

use crate::errors::ProcessError;
use crate::process::ProcessShared;
use kokia_target::{Errno, TraceSyscalls, WaitEvent};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

/// モニタループを続けるかどうか
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MonitorControl {
    Continue,
    Stop,
}

/// モニタスレッド
///
/// waitpid はブロックしたまま中断できないため、join はしません。
/// プロセスが破棄された後に届いたイベントで終了します。
pub(crate) struct InferiorMonitor {
    _handle: JoinHandle<()>,
}

impl InferiorMonitor {
    pub(crate) fn spawn<B: TraceSyscalls>(
        shared: Weak<ProcessShared<B>>,
        backend: Arc<B>,
    ) -> Result<Self, ProcessError> {
        let handle = thread::Builder::new()
            .name("kokia-monitor".to_string())
            .spawn(move || monitor_loop(shared, backend))
            .map_err(|source| ProcessError::ThreadSpawn { name: "monitor", source })?;
        Ok(Self { _handle: handle })
    }
}

fn monitor_loop<B: TraceSyscalls>(shared: Weak<ProcessShared<B>>, backend: Arc<B>) {
    tracing::debug!("Monitor thread started");
    loop {
        let event = match backend.wait_for_event() {
            Ok(event) => event,
            Err(e) if e.errno() == Errno::EINTR => continue,
            Err(e) => {
                tracing::error!("waitpid failed: {}", e);
                break;
            }
        };

        if event == WaitEvent::NoChildren {
            tracing::debug!("No traced children left");
            break;
        }

        let Some(shared) = shared.upgrade() else {
            tracing::debug!("Process dropped, monitor exiting");
            break;
        };
        if shared.handle_wait_event(event) == MonitorControl::Stop {
            break;
        }
    }
    tracing::debug!("Monitor thread stopped");
}
