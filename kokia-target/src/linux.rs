//! Linux の ptrace(2) によるトレース機能の実装

use crate::error::{AttachError, LaunchError, TraceError};
use crate::launch::LaunchInfo;
use crate::memory::WordAccess;
use crate::registers::{zeroed_registers, Registers};
use crate::siginfo::SignalInfo;
use crate::syscalls::{TraceSyscalls, WaitEvent};
use crate::thread::ThreadId;
use nix::errno::Errno;
use nix::libc::{self, c_void};
use nix::sys::ptrace::{self, Options};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{getpgid, Pid};
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::ptr;
use std::sync::atomic::{AtomicI32, Ordering};

const NT_PRSTATUS: usize = 1;
const NT_PRFPREG: usize = 2;

/// 拡張レジスタ領域の読み出しバッファ
const EXTENDED_REGSET_CAPACITY: usize = 4096;

// 子プロセスが exec 前に失敗したときの終了コード
const CHILD_TRACEME_FAILED: i32 = 1;
const CHILD_DUP_STDIN_FAILED: i32 = 2;
const CHILD_DUP_STDOUT_FAILED: i32 = 3;
const CHILD_DUP_STDERR_FAILED: i32 = 4;
const CHILD_CHDIR_FAILED: i32 = 5;
const CHILD_EXEC_FAILED: i32 = 6;
const CHILD_SETGID_FAILED: i32 = 7;

/// 生の ptrace(2) 戻り値を検査する
fn check(request: &'static str, ret: libc::c_long) -> Result<libc::c_long, TraceError> {
    Errno::result(ret).map_err(|errno| TraceError::new(request, errno))
}

fn signal_data(signal: Option<i32>) -> *mut c_void {
    signal.unwrap_or(0) as usize as *mut c_void
}

fn pid(tid: ThreadId) -> Pid {
    Pid::from_raw(tid)
}

fn trace_options() -> Options {
    Options::PTRACE_O_TRACECLONE | Options::PTRACE_O_TRACEEXEC | Options::PTRACE_O_TRACEEXIT
}

fn to_cstring(value: &[u8]) -> Result<CString, LaunchError> {
    CString::new(value)
        .map_err(|_| LaunchError::InvalidArgument(String::from_utf8_lossy(value).into_owned()))
}

fn path_cstring(path: &Path) -> Result<CString, LaunchError> {
    to_cstring(path.as_os_str().as_bytes())
}

fn child_exit_to_error(code: i32) -> LaunchError {
    match code {
        CHILD_TRACEME_FAILED => LaunchError::ChildTraceMe,
        CHILD_DUP_STDIN_FAILED => LaunchError::ChildDupStdin,
        CHILD_DUP_STDOUT_FAILED => LaunchError::ChildDupStdout,
        CHILD_DUP_STDERR_FAILED => LaunchError::ChildDupStderr,
        CHILD_CHDIR_FAILED => LaunchError::ChildChdir,
        CHILD_EXEC_FAILED => LaunchError::ChildExec,
        CHILD_SETGID_FAILED => LaunchError::ChildSetGid,
        other => LaunchError::ChildExited(other),
    }
}

/// fork 後の子プロセスに渡す、事前に用意した C 文字列
struct ChildPlan {
    program: CString,
    argv: Vec<CString>,
    envp: Vec<CString>,
    working_dir: Option<CString>,
    stdin: Option<CString>,
    stdout: Option<CString>,
    stderr: Option<CString>,
    disable_aslr: bool,
}

impl ChildPlan {
    fn new(info: &LaunchInfo) -> Result<Self, LaunchError> {
        let program = path_cstring(&info.program)?;

        let mut argv = vec![program.clone()];
        for arg in &info.args {
            argv.push(to_cstring(arg.as_bytes())?);
        }

        let envp = info
            .merged_environment()
            .into_iter()
            .map(|(key, val)| to_cstring(format!("{}={}", key, val).as_bytes()))
            .collect::<Result<Vec<_>, _>>()?;

        let optional =
            |path: &Option<std::path::PathBuf>| path.as_deref().map(path_cstring).transpose();

        Ok(Self {
            program,
            argv,
            envp,
            working_dir: optional(&info.working_dir)?,
            stdin: optional(&info.stdin)?,
            stdout: optional(&info.stdout)?,
            stderr: optional(&info.stderr)?,
            disable_aslr: info.disable_aslr,
        })
    }

    /// fork 後の子プロセス側の処理（戻らない）
    fn exec(&self) -> ! {
        use nix::fcntl::{open, OFlag};
        use nix::sys::stat::Mode;
        use nix::unistd::{chdir, dup2, execve, getgid, setgid, setpgid};

        if ptrace::traceme().is_err() {
            exit_child(CHILD_TRACEME_FAILED);
        }

        // 端末からのシグナルが親に届かないよう別プロセスグループにする
        let _ = setpgid(Pid::from_raw(0), Pid::from_raw(0));

        let redirect = |path: &Option<CString>, fd: i32, flags: OFlag, code: i32| {
            if let Some(path) = path {
                let opened = open(path.as_c_str(), flags, Mode::from_bits_truncate(0o644));
                match opened {
                    Ok(new_fd) if dup2(new_fd, fd).is_ok() => {}
                    _ => exit_child(code),
                }
            }
        };
        redirect(&self.stdin, libc::STDIN_FILENO, OFlag::O_RDONLY, CHILD_DUP_STDIN_FAILED);
        redirect(
            &self.stdout,
            libc::STDOUT_FILENO,
            OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_TRUNC,
            CHILD_DUP_STDOUT_FAILED,
        );
        redirect(
            &self.stderr,
            libc::STDERR_FILENO,
            OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_TRUNC,
            CHILD_DUP_STDERR_FAILED,
        );

        if let Some(dir) = &self.working_dir {
            if chdir(dir.as_c_str()).is_err() {
                exit_child(CHILD_CHDIR_FAILED);
            }
        }

        if self.disable_aslr {
            use nix::sys::personality::{self, Persona};
            // 失敗しても起動は続ける
            if let Ok(current) = personality::get() {
                let _ = personality::set(current | Persona::ADDR_NO_RANDOMIZE);
            }
        }

        // setgid 実行ファイルの権限を引き継がない
        if setgid(getgid()).is_err() {
            exit_child(CHILD_SETGID_FAILED);
        }

        let _ = execve(&self.program, &self.argv, &self.envp);
        exit_child(CHILD_EXEC_FAILED)
    }
}

fn exit_child(code: i32) -> ! {
    unsafe { libc::_exit(code) }
}

/// /proc/pid/task 以下のスレッドIDを列挙する
fn task_ids(pid: ThreadId) -> std::io::Result<Vec<ThreadId>> {
    let mut tids: Vec<ThreadId> = std::fs::read_dir(format!("/proc/{}/task", pid))?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().to_str().and_then(|name| name.parse().ok()))
        .collect();
    tids.sort_unstable();
    Ok(tids)
}

/// ptrace(2) を直接呼び出すバックエンド
///
/// 1つのデバッグ対象だけを扱い、waitpid はその対象のプロセスグループに限定します。
#[derive(Debug)]
pub struct LinuxTracer {
    own_pid: i32,
    /// デバッグ対象の pid（未起動なら 0）
    debuggee: AtomicI32,
    /// waitpid で待つプロセスグループ（未起動なら 0）
    group: AtomicI32,
}

impl LinuxTracer {
    pub fn new() -> Self {
        Self {
            own_pid: nix::unistd::getpid().as_raw(),
            debuggee: AtomicI32::new(0),
            group: AtomicI32::new(0),
        }
    }

    /// デバッグ対象とそのプロセスグループを記録する
    fn track(&self, target: ThreadId) -> Result<(), TraceError> {
        let group = getpgid(Some(pid(target))).map_err(|errno| TraceError::new("getpgid", errno))?;
        if group.as_raw() == nix::unistd::getpgrp().as_raw() {
            tracing::warn!(
                "pid {} shares our process group {}, unrelated children may be reaped",
                target,
                group
            );
        }
        self.debuggee.store(target, Ordering::Release);
        self.group.store(group.as_raw(), Ordering::Release);
        tracing::debug!("Waiting on process group {} of pid {}", group, target);
        Ok(())
    }

    /// デバッグ対象がプロセスグループを移っていれば追従する
    fn refresh_group(&self, stale: i32) -> bool {
        let target = self.debuggee.load(Ordering::Acquire);
        if target <= 0 {
            return false;
        }
        match getpgid(Some(pid(target))) {
            Ok(group) if group.as_raw() != stale => {
                tracing::debug!("pid {} moved to process group {}", target, group);
                self.group.store(group.as_raw(), Ordering::Release);
                true
            }
            _ => false,
        }
    }

    fn get_regset(
        &self,
        tid: ThreadId,
        note: usize,
        buf: *mut c_void,
        len: usize,
    ) -> Result<usize, TraceError> {
        let mut iov = libc::iovec {
            iov_base: buf,
            iov_len: len,
        };
        check("PTRACE_GETREGSET", unsafe {
            libc::ptrace(
                libc::PTRACE_GETREGSET,
                tid,
                note as *mut c_void,
                &mut iov as *mut libc::iovec as *mut c_void,
            )
        })?;
        Ok(iov.iov_len)
    }

    fn set_regset(
        &self,
        tid: ThreadId,
        note: usize,
        buf: *mut c_void,
        len: usize,
    ) -> Result<(), TraceError> {
        let mut iov = libc::iovec {
            iov_base: buf,
            iov_len: len,
        };
        check("PTRACE_SETREGSET", unsafe {
            libc::ptrace(
                libc::PTRACE_SETREGSET,
                tid,
                note as *mut c_void,
                &mut iov as *mut libc::iovec as *mut c_void,
            )
        })?;
        Ok(())
    }
}

impl Default for LinuxTracer {
    fn default() -> Self {
        Self::new()
    }
}

impl WordAccess for LinuxTracer {
    fn peek_word(&self, tid: ThreadId, addr: u64) -> Result<u64, TraceError> {
        ptrace::read(pid(tid), addr as ptrace::AddressType)
            .map(|word| word as u64)
            .map_err(|errno| TraceError::new("PTRACE_PEEKDATA", errno))
    }

    fn poke_word(&self, tid: ThreadId, addr: u64, word: u64) -> Result<(), TraceError> {
        check("PTRACE_POKEDATA", unsafe {
            libc::ptrace(libc::PTRACE_POKEDATA, tid, addr as *mut c_void, word as *mut c_void)
        })?;
        Ok(())
    }
}

impl TraceSyscalls for LinuxTracer {
    fn launch(&self, info: &LaunchInfo) -> Result<ThreadId, LaunchError> {
        use nix::sys::signal::Signal;
        use nix::unistd::{fork, ForkResult};

        if let Some(dir) = &info.working_dir {
            if !dir.is_dir() {
                return Err(LaunchError::MissingWorkingDirectory(dir.clone()));
            }
        }

        // fork 後にメモリ確保しないよう先に全て変換しておく
        let plan = ChildPlan::new(info)?;

        tracing::debug!("Launching '{}'", info.program.display());

        match unsafe { fork() }.map_err(LaunchError::Fork)? {
            ForkResult::Child => plan.exec(),
            ForkResult::Parent { child } => {
                let status =
                    waitpid(child, None).map_err(|errno| TraceError::new("waitpid", errno))?;
                match status {
                    WaitStatus::Stopped(_, Signal::SIGTRAP) => {
                        self.track(child.as_raw())?;
                        tracing::info!("Launched '{}' as pid {}", info.program.display(), child);
                        Ok(child.as_raw())
                    }
                    WaitStatus::Exited(_, code) => Err(child_exit_to_error(code)),
                    other => Err(LaunchError::UnexpectedStatus(format!("{:?}", other))),
                }
            }
        }
    }

    fn attach(&self, target: ThreadId) -> Result<Vec<ThreadId>, AttachError> {
        if target <= 1 {
            return Err(AttachError::NotAllowed(target));
        }

        let mut attached: Vec<ThreadId> = Vec::new();

        // 列挙中に生まれたスレッドも拾うため、新規がなくなるまで繰り返す
        loop {
            let tids = match task_ids(target) {
                Ok(tids) => tids,
                Err(e) if attached.is_empty() && e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(AttachError::NoSuchProcess(target));
                }
                Err(source) => return Err(AttachError::ThreadList { pid: target, source }),
            };

            let mut found_new = false;
            for tid in tids {
                if attached.contains(&tid) {
                    continue;
                }

                match ptrace::attach(pid(tid)) {
                    Ok(()) => {}
                    // 列挙後に終了したスレッド
                    Err(Errno::ESRCH) => continue,
                    Err(errno) => return Err(TraceError::new("PTRACE_ATTACH", errno).into()),
                }

                match waitpid(pid(tid), Some(WaitPidFlag::__WALL)) {
                    Ok(_) => {}
                    Err(Errno::ESRCH) | Err(Errno::ECHILD) => continue,
                    Err(errno) => return Err(TraceError::new("waitpid", errno).into()),
                }

                tracing::debug!("Attached to tid {}", tid);
                attached.push(tid);
                found_new = true;
            }

            if !found_new {
                break;
            }
        }

        if attached.is_empty() {
            return Err(AttachError::NoSuchProcess(target));
        }

        // メインスレッドを先頭にする
        if let Some(index) = attached.iter().position(|&tid| tid == target) {
            attached.swap(0, index);
        }
        self.track(target)?;

        tracing::info!("Attached to pid {} ({} threads)", target, attached.len());
        Ok(attached)
    }

    fn detach(&self, tid: ThreadId) -> Result<(), TraceError> {
        ptrace::detach(pid(tid), None).map_err(|errno| TraceError::new("PTRACE_DETACH", errno))
    }

    fn resume(&self, tid: ThreadId, signal: Option<i32>) -> Result<(), TraceError> {
        check("PTRACE_CONT", unsafe {
            libc::ptrace(libc::PTRACE_CONT, tid, ptr::null_mut::<c_void>(), signal_data(signal))
        })?;
        Ok(())
    }

    fn single_step(&self, tid: ThreadId, signal: Option<i32>) -> Result<(), TraceError> {
        check("PTRACE_SINGLESTEP", unsafe {
            libc::ptrace(
                libc::PTRACE_SINGLESTEP,
                tid,
                ptr::null_mut::<c_void>(),
                signal_data(signal),
            )
        })?;
        Ok(())
    }

    fn get_registers(&self, tid: ThreadId) -> Result<Registers, TraceError> {
        let mut regs = zeroed_registers();
        self.get_regset(
            tid,
            NT_PRSTATUS,
            &mut regs as *mut Registers as *mut c_void,
            std::mem::size_of::<Registers>(),
        )?;
        Ok(regs)
    }

    fn set_registers(&self, tid: ThreadId, regs: &Registers) -> Result<(), TraceError> {
        let mut copy = *regs;
        self.set_regset(
            tid,
            NT_PRSTATUS,
            &mut copy as *mut Registers as *mut c_void,
            std::mem::size_of::<Registers>(),
        )
    }

    fn get_extended_registers(&self, tid: ThreadId) -> Result<Vec<u8>, TraceError> {
        let mut buf = vec![0u8; EXTENDED_REGSET_CAPACITY];
        let len =
            self.get_regset(tid, NT_PRFPREG, buf.as_mut_ptr() as *mut c_void, buf.len())?;
        buf.truncate(len);
        Ok(buf)
    }

    fn set_extended_registers(&self, tid: ThreadId, data: &[u8]) -> Result<(), TraceError> {
        let mut buf = data.to_vec();
        self.set_regset(tid, NT_PRFPREG, buf.as_mut_ptr() as *mut c_void, buf.len())
    }

    fn get_signal_info(&self, tid: ThreadId) -> Result<SignalInfo, TraceError> {
        ptrace::getsiginfo(pid(tid))
            .map(|info| SignalInfo::from(&info))
            .map_err(|errno| TraceError::new("PTRACE_GETSIGINFO", errno))
    }

    fn get_event_message(&self, tid: ThreadId) -> Result<u64, TraceError> {
        ptrace::getevent(pid(tid))
            .map(|msg| msg as u64)
            .map_err(|errno| TraceError::new("PTRACE_GETEVENTMSG", errno))
    }

    fn set_options(&self, tid: ThreadId) -> Result<(), TraceError> {
        ptrace::setoptions(pid(tid), trace_options())
            .map_err(|errno| TraceError::new("PTRACE_SETOPTIONS", errno))
    }

    fn wait_for_event(&self) -> Result<WaitEvent, TraceError> {
        let mut status: libc::c_int = 0;
        let tid = loop {
            let group = self.group.load(Ordering::Acquire);
            if group <= 0 {
                return Ok(WaitEvent::NoChildren);
            }

            // デバッグ対象と同じプロセスグループのトレース対象だけを待つ
            let tid = unsafe { libc::waitpid(-group, &mut status, libc::__WALL) };
            if tid >= 0 {
                break tid;
            }
            match Errno::last() {
                Errno::ECHILD if self.refresh_group(group) => continue,
                Errno::ECHILD => return Ok(WaitEvent::NoChildren),
                errno => return Err(TraceError::new("waitpid", errno)),
            }
        };

        let event = if libc::WIFEXITED(status) {
            WaitEvent::Exited {
                tid,
                status: libc::WEXITSTATUS(status),
            }
        } else if libc::WIFSIGNALED(status) {
            WaitEvent::Signaled {
                tid,
                signal: libc::WTERMSIG(status),
            }
        } else if libc::WIFSTOPPED(status) {
            WaitEvent::Stopped {
                tid,
                signal: libc::WSTOPSIG(status),
            }
        } else {
            WaitEvent::Other { tid, status }
        };
        tracing::trace!("waitpid: {:?}", event);
        Ok(event)
    }

    fn kill_process(&self, pid: ThreadId, signal: i32) -> Result<(), TraceError> {
        Errno::result(unsafe { libc::kill(pid, signal) })
            .map(drop)
            .map_err(|errno| TraceError::new("kill", errno))
    }

    fn kill_thread(&self, pid: ThreadId, tid: ThreadId, signal: i32) -> Result<(), TraceError> {
        Errno::result(unsafe { libc::syscall(libc::SYS_tgkill, pid, tid, signal) })
            .map(drop)
            .map_err(|errno| TraceError::new("tgkill", errno))
    }

    fn memory_maps(&self, pid: ThreadId) -> Result<String, TraceError> {
        std::fs::read_to_string(format!("/proc/{}/maps", pid)).map_err(|e| {
            let errno = Errno::from_raw(e.raw_os_error().unwrap_or(libc::EIO));
            TraceError::new("read /proc/pid/maps", errno)
        })
    }

    fn own_pid(&self) -> i32 {
        self.own_pid
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_exit_codes() {
        assert!(matches!(child_exit_to_error(CHILD_EXEC_FAILED), LaunchError::ChildExec));
        assert!(matches!(child_exit_to_error(CHILD_CHDIR_FAILED), LaunchError::ChildChdir));
        assert!(matches!(child_exit_to_error(42), LaunchError::ChildExited(42)));
    }

    #[test]
    fn test_attach_rejects_init() {
        let tracer = LinuxTracer::new();
        assert!(matches!(tracer.attach(1), Err(AttachError::NotAllowed(1))));
        assert!(matches!(tracer.attach(0), Err(AttachError::NotAllowed(0))));
    }

    #[test]
    fn test_launch_missing_working_dir() {
        let tracer = LinuxTracer::new();
        let info = LaunchInfo::new("/bin/true").with_working_dir("/definitely/not/here");
        assert!(matches!(
            tracer.launch(&info),
            Err(LaunchError::MissingWorkingDirectory(_))
        ));
    }

    #[test]
    fn test_wait_without_debuggee_leaves_other_children_alone() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(100));

        let tracer = LinuxTracer::new();
        assert_eq!(tracer.wait_for_event().unwrap(), WaitEvent::NoChildren);
        assert!(child.wait().unwrap().success());
    }

    #[test]
    #[ignore]
    fn test_wait_is_scoped_to_debuggee_group() {
        let tracer = LinuxTracer::new();
        let debuggee = tracer.launch(&LaunchInfo::new("/bin/true")).unwrap();
        let mut other = std::process::Command::new("true").spawn().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(100));

        tracer.resume(debuggee, None).unwrap();
        loop {
            match tracer.wait_for_event().unwrap() {
                WaitEvent::Exited { tid, .. } if tid == debuggee => break,
                WaitEvent::Stopped { tid, .. } => {
                    assert_eq!(tid, debuggee);
                    tracer.resume(tid, None).unwrap();
                }
                WaitEvent::NoChildren => panic!("debuggee exit was not reported"),
                event => assert_ne!(event_tid(event), Some(other.id() as ThreadId)),
            }
        }

        assert!(other.wait().unwrap().success());
        assert_eq!(tracer.wait_for_event().unwrap(), WaitEvent::NoChildren);
    }

    fn event_tid(event: WaitEvent) -> Option<ThreadId> {
        match event {
            WaitEvent::Exited { tid, .. }
            | WaitEvent::Signaled { tid, .. }
            | WaitEvent::Stopped { tid, .. }
            | WaitEvent::Other { tid, .. } => Some(tid),
            WaitEvent::NoChildren => None,
        }
    }

    #[test]
    fn test_own_maps_parse() {
        let tracer = LinuxTracer::new();
        let maps = tracer.memory_maps(tracer.own_pid()).unwrap();
        let regions = crate::memory::parse_maps(&maps).unwrap();
        assert!(!regions.is_empty());
    }
}
