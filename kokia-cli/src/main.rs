//! Kokia CLI - コマンドラインインターフェース
//!
//! トレース対象プロセスを操作する kokia のREPLインターフェース

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kokia_core::command::DEFAULT_EXAMINE_LEN;
use kokia_core::{
    Command, CommandError, ExitType, NativeProcess, ProcessDelegate, ProcessState, ResumeAction,
    ResumeActionList, StopReason, ThreadState,
};
use kokia_target::{LaunchInfo, Registers, ThreadId};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Kokia - Linux ptrace debugger
#[derive(Parser)]
#[command(name = "kokia")]
#[command(version = "0.1.0")]
#[command(about = "Multi-threaded process debugger built on ptrace", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: DebugCommand,
}

#[derive(Subcommand)]
enum DebugCommand {
    /// Launch and debug an executable
    Run {
        /// Path to the executable binary
        binary: PathBuf,

        /// Working directory of the program
        #[arg(long)]
        cwd: Option<PathBuf>,

        /// Extra environment variable for the program (KEY=VALUE, repeatable)
        #[arg(long = "env", value_parser = parse_env_pair)]
        env: Vec<(String, String)>,

        /// Read the program's stdin from a file
        #[arg(long)]
        stdin: Option<PathBuf>,

        /// Redirect the program's stdout to a file
        #[arg(long)]
        stdout: Option<PathBuf>,

        /// Redirect the program's stderr to a file
        #[arg(long)]
        stderr: Option<PathBuf>,

        /// Disable address space layout randomization
        #[arg(long)]
        no_aslr: bool,

        /// Arguments to pass to the program
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Attach to an existing process
    Attach {
        /// Process ID to attach to
        #[arg(short, long)]
        pid: i32,
    },
}

/// 状態変化をそのまま表示するデリゲート
struct PrintingDelegate;

impl ProcessDelegate for PrintingDelegate {
    fn on_process_state_changed(&self, state: ProcessState) {
        match state {
            ProcessState::Stopped => println!("\nProcess stopped (use 'threads' to inspect)"),
            ProcessState::Crashed => println!("\nProcess crashed (use 'threads' to inspect)"),
            ProcessState::Detached => println!("\nDetached from process"),
            ProcessState::Launching
            | ProcessState::Attaching
            | ProcessState::Running
            | ProcessState::Exited => tracing::debug!("Process state: {:?}", state),
        }
    }

    fn on_exit_status(&self, exit_type: ExitType, code: i32) {
        match exit_type {
            ExitType::Exited => println!("\nProcess exited with code {}", code),
            ExitType::SignaledKilled => println!("\nProcess killed by signal {}", code),
            ExitType::StoppedNotExited => {
                println!("\nProcess vanished while stopped by signal {}", code)
            }
        }
    }

    fn on_did_exec(&self) {
        println!("\nProcess exec'd a new image");
    }
}

/// REPL のセッション
struct Session {
    process: NativeProcess,
    launched: bool,
}

fn main() -> Result<()> {
    init_tracing();

    println!("Kokia - Linux ptrace debugger");
    println!("Version 0.1.0");
    println!();

    let cli = Cli::parse();
    let session = init_session(cli.command)?;
    run_repl(&session)?;

    Ok(())
}

/// KOKIA_LOG、なければ RUST_LOG でログレベルを決める
fn init_tracing() {
    let filter = EnvFilter::try_from_env("KOKIA_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// `KEY=VALUE` 形式の環境変数指定を解析する
fn parse_env_pair(s: &str) -> std::result::Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{}'", s)),
    }
}

/// プロセスを起動またはアタッチする
fn init_session(command: DebugCommand) -> Result<Session> {
    let delegate: Arc<dyn ProcessDelegate> = Arc::new(PrintingDelegate);

    match command {
        DebugCommand::Run {
            binary,
            cwd,
            env,
            stdin,
            stdout,
            stderr,
            no_aslr,
            args,
        } => {
            println!("Launching: {}", binary.display());

            let mut info = LaunchInfo::new(&binary)
                .with_args(args)
                .with_aslr_disabled(no_aslr);
            if let Some(dir) = cwd {
                info = info.with_working_dir(dir);
            }
            for (key, value) in env {
                info = info.with_env(key, value);
            }
            if let Some(path) = stdin {
                info = info.with_stdin(path);
            }
            if let Some(path) = stdout {
                info = info.with_stdout(path);
            }
            if let Some(path) = stderr {
                info = info.with_stderr(path);
            }

            let process = NativeProcess::launch(info, delegate)
                .with_context(|| format!("failed to launch {}", binary.display()))?;
            println!("Process {} launched and stopped at its first instruction", process.pid());
            println!("Set breakpoints and use 'continue' to continue execution");
            println!();
            Ok(Session {
                process,
                launched: true,
            })
        }
        DebugCommand::Attach { pid } => {
            println!("Attaching to process: {}", pid);

            let process = NativeProcess::attach(pid, delegate)
                .with_context(|| format!("failed to attach to {}", pid))?;
            println!("Attached to process {} ({} threads)", pid, process.threads().len());
            println!();
            Ok(Session {
                process,
                launched: false,
            })
        }
    }
}

fn history_path() -> Option<PathBuf> {
    home::home_dir().map(|home| home.join(".kokia_history"))
}

/// REPLループを実行する
fn run_repl(session: &Session) -> Result<()> {
    println!("Type 'help' for available commands, 'quit' to exit.");
    println!();

    let mut rl = DefaultEditor::new()?;
    let history = history_path();
    if let Some(path) = &history {
        if rl.load_history(path).is_err() {
            tracing::debug!("No history at {}", path.display());
        }
    }

    loop {
        let readline = rl.readline("(kokia) ");
        match readline {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                rl.add_history_entry(line)?;

                match Command::parse(line) {
                    Ok(Command::Quit) => break,
                    Ok(command) => {
                        if let Err(e) = handle_command(session, command) {
                            eprintln!("Error: {:#}", e);
                        }
                    }
                    Err(CommandError::Unknown(name)) => {
                        println!("Unknown command: {}", name);
                        println!("Type 'help' for available commands.");
                    }
                    Err(e) => eprintln!("Error: {}", e),
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("CTRL-C");
                break;
            }
            Err(ReadlineError::Eof) => {
                println!("CTRL-D");
                break;
            }
            Err(err) => {
                eprintln!("Error: {:?}", err);
                break;
            }
        }
    }

    if let Some(path) = &history {
        if let Err(e) = rl.save_history(path) {
            tracing::warn!("Failed to save history to {}: {}", path.display(), e);
        }
    }

    handle_quit(session);
    Ok(())
}

/// 起動したプロセスは終了させてから抜ける
fn handle_quit(session: &Session) {
    if session.launched && !session.process.state().is_terminal() {
        if let Err(e) = session.process.kill() {
            tracing::warn!("Failed to kill process {}: {}", session.process.pid(), e);
        }
    }
    println!("Goodbye!");
}

fn handle_command(session: &Session, command: Command) -> Result<()> {
    let process = &session.process;

    match command {
        Command::Help => print_help(),
        Command::Quit => {}
        Command::Continue(signal) => {
            let mut actions = ResumeActionList::run_all();
            if let (Some(signal), Some(tid)) = (signal, process.current_thread()) {
                actions.set(tid, ResumeAction::Run { signal: Some(signal) });
            }
            process.resume(&actions)?;
            println!("Continuing execution...");
        }
        Command::Step(tid) => {
            let tid = tid.or(process.current_thread()).unwrap_or(process.pid());
            let actions = ResumeActionList::new()
                .with_default(ResumeAction::Stop)
                .with(tid, ResumeAction::Step { signal: None });
            process.resume(&actions)?;
        }
        Command::Halt => process.halt()?,
        Command::Interrupt => process.interrupt()?,
        Command::Threads => {
            let current = process.current_thread();
            for thread in process.threads() {
                let marker = if Some(thread.tid) == current { "*" } else { " " };
                println!("{} {:>7}  {}", marker, thread.tid, describe_state(thread.state));
            }
        }
        Command::Registers(tid) => {
            let tid = tid.or(process.current_thread()).unwrap_or(process.pid());
            let regs = process.read_registers(tid)?;
            print_registers(tid, &regs);
        }
        Command::Examine { address, len } => {
            let bytes = process.read_memory(address, len)?;
            for line in format_hexdump(address, &bytes) {
                println!("{}", line);
            }
        }
        Command::Write { address, bytes } => {
            process.write_memory(address, &bytes)?;
            println!("Wrote {} bytes at 0x{:x}", bytes.len(), address);
        }
        Command::Break(address) => {
            let id = process.set_breakpoint(address)?;
            println!("Breakpoint {} set at 0x{:x}", id, address);
        }
        Command::Delete(id) => {
            process.remove_breakpoint(id)?;
            println!("Breakpoint {} deleted", id);
        }
        Command::InfoBreakpoints => {
            let breakpoints = process.breakpoints();
            if breakpoints.is_empty() {
                println!("No breakpoints");
            }
            for bp in breakpoints {
                println!("  {}: 0x{:x}", bp.id, bp.address);
            }
        }
        Command::Region(address) => {
            let region = process.memory_region_info(address)?;
            println!(
                "0x{:x}-0x{:x} {}{}{} ({} bytes)",
                region.start,
                region.end,
                if region.readable { 'r' } else { '-' },
                if region.writable { 'w' } else { '-' },
                if region.executable { 'x' } else { '-' },
                region.size(),
            );
        }
        Command::Kill => process.kill()?,
        Command::Detach => process.detach()?,
    }

    Ok(())
}

fn describe_state(state: ThreadState) -> String {
    match state {
        ThreadState::Launching => "launching".to_string(),
        ThreadState::Running => "running".to_string(),
        ThreadState::Stepping => "stepping".to_string(),
        ThreadState::Stopped(reason) => match reason {
            StopReason::Signal(signo) => format!("stopped (signal {})", signo),
            StopReason::Breakpoint => "stopped (breakpoint)".to_string(),
            StopReason::Watchpoint(index) => format!("stopped (watchpoint {})", index),
            StopReason::SingleStepTrace => "stopped (trace)".to_string(),
            StopReason::Exec => "stopped (exec)".to_string(),
            StopReason::None => "stopped".to_string(),
        },
    }
}

/// 16バイトごとの16進ダンプ
fn format_hexdump(address: u64, bytes: &[u8]) -> Vec<String> {
    bytes
        .chunks(16)
        .enumerate()
        .map(|(i, chunk)| {
            let hex: Vec<String> = chunk.iter().map(|b| format!("{:02x}", b)).collect();
            let ascii: String = chunk
                .iter()
                .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '.' })
                .collect();
            format!("0x{:016x}: {:<47}  {}", address + (i * 16) as u64, hex.join(" "), ascii)
        })
        .collect()
}

#[cfg(target_arch = "x86_64")]
fn print_registers(tid: ThreadId, regs: &Registers) {
    println!("Thread {}:", tid);
    let named = [
        ("rip", regs.rip),
        ("rsp", regs.rsp),
        ("rbp", regs.rbp),
        ("rax", regs.rax),
        ("rbx", regs.rbx),
        ("rcx", regs.rcx),
        ("rdx", regs.rdx),
        ("rsi", regs.rsi),
        ("rdi", regs.rdi),
        ("r8", regs.r8),
        ("r9", regs.r9),
        ("r10", regs.r10),
        ("r11", regs.r11),
        ("r12", regs.r12),
        ("r13", regs.r13),
        ("r14", regs.r14),
        ("r15", regs.r15),
        ("eflags", regs.eflags),
    ];
    for (name, value) in named {
        println!("  {:<6} 0x{:016x}", name, value);
    }
}

#[cfg(target_arch = "aarch64")]
fn print_registers(tid: ThreadId, regs: &Registers) {
    println!("Thread {}:", tid);
    println!("  {:<6} 0x{:016x}", "pc", regs.pc);
    println!("  {:<6} 0x{:016x}", "sp", regs.sp);
    for (i, value) in regs.regs.iter().enumerate() {
        println!("  {:<6} 0x{:016x}", format!("x{}", i), value);
    }
}

fn print_help() {
    println!("Available commands:");
    println!();
    println!("  help              - Show this help message");
    println!("  quit/exit/q       - Exit the debugger");
    println!();
    println!("Execution:");
    println!("  continue (c) [sig] - Resume all threads, optionally delivering a signal");
    println!("  step (s) [tid]     - Single-step one thread, others stay stopped");
    println!("  halt               - Send SIGSTOP to the process");
    println!("  interrupt          - Stop every running thread");
    println!("  kill               - Kill the process");
    println!("  detach             - Detach from the process");
    println!();
    println!("Inspection:");
    println!("  threads            - List threads (* marks the current thread)");
    println!("  regs [tid]         - Show general purpose registers");
    println!("  x <addr> [len]     - Dump memory ({} bytes by default)", DEFAULT_EXAMINE_LEN);
    println!("  write <addr> <hex> - Write bytes to memory");
    println!("  region <addr>      - Show the memory region containing an address");
    println!();
    println!("Breakpoints:");
    println!("  break <addr>       - Set a breakpoint");
    println!("  delete <id>        - Delete a breakpoint");
    println!("  info breakpoints   - List breakpoints");
    println!();
    println!("Examples:");
    println!("  break 0x401136");
    println!("  continue SIGUSR1");
    println!("  x 0x7ffe0000 32");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hexdump_layout() {
        let lines = format_hexdump(0x1000, b"Hello, kokia!\x00\x01\x02xyz");
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("0x0000000000001000: 48 65 6c 6c"));
        assert!(lines[0].ends_with("Hello, kokia!..."));
        assert!(lines[1].starts_with("0x0000000000001010: 78 79 7a"));
    }

    #[test]
    fn test_cli_parses_run_options() {
        let cli = Cli::try_parse_from([
            "kokia", "run", "--no-aslr", "--cwd", "/tmp", "--env", "MODE=fast", "--stdin",
            "/dev/null", "./demo", "fast", "3",
        ])
        .unwrap();
        match cli.command {
            DebugCommand::Run {
                binary,
                cwd,
                env,
                stdin,
                no_aslr,
                args,
                ..
            } => {
                assert_eq!(binary, PathBuf::from("./demo"));
                assert_eq!(cwd, Some(PathBuf::from("/tmp")));
                assert_eq!(env, vec![("MODE".to_string(), "fast".to_string())]);
                assert_eq!(stdin, Some(PathBuf::from("/dev/null")));
                assert!(no_aslr);
                assert_eq!(args, vec!["fast", "3"]);
            }
            DebugCommand::Attach { .. } => panic!("expected run"),
        }
    }

    #[test]
    fn test_env_pair_parsing() {
        assert_eq!(parse_env_pair("A=b=c"), Ok(("A".to_string(), "b=c".to_string())));
        assert!(parse_env_pair("=x").is_err());
        assert!(parse_env_pair("novalue").is_err());
    }

    #[test]
    fn test_describe_state() {
        assert_eq!(
            describe_state(ThreadState::Stopped(StopReason::Signal(11))),
            "stopped (signal 11)"
        );
        assert_eq!(describe_state(ThreadState::Running), "running");
    }
}
