//! デバッガコマンド

use crate::breakpoint::BreakpointId;
use crate::parse::{parse_address, parse_hex_bytes, parse_number, parse_signal, ParseError};
use kokia_target::ThreadId;
use thiserror::Error;

/// メモリ表示の既定バイト数
pub const DEFAULT_EXAMINE_LEN: usize = 64;

/// デバッガコマンド
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// 実行継続（シグナルを配送することもできる）
    Continue(Option<i32>),
    /// ステップ実行（他のスレッドは停止したまま）
    Step(Option<ThreadId>),
    /// SIGSTOP を送る
    Halt,
    /// 実行中のスレッドを全て止める
    Interrupt,
    /// スレッド一覧表示
    Threads,
    /// レジスタ表示
    Registers(Option<ThreadId>),
    /// メモリ表示
    Examine { address: u64, len: usize },
    /// メモリ書き込み
    Write { address: u64, bytes: Vec<u8> },
    /// ブレークポイントを設定
    Break(u64),
    /// ブレークポイントを削除
    Delete(BreakpointId),
    /// ブレークポイント一覧
    InfoBreakpoints,
    /// メモリ領域の表示
    Region(u64),
    /// 強制終了
    Kill,
    /// デタッチ
    Detach,
    /// ヘルプ表示
    Help,
    /// 終了
    Quit,
}

/// コマンドのパースエラー
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("Empty command")]
    Empty,
    #[error("Unknown command '{0}'")]
    Unknown(String),
    #[error("Usage: {0}")]
    Usage(&'static str),
    #[error(transparent)]
    Argument(#[from] ParseError),
}

impl Command {
    /// コマンド文字列をパースする
    pub fn parse(input: &str) -> Result<Self, CommandError> {
        let parts: Vec<&str> = input.split_whitespace().collect();
        let Some((&name, args)) = parts.split_first() else {
            return Err(CommandError::Empty);
        };

        let command = match name {
            "continue" | "c" => {
                Command::Continue(args.first().map(|s| parse_signal(s)).transpose()?)
            }
            "step" | "s" => Command::Step(args.first().map(|s| parse_number(s)).transpose()?),
            "halt" => Command::Halt,
            "interrupt" | "int" => Command::Interrupt,
            "threads" | "t" => Command::Threads,
            "regs" | "registers" => {
                Command::Registers(args.first().map(|s| parse_number(s)).transpose()?)
            }
            "x" => {
                let address = args.first().ok_or(CommandError::Usage("x <addr> [len]"))?;
                let len = match args.get(1) {
                    Some(len) => parse_number(len)?,
                    None => DEFAULT_EXAMINE_LEN,
                };
                Command::Examine {
                    address: parse_address(address)?,
                    len,
                }
            }
            "write" | "w" => {
                let (address, bytes) = args
                    .split_first()
                    .filter(|(_, rest)| !rest.is_empty())
                    .ok_or(CommandError::Usage("write <addr> <hex bytes>"))?;
                Command::Write {
                    address: parse_address(address)?,
                    bytes: parse_hex_bytes(&bytes.join(""))?,
                }
            }
            "break" | "b" => {
                let address = args.first().ok_or(CommandError::Usage("break <addr>"))?;
                Command::Break(parse_address(address)?)
            }
            "delete" | "d" => {
                let id = args.first().ok_or(CommandError::Usage("delete <id>"))?;
                Command::Delete(parse_number(id)?)
            }
            "info" => match args.first() {
                Some(&"breakpoints") | Some(&"b") => Command::InfoBreakpoints,
                _ => return Err(CommandError::Usage("info breakpoints")),
            },
            "region" => {
                let address = args.first().ok_or(CommandError::Usage("region <addr>"))?;
                Command::Region(parse_address(address)?)
            }
            "kill" | "k" => Command::Kill,
            "detach" => Command::Detach,
            "help" | "h" | "?" => Command::Help,
            "quit" | "q" | "exit" => Command::Quit,
            other => return Err(CommandError::Unknown(other.to_string())),
        };
        Ok(command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!(Command::parse("continue"), Ok(Command::Continue(None)));
        assert_eq!(Command::parse("c SIGUSR1"), Ok(Command::Continue(Some(10))));
        assert_eq!(Command::parse("step 1234"), Ok(Command::Step(Some(1234))));
        assert_eq!(Command::parse("info breakpoints"), Ok(Command::InfoBreakpoints));
        assert_eq!(Command::parse("quit"), Ok(Command::Quit));
    }

    #[test]
    fn test_parse_memory_commands() {
        assert_eq!(
            Command::parse("x 0x1000"),
            Ok(Command::Examine {
                address: 0x1000,
                len: DEFAULT_EXAMINE_LEN
            })
        );
        assert_eq!(
            Command::parse("write 0x1000 90 cc"),
            Ok(Command::Write {
                address: 0x1000,
                bytes: vec![0x90, 0xcc]
            })
        );
        assert_eq!(
            Command::parse("write 0x1000"),
            Err(CommandError::Usage("write <addr> <hex bytes>"))
        );
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(Command::parse("   "), Err(CommandError::Empty));
        assert_eq!(
            Command::parse("frobnicate"),
            Err(CommandError::Unknown("frobnicate".to_string()))
        );
        assert!(matches!(Command::parse("break nowhere"), Err(CommandError::Argument(_))));
    }
}
