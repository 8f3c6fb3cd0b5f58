//! レジスタアクセス機能

use crate::error::TraceError;
use crate::thread::ThreadId;
use nix::libc;

/// 汎用レジスタ一式
pub type Registers = libc::user_regs_struct;

/// ゼロ初期化したレジスタ一式を作成する
pub fn zeroed_registers() -> Registers {
    // user_regs_struct は整数フィールドのみの POD
    unsafe { std::mem::zeroed() }
}

/// プログラムカウンタを取得する
#[cfg(target_arch = "x86_64")]
pub fn program_counter(regs: &Registers) -> u64 {
    regs.rip
}

/// プログラムカウンタを設定する
#[cfg(target_arch = "x86_64")]
pub fn set_program_counter(regs: &mut Registers, pc: u64) {
    regs.rip = pc;
}

#[cfg(target_arch = "aarch64")]
pub fn program_counter(regs: &Registers) -> u64 {
    regs.pc
}

#[cfg(target_arch = "aarch64")]
pub fn set_program_counter(regs: &mut Registers, pc: u64) {
    regs.pc = pc;
}

/// スレッドごとのレジスタコンテキスト
///
/// レジスタ配置の詳細はアーキテクチャ固有の実装に任せ、
/// ここではウォッチポイントのヒット判定だけを要求します。
pub trait RegisterContext: Send + Sync {
    /// ヒットしたウォッチポイントのインデックス
    fn watchpoint_hit_index(&self, tid: ThreadId) -> Result<Option<u32>, TraceError>;
}

/// ウォッチポイントを持たないコンテキスト
#[derive(Debug, Default, Clone, Copy)]
pub struct NoWatchpoints;

impl RegisterContext for NoWatchpoints {
    fn watchpoint_hit_index(&self, _tid: ThreadId) -> Result<Option<u32>, TraceError> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_program_counter_roundtrip() {
        let mut regs = zeroed_registers();
        set_program_counter(&mut regs, 0x401000);
        assert_eq!(program_counter(&regs), 0x401000);
    }

    #[test]
    fn test_no_watchpoints() {
        assert_eq!(NoWatchpoints.watchpoint_hit_index(1).unwrap(), None);
    }
}
