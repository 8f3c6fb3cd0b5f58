//! ブレークポイント機能

use crate::error::TraceError;
use crate::memory::MemoryAccess;
use std::sync::Arc;

/// アーキテクチャ固有のブレークポイント情報
pub trait ArchitectureInfo: Send + Sync {
    /// アーキテクチャ名
    fn name(&self) -> &'static str;

    /// ソフトウェアブレークポイントのトラップ命令
    fn breakpoint_trap_opcode(&self) -> &'static [u8];

    /// トラップ命令のバイト数
    fn breakpoint_size(&self) -> usize {
        self.breakpoint_trap_opcode().len()
    }

    /// トラップ後に PC がブレークポイントアドレスから進んでいるバイト数
    fn breakpoint_pc_offset(&self) -> usize {
        self.breakpoint_size()
    }
}

/// x86_64（INT3）
#[derive(Debug, Default, Clone, Copy)]
pub struct X86_64;

impl ArchitectureInfo for X86_64 {
    fn name(&self) -> &'static str {
        "x86_64"
    }

    fn breakpoint_trap_opcode(&self) -> &'static [u8] {
        &[0xCC]
    }
}

/// AArch64（BRK #0）
#[derive(Debug, Default, Clone, Copy)]
pub struct Aarch64;

impl ArchitectureInfo for Aarch64 {
    fn name(&self) -> &'static str {
        "aarch64"
    }

    fn breakpoint_trap_opcode(&self) -> &'static [u8] {
        &[0x00, 0x00, 0x20, 0xd4]
    }

    // BRK は PC を進めずにトラップする
    fn breakpoint_pc_offset(&self) -> usize {
        0
    }
}

/// ホストのアーキテクチャ情報
pub fn host_architecture() -> Arc<dyn ArchitectureInfo> {
    if cfg!(target_arch = "aarch64") {
        Arc::new(Aarch64)
    } else {
        Arc::new(X86_64)
    }
}

/// ソフトウェアブレークポイント
///
/// 挿入時に置き換えた元の命令バイトを保持します。
#[derive(Debug, Clone)]
pub struct SoftwareBreakpoint {
    address: u64,
    original_bytes: Vec<u8>,
    enabled: bool,
}

impl SoftwareBreakpoint {
    /// ブレークポイントを作成する
    pub fn new(address: u64) -> Self {
        Self {
            address,
            original_bytes: Vec::new(),
            enabled: false,
        }
    }

    /// ブレークポイントが有効かどうか
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// トラップ命令を書き込む
    pub fn enable(
        &mut self,
        memory: &dyn MemoryAccess,
        arch: &dyn ArchitectureInfo,
    ) -> Result<(), TraceError> {
        if self.enabled {
            return Ok(());
        }

        let opcode = arch.breakpoint_trap_opcode();
        self.original_bytes = memory.read_memory(self.address, opcode.len())?;
        memory.write_memory(self.address, opcode)?;

        tracing::debug!("Inserted {} breakpoint at 0x{:x}", arch.name(), self.address);
        self.enabled = true;
        Ok(())
    }

    /// 元の命令バイトを書き戻す
    pub fn disable(&mut self, memory: &dyn MemoryAccess) -> Result<(), TraceError> {
        if !self.enabled {
            return Ok(());
        }

        memory.write_memory(self.address, &self.original_bytes)?;

        tracing::debug!("Removed breakpoint at 0x{:x}", self.address);
        self.enabled = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    struct FlatMemory(RefCell<Vec<u8>>);

    impl MemoryAccess for FlatMemory {
        fn read_memory(&self, addr: u64, len: usize) -> Result<Vec<u8>, TraceError> {
            let start = addr as usize;
            Ok(self.0.borrow()[start..start + len].to_vec())
        }

        fn write_memory(&self, addr: u64, data: &[u8]) -> Result<(), TraceError> {
            let start = addr as usize;
            self.0.borrow_mut()[start..start + data.len()].copy_from_slice(data);
            Ok(())
        }
    }

    #[test]
    fn test_enable_disable_restores_bytes() {
        let memory = FlatMemory(RefCell::new(vec![0x55, 0x48, 0x89, 0xe5, 0x90, 0x90]));
        let mut bp = SoftwareBreakpoint::new(1);

        bp.enable(&memory, &X86_64).unwrap();
        assert!(bp.is_enabled());
        assert_eq!(memory.0.borrow()[1], 0xCC);
        assert_eq!(memory.0.borrow()[2], 0x89);

        bp.disable(&memory).unwrap();
        assert_eq!(memory.0.borrow()[1], 0x48);
    }

    #[test]
    fn test_aarch64_trap() {
        let memory = FlatMemory(RefCell::new(vec![0u8; 8]));
        let mut bp = SoftwareBreakpoint::new(4);
        bp.enable(&memory, &Aarch64).unwrap();
        assert_eq!(&memory.0.borrow()[4..8], &[0x00, 0x00, 0x20, 0xd4]);
        assert_eq!(Aarch64.breakpoint_pc_offset(), 0);
        assert_eq!(X86_64.breakpoint_pc_offset(), 1);
    }
}
