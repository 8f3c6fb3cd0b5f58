//! ブレークポイント管理

use crate::errors::ProcessError;
use crate::Result;
use kokia_target::{ArchitectureInfo, MemoryAccess, SoftwareBreakpoint};
use std::collections::BTreeMap;

/// ブレークポイントID
pub type BreakpointId = usize;

/// ブレークポイント
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Breakpoint {
    pub id: BreakpointId,
    pub address: u64,
}

/// ブレークポイントマネージャ
///
/// 論理的なブレークポイント情報と、メモリに書き込んだトラップ命令を
/// 一緒に管理します。
#[derive(Debug)]
pub struct BreakpointManager {
    breakpoints: BTreeMap<BreakpointId, (Breakpoint, SoftwareBreakpoint)>,
    next_id: BreakpointId,
}

impl BreakpointManager {
    /// 新しいブレークポイントマネージャを作成する
    pub fn new() -> Self {
        Self {
            breakpoints: BTreeMap::new(),
            next_id: 1,
        }
    }

    /// ブレークポイントを追加し、有効化する
    pub fn add_and_enable(
        &mut self,
        address: u64,
        memory: &dyn MemoryAccess,
        arch: &dyn ArchitectureInfo,
    ) -> Result<BreakpointId> {
        if self.find_by_address(address).is_some() {
            return Err(ProcessError::BreakpointExists(address));
        }

        let mut sw_bp = SoftwareBreakpoint::new(address);
        sw_bp.enable(memory, arch)?;

        let id = self.next_id;
        self.next_id += 1;
        self.breakpoints.insert(id, (Breakpoint { id, address }, sw_bp));
        Ok(id)
    }

    /// ブレークポイントを削除し、無効化する
    pub fn remove_and_disable(
        &mut self,
        id: BreakpointId,
        memory: &dyn MemoryAccess,
    ) -> Result<Breakpoint> {
        let (bp, mut sw_bp) = self
            .breakpoints
            .remove(&id)
            .ok_or(ProcessError::BreakpointNotFound(id))?;
        sw_bp.disable(memory)?;
        Ok(bp)
    }

    /// アドレスにブレークポイントが挿入されているか
    pub fn find_by_address(&self, address: u64) -> Option<&Breakpoint> {
        self.breakpoints
            .values()
            .find(|(bp, sw)| bp.address == address && sw.is_enabled())
            .map(|(bp, _)| bp)
    }

    /// 全てのブレークポイントを取得する（ID 順）
    pub fn all(&self) -> impl Iterator<Item = &Breakpoint> {
        self.breakpoints.values().map(|(bp, _)| bp)
    }

    /// exec でメモリが置き換わったため、書き戻さずに全て忘れる
    pub fn forget_all(&mut self) {
        self.breakpoints.clear();
    }
}

impl Default for BreakpointManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kokia_target::{TraceError, X86_64};
    use std::cell::RefCell;

    struct FlatMemory(RefCell<Vec<u8>>);

    impl MemoryAccess for FlatMemory {
        fn read_memory(&self, addr: u64, len: usize) -> std::result::Result<Vec<u8>, TraceError> {
            let start = addr as usize;
            Ok(self.0.borrow()[start..start + len].to_vec())
        }

        fn write_memory(&self, addr: u64, data: &[u8]) -> std::result::Result<(), TraceError> {
            let start = addr as usize;
            self.0.borrow_mut()[start..start + data.len()].copy_from_slice(data);
            Ok(())
        }
    }

    #[test]
    fn test_add_and_remove() {
        let memory = FlatMemory(RefCell::new(vec![0x90; 16]));
        let mut manager = BreakpointManager::new();

        let id = manager.add_and_enable(4, &memory, &X86_64).unwrap();
        assert_eq!(memory.0.borrow()[4], 0xCC);
        assert_eq!(manager.find_by_address(4).map(|bp| bp.id), Some(id));
        assert!(matches!(
            manager.add_and_enable(4, &memory, &X86_64),
            Err(ProcessError::BreakpointExists(4))
        ));

        manager.remove_and_disable(id, &memory).unwrap();
        assert_eq!(memory.0.borrow()[4], 0x90);
        assert_eq!(manager.all().count(), 0);
        assert!(matches!(
            manager.remove_and_disable(id, &memory),
            Err(ProcessError::BreakpointNotFound(_))
        ));
    }
}
