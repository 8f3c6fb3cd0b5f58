//! メモリアクセス機能
//!
//! PTRACE_PEEKDATA / PTRACE_POKEDATA によるワード単位の読み書きと、
//! /proc/pid/maps の解析を提供します。

use crate::error::TraceError;
use crate::thread::ThreadId;
use thiserror::Error;

/// peek/poke の転送単位
pub const WORD_SIZE: usize = std::mem::size_of::<u64>();

/// ワード単位の peek/poke プリミティブ
pub trait WordAccess {
    fn peek_word(&self, tid: ThreadId, addr: u64) -> Result<u64, TraceError>;
    fn poke_word(&self, tid: ThreadId, addr: u64, word: u64) -> Result<(), TraceError>;
}

/// プロセス単位のメモリ読み書き
///
/// ブレークポイントの挿入・解除はこのトレイト越しに行います。
pub trait MemoryAccess {
    fn read_memory(&self, addr: u64, len: usize) -> Result<Vec<u8>, TraceError>;
    fn write_memory(&self, addr: u64, data: &[u8]) -> Result<(), TraceError>;
}

/// ワード単位で読み取る
///
/// 末尾の端数ワードも1ワード丸ごと読み、必要なバイトだけを返します。
pub fn read_words<S: WordAccess + ?Sized>(
    sys: &S,
    tid: ThreadId,
    addr: u64,
    len: usize,
) -> Result<Vec<u8>, TraceError> {
    let mut data = Vec::with_capacity(len);

    for offset in (0..len).step_by(WORD_SIZE) {
        let word = sys.peek_word(tid, addr + offset as u64)?;
        let bytes = word.to_ne_bytes();
        let copy_size = (len - offset).min(WORD_SIZE);
        data.extend_from_slice(&bytes[..copy_size]);
    }

    tracing::trace!("read {} bytes at 0x{:x} (tid {})", len, addr, tid);
    Ok(data)
}

/// ワード単位で書き込む
///
/// 端数ワードは read-modify-write で周囲のバイトを保持します。
pub fn write_words<S: WordAccess + ?Sized>(
    sys: &S,
    tid: ThreadId,
    addr: u64,
    data: &[u8],
) -> Result<(), TraceError> {
    for offset in (0..data.len()).step_by(WORD_SIZE) {
        let word_addr = addr + offset as u64;
        let remaining = data.len() - offset;

        let word = if remaining >= WORD_SIZE {
            let mut bytes = [0u8; WORD_SIZE];
            bytes.copy_from_slice(&data[offset..offset + WORD_SIZE]);
            u64::from_ne_bytes(bytes)
        } else {
            let mut bytes = sys.peek_word(tid, word_addr)?.to_ne_bytes();
            bytes[..remaining].copy_from_slice(&data[offset..]);
            u64::from_ne_bytes(bytes)
        };

        sys.poke_word(tid, word_addr, word)?;
    }

    tracing::trace!("wrote {} bytes at 0x{:x} (tid {})", data.len(), addr, tid);
    Ok(())
}

/// メモリ領域の情報
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegionInfo {
    pub start: u64,
    pub end: u64,
    pub readable: bool,
    pub writable: bool,
    pub executable: bool,
}

impl MemoryRegionInfo {
    /// 権限なしの隙間領域
    pub fn gap(start: u64, end: u64) -> Self {
        Self {
            start,
            end,
            readable: false,
            writable: false,
            executable: false,
        }
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }

    pub fn size(&self) -> u64 {
        self.end - self.start
    }
}

/// /proc/pid/maps の解析エラー
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MapsParseError {
    #[error("malformed maps line: '{0}'")]
    Malformed(String),
    #[error("bad address in maps line: '{0}'")]
    BadAddress(String),
    #[error("bad permissions in maps line: '{0}'")]
    BadPermissions(String),
}

/// /proc/pid/maps の1行を解析する
///
/// フォーマット: "address perms offset dev inode pathname"
/// 例: "7f1234567000-7f1234568000 r-xp 00000000 08:01 123456 /lib/libc.so"
pub fn parse_maps_line(line: &str) -> Result<MemoryRegionInfo, MapsParseError> {
    let mut parts = line.split_whitespace();
    let range = parts
        .next()
        .ok_or_else(|| MapsParseError::Malformed(line.to_string()))?;
    let perms = parts
        .next()
        .ok_or_else(|| MapsParseError::Malformed(line.to_string()))?;

    let (start, end) = range
        .split_once('-')
        .ok_or_else(|| MapsParseError::Malformed(line.to_string()))?;
    let bad_address = || MapsParseError::BadAddress(line.to_string());
    let start = u64::from_str_radix(start, 16).map_err(|_| bad_address())?;
    let end = u64::from_str_radix(end, 16).map_err(|_| bad_address())?;

    let perms = perms.as_bytes();
    if perms.len() < 3 {
        return Err(MapsParseError::BadPermissions(line.to_string()));
    }
    let flag = |index: usize, set: u8| -> Result<bool, MapsParseError> {
        match perms[index] {
            b'-' => Ok(false),
            c if c == set => Ok(true),
            _ => Err(MapsParseError::BadPermissions(line.to_string())),
        }
    };

    Ok(MemoryRegionInfo {
        start,
        end,
        readable: flag(0, b'r')?,
        writable: flag(1, b'w')?,
        executable: flag(2, b'x')?,
    })
}

/// /proc/pid/maps の内容全体を解析する
pub fn parse_maps(contents: &str) -> Result<Vec<MemoryRegionInfo>, MapsParseError> {
    contents
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(parse_maps_line)
        .collect()
}

/// アドレスを含む領域を探す
///
/// 既知の領域の間にあるアドレスには、次の領域の先頭までの権限なし領域を合成します。
/// 最後の領域より後ろのアドレスは `None` です。
pub fn find_region(regions: &[MemoryRegionInfo], addr: u64) -> Option<MemoryRegionInfo> {
    for region in regions {
        if addr < region.start {
            return Some(MemoryRegionInfo::gap(addr, region.start));
        }
        if region.contains(addr) {
            return Some(*region);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;

    const MAPS: &str = "\
00400000-00452000 r-xp 00000000 08:02 173521      /usr/bin/dbus-daemon
00651000-00652000 r--p 00051000 08:02 173521      /usr/bin/dbus-daemon
00652000-00655000 rw-p 00052000 08:02 173521      /usr/bin/dbus-daemon
7ffc1a3ba000-7ffc1a3db000 rw-p 00000000 00:00 0   [stack]
";

    /// 8バイト境界に揃ったワードを HashMap で保持する偽メモリ
    struct FakeWords(RefCell<HashMap<u64, u64>>);

    impl WordAccess for FakeWords {
        fn peek_word(&self, _tid: ThreadId, addr: u64) -> Result<u64, TraceError> {
            self.0
                .borrow()
                .get(&addr)
                .copied()
                .ok_or(TraceError::new("PTRACE_PEEKDATA", nix::errno::Errno::EIO))
        }

        fn poke_word(&self, _tid: ThreadId, addr: u64, word: u64) -> Result<(), TraceError> {
            self.0.borrow_mut().insert(addr, word);
            Ok(())
        }
    }

    #[test]
    fn test_partial_tail_write_preserves_neighbours() {
        let mem = FakeWords(RefCell::new(HashMap::new()));
        mem.poke_word(1, 0x1000, u64::from_ne_bytes([0xAA; 8])).unwrap();
        mem.poke_word(1, 0x1008, u64::from_ne_bytes([0xBB; 8])).unwrap();

        write_words(&mem, 1, 0x1000, &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]).unwrap();

        let bytes = read_words(&mem, 1, 0x1000, 16).unwrap();
        assert_eq!(&bytes[..10], &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
        assert_eq!(&bytes[10..], &[0xBB; 6]);
    }

    #[test]
    fn test_read_truncates_to_length() {
        let mem = FakeWords(RefCell::new(HashMap::new()));
        mem.poke_word(1, 0x2000, u64::from_ne_bytes([1, 2, 3, 4, 5, 6, 7, 8])).unwrap();
        assert_eq!(read_words(&mem, 1, 0x2000, 3).unwrap(), vec![1, 2, 3]);
        assert!(read_words(&mem, 1, 0x3000, 1).is_err());
    }

    #[test]
    fn test_parse_maps_line() {
        let region =
            parse_maps_line("00400000-00452000 r-xp 00000000 08:02 173521 /usr/bin/x").unwrap();
        assert_eq!(region.start, 0x400000);
        assert_eq!(region.end, 0x452000);
        assert!(region.readable);
        assert!(!region.writable);
        assert!(region.executable);
    }

    #[test]
    fn test_parse_maps_rejects_garbage() {
        assert!(matches!(parse_maps_line("nonsense"), Err(MapsParseError::Malformed(_))));
        assert!(matches!(
            parse_maps_line("zz-00452000 r-xp 0 0 0"),
            Err(MapsParseError::BadAddress(_))
        ));
        assert!(matches!(
            parse_maps_line("00400000-00452000 q-xp 0 0 0"),
            Err(MapsParseError::BadPermissions(_))
        ));
    }

    #[test]
    fn test_find_region_and_gap() {
        let regions = parse_maps(MAPS).unwrap();
        assert_eq!(regions.len(), 4);

        let hit = find_region(&regions, 0x651800).unwrap();
        assert_eq!(hit.start, 0x651000);
        assert!(hit.readable && !hit.writable);

        // 0x452000..0x651000 は隙間
        let gap = find_region(&regions, 0x500000).unwrap();
        assert_eq!(gap, MemoryRegionInfo::gap(0x500000, 0x651000));

        let below = find_region(&regions, 0x1000).unwrap();
        assert_eq!(below.end, 0x400000);

        assert!(find_region(&regions, 0x7fff_0000_0000).is_none());
    }
}
