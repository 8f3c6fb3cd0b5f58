//! パース関連のユーティリティ関数

use thiserror::Error;

/// コマンド引数のパースエラー
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("Invalid address '{0}'")]
    Address(String),
    #[error("Invalid number '{0}'")]
    Number(String),
    #[error("Invalid hex byte string '{0}'")]
    HexBytes(String),
    #[error("Unknown signal '{0}'")]
    Signal(String),
}

/// アドレス文字列をu64にパース
///
/// 16進数（0xプレフィックス付き）または10進数をサポート
///
/// # Examples
/// ```
/// use kokia_core::parse::parse_address;
///
/// assert_eq!(parse_address("0x1234").unwrap(), 0x1234);
/// assert_eq!(parse_address("1234").unwrap(), 1234);
/// ```
pub fn parse_address(s: &str) -> Result<u64, ParseError> {
    let s = s.trim();

    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        // 10進数でもダメなら16進数として解釈を試みる
        None => s.parse::<u64>().ok().or_else(|| u64::from_str_radix(s, 16).ok()),
    };
    parsed.ok_or_else(|| ParseError::Address(s.to_string()))
}

/// 10進数の数値をパース
pub fn parse_number<T: std::str::FromStr>(s: &str) -> Result<T, ParseError> {
    s.trim().parse::<T>().map_err(|_| ParseError::Number(s.to_string()))
}

/// "90cc" や "90 cc" のような16進バイト列をパース
pub fn parse_hex_bytes(s: &str) -> Result<Vec<u8>, ParseError> {
    let digits: String = s.chars().filter(|c| !c.is_whitespace()).collect();
    let digits = digits.strip_prefix("0x").unwrap_or(&digits);
    if digits.is_empty() || digits.len() % 2 != 0 {
        return Err(ParseError::HexBytes(s.to_string()));
    }

    (0..digits.len())
        .step_by(2)
        .map(|i| {
            digits
                .get(i..i + 2)
                .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                .ok_or_else(|| ParseError::HexBytes(s.to_string()))
        })
        .collect()
}

const SIGNAL_NAMES: &[(&str, i32)] = &[
    ("HUP", 1),
    ("INT", 2),
    ("QUIT", 3),
    ("ILL", 4),
    ("TRAP", 5),
    ("ABRT", 6),
    ("BUS", 7),
    ("FPE", 8),
    ("KILL", 9),
    ("USR1", 10),
    ("SEGV", 11),
    ("USR2", 12),
    ("PIPE", 13),
    ("ALRM", 14),
    ("TERM", 15),
    ("CHLD", 17),
    ("CONT", 18),
    ("STOP", 19),
    ("TSTP", 20),
];

/// シグナル名（SIGSEGV / SEGV）または番号をパース
pub fn parse_signal(s: &str) -> Result<i32, ParseError> {
    let s = s.trim();
    if let Ok(signo) = s.parse::<i32>() {
        if signo > 0 && signo < 65 {
            return Ok(signo);
        }
        return Err(ParseError::Signal(s.to_string()));
    }

    let upper = s.to_ascii_uppercase();
    let name = upper.strip_prefix("SIG").unwrap_or(&upper);
    SIGNAL_NAMES
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, signo)| *signo)
        .ok_or_else(|| ParseError::Signal(s.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_address_hex() {
        assert_eq!(parse_address("0x1234").unwrap(), 0x1234);
        assert_eq!(parse_address("0X1234").unwrap(), 0x1234);
        assert_eq!(parse_address("0xABCD").unwrap(), 0xabcd);
        assert_eq!(parse_address("7ffe").unwrap(), 0x7ffe);
    }

    #[test]
    fn test_parse_address_invalid() {
        assert!(parse_address("xyz").is_err());
        assert!(parse_address("0xghij").is_err());
    }

    #[test]
    fn test_parse_hex_bytes() {
        assert_eq!(parse_hex_bytes("90cc").unwrap(), vec![0x90, 0xcc]);
        assert_eq!(parse_hex_bytes("90 CC 01").unwrap(), vec![0x90, 0xcc, 0x01]);
        assert!(parse_hex_bytes("9").is_err());
        assert!(parse_hex_bytes("zz").is_err());
        assert!(parse_hex_bytes("").is_err());
    }

    #[test]
    fn test_parse_signal() {
        assert_eq!(parse_signal("SIGSEGV").unwrap(), 11);
        assert_eq!(parse_signal("usr1").unwrap(), 10);
        assert_eq!(parse_signal("2").unwrap(), 2);
        assert!(parse_signal("0").is_err());
        assert!(parse_signal("SIGNOPE").is_err());
    }
}
