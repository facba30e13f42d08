//! Option sub-protocol (RFC 2347) and the recognised option table.
//!
//! Options travel as NUL-terminated name/value string pairs after the mode of
//! a request, or after the opcode of an OACK. Names are matched without
//! regard to case; unrecognised names are dropped. A recognised name with a
//! value outside its legal range leaves the option inactive, so it is never
//! acknowledged.

use std::fmt;
use std::str;

use crate::{MAX_BLOCK_SIZE, MIN_BLOCK_SIZE};

/// Recognised options, in declaration order. Encoding and formatting follow
/// this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OptionKind {
    BlockSize,
    Timeout,
    TransferSize,
    WindowSize,
    ReadType,
}

impl OptionKind {
    pub const ALL: [OptionKind; 5] = [
        OptionKind::BlockSize,
        OptionKind::Timeout,
        OptionKind::TransferSize,
        OptionKind::WindowSize,
        OptionKind::ReadType,
    ];

    pub fn name(self) -> &'static str {
        match self {
            OptionKind::BlockSize => "blksize",
            OptionKind::Timeout => "timeout",
            OptionKind::TransferSize => "tsize",
            OptionKind::WindowSize => "windowsize",
            OptionKind::ReadType => "read-type",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.name().eq_ignore_ascii_case(name))
    }
}

/// Value of the `timeout` option: whole seconds, or the private `adaptive`
/// extension asking both sides to estimate the RTO from measured RTTs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutValue {
    Seconds(u8),
    Adaptive,
}

pub const ADAPTIVE: &str = "adaptive";
pub const READ_TYPE_DIRECTORY: &str = "directory";

/// A set of recognised options. `None` means inactive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OptionSet {
    pub block_size: Option<u16>,
    pub timeout: Option<TimeoutValue>,
    pub transfer_size: Option<u64>,
    pub window_size: Option<u16>,
    pub read_type: Option<String>,
}

impl OptionSet {
    pub fn is_empty(&self) -> bool {
        OptionKind::ALL.iter().all(|&kind| !self.is_active(kind))
    }

    pub fn is_active(&self, kind: OptionKind) -> bool {
        match kind {
            OptionKind::BlockSize => self.block_size.is_some(),
            OptionKind::Timeout => self.timeout.is_some(),
            OptionKind::TransferSize => self.transfer_size.is_some(),
            OptionKind::WindowSize => self.window_size.is_some(),
            OptionKind::ReadType => self.read_type.is_some(),
        }
    }

    /// Canonical wire form of an active option's value.
    pub fn value(&self, kind: OptionKind) -> Option<String> {
        match kind {
            OptionKind::BlockSize => self.block_size.map(|v| v.to_string()),
            OptionKind::Timeout => self.timeout.map(|v| match v {
                TimeoutValue::Seconds(s) => s.to_string(),
                TimeoutValue::Adaptive => ADAPTIVE.to_string(),
            }),
            OptionKind::TransferSize => self.transfer_size.map(|v| v.to_string()),
            OptionKind::WindowSize => self.window_size.map(|v| v.to_string()),
            OptionKind::ReadType => self.read_type.clone(),
        }
    }

    /// Activates `kind` from its wire value. Returns false, leaving the
    /// option inactive, when the value is out of range.
    pub fn set(&mut self, kind: OptionKind, value: &str) -> bool {
        match kind {
            OptionKind::BlockSize => {
                self.block_size = parse_decimal::<u16>(value)
                    .filter(|v| (MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(v));
            }
            OptionKind::Timeout => {
                self.timeout = if value.eq_ignore_ascii_case(ADAPTIVE) {
                    Some(TimeoutValue::Adaptive)
                } else {
                    parse_decimal::<u8>(value)
                        .filter(|&v| v >= 1)
                        .map(TimeoutValue::Seconds)
                };
            }
            OptionKind::TransferSize => self.transfer_size = parse_decimal::<u64>(value),
            OptionKind::WindowSize => {
                self.window_size = parse_decimal::<u16>(value).filter(|&v| v >= 1);
            }
            OptionKind::ReadType => {
                self.read_type = (!value.is_empty()).then(|| value.to_string());
            }
        }
        self.is_active(kind)
    }

    pub fn clear(&mut self, kind: OptionKind) {
        match kind {
            OptionKind::BlockSize => self.block_size = None,
            OptionKind::Timeout => self.timeout = None,
            OptionKind::TransferSize => self.transfer_size = None,
            OptionKind::WindowSize => self.window_size = None,
            OptionKind::ReadType => self.read_type = None,
        }
    }

    /// Active options with their wire values, in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = (OptionKind, String)> + '_ {
        OptionKind::ALL
            .into_iter()
            .filter_map(|kind| self.value(kind).map(|value| (kind, value)))
    }

    /// True when every option active in `self` is also active in `requested`.
    pub fn is_subset_of(&self, requested: &OptionSet) -> bool {
        OptionKind::ALL
            .iter()
            .all(|&kind| !self.is_active(kind) || requested.is_active(kind))
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.encoded_len());
        for (kind, value) in self.iter() {
            bytes.extend_from_slice(kind.name().as_bytes());
            bytes.push(0);
            bytes.extend_from_slice(value.as_bytes());
            bytes.push(0);
        }
        bytes
    }

    pub(crate) fn encoded_len(&self) -> usize {
        self.iter()
            .map(|(kind, value)| kind.name().len() + value.len() + 2)
            .sum()
    }
}

impl fmt::Display for OptionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, (kind, value)) in self.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}:{}", kind.name(), value)?;
        }
        f.write_str("]")
    }
}

/// Parses the option area of a request or OACK.
///
/// Anything after the last NUL is an unterminated fragment and is ignored,
/// as is a trailing name without a value.
pub fn parse_options(raw: &[u8]) -> OptionSet {
    let mut options = OptionSet::default();
    let mut fields: Vec<&[u8]> = raw.split(|&b| b == 0).collect();
    fields.pop();

    for pair in fields.chunks_exact(2) {
        let (Ok(name), Ok(value)) = (str::from_utf8(pair[0]), str::from_utf8(pair[1])) else {
            continue;
        };
        if let Some(kind) = OptionKind::from_name(name) {
            options.set(kind, value);
        }
    }
    options
}

/// Human-readable rendering used in logs, e.g. `[blksize:1024, timeout:5]`.
pub fn format_options(options: &OptionSet) -> String {
    options.to_string()
}

fn parse_decimal<T: str::FromStr>(value: &str) -> Option<T> {
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    value.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_set() -> OptionSet {
        OptionSet {
            block_size: Some(1428),
            timeout: Some(TimeoutValue::Adaptive),
            transfer_size: Some(u64::MAX),
            window_size: Some(65535),
            read_type: Some(READ_TYPE_DIRECTORY.to_string()),
        }
    }

    #[test]
    fn parse_inverts_encode() {
        let samples = [
            OptionSet::default(),
            full_set(),
            OptionSet {
                block_size: Some(8),
                timeout: Some(TimeoutValue::Seconds(255)),
                ..Default::default()
            },
            OptionSet {
                transfer_size: Some(0),
                window_size: Some(1),
                ..Default::default()
            },
        ];
        for options in samples {
            assert_eq!(parse_options(&options.encode()), options);
        }
    }

    #[test]
    fn names_match_case_insensitively() {
        let options = parse_options(b"BLKSIZE\x00512\x00WindowSize\x004\x00Timeout\x00ADAPTIVE\x00");
        assert_eq!(options.block_size, Some(512));
        assert_eq!(options.window_size, Some(4));
        assert_eq!(options.timeout, Some(TimeoutValue::Adaptive));
    }

    #[test]
    fn out_of_range_values_stay_inactive() {
        let options = parse_options(
            b"blksize\x007\x00timeout\x000\x00windowsize\x000\x00tsize\x00-1\x00read-type\x00\x00",
        );
        assert!(options.is_empty(), "{options}");

        let options = parse_options(b"blksize\x0065465\x00timeout\x00256\x00windowsize\x0065536\x00");
        assert!(options.is_empty(), "{options}");

        let options = parse_options(b"blksize\x00+512\x00timeout\x00 5\x00");
        assert!(options.is_empty(), "{options}");
    }

    #[test]
    fn ignores_unknown_and_dangling_fields() {
        let options = parse_options(b"multicast\x00\x00blksize\x001024\x00tsize");
        assert_eq!(
            options,
            OptionSet {
                block_size: Some(1024),
                ..Default::default()
            }
        );
        assert!(parse_options(b"").is_empty());
        assert!(parse_options(b"blksize\x00").is_empty());
    }

    #[test]
    fn formats_in_declaration_order() {
        let mut options = OptionSet::default();
        options.set(OptionKind::WindowSize, "4");
        options.set(OptionKind::BlockSize, "1024");
        options.set(OptionKind::Timeout, "5");
        assert_eq!(format_options(&options), "[blksize:1024, timeout:5, windowsize:4]");
        assert_eq!(format_options(&OptionSet::default()), "[]");
    }

    #[test]
    fn subset_detection() {
        let requested = OptionSet {
            block_size: Some(1024),
            timeout: Some(TimeoutValue::Seconds(5)),
            ..Default::default()
        };
        let answered = OptionSet {
            block_size: Some(1024),
            ..Default::default()
        };
        assert!(answered.is_subset_of(&requested));
        assert!(!full_set().is_subset_of(&requested));
        assert!(OptionSet::default().is_subset_of(&OptionSet::default()));
    }
}
