//! Option negotiation (RFC 2347) for blksize (RFC 2348), timeout and
//! tsize (RFC 2349) and windowsize (RFC 7440).

use bytes::{BufMut, Bytes, BytesMut};

use crate::packet::{MAX_BLOCK_SIZE, MIN_BLOCK_SIZE, Opcode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OptionKind {
    Blksize,
    Timeout,
    Tsize,
    Windowsize,
}

impl OptionKind {
    /// Also the order options are rendered and put into an OACK.
    pub const ALL: [OptionKind; 4] = [
        OptionKind::Blksize,
        OptionKind::Timeout,
        OptionKind::Tsize,
        OptionKind::Windowsize,
    ];

    pub fn name(self) -> &'static str {
        match self {
            OptionKind::Blksize => "blksize",
            OptionKind::Timeout => "timeout",
            OptionKind::Tsize => "tsize",
            OptionKind::Windowsize => "windowsize",
        }
    }

    pub fn from_name(name: &[u8]) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| name.eq_ignore_ascii_case(kind.name().as_bytes()))
    }

    /// Canonical value for `raw`, or `None` when it is out of range.
    fn validate(self, raw: &str) -> Option<String> {
        let number = parse_unsigned(raw)?;
        let valid = match self {
            OptionKind::Blksize => {
                (u64::from(MIN_BLOCK_SIZE)..=u64::from(MAX_BLOCK_SIZE)).contains(&number)
            }
            OptionKind::Timeout => (1..=255).contains(&number),
            OptionKind::Tsize => true,
            OptionKind::Windowsize => (1..=65535).contains(&number),
        };
        valid.then(|| number.to_string())
    }

    fn index(self) -> usize {
        self as usize
    }
}

// strtoul semantics: leading blanks and a single '+' are accepted
fn parse_unsigned(raw: &str) -> Option<u64> {
    let trimmed = raw.trim_start();
    let digits = trimmed.strip_prefix('+').unwrap_or(trimmed);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TftpOption {
    pub is_active: bool,
    pub value: String,
}

/// The four recognised options, each either inactive or holding a
/// validated value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OptionSet {
    options: [TftpOption; 4],
}

impl OptionSet {
    pub fn get(&self, kind: OptionKind) -> Option<&str> {
        let option = &self.options[kind.index()];
        option.is_active.then_some(option.value.as_str())
    }

    pub fn set(&mut self, kind: OptionKind, value: impl Into<String>) {
        self.options[kind.index()] = TftpOption {
            is_active: true,
            value: value.into(),
        };
    }

    pub fn clear(&mut self, kind: OptionKind) {
        self.options[kind.index()] = TftpOption::default();
    }

    pub fn is_empty(&self) -> bool {
        self.options.iter().all(|option| !option.is_active)
    }

    pub fn iter(&self) -> impl Iterator<Item = (OptionKind, &str)> {
        OptionKind::ALL
            .into_iter()
            .filter_map(|kind| self.get(kind).map(|value| (kind, value)))
    }

    fn number(&self, kind: OptionKind) -> Option<u64> {
        self.get(kind).and_then(|value| value.parse().ok())
    }

    pub fn blksize(&self) -> Option<u16> {
        self.number(OptionKind::Blksize)
            .and_then(|n| u16::try_from(n).ok())
    }

    /// Seconds; `None` also when the timeout is "adaptive".
    pub fn timeout(&self) -> Option<u8> {
        self.number(OptionKind::Timeout)
            .and_then(|n| u8::try_from(n).ok())
    }

    pub fn tsize(&self) -> Option<u64> {
        self.number(OptionKind::Tsize)
    }

    pub fn windowsize(&self) -> Option<u16> {
        self.number(OptionKind::Windowsize)
            .and_then(|n| u16::try_from(n).ok())
    }

    /// `name\0value\0` pairs for every active option.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for (kind, value) in self.iter() {
            out.extend_from_slice(kind.name().as_bytes());
            out.push(0);
            out.extend_from_slice(value.as_bytes());
            out.push(0);
        }
        out
    }
}

/// Iterate the `name\0value\0` pairs of a raw option tail. A trailing name
/// without a terminated value ends the walk.
pub fn raw_pairs(raw: &[u8]) -> impl Iterator<Item = (&[u8], &[u8])> {
    let mut rest = raw;
    std::iter::from_fn(move || {
        let name_end = rest.iter().position(|&b| b == 0)?;
        let after_name = &rest[name_end + 1..];
        let value_end = after_name.iter().position(|&b| b == 0)?;
        let pair = (&rest[..name_end], &after_name[..value_end]);
        rest = &after_name[value_end + 1..];
        Some(pair)
    })
}

/// Value of the last raw option named `name` (case-insensitive).
pub fn find_raw_option<'a>(raw: &'a [u8], name: &str) -> Option<&'a [u8]> {
    raw_pairs(raw)
        .filter(|(key, _)| key.eq_ignore_ascii_case(name.as_bytes()))
        .map(|(_, value)| value)
        .last()
}

/// Parse the option tail of a request. Unknown names are ignored, invalid
/// values leave the option inactive and a later duplicate replaces an
/// earlier one.
pub fn parse_options(raw: &[u8]) -> OptionSet {
    let mut options = OptionSet::default();
    for (name, value) in raw_pairs(raw) {
        let Some(kind) = OptionKind::from_name(name) else {
            continue;
        };
        match std::str::from_utf8(value)
            .ok()
            .and_then(|value| kind.validate(value))
        {
            Some(value) => options.set(kind, value),
            None => options.clear(kind),
        }
    }
    options
}

/// `[blksize:1024, windowsize:4]`, `[]` when nothing is active.
pub fn format_options(options: &OptionSet) -> String {
    let rendered: Vec<String> = options
        .iter()
        .map(|(kind, value)| format!("{}:{}", kind.name(), value))
        .collect();
    format!("[{}]", rendered.join(", "))
}

/// Raw request options as `name:value, name:value`, unknown names included.
pub fn format_option_strings(raw: &[u8]) -> String {
    raw_pairs(raw)
        .map(|(name, value)| {
            format!(
                "{}:{}",
                String::from_utf8_lossy(name),
                String::from_utf8_lossy(value)
            )
        })
        .collect::<Vec<_>>()
        .join(", ")
}

// RFC 2347: OACK packet format
// 2 bytes: opcode (06)
// (option name\0 value\0)*
pub fn encode_oack(options: &OptionSet) -> Bytes {
    let body = options.encode();
    let mut packet = BytesMut::with_capacity(2 + body.len());
    packet.put_u16(Opcode::Oack as u16);
    packet.put_slice(&body);
    packet.freeze()
}
