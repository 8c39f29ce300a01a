//! Size-string helpers for the YModem header packet.
//!
//! The header packet carries the file size as ASCII text. Senders in the
//! field produce plain decimal, `0x`-prefixed hex, and `k`/`m` suffixed
//! values (`k` scales by 1024, `m` by 1048576), so the parser accepts all
//! three.

/// Parse a size string: decimal, `0x` hex, optional trailing `k`/`K`/`m`/`M`.
///
/// Returns `None` for an empty or malformed string, or when the scaled value
/// overflows `u64`.
pub fn parse_size(s: &str) -> Option<u64> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }

    let (body, shift) = match s.as_bytes().last() {
        Some(b'k' | b'K') => (&s[..s.len() - 1], 10u32),
        Some(b'm' | b'M') => (&s[..s.len() - 1], 20u32),
        _ => (s, 0u32),
    };

    let value = if let Some(hex) = body.strip_prefix("0x").or_else(|| body.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()?
    } else {
        body.parse::<u64>().ok()?
    };

    value.checked_mul(1u64 << shift)
}

/// Parse a size field from raw packet bytes.
///
/// The field is terminated by a space or NUL; anything after the terminator
/// is ignored.
pub fn parse_size_bytes(bytes: &[u8]) -> Option<u64> {
    let end = bytes
        .iter()
        .position(|&b| b == b' ' || b == 0)
        .unwrap_or(bytes.len());
    let s = std::str::from_utf8(&bytes[..end]).ok()?;
    parse_size(s)
}

/// Render a size as the plain decimal string used in the header packet.
pub fn format_size(size: u64) -> String {
    size.to_string()
}
