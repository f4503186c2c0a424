use std::collections::BTreeSet;

pub const KB: u64 = 1 << 10;
pub const MB: u64 = 1 << 20;
pub const GB: u64 = 1 << 30;
pub const TB: u64 = 1 << 40;

/// Parse a file size expressed as a decimal integer with an optional
/// single-letter suffix: `K` (1024), `M` (1024^2) or `G` (1024^3).
/// The result must be strictly positive and no larger than 1 TiB.
pub fn parse_size(s: &str) -> Result<u64, String> {
    if s.is_empty() {
        return Err("empty size is not valid".to_string());
    }
    let (digits, factor) = match s.strip_suffix('K') {
        Some(rest) => (rest, KB),
        None => match s.strip_suffix('M') {
            Some(rest) => (rest, MB),
            None => match s.strip_suffix('G') {
                Some(rest) => (rest, GB),
                None => (s, 1),
            },
        },
    };
    let value: i64 = digits
        .parse()
        .map_err(|_| format!("invalid size value {:?}", s))?;
    let value = value.saturating_mul(factor as i64);
    if value <= 0 || value as u64 > TB {
        return Err(format!("invalid file size {}", value));
    }
    Ok(value as u64)
}

/// Split a comma-separated address list, removing duplicates.
/// The returned addresses are sorted; order is irrelevant to callers.
pub fn split_and_clean(s: &str) -> Vec<String> {
    s.split(',')
        .map(|c| c.to_string())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}
