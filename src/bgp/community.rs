use crate::error::Error;

/// Parse a standard community from "high:low" text form into its
/// wire value `(high << 16) | low`. Both halves must fit in 16 bits.
pub fn parse_community(value: &str) -> Result<u32, Error> {
    let (high, low) = value
        .split_once(':')
        .ok_or_else(|| Error::config(format!("invalid community '{}', must be asn:value", value)))?;
    let high: u32 = high
        .parse()
        .map_err(|_| Error::config(format!("invalid community '{}'", value)))?;
    let low: u32 = low
        .parse()
        .map_err(|_| Error::config(format!("invalid community '{}'", value)))?;
    if high > u32::from(u16::MAX) || low > u32::from(u16::MAX) {
        return Err(Error::config(format!(
            "community '{}' out of range, both halves must be 0-65535",
            value
        )));
    }
    Ok((high << 16) | low)
}

/// Render a community wire value back to "high:low"
pub fn format_community(value: u32) -> String {
    format!("{}:{}", value >> 16, value & 0xffff)
}
