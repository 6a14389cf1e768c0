use anyhow::{anyhow, Context as _, Result};
use std::error::Error;
use uuid::Uuid;

pub fn parse_uuid<S: AsRef<str>>(value: S) -> Result<Uuid> {
    Uuid::parse_str(value.as_ref())
        .map_err(|e| e.source().map(|e| anyhow!(e.to_string())).unwrap_or_else(|| anyhow!(e.to_string())))
        .context(format!("'{}' is not a valid GUID", value.as_ref()))
}

/// Split one `key<separator>value` line, trimming both sides.
pub fn parse_key_value_line(line: &str, separator: &str) -> Result<(String, String)> {
    let parts: Vec<&str> = line.splitn(2, separator).collect();
    match parts.len() {
        2 => Ok((parts[0].trim().to_string(), parts[1].trim().to_string())),
        _ => Err(anyhow!("invalid key/value line: {:?}", line)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_uuid() {
        assert_eq!(
            parse_uuid("8a7ae0b5-b28c-b240-8c07-0015431d58d8").unwrap(),
            Uuid::parse_str("8a7ae0b5-b28c-b240-8c07-0015431d58d8").unwrap()
        );
    }

    #[test]
    fn rejects_invalid_uuid() {
        assert!(parse_uuid("not-a-uuid").is_err());
    }

    #[test]
    fn parses_key_value_line() {
        assert_eq!(parse_key_value_line("ro=true", "=").unwrap(), ("ro".to_string(), "true".to_string()));
        assert_eq!(parse_key_value_line(" ro = false ", "=").unwrap(), ("ro".to_string(), "false".to_string()));
        assert!(parse_key_value_line("no-separator-here", "=").is_err());
    }
}
