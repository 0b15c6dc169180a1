use chrono::Utc;

/// Current time in microseconds since the Unix epoch, as stored in record
/// timestamps.
pub fn now_micros() -> u64 {
    Utc::now().timestamp_micros().max(0) as u64
}

/// Validates a database/table/column/user name: ASCII letter or underscore
/// first, then letters, digits and underscores, at most 255 bytes.
pub fn is_valid_object_name(name: &str) -> bool {
    if name.is_empty() || name.len() > 255 {
        return false;
    }
    let mut chars = name.chars();
    let first = chars.next().unwrap();
    if !(first.is_ascii_alphabetic() || first == '_') {
        return false;
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_names() {
        assert!(is_valid_object_name("CUSTOMERS"));
        assert!(is_valid_object_name("_private1"));
        assert!(!is_valid_object_name(""));
        assert!(!is_valid_object_name("1abc"));
        assert!(!is_valid_object_name("a-b"));
        assert!(!is_valid_object_name(&"x".repeat(256)));
    }
}
