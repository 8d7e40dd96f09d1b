//! Phone number normalization used for blocking, conflict checks and merging.

use combiner_core::Phone;

/// Number of trailing digits two phones must share to be the same number.
pub const DEFAULT_SUFFIX_LEN: usize = 10;

/// Every ASCII digit of `raw`, in order.
pub fn digits(raw: &str) -> String {
    raw.chars().filter(char::is_ascii_digit).collect()
}

/// Digits plus a leading-`+` style marker; what the merge keeps to judge how
/// complete a number is.
pub fn dialable(raw: &str) -> String {
    raw.chars().filter(|c| c.is_ascii_digit() || *c == '+').collect()
}

/// Last `len` characters of an ASCII string (the whole string when shorter).
pub fn suffix(ascii: &str, len: usize) -> &str {
    &ascii[ascii.len().saturating_sub(len)..]
}

/// Comparison key of a phone: its last `len` digits. `None` when the number
/// holds no digits at all.
pub fn normalize(phone: &Phone, len: usize) -> Option<String> {
    let all = digits(&phone.number);
    if all.is_empty() {
        return None;
    }
    Some(suffix(&all, len).to_string())
}

/// `true` when any phone of `left` shares its normalized key with any phone of `right`.
pub fn share_number(left: &[Phone], right: &[Phone], len: usize) -> bool {
    left.iter()
        .filter_map(|phone| normalize(phone, len))
        .any(|key| right.iter().any(|other| normalize(other, len).as_deref() == Some(key.as_str())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_keeps_last_ten_digits() {
        assert_eq!(
            normalize(&Phone::new("+1 (555) 123-4567"), DEFAULT_SUFFIX_LEN).as_deref(),
            Some("5551234567")
        );
        assert_eq!(
            normalize(&Phone::new("5551234567"), DEFAULT_SUFFIX_LEN).as_deref(),
            Some("5551234567")
        );
        assert_eq!(normalize(&Phone::new("12-34"), DEFAULT_SUFFIX_LEN).as_deref(), Some("1234"));
        assert_eq!(normalize(&Phone::new("n/a"), DEFAULT_SUFFIX_LEN), None);
    }

    #[test]
    fn dialable_keeps_plus() {
        assert_eq!(dialable("+7 (900) 000-11-22"), "+79000001122");
    }

    #[test]
    fn share_number_ignores_formatting() {
        let left = vec![Phone::new("8 900 000 11 22"), Phone::new("")];
        let right = vec![Phone::new("+7 (900) 000-11-22")];
        assert!(share_number(&left, &right, DEFAULT_SUFFIX_LEN));
        assert!(!share_number(&left, &[Phone::new("+7 900 000 11 23")], DEFAULT_SUFFIX_LEN));
        assert!(!share_number(&[], &right, DEFAULT_SUFFIX_LEN));
    }
}
