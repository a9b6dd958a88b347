//! Remote-path parsing
//!
//! Transfer tools address storage as `remote:path`. Bans, catalogs and leases
//! are all keyed by the bare remote name, so every caller normalizes through
//! [`remote_name`].

/// Return everything before the first `:`, or the whole input when there is none.
///
/// `"gdrive:media/movies"` → `"gdrive"`, `"gdrive"` → `"gdrive"`,
/// `":local"` → `""`.
pub fn remote_name(remote_path: &str) -> &str {
    match remote_path.find(':') {
        Some(pos) => &remote_path[..pos],
        None => remote_path,
    }
}

/// First run of decimal digits in `name`, parsed as an integer.
///
/// Returns 0 when `name` has no digits or the run does not fit in a `u64`.
/// Used to order credential files such as `sa2.json` before `sa10.json`.
pub fn sequence_hint(name: &str) -> u64 {
    let digits: String = name
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_name_strips_path() {
        assert_eq!(remote_name("gdrive:media/movies"), "gdrive");
        assert_eq!(remote_name("gdrive:"), "gdrive");
    }

    #[test]
    fn remote_name_without_separator_is_unchanged() {
        assert_eq!(remote_name("gdrive"), "gdrive");
        assert_eq!(remote_name("/opt/sa/gdrive/sa1.json"), "/opt/sa/gdrive/sa1.json");
    }

    #[test]
    fn remote_name_stops_at_first_separator() {
        assert_eq!(remote_name("crypt:a:b"), "crypt");
        assert_eq!(remote_name(":local"), "");
    }

    #[test]
    fn sequence_hint_uses_first_digit_run() {
        assert_eq!(sequence_hint("sa10.json"), 10);
        assert_eq!(sequence_hint("sa2-backup3.json"), 2);
        assert_eq!(sequence_hint("project-0007.json"), 7);
    }

    #[test]
    fn sequence_hint_defaults_to_zero() {
        assert_eq!(sequence_hint("account.json"), 0);
        assert_eq!(sequence_hint(""), 0);
        assert_eq!(sequence_hint("sa99999999999999999999999.json"), 0);
    }
}
