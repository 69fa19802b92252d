use std::net::IpAddr;

/// Normalize a client-supplied hostname: lowercase, any run of characters
/// outside `[a-z0-9]` or `.` collapsed into a single dash, trailing dashes
/// trimmed. Returns `None` when nothing label-like survives.
pub fn normalize_hostname(raw: &str) -> Option<String> {
    let mut out = String::with_capacity(raw.len());
    let mut pending_dash = false;
    for c in raw.to_lowercase().chars() {
        if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '.' {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.push(c);
        } else {
            pending_dash = true;
        }
    }
    let out = out.trim_end_matches('-').trim_matches('.').to_string();
    if out.split('.').any(|label| !label.is_empty()) {
        Some(out)
    } else {
        None
    }
}

/// Fallback hostname derived from the address: its text form with the
/// separator characters replaced by dashes.
pub fn generate_hostname(ip: IpAddr) -> String {
    ip.to_string().replace(['.', ':'], "-")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_lowercases() {
        assert_eq!(normalize_hostname("MyHost"), Some("myhost".to_string()));
    }

    #[test]
    fn test_normalize_collapses_runs() {
        assert_eq!(
            normalize_hostname("my host!!name"),
            Some("my-host-name".to_string())
        );
        assert_eq!(normalize_hostname("a__b"), Some("a-b".to_string()));
    }

    #[test]
    fn test_normalize_trims_trailing_dash() {
        assert_eq!(normalize_hostname("host--"), Some("host".to_string()));
        assert_eq!(normalize_hostname("host!"), Some("host".to_string()));
    }

    #[test]
    fn test_normalize_rejects_empty() {
        assert_eq!(normalize_hostname(""), None);
        assert_eq!(normalize_hostname("!!!"), None);
        assert_eq!(normalize_hostname("..."), None);
    }

    #[test]
    fn test_generate_hostname() {
        assert_eq!(
            generate_hostname("192.168.10.100".parse().unwrap()),
            "192-168-10-100"
        );
        assert_eq!(generate_hostname("2001::2".parse().unwrap()), "2001--2");
    }
}
