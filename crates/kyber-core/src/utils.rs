//! Utility helpers — path resolution, date formatting, string manipulation.
//!
//! Replaces nanobot's `utils/helpers.py`.

use std::path::PathBuf;

/// Get the Kyber data directory (e.g. `~/.kyber/`).
pub fn get_data_path() -> PathBuf {
    let home = dirs_next().unwrap_or_else(|| PathBuf::from("."));
    home.join(".kyber")
}

/// Get the sessions directory (e.g. `~/.kyber/sessions/`).
pub fn get_sessions_path() -> PathBuf {
    get_data_path().join("sessions")
}

/// Get the default workspace path (e.g. `~/.kyber/workspace/`).
pub fn get_default_workspace_path() -> PathBuf {
    get_data_path().join("workspace")
}

/// Get today's date as YYYY-MM-DD.
pub fn today_date() -> String {
    chrono::Local::now().format("%Y-%m-%d").to_string()
}

/// Get current ISO 8601 timestamp.
pub fn timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Truncate a string to `max_len` characters, adding "..." if truncated.
/// Unicode-safe.
pub fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", truncated)
    }
}

/// Sanitize a string for use as a filename.
pub fn safe_filename(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Expand `~` to the home directory in a path string.
pub fn expand_home(path: &str) -> PathBuf {
    if path.starts_with("~/") || path == "~" {
        let home = dirs_next().unwrap_or_else(|| PathBuf::from("."));
        home.join(&path[2..])
    } else {
        PathBuf::from(path)
    }
}

/// Helper to get home directory.
fn dirs_next() -> Option<PathBuf> {
    std::env::var("HOME")
        .ok()
        .map(PathBuf::from)
        .or_else(|| std::env::var("USERPROFILE").ok().map(PathBuf::from))
}

/// Redact secret-shaped substrings from free text before it leaves the
/// process (HTTP API responses, status messages).
///
/// Two patterns are rewritten, matching spec §7:
/// - `key = value` / `key: value` pairs where `key` looks like a credential
///   name (`api_key`, `token`, `secret`, `password`, `bearer`, case-insensitive)
///   become `key=***`.
/// - Bare provider-style tokens (`sk-...`, `key-...`, `xai-...`, `gsk-...`,
///   `pk-...`, `rk-...` followed by 20+ alphanumeric/`_`/`-` chars) become `***`.
pub fn redact_secrets(text: &str) -> String {
    let after_pairs = redact_key_value_pairs(text);
    redact_bare_tokens(&after_pairs)
}

fn redact_key_value_pairs(text: &str) -> String {
    const KEYS: &[&str] = &["api_key", "token", "secret", "password", "bearer"];
    let mut out = String::with_capacity(text.len());
    let bytes = text.as_bytes();
    let lower = text.to_lowercase();
    let mut i = 0;
    while i < bytes.len() {
        let mut matched_key: Option<&str> = None;
        for key in KEYS {
            if lower[i..].starts_with(key) {
                matched_key = Some(key);
                break;
            }
        }
        if let Some(key) = matched_key {
            let after_key = i + key.len();
            let mut j = after_key;
            while j < bytes.len() && (bytes[j] as char).is_whitespace() {
                j += 1;
            }
            if j < bytes.len() && (bytes[j] == b'=' || bytes[j] == b':') {
                j += 1;
                while j < bytes.len() && (bytes[j] as char).is_whitespace() {
                    j += 1;
                }
                let value_start = j;
                while j < bytes.len() && !(bytes[j] as char).is_whitespace() {
                    j += 1;
                }
                if j > value_start {
                    out.push_str(key);
                    out.push_str("=***");
                    i = j;
                    continue;
                }
            }
        }
        // Copy one char (UTF-8 safe) and advance.
        let ch_len = text[i..].chars().next().map(|c| c.len_utf8()).unwrap_or(1);
        out.push_str(&text[i..i + ch_len]);
        i += ch_len;
    }
    out
}

fn redact_bare_tokens(text: &str) -> String {
    const PREFIXES: &[&str] = &["sk-", "key-", "xai-", "gsk-", "pk-", "rk-"];
    let mut out = String::with_capacity(text.len());
    let mut i = 0;
    while i < text.len() {
        let rest = &text[i..];
        let mut matched: Option<(&str, usize)> = None;
        for prefix in PREFIXES {
            if rest.starts_with(prefix) {
                let tail_start = prefix.len();
                let tail_len = rest[tail_start..]
                    .chars()
                    .take_while(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
                    .count();
                if tail_len >= 20 {
                    let total_chars = prefix.chars().count() + tail_len;
                    matched = Some((prefix, total_chars));
                }
                break;
            }
        }
        if let Some((_prefix, total_chars)) = matched {
            let byte_len: usize = rest.chars().take(total_chars).map(|c| c.len_utf8()).sum();
            out.push_str("***");
            i += byte_len;
            continue;
        }
        let ch_len = rest.chars().next().map(|c| c.len_utf8()).unwrap_or(1);
        out.push_str(&rest[..ch_len]);
        i += ch_len;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_short_string() {
        assert_eq!(truncate_string("hello", 10), "hello");
    }

    #[test]
    fn test_truncate_exact_length() {
        assert_eq!(truncate_string("hello", 5), "hello");
    }

    #[test]
    fn test_truncate_long_string() {
        let result = truncate_string("hello world, this is a long string", 15);
        assert_eq!(result, "hello world,...");
        assert!(result.len() <= 15);
    }

    #[test]
    fn test_truncate_unicode() {
        let result = truncate_string("こんにちは世界です", 5);
        assert_eq!(result, "こん...");
    }

    #[test]
    fn test_safe_filename() {
        assert_eq!(safe_filename("hello world!"), "hello_world_");
        assert_eq!(safe_filename("file.txt"), "file.txt");
        assert_eq!(safe_filename("a/b/c"), "a_b_c");
        assert_eq!(safe_filename("test@2024"), "test_2024");
    }

    #[test]
    fn test_safe_filename_preserves_valid() {
        assert_eq!(safe_filename("my-file_v2.txt"), "my-file_v2.txt");
    }

    #[test]
    fn test_expand_home_tilde() {
        let expanded = expand_home("~/test/path");
        assert!(!expanded.starts_with("~"));
        assert!(expanded.to_str().unwrap().ends_with("test/path"));
    }

    #[test]
    fn test_expand_home_absolute() {
        let expanded = expand_home("/absolute/path");
        assert_eq!(expanded, PathBuf::from("/absolute/path"));
    }

    #[test]
    fn test_today_date_format() {
        let date = today_date();
        // Should match YYYY-MM-DD pattern
        assert_eq!(date.len(), 10);
        assert_eq!(date.chars().nth(4), Some('-'));
        assert_eq!(date.chars().nth(7), Some('-'));
    }

    #[test]
    fn test_timestamp_is_valid() {
        let ts = timestamp();
        // Should be parseable as RFC 3339
        chrono::DateTime::parse_from_rfc3339(&ts).unwrap();
    }

    #[test]
    fn test_data_path_ends_with_kyber() {
        let path = get_data_path();
        assert!(path.ends_with(".kyber"));
    }

    #[test]
    fn test_sessions_path() {
        let path = get_sessions_path();
        assert!(path.ends_with("sessions"));
        assert!(path.parent().unwrap().ends_with(".kyber"));
    }

    #[test]
    fn test_redact_key_value_pair_equals() {
        let redacted = redact_secrets("api_key=sk-not-actually-checked-here");
        assert_eq!(redacted, "api_key=***");
    }

    #[test]
    fn test_redact_key_value_pair_colon_with_spaces() {
        let redacted = redact_secrets("token :   abc123");
        assert_eq!(redacted, "token=***");
    }

    #[test]
    fn test_redact_key_value_case_insensitive_key() {
        let redacted = redact_secrets("API_KEY=xyz789");
        assert_eq!(redacted, "api_key=***");
    }

    #[test]
    fn test_redact_bare_token_openai_style() {
        let redacted = redact_secrets("use sk-abcdefghijklmnopqrstuvwxyz1234567890 please");
        assert_eq!(redacted, "use *** please");
    }

    #[test]
    fn test_redact_bare_token_too_short_is_untouched() {
        let redacted = redact_secrets("sk-short");
        assert_eq!(redacted, "sk-short");
    }

    #[test]
    fn test_redact_leaves_unrelated_text_untouched() {
        let redacted = redact_secrets("the weather today is sunny and 72 degrees");
        assert_eq!(redacted, "the weather today is sunny and 72 degrees");
    }

    #[test]
    fn test_redact_multiple_occurrences_in_one_string() {
        let redacted = redact_secrets("password=hunter2222222222 and token=deadbeefdeadbeefdead");
        assert_eq!(redacted, "password=*** and token=***");
    }

    #[test]
    fn test_redact_secrets_combines_both_passes() {
        let redacted = redact_secrets("secret: shh_really, also sk-abcdefghijklmnopqrstuvwxyz1234567890");
        assert_eq!(redacted, "secret=*** also ***");
    }
}
