//! Streaming credential redaction.
//!
//! Built once per Tier Runner invocation from the `BROWSER_CRED_*`
//! environment family. Values are matched longest-first so a credential
//! that happens to be a substring of another is never shadowed.

use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};

const CRED_PREFIX: &str = "BROWSER_CRED_";

struct Needle {
    raw: String,
    replacement: String,
}

pub struct Redactor {
    needles: Vec<Needle>,
}

impl Redactor {
    /// Scans the process environment for `BROWSER_CRED_*` keys and builds
    /// raw + URL-encoded substitution pairs for each non-empty value.
    pub fn from_env() -> Self {
        let mut needles = Vec::new();

        for (key, value) in std::env::vars() {
            let Some(label) = key.strip_prefix(CRED_PREFIX) else {
                continue;
            };
            if value.is_empty() {
                continue;
            }
            if value.len() < 4 {
                tracing::warn!(key = %key, "credential value shorter than 4 chars, redaction may produce false positives");
            }

            needles.push(Needle {
                raw: value.clone(),
                replacement: format!("[REDACTED:{label}]"),
            });

            let encoded = utf8_percent_encode(&value, NON_ALPHANUMERIC).to_string();
            if encoded != value {
                needles.push(Needle {
                    raw: encoded,
                    replacement: format!("[REDACTED:{label}:urlencoded]"),
                });
            }
        }

        // Longest needle first so overlapping substrings never shadow a
        // longer exact match.
        needles.sort_by(|a, b| b.raw.len().cmp(&a.raw.len()));

        Self { needles }
    }

    pub fn is_empty(&self) -> bool {
        self.needles.is_empty()
    }

    /// Replaces every registered needle in `text`. Idempotent: redacted
    /// placeholders never collide with credential values, so re-running
    /// this against already-redacted text is a no-op.
    pub fn redact(&self, text: &str) -> String {
        let mut out = text.to_string();
        for needle in &self.needles {
            if out.contains(&needle.raw) {
                out = out.replace(&needle.raw, &needle.replacement);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn redacts_raw_and_urlencoded_variants() {
        let _guard = ENV_LOCK.lock().unwrap();
        unsafe { std::env::set_var("BROWSER_CRED_X", "abc def") };
        let redactor = Redactor::from_env();
        assert_eq!(redactor.redact("token is abc def"), "token is [REDACTED:X]");
        assert_eq!(
            redactor.redact("encoded abc%20def here"),
            "encoded [REDACTED:X:urlencoded] here"
        );
        unsafe { std::env::remove_var("BROWSER_CRED_X") };
    }

    #[test]
    fn idempotent_on_redacted_text() {
        let _guard = ENV_LOCK.lock().unwrap();
        unsafe { std::env::set_var("BROWSER_CRED_Y", "hunter2") };
        let redactor = Redactor::from_env();
        let once = redactor.redact("password hunter2 here");
        let twice = redactor.redact(&once);
        assert_eq!(once, twice);
        unsafe { std::env::remove_var("BROWSER_CRED_Y") };
    }

    #[test]
    fn longest_needle_wins_on_overlap() {
        let _guard = ENV_LOCK.lock().unwrap();
        unsafe { std::env::set_var("BROWSER_CRED_SHORT", "ab") };
        unsafe { std::env::set_var("BROWSER_CRED_LONG", "abcdef") };
        let redactor = Redactor::from_env();
        assert_eq!(redactor.redact("abcdef"), "[REDACTED:LONG]");
        unsafe { std::env::remove_var("BROWSER_CRED_SHORT") };
        unsafe { std::env::remove_var("BROWSER_CRED_LONG") };
    }

    #[test]
    fn empty_env_yields_no_needles() {
        let _guard = ENV_LOCK.lock().unwrap();
        for (k, _) in std::env::vars() {
            if k.starts_with(CRED_PREFIX) {
                unsafe { std::env::remove_var(&k) };
            }
        }
        let redactor = Redactor::from_env();
        assert!(redactor.is_empty());
        assert_eq!(redactor.redact("nothing here"), "nothing here");
    }
}
