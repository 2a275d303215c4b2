//! Shared utility functions

use chrono::{DateTime, SecondsFormat, Utc};

/// How to obfuscate a secret for display or logging.
///
/// Two patterns exist because API operators recognize their keys
/// differently: dashboards want a stable first4/last4 window, while log
/// lines for `sk-`-style provider keys read better when the vendor prefix
/// survives. Callers pick; the rules never leak more than 8 characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObfuscationStyle {
    /// `first4 + "****" + last4`; anything 8 chars or shorter becomes `****`.
    Generic,
    /// Like `Generic`, but an `sk-` prefix is kept in the visible head so
    /// the key family stays recognizable (`sk-a****wxyz`).
    KeyAware,
}

/// Obfuscate a secret for safe display.
///
/// Never returns the input unchanged; short inputs collapse to `****`.
pub fn obfuscate(secret: &str, style: ObfuscationStyle) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 8 {
        return "****".to_string();
    }
    match style {
        ObfuscationStyle::Generic => {
            let head: String = chars[..4].iter().collect();
            let tail: String = chars[chars.len() - 4..].iter().collect();
            format!("{head}****{tail}")
        }
        ObfuscationStyle::KeyAware => {
            if let Some(rest) = secret.strip_prefix("sk-") {
                let rest_chars: Vec<char> = rest.chars().collect();
                if rest_chars.len() <= 8 {
                    return "sk-****".to_string();
                }
                let head: String = rest_chars[..1].iter().collect();
                let tail: String = rest_chars[rest_chars.len() - 4..].iter().collect();
                format!("sk-{head}****{tail}")
            } else {
                obfuscate(secret, ObfuscationStyle::Generic)
            }
        }
    }
}

/// Format an instant as RFC 3339 with millisecond precision and a `Z`
/// suffix. All timestamps persisted to SQLite use this form so that
/// lexicographic comparison in SQL matches chronological order.
pub fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse a timestamp previously written with [`fmt_ts`].
pub fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
