//! Message templates.
//!
//! Templates carry bracketed tokens. The engine fills `[OBJNAME]`,
//! `[CHANNEL]` and `[LOCATION]` when it writes a record; the announcer and
//! the where-is query fill `[TIMEAGO]` and `[OBJECT]` when they deliver it.
//! Any other bracketed text is left exactly as written.

use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::{Captures, Regex};

pub const OBJNAME: &str = "OBJNAME";
pub const CHANNEL: &str = "CHANNEL";
pub const LOCATION: &str = "LOCATION";
pub const TIMEAGO: &str = "TIMEAGO";
pub const OBJECT: &str = "OBJECT";

fn token_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\[([^\]]*)\]").ok()).as_ref()
}

/// Substitute known tokens, leaving unknown ones untouched
pub fn render(template: &str, values: &[(&str, &str)]) -> String {
    let Some(pattern) = token_pattern() else {
        return template.to_string();
    };
    pattern
        .replace_all(template, |caps: &Captures<'_>| {
            let token = &caps[1];
            values
                .iter()
                .find(|(name, _)| *name == token)
                .map(|(_, value)| value.to_string())
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

/// Tokens known at detection time
pub fn render_detection(template: &str, object_name: &str, channel_name: &str, location: Option<&str>) -> String {
    render(
        template,
        &[
            (OBJNAME, object_name),
            (CHANNEL, channel_name),
            (LOCATION, location.unwrap_or("")),
        ],
    )
}

/// Tokens known at delivery time
pub fn render_delivery(message: &str, reference_name: &str, reported: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let ago = natural_delta((now - reported).num_seconds());
    render(message, &[(TIMEAGO, &ago), (OBJECT, reference_name)])
}

/// Spoken form of an elapsed time ("5 minutes", "an hour")
pub fn natural_delta(seconds: i64) -> String {
    let s = seconds.max(0);
    match s {
        0 => "a moment".to_string(),
        1 => "a second".to_string(),
        2..=59 => format!("{} seconds", s),
        60..=119 => "a minute".to_string(),
        120..=3599 => format!("{} minutes", s / 60),
        3600..=7199 => "an hour".to_string(),
        7200..=86399 => format!("{} hours", s / 3600),
        86400..=172799 => "a day".to_string(),
        _ => format!("{} days", s / 86400),
    }
}
