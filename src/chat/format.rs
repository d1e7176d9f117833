//! Human readable timestamps. Everything is rendered in UTC.

use time::OffsetDateTime;

const MINUTE: i64 = 60;
const HOUR: i64 = 60 * MINUTE;
const DAY: i64 = 24 * HOUR;
const WEEK: i64 = 7 * DAY;

fn at(ms: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp_nanos(ms as i128 * 1_000_000).unwrap_or(OffsetDateTime::UNIX_EPOCH)
}

fn whole_days(ms: i64, now_ms: i64) -> i64 {
    (now_ms - ms).max(0) / 1000 / DAY
}

fn three(name: impl ToString) -> String {
    name.to_string().chars().take(3).collect()
}

fn short_date(t: OffsetDateTime) -> String {
    format!("{} {}", three(t.month()), t.day())
}

pub fn clock(ms: i64) -> String {
    let t = at(ms);
    format!("{:02}:{:02}", t.hour(), t.minute())
}

/// "now", "5m ago", "3h ago", "2d ago", then a date.
pub fn relative(ms: i64, now_ms: i64) -> String {
    let secs = (now_ms - ms).max(0) / 1000;
    match secs {
        0..MINUTE => "now".to_owned(),
        MINUTE..HOUR => format!("{}m ago", secs / MINUTE),
        HOUR..DAY => format!("{}h ago", secs / HOUR),
        DAY..WEEK => format!("{}d ago", secs / DAY),
        _ => {
            let (t, now) = (at(ms), at(now_ms));
            if t.year() == now.year() {
                short_date(t)
            } else {
                format!("{}, {}", short_date(t), t.year())
            }
        }
    }
}

/// Label for a directory entry.
pub fn conversation_time(ms: i64, now_ms: i64) -> String {
    let t = at(ms);
    match whole_days(ms, now_ms) {
        0 => clock(ms),
        1 => "Yesterday".to_owned(),
        2..7 => three(t.weekday()),
        _ => short_date(t),
    }
}

/// Label under a message bubble.
pub fn message_time(ms: i64, now_ms: i64) -> String {
    let t = at(ms);
    match whole_days(ms, now_ms) {
        0 => clock(ms),
        1 => format!("Yesterday {}", clock(ms)),
        2..7 => format!("{} {}", three(t.weekday()), clock(ms)),
        _ => format!("{} {}", short_date(t), clock(ms)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // 2024-03-15 12:30:00 UTC, a Friday
    const NOW: i64 = 1_710_505_800_000;

    #[test]
    fn relative_buckets() {
        assert_eq!(relative(NOW - 5_000, NOW), "now");
        assert_eq!(relative(NOW - 5 * 60_000, NOW), "5m ago");
        assert_eq!(relative(NOW - 3 * 3_600_000, NOW), "3h ago");
        assert_eq!(relative(NOW - 2 * 86_400_000, NOW), "2d ago");
        assert_eq!(relative(NOW - 20 * 86_400_000, NOW), "Feb 24");
        assert_eq!(relative(NOW - 400 * 86_400_000, NOW), "Feb 9, 2023");
    }

    #[test]
    fn directory_and_bubble_labels() {
        assert_eq!(clock(NOW), "12:30");
        assert_eq!(conversation_time(NOW - 60_000, NOW), "12:29");
        assert_eq!(conversation_time(NOW - 86_400_000, NOW), "Yesterday");
        assert_eq!(conversation_time(NOW - 3 * 86_400_000, NOW), "Tue");
        assert_eq!(message_time(NOW - 86_400_000, NOW), "Yesterday 12:30");
        assert_eq!(message_time(NOW - 10 * 86_400_000, NOW), "Mar 5 12:30");
    }
}
