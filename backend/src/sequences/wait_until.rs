// Wait-until resolution - turns a weekday rule into the next concrete UTC timestamp

use chrono::{DateTime, Datelike, Duration, Utc};
use crm_shared::WaitUntilCondition;

const DEFAULT_HOUR: i32 = 9;
const DEFAULT_MINUTE: i32 = 0;
const NEXT_WEEK_RULE: &str = "next_week";

/// Resolve a wait-until condition relative to `now`.
///
/// Returns `None` when the condition matches neither the `next_week` rule nor a
/// `dayOfWeek` in `0..=6` (0 = Sunday); callers treat that as due immediately.
pub fn resolve(condition: &WaitUntilCondition, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let hour = condition.hour.unwrap_or(DEFAULT_HOUR).clamp(0, 23) as u32;
    let minute = condition.minute.unwrap_or(DEFAULT_MINUTE).clamp(0, 59) as u32;

    let days_ahead = if condition.rule.as_deref().map(str::trim) == Some(NEXT_WEEK_RULE) {
        // Always the Monday of the coming week, even when today is Monday
        match (7 - now.weekday().num_days_from_monday()) % 7 {
            0 => 7,
            n => n,
        }
    } else {
        let target = condition.day_of_week.filter(|d| (0..=6).contains(d))? as u32;
        let today = now.weekday().num_days_from_sunday();
        (target + 7 - today) % 7
    };

    let candidate = (now.date_naive() + Duration::days(days_ahead as i64))
        .and_hms_opt(hour, minute, 0)?
        .and_utc();

    if candidate < now {
        Some(candidate + Duration::days(7))
    } else {
        Some(candidate)
    }
}
