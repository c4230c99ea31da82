//! Cron schedule and event trigger evaluation (`spec.md` §4.5, §8).

use std::str::FromStr;

use catalog_core::{EngineError, ErrorKind, EventTrigger};
use chrono::{DateTime, Duration, Utc};
use cron::Schedule as CronSchedule;

/// Maximum span searched backwards when computing the most recent due
/// window for a schedule with no catch-up cursor yet.
const LATEST_WINDOW_LOOKBACK: Duration = Duration::hours(24);

/// `cron`'s `Schedule` requires a leading seconds field (6 or 7 space
/// separated fields). Callers submit ordinary 5-field cron (`*/15 * * * *`);
/// a bare 5-field expression is padded with a leading `0` seconds field
/// before parsing so minute-granularity schedules don't need rewriting.
fn parse_cron(expr: &str) -> Result<CronSchedule, EngineError> {
    let normalized = if expr.split_whitespace().count() == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    };
    CronSchedule::from_str(&normalized).map_err(|err| EngineError::new(ErrorKind::Validation, format!("invalid cron expression '{expr}': {err}")))
}

/// Every missed window strictly after `cursor` up to and including `now`,
/// oldest first. With cron `*/15 * * * *`, cursor `T-1h`, `now=T`, this
/// yields `[T-45m, T-30m, T-15m, T]`.
pub fn catchup_windows(cron_expr: &str, cursor: DateTime<Utc>, now: DateTime<Utc>) -> Result<Vec<DateTime<Utc>>, EngineError> {
    let schedule = parse_cron(cron_expr)?;
    Ok(schedule.after(&cursor).take_while(|tick| *tick <= now).collect())
}

/// The single most recent due window at or before `now`, used when
/// `catchUp=false`. Looks back at most [`LATEST_WINDOW_LOOKBACK`]; a
/// schedule with no tick in that span simply has nothing due.
pub fn latest_window(cron_expr: &str, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, EngineError> {
    let schedule = parse_cron(cron_expr)?;
    let search_start = now - LATEST_WINDOW_LOOKBACK;
    Ok(schedule.after(&search_start).take_while(|tick| *tick <= now).last())
}

/// Next tick strictly after `now`, persisted as `nextRunAt`.
pub fn next_run_at(cron_expr: &str, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, EngineError> {
    let schedule = parse_cron(cron_expr)?;
    Ok(schedule.after(&now).next())
}

/// Whether an event trigger should fire for an incoming event, applying
/// the event-type match, the per-trigger throttle, and the paused flag.
pub fn should_fire(trigger: &EventTrigger, event_type: &str, event_source: Option<&str>, now: DateTime<Utc>) -> bool {
    if trigger.paused {
        return false;
    }
    if trigger.event_type != event_type {
        return false;
    }
    if let (Some(expected), Some(actual)) = (&trigger.event_source, event_source) {
        if expected != actual {
            return false;
        }
    }
    if let Some(last_fired_at) = trigger.last_fired_at {
        let elapsed_ms = (now - last_fired_at).num_milliseconds().max(0) as u64;
        if elapsed_ms < trigger.throttle_ms {
            return false;
        }
    }
    true
}

/// Evaluates a trigger's JSON-path predicate against an event payload. A
/// predicate is a flat object of dot-paths to expected scalar values; every
/// entry must match for the predicate to pass. `None` always matches.
pub fn matches_predicate(predicate: Option<&serde_json::Value>, payload: &serde_json::Value) -> bool {
    let Some(predicate) = predicate else {
        return true;
    };
    let Some(entries) = predicate.as_object() else {
        return true;
    };
    entries.iter().all(|(path, expected)| resolve_path(payload, path).map(|actual| actual == expected).unwrap_or(false))
}

fn resolve_path<'a>(value: &'a serde_json::Value, path: &str) -> Option<&'a serde_json::Value> {
    path.split('.').try_fold(value, |current, segment| current.get(segment))
}

/// Increments or resets a trigger's consecutive-failure counter, returning
/// whether the trigger should transition to `paused` this call (more than
/// `failureThreshold` consecutive failures).
pub fn record_delivery_outcome(trigger: &mut EventTrigger, succeeded: bool) -> bool {
    if succeeded {
        trigger.consecutive_failures = 0;
        return false;
    }
    trigger.consecutive_failures += 1;
    if trigger.consecutive_failures > trigger.failure_threshold {
        trigger.paused = true;
        trigger.paused_reason = Some(format!(
            "{} consecutive delivery failures exceeds threshold of {}",
            trigger.consecutive_failures, trigger.failure_threshold
        ));
        true
    } else {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catchup_materializes_exactly_four_windows() {
        let now = DateTime::parse_from_rfc3339("2025-01-01T01:00:00Z").unwrap().with_timezone(&Utc);
        let cursor = now - Duration::hours(1);
        let windows = catchup_windows("0 */15 * * * *", cursor, now).unwrap();
        assert_eq!(windows.len(), 4);
        assert_eq!(windows[0], now - Duration::minutes(45));
        assert_eq!(windows[3], now);
    }

    #[test]
    fn five_field_cron_is_normalized() {
        let now = DateTime::parse_from_rfc3339("2025-01-01T01:00:00Z").unwrap().with_timezone(&Utc);
        let cursor = now - Duration::hours(1);
        let windows = catchup_windows("*/15 * * * *", cursor, now).unwrap();
        assert_eq!(windows.len(), 4);
        assert_eq!(windows[3], now);
    }

    #[test]
    fn throttle_suppresses_rapid_refire() {
        let now = Utc::now();
        let mut trigger = sample_trigger();
        trigger.throttle_ms = 60_000;
        trigger.last_fired_at = Some(now - Duration::seconds(10));
        assert!(!should_fire(&trigger, "job.run.succeeded", None, now));

        trigger.last_fired_at = Some(now - Duration::minutes(5));
        assert!(should_fire(&trigger, "job.run.succeeded", None, now));
    }

    #[test]
    fn paused_trigger_never_fires() {
        let now = Utc::now();
        let mut trigger = sample_trigger();
        trigger.paused = true;
        assert!(!should_fire(&trigger, "job.run.succeeded", None, now));
    }

    #[test]
    fn failure_threshold_pauses_trigger() {
        let mut trigger = sample_trigger();
        trigger.failure_threshold = 2;
        assert!(!record_delivery_outcome(&mut trigger, false));
        assert!(!record_delivery_outcome(&mut trigger, false));
        assert!(record_delivery_outcome(&mut trigger, false));
        assert!(trigger.paused);
    }

    #[test]
    fn predicate_matches_nested_path() {
        let predicate = serde_json::json!({"payload.status": "succeeded"});
        let event = serde_json::json!({"payload": {"status": "succeeded"}});
        assert!(matches_predicate(Some(&predicate), &event));

        let mismatched = serde_json::json!({"payload": {"status": "failed"}});
        assert!(!matches_predicate(Some(&predicate), &mismatched));
    }

    fn sample_trigger() -> EventTrigger {
        EventTrigger {
            id: uuid::Uuid::now_v7(),
            workflow_definition_id: uuid::Uuid::now_v7(),
            event_type: "job.run.succeeded".to_string(),
            event_source: None,
            predicate: None,
            throttle_ms: 0,
            failure_threshold: 5,
            paused: false,
            paused_reason: None,
            last_fired_at: None,
            consecutive_failures: 0,
        }
    }
}
