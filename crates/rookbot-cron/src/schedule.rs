//! Schedule calculator — converts a schedule definition plus a reference
//! instant into "next run at" and "was an occurrence missed".
//!
//! Pure functions over epoch milliseconds: no clock reads, deterministic for
//! a given input pair.

use chrono::TimeZone;
use chrono::Utc;
use chrono_tz::Tz;
use croner::Cron;
use tracing::warn;

use rookbot_types::CronSchedule;

/// Compute the next fire instant strictly after `now_ms`, except for
/// one-shot `at` schedules which return their fixed instant regardless (the
/// caller decides whether a past one-shot should still fire once).
///
/// Returns `None` when the schedule cannot produce an occurrence (bad cron
/// expression or timezone, non-positive interval). Validation rejects such
/// definitions at add time, so `None` here is a defensive path.
pub fn next_run_at_ms(schedule: &CronSchedule, now_ms: i64) -> Option<i64> {
    match schedule {
        CronSchedule::At { at } => Some(*at),
        _ => occurrence_after(schedule, now_ms),
    }
}

/// True when the schedule had an occurrence between `last_run_ms` and
/// `now_ms` that was never fired, i.e. the process was down across an
/// expected firing. One-shots cannot be missed in this sense, and degenerate
/// inputs (`now_ms <= last_run_ms`) report false rather than erroring.
pub fn has_missed_occurrence(schedule: &CronSchedule, last_run_ms: i64, now_ms: i64) -> bool {
    if now_ms <= last_run_ms {
        return false;
    }
    match schedule {
        CronSchedule::At { .. } => false,
        _ => occurrence_after(schedule, last_run_ms).is_some_and(|next| next < now_ms),
    }
}

/// Validate a schedule definition for `add`/`update`.
pub fn validate(schedule: &CronSchedule) -> std::result::Result<(), String> {
    match schedule {
        CronSchedule::Cron { expr, tz } => {
            parse_cron(expr).ok_or_else(|| format!("invalid cron expression: {expr:?}"))?;
            if let Some(tz) = tz {
                parse_tz(tz).ok_or_else(|| format!("unknown timezone: {tz:?}"))?;
            }
            Ok(())
        }
        CronSchedule::Every { every_ms, .. } => {
            // Sub-second intervals would starve the tick loop.
            if *every_ms < 1000 {
                return Err(format!("everyMs must be at least 1000, got {every_ms}"));
            }
            Ok(())
        }
        CronSchedule::At { .. } => Ok(()),
    }
}

/// First occurrence strictly after `after_ms`, for recurring schedules.
fn occurrence_after(schedule: &CronSchedule, after_ms: i64) -> Option<i64> {
    match schedule {
        CronSchedule::At { at } => (*at > after_ms).then_some(*at),
        CronSchedule::Every {
            every_ms,
            anchor_ms,
        } => {
            if *every_ms <= 0 {
                return None;
            }
            match anchor_ms {
                // Unanchored: never "now" itself, which would refire forever.
                None => Some(after_ms + every_ms),
                Some(anchor) if after_ms < *anchor => Some(*anchor),
                // Smallest anchor + k*every strictly greater than after_ms;
                // exact hits advance to the next slot.
                Some(anchor) => {
                    let k = (after_ms - anchor) / every_ms + 1;
                    Some(anchor + k * every_ms)
                }
            }
        }
        CronSchedule::Cron { expr, tz } => {
            let cron = parse_cron(expr)?;
            let zone = match tz {
                Some(name) => parse_tz(name)?,
                None => chrono_tz::UTC,
            };
            let after = Utc.timestamp_millis_opt(after_ms).single()?.with_timezone(&zone);
            let next = cron.find_next_occurrence(&after, false).ok()?;
            Some(next.timestamp_millis())
        }
    }
}

fn parse_cron(expr: &str) -> Option<Cron> {
    match Cron::new(expr).with_seconds_optional().parse() {
        Ok(cron) => Some(cron),
        Err(e) => {
            warn!(expr, "failed to parse cron expression: {e}");
            None
        }
    }
}

fn parse_tz(name: &str) -> Option<Tz> {
    match name.parse::<Tz>() {
        Ok(tz) => Some(tz),
        Err(_) => {
            warn!(tz = name, "unknown IANA timezone");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc_ms(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> i64 {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s)
            .unwrap()
            .timestamp_millis()
    }

    fn tz_ms(tz: Tz, y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> i64 {
        tz.with_ymd_and_hms(y, mo, d, h, mi, s)
            .unwrap()
            .timestamp_millis()
    }

    fn wednesdays_9am_la() -> CronSchedule {
        CronSchedule::Cron {
            expr: "0 9 * * 3".into(),
            tz: Some("America/Los_Angeles".into()),
        }
    }

    #[test]
    fn test_cron_next_run_in_timezone() {
        // 2025-12-13 is a Saturday; the next Wednesday 09:00 PST (UTC-8)
        // is 2025-12-17 17:00 UTC.
        let now = utc_ms(2025, 12, 13, 0, 0, 0);
        let next = next_run_at_ms(&wednesdays_9am_la(), now).unwrap();
        assert_eq!(next, utc_ms(2025, 12, 17, 17, 0, 0));
    }

    #[test]
    fn test_cron_dst_changes_utc_offset() {
        // Same wall-clock rule in July lands on PDT (UTC-7): Wednesday
        // 09:00 becomes 16:00 UTC instead of 17:00.
        let now = utc_ms(2025, 7, 1, 0, 0, 0); // Tuesday
        let next = next_run_at_ms(&wednesdays_9am_la(), now).unwrap();
        assert_eq!(next, utc_ms(2025, 7, 2, 16, 0, 0));
    }

    #[test]
    fn test_cron_defaults_to_utc() {
        let sched = CronSchedule::Cron {
            expr: "0 5 * * *".into(),
            tz: None,
        };
        let now = utc_ms(2026, 3, 10, 0, 0, 0);
        assert_eq!(
            next_run_at_ms(&sched, now),
            Some(utc_ms(2026, 3, 10, 5, 0, 0))
        );
    }

    #[test]
    fn test_cron_strictly_after() {
        // Standing exactly on a matching instant advances to the next one.
        let sched = CronSchedule::Cron {
            expr: "0 5 * * *".into(),
            tz: None,
        };
        let on_the_dot = utc_ms(2026, 3, 10, 5, 0, 0);
        assert_eq!(
            next_run_at_ms(&sched, on_the_dot),
            Some(utc_ms(2026, 3, 11, 5, 0, 0))
        );
    }

    #[test]
    fn test_cron_invalid_inputs() {
        let bad_expr = CronSchedule::Cron {
            expr: "not a cron".into(),
            tz: None,
        };
        assert_eq!(next_run_at_ms(&bad_expr, 0), None);

        let bad_tz = CronSchedule::Cron {
            expr: "0 5 * * *".into(),
            tz: Some("Mars/Olympus_Mons".into()),
        };
        assert_eq!(next_run_at_ms(&bad_tz, 0), None);
    }

    #[test]
    fn test_every_unanchored_never_now() {
        let sched = CronSchedule::Every {
            every_ms: 30_000,
            anchor_ms: None,
        };
        let now = 1_700_000_000_000;
        assert_eq!(next_run_at_ms(&sched, now), Some(now + 30_000));
    }

    #[test]
    fn test_every_anchored() {
        let anchor = 1_700_000_000_000;
        let sched = CronSchedule::Every {
            every_ms: 30_000,
            anchor_ms: Some(anchor),
        };
        // Mid-interval snaps to the next grid slot.
        assert_eq!(next_run_at_ms(&sched, anchor + 10_000), Some(anchor + 30_000));
        // Standing exactly on a slot advances, never refires the same instant.
        assert_eq!(next_run_at_ms(&sched, anchor), Some(anchor + 30_000));
        assert_eq!(
            next_run_at_ms(&sched, anchor + 60_000),
            Some(anchor + 90_000)
        );
        // A future anchor is itself the first occurrence.
        assert_eq!(next_run_at_ms(&sched, anchor - 5_000), Some(anchor));
    }

    #[test]
    fn test_at_returns_fixed_instant() {
        let sched = CronSchedule::At { at: 42_000 };
        assert_eq!(next_run_at_ms(&sched, 0), Some(42_000));
        // Past one-shots still report their instant; the caller decides.
        assert_eq!(next_run_at_ms(&sched, 100_000), Some(42_000));
    }

    #[test]
    fn test_missed_cron_occurrence() {
        let singapore: Tz = "Asia/Singapore".parse().unwrap();
        let sched = CronSchedule::Cron {
            expr: "0 5 * * *".into(),
            tz: Some("Asia/Singapore".into()),
        };
        let now = tz_ms(singapore, 2026, 2, 9, 6, 23, 0);

        // Last ran Feb 5th; the Feb 6th-8th firings never happened.
        let last = tz_ms(singapore, 2026, 2, 5, 5, 0, 0);
        assert!(has_missed_occurrence(&sched, last, now));

        // Last ran this morning; nothing was missed.
        let last = tz_ms(singapore, 2026, 2, 9, 5, 0, 0);
        assert!(!has_missed_occurrence(&sched, last, now));
    }

    #[test]
    fn test_missed_every_occurrence() {
        let sched = CronSchedule::Every {
            every_ms: 30_000,
            anchor_ms: None,
        };
        assert!(has_missed_occurrence(&sched, 1_000, 100_000));
        assert!(!has_missed_occurrence(&sched, 1_000, 20_000));
    }

    #[test]
    fn test_missed_never_for_one_shot() {
        let sched = CronSchedule::At { at: 5_000 };
        assert!(!has_missed_occurrence(&sched, 1_000, 100_000));
    }

    #[test]
    fn test_missed_degenerate_inputs() {
        let sched = CronSchedule::Every {
            every_ms: 30_000,
            anchor_ms: None,
        };
        assert!(!has_missed_occurrence(&sched, 50_000, 50_000));
        assert!(!has_missed_occurrence(&sched, 50_000, 10_000));
    }

    #[test]
    fn test_next_run_is_deterministic() {
        let now = utc_ms(2025, 12, 13, 0, 0, 0);
        let sched = wednesdays_9am_la();
        assert_eq!(next_run_at_ms(&sched, now), next_run_at_ms(&sched, now));
    }

    #[test]
    fn test_validate() {
        assert!(validate(&wednesdays_9am_la()).is_ok());
        assert!(validate(&CronSchedule::At { at: 0 }).is_ok());
        assert!(
            validate(&CronSchedule::Every {
                every_ms: 1000,
                anchor_ms: None
            })
            .is_ok()
        );

        assert!(
            validate(&CronSchedule::Every {
                every_ms: 500,
                anchor_ms: None
            })
            .is_err()
        );
        assert!(
            validate(&CronSchedule::Cron {
                expr: "bogus".into(),
                tz: None
            })
            .is_err()
        );
        assert!(
            validate(&CronSchedule::Cron {
                expr: "0 5 * * *".into(),
                tz: Some("Nowhere/Void".into())
            })
            .is_err()
        );
    }
}
