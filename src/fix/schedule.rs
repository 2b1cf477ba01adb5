//! Session windows.
//!
//! The engine never schedules anything itself; it only asks two questions on
//! each timer tick: is this moment inside the configured window, and does the
//! current window instance match the one the session was created in. A "no"
//! to either drives a state reset (and for the first, refusal of logons).

use chrono::{DateTime, Datelike, Duration, NaiveTime, Utc, Weekday};

pub trait SessionSchedule: Send + Sync {
    /// Is `at` inside the configured session window?
    fn is_session_time(&self, at: DateTime<Utc>) -> bool;

    /// Do `a` and `b` fall in the same window instance?
    fn is_same_session(&self, a: DateTime<Utc>, b: DateTime<Utc>) -> bool;
}

/// A session that never closes.
pub struct NonStopSchedule;

impl SessionSchedule for NonStopSchedule {
    fn is_session_time(&self, _at: DateTime<Utc>) -> bool {
        true
    }

    fn is_same_session(&self, _a: DateTime<Utc>, _b: DateTime<Utc>) -> bool {
        true
    }
}

/// One window per day, possibly crossing midnight.
pub struct DailySchedule {
    start: NaiveTime,
    end: NaiveTime,
}

impl DailySchedule {
    pub fn new(start: NaiveTime, end: NaiveTime) -> DailySchedule {
        DailySchedule { start, end }
    }

    /// The instant the window containing (or most recently preceding) `at`
    /// opened.
    fn window_open(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        let today_open = at
            .date_naive()
            .and_time(self.start)
            .and_utc();
        if at >= today_open {
            today_open
        } else {
            today_open - Duration::days(1)
        }
    }
}

impl SessionSchedule for DailySchedule {
    fn is_session_time(&self, at: DateTime<Utc>) -> bool {
        let t = at.time();
        if self.start <= self.end {
            self.start <= t && t <= self.end
        } else {
            // crosses midnight
            t >= self.start || t <= self.end
        }
    }

    fn is_same_session(&self, a: DateTime<Utc>, b: DateTime<Utc>) -> bool {
        self.window_open(a) == self.window_open(b)
    }
}

/// One window per week, e.g. Sunday 17:00 through Friday 17:00.
pub struct WeeklySchedule {
    start_day: Weekday,
    end_day: Weekday,
    start: NaiveTime,
    end: NaiveTime,
}

impl WeeklySchedule {
    pub fn new(
        start_day: Weekday,
        start: NaiveTime,
        end_day: Weekday,
        end: NaiveTime,
    ) -> WeeklySchedule {
        WeeklySchedule {
            start_day,
            end_day,
            start,
            end,
        }
    }

    fn window_open(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        let days_since_start = (7 + at.weekday().num_days_from_monday()
            - self.start_day.num_days_from_monday())
            % 7;
        let mut open = (at - Duration::days(i64::from(days_since_start)))
            .date_naive()
            .and_time(self.start)
            .and_utc();
        if open > at {
            open -= Duration::days(7);
        }
        open
    }

    fn window_close(&self, open: DateTime<Utc>) -> DateTime<Utc> {
        let mut span = (7 + self.end_day.num_days_from_monday()
            - self.start_day.num_days_from_monday())
            % 7;
        if span == 0 && self.end <= self.start {
            span = 7;
        }
        (open + Duration::days(i64::from(span)))
            .date_naive()
            .and_time(self.end)
            .and_utc()
    }
}

impl SessionSchedule for WeeklySchedule {
    fn is_session_time(&self, at: DateTime<Utc>) -> bool {
        let open = self.window_open(at);
        at >= open && at <= self.window_close(open)
    }

    fn is_same_session(&self, a: DateTime<Utc>, b: DateTime<Utc>) -> bool {
        self.window_open(a) == self.window_open(b)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::TimeZone;

    fn t(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    fn hm(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn test_daily_window() {
        let sched = DailySchedule::new(hm(9, 0), hm(17, 0));
        assert!(sched.is_session_time(t(2024, 5, 6, 12, 0)));
        assert!(!sched.is_session_time(t(2024, 5, 6, 18, 0)));
        assert!(sched.is_same_session(t(2024, 5, 6, 10, 0), t(2024, 5, 6, 16, 0)));
        assert!(!sched.is_same_session(t(2024, 5, 6, 10, 0), t(2024, 5, 7, 10, 0)));
    }

    #[test]
    fn test_daily_window_across_midnight() {
        let sched = DailySchedule::new(hm(22, 0), hm(4, 0));
        assert!(sched.is_session_time(t(2024, 5, 6, 23, 0)));
        assert!(sched.is_session_time(t(2024, 5, 7, 2, 0)));
        assert!(!sched.is_session_time(t(2024, 5, 7, 12, 0)));
        // 23:00 Monday and 02:00 Tuesday share the Monday 22:00 window
        assert!(sched.is_same_session(t(2024, 5, 6, 23, 0), t(2024, 5, 7, 2, 0)));
        assert!(!sched.is_same_session(t(2024, 5, 6, 23, 0), t(2024, 5, 7, 23, 0)));
    }

    #[test]
    fn test_weekly_window() {
        // Sunday 17:00 -> Friday 17:00
        let sched = WeeklySchedule::new(Weekday::Sun, hm(17, 0), Weekday::Fri, hm(17, 0));
        // 2024-05-08 is a Wednesday
        assert!(sched.is_session_time(t(2024, 5, 8, 12, 0)));
        // Saturday is outside
        assert!(!sched.is_session_time(t(2024, 5, 11, 12, 0)));
        // Wednesday and Thursday share the same window
        assert!(sched.is_same_session(t(2024, 5, 8, 12, 0), t(2024, 5, 9, 12, 0)));
        // Next week's Wednesday does not
        assert!(!sched.is_same_session(t(2024, 5, 8, 12, 0), t(2024, 5, 15, 12, 0)));
    }

    #[test]
    fn test_non_stop() {
        let sched = NonStopSchedule;
        assert!(sched.is_session_time(t(1970, 1, 1, 0, 0)));
        assert!(sched.is_same_session(t(1970, 1, 1, 0, 0), t(2024, 5, 8, 12, 0)));
    }
}
