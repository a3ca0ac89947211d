// SPDX-License-Identifier: MIT
//! Maintenance window gate.
//!
//! A pure time predicate: given the current UTC time and a configured
//! recurring window, decide whether automatic remediation should be
//! suppressed. Consulted by the auto-restart controller before any restart;
//! deliberately **never** consulted by the kill switch — an explicit human
//! kill must be honorable even mid-maintenance.

use chrono::{DateTime, Datelike, Days, Utc, Weekday};
use serde::{Deserialize, Serialize};
use tracing::warn;

const MINUTES_PER_DAY: u32 = 24 * 60;

/// Recurring maintenance window (`[maintenance]` in config.toml).
///
/// `start` is `"HH:MM"` UTC; `days` are lowercase three-letter weekday
/// abbreviations (`"mon"` … `"sun"`). An empty `days` list means the window
/// applies every day.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceWindow {
    pub start: String,
    pub duration_minutes: u32,
    pub days: Vec<String>,
    pub active: bool,
}

impl Default for MaintenanceWindow {
    fn default() -> Self {
        Self {
            start: "03:00".to_string(),
            duration_minutes: 60,
            days: Vec::new(),
            active: false,
        }
    }
}

fn weekday_abbr(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "mon",
        Weekday::Tue => "tue",
        Weekday::Wed => "wed",
        Weekday::Thu => "thu",
        Weekday::Fri => "fri",
        Weekday::Sat => "sat",
        Weekday::Sun => "sun",
    }
}

impl MaintenanceWindow {
    /// Parse `start` into a minute-of-day offset. Returns `None` (with a
    /// warning) for malformed values — a window that cannot be parsed never
    /// suppresses remediation.
    fn start_minute(&self) -> Option<u32> {
        let (h, m) = self.start.split_once(':')?;
        let hour: u32 = h.trim().parse().ok()?;
        let minute: u32 = m.trim().parse().ok()?;
        if hour >= 24 || minute >= 60 {
            return None;
        }
        Some(hour * 60 + minute)
    }

    /// Whether `now` falls inside the window.
    ///
    /// The weekday check applies to the day the window *opened* (a window
    /// opening Tuesday 23:30 for 2h is still the Tuesday window at 00:30
    /// Wednesday), and a window covers exactly `duration_minutes` from its
    /// opening instant — never more, even for multi-day durations.
    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        if !self.active || self.duration_minutes == 0 {
            return false;
        }
        let Some(start) = self.start_minute() else {
            warn!(start = %self.start, "malformed maintenance window start — gate disabled");
            return false;
        };

        // Walk back over every day whose opening could still cover `now`.
        let lookback = u64::from(self.duration_minutes / MINUTES_PER_DAY) + 1;
        for days_back in 0..=lookback {
            let Some(date) = now.date_naive().checked_sub_days(Days::new(days_back)) else {
                continue;
            };
            if !self.applies_on(date.weekday()) {
                continue;
            }
            let Some(opening) = date.and_hms_opt(start / 60, start % 60, 0) else {
                continue;
            };
            let elapsed = now.signed_duration_since(opening.and_utc()).num_minutes();
            if (0..i64::from(self.duration_minutes)).contains(&elapsed) {
                return true;
            }
        }
        false
    }

    fn applies_on(&self, day: Weekday) -> bool {
        self.days.is_empty() || self.days.iter().any(|d| d == weekday_abbr(day))
    }

    /// Convenience wrapper over [`MaintenanceWindow::contains`] at the
    /// current wall-clock time.
    pub fn is_active_now(&self) -> bool {
        self.contains(Utc::now())
    }
}
