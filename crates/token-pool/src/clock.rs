//! Calendar source for the daily exhaustion reset

use chrono::{Days, NaiveDate, Utc};
use std::sync::{Mutex, PoisonError};

/// Source of "today" in UTC.
pub trait Clock: Send + Sync {
    fn today(&self) -> NaiveDate;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn today(&self) -> NaiveDate {
        Utc::now().date_naive()
    }
}

/// Clock pinned to a settable date.
#[derive(Debug)]
pub struct ManualClock {
    today: Mutex<NaiveDate>,
}

impl ManualClock {
    pub fn new(today: NaiveDate) -> Self {
        Self {
            today: Mutex::new(today),
        }
    }

    pub fn set(&self, today: NaiveDate) {
        *self.today.lock().unwrap_or_else(PoisonError::into_inner) = today;
    }

    /// Move the clock forward by whole days.
    pub fn advance_days(&self, days: u64) {
        let mut today = self.today.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(next) = today.checked_add_days(Days::new(days)) {
            *today = next;
        }
    }
}

impl Clock for ManualClock {
    fn today(&self) -> NaiveDate {
        *self.today.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
