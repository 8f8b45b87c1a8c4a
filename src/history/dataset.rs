use std::collections::BTreeMap;
use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::schema::RateObservation;

// ------------------------------------------------------------
// Persisted document
// ------------------------------------------------------------
//
// { "historical_data": [ { "date": "YYYY-MM-DD", "rates": [ ... ] } ] }
//
// INVARIANTS (after `normalize`):
// - dates are unique
// - entries sorted by date, newest first
// - at most `retention` entries
// - inside one entry, at most one observation per bank
//
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryDataset {
    #[serde(default)]
    pub historical_data: Vec<DailyEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyEntry {
    pub date: NaiveDate,
    #[serde(default)]
    pub rates: Vec<RateObservation>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Inserted,
    Replaced,
    Unchanged,
}

impl DailyEntry {
    pub fn new(date: NaiveDate) -> Self {
        Self {
            date,
            rates: Vec::new(),
        }
    }

    /// Last write wins per bank; position of an existing bank is kept.
    pub fn upsert(&mut self, obs: RateObservation) -> Upsert {
        match self.rates.iter_mut().find(|r| r.bank() == obs.bank()) {
            Some(existing) if *existing == obs => Upsert::Unchanged,
            Some(existing) => {
                *existing = obs;
                Upsert::Replaced
            }
            None => {
                self.rates.push(obs);
                Upsert::Inserted
            }
        }
    }

    pub fn get(&self, bank: &str) -> Option<&RateObservation> {
        self.rates.iter().find(|r| r.bank() == bank)
    }
}

/// What one merge did, for logs and the run summary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeSummary {
    pub date: NaiveDate,
    pub inserted: usize,
    pub replaced: usize,
    pub unchanged: usize,
    /// Days kept after truncation
    pub days_retained: usize,
    /// Oldest days dropped by the retention window
    pub days_dropped: usize,
}

impl fmt::Display for MergeSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} new, {} replaced, {} unchanged ({} days kept",
            self.date, self.inserted, self.replaced, self.unchanged, self.days_retained
        )?;
        if self.days_dropped > 0 {
            write!(f, ", {} dropped", self.days_dropped)?;
        }
        f.write_str(")")
    }
}

impl HistoryDataset {
    pub fn entry(&self, date: NaiveDate) -> Option<&DailyEntry> {
        self.historical_data.iter().find(|e| e.date == date)
    }

    /// Folds `observations` into the entry for `date`, then normalizes.
    pub fn merge(
        &mut self,
        date: NaiveDate,
        observations: &[RateObservation],
        retention: usize,
    ) -> MergeSummary {
        let idx = match self.historical_data.iter().position(|e| e.date == date) {
            Some(i) => i,
            None => {
                self.historical_data.push(DailyEntry::new(date));
                self.historical_data.len() - 1
            }
        };

        let mut summary = MergeSummary {
            date,
            inserted: 0,
            replaced: 0,
            unchanged: 0,
            days_retained: 0,
            days_dropped: 0,
        };

        let entry = &mut self.historical_data[idx];
        for obs in observations {
            match entry.upsert(obs.clone()) {
                Upsert::Inserted => summary.inserted += 1,
                Upsert::Replaced => summary.replaced += 1,
                Upsert::Unchanged => summary.unchanged += 1,
            }
        }

        summary.days_dropped = self.normalize(retention);
        summary.days_retained = self.historical_data.len();
        summary
    }

    /// Restores the invariants on any input, including hand-edited files.
    ///
    /// Duplicate dates are folded in document order, so for a bank present
    /// in several copies of a day the last occurrence wins. Returns the
    /// number of days dropped by `retention`.
    pub fn normalize(&mut self, retention: usize) -> usize {
        let mut by_date: BTreeMap<NaiveDate, DailyEntry> = BTreeMap::new();

        for entry in self.historical_data.drain(..) {
            let day = by_date
                .entry(entry.date)
                .or_insert_with(|| DailyEntry::new(entry.date));
            for obs in entry.rates {
                day.upsert(obs);
            }
        }

        self.historical_data = by_date.into_values().rev().collect();

        let dropped = self.historical_data.len().saturating_sub(retention);
        self.historical_data.truncate(retention);
        dropped
    }
}
