use crate::compiled::DelayLookup;
use crate::error::{SimError, SimResult};
use std::cell::Cell;
use std::collections::VecDeque;
use tracing::warn;

/// Accepted states in time order, for `delay(x, lag)` lookups.
///
/// Rows with equal times are allowed (an event applied at `t` appends a
/// second row at `t`); lookups at such a time see the last one.
#[derive(Debug, Clone, Default)]
pub struct History {
    times: VecDeque<f64>,
    rows: VecDeque<Vec<f64>>,
    capacity: Option<usize>,
    warned: Cell<bool>,
}

impl History {
    pub fn new(capacity: Option<usize>) -> Self {
        Self {
            capacity,
            ..Self::default()
        }
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    pub fn clear(&mut self) {
        self.times.clear();
        self.rows.clear();
        self.warned.set(false);
    }

    pub fn earliest_time(&self) -> Option<f64> {
        self.times.front().copied()
    }

    pub fn latest_time(&self) -> Option<f64> {
        self.times.back().copied()
    }

    /// Appends a row. Rows older than the latest one are rejected.
    pub fn push(&mut self, time: f64, state: &[f64]) -> SimResult<()> {
        if let Some(latest) = self.latest_time() {
            if time < latest {
                return Err(SimError::Configuration(format!(
                    "history row at t = {time} precedes latest row at t = {latest}"
                )));
            }
        }
        self.times.push_back(time);
        self.rows.push_back(state.to_vec());
        if let Some(capacity) = self.capacity {
            while self.times.len() > capacity.max(2) {
                self.times.pop_front();
                self.rows.pop_front();
            }
        }
        Ok(())
    }

    /// Linearly interpolated value of `variable` at `at`.
    ///
    /// Returns `Ok(None)` when `at` lies beyond the latest row (or nothing is
    /// recorded yet) and `OutOfHistory` when it precedes the earliest row.
    pub fn value_at(&self, variable: usize, at: f64) -> SimResult<Option<f64>> {
        let (Some(earliest), Some(latest)) = (self.earliest_time(), self.latest_time()) else {
            return Ok(None);
        };
        if at < earliest {
            return Err(SimError::OutOfHistory {
                variable,
                requested: at,
                earliest,
            });
        }
        if at > latest {
            return Ok(None);
        }

        // Last row with time <= at.
        let upper = self.times.partition_point(|&t| t <= at);
        let lo = upper - 1;
        if self.times[lo] == at || lo + 1 == self.times.len() {
            return Ok(Some(self.rows[lo][variable]));
        }
        let (t0, t1) = (self.times[lo], self.times[lo + 1]);
        let (v0, v1) = (self.rows[lo][variable], self.rows[lo + 1][variable]);
        Ok(Some(v0 + (v1 - v0) * (at - t0) / (t1 - t0)))
    }

    fn earliest_value(&self, variable: usize) -> Option<f64> {
        self.rows.front().map(|row| row[variable])
    }
}

impl DelayLookup for History {
    fn lookup(&self, variable: usize, at: f64, now: f64, current: f64) -> f64 {
        match self.value_at(variable, at) {
            Ok(Some(value)) => value,
            Ok(None) => match (self.latest_time(), self.rows.back()) {
                (Some(latest), Some(row)) if now > latest => {
                    let v0 = row[variable];
                    v0 + (current - v0) * (at - latest) / (now - latest)
                }
                _ => current,
            },
            Err(err) => {
                if !self.warned.replace(true) {
                    warn!(%err, "delay lookup before recorded history; using earliest value");
                }
                self.earliest_value(variable).unwrap_or(current)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::History;
    use crate::compiled::DelayLookup;
    use crate::error::SimError;
    use approx::assert_relative_eq;

    fn filled() -> History {
        let mut history = History::new(None);
        history.push(0.0, &[0.0, 10.0]).unwrap();
        history.push(1.0, &[2.0, 20.0]).unwrap();
        history.push(2.0, &[4.0, 30.0]).unwrap();
        history
    }

    #[test]
    fn interpolates_between_rows() {
        let history = filled();
        assert_relative_eq!(history.value_at(0, 0.5).unwrap().unwrap(), 1.0);
        assert_relative_eq!(history.value_at(1, 1.25).unwrap().unwrap(), 22.5);
        assert_eq!(history.value_at(0, 2.0).unwrap(), Some(4.0));
    }

    #[test]
    fn equal_time_rows_resolve_to_the_last() {
        let mut history = filled();
        history.push(2.0, &[-1.0, 0.0]).unwrap();
        assert_eq!(history.value_at(0, 2.0).unwrap(), Some(-1.0));
    }

    #[test]
    fn out_of_range_lookups() {
        let history = filled();
        assert!(matches!(
            history.value_at(0, -0.5),
            Err(SimError::OutOfHistory { earliest, .. }) if earliest == 0.0
        ));
        assert_eq!(history.value_at(0, 3.0).unwrap(), None);

        // Before: clamp to the earliest row. After: head for the current value.
        assert_eq!(history.lookup(1, -5.0, 0.0, 99.0), 10.0);
        assert_relative_eq!(history.lookup(0, 3.0, 4.0, 8.0), 6.0);
    }

    #[test]
    fn rejects_rows_going_backwards() {
        let mut history = filled();
        assert!(history.push(1.5, &[0.0, 0.0]).is_err());
    }

    #[test]
    fn capacity_drops_oldest_rows() {
        let mut history = History::new(Some(2));
        for i in 0..5 {
            history.push(i as f64, &[i as f64]).unwrap();
        }
        assert_eq!(history.len(), 2);
        assert_eq!(history.earliest_time(), Some(3.0));
    }
}
