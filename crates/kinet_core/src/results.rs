use crate::error::{SimError, SimResult};
use std::collections::HashMap;

pub const TIME_OFF: usize = 0;

/// Sampled trajectories: one row per recorded point, time in the first slot
/// of every row followed by the state in variable order.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultTable {
    ids: Vec<String>,
    offsets: HashMap<String, usize>,
    // one flat allocation, row-major
    data: Vec<f64>,
    step_size: usize,
}

impl ResultTable {
    pub fn new(ids: Vec<String>) -> Self {
        let offsets = ids
            .iter()
            .enumerate()
            .map(|(i, id)| (id.clone(), i + 1))
            .collect();
        Self {
            step_size: ids.len() + 1,
            ids,
            offsets,
            data: Vec::new(),
        }
    }

    pub fn variable_ids(&self) -> &[String] {
        &self.ids
    }

    pub fn len(&self) -> usize {
        self.data.len() / self.step_size
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Appends a row. Times must not decrease; equal times are allowed so a
    /// post-event row can follow the pre-event one.
    pub fn add_row(&mut self, time: f64, state: &[f64]) -> SimResult<()> {
        if state.len() != self.ids.len() {
            return Err(SimError::DimensionMismatch {
                expected: self.ids.len(),
                actual: state.len(),
            });
        }
        if let Some(last) = self.last_time() {
            if time < last {
                return Err(SimError::Configuration(format!(
                    "row at t = {time} precedes the last row at t = {last}"
                )));
            }
        }
        self.data.reserve(self.step_size);
        self.data.push(time);
        self.data.extend_from_slice(state);
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = &[f64]> {
        self.data.chunks_exact(self.step_size)
    }

    pub fn time(&self, row: usize) -> Option<f64> {
        self.data.get(row * self.step_size + TIME_OFF).copied()
    }

    pub fn last_time(&self) -> Option<f64> {
        self.len().checked_sub(1).and_then(|row| self.time(row))
    }

    pub fn times(&self) -> Vec<f64> {
        self.iter().map(|row| row[TIME_OFF]).collect()
    }

    /// State part of row `index`.
    pub fn row(&self, index: usize) -> Option<&[f64]> {
        let start = index * self.step_size;
        self.data.get(start + 1..start + self.step_size)
    }

    pub fn column(&self, id: &str) -> Option<Vec<f64>> {
        let off = *self.offsets.get(id)?;
        Some(self.iter().map(|row| row[off]).collect())
    }

    /// Value of `id` at `time`, linear between the bracketing rows.
    ///
    /// At a recorded time the stored value is returned unchanged (the last of
    /// several rows sharing that time). Outside the recorded range: `None`.
    pub fn value_at(&self, id: &str, time: f64) -> Option<f64> {
        let off = *self.offsets.get(id)?;
        let first = self.time(0)?;
        let last = self.last_time()?;
        if !(first..=last).contains(&time) {
            return None;
        }

        // Rows with time <= `time` come first.
        let (mut lo, mut hi) = (0, self.len());
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.data[mid * self.step_size] <= time {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        let below = lo - 1;
        let base = below * self.step_size;
        let t0 = self.data[base];
        if t0 == time || lo == self.len() {
            return Some(self.data[base + off]);
        }
        let next = lo * self.step_size;
        let (t1, v0, v1) = (self.data[next], self.data[base + off], self.data[next + off]);
        Some(v0 + (v1 - v0) * (time - t0) / (t1 - t0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn table() -> ResultTable {
        let mut table = ResultTable::new(vec!["x".into(), "y".into()]);
        table.add_row(0.0, &[0.0, 1.0]).unwrap();
        table.add_row(0.5, &[1.0, 3.0]).unwrap();
        table.add_row(1.0, &[3.0, 2.0]).unwrap();
        table
    }

    #[test]
    fn columns_and_rows() {
        let table = table();
        assert_eq!(table.len(), 3);
        assert_eq!(table.times(), vec![0.0, 0.5, 1.0]);
        assert_eq!(table.column("y"), Some(vec![1.0, 3.0, 2.0]));
        assert_eq!(table.column("time"), None);
        assert_eq!(table.row(1), Some(&[1.0, 3.0][..]));
        assert_eq!(table.row(3), None);
    }

    #[test]
    fn interpolates_between_rows() {
        let table = table();
        assert_relative_eq!(table.value_at("x", 0.25).unwrap(), 0.5);
        assert_relative_eq!(table.value_at("y", 0.75).unwrap(), 2.5);
        assert_eq!(table.value_at("x", 1.5), None);
        assert_eq!(table.value_at("x", -0.1), None);
    }

    #[test]
    fn recorded_times_round_trip_exactly() {
        let mut table = ResultTable::new(vec!["x".into()]);
        let mut t = 0.0;
        for i in 0..50 {
            table.add_row(t, &[(i as f64 * 0.37).sin()]).unwrap();
            t += 0.1 + 0.013 * i as f64;
        }
        for (row, time) in table.times().into_iter().enumerate() {
            assert_eq!(table.value_at("x", time), Some(table.row(row).unwrap()[0]));
        }
    }

    #[test]
    fn equal_times_resolve_to_the_last_row() {
        let mut table = table();
        table.add_row(1.0, &[10.0, 20.0]).unwrap();
        table.add_row(2.0, &[12.0, 20.0]).unwrap();
        assert_eq!(table.value_at("x", 1.0), Some(10.0));
        assert_relative_eq!(table.value_at("x", 1.5).unwrap(), 11.0);
    }

    #[test]
    fn rejects_bad_rows() {
        let mut table = table();
        assert_eq!(
            table.add_row(2.0, &[1.0]).unwrap_err(),
            SimError::DimensionMismatch {
                expected: 2,
                actual: 1
            }
        );
        assert!(table.add_row(0.5, &[1.0, 1.0]).is_err());
        assert_eq!(table.len(), 3);
    }
}
