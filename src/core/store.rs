//! Latest value per register

use chrono::{DateTime, Local};
use serde::Serialize;

/// Last known value of one register
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct MeterValue {
    /// Decoded reading, meaningful only when `valid`
    pub magnitude: f64,
    /// Set once a verified response has been stored
    pub valid: bool,
    /// When the value was stored
    pub updated_at: Option<DateTime<Local>>,
}

impl MeterValue {
    /// Value for publishing: NaN stands in for "never read"
    pub fn or_nan(&self) -> f64 {
        if self.valid {
            self.magnitude
        } else {
            f64::NAN
        }
    }
}

/// One `MeterValue` per catalog index
#[derive(Debug, Clone)]
pub struct ResultStore {
    values: Vec<MeterValue>,
}

impl ResultStore {
    /// Store with `len` invalid entries
    pub fn new(len: usize) -> Self {
        Self {
            values: vec![MeterValue::default(); len],
        }
    }

    /// Record a verified reading
    ///
    /// Indexes outside the catalog are ignored.
    pub fn set(&mut self, index: usize, magnitude: f64) {
        if let Some(slot) = self.values.get_mut(index) {
            *slot = MeterValue {
                magnitude,
                valid: true,
                updated_at: Some(Local::now()),
            };
        }
    }

    /// Entry at `index`
    pub fn get(&self, index: usize) -> Option<&MeterValue> {
        self.values.get(index)
    }

    /// Number of entries that hold a verified value
    pub fn valid_count(&self) -> usize {
        self.values.iter().filter(|v| v.valid).count()
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True for a zero-sized catalog
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_invalid() {
        let store = ResultStore::new(3);
        assert_eq!(store.valid_count(), 0);
        assert!(store.get(0).unwrap().or_nan().is_nan());
    }

    #[test]
    fn test_set_and_out_of_range() {
        let mut store = ResultStore::new(2);
        store.set(1, 230.5);
        store.set(5, 1.0);
        assert_eq!(store.valid_count(), 1);
        assert_eq!(store.get(1).unwrap().or_nan(), 230.5);
        assert!(store.get(1).unwrap().updated_at.is_some());
    }
}
