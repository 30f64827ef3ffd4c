//! Per-field metadata statistics used for selectivity estimates.

use crate::entity::MetaValue;
use std::collections::BTreeSet;

// Distinct-value tracking stops here; beyond it `distinct` is a lower bound.
const DISTINCT_CAP: usize = 4096;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldStats {
    /// Entities carrying the field.
    pub count: usize,
    pub numeric_count: usize,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub distinct: usize,
    seen: BTreeSet<String>,
}

impl FieldStats {
    pub fn observe(&mut self, value: &MetaValue) {
        self.count += 1;
        if let MetaValue::Number(n) = value {
            self.numeric_count += 1;
            self.min = Some(self.min.map_or(*n, |m| m.min(*n)));
            self.max = Some(self.max.map_or(*n, |m| m.max(*n)));
        }
        if self.seen.len() < DISTINCT_CAP {
            let repr = format!("{}:{value}", value.kind());
            if self.seen.insert(repr) {
                self.distinct += 1;
            }
        }
    }

    /// Estimated fraction of `total` entities satisfying `field op value`.
    ///
    /// Numeric ranges assume a uniform distribution between min and max;
    /// equality assumes uniform frequency across distinct values.
    pub fn selectivity(&self, op: &str, value: &MetaValue, total: usize) -> f64 {
        if total == 0 || self.count == 0 {
            return 0.0;
        }
        let present = self.count as f64 / total as f64;
        let distinct = self.distinct.max(1) as f64;

        let fraction = match (op, value) {
            ("==", _) => 1.0 / distinct,
            ("!=", _) => 1.0 - 1.0 / distinct,
            (_, MetaValue::Number(x)) => {
                let (Some(min), Some(max)) = (self.min, self.max) else {
                    return 0.0;
                };
                let numeric = self.numeric_count as f64 / self.count as f64;
                let below = if max > min {
                    ((x - min) / (max - min)).clamp(0.0, 1.0)
                } else if *x >= min {
                    1.0
                } else {
                    0.0
                };
                let range = match op {
                    "<" | "<=" => below,
                    _ => 1.0 - below,
                };
                numeric * range
            }
            _ => 0.5,
        };
        (present * fraction).clamp(0.0, 1.0)
    }
}
