// Copyright 2024-2025 Golem Cloud
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::ops::{Add, AddAssign, Sub};

pub const RESOURCE_UNIT_SCALING: i64 = 1024;

pub const CPU_RESOURCE: &str = "CPU";
pub const GPU_RESOURCE: &str = "GPU";
pub const MEMORY_RESOURCE: &str = "memory";

/// Resource quantity in 1/1024 units. Quantities are compared and stored in
/// fixed point so that equality survives serialization; conversion from a
/// float rounds half-up because float multiplication can land just below the
/// intended whole number.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct FixedPoint(i64);

impl FixedPoint {
    pub const ZERO: FixedPoint = FixedPoint(0);

    pub fn from_units(units: i64) -> Self {
        FixedPoint(units * RESOURCE_UNIT_SCALING)
    }

    pub fn from_f64(value: f64) -> Self {
        FixedPoint((value * RESOURCE_UNIT_SCALING as f64 + 0.5).floor() as i64)
    }

    pub fn to_f64(self) -> f64 {
        self.0 as f64 / RESOURCE_UNIT_SCALING as f64
    }

    pub fn raw(self) -> i64 {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn is_negative(self) -> bool {
        self.0 < 0
    }
}

impl Add for FixedPoint {
    type Output = FixedPoint;

    fn add(self, rhs: FixedPoint) -> FixedPoint {
        FixedPoint(self.0 + rhs.0)
    }
}

impl AddAssign for FixedPoint {
    fn add_assign(&mut self, rhs: FixedPoint) {
        self.0 += rhs.0;
    }
}

impl Sub for FixedPoint {
    type Output = FixedPoint;

    fn sub(self, rhs: FixedPoint) -> FixedPoint {
        FixedPoint(self.0 - rhs.0)
    }
}

impl Display for FixedPoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_f64())
    }
}

/// A mapping from resource name to a non-negative quantity. Zero entries are
/// dropped on insertion so that two sets describing the same demand compare
/// equal. The map is ordered to keep hashing and serialization stable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct ResourceSet(BTreeMap<String, FixedPoint>);

impl ResourceSet {
    pub fn new() -> Self {
        ResourceSet(BTreeMap::new())
    }

    pub fn from_units(entries: &[(&str, i64)]) -> Self {
        let mut set = ResourceSet::new();
        for (name, units) in entries {
            set.set(name, FixedPoint::from_units(*units));
        }
        set
    }

    pub fn set(&mut self, name: &str, quantity: FixedPoint) {
        if quantity.is_zero() {
            self.0.remove(name);
        } else {
            self.0.insert(name.to_string(), quantity);
        }
    }

    pub fn get(&self, name: &str) -> FixedPoint {
        self.0.get(name).copied().unwrap_or(FixedPoint::ZERO)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, FixedPoint)> {
        self.0.iter().map(|(name, quantity)| (name.as_str(), *quantity))
    }

    /// True when `other` can cover every quantity demanded by `self`.
    pub fn is_subset_of(&self, other: &ResourceSet) -> bool {
        self.0
            .iter()
            .all(|(name, quantity)| other.get(name) >= *quantity)
    }

    pub fn add(&self, other: &ResourceSet) -> ResourceSet {
        let mut result = self.clone();
        for (name, quantity) in &other.0 {
            let sum = result.get(name) + *quantity;
            result.set(name, sum);
        }
        result
    }

    /// Per-name difference. Panics if any entry would go negative; callers
    /// must have established `other.is_subset_of(self)` first.
    pub fn subtract_strict(&self, other: &ResourceSet) -> ResourceSet {
        let mut result = self.clone();
        for (name, quantity) in &other.0 {
            let difference = result.get(name) - *quantity;
            if difference.is_negative() {
                panic!(
                    "resource accounting went negative for '{name}': {} - {}",
                    result.get(name),
                    quantity
                );
            }
            result.set(name, difference);
        }
        result
    }

    /// Per-name sum, clamped entry-wise by `ceiling`. Used when returning
    /// resources after a node loss may have already reset the books.
    pub fn add_clamped(&self, other: &ResourceSet, ceiling: &ResourceSet) -> ResourceSet {
        let mut result = self.clone();
        for (name, quantity) in &other.0 {
            let sum = result.get(name) + *quantity;
            let cap = ceiling.get(name);
            result.set(name, if sum > cap { cap } else { sum });
        }
        result
    }
}

impl Display for ResourceSet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{")?;
        for (i, (name, quantity)) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{name}: {quantity}")?;
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    #[test]
    fn fixed_point_rounds_half_up() {
        assert_eq!(FixedPoint::from_f64(1.0), FixedPoint::from_units(1));
        // 0.3 * 1024 = 307.2 which must round to 307, not truncate past it
        assert_eq!(FixedPoint::from_f64(0.3).raw(), 307);
        assert_eq!(FixedPoint::from_f64(0.29999999999).raw(), 307);
    }

    #[test]
    fn subset_checks_cover_missing_names() {
        let demand = ResourceSet::from_units(&[(CPU_RESOURCE, 1)]);
        let empty = ResourceSet::new();
        assert!(!demand.is_subset_of(&empty));
        assert!(empty.is_subset_of(&demand));
    }

    #[test]
    fn add_and_subtract_are_inverse() {
        let a = ResourceSet::from_units(&[(CPU_RESOURCE, 4), (GPU_RESOURCE, 1)]);
        let b = ResourceSet::from_units(&[(CPU_RESOURCE, 2)]);
        let sum = a.add(&b);
        assert_eq!(sum.get(CPU_RESOURCE), FixedPoint::from_units(6));
        assert_eq!(sum.subtract_strict(&b), a);
    }

    #[test]
    fn strict_subtract_panics_on_negative() {
        let a = ResourceSet::from_units(&[(CPU_RESOURCE, 1)]);
        let b = ResourceSet::from_units(&[(CPU_RESOURCE, 2)]);
        let result = std::panic::catch_unwind(|| a.subtract_strict(&b));
        assert!(result.is_err());
    }

    #[test]
    fn release_clamps_at_static_capacity() {
        let available = ResourceSet::from_units(&[(CPU_RESOURCE, 3)]);
        let returned = ResourceSet::from_units(&[(CPU_RESOURCE, 2)]);
        let ceiling = ResourceSet::from_units(&[(CPU_RESOURCE, 4)]);
        let result = available.add_clamped(&returned, &ceiling);
        assert_eq!(result.get(CPU_RESOURCE), FixedPoint::from_units(4));
    }

    #[test]
    fn zero_quantities_normalize_away() {
        let mut set = ResourceSet::from_units(&[(CPU_RESOURCE, 1)]);
        set.set(CPU_RESOURCE, FixedPoint::ZERO);
        assert_eq!(set, ResourceSet::new());
    }
}
