//! Full-state reports posted to the virtual sink.

use serde::{Deserialize, Serialize};

use crate::usage::Category;

/// Maximum number of simultaneously held codes one report carries.
pub const MAX_REPORT_KEYS: usize = 32;

/// The complete set of held codes for one category.
///
/// The sink protocol is level-based: every report replaces the previous one
/// for its category, so a report is always a full snapshot, never a delta.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    pub category: Category,
    /// Held usage codes in ascending order.
    pub keys: Vec<u32>,
}

impl Report {
    pub fn new(category: Category, keys: impl IntoIterator<Item = u32>) -> Self {
        let mut keys: Vec<u32> = keys.into_iter().collect();
        keys.sort_unstable();
        keys.dedup();
        Self { category, keys }
    }

    /// An all-keys-released report.
    pub fn empty(category: Category) -> Self {
        Self {
            category,
            keys: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn contains(&self, code: u32) -> bool {
        self.keys.binary_search(&code).is_ok()
    }
}

/// HID country code used when initializing the virtual keyboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CountryCode(pub u8);

impl CountryCode {
    pub const NOT_SUPPORTED: Self = Self(0);
    pub const US: Self = Self(33);
}

impl Default for CountryCode {
    fn default() -> Self {
        Self::US
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_keys_are_sorted_and_unique() {
        let report = Report::new(Category::Keyboard, [6, 4, 6, 5]);
        assert_eq!(report.keys, vec![4, 5, 6]);
        assert!(report.contains(5));
        assert!(!report.contains(7));
    }

    #[test]
    fn empty_report() {
        let report = Report::empty(Category::Consumer);
        assert!(report.is_empty());
        assert_eq!(report.category, Category::Consumer);
    }

    #[test]
    fn country_code_serializes_as_number() {
        let json = serde_json::to_string(&CountryCode::US).unwrap();
        assert_eq!(json, "33");
    }
}
