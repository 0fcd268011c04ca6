//! Keyword-based priority classification for plan entries.

use crate::plan::PlanEntry;
use crate::task::Priority;
use std::collections::HashMap;

struct Band {
    name: &'static str,
    keywords: &'static [&'static str],
    priority: Priority,
}

const BANDS: &[Band] = &[
    Band {
        name: "critical",
        keywords: &["main", "core", "config", "__init__"],
        priority: Priority::CRITICAL,
    },
    Band {
        name: "high",
        keywords: &["model", "schema", "database", "auth"],
        priority: Priority::HIGH,
    },
    Band {
        name: "normal",
        keywords: &["service", "api", "route", "handler"],
        priority: Priority::NORMAL,
    },
    Band {
        name: "low",
        keywords: &["test", "doc", "example"],
        priority: Priority::LOW,
    },
];

const UNCLASSIFIED_BAND: &str = "unclassified";

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct PriorityStats {
    pub band_counts: HashMap<String, usize>,
}

/// Classifies plan entries into a priority band by matching file-path and
/// title tokens against ordered keyword bands; first match wins.
pub struct PriorityAssigner;

impl PriorityAssigner {
    pub fn new() -> Self {
        Self
    }

    pub fn classify(&self, entry: &PlanEntry) -> Priority {
        self.classify_with_band(entry).0
    }

    fn classify_with_band(&self, entry: &PlanEntry) -> (Priority, &'static str) {
        let haystack = format!("{} {}", entry.target_file_path, entry.title).to_lowercase();
        for band in BANDS {
            if band.keywords.iter().any(|kw| haystack.contains(kw)) {
                return (band.priority, band.name);
            }
        }
        (Priority::NORMAL, UNCLASSIFIED_BAND)
    }

    /// Stable sort of `entries` by assigned priority (ascending, i.e.
    /// highest priority first), alongside per-band counts.
    pub fn sort<'a>(&self, entries: &'a [PlanEntry]) -> (Vec<&'a PlanEntry>, PriorityStats) {
        let mut scored: Vec<(&PlanEntry, Priority, &'static str)> = entries
            .iter()
            .map(|e| {
                let (priority, band) = self.classify_with_band(e);
                (e, priority, band)
            })
            .collect();

        scored.sort_by_key(|(_, priority, _)| *priority);

        let mut band_counts = HashMap::new();
        for (_, _, band) in &scored {
            *band_counts.entry(band.to_string()).or_insert(0) += 1;
        }

        (scored.into_iter().map(|(e, _, _)| e).collect(), PriorityStats { band_counts })
    }
}

impl Default for PriorityAssigner {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_critical_band_matches_main() {
        let assigner = PriorityAssigner::new();
        let entry = PlanEntry::new("a", "entry point", "src/main.rs");
        assert_eq!(assigner.classify(&entry), Priority::CRITICAL);
    }

    #[test]
    fn test_high_band_matches_auth() {
        let assigner = PriorityAssigner::new();
        let entry = PlanEntry::new("a", "auth middleware", "src/auth.rs");
        assert_eq!(assigner.classify(&entry), Priority::HIGH);
    }

    #[test]
    fn test_low_band_matches_test_files() {
        let assigner = PriorityAssigner::new();
        let entry = PlanEntry::new("a", "t", "tests/test_foo.rs");
        assert_eq!(assigner.classify(&entry), Priority::LOW);
    }

    #[test]
    fn test_unclassified_defaults_to_normal() {
        let assigner = PriorityAssigner::new();
        let entry = PlanEntry::new("a", "widget", "src/widget.rs");
        assert_eq!(assigner.classify(&entry), Priority::NORMAL);
    }

    #[test]
    fn test_first_matching_band_wins() {
        let assigner = PriorityAssigner::new();
        // contains both "main" (critical) and "test" (low); critical is
        // ordered first among the bands.
        let entry = PlanEntry::new("a", "t", "main_test.rs");
        assert_eq!(assigner.classify(&entry), Priority::CRITICAL);
    }

    #[test]
    fn test_sort_orders_by_priority_and_counts_bands() {
        let assigner = PriorityAssigner::new();
        let entries = vec![
            PlanEntry::new("a", "t", "tests/test_foo.rs"),
            PlanEntry::new("b", "t", "src/main.rs"),
            PlanEntry::new("c", "t", "src/widget.rs"),
        ];
        let (sorted, stats) = assigner.sort(&entries);
        assert_eq!(sorted[0].id, "b");
        assert_eq!(stats.band_counts.get("critical"), Some(&1));
        assert_eq!(stats.band_counts.get("low"), Some(&1));
        assert_eq!(stats.band_counts.get("unclassified"), Some(&1));
    }
}
