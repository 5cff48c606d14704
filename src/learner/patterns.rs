//! In-memory pattern aggregates, one lock per pattern row.
//!
//! Each tag owns an independent cell guarded by its own mutex, so two
//! interactions with disjoint tags never contend. Counters are integers;
//! the success rate is derived at snapshot time, which makes the running
//! mean exact at any number of updates.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use crate::types::{Pattern, StrategySummary};

/// How many sample queries a pattern keeps.
const EXAMPLE_LIMIT: usize = 3;

/// Occurrence count at which confidence reaches half of its ceiling.
const CONFIDENCE_PIVOT: f64 = 5.0;

/// Confidence in a pattern: grows with evidence, discounted when the
/// outcome is a coin flip. Stays within [0, 1] and never decreases as
/// occurrences grow for a fixed success rate.
pub fn confidence_for(occurrences: u64, success_rate: f64) -> f64 {
    let n = occurrences as f64;
    let volume = n / (n + CONFIDENCE_PIVOT);
    let decisiveness = 1.0 - success_rate * (1.0 - success_rate);
    volume * decisiveness
}

#[derive(Debug, Default)]
struct PatternCell {
    occurrences: u64,
    successes: u64,
    examples: Vec<String>,
}

impl PatternCell {
    fn snapshot(&self, tag: &str) -> Pattern {
        let success_rate = if self.occurrences == 0 {
            0.0
        } else {
            self.successes as f64 / self.occurrences as f64
        };
        Pattern {
            pattern_type: tag.to_string(),
            description: format!("Recorded outcomes for '{tag}' interactions"),
            occurrences: self.occurrences,
            success_rate,
            examples: self.examples.clone(),
            confidence: confidence_for(self.occurrences, success_rate),
        }
    }
}

/// Pattern aggregates keyed by tag. The outer map lock is held only to
/// find or insert a cell; updates happen under the cell's own mutex.
#[derive(Debug, Default)]
pub struct PatternBook {
    rows: RwLock<HashMap<String, Arc<Mutex<PatternCell>>>>,
}

impl PatternBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Find or insert the cell for a tag, holding the outer lock only
    /// for the lookup.
    fn cell(&self, tag: &str) -> Arc<Mutex<PatternCell>> {
        if let Some(cell) = self
            .rows
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(tag)
        {
            return cell.clone();
        }
        self.rows
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(tag.to_string())
            .or_default()
            .clone()
    }

    /// Fold one outcome into the tag's cell and return the updated
    /// snapshot.
    pub fn apply(&self, tag: &str, success: bool, example: &str) -> Pattern {
        let cell = self.cell(tag);
        let mut cell = cell.lock().unwrap_or_else(|e| e.into_inner());
        cell.occurrences += 1;
        if success {
            cell.successes += 1;
        }
        if !example.is_empty() && cell.examples.len() < EXAMPLE_LIMIT {
            cell.examples.push(example.to_string());
        }
        cell.snapshot(tag)
    }

    pub fn get(&self, tag: &str) -> Option<Pattern> {
        let cell = self
            .rows
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(tag)
            .cloned()?;
        let cell = cell.lock().unwrap_or_else(|e| e.into_inner());
        Some(cell.snapshot(tag))
    }

    /// All patterns, most confident first.
    pub fn all(&self) -> Vec<Pattern> {
        let cells: Vec<(String, Arc<Mutex<PatternCell>>)> = self
            .rows
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(tag, cell)| (tag.clone(), cell.clone()))
            .collect();

        let mut patterns: Vec<Pattern> = cells
            .into_iter()
            .map(|(tag, cell)| {
                let cell = cell.lock().unwrap_or_else(|e| e.into_inner());
                cell.snapshot(&tag)
            })
            .collect();
        patterns.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.pattern_type.cmp(&b.pattern_type))
        });
        patterns
    }

    pub fn len(&self) -> usize {
        self.rows.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Best-performing tags by success rate, ties broken by evidence.
    pub fn top_strategies(&self, limit: usize) -> Vec<StrategySummary> {
        let mut summaries: Vec<StrategySummary> = self
            .all()
            .into_iter()
            .map(|p| StrategySummary {
                pattern_type: p.pattern_type,
                success_rate: p.success_rate,
                occurrences: p.occurrences,
            })
            .collect();
        summaries.sort_by(|a, b| {
            b.success_rate
                .partial_cmp(&a.success_rate)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.occurrences.cmp(&a.occurrences))
                .then_with(|| a.pattern_type.cmp(&b.pattern_type))
        });
        summaries.truncate(limit);
        summaries
    }
}
