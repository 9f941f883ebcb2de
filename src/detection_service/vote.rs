//! Majority-vote debounce over the trailing detection history.
//!
//! A single defect frame never raises an alert on its own; the vote
//! requires `threshold` defect classifications among the most recent
//! `window` samples, which absorbs one-off misclassifications.

use crate::models::DetectionSample;
use std::collections::VecDeque;

/// Whether the trailing window carries enough defect votes
pub fn passed_majority_vote(
    history: &VecDeque<DetectionSample>,
    window: usize,
    threshold: usize,
    defect_label: &str,
) -> bool {
    let votes = history
        .iter()
        .rev()
        .take(window)
        .filter(|sample| sample.label == defect_label)
        .count();
    votes >= threshold
}
