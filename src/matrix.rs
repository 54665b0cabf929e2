//! # Test Matrix Generator
//!
//! Turns [`TestMatrixSettings`] into the ordered list of [`TestCase`]s a run
//! executes. The list is the Cartesian product of the option lists, nested
//! outer to inner as pattern, message size, message count, zero-copy, send
//! high-water mark and receive high-water mark. Indices are assigned in that
//! order starting at 0, so identical settings always produce an identical
//! sequence. Resumed runs rely on this to recognise completed cases.

use crate::cli::Pattern;
use crate::config::TestMatrixSettings;
use crate::defaults;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// One point of the test matrix.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TestCase {
    pub index: u64,
    pub pattern: Pattern,
    pub message_size: usize,
    pub message_count: u64,
    pub zero_copy: bool,
    /// 0 = unbounded
    pub send_hwm: usize,
    /// 0 = unbounded
    pub recv_hwm: usize,
}

/// The parameters of a case without its index.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CaseParams {
    pub pattern: Pattern,
    pub message_size: usize,
    pub message_count: u64,
    pub zero_copy: bool,
    pub send_hwm: usize,
    pub recv_hwm: usize,
}

impl TestCase {
    pub fn params(&self) -> CaseParams {
        CaseParams {
            pattern: self.pattern,
            message_size: self.message_size,
            message_count: self.message_count,
            zero_copy: self.zero_copy,
            send_hwm: self.send_hwm,
            recv_hwm: self.recv_hwm,
        }
    }

    /// Deliveries the sender offers per case, counted per receiver for fan-out
    pub fn offered_messages(&self, receivers_per_sender: usize) -> u64 {
        match self.pattern {
            Pattern::WorkQueue => self.message_count,
            Pattern::FanOut => self.message_count * receivers_per_sender as u64,
        }
    }

    pub fn offered_bytes(&self, receivers_per_sender: usize) -> u64 {
        self.offered_messages(receivers_per_sender) * self.message_size as u64
    }
}

impl std::fmt::Display for TestCase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "case {} [{} size={} count={} zero_copy={} send_hwm={} recv_hwm={}]",
            self.index,
            self.pattern,
            self.message_size,
            self.message_count,
            self.zero_copy,
            self.send_hwm,
            self.recv_hwm
        )
    }
}

/// Ordered, restartable sequence of test cases.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TestMatrix {
    cases: Vec<TestCase>,
}

impl TestMatrix {
    /// Expand the settings into the full case list
    pub fn generate(settings: &TestMatrixSettings) -> Self {
        let (patterns, sizes, counts, zero_copy, send_hwm, recv_hwm) = if settings.short {
            (
                vec![Pattern::WorkQueue],
                defaults::SHORT_MESSAGE_SIZES.to_vec(),
                vec![defaults::MESSAGE_COUNT],
                vec![false],
                vec![defaults::HWM],
                vec![defaults::HWM],
            )
        } else {
            (
                settings.patterns.clone(),
                settings.message_sizes.clone(),
                settings.message_counts.clone(),
                settings.zero_copy.clone(),
                settings.send_hwm.clone(),
                settings.recv_hwm.clone(),
            )
        };

        let sizes: Vec<usize> = sizes
            .into_iter()
            .filter(|&size| size <= settings.max_message_size)
            .collect();

        let mut cases = Vec::new();
        for &pattern in &patterns {
            for &message_size in &sizes {
                for &message_count in &counts {
                    for &zero_copy in &zero_copy {
                        for &send_hwm in &send_hwm {
                            for &recv_hwm in &recv_hwm {
                                cases.push(TestCase {
                                    index: cases.len() as u64,
                                    pattern,
                                    message_size,
                                    message_count,
                                    zero_copy,
                                    send_hwm,
                                    recv_hwm,
                                });
                            }
                        }
                    }
                }
            }
        }

        Self { cases }
    }

    pub fn len(&self) -> usize {
        self.cases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TestCase> {
        self.cases.iter()
    }

    pub fn get(&self, index: u64) -> Option<&TestCase> {
        self.cases.get(index as usize)
    }

    /// Cases still to run, skipping those whose parameters already completed.
    /// Indices stay those of the full matrix.
    pub fn remaining<'a>(
        &'a self,
        completed: &'a HashSet<CaseParams>,
    ) -> impl Iterator<Item = &'a TestCase> + 'a {
        self.cases
            .iter()
            .filter(move |case| !completed.contains(&case.params()))
    }
}

impl<'a> IntoIterator for &'a TestMatrix {
    type Item = &'a TestCase;
    type IntoIter = std::slice::Iter<'a, TestCase>;

    fn into_iter(self) -> Self::IntoIter {
        self.cases.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_settings() -> TestMatrixSettings {
        TestMatrixSettings {
            short: false,
            patterns: vec![Pattern::WorkQueue, Pattern::FanOut],
            message_sizes: vec![64, 1024],
            message_counts: vec![10],
            max_message_size: 1024,
            zero_copy: vec![true, false],
            send_hwm: vec![100],
            recv_hwm: vec![0, 10],
        }
    }

    #[test]
    fn test_product_size_and_indices() {
        let matrix = TestMatrix::generate(&small_settings());
        assert_eq!(matrix.len(), 2 * 2 * 2 * 2);
        for (i, case) in matrix.iter().enumerate() {
            assert_eq!(case.index, i as u64);
        }
    }

    #[test]
    fn test_nested_order_is_pattern_outermost_recv_hwm_innermost() {
        let matrix = TestMatrix::generate(&small_settings());
        let cases: Vec<_> = matrix.iter().collect();

        assert_eq!(cases[0].pattern, Pattern::WorkQueue);
        assert_eq!(cases[0].recv_hwm, 0);
        assert_eq!(cases[1].recv_hwm, 10);
        assert!(cases[0].zero_copy);
        assert!(!cases[2].zero_copy);
        assert_eq!(cases[3].message_size, 64);
        assert_eq!(cases[4].message_size, 1024);
        assert_eq!(cases[7].pattern, Pattern::WorkQueue);
        assert_eq!(cases[8].pattern, Pattern::FanOut);
    }

    #[test]
    fn test_generation_is_deterministic() {
        let settings = small_settings();
        assert_eq!(TestMatrix::generate(&settings), TestMatrix::generate(&settings));
    }

    #[test]
    fn test_max_message_size_filter() {
        let mut settings = small_settings();
        settings.max_message_size = 512;
        let matrix = TestMatrix::generate(&settings);
        assert!(matrix.iter().all(|case| case.message_size == 64));
        assert_eq!(matrix.len(), 8);
    }

    #[test]
    fn test_short_mode_literal_subset() {
        let mut settings = small_settings();
        settings.short = true;
        let matrix = TestMatrix::generate(&settings);

        let sizes: Vec<_> = matrix.iter().map(|case| case.message_size).collect();
        assert_eq!(sizes, vec![64, 256]);
        for case in &matrix {
            assert_eq!(case.pattern, Pattern::WorkQueue);
            assert_eq!(case.message_count, 100_001);
            assert!(!case.zero_copy);
            assert_eq!((case.send_hwm, case.recv_hwm), (100, 100));
        }
    }

    #[test]
    fn test_remaining_skips_completed_parameters() {
        let matrix = TestMatrix::generate(&small_settings());
        let completed: HashSet<CaseParams> =
            matrix.iter().take(3).map(|case| case.params()).collect();

        let remaining: Vec<u64> = matrix.remaining(&completed).map(|case| case.index).collect();
        assert_eq!(remaining.first(), Some(&3));
        assert_eq!(remaining.len(), matrix.len() - 3);
    }

    #[test]
    fn test_offered_messages_by_pattern() {
        let matrix = TestMatrix::generate(&small_settings());
        let work_queue = matrix.get(0).unwrap();
        let fan_out = matrix.get(8).unwrap();
        assert_eq!(work_queue.offered_messages(3), 10);
        assert_eq!(fan_out.offered_messages(3), 30);
        assert_eq!(fan_out.offered_bytes(3), 30 * 64);
    }
}
