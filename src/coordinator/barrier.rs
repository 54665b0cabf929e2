//! Countdown latch with a deadline, used for the READY and CASE_RESULT
//! barriers. The coordinator's control loop feeds arrivals in and races the
//! deadline itself; the latch only keeps score.

use crate::error::FailureKind;
use std::collections::{BTreeSet, HashMap};
use tokio::time::Instant;

/// How one expected worker answered.
#[derive(Debug, Clone, PartialEq)]
pub enum Arrival<T> {
    Arrived(T),
    Failed { kind: FailureKind, detail: String },
}

#[derive(Debug)]
pub struct Latch<T> {
    expected: BTreeSet<String>,
    arrivals: HashMap<String, (usize, Arrival<T>)>,
    deadline: Instant,
}

impl<T> Latch<T> {
    pub fn new(expected: impl IntoIterator<Item = String>, deadline: Instant) -> Self {
        Self {
            expected: expected.into_iter().collect(),
            arrivals: HashMap::new(),
            deadline,
        }
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Count a worker down. Only the first answer of an expected worker
    /// counts; returns whether this one did.
    pub fn arrive(&mut self, worker_id: &str, arrival: Arrival<T>) -> bool {
        if !self.expected.contains(worker_id) || self.arrivals.contains_key(worker_id) {
            return false;
        }
        let sequence = self.arrivals.len();
        self.arrivals
            .insert(worker_id.to_string(), (sequence, arrival));
        true
    }

    pub fn succeed(&mut self, worker_id: &str, value: T) -> bool {
        self.arrive(worker_id, Arrival::Arrived(value))
    }

    pub fn fail(&mut self, worker_id: &str, kind: FailureKind, detail: impl Into<String>) -> bool {
        self.arrive(
            worker_id,
            Arrival::Failed {
                kind,
                detail: detail.into(),
            },
        )
    }

    pub fn is_complete(&self) -> bool {
        self.arrivals.len() == self.expected.len()
    }

    /// Expected workers that have not answered
    pub fn missing(&self) -> Vec<String> {
        self.expected
            .iter()
            .filter(|id| !self.arrivals.contains_key(*id))
            .cloned()
            .collect()
    }

    /// Settle the latch: every missing worker becomes a `CaseTimeout`.
    pub fn close(mut self, detail: &str) -> LatchOutcome<T> {
        for id in self.missing() {
            self.fail(&id, FailureKind::CaseTimeout, detail);
        }
        LatchOutcome {
            arrivals: self.arrivals,
        }
    }
}

/// Answers of a settled latch.
#[derive(Debug)]
pub struct LatchOutcome<T> {
    arrivals: HashMap<String, (usize, Arrival<T>)>,
}

impl<T> LatchOutcome<T> {
    pub fn get(&self, worker_id: &str) -> Option<&Arrival<T>> {
        self.arrivals.get(worker_id).map(|(_, arrival)| arrival)
    }

    pub fn value(&self, worker_id: &str) -> Option<&T> {
        match self.get(worker_id) {
            Some(Arrival::Arrived(value)) => Some(value),
            _ => None,
        }
    }

    /// The earliest failure among `members`, if any
    pub fn first_failure<'a>(
        &self,
        members: impl IntoIterator<Item = &'a str>,
    ) -> Option<(FailureKind, String)> {
        members
            .into_iter()
            .filter_map(|id| match self.arrivals.get(id) {
                Some((sequence, Arrival::Failed { kind, detail })) => {
                    Some((*sequence, *kind, format!("{}: {}", id, detail)))
                }
                _ => None,
            })
            .min_by_key(|(sequence, _, _)| *sequence)
            .map(|(_, kind, detail)| (kind, detail))
    }
}
