//! Candidate selection for job inputs.
//!
//! The store fetches, per input, the enabled candidate versions (newest
//! first) and, per `passed` job, which successful builds emitted which
//! versions. This module then picks the lexicographically-latest tuple in
//! which every shared `passed` job has a single successful build that
//! emitted all of the implicated versions.

use crucible_core::ids::{BuildId, VersionedResourceId};
use std::collections::{BTreeSet, HashMap};

pub struct InputCandidates {
    pub name: String,
    /// Enabled candidate versions, sorted by descending check order.
    pub candidates: Vec<Candidate>,
    pub passed: Vec<PassedJobOutputs>,
}

#[derive(Debug, Clone, Copy)]
pub struct Candidate {
    pub id: VersionedResourceId,
    pub check_order: i64,
}

/// For one `passed` job: which successful builds emitted which versions.
pub struct PassedJobOutputs {
    pub job: String,
    pub builds_by_version: HashMap<VersionedResourceId, BTreeSet<BuildId>>,
}

/// Picks one version per input, or `None` when no consistent tuple exists.
pub fn resolve(inputs: &[InputCandidates]) -> Option<Vec<VersionedResourceId>> {
    // A candidate not emitted by every passed job can never participate.
    let viable: Vec<Vec<&Candidate>> = inputs
        .iter()
        .map(|input| {
            input
                .candidates
                .iter()
                .filter(|c| {
                    input
                        .passed
                        .iter()
                        .all(|p| p.builds_by_version.contains_key(&c.id))
                })
                .collect()
        })
        .collect();

    if viable.iter().any(|c| c.is_empty()) {
        return None;
    }

    let mut chosen = Vec::with_capacity(inputs.len());
    let mut job_builds: HashMap<&str, BTreeSet<BuildId>> = HashMap::new();
    if descend(inputs, &viable, 0, &mut chosen, &mut job_builds) {
        Some(chosen)
    } else {
        None
    }
}

// Candidates are walked newest-first per input, earlier inputs most
// significant, so the first full assignment is the lexicographic maximum.
fn descend<'a>(
    inputs: &'a [InputCandidates],
    viable: &[Vec<&Candidate>],
    idx: usize,
    chosen: &mut Vec<VersionedResourceId>,
    job_builds: &mut HashMap<&'a str, BTreeSet<BuildId>>,
) -> bool {
    if idx == inputs.len() {
        return true;
    }

    'candidates: for candidate in &viable[idx] {
        let mut narrowed: Vec<(&str, Option<BTreeSet<BuildId>>)> = Vec::new();

        for passed in &inputs[idx].passed {
            let emitted = &passed.builds_by_version[&candidate.id];
            let job = passed.job.as_str();

            let next = match job_builds.get(job) {
                // Another input already constrained this job: the chosen
                // versions must share a common successful build.
                Some(existing) => {
                    let common: BTreeSet<BuildId> =
                        existing.intersection(emitted).copied().collect();
                    if common.is_empty() {
                        continue 'candidates;
                    }
                    common
                }
                None => emitted.clone(),
            };

            narrowed.push((job, job_builds.insert(job, next)));
        }

        chosen.push(candidate.id);
        if descend(inputs, viable, idx + 1, chosen, job_builds) {
            return true;
        }
        chosen.pop();

        for (job, previous) in narrowed.into_iter().rev() {
            match previous {
                Some(set) => {
                    job_builds.insert(job, set);
                }
                None => {
                    job_builds.remove(job);
                }
            }
        }
    }

    false
}
