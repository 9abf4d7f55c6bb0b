//! Managed labels.
//!
//! The final label set is `(current - managed) + derived`: labels the bot does
//! not own are left alone, labels it owns are exactly the ones the cache
//! implies.

use std::collections::BTreeSet;

use super::Reconciler;
use crate::state_machine::state::{Readiness, StatusState};

/// Labels to add and remove, each sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelDiff {
    pub add: Vec<String>,
    pub remove: Vec<String>,
}

impl LabelDiff {
    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.remove.is_empty()
    }
}

pub fn diff_labels(
    current: &BTreeSet<String>,
    managed: &BTreeSet<String>,
    derived: &BTreeSet<String>,
) -> LabelDiff {
    let desired: BTreeSet<&String> = current
        .iter()
        .filter(|label| !managed.contains(*label))
        .chain(derived.iter())
        .collect();
    LabelDiff {
        add: desired
            .iter()
            .filter(|label| !current.contains(**label))
            .map(|label| (*label).clone())
            .collect(),
        remove: current
            .iter()
            .filter(|label| !desired.contains(label))
            .cloned()
            .collect(),
    }
}

impl Reconciler<'_> {
    /// Labels implied by the cache.
    fn derived_labels(&self) -> BTreeSet<String> {
        let scheme = self.config.labels();
        let mut derived: BTreeSet<String> = self
            .cache
            .signatures
            .iter()
            .filter_map(|(category, signature)| scheme.for_signature(category, signature.status))
            .collect();
        if let Some(label) = &scheme.fully_signed {
            if self.cache.readiness() == Readiness::Approved {
                derived.insert(label.clone());
            }
        }
        if self.cache.is_held() {
            derived.insert(scheme.hold.clone());
        }
        if let Some(run) = &self.cache.tests {
            let label = match run.aggregate_reported {
                Some(StatusState::Success) => &scheme.tests_approved,
                Some(_) => &scheme.tests_rejected,
                None => &scheme.tests_pending,
            };
            derived.insert(label.clone());
        }
        derived.extend(
            self.cache
                .type_labels
                .iter()
                .filter(|label| scheme.is_type_label(label))
                .cloned(),
        );
        derived
    }

    /// Every label the bot owns on this issue, including labels of
    /// categories that were unassigned.
    fn managed_labels(&self) -> BTreeSet<String> {
        let categories: BTreeSet<&String> = self
            .config
            .signature_categories()
            .iter()
            .chain(self.cache.signatures.keys())
            .chain(self.cache.unassigned.iter())
            .collect();
        self.config.labels().managed(categories)
    }

    pub(super) fn label_diff(&self) -> LabelDiff {
        diff_labels(
            &self.snapshot.labels,
            &self.managed_labels(),
            &self.derived_labels(),
        )
    }
}
