use std::collections::BTreeSet;

use crate::models::config::ConflictPolicy;
use crate::models::recording_type::RecordingType;

/// Pairs of recording types that may not be live at the same time.
///
/// Consulted by the registry before a session is created; a conflict never
/// touches the session that is already running.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConflictTable {
    pairs: BTreeSet<(RecordingType, RecordingType)>,
}

impl ConflictTable {
    /// No conflicts: every type may run next to every other.
    pub fn empty() -> Self {
        Self::default()
    }

    /// A mixed type conflicts with every other type that opens one of its
    /// sources, so one device is never tapped twice.
    pub fn exclusive() -> Self {
        let mut table = Self::empty();
        for mixed in RecordingType::ALL.into_iter().filter(|t| t.is_mixed()) {
            for other in RecordingType::ALL {
                if other != mixed && mixed.sources().iter().any(|&kind| other.uses(kind)) {
                    table.declare(mixed, other);
                }
            }
        }
        table
    }

    pub fn from_policy(policy: ConflictPolicy) -> Self {
        match policy {
            ConflictPolicy::Exclusive => Self::exclusive(),
            ConflictPolicy::SharedTaps => Self::empty(),
        }
    }

    /// Declare `a` and `b` mutually exclusive. Symmetric.
    pub fn declare(&mut self, a: RecordingType, b: RecordingType) {
        self.pairs.insert(ordered(a, b));
    }

    pub fn conflicts(&self, a: RecordingType, b: RecordingType) -> bool {
        self.pairs.contains(&ordered(a, b))
    }

    /// The first of `live` that `requested` may not run next to.
    pub fn first_conflict(
        &self,
        requested: RecordingType,
        live: impl IntoIterator<Item = RecordingType>,
    ) -> Option<RecordingType> {
        live.into_iter().find(|&other| self.conflicts(requested, other))
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

fn ordered(a: RecordingType, b: RecordingType) -> (RecordingType, RecordingType) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}
