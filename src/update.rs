//! Decoded form of an `updateV2` payload (spec.md §6) and the bookkeeping a [crate::Workspace]
//! needs to accept updates that arrive out of causal order (SPEC_FULL.md §3: supplemented
//! connective tissue for `apply_update_v2`).

use crate::block::Item;
use crate::id_set::DeleteSet;

/// A fully decoded update for one doc: every `Item` it carries (still unresolved against any
/// particular doc's `Branch` — see [crate::block::TypePtr::Named]) plus the trailing delete set.
#[derive(Debug, Default)]
pub struct Update {
    pub items: Vec<Item>,
    pub delete_set: DeleteSet,
}

impl Update {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty() && self.delete_set.is_empty()
    }
}

/// Items of an [Update] that couldn't be integrated yet because their causal predecessor
/// (`origin_left`) hasn't been observed locally, or because the doc they target doesn't exist in
/// this workspace yet (spec.md §4.4 `get_or_create_block`). Kept on [crate::Workspace::pending],
/// keyed by the doc id the update is waiting on, modeled on `yrs::Store::pending`.
#[derive(Debug, Default)]
pub struct PendingDocUpdate {
    pub items: Vec<Item>,
}

impl PendingDocUpdate {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_update_reports_empty() {
        let u = Update::default();
        assert!(u.is_empty());
    }
}
