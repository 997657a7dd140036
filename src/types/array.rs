use crate::block::ItemContent;
use crate::types::{BranchPtr, DocType, SharedRef};
use std::fmt::{Debug, Formatter};

/// A sequence-like shared type (spec.md §2 component 5: "concrete Array").
///
/// Mutation (`push`, `insert`, `remove`) is delegated to [crate::TransactionMut], since every
/// write must be recorded as an [crate::Item] inside the doc's [crate::BlockStore] and is the
/// base-CRDT's job to place (out of scope per spec.md §1); `ArrayRef` itself stays a thin,
/// read-oriented view plus the observer registration surface AbstractType exposes.
#[derive(Clone, Copy)]
pub struct ArrayRef(BranchPtr);

impl ArrayRef {
    pub fn len(&self) -> u32 {
        self.0.len
    }

    pub fn is_empty(&self) -> bool {
        self.0.len == 0
    }

    pub fn get(&self, index: u32) -> Option<&ItemContent> {
        self.0.get_at(index).map(|(c, _)| c)
    }

    pub fn branch(&self) -> BranchPtr {
        self.0
    }
}

impl From<BranchPtr> for ArrayRef {
    fn from(branch: BranchPtr) -> Self {
        debug_assert!(matches!(branch.type_ref, DocType::Array));
        ArrayRef(branch)
    }
}

impl SharedRef for ArrayRef {
    fn branch(&self) -> BranchPtr {
        self.0
    }
}

impl Debug for ArrayRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ArrayRef(len={})", self.len())
    }
}
