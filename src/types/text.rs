use crate::types::{BranchPtr, DocType, SharedRef};
use std::fmt::{Debug, Formatter};

/// A text shared type (spec.md §2 component 5: "concrete Text").
///
/// String content is stored split across possibly many [crate::Item]s (the base sequence-CRDT's
/// job, out of scope per spec.md §1); `TextRef::to_string` walks the chain in order, skipping
/// tombstones, concatenating `String` content and ignoring `Format` markers.
#[derive(Clone, Copy)]
pub struct TextRef(BranchPtr);

impl TextRef {
    pub fn len(&self) -> u32 {
        self.0.len
    }

    pub fn is_empty(&self) -> bool {
        self.0.len == 0
    }

    pub fn to_string(&self) -> String {
        use crate::block::ItemContent;
        let mut out = String::new();
        let mut current = self.0.start;
        while let Some(item) = current {
            if !item.is_deleted() {
                if let ItemContent::String(s) = &item.content {
                    out.push_str(s.as_str());
                }
            }
            current = item.right;
        }
        out
    }

    pub fn branch(&self) -> BranchPtr {
        self.0
    }
}

impl From<BranchPtr> for TextRef {
    fn from(branch: BranchPtr) -> Self {
        debug_assert!(matches!(branch.type_ref, DocType::Text));
        TextRef(branch)
    }
}

impl SharedRef for TextRef {
    fn branch(&self) -> BranchPtr {
        self.0
    }
}

impl Debug for TextRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "TextRef({:?})", self.to_string())
    }
}
