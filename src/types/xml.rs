use crate::types::{BranchPtr, DocType, SharedRef};
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

/// An ordered collection of XML nodes without its own tag (spec.md §2 component 5:
/// "concrete XmlFragment").
#[derive(Clone, Copy)]
pub struct XmlFragmentRef(BranchPtr);

impl XmlFragmentRef {
    pub fn len(&self) -> u32 {
        self.0.len
    }

    pub fn branch(&self) -> BranchPtr {
        self.0
    }
}

impl From<BranchPtr> for XmlFragmentRef {
    fn from(branch: BranchPtr) -> Self {
        debug_assert!(matches!(branch.type_ref, DocType::XmlFragment));
        XmlFragmentRef(branch)
    }
}

impl SharedRef for XmlFragmentRef {
    fn branch(&self) -> BranchPtr {
        self.0
    }
}

/// A single tagged XML element, carrying both ordered children and a map of attributes (spec.md
/// §2 component 5: "concrete XmlElement"). The tag name lives on [DocType::XmlElement] rather
/// than on the ref itself, mirroring `yrs::types::TypeRef::XmlElement(name)`.
#[derive(Clone, Copy)]
pub struct XmlElementRef(BranchPtr);

impl XmlElementRef {
    pub fn tag(&self) -> Option<&Arc<str>> {
        match &self.0.type_ref {
            DocType::XmlElement(tag) => Some(tag),
            _ => None,
        }
    }

    pub fn attribute(&self, name: &str) -> Option<&crate::block::ItemContent> {
        let item = self.0.map.get(name)?;
        if item.is_deleted() {
            None
        } else {
            Some(&item.content)
        }
    }

    pub fn branch(&self) -> BranchPtr {
        self.0
    }
}

impl From<BranchPtr> for XmlElementRef {
    fn from(branch: BranchPtr) -> Self {
        debug_assert!(matches!(branch.type_ref, DocType::XmlElement(_)));
        XmlElementRef(branch)
    }
}

impl SharedRef for XmlElementRef {
    fn branch(&self) -> BranchPtr {
        self.0
    }
}

impl Debug for XmlElementRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "<{}>", self.tag().map(|t| t.as_ref()).unwrap_or(""))
    }
}

/// A run of text nested within XML content (spec.md §2 component 5: "concrete XmlText").
#[derive(Clone, Copy)]
pub struct XmlTextRef(BranchPtr);

impl XmlTextRef {
    pub fn to_string(&self) -> String {
        crate::types::TextRef::from(self.0).to_string()
    }

    pub fn branch(&self) -> BranchPtr {
        self.0
    }
}

impl From<BranchPtr> for XmlTextRef {
    fn from(branch: BranchPtr) -> Self {
        debug_assert!(matches!(branch.type_ref, DocType::XmlText));
        XmlTextRef(branch)
    }
}

impl SharedRef for XmlTextRef {
    fn branch(&self) -> BranchPtr {
        self.0
    }
}
