//! `blockmesh` — a multi-document collaborative CRDT engine.
//!
//! A [Workspace] owns a set of independently mutable [Doc]s (array, map, text, xml-fragment,
//! xml-element or xml-text CRDTs). Docs can embed one another by reference (`ItemContent::DocRef`)
//! under the constraint that a non-root doc has at most one referrer at a time and referrer chains
//! never cycle; both are enforced by cloning the loser rather than rejecting the operation. See
//! [refs] for the conflict/cycle resolver and [workspace] for the transaction-and-cleanup pipeline
//! that coordinates it all across docs.
//!
//! Mirrors `yrs`'s split between a block store, a polymorphic item content model, typed shared
//! refs over an `AbstractType`-equivalent (`Branch`), and a transaction/observer pipeline — see
//! `DESIGN.md` in the repository root for the full grounding ledger.

pub mod block;
pub mod block_store;
pub mod doc;
pub mod encoding;
pub mod error;
pub mod event;
pub mod id;
pub mod id_set;
pub mod refs;
pub mod transaction;
pub mod types;
pub mod update;
pub mod workspace;

pub use block::{ContentStr, DocRef, DocUnref, Item, ItemContent, ItemFlags, ItemPtr, TypePtr};
pub use block_store::{BlockCell, BlockStore, ClientBlockList, GCRef, SkipRef};
pub use doc::{root_doc_id, Doc, DocCell, DocId, DocOptions};
pub use encoding::{decode_update, encode_state_as_update_v2, encode_update_v2};
pub use error::{Error, Result};
pub use event::{Event, Subscription, UpdateEvent};
pub use id::{ClientID, Clock, StateVector, ID};
pub use id_set::{DeleteSet, IdRange};
pub use transaction::{Origin, TransactionMut};
pub use types::{
    ArrayRef, Branch, BranchPtr, DocType, MapRef, Path, PathSegment, SharedRef, TextRef,
    XmlElementRef, XmlFragmentRef, XmlTextRef,
};
pub use update::{PendingDocUpdate, Update};
pub use workspace::{Workspace, WorkspaceCell, WorkspaceOptions, WorkspaceTransaction};
