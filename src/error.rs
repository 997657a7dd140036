use crate::id::ID;
use crate::types::DocType;
use crate::DocId;

/// Errors surfaced to embedders of `blockmesh`. Only the "Integrity" kind from spec §7 is
/// represented here: conflicts, cycles and reassignment are resolved/ignored in place and only
/// logged (see [crate::refs] and [crate::doc::Doc::set_guid]), matching the source's literal
/// "log and continue" behavior rather than surfacing them as errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Attempted to wrap a root [crate::Doc] in a `DocRef` (spec invariant I3).
    #[error("cannot create a reference to root doc `{0}`")]
    RootRef(DocId),

    /// Attempted to wrap a non-root type of a doc in a `DocRef`; only a doc's root type may be
    /// referenced, since a `DocRef` always targets a whole doc, never a nested collection.
    #[error("cannot create a reference to a non-root type")]
    ChildTypeRef,

    /// A `DocRef`/clone operation needed a doc that is not registered with this workspace.
    #[error("doc `{0}` was not found in this workspace")]
    DocNotFound(DocId),

    /// A doc id was reused with a doc type different from the one it was first created with.
    #[error("doc `{id}` already exists with type {existing:?}, cannot recreate as {requested:?}")]
    TypeMismatch {
        id: DocId,
        existing: DocType,
        requested: DocType,
    },

    /// The target item referenced by an ID could not be found in its doc's block store.
    #[error("no block found for id {0}")]
    BlockNotFound(ID),

    /// A `DocRef`/`DocUnref` was attempted against a doc that isn't registered with any
    /// [crate::Workspace] — cross-doc embedding only makes sense inside one.
    #[error("doc references require the doc to belong to a workspace")]
    RequiresWorkspace,

    #[error(transparent)]
    Encoding(#[from] lib0::error::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
