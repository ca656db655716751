//! Content tree model: the canonical head tree, per-session views, cursors
//! and the diff records produced when mutations are replayed.
//!
//! ```text
//! Response --(ProtocolAdapter)--> MutationBatch --> HeadTree (journal)
//!                                                      |
//!                                   replay per session v
//!                                                  SessionView --> FeatureChange
//! ```

pub mod change;
pub mod cursor;
pub mod head;
pub mod ids;
pub mod mutation;
pub mod view;

pub use change::{FeatureChange, ModelChild};
pub use cursor::ModelCursor;
pub use head::{AppliedBatch, ContentNode, HeadTree};
pub use ids::{ContinuationToken, StreamContentId, ROOT_ID};
pub use mutation::{ContentNodeKind, JournalEntry, Mutation, MutationBatch, NewChild, Scope};
pub use view::{SessionView, SharedView, ViewNode, ViewUpdate};
