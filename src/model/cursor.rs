//! Cursor over a node's children.
//!
//! The cursor keeps only a position. Each call re-reads the backing child
//! list, so children appended while iterating become visible and concurrent
//! structural changes never fail the iteration.

use crate::model::change::ModelChild;
use crate::model::ids::StreamContentId;
use crate::model::view::{read_view, SharedView};

pub struct ModelCursor {
    view: SharedView,
    parent: StreamContentId,
    index: usize,
}

impl ModelCursor {
    pub fn new(view: SharedView, parent: StreamContentId) -> Self {
        Self {
            view,
            parent,
            index: 0,
        }
    }

    pub fn next_item(&mut self) -> Option<ModelChild> {
        let view = read_view(&self.view);
        let child = view.child_at(&self.parent, self.index)?;
        self.index += 1;
        Some(child)
    }

    /// True once the position reaches the current child count
    pub fn is_at_end(&self) -> bool {
        self.index >= read_view(&self.view).children(&self.parent).len()
    }
}

impl Iterator for ModelCursor {
    type Item = ModelChild;

    fn next(&mut self) -> Option<ModelChild> {
        self.next_item()
    }
}

impl std::fmt::Debug for ModelCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelCursor")
            .field("parent", &self.parent)
            .field("index", &self.index)
            .finish()
    }
}
