//! Context trees mirroring the reader tree.
//!
//! A context records where each reader sits: its ordinal and doc base inside
//! its direct parent, and for leaves the global leaf ordinal and doc base
//! inside the top-level reader. Only the top-level context carries the
//! flattened list of leaves.

use std::sync::Arc;

use crate::document::DocId;
use crate::error::{IrisError, Result};
use crate::reader::composite::{BaseCompositeReader, IndexReaderRef};
use crate::reader::leaf::LeafReader;
use crate::reader::registry::ReaderId;

/// Context of one leaf reader.
#[derive(Debug, Clone)]
pub struct LeafReaderContext {
    reader: Arc<dyn LeafReader>,
    /// Position among all leaves of the top-level reader.
    pub ord: usize,
    /// First global doc id of this leaf in the top-level reader.
    pub doc_base: DocId,
    pub ord_in_parent: usize,
    pub doc_base_in_parent: DocId,
    is_top_level: bool,
}

impl LeafReaderContext {
    /// A context for a leaf that is used on its own.
    pub fn top_level(reader: Arc<dyn LeafReader>) -> ReaderContext {
        ReaderContext::Leaf(LeafReaderContext {
            reader,
            ord: 0,
            doc_base: 0,
            ord_in_parent: 0,
            doc_base_in_parent: 0,
            is_top_level: true,
        })
    }

    pub fn reader(&self) -> &Arc<dyn LeafReader> {
        &self.reader
    }

    pub fn is_top_level(&self) -> bool {
        self.is_top_level
    }
}

/// Context of a composite reader.
#[derive(Debug)]
pub struct CompositeReaderContext {
    reader_id: ReaderId,
    children: Vec<ReaderContext>,
    /// Present only on the top-level context.
    leaves: Option<Vec<LeafReaderContext>>,
    pub ord_in_parent: usize,
    pub doc_base_in_parent: DocId,
}

impl CompositeReaderContext {
    pub fn reader_id(&self) -> ReaderId {
        self.reader_id
    }

    pub fn is_top_level(&self) -> bool {
        self.leaves.is_some()
    }
}

#[derive(Debug)]
pub enum ReaderContext {
    Leaf(LeafReaderContext),
    Composite(CompositeReaderContext),
}

impl ReaderContext {
    pub fn is_top_level(&self) -> bool {
        match self {
            ReaderContext::Leaf(leaf) => leaf.is_top_level,
            ReaderContext::Composite(composite) => composite.is_top_level(),
        }
    }

    /// Every leaf under this context in doc-id order. Only valid on the
    /// top-level context.
    pub fn leaves(&self) -> Result<&[LeafReaderContext]> {
        match self {
            ReaderContext::Leaf(leaf) if leaf.is_top_level => Ok(std::slice::from_ref(leaf)),
            ReaderContext::Composite(CompositeReaderContext {
                leaves: Some(leaves),
                ..
            }) => Ok(leaves),
            _ => Err(IrisError::invalid_operation(
                "leaves are only available on the top-level reader context",
            )),
        }
    }

    pub fn children(&self) -> &[ReaderContext] {
        match self {
            ReaderContext::Leaf(_) => &[],
            ReaderContext::Composite(composite) => &composite.children,
        }
    }

    pub fn ord_in_parent(&self) -> usize {
        match self {
            ReaderContext::Leaf(leaf) => leaf.ord_in_parent,
            ReaderContext::Composite(composite) => composite.ord_in_parent,
        }
    }

    pub fn doc_base_in_parent(&self) -> DocId {
        match self {
            ReaderContext::Leaf(leaf) => leaf.doc_base_in_parent,
            ReaderContext::Composite(composite) => composite.doc_base_in_parent,
        }
    }
}

#[derive(Default)]
struct ContextBuilder {
    leaves: Vec<LeafReaderContext>,
    leaf_doc_base: DocId,
}

impl ContextBuilder {
    fn build_child(&mut self, reader: &IndexReaderRef, ord: usize, doc_base: DocId) -> ReaderContext {
        match reader {
            IndexReaderRef::Leaf(leaf) => {
                let context = LeafReaderContext {
                    reader: leaf.clone(),
                    ord: self.leaves.len(),
                    doc_base: self.leaf_doc_base,
                    ord_in_parent: ord,
                    doc_base_in_parent: doc_base,
                    is_top_level: false,
                };
                self.leaves.push(context.clone());
                self.leaf_doc_base += leaf.max_doc();
                ReaderContext::Leaf(context)
            }
            IndexReaderRef::Composite(composite) => {
                let children = self.build_children(composite);
                ReaderContext::Composite(CompositeReaderContext {
                    reader_id: composite.id(),
                    children,
                    leaves: None,
                    ord_in_parent: ord,
                    doc_base_in_parent: doc_base,
                })
            }
        }
    }

    fn build_children(&mut self, composite: &BaseCompositeReader) -> Vec<ReaderContext> {
        composite
            .sub_readers()
            .iter()
            .zip(composite.starts())
            .enumerate()
            .map(|(ord, (sub, &start))| self.build_child(sub, ord, start))
            .collect()
    }
}

/// Build the top-level context of `reader`, walking its tree depth-first.
pub(crate) fn build_composite_context(reader: &BaseCompositeReader) -> Result<ReaderContext> {
    let mut builder = ContextBuilder::default();
    let children = builder.build_children(reader);
    if builder.leaf_doc_base != reader.max_doc() {
        debug_assert!(false, "leaf doc bases do not add up to max_doc");
        return Err(IrisError::internal(format!(
            "leaf doc bases sum to {} but the reader has max_doc {}",
            builder.leaf_doc_base,
            reader.max_doc()
        )));
    }
    Ok(ReaderContext::Composite(CompositeReaderContext {
        reader_id: reader.id(),
        children,
        leaves: Some(builder.leaves),
        ord_in_parent: 0,
        doc_base_in_parent: 0,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::composite::tests::FixedLeaf;

    fn leaf(max_doc: DocId) -> IndexReaderRef {
        IndexReaderRef::Leaf(FixedLeaf::arc(max_doc, Some(1)))
    }

    #[test]
    fn test_nested_tree_assigns_leaf_ords_and_bases() {
        let inner = BaseCompositeReader::new(vec![leaf(2), leaf(0), leaf(4)]).unwrap();
        let top = BaseCompositeReader::new(vec![
            leaf(3),
            IndexReaderRef::Composite(inner),
            leaf(1),
        ])
        .unwrap();

        let context = top.context().unwrap();
        assert!(context.is_top_level());
        let leaves = context.leaves().unwrap();
        let summary: Vec<(usize, DocId)> = leaves.iter().map(|l| (l.ord, l.doc_base)).collect();
        assert_eq!(summary, vec![(0, 0), (1, 3), (2, 5), (3, 5), (4, 9)]);

        let children = context.children();
        assert_eq!(children.len(), 3);
        let nested = &children[1];
        assert!(!nested.is_top_level());
        assert_eq!(nested.doc_base_in_parent(), 3);
        assert!(matches!(
            nested.leaves(),
            Err(IrisError::InvalidOperation(_))
        ));
        // bases inside the nested composite are relative to it
        let nested_bases: Vec<DocId> = nested
            .children()
            .iter()
            .map(ReaderContext::doc_base_in_parent)
            .collect();
        assert_eq!(nested_bases, vec![0, 2, 2]);
        assert_eq!(nested.children()[2].ord_in_parent(), 2);
    }

    #[test]
    fn test_context_is_built_once() {
        let top = BaseCompositeReader::new(vec![leaf(1), leaf(2)]).unwrap();
        let first = top.context().unwrap() as *const ReaderContext;
        let second = top.context().unwrap() as *const ReaderContext;
        assert_eq!(first, second);
    }

    #[test]
    fn test_standalone_leaf_context() {
        let context = LeafReaderContext::top_level(FixedLeaf::arc(4, None));
        let leaves = context.leaves().unwrap();
        assert_eq!(leaves.len(), 1);
        assert_eq!(leaves[0].reader().max_doc(), 4);
        assert!(context.children().is_empty());
    }
}
