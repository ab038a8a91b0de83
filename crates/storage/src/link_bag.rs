//! Adaptive link collections
//!
//! An [`AdaptiveLinkCollection`] is a multiset of [`RecordId`]s with two
//! physical representations:
//!
//! - **Embedded**: a small inline sequence stored with the owner
//! - **TreeBacked**: a [`LinkTree`] whose pages live under the owner's
//!   page prefix, plus an in-memory delta of changes not yet flushed
//!
//! The collection converts from embedded to tree-backed when its size reaches
//! the high-water threshold. The reverse conversion only happens when a
//! low-water threshold is configured, and only at flush time.
//!
//! # Multiset semantics
//!
//! `add` always succeeds and duplicates are kept. `remove` takes away a
//! single occurrence and is a no-op when the id is absent.
//!
//! # Ownership
//!
//! A collection belongs to exactly one [`CollectionOwner`]: a record field or
//! an index bucket. Its tree pages are keyed by the owner. A tree-backed
//! collection copied into another owner is materialized into a fresh tree
//! under the new owner when it is flushed there.

use std::collections::BTreeMap;
use std::fmt;

use smallvec::SmallVec;
use tracing::{debug, info};

use trellis_core::{Error, PageRead, RecordId, Result};

use crate::pages::StagedPages;
use crate::tree::LinkTree;

/// Default size at which an embedded collection becomes tree-backed
pub const DEFAULT_EMBEDDED_TO_TREE_THRESHOLD: usize = 40;

const RECORD_PREFIX: &[u8] = b"rec/";

/// When a collection switches representation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConversionThresholds {
    /// Embedded → TreeBacked when size reaches this (0: always tree-backed)
    pub embedded_to_tree: usize,
    /// TreeBacked → Embedded at flush when size is at most this (`None`: never)
    pub tree_to_embedded: Option<usize>,
}

impl Default for ConversionThresholds {
    fn default() -> Self {
        ConversionThresholds {
            embedded_to_tree: DEFAULT_EMBEDDED_TO_TREE_THRESHOLD,
            tree_to_embedded: None,
        }
    }
}

impl ConversionThresholds {
    /// Thresholds from signed settings, where a negative low-water mark disables reconversion
    pub fn from_settings(embedded_to_tree: usize, tree_to_embedded: i64) -> Self {
        ConversionThresholds {
            embedded_to_tree,
            tree_to_embedded: usize::try_from(tree_to_embedded).ok(),
        }
    }

    fn wants_tree(&self, size: usize) -> bool {
        size >= self.embedded_to_tree
    }

    fn wants_embedded(&self, size: usize) -> bool {
        matches!(self.tree_to_embedded, Some(low) if size <= low)
    }
}

/// Owner of a collection's tree pages
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CollectionOwner {
    /// A link-bag field of a record
    Record {
        /// Owning record
        id: RecordId,
        /// Field holding the collection
        field: String,
    },
    /// The value bucket of one non-unique index key
    IndexBucket {
        /// Index name
        index: String,
        /// Bucket sequence number within the index
        bucket: u64,
    },
}

impl CollectionOwner {
    /// Owner for a record field
    pub fn record(id: RecordId, field: impl Into<String>) -> Self {
        CollectionOwner::Record {
            id,
            field: field.into(),
        }
    }

    /// Page prefix under which this owner's tree lives
    pub fn page_prefix(&self) -> Vec<u8> {
        match self {
            CollectionOwner::Record { id, field } => {
                let mut p = RECORD_PREFIX.to_vec();
                p.extend_from_slice(&id.to_bytes());
                p.extend_from_slice(field.as_bytes());
                p.push(0);
                p
            }
            CollectionOwner::IndexBucket { index, bucket } => {
                let mut p = b"idx/".to_vec();
                p.extend_from_slice(index.as_bytes());
                p.push(0);
                p.extend_from_slice(&bucket.to_be_bytes());
                p
            }
        }
    }

    /// Page prefix covering every bucket of an index
    pub fn index_prefix(index: &str) -> Vec<u8> {
        let mut p = b"idx/".to_vec();
        p.extend_from_slice(index.as_bytes());
        p.push(0);
        p
    }
}

impl fmt::Display for CollectionOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CollectionOwner::Record { id, field } => write!(f, "{}.{}", id, field),
            CollectionOwner::IndexBucket { index, bucket } => write!(f, "{}[{}]", index, bucket),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Repr {
    Embedded(SmallVec<[RecordId; 8]>),
    TreeBacked {
        /// Prefix of the persisted tree, `None` until first flush
        tree: Option<Vec<u8>>,
        /// Net occurrence changes not yet flushed
        staged: BTreeMap<RecordId, i64>,
        size: usize,
    },
}

/// Multiset of record ids with adaptive storage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdaptiveLinkCollection {
    repr: Repr,
    thresholds: ConversionThresholds,
}

impl Default for AdaptiveLinkCollection {
    fn default() -> Self {
        Self::new()
    }
}

impl AdaptiveLinkCollection {
    /// Empty collection with default thresholds
    pub fn new() -> Self {
        Self::with_thresholds(ConversionThresholds::default())
    }

    /// Empty collection with explicit thresholds
    pub fn with_thresholds(thresholds: ConversionThresholds) -> Self {
        let repr = if thresholds.wants_tree(0) {
            Repr::TreeBacked {
                tree: None,
                staged: BTreeMap::new(),
                size: 0,
            }
        } else {
            Repr::Embedded(SmallVec::new())
        };
        AdaptiveLinkCollection { repr, thresholds }
    }

    /// Collection holding `ids`
    pub fn from_ids(ids: impl IntoIterator<Item = RecordId>, thresholds: ConversionThresholds) -> Self {
        let mut bag = Self::with_thresholds(thresholds);
        for id in ids {
            bag.add(id);
        }
        bag
    }

    /// Thresholds in effect
    pub fn thresholds(&self) -> ConversionThresholds {
        self.thresholds
    }

    /// Replace thresholds; conversions happen on the next `add` or flush
    pub fn set_thresholds(&mut self, thresholds: ConversionThresholds) {
        self.thresholds = thresholds;
    }

    /// Number of occurrences
    pub fn len(&self) -> usize {
        match &self.repr {
            Repr::Embedded(ids) => ids.len(),
            Repr::TreeBacked { size, .. } => *size,
        }
    }

    /// Whether the collection is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether stored inline
    pub fn is_embedded(&self) -> bool {
        matches!(self.repr, Repr::Embedded(_))
    }

    /// Whether stored in a tree
    pub fn is_tree_backed(&self) -> bool {
        !self.is_embedded()
    }

    /// Page prefix of the persisted tree, if any
    pub fn tree_prefix(&self) -> Option<&[u8]> {
        match &self.repr {
            Repr::TreeBacked { tree: Some(p), .. } => Some(p),
            _ => None,
        }
    }

    /// Whether unflushed changes exist
    pub fn has_pending_changes(&self) -> bool {
        match &self.repr {
            Repr::Embedded(_) => false,
            Repr::TreeBacked { tree, staged, .. } => tree.is_none() || !staged.is_empty(),
        }
    }

    /// Add one occurrence
    pub fn add(&mut self, id: RecordId) {
        let grown = match &mut self.repr {
            Repr::Embedded(ids) => {
                ids.push(id);
                ids.len()
            }
            Repr::TreeBacked { staged, size, .. } => {
                *staged.entry(id).or_insert(0) += 1;
                *size += 1;
                return;
            }
        };
        if self.thresholds.wants_tree(grown) {
            self.convert_to_tree();
        }
    }

    /// Remove one occurrence, returns whether one was present
    pub fn remove(&mut self, id: RecordId, pages: &dyn PageRead) -> Result<bool> {
        let present = self.count_of(id, pages)?;
        if present == 0 {
            return Ok(false);
        }
        match &mut self.repr {
            Repr::Embedded(ids) => {
                if let Some(pos) = ids.iter().position(|x| *x == id) {
                    ids.remove(pos);
                }
            }
            Repr::TreeBacked { staged, size, .. } => {
                let delta = staged.entry(id).or_insert(0);
                *delta -= 1;
                if *delta == 0 {
                    staged.remove(&id);
                }
                *size -= 1;
            }
        }
        Ok(true)
    }

    /// Occurrences of `id`
    pub fn count_of(&self, id: RecordId, pages: &dyn PageRead) -> Result<usize> {
        match &self.repr {
            Repr::Embedded(ids) => Ok(ids.iter().filter(|x| **x == id).count()),
            Repr::TreeBacked { tree, staged, .. } => {
                let persisted = match tree {
                    Some(prefix) => i64::from(persisted_tree(prefix, pages)?.count_of(id, pages)?),
                    None => 0,
                };
                let delta = staged.get(&id).copied().unwrap_or(0);
                Ok(usize::try_from(persisted + delta).unwrap_or(0))
            }
        }
    }

    /// Whether at least one occurrence of `id` is present
    pub fn contains(&self, id: RecordId, pages: &dyn PageRead) -> Result<bool> {
        Ok(self.count_of(id, pages)? > 0)
    }

    /// Occurrence counts keyed by id, ascending
    pub fn counts(&self, pages: &dyn PageRead) -> Result<BTreeMap<RecordId, usize>> {
        match &self.repr {
            Repr::Embedded(ids) => {
                let mut counts = BTreeMap::new();
                for id in ids {
                    *counts.entry(*id).or_insert(0) += 1;
                }
                Ok(counts)
            }
            Repr::TreeBacked { tree, staged, .. } => {
                let mut counts: BTreeMap<RecordId, i64> = match tree {
                    Some(prefix) => persisted_tree(prefix, pages)?
                        .entries(pages)?
                        .into_iter()
                        .map(|(id, n)| (id, i64::from(n)))
                        .collect(),
                    None => BTreeMap::new(),
                };
                for (id, delta) in staged {
                    *counts.entry(*id).or_insert(0) += delta;
                }
                Ok(counts
                    .into_iter()
                    .filter_map(|(id, n)| usize::try_from(n).ok().filter(|n| *n > 0).map(|n| (id, n)))
                    .collect())
            }
        }
    }

    /// All occurrences; insertion order when embedded, ascending when tree-backed
    pub fn to_vec(&self, pages: &dyn PageRead) -> Result<Vec<RecordId>> {
        match &self.repr {
            Repr::Embedded(ids) => Ok(ids.to_vec()),
            Repr::TreeBacked { .. } => Ok(expand(self.counts(pages)?)),
        }
    }

    /// All occurrences in ascending order
    pub fn to_sorted_vec(&self, pages: &dyn PageRead) -> Result<Vec<RecordId>> {
        Ok(expand(self.counts(pages)?))
    }

    fn convert_to_tree(&mut self) {
        if let Repr::Embedded(ids) = &self.repr {
            let mut staged = BTreeMap::new();
            for id in ids {
                *staged.entry(*id).or_insert(0) += 1;
            }
            let size = ids.len();
            debug!(size, "Converting embedded link collection to tree-backed");
            self.repr = Repr::TreeBacked {
                tree: None,
                staged,
                size,
            };
        }
    }

    /// Pull a tree owned elsewhere into the in-memory delta
    ///
    /// After this the collection no longer refers to another owner's pages,
    /// so the source may be deleted in the same batch.
    pub fn detach_from_foreign(&mut self, owner: &CollectionOwner, pages: &dyn PageRead) -> Result<()> {
        let target = owner.page_prefix();
        let foreign = matches!(&self.repr, Repr::TreeBacked { tree: Some(p), .. } if *p != target);
        if !foreign {
            return Ok(());
        }
        let counts = self.counts(pages)?;
        let size = counts.values().sum();
        debug!(owner = %owner, size, "Materializing copied link collection");
        self.repr = Repr::TreeBacked {
            tree: None,
            staged: counts
                .into_iter()
                .map(|(id, n)| (id, n as i64))
                .collect(),
            size,
        };
        Ok(())
    }

    /// Write pending changes under `owner` and apply the thresholds
    ///
    /// Embedded collections store nothing in pages. A tree-backed collection
    /// without a tree, or with a tree owned elsewhere, gets a fresh tree at
    /// the owner's prefix.
    pub fn flush(&mut self, owner: &CollectionOwner, pages: &mut StagedPages<'_>) -> Result<()> {
        if self.is_embedded() && self.thresholds.wants_tree(self.len()) {
            self.convert_to_tree();
        }
        if self.is_tree_backed() && self.thresholds.wants_embedded(self.len()) {
            let ids = self.to_sorted_vec(pages)?;
            self.delete_storage(pages)?;
            info!(owner = %owner, size = ids.len(), "Converting tree-backed link collection to embedded");
            self.repr = Repr::Embedded(ids.into_iter().collect());
            return Ok(());
        }

        self.detach_from_foreign(owner, pages)?;
        let target = owner.page_prefix();
        if let Repr::TreeBacked { tree, staged, .. } = &mut self.repr {
            let handle = match tree {
                Some(_) => persisted_tree(&target, pages)?,
                None => {
                    info!(owner = %owner, "Creating link tree");
                    LinkTree::create(target.clone(), pages)?
                }
            };
            for (id, delta) in std::mem::take(staged) {
                if delta > 0 {
                    handle.insert(id, delta as u32, pages)?;
                } else if delta < 0 {
                    handle.remove(id, delta.unsigned_abs() as u32, pages)?;
                }
            }
            *tree = Some(target);
        }
        Ok(())
    }

    /// Stage deletion of the collection's tree pages
    pub fn delete_storage(&self, pages: &mut StagedPages<'_>) -> Result<usize> {
        match self.tree_prefix() {
            Some(prefix) => LinkTree::open(prefix.to_vec()).destroy(pages),
            None => Ok(0),
        }
    }
}

/// Open the tree a loaded collection points at
///
/// The pages disappear when another transaction deletes the owning record or
/// shrinks the field back to embedded. A handle loaded before that commit
/// reports the owner as gone instead of reading a half-missing tree.
fn persisted_tree(prefix: &[u8], pages: &dyn PageRead) -> Result<LinkTree> {
    let tree = LinkTree::open(prefix.to_vec());
    if tree.exists(pages)? {
        return Ok(tree);
    }
    match prefix.strip_prefix(RECORD_PREFIX).and_then(RecordId::from_bytes) {
        Some(owner) => Err(Error::RecordNotFound(owner)),
        None => Err(Error::Corruption(format!(
            "link tree {:?} has no header page",
            prefix
        ))),
    }
}

fn expand(counts: BTreeMap<RecordId, usize>) -> Vec<RecordId> {
    counts
        .into_iter()
        .flat_map(|(id, n)| std::iter::repeat(id).take(n))
        .collect()
}
