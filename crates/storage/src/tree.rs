//! Page-backed B+tree of record ids
//!
//! Tree-backed link collections store `(RecordId, count)` entries in a small
//! B+tree whose nodes are pages in a [`PageStore`](trellis_core::PageStore).
//! All pages of one tree share a byte prefix derived from the owner, so the
//! whole tree can be deleted by prefix.
//!
//! # Page layout
//!
//! ```text
//! prefix ++ u32be(0)   header   { root, next_page, size }
//! prefix ++ u32be(n)   node     Leaf { entries, next } | Internal { keys, children }
//! ```
//!
//! Each page is `u32be(crc32(payload)) ++ bincode(payload)`. A checksum
//! mismatch on read is reported as `Corruption`.
//!
//! Leaves are chained left to right for ordered iteration. Removal never
//! rebalances: leaves may become empty, and separators stay valid because
//! they only bound the key space.

use byteorder::{BigEndian, ByteOrder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use trellis_core::{Error, PageRead, RecordId, Result};

use crate::pages::StagedPages;

/// Maximum entries in a leaf before it splits
pub const MAX_LEAF_ENTRIES: usize = 64;

/// Maximum separator keys in an internal node before it splits
pub const MAX_INTERNAL_KEYS: usize = 64;

const HEADER_PAGE: u32 = 0;
const CHECKSUM_BYTES: usize = 4;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct TreeHeader {
    root: u32,
    next_page: u32,
    size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum Node {
    Leaf {
        entries: Vec<(RecordId, u32)>,
        next: Option<u32>,
    },
    Internal {
        keys: Vec<RecordId>,
        children: Vec<u32>,
    },
}

/// Encode a page payload with its checksum
fn encode_page<T: Serialize>(payload: &T) -> Result<Vec<u8>> {
    let body = bincode::serialize(payload)?;
    let mut page = vec![0u8; CHECKSUM_BYTES];
    BigEndian::write_u32(&mut page, crc32fast::hash(&body));
    page.extend_from_slice(&body);
    Ok(page)
}

/// Decode a page, verifying its checksum
fn decode_page<T: DeserializeOwned>(key: &[u8], page: &[u8]) -> Result<T> {
    if page.len() < CHECKSUM_BYTES {
        return Err(Error::Corruption(format!(
            "page {:?} is truncated ({} bytes)",
            key,
            page.len()
        )));
    }
    let (sum, body) = page.split_at(CHECKSUM_BYTES);
    let expected = BigEndian::read_u32(sum);
    let actual = crc32fast::hash(body);
    if expected != actual {
        return Err(Error::Corruption(format!(
            "checksum mismatch on page {:?}: stored {:08x}, computed {:08x}",
            key, expected, actual
        )));
    }
    Ok(bincode::deserialize(body)?)
}

/// Handle to one tree, identified by its page prefix
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkTree {
    prefix: Vec<u8>,
}

impl LinkTree {
    /// Handle to an existing tree
    pub fn open(prefix: Vec<u8>) -> Self {
        LinkTree { prefix }
    }

    /// Create an empty tree, replacing any pages already under `prefix`
    pub fn create(prefix: Vec<u8>, pages: &mut StagedPages<'_>) -> Result<Self> {
        pages.delete_prefix(&prefix)?;
        let tree = LinkTree { prefix };
        tree.write_node(
            1,
            &Node::Leaf {
                entries: Vec::new(),
                next: None,
            },
            pages,
        )?;
        tree.write_header(
            &TreeHeader {
                root: 1,
                next_page: 2,
                size: 0,
            },
            pages,
        )?;
        Ok(tree)
    }

    /// Page prefix
    pub fn prefix(&self) -> &[u8] {
        &self.prefix
    }

    fn page_key(&self, page_no: u32) -> Vec<u8> {
        let mut key = Vec::with_capacity(self.prefix.len() + 4);
        key.extend_from_slice(&self.prefix);
        key.extend_from_slice(&page_no.to_be_bytes());
        key
    }

    fn read_header(&self, pages: &dyn PageRead) -> Result<TreeHeader> {
        let key = self.page_key(HEADER_PAGE);
        match pages.read_page(&key)? {
            Some(page) => decode_page(&key, &page),
            None => Err(Error::Corruption(format!(
                "link tree {:?} has no header page",
                self.prefix
            ))),
        }
    }

    fn write_header(&self, header: &TreeHeader, pages: &mut StagedPages<'_>) -> Result<()> {
        pages.write(self.page_key(HEADER_PAGE), encode_page(header)?);
        Ok(())
    }

    fn read_node(&self, page_no: u32, pages: &dyn PageRead) -> Result<Node> {
        let key = self.page_key(page_no);
        match pages.read_page(&key)? {
            Some(page) => decode_page(&key, &page),
            None => Err(Error::Corruption(format!(
                "link tree {:?} is missing page {}",
                self.prefix, page_no
            ))),
        }
    }

    fn write_node(&self, page_no: u32, node: &Node, pages: &mut StagedPages<'_>) -> Result<()> {
        pages.write(self.page_key(page_no), encode_page(node)?);
        Ok(())
    }

    /// Whether the tree's header page exists
    pub fn exists(&self, pages: &dyn PageRead) -> Result<bool> {
        Ok(pages.read_page(&self.page_key(HEADER_PAGE))?.is_some())
    }

    /// Total occurrences stored
    pub fn size(&self, pages: &dyn PageRead) -> Result<u64> {
        Ok(self.read_header(pages)?.size)
    }

    /// Occurrences of one id
    pub fn count_of(&self, id: RecordId, pages: &dyn PageRead) -> Result<u32> {
        let header = self.read_header(pages)?;
        let mut page_no = header.root;
        loop {
            match self.read_node(page_no, pages)? {
                Node::Internal { keys, children } => {
                    page_no = children[keys.partition_point(|k| *k <= id)];
                }
                Node::Leaf { entries, .. } => {
                    return Ok(entries
                        .binary_search_by(|(k, _)| k.cmp(&id))
                        .map(|i| entries[i].1)
                        .unwrap_or(0));
                }
            }
        }
    }

    /// Add `n` occurrences of `id`
    pub fn insert(&self, id: RecordId, n: u32, pages: &mut StagedPages<'_>) -> Result<()> {
        if n == 0 {
            return Ok(());
        }
        let mut header = self.read_header(pages)?;
        if let Some((separator, right)) = self.insert_into(header.root, id, n, &mut header, pages)? {
            let new_root = header.next_page;
            header.next_page += 1;
            self.write_node(
                new_root,
                &Node::Internal {
                    keys: vec![separator],
                    children: vec![header.root, right],
                },
                pages,
            )?;
            header.root = new_root;
        }
        header.size += u64::from(n);
        self.write_header(&header, pages)
    }

    fn insert_into(
        &self,
        page_no: u32,
        id: RecordId,
        n: u32,
        header: &mut TreeHeader,
        pages: &mut StagedPages<'_>,
    ) -> Result<Option<(RecordId, u32)>> {
        match self.read_node(page_no, pages)? {
            Node::Leaf { mut entries, next } => {
                match entries.binary_search_by(|(k, _)| k.cmp(&id)) {
                    Ok(i) => entries[i].1 = entries[i].1.saturating_add(n),
                    Err(i) => entries.insert(i, (id, n)),
                }
                if entries.len() <= MAX_LEAF_ENTRIES {
                    self.write_node(page_no, &Node::Leaf { entries, next }, pages)?;
                    return Ok(None);
                }
                let right_entries = entries.split_off(entries.len() / 2);
                let separator = right_entries[0].0;
                let right = header.next_page;
                header.next_page += 1;
                self.write_node(
                    right,
                    &Node::Leaf {
                        entries: right_entries,
                        next,
                    },
                    pages,
                )?;
                self.write_node(
                    page_no,
                    &Node::Leaf {
                        entries,
                        next: Some(right),
                    },
                    pages,
                )?;
                Ok(Some((separator, right)))
            }
            Node::Internal {
                mut keys,
                mut children,
            } => {
                let slot = keys.partition_point(|k| *k <= id);
                let split = self.insert_into(children[slot], id, n, header, pages)?;
                let (separator, new_child) = match split {
                    None => return Ok(None),
                    Some(s) => s,
                };
                keys.insert(slot, separator);
                children.insert(slot + 1, new_child);
                if keys.len() <= MAX_INTERNAL_KEYS {
                    self.write_node(page_no, &Node::Internal { keys, children }, pages)?;
                    return Ok(None);
                }
                let mid = keys.len() / 2;
                let right_keys = keys.split_off(mid + 1);
                let promoted = keys.pop().ok_or_else(|| {
                    Error::Corruption(format!("empty internal node in {:?}", self.prefix))
                })?;
                let right_children = children.split_off(mid + 1);
                let right = header.next_page;
                header.next_page += 1;
                self.write_node(
                    right,
                    &Node::Internal {
                        keys: right_keys,
                        children: right_children,
                    },
                    pages,
                )?;
                self.write_node(page_no, &Node::Internal { keys, children }, pages)?;
                Ok(Some((promoted, right)))
            }
        }
    }

    /// Remove up to `n` occurrences of `id`, returns how many were removed
    pub fn remove(&self, id: RecordId, n: u32, pages: &mut StagedPages<'_>) -> Result<u32> {
        let mut header = self.read_header(pages)?;
        let mut page_no = header.root;
        loop {
            match self.read_node(page_no, pages)? {
                Node::Internal { keys, children } => {
                    page_no = children[keys.partition_point(|k| *k <= id)];
                }
                Node::Leaf { mut entries, next } => {
                    let i = match entries.binary_search_by(|(k, _)| k.cmp(&id)) {
                        Ok(i) => i,
                        Err(_) => return Ok(0),
                    };
                    let removed = entries[i].1.min(n);
                    if removed == entries[i].1 {
                        entries.remove(i);
                    } else {
                        entries[i].1 -= removed;
                    }
                    self.write_node(page_no, &Node::Leaf { entries, next }, pages)?;
                    header.size -= u64::from(removed);
                    self.write_header(&header, pages)?;
                    return Ok(removed);
                }
            }
        }
    }

    /// All entries in ascending id order
    pub fn entries(&self, pages: &dyn PageRead) -> Result<Vec<(RecordId, u32)>> {
        let header = self.read_header(pages)?;
        let mut page_no = header.root;
        // Descend to the leftmost leaf
        loop {
            match self.read_node(page_no, pages)? {
                Node::Internal { children, .. } => page_no = children[0],
                Node::Leaf { .. } => break,
            }
        }
        let mut out = Vec::with_capacity(header.size as usize);
        let mut current = Some(page_no);
        while let Some(no) = current {
            match self.read_node(no, pages)? {
                Node::Leaf { entries, next } => {
                    out.extend(entries);
                    current = next;
                }
                Node::Internal { .. } => {
                    return Err(Error::Corruption(format!(
                        "leaf chain of {:?} reaches internal page {}",
                        self.prefix, no
                    )))
                }
            }
        }
        Ok(out)
    }

    /// Number of levels from root to leaf
    pub fn height(&self, pages: &dyn PageRead) -> Result<usize> {
        let mut page_no = self.read_header(pages)?.root;
        let mut height = 1;
        while let Node::Internal { children, .. } = self.read_node(page_no, pages)? {
            page_no = children[0];
            height += 1;
        }
        Ok(height)
    }

    /// Delete every page of the tree, returns how many
    pub fn destroy(&self, pages: &mut StagedPages<'_>) -> Result<usize> {
        pages.delete_prefix(&self.prefix)
    }
}
