//! The database-backed trie itself.

use std::{fmt, sync::Arc};

use ethereum_types::H256;
use keccak_hash::KECCAK_NULL_RLP;
use log::trace;
use thiserror::Error;

use crate::{
    db::DatabaseHandle,
    nibbles::Nibbles,
    node::{Node, NodeHandle},
};

/// Result alias for trie operations.
pub type TrieResult<T> = Result<T, TrieError>;

/// Failures while pulling trie nodes out of the backing store.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TrieError {
    /// A referenced node has no entry in the database.
    #[error("trie node {0:?} missing from the backing store")]
    MissingNode(H256),

    /// A stored node failed to decode.
    #[error("trie node {hash:?} is undecodable: {source}")]
    Corrupt {
        /// Key of the offending entry.
        hash: H256,
        /// The underlying RLP failure.
        source: rlp::DecoderError,
    },
}

/// A Merkle Patricia trie rooted in a [`Database`](crate::db::Database).
///
/// All mutation happens against in-memory nodes; the store is only read to
/// resolve [`Node::Hash`] references and only written by [`Trie::commit`].
#[derive(Clone)]
pub struct Trie {
    db: DatabaseHandle,
    root: NodeHandle,
    cached_root: Option<H256>,
}

impl Trie {
    /// An empty trie over `db`.
    pub fn new(db: DatabaseHandle) -> Self {
        Self {
            db,
            root: Arc::new(Node::Empty),
            cached_root: Some(KECCAK_NULL_RLP),
        }
    }

    /// A trie whose root node is stored under `root` in `db`. Nothing is
    /// read until an operation first touches the root, so opening at a bogus
    /// hash only fails later with [`TrieError::MissingNode`].
    pub fn open(db: DatabaseHandle, root: H256) -> Self {
        if root == KECCAK_NULL_RLP {
            return Self::new(db);
        }
        Self {
            db,
            root: Arc::new(Node::Hash(root)),
            cached_root: Some(root),
        }
    }

    /// Looks up the value stored under `key`.
    pub fn get(&self, key: &[u8]) -> TrieResult<Option<Vec<u8>>> {
        self.get_at(&self.root, &Nibbles::from_bytes(key))
    }

    /// Inserts `value` under `key`, replacing any previous value. Empty
    /// values are not representable; use [`Trie::remove`] instead.
    pub fn insert(&mut self, key: &[u8], value: Vec<u8>) -> TrieResult<()> {
        debug_assert!(!value.is_empty(), "an empty value is a removal");
        let path = Nibbles::from_bytes(key);
        trace!("inserting {} value bytes at {:?}", value.len(), path);

        self.root = self.insert_at(&self.root, path, value)?;
        self.cached_root = None;
        Ok(())
    }

    /// Removes `key`, returning its previous value. A branch left with a
    /// single occupant collapses, so the trie stays in canonical form.
    pub fn remove(&mut self, key: &[u8]) -> TrieResult<Option<Vec<u8>>> {
        let path = Nibbles::from_bytes(key);
        trace!("removing value at {:?}", path);

        let (replacement, removed) = self.remove_at(&self.root, &path)?;
        if removed.is_some() {
            self.root = replacement.unwrap_or_else(|| Arc::new(Node::Empty));
            self.cached_root = None;
        }
        Ok(removed)
    }

    /// The current root hash: a pure function of the trie's contents.
    pub fn root_hash(&mut self) -> H256 {
        if let Some(hash) = self.cached_root {
            return hash;
        }
        let hash = self.root.root_hash(&mut |_, _| {});
        self.cached_root = Some(hash);
        hash
    }

    /// Writes every reachable in-memory node to the backing store and
    /// returns the root hash. Nodes stay resident afterwards, so later
    /// mutations keep sharing the already-persisted subtries.
    pub fn commit(&mut self) -> H256 {
        let db = self.db.clone();
        let hash = self
            .root
            .root_hash(&mut |h, bytes| db.put(h.as_bytes(), bytes.to_vec()));
        self.cached_root = Some(hash);
        hash
    }

    /// The backing store this trie resolves against.
    pub fn db(&self) -> &DatabaseHandle {
        &self.db
    }

    fn load(&self, hash: H256) -> TrieResult<Node> {
        let bytes = self
            .db
            .get(hash.as_bytes())
            .ok_or(TrieError::MissingNode(hash))?;
        Node::decode(&bytes).map_err(|source| TrieError::Corrupt { hash, source })
    }

    fn get_at(&self, node: &Node, path: &Nibbles) -> TrieResult<Option<Vec<u8>>> {
        match node {
            Node::Empty => Ok(None),
            Node::Hash(hash) => self.get_at(&self.load(*hash)?, path),
            Node::Leaf { partial, value } => Ok((partial == path).then(|| value.clone())),
            Node::Extension { prefix, child } => match path.starts_with(prefix) {
                true => self.get_at(child, &path.suffix(prefix.len())),
                false => Ok(None),
            },
            Node::Branch { children, value } => match path.is_empty() {
                true => Ok((!value.is_empty()).then(|| value.clone())),
                false => self.get_at(&children[path.at(0) as usize], &path.suffix(1)),
            },
        }
    }

    fn insert_at(
        &self,
        node: &NodeHandle,
        path: Nibbles,
        value: Vec<u8>,
    ) -> TrieResult<NodeHandle> {
        match node.as_ref() {
            Node::Empty => Ok(Arc::new(Node::Leaf {
                partial: path,
                value,
            })),
            Node::Hash(hash) => {
                let loaded = Arc::new(self.load(*hash)?);
                self.insert_at(&loaded, path, value)
            }
            Node::Leaf {
                partial,
                value: old,
            } => {
                let common = partial.common_prefix_len(&path);
                if common == partial.len() && common == path.len() {
                    return Ok(Arc::new(Node::Leaf {
                        partial: path,
                        value,
                    }));
                }

                // The two keys diverge: fork into a branch below the shared
                // prefix, each remainder (if any) hanging off its nibble.
                let mut children = Node::empty_children();
                let mut branch_value = Vec::new();
                match common == partial.len() {
                    true => branch_value = old.clone(),
                    false => {
                        children[partial.at(common) as usize] = Arc::new(Node::Leaf {
                            partial: partial.suffix(common + 1),
                            value: old.clone(),
                        })
                    }
                }
                match common == path.len() {
                    true => branch_value = value,
                    false => {
                        children[path.at(common) as usize] = Arc::new(Node::Leaf {
                            partial: path.suffix(common + 1),
                            value,
                        })
                    }
                }

                let branch = Arc::new(Node::Branch {
                    children,
                    value: branch_value,
                });
                Ok(wrap_prefix(path.prefix(common), branch))
            }
            Node::Extension { prefix, child } => {
                let common = prefix.common_prefix_len(&path);
                if common == prefix.len() {
                    let child = self.insert_at(child, path.suffix(common), value)?;
                    return Ok(Arc::new(Node::Extension {
                        prefix: prefix.clone(),
                        child,
                    }));
                }

                let mut children = Node::empty_children();
                let mut branch_value = Vec::new();
                children[prefix.at(common) as usize] = match prefix.len() - common {
                    1 => child.clone(),
                    _ => Arc::new(Node::Extension {
                        prefix: prefix.suffix(common + 1),
                        child: child.clone(),
                    }),
                };
                match common == path.len() {
                    true => branch_value = value,
                    false => {
                        children[path.at(common) as usize] = Arc::new(Node::Leaf {
                            partial: path.suffix(common + 1),
                            value,
                        })
                    }
                }

                let branch = Arc::new(Node::Branch {
                    children,
                    value: branch_value,
                });
                Ok(wrap_prefix(path.prefix(common), branch))
            }
            Node::Branch {
                children,
                value: branch_value,
            } => {
                if path.is_empty() {
                    return Ok(Arc::new(Node::Branch {
                        children: children.clone(),
                        value,
                    }));
                }
                let i = path.at(0) as usize;
                let mut children = children.clone();
                children[i] = self.insert_at(&children[i], path.suffix(1), value)?;
                Ok(Arc::new(Node::Branch {
                    children,
                    value: branch_value.clone(),
                }))
            }
        }
    }

    /// Returns the replacement node (`None` when the subtrie vanished
    /// entirely) and the removed value, if the key was present.
    fn remove_at(
        &self,
        node: &NodeHandle,
        path: &Nibbles,
    ) -> TrieResult<(Option<NodeHandle>, Option<Vec<u8>>)> {
        match node.as_ref() {
            Node::Empty => Ok((Some(node.clone()), None)),
            Node::Hash(hash) => {
                let loaded = Arc::new(self.load(*hash)?);
                self.remove_at(&loaded, path)
            }
            Node::Leaf { partial, value } => match partial == path {
                true => Ok((None, Some(value.clone()))),
                false => Ok((Some(node.clone()), None)),
            },
            Node::Extension { prefix, child } => {
                if !path.starts_with(prefix) {
                    return Ok((Some(node.clone()), None));
                }
                let (new_child, removed) = self.remove_at(child, &path.suffix(prefix.len()))?;
                if removed.is_none() {
                    return Ok((Some(node.clone()), None));
                }
                let replacement = match new_child {
                    None => None,
                    Some(child) => Some(self.graft(prefix.clone(), child)?),
                };
                Ok((replacement, removed))
            }
            Node::Branch { children, value } => {
                if path.is_empty() {
                    if value.is_empty() {
                        return Ok((Some(node.clone()), None));
                    }
                    let shrunk = self.shrink_branch(children.clone(), Vec::new())?;
                    return Ok((Some(shrunk), Some(value.clone())));
                }

                let i = path.at(0) as usize;
                let (new_child, removed) = self.remove_at(&children[i], &path.suffix(1))?;
                if removed.is_none() {
                    return Ok((Some(node.clone()), None));
                }
                let mut children = children.clone();
                children[i] = new_child.unwrap_or_else(|| Arc::new(Node::Empty));
                Ok((Some(self.shrink_branch(children, value.clone())?), removed))
            }
        }
    }

    /// Collapses a branch that may have dropped to a single occupant.
    fn shrink_branch(
        &self,
        children: [NodeHandle; 16],
        value: Vec<u8>,
    ) -> TrieResult<NodeHandle> {
        let occupied: Vec<usize> = children
            .iter()
            .enumerate()
            .filter(|(_, c)| !matches!(c.as_ref(), Node::Empty))
            .map(|(i, _)| i)
            .collect();

        match (occupied.as_slice(), value.is_empty()) {
            // Still a real fork.
            ([_, _, ..], _) | ([_], false) => Ok(Arc::new(Node::Branch { children, value })),
            // Only the value slot is left.
            ([], false) => Ok(Arc::new(Node::Leaf {
                partial: Nibbles::default(),
                value,
            })),
            // A single child absorbs the branch.
            ([i], true) => {
                let child = children[*i].clone();
                self.graft(Nibbles::single(*i as u8), child)
            }
            // Unreachable for canonical tries, but harmless to honor.
            ([], true) => Ok(Arc::new(Node::Empty)),
        }
    }

    /// Prepends `prefix` to `node`, merging with the leaf or extension
    /// beneath so no extension ever points at another extension.
    fn graft(&self, prefix: Nibbles, node: NodeHandle) -> TrieResult<NodeHandle> {
        let resolved = match node.as_ref() {
            Node::Hash(hash) => Arc::new(self.load(*hash)?),
            _ => node,
        };
        Ok(match resolved.as_ref() {
            Node::Leaf { partial, value } => Arc::new(Node::Leaf {
                partial: prefix.join(partial),
                value: value.clone(),
            }),
            Node::Extension {
                prefix: rest,
                child,
            } => Arc::new(Node::Extension {
                prefix: prefix.join(rest),
                child: child.clone(),
            }),
            _ => Arc::new(Node::Extension {
                prefix,
                child: resolved,
            }),
        })
    }
}

fn wrap_prefix(prefix: Nibbles, node: NodeHandle) -> NodeHandle {
    match prefix.is_empty() {
        true => node,
        false => Arc::new(Node::Extension {
            prefix,
            child: node,
        }),
    }
}

impl fmt::Debug for Trie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Trie")
            .field("cached_root", &self.cached_root)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use rand::{rngs::StdRng, Rng, SeedableRng};

    use super::*;
    use crate::db::{Database, MemoryDb};

    fn common_setup() {
        let _ = pretty_env_logger::try_init();
    }

    fn memory_trie() -> (Arc<MemoryDb>, Trie) {
        let db = Arc::new(MemoryDb::new());
        let trie = Trie::new(db.clone());
        (db, trie)
    }

    fn random_entries(n: usize, seed: u64) -> BTreeMap<Vec<u8>, Vec<u8>> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n)
            .map(|_| {
                let key: [u8; 32] = rng.gen();
                let len = rng.gen_range(1..64);
                let value: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
                (key.to_vec(), value)
            })
            .collect()
    }

    #[test]
    fn empty_root_is_the_null_rlp_hash() {
        common_setup();
        let (_, mut trie) = memory_trie();
        assert_eq!(trie.root_hash(), KECCAK_NULL_RLP);
    }

    #[test]
    fn insert_get_roundtrip() {
        common_setup();
        let (_, mut trie) = memory_trie();
        let entries = random_entries(200, 0xfeed);

        for (k, v) in &entries {
            trie.insert(k, v.clone()).unwrap();
        }
        for (k, v) in &entries {
            assert_eq!(trie.get(k).unwrap().as_ref(), Some(v));
        }
        assert_eq!(trie.get(&[0u8; 32]).unwrap(), None);
    }

    #[test]
    fn root_is_insert_order_independent() {
        common_setup();
        let entries = random_entries(64, 1);

        let (_, mut forward) = memory_trie();
        for (k, v) in &entries {
            forward.insert(k, v.clone()).unwrap();
        }
        let (_, mut backward) = memory_trie();
        for (k, v) in entries.iter().rev() {
            backward.insert(k, v.clone()).unwrap();
        }

        assert_eq!(forward.root_hash(), backward.root_hash());
    }

    #[test]
    fn overwrite_converges_to_same_root() {
        common_setup();
        let (_, mut twice) = memory_trie();
        twice.insert(b"key", vec![1]).unwrap();
        twice.insert(b"key", vec![2]).unwrap();

        let (_, mut once) = memory_trie();
        once.insert(b"key", vec![2]).unwrap();

        assert_eq!(twice.root_hash(), once.root_hash());
        assert_eq!(twice.get(b"key").unwrap(), Some(vec![2]));
    }

    #[test]
    fn remove_restores_the_prior_root() {
        common_setup();
        let entries = random_entries(32, 2);
        let (_, mut trie) = memory_trie();
        for (k, v) in &entries {
            trie.insert(k, v.clone()).unwrap();
        }
        let before = trie.root_hash();

        trie.insert(b"transient-key", vec![42; 40]).unwrap();
        assert_ne!(trie.root_hash(), before);

        assert_eq!(trie.remove(b"transient-key").unwrap(), Some(vec![42; 40]));
        assert_eq!(trie.root_hash(), before);
        assert_eq!(trie.remove(b"transient-key").unwrap(), None);
    }

    #[test]
    fn keys_that_prefix_each_other_share_a_branch_value() {
        common_setup();
        let (_, mut trie) = memory_trie();
        trie.insert(&[0x12], vec![1]).unwrap();
        trie.insert(&[0x12, 0x34], vec![2]).unwrap();

        assert_eq!(trie.get(&[0x12]).unwrap(), Some(vec![1]));
        assert_eq!(trie.get(&[0x12, 0x34]).unwrap(), Some(vec![2]));

        assert_eq!(trie.remove(&[0x12]).unwrap(), Some(vec![1]));
        assert_eq!(trie.get(&[0x12, 0x34]).unwrap(), Some(vec![2]));
    }

    #[test]
    fn commit_persists_and_reopen_reads_back() {
        common_setup();
        let entries = random_entries(100, 3);
        let (db, mut trie) = memory_trie();
        for (k, v) in &entries {
            trie.insert(k, v.clone()).unwrap();
        }

        assert!(db.is_empty(), "mutation must not touch the store");
        let root = trie.commit();
        assert!(!db.is_empty());

        let reopened = Trie::open(db, root);
        for (k, v) in &entries {
            assert_eq!(reopened.get(k).unwrap().as_ref(), Some(v));
        }
    }

    #[test]
    fn mutating_a_reopened_trie_resolves_stored_nodes() {
        common_setup();
        let entries = random_entries(50, 4);
        let (db, mut trie) = memory_trie();
        for (k, v) in &entries {
            trie.insert(k, v.clone()).unwrap();
        }
        let root = trie.commit();

        // Delete one key through the store-resolved path and compare against
        // a trie built directly from the surviving entries.
        let victim = entries.keys().next().unwrap().clone();
        let mut reopened = Trie::open(db, root);
        assert!(reopened.remove(&victim).unwrap().is_some());

        let (_, mut expected) = memory_trie();
        for (k, v) in entries.iter().filter(|(k, _)| **k != victim) {
            expected.insert(k, v.clone()).unwrap();
        }
        assert_eq!(reopened.root_hash(), expected.root_hash());
    }

    #[test]
    fn open_at_unknown_root_reports_missing_node() {
        common_setup();
        let db: DatabaseHandle = Arc::new(MemoryDb::new());
        let bogus = H256::repeat_byte(0xaa);
        let trie = Trie::open(db, bogus);

        assert_eq!(trie.get(b"anything"), Err(TrieError::MissingNode(bogus)));
    }

    #[test]
    fn variable_length_index_keys() {
        common_setup();
        let (_, mut trie) = memory_trie();
        for index in 0usize..300 {
            trie.insert(&rlp::encode(&index), vec![index as u8 + 1; 3])
                .unwrap();
        }
        for index in 0usize..300 {
            assert_eq!(
                trie.get(&rlp::encode(&index)).unwrap(),
                Some(vec![index as u8 + 1; 3])
            );
        }
    }

    #[test]
    fn commit_is_idempotent() {
        common_setup();
        let (db, mut trie) = memory_trie();
        for (k, v) in random_entries(20, 5) {
            trie.insert(&k, v).unwrap();
        }
        let root = trie.commit();
        let entries_after_first = db.entries();
        assert_eq!(trie.commit(), root);
        assert_eq!(db.entries(), entries_after_first);
    }
}
