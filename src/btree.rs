//! # B+ Tree Index
//!
//! An in-memory sorted index with fixed fanout `B` (default 128), used
//! by [`crate::store::Store`] as a read-optimized cache over the LSM
//! tree. Inner nodes hold up to `B` keys and `B+1` children; leaves hold
//! up to `B` key/value pairs and are chained left-to-right for
//! sequential range walks.
//!
//! Nodes live in a flat arena (`Vec<Node<K, V>>`) addressed by index
//! rather than as an owning tree of raw pointers — this is a tagged
//! two-variant enum over one arena, not a base class distinguishing leaf
//! and inner nodes by a runtime flag.

use std::cmp::Ordering;

/// Default fanout, matching the reference engine's compile-time B=128.
pub const DEFAULT_FANOUT: usize = 128;

/// Errors raised by [`BPlusTree`].
///
/// The tree is a pure in-memory structure with no I/O; in ordinary
/// operation it cannot fail. This exists for completeness and for
/// debug-assertion-style arena-corruption checks exercised only in
/// tests.
#[derive(Debug, thiserror::Error)]
pub enum BTreeError {
    /// An arena index pointed outside the arena — would indicate an
    /// internal bug in the split/insert logic, never user error.
    #[error("corrupt arena: dangling node reference")]
    CorruptArena,
}

enum Node<K, V> {
    Inner {
        keys: Vec<K>,
        /// `children.len() == keys.len() + 1`.
        children: Vec<usize>,
    },
    Leaf {
        keys: Vec<K>,
        values: Vec<V>,
        next_leaf: Option<usize>,
    },
}

/// A balanced, arena-backed B+ tree with fanout `B`.
///
/// `insert`/`find`/`range` form the public contract; leaves are linked
/// left-to-right so `range` walks without re-descending from the root
/// for each key.
pub struct BPlusTree<K, V, const B: usize = DEFAULT_FANOUT> {
    arena: Vec<Node<K, V>>,
    root: usize,
    height: usize,
    len: usize,
}

/// Convenience alias matching the reference engine's default fanout.
pub type BPlusTree128<K, V> = BPlusTree<K, V, DEFAULT_FANOUT>;

impl<K, V, const B: usize> Default for BPlusTree<K, V, B>
where
    K: Ord + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, const B: usize> BPlusTree<K, V, B>
where
    K: Ord + Clone,
{
    /// Creates an empty tree with a single empty leaf as its root.
    pub fn new() -> Self {
        assert!(B >= 2, "fanout must be at least 2");
        let root_leaf = Node::Leaf {
            keys: Vec::new(),
            values: Vec::new(),
            next_leaf: None,
        };
        Self {
            arena: vec![root_leaf],
            root: 0,
            height: 1,
            len: 0,
        }
    }

    /// Number of key/value pairs stored.
    pub fn len(&self) -> usize {
        self.len
    }

    /// `true` if the tree holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Height of the tree (1 for a single leaf root).
    pub fn height(&self) -> usize {
        self.height
    }

    /// Inserts or overwrites `key` with `value`.
    pub fn insert(&mut self, key: K, value: V) {
        if let Some((split_key, new_node)) = self.insert_helper(self.root, key, value) {
            let old_root = self.root;
            let new_root = Node::Inner {
                keys: vec![split_key],
                children: vec![old_root, new_node],
            };
            self.arena.push(new_root);
            self.root = self.arena.len() - 1;
            self.height += 1;
        }
    }

    /// Looks up `key`, returning a reference to its value if present.
    pub fn find(&self, key: &K) -> Option<&V> {
        let mut node_idx = self.root;
        loop {
            match &self.arena[node_idx] {
                Node::Inner { keys, children } => {
                    let pos = upper_bound(keys, key);
                    node_idx = children[pos];
                }
                Node::Leaf { keys, values, .. } => {
                    return match keys.binary_search(key) {
                        Ok(pos) => Some(&values[pos]),
                        Err(_) => None,
                    };
                }
            }
        }
    }

    /// Returns every `(key, value)` pair with `lo <= key <= hi`, in
    /// ascending key order.
    pub fn range(&self, lo: &K, hi: &K) -> Vec<(K, V)>
    where
        K: Clone,
        V: Clone,
    {
        let mut out = Vec::new();
        if lo.cmp(hi) == Ordering::Greater {
            return out;
        }

        let mut leaf_idx = self.find_leaf_for(lo);
        loop {
            let Node::Leaf {
                keys,
                values,
                next_leaf,
            } = &self.arena[leaf_idx]
            else {
                unreachable!("find_leaf_for always returns a leaf index");
            };

            for (k, v) in keys.iter().zip(values.iter()) {
                if k < lo {
                    continue;
                }
                if k > hi {
                    return out;
                }
                out.push((k.clone(), v.clone()));
            }

            match next_leaf {
                Some(next) => leaf_idx = *next,
                None => return out,
            }
        }
    }

    fn find_leaf_for(&self, key: &K) -> usize {
        let mut node_idx = self.root;
        loop {
            match &self.arena[node_idx] {
                Node::Inner { keys, children } => {
                    let pos = upper_bound(keys, key);
                    node_idx = children[pos];
                }
                Node::Leaf { .. } => return node_idx,
            }
        }
    }

    /// Recursively inserts into the subtree rooted at `node_idx`.
    ///
    /// Returns `Some((split_key, new_right_sibling_idx))` if the node
    /// overflowed and split; the caller is responsible for inserting the
    /// split into its own parent (or creating a new root).
    fn insert_helper(&mut self, node_idx: usize, key: K, value: V) -> Option<(K, usize)> {
        match &self.arena[node_idx] {
            Node::Leaf { keys, .. } => {
                let pos = match keys.binary_search(&key) {
                    Ok(pos) => pos,
                    Err(pos) => pos,
                };
                let is_update = keys.get(pos).is_some_and(|k| k == &key);

                if is_update {
                    if let Node::Leaf { values, .. } = &mut self.arena[node_idx] {
                        values[pos] = value;
                    }
                    return None;
                }

                if let Node::Leaf { keys, values, .. } = &mut self.arena[node_idx] {
                    keys.insert(pos, key);
                    values.insert(pos, value);
                }
                self.len += 1;

                let overflow = matches!(&self.arena[node_idx], Node::Leaf { keys, .. } if keys.len() > B);
                if !overflow {
                    return None;
                }
                self.split_leaf(node_idx)
            }
            Node::Inner { keys, .. } => {
                let pos = upper_bound(keys, &key);
                let child_idx = match &self.arena[node_idx] {
                    Node::Inner { children, .. } => children[pos],
                    _ => unreachable!(),
                };

                let split = self.insert_helper(child_idx, key, value)?;
                self.insert_into_inner(node_idx, pos, split)
            }
        }
    }

    fn split_leaf(&mut self, node_idx: usize) -> Option<(K, usize)> {
        let Node::Leaf {
            keys,
            values,
            next_leaf,
        } = &mut self.arena[node_idx]
        else {
            unreachable!()
        };

        let mid = keys.len() / 2;
        let right_keys = keys.split_off(mid);
        let right_values = values.split_off(mid);
        let old_next = *next_leaf;
        let split_key = right_keys[0].clone();

        let right_leaf = Node::Leaf {
            keys: right_keys,
            values: right_values,
            next_leaf: old_next,
        };
        self.arena.push(right_leaf);
        let right_idx = self.arena.len() - 1;

        if let Node::Leaf { next_leaf, .. } = &mut self.arena[node_idx] {
            *next_leaf = Some(right_idx);
        }

        Some((split_key, right_idx))
    }

    /// Inserts a `(split_key, new_child)` pair at position `child_pos + 1`
    /// in the inner node at `node_idx`, splitting it in turn if it now
    /// overflows.
    fn insert_into_inner(
        &mut self,
        node_idx: usize,
        child_pos: usize,
        (split_key, new_child): (K, usize),
    ) -> Option<(K, usize)> {
        if let Node::Inner { keys, children } = &mut self.arena[node_idx] {
            keys.insert(child_pos, split_key);
            children.insert(child_pos + 1, new_child);
        }

        let overflow = matches!(&self.arena[node_idx], Node::Inner { keys, .. } if keys.len() > B);
        if !overflow {
            return None;
        }
        self.split_inner(node_idx)
    }

    fn split_inner(&mut self, node_idx: usize) -> Option<(K, usize)> {
        let Node::Inner { keys, children } = &mut self.arena[node_idx] else {
            unreachable!()
        };

        // Middle key is promoted to the parent (not duplicated, unlike
        // the leaf split — inner nodes don't store values).
        let mid = keys.len() / 2;
        let split_key = keys[mid].clone();

        let right_keys = keys.split_off(mid + 1);
        keys.pop(); // drop the promoted key from the left node
        let right_children = children.split_off(mid + 1);

        let right_inner = Node::Inner {
            keys: right_keys,
            children: right_children,
        };
        self.arena.push(right_inner);
        let right_idx = self.arena.len() - 1;

        Some((split_key, right_idx))
    }
}

/// Position of the first key strictly greater than `key` (i.e. the
/// child index to descend into for an inner node's `upper_bound` search).
fn upper_bound<K: Ord>(keys: &[K], key: &K) -> usize {
    keys.partition_point(|k| k <= key)
}
