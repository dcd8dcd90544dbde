use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;

use rand::seq::SliceRandom;
use rand::Rng;
use serde::de::{SeqAccess, Visitor};
use serde::ser::SerializeSeq;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Stable handle to a position in an [`OrderedMap`].
///
/// Handles stay valid until the entry they point at is removed. `swap`
/// exchanges the entries held by two positions, so after a swap a handle
/// refers to the other entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

#[derive(Debug, Clone)]
struct Node<V> {
    keys: Vec<String>,
    value: V,
    prev: Option<usize>,
    next: Option<usize>,
}

/// An insertion-ordered map where a single entry is reachable through one or
/// more string keys. The order of entries is the priority order of the queue:
/// earlier entries are higher priority.
///
/// Backed by an arena of nodes linked by indices, so cursor traversal, swap
/// and removal are O(1) and no unsafe pointer juggling is needed.
#[derive(Debug, Clone)]
pub struct OrderedMap<V> {
    arena: Vec<Option<Node<V>>>,
    free: Vec<usize>,
    index: HashMap<String, usize>,
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

impl<V> Default for OrderedMap<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> OrderedMap<V> {
    pub fn new() -> Self {
        Self {
            arena: Vec::new(),
            free: Vec::new(),
            index: HashMap::new(),
            head: None,
            tail: None,
            len: 0,
        }
    }

    /// Number of entries (not keys).
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of live keys across all entries.
    pub fn key_count(&self) -> usize {
        self.index.len()
    }

    /// Appends an entry reachable through all of `keys` at the tail (lowest
    /// priority). Any entry already reachable through one of the keys is
    /// removed first, so every key maps to at most one entry.
    pub fn insert(&mut self, keys: Vec<String>, value: V) -> NodeId {
        for key in &keys {
            if let Some(&slot) = self.index.get(key) {
                self.remove_node(slot);
            }
        }
        let slot = self.allocate(Node {
            keys: keys.clone(),
            value,
            prev: self.tail,
            next: None,
        });
        match self.tail {
            Some(tail) => self.node_mut(tail).next = Some(slot),
            None => self.head = Some(slot),
        }
        self.tail = Some(slot);
        self.len += 1;
        for key in keys {
            self.index.insert(key, slot);
        }
        NodeId(slot)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&V> {
        self.index.get(key).map(|&slot| &self.node(slot).value)
    }

    pub fn get_node(&self, key: &str) -> Option<NodeId> {
        self.index.get(key).copied().map(NodeId)
    }

    /// Removes a single key. The entry itself is dropped only when this was
    /// its last remaining key. Returns true if the key existed.
    pub fn remove(&mut self, key: &str) -> bool {
        let Some(slot) = self.index.remove(key) else {
            return false;
        };
        let node = self.node_mut(slot);
        node.keys.retain(|k| k != key);
        if node.keys.is_empty() {
            self.unlink(slot);
            self.release(slot);
            self.len -= 1;
        }
        true
    }

    /// Removes an entry and all of its keys atomically.
    pub fn remove_entry(&mut self, id: NodeId) {
        self.remove_node(id.0);
    }

    pub fn front(&self) -> Option<NodeId> {
        self.head.map(NodeId)
    }

    pub fn back(&self) -> Option<NodeId> {
        self.tail.map(NodeId)
    }

    pub fn next(&self, id: NodeId) -> Option<NodeId> {
        self.node(id.0).next.map(NodeId)
    }

    pub fn prev(&self, id: NodeId) -> Option<NodeId> {
        self.node(id.0).prev.map(NodeId)
    }

    pub fn keys_of(&self, id: NodeId) -> &[String] {
        &self.node(id.0).keys
    }

    pub fn value(&self, id: NodeId) -> &V {
        &self.node(id.0).value
    }

    pub fn value_mut(&mut self, id: NodeId) -> &mut V {
        &mut self.node_mut(id.0).value
    }

    /// Exchanges the entries held at two positions in O(1) of the list; the
    /// links of every other node are untouched.
    pub fn swap(&mut self, a: NodeId, b: NodeId) {
        if a == b {
            return;
        }
        {
            let (a_slot, b_slot) = (a.0, b.0);
            let (low, high) = if a_slot < b_slot {
                (a_slot, b_slot)
            } else {
                (b_slot, a_slot)
            };
            let (left, right) = self.arena.split_at_mut(high);
            let low_node = left[low].as_mut().unwrap_or_else(|| unreachable!());
            let high_node = right[0].as_mut().unwrap_or_else(|| unreachable!());
            std::mem::swap(&mut low_node.keys, &mut high_node.keys);
            std::mem::swap(&mut low_node.value, &mut high_node.value);
        }
        for key in self.node(a.0).keys.clone() {
            self.index.insert(key, a.0);
        }
        for key in self.node(b.0).keys.clone() {
            self.index.insert(key, b.0);
        }
    }

    /// Randomizes entry order in O(n).
    pub fn shuffle<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        if self.len < 2 {
            return;
        }
        let mut order: Vec<usize> = Vec::with_capacity(self.len);
        let mut cursor = self.head;
        while let Some(slot) = cursor {
            order.push(slot);
            cursor = self.node(slot).next;
        }
        order.shuffle(rng);
        self.relink(&order);
    }

    /// Iterates entries in priority order.
    pub fn iter(&self) -> Iter<'_, V> {
        Iter {
            map: self,
            cursor: self.head,
        }
    }

    fn relink(&mut self, order: &[usize]) {
        self.head = order.first().copied();
        self.tail = order.last().copied();
        for (pos, &slot) in order.iter().enumerate() {
            let node = self.node_mut(slot);
            node.prev = if pos == 0 {
                None
            } else {
                Some(order[pos - 1])
            };
            node.next = order.get(pos + 1).copied();
        }
    }

    fn remove_node(&mut self, slot: usize) {
        let keys = std::mem::take(&mut self.node_mut(slot).keys);
        for key in &keys {
            if self.index.get(key) == Some(&slot) {
                self.index.remove(key);
            }
        }
        self.unlink(slot);
        self.release(slot);
        self.len -= 1;
    }

    fn unlink(&mut self, slot: usize) {
        let (prev, next) = {
            let node = self.node(slot);
            (node.prev, node.next)
        };
        match prev {
            Some(p) => self.node_mut(p).next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.node_mut(n).prev = prev,
            None => self.tail = prev,
        }
    }

    fn allocate(&mut self, node: Node<V>) -> usize {
        match self.free.pop() {
            Some(slot) => {
                self.arena[slot] = Some(node);
                slot
            }
            None => {
                self.arena.push(Some(node));
                self.arena.len() - 1
            }
        }
    }

    fn release(&mut self, slot: usize) {
        self.arena[slot] = None;
        self.free.push(slot);
    }

    fn node(&self, slot: usize) -> &Node<V> {
        self.arena[slot]
            .as_ref()
            .unwrap_or_else(|| panic!("stale node handle {slot}"))
    }

    fn node_mut(&mut self, slot: usize) -> &mut Node<V> {
        self.arena[slot]
            .as_mut()
            .unwrap_or_else(|| panic!("stale node handle {slot}"))
    }
}

#[derive(Serialize)]
struct EntryRef<'a, V> {
    keys: &'a [String],
    item: &'a V,
}

#[derive(Deserialize)]
struct EntryOwned<V> {
    keys: Vec<String>,
    item: V,
}

impl<V: Serialize> Serialize for OrderedMap<V> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.len))?;
        for (keys, item) in self.iter() {
            seq.serialize_element(&EntryRef { keys, item })?;
        }
        seq.end()
    }
}

impl<'de, V: Deserialize<'de>> Deserialize<'de> for OrderedMap<V> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct MapVisitor<V>(PhantomData<V>);

        impl<'de, V: Deserialize<'de>> Visitor<'de> for MapVisitor<V> {
            type Value = OrderedMap<V>;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a sequence of {keys, item} records")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
                let mut map = OrderedMap::new();
                while let Some(entry) = seq.next_element::<EntryOwned<V>>()? {
                    map.insert(entry.keys, entry.item);
                }
                Ok(map)
            }
        }

        deserializer.deserialize_seq(MapVisitor(PhantomData))
    }
}

pub struct Iter<'a, V> {
    map: &'a OrderedMap<V>,
    cursor: Option<usize>,
}

impl<'a, V> Iterator for Iter<'a, V> {
    type Item = (&'a [String], &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        let slot = self.cursor?;
        let node = self.map.node(slot);
        self.cursor = node.next;
        Some((node.keys.as_slice(), &node.value))
    }
}
