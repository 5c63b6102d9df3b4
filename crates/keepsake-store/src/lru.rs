use crate::arena::Arena;
use crate::entry::Entry;
use std::collections::HashMap;

/// Access-ordered index of store entries.
///
/// Looking an entry up through [`LruIndex::touch`] moves it to the head of the
/// list; eviction and journal rebuilds walk from the tail (least recently used).
/// All methods take `&mut self`; the store serializes access under its mutex.
pub(crate) struct LruIndex {
    arena: Arena<Entry>,
    map: HashMap<String, u32, ahash::RandomState>,
}

impl LruIndex {
    pub fn new() -> Self {
        Self {
            arena: Arena::new(),
            map: HashMap::with_hasher(ahash::RandomState::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.arena.len()
    }

    /// Look up without changing recency.
    pub fn get(&self, key: &str) -> Option<&Entry> {
        let index = *self.map.get(key)?;
        self.arena.get(index).map(|node| &node.value)
    }

    /// Mutable lookup without changing recency.
    pub fn get_mut(&mut self, key: &str) -> Option<&mut Entry> {
        let index = *self.map.get(key)?;
        self.arena.get_mut(index).map(|node| &mut node.value)
    }

    /// Look up and promote to most recently used.
    pub fn touch(&mut self, key: &str) -> Option<&mut Entry> {
        let index = *self.map.get(key)?;
        self.arena.move_to_head(index);
        self.arena.get_mut(index).map(|node| &mut node.value)
    }

    /// Return the entry for `key`, creating it at the head if absent.
    pub fn get_or_insert(&mut self, key: &str, slot_count: usize) -> &mut Entry {
        let index = match self.map.get(key) {
            Some(&index) => {
                self.arena.move_to_head(index);
                index
            }
            None => {
                let index = self.arena.push_head(Entry::new(key.to_string(), slot_count));
                self.map.insert(key.to_string(), index);
                index
            }
        };
        &mut self
            .arena
            .get_mut(index)
            .expect("index map points at a live arena slot")
            .value
    }

    pub fn remove(&mut self, key: &str) -> Option<Entry> {
        let index = self.map.remove(key)?;
        self.arena.remove(index).map(|node| node.value)
    }

    /// Entries from least to most recently used.
    pub fn iter_lru(&self) -> impl Iterator<Item = &Entry> {
        self.arena.iter_from_tail().map(|(_, entry)| entry)
    }

    /// Keys from least to most recently used. Copied so callers may mutate
    /// the index while walking them.
    pub fn keys_lru(&self) -> Vec<String> {
        self.iter_lru().map(|entry| entry.key.clone()).collect()
    }

    /// Keys of entries with an edit in flight.
    pub fn keys_with_editors(&self) -> Vec<(String, u64)> {
        self.iter_lru()
            .filter_map(|entry| entry.current_editor.map(|id| (entry.key.clone(), id)))
            .collect()
    }
}
