/// Sentinel value indicating "no node" (null pointer equivalent).
pub const NIL: u32 = u32::MAX;

/// A node in the arena-allocated doubly-linked list.
pub struct Node<T> {
    pub value: T,
    pub prev: u32,
    pub next: u32,
}

impl<T> Node<T> {
    pub fn new(value: T) -> Self {
        Self {
            value,
            prev: NIL,
            next: NIL,
        }
    }
}

/// Arena-allocated doubly-linked list.
///
/// Nodes are stored in a `Vec<Option<Node<T>>>`. Indices (`u32`) serve as pointers.
/// A free-list tracks reclaimed slots for O(1) allocation. Unlike a fixed-capacity
/// cache arena, the store is bounded by bytes rather than entry count, so the slot
/// vector grows on demand when the free list is empty.
///
/// Head is the most recently used node, tail the least recently used.
pub struct Arena<T> {
    slots: Vec<Option<Node<T>>>,
    free_list: Vec<u32>,
    pub head: u32,
    pub tail: u32,
    len: usize,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Arena<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_list: Vec::new(),
            head: NIL,
            tail: NIL,
            len: 0,
        }
    }

    /// Number of active (occupied) nodes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn get(&self, index: u32) -> Option<&Node<T>> {
        self.slots.get(index as usize).and_then(|s| s.as_ref())
    }

    #[inline]
    pub fn get_mut(&mut self, index: u32) -> Option<&mut Node<T>> {
        self.slots.get_mut(index as usize).and_then(|s| s.as_mut())
    }

    fn set_prev(&mut self, index: u32, prev: u32) {
        if let Some(node) = self.get_mut(index) {
            node.prev = prev;
        }
    }

    fn set_next(&mut self, index: u32, next: u32) {
        if let Some(node) = self.get_mut(index) {
            node.next = next;
        }
    }

    fn allocate(&mut self) -> u32 {
        match self.free_list.pop() {
            Some(index) => index,
            None => {
                self.slots.push(None);
                (self.slots.len() - 1) as u32
            }
        }
    }

    /// Allocate a new node and insert it at the head of the list.
    /// Returns the index of the new node.
    pub fn push_head(&mut self, value: T) -> u32 {
        let index = self.allocate();
        let old_head = self.head;

        let mut node = Node::new(value);
        node.next = old_head;
        self.slots[index as usize] = Some(node);

        if old_head != NIL {
            self.set_prev(old_head, index);
        }
        self.head = index;
        if self.tail == NIL {
            self.tail = index;
        }

        self.len += 1;
        index
    }

    /// Unlink a node from its neighbours without freeing its slot.
    fn unlink(&mut self, index: u32) {
        let Some(node) = self.get(index) else {
            return;
        };
        let (prev, next) = (node.prev, node.next);

        if prev != NIL {
            self.set_next(prev, next);
        } else {
            self.head = next;
        }

        if next != NIL {
            self.set_prev(next, prev);
        } else {
            self.tail = prev;
        }
    }

    /// Remove a node from the list and return it. The slot is reclaimed.
    pub fn remove(&mut self, index: u32) -> Option<Node<T>> {
        self.get(index)?;
        self.unlink(index);
        let node = self.slots[index as usize].take()?;
        self.free_list.push(index);
        self.len -= 1;
        Some(node)
    }

    /// Move an existing node to the head of the list.
    pub fn move_to_head(&mut self, index: u32) {
        if self.head == index || self.get(index).is_none() {
            return;
        }

        self.unlink(index);

        let old_head = self.head;
        if let Some(node) = self.get_mut(index) {
            node.prev = NIL;
            node.next = old_head;
        }
        if old_head != NIL {
            self.set_prev(old_head, index);
        }
        self.head = index;
        if self.tail == NIL {
            self.tail = index;
        }
    }

    /// Iterate from the tail (least recently used) toward the head.
    pub fn iter_from_tail(&self) -> FromTail<'_, T> {
        FromTail {
            arena: self,
            cursor: self.tail,
        }
    }
}

/// Iterator walking `prev` pointers from the tail of an [`Arena`].
pub struct FromTail<'a, T> {
    arena: &'a Arena<T>,
    cursor: u32,
}

impl<'a, T> Iterator for FromTail<'a, T> {
    type Item = (u32, &'a T);

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor == NIL {
            return None;
        }
        let index = self.cursor;
        let node = self.arena.get(index)?;
        self.cursor = node.prev;
        Some((index, &node.value))
    }
}
