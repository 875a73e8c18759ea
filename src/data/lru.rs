/// Arena-backed intrusive LRU list.
///
/// Slots live in a `Vec` and link to each other through `prev`/`next`
/// indices, so entries can be unlinked or relinked without invalidating
/// the ids callers hold on other entries. The front is the most recently
/// used end; eviction scans walk from the back through [`LruList::prev_of`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId(usize);

#[derive(Debug)]
struct Slot<T> {
    value: Option<T>,
    prev: Option<usize>,
    next: Option<usize>,
}

#[derive(Debug)]
pub struct LruList<T> {
    slots: Vec<Slot<T>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

impl<T> LruList<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn push_front(&mut self, value: T) -> SlotId {
        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Slot {
                    value: Some(value),
                    prev: None,
                    next: self.head,
                };
                idx
            }
            None => {
                self.slots.push(Slot {
                    value: Some(value),
                    prev: None,
                    next: self.head,
                });
                self.slots.len() - 1
            }
        };
        if let Some(old_head) = self.head {
            self.slots[old_head].prev = Some(idx);
        } else {
            self.tail = Some(idx);
        }
        self.head = Some(idx);
        self.len += 1;
        SlotId(idx)
    }

    pub fn remove(&mut self, id: SlotId) -> T {
        self.unlink(id.0);
        self.free.push(id.0);
        self.len -= 1;
        self.slots[id.0]
            .value
            .take()
            .unwrap_or_else(|| panic!("lru slot {} already vacated", id.0))
    }

    /// Move an entry to the front without touching its value.
    pub fn touch(&mut self, id: SlotId) {
        if self.head == Some(id.0) {
            return;
        }
        self.unlink(id.0);
        self.slots[id.0].prev = None;
        self.slots[id.0].next = self.head;
        if let Some(old_head) = self.head {
            self.slots[old_head].prev = Some(id.0);
        } else {
            self.tail = Some(id.0);
        }
        self.head = Some(id.0);
    }

    pub fn front(&self) -> Option<SlotId> {
        self.head.map(SlotId)
    }

    pub fn back(&self) -> Option<SlotId> {
        self.tail.map(SlotId)
    }

    /// The entry one step toward the front of `id`, or None at the head.
    pub fn prev_of(&self, id: SlotId) -> Option<SlotId> {
        self.slots[id.0].prev.map(SlotId)
    }

    pub fn get(&self, id: SlotId) -> &T {
        self.slots[id.0]
            .value
            .as_ref()
            .unwrap_or_else(|| panic!("lru slot {} already vacated", id.0))
    }

    pub fn get_mut(&mut self, id: SlotId) -> &mut T {
        self.slots[id.0]
            .value
            .as_mut()
            .unwrap_or_else(|| panic!("lru slot {} already vacated", id.0))
    }

    /// Iterate front-to-back. Used by tests and by directory-wide sweeps.
    pub fn iter(&self) -> impl Iterator<Item = (SlotId, &T)> {
        let mut cur = self.head;
        std::iter::from_fn(move || {
            let idx = cur?;
            cur = self.slots[idx].next;
            Some((SlotId(idx), self.slots[idx].value.as_ref().expect("linked slot vacated")))
        })
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = (self.slots[idx].prev, self.slots[idx].next);
        match prev {
            Some(p) => self.slots[p].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.slots[n].prev = prev,
            None => self.tail = prev,
        }
        self.slots[idx].prev = None;
        self.slots[idx].next = None;
    }
}

impl<T> Default for LruList<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order<T: Copy>(list: &LruList<T>) -> Vec<T> {
        list.iter().map(|(_, v)| *v).collect()
    }

    #[test]
    fn push_touch_remove_keep_links_consistent() {
        let mut list = LruList::new();
        let a = list.push_front('a');
        let b = list.push_front('b');
        let c = list.push_front('c');
        assert_eq!(order(&list), vec!['c', 'b', 'a']);
        assert_eq!(list.back(), Some(a));

        list.touch(a);
        assert_eq!(order(&list), vec!['a', 'c', 'b']);
        assert_eq!(list.back(), Some(b));

        assert_eq!(list.remove(c), 'c');
        assert_eq!(order(&list), vec!['a', 'b']);
        assert_eq!(list.len(), 2);

        // freed slot is reused
        let d = list.push_front('d');
        assert_eq!(order(&list), vec!['d', 'a', 'b']);
        assert_eq!(list.back(), Some(b));
        list.touch(b);
        assert_eq!(order(&list), vec!['b', 'd', 'a']);
        assert_eq!(*list.get(d), 'd');
    }

    #[test]
    fn back_to_front_walk_survives_removal() {
        let mut list = LruList::new();
        let ids: Vec<_> = (0..5).map(|i| list.push_front(i)).collect();
        let _ = ids;

        // emulate an eviction sweep: compute the next candidate before
        // removing the current one
        let mut cur = list.back();
        let mut removed = Vec::new();
        while let Some(id) = cur {
            let next = list.prev_of(id);
            if *list.get(id) % 2 == 0 {
                removed.push(list.remove(id));
            }
            cur = next;
        }
        assert_eq!(removed, vec![0, 2, 4]);
        assert_eq!(order(&list), vec![3, 1]);
    }
}
