//! Intrusive doubly linked list backed by a container implementing
//! `std::ops::IndexMut`.
use core::{fmt, ops};

/// Circular linked list header.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct ListHead<Index> {
    pub first: Option<Index>,
}

impl<Index> Default for ListHead<Index> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Index: fmt::Debug> fmt::Debug for ListHead<Index> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ListHead({:?})", &self.first)
    }
}

impl<Index> ListHead<Index> {
    pub const fn new() -> Self {
        Self { first: None }
    }

    pub fn is_empty(&self) -> bool {
        self.first.is_none()
    }
}

/// Links to neighbor items.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Link<Index> {
    pub prev: Index,
    pub next: Index,
}

/// Accessor to a linked list whose head and elements are borrowed
/// separately. `map_link` projects an element to its link field.
///
/// Linking an element that is already linked, or unlinking an element that
/// isn't, is an internal invariant violation and panics.
pub struct ListAccessor<'a, Index, Pool: ?Sized, MapLink> {
    head: &'a mut ListHead<Index>,
    pool: &'a mut Pool,
    map_link: MapLink,
}

impl<'a, Index, Pool, MapLink, Element> ListAccessor<'a, Index, Pool, MapLink>
where
    Pool: ops::IndexMut<Index, Output = Element> + ?Sized,
    MapLink: Fn(&mut Element) -> &mut Option<Link<Index>>,
    Index: PartialEq + Copy,
    Element: 'a,
{
    pub fn new(head: &'a mut ListHead<Index>, pool: &'a mut Pool, map_link: MapLink) -> Self {
        ListAccessor {
            head,
            pool,
            map_link,
        }
    }

    #[inline]
    fn link(&mut self, item: Index) -> &mut Option<Link<Index>> {
        (self.map_link)(&mut self.pool[item])
    }

    #[inline]
    fn linked(&mut self, item: Index) -> Link<Index> {
        match *self.link(item) {
            Some(link) => link,
            None => unreachable!("the list is inconsistent"),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_empty()
    }

    pub fn pool(&mut self) -> &mut Pool {
        self.pool
    }

    #[inline]
    pub fn front(&self) -> Option<Index> {
        self.head.first
    }

    /// Get the element following `item`, or `None` if `item` is the last
    /// one.
    #[inline]
    pub fn next(&mut self, item: Index) -> Option<Index> {
        let next = self.linked(item).next;
        if Some(next) == self.head.first {
            None
        } else {
            Some(next)
        }
    }

    /// Insert `item` before the position `p` (if `at` is `Some(p)`) or to the
    /// the list's back (if `at` is `None`).
    pub fn insert(&mut self, item: Index, at: Option<Index>) {
        assert!(self.link(item).is_none(), "the item is already linked");

        if let Some(first) = self.head.first {
            let (next, update_first) = if let Some(at) = at {
                (at, at == first)
            } else {
                (first, false)
            };

            let prev = self.linked(next).prev;
            if let Some(link) = self.link(prev) {
                link.next = item;
            }
            if let Some(link) = self.link(next) {
                link.prev = item;
            }
            *self.link(item) = Some(Link { prev, next });

            if update_first {
                self.head.first = Some(item);
            }
        } else {
            debug_assert!(at.is_none());

            *self.link(item) = Some(Link {
                prev: item,
                next: item,
            });
            self.head.first = Some(item);
        }
    }

    #[inline]
    pub fn push_back(&mut self, item: Index) {
        self.insert(item, None)
    }

    #[inline]
    pub fn push_front(&mut self, item: Index) {
        let at = self.front();
        self.insert(item, at)
    }

    /// Remove `item` from the list. Returns `item`.
    pub fn remove(&mut self, item: Index) -> Index {
        let link = self.linked(item);

        if self.head.first == Some(item) {
            if link.next == item {
                // The list just became empty
                self.head.first = None;
                *self.link(item) = None;
                return item;
            }

            // Move the head pointer
            self.head.first = Some(link.next);
        }

        if let Some(l) = self.link(link.prev) {
            l.next = link.next;
        }
        if let Some(l) = self.link(link.next) {
            l.prev = link.prev;
        }
        *self.link(item) = None;

        item
    }

    /// Find the first element satisfying `pred`.
    pub fn find(&mut self, mut pred: impl FnMut(Index, &mut Element) -> bool) -> Option<Index> {
        let mut cur = self.front();
        while let Some(p) = cur {
            if pred(p, &mut self.pool[p]) {
                return Some(p);
            }
            cur = self.next(p);
        }
        None
    }

    /// Visit the elements from front to back.
    pub fn for_each(&mut self, mut f: impl FnMut(Index, &mut Element)) {
        let mut cur = self.front();
        while let Some(p) = cur {
            let next = self.next(p);
            f(p, &mut self.pool[p]);
            cur = next;
        }
    }
}
