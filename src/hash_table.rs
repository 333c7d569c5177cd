use alloc::alloc::handle_alloc_error;
use alloc::vec::Vec;
use core::alloc::Layout;
use core::fmt::Debug;
use core::iter::FusedIterator;
use core::ptr::NonNull;

use crate::allocator::Allocator;
use crate::allocator::Global;
use crate::error::Error;
use crate::hash::hashcode;
use crate::node::EntryRef;
use crate::node::Node;

/// Smallest bucket count a table may have.
pub const MIN_CAPACITY: usize = 4;

/// A new key is only inserted below this occupancy; at or above it the bucket
/// array doubles first.
const MAX_OCCUPANCY_PERCENTAGE: usize = 61;

/// Head of a bucket chain. `None` is an empty bucket.
///
/// `Option<NonNull<_>>` is guaranteed to be pointer sized with `None`
/// represented as null, so a zeroed bucket array is an array of empty buckets.
type Link = Option<NonNull<Node>>;

#[inline(always)]
fn occupancy_limit(capacity: usize) -> usize {
    ((capacity as u128 * MAX_OCCUPANCY_PERCENTAGE as u128) / 100) as usize
}

fn bucket_layout(capacity: usize) -> Result<Layout, Error> {
    Layout::array::<Link>(capacity).map_err(|_| Error::CapacityOverflow)
}

/// Layout of a bucket array that was successfully allocated.
#[inline]
fn live_bucket_layout(capacity: usize) -> Layout {
    match bucket_layout(capacity) {
        Ok(layout) => layout,
        Err(_) => unreachable!("live bucket array with unrepresentable layout"),
    }
}

fn allocate_buckets<A: Allocator>(alloc: &A, capacity: usize) -> Result<NonNull<Link>, Error> {
    let layout = bucket_layout(capacity)?;
    let raw = alloc.allocate(layout).ok_or(Error::OutOfMemory {
        size: layout.size(),
    })?;

    // SAFETY: The block is `layout.size()` bytes long, and all-zero bytes are
    // a valid `None` for every bucket.
    unsafe {
        core::ptr::write_bytes(raw.as_ptr(), 0x0, layout.size());
    }

    Ok(raw.cast())
}

/// Makes `node` the head of the chain at `head`, splicing it between the old
/// head and the old head's successor.
///
/// # Safety
///
/// `node` must be live and not linked into any chain, and every record
/// reachable from `head` must be live.
#[inline]
unsafe fn link(head: &mut Link, node: NonNull<Node>) {
    // SAFETY: The caller guarantees all touched records are live.
    unsafe {
        match *head {
            None => {
                (*node.as_ptr()).next = node;
                (*node.as_ptr()).prev = node;
            }
            Some(old) => {
                let next = old.as_ref().next;
                (*node.as_ptr()).prev = old;
                (*node.as_ptr()).next = next;
                (*next.as_ptr()).prev = node;
                (*old.as_ptr()).next = node;
            }
        }
    }
    *head = Some(node);
}

/// Removes `node` from the chain at `head`. If `node` was the head, its
/// successor becomes the head; if it was alone, the bucket becomes empty.
///
/// # Safety
///
/// `node` must be live and linked into the chain at `head`.
#[inline]
unsafe fn unlink(head: &mut Link, node: NonNull<Node>) {
    // SAFETY: The caller guarantees `node` and its neighbours are live.
    unsafe {
        let next = node.as_ref().next;
        if next == node {
            debug_assert!(*head == Some(node) && node.as_ref().prev == node);
            *head = None;
        } else {
            let prev = node.as_ref().prev;
            if *head == Some(node) {
                *head = Some(next);
            }
            (*prev.as_ptr()).next = next;
            (*next.as_ptr()).prev = prev;
        }

        (*node.as_ptr()).next = node;
        (*node.as_ptr()).prev = node;
    }
}

/// Debug statistics for hash table analysis.
///
/// Available in tests and with the `stats` feature.
#[cfg(any(test, feature = "stats"))]
#[derive(Debug, Clone)]
pub struct DebugStats {
    /// Number of entries currently in the table
    pub populated: usize,
    /// Number of buckets
    pub capacity: usize,
    /// Number of buckets with a non-empty chain
    pub occupied_buckets: usize,
    /// Length of the longest chain
    pub longest_chain: usize,
    /// Occupancy ratio (populated / capacity)
    pub load_factor: f64,
    /// Bytes held in entry records, headers included
    pub entry_bytes: usize,
    /// Bytes held by the bucket array
    pub bucket_bytes: usize,
}

#[cfg(any(test, feature = "stats"))]
impl DebugStats {
    /// Pretty-print the debug statistics.
    #[cfg(feature = "std")]
    pub fn print(&self) {
        println!("=== Hash Table Debug Statistics ===");
        println!(
            "Population: {}/{} ({:.2}% occupancy)",
            self.populated,
            self.capacity,
            self.load_factor * 100.0
        );
        println!(
            "Buckets: {}/{} occupied, longest chain {}",
            self.occupied_buckets, self.capacity, self.longest_chain
        );
        println!(
            "Memory: {} bytes in entries, {} bytes in buckets",
            self.entry_bytes, self.bucket_bytes
        );
    }
}

/// A hash table from byte-string keys to byte-string values, resolving
/// collisions with a circular doubly-linked chain per bucket.
///
/// Keys and values are copied into the table as opaque bytes; both must be
/// non-empty and at most `i32::MAX` bytes long. Each key-value pair lives in
/// its own record obtained from the table's [`Allocator`], and records are
/// never moved by a resize: growing or shrinking the bucket array only relinks
/// chain pointers. A value's address therefore stays fixed until its key is
/// removed or re-put with a value of a different length (see
/// [`EntryRef::value_ptr`]).
///
/// Keys are hashed with [`hashcode`](crate::hashcode), which is unseeded.
///
/// ## Capacity
///
/// Capacity counts buckets, never fewer than [`MIN_CAPACITY`]. Before a new
/// key is inserted, the bucket array doubles if the table already holds at
/// least 61% of its capacity. After a removal, the array halves if at least
/// `2 * MIN_CAPACITY` buckets exist and fewer than 30.5% of them are in use.
/// Shrinking is best effort: if the allocator refuses the smaller array, the
/// table keeps the larger one.
///
/// ## Threading
///
/// The table has no internal synchronization. It is `Send` and `Sync` when
/// its allocator is, so it can be moved between threads or wrapped in a lock,
/// but every mutation requires `&mut self`.
///
/// ## Example
///
/// ```rust
/// use chain_hash::HashTable;
///
/// let mut table = HashTable::with_capacity(4);
/// table.put(b"hello\0", b"world\0").unwrap();
///
/// let entry = table.get(b"hello\0").unwrap();
/// assert_eq!(entry.value(), b"world\0");
///
/// assert!(table.remove(b"hello\0"));
/// assert!(table.get(b"hello\0").is_none());
/// ```
pub struct HashTable<A: Allocator = Global> {
    buckets: NonNull<Link>,
    capacity: usize,
    populated: usize,
    modifications: u64,
    alloc: A,
    _phantom: core::marker::PhantomData<Node>,
}

// SAFETY: The table exclusively owns its bucket array and every record in it;
// nothing is shared with other tables except the allocator.
unsafe impl<A: Allocator + Send> Send for HashTable<A> {}

// SAFETY: `&self` methods only read records and the bucket array, and may call
// no allocator method.
unsafe impl<A: Allocator + Sync> Sync for HashTable<A> {}

impl<A: Allocator> Debug for HashTable<A> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HashTable")
            .field("populated", &self.populated)
            .field("capacity", &self.capacity)
            .field("modifications", &self.modifications)
            .field(
                "chains",
                &self
                    .buckets()
                    .iter()
                    .map(|&head| self.chain_len(head))
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl<A: Allocator> Drop for HashTable<A> {
    fn drop(&mut self) {
        self.free_entries();

        // SAFETY: The bucket array was allocated from `self.alloc` with this
        // capacity, and is not used after this point.
        unsafe {
            self.alloc
                .deallocate(self.buckets.cast(), live_bucket_layout(self.capacity));
        }
    }
}

impl HashTable<Global> {
    /// Creates a table with `capacity` buckets backed by the global allocator.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is below [`MIN_CAPACITY`] or the bucket array size
    /// overflows. Allocation failure is routed to
    /// [`handle_alloc_error`](alloc::alloc::handle_alloc_error).
    ///
    /// # Examples
    ///
    /// ```rust
    /// # use chain_hash::HashTable;
    /// #
    /// let table = HashTable::with_capacity(16);
    /// assert_eq!(table.capacity(), 16);
    /// assert!(table.is_empty());
    /// ```
    pub fn with_capacity(capacity: usize) -> Self {
        match Self::with_capacity_in(capacity, Global) {
            Ok(table) => table,
            Err(Error::OutOfMemory { .. }) => handle_alloc_error(live_bucket_layout(capacity)),
            Err(Error::CapacityOverflow) => panic!("capacity overflow"),
        }
    }
}

impl Default for HashTable<Global> {
    fn default() -> Self {
        Self::with_capacity(MIN_CAPACITY)
    }
}

impl<A: Allocator> HashTable<A> {
    /// Creates a table with `capacity` buckets whose memory comes from
    /// `alloc`.
    ///
    /// # Errors
    ///
    /// Returns an error if the bucket array cannot be allocated.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is below [`MIN_CAPACITY`].
    ///
    /// # Examples
    ///
    /// ```rust
    /// # use chain_hash::Global;
    /// # use chain_hash::HashTable;
    /// #
    /// let allocator = Global;
    /// let mut first = HashTable::with_capacity_in(8, &allocator).unwrap();
    /// let mut second = HashTable::with_capacity_in(8, &allocator).unwrap();
    /// first.put(b"k", b"1").unwrap();
    /// second.put(b"k", b"2").unwrap();
    /// assert_eq!(first.get(b"k").unwrap().value(), b"1");
    /// ```
    pub fn with_capacity_in(capacity: usize, alloc: A) -> Result<Self, Error> {
        assert!(
            capacity >= MIN_CAPACITY,
            "capacity {capacity} is below the minimum of {MIN_CAPACITY}"
        );

        let buckets = allocate_buckets(&alloc, capacity)?;
        Ok(Self {
            buckets,
            capacity,
            populated: 0,
            modifications: 0,
            alloc,
            _phantom: core::marker::PhantomData,
        })
    }

    fn buckets_ptr(&self) -> NonNull<[Link]> {
        NonNull::slice_from_raw_parts(self.buckets, self.capacity)
    }

    #[inline]
    fn buckets(&self) -> &[Link] {
        // SAFETY: The bucket array is live, initialized and `capacity` long.
        unsafe { self.buckets_ptr().as_ref() }
    }

    #[inline]
    fn buckets_mut(&mut self) -> &mut [Link] {
        // SAFETY: The bucket array is live, initialized and `capacity` long,
        // and `&mut self` makes this the only reference to it.
        unsafe { self.buckets_ptr().as_mut() }
    }

    #[inline]
    fn bucket_index(&self, hash: u32) -> usize {
        hash as usize % self.capacity
    }

    fn chain_len(&self, head: Link) -> usize {
        let Some(head) = head else {
            return 0;
        };

        let mut len = 1;
        // SAFETY: Every record reachable from a bucket head is live.
        unsafe {
            let mut node = head.as_ref().next;
            while node != head {
                len += 1;
                node = node.as_ref().next;
            }
        }
        len
    }

    /// Returns the allocator backing this table.
    pub fn allocator(&self) -> &A {
        &self.alloc
    }

    /// Returns the number of entries in the table.
    ///
    /// # Examples
    ///
    /// ```rust
    /// # use chain_hash::HashTable;
    /// #
    /// let mut table = HashTable::with_capacity(4);
    /// assert_eq!(table.len(), 0);
    ///
    /// table.put(b"a", b"1").unwrap();
    /// table.put(b"a", b"2").unwrap();
    /// assert_eq!(table.len(), 1);
    /// ```
    pub fn len(&self) -> usize {
        self.populated
    }

    /// Returns `true` if the table contains no entries.
    pub fn is_empty(&self) -> bool {
        self.populated == 0
    }

    /// Returns the current number of buckets.
    ///
    /// Always at least [`MIN_CAPACITY`] and always greater than
    /// [`len`](Self::len).
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the number of successful mutations performed on the table.
    ///
    /// Every successful [`put`](Self::put), every [`remove`](Self::remove)
    /// that found its key, and every [`clear`](Self::clear) increments it.
    /// Failed operations, lookups and resizes leave it unchanged.
    pub fn modification_count(&self) -> u64 {
        self.modifications
    }

    /// Inserts `value` under `key`, replacing the value of an existing entry.
    ///
    /// If `key` is present and `value` has the same length as the stored
    /// value, the bytes are overwritten in place. If the length differs, the
    /// entry record is reallocated to the new size, keeping its position in
    /// its chain. A new key gets a fresh record, growing the bucket array
    /// first if the table is at its occupancy limit.
    ///
    /// # Errors
    ///
    /// Returns an error if a record or a larger bucket array cannot be
    /// allocated. The table is unchanged in that case.
    ///
    /// # Panics
    ///
    /// Panics if `key` or `value` is empty or longer than `i32::MAX` bytes.
    ///
    /// # Examples
    ///
    /// ```rust
    /// # use chain_hash::HashTable;
    /// #
    /// let mut table = HashTable::with_capacity(4);
    /// table.put(b"key", b"old").unwrap();
    /// table.put(b"key", b"new").unwrap();
    /// table.put(b"key", b"much longer").unwrap();
    /// assert_eq!(table.get(b"key").unwrap().value(), b"much longer");
    /// assert_eq!(table.len(), 1);
    /// ```
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), Error> {
        assert_valid_bytes(key, "key");
        assert_valid_bytes(value, "value");

        let hash = hashcode(key);
        if let Some((index, node)) = self.find_node(hash, key) {
            // SAFETY: `find_node` returns a live record linked at `index`.
            unsafe { self.replace_value(index, node, value)? };
            self.modifications += 1;
            return Ok(());
        }

        let grow_to = if self.populated >= occupancy_limit(self.capacity) {
            Some(
                self.capacity
                    .checked_mul(2)
                    .ok_or(Error::CapacityOverflow)?,
            )
        } else {
            None
        };

        let layout = Node::layout(key.len(), value.len())?;
        let node = self
            .alloc
            .allocate(layout)
            .ok_or(Error::OutOfMemory {
                size: layout.size(),
            })?
            .cast::<Node>();
        // SAFETY: `node` was just allocated with the record layout for these
        // lengths.
        unsafe { Node::init(node, hash, key, value) };

        if let Some(capacity) = grow_to {
            if let Err(err) = self.resize(capacity) {
                // SAFETY: The record was never linked and is freed with the
                // layout it was allocated with.
                unsafe { self.alloc.deallocate(node.cast(), layout) };
                return Err(err);
            }
        }

        let index = self.bucket_index(hash);
        // SAFETY: `node` is live and unlinked; the chain at `index` is valid.
        unsafe { link(&mut self.buckets_mut()[index], node) };
        self.populated += 1;
        self.modifications += 1;
        debug_assert!(self.populated < self.capacity);

        Ok(())
    }

    /// Writes `value` into the record at `node`, relocating the record if its
    /// value length changes.
    ///
    /// # Safety
    ///
    /// `node` must be a live record linked into bucket `index`.
    unsafe fn replace_value(
        &mut self,
        index: usize,
        node: NonNull<Node>,
        value: &[u8],
    ) -> Result<(), Error> {
        // SAFETY: The caller guarantees `node` is live and linked at `index`.
        unsafe {
            let (key_len, val_len) = (node.as_ref().key_len, node.as_ref().val_len);
            if val_len == value.len() {
                core::ptr::copy_nonoverlapping(
                    value.as_ptr(),
                    Node::value_ptr(node).as_ptr(),
                    value.len(),
                );
                return Ok(());
            }

            let old_layout = Node::layout_of(node);
            let new_layout = Node::layout(key_len, value.len())?;
            let moved = self
                .alloc
                .reallocate(node.cast(), old_layout, new_layout.size())
                .ok_or(Error::OutOfMemory {
                    size: new_layout.size(),
                })?
                .cast::<Node>();

            // The header and key moved with the record, but the neighbours and
            // the bucket head still point at the old address, which may only
            // be compared, never read.
            if moved != node {
                if moved.as_ref().next == node {
                    (*moved.as_ptr()).next = moved;
                    (*moved.as_ptr()).prev = moved;
                } else {
                    let (prev, next) = (moved.as_ref().prev, moved.as_ref().next);
                    (*prev.as_ptr()).next = moved;
                    (*next.as_ptr()).prev = moved;
                }

                let head = &mut self.buckets_mut()[index];
                if *head == Some(node) {
                    *head = Some(moved);
                }
            }

            (*moved.as_ptr()).val_len = value.len();
            core::ptr::copy_nonoverlapping(
                value.as_ptr(),
                Node::value_ptr(moved).as_ptr(),
                value.len(),
            );
        }

        Ok(())
    }

    /// Looks up `key`, returning a view of its entry.
    ///
    /// # Panics
    ///
    /// Panics if `key` is empty or longer than `i32::MAX` bytes.
    ///
    /// # Examples
    ///
    /// ```rust
    /// # use chain_hash::HashTable;
    /// #
    /// let mut table = HashTable::with_capacity(4);
    /// table.put(&42i64.to_le_bytes(), &1.5f64.to_le_bytes()).unwrap();
    ///
    /// let entry = table.get(&42i64.to_le_bytes()).unwrap();
    /// assert_eq!(entry.value(), &1.5f64.to_le_bytes());
    /// assert!(table.get(&7i64.to_le_bytes()).is_none());
    /// ```
    pub fn get(&self, key: &[u8]) -> Option<EntryRef<'_>> {
        assert_valid_bytes(key, "key");

        let (_, node) = self.find_node(hashcode(key), key)?;
        // SAFETY: The record is live and `&self` prevents any mutation for the
        // lifetime of the view.
        Some(unsafe { EntryRef::new(node) })
    }

    /// Returns `true` if the table contains `key`.
    ///
    /// # Panics
    ///
    /// Panics if `key` is empty or longer than `i32::MAX` bytes.
    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.get(key).is_some()
    }

    /// Walks the chain of `hash`'s bucket from its head, stopping when the
    /// walk comes back around.
    fn find_node(&self, hash: u32, key: &[u8]) -> Option<(usize, NonNull<Node>)> {
        let index = self.bucket_index(hash);
        let head = self.buckets()[index]?;

        let mut node = head;
        // SAFETY: Every record reachable from a bucket head is live.
        unsafe {
            loop {
                if Node::matches(node, hash, key) {
                    return Some((index, node));
                }
                node = node.as_ref().next;
                if node == head {
                    return None;
                }
            }
        }
    }

    /// Removes `key` from the table, returning whether it was present.
    ///
    /// Removing an absent key does nothing. A successful removal may shrink
    /// the bucket array; if that allocation fails, the table keeps its
    /// current capacity.
    ///
    /// # Panics
    ///
    /// Panics if `key` is empty or longer than `i32::MAX` bytes.
    ///
    /// # Examples
    ///
    /// ```rust
    /// # use chain_hash::HashTable;
    /// #
    /// let mut table = HashTable::with_capacity(4);
    /// table.put(b"a", b"1").unwrap();
    ///
    /// assert!(table.remove(b"a"));
    /// assert!(!table.remove(b"a"));
    /// assert!(table.is_empty());
    /// ```
    pub fn remove(&mut self, key: &[u8]) -> bool {
        assert_valid_bytes(key, "key");

        let Some((index, node)) = self.find_node(hashcode(key), key) else {
            return false;
        };

        // SAFETY: `find_node` returns a live record linked at `index`; it is
        // unlinked before being freed.
        unsafe {
            unlink(&mut self.buckets_mut()[index], node);
            let layout = Node::layout_of(node);
            self.alloc.deallocate(node.cast(), layout);
        }
        self.populated -= 1;
        self.modifications += 1;

        if self.capacity >= MIN_CAPACITY * 2
            && self.populated * 2 < occupancy_limit(self.capacity)
        {
            if let Err(err) = self.resize(self.capacity / 2) {
                log::debug!(
                    "keeping {} buckets for {} entries: shrink failed: {err}",
                    self.capacity,
                    self.populated
                );
            }
        }

        true
    }

    /// Removes every entry, keeping the current bucket array.
    ///
    /// # Examples
    ///
    /// ```rust
    /// # use chain_hash::HashTable;
    /// #
    /// let mut table = HashTable::with_capacity(4);
    /// for i in 0u32..10 {
    ///     table.put(&i.to_le_bytes(), b"v").unwrap();
    /// }
    /// let capacity = table.capacity();
    ///
    /// table.clear();
    /// assert!(table.is_empty());
    /// assert_eq!(table.capacity(), capacity);
    /// ```
    pub fn clear(&mut self) {
        self.free_entries();
        self.modifications += 1;
    }

    /// Frees every record and empties every bucket.
    fn free_entries(&mut self) {
        if self.populated == 0 {
            return;
        }

        let buckets = self.buckets_ptr();
        // SAFETY: The bucket array is live and no other reference to it exists
        // while `&mut self` is held. Each record is read before it is freed
        // and never touched again.
        unsafe {
            for head in (*buckets.as_ptr()).iter_mut() {
                let Some(start) = head.take() else {
                    continue;
                };

                let mut node = start;
                loop {
                    let next = node.as_ref().next;
                    let layout = Node::layout_of(node);
                    self.alloc.deallocate(node.cast(), layout);
                    if next == start {
                        break;
                    }
                    node = next;
                }
            }
        }

        self.populated = 0;
    }

    /// Moves every record into a freshly allocated bucket array of
    /// `capacity` buckets and frees the old array. Records themselves are
    /// relinked, never copied.
    fn resize(&mut self, capacity: usize) -> Result<(), Error> {
        debug_assert!(capacity >= MIN_CAPACITY);
        debug_assert!(self.populated < capacity);

        let new_buckets = allocate_buckets(&self.alloc, capacity)?;
        log::trace!(
            "resizing chain table from {} to {} buckets ({} entries)",
            self.capacity,
            capacity,
            self.populated
        );

        // SAFETY: The new array is live, zeroed and `capacity` long, and is
        // distinct from the old one.
        let new_slots = unsafe { NonNull::slice_from_raw_parts(new_buckets, capacity).as_mut() };
        for head in self.buckets_mut().iter_mut() {
            while let Some(node) = *head {
                // SAFETY: `node` is live and linked at `head`; once unlinked it
                // is linked into exactly one new chain.
                unsafe {
                    unlink(head, node);
                    let index = node.as_ref().hash as usize % capacity;
                    link(&mut new_slots[index], node);
                }
            }
        }

        let old_buckets = core::mem::replace(&mut self.buckets, new_buckets);
        let old_capacity = core::mem::replace(&mut self.capacity, capacity);
        // SAFETY: The old array was allocated from `self.alloc` with
        // `old_capacity` buckets, and every chain has been moved out of it.
        unsafe {
            self.alloc
                .deallocate(old_buckets.cast(), live_bucket_layout(old_capacity));
        }

        self.validate();
        Ok(())
    }

    cfg_if::cfg_if! {
        if #[cfg(debug_assertions)] {
            /// Checks every chain: links are mutual, records sit in the bucket
            /// their hash selects, and the chains hold exactly `len` records.
            fn validate(&self) {
                let mut total = 0;
                for (index, &head) in self.buckets().iter().enumerate() {
                    let Some(head) = head else {
                        continue;
                    };

                    let mut node = head;
                    // SAFETY: Every record reachable from a bucket head is live.
                    unsafe {
                        loop {
                            let next = node.as_ref().next;
                            assert_eq!(next.as_ref().prev, node, "broken back link");
                            assert_eq!(self.bucket_index(node.as_ref().hash), index);
                            total += 1;
                            assert!(total <= self.populated, "chain does not close");
                            node = next;
                            if node == head {
                                break;
                            }
                        }
                    }
                }
                assert_eq!(total, self.populated);
            }
        } else {
            #[inline(always)]
            fn validate(&self) {}
        }
    }

    /// Returns an iterator over all entries, in bucket order and then chain
    /// order within each bucket.
    ///
    /// The order is unrelated to key order or insertion order.
    ///
    /// # Examples
    ///
    /// ```rust
    /// # use chain_hash::HashTable;
    /// #
    /// let mut table = HashTable::with_capacity(4);
    /// table.put(b"a", b"1").unwrap();
    /// table.put(b"b", b"2").unwrap();
    ///
    /// let mut keys: Vec<&[u8]> = table.iter().map(|e| e.key()).collect();
    /// keys.sort();
    /// assert_eq!(keys, [&b"a"[..], &b"b"[..]]);
    /// ```
    pub fn iter(&self) -> Iter<'_, A> {
        Iter {
            table: self,
            bucket_index: 0,
            cursor: None,
            remaining: self.populated,
        }
    }

    /// Calls `f` once for every entry, in the same order as
    /// [`iter`](Self::iter).
    ///
    /// # Panics
    ///
    /// Panics if the table's modification count changes while iterating.
    /// The shared borrow already rules this out for safe callers.
    ///
    /// # Examples
    ///
    /// ```rust
    /// # use chain_hash::HashTable;
    /// #
    /// let mut table = HashTable::with_capacity(4);
    /// table.put(b"a\0", b"z\0").unwrap();
    /// table.put(b"aa\0", b"zz\0").unwrap();
    ///
    /// let mut bytes = 0;
    /// table.iterate(|entry| bytes += entry.key_len() + entry.value_len());
    /// assert_eq!(bytes, 10);
    /// ```
    pub fn iterate(&self, mut f: impl FnMut(EntryRef<'_>)) {
        let modifications = self.modifications;
        for entry in self.iter() {
            f(entry);
            assert_eq!(
                self.modifications, modifications,
                "table modified during iteration"
            );
        }
    }

    /// Returns the number of buckets per chain length: index `n` holds the
    /// count of buckets whose chain has exactly `n` entries.
    ///
    /// Available in tests and with the `stats` feature.
    #[cfg(any(test, feature = "stats"))]
    pub fn chain_histogram(&self) -> Vec<usize> {
        let mut hist = alloc::vec![0usize; 1];
        for &head in self.buckets() {
            let len = self.chain_len(head);
            if hist.len() <= len {
                hist.resize(len + 1, 0);
            }
            hist[len] += 1;
        }
        hist
    }

    /// Returns occupancy and memory statistics for debugging.
    ///
    /// Available in tests and with the `stats` feature.
    #[cfg(any(test, feature = "stats"))]
    pub fn debug_stats(&self) -> DebugStats {
        let hist = self.chain_histogram();
        let entry_bytes: usize = self
            .iter()
            .map(|e| match Node::layout(e.key_len(), e.value_len()) {
                Ok(layout) => layout.size(),
                Err(_) => unreachable!("live record with unrepresentable layout"),
            })
            .sum();

        DebugStats {
            populated: self.populated,
            capacity: self.capacity,
            occupied_buckets: self.capacity - hist[0],
            longest_chain: hist.len() - 1,
            load_factor: self.populated as f64 / self.capacity as f64,
            entry_bytes,
            bucket_bytes: live_bucket_layout(self.capacity).size(),
        }
    }

    /// Pretty-prints the chain-length histogram horizontally using stdout.
    ///
    /// Requires the `std` feature, and either tests or the `stats` feature.
    #[cfg(all(any(test, feature = "stats"), feature = "std"))]
    pub fn print_chain_histogram(&self) {
        let hist = self.chain_histogram();
        let max = *hist.iter().max().unwrap_or(&0);
        if max == 0 {
            println!("chain histogram: empty");
            return;
        }

        let max_bar = 60usize;
        println!(
            "chain histogram ({} entries, {} buckets):",
            self.populated, self.capacity
        );
        for (len, &count) in hist.iter().enumerate() {
            let width = (count * max_bar).div_ceil(max);
            println!("{:>3} | {} ({})", len, "█".repeat(width), count);
        }
    }
}

impl<'a, A: Allocator> IntoIterator for &'a HashTable<A> {
    type Item = EntryRef<'a>;
    type IntoIter = Iter<'a, A>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[inline]
#[track_caller]
fn assert_valid_bytes(bytes: &[u8], what: &str) {
    assert!(!bytes.is_empty(), "{what} must not be empty");
    assert!(
        bytes.len() <= i32::MAX as usize,
        "{what} of {} bytes exceeds i32::MAX",
        bytes.len()
    );
}

/// An iterator over the entries of a [`HashTable`].
///
/// This struct is created by the [`iter`] method on [`HashTable`]. It yields
/// entries bucket by bucket, following each chain from its head.
///
/// [`iter`]: HashTable::iter
pub struct Iter<'a, A: Allocator = Global> {
    table: &'a HashTable<A>,
    bucket_index: usize,
    cursor: Link,
    remaining: usize,
}

impl<'a, A: Allocator> Iterator for Iter<'a, A> {
    type Item = EntryRef<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }

        let buckets = self.table.buckets();
        loop {
            if let Some(node) = self.cursor {
                let head = buckets[self.bucket_index];
                // SAFETY: The record is live for `'a` since the table is
                // borrowed for `'a`.
                let next = unsafe { node.as_ref().next };
                if Some(next) == head {
                    self.cursor = None;
                    self.bucket_index += 1;
                } else {
                    self.cursor = Some(next);
                }
                self.remaining -= 1;
                // SAFETY: As above.
                return Some(unsafe { EntryRef::new(node) });
            }

            // `remaining > 0` guarantees a non-empty bucket lies ahead.
            self.cursor = buckets[self.bucket_index];
            if self.cursor.is_none() {
                self.bucket_index += 1;
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<A: Allocator> ExactSizeIterator for Iter<'_, A> {}

impl<A: Allocator> FusedIterator for Iter<'_, A> {}

#[cfg(test)]
mod tests {
    use alloc::collections::BTreeMap;
    use alloc::collections::BTreeSet;
    use alloc::format;
    use alloc::vec;

    use rand::Rng;
    use rand::SeedableRng;
    use rand::rngs::SmallRng;

    use super::*;
    use crate::allocator::testing::TestAllocator;

    const KEYS: [&str; 9] = [
        "a",
        "aa",
        "ab",
        "aaa",
        "aab",
        "Much longer key",
        "Abraca",
        "Hello",
        "Goodbye",
    ];

    const VALS: [&str; 9] = [
        "z",
        "zz",
        "zx",
        "zzz",
        "zzx",
        "With a bit longer value",
        "Dabra",
        "World",
        "Universe",
    ];

    fn cstr(s: &str) -> Vec<u8> {
        let mut bytes = s.as_bytes().to_vec();
        bytes.push(0);
        bytes
    }

    fn key(i: u64) -> Vec<u8> {
        format!("key_{i:016X}").into_bytes()
    }

    fn assert_bounds<A: Allocator>(table: &HashTable<A>) {
        assert!(table.len() < table.capacity(), "{table:?}");
        assert!(table.capacity() >= MIN_CAPACITY, "{table:?}");
    }

    #[test]
    fn smoke_grows_and_shrinks() {
        let mut table = HashTable::with_capacity(4);
        for (i, (k, v)) in KEYS.iter().zip(VALS).enumerate() {
            table.put(&cstr(k), &cstr(v)).unwrap();
            assert_eq!(table.get(&cstr(k)).unwrap().value(), cstr(v).as_slice());
            assert_eq!(table.len(), i + 1);
            if i == 3 {
                assert_eq!(table.capacity(), 8);
            }
            assert_bounds(&table);
        }
        assert_eq!(table.capacity(), 16);
        assert_eq!(table.modification_count(), 9);

        for (k, v) in KEYS.iter().zip(VALS) {
            let entry = table.get(&cstr(k)).unwrap();
            assert_eq!(entry.key(), cstr(k).as_slice());
            assert_eq!(entry.value(), cstr(v).as_slice());
        }

        for k in KEYS {
            assert!(table.remove(&cstr(k)));
            assert!(table.get(&cstr(k)).is_none());
            assert_bounds(&table);
        }
        assert_eq!(table.len(), 0);
        assert_eq!(table.capacity(), MIN_CAPACITY);
    }

    #[test]
    fn insert_and_find() {
        let mut table = HashTable::with_capacity(MIN_CAPACITY);
        for i in 0..1000u64 {
            table.put(&key(i), &(i * 2).to_le_bytes()).unwrap();
            assert_eq!(
                table.get(&key(i)).map(|e| e.value()),
                Some(&(i * 2).to_le_bytes()[..]),
                "{table:?}"
            );
            assert_bounds(&table);
        }
        assert_eq!(table.len(), 1000);

        for i in 0..1000u64 {
            let entry = table.get(&key(i)).unwrap();
            assert_eq!(entry.key(), key(i).as_slice());
            assert_eq!(entry.value(), &(i * 2).to_le_bytes());
            assert_eq!(entry.hash(), hashcode(&key(i)));
        }
        assert!(table.get(&key(1000)).is_none());
    }

    #[test]
    fn put_existing_key_updates() {
        let mut table = HashTable::with_capacity(MIN_CAPACITY);
        table.put(b"k", b"v1").unwrap();
        table.put(b"k", b"v2").unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(b"k").unwrap().value(), b"v2");
        assert_eq!(table.modification_count(), 2);
    }

    #[test]
    fn same_length_update_is_in_place() {
        let mut table = HashTable::with_capacity(MIN_CAPACITY);
        table.put(b"k", b"abcd").unwrap();
        let before = table.get(b"k").unwrap().value_ptr();

        table.put(b"k", b"wxyz").unwrap();
        let after = table.get(b"k").unwrap();
        assert_eq!(after.value_ptr(), before);
        assert_eq!(after.value(), b"wxyz");
    }

    #[test]
    fn length_change_relocates_in_chain() {
        let alloc = TestAllocator::new();
        let mut table = HashTable::with_capacity_in(64, &alloc).unwrap();
        for i in 0..30u64 {
            table.put(&key(i), b"short").unwrap();
        }
        let capacity = table.capacity();

        for i in 0..30u64 {
            let long = format!("a considerably longer value for {i}");
            table.put(&key(i), long.as_bytes()).unwrap();
            assert_eq!(table.get(&key(i)).unwrap().value(), long.as_bytes());
            table.validate();
        }
        for i in 0..30u64 {
            table.put(&key(i), b"x").unwrap();
        }

        assert_eq!(table.len(), 30);
        assert_eq!(table.capacity(), capacity);
        assert_eq!(alloc.reallocations(), 60);
        for i in 0..30u64 {
            assert_eq!(table.get(&key(i)).unwrap().value(), b"x");
        }
        drop(table);
        assert_eq!(alloc.live(), 0);
    }

    #[test]
    fn values_stay_put_across_growth() {
        let mut table = HashTable::with_capacity(MIN_CAPACITY);
        table.put(b"pinned", b"0123456789").unwrap();
        let pinned = table.get(b"pinned").unwrap().value_ptr();

        for i in 0..5000u64 {
            table.put(&key(i), &i.to_le_bytes()).unwrap();
        }
        assert!(table.capacity() > 5000);

        // SAFETY: The "pinned" key was neither removed nor re-put with a
        // different length, so its value bytes are still live at this address.
        let bytes = unsafe { core::slice::from_raw_parts(pinned.as_ptr(), 10) };
        assert_eq!(bytes, b"0123456789");
        assert_eq!(table.get(b"pinned").unwrap().value_ptr(), pinned);

        for i in 0..5000u64 {
            assert!(table.remove(&key(i)));
        }
        assert_eq!(table.capacity(), MIN_CAPACITY);
        assert_eq!(table.get(b"pinned").unwrap().value_ptr(), pinned);
    }

    #[test]
    fn remove_items() {
        let mut table = HashTable::with_capacity(MIN_CAPACITY);
        for i in 0..8u64 {
            table.put(&key(i), &i.to_le_bytes()).unwrap();
        }
        assert_eq!(table.len(), 8);

        for i in [0u64, 3, 7] {
            assert!(table.remove(&key(i)));
        }
        assert_eq!(table.len(), 5);
        for i in [1u64, 2, 4, 5, 6] {
            assert_eq!(table.get(&key(i)).unwrap().value(), &i.to_le_bytes());
        }

        let modifications = table.modification_count();
        let capacity = table.capacity();
        assert!(!table.remove(&key(1000)));
        assert!(!table.remove(&key(3)));
        assert_eq!(table.len(), 5);
        assert_eq!(table.capacity(), capacity);
        assert_eq!(table.modification_count(), modifications);
    }

    #[test]
    fn long_chains_stay_circular() {
        // Capacity far below the key count is impossible through `put`, so
        // fill a large table and rely on chains forming at ~60% occupancy.
        let mut table = HashTable::with_capacity(MIN_CAPACITY);
        for i in 0..4000u64 {
            table.put(&key(i), b"v").unwrap();
        }
        let hist = table.chain_histogram();
        assert!(hist.len() > 3, "no chain of 3 or more: {hist:?}");
        assert_eq!(
            hist.iter().enumerate().map(|(len, n)| len * n).sum::<usize>(),
            4000
        );
        table.validate();

        for i in (0..4000u64).step_by(3) {
            assert!(table.remove(&key(i)));
        }
        table.validate();
        for i in 0..4000u64 {
            assert_eq!(table.contains_key(&key(i)), i % 3 != 0);
        }
    }

    #[test]
    fn head_is_most_recently_linked() {
        let layout = Node::layout(1, 1).unwrap();
        let nodes: Vec<NonNull<Node>> = (0..4u8)
            .map(|i| {
                let node = Global.allocate(layout).unwrap().cast::<Node>();
                // SAFETY: Fresh allocation with the record layout.
                unsafe { Node::init(node, 0, &[i], &[i]) };
                node
            })
            .collect();

        let mut head: Link = None;
        // SAFETY: All records are live and linked at most once at a time; they
        // are freed at the end after being unlinked.
        unsafe {
            for &node in &nodes {
                link(&mut head, node);
                assert_eq!(head, Some(node));
            }

            let walk = |head: Link| {
                let mut seen = Vec::new();
                if let Some(start) = head {
                    let mut node = start;
                    loop {
                        assert_eq!(node.as_ref().next.as_ref().prev, node);
                        seen.push(Node::key(node)[0]);
                        node = node.as_ref().next;
                        if node == start {
                            break;
                        }
                    }
                }
                seen
            };

            // Each new head is spliced in right after the previous head.
            assert_eq!(walk(head), vec![3, 0, 1, 2]);

            unlink(&mut head, nodes[3]);
            assert_eq!(head, Some(nodes[0]));
            assert_eq!(walk(head), vec![0, 1, 2]);

            unlink(&mut head, nodes[2]);
            assert_eq!(head, Some(nodes[0]));
            assert_eq!(walk(head), vec![0, 1]);

            unlink(&mut head, nodes[0]);
            unlink(&mut head, nodes[1]);
            assert_eq!(head, None);

            for node in nodes {
                Global.deallocate(node.cast(), layout);
            }
        }
    }

    #[test]
    fn iteration_visits_each_entry_once() {
        let mut table = HashTable::with_capacity(MIN_CAPACITY);
        let mut rng = SmallRng::seed_from_u64(7);
        let mut expected = BTreeMap::new();
        for _ in 0..500 {
            let k: u64 = rng.random();
            let v: u32 = rng.random();
            table.put(&k.to_le_bytes(), &v.to_le_bytes()).unwrap();
            expected.insert(k.to_le_bytes().to_vec(), v.to_le_bytes().to_vec());
        }

        let mut visited = BTreeMap::new();
        let mut calls = 0;
        table.iterate(|entry| {
            calls += 1;
            assert!(
                visited
                    .insert(entry.key().to_vec(), entry.value().to_vec())
                    .is_none()
            );
        });
        assert_eq!(calls, expected.len());
        assert_eq!(visited, expected);

        let iter = table.iter();
        assert_eq!(iter.len(), expected.len());
        let keys: BTreeSet<Vec<u8>> = iter.map(|e| e.key().to_vec()).collect();
        assert_eq!(keys.len(), expected.len());
    }

    #[test]
    fn iteration_follows_bucket_order() {
        let mut table = HashTable::with_capacity(64);
        for i in 0..30u64 {
            table.put(&key(i), b"v").unwrap();
        }
        let buckets: Vec<usize> = table
            .iter()
            .map(|e| e.hash() as usize % table.capacity())
            .collect();
        assert!(buckets.windows(2).all(|w| w[0] <= w[1]), "{buckets:?}");
    }

    #[test]
    fn empty_iteration() {
        let table = HashTable::with_capacity(MIN_CAPACITY);
        assert_eq!(table.iter().count(), 0);
        let mut calls = 0;
        table.iterate(|_| calls += 1);
        assert_eq!(calls, 0);
    }

    #[test]
    fn clear_frees_everything() {
        let alloc = TestAllocator::new();
        let mut table = HashTable::with_capacity_in(MIN_CAPACITY, &alloc).unwrap();
        for i in 0..100u64 {
            table.put(&key(i), b"v").unwrap();
        }
        let capacity = table.capacity();
        table.clear();

        assert!(table.is_empty());
        assert_eq!(table.capacity(), capacity);
        assert_eq!(alloc.live(), 1);
        assert_eq!(table.iter().count(), 0);
        assert!(table.get(&key(5)).is_none());

        table.put(&key(5), b"again").unwrap();
        assert_eq!(table.get(&key(5)).unwrap().value(), b"again");
        drop(table);
        assert_eq!(alloc.live(), 0);
    }

    #[test]
    fn drop_releases_all_memory() {
        let alloc = TestAllocator::new();
        {
            let mut table = HashTable::with_capacity_in(MIN_CAPACITY, &alloc).unwrap();
            for i in 0..300u64 {
                table.put(&key(i), &vec![i as u8; (i % 17 + 1) as usize]).unwrap();
            }
            for i in (0..300u64).step_by(2) {
                table.remove(&key(i));
            }
            assert_eq!(alloc.live(), table.len() + 1);
        }
        assert_eq!(alloc.live(), 0);
    }

    #[test]
    fn failed_insert_leaves_table_unchanged() {
        let alloc = TestAllocator::new();
        let mut table = HashTable::with_capacity_in(MIN_CAPACITY, &alloc).unwrap();
        table.put(b"a", b"1").unwrap();

        alloc.fail_after(0);
        let err = table.put(b"b", b"2").unwrap_err();
        assert!(matches!(err, Error::OutOfMemory { .. }), "{err}");
        assert_eq!(table.len(), 1);
        assert_eq!(table.modification_count(), 1);
        assert!(table.get(b"b").is_none());

        alloc.heal();
        table.put(b"b", b"2").unwrap();
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn failed_growth_leaves_table_unchanged() {
        let alloc = TestAllocator::new();
        let mut table = HashTable::with_capacity_in(MIN_CAPACITY, &alloc).unwrap();
        table.put(b"a", b"1").unwrap();
        table.put(b"b", b"2").unwrap();
        assert_eq!(table.len(), occupancy_limit(MIN_CAPACITY));
        let live = alloc.live();

        // The record allocation succeeds, the doubled bucket array does not.
        alloc.fail_after(1);
        let err = table.put(b"c", b"3").unwrap_err();
        assert_eq!(
            err,
            Error::OutOfMemory {
                size: live_bucket_layout(MIN_CAPACITY * 2).size()
            }
        );
        assert_eq!(alloc.live(), live);
        assert_eq!(table.capacity(), MIN_CAPACITY);
        assert_eq!(table.len(), 2);
        assert!(table.get(b"c").is_none());
        assert_eq!(table.get(b"a").unwrap().value(), b"1");

        // Updates of existing keys need no growth.
        table.put(b"a", b"9").unwrap();
        assert_eq!(table.get(b"a").unwrap().value(), b"9");

        alloc.heal();
        table.put(b"c", b"3").unwrap();
        assert_eq!(table.capacity(), MIN_CAPACITY * 2);
    }

    #[test]
    fn failed_relocation_keeps_old_value() {
        let alloc = TestAllocator::new();
        let mut table = HashTable::with_capacity_in(MIN_CAPACITY, &alloc).unwrap();
        table.put(b"k", b"short").unwrap();

        alloc.fail_after(0);
        assert!(table.put(b"k", b"much longer value").is_err());
        assert_eq!(table.get(b"k").unwrap().value(), b"short");
        assert_eq!(table.modification_count(), 1);

        // Same-length updates allocate nothing.
        table.put(b"k", b"SHORT").unwrap();
        assert_eq!(table.get(b"k").unwrap().value(), b"SHORT");
    }

    #[test]
    fn failed_shrink_is_ignored() {
        let alloc = TestAllocator::new();
        let mut table = HashTable::with_capacity_in(MIN_CAPACITY, &alloc).unwrap();
        for i in 0..9u64 {
            table.put(&key(i), b"v").unwrap();
        }
        assert_eq!(table.capacity(), 16);

        alloc.fail_after(0);
        for i in 0..9u64 {
            assert!(table.remove(&key(i)));
        }
        assert!(table.is_empty());
        assert_eq!(table.capacity(), 16);
        assert_bounds(&table);

        alloc.heal();
        table.put(&key(0), b"v").unwrap();
        assert!(table.remove(&key(0)));
        assert_eq!(table.capacity(), 8);
    }

    #[test]
    fn random_workload_respects_bounds() {
        let mut rng = SmallRng::seed_from_u64(0xC0FFEE);
        let mut table = HashTable::with_capacity(MIN_CAPACITY);
        let mut model = BTreeMap::new();
        for _ in 0..20_000 {
            let k: u16 = rng.random_range(0..512);
            let k = k.to_le_bytes();
            if rng.random_bool(0.55) {
                let len = rng.random_range(1..24usize);
                let v: Vec<u8> = (0..len).map(|_| rng.random()).collect();
                table.put(&k, &v).unwrap();
                model.insert(k, v);
            } else {
                assert_eq!(table.remove(&k), model.remove(&k).is_some());
            }
            assert_eq!(table.len(), model.len());
            assert_bounds(&table);
        }

        table.validate();
        for (k, v) in &model {
            assert_eq!(table.get(k).unwrap().value(), v.as_slice());
        }
    }

    #[test]
    fn debug_stats_reflect_contents() {
        let mut table = HashTable::with_capacity(MIN_CAPACITY);
        for i in 0..40u64 {
            table.put(&key(i), b"value").unwrap();
        }
        let stats = table.debug_stats();
        assert_eq!(stats.populated, 40);
        assert_eq!(stats.capacity, table.capacity());
        assert!(stats.occupied_buckets <= 40);
        assert!(stats.longest_chain >= 1);
        assert_eq!(
            stats.entry_bytes,
            40 * Node::layout(key(0).len(), 5).unwrap().size()
        );
        assert_eq!(stats.bucket_bytes, table.capacity() * size_of::<Link>());
        assert!(stats.load_factor < MAX_OCCUPANCY_PERCENTAGE as f64 / 100.0);
        #[cfg(feature = "std")]
        {
            stats.print();
            table.print_chain_histogram();
        }
    }

    #[test]
    fn debug_output_lists_chains() {
        let mut table = HashTable::with_capacity(MIN_CAPACITY);
        table.put(b"a", b"1").unwrap();
        let out = format!("{table:?}");
        assert!(out.contains("populated: 1"), "{out}");
        assert!(out.contains("capacity: 4"), "{out}");
    }

    #[test]
    fn table_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<HashTable>();
        assert_send_sync::<HashTable<&'static Global>>();
    }

    #[test]
    #[should_panic(expected = "below the minimum")]
    fn capacity_below_minimum_panics() {
        let _ = HashTable::with_capacity(MIN_CAPACITY - 1);
    }

    #[test]
    #[should_panic(expected = "key must not be empty")]
    fn empty_key_panics() {
        let mut table = HashTable::with_capacity(MIN_CAPACITY);
        let _ = table.put(b"", b"v");
    }

    #[test]
    #[should_panic(expected = "value must not be empty")]
    fn empty_value_panics() {
        let mut table = HashTable::with_capacity(MIN_CAPACITY);
        let _ = table.put(b"k", b"");
    }
}
