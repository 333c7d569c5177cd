use core::alloc::Layout;
use core::fmt::Debug;
use core::marker::PhantomData;
use core::ptr::NonNull;

use crate::error::Error;

/// Fixed header of an entry record.
///
/// An entry is a single allocation: this header followed immediately by
/// `key_len` key bytes and `val_len` value bytes. Records are linked into a
/// circular doubly-linked chain per bucket through `next` and `prev`; a
/// record alone in its bucket points at itself.
#[repr(C)]
pub(crate) struct Node {
    pub(crate) next: NonNull<Node>,
    pub(crate) prev: NonNull<Node>,
    pub(crate) key_len: usize,
    pub(crate) val_len: usize,
    pub(crate) hash: u32,
}

/// Offset of the key bytes from the start of a record.
const PAYLOAD_OFFSET: usize = size_of::<Node>();

impl Node {
    /// Layout of a record holding `key_len + val_len` payload bytes.
    pub(crate) fn layout(key_len: usize, val_len: usize) -> Result<Layout, Error> {
        let payload = key_len
            .checked_add(val_len)
            .ok_or(Error::CapacityOverflow)?;
        let payload = Layout::array::<u8>(payload).map_err(|_| Error::CapacityOverflow)?;
        let (layout, offset) = Layout::new::<Node>()
            .extend(payload)
            .map_err(|_| Error::CapacityOverflow)?;
        debug_assert_eq!(offset, PAYLOAD_OFFSET);

        Ok(layout.pad_to_align())
    }

    /// Layout of the live record at `node`.
    ///
    /// # Safety
    ///
    /// `node` must point to a live record. Its layout was validated when it
    /// was allocated.
    #[inline]
    pub(crate) unsafe fn layout_of(node: NonNull<Node>) -> Layout {
        // SAFETY: The caller guarantees `node` is live.
        let (key_len, val_len) = unsafe { (node.as_ref().key_len, node.as_ref().val_len) };
        match Self::layout(key_len, val_len) {
            Ok(layout) => layout,
            Err(_) => unreachable!("live record with unrepresentable layout"),
        }
    }

    /// Pointer to the first key byte.
    ///
    /// # Safety
    ///
    /// `node` must point to a live record.
    #[inline]
    pub(crate) unsafe fn key_ptr(node: NonNull<Node>) -> NonNull<u8> {
        // SAFETY: The payload starts right after the header, within the
        // record's allocation.
        unsafe { node.cast::<u8>().add(PAYLOAD_OFFSET) }
    }

    /// Pointer to the first value byte.
    ///
    /// # Safety
    ///
    /// `node` must point to a live record.
    #[inline]
    pub(crate) unsafe fn value_ptr(node: NonNull<Node>) -> NonNull<u8> {
        // SAFETY: The value follows the key bytes within the record's
        // allocation.
        unsafe { Self::key_ptr(node).add(node.as_ref().key_len) }
    }

    /// The key bytes of the record.
    ///
    /// # Safety
    ///
    /// `node` must point to a live record that outlives `'a` without its key
    /// bytes being written.
    #[inline]
    pub(crate) unsafe fn key<'a>(node: NonNull<Node>) -> &'a [u8] {
        // SAFETY: `key_len` initialized bytes follow the header.
        unsafe { core::slice::from_raw_parts(Self::key_ptr(node).as_ptr(), node.as_ref().key_len) }
    }

    /// Writes `key` and `value` into the payload of a freshly allocated record
    /// and fills in its header. Links are left self-referential.
    ///
    /// # Safety
    ///
    /// `node` must point to an allocation of at least
    /// `Node::layout(key.len(), value.len())`.
    pub(crate) unsafe fn init(node: NonNull<Node>, hash: u32, key: &[u8], value: &[u8]) {
        // SAFETY: The caller guarantees the allocation covers the header and
        // both payload slices.
        unsafe {
            node.write(Node {
                next: node,
                prev: node,
                key_len: key.len(),
                val_len: value.len(),
                hash,
            });
            core::ptr::copy_nonoverlapping(key.as_ptr(), Self::key_ptr(node).as_ptr(), key.len());
            core::ptr::copy_nonoverlapping(
                value.as_ptr(),
                Self::value_ptr(node).as_ptr(),
                value.len(),
            );
        }
    }

    /// Returns true if this record stores `key` with hash code `hash`.
    ///
    /// # Safety
    ///
    /// `node` must point to a live record.
    #[inline]
    pub(crate) unsafe fn matches(node: NonNull<Node>, hash: u32, key: &[u8]) -> bool {
        // SAFETY: The caller guarantees `node` is live; the key is only read
        // once hash and length agree.
        unsafe {
            let header = node.as_ref();
            header.hash == hash && header.key_len == key.len() && Self::key(node) == key
        }
    }
}

/// A borrowed view of one stored key-value pair.
///
/// Returned by [`HashTable::get`](crate::HashTable::get) and produced during
/// iteration. The slices borrow the table, so they cannot outlive any
/// mutation. Callers that need to hold on to a value across unrelated
/// insertions can keep [`value_ptr`](EntryRef::value_ptr) instead; see its
/// documentation for when that pointer is invalidated.
#[derive(Clone, Copy)]
pub struct EntryRef<'a> {
    node: NonNull<Node>,
    _marker: PhantomData<&'a Node>,
}

impl<'a> EntryRef<'a> {
    /// # Safety
    ///
    /// `node` must point to a live record that stays live and unmodified for
    /// `'a`.
    #[inline]
    pub(crate) unsafe fn new(node: NonNull<Node>) -> Self {
        Self {
            node,
            _marker: PhantomData,
        }
    }

    /// The key bytes.
    #[inline]
    pub fn key(&self) -> &'a [u8] {
        // SAFETY: The record is live for `'a`.
        unsafe { Node::key(self.node) }
    }

    /// The value bytes.
    #[inline]
    pub fn value(&self) -> &'a [u8] {
        // SAFETY: The record is live for `'a`; `val_len` initialized bytes
        // follow the key.
        unsafe { core::slice::from_raw_parts(self.value_ptr().as_ptr(), self.value_len()) }
    }

    /// Length of the key in bytes.
    #[inline]
    pub fn key_len(&self) -> usize {
        // SAFETY: The record is live for `'a`.
        unsafe { self.node.as_ref().key_len }
    }

    /// Length of the value in bytes.
    #[inline]
    pub fn value_len(&self) -> usize {
        // SAFETY: The record is live for `'a`.
        unsafe { self.node.as_ref().val_len }
    }

    /// The stored hash code of the key, as computed by
    /// [`hashcode`](crate::hashcode).
    #[inline]
    pub fn hash(&self) -> u32 {
        // SAFETY: The record is live for `'a`.
        unsafe { self.node.as_ref().hash }
    }

    /// Raw pointer to the first value byte.
    ///
    /// Unlike the slices, this pointer may be kept after the borrow of the
    /// table ends. It stays valid, pointing at the same `value_len()` bytes,
    /// across insertions and removals of *other* keys, including ones that
    /// grow or shrink the bucket array. It is invalidated by:
    ///
    /// - removing this key,
    /// - putting this key with a value of a different length,
    /// - clearing or dropping the table.
    ///
    /// Putting this key with a value of the same length overwrites the bytes
    /// in place and keeps the pointer valid. The value bytes have no
    /// particular alignment.
    #[inline]
    pub fn value_ptr(&self) -> NonNull<u8> {
        // SAFETY: The record is live for `'a`.
        unsafe { Node::value_ptr(self.node) }
    }
}

impl Debug for EntryRef<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EntryRef")
            .field("key", &self.key())
            .field("value", &self.value())
            .field("hash", &self.hash())
            .finish()
    }
}
