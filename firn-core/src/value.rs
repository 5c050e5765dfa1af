//! Word-sized value handles.

use {
    crate::heap::{self, BlockHeader},
    std::{fmt, marker::PhantomData, num::NonZeroU64, ptr::NonNull},
};

/// Reference-counted, dynamically-tagged Firn value handle.
///
/// A handle is one tagged word. If the least significant bit is set,
/// the handle is an unboxed scalar with a 63-bit payload; the forcer
/// never looks inside such payloads. Otherwise the word is a pointer
/// to a [block][`BlockHeader`] (block alignment keeps the bit free).
/// Neither form is ever zero, so [`NonZeroU64`] gives us the niche
/// optimization.
///
/// Cloning a handle retains the block it references; dropping one
/// releases it, freeing the cell and its owned children when the last
/// reference goes. Moving a handle transfers ownership without
/// touching the count.
pub struct Value
{
    inner: NonZeroU64,

    /// Handles are confined to their mutator thread: cloning and
    /// dropping use relaxed count updates, and forcing rewrites
    /// headers through `Cell`.
    _phantom_data: PhantomData<*const ()>,
}

impl Value
{
    /// Create an unboxed scalar handle.
    ///
    /// The payload is truncated to 63 bits.
    pub fn unboxed(value: i64) -> Self
    {
        let word = ((value as u64) << 1) | 1;
        // SAFETY: The low bit is set, so the word is nonzero.
        Self{
            inner: unsafe { NonZeroU64::new_unchecked(word) },
            _phantom_data: PhantomData,
        }
    }

    /// Allocate a block owning the given field handles.
    ///
    /// The new cell is uniquely referenced by the returned handle.
    /// Cells with a lazy-family tag always get at least one slot;
    /// see [`heap`] for the layout.
    pub fn block(tag: u32, fields: Vec<Value>) -> Self
    {
        Self::from_block(heap::alloc_block(tag, fields))
    }

    /// Create a handle from a block pointer, adopting one reference.
    pub (crate) fn from_block(block: NonNull<BlockHeader>) -> Self
    {
        let word = block.as_ptr() as u64;
        debug_assert_eq!(word & 0b111, 0, "Block pointers must be 8-aligned");
        // SAFETY: The pointer is non-null.
        Self{
            inner: unsafe { NonZeroU64::new_unchecked(word) },
            _phantom_data: PhantomData,
        }
    }

    /// Whether the handle is an unboxed scalar.
    pub fn is_unboxed(&self) -> bool
    {
        self.inner.get() & 1 == 1
    }

    /// Whether the handle points to a block.
    pub fn is_block(&self) -> bool
    {
        !self.is_unboxed()
    }

    /// The scalar payload, if the handle is unboxed.
    pub fn as_unboxed(&self) -> Option<i64>
    {
        if self.is_unboxed() {
            Some((self.inner.get() as i64) >> 1)
        } else {
            None
        }
    }

    /// The block pointer, if the handle points to a block.
    pub (crate) fn block_ptr(&self) -> Option<NonNull<BlockHeader>>
    {
        if self.is_block() {
            NonNull::new(self.inner.get() as *mut BlockHeader)
        } else {
            None
        }
    }

    /// Borrow the header of the referenced block, if any.
    pub fn header(&self) -> Option<&BlockHeader>
    {
        let block = self.block_ptr()?;
        // SAFETY: This handle owns a reference that keeps the block
        //         alive for as long as the borrow lasts.
        Some(unsafe { &*block.as_ptr() })
    }

    /// Whether the handle denotes a lazy value.
    ///
    /// True iff it points to a block whose tag is in the lazy family:
    /// a lazy constructor, a black hole, an indirection, or the
    /// reserved preparation tag.
    pub fn is_lazy(&self) -> bool
    {
        match self.header() {
            Some(header) => header.is_lazy(),
            None         => false,
        }
    }
}

impl Clone for Value
{
    fn clone(&self) -> Self
    {
        if let Some(header) = self.header() {
            header.retain();
        }
        Self{inner: self.inner, _phantom_data: PhantomData}
    }
}

impl Drop for Value
{
    fn drop(&mut self)
    {
        let Some(block) = self.block_ptr() else { return };

        // SAFETY: This handle keeps the block alive until the free
        //         at the end of this function.
        let header = unsafe { block.as_ref() };
        if header.refcount() & heap::COUNT_MASK != 0 {
            header.decref();
            return;
        }

        // Last reference: release the owned children, then the
        // storage. Children release recursively.
        // NOTE: Freeing without synchronization is sound only under
        //       the single-mutator invariant; a concurrent runtime
        //       needs an acquire/release protocol here.
        for index in 0 .. header.scan_size() {
            // SAFETY: The cell is being destroyed; each scanned slot
            //         is taken exactly once and never read again.
            drop(unsafe { header.take_field(index) });
        }

        // SAFETY: No reference to the cell survives this point.
        unsafe { heap::free_raw(block) };
    }
}

impl fmt::Debug for Value
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result
    {
        match self.as_unboxed() {
            Some(value) => write!(f, "Value({value})"),
            None        => write!(f, "Value({:#016x})", self.inner),
        }
    }
}

#[cfg(test)]
mod tests
{
    use {
        super::*,
        crate::heap::tag,
        std::mem::size_of,
        proptest::proptest,
    };

    #[test]
    fn handles_are_one_word_with_a_niche()
    {
        assert_eq!(size_of::<Value>(), 8);
        assert_eq!(size_of::<Option<Value>>(), 8);
    }

    #[test]
    fn cloning_counts_references()
    {
        let value = Value::block(5, vec![]);
        assert!(value.header().unwrap().is_unique());

        let alias = value.clone();
        assert_eq!(value.header().unwrap().refcount(), 1);

        drop(alias);
        assert!(value.header().unwrap().is_unique());
    }

    #[test]
    fn laziness_is_a_tag_range_property()
    {
        assert!(!Value::unboxed(42).is_lazy());
        assert!(!Value::block(5, vec![]).is_lazy());
        let thunk = Value::block(tag::lazy_constructor(0), vec![]);
        assert!(thunk.is_lazy());
    }

    proptest!
    {
        #[test]
        fn unboxed_payloads_round_trip(value in (i64::MIN >> 1) ..= (i64::MAX >> 1))
        {
            assert_eq!(Value::unboxed(value).as_unboxed(), Some(value));
        }
    }
}
