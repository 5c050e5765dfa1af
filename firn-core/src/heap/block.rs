use {
    crate::{heap::tag, value::Value},
    std::{
        alloc::{Layout, handle_alloc_error},
        cell::Cell,
        mem::{align_of, forget, size_of},
        process::abort,
        ptr::{self, NonNull},
        sync::atomic::{AtomicU32, Ordering::Relaxed},
    },
};

/// The thread-shared sentinel bit of a reference count.
pub (crate) const THREAD_SHARED: u32 = 0x8000_0000;

/// The count bits of a reference count.
pub (crate) const COUNT_MASK: u32 = 0x7FFF_FFFF;

/// Counts beyond this would overflow into the sentinel bit.
const MAX_REFCOUNT: u32 = 0x4000_0000;

/// Header at the start of every heap cell.
///
/// The header is followed immediately by `len` 8-byte field slots.
/// The reference count stores the number of references *besides* the
/// holder, so zero means unique. The tag and scan size use interior
/// mutability because forcing rewrites them through shared references
/// (the `LAZY_CON → LAZY_EVAL → LAZY_IND` transition); this is sound
/// under the single-mutator invariant documented in [the module
/// docs][`crate::heap`].
#[repr(C, align(8))]
pub struct BlockHeader
{
    /// References besides the holder; bit 31 is the sentinel.
    refcount: AtomicU32,

    /// Discriminator; see [`tag`].
    tag: Cell<u32>,

    /// Leading slots that hold owned child handles.
    ///
    /// The high bit of any valid scan size is clear; it is reserved
    /// for a future "being evaluated in place" mark.
    scan_size: Cell<u32>,

    /// Total slot count, fixed at allocation.
    len: u32,
}

impl BlockHeader
{
    fn new(tag: u32, scan_size: u32, len: u32) -> Self
    {
        debug_assert!(scan_size <= len);
        Self{
            refcount: AtomicU32::new(0),
            tag: Cell::new(tag),
            scan_size: Cell::new(scan_size),
            len,
        }
    }

    /// The cell's tag.
    pub fn tag(&self) -> u32
    {
        self.tag.get()
    }

    /// The raw reference count, sentinel bit included.
    pub fn refcount(&self) -> u32
    {
        self.refcount.load(Relaxed)
    }

    /// Whether the holder is the only live reference.
    pub fn is_unique(&self) -> bool
    {
        self.refcount() == 0
    }

    /// Whether the cell may be reachable from other threads.
    pub fn is_thread_shared(&self) -> bool
    {
        self.refcount() & THREAD_SHARED != 0
    }

    /// Whether the cell's tag belongs to the lazy family.
    pub fn is_lazy(&self) -> bool
    {
        tag::is_lazy(self.tag())
    }

    /// Whether a force is in progress on this cell.
    pub fn is_blackhole(&self) -> bool
    {
        self.tag() == tag::LAZY_EVAL
    }

    /// Whether slot 0 owns this cell's forced result.
    pub fn is_indirection(&self) -> bool
    {
        self.tag() == tag::LAZY_IND
    }

    /// Leading slots that hold owned child handles.
    pub fn scan_size(&self) -> u32
    {
        self.scan_size.get()
    }

    /// Total slot count.
    pub fn len(&self) -> u32
    {
        self.len
    }

    /// Mark the cell as reachable from other threads.
    ///
    /// Called by the runtime when a value crosses a thread boundary.
    /// Forcing routes such cells through the thread-shared strategy.
    pub fn mark_thread_shared(&self)
    {
        self.refcount.fetch_or(THREAD_SHARED, Relaxed);
    }

    pub (crate) fn set_tag(&self, tag: u32)
    {
        self.tag.set(tag);
    }

    pub (crate) fn set_scan_size(&self, scan_size: u32)
    {
        debug_assert!(scan_size <= self.len);
        self.scan_size.set(scan_size);
    }

    /// Add a reference.
    pub (crate) fn retain(&self)
    {
        let old = self.refcount.fetch_add(1, Relaxed);
        if old & COUNT_MASK > MAX_REFCOUNT {
            // The count would reach the sentinel bit.
            abort();
        }
    }

    /// Remove a reference that is known not to be the last one.
    pub (crate) fn decref(&self)
    {
        debug_assert!(self.refcount() & COUNT_MASK != 0);
        self.refcount.fetch_sub(1, Relaxed);
    }

    /// Pointer to the first field slot.
    fn slots(&self) -> *mut Value
    {
        let header: *const BlockHeader = self;
        // The slots follow the header immediately; the allocation in
        // alloc_raw covers them.
        unsafe { header.add(1) as *mut Value }
    }

    /// Borrow a field slot.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    pub fn field(&self, index: u32) -> &Value
    {
        assert!(index < self.len, "field index out of bounds");
        // SAFETY: In bounds, and every slot is initialized from
        //         allocation until the cell is freed.
        unsafe { &*self.slots().add(index as usize) }
    }

    /// Move a field slot out, assuming ownership of the handle.
    ///
    /// # Safety
    ///
    /// The slot must not be read again (by [`field`][`Self::field`],
    /// by another `take_field`, or by releasing the cell with a scan
    /// size that still covers it) unless it is re-initialized with
    /// [`set_field`][`Self::set_field`] first.
    pub unsafe fn take_field(&self, index: u32) -> Value
    {
        debug_assert!(index < self.len, "field index out of bounds");
        ptr::read(self.slots().add(index as usize))
    }

    /// Move a handle into a field slot.
    ///
    /// # Safety
    ///
    /// The slot must be vacant: either never scanned, or moved out
    /// with [`take_field`][`Self::take_field`]. Whatever bits it held
    /// are overwritten without being released.
    pub (crate) unsafe fn set_field(&self, index: u32, value: Value)
    {
        debug_assert!(index < self.len, "field index out of bounds");
        ptr::write(self.slots().add(index as usize), value);
    }

    /// Allocate a fresh cell that is a field-wise copy of this one.
    ///
    /// The copy has a reference count of zero and the same tag and
    /// scan size. Each scanned child is retained once more, so the
    /// original and the copy are independently valid owners.
    pub fn alloc_copy(&self) -> Value
    {
        // SAFETY: The header and every slot are initialized before
        //         the handle is built.
        let copy = unsafe {
            let copy = alloc_raw(self.len);
            let header = BlockHeader::new(self.tag(), self.scan_size(), self.len);
            ptr::write(copy.as_ptr(), header);
            let source = self.slots() as *const u64;
            let target = copy.as_ref().slots() as *mut u64;
            ptr::copy_nonoverlapping(source, target, self.len as usize);
            copy
        };

        // SAFETY: Initialized above; the handle below keeps it alive.
        let header = unsafe { copy.as_ref() };
        for index in 0 .. header.scan_size() {
            // Retain the shared child; the copied slot bits are its
            // owning handle.
            forget(header.field(index).clone());
        }

        Value::from_block(copy)
    }
}

/// Allocate storage for a cell with `len` field slots.
///
/// # Safety
///
/// The caller must initialize the header and every slot before the
/// cell is used or freed.
pub (crate) unsafe fn alloc_raw(len: u32) -> NonNull<BlockHeader>
{
    let size = size_of::<BlockHeader>() + len as usize * size_of::<u64>();
    let layout = Layout::from_size_align(size, align_of::<BlockHeader>())
        .expect("Cannot allocate a block this large");

    // malloc aligns for any fundamental type, which covers the
    // 8-byte header alignment that pointer tagging relies on.
    let ptr = libc::malloc(layout.size());
    let Some(ptr) = NonNull::new(ptr)
        else { handle_alloc_error(layout) };

    #[cfg(test)]
    LIVE_BLOCKS.with(|live| live.set(live.get() + 1));

    ptr.cast()
}

/// Free a cell's storage without releasing its slots.
///
/// # Safety
///
/// No reference to the cell may survive the call, and ownership of
/// every scanned slot must already have been moved out or released.
pub (crate) unsafe fn free_raw(block: NonNull<BlockHeader>)
{
    #[cfg(test)]
    LIVE_BLOCKS.with(|live| live.set(live.get() - 1));

    libc::free(block.as_ptr() as *mut libc::c_void);
}

/// Allocate a cell owning the given field handles.
///
/// Cells with a lazy-family tag always get at least one slot, so the
/// indirection rewrite never needs to grow them; a spare slot is
/// initialized to an unboxed zero and excluded from the scan.
pub (crate) fn alloc_block(tag_word: u32, fields: Vec<Value>)
    -> NonNull<BlockHeader>
{
    let scan = u32::try_from(fields.len())
        .expect("Cannot allocate a block with this many fields");
    let len = if tag::is_lazy(tag_word) { scan.max(1) } else { scan };

    // SAFETY: The header and every slot are initialized before the
    //         pointer is returned.
    unsafe {
        let block = alloc_raw(len);
        ptr::write(block.as_ptr(), BlockHeader::new(tag_word, scan, len));
        let header = block.as_ref();
        for (index, field) in fields.into_iter().enumerate() {
            header.set_field(index as u32, field);
        }
        if len > scan {
            header.set_field(scan, Value::unboxed(0));
        }
        block
    }
}

#[cfg(test)]
thread_local!
{
    /// Cells allocated and not yet freed, for leak assertions.
    pub (crate) static LIVE_BLOCKS: Cell<i64> = Cell::new(0);
}

#[cfg(test)]
mod tests
{
    use {super::*, proptest::proptest};

    fn live_blocks() -> i64
    {
        LIVE_BLOCKS.with(Cell::get)
    }

    #[test]
    fn header_is_a_compact_word_aligned_record()
    {
        assert_eq!(size_of::<BlockHeader>(), 16);
        assert_eq!(align_of::<BlockHeader>(), 8);
    }

    #[test]
    fn alloc_copy_shares_children_with_the_original()
    {
        let baseline = live_blocks();

        let child = Value::block(3, vec![Value::unboxed(1)]);
        let original = Value::block(tag::lazy_constructor(0), vec![child]);
        let header = original.header().unwrap();
        assert!(header.field(0).header().unwrap().is_unique());

        let copy = header.alloc_copy();
        let copy_header = copy.header().unwrap();
        assert!(copy_header.is_unique());
        assert_eq!(copy_header.tag(), header.tag());
        assert_eq!(copy_header.scan_size(), header.scan_size());

        // Both cells own the child now.
        assert_eq!(header.field(0).header().unwrap().refcount(), 1);

        drop(copy);
        assert_eq!(header.field(0).header().unwrap().refcount(), 0);

        drop(original);
        assert_eq!(live_blocks(), baseline);
    }

    #[test]
    fn retaining_preserves_the_shared_sentinel()
    {
        let value = Value::block(tag::lazy_constructor(0), vec![]);
        let header = value.header().unwrap();
        header.mark_thread_shared();

        let alias = value.clone();
        let header = alias.header().unwrap();
        assert!(header.is_thread_shared());
        assert_eq!(header.refcount() & COUNT_MASK, 1);
        assert!(!header.is_unique());
    }

    proptest!
    {
        #[test]
        fn fields_read_back(values in proptest::collection::vec(-100i64 .. 100, 0 .. 8))
        {
            let baseline = live_blocks();

            let fields = values.iter().map(|&n| Value::unboxed(n)).collect();
            let block = Value::block(7, fields);
            let header = block.header().unwrap();
            assert_eq!(header.scan_size() as usize, values.len());
            for (index, &n) in values.iter().enumerate() {
                assert_eq!(header.field(index as u32).as_unboxed(), Some(n));
            }

            drop(block);
            assert_eq!(live_blocks(), baseline);
        }
    }
}
