//! Forcing lazy values to weak-head-normal form.
//!
//! # How forcing works
//!
//! A thunk is a cell whose tag is a lazy constructor. [`force`] drives
//! such a cell to weak-head-normal form by applying the datatype's
//! [evaluator][`Evaluator`] and looping, never recursing, until the
//! head is no longer lazy, following indirections along the way.
//!
//! How one iteration treats the cell depends on its ownership class:
//!
//!  - **Unique** (count zero): nothing else can observe the cell, so
//!    the evaluator consumes it directly. No black hole, no
//!    indirection.
//!  - **Thread-local** (count nonzero, sentinel clear): aliases on
//!    this thread may observe the cell mid-force. The evaluator runs
//!    on a private copy while the original is overwritten with a
//!    *black hole*; a re-entrant force that reaches the cell sees the
//!    black hole and returns it instead of evaluating again, which is
//!    how self-dependent thunks surface. Afterwards the original is
//!    rewritten into an *indirection* to the result, so every alias
//!    shares the one evaluation.
//!  - **Thread-shared** (sentinel set): routed through its own entry
//!    point, which for a single-mutator runtime delegates to the
//!    thread-local strategy.
//!
//! The copy-then-overwrite discipline means the evaluator always sees
//! an ordinary lazy constructor, never a black hole, and the original
//! cell's identity is preserved for its aliases.

use {
    crate::{
        context::{Context, FatalCode, FatalError},
        eval::Evaluator,
        heap::{self, tag},
        value::Value,
    },
    std::mem::forget,
};

const YIELD_MESSAGE: &str =
    "yielding from inside a lazy constructor is currently not supported";

/// Ownership class of a cell about to be forced.
enum Ownership
{
    Unique,
    Local,
    ThreadShared,
}

/// Classify a cell by its reference count.
///
/// The count is read exactly once per force iteration; the class is
/// a pair of bit tests on that load.
fn classify(refcount: u32) -> Ownership
{
    if refcount == 0 {
        Ownership::Unique
    } else if refcount & heap::THREAD_SHARED != 0 {
        Ownership::ThreadShared
    } else {
        Ownership::Local
    }
}

/// Force a lazy value to weak-head-normal form.
///
/// Takes an owned handle for which [`Value::is_lazy`] holds and
/// returns an owned handle whose head is no longer lazy. The one
/// exception: when the thunk's value turns out to depend on itself,
/// the black-holed cell itself is returned and the caller's pattern
/// match reports the cycle.
///
/// The driver is iterative: a chain of thunks or indirections of any
/// length consumes no native stack. Recursive forcing triggered from
/// inside an evaluator is fine; the driver itself never calls itself.
pub fn force(mut next: Value, eval: &Evaluator, ctx: &mut Context) -> Value
{
    debug_assert!(next.is_lazy(), "force requires a lazy handle");

    loop {
        let Some((tag_word, refcount)) = next.header()
            .map(|header| (header.tag(), header.refcount()))
            else { return next };

        if !tag::is_lazy(tag_word) {
            return next;
        }

        if tag_word == tag::LAZY_IND {
            next = follow_indirection(next);
            continue;
        }

        if tag_word == tag::LAZY_EVAL {
            // A force is already in progress on this cell in this
            // thread: the thunk's value depends on itself. Hand the
            // black hole back unchanged; the caller's pattern match
            // fails on it and surfaces the cycle through the usual
            // match-failure channel.
            log::trace!("force observed a black hole; surfacing lazy cycle");
            return next;
        }

        debug_assert!(tag::is_lazy_constructor(tag_word));

        next = match classify(refcount) {
            Ownership::Unique       => eval_unique(next, eval, ctx),
            Ownership::Local        => eval_local(next, eval, ctx),
            Ownership::ThreadShared => eval_thread_shared(next, eval, ctx),
        };

        if ctx.is_yielding() {
            ctx.fatal(FatalError{
                code: FatalCode::NotSupported,
                message: YIELD_MESSAGE,
            });
        }
    }
}

/// Force a value that may or may not be lazy.
///
/// Lazy handles are delegated to [`force`]; anything else is returned
/// unchanged.
pub fn try_force(value: Value, eval: &Evaluator, ctx: &mut Context) -> Value
{
    if value.is_lazy() {
        force(value, eval, ctx)
    } else {
        value
    }
}

/// Dispose of a consumed thunk cell, redirecting any aliases.
///
/// Evaluators that build their result in fresh storage call this with
/// the cell they were given (`target`, which must be a block) and the
/// result (`value`). A unique target, the common case since evaluators
/// always receive a uniquely-referenced cell, is freed outright: the
/// caller has already moved its fields out, so only the storage
/// remains. A target that has since grown aliases instead has its
/// remaining owned slots released and is rewritten into an indirection
/// to `value`, so the aliases observe the result.
pub fn make_indirect(target: Value, value: Value) -> Value
{
    let block = target.block_ptr()
        .expect("make_indirect target must be a block");
    // SAFETY: `target` keeps the block alive.
    let header = unsafe { block.as_ref() };

    if header.is_unique() {
        debug_assert!(value.block_ptr() != Some(block));
        forget(target);
        // SAFETY: `target` was the only reference and has been
        //         forgotten; the caller owns the cell's fields.
        unsafe { heap::free_raw(block) };
        return value;
    }

    // Release whatever the cell still owns, then point the aliases
    // at the result. The result handle moves into slot 0.
    let scan = header.scan_size();
    header.set_scan_size(0);
    for index in 0 .. scan {
        // SAFETY: Scanning stopped above; each slot is taken once.
        drop(unsafe { header.take_field(index) });
    }
    // SAFETY: Slot 0 is vacant after the release above.
    unsafe { header.set_field(0, value) };
    header.set_scan_size(1);
    header.set_tag(tag::LAZY_IND);
    target
}

/// Consume an indirection, adopting the result it owns.
fn follow_indirection(next: Value) -> Value
{
    let block = next.block_ptr()
        .expect("indirection handle must be a block");
    // SAFETY: `next` keeps the block alive.
    let header = unsafe { block.as_ref() };
    debug_assert!(header.is_indirection());
    debug_assert_eq!(header.scan_size(), 1);

    if header.is_unique() {
        // Sole owner: adopt the result out of the spent cell and
        // free it in place.
        // SAFETY: The cell is freed raw below; the slot is read once.
        let result = unsafe { header.take_field(0) };
        forget(next);
        // SAFETY: `next` was the only reference and is forgotten;
        //         ownership of slot 0 moved into `result`.
        unsafe { heap::free_raw(block) };
        result
    } else {
        // Aliases remain: share the result and release our reference.
        let result = header.field(0).clone();
        drop(next);
        result
    }
}

/// Force a uniquely-referenced thunk.
///
/// No alias can exist, so no black hole and no indirection are
/// needed: the evaluator consumes the cell and its result is the
/// iteration's new head. The evaluator may reuse the storage or
/// dispose of it; the forcer does not care which.
fn eval_unique(next: Value, eval: &Evaluator, ctx: &mut Context) -> Value
{
    debug_assert!(match next.header() {
        Some(header) =>
            header.is_unique()
            && tag::is_lazy_constructor(header.tag()),
        None => false,
    });

    eval.call(next, ctx)
}

/// Force a thunk with thread-local aliases.
fn eval_local(next: Value, eval: &Evaluator, ctx: &mut Context) -> Value
{
    let block = next.block_ptr()
        .expect("forced handle must be a block");
    // SAFETY: `next` keeps the block alive for the whole call; the
    //         cell cannot be freed while we hold an owned handle.
    let header = unsafe { block.as_ref() };
    debug_assert!(!header.is_unique());
    debug_assert!(tag::is_lazy_constructor(header.tag()));

    // Evaluate a private copy; the original becomes the black hole
    // that a re-entrant force within this thread will observe.
    let copy = header.alloc_copy();
    let scan = header.scan_size();
    header.set_tag(tag::LAZY_EVAL);
    header.set_scan_size(0);
    // The copy retained every scanned child; release the originals
    // so the children are not kept alive twice.
    for index in 0 .. scan {
        // SAFETY: Scanning stopped at the line above; each abandoned
        //         slot is taken exactly once.
        drop(unsafe { header.take_field(index) });
    }

    let result = eval.call(copy, ctx);

    if ctx.is_yielding() {
        ctx.fatal(FatalError{
            code: FatalCode::NotSupported,
            message: YIELD_MESSAGE,
        });
    }

    if result.block_ptr() == Some(block) {
        // The evaluator got the black hole itself back: the thunk's
        // value depends on itself. Leave the black hole installed so
        // every alias observes the cycle too.
        drop(result);
        return next;
    }

    // Rewrite the original into an indirection so surviving aliases
    // share the result. The result handle moves into slot 0.
    // SAFETY: Slot 0 was abandoned by the release above.
    unsafe { header.set_field(0, result) };
    header.set_scan_size(1);
    header.set_tag(tag::LAZY_IND);
    next
}

/// Force a thunk that may be reachable from other threads.
///
/// A full concurrent strategy would compare-and-swap the tag from its
/// lazy constructor to the reserved preparation tag while installing
/// an intrusive wait list in slot 0; losers of the race would either
/// spin for the indirection or enqueue their context and suspend, and
/// the winner would evaluate a private copy and publish it with a
/// second compare-and-swap before waking the others. Until the
/// runtime grows multiple mutators, delegating to the thread-local
/// strategy is correct and keeps the routing in place.
fn eval_thread_shared(next: Value, eval: &Evaluator, ctx: &mut Context)
    -> Value
{
    eval_local(next, eval, ctx)
}
