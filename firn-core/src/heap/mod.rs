//! Reference-counted heap cells.
//!
//! # Design of the cell model
//!
//! ## Blocks
//!
//! A [block][`BlockHeader`] is a cell of `malloc`ed storage: a compact
//! word-aligned header followed by a fixed number of 8-byte field
//! slots. The header records a tag drawn from an open set (see
//! [`tag`]), the number of leading slots that hold owned child handles
//! (the *scan size*), and a reference count.
//!
//! ## Reference counts
//!
//! The count stores the number of references *besides* the holder:
//! zero means the holder is the only live reference and may consume
//! the cell in place. Bit 31 of the count is the thread-shared
//! sentinel; a cell that carries it may be reachable from other
//! threads and must be forced through the thread-shared strategy.
//! The field is atomic so the sentinel and a future concurrent
//! protocol have a home, but all accesses in this core are relaxed:
//! only one mutator thread touches any given cell.
//!
//! ## Scan discipline
//!
//! Only the first `scan_size` slots are released when a cell dies.
//! Rewriting a cell (black-holing it, or turning it into an
//! indirection) therefore always adjusts the scan size in step with
//! the slots it abandons or adopts, so that no owned handle is ever
//! released twice or forgotten.

pub use self::block::*;

pub mod tag;

mod block;
