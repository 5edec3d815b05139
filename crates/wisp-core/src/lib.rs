//! Wisp Core: arbitrary-precision arithmetic shared by the Wisp runtime.
//!
//! This crate holds the one fully self-contained leaf component of the
//! Wisp virtual machine — [`bigint::BigInt`] — so that it can be reused,
//! tested and versioned independently of the heap/interpreter machinery
//! in `wisp-runtime`.

pub mod bigint;

pub use bigint::{BigInt, BigIntOverflow, IntComp, MAX_DIGITS};
