//! Keeps deep recursion in the parser and interpreter off the guard page.
//!
//! Every recursive entry point runs through [`ensure_sufficient_stack`], which
//! grows the native stack on demand. Language-level recursion is still capped
//! separately by the interpreter's call depth limit.

/// If less than this remains, grow the stack before recursing.
const RED_ZONE: usize = 100 * 1024;

/// Size of each new stack segment.
const STACK_PER_RECURSION: usize = 1024 * 1024;

#[inline]
pub fn ensure_sufficient_stack<R>(f: impl FnOnce() -> R) -> R {
    stacker::maybe_grow(RED_ZONE, STACK_PER_RECURSION, f)
}
