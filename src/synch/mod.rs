//! Synchronization primitives (spec §4's "C13"): a ticket spinlock for
//! short critical sections, a seqlock for read-mostly data the writer can
//! update without ever blocking a reader, and a wait-group for "N producers
//! must finish before I proceed".

pub mod seqlock;
pub mod spinlock;
pub mod waitgroup;
