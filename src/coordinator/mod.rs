//! Structural transaction coordinator
//!
//! Lifecycle operations that touch a canonical record, its pointers in every
//! group, and the series pointers above them. Each structural operation is
//! built from fresh reads into one `TransactionBatch`; every replaced or
//! deleted row is conditioned on the version it was read at. A concurrent
//! writer cancels the whole batch and the caller rebuilds from fresh reads.
//! The coordinator holds no in-process lock.
//!
//! - `structural` - hangout create/delete, promote to series, add member,
//!   remove member, delete series
//! - `reservation` - spot claims and chunked reservation completion

pub mod batch;
pub mod reservation;
pub mod structural;

pub use batch::{BulkBatch, BulkReport, TransactionBatch};
pub use reservation::{CompletionReport, ReservationCoordinator};
pub use structural::{MemberRemoval, RemovalOutcome, StructuralCoordinator};
