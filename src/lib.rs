//! Hangout Projections - denormalized projection consistency engine
//!
//! Canonical hangout, series, and group records live next to denormalized
//! "pointer" copies that group feeds read in one query. This crate keeps the
//! copies consistent with the canonical rows under concurrent writers.
//!
//! ## Architecture
//!
//! - **Pointer synchronizer**: optimistic read-modify-write on one
//!   projection with bounded retry
//! - **Counter updater**: blind atomic increments for derived counts
//! - **Structural coordinator**: series membership changes as single
//!   all-or-nothing transactions; resumable chunked bulk writes
//! - **Feed assembler**: windowed, cursor-paginated, hydrated group feeds
//!
//! ## Storage Layout
//!
//! ```text
//! ~/.local/share/hangout-projections/
//! ├── projections.db         # Single-table item store (SQLite, WAL)
//! └── config.toml            # Configuration
//! ```
//!
//! ## Partitions
//!
//! | pk            | sk                     | row               |
//! |---------------|------------------------|-------------------|
//! | `GROUP#g`     | `METADATA`             | group             |
//! | `GROUP#g`     | `HANGOUT#h`            | hangout pointer   |
//! | `GROUP#g`     | `SERIES#s`             | series pointer    |
//! | `EVENT#h`     | `METADATA`             | canonical hangout |
//! | `EVENT#h`     | `POLL#p`, `VOTE#p#u`.. | hangout children  |
//! | `SERIES#s`    | `METADATA`             | canonical series  |

pub mod access;
pub mod config;
pub mod coordinator;
pub mod counter;
pub mod engine;
pub mod error;
pub mod events;
pub mod feed;
pub mod model;
pub mod store;
pub mod sync;

// Re-exports
pub use access::{AccessGate, AllowAll, EntityRef, GroupMembershipGate};
pub use config::Config;
pub use coordinator::{
    BulkBatch, BulkReport, CompletionReport, MemberRemoval, RemovalOutcome, ReservationCoordinator,
    StructuralCoordinator, TransactionBatch,
};
pub use counter::CounterUpdater;
pub use engine::Engine;
pub use error::{ProjectionError, Result};
pub use events::{ChangeSignal, EventBus, EventListener, InvalidationMarkers};
pub use feed::{FeedAssembler, FeedCursor, FeedDirection, FeedEntry, FeedPage};
pub use store::{ItemStore, MemoryStore, SqliteStore};
pub use sync::{PointerSynchronizer, SyncCriticality, SyncOutcome};
