//! Storage layer
//!
//! Read/write contract against the persistent store plus the two shipped
//! adapters (SQLite and in-memory). See [`repository`].

pub mod repository;

pub use repository::{
    DispatchLedger, GroupPolicyRepository, HealthRepository, LedgerEntry, LedgerMark,
    MockRepository, PrayerTimesRepository, PutMode, PutOutcome, Repositories,
    SharedDispatchLedger, SharedGroupPolicyRepository, SharedHealthRepository,
    SharedPrayerTimesRepository, SqliteRepository,
};
