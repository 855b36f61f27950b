//! In-memory collaborator backends for tests and single-process clusters.

pub mod memory_journal;
pub mod memory_kv;
pub mod memory_lease;
pub mod memory_membership;
