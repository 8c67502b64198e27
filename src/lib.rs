//! Purpose: Library crate behind the `clickdump` CLI: export and restore ClickHouse backups.
//! Exports: `core` (error, codec, pipe, naming, statements, jobs), `storage`, `clickhouse`,
//! `filter`, `backup`, `restore`.
//! Role: Orchestrators depend only on the `QueryClient` and `Storage` traits; the binary wires
//! concrete implementations.
//! Invariants: Components are constructed explicitly and passed in; no process-wide state.
pub mod backup;
pub mod clickhouse;
pub mod core;
pub mod filter;
pub mod restore;
pub mod storage;
