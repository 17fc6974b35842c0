//! # xmlforge
//!
//! An incremental static-site builder for XML sources. Scanners walk source
//! trees, rules transform matching documents with stylesheet programs, and
//! dated metadata extracted along the way is published as paginated
//! chronological and per-tag listings.
//!
//! # Architecture: Scan, Build, Publish
//!
//! ```text
//! Site ──▶ Scanner (per source tree) ──▶ Rule (per file) ──▶ Program
//!                    │                      │
//!                    │                      └─▶ StateExtractor ──▶ StateRecord
//!                    ▼
//!            entries, in walk order ──▶ StatePublisher (once every scanner is done)
//! ```
//!
//! Control flows down; state records flow back up and are only merged at the
//! scanner and site level. Publishing waits for every selected scanner, so
//! the listings always see the complete set of entries.
//!
//! # Module Map
//!
//! | Module | Role |
//! |--------|------|
//! | [`site`] | Orchestrator: binds rules and scanners from config, owns the transform cache, runs a profile, publishes state |
//! | [`scanner`] | Directory walk, include/exclude filters, suffix dispatch, link action |
//! | [`rule`] | Per-file build: staleness check, transform selection, post-passes, encoding |
//! | [`state`] | State records, extraction from documents, paginated publishing |
//! | [`transform`] | Transform engine traits, the built-in stylesheet engine, the program cache |
//! | [`xml`] | Arena document model, parsing with XInclude, serialization, path expressions |
//! | [`params`] | Transform parameter layers and their merge order |
//! | [`postprocess`] | Text passes over serialized output |
//! | [`config`] | `xmlforge.toml` loading, validation and the stock config |
//! | [`output`] | CLI output formatting |
//!
//! # Design Decisions
//!
//! ## Timestamps, Not Dependency Graphs
//!
//! A target is rebuilt when its source is at least as new as it is. There is
//! no record of which stylesheets or included files went into a target;
//! touching a stylesheet means touching the sources too (or deleting the
//! target tree). State is different: it is extracted from every source on
//! every run, built or not, so listings never go stale.
//!
//! ## Idempotent State Writes
//!
//! State pages are compared with what is on disk before writing, so an
//! unchanged listing keeps its modification time. Rules that read state
//! pages as inputs rely on that to stay "unchanged".
//!
//! ## Parallel Files, Sequential Order
//!
//! Files within a scanner are built on the rayon pool, but results are
//! gathered in walk order, so entries that share a date keep the same
//! relative order as a sequential run.

pub mod config;
pub mod output;
pub mod params;
pub mod postprocess;
pub mod rule;
pub mod scanner;
pub mod site;
pub mod state;
pub mod transform;
pub mod xml;

#[cfg(test)]
pub(crate) mod test_helpers;
