#![cfg_attr(test, allow(clippy::disallowed_methods))]
// Forbid unwrap() in production code to prevent panics from corrupt pages.
// Test code is allowed to use unwrap() for convenience.
#![cfg_attr(not(test), deny(clippy::unwrap_used))]

// Layers, bottom up:
//  - storage: node stores (memory, page file, fault injection)
//  - btree: buckets, nodes, the copy-on-write tree and its cursor
//  - merge: set algebra, weighted merges, three-way reconciliation

pub mod btree;
pub mod config;
pub mod merge;
pub mod storage;

mod e2e_tests;
