//! End-to-end scenarios across trees, stores and merges.
//!
//! Each file covers one scenario with seeded inputs, checking the tree against
//! a `BTreeMap` model where the outcome depends on a random sequence.

#![cfg(test)]

mod helpers;

mod test_deep_tree;
mod test_fault_atomicity;
mod test_file_reopen;
mod test_reconcile_branches;
mod test_weighted_scenario;
