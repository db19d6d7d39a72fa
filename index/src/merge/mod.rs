//! Set algebra, weighted merges and three-way reconciliation.
//!
//! Every operation walks its inputs in key order at the same time
//! ([`merge_join`]) and bulk-builds a fresh tree on the left operand's store.
//! Inputs are never modified.

mod reconcile;
mod setops;
mod weighted;

pub use reconcile::reconcile;
pub use setops::KeySet;
pub use weighted::{
    Accumulator, Combine, Contribution, MERGE_DEFAULT, Weight, merge, merge_weight, normalize,
};

use crate::btree::{TreeError, TreeKey};

/// Where a key was found during a merge-join.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side<A, B> {
    Left(A),
    Right(B),
    Both(A, B),
}

/// Walk two ascending sequences together, calling `visit` once per distinct
/// key in ascending order.
pub fn merge_join<K, A, B, L, R, F>(left: L, right: R, mut visit: F) -> Result<(), TreeError<K>>
where
    K: TreeKey,
    A: Copy,
    B: Copy,
    L: IntoIterator<Item = Result<(K, A), TreeError<K>>>,
    R: IntoIterator<Item = Result<(K, B), TreeError<K>>>,
    F: FnMut(K, Side<A, B>) -> Result<(), TreeError<K>>,
{
    let mut left = left.into_iter();
    let mut right = right.into_iter();
    let mut l = left.next().transpose()?;
    let mut r = right.next().transpose()?;

    loop {
        match (l, r) {
            (None, None) => return Ok(()),
            (Some((key, a)), None) => {
                visit(key, Side::Left(a))?;
                l = left.next().transpose()?;
            }
            (None, Some((key, b))) => {
                visit(key, Side::Right(b))?;
                r = right.next().transpose()?;
            }
            (Some((lk, a)), Some((rk, b))) => match lk.cmp(&rk) {
                std::cmp::Ordering::Less => {
                    visit(lk, Side::Left(a))?;
                    l = left.next().transpose()?;
                }
                std::cmp::Ordering::Greater => {
                    visit(rk, Side::Right(b))?;
                    r = right.next().transpose()?;
                }
                std::cmp::Ordering::Equal => {
                    visit(lk, Side::Both(a, b))?;
                    l = left.next().transpose()?;
                    r = right.next().transpose()?;
                }
            },
        }
    }
}
