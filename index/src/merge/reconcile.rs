//! Three-way reconciliation of concurrently modified trees.
//!
//! Given the version both sides started from (`base`) and the two divergent
//! results (`mine`, `theirs`), each key is resolved independently:
//!
//! | base | mine | theirs | result |
//! |------|------|--------|--------|
//! | any  | m    | m      | m |
//! | b    | b    | t      | t (including deletion) |
//! | b    | m    | b      | m (including deletion) |
//! | b    | m    | t      | `m + t - b` |
//! | -    | m    | t      | `m + t` |
//! | b    | -    | t      | conflict |
//! | b    | m    | -      | conflict |
//!
//! Treating each side as a delta against `base` makes the combination
//! symmetric: swapping `mine` and `theirs` yields the same tree.

use crate::btree::{Tree, TreeError, TreeKey};
use crate::merge::weighted::Combine;
use crate::storage::NodeStore;

/// Take the head's value if it sits at `key`, advancing the sequence.
fn take_at<K, V, I>(head: &mut Option<(K, V)>, rest: &mut I, key: K) -> Result<Option<V>, TreeError<K>>
where
    K: TreeKey,
    V: Copy,
    I: Iterator<Item = Result<(K, V), TreeError<K>>>,
{
    match *head {
        Some((k, v)) if k == key => {
            *head = rest.next().transpose()?;
            Ok(Some(v))
        }
        _ => Ok(None),
    }
}

fn resolve<K: TreeKey, V: Combine>(
    key: K,
    base: Option<V>,
    mine: Option<V>,
    theirs: Option<V>,
) -> Result<Option<V>, TreeError<K>> {
    if mine == theirs {
        return Ok(mine);
    }
    if mine == base {
        return Ok(theirs);
    }
    if theirs == base {
        return Ok(mine);
    }

    let (Some(m), Some(t)) = (mine, theirs) else {
        return Err(TreeError::Conflict(key));
    };
    let b = base.map_or(0, Combine::to_wide);
    m.to_wide()
        .checked_add(t.to_wide())
        .and_then(|sum| sum.checked_sub(b))
        .and_then(V::from_wide)
        .map(Some)
        .ok_or_else(|| TreeError::ValueOutOfRange(format!("reconciled value overflowed at key {key:?}")))
}

/// Merge two divergent versions of `base` into a new tree on `mine`'s store.
pub fn reconcile<K, V, S, SB, ST>(
    base: &Tree<K, V, SB>,
    mine: &Tree<K, V, S>,
    theirs: &Tree<K, V, ST>,
) -> Result<Tree<K, V, S>, TreeError<K>>
where
    K: TreeKey,
    V: Combine,
    S: NodeStore<K, V>,
    SB: NodeStore<K, V>,
    ST: NodeStore<K, V>,
{
    let mut base_iter = base.iter();
    let mut mine_iter = mine.iter();
    let mut theirs_iter = theirs.iter();
    let mut base_head = base_iter.next().transpose()?;
    let mut mine_head = mine_iter.next().transpose()?;
    let mut theirs_head = theirs_iter.next().transpose()?;

    let mut entries = Vec::new();
    let mut combined = 0usize;

    loop {
        let next_key = [base_head, mine_head, theirs_head]
            .into_iter()
            .flatten()
            .map(|(key, _)| key)
            .min();
        let Some(key) = next_key else {
            break;
        };

        let b = take_at(&mut base_head, &mut base_iter, key)?;
        let m = take_at(&mut mine_head, &mut mine_iter, key)?;
        let t = take_at(&mut theirs_head, &mut theirs_iter, key)?;

        if b.is_some() && m.is_some() && t.is_some() && m != b && t != b && m != t {
            combined += 1;
        }
        if let Some(value) = resolve(key, b, m, t)? {
            entries.push((key, value));
        }
    }

    tracing::debug!(result = entries.len(), combined, "reconciled trees");
    Ok(mine.build_like(entries))
}
