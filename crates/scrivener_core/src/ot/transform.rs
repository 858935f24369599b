//! Operational transformation over [`Edit`].
//!
//! `transform(op, against, tie)` rewrites `op`, which was produced
//! concurrently with `against` from the same base text, so that it can be
//! applied after `against`. The result is a sequence because a delete whose
//! range strictly contains a concurrent insert point is split in two, and a
//! delete fully covered by a concurrent delete disappears.
//!
//! For every pair of concurrent edits `a` and `b`:
//!
//! ```text
//! apply(apply(base, b), transform(a, b, tie)) == apply(apply(base, a), transform(b, a, tie.flip()))
//! ```

use super::edit::Edit;

/// Which of two concurrent edits was committed to the log first.
///
/// The tie-break only matters for two inserts at the same position; the
/// earlier committed insert keeps the left slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tie {
    /// The edit we transform against was committed first
    AgainstFirst,
    /// The edit being transformed was committed first
    OpFirst,
}

impl Tie {
    pub fn flip(self) -> Self {
        match self {
            Tie::AgainstFirst => Tie::OpFirst,
            Tie::OpFirst => Tie::AgainstFirst,
        }
    }
}

/// Transform `op` so it applies after `against`.
pub fn transform(op: &Edit, against: &Edit, tie: Tie) -> Vec<Edit> {
    if op.is_noop() {
        return Vec::new();
    }
    if against.is_noop() {
        return vec![op.clone()];
    }

    let out = match (op, against) {
        (Edit::Insert { position: p, text }, Edit::Insert { position: q, .. }) => {
            let shift = *p > *q || (*p == *q && tie == Tie::AgainstFirst);
            let position = if shift { p + against.char_len() } else { *p };
            vec![Edit::Insert {
                position,
                text: text.clone(),
            }]
        }
        (Edit::Insert { position: p, text }, Edit::Delete { position: q, len: m }) => {
            let position = if *p <= *q {
                *p
            } else if *p >= q + m {
                p - m
            } else {
                // Inside the removed range: land where it used to start
                *q
            };
            vec![Edit::Insert {
                position,
                text: text.clone(),
            }]
        }
        (Edit::Delete { position: p, len: n }, Edit::Insert { position: q, .. }) => {
            let inserted = against.char_len();
            if *q <= *p {
                vec![Edit::delete(p + inserted, *n)]
            } else if *q >= p + n {
                vec![op.clone()]
            } else {
                // Keep the concurrently inserted text: delete around it
                let before = q - p;
                vec![
                    Edit::delete(*p, before),
                    Edit::delete(p + inserted, n - before),
                ]
            }
        }
        (Edit::Delete { position: p, len: n }, Edit::Delete { position: q, len: m }) => {
            let (a_end, b_end) = (p + n, q + m);
            if a_end <= *q {
                vec![op.clone()]
            } else if b_end <= *p {
                vec![Edit::delete(p - m, *n)]
            } else {
                let overlap = a_end.min(b_end) - (*p).max(*q);
                vec![Edit::delete((*p).min(*q), n - overlap)]
            }
        }
    };

    out.into_iter().filter(|e| !e.is_noop()).collect()
}

/// Transform two concurrent edit sequences against each other.
///
/// Each sequence is expressed step by step (every edit applies to the result
/// of the previous one), both starting from the same base. Returns
/// `(a', b')` where `a'` applies after `b` and `b'` applies after `a`.
/// `tie` is from `a`'s point of view.
pub fn transform_pair(a: &[Edit], b: &[Edit], tie: Tie) -> (Vec<Edit>, Vec<Edit>) {
    match (a.len(), b.len()) {
        (0, _) | (_, 0) => (a.to_vec(), b.to_vec()),
        (1, 1) => (
            transform(&a[0], &b[0], tie),
            transform(&b[0], &a[0], tie.flip()),
        ),
        (1, _) => {
            let (a_mid, mut b_head) = transform_pair(a, &b[..1], tie);
            let (a_out, b_tail) = transform_pair(&a_mid, &b[1..], tie);
            b_head.extend(b_tail);
            (a_out, b_head)
        }
        _ => {
            let (mut a_head, b_mid) = transform_pair(&a[..1], b, tie);
            let (a_tail, b_out) = transform_pair(&a[1..], &b_mid, tie);
            a_head.extend(a_tail);
            (a_head, b_out)
        }
    }
}

/// Rebase a freshly submitted edit over operations the log already holds,
/// in commit order. Every history entry counts as committed first.
pub fn transform_against_history<'a>(
    edit: &Edit,
    history: impl IntoIterator<Item = &'a Edit>,
) -> Vec<Edit> {
    let mut current = vec![edit.clone()];
    for prior in history {
        if current.is_empty() {
            break;
        }
        current = transform_pair(&current, std::slice::from_ref(prior), Tie::AgainstFirst).0;
    }
    current
}

/// Shift a caret position over an applied edit.
///
/// Positions at or after an insert point move right; positions inside a
/// deleted range collapse to its start.
pub fn transform_position(position: usize, applied: &Edit) -> usize {
    match applied {
        Edit::Insert { position: q, .. } => {
            if position >= *q {
                position + applied.char_len()
            } else {
                position
            }
        }
        Edit::Delete { position: q, len: m } => {
            if position <= *q {
                position
            } else if position >= q + m {
                position - m
            } else {
                *q
            }
        }
    }
}
