// shape.rs — Static tile shapes and broadcasting rules
//
// A shape is an ordered tuple of positive extents. Scalars have no shape.
// Two shapes are broadcast-compatible when they have the same rank and,
// axis by axis, the extents are equal or one of them is 1.
//
// Preconditions: extents are positive (enforced by the builder).
// Postconditions: `broadcast` is symmetric and associative on compatible inputs.
// Failure modes: incompatible shapes return `None`.
// Side effects: none.

use std::fmt;

/// Borrowed view of a tile shape, used for display.
pub struct ShapeDisplay<'a>(pub &'a [u32]);

impl fmt::Display for ShapeDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", d)?;
        }
        write!(f, "]")
    }
}

/// Format an optional shape; `None` renders as `scalar`.
pub fn describe(shape: Option<&[u32]>) -> String {
    match shape {
        Some(s) => ShapeDisplay(s).to_string(),
        None => "scalar".to_string(),
    }
}

/// Result shape of an elementwise operation over two tile shapes.
pub fn broadcast(lhs: &[u32], rhs: &[u32]) -> Option<Vec<u32>> {
    if lhs.len() != rhs.len() {
        return None;
    }
    lhs.iter()
        .zip(rhs)
        .map(|(&a, &b)| match (a, b) {
            _ if a == b => Some(a),
            (1, _) => Some(b),
            (_, 1) => Some(a),
            _ => None,
        })
        .collect()
}

/// Result shape when either side may be a scalar. Scalars adopt the other
/// side's shape; two scalars stay scalar.
pub fn broadcast_optional(lhs: Option<&[u32]>, rhs: Option<&[u32]>) -> Result<Option<Vec<u32>>, ()> {
    match (lhs, rhs) {
        (None, None) => Ok(None),
        (Some(s), None) | (None, Some(s)) => Ok(Some(s.to_vec())),
        (Some(a), Some(b)) => broadcast(a, b).map(Some).ok_or(()),
    }
}

/// True if `from` can be broadcast to exactly `to`.
pub fn broadcasts_to(from: &[u32], to: &[u32]) -> bool {
    from.len() == to.len() && from.iter().zip(to).all(|(&a, &b)| a == b || a == 1)
}

/// Number of elements in a tile; `None` when the count overflows a u64.
pub fn num_elements(shape: &[u32]) -> Option<u64> {
    shape
        .iter()
        .try_fold(1u64, |n, &d| n.checked_mul(u64::from(d)))
}

/// Number of axes with extent greater than one.
pub fn rank_gt1(shape: &[u32]) -> usize {
    shape.iter().filter(|&&d| d > 1).count()
}

/// Row-major strides (in elements) for a tile shape.
pub fn row_major_strides(shape: &[u32]) -> Vec<u32> {
    let mut strides = vec![1u32; shape.len()];
    for k in (0..shape.len().saturating_sub(1)).rev() {
        strides[k] = strides[k + 1] * shape[k + 1];
    }
    strides
}

// ── Tests ──────────────────────────────────────────────────────────────────
