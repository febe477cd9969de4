//! Scalar leaf values and the attachment token.
//!
//! Scalars are the payloads of registers. They carry no merge semantics of
//! their own; the register's clock decides which scalar survives. What they
//! do carry is a total, deterministic ordering (used for clock tie-breaks
//! and `ORDER BY`) and careful numeric comparison: an `i64` is never
//! silently routed through `f64`, so large integers compare exactly on
//! every peer.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::fmt;

/// Opaque reference to out-of-band binary data.
///
/// Only the token replicates; the referenced bytes travel outside the
/// document sync path. The digest makes tokens content-addressed and
/// comparable without touching the payload.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AttachmentToken {
    /// SHA-256 digest of the referenced bytes.
    pub digest: [u8; 32],
    /// Length of the referenced bytes.
    pub len: u64,
}

impl AttachmentToken {
    /// Build a token for a blob of data.
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        let digest: [u8; 32] = hasher.finalize().into();
        Self {
            digest,
            len: data.len() as u64,
        }
    }
}

impl fmt::Display for AttachmentToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.digest {
            write!(f, "{:02x}", byte)?;
        }
        write!(f, ":{}", self.len)
    }
}

/// A scalar field value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Scalar {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Attachment(AttachmentToken),
}

impl Scalar {
    /// Variant rank for cross-type ordering: Null < Bool < numbers < Text < Attachment.
    fn rank(&self) -> u8 {
        match self {
            Scalar::Null => 0,
            Scalar::Bool(_) => 1,
            Scalar::Int(_) | Scalar::Float(_) => 2,
            Scalar::Text(_) => 3,
            Scalar::Attachment(_) => 4,
        }
    }

    /// True for `Int` and `Float`.
    pub fn is_number(&self) -> bool {
        matches!(self, Scalar::Int(_) | Scalar::Float(_))
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Scalar::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Scalar::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Scalar::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Total, deterministic ordering across all variants.
    ///
    /// Numbers compare numerically across `Int`/`Float` without precision
    /// loss; everything else compares within its variant, with variants
    /// ranked by [`Scalar::rank`]. This is the ordering every peer uses for
    /// tie-breaking, so it must not depend on platform float formatting.
    pub fn total_cmp(&self, other: &Scalar) -> Ordering {
        use Scalar::*;
        match (self, other) {
            (Null, Null) => Ordering::Equal,
            (Bool(a), Bool(b)) => a.cmp(b),
            (Int(a), Int(b)) => a.cmp(b),
            (Float(a), Float(b)) => a.total_cmp(b),
            (Int(a), Float(b)) => cmp_int_float(*a, *b),
            (Float(a), Int(b)) => cmp_int_float(*b, *a).reverse(),
            (Text(a), Text(b)) => a.cmp(b),
            (Attachment(a), Attachment(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }

    /// Numeric equality across `Int`/`Float`; `None` when either side is
    /// not a number.
    pub fn numeric_eq(&self, other: &Scalar) -> Option<bool> {
        if self.is_number() && other.is_number() {
            Some(self.total_cmp(other) == Ordering::Equal)
        } else {
            None
        }
    }

    /// Rough serialized size in bytes, used for document size accounting.
    pub fn estimated_size(&self) -> usize {
        match self {
            Scalar::Null => 4,
            Scalar::Bool(_) => 5,
            Scalar::Int(_) => 8,
            Scalar::Float(_) => 8,
            Scalar::Text(s) => s.len() + 2,
            Scalar::Attachment(_) => 72,
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Null => write!(f, "null"),
            Scalar::Bool(b) => write!(f, "{}", b),
            Scalar::Int(i) => write!(f, "{}", i),
            Scalar::Float(x) => write!(f, "{}", x),
            Scalar::Text(s) => write!(f, "{}", s),
            Scalar::Attachment(t) => write!(f, "{}", t),
        }
    }
}

impl From<&str> for Scalar {
    fn from(s: &str) -> Self {
        Scalar::Text(s.to_string())
    }
}

impl From<String> for Scalar {
    fn from(s: String) -> Self {
        Scalar::Text(s)
    }
}

impl From<i64> for Scalar {
    fn from(i: i64) -> Self {
        Scalar::Int(i)
    }
}

impl From<f64> for Scalar {
    fn from(x: f64) -> Self {
        Scalar::Float(x)
    }
}

impl From<bool> for Scalar {
    fn from(b: bool) -> Self {
        Scalar::Bool(b)
    }
}

/// Compare an i64 against an f64 exactly.
///
/// Casting the integer to f64 would round for |i| > 2^53 and make two peers
/// disagree on an ordering. Instead the float is classified first and its
/// integral part compared as i128, which covers the full i64 range.
fn cmp_int_float(i: i64, f: f64) -> Ordering {
    if f.is_nan() {
        // NaN sorts above every integer, matching f64::total_cmp placement
        return Ordering::Less;
    }
    if f == f64::INFINITY {
        return Ordering::Less;
    }
    if f == f64::NEG_INFINITY {
        return Ordering::Greater;
    }
    let trunc = f.trunc();
    // |trunc| <= 2^63 fits in i128 exactly
    let ft = trunc as i128;
    let ii = i as i128;
    match ii.cmp(&ft) {
        Ordering::Equal => {
            let frac = f - trunc;
            if frac > 0.0 {
                Ordering::Less
            } else if frac < 0.0 {
                Ordering::Greater
            } else {
                Ordering::Equal
            }
        }
        ord => ord,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_total_cmp_numbers() {
        assert_eq!(Scalar::Int(2).total_cmp(&Scalar::Float(2.0)), Ordering::Equal);
        assert_eq!(Scalar::Int(2).total_cmp(&Scalar::Float(2.5)), Ordering::Less);
        assert_eq!(Scalar::Int(3).total_cmp(&Scalar::Float(2.5)), Ordering::Greater);
    }

    #[test]
    fn test_total_cmp_large_int_exact() {
        // 2^60 + 1 is not representable as f64; the cast would round it to
        // 2^60 and report equality. The exact path must not.
        let big = (1i64 << 60) + 1;
        let rounded = (1i64 << 60) as f64;
        assert_eq!(
            Scalar::Int(big).total_cmp(&Scalar::Float(rounded)),
            Ordering::Greater
        );
    }

    #[test]
    fn test_total_cmp_cross_variant() {
        assert_eq!(Scalar::Null.total_cmp(&Scalar::Bool(false)), Ordering::Less);
        assert_eq!(
            Scalar::Text("a".into()).total_cmp(&Scalar::Int(99)),
            Ordering::Greater
        );
    }

    #[test]
    fn test_attachment_token() {
        let t1 = AttachmentToken::from_bytes(b"hello");
        let t2 = AttachmentToken::from_bytes(b"hello");
        let t3 = AttachmentToken::from_bytes(b"world");

        assert_eq!(t1, t2);
        assert_ne!(t1, t3);
        assert_eq!(t1.len, 5);

        // Display is hex digest plus length
        let shown = t1.to_string();
        assert!(shown.ends_with(":5"));
        assert_eq!(shown.len(), 64 + 2);
    }

    #[test]
    fn test_scalar_serialization() {
        let values = vec![
            Scalar::Null,
            Scalar::Bool(true),
            Scalar::Int(-42),
            Scalar::Float(2.5),
            Scalar::Text("hi".into()),
            Scalar::Attachment(AttachmentToken::from_bytes(b"blob")),
        ];
        for v in values {
            let json = serde_json::to_string(&v).unwrap();
            let back: Scalar = serde_json::from_str(&json).unwrap();
            assert_eq!(v, back);
        }
    }
}
