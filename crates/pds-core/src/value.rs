//! The field value union and its merge rule.
//!
//! `CrdtValue` is what lives at every node of a document's field tree. It
//! holds up to one branch per variant (register, counter, map, tombstone):
//! same-variant branches merge structurally, and concurrent writes of
//! *different* variants on one path are all retained, with the visible
//! winner selected by type-establishment clock: most recent writer wins
//! regardless of type. Keeping the losing branch (rather than discarding
//! it) is what makes the merge associative: a branch that loses under one
//! merge order can still absorb its sibling's contributions under another,
//! and every peer converges to the same full state and the same winner.

use crate::clock::FieldClock;
use crate::counter::PnCounter;
use crate::map::CrdtMap;
use crate::merge::Merge;
use crate::register::Register;
use crate::scalar::Scalar;
use serde::{Deserialize, Serialize};

/// Read-time view of the winning branch.
#[derive(Clone, Debug, PartialEq)]
pub enum ValueView<'a> {
    Register(&'a Register),
    Counter(&'a PnCounter),
    Map(&'a CrdtMap),
    Tombstone(&'a FieldClock),
    /// No branch present (bottom).
    Absent,
}

/// A mergeable field value with at most one branch per variant.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CrdtValue {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    register: Option<Register>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    counter: Option<PnCounter>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    map: Option<Box<CrdtMap>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    tombstone: Option<FieldClock>,
}

impl CrdtValue {
    /// A scalar write.
    pub fn register(value: impl Into<Scalar>, clock: FieldClock) -> Self {
        Self {
            register: Some(Register::new(value.into(), clock)),
            ..Self::default()
        }
    }

    /// A counter branch.
    pub fn counter(counter: PnCounter) -> Self {
        Self {
            counter: Some(counter),
            ..Self::default()
        }
    }

    /// A map branch.
    pub fn map(map: CrdtMap) -> Self {
        Self {
            map: Some(Box::new(map)),
            ..Self::default()
        }
    }

    /// A key-removal marker. Still merges (and replicates) like any value.
    pub fn tombstone(clock: FieldClock) -> Self {
        Self {
            tombstone: Some(clock),
            ..Self::default()
        }
    }

    /// The winning branch: highest type-establishment clock, with the
    /// variant rank (tombstone < register < counter < map) keeping the
    /// selection total if a clock is ever duplicated.
    pub fn view(&self) -> ValueView<'_> {
        let mut winner = ValueView::Absent;
        let mut best: Option<(&FieldClock, u8)> = None;

        if let Some(clock) = &self.tombstone {
            best = Some((clock, 0));
            winner = ValueView::Tombstone(clock);
        }
        if let Some(reg) = &self.register {
            let key = (reg.clock(), 1u8);
            if best.map_or(true, |b| key > b) {
                best = Some(key);
                winner = ValueView::Register(reg);
            }
        }
        if let Some(counter) = &self.counter {
            let key = (counter.clock(), 2u8);
            if best.map_or(true, |b| key > b) {
                best = Some(key);
                winner = ValueView::Counter(counter);
            }
        }
        if let Some(map) = &self.map {
            let key = (map.established(), 3u8);
            if best.map_or(true, |b| key > b) {
                winner = ValueView::Map(map);
            }
        }
        winner
    }

    /// The clock that established the winning branch's type on this path.
    pub fn type_clock(&self) -> FieldClock {
        match self.view() {
            ValueView::Register(r) => r.clock().clone(),
            ValueView::Counter(c) => c.clock().clone(),
            ValueView::Map(m) => m.established().clone(),
            ValueView::Tombstone(clock) => clock.clone(),
            ValueView::Absent => FieldClock::zero(),
        }
    }

    /// True if the winning branch marks a removed key.
    pub fn is_tombstone(&self) -> bool {
        matches!(self.view(), ValueView::Tombstone(_))
    }

    /// True if no branch is present at all.
    pub fn is_absent(&self) -> bool {
        matches!(self.view(), ValueView::Absent)
    }

    pub fn as_register(&self) -> Option<&Register> {
        match self.view() {
            ValueView::Register(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_counter(&self) -> Option<&PnCounter> {
        match self.view() {
            ValueView::Counter(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&CrdtMap> {
        match self.view() {
            ValueView::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Mutable access to the counter branch, if it is the winner.
    pub fn as_counter_mut(&mut self) -> Option<&mut PnCounter> {
        if matches!(self.view(), ValueView::Counter(_)) {
            self.counter.as_mut()
        } else {
            None
        }
    }

    /// Mutable access to the map branch, if it is the winner.
    pub fn as_map_mut(&mut self) -> Option<&mut CrdtMap> {
        if matches!(self.view(), ValueView::Map(_)) {
            self.map.as_deref_mut()
        } else {
            None
        }
    }

    /// The scalar this value reads as, if it has one. Counters read as
    /// their integer value; maps and tombstones have no scalar reading.
    pub fn read_scalar(&self) -> Option<Scalar> {
        match self.view() {
            ValueView::Register(r) => Some(r.value().clone()),
            ValueView::Counter(c) => Some(Scalar::Int(c.value())),
            _ => None,
        }
    }

    /// Rough serialized size in bytes for document size accounting.
    /// Computable without serializing the value.
    pub fn estimated_size(&self) -> usize {
        let mut size = 8;
        if let Some(r) = &self.register {
            size += 24 + r.value().estimated_size();
        }
        if let Some(c) = &self.counter {
            size += c.estimated_size();
        }
        if let Some(m) = &self.map {
            size += m.estimated_size();
        }
        if self.tombstone.is_some() {
            size += 24;
        }
        size
    }
}

fn merge_slot<T: Merge>(a: &Option<T>, b: &Option<T>) -> Option<T> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.merge(y)),
        (Some(x), None) => Some(x.clone()),
        (None, Some(y)) => Some(y.clone()),
        (None, None) => None,
    }
}

impl Merge for CrdtValue {
    fn bottom() -> Self {
        Self::default()
    }

    fn merge(&self, other: &Self) -> Self {
        let tombstone = match (&self.tombstone, &other.tombstone) {
            (Some(a), Some(b)) => Some(a.clone().max(b.clone())),
            (Some(a), None) => Some(a.clone()),
            (None, Some(b)) => Some(b.clone()),
            (None, None) => None,
        };
        let map = match (&self.map, &other.map) {
            (Some(a), Some(b)) => Some(Box::new(a.merge(b))),
            (Some(a), None) => Some(a.clone()),
            (None, Some(b)) => Some(b.clone()),
            (None, None) => None,
        };
        Self {
            register: merge_slot(&self.register, &other.register),
            counter: merge_slot(&self.counter, &other.counter),
            map,
            tombstone,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::WriterId;

    fn clk(counter: u64, writer: &str) -> FieldClock {
        FieldClock::new(counter, WriterId::new(writer))
    }

    #[test]
    fn test_cross_type_recent_writer_wins() {
        let reg = CrdtValue::register("hello", clk(5, "alice"));
        let mut m = CrdtMap::new(clk(7, "bob"));
        m.put("x", CrdtValue::register(1i64, clk(7, "bob")));
        let map = CrdtValue::map(m);

        // Map was established later, so it is the visible winner both ways
        let merged = reg.merge(&map);
        assert_eq!(merged, map.merge(&reg));
        assert!(merged.as_map().is_some());

        // The losing register branch is retained for convergence
        assert!(merged.register.is_some());
    }

    #[test]
    fn test_cross_type_register_beats_older_map() {
        let mut m = CrdtMap::new(clk(2, "a"));
        m.put("x", CrdtValue::register(1i64, clk(2, "a")));
        let map = CrdtValue::map(m);
        let reg = CrdtValue::register("late", clk(9, "b"));

        let merged = map.merge(&reg);
        assert_eq!(
            merged.read_scalar(),
            Some(crate::scalar::Scalar::Text("late".into()))
        );
    }

    #[test]
    fn test_cross_type_merge_is_associative() {
        // A counter that loses to a map in one grouping must still carry
        // its sibling's increments in every grouping.
        let mut c1 = PnCounter::new(clk(5, "a"));
        c1.increment(WriterId::new("a"), 3, clk(5, "a"));
        let mut c2 = PnCounter::new(clk(1, "b"));
        c2.increment(WriterId::new("b"), 4, clk(2, "b"));
        let a = CrdtValue::counter(c1);
        let b = CrdtValue::counter(c2);
        let m = CrdtValue::map(CrdtMap::new(clk(4, "c")));

        let left = a.merge(&b).merge(&m);
        let right = a.merge(&b.merge(&m));
        let mixed = b.merge(&m).merge(&a);
        assert_eq!(left, right);
        assert_eq!(left, mixed);
        // Counter clock (5) beats map establishment (4): counter visible
        assert_eq!(left.as_counter().map(|c| c.value()), Some(7));
    }

    #[test]
    fn test_tombstone_vs_register() {
        let tomb = CrdtValue::tombstone(clk(4, "a"));
        let reg = CrdtValue::register(1i64, clk(6, "b"));
        // Later register write revives the field
        assert!(!tomb.merge(&reg).is_tombstone());

        let late_tomb = CrdtValue::tombstone(clk(8, "a"));
        assert!(reg.merge(&late_tomb).is_tombstone());
    }

    #[test]
    fn test_value_merge_idempotent() {
        let v = CrdtValue::register(42i64, clk(1, "a"));
        assert_eq!(v.merge(&v), v);
    }

    #[test]
    fn test_serde_skips_empty_slots() {
        let v = CrdtValue::register(1i64, clk(1, "a"));
        let json = serde_json::to_string(&v).unwrap();
        assert!(!json.contains("counter"));
        let back: CrdtValue = serde_json::from_str(&json).unwrap();
        assert_eq!(v, back);
    }
}
