//! Reference word encoding.
//!
//! Every bit-level decision about what a heap word means lives here. Higher
//! layers only see [`Value`], [`ObjectRef`] and [`GcField`].
//!
//! # Reference words
//!
//! | bits         | meaning                                   |
//! |--------------|-------------------------------------------|
//! | `0`          | null                                      |
//! | `xxx...xx1`  | small integer, value in the upper 63 bits |
//! | `aaa...aN0`  | object address `a` with NMT bit `N`       |
//!
//! Objects are 8-byte aligned, so an address has its low three bits clear.
//! Bit 0 is the small-integer tag and bit 1 carries the NMT ("not marked
//! through") flag of a pointer. The NMT bit is only meaningful when bit 0 is
//! clear, so the two never alias.
//!
//! # GC field words
//!
//! The first header word of every object is read as a [`GcField`]:
//!
//! | bits              | meaning                               |
//! |-------------------|---------------------------------------|
//! | `0`               | fresh, never stamped                  |
//! | `eee...ee1`       | mark stamp for epoch `e`              |
//! | `2`               | free (debug sentinel)                 |
//! | `4`               | invalid (debug sentinel)              |
//! | any other even    | forwarding address of the clone       |
//!
//! Forwarding addresses always point into the heap, whose base is at least
//! one page above zero, so they never collide with the sentinels.

use std::fmt;
use std::num::NonZeroUsize;

/// Bit 0 of a reference word: set for tagged small integers.
pub(crate) const SMALL_INT_TAG: usize = 0b01;

/// Bit 1 of a pointer word: the NMT flag.
pub(crate) const NMT_BIT: usize = 0b10;

/// Alignment of every object address.
pub const OBJECT_ALIGNMENT: usize = 8;

const ADDRESS_MASK: usize = !(OBJECT_ALIGNMENT - 1);

const GC_FIELD_FRESH: usize = 0;
const GC_FIELD_FREE: usize = 2;
const GC_FIELD_INVALID: usize = 4;

/// Address of a heap object.
///
/// An `ObjectRef` is a plain address: copying it does not keep the object
/// alive. References that must survive a safepoint belong in a root slot.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct ObjectRef(NonZeroUsize);

impl ObjectRef {
    /// Wraps an aligned, non-null address.
    pub(crate) fn from_addr(addr: usize) -> Option<Self> {
        if addr & !ADDRESS_MASK != 0 {
            return None;
        }
        NonZeroUsize::new(addr).map(Self)
    }

    /// Returns the object's address.
    #[must_use]
    pub const fn addr(self) -> usize {
        self.0.get()
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectRef({:#x})", self.addr())
    }
}

/// The decoded content of a reference slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Value {
    /// The null reference.
    Null,
    /// A tagged small integer in `INT_MIN..=INT_MAX`.
    Int(i64),
    /// A pointer to a heap object.
    Object(ObjectRef),
}

impl Value {
    /// Smallest integer representable without boxing.
    pub const INT_MIN: i64 = i64::MIN >> 1;
    /// Largest integer representable without boxing.
    pub const INT_MAX: i64 = i64::MAX >> 1;

    /// Returns the object this value points to, if any.
    #[must_use]
    pub const fn as_object(self) -> Option<ObjectRef> {
        match self {
            Self::Object(obj) => Some(obj),
            _ => None,
        }
    }

    /// Returns the small integer payload, if any.
    #[must_use]
    pub const fn as_int(self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(v),
            _ => None,
        }
    }
}

impl From<ObjectRef> for Value {
    fn from(obj: ObjectRef) -> Self {
        Self::Object(obj)
    }
}

/// A reference word exactly as stored in a slot.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub(crate) struct RawRef(usize);

impl RawRef {
    pub(crate) const NULL: Self = Self(0);

    pub(crate) const fn from_bits(bits: usize) -> Self {
        Self(bits)
    }

    pub(crate) const fn bits(self) -> usize {
        self.0
    }

    /// Encodes `value`, giving a pointer the NMT bit `nmt`.
    ///
    /// # Panics
    ///
    /// Panics if an integer lies outside `Value::INT_MIN..=Value::INT_MAX`.
    pub(crate) fn encode(value: Value, nmt: bool) -> Self {
        match value {
            Value::Null => Self::NULL,
            Value::Int(v) => {
                assert!(
                    (Value::INT_MIN..=Value::INT_MAX).contains(&v),
                    "integer {v} does not fit in a tagged word"
                );
                #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
                Self(((v as usize) << 1) | SMALL_INT_TAG)
            }
            Value::Object(obj) => Self::pointer(obj, nmt),
        }
    }

    pub(crate) const fn pointer(obj: ObjectRef, nmt: bool) -> Self {
        Self(obj.addr() | if nmt { NMT_BIT } else { 0 })
    }

    /// Returns the pointer and its NMT bit, or `None` for null and integers.
    pub(crate) fn as_pointer(self) -> Option<(ObjectRef, bool)> {
        if self.0 & SMALL_INT_TAG != 0 {
            return None;
        }
        ObjectRef::from_addr(self.0 & ADDRESS_MASK).map(|obj| (obj, self.0 & NMT_BIT != 0))
    }

    /// Decodes the word, discarding the NMT bit.
    pub(crate) fn value(self) -> Value {
        if self.0 & SMALL_INT_TAG != 0 {
            #[allow(clippy::cast_possible_wrap, clippy::cast_possible_truncation)]
            return Value::Int((self.0 as isize >> 1) as i64);
        }
        self.as_pointer()
            .map_or(Value::Null, |(obj, _)| Value::Object(obj))
    }
}

impl fmt::Debug for RawRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_pointer() {
            Some((obj, nmt)) => write!(f, "RawRef({:#x}, nmt={nmt})", obj.addr()),
            None => write!(f, "RawRef({:?})", self.value()),
        }
    }
}

/// Decoded view of an object's GC field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcField {
    /// Allocated but never stamped.
    Fresh,
    /// Stamped with the mark value of the given epoch.
    Stamp(u64),
    /// Superseded by a clone at the given address.
    Forwarded(ObjectRef),
    /// Reclaimed memory (debug sentinel).
    Free,
    /// Poisoned memory (debug sentinel).
    Invalid,
}

impl GcField {
    pub(crate) fn from_bits(bits: usize) -> Self {
        match bits {
            GC_FIELD_FRESH => Self::Fresh,
            GC_FIELD_FREE => Self::Free,
            GC_FIELD_INVALID => Self::Invalid,
            stamp if stamp & 1 == 1 => Self::Stamp((stamp >> 1) as u64),
            addr => ObjectRef::from_addr(addr).map_or(Self::Invalid, Self::Forwarded),
        }
    }

    pub(crate) fn to_bits(self) -> usize {
        match self {
            Self::Fresh => GC_FIELD_FRESH,
            Self::Free => GC_FIELD_FREE,
            Self::Invalid => GC_FIELD_INVALID,
            Self::Stamp(epoch) => stamp_bits(epoch),
            Self::Forwarded(obj) => obj.addr(),
        }
    }
}

/// Raw GC field word for a mark stamp.
#[allow(clippy::cast_possible_truncation)]
pub(crate) const fn stamp_bits(epoch: u64) -> usize {
    ((epoch as usize) << 1) | 1
}

/// NMT value that counts as "already visited" during `cycle`.
///
/// Cycle 0 is the state before any collection, where every pointer is
/// written with a clear NMT bit.
pub(crate) const fn nmt_for_cycle(cycle: u64) -> bool {
    cycle & 1 == 1
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj(addr: usize) -> ObjectRef {
        ObjectRef::from_addr(addr).unwrap()
    }

    #[test]
    fn test_null_encodes_to_zero() {
        assert_eq!(RawRef::encode(Value::Null, true).bits(), 0);
        assert_eq!(RawRef::NULL.value(), Value::Null);
        assert!(RawRef::NULL.as_pointer().is_none());
    }

    #[test]
    fn test_small_int_extremes() {
        for v in [0, 1, -1, Value::INT_MIN, Value::INT_MAX] {
            let raw = RawRef::encode(Value::Int(v), true);
            assert_eq!(raw.bits() & SMALL_INT_TAG, SMALL_INT_TAG);
            assert!(raw.as_pointer().is_none());
            assert_eq!(raw.value(), Value::Int(v));
        }
    }

    #[test]
    #[should_panic(expected = "does not fit")]
    fn test_int_overflow_panics() {
        let _ = RawRef::encode(Value::Int(i64::MAX), false);
    }

    #[test]
    fn test_nmt_bit_does_not_change_address() {
        let target = obj(0x7000_1008);
        let flipped = RawRef::pointer(target, true);
        let plain = RawRef::pointer(target, false);

        assert_eq!(flipped.bits(), 0x7000_100A);
        assert_eq!(flipped.as_pointer(), Some((target, true)));
        assert_eq!(plain.as_pointer(), Some((target, false)));
        assert_eq!(flipped.value(), plain.value());
    }

    #[test]
    fn test_integer_with_bit_one_is_not_a_pointer() {
        // 1 encodes as 0b11: bit 1 set, but bit 0 makes it an integer.
        let raw = RawRef::encode(Value::Int(1), false);
        assert_eq!(raw.bits(), 0b11);
        assert!(raw.as_pointer().is_none());
    }

    #[test]
    fn test_misaligned_address_rejected() {
        assert!(ObjectRef::from_addr(0x1004).is_none());
        assert!(ObjectRef::from_addr(0).is_none());
    }

    #[test]
    fn test_gc_field_kinds_are_disjoint() {
        let fields = [
            GcField::Fresh,
            GcField::Free,
            GcField::Invalid,
            GcField::Stamp(0),
            GcField::Stamp(1),
            GcField::Stamp(12_345),
            GcField::Forwarded(obj(0x10_0000)),
        ];
        for field in fields {
            assert_eq!(GcField::from_bits(field.to_bits()), field);
        }
        assert_ne!(stamp_bits(3), obj(0x10_0000).addr());
    }

    #[test]
    fn test_nmt_alternates_per_cycle() {
        assert!(!nmt_for_cycle(0));
        assert!(nmt_for_cycle(1));
        assert!(!nmt_for_cycle(2));
        assert_ne!(nmt_for_cycle(41), nmt_for_cycle(42));
    }
}
