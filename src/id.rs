//! Entity and component identifiers.
//!
//! An [`Entity`] packs a 32-bit index and a 16-bit generation into a `u64`.
//! Components are entities too,
//! so an [`Id`] is either an entity id or a relationship pair `(first, second)`.
//! Pairs only store the indices of both elements;
//! the world resolves them back to live entities when needed.

use std::fmt;

use xias::Xias;

const INDEX_MASK: u64 = 0xFFFF_FFFF;
const GENERATION_SHIFT: u32 = 32;
const GENERATION_MASK: u64 = 0xFFFF << GENERATION_SHIFT;
const PAIR_FLAG: u64 = 1 << 63;
const PAIR_FIRST_MASK: u64 = 0x7FFF_FFFF;

/// An entity identifier.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Entity(u64);

impl Entity {
    /// The null entity. Used as the source of fields that are matched on `$this`.
    pub const NULL: Self = Self(0);
    /// Matches any id in a pattern, or any element of a pair.
    pub const WILDCARD: Self = Self(1);
    /// Builtin traversable relationship describing hierarchies.
    pub const CHILD_OF: Self = Self(2);
    /// Builtin traversable relationship describing inheritance.
    pub const IS_A: Self = Self(3);
    /// Tables with this tag are skipped by queries unless prefabs are requested.
    pub const PREFAB: Self = Self(4);
    /// Tables with this tag are skipped by queries unless disabled entities are requested.
    pub const DISABLED: Self = Self(5);

    /// The first index handed out to user entities. Lower indices are reserved.
    pub(crate) const FIRST_USER_INDEX: u32 = 64;

    pub(crate) fn from_parts(index: u32, generation: u16) -> Self {
        Self(u64::from(index) | (u64::from(generation) << GENERATION_SHIFT))
    }

    /// The slot index of the entity.
    pub fn index(self) -> u32 { (self.0 & INDEX_MASK).small_int() }

    /// The number of times the slot has been recycled.
    pub fn generation(self) -> u16 { ((self.0 & GENERATION_MASK) >> GENERATION_SHIFT).small_int() }

    /// Returns the raw bits of the identifier.
    pub fn to_bits(self) -> u64 { self.0 }

    /// Whether the entity is one of the reserved builtin entities.
    pub fn is_builtin(self) -> bool { self.index() < Self::FIRST_USER_INDEX }

    /// Whether this is the null entity.
    pub fn is_null(self) -> bool { self == Self::NULL }

    fn builtin_name(self) -> Option<&'static str> {
        Some(match self {
            Self::NULL => "null",
            Self::WILDCARD => "*",
            Self::CHILD_OF => "ChildOf",
            Self::IS_A => "IsA",
            Self::PREFAB => "Prefab",
            Self::DISABLED => "Disabled",
            _ => return None,
        })
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.builtin_name() {
            Some(name) => f.write_str(name),
            None if self.generation() == 0 => write!(f, "#{}", self.index()),
            None => write!(f, "#{}v{}", self.index(), self.generation()),
        }
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result { fmt::Debug::fmt(self, f) }
}

/// A component id or a relationship pair.
///
/// Ids are totally ordered;
/// the type of a table is the sorted list of its ids,
/// so all pairs with the same relationship are adjacent.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Id(u64);

impl Id {
    /// The plain wildcard, matching any non-pair id.
    pub const WILDCARD: Self = Self(Entity::WILDCARD.0);

    /// Creates a relationship pair.
    pub fn pair(first: Entity, second: Entity) -> Self {
        Self(
            PAIR_FLAG
                | ((u64::from(first.index()) & PAIR_FIRST_MASK) << 32)
                | u64::from(second.index()),
        )
    }

    /// Creates a pair from raw slot indices.
    pub(crate) fn pair_from_indices(first: u32, second: u32) -> Self {
        Self(PAIR_FLAG | ((u64::from(first) & PAIR_FIRST_MASK) << 32) | u64::from(second))
    }

    /// Whether the id is a relationship pair.
    pub fn is_pair(self) -> bool { self.0 & PAIR_FLAG != 0 }

    /// The index of the first element of a pair.
    pub fn first_index(self) -> u32 {
        debug_assert!(self.is_pair(), "{self:?} is not a pair");
        ((self.0 >> 32) & PAIR_FIRST_MASK).small_int()
    }

    /// The index of the second element of a pair.
    pub fn second_index(self) -> u32 {
        debug_assert!(self.is_pair(), "{self:?} is not a pair");
        (self.0 & INDEX_MASK).small_int()
    }

    /// Returns the entity for a non-pair id.
    pub fn as_entity(self) -> Option<Entity> {
        if self.is_pair() {
            None
        } else {
            Some(Entity(self.0))
        }
    }

    /// Whether the id contains a wildcard, either as a plain id or in a pair element.
    pub fn is_wildcard(self) -> bool {
        if self.is_pair() {
            self.first_index() == Entity::WILDCARD.index()
                || self.second_index() == Entity::WILDCARD.index()
        } else {
            self == Self::WILDCARD
        }
    }

    /// Whether `self` (a concrete id) is matched by `pattern`.
    pub fn matches(self, pattern: Id) -> bool {
        if self == pattern {
            return true;
        }

        match (self.is_pair(), pattern.is_pair()) {
            (false, false) => pattern == Self::WILDCARD,
            (true, true) => {
                let wildcard = Entity::WILDCARD.index();
                (pattern.first_index() == wildcard || pattern.first_index() == self.first_index())
                    && (pattern.second_index() == wildcard
                        || pattern.second_index() == self.second_index())
            }
            _ => false,
        }
    }

    /// Returns the wildcard forms a concrete id is indexed under, excluding the id itself.
    pub(crate) fn wildcard_forms(self) -> impl Iterator<Item = Id> {
        let wildcard = Entity::WILDCARD.index();
        let forms = if self.is_pair() {
            [
                Some(Self::pair_from_indices(self.first_index(), wildcard)),
                Some(Self::pair_from_indices(wildcard, self.second_index())),
                Some(Self::pair_from_indices(wildcard, wildcard)),
            ]
        } else {
            [Some(Self::WILDCARD), None, None]
        };
        forms.into_iter().flatten().filter(move |&form| form != self)
    }

    /// Returns the raw bits of the identifier.
    pub fn to_bits(self) -> u64 { self.0 }
}

impl From<Entity> for Id {
    fn from(entity: Entity) -> Self { Self(entity.0) }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_pair() {
            let first = Entity::from_parts(self.first_index(), 0);
            let second = Entity::from_parts(self.second_index(), 0);
            write!(f, "({first:?}, {second:?})")
        } else {
            fmt::Debug::fmt(&Entity(self.0), f)
        }
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result { fmt::Debug::fmt(self, f) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_elements() {
        let rel = Entity::from_parts(70, 3);
        let tgt = Entity::from_parts(71, 1);
        let pair = Id::pair(rel, tgt);
        assert!(pair.is_pair());
        assert_eq!(pair.first_index(), 70);
        assert_eq!(pair.second_index(), 71);
        assert_eq!(pair.as_entity(), None);
    }

    #[test]
    fn wildcard_matching() {
        let rel = Entity::from_parts(70, 0);
        let tgt = Entity::from_parts(71, 0);
        let pair = Id::pair(rel, tgt);

        assert!(pair.matches(Id::pair(rel, Entity::WILDCARD)));
        assert!(pair.matches(Id::pair(Entity::WILDCARD, tgt)));
        assert!(pair.matches(Id::pair(Entity::WILDCARD, Entity::WILDCARD)));
        assert!(!pair.matches(Id::pair(tgt, Entity::WILDCARD)));
        assert!(!pair.matches(Id::WILDCARD));
        assert!(Id::from(rel).matches(Id::WILDCARD));
    }

    #[test]
    fn pairs_sort_by_relationship() {
        let a = Entity::from_parts(80, 0);
        let b = Entity::from_parts(81, 0);
        let mut ids = vec![Id::pair(b, a), Id::from(a), Id::pair(a, b), Id::pair(a, a)];
        ids.sort();
        assert_eq!(ids, vec![Id::from(a), Id::pair(a, a), Id::pair(a, b), Id::pair(b, a)]);
    }

    #[test]
    fn wildcard_forms_of_pair() {
        let pair = Id::pair(Entity::from_parts(70, 0), Entity::from_parts(71, 0));
        let forms: Vec<_> = pair.wildcard_forms().collect();
        assert_eq!(forms.len(), 3);
        assert!(forms.iter().all(|form| pair.matches(*form)));
    }
}
