use crate::{Entity, Id};

/// Refers to an entity in a term, either directly or through a variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TermRef {
    /// A fixed entity.
    Entity(Entity),
    /// The table variable `$this`, i.e. the entities being iterated.
    This,
    /// A named entity variable.
    Var(&'static str),
    /// Matches anything.
    Wildcard,
}

impl TermRef {
    pub(crate) fn from_index(index: u32) -> Self {
        if index == Entity::WILDCARD.index() {
            Self::Wildcard
        } else {
            Self::Entity(Entity::from_parts(index, 0))
        }
    }

    /// The variable name referred to, if any.
    pub fn var_name(self) -> Option<&'static str> {
        match self {
            Self::This => Some("this"),
            Self::Var(name) => Some(name),
            _ => None,
        }
    }
}

impl From<Entity> for TermRef {
    fn from(entity: Entity) -> Self {
        if entity == Entity::WILDCARD {
            Self::Wildcard
        } else {
            Self::Entity(entity)
        }
    }
}

/// How the source of a term is searched for the id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Trav {
    /// The id must be on the source itself.
    SelfOnly,
    /// The id must be on an entity reached by following `rel` upwards, excluding the source.
    Up(Entity),
    /// The id may be on the source, or on an entity reached by following `rel` upwards.
    SelfUp(Entity),
    /// Like [`Up`](Self::Up), and groups cached results by depth along `rel`.
    Cascade {
        /// The traversed relationship.
        rel:  Entity,
        /// Iterate the deepest tables first.
        desc: bool,
    },
}

impl Trav {
    /// The traversed relationship.
    pub fn rel(self) -> Option<Entity> {
        match self {
            Self::SelfOnly => None,
            Self::Up(rel) | Self::SelfUp(rel) | Self::Cascade { rel, .. } => Some(rel),
        }
    }
}

/// The logical operator of a term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Oper {
    /// The term must match.
    And,
    /// Either this term or the next one must match. Consecutive `Or` terms form a chain.
    Or,
    /// The term must not match.
    Not,
    /// The term is matched if possible.
    Optional,
    /// The source must have all ids of the entity's type.
    AndFrom,
    /// The source must have at least one id of the entity's type.
    OrFrom,
    /// The source must have none of the ids of the entity's type.
    NotFrom,
}

/// Declares how a field is accessed.
///
/// Fields with [`InOut::None`] are never provided and are not tracked for change detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum InOut {
    /// Read for `$this` fields, read-only for other sources.
    #[default]
    Default,
    /// Only read.
    In,
    /// Only written.
    Out,
    /// Read and written.
    InOut,
    /// Not accessed.
    None,
}

/// One condition of a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Term {
    /// The id, or the first element of a pair.
    pub first:  TermRef,
    /// The second element of a pair.
    pub second: Option<TermRef>,
    /// The entity or table the id is matched on.
    pub src:    TermRef,
    /// How the source is searched.
    pub trav:   Trav,
    /// The logical operator.
    pub oper:   Oper,
    /// The access mode of the field.
    pub inout:  InOut,
}

impl Term {
    /// Creates an `And` term on `$this` for a concrete id.
    pub fn new(id: Id) -> Self {
        let (first, second) = if id.is_pair() {
            (TermRef::from_index(id.first_index()), Some(TermRef::from_index(id.second_index())))
        } else {
            (TermRef::from(id.as_entity().expect("non-pair id is an entity")), None)
        };
        Self { first, second, src: TermRef::This, trav: Trav::SelfOnly, oper: Oper::And, inout: InOut::Default }
    }

    /// Creates an `And` term on `$this` for a pair of entities or variables.
    pub fn pair(first: impl Into<TermRef>, second: impl Into<TermRef>) -> Self {
        Self {
            first:  first.into(),
            second: Some(second.into()),
            src:    TermRef::This,
            trav:   Trav::SelfOnly,
            oper:   Oper::And,
            inout:  InOut::Default,
        }
    }

    /// Whether the term is one of the `*From` operators.
    pub fn is_from(&self) -> bool { matches!(self.oper, Oper::AndFrom | Oper::OrFrom | Oper::NotFrom) }

    /// Whether the id of the term contains a variable.
    pub fn has_id_var(&self) -> bool {
        matches!(self.first, TermRef::Var(_) | TermRef::This)
            || matches!(self.second, Some(TermRef::Var(_) | TermRef::This))
    }
}
