//! The instruction list a query compiles into.
//!
//! Instructions are stored in a flat array and refer to each other by [`Label`].
//! Every instruction has a `prev` label to backtrack to when it fails
//! and a `next` label to continue with when it succeeds.

use std::fmt;

use itertools::Itertools;

use super::term::Oper;
use crate::{Entity, Id};

/// The index of an instruction. `-1` is the sentinel before the first instruction.
pub(crate) type Label = i16;

/// The index of a variable in a plan. At most 64 variables fit in a written mask.
pub(crate) type VarId = u8;

/// The variable bound to the iterated tables.
pub(crate) const THIS: VarId = 0;

pub(crate) fn var_bit(var: VarId) -> u64 { 1 << var }

/// An instruction operand that is either fixed or read from a variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Ref {
    Entity(Entity),
    Var(VarId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum VarKind {
    /// Bound to a range of rows of a table.
    Table,
    /// Bound to a single entity.
    Entity,
}

#[derive(Debug, Clone)]
pub(crate) struct VarInfo {
    pub(crate) name:      &'static str,
    pub(crate) kind:      VarKind,
    /// For entity variables used as a source, the table variable selecting their tables.
    pub(crate) table_var: Option<VarId>,
    /// Whether this is the table variable of an entity variable.
    pub(crate) companion: bool,
}

#[derive(Debug)]
pub(crate) struct Op {
    pub(crate) kind:    OpKind,
    pub(crate) prev:    Label,
    pub(crate) next:    Label,
    /// The field written by this instruction.
    pub(crate) field:   Option<usize>,
    /// The variables bound by this instruction.
    pub(crate) written: u64,
}

#[derive(Debug)]
pub(crate) enum OpKind {
    /// Selects tables with an id, or tests the bound source for it.
    And { src: Ref, first: Ref, second: Option<Ref> },
    /// Finds an id on the source or on its ancestors along `trav`.
    Up { src: Ref, first: Ref, second: Option<Ref>, trav: Entity, self_: bool },
    /// Tests the bound source against the type of `from`.
    From { oper: Oper, src: Ref, from: Entity },
    /// Selects tables with all ids, without variables or backtracking into the ids.
    Trivial { terms: Box<[(usize, Id)]> },
    /// Replays the tables of the query cache.
    Cache,
    /// Tries each instruction until `end` as an alternative.
    Or { end: Label },
    /// Succeeds if the block until `end` fails.
    Not { end: Label, resets: u64 },
    /// Always succeeds, running the block until `end` if possible.
    Optional { end: Label, resets: u64 },
    /// Closes a block.
    End,
    /// Binds an entity variable to each row of a table variable.
    Each { table: VarId, entity: VarId },
    /// Copies entity variables into the sources of fields.
    SetVars { fields: Box<[(usize, VarId)]> },
    /// Produces a result.
    Yield,
}

/// A compiled query.
#[derive(Debug)]
pub struct Plan {
    pub(crate) ops:  Box<[Op]>,
    pub(crate) vars: Box<[VarInfo]>,
}

impl Plan {
    pub(crate) fn op(&self, label: Label) -> &Op {
        &self.ops[usize::try_from(label).expect("label is not the sentinel")]
    }

    /// The label of the final yield instruction.
    pub(crate) fn yield_label(&self) -> Label {
        Label::try_from(self.ops.len() - 1).expect("plan fits in a label")
    }

    /// The number of instructions.
    pub fn len(&self) -> usize { self.ops.len() }

    /// Whether the plan has no instructions.
    pub fn is_empty(&self) -> bool { self.ops.is_empty() }

    fn write_ref(&self, f: &mut fmt::Formatter, r: Ref) -> fmt::Result {
        match r {
            Ref::Entity(entity) => write!(f, "{entity:?}"),
            Ref::Var(var) => write!(f, "${}", self.vars[usize::from(var)].name),
        }
    }

    fn write_id(&self, f: &mut fmt::Formatter, first: Ref, second: Option<Ref>) -> fmt::Result {
        match second {
            None => self.write_ref(f, first),
            Some(second) => {
                f.write_str("(")?;
                self.write_ref(f, first)?;
                f.write_str(", ")?;
                self.write_ref(f, second)?;
                f.write_str(")")
            }
        }
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (index, op) in self.ops.iter().enumerate() {
            write!(f, "{index:>2}. [{:>2}, {:>2}] ", op.prev, op.next)?;

            match &op.kind {
                OpKind::And { src, first, second } => {
                    f.write_str("and      ")?;
                    self.write_ref(f, *src)?;
                    f.write_str(" ")?;
                    self.write_id(f, *first, *second)?;
                }
                OpKind::Up { src, first, second, trav, self_ } => {
                    f.write_str(if *self_ { "selfup   " } else { "up       " })?;
                    self.write_ref(f, *src)?;
                    f.write_str(" ")?;
                    self.write_id(f, *first, *second)?;
                    write!(f, " trav {trav:?}")?;
                }
                OpKind::From { oper, src, from } => {
                    write!(f, "{:<9}", format!("{oper:?}").to_lowercase())?;
                    self.write_ref(f, *src)?;
                    write!(f, " {from:?}")?;
                }
                OpKind::Trivial { terms } => {
                    write!(f, "trivial  $this {}", terms.iter().map(|(_, id)| format!("{id:?}")).join(" "))?;
                }
                OpKind::Cache => f.write_str("cache    $this")?,
                OpKind::Or { .. } => f.write_str("or")?,
                OpKind::Not { .. } => f.write_str("not")?,
                OpKind::Optional { .. } => f.write_str("option")?,
                OpKind::End => f.write_str("end")?,
                OpKind::Each { table, entity } => {
                    f.write_str("each     ")?;
                    self.write_ref(f, Ref::Var(*entity))?;
                    f.write_str(" ")?;
                    self.write_ref(f, Ref::Var(*table))?;
                }
                OpKind::SetVars { .. } => f.write_str("setvars")?,
                OpKind::Yield => f.write_str("yield")?,
            }

            writeln!(f)?;
        }
        Ok(())
    }
}
