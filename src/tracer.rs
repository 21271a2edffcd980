//! Exposes the events of storage and query cache maintenance for testing and profiling.

use crate::query::QueryId;
use crate::{Id, TableId};

/// Defines the [`Tracer`] trait and implements it for [`Log`] and [`Aggregate`].
///
/// All tracer method parameters must be [`Copy`].
macro_rules! define_tracer {
    (
        $(
            $(#[$meta:meta])*
            fn $name:ident(&self $(, $ident:ident: $ty:ty)* $(,)?);
        )*
    ) => {
        /// A tracer that observes how tables and query caches change.
        ///
        /// All methods do nothing by default.
        pub trait Tracer: Send + Sync {
            $(
                $(#[$meta])*
                #[allow(unused_variables)]
                fn $name(&self, $($ident: $ty),*) {}
            )*
        }

        impl Tracer for Log {
            $(
                fn $name(&self, $($ident: $ty),*) {
                    log::log!(self.0, concat!(stringify!($name), "(", $(
                        stringify!($ident),
                        " = {",
                        stringify!($ident),
                        ":?}, ",
                    )* ")"), $($ident = $ident,)*);
                }
            )*
        }

        impl_tuple_accumulate! {
            @TYPES (T1, T2, T3, T4, T5, T6, T7, T8);
            $(
                @VARS (t1, t2, t3, t4, t5, t6, t7, t8);
                @METHOD {fn $name(&self, $($ident: $ty,)*);}
            )*
        }
    };
}

macro_rules! impl_tuple {
    (
        @TYPES ($($ty:ident),* $(,)?);
        $(
            @VARS ($($vars:ident),* $(,)?);
            @METHOD {fn $name:ident(&self, $($arg_ident:ident: $arg_ty:ty,)*);}
        )*
    ) => {
        impl<$($ty: Tracer),*> Tracer for Aggregate<($($ty,)*)> {
            $(
                fn $name(&self, $($arg_ident: $arg_ty),*) {
                    #[allow(unused_mut, unused_variables)]
                    let mut args = ($($arg_ident,)*);

                    #[allow(dead_code)]
                    fn call_with_args(tracer: &impl Tracer, ($($arg_ident,)*): &mut ($($arg_ty,)*)) {
                        tracer.$name($(*$arg_ident,)*);
                    }

                    let Aggregate(($($vars,)*)) = self;
                    $(
                        call_with_args($vars, &mut args);
                    )*
                }
            )*
        }
    };
}

macro_rules! impl_tuple_accumulate {
    (@TYPES (); $(@VARS (); @METHOD {$($body:tt)*})*) => {
        impl_tuple! {
            @TYPES ();
            $(
                @VARS ();
                @METHOD {$($body)*}
            )*
        }
    };
    (
        @TYPES ($first_ty:ident $(, $rest_ty:ident)* $(,)?);
        $(
            @VARS ($first_var:ident $(, $rest_var:ident)* $(,)?);
            @METHOD {$($body:tt)*}
        )*
    ) => {
        impl_tuple! {
            @TYPES ($first_ty $(, $rest_ty)*);
            $(
                @VARS ($first_var $(, $rest_var)*);
                @METHOD {$($body)*}
            )*
        }

        impl_tuple_accumulate! {
            @TYPES ($($rest_ty),*);
            $(
                @VARS ($($rest_var),*);
                @METHOD {$($body)*}
            )*
        }
    };
}

define_tracer! {
    /// A table was created for a new type.
    fn create_table(&self, table: TableId, ty: &[Id]);

    /// An empty table was deleted.
    fn delete_table(&self, table: TableId);

    /// A table gained its first row or lost its last row.
    fn table_empty(&self, table: TableId, empty: bool);

    /// A table entered the cache of a query.
    fn match_table(&self, query: QueryId, table: TableId, group: u64);

    /// A table left the cache of a query.
    fn unmatch_table(&self, query: QueryId, table: TableId, group: u64);

    /// A cached table was moved to another group after its group id changed.
    fn move_table_group(&self, query: QueryId, table: TableId, from: u64, to: u64);

    /// A group was created in the cache of a query.
    fn create_group(&self, query: QueryId, group: u64);

    /// A group was deleted from the cache of a query.
    fn delete_group(&self, query: QueryId, group: u64);

    /// The tables below a traversable entity were rematched against a query after it moved.
    fn rematch(&self, query: QueryId, tables: usize);

    /// The sorted slices of a query were rebuilt.
    fn sort(&self, query: QueryId, slices: usize);
}

/// An empty tracer.
pub struct Noop;

impl Tracer for Noop {}

/// Groups multiple tracers into a tuple and dispatches each call to them in serial.
pub struct Aggregate<T>(
    /// A tuple of child tracers to execute in serial.
    pub T,
);

/// A tracer that logs all events.
pub struct Log(
    /// The log level to log events with.
    pub log::Level,
);
