use proc_macro::TokenStream;

mod component;
mod util;

/// Implements `strata::Component` for a type.
///
/// Options are passed in `#[strata(...)]`:
/// - `name = "..."`: overrides the debug name of the component.
/// - `strata_as(path)`: the path to the strata crate, defaults to `::strata`.
#[proc_macro_derive(Component, attributes(strata))]
pub fn component(input: TokenStream) -> TokenStream {
    component::derive(input.into()).unwrap_or_else(|err| err.to_compile_error()).into()
}
