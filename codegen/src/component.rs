use matches2::option_match;
use proc_macro2::TokenStream;
use quote::quote;
use syn::parse::{Parse, ParseStream};
use syn::{Error, Result};

use crate::util::{self, Attr, Named};

pub(crate) fn derive(input: TokenStream) -> Result<TokenStream> {
    let input: syn::DeriveInput = syn::parse2(input)?;

    let mut attr = Attr::<Opt>::default();
    for meta in &input.attrs {
        if meta.path().is_ident("strata") {
            attr.merge(meta.parse_args::<Attr<Opt>>()?);
        }
    }

    let crate_name = match attr.find_one(|opt| option_match!(opt, Opt::StrataAs(ts) => ts))? {
        Some((_, ts)) => ts.clone(),
        None => quote!(::strata),
    };

    let name_fn = match attr.find_one(|opt| option_match!(opt, Opt::Name(name) => name))? {
        Some((_, name)) => quote! {
            fn name() -> &'static str { #name }
        },
        None => quote!(),
    };

    let generics = util::parse_generics(&input);
    let component_impl = generics.impl_trait(quote!(#crate_name::Component), name_fn);

    Ok(quote! {
        #component_impl
    })
}

enum Opt {
    StrataAs(TokenStream),
    Name(syn::LitStr),
}

impl Parse for Named<Opt> {
    fn parse(input: ParseStream) -> Result<Self> {
        let name = input.parse::<syn::Ident>()?;

        let value = match name.to_string().as_str() {
            "strata_as" => {
                let inner;
                syn::parenthesized!(inner in input);
                Opt::StrataAs(inner.parse()?)
            }
            "name" => {
                input.parse::<syn::Token![=]>()?;
                Opt::Name(input.parse()?)
            }
            _ => return Err(Error::new_spanned(&name, format!("Unknown argument `{}`", name))),
        };

        Ok(Named { name, value })
    }
}
