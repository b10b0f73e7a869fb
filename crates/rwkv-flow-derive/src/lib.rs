use proc_macro::TokenStream;
use syn::{parse_macro_input, DeriveInput};

mod deref;

/// Implements `Deref` for a newtype, targeting its only field.
#[proc_macro_derive(Deref)]
pub fn derive_deref(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    deref::expand(input, deref::Access::Shared)
        .unwrap_or_else(syn::Error::into_compile_error)
        .into()
}

/// Implements `DerefMut` for a newtype. Must be paired with `Deref`.
#[proc_macro_derive(DerefMut)]
pub fn derive_deref_mut(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    deref::expand(input, deref::Access::Exclusive)
        .unwrap_or_else(syn::Error::into_compile_error)
        .into()
}
