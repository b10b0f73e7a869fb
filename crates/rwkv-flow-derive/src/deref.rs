use proc_macro2::TokenStream;
use quote::quote;
use syn::{spanned::Spanned, Data, DeriveInput, Fields, Member, Type};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Shared,
    Exclusive,
}

/// Finds the single field of a newtype, either `struct A(B)` or `struct A { b: B }`.
fn single_field(input: &DeriveInput) -> syn::Result<(Member, &Type)> {
    let Data::Struct(data) = &input.data else {
        return Err(syn::Error::new(input.span(), "expect a struct"));
    };
    let mut fields = match &data.fields {
        Fields::Unnamed(fields) => fields.unnamed.iter(),
        Fields::Named(fields) => fields.named.iter(),
        Fields::Unit => {
            return Err(syn::Error::new(
                data.fields.span(),
                "expect a struct with one field",
            ))
        }
    };
    match (fields.next(), fields.next()) {
        (Some(field), None) => {
            let member = match &field.ident {
                Some(ident) => Member::Named(ident.clone()),
                None => Member::Unnamed(0.into()),
            };
            Ok((member, &field.ty))
        }
        _ => Err(syn::Error::new(
            data.fields.span(),
            "expect a struct with exactly one field",
        )),
    }
}

pub fn expand(input: DeriveInput, access: Access) -> syn::Result<TokenStream> {
    let (member, target) = single_field(&input)?;
    let name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    let output = match access {
        Access::Shared => quote! {
            impl #impl_generics ::std::ops::Deref for #name #ty_generics #where_clause {
                type Target = #target;

                fn deref(&self) -> &Self::Target {
                    &self.#member
                }
            }
        },
        Access::Exclusive => quote! {
            impl #impl_generics ::std::ops::DerefMut for #name #ty_generics #where_clause {
                fn deref_mut(&mut self) -> &mut Self::Target {
                    &mut self.#member
                }
            }
        },
    };
    Ok(output)
}
