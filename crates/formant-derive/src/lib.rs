//! Derive macros for `formant`.
use std::collections::HashSet;

use quote::quote;
use syn::{parse_macro_input, Data, DeriveInput, Fields};

/// Derives `formant::HasDependencies` by merging the dependency sets of
/// every named field.
#[proc_macro_derive(HasDependencies)]
pub fn derive_has_dependencies(input: proc_macro::TokenStream) -> proc_macro::TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let ident = &input.ident;

    let fields = match &input.data {
        Data::Struct(data) => match &data.fields {
            Fields::Named(named) => &named.named,
            _ => {
                return syn::Error::new_spanned(
                    ident,
                    "HasDependencies can only be derived for structs with named fields",
                )
                .to_compile_error()
                .into()
            }
        },
        _ => {
            return syn::Error::new_spanned(
                ident,
                "HasDependencies can only be derived for structs",
            )
            .to_compile_error()
            .into()
        }
    };

    let mut field_types = HashSet::new();
    let mut constraints = vec![];
    let mut merges = vec![];
    for field in fields.iter() {
        let field_ident = field.ident.as_ref().unwrap();
        merges.push(quote! {
            let deps = deps.merge(self.#field_ident.dependencies());
        });
        if field_types.insert(&field.ty) {
            let ty = &field.ty;
            constraints.push(quote! { #ty: formant::HasDependencies });
        }
    }

    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();
    let where_clause = match where_clause {
        Some(clause) if !constraints.is_empty() => quote! { #clause, #(#constraints),* },
        Some(clause) => quote! { #clause },
        None if !constraints.is_empty() => quote! { where #(#constraints),* },
        None => quote! {},
    };

    let output = quote! {
        impl #impl_generics formant::HasDependencies for #ident #ty_generics #where_clause {
            fn dependencies(&self) -> formant::Dependencies {
                let deps = formant::Dependencies::default();
                #(#merges)*
                deps
            }
        }
    };
    output.into()
}
