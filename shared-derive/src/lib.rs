//! Derive macros for enums that are read from and written to wire formats.
//!
//! `#[derive(U8Enum)]` on a fieldless enum with explicit discriminants
//! generates `TryFrom<u8> for Enum` (failing with
//! `shared::primitive_enum::InvalidValue`) and `From<Enum> for u8`.
//! The same exists for `u16` and `u32`.

extern crate proc_macro;

use paste::paste;
use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, spanned::Spanned, DeriveInput};

macro_rules! primitive_enum {
    ($type:ident) => {
        paste! {
        #[proc_macro_derive([<$type:camel Enum>])]
        pub fn [<derive_ $type _enum>](input: TokenStream) -> TokenStream {
            let DeriveInput { ident, data, .. } = parse_macro_input!(input);

            let data = match data {
                syn::Data::Enum(data) => data,
                _ => {
                    return syn::Error::new(
                        ident.span(),
                        concat!(stringify!([<$type:camel Enum>]), " is only allowed on enums"),
                    )
                    .to_compile_error()
                    .into();
                }
            };

            let mut arms = Vec::with_capacity(data.variants.len());
            for variant in data.variants.iter() {
                let Some((_, disc)) = variant.discriminant.as_ref() else {
                    return syn::Error::new(
                        variant.span(),
                        "every variant needs an explicit discriminant",
                    )
                    .to_compile_error()
                    .into();
                };
                let var = &variant.ident;
                arms.push(quote! {
                    #disc => Ok(#ident::#var)
                });
            }

            let output = quote! {
                impl TryFrom<$type> for #ident {
                    type Error = shared::primitive_enum::InvalidValue<$type>;

                    fn try_from(value: $type) -> Result<Self, Self::Error> {
                        match value {
                            #(#arms,)*
                            v => Err(shared::primitive_enum::InvalidValue { value: v }),
                        }
                    }
                }

                impl From<#ident> for $type {
                    fn from(value: #ident) -> $type {
                        value as $type
                    }
                }
            };
            output.into()
        }
        }
    };
}

primitive_enum!(u8);
primitive_enum!(u16);
primitive_enum!(u32);
