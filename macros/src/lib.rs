extern crate proc_macro;
use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::{format_ident, quote};
use syn::{Data, DeriveInput, Fields, Ident, Index, parse_macro_input};

/// Derives `Encode` by appending each field in declaration order. Enums are prefixed with the
/// variant index as a single byte, so variants must only ever be appended.
#[proc_macro_derive(Encode)]
pub fn encode_derive(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let name = input.ident;

    let body = match input.data {
        Data::Struct(data) => {
            let appends: Vec<TokenStream2> = match &data.fields {
                Fields::Named(fields) => fields
                    .named
                    .iter()
                    .map(|f| {
                        let field_name = &f.ident;
                        quote! { encoder = encoder.append(&self.#field_name); }
                    })
                    .collect(),
                Fields::Unnamed(fields) => (0..fields.unnamed.len())
                    .map(|i| {
                        let index = Index::from(i);
                        quote! { encoder = encoder.append(&self.#index); }
                    })
                    .collect(),
                Fields::Unit => vec![],
            };

            if appends.is_empty() {
                quote! { Vec::new() }
            } else {
                quote! {
                    let mut encoder = crate::storage::encdec::EncodeBuilder::new();
                    #(#appends)*
                    encoder.build()
                }
            }
        }
        Data::Enum(data_enum) => {
            let arms = data_enum.variants.iter().enumerate().map(|(index, variant)| {
                let variant_name = &variant.ident;
                let variant_index = index as u8;

                match &variant.fields {
                    Fields::Unit => quote! {
                        Self::#variant_name => vec![#variant_index]
                    },
                    Fields::Unnamed(fields) => {
                        let bindings = positional_bindings(fields.unnamed.len());
                        quote! {
                            Self::#variant_name(#(#bindings),*) => {
                                vec![vec![#variant_index], #(crate::storage::encdec::Encode::encode(#bindings)),*].concat()
                            }
                        }
                    }
                    Fields::Named(fields) => {
                        let bindings: Vec<_> =
                            fields.named.iter().filter_map(|f| f.ident.as_ref()).collect();
                        quote! {
                            Self::#variant_name { #(#bindings),* } => {
                                vec![vec![#variant_index], #(crate::storage::encdec::Encode::encode(#bindings)),*].concat()
                            }
                        }
                    }
                }
            });

            quote! {
                match self {
                    #(#arms),*
                }
            }
        }
        Data::Union(_) => {
            return syn::Error::new_spanned(name, "Encode only supports structs and enums")
                .to_compile_error()
                .into();
        }
    };

    quote! {
        impl crate::storage::encdec::Encode for #name {
            fn encode(&self) -> Vec<u8> {
                #body
            }
        }
    }
    .into()
}

/// Derives `Decode`, the inverse of the `Encode` derive.
#[proc_macro_derive(Decode)]
pub fn decode_derive(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let name = input.ident;

    let body = match input.data {
        Data::Struct(data) => match &data.fields {
            Fields::Named(fields) => {
                let field_names: Vec<_> = fields.named.iter().map(|f| &f.ident).collect();
                let decodes = fields.named.iter().map(|f| {
                    let field_name = &f.ident;
                    let field_ty = &f.ty;
                    quote! {
                        let (#field_name, rest) = <#field_ty as crate::storage::encdec::Decode>::decode(bytes)?;
                        bytes = rest;
                    }
                });

                quote! {
                    let mut bytes = bytes;
                    #(#decodes)*
                    Ok((Self { #(#field_names),* }, bytes))
                }
            }
            Fields::Unnamed(fields) => {
                let bindings = positional_bindings(fields.unnamed.len());
                let decodes = fields.unnamed.iter().zip(&bindings).map(|(f, binding)| {
                    let field_ty = &f.ty;
                    quote! {
                        let (#binding, rest) = <#field_ty as crate::storage::encdec::Decode>::decode(bytes)?;
                        bytes = rest;
                    }
                });

                quote! {
                    let mut bytes = bytes;
                    #(#decodes)*
                    Ok((Self(#(#bindings),*), bytes))
                }
            }
            Fields::Unit => quote! { Ok((Self, bytes)) },
        },
        Data::Enum(data_enum) => {
            let arms = data_enum.variants.iter().enumerate().map(|(index, variant)| {
                let variant_name = &variant.ident;
                let variant_index = index as u8;

                match &variant.fields {
                    Fields::Unit => quote! {
                        #variant_index => Ok((Self::#variant_name, bytes)),
                    },
                    Fields::Unnamed(fields) => {
                        let bindings = positional_bindings(fields.unnamed.len());
                        let decodes = fields.unnamed.iter().zip(&bindings).map(|(f, binding)| {
                            let field_ty = &f.ty;
                            quote! {
                                let (#binding, bytes) = <#field_ty as crate::storage::encdec::Decode>::decode(bytes)?;
                            }
                        });

                        quote! {
                            #variant_index => {
                                #(#decodes)*
                                Ok((Self::#variant_name(#(#bindings),*), bytes))
                            }
                        }
                    }
                    Fields::Named(fields) => {
                        let field_names: Vec<_> =
                            fields.named.iter().filter_map(|f| f.ident.as_ref()).collect();
                        let decodes = fields.named.iter().map(|f| {
                            let field_ty = &f.ty;
                            let field_name = &f.ident;
                            quote! {
                                let (#field_name, bytes) = <#field_ty as crate::storage::encdec::Decode>::decode(bytes)?;
                            }
                        });

                        quote! {
                            #variant_index => {
                                #(#decodes)*
                                Ok((Self::#variant_name { #(#field_names),* }, bytes))
                            }
                        }
                    }
                }
            });

            quote! {
                let Some((kind, bytes)) = bytes.split_first() else {
                    return Err(crate::DecodingError::MalformedInput(
                        "enum insufficient bytes".to_string(),
                        bytes.to_vec(),
                    ));
                };

                match *kind {
                    #(#arms)*
                    _ => Err(crate::DecodingError::InvalidEnumKind(bytes.to_vec())),
                }
            }
        }
        Data::Union(_) => {
            return syn::Error::new_spanned(name, "Decode only supports structs and enums")
                .to_compile_error()
                .into();
        }
    };

    quote! {
        impl crate::storage::encdec::Decode for #name {
            fn decode(bytes: &[u8]) -> crate::DecodingResult<'_, Self> {
                #body
            }
        }
    }
    .into()
}

fn positional_bindings(len: usize) -> Vec<Ident> {
    (0..len).map(|i| format_ident!("field{}", i)).collect()
}
