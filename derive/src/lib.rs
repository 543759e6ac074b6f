extern crate proc_macro;

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use std::collections::HashMap;
use syn::{parse_macro_input, parse_quote, Attribute, Data, DeriveInput, Fields, Member};

/// Field attributes parsed from `#[tagform(...)]` annotations
///
/// * `#[tagform(tag = N)]` - Serialize this field under the wire tag `N` (`0..=255`)
///
/// Fields without a tag are not serialized.
#[derive(Debug, Clone)]
struct FieldAttributes {
    tag: Option<u8>,
}

/// Extract and parse `#[tagform(...)]` attribute values from field attributes
fn get_field_attributes(attrs: &[Attribute]) -> syn::Result<FieldAttributes> {
    let mut tag = None;

    for attr in attrs {
        if !attr.path().is_ident("tagform") {
            continue;
        }
        attr.parse_args_with(|input: syn::parse::ParseStream| {
            while !input.is_empty() {
                let ident = input.parse::<syn::Ident>()?;

                if ident == "tag" {
                    input.parse::<syn::Token![=]>()?;
                    let lit = input.parse::<syn::LitInt>()?;
                    let value = lit
                        .base10_parse::<u8>()
                        .map_err(|_| syn::Error::new(lit.span(), "Field tag must be 0..=255"))?;
                    if tag.replace(value).is_some() {
                        return Err(syn::Error::new(lit.span(), "Field tag is specified twice"));
                    }
                } else {
                    return Err(syn::Error::new(
                        ident.span(),
                        format!("Unknown attribute: {}", ident),
                    ));
                }

                // Consume comma if present, otherwise end
                if input.peek(syn::Token![,]) {
                    input.parse::<syn::Token![,]>()?;
                }
            }
            Ok(())
        })?;
    }

    Ok(FieldAttributes { tag })
}

/// Derive macro implementing `tagform::Record` and `tagform::Encode`
///
/// Fields annotated with `#[tagform(tag = N)]` are serialized in declaration order. Structs
/// without tagged fields, including unit structs, serialize to zero bytes.
///
/// # Examples
///
/// ```rust,ignore
/// #[derive(Record)]
/// struct Order {
///     #[tagform(tag = 1)]
///     id: u64,
///     #[tagform(tag = 2)]
///     note: Option<String>,
///     cached_total: u64,
/// }
/// ```
#[proc_macro_derive(Record, attributes(tagform))]
pub fn derive_record(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    match expand_record(input) {
        Ok(tokens) => tokens.into(),
        Err(err) => err.to_compile_error().into(),
    }
}

fn expand_record(mut input: DeriveInput) -> syn::Result<TokenStream2> {
    let name = input.ident.clone();

    let fields = match &input.data {
        Data::Struct(s) => &s.fields,
        Data::Enum(e) => {
            return Err(syn::Error::new(
                e.enum_token.span,
                "Record can only be derived for structs",
            ))
        }
        Data::Union(u) => {
            return Err(syn::Error::new(
                u.union_token.span,
                "Record can only be derived for structs",
            ))
        }
    };

    let mut used_tags = HashMap::new();
    let mut field_describe = Vec::new();
    let members: Vec<(Member, &syn::Field)> = match fields {
        Fields::Named(named) => named
            .named
            .iter()
            .filter_map(|f| f.ident.clone().map(|ident| (Member::Named(ident), f)))
            .collect(),
        Fields::Unnamed(unnamed) => unnamed
            .unnamed
            .iter()
            .enumerate()
            .map(|(i, f)| (Member::Unnamed(i.into()), f))
            .collect(),
        Fields::Unit => Vec::new(),
    };

    for (member, f) in &members {
        let Some(tag) = get_field_attributes(&f.attrs)?.tag else {
            continue;
        };
        let field_name = match member {
            Member::Named(ident) => ident.to_string(),
            Member::Unnamed(index) => index.index.to_string(),
        };
        if let Some(previous) = used_tags.insert(tag, field_name.clone()) {
            return Err(syn::Error::new_spanned(
                &f.ty,
                format!(
                    "Field tag {} is used by both '{}' and '{}' in struct '{}'",
                    tag, previous, field_name, name
                ),
            ));
        }
        let ty = &f.ty;
        field_describe.push(quote! {
            fields.field::<#ty>(#tag, #field_name, |value: &Self| &value.#member)?;
        });
    }

    let type_params: Vec<_> = input
        .generics
        .type_params()
        .map(|p| p.ident.clone())
        .collect();
    let where_clause = input.generics.make_where_clause();
    for param in &type_params {
        where_clause
            .predicates
            .push(parse_quote!(#param: tagform::Encode));
    }
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    Ok(quote! {
        impl #impl_generics tagform::Record for #name #ty_generics #where_clause {
            #[allow(unused_variables)]
            fn describe(fields: &mut tagform::FieldsBuilder<'_, Self>) -> tagform::Result<()> {
                #(#field_describe)*
                Ok(())
            }
        }

        impl #impl_generics tagform::Encode for #name #ty_generics #where_clause {
            fn writer(registry: &tagform::Registry) -> tagform::Result<tagform::Writer<Self>> {
                tagform::Writer::record(registry)
            }
        }
    })
}
