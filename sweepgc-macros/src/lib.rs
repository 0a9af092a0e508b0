//! Derive macros for the sweepgc collector.

use attribute_derive::FromAttr;
use manyhow::manyhow;
use proc_macro2::{Span, TokenStream};
use quote::quote;
use syn::{GenericParam, Generics, TraitBound};

/// Derives the `sweepgc::Trace` trait for a given struct or enum.
///
/// Every field is traced in declaration order. Fields and enum variants
/// annotated with `#[trace(ignore)]` are skipped, which is useful for fields
/// that hold no references and do not implement `Trace`.
///
/// This macro expects the identifier `sweepgc` to refer to the crate.
#[manyhow]
#[proc_macro_derive(Trace, attributes(trace))]
pub fn derive_trace(input: syn::Item) -> manyhow::Result {
    match input {
        syn::Item::Struct(item) => derive_struct_trace(item),
        syn::Item::Enum(item) => derive_enum_trace(item),
        _ => manyhow::bail!("Trace can only be derived on structs and enums"),
    }
}

fn field_accessor(field: &syn::Field, index: usize) -> TokenStream {
    if let Some(ident) = field.ident.clone() {
        quote!(#ident)
    } else {
        let index = proc_macro2::Literal::usize_unsuffixed(index);
        quote!(#index)
    }
}

fn derive_struct_trace(
    syn::ItemStruct {
        ident,
        mut generics,
        fields,
        ..
    }: syn::ItemStruct,
) -> manyhow::Result {
    require_trace_for_generics(&mut generics);
    let (impl_gen, type_gen, where_clause) = generics.split_for_impl();

    let mut traces = Vec::new();
    for (index, field) in fields.iter().enumerate() {
        let field_attr = TraceFieldAttr::from_attributes(&field.attrs)?;
        if !field_attr.ignore {
            let field = field_accessor(field, index);
            traces.push(quote! {sweepgc::Trace::trace(&self.#field, tracer)});
        }
    }

    Ok(quote! {
        impl #impl_gen sweepgc::Trace for #ident #type_gen #where_clause {
            fn trace(&self, tracer: &mut sweepgc::Tracer<'_>) {
                #(#traces;)*
            }
        }
    })
}

fn require_trace_for_generics(generics: &mut Generics) {
    for mut pair in generics.params.pairs_mut() {
        if let GenericParam::Type(t) = pair.value_mut() {
            t.bounds.push(syn::TypeParamBound::Trait(
                TraitBound::from_input(quote!(sweepgc::Trace)).unwrap(),
            ));
        }
    }
}

fn derive_enum_trace(
    syn::ItemEnum {
        ident: enum_name,
        mut generics,
        variants,
        ..
    }: syn::ItemEnum,
) -> manyhow::Result {
    require_trace_for_generics(&mut generics);
    let (impl_gen, type_gen, where_clause) = generics.split_for_impl();

    let mut traces = Vec::new();
    for syn::Variant {
        ident,
        fields,
        attrs,
        ..
    } in &variants
    {
        let variant_attr = TraceFieldAttr::from_attributes(attrs)?;
        let trace = match fields {
            syn::Fields::Named(_) if variant_attr.ignore => quote!(Self::#ident { .. } => {}),
            syn::Fields::Unnamed(_) if variant_attr.ignore => quote!(Self::#ident(..) => {}),
            syn::Fields::Named(fields) => {
                let mut field_names = Vec::new();
                for field in &fields.named {
                    if !TraceFieldAttr::from_attributes(&field.attrs)?.ignore {
                        field_names.push(field.ident.clone().expect("name missing"));
                    }
                }
                quote! {Self::#ident { #(#field_names,)* .. } => {
                    #(sweepgc::Trace::trace(#field_names, tracer);)*
                }}
            }
            syn::Fields::Unnamed(fields) => {
                let mut bindings = Vec::new();
                let mut field_names = Vec::new();
                for (index, field) in fields.unnamed.iter().enumerate() {
                    if TraceFieldAttr::from_attributes(&field.attrs)?.ignore {
                        bindings.push(quote!(_));
                    } else {
                        let name = syn::Ident::new(&format!("f{index}"), Span::call_site());
                        bindings.push(quote!(#name));
                        field_names.push(name);
                    }
                }
                quote! {Self::#ident ( #(#bindings,)* ) => {
                    #(sweepgc::Trace::trace(#field_names, tracer);)*
                }}
            }
            syn::Fields::Unit => {
                quote! {Self::#ident => {}}
            }
        };
        traces.push(trace);
    }

    let traces = if traces.is_empty() {
        TokenStream::default()
    } else {
        quote!(
            match self {
                #(#traces)*
            }
        )
    };
    Ok(quote! {
        impl #impl_gen sweepgc::Trace for #enum_name #type_gen #where_clause {
            fn trace(&self, tracer: &mut sweepgc::Tracer<'_>) {
                #traces
            }
        }
    })
}

#[derive(FromAttr)]
#[attribute(ident = trace)]
struct TraceFieldAttr {
    ignore: bool,
}
