// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Attribute macro behind `test_with_tracing::test`.

use proc_macro2::TokenStream;
use quote::quote;
use syn::Error;
use syn::ItemFn;
use syn::parse_macro_input;
use syn::spanned::Spanned;

/// Marks a function as a test, like `#[test]`, and installs the
/// `test_with_tracing` subscriber before the body runs.
///
/// Any other attributes on the function (`#[should_panic]`, `#[ignore]`) are
/// kept on the generated test.
#[proc_macro_attribute]
pub fn test(
    attr: proc_macro::TokenStream,
    item: proc_macro::TokenStream,
) -> proc_macro::TokenStream {
    let attr = TokenStream::from(attr);
    let item = parse_macro_input!(item as ItemFn);
    expand(attr, item)
        .unwrap_or_else(|err| err.to_compile_error())
        .into()
}

fn expand(attr: TokenStream, item: ItemFn) -> syn::Result<TokenStream> {
    if !attr.is_empty() {
        return Err(Error::new(attr.span(), "unexpected arguments"));
    }
    if let Some(asyncness) = item.sig.asyncness {
        return Err(Error::new(asyncness.span(), "async tests are not supported"));
    }
    if !item.sig.inputs.is_empty() {
        return Err(Error::new(
            item.sig.inputs.span(),
            "test functions take no arguments",
        ));
    }

    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = item;
    let output = &sig.output;
    let name = &sig.ident;

    Ok(quote! {
        #[::core::prelude::v1::test]
        #(#attrs)*
        #vis fn #name() #output {
            ::test_with_tracing::init();
            #block
        }
    })
}
