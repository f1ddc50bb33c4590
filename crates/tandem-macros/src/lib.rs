//! Procedural macros for Tandem.
//!
//! This crate provides the `#[tandem::task]` attribute macro. It rewrites a function so
//! that calling it dispatches the body to the loop thread, the thread pool or a worker
//! process, and returns a `tandem::Unfuture` right away.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::{format_ident, quote};
use syn::spanned::Spanned;
use syn::{
    FnArg, GenericArgument, ItemFn, LitBool, Pat, PathArguments, ReturnType, Token, Type,
    parse_macro_input, parse_quote,
};

/// Options accepted inside `#[task(...)]`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct TaskOptions {
    cpu_bound: bool,
}

impl TaskOptions {
    fn parse(attr: TokenStream2) -> syn::Result<Self> {
        let mut options = TaskOptions::default();
        let parser = syn::meta::parser(|meta| {
            if meta.path.is_ident("cpu_bound") {
                options.cpu_bound = if meta.input.peek(Token![=]) {
                    meta.value()?.parse::<LitBool>()?.value
                } else {
                    true
                };
                Ok(())
            } else {
                Err(meta.error("unsupported task option, expected `cpu_bound`"))
            }
        });
        syn::parse::Parser::parse2(parser, attr)?;
        Ok(options)
    }
}

/// Marks a function as a task.
///
/// Calling the function no longer runs its body on the calling thread. The call returns
/// a `tandem::Unfuture<T>` immediately, where `T` is the declared return type (or the
/// success type, when the function returns a `Result`), and the body runs:
///
/// - on the loop thread, for an `async fn`;
/// - on the thread pool, for an ordinary function;
/// - in a worker process, for an ordinary function marked `cpu_bound`.
///
/// Arguments are moved into the task, so they must be owned and `Send`. Methods taking
/// `self` by value, or an owned receiver such as `self: Arc<Self>`, move the receiver
/// into the task too.
///
/// # Example
///
/// ```rust,ignore
/// #[tandem::task]
/// fn add(a: i64, b: i64) -> i64 {
///     a + b
/// }
///
/// #[tandem::task(cpu_bound)]
/// fn square(x: u64) -> u64 {
///     x * x
/// }
///
/// assert_eq!(add(2, 3).wait()?, 5);
/// ```
///
/// `cpu_bound` functions must also be registered with the worker registry, and the
/// program must call `tandem::worker::run_if_worker` first thing in `main`.
#[proc_macro_attribute]
pub fn task(attr: TokenStream, item: TokenStream) -> TokenStream {
    let options = match TaskOptions::parse(attr.into()) {
        Ok(options) => options,
        Err(err) => return err.to_compile_error().into(),
    };
    let function = parse_macro_input!(item as ItemFn);

    expand(options, function)
        .unwrap_or_else(syn::Error::into_compile_error)
        .into()
}

/// A parameter of the decorated function, renamed in the generated wrapper.
struct Param {
    pat: Pat,
    ty: Type,
    wrapper: syn::Ident,
}

fn expand(options: TaskOptions, function: ItemFn) -> syn::Result<TokenStream2> {
    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = function;

    if let Some(asyncness) = sig.asyncness
        && options.cpu_bound
    {
        return Err(syn::Error::new(
            asyncness.span(),
            "an async fn runs on the loop thread and cannot be cpu_bound",
        ));
    }
    if let Some(constness) = sig.constness {
        return Err(syn::Error::new(constness.span(), "a task cannot be a const fn"));
    }
    if let Some(variadic) = &sig.variadic {
        return Err(syn::Error::new(variadic.span(), "a task cannot be variadic"));
    }

    let mut receiver = None;
    let mut params = Vec::new();
    for (index, input) in sig.inputs.iter().enumerate() {
        match input {
            FnArg::Receiver(recv) => {
                // `self` and owned typed receivers such as `self: Arc<Self>` move into
                // the task; borrowed ones cannot outlive the call.
                if recv.reference.is_some() || matches!(*recv.ty, Type::Reference(_)) {
                    return Err(syn::Error::new(
                        recv.span(),
                        "a task method must take `self` by value or an owned receiver such as `self: Arc<Self>`",
                    ));
                }
                receiver = Some(recv.clone());
            }
            FnArg::Typed(typed) => params.push(Param {
                pat: (*typed.pat).clone(),
                ty: (*typed.ty).clone(),
                wrapper: format_ident!("__tandem_arg{}", index),
            }),
        }
    }

    let ret: Type = match &sig.output {
        ReturnType::Default => parse_quote!(()),
        ReturnType::Type(_, ty) => (**ty).clone(),
    };
    let (output, fallible) = match success_type(&ret)? {
        Some(output) => (output, true),
        None => (ret.clone(), false),
    };

    let name = &sig.ident;
    let wrapper_params = params.iter().map(|p| {
        let (wrapper, ty) = (&p.wrapper, &p.ty);
        quote!(#wrapper: #ty)
    });
    let receiver = receiver.iter();
    let generics = &sig.generics;
    let where_clause = &sig.generics.where_clause;
    let unsafety = &sig.unsafety;
    let wrapper_sig = quote! {
        #unsafety fn #name #generics (#(#receiver,)* #(#wrapper_params),*) -> ::tandem::Unfuture<#output>
        #where_clause
    };

    let (marker, body) = if options.cpu_bound {
        expand_remote(name, &vis, &sig, &params, &ret, &output, fallible, &block)?
    } else {
        let body = expand_local(name, sig.asyncness.is_some(), &params, &ret, fallible, &block);
        (TokenStream2::new(), body)
    };

    Ok(quote! {
        #marker

        #(#attrs)*
        #vis #wrapper_sig {
            #body
        }
    })
}

/// Body of the wrapper for tasks running in this process.
fn expand_local(
    name: &syn::Ident,
    cooperative: bool,
    params: &[Param],
    ret: &Type,
    fallible: bool,
    block: &syn::Block,
) -> TokenStream2 {
    let bindings = params.iter().map(|p| {
        let (pat, ty, wrapper) = (&p.pat, &p.ty, &p.wrapper);
        quote!(let #pat: #ty = #wrapper;)
    });

    let (def, call) = if cooperative {
        let constructor = if fallible {
            quote!(cooperative_fallible)
        } else {
            quote!(cooperative)
        };
        (
            quote!(cooperative),
            quote! {
                ::tandem::Call::#constructor(async move {
                    #(#bindings)*
                    let __tandem_output: #ret = #block;
                    __tandem_output
                })
            },
        )
    } else {
        let constructor = if fallible {
            quote!(plain_fallible)
        } else {
            quote!(plain)
        };
        (
            quote!(plain),
            quote! {
                ::tandem::Call::#constructor(move || -> #ret {
                    #(#bindings)*
                    #block
                })
            },
        )
    };

    quote! {
        let __tandem_def = ::tandem::TaskDef::#def(
            ::tandem::FunctionId::new(::core::module_path!(), ::core::stringify!(#name)),
        );
        ::tandem::__private::dispatch(&__tandem_def, #call)
    }
}

/// Marker type implementing `RemoteTask`, and the body of the wrapper sending a work
/// item to the process pool.
#[allow(clippy::too_many_arguments)]
fn expand_remote(
    name: &syn::Ident,
    vis: &syn::Visibility,
    sig: &syn::Signature,
    params: &[Param],
    ret: &Type,
    output: &Type,
    fallible: bool,
    block: &syn::Block,
) -> syn::Result<(TokenStream2, TokenStream2)> {
    if let Some(receiver) = sig.receiver() {
        return Err(syn::Error::new(
            receiver.span(),
            "a cpu_bound task must be a free function",
        ));
    }
    if !sig.generics.params.is_empty() {
        return Err(syn::Error::new(
            sig.generics.span(),
            "a cpu_bound task cannot be generic",
        ));
    }

    let pats = params.iter().map(|p| &p.pat);
    let tys: Vec<_> = params.iter().map(|p| &p.ty).collect();
    let wrappers = params.iter().map(|p| &p.wrapper);
    let finish = if fallible {
        quote!(__tandem_output.map_err(::tandem::Error::from_task))
    } else {
        quote!(::core::result::Result::Ok(__tandem_output))
    };
    let marker = quote! {
        #[doc(hidden)]
        #[allow(non_camel_case_types, dead_code)]
        #vis struct #name {}

        impl ::tandem::RemoteTask for #name {
            type Args = (#(#tys,)*);
            type Output = #output;

            fn id() -> ::tandem::FunctionId {
                ::tandem::FunctionId::new(::core::module_path!(), ::core::stringify!(#name))
            }

            fn invoke(args: Self::Args) -> ::core::result::Result<Self::Output, ::tandem::Error> {
                let (#(#pats,)*): (#(#tys,)*) = args;
                let __tandem_output: #ret = (move || -> #ret #block)();
                #finish
            }
        }
    };

    let body = quote! {
        let __tandem_def = ::tandem::TaskDef::plain(
            <#name as ::tandem::RemoteTask>::id(),
        )
        .cpu_bound(true);
        ::tandem::__private::dispatch(
            &__tandem_def,
            ::tandem::Call::remote::<#name>((#(#wrappers,)*)),
        )
    };

    Ok((marker, body))
}

/// The success type of a `Result`-returning function, or `None` when the return type is
/// not a `Result`.
fn success_type(ret: &Type) -> syn::Result<Option<Type>> {
    let Type::Path(path) = ret else {
        return Ok(None);
    };
    let Some(last) = path.path.segments.last() else {
        return Ok(None);
    };
    if last.ident != "Result" {
        return Ok(None);
    }
    let PathArguments::AngleBracketed(args) = &last.arguments else {
        return Err(syn::Error::new(
            last.span(),
            "cannot determine the success type of this Result; spell out `Result<T, E>`",
        ));
    };
    args.args
        .iter()
        .find_map(|arg| match arg {
            GenericArgument::Type(ty) => Some(ty.clone()),
            _ => None,
        })
        .map(Some)
        .ok_or_else(|| syn::Error::new(args.span(), "Result has no success type"))
}
