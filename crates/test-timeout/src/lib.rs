//! Test attributes that fail a test instead of letting it hang.
//!
//! `#[tokio_timeout_test]` accepts an optional list of settings:
//! a bare integer (seconds), or `secs = N`, `flavor = "multi_thread"`, `workers = N`.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::parse::Parser;
use syn::punctuated::Punctuated;
use syn::{parse_macro_input, Attribute, Expr, ExprLit, ItemFn, Lit, Meta, Token};

const DEFAULT_TIMEOUT_SECS: u64 = 60;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Flavor {
    CurrentThread,
    MultiThread,
}

struct Settings {
    secs: u64,
    flavor: Flavor,
    workers: Option<usize>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            secs: DEFAULT_TIMEOUT_SECS,
            flavor: Flavor::CurrentThread,
            workers: None,
        }
    }
}

fn parse_settings(attr: TokenStream) -> syn::Result<Settings> {
    let mut settings = Settings::default();
    if attr.is_empty() {
        return Ok(settings);
    }

    if let Ok(lit) = syn::parse::<syn::LitInt>(attr.clone()) {
        settings.secs = positive(&lit)?;
        return Ok(settings);
    }

    let metas = Punctuated::<Meta, Token![,]>::parse_terminated.parse(attr)?;
    for meta in metas {
        let Meta::NameValue(pair) = meta else {
            return Err(syn::Error::new_spanned(meta, "expected `name = value`"));
        };
        let Expr::Lit(ExprLit { lit, .. }) = &pair.value else {
            return Err(syn::Error::new_spanned(&pair.value, "expected a literal"));
        };
        let name = pair
            .path
            .get_ident()
            .map(|ident| ident.to_string())
            .unwrap_or_default();
        match (name.as_str(), lit) {
            ("secs", Lit::Int(value)) => settings.secs = positive(value)?,
            ("workers", Lit::Int(value)) => {
                settings.workers = Some(positive(value)? as usize);
            }
            ("flavor", Lit::Str(value)) => {
                settings.flavor = match value.value().as_str() {
                    "current_thread" => Flavor::CurrentThread,
                    "multi_thread" => Flavor::MultiThread,
                    _ => {
                        return Err(syn::Error::new_spanned(
                            value,
                            "flavor must be \"current_thread\" or \"multi_thread\"",
                        ))
                    }
                };
            }
            _ => return Err(syn::Error::new_spanned(&pair.path, "unknown setting")),
        }
    }

    if settings.workers.is_some() && settings.flavor == Flavor::CurrentThread {
        return Err(syn::Error::new(
            proc_macro2::Span::call_site(),
            "`workers` requires flavor = \"multi_thread\"",
        ));
    }
    Ok(settings)
}

fn positive(lit: &syn::LitInt) -> syn::Result<u64> {
    let value: u64 = lit.base10_parse()?;
    if value == 0 {
        return Err(syn::Error::new_spanned(lit, "value must be greater than zero"));
    }
    Ok(value)
}

fn runtime_builder(settings: &Settings) -> TokenStream2 {
    match (settings.flavor, settings.workers) {
        (Flavor::CurrentThread, _) => quote! {
            tokio::runtime::Builder::new_current_thread()
        },
        (Flavor::MultiThread, Some(workers)) => quote! {
            tokio::runtime::Builder::new_multi_thread().worker_threads(#workers)
        },
        (Flavor::MultiThread, None) => quote! {
            tokio::runtime::Builder::new_multi_thread()
        },
    }
}

/// Runs `body` on a watchdog thread and panics if it takes longer than `secs`.
fn guarded(secs: u64, body: TokenStream2) -> TokenStream2 {
    quote! {
        let timeout_duration = std::time::Duration::from_secs(#secs);
        let (sender, receiver) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| { #body }));
            let _ = sender.send(result);
        });
        match receiver.recv_timeout(timeout_duration) {
            Ok(Ok(_)) => {}
            Ok(Err(payload)) => std::panic::resume_unwind(payload),
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                panic!("test exceeded {} seconds", #secs)
            }
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                panic!("test thread exited without reporting a result")
            }
        }
    }
}

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let settings = match parse_settings(attr) {
        Ok(settings) => settings,
        Err(err) => return err.to_compile_error().into(),
    };

    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_none() {
        return syn::Error::new_spanned(
            &sig.ident,
            "tokio_timeout_test can only be applied to async functions",
        )
        .to_compile_error()
        .into();
    }
    sig.asyncness = None;

    let attrs = without(attrs, is_tokio_test_attribute);
    let builder = runtime_builder(&settings);
    let secs = settings.secs;
    let body = guarded(
        secs,
        quote! {
            let runtime = #builder
                .enable_all()
                .build()
                .expect("failed to build Tokio runtime");
            runtime.block_on(async {
                tokio::time::timeout(std::time::Duration::from_secs(#secs), async move #block)
                    .await
                    .expect("test timed out");
            });
        },
    );

    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            #body
        }
    })
}

#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let settings = match parse_settings(attr) {
        Ok(settings) => settings,
        Err(err) => return err.to_compile_error().into(),
    };

    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_some() {
        return syn::Error::new_spanned(
            &sig.ident,
            "timeout expects a synchronous test function; use tokio_timeout_test",
        )
        .to_compile_error()
        .into();
    }

    let attrs = without(attrs, is_test_attribute);
    let body = guarded(settings.secs, quote! { #block });

    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            #body
        }
    })
}

fn without(attrs: Vec<Attribute>, reject: fn(&Attribute) -> bool) -> Vec<Attribute> {
    attrs.into_iter().filter(|attr| !reject(attr)).collect()
}

fn is_tokio_test_attribute(attr: &Attribute) -> bool {
    let mut segments = attr.path().segments.iter();
    matches!(
        (segments.next(), segments.next(), segments.next()),
        (Some(first), Some(second), None)
            if first.ident == "tokio" && second.ident == "test"
    )
}

fn is_test_attribute(attr: &Attribute) -> bool {
    let mut segments = attr.path().segments.iter();
    matches!((segments.next(), segments.next()), (Some(first), None) if first.ident == "test")
}
