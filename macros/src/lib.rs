extern crate proc_macro;

use proc_macro::TokenStream;
use proc_macro2::{Ident, Span};
use quote::quote;

/// Options accepted by `#[spindle::main]` and `#[spindle::test]`.
#[derive(Default)]
struct Options {
    crate_name: Option<Ident>,
    parallelism: Option<usize>,
    thread_name: Option<String>,
}

impl Options {
    fn crate_name(&mut self, lit: syn::Lit) -> Result<(), syn::Error> {
        let span = lit.span();
        if self.crate_name.is_some() {
            return Err(syn::Error::new(span, "crate name already set"));
        }
        let syn::Lit::Str(s) = lit else {
            return Err(syn::Error::new(span, "crate name should be a string"));
        };
        match s.parse::<syn::Path>().ok().as_ref().and_then(|path| path.get_ident()) {
            Some(ident) => {
                self.crate_name = Some(ident.clone());
                Ok(())
            },
            None => Err(syn::Error::new(span, format!("invalid crate name: {}", s.value()))),
        }
    }

    fn parallelism(&mut self, lit: syn::Lit) -> Result<(), syn::Error> {
        let span = lit.span();
        if self.parallelism.is_some() {
            return Err(syn::Error::new(span, "parallelism already set"));
        }
        let parallelism = match lit {
            syn::Lit::Int(lit) => lit.base10_parse::<usize>()?,
            _ => 0,
        };
        if parallelism == 0 {
            return Err(syn::Error::new(span, "parallelism should be a positive integer"));
        }
        self.parallelism = Some(parallelism);
        Ok(())
    }

    fn thread_name(&mut self, lit: syn::Lit) -> Result<(), syn::Error> {
        let span = lit.span();
        if self.thread_name.is_some() {
            return Err(syn::Error::new(span, "name already set"));
        }
        match lit {
            syn::Lit::Str(s) if !s.value().is_empty() => {
                self.thread_name = Some(s.value());
                Ok(())
            },
            _ => Err(syn::Error::new(span, "name should be a non empty string")),
        }
    }

    fn parse(args: syn::AttributeArgs) -> Result<Options, syn::Error> {
        let mut options = Options::default();
        for arg in args.into_iter() {
            let syn::NestedMeta::Meta(syn::Meta::NameValue(name_value)) = arg else {
                return Err(syn::Error::new_spanned(arg, "unknown attribute"));
            };
            let name = name_value
                .path
                .get_ident()
                .ok_or_else(|| syn::Error::new_spanned(&name_value, "invalid attribute name"))?
                .to_string();
            match name.as_str() {
                "crate" => options.crate_name(name_value.lit)?,
                "parallelism" => options.parallelism(name_value.lit)?,
                "name" => options.thread_name(name_value.lit)?,
                _ => return Err(syn::Error::new_spanned(&name_value, "unknown attribute name")),
            }
        }
        Ok(options)
    }
}

fn generate(is_test: bool, attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = syn::parse_macro_input!(attr as syn::AttributeArgs);
    let input = syn::parse_macro_input!(item as syn::ItemFn);
    let options = match Options::parse(args) {
        Ok(options) => options,
        Err(err) => return TokenStream::from(err.into_compile_error()),
    };

    let ret = &input.sig.output;
    let inputs = &input.sig.inputs;
    let name = &input.sig.ident;
    let body = &input.block;
    let attrs = &input.attrs;
    let vis = &input.vis;

    let macro_name = if is_test { "#[spindle::test]" } else { "#[spindle::main]" };

    if input.sig.asyncness.is_some() {
        let err =
            syn::Error::new_spanned(input, format!("only synchronous function can be tagged with {}", macro_name));
        return TokenStream::from(err.into_compile_error());
    }

    if !is_test && name != "main" {
        let err = syn::Error::new_spanned(name, "only the main function can be tagged with #[spindle::main]");
        return TokenStream::from(err.into_compile_error());
    }

    let header = if is_test {
        quote! {
            #[::core::prelude::v1::test]
        }
    } else {
        quote! {}
    };

    let crate_name = options.crate_name.unwrap_or_else(|| Ident::new("spindle", Span::call_site()));
    let parallelism = options.parallelism.unwrap_or(0);
    let thread_name = options.thread_name.unwrap_or_default();
    let result = quote! {
        #header
        #(#attrs)*
        #vis fn #name() #ret {
            fn entry(#inputs) #ret {
                #body
            }

            let mut builder = #crate_name::pool::Builder::default();
            if #parallelism != 0 {
                builder.parallelism(#parallelism);
            }
            if !#thread_name.is_empty() {
                builder.name(#thread_name);
            }
            let pool = builder.build();
            let fiber = pool.spawn(entry);
            let result = fiber.join();
            pool.shutdown();
            match result {
                Ok(value) => value,
                Err(err) => ::std::panic::resume_unwind(err.into_panic()),
            }
        }
    };

    result.into()
}

/// Runs marked main function as a fiber inside a freshly built thread pool.
///
/// The pool is shut down after the fiber completes. A panic inside the fiber resurfaces as a panic
/// of `main`.
///
/// ## Options
/// * `parallelism`: positive integer to specify worker count of the thread pool
/// * `name`: prefix for names of worker threads
///
/// ## Examples
/// ```rust,ignore
/// #[spindle::main]
/// fn main() {
///     spindle::fiber::yield_now();
/// }
/// ```
///
/// ```rust,ignore
/// #[spindle::main(parallelism = 1)]
/// fn main() {
///     let answer = spindle::fiber::spawn(|| 42).join().unwrap();
///     assert_eq!(answer, 42);
/// }
/// ```
#[cfg(not(test))]
#[proc_macro_attribute]
pub fn main(attr: TokenStream, item: TokenStream) -> TokenStream {
    generate(false, attr, item)
}

/// Runs marked test function as a fiber inside a freshly built thread pool.
///
/// See [macro@main] for configurable options.
#[proc_macro_attribute]
pub fn test(attr: TokenStream, item: TokenStream) -> TokenStream {
    generate(true, attr, item)
}
