use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, Attribute, ItemFn, LitInt};

/// Wraps a test in a watchdog thread that fails it after a wall-clock
/// deadline (default 30 seconds) instead of letting the suite hang.
/// Works on both synchronous and `async` test functions; async bodies run
/// on a fresh current-thread tokio runtime with a matching inner timeout.
#[proc_macro_attribute]
pub fn deadline(attr: TokenStream, item: TokenStream) -> TokenStream {
    let mut deadline_secs: u64 = 30;

    if !attr.is_empty() {
        let lit = parse_macro_input!(attr as LitInt);
        deadline_secs = lit
            .base10_parse()
            .unwrap_or_else(|err| panic!("invalid deadline value: {err}"));
        if deadline_secs == 0 {
            panic!("deadline must be greater than zero");
        }
    }

    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    let is_async = sig.asyncness.take().is_some();

    let filtered_attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_test_entry_attribute(attr))
        .collect();

    let harnessed = if is_async {
        quote! {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("failed to build tokio runtime");
            runtime.block_on(async {
                tokio::time::timeout(deadline, async move #block)
                    .await
                    .expect("test exceeded its deadline");
            });
        }
    } else {
        quote! { #block }
    };

    let secs = deadline_secs;

    TokenStream::from(quote! {
        #[test]
        #(#filtered_attrs)*
        #vis #sig {
            let deadline = std::time::Duration::from_secs(#secs);
            let (done_tx, done_rx) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    #harnessed
                }));
                let _ = done_tx.send(outcome);
            });
            match done_rx.recv_timeout(deadline) {
                Ok(Ok(_)) => {}
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    panic!("test exceeded its deadline")
                }
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread exited before reporting a result")
                }
            }
        }
    })
}

/// Matches `#[test]` and `#[tokio::test]` so the expansion stays the only
/// test entry point for the function.
fn is_test_entry_attribute(attr: &Attribute) -> bool {
    let mut segments = attr.path().segments.iter();
    match (segments.next(), segments.next(), segments.next()) {
        (Some(only), None, _) => only.ident == "test",
        (Some(first), Some(second), None) => first.ident == "tokio" && second.ident == "test",
        _ => false,
    }
}
