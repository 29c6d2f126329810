use proc_macro2::TokenStream;
use quote::{format_ident, quote};
use syn::parse::Parser;
use syn::{Expr, Lit, Meta, punctuated::Punctuated, token::Comma};

use crate::attribute_parser::string_value;

/// Method attributes and the `CrudHook` variants they bind to.
const HOOKS: &[(&str, &str)] = &[
    ("search_query", "SearchQuery"),
    ("before_search", "BeforeSearch"),
    ("after_search", "AfterSearch"),
    ("get_query", "GetQuery"),
    ("before_get", "BeforeGet"),
    ("after_get", "AfterGet"),
    ("before_view", "BeforeView"),
    ("after_view", "AfterView"),
    ("before_create", "BeforeCreate"),
    ("after_create", "AfterCreate"),
    ("before_update", "BeforeUpdate"),
    ("after_update", "AfterUpdate"),
    ("before_delete", "BeforeDelete"),
    ("after_delete", "AfterDelete"),
    ("before_upsert", "BeforeUpsert"),
    ("after_upsert", "AfterUpsert"),
    ("before_persist", "BeforePersist"),
    ("after_persist", "AfterPersist"),
    ("before_flush", "BeforeFlush"),
    ("after_flush", "AfterFlush"),
    ("before_commit", "BeforeCommit"),
    ("after_commit", "AfterCommit"),
    ("before_rollback", "BeforeRollback"),
    ("after_rollback", "AfterRollback"),
];

/// Parameter attributes and the `CrudParam` slots they read.
const SLOTS: &[(&str, &str)] = &[
    ("entity_manager", "EntityManager"),
    ("keys", "Keys"),
    ("request", "Request"),
    ("response", "Response"),
    ("query", "Query"),
    ("params", "Params"),
    ("body", "Body"),
    ("filter", "Filter"),
    ("entity", "Entity"),
    ("entities", "Entities"),
    ("file", "File"),
    ("files", "Files"),
    ("options", "Options"),
];

fn lookup(table: &[(&str, &'static str)], path: &syn::Path) -> Option<&'static str> {
    table
        .iter()
        .find(|(attr, _)| path.is_ident(attr))
        .map(|(_, variant)| *variant)
}

/// A typed method parameter bound to a slot.
struct SlotArg {
    slot: &'static str,
    data: Option<String>,
    ty: syn::Type,
}

/// Accepts `resource = "post"` or a bare `"post"`.
fn parse_resource(args: TokenStream) -> syn::Result<String> {
    let metas = Punctuated::<Expr, Comma>::parse_terminated.parse2(args.clone())?;
    for expr in &metas {
        match expr {
            Expr::Lit(expr_lit) => {
                if let Lit::Str(s) = &expr_lit.lit {
                    return Ok(s.value());
                }
            }
            Expr::Assign(assign) => {
                if let Expr::Path(left) = assign.left.as_ref()
                    && left.path.is_ident("resource")
                {
                    let nv = syn::MetaNameValue {
                        path: left.path.clone(),
                        eq_token: assign.eq_token,
                        value: assign.right.as_ref().clone(),
                    };
                    return string_value(&nv);
                }
            }
            _ => {}
        }
    }
    Err(syn::Error::new_spanned(
        args,
        "expected #[crud_hooks(resource = \"<resource name>\")]",
    ))
}

/// Remove the hook attributes of a method, returning their variants.
fn take_hooks(attrs: &mut Vec<syn::Attribute>) -> syn::Result<Vec<&'static str>> {
    let mut hooks = Vec::new();
    let mut error = None;
    attrs.retain(|attr| match lookup(HOOKS, attr.path()) {
        Some(variant) => {
            if let Err(e) = attr.meta.require_path_only() {
                error.get_or_insert(e);
            }
            hooks.push(variant);
            false
        }
        None => true,
    });
    match error {
        Some(e) => Err(e),
        None => Ok(hooks),
    }
}

/// `#[body]` or `#[body("post")]`
fn slot_attr(attr: &syn::Attribute, slot: &'static str) -> syn::Result<SlotArg> {
    let data = match &attr.meta {
        Meta::Path(_) => None,
        Meta::List(list) => Some(list.parse_args::<syn::LitStr>()?.value()),
        Meta::NameValue(nv) => {
            return Err(syn::Error::new_spanned(nv, "expected #[slot] or #[slot(\"property\")]"));
        }
    };
    Ok(SlotArg {
        slot,
        data,
        ty: syn::parse_quote!(()),
    })
}

/// Remove the slot attributes from every parameter of `sig`.
fn take_slots(sig: &mut syn::Signature) -> syn::Result<Vec<(Option<SlotArg>, syn::PatType)>> {
    let mut args = Vec::new();
    for input in &mut sig.inputs {
        let syn::FnArg::Typed(pat_type) = input else {
            continue;
        };
        let mut slot = None;
        let mut kept = Vec::new();
        for attr in pat_type.attrs.drain(..) {
            match lookup(SLOTS, attr.path()) {
                Some(_) if slot.is_some() => {
                    return Err(syn::Error::new_spanned(attr, "a parameter reads a single slot"));
                }
                Some(variant) => {
                    let mut arg = slot_attr(&attr, variant)?;
                    arg.ty = pat_type.ty.as_ref().clone();
                    slot = Some(arg);
                }
                None => kept.push(attr),
            }
        }
        pat_type.attrs = kept;
        args.push((slot, pat_type.clone()));
    }
    Ok(args)
}

fn check_receiver(method: &syn::ImplItemFn) -> syn::Result<()> {
    if method.sig.asyncness.is_none() {
        return Err(syn::Error::new_spanned(&method.sig, "hook methods must be async"));
    }
    match method.sig.receiver() {
        Some(receiver) if receiver.reference.is_some() && receiver.mutability.is_none() => Ok(()),
        _ => Err(syn::Error::new_spanned(&method.sig, "hook methods take &self")),
    }
}

fn binding(resource: &str, hook: &str, method: &syn::Ident, args: &[SlotArg]) -> TokenStream {
    let hook = format_ident!("{}", hook);
    let decls = args.iter().enumerate().map(|(index, arg)| {
        let slot = format_ident!("{}", arg.slot);
        let data = arg.data.as_ref().map(|data| quote! { .data(#data) });
        quote! {
            ::crudhook::hooks::ParamDecl::new(::crudhook::hooks::CrudParam::#slot, #index) #data
        }
    });
    let names = (0..args.len())
        .map(|index| format_ident!("__crudhook_arg{}", index))
        .collect::<Vec<_>>();
    let types = args.iter().map(|arg| &arg.ty);
    let handler_args = if args.is_empty() {
        quote! { _args }
    } else {
        quote! { args }
    };
    let unpack = (!args.is_empty()).then(|| quote! { let mut args = args.into_iter(); });

    quote! {
        {
            let this = ::std::sync::Arc::clone(&self);
            ::crudhook::hooks::HookBinding::new(
                #resource,
                ::crudhook::hooks::CrudHook::#hook,
                ::std::vec![#(#decls),*],
                ::crudhook::hooks::hook_fn(move |#handler_args| {
                    let this = ::std::sync::Arc::clone(&this);
                    async move {
                        #unpack
                        #(
                            let #names: #types =
                                ::crudhook::hooks::FromSlot::from_slot(args.next().flatten())?;
                        )*
                        ::crudhook::hooks::IntoHookResult::into_hook_result(
                            this.#method(#(#names),*).await,
                        )
                    }
                }),
            )
        }
    }
}

pub(crate) fn expand_crud_hooks(args: TokenStream, mut item: syn::ItemImpl) -> syn::Result<TokenStream> {
    let resource = parse_resource(args)?;
    if let Some((_, path, _)) = &item.trait_ {
        return Err(syn::Error::new_spanned(
            path,
            "#[crud_hooks] goes on an inherent impl block",
        ));
    }

    let mut bindings = Vec::new();
    for impl_item in &mut item.items {
        let syn::ImplItem::Fn(method) = impl_item else {
            continue;
        };
        let hooks = take_hooks(&mut method.attrs)?;
        let params = take_slots(&mut method.sig)?;
        if hooks.is_empty() {
            if let Some((Some(_), pat_type)) = params.iter().find(|(slot, _)| slot.is_some()) {
                return Err(syn::Error::new_spanned(
                    pat_type,
                    "slot parameters need a hook attribute on the method",
                ));
            }
            continue;
        }
        check_receiver(method)?;

        let mut slot_args = Vec::new();
        for (slot, pat_type) in params {
            match slot {
                Some(slot) => slot_args.push(slot),
                None => {
                    return Err(syn::Error::new_spanned(
                        pat_type,
                        "hook parameters need a slot attribute such as #[body] or #[entity]",
                    ));
                }
            }
        }
        for hook in hooks {
            bindings.push(binding(&resource, hook, &method.sig.ident, &slot_args));
        }
    }

    let self_ty = &item.self_ty;
    let (impl_generics, _, where_clause) = item.generics.split_for_impl();
    let provider = quote! {
        impl #impl_generics ::crudhook::hooks::HookProvider for #self_ty #where_clause {
            fn bindings(
                self: ::std::sync::Arc<Self>,
            ) -> ::std::vec::Vec<::crudhook::hooks::HookBinding> {
                ::std::vec![#(#bindings),*]
            }
        }
    };
    Ok(quote! {
        #item
        #provider
    })
}
