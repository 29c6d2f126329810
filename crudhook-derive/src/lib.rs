//! Macros for crudhook: `#[derive(CrudEntity)]` describes a persisted type,
//! `#[crud_hooks]` turns an impl block into a hook provider.

mod attribute_parser;
mod entity;
mod field_analyzer;
mod hook_provider;
mod structs;

use proc_macro::TokenStream;
use syn::{DeriveInput, ItemImpl, parse_macro_input};

/// Implements `crudhook::orm::CrudEntity` from the struct's fields.
///
/// Struct attributes:
/// - `name = "..."` - entity name, defaults to the struct name
/// - `table = "..."` - table name, defaults to the snake-cased entity name
/// - `keys = "uuid" | "increment" | "manual"` - primary key generation
///
/// Field attributes:
/// - `primary_key`, `unique`, `hidden`, `skip`
/// - `rename = "..."`
/// - `ty = "integer" | "float" | "text" | "boolean" | "uuid" | "datetime" | "json"`,
///   inferred from the Rust type when absent
/// - `on_create = "uuid" | "now"`, `on_update = "now"`
/// - `many_to_one = "Target"`, `one_to_one = "Target"`
/// - `one_to_one_inverse = "Target"` or `one_to_many = "Target"` with
///   `mapped_by = "property"`, plus `orphan_removal` on `one_to_many`
/// - `many_to_many = "Target"` with an optional `pivot = "table"`
///
/// ```rust,ignore
/// #[derive(CrudEntity)]
/// #[crudhook(table = "posts", keys = "increment")]
/// struct Post {
///     #[crudhook(primary_key)]
///     id: i64,
///     title: String,
///     #[crudhook(many_to_one = "Author")]
///     author: Option<i64>,
///     #[crudhook(on_create = "now")]
///     created_at: Option<String>,
/// }
/// ```
#[proc_macro_derive(CrudEntity, attributes(crudhook))]
pub fn crud_entity(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    entity::expand_crud_entity(&input)
        .unwrap_or_else(syn::Error::into_compile_error)
        .into()
}

/// Implements `crudhook::hooks::HookProvider` for the type of an inherent
/// impl block. Methods tagged with a hook attribute (`#[before_create]`,
/// `#[after_view]`, ...) become handlers for that hook of `resource`; each
/// parameter names the slot it reads (`#[body]`, `#[body("post")]`,
/// `#[entity]`, `#[entity_manager]`, ...) and is converted with `FromSlot`.
///
/// ```rust,ignore
/// struct PostHooks;
///
/// #[crud_hooks(resource = "post")]
/// impl PostHooks {
///     #[before_create]
///     async fn default_title(&self, #[body("post")] post: Value) -> Option<Value> {
///         None
///     }
/// }
///
/// registry.provide(Arc::new(PostHooks));
/// ```
#[proc_macro_attribute]
pub fn crud_hooks(args: TokenStream, input: TokenStream) -> TokenStream {
    let item = parse_macro_input!(input as ItemImpl);
    hook_provider::expand_crud_hooks(args.into(), item)
        .unwrap_or_else(syn::Error::into_compile_error)
        .into()
}
