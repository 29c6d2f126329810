use syn::parse::Parser;
use syn::{Expr, Lit, Meta, MetaNameValue, punctuated::Punctuated, token::Comma};

use crate::structs::{EntityAttrs, FieldAttrs, RelationKind};

const KEY_GENERATIONS: &[(&str, &str)] = &[
    ("uuid", "Uuid"),
    ("increment", "Increment"),
    ("manual", "Manual"),
];

const SCALAR_TYPES: &[(&str, &str)] = &[
    ("integer", "Integer"),
    ("float", "Float"),
    ("text", "Text"),
    ("boolean", "Boolean"),
    ("uuid", "Uuid"),
    ("datetime", "DateTime"),
    ("json", "Json"),
];

const GENERATED: &[(&str, &str)] = &[("uuid", "Uuid"), ("now", "Now")];

/// Every `#[crudhook(...)]` item on `attrs`, in order.
fn crudhook_metas(attrs: &[syn::Attribute]) -> syn::Result<Vec<Meta>> {
    let mut metas = Vec::new();
    for attr in attrs {
        if attr.path().is_ident("crudhook") {
            let list = attr.meta.require_list()?;
            metas.extend(Punctuated::<Meta, Comma>::parse_terminated.parse2(list.tokens.clone())?);
        }
    }
    Ok(metas)
}

pub(crate) fn string_value(nv: &MetaNameValue) -> syn::Result<String> {
    if let Expr::Lit(expr_lit) = &nv.value
        && let Lit::Str(s) = &expr_lit.lit
    {
        Ok(s.value())
    } else {
        Err(syn::Error::new_spanned(&nv.value, "expected a string literal"))
    }
}

/// Map a lowercase keyword to the matching variant name.
fn variant(nv: &MetaNameValue, choices: &[(&str, &'static str)]) -> syn::Result<&'static str> {
    let value = string_value(nv)?;
    choices
        .iter()
        .find(|(keyword, _)| keyword.eq_ignore_ascii_case(&value))
        .map(|(_, variant)| *variant)
        .ok_or_else(|| {
            let expected = choices
                .iter()
                .map(|(keyword, _)| format!("\"{keyword}\""))
                .collect::<Vec<_>>()
                .join(", ");
            syn::Error::new_spanned(&nv.value, format!("expected one of {expected}"))
        })
}

/// Parses `#[crudhook(name = "...", table = "...", keys = "...")]` on the struct.
pub(crate) fn parse_entity_attrs(attrs: &[syn::Attribute]) -> syn::Result<EntityAttrs> {
    let mut entity = EntityAttrs::default();
    for meta in crudhook_metas(attrs)? {
        match &meta {
            Meta::NameValue(nv) if nv.path.is_ident("name") => entity.name = Some(string_value(nv)?),
            Meta::NameValue(nv) if nv.path.is_ident("table") => {
                entity.table = Some(string_value(nv)?);
            }
            Meta::NameValue(nv) if nv.path.is_ident("keys") => {
                entity.key_generation = Some(variant(nv, KEY_GENERATIONS)?);
            }
            other => return Err(syn::Error::new_spanned(other, "unknown crudhook entity attribute")),
        }
    }
    Ok(entity)
}

fn relation_kind(path: &syn::Path) -> Option<RelationKind> {
    if path.is_ident("many_to_one") {
        Some(RelationKind::ManyToOne)
    } else if path.is_ident("one_to_one") {
        Some(RelationKind::OneToOne)
    } else if path.is_ident("one_to_one_inverse") {
        Some(RelationKind::OneToOneInverse)
    } else if path.is_ident("one_to_many") {
        Some(RelationKind::OneToMany)
    } else if path.is_ident("many_to_many") {
        Some(RelationKind::ManyToMany)
    } else {
        None
    }
}

/// Parses the `#[crudhook(...)]` attributes of one field.
pub(crate) fn parse_field_attrs(field: &syn::Field) -> syn::Result<FieldAttrs> {
    let mut attrs = FieldAttrs::default();
    for meta in crudhook_metas(&field.attrs)? {
        match &meta {
            Meta::Path(path) if path.is_ident("primary_key") => attrs.primary_key = true,
            Meta::Path(path) if path.is_ident("unique") => attrs.unique = true,
            Meta::Path(path) if path.is_ident("hidden") => attrs.hidden = true,
            Meta::Path(path) if path.is_ident("skip") => attrs.skip = true,
            Meta::Path(path) if path.is_ident("orphan_removal") => attrs.orphan_removal = true,
            Meta::NameValue(nv) if nv.path.is_ident("rename") => attrs.rename = Some(string_value(nv)?),
            Meta::NameValue(nv) if nv.path.is_ident("ty") => {
                attrs.scalar_type = Some(variant(nv, SCALAR_TYPES)?);
            }
            Meta::NameValue(nv) if nv.path.is_ident("on_create") => {
                attrs.on_create = Some(variant(nv, GENERATED)?);
            }
            Meta::NameValue(nv) if nv.path.is_ident("on_update") => {
                attrs.on_update = Some(variant(nv, GENERATED)?);
            }
            Meta::NameValue(nv) if nv.path.is_ident("mapped_by") => {
                attrs.mapped_by = Some(string_value(nv)?);
            }
            Meta::NameValue(nv) if nv.path.is_ident("pivot") => attrs.pivot = Some(string_value(nv)?),
            Meta::NameValue(nv) if relation_kind(&nv.path).is_some() => {
                if attrs.relation.is_some() {
                    return Err(syn::Error::new_spanned(nv, "a field can only have one relation"));
                }
                if let Some(kind) = relation_kind(&nv.path) {
                    attrs.relation = Some((kind, string_value(nv)?));
                }
            }
            other => return Err(syn::Error::new_spanned(other, "unknown crudhook field attribute")),
        }
    }
    Ok(attrs)
}
