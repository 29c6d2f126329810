use convert_case::{Case, Casing};
use proc_macro2::TokenStream;
use quote::{format_ident, quote};
use syn::ext::IdentExt;

use crate::attribute_parser::{parse_entity_attrs, parse_field_attrs};
use crate::field_analyzer::infer_scalar_type;
use crate::structs::{FieldAttrs, RelationKind};

pub(crate) fn expand_crud_entity(input: &syn::DeriveInput) -> syn::Result<TokenStream> {
    let syn::Data::Struct(data) = &input.data else {
        return Err(syn::Error::new_spanned(input, "CrudEntity only supports structs"));
    };
    let syn::Fields::Named(fields) = &data.fields else {
        return Err(syn::Error::new_spanned(
            &data.fields,
            "CrudEntity only supports structs with named fields",
        ));
    };

    let entity = parse_entity_attrs(&input.attrs)?;
    let ident = &input.ident;
    let name = entity.name.unwrap_or_else(|| ident.unraw().to_string());
    let table = entity.table.unwrap_or_else(|| name.to_case(Case::Snake));

    let mut steps = Vec::new();
    let mut has_primary_key = false;
    for field in &fields.named {
        let attrs = parse_field_attrs(field)?;
        if attrs.skip {
            continue;
        }
        has_primary_key |= attrs.primary_key;
        steps.push(property_step(&table, field, &attrs)?);
    }
    if !has_primary_key {
        return Err(syn::Error::new_spanned(
            ident,
            "CrudEntity needs a field marked #[crudhook(primary_key)]",
        ));
    }

    let key_generation = entity.key_generation.map(|variant| {
        let variant = format_ident!("{}", variant);
        quote! { .key_generation(::crudhook::orm::KeyGeneration::#variant) }
    });
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    Ok(quote! {
        impl #impl_generics ::crudhook::orm::CrudEntity for #ident #ty_generics #where_clause {
            fn entity_meta() -> ::crudhook::orm::EntityMeta {
                ::crudhook::orm::EntityMeta::new(#name, #table)
                    #key_generation
                    #(#steps)*
            }
        }
    })
}

/// One builder call on `EntityMeta` for a field.
fn property_step(table: &str, field: &syn::Field, attrs: &FieldAttrs) -> syn::Result<TokenStream> {
    let name = match (&attrs.rename, &field.ident) {
        (Some(rename), _) => rename.clone(),
        (None, Some(ident)) => ident.unraw().to_string(),
        (None, None) => return Err(syn::Error::new_spanned(field, "field has no name")),
    };

    if attrs.mapped_by.is_some()
        && !attrs.relation.as_ref().is_some_and(|(kind, _)| kind.needs_mapped_by())
    {
        return Err(syn::Error::new_spanned(
            field,
            "mapped_by only applies to one_to_many and one_to_one_inverse",
        ));
    }
    if attrs.pivot.is_some()
        && !matches!(attrs.relation, Some((RelationKind::ManyToMany, _)))
    {
        return Err(syn::Error::new_spanned(field, "pivot only applies to many_to_many"));
    }

    if let Some((kind, target)) = &attrs.relation {
        if attrs.primary_key || attrs.scalar_type.is_some() || attrs.has_scalar_modifiers() {
            return Err(syn::Error::new_spanned(
                field,
                "relations cannot carry column settings",
            ));
        }
        return relation_step(table, field, &name, *kind, target, attrs);
    }
    if attrs.orphan_removal {
        return Err(syn::Error::new_spanned(field, "orphan_removal only applies to one_to_many"));
    }

    let variant = match attrs.scalar_type.or_else(|| infer_scalar_type(&field.ty)) {
        Some(variant) => format_ident!("{}", variant),
        None => {
            return Err(syn::Error::new_spanned(
                &field.ty,
                "cannot infer the column type, add #[crudhook(ty = \"...\")]",
            ));
        }
    };
    let ty = quote! { ::crudhook::orm::ScalarType::#variant };

    if attrs.primary_key {
        return Ok(quote! { .primary_key(#name, #ty) });
    }
    if !attrs.has_scalar_modifiers() {
        return Ok(quote! { .scalar(#name, #ty) });
    }

    let unique = attrs.unique.then(|| quote! { .unique() });
    let hidden = attrs.hidden.then(|| quote! { .hidden() });
    let on_create = attrs.on_create.map(|generated| {
        let generated = format_ident!("{}", generated);
        quote! { .on_create(::crudhook::orm::Generated::#generated) }
    });
    let on_update = attrs.on_update.map(|generated| {
        let generated = format_ident!("{}", generated);
        quote! { .on_update(::crudhook::orm::Generated::#generated) }
    });
    Ok(quote! {
        .property(
            ::crudhook::orm::PropertyMeta::scalar(#name, #ty)
                #unique #hidden #on_create #on_update
        )
    })
}

fn relation_step(
    table: &str,
    field: &syn::Field,
    name: &str,
    kind: RelationKind,
    target: &str,
    attrs: &FieldAttrs,
) -> syn::Result<TokenStream> {
    if attrs.orphan_removal && kind != RelationKind::OneToMany {
        return Err(syn::Error::new_spanned(field, "orphan_removal only applies to one_to_many"));
    }
    let mapped_by = match (&attrs.mapped_by, kind.needs_mapped_by()) {
        (Some(mapped_by), true) => mapped_by.clone(),
        (None, true) => {
            return Err(syn::Error::new_spanned(
                field,
                "this relation needs mapped_by = \"<owning property on the target>\"",
            ));
        }
        (_, false) => String::new(),
    };

    Ok(match kind {
        RelationKind::ManyToOne => quote! { .many_to_one(#name, #target) },
        RelationKind::OneToOne => quote! { .one_to_one(#name, #target) },
        RelationKind::OneToOneInverse => quote! { .one_to_one_inverse(#name, #target, #mapped_by) },
        RelationKind::OneToMany if attrs.orphan_removal => {
            quote! { .one_to_many_owned(#name, #target, #mapped_by) }
        }
        RelationKind::OneToMany => quote! { .one_to_many(#name, #target, #mapped_by) },
        RelationKind::ManyToMany => {
            let pivot = attrs
                .pivot
                .clone()
                .unwrap_or_else(|| format!("{table}_{}", name.to_case(Case::Snake)));
            quote! { .many_to_many(#name, #target, #pivot) }
        }
    })
}
