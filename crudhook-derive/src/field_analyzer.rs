/// The type inside `Option<…>`, or the type itself.
pub(crate) fn unwrap_option(ty: &syn::Type) -> &syn::Type {
    if let syn::Type::Path(type_path) = ty
        && let Some(last_seg) = type_path.path.segments.last()
        && last_seg.ident == "Option"
        && let syn::PathArguments::AngleBracketed(args) = &last_seg.arguments
        && let Some(syn::GenericArgument::Type(inner)) = args.args.first()
    {
        inner
    } else {
        ty
    }
}

/// `ScalarType` variant for a Rust field type, looking through `Option`.
pub(crate) fn infer_scalar_type(ty: &syn::Type) -> Option<&'static str> {
    let syn::Type::Path(type_path) = unwrap_option(ty) else {
        return None;
    };
    let ident = type_path.path.segments.last()?.ident.to_string();
    let variant = match ident.as_str() {
        "i8" | "i16" | "i32" | "i64" | "i128" | "isize" | "u8" | "u16" | "u32" | "u64" | "u128"
        | "usize" => "Integer",
        "f32" | "f64" | "Decimal" => "Float",
        "bool" => "Boolean",
        "String" | "str" | "char" => "Text",
        "Uuid" => "Uuid",
        "DateTime" | "NaiveDateTime" | "NaiveDate" | "DateTimeUtc" => "DateTime",
        "Value" | "Json" | "Vec" | "HashMap" | "BTreeMap" => "Json",
        _ => return None,
    };
    Some(variant)
}

#[cfg(test)]
mod tests {
    use super::*;
    use syn::parse_quote;

    #[test]
    fn test_infer_primitives() {
        assert_eq!(infer_scalar_type(&parse_quote!(i64)), Some("Integer"));
        assert_eq!(infer_scalar_type(&parse_quote!(f32)), Some("Float"));
        assert_eq!(infer_scalar_type(&parse_quote!(bool)), Some("Boolean"));
        assert_eq!(infer_scalar_type(&parse_quote!(String)), Some("Text"));
    }

    #[test]
    fn test_infer_through_option_and_paths() {
        assert_eq!(infer_scalar_type(&parse_quote!(Option<uuid::Uuid>)), Some("Uuid"));
        assert_eq!(
            infer_scalar_type(&parse_quote!(chrono::DateTime<chrono::Utc>)),
            Some("DateTime")
        );
        assert_eq!(infer_scalar_type(&parse_quote!(serde_json::Value)), Some("Json"));
    }

    #[test]
    fn test_unknown_type() {
        assert_eq!(infer_scalar_type(&parse_quote!(MyType)), None);
        assert_eq!(infer_scalar_type(&parse_quote!((i32, i32))), None);
    }
}
