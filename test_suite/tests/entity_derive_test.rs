// Metadata produced by #[derive(CrudEntity)].

use crudhook::orm::{Generated, PropertyKind};
use crudhook::{CrudEntity, KeyGeneration, ScalarType};

mod common;
use common::{Author, Post, Tag, schema};

#[test]
fn test_struct_attributes() {
    let meta = Post::entity_meta();
    assert_eq!(meta.name, "Post");
    assert_eq!(meta.table, "posts");
    assert_eq!(meta.primary_keys, vec!["id".to_string()]);
    assert_eq!(meta.key_generation, KeyGeneration::Increment);

    assert_eq!(Tag::entity_meta().key_generation, KeyGeneration::Uuid);
}

#[test]
fn test_scalar_types_and_generation() {
    let meta = Post::entity_meta();
    assert_eq!(meta.get("id").unwrap().kind, PropertyKind::Scalar(ScalarType::Integer));
    assert_eq!(meta.get("title").unwrap().kind, PropertyKind::Scalar(ScalarType::Text));
    assert_eq!(meta.get("published").unwrap().kind, PropertyKind::Scalar(ScalarType::Boolean));

    let created_at = meta.get("created_at").unwrap();
    assert_eq!(created_at.kind, PropertyKind::Scalar(ScalarType::DateTime));
    assert_eq!(created_at.on_create, Some(Generated::Now));
}

#[test]
fn test_flags() {
    assert!(Author::entity_meta().get("password").unwrap().hidden);
    assert!(Tag::entity_meta().get("label").unwrap().unique);
}

#[test]
fn test_relations() {
    let meta = Post::entity_meta();
    assert_eq!(
        meta.get("author").unwrap().kind,
        PropertyKind::ManyToOne {
            target: "Author".to_string(),
            join_column: "author_id".to_string(),
        }
    );
    assert_eq!(
        meta.get("comments").unwrap().kind,
        PropertyKind::OneToMany {
            target: "Comment".to_string(),
            mapped_by: "post".to_string(),
            orphan_removal: true,
        }
    );
    assert!(matches!(
        &meta.get("tags").unwrap().kind,
        PropertyKind::ManyToMany { pivot_table, .. } if pivot_table == "post_tags"
    ));
}

#[test]
fn test_derived_schema_is_consistent() {
    schema().validate().unwrap();
}
