/// Struct-level `#[crudhook(...)]` settings of a `CrudEntity`.
#[derive(Debug, Default)]
pub(crate) struct EntityAttrs {
    pub(crate) name: Option<String>,
    pub(crate) table: Option<String>,
    /// `KeyGeneration` variant name
    pub(crate) key_generation: Option<&'static str>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RelationKind {
    ManyToOne,
    OneToOne,
    OneToOneInverse,
    OneToMany,
    ManyToMany,
}

impl RelationKind {
    pub(crate) fn needs_mapped_by(self) -> bool {
        matches!(self, Self::OneToOneInverse | Self::OneToMany)
    }
}

/// Field-level `#[crudhook(...)]` settings.
#[derive(Debug, Default)]
pub(crate) struct FieldAttrs {
    pub(crate) rename: Option<String>,
    pub(crate) primary_key: bool,
    pub(crate) unique: bool,
    pub(crate) hidden: bool,
    pub(crate) skip: bool,
    /// `ScalarType` variant name, inferred from the field type when absent
    pub(crate) scalar_type: Option<&'static str>,
    /// `Generated` variant names
    pub(crate) on_create: Option<&'static str>,
    pub(crate) on_update: Option<&'static str>,
    pub(crate) relation: Option<(RelationKind, String)>,
    pub(crate) mapped_by: Option<String>,
    pub(crate) pivot: Option<String>,
    pub(crate) orphan_removal: bool,
}

impl FieldAttrs {
    pub(crate) fn has_scalar_modifiers(&self) -> bool {
        self.unique || self.hidden || self.on_create.is_some() || self.on_update.is_some()
    }
}
