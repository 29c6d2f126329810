//! Persistence for CRUD resources: entity metadata, JSON filters, the entity
//! manager and its storage drivers.

pub mod assign;
pub mod driver;
pub mod filter;
pub mod manager;
pub mod memory;
pub mod meta;
pub mod sql;

pub use assign::assign_entity;
pub use driver::{Driver, Page, SortOrder, Transaction};
pub use filter::{Filter, Operator};
pub use manager::{EntityManager, FindOptions, Populate};
pub use memory::MemoryDriver;
pub use meta::{
    CrudEntity, EntityMeta, Generated, KeyGeneration, PropertyKind, PropertyMeta, Row, ScalarType,
    Schema, TableDef,
};
pub use sql::SeaOrmDriver;
