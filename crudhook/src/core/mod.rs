// Request handling: per-resource options, the request state bag and the
// CRUD orchestrator.

pub mod args;
pub mod options;
pub mod request;
pub mod service;

// Re-export commonly used items
pub use args::{CrudArgs, RequestPayload, Subject};
pub use options::{CrudDefaults, CrudOptions, Dto, PopulateOption};
pub use request::{RequestData, ResponseHandle, SearchQuery, UploadedFile, UploadedFiles};
pub use service::{CrudService, SearchResult};
