pub mod catalog_repo;
pub mod experiment_repo;
pub mod result_repo;
pub mod schema;
pub mod store;

pub use experiment_repo::{EvaluatorLink, ExptFilter, OrderBy, OrderField, Page, StatusTransition};
pub use result_repo::ClaimOutcome;
pub use store::Store;
