//! One repository per entity family (§4.8), each owning its own table and
//! exposing typed operations rather than a generic CRUD surface — the same
//! split the control-plane's `db::handlers` module uses per entity.

pub mod batches;
pub mod records;
pub mod suppliers;

pub use batches::{BatchRepository, Stage};
pub use records::RecordRepository;
pub use suppliers::SupplierRepository;
