//! Batch & Job Store (§4.8): the one writer of durable state. Each
//! repository owns one entity family; `MerchantSearch`/`WebhookEvent` are
//! not duplicated here — they live in `bsc::manager::postgres`, since BSC
//! already is that store for its own rows.

pub mod errors;
pub mod handlers;

pub use handlers::batches::BatchRepository;
pub use handlers::records::RecordRepository;
pub use handlers::suppliers::SupplierRepository;

pub fn migrator() -> sqlx::migrate::Migrator {
    sqlx::migrate!("./migrations")
}
