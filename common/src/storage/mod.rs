pub mod cache;
pub mod db;
pub mod indexes;
pub mod store;
pub mod types;
pub mod vector_store;
