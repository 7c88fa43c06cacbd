pub mod index_manager;
pub mod job;
pub mod repository;
pub mod source;
