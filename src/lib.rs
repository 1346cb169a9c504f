pub mod concurrency;
pub mod error;
pub mod manager;
pub mod resource;
pub mod time;
pub mod transaction;
