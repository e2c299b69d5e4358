mod digitalocean_provider;
mod json_file_store;
mod memory_store;

pub use digitalocean_provider::{DigitalOceanConfig, DigitalOceanProvider};
pub use json_file_store::JsonFileStore;
pub use memory_store::InMemoryStore;
