pub mod crypto;
pub mod dirs;
pub mod fs;
pub mod http;
pub mod json;
pub mod store;
pub mod types;
