mod api_key;
mod uuid;

pub use api_key::ApiKey;
pub use uuid::Uuid;

// Just an alias for more descriptive code
pub type DeviceType = String;
