pub mod api_types;
pub mod auth;
pub mod cached_client;
pub mod client;
pub mod keys;
pub mod transport;

pub use cached_client::WellnessClient;
