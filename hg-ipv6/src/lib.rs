pub mod config;
pub mod duid;
pub mod message;
pub mod options;
pub mod ra;
pub mod server;
pub mod state_machine;
pub mod store;

pub use config::{ConfigError, Ipv6Config, ValidatedV6};
pub use state_machine::Dhcp6Engine;
pub use store::{LeaseStoreV6, SharedLeaseStoreV6};
