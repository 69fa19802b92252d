pub mod bitset;
pub mod config;
pub mod hostname;
pub mod options;
pub mod packet;
pub mod probe;
pub mod range;
pub mod server;
pub mod snapshot;
pub mod state_machine;
pub mod store;
pub mod transport;

pub use config::{ConfigError, Dhcp4Config, ValidatedV4};
pub use state_machine::Dhcp4Engine;
pub use store::{LeaseFilter, LeaseStore, SharedLeaseStore, StoreError};
