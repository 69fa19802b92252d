pub mod events;
pub mod lease;
pub mod mac;

pub use events::{EventBus, Family, LeaseEvent, LeaseEventKind};
pub use lease::{Lease, LeaseFilter, StoreError};
pub use mac::HwAddr;
