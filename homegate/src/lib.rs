pub mod coordinator;

pub use coordinator::{Coordinator, HomegateConfig};
