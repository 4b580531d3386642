//! Network subsystem: dual backends, IPAM, frame relay, DNS topology

pub mod backend;
pub mod dns;
pub mod ipam;
pub mod manager;
pub mod model;
pub mod native;
pub mod overlay;
pub mod relay;

pub use manager::NetworkManager;
pub use model::{ConnectOptions, NetworkSpec};
