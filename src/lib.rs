pub mod cni;
pub mod controller;
pub mod error;
pub mod firewall;
pub mod ipam;
pub mod kube;
pub mod version_info;
pub mod wireguard;

pub use error::Error;
