//! Log ingress fabric

mod fabric;

pub use fabric::{FabricConfig, FabricError, LogFabric, Session, Triage};
