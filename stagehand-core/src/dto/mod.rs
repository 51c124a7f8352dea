//! DTOs for the control and log-ingress surfaces

pub mod logs;
pub mod scaling;
