//! Core types for Stagehand
//!
//! This crate contains:
//! - Shared domain types (worker specs, pipeline stages, log entries) - structure only
//! - DTOs for the control and log-ingress surfaces
//! - Name and label sanitizers for cluster-safe identifiers
//!
//! Note: Cluster access lives in the server, egress transport in the client.

pub mod domain;
pub mod dto;
pub mod names;
