//! Clustergate - A reverse proxy in front of many Kubernetes API servers
//!
//! This library provides a gateway that:
//! - Routes `/clusters/<name>/...` to the matching API server, each with its
//!   own trust store, client certificate and bearer token
//! - Lets clusters be added and removed at runtime next to static ones
//! - Opens port-forward tunnels to pods and watches them until they stop
//! - Runs the OpenID Connect login on behalf of a cluster
//! - Relays requests to allow-listed external URLs

pub mod admin;
pub mod config;
pub mod credentials;
pub mod discovery;
pub mod error;
pub mod factory;
pub mod oidc;
pub mod plugins;
pub mod proxy;
pub mod registry;
pub mod server;
pub mod target;
pub mod tunnel;
pub mod workload;
