//! DevServer Kubernetes Operator
//!
//! This crate provides a Kubernetes operator for managing ephemeral,
//! SSH-accessible development environments.
//!
//! # Custom Resource Definitions
//!
//! - **DevServer**: one developer environment (Deployment or StatefulSet,
//!   persistent home volume, SSH service, host keys)
//! - **DevServerFlavor**: a cluster-scoped resource envelope template
//! - **DevServerUser**: per-user namespace, RBAC and quota
//!
//! # Example
//!
//! ```yaml
//! apiVersion: devserver.io/v1
//! kind: DevServer
//! metadata:
//!   name: demo
//!   namespace: dev-alice
//! spec:
//!   owner: alice@example.com
//!   flavor: cpu-small
//!   image: ubuntu:22.04
//!   persistentHomeSize: 100Gi
//!   lifecycle:
//!     timeToLive: 8h
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod controller;
pub mod crd;
pub mod duration;
pub mod error;
pub mod leader;
pub mod quantity;
pub mod resources;

pub use config::OperatorConfig;
pub use crd::{DevServer, DevServerFlavor, DevServerSpec, DevServerUser};
pub use error::{OperatorError, OperatorResult};
