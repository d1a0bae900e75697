//! storage-adapter: filesystem backends over flat object stores
//!
//! This library presents storage services to a file-manager style
//! application through one path-based contract, [`backend::FilesystemBackend`].
//!
//! # Architecture
//!
//! - **Path model** ([`path`]): pure functions mapping upstream paths to a
//!   container and key, and back.
//! - **Object stores** ([`store`]): raw S3 access behind the
//!   [`store::ObjectStore`] trait, backed by aws-sdk-s3 or by memory.
//! - **Backends** ([`backend`]): the S3 backend emulates directories over
//!   keys; the workspaces backend exchanges logical paths for scoped
//!   credentials through a management service ([`auth`]) and forwards to a
//!   freshly provisioned S3 backend.
//! - **Session cache** ([`cache`]): TTL-bounded memo of container regions
//!   and authenticated workspace sessions.
//! - **Registry** ([`registry`]): backend type name to factory, installed
//!   once per process.
//!
//! # Example
//!
//! ```no_run
//! use storage_adapter::config::Config;
//! use storage_adapter::registry::{self, BackendRegistry};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::from_file(&"config.yaml".into())?;
//! let registry = registry::install(BackendRegistry::from_config(&config))?;
//!
//! let connection = &config.connections[0];
//! let backend = registry.init(&connection.backend_type, &connection.params).await?;
//! for entry in backend.list("/").await? {
//!     println!("{}", entry.name);
//! }
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod backend;
pub mod cache;
pub mod config;
pub mod env;
pub mod error;
pub mod form;
pub mod path;
pub mod registry;
pub mod store;

pub use error::{AdapterError, Result};
