//! # SceneVault
//!
//! The persistence and access-control core of a 3D-asset management
//! service: a content-addressable object store, an append-only version
//! log per scene, a scene directory with reversible archival, a
//! user/group access resolver and a point-in-time restore engine.
//!
//! Meant to be embedded; it speaks no protocol of its own.
//!
//! ```rust,ignore
//! use scenevault::{Config, SceneVault};
//!
//! let vault = SceneVault::open(&Config::new("./data"))?;
//! let alice = vault.create_user("alice", false)?;
//! let scene = vault.create_scene("dragon", Some(alice.id))?;
//!
//! let version = vault
//!     .write_file(scene.id.into(), "models/dragon.glb", "model/gltf-binary",
//!                 Some(alice.id), reader)
//!     .await?;
//! ```

pub mod config;
pub mod error;
pub mod objects;
pub mod store;
pub mod types;
pub mod vault;

pub use config::Config;
pub use error::{Error, Result};
pub use vault::{FileReader, RestoreTarget, SceneVault};
