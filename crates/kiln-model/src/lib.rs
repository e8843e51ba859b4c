//! Model layer: settings tree, mesh abstraction, and the configuration /
//! consistency error kinds shared across the workspace.
//!
//! File loading (YAML/XML decks, ExodusII) is handled by external
//! collaborators; this crate only defines the in-memory forms they produce.

pub mod error;
pub mod mesh;
pub mod settings;

pub use error::{ConfigError, ConsistencyError};
pub use mesh::{
    Block, CellTopology, Mesh, NodeSet, SideKind, SideSet,
};
pub use settings::{SettingValue, Settings};
