//! Configuration schema and file loading for tabctl.

pub mod loader;
pub mod schema;

pub use {
    loader::{discover_and_load, load_config, save_config},
    schema::TabctlConfig,
};
