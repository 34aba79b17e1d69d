//! Subcommands

pub mod apply;
pub mod convert;
pub mod list;

pub use apply::ApplyCommand;
pub use convert::ConvertCommand;
pub use list::ListCommand;

use std::path::PathBuf;

use crate::apply::SafetensorsDirectory;
use crate::config::LoaderConfig;

/// Adapter directory from the command line or the configuration
pub(crate) fn adapter_source(
    config: &LoaderConfig,
    dir: Option<PathBuf>,
) -> crate::Result<SafetensorsDirectory> {
    let mut config = config.clone();
    if let Some(dir) = dir {
        config.lora_dir = dir;
    }
    SafetensorsDirectory::from_config(&config)
}
