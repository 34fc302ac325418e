use crate::error::{Error, ErrorKind};
use kmanga_config::Config;
use kmanga_mobi::{Adjust, Filters, Resolution};
use std::path::PathBuf;
use std::time::Duration;

/// Everything a build job needs from the configuration.
#[derive(Debug, Clone)]
pub struct BuildSettings {
    /// Staging directories are created here, one per build.
    pub work_dir: PathBuf,
    /// Byte budget of a single volume.
    pub max_bytes: u64,
    pub resolution: Resolution,
    pub adjust: Adjust,
    pub filters: Filters,
    pub build_timeout: Duration,
    pub delivery_timeout: Duration,
}

impl TryFrom<&Config> for BuildSettings {
    type Error = Error;

    fn try_from(config: &Config) -> Result<Self, Self::Error> {
        let adjust = config.build.adjust.parse().map_err(|e| Error::from(ErrorKind::InvalidArgument(e)))?;
        Ok(Self {
            work_dir: config.build.work_dir.clone(),
            max_bytes: config.build.max_bytes,
            resolution: Resolution { width: config.build.width, height: config.build.height },
            adjust,
            filters: Filters { margin: config.build.trim_margin, footer: config.build.remove_footer },
            build_timeout: config.build.timeout(),
            delivery_timeout: config.delivery.timeout(),
        })
    }
}
