//! Layered configuration for kmanga.
//!
//! Loading precedence (highest wins):
//! 1. Environment variables prefixed with `KMANGA_` (nested keys joined with
//!    `__`, e.g. `KMANGA_BUILD__MAX_BYTES`)
//! 2. The configuration file: the explicit path, else `KMANGA_CONFIG`, else
//!    `config.toml` in the platform configuration directory (if it exists).
//!    TOML, YAML and JSON are recognized by extension.
//! 3. Built-in defaults

pub mod error;

use crate::error::{ErrorKind, Result};
use directories::ProjectDirs;
use figment::Figment;
use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const ENV_PREFIX: &str = "KMANGA_";
const ENV_CONFIG: &str = "KMANGA_CONFIG";

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "", "kmanga")
}

fn data_dir() -> PathBuf {
    project_dirs().map(|dirs| dirs.data_dir().to_path_buf()).unwrap_or_else(|| PathBuf::from("kmanga"))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    pub cache: CacheConfig,
    pub images: ImagesConfig,
    pub build: BuildConfig,
    pub delivery: DeliveryConfig,
    pub catalog: CatalogConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotsConfig {
    /// Number of entries above which `free` evicts.
    pub max_slots: u64,
    /// Number of entries evicted per `free` pass.
    pub evict_batch: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Directory holding `issue.db`, `mobi.db`, their lock files and the
    /// `data/` content store.
    pub root: PathBuf,
    pub issue: SlotsConfig,
    pub document: SlotsConfig,
    /// Age in seconds past which `clean` evicts an entry.
    pub ttl_seconds: u64,
}
impl CacheConfig {
    pub fn issue_index(&self) -> PathBuf {
        self.root.join("issue.db")
    }

    pub fn document_index(&self) -> PathBuf {
        self.root.join("mobi.db")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImagesConfig {
    /// Root the issue cache resolves image paths against.
    pub root: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildConfig {
    /// Where containers are staged.
    pub work_dir: PathBuf,
    /// Byte budget of one volume.
    pub max_bytes: u64,
    pub width: u32,
    pub height: u32,
    /// How pages are fitted to the resolution: `none`, `resize`, `fill` or
    /// `rotate`.
    pub adjust: String,
    /// Crop uniform page borders.
    pub trim_margin: bool,
    /// Drop scanlator footers.
    pub remove_footer: bool,
    /// kindlegen binary; searched on `PATH` when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kindlegen: Option<PathBuf>,
    pub timeout_seconds: u64,
}
impl BuildConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Directory outgoing messages are written to.
    pub outbox: PathBuf,
    pub timeout_seconds: u64,
}
impl DeliveryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogConfig {
    pub path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        let data = data_dir();
        Self {
            cache: CacheConfig {
                root: data.join("cache"),
                issue: SlotsConfig { max_slots: 4096, evict_batch: 1024 },
                document: SlotsConfig { max_slots: 1024, evict_batch: 128 },
                ttl_seconds: 15 * 24 * 60 * 60,
            },
            images: ImagesConfig { root: data.join("images") },
            build: BuildConfig {
                work_dir: data.join("build"),
                max_bytes: 40 * 1024 * 1024,
                width: 800,
                height: 1280,
                adjust: "resize".to_string(),
                trim_margin: false,
                remove_footer: false,
                kindlegen: None,
                timeout_seconds: 2 * 60 * 60,
            },
            delivery: DeliveryConfig { outbox: data.join("outbox"), timeout_seconds: 15 * 60 },
            catalog: CatalogConfig { path: data.join("catalog.db") },
        }
    }
}

impl Config {
    /// Loads and validates the configuration. See the [module docs](crate)
    /// for the precedence of sources.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let file = file
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(ENV_CONFIG).map(PathBuf::from))
            .or_else(|| {
                project_dirs().map(|dirs| dirs.config_dir().join("config.toml")).filter(|path| path.is_file())
            });
        Self::figment(file.as_deref())?
            .extract::<Self>()
            .map_err(|e| exn::Exn::from(ErrorKind::Load(e.to_string())))
            .and_then(|config| config.validate().map(|()| config))
    }

    fn figment(file: Option<&Path>) -> Result<Figment> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if let Some(file) = file {
            tracing::debug!(path = %file.display(), "Loading configuration file");
            if !file.is_file() {
                exn::bail!(ErrorKind::Load(format!("no such file: {}", file.display())));
            }
            figment = match file.extension().and_then(|e| e.to_str()) {
                Some("yaml" | "yml") => figment.merge(Yaml::file(file)),
                Some("json") => figment.merge(Json::file(file)),
                _ => figment.merge(Toml::file(file)),
            };
        }
        let env = Env::prefixed(ENV_PREFIX)
            .ignore(&["config"])
            .map(|key| key.as_str().to_lowercase().into())
            .split("__");
        Ok(figment.merge(env))
    }

    /// Rejects budgets and dimensions that would make every build fail.
    pub fn validate(&self) -> Result<()> {
        let checks = [
            (self.cache.issue.max_slots == 0, "cache.issue.max_slots must be positive"),
            (self.cache.issue.evict_batch == 0, "cache.issue.evict_batch must be positive"),
            (self.cache.document.max_slots == 0, "cache.document.max_slots must be positive"),
            (self.cache.document.evict_batch == 0, "cache.document.evict_batch must be positive"),
            (self.build.max_bytes == 0, "build.max_bytes must be positive"),
            (self.build.width == 0 || self.build.height == 0, "build resolution must be positive"),
            (self.build.timeout_seconds == 0, "build.timeout_seconds must be positive"),
            (self.delivery.timeout_seconds == 0, "delivery.timeout_seconds must be positive"),
        ];
        match checks.into_iter().find(|(failed, _)| *failed) {
            Some((_, message)) => exn::bail!(ErrorKind::Invalid(message.to_string())),
            None => Ok(()),
        }
    }
}
