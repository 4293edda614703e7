use std::net::{IpAddr, Ipv6Addr};
use std::num::NonZero;
use std::path::{Path, PathBuf};
use std::str::FromStr as _;

use anyhow::Context as _;
use anyhow::bail;
use log::LevelFilter;
use serde::Deserialize;
use serde::Deserializer;

#[macro_export]
macro_rules! nonzero {
    ($exp:expr) => {
        const {
            match std::num::NonZero::new($exp) {
                Some(v) => v,
                None => panic!("Value is zero"),
            }
        }
    };
}

pub(crate) const DEFAULT_BIND_ADDRESS: IpAddr = IpAddr::V6(Ipv6Addr::UNSPECIFIED);
pub(crate) const DEFAULT_BIND_PORT: NonZero<u16> = nonzero!(4000);
pub(crate) const DEFAULT_CONFIGURATION_PATH: &str = "/etc/bmclapi-node-rs/config.toml";
pub(crate) const DEFAULT_LOG_LEVEL: LevelFilter = LevelFilter::Info;
pub(crate) const DEFAULT_LOGSTORE_CAPACITY: NonZero<usize> = nonzero!(100);
pub(crate) const DEFAULT_BUFFER_SLOTS: NonZero<usize> = nonzero!(8);
pub(crate) const DEFAULT_STORAGE_ROOT: &str = "/var/cache/bmclapi-node-rs";
pub(crate) const DEFAULT_STORAGE_WEIGHT: u32 = 100;

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub(crate) enum StorageKind {
    Local,
    Mount,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct StorageConfig {
    /// Backend flavour.
    #[serde(rename = "type")]
    pub(crate) kind: StorageKind,

    /// Stable name used in logs and access annotations.
    pub(crate) name: String,

    /// Filesystem root of the backend.
    pub(crate) path: PathBuf,

    /// Relative chance of being the first backend tried. Zero keeps the
    /// backend as a fallback target only.
    #[serde(default = "default_storage_weight")]
    pub(crate) weight: u32,

    /// Public base URL of a mount backend, used for redirect serving.
    #[serde(default)]
    pub(crate) public_url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct Config {
    /// Minimum log level severity to output.
    /// Can be overridden via program options.
    #[serde(default = "default_log_level", deserialize_with = "from_level_name")]
    pub(crate) log_level: LevelFilter,

    /// Address to listen on.
    #[serde(default = "default_bind_addr")]
    pub(crate) bind_addr: IpAddr,

    /// Port to listen on.
    #[serde(default = "default_bind_port")]
    pub(crate) bind_port: NonZero<u16>,

    /// Shared secret the authority signs download URLs with.
    #[serde(default)]
    pub(crate) cluster_secret: String,

    /// Hostnames this node is published under. Requests reaching the node
    /// under any other name are redirected to the first entry. An empty list
    /// disables the redirect.
    #[serde(default)]
    pub(crate) public_hosts: Vec<String>,

    /// Port used in redirects to the public host.
    #[serde(default = "default_bind_port")]
    pub(crate) public_port: NonZero<u16>,

    /// Whether X-Forwarded-For from the fronting proxy is trustworthy.
    #[serde(default)]
    pub(crate) trusted_x_forwarded_for: bool,

    /// Whether the dashboard is served under /dashboard/.
    #[serde(default = "default_true")]
    pub(crate) dashboard_enable: bool,

    /// Disables the public-host redirect entirely.
    #[serde(default)]
    pub(crate) do_not_redirect_to_public_host: bool,

    /// Number of pooled copy buffers, bounding concurrent local transfers.
    #[serde(default = "default_buffer_slots")]
    pub(crate) buffer_slots: NonZero<usize>,

    /// Number of stored error and warning log messages.
    #[serde(default = "default_logstore_capacity")]
    pub(crate) logstore_capacity: NonZero<usize>,

    /// Storage backends in walk order. The order is fixed for the lifetime
    /// of the node.
    #[serde(default = "default_storages")]
    pub(crate) storages: Vec<StorageConfig>,
}

fn default_log_level() -> LevelFilter {
    DEFAULT_LOG_LEVEL
}

fn default_bind_addr() -> IpAddr {
    DEFAULT_BIND_ADDRESS
}

fn default_bind_port() -> NonZero<u16> {
    DEFAULT_BIND_PORT
}

fn default_true() -> bool {
    true
}

fn default_buffer_slots() -> NonZero<usize> {
    DEFAULT_BUFFER_SLOTS
}

fn default_logstore_capacity() -> NonZero<usize> {
    DEFAULT_LOGSTORE_CAPACITY
}

fn default_storage_weight() -> u32 {
    DEFAULT_STORAGE_WEIGHT
}

fn default_storages() -> Vec<StorageConfig> {
    vec![StorageConfig {
        kind: StorageKind::Local,
        name: String::from("local"),
        path: PathBuf::from(DEFAULT_STORAGE_ROOT),
        weight: DEFAULT_STORAGE_WEIGHT,
        public_url: None,
    }]
}

fn from_level_name<'de, D>(deserializer: D) -> Result<LevelFilter, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error as _;
    let s: String = Deserialize::deserialize(deserializer)?;

    LevelFilter::from_str(&s).map_err(D::Error::custom)
}

impl Config {
    pub(crate) fn default() -> Self {
        Self {
            log_level: DEFAULT_LOG_LEVEL,
            bind_addr: DEFAULT_BIND_ADDRESS,
            bind_port: DEFAULT_BIND_PORT,
            cluster_secret: String::new(),
            public_hosts: Vec::new(),
            public_port: DEFAULT_BIND_PORT,
            trusted_x_forwarded_for: false,
            dashboard_enable: true,
            do_not_redirect_to_public_host: false,
            buffer_slots: DEFAULT_BUFFER_SLOTS,
            logstore_capacity: DEFAULT_LOGSTORE_CAPACITY,
            storages: default_storages(),
        }
    }

    /// Loads the configuration. The second element is true when the default
    /// path was absent and built-in defaults were used instead.
    pub(crate) fn new(file: &Path) -> anyhow::Result<(Self, bool)> {
        let content = match std::fs::read_to_string(file) {
            Ok(c) => c,
            Err(err)
                if err.kind() == std::io::ErrorKind::NotFound
                    && file == Path::new(DEFAULT_CONFIGURATION_PATH) =>
            {
                let mut config = Self::default();
                config.validate()?;
                return Ok((config, true));
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("Failed to read file `{}`", file.display()));
            }
        };

        let mut config: Self = toml::from_str(&content).context("Failed to parse configuration")?;

        config.validate()?;

        Ok((config, false))
    }

    fn validate(&mut self) -> anyhow::Result<()> {
        for host in &mut self.public_hosts {
            *host = host.to_ascii_lowercase();
            if host.is_empty() {
                bail!("Empty public host entry");
            }
        }

        if self.storages.is_empty() {
            bail!("At least one storage backend must be configured");
        }

        let mut total: u32 = 0;
        for (pos, storage) in self.storages.iter_mut().enumerate() {
            if storage.name.is_empty() {
                bail!("Storage at position {pos} has an empty name");
            }

            total = match total.checked_add(storage.weight) {
                Some(v) => v,
                None => bail!("Storage weights overflow"),
            };

            match storage.kind {
                StorageKind::Local => {
                    if storage.public_url.is_some() {
                        bail!(
                            "Storage {} is local and must not set public_url",
                            storage.name
                        );
                    }
                }
                StorageKind::Mount => match &mut storage.public_url {
                    Some(url) => {
                        while url.ends_with('/') {
                            url.pop();
                        }
                        if url.is_empty() {
                            bail!("Storage {} has an empty public_url", storage.name);
                        }
                    }
                    None => bail!("Storage {} is a mount and requires public_url", storage.name),
                },
            }
        }

        for (pos, storage) in self.storages.iter().enumerate() {
            if self.storages[pos + 1..]
                .iter()
                .any(|other| other.name == storage.name)
            {
                bail!("Duplicate storage name {}", storage.name);
            }
        }

        Ok(())
    }

    #[must_use]
    pub(crate) fn storage_weights(&self) -> Vec<u32> {
        self.storages.iter().map(|s| s.weight).collect()
    }
}
