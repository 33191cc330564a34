//! Service types and the keys that identify one running instance.
use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;
use strum_macros::{AsRefStr, Display, EnumIter, EnumString};

/// Numeric identifier of one instance (one database row).
pub type InstanceId = u64;

/// Kind of wrapped daemon. Each kind has exactly one adapter.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    EnumString,
    AsRefStr,
    Display,
    EnumIter,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ServiceType {
    /// Reverse-proxy server, one process per configured server row.
    FrpServer,
    /// Reverse-proxy client, one process per configured client row.
    FrpClient,
    /// FTP server singleton.
    FtpServer,
    /// Web/TLS front singleton.
    WebFront,
    /// User-defined long-running commands.
    Daemon,
}

impl ServiceType {
    /// Whether the type runs one process per numbered instance.
    pub fn is_multi_instance(self) -> bool {
        matches!(self, Self::FrpServer | Self::FrpClient | Self::Daemon)
    }

    /// Extension of the instance configuration file the wrapped daemon reads.
    pub fn config_extension(self) -> &'static str {
        match self {
            Self::FrpServer | Self::FrpClient => "toml",
            Self::FtpServer | Self::WebFront | Self::Daemon => "json",
        }
    }

    /// Every type whose configuration lives in generated files.
    pub fn with_config_files() -> impl Iterator<Item = ServiceType> {
        Self::iter().filter(|ty| *ty != Self::Daemon)
    }
}

/// Unique key of one supervised process: `frpserver.3`, `webfront`, ...
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceKey {
    pub service: ServiceType,
    pub instance: Option<InstanceId>,
}

impl ServiceKey {
    /// Key for a singleton service.
    pub fn singleton(service: ServiceType) -> Self {
        Self {
            service,
            instance: None,
        }
    }

    /// Key for one numbered instance.
    pub fn instance(service: ServiceType, id: InstanceId) -> Self {
        Self {
            service,
            instance: Some(id),
        }
    }

    /// Whether the textual form of this key starts with `prefix`.
    pub fn matches_prefix(&self, prefix: &str) -> bool {
        self.to_string().starts_with(prefix)
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.instance {
            Some(id) => write!(f, "{}.{}", self.service, id),
            None => write!(f, "{}", self.service),
        }
    }
}

impl FromStr for ServiceKey {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let trimmed = raw.trim();
        let (service, instance) = match trimmed.split_once('.') {
            Some((service, id)) => {
                let id = id
                    .parse::<InstanceId>()
                    .map_err(|_| format!("invalid instance id in '{trimmed}'"))?;
                (service, Some(id))
            }
            None => (trimmed, None),
        };

        let service = ServiceType::from_str(service)
            .map_err(|_| format!("unknown service type '{service}'"))?;

        if instance.is_some() && !service.is_multi_instance() {
            return Err(format!("'{service}' does not have numbered instances"));
        }

        Ok(Self { service, instance })
    }
}

impl Serialize for ServiceKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ServiceKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
