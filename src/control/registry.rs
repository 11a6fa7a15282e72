//! Discovery publication
//!
//! Once the control server is bound, the manager records its reachable
//! `host:port` under the `site-manager` key of the site's shared TOML
//! descriptor so that workers can find it. Other keys in that file are left
//! untouched.

use crate::control::ControlError;
use gethostname::gethostname;
use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

/// Key the manager address is written under
pub const REGISTRY_KEY: &str = "site-manager";

/// The address chosen for publication
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertised {
    pub addr: String,
    /// Why the preferred host name could not be used, if it couldn't
    pub fallback: Option<String>,
}

/// Outcome of discovery publication
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Publication {
    /// Written under the resolved or configured host name
    Published { addr: String, registry: PathBuf },
    /// Written, but under a fallback address because host resolution failed
    Fallback {
        addr: String,
        reason: String,
        registry: PathBuf,
    },
    /// The registry could not be updated
    Failed { addr: String, reason: String },
    /// No registry configured
    Disabled { addr: String },
}

impl Publication {
    /// The address that was (or would have been) published
    pub fn addr(&self) -> &str {
        match self {
            Self::Published { addr, .. }
            | Self::Fallback { addr, .. }
            | Self::Failed { addr, .. }
            | Self::Disabled { addr } => addr,
        }
    }

    pub fn is_published(&self) -> bool {
        matches!(self, Self::Published { .. } | Self::Fallback { .. })
    }
}

/// Picks the address to publish for a server bound at `bound`
///
/// A configured `advertise_host` is used as is. Otherwise the local host name
/// is resolved; if it does not resolve the raw host name is used, and if there
/// is no usable host name at all, the bound IP.
pub async fn advertised_address(advertise_host: Option<&str>, bound: SocketAddr) -> Advertised {
    let port = bound.port();

    if let Some(host) = advertise_host {
        return Advertised {
            addr: format!("{}:{}", host, port),
            fallback: None,
        };
    }

    let hostname = gethostname();
    let Some(hostname) = hostname.to_str().filter(|h| !h.is_empty()) else {
        let ip = reachable_ip(bound.ip());
        return Advertised {
            addr: SocketAddr::new(ip, port).to_string(),
            fallback: Some("local host name is empty or not valid UTF-8".to_string()),
        };
    };

    let reason = match tokio::net::lookup_host((hostname, port)).await {
        Ok(mut addrs) => match addrs.next() {
            Some(_) => None,
            None => Some(format!("host name '{}' resolves to no address", hostname)),
        },
        Err(e) => Some(format!("cannot resolve host name '{}': {}", hostname, e)),
    };

    Advertised {
        addr: format!("{}:{}", hostname, port),
        fallback: reason,
    }
}

/// Writes `advertised` into the registry at `registry`, if one is configured
pub fn publish(registry: Option<&Path>, advertised: &Advertised) -> Publication {
    let addr = advertised.addr.clone();

    let Some(path) = registry else {
        tracing::debug!(%addr, "No discovery registry configured");
        return Publication::Disabled { addr };
    };

    if let Err(e) = write_registry(path, &addr) {
        tracing::warn!(%addr, registry = %path.display(), error = %e, "Discovery publication failed");
        return Publication::Failed {
            addr,
            reason: e.to_string(),
        };
    }

    tracing::info!(%addr, registry = %path.display(), "Published control address");
    match &advertised.fallback {
        Some(reason) => Publication::Fallback {
            addr,
            reason: reason.clone(),
            registry: path.to_path_buf(),
        },
        None => Publication::Published {
            addr,
            registry: path.to_path_buf(),
        },
    }
}

/// Sets the manager address in the registry file, replacing it atomically
fn write_registry(path: &Path, addr: &str) -> Result<(), ControlError> {
    let registry_err = |message: String| ControlError::Registry {
        path: path.to_path_buf(),
        message,
    };

    let mut table = match fs::read_to_string(path) {
        Ok(content) => content
            .parse::<toml::Table>()
            .map_err(|e| registry_err(e.to_string()))?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => toml::Table::new(),
        Err(e) => return Err(registry_err(e.to_string())),
    };

    table.insert(REGISTRY_KEY.to_string(), toml::Value::String(addr.to_string()));
    let content = toml::to_string(&table).map_err(|e| registry_err(e.to_string()))?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("toml.tmp");
    fs::write(&tmp, content)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn reachable_ip(ip: IpAddr) -> IpAddr {
    if ip.is_unspecified() {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    } else {
        ip
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bound() -> SocketAddr {
        "0.0.0.0:9400".parse().unwrap()
    }

    fn read_key(path: &Path) -> Option<String> {
        let table: toml::Table = fs::read_to_string(path).unwrap().parse().unwrap();
        table.get(REGISTRY_KEY).and_then(|v| v.as_str()).map(String::from)
    }

    #[tokio::test]
    async fn test_advertise_host_wins() {
        let advertised = advertised_address(Some("crawler-01.internal"), bound()).await;
        assert_eq!(advertised.addr, "crawler-01.internal:9400");
        assert!(advertised.fallback.is_none());
    }

    #[tokio::test]
    async fn test_local_address_keeps_port() {
        let advertised = advertised_address(None, bound()).await;
        assert!(advertised.addr.ends_with(":9400"));
        assert!(!advertised.addr.starts_with("0.0.0.0"));
    }

    #[test]
    fn test_reachable_ip_replaces_unspecified() {
        assert_eq!(reachable_ip("0.0.0.0".parse().unwrap()), IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(reachable_ip("10.1.2.3".parse().unwrap()), "10.1.2.3".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_publish_creates_registry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sites").join("example.toml");
        let advertised = Advertised {
            addr: "host-a:9400".to_string(),
            fallback: None,
        };

        let publication = publish(Some(&path), &advertised);
        assert!(matches!(publication, Publication::Published { .. }));
        assert_eq!(read_key(&path).as_deref(), Some("host-a:9400"));
    }

    #[test]
    fn test_publish_preserves_other_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("example.toml");
        fs::write(&path, "site-manager = \"old:1\"\nowner = \"crawl-team\"\n").unwrap();

        let advertised = Advertised {
            addr: "host-b:9500".to_string(),
            fallback: Some("cannot resolve".to_string()),
        };
        let publication = publish(Some(&path), &advertised);

        assert!(matches!(publication, Publication::Fallback { .. }));
        assert!(publication.is_published());
        let table: toml::Table = fs::read_to_string(&path).unwrap().parse().unwrap();
        assert_eq!(table["owner"].as_str(), Some("crawl-team"));
        assert_eq!(read_key(&path).as_deref(), Some("host-b:9500"));
    }

    #[test]
    fn test_malformed_registry_is_not_clobbered() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("example.toml");
        fs::write(&path, "this is not toml = = =").unwrap();

        let advertised = Advertised {
            addr: "host-c:1".to_string(),
            fallback: None,
        };
        let publication = publish(Some(&path), &advertised);

        assert!(matches!(publication, Publication::Failed { .. }));
        assert_eq!(fs::read_to_string(&path).unwrap(), "this is not toml = = =");
    }

    #[test]
    fn test_publish_disabled_without_registry() {
        let advertised = Advertised {
            addr: "host-d:1".to_string(),
            fallback: None,
        };
        assert_eq!(
            publish(None, &advertised),
            Publication::Disabled {
                addr: "host-d:1".to_string()
            }
        );
    }
}
