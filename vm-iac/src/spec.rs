//! Typed VM spec and provider variable tables.
//!
//! Requests carry their spec as an opaque JSON document. Before anything is
//! rendered or executed it is parsed into [`VmSpec`], which applies defaults
//! and rejects malformed values up front.

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{IacError, Result};

const DEFAULT_CPU: u32 = 1;
const DEFAULT_MEMORY_MB: u64 = 1024;
const DEFAULT_DISK_GB: f64 = 20.0;

/// Generic VM spec shared by every provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmSpec {
    pub name: String,

    #[serde(default = "default_cpu")]
    pub cpu: u32,

    /// Memory in MiB.
    #[serde(default = "default_memory")]
    pub memory: u64,

    /// Disk size in GiB.
    #[serde(default = "default_disk")]
    pub disk: f64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_image: Option<String>,

    /// Pins the VM to a specific address instead of drawing one from the pool.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,

    /// Provider-specific keys passed through untouched.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

fn default_cpu() -> u32 {
    DEFAULT_CPU
}

fn default_memory() -> u64 {
    DEFAULT_MEMORY_MB
}

fn default_disk() -> f64 {
    DEFAULT_DISK_GB
}

fn hostname_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9]([A-Za-z0-9-]{0,61}[A-Za-z0-9])?$").expect("valid hostname regex")
    })
}

/// Extra keys become HCL variable and input names.
fn identifier_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_-]*$").expect("valid identifier regex"))
}

impl VmSpec {
    /// Parse and validate a spec document.
    pub fn from_value(value: &Value) -> Result<Self> {
        if !value.is_object() {
            return Err(IacError::InvalidSpec(
                "spec must be a JSON object".to_string(),
            ));
        }

        let spec: VmSpec = serde_json::from_value(value.clone())
            .map_err(|e| IacError::InvalidSpec(e.to_string()))?;
        spec.validate()?;
        Ok(spec)
    }

    pub fn validate(&self) -> Result<()> {
        if !hostname_pattern().is_match(&self.name) {
            return Err(IacError::InvalidSpec(format!(
                "name '{}' is not a valid hostname",
                self.name
            )));
        }
        if self.cpu == 0 {
            return Err(IacError::InvalidSpec("cpu must be at least 1".to_string()));
        }
        if self.memory == 0 {
            return Err(IacError::InvalidSpec(
                "memory must be at least 1 MiB".to_string(),
            ));
        }
        if !self.disk.is_finite() || self.disk <= 0.0 {
            return Err(IacError::InvalidSpec(format!(
                "disk must be a positive size, got {}",
                self.disk
            )));
        }
        if let Some(key) = self
            .extra
            .keys()
            .find(|key| !identifier_pattern().is_match(key))
        {
            return Err(IacError::InvalidSpec(format!(
                "key {key:?} is not a valid variable name"
            )));
        }
        if let Some(address) = &self.ip_address {
            IpAddr::from_str(address).map_err(|_| {
                IacError::InvalidSpec(format!("ip_address '{address}' is not an IP address"))
            })?;
        }
        Ok(())
    }

    pub fn pinned_address(&self) -> Option<IpAddr> {
        self.ip_address
            .as_deref()
            .and_then(|s| IpAddr::from_str(s).ok())
    }
}

/// Provider-specific variable names for the generic spec keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VariableNames {
    pub name: &'static str,
    pub cpu: &'static str,
    pub memory: &'static str,
    pub disk: &'static str,
    pub network: &'static str,
    pub os_image: &'static str,
}

/// Providers that can be rendered without a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    Proxmox,
    VSphere,
    OpenStack,
    Libvirt,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Proxmox => "proxmox",
            ProviderKind::VSphere => "vsphere",
            ProviderKind::OpenStack => "openstack",
            ProviderKind::Libvirt => "libvirt",
        }
    }

    pub fn variable_names(&self) -> VariableNames {
        match self {
            ProviderKind::Proxmox => VariableNames {
                name: "vm_name",
                cpu: "cpu",
                memory: "memory",
                disk: "disk_size",
                network: "network_bridge",
                os_image: "template_name",
            },
            ProviderKind::VSphere => VariableNames {
                name: "vm_name",
                cpu: "num_cpus",
                memory: "memory",
                disk: "disk_size_gb",
                network: "network_name",
                os_image: "template_name",
            },
            ProviderKind::OpenStack => VariableNames {
                name: "instance_name",
                cpu: "vcpus",
                memory: "ram_mb",
                disk: "volume_size",
                network: "network_name",
                os_image: "image_name",
            },
            ProviderKind::Libvirt => VariableNames {
                name: "domain_name",
                cpu: "vcpu",
                memory: "memory_mb",
                disk: "disk_size_gb",
                network: "network_name",
                os_image: "base_image",
            },
        }
    }

    pub(crate) fn template_name(&self) -> &'static str {
        match self {
            ProviderKind::Proxmox => "proxmox.tf",
            ProviderKind::VSphere => "vsphere.tf",
            ProviderKind::OpenStack => "openstack.tf",
            ProviderKind::Libvirt => "libvirt.tf",
        }
    }
}

impl FromStr for ProviderKind {
    type Err = IacError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pve" | "proxmox" => Ok(ProviderKind::Proxmox),
            "vsphere" | "vmware" => Ok(ProviderKind::VSphere),
            "openstack" => Ok(ProviderKind::OpenStack),
            "libvirt" | "kvm" => Ok(ProviderKind::Libvirt),
            other => Err(IacError::UnknownProvider(other.to_string())),
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults_applied() {
        let spec = VmSpec::from_value(&json!({"name": "web1"})).unwrap();
        assert_eq!(spec.cpu, 1);
        assert_eq!(spec.memory, 1024);
        assert_eq!(spec.disk, 20.0);
        assert!(spec.extra.is_empty());
    }

    #[test]
    fn test_extra_keys_are_kept() {
        let spec =
            VmSpec::from_value(&json!({"name": "web1", "cpu": 4, "target_node": "pve-02"}))
                .unwrap();
        assert_eq!(spec.cpu, 4);
        assert_eq!(spec.extra.get("target_node"), Some(&json!("pve-02")));
    }

    #[test]
    fn test_rejects_malformed_specs() {
        assert!(VmSpec::from_value(&json!([1, 2])).is_err());
        assert!(VmSpec::from_value(&json!({"cpu": 2})).is_err());
        assert!(VmSpec::from_value(&json!({"name": "bad name"})).is_err());
        assert!(VmSpec::from_value(&json!({"name": "db1", "cpu": 0})).is_err());
        assert!(VmSpec::from_value(&json!({"name": "db1", "cpu": "two"})).is_err());
        assert!(VmSpec::from_value(&json!({"name": "db1", "disk": -5})).is_err());
        assert!(VmSpec::from_value(&json!({"name": "db1", "ip_address": "10.0.0"})).is_err());
    }

    #[test]
    fn test_extra_keys_must_be_identifiers() {
        assert!(VmSpec::from_value(&json!({"name": "db1", "target-node": "pve"})).is_ok());
        assert!(VmSpec::from_value(&json!({"name": "db1", "_tag": 1})).is_ok());

        for key in ["x = 1\n}", "1st", "a b", "", "key\"", "a.b"] {
            let mut doc = json!({"name": "db1"});
            doc[key] = json!(1);
            assert!(
                matches!(VmSpec::from_value(&doc), Err(IacError::InvalidSpec(_))),
                "accepted {key:?}"
            );
        }
    }

    #[test]
    fn test_provider_aliases() {
        assert_eq!("pve".parse::<ProviderKind>().unwrap(), ProviderKind::Proxmox);
        assert_eq!("VMware".parse::<ProviderKind>().unwrap(), ProviderKind::VSphere);
        assert_eq!("kvm".parse::<ProviderKind>().unwrap(), ProviderKind::Libvirt);
        assert!(matches!(
            "aws".parse::<ProviderKind>(),
            Err(IacError::UnknownProvider(p)) if p == "aws"
        ));
    }
}
