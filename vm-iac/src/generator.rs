//! Configuration generator.
//!
//! Turns a validated [`VmSpec`] into the files the provisioning tool consumes:
//!
//! - **Provider mode** (no module selected): `main.tf` with the provider,
//!   variable declarations, resource and outputs, plus `terraform.tfvars`
//!   using the provider's variable names.
//! - **Module mode**: `terragrunt.hcl` pointing at the rewritten module source,
//!   with generic inputs. Its presence makes the executor use Terragrunt.
//!
//! Credentials are never rendered into these files. They reach the tool as
//! `TF_VAR_*` environment entries (see [`crate::workdir`]).

use std::net::IpAddr;
use std::sync::OnceLock;

use serde::Serialize;
use serde_json::Value;
use tera::{Context as TeraContext, Tera};
use url::Url;

use crate::error::{IacError, Result};
use crate::hcl::{self, Assignments};
use crate::module_source::fetchable_source;
use crate::secret::Secret;
use crate::spec::{ProviderKind, VmSpec};
use crate::workdir::STATE_FILE;

pub const PROVIDER_DESCRIPTOR_FILE: &str = "main.tf";
pub const MODULE_DESCRIPTOR_FILE: &str = "terragrunt.hcl";
pub const VARIABLES_FILE: &str = "terraform.tfvars";
pub const REGISTRY_CONFIG_FILE: &str = ".terraformrc";

/// Inputs fed to every module; the credential ones arrive via environment.
const SECRET_VARIABLES: [&str; 3] = ["api_username", "api_password", "api_token"];

static TEMPLATES: OnceLock<Tera> = OnceLock::new();

fn templates() -> &'static Tera {
    TEMPLATES.get_or_init(|| {
        let mut tera = Tera::default();
        tera.add_raw_templates(vec![
            ("_variables.tf", include_str!("templates/_variables.tf.j2")),
            ("proxmox.tf", include_str!("templates/proxmox.tf.j2")),
            ("vsphere.tf", include_str!("templates/vsphere.tf.j2")),
            ("openstack.tf", include_str!("templates/openstack.tf.j2")),
            ("libvirt.tf", include_str!("templates/libvirt.tf.j2")),
            ("terragrunt.hcl", include_str!("templates/terragrunt.hcl.j2")),
            ("terraformrc", include_str!("templates/terraformrc.j2")),
        ])
        .expect("Failed to load IaC templates");
        tera
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigMode {
    Provider,
    Module,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleRef {
    pub source: String,
    pub version: Option<String>,
}

/// Address drawn from an IP pool for this VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkAssignment {
    pub address: IpAddr,
    pub prefix_len: Option<u8>,
    pub gateway: Option<IpAddr>,
}

#[derive(Debug, Clone)]
pub struct RegistryMirror {
    pub url: String,
    pub token: Option<Secret>,
}

#[derive(Debug, Clone)]
pub struct GeneratorInput<'a> {
    pub request_id: &'a str,
    pub provider: &'a str,
    pub environment: &'a str,
    pub spec: &'a VmSpec,
    pub module: Option<&'a ModuleRef>,
    pub endpoint: Option<&'a str>,
    pub network: Option<&'a NetworkAssignment>,
    pub registry: Option<&'a RegistryMirror>,
}

/// Rendered tool-native configuration for one request.
#[derive(Debug, Clone)]
pub struct RenderedConfig {
    pub mode: ConfigMode,
    pub descriptor_file: String,
    pub descriptor: String,
    pub variables: String,
    /// `.terraformrc` contents; holds the mirror token so it is never committed.
    pub registry_config: Option<String>,
}

impl RenderedConfig {
    /// Files that belong in version control, as `(file name, contents)`.
    pub fn committed_files(&self) -> Vec<(&str, &str)> {
        vec![
            (self.descriptor_file.as_str(), self.descriptor.as_str()),
            (VARIABLES_FILE, self.variables.as_str()),
        ]
    }

    /// Rebuild from a stored descriptor and variables document.
    pub fn from_stored(
        descriptor_file: &str,
        descriptor: String,
        variables: String,
        registry: Option<&RegistryMirror>,
    ) -> Result<Self> {
        let mode = if descriptor_file == MODULE_DESCRIPTOR_FILE {
            ConfigMode::Module
        } else {
            ConfigMode::Provider
        };
        Ok(Self {
            mode,
            descriptor_file: descriptor_file.to_string(),
            descriptor,
            variables,
            registry_config: registry.map(render_registry_config).transpose()?,
        })
    }
}

#[derive(Serialize)]
struct VariableDecl {
    name: String,
    sensitive: bool,
    optional: bool,
}

/// Render the configuration for a request.
pub fn render(input: &GeneratorInput<'_>) -> Result<RenderedConfig> {
    input.spec.validate()?;
    let registry_config = input.registry.map(render_registry_config).transpose()?;

    let mut rendered = match input.module {
        Some(module) => render_module(input, module)?,
        None => render_provider(input)?,
    };
    rendered.registry_config = registry_config;
    Ok(rendered)
}

fn render_provider(input: &GeneratorInput<'_>) -> Result<RenderedConfig> {
    let kind: ProviderKind = input.provider.parse()?;
    let names = kind.variable_names();
    let spec = input.spec;

    let mut vars = Assignments::new();
    vars.set("api_endpoint", input.endpoint.unwrap_or_default());
    vars.set("environment", input.environment);
    vars.set(names.name, spec.name.as_str());
    vars.set(names.cpu, spec.cpu);
    vars.set(names.memory, spec.memory);
    vars.set(names.disk, number(spec.disk));
    if let Some(network) = &spec.network {
        vars.set(names.network, network.as_str());
    }
    if let Some(image) = &spec.os_image {
        vars.set(names.os_image, image.as_str());
    }
    set_network_vars(&mut vars, input.network);
    for (key, value) in &spec.extra {
        // Extras may not shadow mapped keys or credentials.
        if vars.contains(key) || SECRET_VARIABLES.contains(&key.as_str()) {
            continue;
        }
        vars.set(key.clone(), value.clone());
    }

    let mut declarations: Vec<VariableDecl> = vars
        .names()
        .map(|name| VariableDecl {
            name: name.to_string(),
            sensitive: false,
            optional: name == "api_endpoint",
        })
        .collect();
    declarations.extend(SECRET_VARIABLES.iter().map(|name| VariableDecl {
        name: name.to_string(),
        sensitive: true,
        optional: true,
    }));

    let mut context = TeraContext::new();
    context.insert("request_id", &hcl::comment_text(input.request_id));
    context.insert("environment", &hcl::comment_text(input.environment));
    context.insert("variables", &declarations);
    context.insert(
        "names",
        &serde_json::json!({
            "name": names.name,
            "cpu": names.cpu,
            "memory": names.memory,
            "disk": names.disk,
            "network": names.network,
            "os_image": names.os_image,
        }),
    );
    context.insert("has_network", &spec.network.is_some());
    context.insert("has_os_image", &spec.os_image.is_some());
    context.insert("has_address", &input.network.is_some());
    for extra in ["target_node", "datacenter", "cluster", "datastore", "flavor"] {
        context.insert(format!("has_{extra}"), &vars.contains(extra));
    }

    let descriptor = templates().render(kind.template_name(), &context)?;

    Ok(RenderedConfig {
        mode: ConfigMode::Provider,
        descriptor_file: PROVIDER_DESCRIPTOR_FILE.to_string(),
        descriptor,
        variables: vars.render(),
        registry_config: None,
    })
}

fn render_module(input: &GeneratorInput<'_>, module: &ModuleRef) -> Result<RenderedConfig> {
    let spec = input.spec;

    let mut vars = Assignments::new();
    vars.set("api_endpoint", input.endpoint.unwrap_or_default());
    vars.set("environment", input.environment);
    vars.set("provider", input.provider);
    vars.set("name", spec.name.as_str());
    vars.set("cpu", spec.cpu);
    vars.set("memory", spec.memory);
    vars.set("disk", number(spec.disk));
    if let Some(network) = &spec.network {
        vars.set("network", network.as_str());
    }
    if let Some(image) = &spec.os_image {
        vars.set("os_image", image.as_str());
    }
    set_network_vars(&mut vars, input.network);
    for (key, value) in &spec.extra {
        if vars.contains(key) || SECRET_VARIABLES.contains(&key.as_str()) {
            continue;
        }
        vars.set(key.clone(), value.clone());
    }

    let source = fetchable_source(&module.source, module.version.as_deref());

    let mut context = TeraContext::new();
    context.insert("request_id", &hcl::comment_text(input.request_id));
    context.insert("environment", &hcl::comment_text(input.environment));
    context.insert("source", &hcl::quote(&source));
    context.insert("state_file", STATE_FILE);
    context.insert("inputs", &vars.lines());

    let descriptor = templates().render("terragrunt.hcl", &context)?;

    Ok(RenderedConfig {
        mode: ConfigMode::Module,
        descriptor_file: MODULE_DESCRIPTOR_FILE.to_string(),
        descriptor,
        variables: vars.render(),
        registry_config: None,
    })
}

fn set_network_vars(vars: &mut Assignments, network: Option<&NetworkAssignment>) {
    let Some(network) = network else {
        return;
    };
    vars.set("ip_address", network.address.to_string());
    if let Some(prefix) = network.prefix_len {
        vars.set("ip_prefix_length", prefix);
    }
    vars.set(
        "gateway",
        network.gateway.map(|g| g.to_string()).unwrap_or_default(),
    );
}

fn number(f: f64) -> Value {
    serde_json::Number::from_f64(f)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

fn render_registry_config(registry: &RegistryMirror) -> Result<String> {
    let url = Url::parse(&registry.url)
        .map_err(|e| IacError::InvalidSpec(format!("registry url '{}': {e}", registry.url)))?;

    let mut context = TeraContext::new();
    context.insert("url", &hcl::quote(url.as_str()));
    match (&registry.token, url.host_str()) {
        (Some(token), Some(host)) if !token.is_empty() => {
            context.insert("host", host);
            context.insert("token", &hcl::quote(token.expose()));
        }
        _ => {
            context.insert("host", &false);
        }
    }

    Ok(templates().render("terraformrc", &context)?)
}
