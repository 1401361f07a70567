//! Device Manifest
//!
//! Declares the properties, groups and notifications of a device:
//!
//! ```toml
//! [telemetry]
//! properties_period_ms = 100
//!
//! [[property]]
//! name = "temperature"
//! scale = 10
//! decimals = 1
//!
//! [[group]]
//! period_ms = 5000
//! members = ["temperature"]
//! ```
//!
//! The `[telemetry]` table is read separately, through the layered config.

use std::path::Path;

use anyhow::{Context, Result, bail};
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};
use tracing::info;

use telemetry::{Telemetry, TelemetryConfig};

/// Entities declared by a manifest file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default, rename = "property")]
    pub properties: Vec<PropertySpec>,
    #[serde(default, rename = "group")]
    pub groups: Vec<GroupSpec>,
    #[serde(default, rename = "notification")]
    pub notifications: Vec<NotificationSpec>,
}

/// Kind of a declared property
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PropertyType {
    #[default]
    Number,
    String,
}

/// `[[property]]`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropertySpec {
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: PropertyType,
    #[serde(default = "default_scale")]
    pub scale: u16,
    #[serde(default)]
    pub decimals: u8,
    #[serde(default = "default_signed")]
    pub signed: bool,
    /// Buffer size of string properties
    #[serde(default = "default_max_len")]
    pub max_len: usize,
    #[serde(default)]
    pub debounce_ms: u32,
    #[serde(default)]
    pub disabled: bool,
}

/// `[[group]]`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupSpec {
    pub period_ms: u32,
    #[serde(default = "default_only_if_changed")]
    pub only_if_changed: bool,
    /// Property names, in publication order
    #[serde(default)]
    pub members: Vec<String>,
}

/// `[[notification]]`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationSpec {
    pub name: String,
    pub channel: String,
    #[serde(default = "default_template")]
    pub template: String,
    #[serde(default = "default_scale")]
    pub scale: u16,
    #[serde(default)]
    pub decimals: u8,
    #[serde(default = "default_signed")]
    pub signed: bool,
    #[serde(default)]
    pub value_map: Vec<String>,
}

fn default_scale() -> u16 {
    1
}

fn default_signed() -> bool {
    true
}

fn default_max_len() -> usize {
    32
}

fn default_only_if_changed() -> bool {
    true
}

fn default_template() -> String {
    "%s:%u:%s".to_string()
}

impl Manifest {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).context("Invalid manifest")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read manifest {}", path.display()))?;
        Self::from_toml_str(&content)
    }

    /// Create every declared entity. Stops at the first rejected declaration.
    pub fn apply(&self, telemetry: &Telemetry) -> Result<()> {
        for spec in &self.properties {
            let id = match spec.kind {
                PropertyType::Number => {
                    telemetry.create_property(&spec.name, spec.scale, spec.decimals, spec.signed)
                }
                PropertyType::String => telemetry.create_string_property(&spec.name, spec.max_len),
            }
            .with_context(|| format!("Property '{}'", spec.name))?;

            if spec.debounce_ms > 0 {
                telemetry.set_property_debounce(id, spec.debounce_ms);
            }
            if spec.disabled {
                telemetry.set_property_disabled(id, true);
            }
        }

        for (index, spec) in self.groups.iter().enumerate() {
            let group = telemetry
                .create_group(spec.period_ms, spec.only_if_changed)
                .with_context(|| format!("Group #{}", index + 1))?;
            for member in &spec.members {
                let Some(property) = telemetry.find_property(member) else {
                    bail!("Group #{} references unknown property '{}'", index + 1, member);
                };
                if !telemetry.add_to_group(property, group) {
                    bail!("Group #{} cannot take property '{}'", index + 1, member);
                }
            }
        }

        for spec in &self.notifications {
            telemetry
                .create_notification_with_value_map(
                    &spec.name,
                    &spec.channel,
                    &spec.template,
                    spec.scale,
                    spec.decimals,
                    spec.signed,
                    spec.value_map.clone(),
                )
                .with_context(|| format!("Notification '{}'", spec.name))?;
        }

        info!(
            properties = telemetry.property_count(),
            groups = telemetry.group_count(),
            notifications = telemetry.notification_count(),
            "Manifest applied"
        );
        Ok(())
    }
}

/// Layer the built-in defaults, the manifest's `[telemetry]` table and
/// `TELEMETRY_*` environment variables, in increasing priority.
pub fn layered_config(manifest_path: &Path) -> Result<TelemetryConfig> {
    let config: TelemetryConfig = Figment::from(Serialized::defaults(TelemetryConfig::default()))
        .merge(Figment::from(Toml::file(manifest_path)).focus("telemetry"))
        .merge(Env::prefixed("TELEMETRY_"))
        .extract()
        .context("Invalid telemetry settings")?;
    config.validate()?;
    Ok(config)
}
