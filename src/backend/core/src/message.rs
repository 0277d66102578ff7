//! The message envelope carried through queues and returned by modules.
//!
//! A message is either a system message (its `module_class` is
//! [`SYSTEM_MODULE_CLASS`] and its payload is a [`SystemCommand`]) or a
//! module-addressed message resolved by `(plugin_id, module_class)`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{GsmError, Result};

/// Module class reserved for messages handled by the runtime itself.
pub const SYSTEM_MODULE_CLASS: &str = "gsm.system.ServerInstance";

/// Attribute set on replies, holding the id of the request.
pub const IN_REPLY_TO: &str = "inReplyTo";

// ═══════════════════════════════════════════════════════════════════════════════
// Identifiers
// ═══════════════════════════════════════════════════════════════════════════════

/// Numeric plugin identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PluginId(pub i64);

impl fmt::Display for PluginId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for PluginId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// Plugin version such as `1.0` or `2.5`.
///
/// Equality and hashing use the canonical textual form so that `1` and
/// `1.0` name the same version.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PluginVersion(pub f64);

impl PluginVersion {
    pub fn new(version: f64) -> Self {
        Self(version)
    }

    pub fn value(&self) -> f64 {
        self.0
    }

    fn canonical_bits(&self) -> u64 {
        // -0.0 and 0.0 collapse; NaN never validates as a version
        if self.0 == 0.0 {
            0
        } else {
            self.0.to_bits()
        }
    }
}

impl PartialEq for PluginVersion {
    fn eq(&self, other: &Self) -> bool {
        self.canonical_bits() == other.canonical_bits()
    }
}

impl Eq for PluginVersion {}

impl Hash for PluginVersion {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canonical_bits().hash(state);
    }
}

impl PartialOrd for PluginVersion {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PluginVersion {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl fmt::Display for PluginVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.fract() == 0.0 {
            write!(f, "{:.1}", self.0)
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl FromStr for PluginVersion {
    type Err = GsmError;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim().trim_start_matches(['v', 'V']);
        let value: f64 = trimmed
            .parse()
            .map_err(|_| GsmError::validation(format!("invalid plugin version: {}", s)))?;
        if !value.is_finite() || value <= 0.0 {
            return Err(GsmError::validation(format!(
                "plugin version must be positive: {}",
                s
            )));
        }
        Ok(Self(value))
    }
}

impl From<f64> for PluginVersion {
    fn from(v: f64) -> Self {
        Self(v)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// System Commands
// ═══════════════════════════════════════════════════════════════════════════════

/// Control commands carried in the payload of system messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "camelCase")]
pub enum SystemCommand {
    /// Run the location batch trigger protocol.
    SchedulerTick,
    /// Re-read the virtual host table from the backend.
    ReloadVirtualHosts,
    /// Run one batch module on this instance.
    #[serde(rename_all = "camelCase")]
    RunBatch {
        plugin_id: PluginId,
        version: PluginVersion,
        module_class: String,
    },
    /// Drop cached live module lists, for one location or all of them.
    #[serde(rename_all = "camelCase")]
    InvalidateModuleCache { location: Option<String> },
}

// ═══════════════════════════════════════════════════════════════════════════════
// Message
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: Uuid,

    pub module_class: String,

    pub plugin_id: PluginId,

    pub plugin_version: PluginVersion,

    /// Instance that sent the message; replies go back to its queue
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_instance: Option<Uuid>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_location: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_plugin_id: Option<PluginId>,

    /// Instance currently handling the message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_instance: Option<Uuid>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_location: Option<String>,

    #[serde(default)]
    pub attributes: HashMap<String, serde_json::Value>,

    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Message {
    /// Build a message addressed to a module.
    pub fn to_module(
        plugin_id: impl Into<PluginId>,
        version: impl Into<PluginVersion>,
        module_class: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            module_class: module_class.into(),
            plugin_id: plugin_id.into(),
            plugin_version: version.into(),
            source_instance: None,
            source_location: None,
            source_plugin_id: None,
            current_instance: None,
            current_location: None,
            attributes: HashMap::new(),
            payload,
        }
    }

    /// Build a system message carrying `command`.
    pub fn system(command: &SystemCommand) -> Result<Self> {
        let payload = serde_json::to_value(command)?;
        Ok(Self::to_module(0, 0.0, SYSTEM_MODULE_CLASS, payload))
    }

    pub fn with_source(
        mut self,
        instance: Uuid,
        location: impl Into<String>,
        plugin_id: Option<PluginId>,
    ) -> Self {
        self.source_instance = Some(instance);
        self.source_location = Some(location.into());
        self.source_plugin_id = plugin_id;
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.attributes.insert(key.into(), v);
        }
        self
    }

    pub fn is_system(&self) -> bool {
        self.module_class == SYSTEM_MODULE_CLASS
    }

    /// Replies are delivered to their module but never answered again.
    pub fn is_reply(&self) -> bool {
        self.attributes.contains_key(IN_REPLY_TO)
    }

    /// Decode the system command, if this is a system message.
    pub fn system_command(&self) -> Option<Result<SystemCommand>> {
        if !self.is_system() {
            return None;
        }
        Some(serde_json::from_value(self.payload.clone()).map_err(GsmError::from))
    }

    /// Record that `instance` at `location` is now handling the message.
    pub fn arrive_at(&mut self, instance: Uuid, location: &str) {
        self.current_instance = Some(instance);
        self.current_location = Some(location.to_string());
    }

    /// Build the reply to this request.
    ///
    /// Source and target plugin ids are swapped and the reply is addressed
    /// to the instance that sent the request.
    pub fn reply(&self, payload: serde_json::Value, from_instance: Uuid, from_location: &str) -> Self {
        let mut attributes = self.attributes.clone();
        attributes.insert(IN_REPLY_TO.to_string(), serde_json::json!(self.id));

        Self {
            id: Uuid::new_v4(),
            module_class: self.module_class.clone(),
            plugin_id: self.source_plugin_id.unwrap_or(self.plugin_id),
            plugin_version: self.plugin_version,
            source_instance: Some(from_instance),
            source_location: Some(from_location.to_string()),
            source_plugin_id: Some(self.plugin_id),
            current_instance: self.source_instance,
            current_location: self.source_location.clone(),
            attributes,
            payload,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Short description used in log fields.
    pub fn describe(&self) -> String {
        format!("{}:{}@{}", self.plugin_id, self.module_class, self.plugin_version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_display_and_parse() {
        assert_eq!(PluginVersion(1.0).to_string(), "1.0");
        assert_eq!(PluginVersion(2.5).to_string(), "2.5");
        assert_eq!("v1.0".parse::<PluginVersion>().unwrap(), PluginVersion(1.0));
        assert_eq!("1".parse::<PluginVersion>().unwrap(), PluginVersion(1.0));
        assert!("v0".parse::<PluginVersion>().is_err());
        assert!("vX".parse::<PluginVersion>().is_err());
    }

    #[test]
    fn test_reply_swaps_plugin_ids() {
        let requester = Uuid::new_v4();
        let replier = Uuid::new_v4();
        let request = Message::to_module(20, 1.0, "com.acme.Orders", serde_json::json!({"q": 1}))
            .with_source(requester, "eu-west", Some(PluginId(5)));

        let reply = request.reply(serde_json::json!({"ok": true}), replier, "us-east");

        assert_eq!(reply.plugin_id, PluginId(5));
        assert_eq!(reply.source_plugin_id, Some(PluginId(20)));
        assert_eq!(reply.current_instance, Some(requester));
        assert_eq!(reply.current_location.as_deref(), Some("eu-west"));
        assert_eq!(reply.source_instance, Some(replier));
        assert_eq!(reply.attributes[IN_REPLY_TO], serde_json::json!(request.id));
        assert_ne!(reply.id, request.id);
    }

    #[test]
    fn test_system_message() {
        let msg = Message::system(&SystemCommand::ReloadVirtualHosts).unwrap();
        assert!(msg.is_system());
        assert_eq!(
            msg.system_command().unwrap().unwrap(),
            SystemCommand::ReloadVirtualHosts
        );

        let user = Message::to_module(1, 1.0, "com.acme.Echo", serde_json::Value::Null);
        assert!(user.system_command().is_none());
    }

    #[test]
    fn test_wire_format_is_camel_case() {
        let msg = Message::to_module(3, 1.5, "com.acme.Echo", serde_json::json!("hi"))
            .with_source(Uuid::nil(), "lab", Some(PluginId(9)));
        let json = msg.to_json().unwrap();
        assert!(json.contains("\"moduleClass\":\"com.acme.Echo\""));
        assert!(json.contains("\"pluginVersion\":1.5"));
        assert!(json.contains("\"sourcePluginId\":9"));

        let back = Message::from_json(&json).unwrap();
        assert_eq!(back, msg);
    }
}
