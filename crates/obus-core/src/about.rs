//! About announcements: advertising which interfaces an attachment serves.
//!
//! `AboutData` carries the announced metadata dictionary. Nine fields are
//! required; `announce` fails with a marshal error before anything reaches
//! the wire when one is missing. Remote interest is registered with
//! `who_implements`, and matching announcements arrive through
//! `AboutListener`.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use obus_msg::codec::{encode, MarshalError, Value};
use obus_msg::signature::TypeNode;
use obus_msg::MsgArg;

/// Reserved names for the About protocol.
pub mod well_known {
    pub const ABOUT_PATH: &str = "/About";
    pub const ABOUT_INTERFACE: &str = "org.alljoyn.About";
    pub const ANNOUNCE: &str = "Announce";
    /// Protocol version stamped on announcements
    pub const ABOUT_VERSION: u16 = 1;
}

/// Field names. The first nine are required.
pub mod field {
    pub const APP_ID: &str = "AppId";
    pub const APP_NAME: &str = "AppName";
    pub const DEFAULT_LANGUAGE: &str = "DefaultLanguage";
    pub const DEVICE_ID: &str = "DeviceId";
    pub const DESCRIPTION: &str = "Description";
    pub const MANUFACTURER: &str = "Manufacturer";
    pub const MODEL_NUMBER: &str = "ModelNumber";
    pub const SOFTWARE_VERSION: &str = "SoftwareVersion";
    pub const SUPPORTED_LANGUAGES: &str = "SupportedLanguages";

    pub const DEVICE_NAME: &str = "DeviceName";
    pub const DATE_OF_MANUFACTURE: &str = "DateOfManufacture";
    pub const HARDWARE_VERSION: &str = "HardwareVersion";
    pub const SUPPORT_URL: &str = "SupportUrl";
}

/// The nine fields every announcement must carry.
pub const REQUIRED_FIELDS: [&str; 9] = [
    field::APP_ID,
    field::APP_NAME,
    field::DEFAULT_LANGUAGE,
    field::DEVICE_ID,
    field::DESCRIPTION,
    field::MANUFACTURER,
    field::MODEL_NUMBER,
    field::SOFTWARE_VERSION,
    field::SUPPORTED_LANGUAGES,
];

// ============================================================================
// AboutData
// ============================================================================

/// The announced metadata dictionary, marshaled as `a{sv}`.
#[derive(Debug, Clone, Default)]
pub struct AboutData {
    fields: Vec<(String, Value)>,
}

impl AboutData {
    pub fn new() -> Self {
        Self::default()
    }

    fn set(&mut self, name: &str, node: TypeNode, value: Value) -> &mut Self {
        let wrapped = Value::Variant {
            node,
            value: Box::new(value),
        };
        match self.fields.iter_mut().find(|(n, _)| n == name) {
            Some((_, v)) => *v = wrapped,
            None => self.fields.push((name.to_string(), wrapped)),
        }
        self
    }

    fn set_string(&mut self, name: &str, value: impl Into<String>) -> &mut Self {
        self.set(name, TypeNode::Str, Value::Str(value.into()))
    }

    pub fn set_app_id(&mut self, bytes: &[u8]) -> &mut Self {
        self.set(
            field::APP_ID,
            TypeNode::Array(Box::new(TypeNode::Byte)),
            Value::Array(bytes.iter().map(|b| Value::Byte(*b)).collect()),
        )
    }

    pub fn set_app_name(&mut self, v: impl Into<String>) -> &mut Self {
        self.set_string(field::APP_NAME, v)
    }

    pub fn set_default_language(&mut self, v: impl Into<String>) -> &mut Self {
        self.set_string(field::DEFAULT_LANGUAGE, v)
    }

    pub fn set_device_id(&mut self, v: impl Into<String>) -> &mut Self {
        self.set_string(field::DEVICE_ID, v)
    }

    pub fn set_device_name(&mut self, v: impl Into<String>) -> &mut Self {
        self.set_string(field::DEVICE_NAME, v)
    }

    pub fn set_description(&mut self, v: impl Into<String>) -> &mut Self {
        self.set_string(field::DESCRIPTION, v)
    }

    pub fn set_manufacturer(&mut self, v: impl Into<String>) -> &mut Self {
        self.set_string(field::MANUFACTURER, v)
    }

    pub fn set_model_number(&mut self, v: impl Into<String>) -> &mut Self {
        self.set_string(field::MODEL_NUMBER, v)
    }

    pub fn set_software_version(&mut self, v: impl Into<String>) -> &mut Self {
        self.set_string(field::SOFTWARE_VERSION, v)
    }

    pub fn set_hardware_version(&mut self, v: impl Into<String>) -> &mut Self {
        self.set_string(field::HARDWARE_VERSION, v)
    }

    pub fn set_support_url(&mut self, v: impl Into<String>) -> &mut Self {
        self.set_string(field::SUPPORT_URL, v)
    }

    pub fn set_date_of_manufacture(&mut self, v: impl Into<String>) -> &mut Self {
        self.set_string(field::DATE_OF_MANUFACTURE, v)
    }

    pub fn set_supported_languages(&mut self, languages: &[&str]) -> &mut Self {
        self.set(
            field::SUPPORTED_LANGUAGES,
            TypeNode::Array(Box::new(TypeNode::Str)),
            Value::Array(
                languages
                    .iter()
                    .map(|l| Value::Str(l.to_string()))
                    .collect(),
            ),
        )
    }

    /// The raw field value, unwrapped from its variant.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, v)| {
            match v {
                Value::Variant { value, .. } => value.as_ref(),
                other => other,
            }
        })
    }

    /// The field as a string, when it is one.
    pub fn get_str(&self, name: &str) -> Option<&str> {
        match self.get(name) {
            Some(Value::Str(s)) => Some(s),
            _ => None,
        }
    }

    pub fn is_set(&self, name: &str) -> bool {
        self.fields.iter().any(|(n, _)| n == name)
    }

    /// Check that every required field is present.
    pub fn validate(&self) -> Result<(), MarshalError> {
        for required in REQUIRED_FIELDS {
            if !self.is_set(required) {
                return Err(MarshalError::MissingEntry(required.to_string()));
            }
        }
        Ok(())
    }

    /// Marshal as the announcement's `a{sv}` argument. Validates first.
    pub fn to_arg(&self) -> Result<MsgArg, MarshalError> {
        self.validate()?;
        let dict = Value::Dict(
            self.fields
                .iter()
                .map(|(n, v)| (Value::Str(n.clone()), v.clone()))
                .collect(),
        );
        encode(
            &dict,
            &TypeNode::Dict(Box::new(TypeNode::Str), Box::new(TypeNode::Variant)),
        )
    }

    /// Rebuild from a received `a{sv}` argument.
    pub fn from_arg(arg: &MsgArg) -> Option<Self> {
        match arg {
            MsgArg::Dict { entries, .. } => {
                let mut data = AboutData::new();
                for (k, v) in entries {
                    if let MsgArg::Str(name) = k {
                        data.fields
                            .push((name.clone(), obus_msg::codec::decode(v)));
                    }
                }
                Some(data)
            }
            _ => None,
        }
    }
}

// ============================================================================
// Listener Registry
// ============================================================================

/// One received announcement's object description: path -> interfaces.
pub type ObjectDescription = Vec<(String, Vec<String>)>;

/// Receives matching announcements.
#[async_trait]
pub trait AboutListener: Send + Sync {
    async fn announced(
        &self,
        bus_name: &str,
        version: u16,
        port: u16,
        objects: &ObjectDescription,
        data: &AboutData,
    );
}

struct Interest {
    listener: Arc<dyn AboutListener>,
    /// Interfaces the listener requires; empty matches everything
    interfaces: Vec<String>,
}

/// The per-attachment registry of `who_implements` interests.
#[derive(Default)]
pub struct AboutInterests {
    interests: RwLock<Vec<Interest>>,
}

impl AboutInterests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in announcements implementing all `interfaces`.
    pub fn register(&self, listener: Arc<dyn AboutListener>, interfaces: &[&str]) {
        let mut interests = self.interests.write();
        if let Some(existing) = interests
            .iter_mut()
            .find(|i| Arc::ptr_eq(&i.listener, &listener))
        {
            existing.interfaces = interfaces.iter().map(|s| s.to_string()).collect();
            return;
        }
        interests.push(Interest {
            listener,
            interfaces: interfaces.iter().map(|s| s.to_string()).collect(),
        });
    }

    /// Remove one listener. Safe when absent.
    pub fn unregister(&self, listener: &Arc<dyn AboutListener>) {
        self.interests
            .write()
            .retain(|i| !Arc::ptr_eq(&i.listener, listener));
    }

    /// Bulk teardown leaves zero residual registrations.
    pub fn unregister_all(&self) {
        self.interests.write().clear();
    }

    pub fn len(&self) -> usize {
        self.interests.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.interests.read().is_empty()
    }

    /// Listeners whose required interfaces all appear in `objects`.
    pub fn matching(&self, objects: &ObjectDescription) -> Vec<Arc<dyn AboutListener>> {
        let offered: Vec<&str> = objects
            .iter()
            .flat_map(|(_, ifaces)| ifaces.iter().map(String::as_str))
            .collect();
        self.interests
            .read()
            .iter()
            .filter(|i| {
                i.interfaces
                    .iter()
                    .all(|want| offered.contains(&want.as_str()))
            })
            .map(|i| Arc::clone(&i.listener))
            .collect()
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
