//! The user record evaluated against flag rules.
use std::collections::HashMap;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// A user record.
///
/// Only `key` is required. The built-in attributes are the ones flag rules
/// can reference by their bare names; everything else goes into `custom`.
///
/// ```
/// # use flagstream::User;
/// let user = User::with_key("user-key")
///     .country("LT")
///     .custom("plan", "enterprise");
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    /// Numeric and boolean keys from loosely typed callers are coerced to
    /// strings on deserialization, so bucketing sees one representation.
    #[serde(default, deserialize_with = "deserialize_coerced", skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, deserialize_with = "deserialize_coerced", skip_serializing_if = "Option::is_none")]
    pub secondary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anonymous: Option<bool>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub custom: HashMap<String, Value>,
}

/// Accept strings as-is and render numbers/booleans in their canonical
/// string form. Anything else is treated as absent.
fn deserialize_coerced<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<String>, D::Error> {
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.and_then(|v| match v {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }))
}

impl User {
    /// Create a user with the given key.
    pub fn with_key(key: impl Into<String>) -> User {
        User {
            key: Some(key.into()),
            ..User::default()
        }
    }

    pub fn secondary(mut self, secondary: impl Into<String>) -> User {
        self.secondary = Some(secondary.into());
        self
    }

    pub fn ip(mut self, ip: impl Into<String>) -> User {
        self.ip = Some(ip.into());
        self
    }

    pub fn country(mut self, country: impl Into<String>) -> User {
        self.country = Some(country.into());
        self
    }

    pub fn email(mut self, email: impl Into<String>) -> User {
        self.email = Some(email.into());
        self
    }

    pub fn first_name(mut self, first_name: impl Into<String>) -> User {
        self.first_name = Some(first_name.into());
        self
    }

    pub fn last_name(mut self, last_name: impl Into<String>) -> User {
        self.last_name = Some(last_name.into());
        self
    }

    pub fn avatar(mut self, avatar: impl Into<String>) -> User {
        self.avatar = Some(avatar.into());
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> User {
        self.name = Some(name.into());
        self
    }

    pub fn anonymous(mut self, anonymous: bool) -> User {
        self.anonymous = Some(anonymous);
        self
    }

    /// Attach a custom attribute, addressable from clauses by its name.
    pub fn custom(mut self, name: impl Into<String>, value: impl Into<Value>) -> User {
        self.custom.insert(name.into(), value.into());
        self
    }

    /// Resolve an attribute by name.
    ///
    /// Built-in names resolve from the top-level record only; all other
    /// names resolve from `custom`. Absent attributes are `None`.
    pub fn attribute(&self, name: &str) -> Option<Value> {
        match name {
            "key" => self.key.clone().map(Value::from),
            "secondary" => self.secondary.clone().map(Value::from),
            "ip" => self.ip.clone().map(Value::from),
            "country" => self.country.clone().map(Value::from),
            "email" => self.email.clone().map(Value::from),
            "firstName" => self.first_name.clone().map(Value::from),
            "lastName" => self.last_name.clone().map(Value::from),
            "avatar" => self.avatar.clone().map(Value::from),
            "name" => self.name.clone().map(Value::from),
            "anonymous" => self.anonymous.map(Value::from),
            _ => self.custom.get(name).cloned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::User;

    #[test]
    fn builtin_attributes_resolve_from_top_level() {
        let user = User::with_key("u").country("LT").name("Alice");
        assert_eq!(user.attribute("key"), Some(json!("u")));
        assert_eq!(user.attribute("country"), Some(json!("LT")));
        assert_eq!(user.attribute("name"), Some(json!("Alice")));
        assert_eq!(user.attribute("email"), None);
    }

    #[test]
    fn custom_attributes_do_not_shadow_builtins() {
        let user = User::with_key("u").custom("name", "sneaky").custom("plan", "pro");
        // "name" is a built-in; the top-level (absent) value wins.
        assert_eq!(user.attribute("name"), None);
        assert_eq!(user.attribute("plan"), Some(json!("pro")));
    }

    #[test]
    fn numeric_key_is_coerced_to_string() {
        let user: User = serde_json::from_value(json!({"key": 33333})).unwrap();
        assert_eq!(user.key.as_deref(), Some("33333"));

        let user: User = serde_json::from_value(json!({"key": "x", "secondary": 999})).unwrap();
        assert_eq!(user.secondary.as_deref(), Some("999"));
    }

    #[test]
    fn boolean_key_is_coerced_to_string() {
        let user: User = serde_json::from_value(json!({"key": true})).unwrap();
        assert_eq!(user.key.as_deref(), Some("true"));
    }

    #[test]
    fn array_custom_attribute_round_trips() {
        let user = User::with_key("u").custom("groups", json!(["a", "b"]));
        let json = serde_json::to_value(&user).unwrap();
        let back: User = serde_json::from_value(json).unwrap();
        assert_eq!(back.attribute("groups"), Some(Value::Array(vec![json!("a"), json!("b")])));
    }
}
