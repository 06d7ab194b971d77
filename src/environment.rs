use serde::Deserialize;
use std::collections::btree_map::Iter;
use std::collections::BTreeMap;
use std::collections::HashMap;

/// A set of environment entries handed to or produced by the harness.
///
/// The same type carries the extra variables of each managed process and the
/// overrides returned from `start()`, which callers merge into their own
/// test configuration. Keys are kept sorted so logs and merges are stable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct Environment(BTreeMap<String, String>);

impl Environment {
    /// Creates an empty environment.
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Sets a variable, replacing any previous value.
    ///
    /// # Examples
    /// ```
    /// use depharness::Environment;
    ///
    /// let mut env = Environment::new();
    /// env.set("FRAUD_PORT", "8082");
    /// assert_eq!(env.get("FRAUD_PORT").map(String::as_str), Some("8082"));
    /// ```
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    /// Merges `other` into this set. Entries from `other` win on conflict.
    ///
    /// # Examples
    /// ```
    /// use depharness::Environment;
    ///
    /// let mut base = Environment::new();
    /// base.set("A", "1");
    ///
    /// let mut overrides = Environment::new();
    /// overrides.set("A", "2");
    ///
    /// base.extend(overrides);
    /// assert_eq!(base.get("A").map(String::as_str), Some("2"));
    /// ```
    pub fn extend(&mut self, other: Environment) {
        self.0.extend(other.0);
    }

    /// Looks up a variable.
    ///
    /// # Arguments
    /// * `key` - Variable name, matched exactly
    ///
    /// # Returns
    /// * `Option<&String>` - The value if the variable is set
    pub fn get(&self, key: &str) -> Option<&String> {
        self.0.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> Iter<'_, String, String> {
        self.0.iter()
    }

    /// Consumes the set and returns a plain map, for APIs such as
    /// `Command::envs`.
    pub fn into_inner(self) -> HashMap<String, String> {
        self.0.into_iter().collect()
    }
}

impl From<HashMap<String, String>> for Environment {
    fn from(map: HashMap<String, String>) -> Self {
        Self(map.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a Environment {
    type Item = (&'a String, &'a String);
    type IntoIter = Iter<'a, String, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Builds the override key for a process, e.g. `("shipping-flow", "PORT")`
/// becomes `SHIPPING_FLOW_PORT`.
///
/// # Arguments
/// * `process_name` - Configured process name; anything that is not ASCII
///   alphanumeric becomes `_`
/// * `suffix` - Appended after an underscore, e.g. `PORT` or `URL`
///
/// # Returns
/// * `String` - Upper-case key suitable as an environment variable name
pub fn override_key(process_name: &str, suffix: &str) -> String {
    let mut key: String = process_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    key.push('_');
    key.push_str(suffix);
    key
}
