use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use lazyflow_core::{Error, Result};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::operator::Operator;

type Constructor = Box<dyn Fn(&Value) -> Result<Arc<dyn Operator>> + Send + Sync>;

/// Constructors used to turn operator records back into operators.
///
/// Keyed by [`Operator::type_name`].
#[derive(Default)]
pub struct OperatorRegistry {
    constructors: HashMap<String, Constructor>,
}

impl OperatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a constructor taking the recorded parameters.
    pub fn register<T, F>(&mut self, type_name: impl Into<String>, constructor: F) -> &mut Self
    where
        T: Operator,
        F: Fn(&Value) -> Result<T> + Send + Sync + 'static,
    {
        self.constructors.insert(
            type_name.into(),
            Box::new(move |params| Ok(Arc::new(constructor(params)?) as Arc<dyn Operator>)),
        );
        self
    }

    /// Registers an operator whose parameters are the operator itself,
    /// deserialized with serde.
    pub fn register_serde<T>(&mut self, type_name: impl Into<String>) -> &mut Self
    where
        T: Operator + DeserializeOwned,
    {
        self.register(type_name, |params| {
            serde_json::from_value::<T>(params.clone()).map_err(Error::from)
        })
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.constructors.contains_key(type_name)
    }

    /// Builds a new operator of `type_name`.
    pub fn create(&self, type_name: &str, params: &Value) -> Result<Arc<dyn Operator>> {
        let constructor = self.constructors.get(type_name).ok_or_else(|| {
            Error::InvalidConfig(format!("no operator registered as `{type_name}`"))
        })?;
        constructor(params)
    }
}

impl fmt::Debug for OperatorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.constructors.keys().collect();
        names.sort();
        f.debug_struct("OperatorRegistry")
            .field("operators", &names)
            .finish()
    }
}
