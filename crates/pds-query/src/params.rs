//! Statement parameter binding.

use crate::ast::Literal;
use crate::error::QueryError;
use pds_core::scalar::Scalar;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Positional (`?1`) and named (`$name`) parameter values for one call.
/// Serializable so subscription descriptors can carry their bindings to
/// peers.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Params {
    positional: Vec<Scalar>,
    named: HashMap<String, Scalar>,
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append the next positional parameter.
    pub fn push(mut self, value: impl Into<Scalar>) -> Self {
        self.positional.push(value.into());
        self
    }

    /// Bind a named parameter.
    pub fn set(mut self, name: impl Into<String>, value: impl Into<Scalar>) -> Self {
        self.named.insert(name.into(), value.into());
        self
    }

    /// Resolve a literal to a concrete scalar.
    pub fn resolve(&self, literal: &Literal) -> Result<Scalar, QueryError> {
        match literal {
            Literal::Scalar(scalar) => Ok(scalar.clone()),
            Literal::Positional(index) => self
                .positional
                .get(index - 1)
                .cloned()
                .ok_or_else(|| QueryError::UnboundParam(format!("?{index}"))),
            Literal::Named(name) => self
                .named
                .get(name)
                .cloned()
                .ok_or_else(|| QueryError::UnboundParam(format!("${name}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolution() {
        let params = Params::new().push(42i64).set("status", "open");

        assert_eq!(
            params.resolve(&Literal::Positional(1)).unwrap(),
            Scalar::Int(42)
        );
        assert_eq!(
            params.resolve(&Literal::Named("status".into())).unwrap(),
            Scalar::Text("open".into())
        );
        assert!(params.resolve(&Literal::Positional(2)).is_err());
        assert!(params.resolve(&Literal::Named("missing".into())).is_err());
    }
}
