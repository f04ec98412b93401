//! Declare-then-set scalar store shared by the stages of a run
//!
//! Names are case-insensitive (folded to upper case). A value can only be
//! set on a declared name, and a declared name without a value reads as
//! absent.

use parking_lot::RwLock;
use std::collections::HashMap;

use crate::error::ParameterError;
use crate::scalar::Scalar;

#[derive(Debug, Default)]
struct Slots {
    /// Declaration order
    declared: Vec<String>,
    values: HashMap<String, Scalar>,
}

/// Cross-stage parameter table
#[derive(Debug, Default)]
pub struct ParameterTable {
    slots: RwLock<Slots>,
}

/// Case fold used for every parameter name comparison
pub(crate) fn fold(name: &str) -> String {
    name.to_uppercase()
}

impl ParameterTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a name
    pub fn declare(&self, name: &str) -> Result<(), ParameterError> {
        let key = fold(name);
        let mut slots = self.slots.write();
        if slots.declared.contains(&key) {
            return Err(ParameterError::AlreadyDeclared(key));
        }
        slots.declared.push(key);
        Ok(())
    }

    /// Store a value under a declared name, replacing any previous value
    pub fn set(&self, name: &str, value: Scalar) -> Result<(), ParameterError> {
        let key = fold(name);
        let mut slots = self.slots.write();
        if !slots.declared.contains(&key) {
            return Err(ParameterError::Undeclared(key));
        }
        slots.values.insert(key, value);
        Ok(())
    }

    /// Read a value; `None` if the name was never set
    pub fn get(&self, name: &str) -> Option<Scalar> {
        self.slots.read().values.get(&fold(name)).cloned()
    }

    /// Whether a name was declared
    pub fn is_declared(&self, name: &str) -> bool {
        self.slots.read().declared.contains(&fold(name))
    }

    /// Declared names (upper case) in declaration order
    pub fn names(&self) -> Vec<String> {
        self.slots.read().declared.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_declare_set_get() {
        let table = ParameterTable::new();
        table.declare("A").unwrap();
        table.set("A", Scalar::Int(1)).unwrap();
        assert_eq!(table.get("A"), Some(Scalar::Int(1)));

        assert_eq!(
            table.declare("A"),
            Err(ParameterError::AlreadyDeclared("A".into()))
        );
        assert_eq!(
            table.set("B", Scalar::Int(2)),
            Err(ParameterError::Undeclared("B".into()))
        );
        assert_eq!(table.get("B"), None);
    }

    #[test]
    fn test_names_are_case_insensitive() {
        let table = ParameterTable::new();
        table.declare("Aa").unwrap();
        table.set("AA", Scalar::from("x")).unwrap();
        assert_eq!(table.get("aa"), Some(Scalar::Text("x".into())));
        assert!(table.declare("aA").is_err());
        assert!(table.is_declared("aa"));
    }

    #[test]
    fn test_declared_but_unset_reads_as_absent() {
        let table = ParameterTable::new();
        table.declare("last_id").unwrap();
        assert_eq!(table.get("LAST_ID"), None);
        assert_eq!(table.names(), vec!["LAST_ID".to_string()]);
    }

    #[test]
    fn test_set_overwrites() {
        let table = ParameterTable::new();
        table.declare("n").unwrap();
        table.set("n", Scalar::Int(1)).unwrap();
        table.set("N", Scalar::Int(2)).unwrap();
        assert_eq!(table.get("n"), Some(Scalar::Int(2)));
    }
}
