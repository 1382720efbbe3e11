use anyhow::Result;
use serde_json::{Map, Value};

use crate::error::{class_error, ErrorClass};

/// A keyed hierarchical attribute set.
///
/// This is the input-tree seam of the engine: the outer parser is an
/// external collaborator, and the engine consumes a tree of named,
/// typed children plus scalar attributes. The bundled representation
/// is JSON; an object-valued entry is a child and its key must read
/// `"<Type> <name>"` (e.g. `"Grid grid"`), everything else is an
/// attribute of the current node.
#[derive(Clone, Debug)]
pub struct AttribSet {
    name: String,
    path: String,
    scalars: Map<String, Value>,
    children: Vec<(String, String, AttribSet)>,
}

impl AttribSet {
    pub fn from_json_str(name: &str, text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text).map_err(|e| {
            class_error(ErrorClass::InvalidAttribute, name, format!("bad JSON: {e}"))
        })?;
        Self::from_json_value(name, name, value)
    }

    fn from_json_value(name: &str, path: &str, value: Value) -> Result<Self> {
        let Value::Object(entries) = value else {
            return Err(class_error(
                ErrorClass::InvalidAttribute,
                path,
                "attribute set must be a JSON object",
            ));
        };

        let mut scalars = Map::new();
        let mut children = Vec::new();
        for (key, val) in entries {
            if let Value::Object(_) = val {
                let mut parts = key.split_whitespace();
                let (Some(tag), Some(child_name), None) =
                    (parts.next(), parts.next(), parts.next())
                else {
                    return Err(class_error(
                        ErrorClass::InvalidAttribute,
                        path,
                        format!("child key {key:?} is not of the form \"<Type> <name>\""),
                    ));
                };
                let child_path = format!("{path}.{child_name}");
                let child = Self::from_json_value(child_name, &child_path, val)?;
                children.push((tag.to_string(), child_name.to_string(), child));
            } else {
                scalars.insert(key, val);
            }
        }

        Ok(AttribSet {
            name: name.to_string(),
            path: path.to_string(),
            scalars,
            children,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fully qualified path of this node, used in error reports.
    pub fn path(&self) -> &str {
        &self.path
    }

    fn missing(&self, key: &str, what: &str) -> anyhow::Error {
        class_error(
            ErrorClass::InvalidAttribute,
            &self.path,
            format!("missing or mistyped {what} attribute {key:?}"),
        )
    }

    pub fn has_param(&self, key: &str) -> bool {
        matches!(self.scalars.get(key), Some(v) if v.as_f64().is_some())
    }

    /// A floating-point parameter.
    pub fn get_param(&self, key: &str) -> Result<f64> {
        self.scalars
            .get(key)
            .and_then(Value::as_f64)
            .ok_or_else(|| self.missing(key, "numeric"))
    }

    pub fn param_or(&self, key: &str, default: f64) -> Result<f64> {
        if self.scalars.contains_key(key) {
            self.get_param(key)
        } else {
            Ok(default)
        }
    }

    pub fn has_option(&self, key: &str) -> bool {
        matches!(self.scalars.get(key), Some(v) if v.as_i64().is_some())
    }

    /// An integer option.
    pub fn get_option(&self, key: &str) -> Result<i64> {
        self.scalars
            .get(key)
            .and_then(Value::as_i64)
            .ok_or_else(|| self.missing(key, "integer"))
    }

    pub fn option_or(&self, key: &str, default: i64) -> Result<i64> {
        if self.scalars.contains_key(key) {
            self.get_option(key)
        } else {
            Ok(default)
        }
    }

    pub fn get_option_usize(&self, key: &str) -> Result<usize> {
        let v = self.get_option(key)?;
        usize::try_from(v).map_err(|_| self.missing(key, "non-negative integer"))
    }

    pub fn has_string(&self, key: &str) -> bool {
        matches!(self.scalars.get(key), Some(Value::String(_)))
    }

    pub fn get_string(&self, key: &str) -> Result<String> {
        self.scalars
            .get(key)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| self.missing(key, "string"))
    }

    pub fn string_or(&self, key: &str, default: &str) -> Result<String> {
        if self.scalars.contains_key(key) {
            self.get_string(key)
        } else {
            Ok(default.to_string())
        }
    }

    /// An on/off flag; accepts the strings "on"/"off" or a JSON bool.
    pub fn flag_or(&self, key: &str, default: bool) -> Result<bool> {
        match self.scalars.get(key) {
            None => Ok(default),
            Some(Value::Bool(b)) => Ok(*b),
            Some(Value::String(s)) if s == "on" => Ok(true),
            Some(Value::String(s)) if s == "off" => Ok(false),
            Some(_) => Err(self.missing(key, "on/off")),
        }
    }

    pub fn has_prm_vec(&self, key: &str) -> bool {
        matches!(self.scalars.get(key), Some(Value::Array(_)))
    }

    pub fn get_prm_vec(&self, key: &str) -> Result<Vec<f64>> {
        let arr = self
            .scalars
            .get(key)
            .and_then(Value::as_array)
            .ok_or_else(|| self.missing(key, "numeric vector"))?;
        arr.iter()
            .map(|v| v.as_f64().ok_or_else(|| self.missing(key, "numeric vector")))
            .collect()
    }

    pub fn get_opt_vec(&self, key: &str) -> Result<Vec<i64>> {
        let arr = self
            .scalars
            .get(key)
            .and_then(Value::as_array)
            .ok_or_else(|| self.missing(key, "integer vector"))?;
        arr.iter()
            .map(|v| v.as_i64().ok_or_else(|| self.missing(key, "integer vector")))
            .collect()
    }

    pub fn get_str_vec(&self, key: &str) -> Result<Vec<String>> {
        let arr = self
            .scalars
            .get(key)
            .and_then(Value::as_array)
            .ok_or_else(|| self.missing(key, "string vector"))?;
        arr.iter()
            .map(|v| {
                v.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| self.missing(key, "string vector"))
            })
            .collect()
    }

    /// The `kind` selector every constructed child carries.
    pub fn kind(&self) -> Result<String> {
        self.get_string("kind")
    }

    /// Names of the children of the given type tag, in declaration order.
    pub fn names_of_kind(&self, tag: &str) -> Vec<String> {
        self.children
            .iter()
            .filter(|(t, _, _)| t == tag)
            .map(|(_, n, _)| n.clone())
            .collect()
    }

    /// The children of the given type tag, in declaration order.
    pub fn children_of_kind(&self, tag: &str) -> Vec<(&str, &AttribSet)> {
        self.children
            .iter()
            .filter(|(t, _, _)| t == tag)
            .map(|(_, n, a)| (n.as_str(), a))
            .collect()
    }

    pub fn child(&self, tag: &str, name: &str) -> Result<&AttribSet> {
        self.children
            .iter()
            .find(|(t, n, _)| t == tag && n == name)
            .map(|(_, _, a)| a)
            .ok_or_else(|| {
                class_error(
                    ErrorClass::UnknownObject,
                    &self.path,
                    format!("no child <{tag} {name}>"),
                )
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::classify;

    const INPUT: &str = r#"{
        "nsteps": 10,
        "relax": 0.25,
        "label": "run-a",
        "sizes": [1.0, 2.0, 4.0],
        "transposeFlag": "on",
        "Grid grid": { "kind": "uniCartGrid", "numCellsGlobal": [8, 8, 1] },
        "PhysField monoA": { "kind": "monomerDens" },
        "PhysField monoB": { "kind": "monomerDens" }
    }"#;

    #[test]
    fn scalars_and_vectors_parse() {
        let tas = AttribSet::from_json_str("Domain", INPUT).unwrap();
        assert_eq!(tas.get_option("nsteps").unwrap(), 10);
        assert_eq!(tas.get_param("relax").unwrap(), 0.25);
        assert_eq!(tas.get_string("label").unwrap(), "run-a");
        assert_eq!(tas.get_prm_vec("sizes").unwrap(), vec![1.0, 2.0, 4.0]);
        assert!(tas.flag_or("transposeFlag", false).unwrap());
        assert!(!tas.flag_or("absent", false).unwrap());
    }

    #[test]
    fn children_collect_by_type_in_declaration_order() {
        let tas = AttribSet::from_json_str("Domain", INPUT).unwrap();
        assert_eq!(tas.names_of_kind("PhysField"), vec!["monoA", "monoB"]);
        let grid = tas.child("Grid", "grid").unwrap();
        assert_eq!(grid.kind().unwrap(), "uniCartGrid");
        assert_eq!(grid.get_opt_vec("numCellsGlobal").unwrap(), vec![8, 8, 1]);
        assert_eq!(grid.path(), "Domain.grid");
    }

    #[test]
    fn missing_attributes_classify_as_invalid_attribute() {
        let tas = AttribSet::from_json_str("Domain", INPUT).unwrap();
        let err = tas.get_param("absent").unwrap_err();
        assert_eq!(classify(&err), Some(ErrorClass::InvalidAttribute));
        let err = tas.child("Grid", "nope").unwrap_err();
        assert_eq!(classify(&err), Some(ErrorClass::UnknownObject));
    }

    #[test]
    fn malformed_child_keys_are_rejected() {
        let err = AttribSet::from_json_str("Domain", r#"{ "Grid": {} }"#).unwrap_err();
        assert_eq!(classify(&err), Some(ErrorClass::InvalidAttribute));
    }
}
