//! Declared input values and reference resolution.
//!
//! Inputs are trees of literals and symbolic references to other resources'
//! outputs. A string that is exactly `${name.output}` becomes a reference and
//! keeps the output's JSON type; a string with embedded references becomes a
//! template whose resolved form is always a string. `$${` escapes a literal
//! `${`.

use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Map of attribute name to concrete JSON value.
pub type AttributeMap = BTreeMap<String, Value>;

/// A symbolic reference to another resource's output.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OutputRef {
    /// Logical name of the referenced resource.
    pub resource: String,
    /// Name of the output attribute.
    pub output: String,
}

/// A declared input value.
#[derive(Debug, Clone, PartialEq)]
pub enum InputValue {
    /// A concrete value with no references.
    Literal(Value),
    /// A whole-value reference to an upstream output.
    Reference(OutputRef),
    /// A string with embedded references.
    Template(Vec<TemplatePart>),
    /// A list containing at least one reference.
    List(Vec<InputValue>),
    /// A map containing at least one reference.
    Map(BTreeMap<String, InputValue>),
}

/// A segment of a string template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplatePart {
    /// Literal text.
    Text(String),
    /// An embedded reference.
    Ref(OutputRef),
}

/// Outcome of resolving a value against upstream outputs.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolved {
    /// The value is fully known.
    Known(Value),
    /// The value depends on an output that does not exist yet.
    Unknown,
}

/// Resolved inputs of a single resource.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedInputs {
    /// Attributes whose values are known.
    pub known: AttributeMap,
    /// Attributes that depend on outputs not produced yet.
    pub unknown: BTreeSet<String>,
}

impl OutputRef {
    /// Creates a new output reference.
    #[must_use]
    pub fn new(resource: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            output: output.into(),
        }
    }

    /// Parses the body of a `${...}` expression.
    ///
    /// # Errors
    ///
    /// Returns a message if the expression is not `name.output`.
    pub fn parse(expr: &str) -> Result<Self, String> {
        let expr = expr.trim();
        let Some((resource, output)) = expr.split_once('.') else {
            return Err(format!("reference '{expr}' must have the form name.output"));
        };
        if resource.is_empty() || output.is_empty() {
            return Err(format!("reference '{expr}' must have the form name.output"));
        }
        Ok(Self::new(resource, output))
    }
}

impl fmt::Display for OutputRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${{{}.{}}}", self.resource, self.output)
    }
}

impl InputValue {
    /// Parses a raw declared value into an input tree.
    ///
    /// # Errors
    ///
    /// Returns a message describing a malformed `${...}` expression.
    pub fn parse(raw: &Value) -> Result<Self, String> {
        match raw {
            Value::String(s) => Self::parse_string(s),
            Value::Array(items) => {
                let parsed = items.iter().map(Self::parse).collect::<Result<Vec<_>, _>>()?;
                if parsed.iter().all(Self::is_literal) {
                    Ok(Self::Literal(Value::Array(
                        parsed.into_iter().filter_map(Self::into_literal).collect(),
                    )))
                } else {
                    Ok(Self::List(parsed))
                }
            }
            Value::Object(map) => {
                let mut parsed = BTreeMap::new();
                for (key, value) in map {
                    parsed.insert(key.clone(), Self::parse(value)?);
                }
                if parsed.values().all(Self::is_literal) {
                    Ok(Self::Literal(Value::Object(
                        parsed
                            .into_iter()
                            .filter_map(|(k, v)| v.into_literal().map(|v| (k, v)))
                            .collect(),
                    )))
                } else {
                    Ok(Self::Map(parsed))
                }
            }
            other => Ok(Self::Literal(other.clone())),
        }
    }

    fn parse_string(s: &str) -> Result<Self, String> {
        let mut parts = Vec::new();
        let mut text = String::new();
        let mut rest = s;

        while let Some(pos) = rest.find('$') {
            text.push_str(&rest[..pos]);
            let tail = &rest[pos..];
            if let Some(after) = tail.strip_prefix("$${") {
                text.push_str("${");
                rest = after;
            } else if let Some(after) = tail.strip_prefix("${") {
                let Some(close) = after.find('}') else {
                    return Err(format!("unclosed reference in '{s}'"));
                };
                if !text.is_empty() {
                    parts.push(TemplatePart::Text(std::mem::take(&mut text)));
                }
                parts.push(TemplatePart::Ref(OutputRef::parse(&after[..close])?));
                rest = &after[close + 1..];
            } else {
                text.push('$');
                rest = &tail[1..];
            }
        }
        text.push_str(rest);

        if parts.is_empty() {
            return Ok(Self::Literal(Value::String(text)));
        }
        if !text.is_empty() {
            parts.push(TemplatePart::Text(text));
        }
        if let [TemplatePart::Ref(reference)] = parts.as_slice() {
            return Ok(Self::Reference(reference.clone()));
        }
        Ok(Self::Template(parts))
    }

    const fn is_literal(&self) -> bool {
        matches!(self, Self::Literal(_))
    }

    fn into_literal(self) -> Option<Value> {
        match self {
            Self::Literal(v) => Some(v),
            _ => None,
        }
    }

    /// Returns every reference contained in this value.
    #[must_use]
    pub fn references(&self) -> Vec<&OutputRef> {
        let mut refs = Vec::new();
        self.collect_references(&mut refs);
        refs
    }

    fn collect_references<'a>(&'a self, out: &mut Vec<&'a OutputRef>) {
        match self {
            Self::Literal(_) => {}
            Self::Reference(r) => out.push(r),
            Self::Template(parts) => out.extend(parts.iter().filter_map(|p| match p {
                TemplatePart::Ref(r) => Some(r),
                TemplatePart::Text(_) => None,
            })),
            Self::List(items) => items.iter().for_each(|i| i.collect_references(out)),
            Self::Map(map) => map.values().for_each(|v| v.collect_references(out)),
        }
    }

    /// Resolves the value using `lookup` for each reference.
    ///
    /// # Errors
    ///
    /// Returns the first reference for which `lookup` yields `None`.
    pub fn resolve<F>(&self, lookup: &F) -> Result<Resolved, OutputRef>
    where
        F: Fn(&OutputRef) -> Option<Resolved>,
    {
        match self {
            Self::Literal(v) => Ok(Resolved::Known(v.clone())),
            Self::Reference(r) => lookup(r).ok_or_else(|| r.clone()),
            Self::Template(parts) => {
                let mut out = String::new();
                for part in parts {
                    match part {
                        TemplatePart::Text(t) => out.push_str(t),
                        TemplatePart::Ref(r) => match lookup(r).ok_or_else(|| r.clone())? {
                            Resolved::Known(Value::String(s)) => out.push_str(&s),
                            Resolved::Known(other) => out.push_str(&other.to_string()),
                            Resolved::Unknown => return Ok(Resolved::Unknown),
                        },
                    }
                }
                Ok(Resolved::Known(Value::String(out)))
            }
            Self::List(items) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    match item.resolve(lookup)? {
                        Resolved::Known(v) => values.push(v),
                        Resolved::Unknown => return Ok(Resolved::Unknown),
                    }
                }
                Ok(Resolved::Known(Value::Array(values)))
            }
            Self::Map(map) => {
                let mut values = serde_json::Map::new();
                for (key, item) in map {
                    match item.resolve(lookup)? {
                        Resolved::Known(v) => {
                            values.insert(key.clone(), v);
                        }
                        Resolved::Unknown => return Ok(Resolved::Unknown),
                    }
                }
                Ok(Resolved::Known(Value::Object(values)))
            }
        }
    }
}

impl ResolvedInputs {
    /// Resolves every attribute of an input map.
    ///
    /// # Errors
    ///
    /// Returns the first reference that `lookup` cannot satisfy.
    pub fn resolve<F>(inputs: &BTreeMap<String, InputValue>, lookup: &F) -> Result<Self, OutputRef>
    where
        F: Fn(&OutputRef) -> Option<Resolved>,
    {
        let mut resolved = Self::default();
        for (name, value) in inputs {
            match value.resolve(lookup)? {
                Resolved::Known(v) => {
                    resolved.known.insert(name.clone(), v);
                }
                Resolved::Unknown => {
                    resolved.unknown.insert(name.clone());
                }
            }
        }
        Ok(resolved)
    }

    /// Returns true if every attribute is known.
    #[must_use]
    pub fn is_fully_known(&self) -> bool {
        self.unknown.is_empty()
    }
}
