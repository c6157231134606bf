/*
 * value.rs
 * Copyright (c) 2025 Posit, PBC
 */

//! Template value and context types.
//!
//! This module defines the values a caller hands to a render and gets back
//! from it. They are independent of the Lua runtime: conversion to and from
//! Lua tables happens in [`crate::runtime`].

use std::collections::HashMap;

/// A value that can be bound in a template context.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum TemplateValue {
    /// A string value, escaped when written through `${...}`.
    String(String),

    /// A string that is already HTML-escaped; escaping passes it through.
    Escaped(String),

    /// A boolean value.
    Bool(bool),

    /// An integer value.
    Integer(i64),

    /// A floating-point value.
    Number(f64),

    /// A list of values (a Lua sequence).
    List(Vec<TemplateValue>),

    /// A map of string keys to values (a Lua table).
    Map(HashMap<String, TemplateValue>),

    /// A null/missing value (Lua `nil`).
    #[default]
    Null,
}

impl TemplateValue {
    /// Wrap text that is already safe to emit without escaping.
    pub fn escaped(text: impl Into<String>) -> Self {
        TemplateValue::Escaped(text.into())
    }

    /// Text form of this value, matching the runtime `to_str` helper.
    ///
    /// - String / Escaped: returned as-is
    /// - Bool: "true" or "false"
    /// - Integer / Number: decimal text
    /// - List: concatenation of rendered elements
    /// - Map, Null: ""
    pub fn render(&self) -> String {
        match self {
            TemplateValue::String(s) | TemplateValue::Escaped(s) => s.clone(),
            TemplateValue::Bool(b) => b.to_string(),
            TemplateValue::Integer(n) => n.to_string(),
            TemplateValue::Number(n) => format_number(*n),
            TemplateValue::List(items) => items.iter().map(|v| v.render()).collect(),
            TemplateValue::Map(_) | TemplateValue::Null => String::new(),
        }
    }
}

// Lua prints integral floats with a trailing ".0".
fn format_number(n: f64) -> String {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{n:.1}")
    } else {
        n.to_string()
    }
}

impl From<&str> for TemplateValue {
    fn from(s: &str) -> Self {
        TemplateValue::String(s.to_string())
    }
}

impl From<String> for TemplateValue {
    fn from(s: String) -> Self {
        TemplateValue::String(s)
    }
}

impl From<bool> for TemplateValue {
    fn from(b: bool) -> Self {
        TemplateValue::Bool(b)
    }
}

impl From<i64> for TemplateValue {
    fn from(n: i64) -> Self {
        TemplateValue::Integer(n)
    }
}

impl From<f64> for TemplateValue {
    fn from(n: f64) -> Self {
        TemplateValue::Number(n)
    }
}

impl<T: Into<TemplateValue>> From<Vec<T>> for TemplateValue {
    fn from(items: Vec<T>) -> Self {
        TemplateValue::List(items.into_iter().map(Into::into).collect())
    }
}

impl From<serde_json::Value> for TemplateValue {
    fn from(value: serde_json::Value) -> Self {
        use serde_json::Value;
        match value {
            Value::Null => TemplateValue::Null,
            Value::Bool(b) => TemplateValue::Bool(b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => TemplateValue::Integer(i),
                None => TemplateValue::Number(n.as_f64().unwrap_or(f64::NAN)),
            },
            Value::String(s) => TemplateValue::String(s),
            Value::Array(items) => {
                TemplateValue::List(items.into_iter().map(TemplateValue::from).collect())
            }
            Value::Object(map) => TemplateValue::Map(
                map.into_iter()
                    .map(|(k, v)| (k, TemplateValue::from(v)))
                    .collect(),
            ),
        }
    }
}

/// Variable bindings a template is rendered against.
///
/// A render takes the context mutably: assignments made by templates through
/// `_context` (captures, layout overrides, values set by includes) are
/// visible to the caller afterwards.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TemplateContext {
    variables: HashMap<String, TemplateValue>,
}

impl TemplateContext {
    /// Create a new empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a context from a JSON object. Anything else is rejected.
    pub fn from_json(value: serde_json::Value) -> Option<Self> {
        match TemplateValue::from(value) {
            TemplateValue::Map(variables) => Some(Self { variables }),
            _ => None,
        }
    }

    /// Insert a variable into the context.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<TemplateValue>) {
        self.variables.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&TemplateValue> {
        self.variables.get(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<TemplateValue> {
        self.variables.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.variables.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &TemplateValue)> {
        self.variables.iter()
    }

    pub fn len(&self) -> usize {
        self.variables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }

    pub(crate) fn replace_all(&mut self, variables: HashMap<String, TemplateValue>) {
        self.variables = variables;
    }
}

impl<K: Into<String>, V: Into<TemplateValue>> FromIterator<(K, V)> for TemplateContext {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut ctx = TemplateContext::new();
        for (k, v) in iter {
            ctx.insert(k, v);
        }
        ctx
    }
}
