//! Compiler configuration.
//!
//! `CompilerConfig` carries the per-invocation knobs that are not part of
//! the program itself: extra headers to `#include` into generated units and
//! the optional protobuf descriptor enabling the serialization path. The
//! descriptor is a small TOML file:
//!
//! ```toml
//! package = "trck"
//! message = "Results"
//! path = "proto/Results.proto"
//! ```

use crate::error::CompileError;
use serde::Deserialize;
use std::path::PathBuf;

/// Per-invocation configuration, builder style.
#[derive(Debug, Clone, Default)]
pub struct CompilerConfig {
    /// Extra headers appended to the generated `#include` block.
    pub includes: Vec<String>,
    /// Protobuf descriptor; `Some` enables the protobuf unit.
    pub proto: Option<ProtoDescriptor>,
}

impl CompilerConfig {
    pub fn new() -> Self {
        CompilerConfig::default()
    }

    pub fn with_include(mut self, include: impl Into<String>) -> Self {
        self.includes.push(include.into());
        self
    }

    pub fn with_includes(mut self, includes: impl IntoIterator<Item = String>) -> Self {
        self.includes.extend(includes);
        self
    }

    pub fn with_proto(mut self, proto: ProtoDescriptor) -> Self {
        self.proto = Some(proto);
        self
    }
}

/// Where generated protobuf output goes: one message type in one schema
/// file. The protobuf-c identifier mangling is derived from here.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProtoDescriptor {
    /// Proto package, dotted (`trck`, `acme.metrics`).
    pub package: String,
    /// Message materialized per groupby tuple.
    pub message: String,
    /// Path of the `.proto` schema file.
    pub path: PathBuf,
}

impl ProtoDescriptor {
    pub fn from_toml(text: &str) -> Result<Self, CompileError> {
        toml::from_str(text).map_err(|e| CompileError::Syntax {
            line: None,
            message: format!("invalid proto descriptor: {}", e),
        })
    }

    fn package_components(&self) -> impl Iterator<Item = &str> {
        self.package.split('.').filter(|c| !c.is_empty())
    }

    /// `Trck` for package `trck` (protobuf-c type-name prefix).
    fn package_prefix(&self) -> String {
        let parts: Vec<String> = self.package_components().map(capitalize).collect();
        parts.join("__")
    }

    /// C struct name of a message in this package: `Trck__Results`.
    pub fn message_struct(&self, message: &str) -> String {
        format!("{}__{}", self.package_prefix(), capitalize(message))
    }

    /// Struct name of the result message itself.
    pub fn result_struct(&self) -> String {
        self.message_struct(&self.message)
    }

    /// Initializer macro of a message: `TRCK__RESULTS__INIT`.
    pub fn message_init(&self, message: &str) -> String {
        let mut parts: Vec<String> = self.package_components().map(shout_snake).collect();
        parts.push(shout_snake(message));
        format!("{}__INIT", parts.join("__"))
    }

    pub fn result_init(&self) -> String {
        self.message_init(&self.message)
    }

    /// Function prefix of the result message: `trck__results`.
    fn result_fn_prefix(&self) -> String {
        let mut parts: Vec<String> = self.package_components().map(lower_snake).collect();
        parts.push(lower_snake(&self.message));
        parts.join("__")
    }

    pub fn get_packed_size_fn(&self) -> String {
        format!("{}__get_packed_size", self.result_fn_prefix())
    }

    pub fn pack_fn(&self) -> String {
        format!("{}__pack", self.result_fn_prefix())
    }

    /// Default-value constant for a tuple message: `TRCK_SET_TUPLE_DEFAULT`.
    pub fn tuple_default_const(&self, message: &str) -> String {
        let parts: Vec<String> = self.package_components().map(shout_snake).collect();
        format!("{}_{}_DEFAULT", parts.join("_"), shout_snake(message))
    }

    /// The protobuf-c header generated from the schema file.
    pub fn pb_header(&self) -> String {
        let base = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        match base.strip_suffix(".proto") {
            Some(stem) => format!("{}.pb-c.h", stem),
            None => format!("{}.pb-c.h", base),
        }
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
        None => String::new(),
    }
}

/// `SetTuple` -> `SET_TUPLE`
fn shout_snake(s: &str) -> String {
    lower_snake(s).to_ascii_uppercase()
}

/// `SetTuple` -> `set_tuple`
fn lower_snake(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 4);
    for (i, c) in s.chars().enumerate() {
        if c.is_ascii_uppercase() {
            if i > 0 {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}
