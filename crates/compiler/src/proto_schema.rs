//! Protobuf schema reading and result-variable validation.
//!
//! The protobuf path only needs to know the shape of the target message, so
//! this is a deliberately small reader for the subset of proto2/proto3 that
//! result schemas use: `message` blocks with scalar and message-typed
//! fields, `repeated`/`optional`/`required` labels, imports, enums
//! (skipped) and options (skipped).
//!
//! Validation checks every declared result variable against the message:
//!
//! - groupby `%x`   -> singular string field `scalar_x`
//! - counter `$y`   -> singular integer field `counter_y`
//! - set `#z`       -> repeated message field `set_z` of SetTuple shape
//!                     (`repeated string values`)
//! - multiset `&w`  -> repeated message field `multiset_w` of MultisetTuple
//!                     shape (`repeated string values`, integer `count`)
//! - HLL `^v`       -> singular message field `hll_v` of Hll shape
//!                     (integer `precision`, bool `empty`, bytes `bins`)
//!
//! Sets and multisets must additionally receive a single tuple shape from
//! every yield site, since the serializer emits one column layout per
//! destination.

use crate::ast::strip_sigil;
use crate::error::CompileError;
use crate::program::Program;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtoLabel {
    Singular,
    Optional,
    Required,
    Repeated,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProtoField {
    pub label: ProtoLabel,
    pub type_name: String,
    pub name: String,
}

impl ProtoField {
    pub fn is_repeated(&self) -> bool {
        self.label == ProtoLabel::Repeated
    }

    pub fn is_integer(&self) -> bool {
        matches!(
            self.type_name.as_str(),
            "int32"
                | "int64"
                | "uint32"
                | "uint64"
                | "sint32"
                | "sint64"
                | "fixed32"
                | "fixed64"
                | "sfixed32"
                | "sfixed64"
        )
    }

    pub fn is_string(&self) -> bool {
        self.type_name == "string"
    }

    pub fn is_bool(&self) -> bool {
        self.type_name == "bool"
    }

    pub fn is_bytes(&self) -> bool {
        self.type_name == "bytes"
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProtoMessage {
    pub name: String,
    pub fields: Vec<ProtoField>,
}

impl ProtoMessage {
    pub fn field(&self, name: &str) -> Option<&ProtoField> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// All messages of a schema file (plus merged imports), by simple name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProtoSchema {
    messages: BTreeMap<String, ProtoMessage>,
    /// Paths of `import` statements, for the caller to resolve and merge.
    pub imports: Vec<String>,
}

impl ProtoSchema {
    pub fn parse(text: &str) -> Result<ProtoSchema, CompileError> {
        let tokens = scan(text);
        let mut parser = SchemaParser { tokens, pos: 0 };
        parser.parse()
    }

    pub fn message(&self, name: &str) -> Option<&ProtoMessage> {
        self.messages.get(name)
    }

    /// Merge another schema's messages (used for imports).
    pub fn merge(&mut self, other: ProtoSchema) {
        self.messages.extend(other.messages);
    }

    /// Resolve a field's message type, stripping any package qualifier.
    fn message_of_field(&self, field: &ProtoField) -> Option<&ProtoMessage> {
        let simple = field
            .type_name
            .rsplit('.')
            .next()
            .unwrap_or(&field.type_name);
        self.messages.get(simple)
    }
}

fn schema_error(message: impl Into<String>) -> CompileError {
    CompileError::ProtoSchema {
        field: "<schema>".to_string(),
        reason: message.into(),
    }
}

/// Strip comments and split into identifier/punctuation tokens.
fn scan(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = text.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c == '/' && chars.get(i + 1) == Some(&'/') {
            while i < chars.len() && chars[i] != '\n' {
                i += 1;
            }
        } else if c == '/' && chars.get(i + 1) == Some(&'*') {
            i += 2;
            while i + 1 < chars.len() && !(chars[i] == '*' && chars[i + 1] == '/') {
                i += 1;
            }
            i = (i + 2).min(chars.len());
        } else if c == '"' || c == '\'' {
            let quote = c;
            i += 1;
            let mut s = String::new();
            while i < chars.len() && chars[i] != quote {
                s.push(chars[i]);
                i += 1;
            }
            i += 1;
            tokens.push(format!("\"{}", s)); // quoted marker prefix
        } else if c.is_ascii_alphanumeric() || c == '_' || c == '.' {
            let mut word = String::new();
            while i < chars.len()
                && (chars[i].is_ascii_alphanumeric() || chars[i] == '_' || chars[i] == '.')
            {
                word.push(chars[i]);
                i += 1;
            }
            tokens.push(word);
        } else if c.is_whitespace() {
            i += 1;
        } else {
            tokens.push(c.to_string());
            i += 1;
        }
    }
    tokens
}

struct SchemaParser {
    tokens: Vec<String>,
    pos: usize,
}

impl SchemaParser {
    fn parse(&mut self) -> Result<ProtoSchema, CompileError> {
        let mut schema = ProtoSchema::default();
        while let Some(token) = self.next() {
            match token.as_str() {
                "syntax" | "option" | "package" => self.skip_statement(),
                "import" => {
                    // import ["public"] "path";
                    while let Some(t) = self.next() {
                        if t == ";" {
                            break;
                        }
                        if let Some(path) = t.strip_prefix('"') {
                            schema.imports.push(path.to_string());
                        }
                    }
                }
                "message" => self.parse_message(&mut schema)?,
                "enum" => self.skip_block()?,
                ";" => {}
                other => {
                    return Err(schema_error(format!(
                        "unexpected '{}' at top level of schema",
                        other
                    )));
                }
            }
        }
        Ok(schema)
    }

    fn next(&mut self) -> Option<String> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn peek(&self) -> Option<&str> {
        self.tokens.get(self.pos).map(String::as_str)
    }

    fn expect(&mut self, token: &str) -> Result<(), CompileError> {
        match self.next() {
            Some(t) if t == token => Ok(()),
            Some(t) => Err(schema_error(format!("expected '{}', got '{}'", token, t))),
            None => Err(schema_error(format!("expected '{}', got end of schema", token))),
        }
    }

    fn skip_statement(&mut self) {
        while let Some(t) = self.next() {
            if t == ";" {
                break;
            }
        }
    }

    /// Skip a `{ ... }` block (leading tokens up to the brace included).
    fn skip_block(&mut self) -> Result<(), CompileError> {
        while let Some(t) = self.next() {
            if t == "{" {
                let mut depth = 1;
                while depth > 0 {
                    match self.next() {
                        Some(t) if t == "{" => depth += 1,
                        Some(t) if t == "}" => depth -= 1,
                        Some(_) => {}
                        None => return Err(schema_error("unbalanced braces")),
                    }
                }
                return Ok(());
            }
            if t == ";" {
                return Ok(());
            }
        }
        Ok(())
    }

    fn parse_message(&mut self, schema: &mut ProtoSchema) -> Result<(), CompileError> {
        let name = self
            .next()
            .ok_or_else(|| schema_error("message without a name"))?;
        self.expect("{")?;
        let mut fields = Vec::new();
        loop {
            match self.peek() {
                None => return Err(schema_error(format!("unterminated message '{}'", name))),
                Some("}") => {
                    self.pos += 1;
                    break;
                }
                Some("message") => {
                    self.pos += 1;
                    self.parse_message(schema)?;
                }
                Some("enum") => {
                    self.pos += 1;
                    self.skip_block()?;
                }
                Some("option") | Some("reserved") => {
                    self.pos += 1;
                    self.skip_statement();
                }
                Some("oneof") => {
                    // Fields inside a oneof are singular fields of the parent.
                    self.pos += 1;
                    self.next(); // oneof name
                    self.expect("{")?;
                    while self.peek().is_some() && self.peek() != Some("}") {
                        fields.push(self.parse_field(ProtoLabel::Singular)?);
                    }
                    self.expect("}")?;
                }
                Some(";") => {
                    self.pos += 1;
                }
                _ => {
                    let label = match self.peek() {
                        Some("repeated") => {
                            self.pos += 1;
                            ProtoLabel::Repeated
                        }
                        Some("optional") => {
                            self.pos += 1;
                            ProtoLabel::Optional
                        }
                        Some("required") => {
                            self.pos += 1;
                            ProtoLabel::Required
                        }
                        _ => ProtoLabel::Singular,
                    };
                    fields.push(self.parse_field(label)?);
                }
            }
        }
        schema.messages.insert(name.clone(), ProtoMessage { name, fields });
        Ok(())
    }

    /// `type name = number [options];`
    fn parse_field(&mut self, label: ProtoLabel) -> Result<ProtoField, CompileError> {
        let mut type_name = self
            .next()
            .ok_or_else(|| schema_error("field without a type"))?;
        if type_name == "map" {
            // map<k, v> — capture the whole generic as the type name.
            self.expect("<")?;
            let mut inner = Vec::new();
            while let Some(t) = self.next() {
                if t == ">" {
                    break;
                }
                inner.push(t);
            }
            type_name = format!("map<{}>", inner.join(""));
        }
        let name = self
            .next()
            .ok_or_else(|| schema_error("field without a name"))?;
        self.expect("=")?;
        self.next(); // field number
        // Field options `[...]` and the terminator.
        while let Some(t) = self.next() {
            if t == ";" {
                break;
            }
        }
        Ok(ProtoField {
            label,
            type_name,
            name,
        })
    }
}

// ============================================================================
//                              VALIDATION
// ============================================================================

fn field_error(field: &str, reason: impl Into<String>) -> CompileError {
    CompileError::ProtoSchema {
        field: field.to_string(),
        reason: reason.into(),
    }
}

/// Check the program's result variables against the target message.
pub fn validate_fields(
    program: &Program,
    schema: &ProtoSchema,
    message_name: &str,
) -> Result<(), CompileError> {
    let message = schema
        .message(message_name)
        .ok_or_else(|| field_error(message_name, "message not found in schema"))?;

    for var in &program.groupby_vars {
        if !var.starts_with('%') {
            return Err(field_error(
                var,
                "set-valued groupby variables are not representable in protobuf output",
            ));
        }
        let field_name = format!("scalar_{}", strip_sigil(var));
        let field = message
            .field(&field_name)
            .ok_or_else(|| field_error(&field_name, "missing from result message"))?;
        if !field.is_string() || field.is_repeated() {
            return Err(field_error(&field_name, "must be a singular string field"));
        }
    }

    for counter in &program.yield_counters {
        let field_name = format!("counter_{}", strip_sigil(counter));
        let field = message
            .field(&field_name)
            .ok_or_else(|| field_error(&field_name, "missing from result message"))?;
        if !field.is_integer() || field.is_repeated() {
            return Err(field_error(&field_name, "must be a singular integer field"));
        }
    }

    for set in &program.yield_sets {
        let field_name = format!("set_{}", set);
        let field = message
            .field(&field_name)
            .ok_or_else(|| field_error(&field_name, "missing from result message"))?;
        if !field.is_repeated() {
            return Err(field_error(&field_name, "must be repeated"));
        }
        let tuple = schema.message_of_field(field).ok_or_else(|| {
            field_error(&field_name, "must be a repeated message of SetTuple shape")
        })?;
        check_set_tuple_shape(&field_name, tuple)?;
        program.yield_tuple_shape(&format!("#{}", set))?;
    }

    for mset in &program.yield_multisets {
        let field_name = format!("multiset_{}", mset);
        let field = message
            .field(&field_name)
            .ok_or_else(|| field_error(&field_name, "missing from result message"))?;
        if !field.is_repeated() {
            return Err(field_error(&field_name, "must be repeated"));
        }
        let tuple = schema.message_of_field(field).ok_or_else(|| {
            field_error(
                &field_name,
                "must be a repeated message of MultisetTuple shape",
            )
        })?;
        check_set_tuple_shape(&field_name, tuple)?;
        let count = tuple.field("count").ok_or_else(|| {
            field_error(&field_name, "tuple message is missing integer 'count'")
        })?;
        if !count.is_integer() || count.is_repeated() {
            return Err(field_error(
                &field_name,
                "tuple 'count' must be a singular integer",
            ));
        }
        program.yield_tuple_shape(&format!("&{}", mset))?;
    }

    for hll in &program.yield_hlls {
        let field_name = format!("hll_{}", hll);
        let field = message
            .field(&field_name)
            .ok_or_else(|| field_error(&field_name, "missing from result message"))?;
        if field.is_repeated() {
            return Err(field_error(&field_name, "must not be repeated"));
        }
        let sketch = schema
            .message_of_field(field)
            .ok_or_else(|| field_error(&field_name, "must be a message of Hll shape"))?;
        let precision = sketch
            .field("precision")
            .ok_or_else(|| field_error(&field_name, "Hll message is missing 'precision'"))?;
        let empty = sketch
            .field("empty")
            .ok_or_else(|| field_error(&field_name, "Hll message is missing 'empty'"))?;
        let bins = sketch
            .field("bins")
            .ok_or_else(|| field_error(&field_name, "Hll message is missing 'bins'"))?;
        if !precision.is_integer() || !empty.is_bool() || !bins.is_bytes() {
            return Err(field_error(
                &field_name,
                "Hll shape is (integer precision, bool empty, bytes bins)",
            ));
        }
    }

    Ok(())
}

fn check_set_tuple_shape(field_name: &str, tuple: &ProtoMessage) -> Result<(), CompileError> {
    let values = tuple.field("values").ok_or_else(|| {
        field_error(field_name, "tuple message is missing repeated string 'values'")
    })?;
    if !values.is_repeated() || !values.is_string() {
        return Err(field_error(
            field_name,
            "tuple 'values' must be a repeated string field",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::normalize;
    use crate::parser::Parser;

    const SCHEMA: &str = r#"
        syntax = "proto2";
        package trck;

        // Tuple shapes shared by all result schemas.
        message SetTuple {
            repeated string values = 1;
        }
        message MultisetTuple {
            repeated string values = 1;
            optional uint64 count = 2;
        }
        message Hll {
            optional uint32 precision = 1;
            optional bool empty = 2;
            optional bytes bins = 3;
        }

        message Results {
            optional string scalar_u = 1;
            optional int64 counter_c = 2;
            repeated SetTuple set_s = 3;
            repeated MultisetTuple multiset_m = 4;
            optional Hll hll_h = 5;
        }
    "#;

    fn program(source: &str) -> Program {
        let ast = normalize(&Parser::new(source).unwrap().parse().unwrap()).unwrap();
        Program::analyze(&ast).unwrap()
    }

    #[test]
    fn test_parse_messages_and_fields() {
        let schema = ProtoSchema::parse(SCHEMA).unwrap();
        let results = schema.message("Results").unwrap();
        assert_eq!(results.fields.len(), 5);
        let set_s = results.field("set_s").unwrap();
        assert!(set_s.is_repeated());
        assert_eq!(set_s.type_name, "SetTuple");
        let counter = results.field("counter_c").unwrap();
        assert!(counter.is_integer());
        assert!(!counter.is_repeated());
    }

    #[test]
    fn test_parse_imports() {
        let schema =
            ProtoSchema::parse("syntax = \"proto2\";\nimport \"Tuple.proto\";\n").unwrap();
        assert_eq!(schema.imports, vec!["Tuple.proto"]);
    }

    #[test]
    fn test_validate_ok() {
        let p = program(
            "foreach %u in @users\n  S ->\n    receive\n      user = %u -> yield $c, yield a to #s, yield b to &m, yield c to ^h, repeat",
        );
        let schema = ProtoSchema::parse(SCHEMA).unwrap();
        validate_fields(&p, &schema, "Results").unwrap();
    }

    #[test]
    fn test_missing_counter_field() {
        let p = program("S ->\n  receive\n    * -> yield $other, repeat");
        let schema = ProtoSchema::parse(SCHEMA).unwrap();
        let err = validate_fields(&p, &schema, "Results").unwrap_err();
        match err {
            CompileError::ProtoSchema { field, .. } => assert_eq!(field, "counter_other"),
            other => panic!("expected ProtoSchema, got {:?}", other),
        }
    }

    #[test]
    fn test_repeated_counter_rejected() {
        let schema = ProtoSchema::parse(
            "message Results { repeated int64 counter_c = 1; }",
        )
        .unwrap();
        let p = program("S ->\n  receive\n    * -> yield $c, repeat");
        assert!(validate_fields(&p, &schema, "Results").is_err());
    }

    #[test]
    fn test_set_needs_tuple_shape() {
        let schema = ProtoSchema::parse(
            "message Results { repeated string set_s = 1; }",
        )
        .unwrap();
        let p = program("S ->\n  receive\n    * -> yield a to #s, repeat");
        assert!(validate_fields(&p, &schema, "Results").is_err());
    }

    #[test]
    fn test_tuple_arity_disagreement_rejected() {
        let p = program(concat!(
            "A ->\n  receive\n    * -> yield a, b to #s, B\n",
            "B ->\n  receive\n    * -> yield a to #s, repeat",
        ));
        let schema = ProtoSchema::parse(SCHEMA).unwrap();
        let err = validate_fields(&p, &schema, "Results").unwrap_err();
        assert!(matches!(err, CompileError::BadYield(_)));
    }

    #[test]
    fn test_message_not_found() {
        let schema = ProtoSchema::parse("message Other {}").unwrap();
        let p = program("S ->\n  receive\n    * -> repeat");
        let err = validate_fields(&p, &schema, "Results").unwrap_err();
        assert!(matches!(err, CompileError::ProtoSchema { .. }));
    }

    #[test]
    fn test_qualified_type_names_resolve() {
        let schema = ProtoSchema::parse(concat!(
            "message SetTuple { repeated string values = 1; }\n",
            "message Results { repeated trck.SetTuple set_s = 1; }",
        ))
        .unwrap();
        let p = program("S ->\n  receive\n    * -> yield a to #s, repeat");
        validate_fields(&p, &schema, "Results").unwrap();
    }
}
