//! trck compiler library.
//!
//! Compiles trck programs — finite-state pattern matchers over time-ordered
//! event trails — into C source that links against the fixed matcher
//! runtime. The pipeline:
//!
//! ```text
//! source (.tr)
//!   -> lexer + layout filter     (lexer)
//!   -> recursive-descent parser  (parser)
//!   -> normalizer                (normalize)   -> AST JSON (wire format)
//!   -> analyzer                  (program)
//!   -> code generators           (codegen)     -> matcher / header / proto C
//! ```
//!
//! The AST JSON between the front end and the code generators is a stable
//! wire format; [`compile_source`] produces it and the `*_from_json`
//! functions consume it, so the two halves can run in separate processes.
//!
//! # Example
//!
//! ```rust,ignore
//! let ast = trckc::compile_source("S ->\n  receive\n    * -> yield $c, repeat")?;
//! let program = trckc::Program::analyze(&ast)?;
//! let c_source = trckc::generate_matcher(&program, &[])?;
//! ```

pub mod ast;
pub mod codegen;
pub mod config;
pub mod error;
pub mod lexer;
pub mod normalize;
pub mod parser;
pub mod program;
pub mod proto_schema;

pub use ast::Ast;
pub use codegen::{escape_var_name, generate_header, generate_matcher, generate_proto};
pub use config::{CompilerConfig, ProtoDescriptor};
pub use error::CompileError;
pub use normalize::normalize;
pub use parser::Parser;
pub use program::Program;
pub use proto_schema::ProtoSchema;

use std::fs;
use tracing::debug;

/// Front end: source text to the flat-rule AST.
pub fn compile_source(source: &str) -> Result<Ast, CompileError> {
    let mut parser = Parser::new(source)?;
    let parsed = parser.parse()?;
    debug!(rules = parsed.rules.len(), "parsed program");
    let ast = normalize(&parsed)?;
    debug!(flat_rules = ast.rules.len(), "normalized program");
    Ok(ast)
}

pub fn ast_to_json(ast: &Ast) -> Result<String, CompileError> {
    serde_json::to_string(ast).map_err(|e| CompileError::Json(e.to_string()))
}

pub fn ast_from_json(json: &str) -> Result<Ast, CompileError> {
    serde_json::from_str(json).map_err(|e| CompileError::Json(e.to_string()))
}

/// `matcher` mode: AST JSON to the matcher C unit.
pub fn matcher_from_json(json: &str, config: &CompilerConfig) -> Result<String, CompileError> {
    let ast = ast_from_json(json)?;
    let program = Program::analyze(&ast)?;
    debug!(
        keys = program.kvs.len(),
        vars = program.vars.len(),
        "analyzed program"
    );
    generate_matcher(&program, &config.includes)
}

/// `header` mode: AST JSON to the header unit.
pub fn header_from_json(json: &str) -> Result<String, CompileError> {
    let ast = ast_from_json(json)?;
    let program = Program::analyze(&ast)?;
    generate_header(&program)
}

/// `proto` mode: AST JSON plus a schema descriptor to the protobuf unit.
pub fn proto_from_json(json: &str, config: &CompilerConfig) -> Result<String, CompileError> {
    let descriptor = config.proto.as_ref().ok_or_else(|| CompileError::Syntax {
        line: None,
        message: "protobuf generation requires a schema descriptor".to_string(),
    })?;
    let ast = ast_from_json(json)?;
    let program = Program::analyze(&ast)?;
    let schema = load_proto_schema(descriptor)?;
    generate_proto(&program, descriptor, &schema, &config.includes)
}

/// Read and parse the descriptor's schema file, merging resolvable imports
/// (relative to the schema's directory). Unresolvable imports are skipped;
/// validation reports any message that ends up missing.
pub fn load_proto_schema(descriptor: &ProtoDescriptor) -> Result<ProtoSchema, CompileError> {
    let text = fs::read_to_string(&descriptor.path).map_err(|e| CompileError::ProtoSchema {
        field: descriptor.path.display().to_string(),
        reason: format!("cannot read schema: {}", e),
    })?;
    let mut schema = ProtoSchema::parse(&text)?;
    let base = descriptor.path.parent().map(|p| p.to_path_buf());
    let imports = schema.imports.clone();
    for import in imports {
        let path = match &base {
            Some(base) => base.join(&import),
            None => std::path::PathBuf::from(&import),
        };
        match fs::read_to_string(&path) {
            Ok(text) => schema.merge(ProtoSchema::parse(&text)?),
            Err(e) => {
                debug!(import = %import, error = %e, "skipping unresolvable schema import");
            }
        }
    }
    Ok(schema)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Action;

    #[test]
    fn test_source_to_matcher_end_to_end() {
        let ast = compile_source(
            "S ->\n  receive\n    x = \"a\", timestamp < 10 -> yield $c, repeat",
        )
        .unwrap();
        let program = Program::analyze(&ast).unwrap();
        assert!(program.vars.is_empty());
        assert_eq!(program.kvs["x"].len(), 1);
        let c = generate_matcher(&program, &[]).unwrap();
        assert!(c.contains("results->c += 1;"));
    }

    #[test]
    fn test_json_wire_round_trip() {
        let ast = compile_source(concat!(
            "foreach %u in @users\n",
            "  A ->\n    receive\n      user = %u -> B\n",
            "  B ->\n    receive\n      * -> yield user to #seen, repeat",
        ))
        .unwrap();
        let json = ast_to_json(&ast).unwrap();
        let back = ast_from_json(&json).unwrap();
        assert_eq!(back, ast);
        // The wire format carries legacy string actions.
        assert!(json.contains("\"restart-from-next(1)\""));
    }

    #[test]
    fn test_restart_semantics_flat_shape() {
        let ast = compile_source(
            "A ->\n  receive\n    * -> B\nB ->\n  receive\n    * -> repeat",
        )
        .unwrap();
        assert_eq!(ast.rules.len(), 2);
        assert_eq!(
            ast.rules[0].clauses[0].action,
            Some(Action::RestartFromNext(1))
        );
        assert_eq!(ast.rules[1].clauses[0].action, Some(Action::Repeat));
    }

    #[test]
    fn test_compile_twice_is_byte_identical() {
        let source = concat!(
            "foreach %u, #good in @pairs\n",
            "  W ->\n    window\n      A ->\n        receive\n",
            "          user = %u, category in #good -> yield $hits, yield user, item to #pairs, B\n",
            "      B ->\n        receive\n          * -> repeat\n    after 7d -> quit",
        );
        let ast1 = compile_source(source).unwrap();
        let ast2 = compile_source(source).unwrap();
        let p1 = Program::analyze(&ast1).unwrap();
        let p2 = Program::analyze(&ast2).unwrap();
        assert_eq!(ast_to_json(&ast1).unwrap(), ast_to_json(&ast2).unwrap());
        assert_eq!(
            generate_matcher(&p1, &[]).unwrap(),
            generate_matcher(&p2, &[]).unwrap()
        );
        assert_eq!(
            generate_header(&p1).unwrap(),
            generate_header(&p2).unwrap()
        );
    }

    #[test]
    fn test_matcher_from_json_mode() {
        let json = r#"{"rules": [{"n": 0, "name": "S", "clauses": [{"attrs": {"x": ["a"]}, "action": "quit"}]}]}"#;
        let config = CompilerConfig::new().with_include("groupby.h");
        let c = matcher_from_json(json, &config).unwrap();
        assert!(c.contains("match_trail"));
        assert!(c.contains("ids->value_x_a"));
        assert!(c.contains("#include \"groupby.h\""));
    }

    #[test]
    fn test_header_from_json_mode() {
        let json = r#"{"rules": [{"n": 0, "name": "S", "clauses": [{"attrs": {}, "action": "repeat", "yield": [{"dst": "$c"}]}]}]}"#;
        let h = header_from_json(json).unwrap();
        assert!(h.contains("uint64_t c;"));
        assert!(h.contains("match_add_results"));
    }

    #[test]
    fn test_bad_json_reports_json_error() {
        assert!(matches!(
            matcher_from_json("{not json", &CompilerConfig::new()),
            Err(CompileError::Json(_))
        ));
    }

    #[test]
    fn test_proto_mode_requires_descriptor() {
        let json = r#"{"rules": [{"n": 0, "name": "S", "clauses": [{"attrs": {}, "action": "repeat"}]}]}"#;
        assert!(matches!(
            proto_from_json(json, &CompilerConfig::new()),
            Err(CompileError::Syntax { .. })
        ));
    }

    #[test]
    fn test_load_proto_schema_resolves_imports() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("Tuple.proto"),
            "message SetTuple { repeated string values = 1; }\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("Results.proto"),
            "import \"Tuple.proto\";\nmessage Results { repeated SetTuple set_s = 1; }\n",
        )
        .unwrap();
        let descriptor = ProtoDescriptor {
            package: "trck".to_string(),
            message: "Results".to_string(),
            path: dir.path().join("Results.proto"),
        };
        let schema = load_proto_schema(&descriptor).unwrap();
        assert!(schema.message("Results").is_some());
        assert!(schema.message("SetTuple").is_some());
    }

    #[test]
    fn test_load_proto_schema_missing_file() {
        let descriptor = ProtoDescriptor {
            package: "trck".to_string(),
            message: "Results".to_string(),
            path: std::path::PathBuf::from("/nonexistent/Results.proto"),
        };
        assert!(matches!(
            load_proto_schema(&descriptor),
            Err(CompileError::ProtoSchema { .. })
        ));
    }
}
