//! Companion header unit (`fns_generated.h`).
//!
//! Declares the packed structs shared between the matcher and the host,
//! the groupby introspection constants, and the result aggregation inlines
//! (`match_add_results` and friends) the host calls under its own
//! synchronization when reconciling per-trail results.

use super::{c_quote, escape_var_name, Writer, EXPIRES_NEVER};
use crate::ast::{strip_sigil, var_kind, VarKind};
use crate::error::CompileError;
use crate::program::Program;

pub fn generate_header(program: &Program) -> Result<String, CompileError> {
    let mut w = Writer::new();
    w.o("#ifndef __OUT_TRAILDB_H__");
    w.o("#define __OUT_TRAILDB_H__");
    w.o(format!("#define EXPIRES_NEVER {}", EXPIRES_NEVER));
    w.o("#include <json-c/json.h>");
    w.o("#include \"utils.h\"");
    w.blank();

    emit_structs(&mut w, program)?;

    w.o(format!(
        "static inline bool match_no_rewind() {{ return {}; }}",
        if program.no_rewind { "true" } else { "false" }
    ));
    w.o(format!(
        "static int match_num_groupby_vars = {};",
        program.groupby_vars.len()
    ));
    w.o(format!(
        "static int match_merge_results = {};",
        if program.merge_results() { 1 } else { 0 }
    ));
    let groupby_vars: Vec<String> = program
        .groupby_vars
        .iter()
        .map(|v| format!("\"{}\"", c_quote(v)))
        .collect();
    w.o(format!(
        "static char *match_groupby_vars[] = {{{}}};",
        groupby_vars.join(", ")
    ));
    let array_param = match program.groupby.as_ref().and_then(|g| g.values.as_ref()) {
        Some(values) => format!("\"{}\"", c_quote(values)),
        None => "NULL".to_string(),
    };
    w.o(format!(
        "static char *match_groupby_array_param = {};",
        array_param
    ));
    let free_vars = program.free_vars();
    w.o(format!(
        "static int match_num_free_vars = {};",
        free_vars.len()
    ));
    let free_vars: Vec<String> = free_vars
        .iter()
        .map(|v| format!("\"{}\"", c_quote(v)))
        .collect();
    w.o(format!(
        "static char *match_free_vars[] = {{{}}};",
        free_vars.join(", ")
    ));
    w.blank();

    emit_add_results(&mut w, program);
    emit_free_results(&mut w, program);
    emit_is_zero_result(&mut w, program);

    w.o("#endif");
    Ok(w.finish())
}

fn emit_structs(w: &mut Writer, program: &Program) -> Result<(), CompileError> {
    w.o("#pragma pack (push, 1)");
    w.blank();
    w.o("typedef struct {");
    w.o("    timestamp_t window_expires;");
    w.o("    int id;");
    w.o("} outer_info_t;");
    w.blank();

    w.open("struct results_t");
    for counter in &program.yield_counters {
        w.o(format!("uint64_t {};", strip_sigil(counter)));
    }
    for set in &program.yield_sets {
        w.o(format!("set_t set_{};", set));
    }
    for mset in &program.yield_multisets {
        w.o(format!("set_t mset_{};", mset));
    }
    for hll in &program.yield_hlls {
        w.o(format!("hyperloglog_t *hll_{};", hll));
    }
    w.close_stmt();
    w.blank();

    w.open("struct kvids_t");
    for key in program.kvs.keys().filter(|k| *k != "timestamp") {
        w.o(format!("int key_{};", key));
    }
    for (key, values) in program.kvs.iter().filter(|(k, _)| *k != "timestamp") {
        for value in values {
            w.o(format!("int value_{}_{};", key, escape_var_name(value)));
        }
    }
    for var in &program.vars {
        let name = strip_sigil(var);
        match var_kind(var) {
            Some(VarKind::Scalar) => {
                w.o(format!("int var_{};", name));
                w.o(format!("char *varstr_{};", name));
                w.o(format!("int varstrlen_{};", name));
            }
            Some(VarKind::Set) | Some(VarKind::Multiset) => {
                w.o(format!("Pvoid_t var_{};", name));
            }
            _ => {
                return Err(CompileError::Syntax {
                    line: None,
                    message: format!("invalid variable '{}' in program", var),
                });
            }
        }
    }
    w.close_stmt();
    w.blank();

    w.open("struct state_t");
    if !program.no_rewind {
        w.o("int start;");
    }
    w.o("int ri;");
    w.o("timestamp_t window_expires;");
    if program.has_window_rules {
        w.o(format!(
            "outer_info_t outers[{}];",
            program.window_rule_ids.len() + 1
        ));
    }
    w.close_stmt();
    w.blank();
    w.o("#pragma pack (pop)");
    w.blank();
    Ok(())
}

fn emit_add_results(w: &mut Writer, program: &Program) {
    w.open("static inline void match_add_results(results_t *dst, const results_t *src)");
    for counter in &program.yield_counters {
        let name = strip_sigil(counter);
        w.o(format!("dst->{} += src->{};", name, name));
    }
    for set in &program.yield_sets {
        w.o(format!("set_add(&dst->set_{}, &src->set_{});", set, set));
    }
    for mset in &program.yield_multisets {
        w.o(format!("mset_add(&dst->mset_{}, &src->mset_{});", mset, mset));
    }
    for hll in &program.yield_hlls {
        w.o(format!(
            "dst->hll_{} = hll_merge(dst->hll_{}, src->hll_{});",
            hll, hll, hll
        ));
    }
    w.close();
    w.blank();
}

fn emit_free_results(w: &mut Writer, program: &Program) {
    w.open("static inline void match_free_results(results_t *dst)");
    for set in &program.yield_sets {
        w.o(format!("set_free(&dst->set_{});", set));
    }
    for mset in &program.yield_multisets {
        w.o(format!("set_free(&dst->mset_{});", mset));
    }
    for hll in &program.yield_hlls {
        w.o(format!("hll_free(dst->hll_{});", hll));
    }
    w.close();
    w.blank();
}

fn emit_is_zero_result(w: &mut Writer, program: &Program) {
    w.open("static inline bool match_is_zero_result(results_t *r)");
    w.o("return true");
    for counter in &program.yield_counters {
        w.o(format!("&& (r->{} == 0)", strip_sigil(counter)));
    }
    for set in &program.yield_sets {
        w.o(format!("&& (r->set_{} == NULL)", set));
    }
    for mset in &program.yield_multisets {
        w.o(format!("&& (r->mset_{} == NULL)", mset));
    }
    for hll in &program.yield_hlls {
        w.o(format!("&& (r->hll_{} == NULL)", hll));
    }
    w.o(";");
    w.close();
    w.blank();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::normalize;
    use crate::parser::Parser;

    fn header(source: &str) -> String {
        let ast = normalize(&Parser::new(source).unwrap().parse().unwrap()).unwrap();
        let program = Program::analyze(&ast).unwrap();
        generate_header(&program).unwrap()
    }

    #[test]
    fn test_result_struct_fields() {
        let h = header(
            "S ->\n  receive\n    * -> yield $c, yield a to #s, yield b to &m, yield c to ^h, repeat",
        );
        assert!(h.contains("uint64_t c;"));
        assert!(h.contains("set_t set_s;"));
        assert!(h.contains("set_t mset_m;"));
        assert!(h.contains("hyperloglog_t *hll_h;"));
        assert!(h.contains("#pragma pack (push, 1)"));
    }

    #[test]
    fn test_groupby_constants() {
        let h = header(
            "foreach %u in @users\n  S ->\n    receive\n      user = %u, x = %v -> repeat",
        );
        assert!(h.contains("static int match_num_groupby_vars = 1;"));
        assert!(h.contains("static char *match_groupby_vars[] = {\"%u\"};"));
        assert!(h.contains("static char *match_groupby_array_param = \"@users\";"));
        assert!(h.contains("static int match_num_free_vars = 1;"));
        assert!(h.contains("static char *match_free_vars[] = {\"%v\"};"));
        assert!(h.contains("static int match_merge_results = 0;"));
    }

    #[test]
    fn test_merged_results_flag() {
        let h = header(
            "foreach %u in @users merged results\n  S ->\n    receive\n      user = %u -> repeat",
        );
        assert!(h.contains("static int match_merge_results = 1;"));
    }

    #[test]
    fn test_no_groupby_defaults() {
        let h = header("S ->\n  receive\n    * -> repeat");
        assert!(h.contains("static int match_num_groupby_vars = 0;"));
        assert!(h.contains("static char *match_groupby_array_param = NULL;"));
        assert!(h.contains("static inline bool match_no_rewind() { return true; }"));
    }

    #[test]
    fn test_state_struct_window_slots() {
        let h = header(
            "W ->\n  window\n    A ->\n      receive\n        * -> repeat\n  after 1d -> quit",
        );
        assert!(h.contains("outer_info_t outers[2];"));
        assert!(!h.contains("int start;"));
    }

    #[test]
    fn test_kvids_value_escaping() {
        let h = header("S ->\n  receive\n    path = \"/cart\" -> repeat");
        assert!(h.contains("int key_path;"));
        assert!(h.contains("int value_path__2fcart;"));
    }

    #[test]
    fn test_aggregation_inlines() {
        let h = header(
            "S ->\n  receive\n    * -> yield $c, yield a to #s, yield b to &m, yield c to ^h, repeat",
        );
        assert!(h.contains("dst->c += src->c;"));
        assert!(h.contains("set_add(&dst->set_s, &src->set_s);"));
        assert!(h.contains("mset_add(&dst->mset_m, &src->mset_m);"));
        assert!(h.contains("dst->hll_h = hll_merge(dst->hll_h, src->hll_h);"));
        assert!(h.contains("set_free(&dst->set_s);"));
        assert!(h.contains("hll_free(dst->hll_h);"));
        assert!(h.contains("&& (r->c == 0)"));
        assert!(h.contains("&& (r->hll_h == NULL)"));
    }
}
