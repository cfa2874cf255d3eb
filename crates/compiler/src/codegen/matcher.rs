//! Matcher translation unit.
//!
//! Lowers a [`Program`] to the C unit implementing `match_trail` plus the
//! identifier/parameter/result hooks the host links against. The scanning
//! loop is a labeled jump table: every rule gets a `RULE_START_rN` entry
//! label and a `RULE_CONT_rN` continuation label, and a dispatch switch on
//! `state->ri` resumes a suspended trail at the right continuation.
//!
//! Window rules do not scan by themselves. Their entry label pushes an
//! outer descriptor (remaining time + rule id) and falls through to the
//! first inner rule; every receive loop sweeps the open outers and fires a
//! window's `after` action once its deadline passes.

use super::{c_quote, escape_var_name, Writer, EXPIRES_NEVER};
use crate::ast::{
    strip_sigil, var_kind, Action, AfterBlock, Clause, CmpRhs, Guard, LiteralValue, VarKind,
    Yield, YieldTerm,
};
use crate::error::CompileError;
use crate::program::Program;

/// Generate the matcher unit. `includes` are extra user headers appended to
/// the standard prologue includes.
pub fn generate_matcher(program: &Program, includes: &[String]) -> Result<String, CompileError> {
    let mut emitter = MatcherGen {
        w: Writer::new(),
        p: program,
        tmp: 0,
    };
    emitter.emit(includes)?;
    Ok(emitter.w.finish())
}

struct MatcherGen<'a> {
    w: Writer,
    p: &'a Program,
    /// Deterministic counter for fcall temporary names.
    tmp: usize,
}

impl<'a> MatcherGen<'a> {
    fn emit(&mut self, includes: &[String]) -> Result<(), CompileError> {
        self.emit_prologue(includes);
        self.emit_db_init();
        self.emit_trail_init();
        self.emit_is_initial_state();
        self.emit_set_param();
        self.emit_set_list_param();
        self.emit_get_param_id();
        self.emit_get_param_field();
        self.emit_free_params();
        self.emit_save_result();
        self.emit_same_state();
        self.emit_result_size();
        self.emit_external_declarations();
        self.emit_match_trail()?;
        Ok(())
    }

    fn list_vars(&self) -> impl Iterator<Item = &String> {
        self.p.vars.iter().filter(|v| {
            matches!(var_kind(v), Some(VarKind::Set) | Some(VarKind::Multiset))
        })
    }

    /// The rule's after block with the default action filled in: a rule
    /// whose window lapses with no explicit target restarts itself.
    fn effective_after(&self, ri: usize) -> (Vec<Yield>, Action) {
        let after = self.p.rules[ri].after.clone().unwrap_or(AfterBlock {
            yields: Vec::new(),
            action: None,
        });
        let action = match after.action {
            Some(Action::RestartFromHere(None)) | None => Action::RestartFromHere(Some(ri)),
            Some(action) => action,
        };
        (after.yields, action)
    }

    // ------------------------------------------------------------------
    // Prologue and hooks
    // ------------------------------------------------------------------

    fn emit_prologue(&mut self, includes: &[String]) {
        self.w.o("#include <stdint.h>");
        self.w.o("#include <stdbool.h>");
        self.w.o("#include <string.h>");
        self.w.o("#include <stdio.h>");
        self.w.o("#include <Judy.h>");
        self.w.blank();
        self.w.o("#include \"fns_generated.h\"");
        self.w.o("#include \"utils.h\"");
        for include in includes {
            self.w.o(format!("#include \"{}\"", include));
        }
        self.w.blank();
        self.w.o("#if DEBUG");
        self.w
            .o("#define DBG_PRINTF(msg, ...) fprintf(stderr, msg, ##__VA_ARGS__);");
        self.w.o("#else");
        self.w.o("#define DBG_PRINTF(msg, ...)");
        self.w.o("#endif");
        self.w.o("#define MIN(x,y) ((x) < (y) ? (x) : (y))");
        self.w.blank();
        self.w.open("bool set_contains(Pvoid_t set, int value)");
        self.w.o("int Rc_int;");
        self.w.o("J1T(Rc_int, set, value);");
        self.w.o("return Rc_int == 1;");
        self.w.close();
        self.w.blank();
    }

    fn emit_db_init(&mut self) {
        self.w.open("void match_db_init(kvids_t *ids, db_t *db)");
        for key in self.p.kvs.keys().filter(|k| *k != "timestamp") {
            self.w.o(format!(
                "ids->key_{} = db_get_key_id(\"{}\", db);",
                key,
                c_quote(key)
            ));
        }
        for (key, values) in self.p.kvs.iter().filter(|(k, _)| *k != "timestamp") {
            for value in values {
                self.w.o(format!(
                    "ids->value_{}_{} = db_get_value_id(\"{}\", {}, ids->key_{}, db);",
                    key,
                    escape_var_name(value),
                    c_quote(value),
                    value.len(),
                    key
                ));
            }
        }
        for var in &self.p.vars {
            let name = strip_sigil(var);
            match var_kind(var) {
                Some(VarKind::Scalar) => {
                    self.w.o(format!("ids->var_{} = -1;", name));
                    self.w.o(format!("ids->varstr_{} = 0;", name));
                    self.w.o(format!("ids->varstrlen_{} = 0;", name));
                }
                _ => {
                    self.w.o(format!("ids->var_{} = NULL;", name));
                }
            }
        }
        self.w.close();
        self.w.blank();
    }

    fn emit_trail_init(&mut self) {
        self.w.open("void match_trail_init(state_t *state)");
        self.w
            .o(format!("state->window_expires = {};", EXPIRES_NEVER));
        if !self.p.no_rewind {
            self.w.o("state->start = 0;");
        }
        self.w
            .o(format!("state->ri = {};", self.p.entrypoint_id));
        if self.p.has_window_rules {
            self.w.o("state->outers[0].id = -1;");
            self.w.o("state->outers[0].window_expires = 0;");
        }
        self.w.close();
        self.w.blank();
    }

    fn emit_is_initial_state(&mut self) {
        self.w.open("bool match_is_initial_state(state_t *state)");
        self.w.o(format!(
            "if (state->window_expires != 0 && state->window_expires != {}) return false;",
            EXPIRES_NEVER
        ));
        if !self.p.no_rewind {
            self.w.o("if (state->start != 0) return false;");
        }
        self.w.o(format!(
            "if (state->ri != {}) return false;",
            self.p.entrypoint_id
        ));
        if self.p.has_window_rules {
            self.w.o("if (state->outers[0].id != -1) return false;");
        }
        self.w.o("return true;");
        self.w.close();
        self.w.blank();
    }

    fn emit_set_param(&mut self) {
        self.w.open(
            "int match_set_param(int param_id, int value, kvids_t *ids, char *string_val, int string_val_len)",
        );
        self.w.open("switch (param_id)");
        for (i, var) in self.p.vars.iter().enumerate() {
            if var_kind(var) == Some(VarKind::Scalar) {
                let name = strip_sigil(var);
                self.w
                    .o(format!("case {}: ids->var_{} = value;", i, name));
                self.w.o(format!("ids->varstr_{} = string_val;", name));
                self.w
                    .o(format!("ids->varstrlen_{} = string_val_len;", name));
                self.w.o("break;");
            }
        }
        self.w.close();
        self.w.o("return -1;");
        self.w.close();
        self.w.blank();
    }

    fn emit_set_list_param(&mut self) {
        self.w
            .open("int match_set_list_param(int param_id, Pvoid_t value, kvids_t *ids)");
        self.w.open("switch (param_id)");
        for (i, var) in self.p.vars.iter().enumerate() {
            if matches!(var_kind(var), Some(VarKind::Set) | Some(VarKind::Multiset)) {
                self.w.o(format!(
                    "case {}: ids->var_{} = value; break;",
                    i,
                    strip_sigil(var)
                ));
            }
        }
        self.w.close();
        self.w.o("return -1;");
        self.w.close();
        self.w.blank();
    }

    fn emit_get_param_id(&mut self) {
        self.w.open("int match_get_param_id(const char *param)");
        for (i, var) in self.p.vars.iter().enumerate() {
            self.w.open(format!(
                "if (strcmp(param, \"{}\") == 0)",
                c_quote(var)
            ));
            self.w.o(format!("return {};", i));
            self.w.close();
        }
        self.w.o("return -1;");
        self.w.close();
        self.w.blank();
    }

    fn emit_get_param_field(&mut self) {
        self.w.open("char *match_get_param_field(int param_id)");
        self.w.open("switch (param_id)");
        for (i, var) in self.p.vars.iter().enumerate() {
            // A variable that is yielded but never used in a condition has
            // no inferred field.
            if let Some(field) = self.p.var_fields.get(var) {
                self.w.o(format!(
                    "case {}: return \"{}\"; break;",
                    i,
                    c_quote(field)
                ));
            }
        }
        self.w.close();
        self.w.o("return 0;");
        self.w.close();
        self.w.blank();
    }

    fn emit_free_params(&mut self) {
        self.w.open("void match_free_params(kvids_t *ids)");
        if self.list_vars().next().is_some() {
            self.w.o("int Rc_word;");
        }
        for var in &self.p.vars {
            let name = strip_sigil(var);
            match var_kind(var) {
                Some(VarKind::Scalar) => self.w.o(format!("ids->var_{} = -1;", name)),
                _ => self.w.o(format!("J1FA(Rc_word, ids->var_{});", name)),
            }
        }
        self.w.close();
        self.w.blank();
    }

    fn emit_save_result(&mut self) {
        self.w.open(
            "void match_save_result(results_t *results, void *arg, \
             void (*save_int)(void *, char *, int64_t), \
             void (*save_set)(void *, char *, set_t *), \
             void (*save_multiset)(void *, char *, set_t *), \
             void (*save_hll)(void *, char *, hyperloglog_t *))",
        );
        for counter in &self.p.yield_counters {
            self.w.o(format!(
                "save_int(arg, \"{}\", results->{});",
                counter,
                strip_sigil(counter)
            ));
        }
        for set in &self.p.yield_sets {
            self.w
                .o(format!("save_set(arg, \"#{}\", &results->set_{});", set, set));
        }
        for mset in &self.p.yield_multisets {
            self.w.o(format!(
                "save_multiset(arg, \"&{}\", &results->mset_{});",
                mset, mset
            ));
        }
        for hll in &self.p.yield_hlls {
            self.w
                .o(format!("save_hll(arg, \"^{}\", results->hll_{});", hll, hll));
        }
        self.w.close();
        self.w.blank();
    }

    fn emit_same_state(&mut self) {
        self.w
            .open("bool match_same_state(state_t *a, state_t *b)");
        self.w.o("if (a->ri != b->ri) return false;");
        self.w
            .o("if (a->window_expires != b->window_expires) return false;");
        if !self.p.no_rewind {
            self.w.o("if (a->start != b->start) return false;");
        }
        // Outer descriptors compare up to the first sentinel.
        for i in 0..self.p.window_rule_ids.len() {
            self.w
                .o(format!("if (a->outers[{}].id != b->outers[{}].id) return false;", i, i));
            self.w
                .o(format!("if (a->outers[{}].id == -1) return true;", i));
            self.w.o(format!(
                "if (a->outers[{}].window_expires != b->outers[{}].window_expires) return false;",
                i, i
            ));
        }
        self.w.o("return true;");
        self.w.close();
        self.w.blank();
    }

    fn emit_result_size(&mut self) {
        self.w.open("size_t match_get_result_size()");
        self.w.o("return sizeof(results_t);");
        self.w.close();
        self.w.blank();
    }

    fn emit_external_declarations(&mut self) {
        for (name, arity) in &self.p.externals {
            let mut args = vec!["char *", "int"];
            for _ in 0..*arity {
                args.push("char *");
                args.push("int");
            }
            self.w
                .o(format!("int {}({});", name, args.join(", ")));
        }
        if !self.p.externals.is_empty() {
            self.w.blank();
        }
    }

    // ------------------------------------------------------------------
    // The matching loop
    // ------------------------------------------------------------------

    fn emit_match_trail(&mut self) -> Result<(), CompileError> {
        self.w.open(
            "int match_trail(state_t *state, results_t *results, kvids_t *ids, ctx_t *ctx)",
        );
        self.w.o("int abort = 0;");
        self.w.o("timestamp_t timestamp = 0;");
        self.w.o("item_t item = 0;");
        self.w.open("switch (state->ri)");
        for i in 0..self.p.rules.len() {
            self.w.o(format!("case {}: goto RULE_CONT_r{};", i, i));
        }
        self.w.o("case -1: abort = 1; goto STOP;");
        self.w.close();
        for ri in 0..self.p.rules.len() {
            self.emit_rule_block(ri)?;
        }
        self.w.label("STOP");
        self.w
            .o(r#"DBG_PRINTF("================== STOP =================\n");"#);
        self.w.o("return abort;");
        self.w.close();
        Ok(())
    }

    fn emit_rule_block(&mut self, ri: usize) -> Result<(), CompileError> {
        let rule = &self.p.rules[ri];
        self.w.label(format!("RULE_START_r{}", ri));
        self.emit_enter_rule(ri);
        self.w.label(format!("RULE_CONT_r{}", ri));

        if rule.is_window() {
            // Window rules have no scanning body; control falls through to
            // the first inner rule.
            return Ok(());
        }

        self.w.o(format!("state->ri = {};", ri));
        self.w.o(format!(
            r#"DBG_PRINTF("entering rule \"{}\" at pos %" PRId64 ", timestamp %" PRIu64 "\n", ctx_get_position(ctx), timestamp);"#,
            c_quote(&rule.name)
        ));
        if ri == self.p.entrypoint_id && self.p.has_window_rules {
            self.w.o("state->outers[0].id = -1;");
            self.w.o("state->outers[0].window_expires = 0;");
        }
        self.w.o("if (ctx_end_of_trail(ctx)) goto STOP;");

        self.w.open("while (1)");
        self.w.o("item = ctx_get_item(ctx);");
        self.w.o("timestamp = item_get_timestamp(item);");
        self.w.o(
            "bool within_window = (state->window_expires == 0 || state->window_expires > timestamp);",
        );
        self.w.open("if (within_window && !item_is_empty(item))");
        for (ci, clause) in rule.clauses.iter().enumerate() {
            self.emit_clause(ri, ci, clause)?;
            self.w.label(format!("AFTER_CLAUSE_r{}_c{}", ri, ci));
        }
        self.w.o(format!(
            "error(\"non-exhaustive clauses at statement {}\");",
            c_quote(&rule.name)
        ));
        self.w.close();

        self.w.open("if (item_is_empty(item))");
        self.w.o("ctx_advance(ctx);");
        self.w.close();

        if self.p.has_window_rules {
            self.emit_outer_sweep()?;
        }

        let (after_yields, after_action) = self.effective_after(ri);
        self.emit_action_block(ri, "after", &after_yields, after_action)?;

        self.w.label(format!("CONTINUE_r{}", ri));
        self.w.o("if (ctx_end_of_trail(ctx)) goto STOP;");
        self.w.close();
        Ok(())
    }

    /// Window bookkeeping on rule entry.
    fn emit_enter_rule(&mut self, ri: usize) {
        let rule = &self.p.rules[ri];
        let duration = rule.window;
        if rule.is_window() {
            self.w.o(format!(
                r#"DBG_PRINTF("entering outer window at \"{}\"\n");"#,
                c_quote(&rule.name)
            ));
            self.w.open(
                "for (int i = 0; i < (int)(sizeof(state->outers) / sizeof(outer_info_t)); i++)",
            );
            self.w.open("if (state->outers[i].id == -1)");
            self.w.o(format!("state->outers[i].id = {};", ri));
            self.w.o("state->outers[i+1].id = -1;");
            match duration {
                Some(seconds) => {
                    self.w.open("if (state->window_expires > 0)");
                    self.w.o(format!(
                        "state->outers[i].window_expires = MIN(timestamp, state->window_expires) + {};",
                        seconds
                    ));
                    self.w.close();
                    self.w.open("else");
                    self.w.o(format!(
                        "state->outers[i].window_expires = timestamp + {};",
                        seconds
                    ));
                    self.w.close();
                }
                None => {
                    self.w.o(format!(
                        "state->outers[i].window_expires = {};",
                        EXPIRES_NEVER
                    ));
                }
            }
            self.w.o("break;");
            self.w.close();
            self.w.close();
        } else {
            match duration {
                Some(seconds) => {
                    self.w.open("if (state->window_expires > 0)");
                    self.w.o(format!(
                        "state->window_expires = MIN(timestamp, state->window_expires) + {};",
                        seconds
                    ));
                    self.w.close();
                    self.w.open("else");
                    self.w
                        .o(format!("state->window_expires = timestamp + {};", seconds));
                    self.w.close();
                }
                None => {
                    self.w
                        .o(format!("state->window_expires = {};", EXPIRES_NEVER));
                }
            }
        }
    }

    /// Expire open outer windows and run their `after` actions.
    fn emit_outer_sweep(&mut self) -> Result<(), CompileError> {
        self.w.open(
            "for (int i = 0; i < (int)(sizeof(state->outers) / sizeof(outer_info_t)); i++)",
        );
        self.w.open("if (state->outers[i].id == -1)");
        self.w.o("break;");
        self.w.close();
        self.w.open("else");
        self.w.o(
            "bool outer_within = (state->outers[i].window_expires == 0 || state->outers[i].window_expires > timestamp);",
        );
        self.w.open("if (!outer_within)");
        self.w.o("int outer_id = state->outers[i].id;");
        self.w.o("state->outers[i].id = -1;");
        self.w.o("state->outers[i].window_expires = 0;");
        self.w
            .o(r#"DBG_PRINTF("exiting outer %d\n", outer_id);"#);
        self.w.open("switch (outer_id)");
        let p = self.p;
        for &oi in &p.window_rule_ids {
            self.w.o(format!("case {}:", oi));
            let (after_yields, after_action) = self.effective_after(oi);
            self.emit_action_block(oi, "window after", &after_yields, after_action)?;
            self.w.o("break;");
        }
        self.w
            .o("default: error(\"not supposed to reach this\");");
        self.w.close();
        self.w.close();
        self.w.close();
        self.w.close();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Clauses
    // ------------------------------------------------------------------

    fn emit_clause(&mut self, ri: usize, ci: usize, clause: &Clause) -> Result<(), CompileError> {
        let succ = format!("CLAUSE_r{}_c{}_success", ri, ci);
        let fail = format!("AFTER_CLAUSE_r{}_c{}", ri, ci);
        self.w.open("");
        self.emit_condition_check(clause, &succ, &fail)?;
        self.w.label(&succ);
        self.w.open("");
        let action = clause
            .action
            .unwrap_or(Action::RestartFromHere(None));
        let desc = ci.to_string();
        self.emit_action_block(ri, &desc, &clause.yields, action)?;
        self.w.close();
        self.w.close();
        Ok(())
    }

    fn emit_condition_check(
        &mut self,
        clause: &Clause,
        succ: &str,
        fail: &str,
    ) -> Result<(), CompileError> {
        self.w.open("");
        self.w.o("bool r = true;");
        for (field, guards) in &clause.attrs {
            if field == "timestamp" {
                for guard in guards {
                    self.emit_timestamp_guard(guard)?;
                }
            } else {
                for guard in guards {
                    self.emit_value_guard(field, guard)?;
                }
            }
        }
        if clause.is_negated() {
            self.w
                .o(format!("if (!r) goto {}; else goto {};", succ, fail));
        } else {
            self.w
                .o(format!("if (r) goto {}; else goto {};", succ, fail));
        }
        self.w.close();
        Ok(())
    }

    fn emit_value_guard(&mut self, field: &str, guard: &Guard) -> Result<(), CompileError> {
        match guard {
            Guard::Literal(value) => {
                self.w.o(format!(
                    "if (r) r = r && (item_get_value_id(item, ids->key_{}) == ids->value_{}_{});",
                    field,
                    field,
                    escape_var_name(value)
                ));
            }
            Guard::Var(var) => {
                let name = strip_sigil(var);
                self.w.open("if (r)");
                self.w.o("ctx_update_stats(ctx, GROUPBY_USED);");
                match var_kind(var) {
                    Some(VarKind::Scalar) => {
                        self.w.o(format!(
                            "r = r && (item_get_value_id(item, ids->key_{}) == ids->var_{});",
                            field, name
                        ));
                    }
                    Some(VarKind::Set) | Some(VarKind::Multiset) => {
                        self.w.o(format!(
                            "r = r && (set_contains(ids->var_{}, item_get_value_id(item, ids->key_{})));",
                            name, field
                        ));
                    }
                    _ => {
                        return Err(CompileError::Syntax {
                            line: None,
                            message: format!("invalid variable '{}' in condition", var),
                        });
                    }
                }
                self.w.close();
            }
            Guard::Cmp { .. } => {
                return Err(CompileError::Syntax {
                    line: None,
                    message: format!(
                        "comparison conditions are only supported on 'timestamp', not '{}'",
                        field
                    ),
                });
            }
        }
        Ok(())
    }

    fn emit_timestamp_guard(&mut self, guard: &Guard) -> Result<(), CompileError> {
        self.w.open("if (r)");
        match guard {
            Guard::Cmp { op, rhs } => match rhs {
                CmpRhs::Const(value) => {
                    self.w
                        .o(format!("r = r && (timestamp {} {});", op.as_str(), value));
                }
                CmpRhs::Var(var) => {
                    self.w.o("ctx_update_stats(ctx, GROUPBY_USED);");
                    self.w.o(format!(
                        "r = r && (timestamp {} ids->var_{});",
                        op.as_str(),
                        strip_sigil(var)
                    ));
                }
            },
            // Legacy encodings: a bare number or scalar means equality.
            Guard::Literal(value) => {
                let value: u64 = value.parse().map_err(|_| CompileError::Syntax {
                    line: None,
                    message: format!("timestamp condition needs a numeric operand, got '{}'", value),
                })?;
                self.w.o(format!("r = r && (timestamp == {});", value));
            }
            Guard::Var(var) => {
                self.w.o("ctx_update_stats(ctx, GROUPBY_USED);");
                self.w.o(format!(
                    "r = r && (timestamp == ids->var_{});",
                    strip_sigil(var)
                ));
            }
        }
        self.w.close();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Actions and yields
    // ------------------------------------------------------------------

    fn emit_action_block(
        &mut self,
        ri: usize,
        desc: &str,
        yields: &[Yield],
        action: Action,
    ) -> Result<(), CompileError> {
        self.w.open("");
        self.w.o(format!(
            r#"DBG_PRINTF("exec rule \"{}\" clause {} (ts=%" PRIu64 " window_expires=%" PRIu64 ")\n", timestamp, state->window_expires);"#,
            c_quote(self.p.rule_name(ri)),
            desc
        ));
        self.emit_yields(ri, yields)?;
        match action {
            Action::Break => {
                self.w.o("ctx_advance(ctx);");
                self.w.o(
                    r#"DBG_PRINTF("advance to pos %" PRId64 "\n", ctx_get_position(ctx));"#,
                );
                self.emit_balance(ri, ri + 1)?;
                self.w.o(format!("goto RULE_START_r{};", ri + 1));
            }
            Action::Repeat => {
                self.w.o("ctx_advance(ctx);");
                self.w.o(
                    r#"DBG_PRINTF("advance to pos %" PRId64 "\n", ctx_get_position(ctx));"#,
                );
                self.w.o(format!("goto CONTINUE_r{};", ri));
            }
            Action::RestartFromHere(target) => {
                let target = target.unwrap_or(ri);
                self.w.o(format!(
                    r#"DBG_PRINTF("restarting from current event at \"{}\" pos=%" PRId64 "\n", ctx_get_position(ctx));"#,
                    c_quote(self.p.rule_name(target))
                ));
                self.emit_balance(ri, target)?;
                self.w.o(format!("goto RULE_START_r{};", target));
            }
            Action::RestartFromNext(target) => {
                self.w.o("ctx_advance(ctx);");
                self.w.o(format!(
                    r#"DBG_PRINTF("restarting from next event at \"{}\" pos=%" PRId64 "\n", ctx_get_position(ctx));"#,
                    c_quote(self.p.rule_name(target))
                ));
                self.emit_balance(ri, target)?;
                self.w.o(format!("goto RULE_START_r{};", target));
            }
            Action::Quit => {
                self.w.o("abort = 1;");
                self.w.o("state->ri = -1;");
                self.w.o("goto STOP;");
            }
            Action::RestartFromStart => {
                return Err(CompileError::UnsupportedAction(
                    "restart-from-start".to_string(),
                ));
            }
        }
        self.w.close();
        Ok(())
    }

    /// Clear outer descriptors left behind when jumping out of window
    /// blocks. Only defined when the destination's windows are a prefix of
    /// the source's.
    fn emit_balance(&mut self, src: usize, dst: usize) -> Result<(), CompileError> {
        if dst >= self.p.rules.len() {
            return Err(CompileError::InvalidTransition { from: src, to: dst });
        }
        if !self.p.has_window_rules {
            return Ok(());
        }
        let src_windows = &self.p.rule_windows[src];
        let dst_windows = &self.p.rule_windows[dst];
        if !src_windows.starts_with(dst_windows) {
            return Err(CompileError::InvalidTransition { from: src, to: dst });
        }
        let depth = dst_windows.len();
        self.w.o(format!("state->outers[{}].id = -1;", depth));
        self.w
            .o(format!("state->outers[{}].window_expires = 0;", depth));
        Ok(())
    }

    fn emit_yields(&mut self, ri: usize, yields: &[Yield]) -> Result<(), CompileError> {
        if yields.is_empty() {
            return Ok(());
        }
        self.w.o(r#"DBG_PRINTF("yield\n");"#);
        self.w.o("ctx_update_stats(ctx, RESULT_UPDATED);");
        for y in yields {
            match var_kind(&y.dst) {
                Some(VarKind::Counter) => {
                    self.w
                        .o(format!("results->{} += 1;", strip_sigil(&y.dst)));
                }
                Some(kind @ (VarKind::Set | VarKind::Multiset | VarKind::Hll)) => {
                    let name = strip_sigil(&y.dst).to_string();
                    self.w.open("");
                    self.w.o("string_tuple_t tuple;");
                    self.w.o("string_tuple_init(&tuple);");
                    self.w.o("item_t i = ctx_get_item(ctx);");
                    for term in &y.src {
                        self.w.open("");
                        self.w.o("char buf[256] = \"\";");
                        self.w.o("char *val = buf;");
                        self.w.o("int len = 0;");
                        self.w.o("int type = 0;");
                        self.emit_term(ri, term, "buf", "val", "len", "type")?;
                        self.w.o("string_tuple_append(val, len, type, &tuple);");
                        self.w.close();
                    }
                    match kind {
                        VarKind::Set => {
                            self.w
                                .o(format!("set_insert(&results->set_{}, &tuple);", name));
                        }
                        VarKind::Multiset => {
                            self.w
                                .o(format!("mset_insert(&results->mset_{}, &tuple);", name));
                        }
                        VarKind::Hll => {
                            self.w.o(format!(
                                "results->hll_{} = hll_insert(results->hll_{}, &tuple);",
                                name, name
                            ));
                        }
                        _ => unreachable!(),
                    }
                    self.w.close();
                }
                _ => {
                    return Err(CompileError::BadYield(format!(
                        "invalid yield destination '{}'",
                        y.dst
                    )));
                }
            }
        }
        Ok(())
    }

    /// Evaluate one yield term into `(buf, val, len, ty)`: `buf` is a
    /// 256-byte scratch array, `val` the pointer actually appended (usually
    /// `buf`, rebound for parameters), `len` the byte length and `ty` the
    /// tuple item type.
    fn emit_term(
        &mut self,
        ri: usize,
        term: &YieldTerm,
        buf: &str,
        val: &str,
        len: &str,
        ty: &str,
    ) -> Result<(), CompileError> {
        match term {
            YieldTerm::WindowRef { window } => {
                let (window_id, pos) = match window {
                    None => (ri, None),
                    Some(name) => {
                        let window_id = self.p.rule_id_by_name(name)?;
                        let pos = self.p.window_stack_pos(ri, window_id)?;
                        (window_id, Some(pos))
                    }
                };
                let duration = self.p.window_duration(window_id).ok_or_else(|| {
                    CompileError::MissingWindowDuration {
                        rule: self.p.rule_name(window_id).to_string(),
                    }
                })?;
                let expires = match pos {
                    None => "state->window_expires".to_string(),
                    Some(pos) => format!("state->outers[{}].window_expires", pos),
                };
                self.w.o(format!(
                    r#"snprintf({buf}, sizeof({buf})/sizeof({buf}[0]), "%" PRIu64, {expires} - {duration});"#,
                ));
                self.w.o(format!("{} = strlen({});", len, buf));
                self.w.o(format!("{} = TUPLE_ITEM_TYPE_STRING;", ty));
            }
            YieldTerm::Field { name } => match name.as_str() {
                "cookie" => {
                    self.w.o(format!("ctx_get_cookie(ctx, {});", buf));
                    self.w.o(format!("{} = 16;", len));
                    self.w.o(format!("{} = TUPLE_ITEM_TYPE_BYTES;", ty));
                }
                "timestamp" => {
                    self.w.o(format!(
                        r#"snprintf({buf}, sizeof({buf})/sizeof({buf}[0]), "%" PRIu64, item_get_timestamp(i));"#,
                    ));
                    self.w.o(format!("{} = strlen({});", len, buf));
                    self.w.o(format!("{} = TUPLE_ITEM_TYPE_STRING;", ty));
                }
                "cookie_timestamp_filter_start" | "cookie_timestamp_filter_end" => {
                    self.w.o(format!(
                        r#"snprintf({buf}, sizeof({buf})/sizeof({buf}[0]), "%" PRIu64, ctx_get_{name}(ctx));"#,
                    ));
                    self.w.o(format!("{} = strlen({});", len, buf));
                    self.w.o(format!("{} = TUPLE_ITEM_TYPE_STRING;", ty));
                }
                _ => {
                    self.w.o(format!("{} = TUPLE_ITEM_TYPE_STRING;", ty));
                    self.w.open(format!("if (ids->key_{} != -1)", name));
                    self.w.o(format!(
                        "const char *v = ctx_get_item_value(ctx, i, ids->key_{}, &{});",
                        name, len
                    ));
                    self.w.o(format!(
                        "memcpy({buf}, v, {len} < (int)sizeof({buf}) ? {len} : (int)sizeof({buf}));",
                    ));
                    self.w.close();
                }
            },
            YieldTerm::Literal { value } => match value {
                LiteralValue::Int(n) => {
                    self.w.o(format!(
                        r#"snprintf({buf}, sizeof({buf})/sizeof({buf}[0]), "%ld", {n}l);"#,
                    ));
                    self.w.o(format!("{} = strlen({});", len, buf));
                    self.w.o(format!("{} = TUPLE_ITEM_TYPE_STRING;", ty));
                }
                LiteralValue::Str(s) => {
                    self.w.o(format!(
                        "strncpy({}, \"{}\", sizeof({})/sizeof({}[0])-1);",
                        buf,
                        c_quote(s),
                        buf,
                        buf
                    ));
                    self.w.o(format!("{} = strlen({});", len, buf));
                    self.w.o(format!("{}[{}] = 0;", buf, len));
                    self.w.o(format!("{} = TUPLE_ITEM_TYPE_STRING;", ty));
                }
            },
            YieldTerm::Param { name } => {
                let name = strip_sigil(name);
                self.w.open("");
                self.w.o(format!("{} = ids->varstrlen_{};", len, name));
                self.w.o(format!("{} = ids->varstr_{};", val, name));
                self.w.o(format!("{} = TUPLE_ITEM_TYPE_STRING;", ty));
                self.w.close();
            }
            YieldTerm::Fcall { name, args } => {
                self.w.open("");
                self.tmp += 1;
                let slug = format!("t{}", self.tmp);
                let mut call_args = vec![
                    buf.to_string(),
                    format!("sizeof({})/sizeof({}[0])", buf, buf),
                ];
                for (n, arg) in args.iter().enumerate() {
                    let abuf = format!("argbuf_{}_{}", slug, n);
                    let aval = format!("arg_{}_{}", slug, n);
                    let alen = format!("len_{}_{}", slug, n);
                    let aty = format!("type_{}_{}", slug, n);
                    self.w.o(format!("char {}[256] = \"\";", abuf));
                    self.w.o(format!("char *{} = {};", aval, abuf));
                    self.w.o(format!("int {} = 0;", alen));
                    self.w
                        .o(format!("int {} __attribute__((unused)) = 0;", aty));
                    self.emit_term(ri, arg, &abuf, &aval, &alen, &aty)?;
                    call_args.push(aval);
                    call_args.push(alen);
                }
                self.w
                    .o(format!("{} = {}({});", len, name, call_args.join(", ")));
                self.w.o(format!("{} = TUPLE_ITEM_TYPE_STRING;", ty));
                self.w.close();
            }
        }
        Ok(())
    }
}
