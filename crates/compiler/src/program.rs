//! Static analysis: flat rules to a `Program`.
//!
//! A single walk over the flattened rule table collects everything the code
//! generators need: the attribute keys and literal values to intern
//! (`kvs`), the variables used in conditions with their inferred fields,
//! result variables classified by sigil, external function signatures, and
//! the window containment structure. All set-valued tables are ordered
//! (`BTreeMap`/`BTreeSet`) so generated symbol order never depends on hash
//! state; `vars` keeps first-seen order because parameter ids are
//! positional.

use crate::ast::{
    is_variable, strip_sigil, var_kind, Action, Ast, CmpRhs, FlatRule, Groupby, Guard, VarKind,
    Yield, YieldTerm,
};
use crate::error::CompileError;
use std::collections::{BTreeMap, BTreeSet};

/// Attribute keys a condition may use without interning a key id.
fn is_special_field(name: &str) -> bool {
    name == "cookie" || name == "timestamp"
}

/// Yield fields computed from the trail context rather than the event.
fn is_special_yield_field(name: &str) -> bool {
    is_special_field(name)
        || name == "cookie_timestamp_filter_start"
        || name == "cookie_timestamp_filter_end"
}

/// Walk the flat vector maintaining a stack of open windows. Returns the
/// window rule indices in order, and for every rule the indices of the
/// windows enclosing it (outermost first).
pub fn window_containment(rules: &[FlatRule]) -> (Vec<usize>, Vec<Vec<usize>>) {
    let mut window_rule_ids = Vec::new();
    let mut rule_windows = Vec::with_capacity(rules.len());
    let mut stack: Vec<usize> = Vec::new();
    let mut bounds: Vec<usize> = Vec::new();
    for (i, rule) in rules.iter().enumerate() {
        while bounds.last().is_some_and(|&b| b <= i) {
            stack.pop();
            bounds.pop();
        }
        rule_windows.push(stack.clone());
        if let Some(outer) = rule.outer {
            window_rule_ids.push(i);
            stack.push(i);
            bounds.push(outer);
        }
    }
    (window_rule_ids, rule_windows)
}

/// Analyzer output: the sole input of both code generators.
#[derive(Debug, Clone)]
pub struct Program {
    pub rules: Vec<FlatRule>,
    pub groupby: Option<Groupby>,
    /// Rule index every trail starts at.
    pub entrypoint_id: usize,
    /// Attribute key to the literal values compared against it. A key used
    /// only against variables has an empty value set.
    pub kvs: BTreeMap<String, BTreeSet<String>>,
    /// Sigiled variables in first-seen order: condition variables first,
    /// then groupby variables not already present.
    pub vars: Vec<String>,
    /// Inferred attribute field per variable.
    pub var_fields: BTreeMap<String, String>,
    /// Counter destinations, sigil included.
    pub yield_counters: BTreeSet<String>,
    /// Set/multiset/HLL destinations, sigil stripped.
    pub yield_sets: BTreeSet<String>,
    pub yield_multisets: BTreeSet<String>,
    pub yield_hlls: BTreeSet<String>,
    /// External functions as (name, arity).
    pub externals: BTreeSet<(String, usize)>,
    pub window_rule_ids: Vec<usize>,
    pub rule_windows: Vec<Vec<usize>>,
    pub has_window_rules: bool,
    /// True when the matcher never replays earlier events, which lets the
    /// generated state omit its `start` field.
    pub no_rewind: bool,
    pub groupby_vars: Vec<String>,
}

impl Program {
    pub fn analyze(ast: &Ast) -> Result<Program, CompileError> {
        for (i, rule) in ast.rules.iter().enumerate() {
            if rule.n != i {
                return Err(CompileError::Json(format!(
                    "rule indices are not dense: position {} holds rule n={}",
                    i, rule.n
                )));
            }
            if rule.window == Some(0) {
                return Err(CompileError::Json(format!(
                    "rule '{}' has a zero-length window",
                    rule.name
                )));
            }
        }

        let (window_rule_ids, rule_windows) = window_containment(&ast.rules);
        let mut program = Program {
            rules: ast.rules.clone(),
            groupby: ast.groupby.clone(),
            entrypoint_id: 0,
            kvs: BTreeMap::new(),
            vars: Vec::new(),
            var_fields: BTreeMap::new(),
            yield_counters: BTreeSet::new(),
            yield_sets: BTreeSet::new(),
            yield_multisets: BTreeSet::new(),
            yield_hlls: BTreeSet::new(),
            externals: BTreeSet::new(),
            has_window_rules: !window_rule_ids.is_empty(),
            window_rule_ids,
            rule_windows,
            no_rewind: true,
            groupby_vars: Vec::new(),
        };

        for rule in &ast.rules {
            for clause in &rule.clauses {
                for (field, guards) in &clause.attrs {
                    program.collect_condition(field, guards, clause.line)?;
                }
                program.collect_yields(&clause.yields)?;
            }
            if let Some(after) = &rule.after {
                program.collect_yields(&after.yields)?;
            }
        }

        if let Some(groupby) = &ast.groupby {
            for var in &groupby.vars {
                match var_kind(var) {
                    Some(VarKind::Scalar) | Some(VarKind::Set) => {}
                    _ => {
                        return Err(CompileError::Syntax {
                            line: groupby.line,
                            message: format!("invalid groupby variable '{}'", var),
                        });
                    }
                }
                program.groupby_vars.push(var.clone());
                if !program.vars.contains(var) {
                    program.vars.push(var.clone());
                }
            }
        }

        program.check_sigil_purity()?;

        program.entrypoint_id = ast
            .rules
            .iter()
            .position(|r| r.entrypoint)
            .unwrap_or(0);
        program.no_rewind = compute_no_rewind(&ast.rules);

        Ok(program)
    }

    fn collect_condition(
        &mut self,
        field: &str,
        guards: &[Guard],
        line: Option<usize>,
    ) -> Result<(), CompileError> {
        if field == "cookie" {
            return Err(CompileError::Syntax {
                line,
                message: "conditions on 'cookie' are not supported".to_string(),
            });
        }
        for guard in guards {
            match guard {
                Guard::Cmp { rhs, .. } => {
                    if field != "timestamp" {
                        return Err(CompileError::Syntax {
                            line,
                            message: format!(
                                "comparison conditions are only supported on 'timestamp', not '{}'",
                                field
                            ),
                        });
                    }
                    if let CmpRhs::Var(v) = rhs {
                        self.note_var(v, field, line)?;
                    }
                }
                Guard::Var(v) => {
                    if !is_special_field(field) {
                        self.kvs.entry(field.to_string()).or_default();
                    }
                    self.note_var(v, field, line)?;
                }
                Guard::Literal(value) => {
                    if field == "timestamp" {
                        // Legacy encoding: a bare number means equality.
                        if value.parse::<u64>().is_err() {
                            return Err(CompileError::Syntax {
                                line,
                                message: format!(
                                    "timestamp condition needs a numeric operand, got '{}'",
                                    value
                                ),
                            });
                        }
                    } else {
                        self.kvs
                            .entry(field.to_string())
                            .or_default()
                            .insert(value.clone());
                    }
                }
            }
        }
        Ok(())
    }

    fn note_var(
        &mut self,
        var: &str,
        field: &str,
        line: Option<usize>,
    ) -> Result<(), CompileError> {
        match var_kind(var) {
            Some(VarKind::Scalar) | Some(VarKind::Set) | Some(VarKind::Multiset) => {}
            _ => {
                return Err(CompileError::Syntax {
                    line,
                    message: format!("invalid variable '{}' in condition", var),
                });
            }
        }
        if !self.vars.contains(&var.to_string()) {
            self.vars.push(var.to_string());
        }
        self.var_fields
            .insert(var.to_string(), field.to_string());
        Ok(())
    }

    fn collect_yields(&mut self, yields: &[Yield]) -> Result<(), CompileError> {
        for y in yields {
            match var_kind(&y.dst) {
                Some(VarKind::Counter) => {
                    self.yield_counters.insert(y.dst.clone());
                }
                Some(VarKind::Set) => {
                    self.yield_sets.insert(strip_sigil(&y.dst).to_string());
                    self.collect_terms(&y.src);
                }
                Some(VarKind::Multiset) => {
                    self.yield_multisets
                        .insert(strip_sigil(&y.dst).to_string());
                    self.collect_terms(&y.src);
                }
                Some(VarKind::Hll) => {
                    self.yield_hlls.insert(strip_sigil(&y.dst).to_string());
                    self.collect_terms(&y.src);
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

    fn collect_terms(&mut self, terms: &[YieldTerm]) {
        for term in terms {
            match term {
                YieldTerm::Field { name } => {
                    if !is_special_yield_field(name) {
                        self.kvs.entry(name.clone()).or_default();
                    }
                }
                YieldTerm::Fcall { name, args } => {
                    self.externals.insert((name.clone(), args.len()));
                    self.collect_terms(args);
                }
                _ => {}
            }
        }
    }

    /// Result-sigil purity: a result name may belong to one class only.
    fn check_sigil_purity(&self) -> Result<(), CompileError> {
        let classes: [(&str, Vec<&str>); 4] = [
            (
                "counter",
                self.yield_counters.iter().map(|c| strip_sigil(c)).collect(),
            ),
            ("set", self.yield_sets.iter().map(String::as_str).collect()),
            (
                "multiset",
                self.yield_multisets.iter().map(String::as_str).collect(),
            ),
            ("hll", self.yield_hlls.iter().map(String::as_str).collect()),
        ];
        let mut seen: BTreeMap<&str, &str> = BTreeMap::new();
        for (class, names) in &classes {
            for name in names {
                if let Some(previous) = seen.insert(*name, *class) {
                    return Err(CompileError::BadYield(format!(
                        "result variable '{}' is used as both {} and {}",
                        name, previous, class
                    )));
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Lookups used by the code generators
    // ------------------------------------------------------------------

    pub fn rule_name(&self, ri: usize) -> &str {
        &self.rules[ri].name
    }

    pub fn rule_id_by_name(&self, name: &str) -> Result<usize, CompileError> {
        self.rules
            .iter()
            .position(|r| r.name == name)
            .ok_or_else(|| CompileError::UnknownLabel {
                line: None,
                label: name.to_string(),
            })
    }

    pub fn window_duration(&self, ri: usize) -> Option<u64> {
        self.rules[ri].window
    }

    /// Position of window `window_id` on the window stack of rule `ri`.
    pub fn window_stack_pos(&self, ri: usize, window_id: usize) -> Result<usize, CompileError> {
        self.rule_windows[ri]
            .iter()
            .position(|&w| w == window_id)
            .ok_or_else(|| {
                CompileError::BadYield(format!(
                    "no enclosing window block named '{}' for rule '{}'",
                    self.rule_name(window_id),
                    self.rule_name(ri)
                ))
            })
    }

    /// The single tuple shape yielded to a set/multiset destination, as
    /// term names. Every yield site targeting the destination must agree.
    pub fn yield_tuple_shape(&self, dst: &str) -> Result<Vec<String>, CompileError> {
        let mut shape: Option<Vec<String>> = None;
        let sites = self
            .rules
            .iter()
            .flat_map(|r| {
                r.clauses
                    .iter()
                    .flat_map(|c| c.yields.iter())
                    .chain(r.after.iter().flat_map(|a| a.yields.iter()))
            })
            .filter(|y| y.dst == dst);
        for y in sites {
            let names: Vec<String> = y.src.iter().map(YieldTerm::shape_name).collect();
            match &shape {
                None => shape = Some(names),
                Some(existing) if *existing == names => {}
                Some(existing) => {
                    return Err(CompileError::BadYield(format!(
                        "yields to '{}' disagree on tuple shape: ({}) vs ({})",
                        dst,
                        existing.join(", "),
                        names.join(", ")
                    )));
                }
            }
        }
        shape.ok_or_else(|| {
            CompileError::BadYield(format!("no yields target '{}'", dst))
        })
    }

    /// Variables bound by the host per trail rather than per groupby tuple.
    pub fn free_vars(&self) -> Vec<String> {
        let mut free: Vec<String> = self
            .vars
            .iter()
            .filter(|v| !self.groupby_vars.contains(v))
            .cloned()
            .collect();
        free.sort();
        free
    }

    pub fn merge_results(&self) -> bool {
        self.groupby
            .as_ref()
            .map(|g| g.merge_results)
            .unwrap_or(false)
    }
}

/// True unless some action replays earlier events: an explicit
/// `restart-from-here` to a strictly earlier rule, or the (unsupported)
/// `restart-from-start` arriving via legacy JSON.
fn compute_no_rewind(rules: &[FlatRule]) -> bool {
    for rule in rules {
        let clause_actions = rule.clauses.iter().filter_map(|c| c.action);
        let after_action = rule.after.as_ref().and_then(|a| a.action);
        for action in clause_actions.chain(after_action) {
            match action {
                Action::RestartFromStart => return false,
                Action::RestartFromHere(Some(t)) if t < rule.n => return false,
                _ => {}
            }
        }
    }
    true
}

/// Quick sanity check used by tests and debug assertions: every name that
/// looks like a variable really carries a sigil.
#[allow(dead_code)]
pub(crate) fn all_sigiled(names: &[String]) -> bool {
    names.iter().all(|n| is_variable(n))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::normalize;
    use crate::parser::Parser;

    fn analyze(source: &str) -> Program {
        let ast = normalize(&Parser::new(source).unwrap().parse().unwrap()).unwrap();
        Program::analyze(&ast).unwrap()
    }

    #[test]
    fn test_single_receive_with_timestamp_guard() {
        let p = analyze("S ->\n  receive\n    x = \"a\", timestamp < 10 -> yield $c, repeat");
        assert_eq!(p.rules.len(), 1);
        assert!(p.vars.is_empty());
        assert_eq!(
            p.kvs.get("x").unwrap(),
            &BTreeSet::from(["a".to_string()])
        );
        assert!(!p.kvs.contains_key("timestamp"));
        assert_eq!(p.yield_counters, BTreeSet::from(["$c".to_string()]));
        assert!(p.no_rewind);
        assert!(!p.has_window_rules);
        assert_eq!(p.entrypoint_id, 0);
    }

    #[test]
    fn test_var_field_inference() {
        let p = analyze(
            "S ->\n  receive\n    user = %u, category in #good -> repeat",
        );
        // Conditions iterate in key order, so #good (category) is seen first.
        assert_eq!(p.vars, vec!["#good", "%u"]);
        assert_eq!(p.var_fields["%u"], "user");
        assert_eq!(p.var_fields["#good"], "category");
        // Keys used only against variables still intern, with no values.
        assert!(p.kvs["user"].is_empty());
        assert!(p.kvs["category"].is_empty());
    }

    #[test]
    fn test_nested_window_containment() {
        let p = analyze(
            "W ->\n  window\n    A ->\n      receive\n        * -> repeat\n  after 1d -> quit",
        );
        assert_eq!(p.window_rule_ids, vec![0]);
        assert_eq!(p.rule_windows[0], Vec::<usize>::new());
        assert_eq!(p.rule_windows[1], vec![0]);
        assert!(p.has_window_rules);
    }

    #[test]
    fn test_yield_classification() {
        let p = analyze(
            "S ->\n  receive\n    * -> yield $c, yield a to #s, yield b to &m, yield c to ^h, repeat",
        );
        assert_eq!(p.yield_counters, BTreeSet::from(["$c".to_string()]));
        assert_eq!(p.yield_sets, BTreeSet::from(["s".to_string()]));
        assert_eq!(p.yield_multisets, BTreeSet::from(["m".to_string()]));
        assert_eq!(p.yield_hlls, BTreeSet::from(["h".to_string()]));
        // Yielded fields intern keys even when never used in conditions.
        assert!(p.kvs.contains_key("a"));
        assert!(p.kvs.contains_key("b"));
        assert!(p.kvs.contains_key("c"));
    }

    #[test]
    fn test_externals_collected_recursively() {
        let p = analyze(
            "S ->\n  receive\n    * -> yield f(a, g(b, c), %x) to #s, repeat",
        );
        assert_eq!(
            p.externals,
            BTreeSet::from([("f".to_string(), 3), ("g".to_string(), 2)])
        );
        assert!(p.kvs.contains_key("a"));
        assert!(p.kvs.contains_key("b"));
        assert!(p.kvs.contains_key("c"));
    }

    #[test]
    fn test_groupby_vars_appended() {
        let p = analyze(
            "foreach %u in @users\n  S ->\n    receive\n      user = %u, x = %v -> repeat",
        );
        // Condition vars first in first-seen order, %u already present.
        assert_eq!(p.vars, vec!["%u", "%v"]);
        assert_eq!(p.groupby_vars, vec!["%u"]);
        assert_eq!(p.free_vars(), vec!["%v"]);
    }

    #[test]
    fn test_sigil_purity_violation() {
        let source = "S ->\n  receive\n    * -> yield a to #x, yield b to &x, repeat";
        let ast = normalize(&Parser::new(source).unwrap().parse().unwrap()).unwrap();
        let err = Program::analyze(&ast).unwrap_err();
        assert!(matches!(err, CompileError::BadYield(_)));
    }

    #[test]
    fn test_no_rewind_with_backward_after() {
        let p = analyze(concat!(
            "A ->\n  receive\n    * -> B\n",
            "B ->\n  receive\n    * -> repeat\n  after 1h -> A",
        ));
        // Explicit restart-from-here to an earlier rule forces rewind state.
        assert!(!p.no_rewind);
    }

    #[test]
    fn test_no_rewind_default_self_after() {
        let p = analyze("A ->\n  receive\n    * -> repeat\n  after 1h -> quit");
        assert!(p.no_rewind);
    }

    #[test]
    fn test_yield_tuple_shape_agreement() {
        let p = analyze(concat!(
            "A ->\n  receive\n    * -> yield user, item to #pairs, B\n",
            "B ->\n  receive\n    * -> yield user, item to #pairs, repeat",
        ));
        assert_eq!(p.yield_tuple_shape("#pairs").unwrap(), vec!["user", "item"]);
    }

    #[test]
    fn test_yield_tuple_shape_mismatch() {
        let p = analyze(concat!(
            "A ->\n  receive\n    * -> yield user, item to #pairs, B\n",
            "B ->\n  receive\n    * -> yield user to #pairs, repeat",
        ));
        assert!(matches!(
            p.yield_tuple_shape("#pairs"),
            Err(CompileError::BadYield(_))
        ));
    }

    #[test]
    fn test_entrypoint_flag_from_wire() {
        let json = r#"{"rules": [
            {"n": 0, "name": "A", "clauses": [{"attrs": {}, "action": "repeat"}]},
            {"n": 1, "name": "B", "clauses": [{"attrs": {}, "action": "repeat"}], "entrypoint": true}
        ]}"#;
        let ast: Ast = serde_json::from_str(json).unwrap();
        let p = Program::analyze(&ast).unwrap();
        assert_eq!(p.entrypoint_id, 1);
    }

    #[test]
    fn test_non_dense_indices_rejected() {
        let json = r#"{"rules": [{"n": 3, "name": "A", "clauses": [{"attrs": {}, "action": "repeat"}]}]}"#;
        let ast: Ast = serde_json::from_str(json).unwrap();
        assert!(matches!(
            Program::analyze(&ast),
            Err(CompileError::Json(_))
        ));
    }
}
