//! Normalization: rule tree to flat rule table.
//!
//! Four passes over the parser output:
//!
//! 1. Numbering and flattening. Depth-first pre-order assigns each rule its
//!    index; window rules remember one past their last inner rule as `outer`.
//! 2. Label resolution. `name -> index` over the flat vector, duplicate
//!    names rejected.
//! 3. Transition rewriting. Clause labels become `restart-from-next(n)`,
//!    after labels become `restart-from-here(n)`; a missing after action
//!    restarts the rule itself, a missing clause action is only legal on
//!    rule 0 (where it means `repeat`).
//! 4. Transition validation. Every jump target's window stack must be a
//!    prefix of the source's, otherwise the jump crosses unrelated window
//!    blocks and is rejected.

use crate::ast::{
    Action, AfterBlock, Ast, Clause, FlatRule, SourceProgram, SrcAfter, SrcClause, SrcRule,
    SrcRuleBody, SrcTransition,
};
use crate::error::CompileError;
use crate::program::window_containment;
use std::collections::BTreeMap;

struct Pending {
    name: String,
    line: usize,
    clauses: Vec<SrcClause>,
    after: Option<SrcAfter>,
    window: Option<u64>,
    outer: Option<usize>,
}

fn flatten(rules: &[SrcRule], out: &mut Vec<Pending>) {
    for rule in rules {
        let n = out.len();
        match &rule.body {
            SrcRuleBody::Receive {
                clauses,
                window,
                after,
            } => {
                out.push(Pending {
                    name: rule.name.clone(),
                    line: rule.line,
                    clauses: clauses.clone(),
                    after: after.clone(),
                    window: *window,
                    outer: None,
                });
            }
            SrcRuleBody::Window {
                rules: inner,
                window,
                after,
            } => {
                out.push(Pending {
                    name: rule.name.clone(),
                    line: rule.line,
                    clauses: Vec::new(),
                    after: Some(after.clone()),
                    window: Some(*window),
                    outer: Some(0), // patched below once the inner rules are numbered
                });
                flatten(inner, out);
                out[n].outer = Some(out.len());
            }
        }
    }
}

/// Flatten and rewrite a parsed program into the dense rule table.
pub fn normalize(src: &SourceProgram) -> Result<Ast, CompileError> {
    let mut pending = Vec::new();
    flatten(&src.rules, &mut pending);

    let mut index: BTreeMap<&str, usize> = BTreeMap::new();
    for (i, p) in pending.iter().enumerate() {
        if index.insert(p.name.as_str(), i).is_some() {
            return Err(CompileError::Syntax {
                line: Some(p.line),
                message: format!("duplicate rule name '{}'", p.name),
            });
        }
    }

    let resolve = |t: &SrcTransition| -> Result<(Option<usize>, Action), CompileError> {
        // Returns the rewritten action for a clause (restart-from-next)
        // alongside the raw index so afters can build restart-from-here.
        match t {
            SrcTransition::Repeat => Ok((None, Action::Repeat)),
            SrcTransition::Quit => Ok((None, Action::Quit)),
            SrcTransition::Label { name, line } => match index.get(name.as_str()) {
                Some(&target) => Ok((Some(target), Action::RestartFromNext(target))),
                None => Err(CompileError::UnknownLabel {
                    line: Some(*line),
                    label: name.clone(),
                }),
            },
        }
    };

    let mut rules = Vec::with_capacity(pending.len());
    for (n, p) in pending.iter().enumerate() {
        let mut clauses = Vec::with_capacity(p.clauses.len());
        for c in &p.clauses {
            let action = match &c.transition {
                Some(t) => resolve(t)?.1,
                None if n == 0 => Action::Repeat,
                None => {
                    return Err(CompileError::Syntax {
                        line: Some(c.line),
                        message: "consider adding repeat here".to_string(),
                    });
                }
            };
            clauses.push(Clause {
                attrs: c.attrs.clone(),
                action: Some(action),
                yields: c.yields.clone(),
                op: None,
                line: Some(c.line),
            });
        }

        let after = match &p.after {
            Some(a) => {
                let action = match &a.transition {
                    Some(t) => match resolve(t)? {
                        (Some(target), _) => Action::RestartFromHere(Some(target)),
                        (None, action) => action,
                    },
                    // No explicit target: restart this rule from the
                    // current event.
                    None => Action::RestartFromHere(Some(n)),
                };
                Some(AfterBlock {
                    yields: a.yields.clone(),
                    action: Some(action),
                })
            }
            None => None,
        };

        rules.push(FlatRule {
            n,
            name: p.name.clone(),
            clauses,
            after,
            window: p.window,
            outer: p.outer,
            entrypoint: false,
        });
    }

    let (_, rule_windows) = window_containment(&rules);
    validate_transitions(&rules, &rule_windows)?;

    Ok(Ast {
        rules,
        groupby: src.groupby.clone(),
    })
}

/// Check the window prefix property for every transition: jumping from `s`
/// to `t` is only defined when `t`'s enclosing windows are a prefix of
/// `s`'s. `restart-from-start` is rejected outright.
pub fn validate_transitions(
    rules: &[FlatRule],
    rule_windows: &[Vec<usize>],
) -> Result<(), CompileError> {
    let check = |s: usize, t: usize| -> Result<(), CompileError> {
        if t >= rules.len() || !rule_windows[s].starts_with(&rule_windows[t]) {
            return Err(CompileError::InvalidTransition { from: s, to: t });
        }
        Ok(())
    };

    for rule in rules {
        let clause_actions = rule.clauses.iter().filter_map(|c| c.action);
        let after_action = rule.after.as_ref().and_then(|a| a.action);
        for action in clause_actions.chain(after_action) {
            match action {
                Action::RestartFromHere(Some(t)) | Action::RestartFromNext(t) => {
                    check(rule.n, t)?;
                }
                Action::Break => check(rule.n, rule.n + 1)?,
                Action::RestartFromStart => {
                    return Err(CompileError::UnsupportedAction(
                        "restart-from-start".to_string(),
                    ));
                }
                Action::RestartFromHere(None) | Action::Repeat | Action::Quit => {}
            }
        }
    }
    Ok(())
}
