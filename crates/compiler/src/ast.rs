//! Syntax trees for trck programs.
//!
//! Two forms live here. The source form (`SrcRule` and friends) is what the
//! parser builds: rules may nest inside windows and transitions are still
//! symbolic labels. The flat form (`FlatRule`, `Ast`) is what the normalizer
//! produces and what the code generators consume: a dense, zero-based rule
//! vector with numeric transition targets.
//!
//! The flat form round-trips through the AST JSON wire format. Guards and
//! actions serialize to their legacy string encodings and yield terms to
//! tagged `{"_k": ...}` objects, so the JSON is exactly what the historical
//! front end produced.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;

// ============================================================================
//                              GUARDS
// ============================================================================

/// Comparison operator in a timestamp condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Lt,
    Le,
    Eq,
    Gt,
    Ge,
}

impl CmpOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Eq => "==",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
        }
    }

    /// Split a leading comparison operator off a guard string.
    /// Two-character operators win over their one-character prefixes.
    fn split_prefix(s: &str) -> Option<(CmpOp, &str)> {
        if let Some(rest) = s.strip_prefix(">=") {
            Some((CmpOp::Ge, rest))
        } else if let Some(rest) = s.strip_prefix("<=") {
            Some((CmpOp::Le, rest))
        } else if let Some(rest) = s.strip_prefix("==") {
            Some((CmpOp::Eq, rest))
        } else if let Some(rest) = s.strip_prefix('<') {
            Some((CmpOp::Lt, rest))
        } else if let Some(rest) = s.strip_prefix('>') {
            Some((CmpOp::Gt, rest))
        } else {
            None
        }
    }
}

/// Right-hand side of a timestamp comparison.
#[derive(Debug, Clone, PartialEq)]
pub enum CmpRhs {
    Const(u64),
    /// Scalar variable, sigil included (`%x`).
    Var(String),
}

/// One guard expression in a condition.
///
/// Wire encoding is the legacy string form: a literal equality is the bare
/// value, a variable equality or set membership is the sigiled name, and a
/// comparison is the operator glued to its operand (`">=1234"`, `"<%x"`).
#[derive(Debug, Clone, PartialEq)]
pub enum Guard {
    /// `key = "value"`
    Literal(String),
    /// `key = %x` or `key in #s`; the sigil distinguishes the two.
    Var(String),
    /// `timestamp OP rhs`
    Cmp { op: CmpOp, rhs: CmpRhs },
}

/// True when the name carries a variable sigil.
pub fn is_variable(name: &str) -> bool {
    name.starts_with(['%', '#', '&', '$', '@', '^'])
}

/// Variable class by sigil.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarKind {
    Scalar,
    Counter,
    Set,
    Multiset,
    Hll,
    Composite,
}

/// Classify a sigiled name. Returns `None` for unsigiled names.
pub fn var_kind(name: &str) -> Option<VarKind> {
    match name.chars().next() {
        Some('%') => Some(VarKind::Scalar),
        Some('$') => Some(VarKind::Counter),
        Some('#') => Some(VarKind::Set),
        Some('&') => Some(VarKind::Multiset),
        Some('^') => Some(VarKind::Hll),
        Some('@') => Some(VarKind::Composite),
        _ => None,
    }
}

/// Drop the sigil from a variable name.
pub fn strip_sigil(name: &str) -> &str {
    &name[1..]
}

impl Guard {
    fn encode(&self) -> String {
        match self {
            Guard::Literal(v) => v.clone(),
            Guard::Var(v) => v.clone(),
            Guard::Cmp { op, rhs } => match rhs {
                CmpRhs::Const(n) => format!("{}{}", op.as_str(), n),
                CmpRhs::Var(v) => format!("{}{}", op.as_str(), v),
            },
        }
    }

    fn decode(s: &str) -> Result<Guard, String> {
        if let Some((op, rest)) = CmpOp::split_prefix(s) {
            if rest.starts_with('%') {
                return Ok(Guard::Cmp {
                    op,
                    rhs: CmpRhs::Var(rest.to_string()),
                });
            }
            let n: u64 = rest
                .parse()
                .map_err(|_| format!("invalid comparison operand '{}'", rest))?;
            return Ok(Guard::Cmp {
                op,
                rhs: CmpRhs::Const(n),
            });
        }
        if is_variable(s) {
            Ok(Guard::Var(s.to_string()))
        } else {
            Ok(Guard::Literal(s.to_string()))
        }
    }
}

impl Serialize for Guard {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.encode())
    }
}

impl<'de> Deserialize<'de> for Guard {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Guard::decode(&s).map_err(D::Error::custom)
    }
}

/// Conditions of one clause: attribute key to the guards that must all hold.
/// Ordered map so emission order never depends on hash state.
pub type Conditions = BTreeMap<String, Vec<Guard>>;

// ============================================================================
//                              YIELDS
// ============================================================================

/// A literal yield-tuple element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LiteralValue {
    Int(i64),
    Str(String),
}

/// One element of a yield tuple.
///
/// Wire encoding is the tagged object form (`{"_k": "field", "name": ...}`).
/// Bare-string sources are a legacy encoding and are rejected on input.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "_k", rename_all = "snake_case")]
pub enum YieldTerm {
    Field {
        name: String,
    },
    Literal {
        value: LiteralValue,
    },
    /// Bound scalar parameter, sigil included (`%x`).
    Param {
        name: String,
    },
    Fcall {
        name: String,
        args: Vec<YieldTerm>,
    },
    WindowRef {
        #[serde(rename = "ref", skip_serializing_if = "Option::is_none")]
        window: Option<String>,
    },
}

impl YieldTerm {
    fn from_json(v: &serde_json::Value) -> Result<YieldTerm, String> {
        if v.is_string() {
            return Err(
                "bare-string yield sources are not supported; use tagged {\"_k\": ...} terms"
                    .to_string(),
            );
        }
        let obj = v
            .as_object()
            .ok_or_else(|| "yield term must be an object".to_string())?;
        let kind = obj
            .get("_k")
            .and_then(|k| k.as_str())
            .ok_or_else(|| "yield term is missing '_k'".to_string())?;
        let name_of = |obj: &serde_json::Map<String, serde_json::Value>| {
            obj.get("name")
                .and_then(|n| n.as_str())
                .map(str::to_string)
                .ok_or_else(|| format!("yield term '{}' is missing 'name'", kind))
        };
        match kind {
            "field" => Ok(YieldTerm::Field { name: name_of(obj)? }),
            "param" => Ok(YieldTerm::Param { name: name_of(obj)? }),
            "literal" => {
                let value = obj
                    .get("value")
                    .ok_or_else(|| "literal yield term is missing 'value'".to_string())?;
                let value = if let Some(n) = value.as_i64() {
                    LiteralValue::Int(n)
                } else if let Some(s) = value.as_str() {
                    LiteralValue::Str(s.to_string())
                } else {
                    return Err("literal yield value must be a string or integer".to_string());
                };
                Ok(YieldTerm::Literal { value })
            }
            "fcall" => {
                let args = obj
                    .get("args")
                    .and_then(|a| a.as_array())
                    .ok_or_else(|| "fcall yield term is missing 'args'".to_string())?
                    .iter()
                    .map(YieldTerm::from_json)
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(YieldTerm::Fcall {
                    name: name_of(obj)?,
                    args,
                })
            }
            "window_ref" => {
                let window = obj
                    .get("ref")
                    .and_then(|r| r.as_str())
                    .map(str::to_string);
                Ok(YieldTerm::WindowRef { window })
            }
            other => Err(format!("unknown yield term kind '{}'", other)),
        }
    }

    /// Descriptive name of the term, used for tuple-shape agreement checks.
    pub fn shape_name(&self) -> String {
        match self {
            YieldTerm::Field { name } => name.clone(),
            YieldTerm::Param { name } => name.clone(),
            YieldTerm::Fcall { name, .. } => format!("{}()", name),
            YieldTerm::Literal { value } => match value {
                LiteralValue::Int(n) => n.to_string(),
                LiteralValue::Str(s) => s.clone(),
            },
            YieldTerm::WindowRef { window } => match window {
                Some(w) => format!("start_timestamp[{}]", w),
                None => "start_timestamp".to_string(),
            },
        }
    }
}

impl<'de> Deserialize<'de> for YieldTerm {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let v = serde_json::Value::deserialize(deserializer)?;
        YieldTerm::from_json(&v).map_err(D::Error::custom)
    }
}

/// One yield: a destination result variable and, for tuple destinations,
/// the source terms. Counters carry an empty source list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Yield {
    /// Destination, sigil included (`$c`, `#s`, `&m`, `^h`).
    pub dst: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub src: Vec<YieldTerm>,
}

// ============================================================================
//                              ACTIONS
// ============================================================================

/// A rewritten transition. Targets are indices into the flat rule vector.
///
/// Wire encoding is the legacy string form: `"repeat"`, `"quit"`, `"break"`,
/// `"restart-from-here(3)"`, `"restart-from-next(2)"`. A label-less
/// `"restart-from-here"` means the containing rule itself. `"stop"` is
/// accepted as an input alias for `quit`. `"restart-from-start"` parses but
/// is rejected by the code generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Break,
    Repeat,
    RestartFromHere(Option<usize>),
    RestartFromNext(usize),
    Quit,
    RestartFromStart,
}

impl Action {
    fn encode(&self) -> String {
        match self {
            Action::Break => "break".to_string(),
            Action::Repeat => "repeat".to_string(),
            Action::Quit => "quit".to_string(),
            Action::RestartFromStart => "restart-from-start".to_string(),
            Action::RestartFromHere(None) => "restart-from-here".to_string(),
            Action::RestartFromHere(Some(t)) => format!("restart-from-here({})", t),
            Action::RestartFromNext(t) => format!("restart-from-next({})", t),
        }
    }

    fn decode(s: &str) -> Result<Action, String> {
        let target = |s: &str, prefix: &str| -> Result<usize, String> {
            s[prefix.len()..]
                .strip_suffix(')')
                .and_then(|t| t.parse().ok())
                .ok_or_else(|| format!("unknown action: {}", s))
        };
        match s {
            "break" => Ok(Action::Break),
            "repeat" => Ok(Action::Repeat),
            "quit" | "stop" => Ok(Action::Quit),
            "restart-from-here" => Ok(Action::RestartFromHere(None)),
            "restart-from-start" => Ok(Action::RestartFromStart),
            _ if s.starts_with("restart-from-here(") => Ok(Action::RestartFromHere(Some(
                target(s, "restart-from-here(")?,
            ))),
            _ if s.starts_with("restart-from-next(") => {
                Ok(Action::RestartFromNext(target(s, "restart-from-next(")?))
            }
            _ => Err(format!("unknown action: {}", s)),
        }
    }

    /// Explicit jump target, if this action has one.
    pub fn target(&self) -> Option<usize> {
        match self {
            Action::RestartFromHere(Some(t)) => Some(*t),
            Action::RestartFromNext(t) => Some(*t),
            _ => None,
        }
    }
}

impl Serialize for Action {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.encode())
    }
}

impl<'de> Deserialize<'de> for Action {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Action::decode(&s).map_err(D::Error::custom)
    }
}

// ============================================================================
//                              FLAT FORM
// ============================================================================

/// One pattern line of a receive rule, post-normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Clause {
    #[serde(default)]
    pub attrs: Conditions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<Action>,
    #[serde(rename = "yield", default, skip_serializing_if = "Vec::is_empty")]
    pub yields: Vec<Yield>,
    /// `"not"` negates the whole condition; only reachable via the wire
    /// format, the surface grammar has no negation syntax.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub op: Option<String>,
    #[serde(rename = "lineno", default, skip_serializing_if = "Option::is_none")]
    pub line: Option<usize>,
}

impl Clause {
    pub fn is_negated(&self) -> bool {
        self.op.as_deref() == Some("not")
    }
}

/// Timeout behavior of a rule: optional yields plus a transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AfterBlock {
    #[serde(rename = "yield", default, skip_serializing_if = "Vec::is_empty")]
    pub yields: Vec<Yield>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<Action>,
}

/// One rule of the flattened program.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlatRule {
    pub n: usize,
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub clauses: Vec<Clause>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<AfterBlock>,
    /// Window duration in seconds; absent means the rule never expires.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window: Option<u64>,
    /// For window rules: one past the last nested rule index.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outer: Option<usize>,
    /// Wire-format flag kept for future syntax; the grammar cannot set it.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub entrypoint: bool,
}

impl FlatRule {
    /// True for window rules (they carry an `outer` bound).
    pub fn is_window(&self) -> bool {
        self.outer.is_some()
    }
}

/// Groupby/foreach header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Groupby {
    /// Sigiled variable names in declaration order.
    pub vars: Vec<String>,
    /// The `@array` parameter, when the explicit form was used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub merge_results: bool,
    #[serde(rename = "lineno", default, skip_serializing_if = "Option::is_none")]
    pub line: Option<usize>,
}

/// A full flattened program: the unit of the JSON wire format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ast {
    pub rules: Vec<FlatRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub groupby: Option<Groupby>,
}

// ============================================================================
//                              SOURCE FORM
// ============================================================================

/// Transition as written: a rule label or a reserved word.
#[derive(Debug, Clone, PartialEq)]
pub enum SrcTransition {
    Label { name: String, line: usize },
    Repeat,
    Quit,
}

/// One clause as parsed, transition still symbolic.
#[derive(Debug, Clone, PartialEq)]
pub struct SrcClause {
    pub attrs: Conditions,
    pub yields: Vec<Yield>,
    pub transition: Option<SrcTransition>,
    pub line: usize,
}

/// `after` block as parsed.
#[derive(Debug, Clone, PartialEq)]
pub struct SrcAfter {
    pub yields: Vec<Yield>,
    pub transition: Option<SrcTransition>,
}

/// Body of a rule: receive with clauses, or window with nested rules.
#[derive(Debug, Clone, PartialEq)]
pub enum SrcRuleBody {
    Receive {
        clauses: Vec<SrcClause>,
        window: Option<u64>,
        after: Option<SrcAfter>,
    },
    Window {
        rules: Vec<SrcRule>,
        window: u64,
        after: SrcAfter,
    },
}

/// A named rule in source order.
#[derive(Debug, Clone, PartialEq)]
pub struct SrcRule {
    pub name: String,
    pub line: usize,
    pub body: SrcRuleBody,
}

/// Parser output: optional groupby header plus the rule tree.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceProgram {
    pub groupby: Option<Groupby>,
    pub rules: Vec<SrcRule>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_roundtrip() {
        for s in ["signup", "%x", "#whitelist", "<=1234", ">%lo", "==7", "<10", ">=99"] {
            let g = Guard::decode(s).unwrap();
            assert_eq!(g.encode(), s);
        }
    }

    #[test]
    fn test_guard_cmp_decodes_typed() {
        assert_eq!(
            Guard::decode("<=1234").unwrap(),
            Guard::Cmp {
                op: CmpOp::Le,
                rhs: CmpRhs::Const(1234)
            }
        );
        assert_eq!(
            Guard::decode(">%start").unwrap(),
            Guard::Cmp {
                op: CmpOp::Gt,
                rhs: CmpRhs::Var("%start".to_string())
            }
        );
    }

    #[test]
    fn test_guard_bad_comparison_operand() {
        assert!(Guard::decode(">=abc").is_err());
    }

    #[test]
    fn test_action_roundtrip() {
        for s in [
            "break",
            "repeat",
            "quit",
            "restart-from-here",
            "restart-from-here(3)",
            "restart-from-next(2)",
            "restart-from-start",
        ] {
            let a = Action::decode(s).unwrap();
            assert_eq!(a.encode(), s);
        }
    }

    #[test]
    fn test_action_stop_is_quit() {
        assert_eq!(Action::decode("stop").unwrap(), Action::Quit);
    }

    #[test]
    fn test_action_unknown() {
        assert!(Action::decode("restart-from-next").is_err());
        assert!(Action::decode("jump(3)").is_err());
    }

    #[test]
    fn test_yield_term_json_roundtrip() {
        let term = YieldTerm::Fcall {
            name: "fmt".to_string(),
            args: vec![
                YieldTerm::Field {
                    name: "user".to_string(),
                },
                YieldTerm::Param {
                    name: "%x".to_string(),
                },
                YieldTerm::WindowRef {
                    window: Some("W".to_string()),
                },
                YieldTerm::Literal {
                    value: LiteralValue::Int(42),
                },
            ],
        };
        let json = serde_json::to_string(&term).unwrap();
        assert!(json.contains("\"_k\":\"fcall\""));
        assert!(json.contains("\"_k\":\"window_ref\""));
        assert!(json.contains("\"ref\":\"W\""));
        let back: YieldTerm = serde_json::from_str(&json).unwrap();
        assert_eq!(back, term);
    }

    #[test]
    fn test_bare_string_yield_source_rejected() {
        let err = serde_json::from_str::<YieldTerm>("\"username\"").unwrap_err();
        assert!(err.to_string().contains("bare-string"));
    }

    #[test]
    fn test_clause_wire_names() {
        let clause = Clause {
            attrs: Conditions::from([("x".to_string(), vec![Guard::Literal("a".to_string())])]),
            action: Some(Action::RestartFromNext(1)),
            yields: vec![Yield {
                dst: "$c".to_string(),
                src: vec![],
            }],
            op: None,
            line: Some(4),
        };
        let json = serde_json::to_value(&clause).unwrap();
        assert_eq!(json["action"], "restart-from-next(1)");
        assert_eq!(json["attrs"]["x"][0], "a");
        assert_eq!(json["yield"][0]["dst"], "$c");
        assert_eq!(json["lineno"], 4);
        assert!(json.get("op").is_none());
    }

    #[test]
    fn test_ast_roundtrip() {
        let ast = Ast {
            rules: vec![FlatRule {
                n: 0,
                name: "S".to_string(),
                clauses: vec![Clause {
                    attrs: Conditions::new(),
                    action: Some(Action::Repeat),
                    yields: vec![],
                    op: None,
                    line: Some(2),
                }],
                after: None,
                window: None,
                outer: None,
                entrypoint: false,
            }],
            groupby: Some(Groupby {
                vars: vec!["%u".to_string()],
                values: Some("@users".to_string()),
                merge_results: true,
                line: Some(1),
            }),
        };
        let json = serde_json::to_string(&ast).unwrap();
        let back: Ast = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ast);
    }
}
