//! Recursive-descent parser for trck syntax.
//!
//! Operates on the layout-filtered token stream, so block structure arrives
//! as INDENT/DEDENT/NEWLINE tokens and every production is plain recursive
//! descent:
//!
//! ```text
//! program        := foreach_expr INDENT rules DEDENT | rules
//! rule           := ID "->" INDENT (window_stmt | receive_stmt) DEDENT
//! window_stmt    := "window" INDENT rules DEDENT "after" TIMEDELTA "->" actions
//! receive_stmt   := "receive" INDENT clauses DEDENT
//!                   [ "after" [TIMEDELTA] "->" actions ]
//! clause         := (conditions | "*") "->" actions
//! ```
//!
//! Transitions stay symbolic here; the normalizer resolves them to numeric
//! targets and rejects unknown labels.

use crate::ast::{
    CmpOp, CmpRhs, Conditions, Groupby, Guard, LiteralValue, SourceProgram, SrcAfter, SrcClause,
    SrcRule, SrcRuleBody, SrcTransition, Yield, YieldTerm,
};
use crate::error::CompileError;
use crate::lexer::{tokenize, Tok, Token};

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    /// Tokenize and wrap the source. Lexer errors surface from `parse`.
    pub fn new(source: &str) -> Result<Self, CompileError> {
        Ok(Parser {
            tokens: tokenize(source)?,
            pos: 0,
        })
    }

    pub fn parse(&mut self) -> Result<SourceProgram, CompileError> {
        let groupby = if self.at(&Tok::Foreach) {
            let groupby = self.parse_foreach()?;
            self.expect(&Tok::Indent, "an indented rule block after 'foreach'")?;
            let rules = self.parse_rules()?;
            self.expect(&Tok::Dedent, "end of the foreach block")?;
            self.expect_eof()?;
            return Ok(SourceProgram {
                groupby: Some(groupby),
                rules,
            });
        } else {
            None
        };
        let rules = self.parse_rules()?;
        self.expect_eof()?;
        Ok(SourceProgram { groupby, rules })
    }

    // ------------------------------------------------------------------
    // Token stream helpers
    // ------------------------------------------------------------------

    fn current(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek(&self) -> Option<&Tok> {
        self.current().map(|t| &t.tok)
    }

    fn peek_at(&self, offset: usize) -> Option<&Tok> {
        self.tokens.get(self.pos + offset).map(|t| &t.tok)
    }

    fn at(&self, tok: &Tok) -> bool {
        self.peek() == Some(tok)
    }

    fn line(&self) -> Option<usize> {
        self.current().map(|t| t.line)
    }

    fn advance(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn eat(&mut self, tok: &Tok) -> bool {
        if self.at(tok) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, tok: &Tok, what: &str) -> Result<(), CompileError> {
        if self.eat(tok) {
            Ok(())
        } else {
            Err(self.unexpected(what))
        }
    }

    fn expect_eof(&mut self) -> Result<(), CompileError> {
        match self.current() {
            None => Ok(()),
            Some(_) => Err(self.unexpected("end of program")),
        }
    }

    fn unexpected(&self, expected: &str) -> CompileError {
        match self.current() {
            Some(t) => CompileError::Syntax {
                line: Some(t.line),
                message: format!("expected {}, got {}", expected, t.tok.describe()),
            },
            None => CompileError::Syntax {
                line: None,
                message: format!("unexpected EOF (expected {})", expected),
            },
        }
    }

    // ------------------------------------------------------------------
    // Header
    // ------------------------------------------------------------------

    /// `foreach %u, #s in @users [merged [results]]` or `foreach %u [merged [results]]`
    fn parse_foreach(&mut self) -> Result<Groupby, CompileError> {
        let line = self.line();
        self.expect(&Tok::Foreach, "'foreach'")?;

        let first = self.parse_groupby_var()?;
        let mut vars = vec![first];

        let values = if self.at(&Tok::Comma) || self.at(&Tok::In) {
            while self.eat(&Tok::Comma) {
                vars.push(self.parse_groupby_var()?);
            }
            self.expect(&Tok::In, "'in'")?;
            match self.advance().map(|t| t.tok) {
                Some(Tok::Array(name)) => Some(name),
                _ => return Err(self.unexpected("an @array parameter")),
            }
        } else {
            // Implicit form: a single scalar bound by the host.
            if !vars[0].starts_with('%') {
                return Err(CompileError::Syntax {
                    line,
                    message: format!(
                        "foreach without 'in' takes a single %scalar, got '{}'",
                        vars[0]
                    ),
                });
            }
            None
        };

        let mut merge_results = false;
        if self.eat(&Tok::Merged) {
            self.eat(&Tok::Results);
            merge_results = true;
        }

        Ok(Groupby {
            vars,
            values,
            merge_results,
            line,
        })
    }

    fn parse_groupby_var(&mut self) -> Result<String, CompileError> {
        match self.peek() {
            Some(Tok::Scalar(name)) | Some(Tok::Set(name)) => {
                let name = name.clone();
                self.pos += 1;
                Ok(name)
            }
            _ => Err(self.unexpected("a %scalar or #set variable")),
        }
    }

    // ------------------------------------------------------------------
    // Rules
    // ------------------------------------------------------------------

    fn parse_rules(&mut self) -> Result<Vec<SrcRule>, CompileError> {
        let mut rules = vec![self.parse_rule()?];
        while matches!(self.peek(), Some(Tok::Ident(_))) {
            rules.push(self.parse_rule()?);
        }
        Ok(rules)
    }

    fn parse_rule(&mut self) -> Result<SrcRule, CompileError> {
        let line = self.line().unwrap_or(0);
        let name = match self.advance().map(|t| t.tok) {
            Some(Tok::Ident(name)) => name,
            _ => return Err(self.unexpected("a rule name")),
        };
        self.expect(&Tok::Arrow, "'->' after the rule name")?;
        self.expect(&Tok::Indent, "an indented rule body")?;
        let body = match self.peek() {
            Some(Tok::Window) => self.parse_window_stmt()?,
            Some(Tok::Receive) => self.parse_receive_stmt()?,
            _ => return Err(self.unexpected("'window' or 'receive'")),
        };
        self.expect(&Tok::Dedent, "end of the rule body")?;
        Ok(SrcRule { name, line, body })
    }

    fn parse_window_stmt(&mut self) -> Result<SrcRuleBody, CompileError> {
        self.expect(&Tok::Window, "'window'")?;
        self.expect(&Tok::Indent, "an indented rule block after 'window'")?;
        let rules = self.parse_rules()?;
        self.expect(&Tok::Dedent, "end of the window block")?;
        self.expect(&Tok::After, "'after' closing the window")?;
        let duration_line = self.line();
        let window = match self.advance().map(|t| t.tok) {
            Some(Tok::Timedelta(seconds)) => seconds,
            _ => return Err(self.unexpected("a window duration (e.g. 7d)")),
        };
        if window == 0 {
            return Err(CompileError::Syntax {
                line: duration_line,
                message: "window duration must be positive".to_string(),
            });
        }
        self.expect(&Tok::Arrow, "'->' after the window duration")?;
        let (yields, transition) = self.parse_actions()?;
        Ok(SrcRuleBody::Window {
            rules,
            window,
            after: SrcAfter { yields, transition },
        })
    }

    fn parse_receive_stmt(&mut self) -> Result<SrcRuleBody, CompileError> {
        self.expect(&Tok::Receive, "'receive'")?;
        self.expect(&Tok::Indent, "an indented clause block after 'receive'")?;
        let mut clauses = vec![self.parse_clause()?];
        while self.eat(&Tok::Newline) {
            clauses.push(self.parse_clause()?);
        }
        self.expect(&Tok::Dedent, "end of the clause block")?;

        let mut window = None;
        let mut after = None;
        if self.eat(&Tok::After) {
            if let Some(Tok::Timedelta(seconds)) = self.peek() {
                let seconds = *seconds;
                if seconds == 0 {
                    return Err(CompileError::Syntax {
                        line: self.line(),
                        message: "window duration must be positive".to_string(),
                    });
                }
                window = Some(seconds);
                self.pos += 1;
            }
            self.expect(&Tok::Arrow, "'->' after 'after'")?;
            let (yields, transition) = self.parse_actions()?;
            after = Some(SrcAfter { yields, transition });
        }
        Ok(SrcRuleBody::Receive {
            clauses,
            window,
            after,
        })
    }

    // ------------------------------------------------------------------
    // Clauses and conditions
    // ------------------------------------------------------------------

    fn parse_clause(&mut self) -> Result<SrcClause, CompileError> {
        let line = self.line().unwrap_or(0);
        let attrs = if self.eat(&Tok::Wildcard) {
            Conditions::new()
        } else {
            self.parse_conditions()?
        };
        self.expect(&Tok::Arrow, "'->' after the clause conditions")?;
        let (yields, transition) = self.parse_actions()?;
        Ok(SrcClause {
            attrs,
            yields,
            transition,
            line,
        })
    }

    fn parse_conditions(&mut self) -> Result<Conditions, CompileError> {
        let mut attrs = Conditions::new();
        loop {
            let (key, guard) = self.parse_condition()?;
            // Guards sharing a key merge into one AND-combined list.
            attrs.entry(key).or_default().push(guard);
            if !self.eat(&Tok::Comma) {
                break;
            }
        }
        Ok(attrs)
    }

    fn parse_condition(&mut self) -> Result<(String, Guard), CompileError> {
        let line = self.line();
        let key = match self.advance().map(|t| t.tok) {
            Some(Tok::Ident(name)) => name,
            _ => return Err(self.unexpected("an attribute name")),
        };
        let op = match self.peek() {
            Some(Tok::Eq) => None,
            Some(Tok::In) => {
                self.pos += 1;
                let set = match self.advance().map(|t| t.tok) {
                    Some(Tok::Set(name)) => name,
                    _ => return Err(self.unexpected("a #set variable")),
                };
                return Ok((key, Guard::Var(set)));
            }
            Some(Tok::Lt) => Some(CmpOp::Lt),
            Some(Tok::Le) => Some(CmpOp::Le),
            Some(Tok::EqEq) => Some(CmpOp::Eq),
            Some(Tok::Gt) => Some(CmpOp::Gt),
            Some(Tok::Ge) => Some(CmpOp::Ge),
            _ => return Err(self.unexpected("'=', 'in' or a comparison operator")),
        };
        self.pos += 1;

        match op {
            None => match self.advance().map(|t| t.tok) {
                Some(Tok::Str(value)) => Ok((key, Guard::Literal(value))),
                Some(Tok::Scalar(name)) => Ok((key, Guard::Var(name))),
                _ => Err(self.unexpected("a string literal or %scalar")),
            },
            Some(op) => {
                // Comparisons are only meaningful against the event clock.
                if key != "timestamp" {
                    return Err(CompileError::Syntax {
                        line,
                        message: format!(
                            "comparison conditions are only supported on 'timestamp', not '{}'",
                            key
                        ),
                    });
                }
                let rhs = match self.advance().map(|t| t.tok) {
                    Some(Tok::Timestamp(v)) | Some(Tok::Number(v)) => CmpRhs::Const(v),
                    Some(Tok::Scalar(name)) => CmpRhs::Var(name),
                    _ => return Err(self.unexpected("a timestamp, number or %scalar")),
                };
                Ok((key, Guard::Cmp { op, rhs }))
            }
        }
    }

    // ------------------------------------------------------------------
    // Actions and yields
    // ------------------------------------------------------------------

    /// `actions := yields "," transition | yields | transition`
    fn parse_actions(&mut self) -> Result<(Vec<Yield>, Option<SrcTransition>), CompileError> {
        let mut yields = Vec::new();
        if !self.at(&Tok::Yield) {
            let transition = self.parse_transition()?;
            return Ok((yields, Some(transition)));
        }
        loop {
            self.expect(&Tok::Yield, "'yield'")?;
            yields.push(self.parse_yield_var()?);
            if !self.at(&Tok::Comma) {
                return Ok((yields, None));
            }
            if self.peek_at(1) == Some(&Tok::Yield) {
                self.pos += 1; // comma before the next yield
                continue;
            }
            self.pos += 1; // comma before the transition
            let transition = self.parse_transition()?;
            return Ok((yields, Some(transition)));
        }
    }

    fn parse_transition(&mut self) -> Result<SrcTransition, CompileError> {
        let line = self.line().unwrap_or(0);
        match self.advance().map(|t| t.tok) {
            Some(Tok::Ident(name)) => Ok(SrcTransition::Label { name, line }),
            Some(Tok::Quit) => Ok(SrcTransition::Quit),
            Some(Tok::Repeat) => Ok(SrcTransition::Repeat),
            _ => Err(self.unexpected("a rule label, 'quit' or 'repeat'")),
        }
    }

    /// `yield_var := $counter | ids "to" (#set | &multiset | ^hll)`
    fn parse_yield_var(&mut self) -> Result<Yield, CompileError> {
        if let Some(Tok::Counter(name)) = self.peek() {
            let dst = name.clone();
            self.pos += 1;
            return Ok(Yield { dst, src: vec![] });
        }

        let mut src = vec![self.parse_yieldable()?];
        loop {
            if self.at(&Tok::To) {
                break;
            }
            // A comma continues the tuple only if a 'to' still lies ahead on
            // this line; otherwise it belongs to the surrounding action list.
            if self.at(&Tok::Comma) && self.to_follows(self.pos + 1) {
                self.pos += 1;
                src.push(self.parse_yieldable()?);
            } else {
                break;
            }
        }
        self.expect(&Tok::To, "'to' and a destination variable")?;
        let dst = match self.peek() {
            Some(Tok::Set(name)) | Some(Tok::Multiset(name)) | Some(Tok::Hll(name)) => {
                let name = name.clone();
                self.pos += 1;
                name
            }
            _ => return Err(self.unexpected("a #set, &multiset or ^hll destination")),
        };
        Ok(Yield { dst, src })
    }

    /// Scan ahead for a `to` at paren depth zero before the line (or the
    /// yield list) ends.
    fn to_follows(&self, mut pos: usize) -> bool {
        let mut depth = 0usize;
        while let Some(token) = self.tokens.get(pos) {
            match &token.tok {
                Tok::LParen => depth += 1,
                Tok::RParen => depth = depth.saturating_sub(1),
                Tok::To if depth == 0 => return true,
                Tok::Yield | Tok::Newline | Tok::Indent | Tok::Dedent | Tok::Arrow => {
                    return false;
                }
                _ => {}
            }
            pos += 1;
        }
        false
    }

    /// `yieldable := ID | "start_timestamp" ["[" ID "]"] | fcall`
    fn parse_yieldable(&mut self) -> Result<YieldTerm, CompileError> {
        match self.peek() {
            Some(Tok::StartTimestamp) => {
                self.pos += 1;
                self.parse_window_ref()
            }
            Some(Tok::Ident(_)) => {
                if self.peek_at(1) == Some(&Tok::LParen) {
                    self.parse_fcall()
                } else {
                    match self.advance().map(|t| t.tok) {
                        Some(Tok::Ident(name)) => Ok(YieldTerm::Field { name }),
                        _ => unreachable!(),
                    }
                }
            }
            _ => Err(self.unexpected("an attribute name, start_timestamp or a function call")),
        }
    }

    /// The optional `[W]` suffix of `start_timestamp`.
    fn parse_window_ref(&mut self) -> Result<YieldTerm, CompileError> {
        if self.eat(&Tok::LBracket) {
            let name = match self.advance().map(|t| t.tok) {
                Some(Tok::Ident(name)) => name,
                _ => return Err(self.unexpected("a window rule name")),
            };
            self.expect(&Tok::RBracket, "']'")?;
            Ok(YieldTerm::WindowRef { window: Some(name) })
        } else {
            Ok(YieldTerm::WindowRef { window: None })
        }
    }

    fn parse_fcall(&mut self) -> Result<YieldTerm, CompileError> {
        let name = match self.advance().map(|t| t.tok) {
            Some(Tok::Ident(name)) => name,
            _ => return Err(self.unexpected("a function name")),
        };
        self.expect(&Tok::LParen, "'('")?;
        let mut args = vec![self.parse_arg()?];
        while self.eat(&Tok::Comma) {
            args.push(self.parse_arg()?);
        }
        self.expect(&Tok::RParen, "')'")?;
        Ok(YieldTerm::Fcall { name, args })
    }

    fn parse_arg(&mut self) -> Result<YieldTerm, CompileError> {
        match self.peek() {
            Some(Tok::Ident(_)) => {
                if self.peek_at(1) == Some(&Tok::LParen) {
                    self.parse_fcall()
                } else {
                    match self.advance().map(|t| t.tok) {
                        Some(Tok::Ident(name)) => Ok(YieldTerm::Field { name }),
                        _ => unreachable!(),
                    }
                }
            }
            Some(Tok::Scalar(name)) => {
                let name = name.clone();
                self.pos += 1;
                Ok(YieldTerm::Param { name })
            }
            Some(Tok::StartTimestamp) => {
                self.pos += 1;
                self.parse_window_ref()
            }
            Some(Tok::Str(value)) => {
                let value = value.clone();
                self.pos += 1;
                Ok(YieldTerm::Literal {
                    value: LiteralValue::Str(value),
                })
            }
            Some(Tok::Number(n)) => {
                let value = *n as i64;
                self.pos += 1;
                Ok(YieldTerm::Literal {
                    value: LiteralValue::Int(value),
                })
            }
            _ => Err(self.unexpected("a function argument")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Guard;

    fn parse(source: &str) -> SourceProgram {
        Parser::new(source).unwrap().parse().unwrap()
    }

    fn parse_err(source: &str) -> CompileError {
        match Parser::new(source) {
            Ok(mut p) => p.parse().unwrap_err(),
            Err(e) => e,
        }
    }

    #[test]
    fn test_single_receive_rule() {
        let program = parse("S ->\n  receive\n    x = \"a\", timestamp < 10 -> yield $c, repeat");
        assert_eq!(program.rules.len(), 1);
        assert_eq!(program.rules[0].name, "S");
        match &program.rules[0].body {
            SrcRuleBody::Receive {
                clauses,
                window,
                after,
            } => {
                assert!(window.is_none());
                assert!(after.is_none());
                assert_eq!(clauses.len(), 1);
                let clause = &clauses[0];
                assert_eq!(clause.attrs["x"], vec![Guard::Literal("a".to_string())]);
                assert_eq!(
                    clause.attrs["timestamp"],
                    vec![Guard::Cmp {
                        op: CmpOp::Lt,
                        rhs: CmpRhs::Const(10)
                    }]
                );
                assert_eq!(clause.yields.len(), 1);
                assert_eq!(clause.yields[0].dst, "$c");
                assert_eq!(clause.transition, Some(SrcTransition::Repeat));
            }
            other => panic!("expected receive, got {:?}", other),
        }
    }

    #[test]
    fn test_wildcard_clause_and_label() {
        let program = parse("A ->\n  receive\n    * -> B\nB ->\n  receive\n    * -> repeat");
        assert_eq!(program.rules.len(), 2);
        match &program.rules[0].body {
            SrcRuleBody::Receive { clauses, .. } => {
                assert!(clauses[0].attrs.is_empty());
                assert!(matches!(
                    clauses[0].transition,
                    Some(SrcTransition::Label { ref name, .. }) if name == "B"
                ));
            }
            other => panic!("expected receive, got {:?}", other),
        }
    }

    #[test]
    fn test_shared_key_guards_merge() {
        let program =
            parse("S ->\n  receive\n    timestamp > 5, timestamp < 10 -> repeat");
        match &program.rules[0].body {
            SrcRuleBody::Receive { clauses, .. } => {
                assert_eq!(clauses[0].attrs["timestamp"].len(), 2);
            }
            other => panic!("expected receive, got {:?}", other),
        }
    }

    #[test]
    fn test_window_rule() {
        let program = parse(
            "W ->\n  window\n    A ->\n      receive\n        x = \"a\" -> quit\n  after 1d -> quit",
        );
        match &program.rules[0].body {
            SrcRuleBody::Window {
                rules,
                window,
                after,
            } => {
                assert_eq!(*window, 86400);
                assert_eq!(rules.len(), 1);
                assert_eq!(rules[0].name, "A");
                assert_eq!(after.transition, Some(SrcTransition::Quit));
            }
            other => panic!("expected window, got {:?}", other),
        }
    }

    #[test]
    fn test_receive_with_after_timeout() {
        let program = parse(
            "S ->\n  receive\n    x = \"a\" -> repeat\n  after 2h -> yield $expired, quit",
        );
        match &program.rules[0].body {
            SrcRuleBody::Receive { window, after, .. } => {
                assert_eq!(*window, Some(7200));
                let after = after.as_ref().unwrap();
                assert_eq!(after.yields[0].dst, "$expired");
                assert_eq!(after.transition, Some(SrcTransition::Quit));
            }
            other => panic!("expected receive, got {:?}", other),
        }
    }

    #[test]
    fn test_after_without_duration() {
        let program = parse("S ->\n  receive\n    * -> repeat\n  after -> quit");
        match &program.rules[0].body {
            SrcRuleBody::Receive { window, after, .. } => {
                assert!(window.is_none());
                assert!(after.is_some());
            }
            other => panic!("expected receive, got {:?}", other),
        }
    }

    #[test]
    fn test_foreach_array_form() {
        let program =
            parse("foreach %u in @users merged results\n  S ->\n    receive\n      * -> repeat");
        let groupby = program.groupby.unwrap();
        assert_eq!(groupby.vars, vec!["%u"]);
        assert_eq!(groupby.values.as_deref(), Some("@users"));
        assert!(groupby.merge_results);
    }

    #[test]
    fn test_foreach_implicit_scalar() {
        let program = parse("foreach %u\n  S ->\n    receive\n      * -> repeat");
        let groupby = program.groupby.unwrap();
        assert_eq!(groupby.vars, vec!["%u"]);
        assert!(groupby.values.is_none());
        assert!(!groupby.merge_results);
    }

    #[test]
    fn test_foreach_multiple_vars() {
        let program =
            parse("foreach %u, #good in @pairs\n  S ->\n    receive\n      * -> repeat");
        let groupby = program.groupby.unwrap();
        assert_eq!(groupby.vars, vec!["%u", "#good"]);
    }

    #[test]
    fn test_yield_tuple_to_set() {
        let program =
            parse("S ->\n  receive\n    * -> yield user, item to #pairs, repeat");
        match &program.rules[0].body {
            SrcRuleBody::Receive { clauses, .. } => {
                let y = &clauses[0].yields[0];
                assert_eq!(y.dst, "#pairs");
                assert_eq!(y.src.len(), 2);
                assert_eq!(
                    y.src[0],
                    YieldTerm::Field {
                        name: "user".to_string()
                    }
                );
                assert_eq!(clauses[0].transition, Some(SrcTransition::Repeat));
            }
            other => panic!("expected receive, got {:?}", other),
        }
    }

    #[test]
    fn test_yield_fcall_and_window_ref() {
        let program = parse(
            "S ->\n  receive\n    * -> yield fmt(user, %x, start_timestamp[W], \"lit\", 7) to &m, quit",
        );
        match &program.rules[0].body {
            SrcRuleBody::Receive { clauses, .. } => {
                let y = &clauses[0].yields[0];
                assert_eq!(y.dst, "&m");
                match &y.src[0] {
                    YieldTerm::Fcall { name, args } => {
                        assert_eq!(name, "fmt");
                        assert_eq!(args.len(), 5);
                        assert_eq!(
                            args[2],
                            YieldTerm::WindowRef {
                                window: Some("W".to_string())
                            }
                        );
                        assert_eq!(
                            args[3],
                            YieldTerm::Literal {
                                value: LiteralValue::Str("lit".to_string())
                            }
                        );
                    }
                    other => panic!("expected fcall, got {:?}", other),
                }
            }
            other => panic!("expected receive, got {:?}", other),
        }
    }

    #[test]
    fn test_multiple_yields_then_transition() {
        let program = parse(
            "S ->\n  receive\n    * -> yield $a, yield user to #seen, yield $b, repeat",
        );
        match &program.rules[0].body {
            SrcRuleBody::Receive { clauses, .. } => {
                assert_eq!(clauses[0].yields.len(), 3);
                assert_eq!(clauses[0].transition, Some(SrcTransition::Repeat));
            }
            other => panic!("expected receive, got {:?}", other),
        }
    }

    #[test]
    fn test_yield_without_transition() {
        let program = parse("S ->\n  receive\n    * -> yield $a");
        match &program.rules[0].body {
            SrcRuleBody::Receive { clauses, .. } => {
                assert_eq!(clauses[0].yields.len(), 1);
                assert!(clauses[0].transition.is_none());
            }
            other => panic!("expected receive, got {:?}", other),
        }
    }

    #[test]
    fn test_set_membership_condition() {
        let program = parse("S ->\n  receive\n    user in #good -> repeat");
        match &program.rules[0].body {
            SrcRuleBody::Receive { clauses, .. } => {
                assert_eq!(
                    clauses[0].attrs["user"],
                    vec![Guard::Var("#good".to_string())]
                );
            }
            other => panic!("expected receive, got {:?}", other),
        }
    }

    #[test]
    fn test_dated_literal_condition() {
        let program = parse("S ->\n  receive\n    timestamp >= '1970-01-02' -> repeat");
        match &program.rules[0].body {
            SrcRuleBody::Receive { clauses, .. } => {
                assert_eq!(
                    clauses[0].attrs["timestamp"],
                    vec![Guard::Cmp {
                        op: CmpOp::Ge,
                        rhs: CmpRhs::Const(86400)
                    }]
                );
            }
            other => panic!("expected receive, got {:?}", other),
        }
    }

    #[test]
    fn test_comparison_on_non_timestamp_rejected() {
        let err = parse_err("S ->\n  receive\n    price < 10 -> repeat");
        match err {
            CompileError::Syntax { message, .. } => {
                assert!(message.contains("timestamp"), "got: {}", message);
            }
            other => panic!("expected Syntax, got {:?}", other),
        }
    }

    #[test]
    fn test_zero_window_duration_rejected() {
        let err = parse_err("S ->\n  receive\n    * -> repeat\n  after 0s -> quit");
        match err {
            CompileError::Syntax { message, .. } => {
                assert!(message.contains("positive"), "got: {}", message);
            }
            other => panic!("expected Syntax, got {:?}", other),
        }
    }

    #[test]
    fn test_unexpected_eof() {
        let err = parse_err("S ->\n  receive");
        match err {
            CompileError::Syntax { line, message } => {
                assert!(line.is_none());
                assert!(message.contains("EOF"), "got: {}", message);
            }
            other => panic!("expected Syntax, got {:?}", other),
        }
    }

    #[test]
    fn test_syntax_error_reports_line_and_token() {
        let err = parse_err("S ->\n  window\n    A ->\n      receive\n        * -> quit\n  after -> quit");
        match err {
            CompileError::Syntax { line, message } => {
                // Window blocks require a duration after 'after'.
                assert_eq!(line, Some(6));
                assert!(message.contains("duration"), "got: {}", message);
            }
            other => panic!("expected Syntax, got {:?}", other),
        }
    }
}
