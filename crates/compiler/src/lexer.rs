//! Lexer and indentation layout filter for trck source.
//!
//! Lexing is a two-stage pipeline. The raw stage turns characters into flat
//! tokens, keeping whitespace runs and newlines so the second stage can see
//! them. The layout stage measures the whitespace in front of each line's
//! first token and rewrites it into structural tokens: INDENT opens a level,
//! DEDENT closes one, NEWLINE separates lines at the same level. The grammar
//! stays context-free because the parser only ever sees those three.

use crate::error::CompileError;

/// A lexical token kind. Sigiled identifiers keep their sigil in the text so
/// downstream stages can classify them without extra bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tok {
    // Layout
    Indent,
    Dedent,
    Newline,

    // Reserved words
    After,
    Receive,
    Yield,
    Quit,
    Window,
    Repeat,
    In,
    Foreach,
    To,
    Merged,
    Results,
    StartTimestamp,

    // Identifiers and literals
    Ident(String),
    Scalar(String),   // %name
    Set(String),      // #name
    Multiset(String), // &name
    Hll(String),      // ^name
    Array(String),    // @name
    Counter(String),  // $name
    Number(u64),
    Str(String),
    /// `\d+[smhd]`, normalized to seconds.
    Timedelta(u64),
    /// `'YYYY-MM-DD'`, converted to Unix seconds UTC.
    Timestamp(u64),

    // Punctuation and operators
    Comma,
    Arrow,
    Eq,
    EqEq,
    Lt,
    Le,
    Gt,
    Ge,
    Wildcard,
    LBracket,
    RBracket,
    LParen,
    RParen,
}

impl Tok {
    /// Short human-readable description for diagnostics.
    pub fn describe(&self) -> String {
        match self {
            Tok::Indent => "indent".to_string(),
            Tok::Dedent => "dedent".to_string(),
            Tok::Newline => "newline".to_string(),
            Tok::Ident(s) => format!("identifier '{}'", s),
            Tok::Scalar(s)
            | Tok::Set(s)
            | Tok::Multiset(s)
            | Tok::Hll(s)
            | Tok::Array(s)
            | Tok::Counter(s) => format!("'{}'", s),
            Tok::Number(n) => format!("number {}", n),
            Tok::Str(s) => format!("string \"{}\"", s),
            Tok::Timedelta(n) => format!("timedelta {}s", n),
            Tok::Timestamp(n) => format!("timestamp {}", n),
            other => format!("'{}'", other.literal()),
        }
    }

    fn literal(&self) -> &'static str {
        match self {
            Tok::After => "after",
            Tok::Receive => "receive",
            Tok::Yield => "yield",
            Tok::Quit => "quit",
            Tok::Window => "window",
            Tok::Repeat => "repeat",
            Tok::In => "in",
            Tok::Foreach => "foreach",
            Tok::To => "to",
            Tok::Merged => "merged",
            Tok::Results => "results",
            Tok::StartTimestamp => "start_timestamp",
            Tok::Comma => ",",
            Tok::Arrow => "->",
            Tok::Eq => "=",
            Tok::EqEq => "==",
            Tok::Lt => "<",
            Tok::Le => "<=",
            Tok::Gt => ">",
            Tok::Ge => ">=",
            Tok::Wildcard => "*",
            Tok::LBracket => "[",
            Tok::RBracket => "]",
            Tok::LParen => "(",
            Tok::RParen => ")",
            _ => "?",
        }
    }
}

/// A token with its source position (1-indexed line, 1-indexed column).
/// Structural tokens synthesized by the layout filter carry column 0.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub tok: Tok,
    pub line: usize,
    pub col: usize,
}

/// Raw-stage token: real tokens plus the whitespace the layout filter needs.
#[derive(Debug, Clone, PartialEq)]
enum RawTok {
    Ws(String),
    Newline,
    Real(Tok),
}

#[derive(Debug, Clone)]
struct RawToken {
    tok: RawTok,
    line: usize,
    col: usize,
}

/// Tokenize source text through both stages.
pub fn tokenize(source: &str) -> Result<Vec<Token>, CompileError> {
    layout(lex_raw(source)?)
}

fn keyword(word: &str) -> Option<Tok> {
    match word {
        "after" => Some(Tok::After),
        "receive" => Some(Tok::Receive),
        "yield" => Some(Tok::Yield),
        "quit" => Some(Tok::Quit),
        "window" => Some(Tok::Window),
        "repeat" => Some(Tok::Repeat),
        "in" => Some(Tok::In),
        "foreach" => Some(Tok::Foreach),
        "to" => Some(Tok::To),
        "merged" => Some(Tok::Merged),
        "results" => Some(Tok::Results),
        "start_timestamp" => Some(Tok::StartTimestamp),
        _ => None,
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Days from 1970-01-01 for a civil date (proleptic Gregorian).
fn days_from_civil(year: i64, month: u32, day: u32) -> i64 {
    let y = if month <= 2 { year - 1 } else { year };
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = y - era * 400;
    let m = month as i64;
    let doy = (153 * (if m > 2 { m - 3 } else { m + 9 }) + 2) / 5 + day as i64 - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146097 + doe - 719468
}

fn parse_dated_literal(text: &str) -> Option<u64> {
    // text is YYYY-MM-DD, already shape-checked by the caller
    let year: i64 = text[0..4].parse().ok()?;
    let month: u32 = text[5..7].parse().ok()?;
    let day: u32 = text[8..10].parse().ok()?;
    if !(1..=12).contains(&month) || !(1..=31).contains(&day) {
        return None;
    }
    let days = days_from_civil(year, month, day);
    if days < 0 {
        return None;
    }
    Some(days as u64 * 86400)
}

struct RawLexer {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    col: usize,
}

impl RawLexer {
    fn new(source: &str) -> Self {
        RawLexer {
            chars: source.chars().collect(),
            pos: 0,
            line: 1,
            col: 1,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.chars.get(self.pos).copied();
        if let Some(c) = c {
            self.pos += 1;
            if c == '\n' {
                self.line += 1;
                self.col = 1;
            } else {
                self.col += 1;
            }
        }
        c
    }

    fn error(&self, message: String) -> CompileError {
        CompileError::Lexer {
            line: self.line,
            col: self.col,
            message,
        }
    }

    /// Try to lex a dated literal `'YYYY-MM-DD'` at the current position.
    fn try_dated(&mut self) -> Option<Result<Tok, CompileError>> {
        // Shape check before consuming anything.
        let mut probe = String::new();
        for i in 1..=10 {
            probe.push(self.peek_at(i)?);
        }
        if self.peek_at(11)? != '\'' {
            return None;
        }
        let bytes: Vec<char> = probe.chars().collect();
        let shape_ok = bytes.iter().enumerate().all(|(i, c)| match i {
            4 | 7 => *c == '-',
            _ => c.is_ascii_digit(),
        });
        if !shape_ok {
            return None;
        }
        for _ in 0..12 {
            self.bump();
        }
        match parse_dated_literal(&probe) {
            Some(secs) => Some(Ok(Tok::Timestamp(secs))),
            None => Some(Err(self.error(format!("cannot parse date '{}'", probe)))),
        }
    }

    fn lex_string(&mut self, quote: char) -> Result<Tok, CompileError> {
        self.bump(); // opening quote
        let mut text = String::new();
        loop {
            match self.peek() {
                None | Some('\n') => {
                    return Err(self.error("unterminated string literal".to_string()));
                }
                Some('\\') => {
                    // A backslash makes the next character literal. The code
                    // generator re-escapes for the target language.
                    self.bump();
                    match self.bump() {
                        Some(c) => text.push(c),
                        None => {
                            return Err(self.error("unterminated string literal".to_string()));
                        }
                    }
                }
                Some(c) if c == quote => {
                    self.bump();
                    return Ok(Tok::Str(text));
                }
                Some(c) => {
                    text.push(c);
                    self.bump();
                }
            }
        }
    }

    fn lex_number(&mut self) -> Result<Tok, CompileError> {
        let mut digits = String::new();
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                digits.push(c);
                self.bump();
            } else {
                break;
            }
        }
        let value: u64 = digits
            .parse()
            .map_err(|_| self.error(format!("integer value too large: {}", digits)))?;
        let unit = match self.peek() {
            Some('s') => Some(1),
            Some('m') => Some(60),
            Some('h') => Some(3600),
            Some('d') => Some(86400),
            _ => None,
        };
        if let Some(mult) = unit {
            // Only a timedelta if the unit letter is not the start of a
            // longer identifier (e.g. `10minutes` is not `10m` + `inutes`).
            if !self.peek_at(1).map(is_ident_char).unwrap_or(false) {
                self.bump();
                return Ok(Tok::Timedelta(value * mult));
            }
        }
        Ok(Tok::Number(value))
    }

    fn lex_sigiled(&mut self, sigil: char) -> Result<Tok, CompileError> {
        self.bump();
        if !self.peek().map(is_ident_start).unwrap_or(false) {
            return Err(self.error(format!("expected identifier after '{}'", sigil)));
        }
        let mut name = String::new();
        name.push(sigil);
        while let Some(c) = self.peek() {
            if is_ident_char(c) {
                name.push(c);
                self.bump();
            } else {
                break;
            }
        }
        Ok(match sigil {
            '%' => Tok::Scalar(name),
            '#' => Tok::Set(name),
            '&' => Tok::Multiset(name),
            '^' => Tok::Hll(name),
            '@' => Tok::Array(name),
            '$' => Tok::Counter(name),
            _ => unreachable!(),
        })
    }
}

/// First stage: characters to flat tokens, whitespace retained.
fn lex_raw(source: &str) -> Result<Vec<RawToken>, CompileError> {
    let mut lx = RawLexer::new(source);
    let mut out = Vec::new();

    while let Some(c) = lx.peek() {
        let line = lx.line;
        let col = lx.col;
        let push = |out: &mut Vec<RawToken>, tok: RawTok| {
            out.push(RawToken { tok, line, col });
        };

        match c {
            '\\' if lx.peek_at(1) == Some('\n') => {
                lx.bump();
                lx.bump();
            }
            '\n' => {
                lx.bump();
                push(&mut out, RawTok::Newline);
            }
            '-' if lx.peek_at(1) == Some('-') => {
                while let Some(c) = lx.peek() {
                    if c == '\n' {
                        break;
                    }
                    lx.bump();
                }
            }
            '-' if lx.peek_at(1) == Some('>') => {
                lx.bump();
                lx.bump();
                push(&mut out, RawTok::Real(Tok::Arrow));
            }
            ' ' | '\t' => {
                let mut ws = String::new();
                while let Some(c) = lx.peek() {
                    if c == ' ' || c == '\t' {
                        ws.push(c);
                        lx.bump();
                    } else {
                        break;
                    }
                }
                push(&mut out, RawTok::Ws(ws));
            }
            '\'' => {
                if let Some(result) = lx.try_dated() {
                    push(&mut out, RawTok::Real(result?));
                } else {
                    let tok = lx.lex_string('\'')?;
                    push(&mut out, RawTok::Real(tok));
                }
            }
            '"' => {
                let tok = lx.lex_string('"')?;
                push(&mut out, RawTok::Real(tok));
            }
            c if c.is_ascii_digit() => {
                let tok = lx.lex_number()?;
                push(&mut out, RawTok::Real(tok));
            }
            c if is_ident_start(c) => {
                let mut word = String::new();
                while let Some(c) = lx.peek() {
                    if is_ident_char(c) {
                        word.push(c);
                        lx.bump();
                    } else {
                        break;
                    }
                }
                let tok = keyword(&word).unwrap_or(Tok::Ident(word));
                push(&mut out, RawTok::Real(tok));
            }
            '%' | '#' | '&' | '^' | '@' | '$' => {
                let tok = lx.lex_sigiled(c)?;
                push(&mut out, RawTok::Real(tok));
            }
            ',' => {
                lx.bump();
                push(&mut out, RawTok::Real(Tok::Comma));
            }
            '=' => {
                lx.bump();
                if lx.peek() == Some('=') {
                    lx.bump();
                    push(&mut out, RawTok::Real(Tok::EqEq));
                } else {
                    push(&mut out, RawTok::Real(Tok::Eq));
                }
            }
            '<' => {
                lx.bump();
                if lx.peek() == Some('=') {
                    lx.bump();
                    push(&mut out, RawTok::Real(Tok::Le));
                } else {
                    push(&mut out, RawTok::Real(Tok::Lt));
                }
            }
            '>' => {
                lx.bump();
                if lx.peek() == Some('=') {
                    lx.bump();
                    push(&mut out, RawTok::Real(Tok::Ge));
                } else {
                    push(&mut out, RawTok::Real(Tok::Gt));
                }
            }
            '*' => {
                lx.bump();
                push(&mut out, RawTok::Real(Tok::Wildcard));
            }
            '[' => {
                lx.bump();
                push(&mut out, RawTok::Real(Tok::LBracket));
            }
            ']' => {
                lx.bump();
                push(&mut out, RawTok::Real(Tok::RBracket));
            }
            '(' => {
                lx.bump();
                push(&mut out, RawTok::Real(Tok::LParen));
            }
            ')' => {
                lx.bump();
                push(&mut out, RawTok::Real(Tok::RParen));
            }
            other => {
                return Err(lx.error(format!("invalid token '{}'", other)));
            }
        }
    }
    Ok(out)
}

/// Indent width of a whitespace run; tabs expand to four spaces.
fn indent_width(ws: &str) -> usize {
    ws.chars().map(|c| if c == '\t' { 4 } else { 1 }).sum()
}

/// Second stage: whitespace to INDENT/DEDENT/NEWLINE against an indent stack.
fn layout(raw: Vec<RawToken>) -> Result<Vec<Token>, CompileError> {
    // Pass 1: drop leading blank lines, convert the whitespace before each
    // line's first real token into a pending indent width.
    enum Item {
        Marker { width: usize, line: usize },
        Real(Token),
    }
    let mut items = Vec::new();
    let mut program_started = false;
    let mut line_started = false;
    // Width carried by the most recent whitespace or newline token.
    let mut prev_width: Option<usize> = None;

    for rt in raw {
        match rt.tok {
            RawTok::Ws(ws) => {
                if program_started {
                    prev_width = Some(indent_width(&ws));
                }
            }
            RawTok::Newline => {
                if program_started {
                    line_started = false;
                    prev_width = Some(0);
                }
            }
            RawTok::Real(tok) => {
                if !program_started {
                    program_started = true;
                    line_started = true;
                } else if !line_started {
                    line_started = true;
                    if let Some(width) = prev_width {
                        items.push(Item::Marker {
                            width,
                            line: rt.line,
                        });
                    }
                }
                items.push(Item::Real(Token {
                    tok,
                    line: rt.line,
                    col: rt.col,
                }));
            }
        }
    }

    // Pass 2: markers against the indent stack.
    let mut out = Vec::new();
    let mut stack: Vec<usize> = vec![0];
    let mut last_line = 1;
    for item in items {
        match item {
            Item::Real(token) => {
                last_line = token.line;
                out.push(token);
            }
            Item::Marker { width, line } => {
                last_line = line;
                let top = *stack.last().unwrap();
                if width == top {
                    out.push(Token {
                        tok: Tok::Newline,
                        line,
                        col: 0,
                    });
                } else if width > top {
                    stack.push(width);
                    out.push(Token {
                        tok: Tok::Indent,
                        line,
                        col: 0,
                    });
                } else {
                    while *stack.last().unwrap() > width {
                        stack.pop();
                        out.push(Token {
                            tok: Tok::Dedent,
                            line,
                            col: 0,
                        });
                    }
                    let top = *stack.last().unwrap();
                    if top != width {
                        return Err(CompileError::IndentMismatch {
                            line,
                            expected: top,
                            found: width,
                        });
                    }
                }
            }
        }
    }
    while let Some(level) = stack.pop() {
        if level > 0 {
            out.push(Token {
                tok: Tok::Dedent,
                line: last_line,
                col: 0,
            });
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<Tok> {
        tokenize(source).unwrap().into_iter().map(|t| t.tok).collect()
    }

    #[test]
    fn test_timedelta_units() {
        assert_eq!(kinds("1s 2m 3h 4d"), vec![
            Tok::Timedelta(1),
            Tok::Timedelta(120),
            Tok::Timedelta(10800),
            Tok::Timedelta(345600),
        ]);
    }

    #[test]
    fn test_number_not_timedelta() {
        assert_eq!(kinds("10"), vec![Tok::Number(10)]);
        // Unit letter continuing into an identifier is not a timedelta.
        assert_eq!(
            kinds("10minutes"),
            vec![Tok::Number(10), Tok::Ident("minutes".to_string())]
        );
    }

    #[test]
    fn test_dated_literal_epoch() {
        assert_eq!(kinds("'1970-01-01'"), vec![Tok::Timestamp(0)]);
        assert_eq!(kinds("'1970-01-02'"), vec![Tok::Timestamp(86400)]);
        // 2015-06-01 00:00:00 UTC
        assert_eq!(kinds("'2015-06-01'"), vec![Tok::Timestamp(1433116800)]);
    }

    #[test]
    fn test_single_quoted_string_is_not_a_date() {
        assert_eq!(kinds("'hello'"), vec![Tok::Str("hello".to_string())]);
    }

    #[test]
    fn test_sigiled_identifiers() {
        assert_eq!(kinds("%a #b &c ^d @e $f"), vec![
            Tok::Scalar("%a".to_string()),
            Tok::Set("#b".to_string()),
            Tok::Multiset("&c".to_string()),
            Tok::Hll("^d".to_string()),
            Tok::Array("@e".to_string()),
            Tok::Counter("$f".to_string()),
        ]);
    }

    #[test]
    fn test_comparison_operators() {
        assert_eq!(kinds("< <= > >= = =="), vec![
            Tok::Lt,
            Tok::Le,
            Tok::Gt,
            Tok::Ge,
            Tok::Eq,
            Tok::EqEq,
        ]);
    }

    #[test]
    fn test_comment_and_continuation() {
        assert_eq!(
            kinds("a -- comment\nb"),
            vec![
                Tok::Ident("a".to_string()),
                Tok::Newline,
                Tok::Ident("b".to_string())
            ]
        );
        assert_eq!(
            kinds("a \\\nb"),
            vec![Tok::Ident("a".to_string()), Tok::Ident("b".to_string())]
        );
    }

    #[test]
    fn test_indent_dedent_newline() {
        let toks = kinds("a ->\n  receive\n    x -> repeat\n    y -> repeat\nb -> quit");
        assert_eq!(toks, vec![
            Tok::Ident("a".to_string()),
            Tok::Arrow,
            Tok::Indent,
            Tok::Receive,
            Tok::Indent,
            Tok::Ident("x".to_string()),
            Tok::Arrow,
            Tok::Repeat,
            Tok::Newline,
            Tok::Ident("y".to_string()),
            Tok::Arrow,
            Tok::Repeat,
            Tok::Dedent,
            Tok::Dedent,
            Tok::Ident("b".to_string()),
            Tok::Arrow,
            Tok::Quit,
        ]);
    }

    #[test]
    fn test_leading_blank_lines_dropped() {
        assert_eq!(kinds("\n\n  \na"), vec![Tok::Ident("a".to_string())]);
    }

    #[test]
    fn test_blank_lines_collapse_between_clauses() {
        let toks = kinds("a\n\n\na");
        assert_eq!(toks, vec![
            Tok::Ident("a".to_string()),
            Tok::Newline,
            Tok::Ident("a".to_string()),
        ]);
    }

    #[test]
    fn test_tabs_expand_to_four() {
        // One tab and four spaces are the same level.
        let toks = kinds("a\n\tb\n    c");
        assert_eq!(toks, vec![
            Tok::Ident("a".to_string()),
            Tok::Indent,
            Tok::Ident("b".to_string()),
            Tok::Newline,
            Tok::Ident("c".to_string()),
            Tok::Dedent,
        ]);
    }

    #[test]
    fn test_indent_mismatch() {
        let err = tokenize("a\n    b\n  c").unwrap_err();
        match err {
            CompileError::IndentMismatch {
                line,
                expected,
                found,
            } => {
                assert_eq!(line, 3);
                assert_eq!(expected, 0);
                assert_eq!(found, 2);
            }
            other => panic!("expected IndentMismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_unterminated_string() {
        assert!(matches!(
            tokenize("x = \"abc"),
            Err(CompileError::Lexer { .. })
        ));
    }

    #[test]
    fn test_invalid_character() {
        let err = tokenize("a ! b").unwrap_err();
        match err {
            CompileError::Lexer { line, col, .. } => {
                assert_eq!(line, 1);
                assert_eq!(col, 3);
            }
            other => panic!("expected Lexer error, got {:?}", other),
        }
    }

    #[test]
    fn test_string_escapes_unescaped() {
        assert_eq!(kinds(r#""a\"b""#), vec![Tok::Str(r#"a"b"#.to_string())]);
        assert_eq!(kinds(r#"'a\\b'"#), vec![Tok::Str(r"a\b".to_string())]);
    }

    #[test]
    fn test_eof_closes_all_levels() {
        let toks = kinds("a\n  b\n    c");
        assert_eq!(toks, vec![
            Tok::Ident("a".to_string()),
            Tok::Indent,
            Tok::Ident("b".to_string()),
            Tok::Indent,
            Tok::Ident("c".to_string()),
            Tok::Dedent,
            Tok::Dedent,
        ]);
    }
}
