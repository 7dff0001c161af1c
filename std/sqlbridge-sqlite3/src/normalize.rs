//!
//! Canonical SQL text.
//!
//! `normalize` reduces a statement to a shape suitable for grouping queries
//! that differ only in their literal values:
//! - comments removed and whitespace collapsed
//! - string, numeric and blob literals and all parameters become `?`
//! - keywords upper-cased, identifiers (quoted or not) kept as written
//! - exactly one trailing `;`
//!

const KEYWORDS: &[&str] = &[
    "ABORT", "ACTION", "ADD", "AFTER", "ALL", "ALTER", "ALWAYS", "ANALYZE", "AND", "AS", "ASC",
    "ATTACH", "AUTOINCREMENT", "BEFORE", "BEGIN", "BETWEEN", "BY", "CASCADE", "CASE", "CAST",
    "CHECK", "COLLATE", "COLUMN", "COMMIT", "CONFLICT", "CONSTRAINT", "CREATE", "CROSS",
    "CURRENT", "CURRENT_DATE", "CURRENT_TIME", "CURRENT_TIMESTAMP", "DATABASE", "DEFAULT",
    "DEFERRABLE", "DEFERRED", "DELETE", "DESC", "DETACH", "DISTINCT", "DO", "DROP", "EACH",
    "ELSE", "END", "ESCAPE", "EXCEPT", "EXCLUSIVE", "EXISTS", "EXPLAIN", "FAIL", "FILTER",
    "FIRST", "FOLLOWING", "FOR", "FOREIGN", "FROM", "FULL", "GENERATED", "GLOB", "GROUP",
    "GROUPS", "HAVING", "IF", "IGNORE", "IMMEDIATE", "IN", "INDEX", "INDEXED", "INITIALLY",
    "INNER", "INSERT", "INSTEAD", "INTERSECT", "INTO", "IS", "ISNULL", "JOIN", "KEY", "LAST",
    "LEFT", "LIKE", "LIMIT", "MATCH", "MATERIALIZED", "NATURAL", "NO", "NOT", "NOTHING",
    "NOTNULL", "NULL", "NULLS", "OF", "OFFSET", "ON", "OR", "ORDER", "OTHERS", "OUTER", "OVER",
    "PARTITION", "PLAN", "PRAGMA", "PRECEDING", "PRIMARY", "QUERY", "RAISE", "RANGE",
    "RECURSIVE", "REFERENCES", "REGEXP", "REINDEX", "RELEASE", "RENAME", "REPLACE", "RESTRICT",
    "RETURNING", "RIGHT", "ROLLBACK", "ROW", "ROWS", "SAVEPOINT", "SELECT", "SET", "TABLE",
    "TEMP", "TEMPORARY", "THEN", "TIES", "TO", "TRANSACTION", "TRIGGER", "UNBOUNDED", "UNION",
    "UNIQUE", "UPDATE", "USING", "VACUUM", "VALUES", "VIEW", "VIRTUAL", "WHEN", "WHERE",
    "WINDOW", "WITH", "WITHOUT",
];

const TWO_CHAR_OPERATORS: &[&str] = &["<=", ">=", "<>", "!=", "==", "||", "<<", ">>", "->"];

#[derive(Debug, PartialEq)]
enum Token {
    Keyword(String),
    Identifier(String),
    Placeholder,
    Punct(String),
}

impl Token {
    fn text(&self) -> &str {
        match self {
            Token::Keyword(s) | Token::Identifier(s) | Token::Punct(s) => s,
            Token::Placeholder => "?",
        }
    }
}

fn is_keyword(word: &str) -> bool {
    let upper = word.to_ascii_uppercase();
    KEYWORDS.binary_search(&upper.as_str()).is_ok()
}

fn is_word_start(c: char) -> bool {
    c.is_alphabetic() || c == '_'
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$'
}

struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
    src: &'a str,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            chars: src.char_indices().peekable(),
            src,
        }
    }

    fn peek(&mut self) -> Option<char> {
        self.chars.peek().map(|&(_, c)| c)
    }

    fn peek_second(&self) -> Option<char> {
        let mut ahead = self.chars.clone();
        ahead.next();
        ahead.next().map(|(_, c)| c)
    }

    fn bump(&mut self) -> Option<char> {
        self.chars.next().map(|(_, c)| c)
    }

    fn offset(&mut self) -> usize {
        self.chars.peek().map_or(self.src.len(), |&(i, _)| i)
    }

    fn eat_while(&mut self, pred: impl Fn(char) -> bool) {
        while self.peek().is_some_and(&pred) {
            self.bump();
        }
    }

    /// Consume through the closing `close`, honoring doubled-quote escapes.
    fn eat_quoted(&mut self, close: char) {
        while let Some(c) = self.bump() {
            if c == close {
                if close != ']' && self.peek() == Some(close) {
                    self.bump();
                    continue;
                }
                return;
            }
        }
    }

    fn eat_number(&mut self) {
        if self.peek() == Some('0') && matches!(self.peek_second(), Some('x' | 'X')) {
            self.bump();
            self.bump();
            self.eat_while(|c| c.is_ascii_hexdigit());
            return;
        }
        self.eat_while(|c| c.is_ascii_digit() || c == '_');
        if self.peek() == Some('.') {
            self.bump();
            self.eat_while(|c| c.is_ascii_digit() || c == '_');
        }
        if matches!(self.peek(), Some('e' | 'E')) {
            self.bump();
            if matches!(self.peek(), Some('+' | '-')) {
                self.bump();
            }
            self.eat_while(|c| c.is_ascii_digit());
        }
    }

    fn next_token(&mut self) -> Option<Token> {
        loop {
            let c = self.peek()?;
            if c.is_whitespace() {
                self.bump();
                continue;
            }
            if c == '-' && self.peek_second() == Some('-') {
                self.eat_while(|c| c != '\n');
                continue;
            }
            if c == '/' && self.peek_second() == Some('*') {
                self.bump();
                self.bump();
                let mut prev = '\0';
                while let Some(c) = self.bump() {
                    if prev == '*' && c == '/' {
                        break;
                    }
                    prev = c;
                }
                continue;
            }
            break;
        }

        let start = self.offset();
        let c = self.peek()?;

        if c == '\'' {
            self.bump();
            self.eat_quoted('\'');
            return Some(Token::Placeholder);
        }
        if matches!(c, 'x' | 'X') && self.peek_second() == Some('\'') {
            self.bump();
            self.bump();
            self.eat_quoted('\'');
            return Some(Token::Placeholder);
        }
        if c.is_ascii_digit() || (c == '.' && self.peek_second().is_some_and(|n| n.is_ascii_digit())) {
            self.eat_number();
            return Some(Token::Placeholder);
        }
        if c == '?' {
            self.bump();
            self.eat_while(|c| c.is_ascii_digit());
            return Some(Token::Placeholder);
        }
        if matches!(c, ':' | '@' | '$') && self.peek_second().is_some_and(is_word_char) {
            self.bump();
            self.eat_while(|c| is_word_char(c) || c == ':');
            return Some(Token::Placeholder);
        }
        if matches!(c, '"' | '`' | '[') {
            self.bump();
            self.eat_quoted(if c == '[' { ']' } else { c });
            let end = self.offset();
            return Some(Token::Identifier(self.src[start..end].to_string()));
        }
        if is_word_start(c) {
            self.eat_while(is_word_char);
            let end = self.offset();
            let word = &self.src[start..end];
            return Some(if is_keyword(word) {
                Token::Keyword(word.to_ascii_uppercase())
            } else {
                Token::Identifier(word.to_string())
            });
        }

        self.bump();
        if let Some(next) = self.peek() {
            let pair: String = [c, next].iter().collect();
            if TWO_CHAR_OPERATORS.contains(&pair.as_str()) {
                self.bump();
                if pair == "->" && self.peek() == Some('>') {
                    self.bump();
                    return Some(Token::Punct("->>".to_string()));
                }
                return Some(Token::Punct(pair));
            }
        }
        Some(Token::Punct(c.to_string()))
    }
}

fn is_operand(token: &Token) -> bool {
    matches!(token, Token::Identifier(_) | Token::Placeholder) || matches!(token.text(), ")" | "NULL")
}

/// True when `prev` names a function about to be called. Some keywords
/// double as function names; the pattern-matching operators only do so
/// when they do not follow an operand (`like(a, b)` but `x LIKE (y)`).
fn calls_function(before: Option<&Token>, prev: &Token) -> bool {
    match prev {
        Token::Identifier(_) => true,
        Token::Keyword(word) => match word.as_str() {
            "CAST" | "RAISE" | "REPLACE" => true,
            "GLOB" | "LIKE" | "MATCH" | "REGEXP" => !before.is_some_and(is_operand),
            _ => false,
        },
        _ => false,
    }
}

fn needs_space(before: Option<&Token>, prev: &Token, next: &Token) -> bool {
    if matches!(next.text(), "," | ")" | ";" | ".") {
        return false;
    }
    if matches!(prev.text(), "(" | ".") {
        return false;
    }
    // Function calls and column lists hug their parenthesis.
    !(next.text() == "(" && calls_function(before, prev))
}

pub fn normalize(sql: &str) -> String {
    let mut lexer = Lexer::new(sql);
    let mut out = String::with_capacity(sql.len() + 1);
    let mut before: Option<Token> = None;
    let mut prev: Option<Token> = None;

    while let Some(token) = lexer.next_token() {
        if token.text() == ";" {
            continue;
        }
        if let Some(prev) = &prev {
            if needs_space(before.as_ref(), prev, &token) {
                out.push(' ');
            }
        }
        out.push_str(token.text());
        before = prev.replace(token);
    }
    out.push(';');
    out
}
