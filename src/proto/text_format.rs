//! Protocol buffer text format.
//!
//! Documents are parsed without a schema into a tree of [`Message`]s. Fields keep their order and
//! may repeat. `field: [a, b]` is read as two `field` entries.
use crate::error::{Error, Result};
use std::{
    fmt::{self, Display},
    fs,
    path::{Path, PathBuf},
};

/// A field value.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    /// An integer.
    Int(i64),
    /// A floating point number.
    Float(f64),
    /// A quoted string.
    Str(String),
    /// An identifier, ie an enum value or a bool.
    Ident(String),
    /// A nested message.
    Message(Message),
}

impl Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Int(x) => write!(f, "{x}"),
            Self::Float(x) => write!(f, "{x:?}"),
            Self::Str(x) => write!(f, "{x:?}"),
            Self::Ident(x) => write!(f, "{x}"),
            Self::Message(x) => write!(f, "{{ {x}}}"),
        }
    }
}

/// A text format message.
#[derive(Clone, Default, Debug, PartialEq)]
pub struct Message {
    fields: Vec<(String, Value)>,
}

impl Message {
    /// Parses `text`. `path` is reported in errors.
    ///
    /// **Errors**
    /// - `text` is not valid text format.
    pub fn parse(text: &str, path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let tokens = Lexer::new(text).tokenize().map_err(|e| e.into_error(&path))?;
        let mut parser = Parser {
            tokens,
            index: 0,
            depth: 0,
        };
        parser.message(None).map_err(|e| e.into_error(&path))
    }
    /// Reads and parses a file.
    ///
    /// **Errors**
    /// - The file could not be read.
    /// - See [`Message::parse()`].
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        Self::parse(&text, path)
    }
    /// The fields, in order.
    pub fn fields(&self) -> &[(String, Value)] {
        &self.fields
    }
    /// Whether there are no fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
    /// Appends a field.
    pub fn push(&mut self, name: impl Into<String>, value: Value) {
        self.fields.push((name.into(), value));
    }
    /// Appends the fields of `other`.
    pub fn merge(&mut self, other: Message) {
        self.fields.extend(other.fields);
    }
    /// Every value of `name`.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Value> + 'a {
        self.fields
            .iter()
            .filter(move |(field, _)| field == name)
            .map(|(_, value)| value)
    }
    /// The last value of `name`.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields
            .iter()
            .rev()
            .find(|(field, _)| field == name)
            .map(|(_, value)| value)
    }
    /// Whether there is a field `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }
    /// Every message valued field `name`.
    pub fn messages<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Message> + 'a {
        self.get_all(name).filter_map(|value| match value {
            Value::Message(message) => Some(message),
            _ => None,
        })
    }
    /// The last message valued field `name`.
    pub fn message(&self, name: &str) -> Option<&Message> {
        self.fields.iter().rev().find_map(|(field, value)| match value {
            Value::Message(message) if field == name => Some(message),
            _ => None,
        })
    }
    /// A string or identifier field.
    ///
    /// **Errors**
    /// - The field has another type.
    pub fn get_str(&self, name: &str) -> Result<Option<&str>> {
        match self.get(name) {
            None => Ok(None),
            Some(Value::Str(x) | Value::Ident(x)) => Ok(Some(x.as_str())),
            Some(value) => Err(type_error(name, "a string", value)),
        }
    }
    /// A non negative integer field.
    ///
    /// **Errors**
    /// - The field has another type or is negative.
    pub fn get_usize(&self, name: &str) -> Result<Option<usize>> {
        match self.get(name) {
            None => Ok(None),
            Some(Value::Int(x)) => usize::try_from(*x)
                .map(Some)
                .map_err(|_| type_error(name, "a non negative integer", &Value::Int(*x))),
            Some(value) => Err(type_error(name, "a non negative integer", value)),
        }
    }
    /// A numeric field.
    ///
    /// **Errors**
    /// - The field has another type.
    pub fn get_f64(&self, name: &str) -> Result<Option<f64>> {
        match self.get(name) {
            None => Ok(None),
            Some(Value::Int(x)) => Ok(Some(*x as f64)),
            Some(Value::Float(x)) => Ok(Some(*x)),
            Some(value) => Err(type_error(name, "a number", value)),
        }
    }
    /// A bool field, written as `true`, `false`, 1 or 0.
    ///
    /// **Errors**
    /// - The field has another type.
    pub fn get_bool(&self, name: &str) -> Result<Option<bool>> {
        match self.get(name) {
            None => Ok(None),
            Some(Value::Ident(x)) if x == "true" => Ok(Some(true)),
            Some(Value::Ident(x)) if x == "false" => Ok(Some(false)),
            Some(Value::Int(x @ (0 | 1))) => Ok(Some(*x == 1)),
            Some(value) => Err(type_error(name, "a bool", value)),
        }
    }
}

fn type_error(name: &str, expected: &str, value: &Value) -> Error {
    Error::config(format!("field {name:?} must be {expected}, found {value}"))
}

impl Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write_message(f, self, 0)
    }
}

fn write_message(f: &mut fmt::Formatter, message: &Message, indent: usize) -> fmt::Result {
    for (name, value) in message.fields.iter() {
        match value {
            Value::Message(message) => {
                writeln!(f, "{:indent$}{name} {{", "")?;
                write_message(f, message, indent + 2)?;
                writeln!(f, "{:indent$}}}", "")?;
            }
            value => writeln!(f, "{:indent$}{name}: {value}", "")?,
        }
    }
    Ok(())
}

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Number(String),
    Punct(char),
    Eof,
}

impl Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Ident(x) => write!(f, "identifier {x:?}"),
            Self::Str(x) => write!(f, "string {x:?}"),
            Self::Number(x) => write!(f, "number {x}"),
            Self::Punct(x) => write!(f, "{x:?}"),
            Self::Eof => write!(f, "end of file"),
        }
    }
}

#[derive(Debug)]
struct Located {
    line: usize,
    column: usize,
    message: String,
}

impl Located {
    fn into_error(self, path: &Path) -> Error {
        Error::Parse {
            path: path.to_owned(),
            line: self.line,
            column: self.column,
            message: self.message,
        }
    }
}

struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
    line: usize,
    column: usize,
}

impl<'a> Lexer<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            chars: text.chars().peekable(),
            line: 1,
            column: 1,
        }
    }
    fn bump(&mut self) -> Option<char> {
        let c = self.chars.next()?;
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }
    fn error(&self, message: impl Into<String>) -> Located {
        Located {
            line: self.line,
            column: self.column,
            message: message.into(),
        }
    }
    fn tokenize(mut self) -> Result<Vec<(Token, usize, usize)>, Located> {
        let mut tokens = Vec::new();
        while let Some(&c) = self.chars.peek() {
            let (line, column) = (self.line, self.column);
            let token = match c {
                c if c.is_whitespace() => {
                    self.bump();
                    continue;
                }
                '#' => {
                    while self.chars.peek().map_or(false, |c| *c != '\n') {
                        self.bump();
                    }
                    continue;
                }
                '"' | '\'' => self.string()?,
                c if c.is_ascii_digit() || c == '-' || c == '.' => self.number(),
                c if c.is_alphabetic() || c == '_' => {
                    let mut ident = String::new();
                    while let Some(&c) = self.chars.peek() {
                        if c.is_alphanumeric() || c == '_' || c == '.' {
                            ident.push(c);
                            self.bump();
                        } else {
                            break;
                        }
                    }
                    Token::Ident(ident)
                }
                '{' | '}' | '<' | '>' | '[' | ']' | ':' | ',' | ';' => {
                    self.bump();
                    Token::Punct(c)
                }
                c => return Err(self.error(format!("unexpected character {c:?}"))),
            };
            tokens.push((token, line, column));
        }
        tokens.push((Token::Eof, self.line, self.column));
        Ok(tokens)
    }
    fn string(&mut self) -> Result<Token, Located> {
        let quote = self.bump();
        let mut string = String::new();
        loop {
            match self.bump() {
                None | Some('\n') => return Err(self.error("unterminated string")),
                Some(c) if Some(c) == quote => return Ok(Token::Str(string)),
                Some('\\') => {
                    let c = match self.bump() {
                        Some('n') => '\n',
                        Some('t') => '\t',
                        Some('r') => '\r',
                        Some(c @ ('\\' | '"' | '\'')) => c,
                        c => return Err(self.error(format!("invalid escape {c:?}"))),
                    };
                    string.push(c);
                }
                Some(c) => string.push(c),
            }
        }
    }
    fn number(&mut self) -> Token {
        let mut number = String::new();
        while let Some(&c) = self.chars.peek() {
            let exponent_sign =
                (c == '-' || c == '+') && number.ends_with(|x: char| x == 'e' || x == 'E');
            if c.is_ascii_alphanumeric() || c == '.' || exponent_sign || number.is_empty() {
                number.push(c);
                self.bump();
            } else {
                break;
            }
        }
        Token::Number(number)
    }
}

// Maximum message nesting.
const MAX_DEPTH: usize = 64;

struct Parser {
    tokens: Vec<(Token, usize, usize)>,
    index: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        &self.tokens[self.index.min(self.tokens.len() - 1)].0
    }
    fn next(&mut self) -> Token {
        let token = self.peek().clone();
        if self.index < self.tokens.len() - 1 {
            self.index += 1;
        }
        token
    }
    fn error(&self, message: impl Into<String>) -> Located {
        let (_, line, column) = &self.tokens[self.index.min(self.tokens.len() - 1)];
        Located {
            line: *line,
            column: *column,
            message: message.into(),
        }
    }
    fn eat(&mut self, c: char) -> bool {
        if *self.peek() == Token::Punct(c) {
            self.next();
            true
        } else {
            false
        }
    }
    // Parses fields until `close`, or the end of input at the top level.
    fn message(&mut self, close: Option<char>) -> Result<Message, Located> {
        let mut message = Message::default();
        loop {
            match self.peek().clone() {
                Token::Eof if close.is_none() => return Ok(message),
                Token::Punct(c) if Some(c) == close => {
                    self.next();
                    return Ok(message);
                }
                Token::Ident(name) => {
                    self.next();
                    self.field(&name, &mut message)?;
                    if !self.eat(',') {
                        self.eat(';');
                    }
                }
                token => {
                    let expected = close.map_or("a field name".to_string(), |c| {
                        format!("a field name or {c:?}")
                    });
                    return Err(self.error(format!("expected {expected}, found {token}")));
                }
            }
        }
    }
    fn nested(&mut self, close: char) -> Result<Message, Located> {
        if self.depth == MAX_DEPTH {
            return Err(self.error(format!("messages nested deeper than {MAX_DEPTH}")));
        }
        self.depth += 1;
        let message = self.message(Some(close));
        self.depth -= 1;
        message
    }
    fn field(&mut self, name: &str, message: &mut Message) -> Result<(), Located> {
        let colon = self.eat(':');
        match self.peek().clone() {
            Token::Punct('{') => {
                self.next();
                message.push(name, Value::Message(self.nested('}')?));
            }
            Token::Punct('<') => {
                self.next();
                message.push(name, Value::Message(self.nested('>')?));
            }
            Token::Punct('[') if colon => {
                self.next();
                if !self.eat(']') {
                    loop {
                        let value = self.scalar()?;
                        message.push(name, value);
                        if self.eat(']') {
                            break;
                        }
                        if !self.eat(',') {
                            let message = format!("expected ',' or ']' in the list of {name:?}");
                            return Err(self.error(message));
                        }
                    }
                }
            }
            _ if colon => {
                let value = self.scalar()?;
                message.push(name, value);
            }
            token => {
                let message = format!("expected ':' or '{{' after {name:?}, found {token}");
                return Err(self.error(message));
            }
        }
        Ok(())
    }
    fn scalar(&mut self) -> Result<Value, Located> {
        match self.peek().clone() {
            Token::Str(mut string) => {
                self.next();
                // Adjacent strings are concatenated.
                while let Token::Str(next) = self.peek().clone() {
                    self.next();
                    string.push_str(&next);
                }
                Ok(Value::Str(string))
            }
            Token::Ident(ident) => {
                self.next();
                Ok(Value::Ident(ident))
            }
            Token::Number(number) => {
                let value = if let Ok(x) = number.parse::<i64>() {
                    Value::Int(x)
                } else if let Ok(x) = number.trim_end_matches(['f', 'F']).parse::<f64>() {
                    Value::Float(x)
                } else {
                    return Err(self.error(format!("invalid number {number:?}")));
                };
                self.next();
                Ok(value)
            }
            token => Err(self.error(format!("expected a value, found {token}"))),
        }
    }
}
