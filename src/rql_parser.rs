//! RQL Parser
//!
//! Converts the lexer's token stream into an [`RqlQuery`]. Top-level terms are
//! joined with an implicit `and`; `sort`, `limit` and `offset` are lifted out
//! of the filter tree.

use crate::error::{RqlError, RqlErrorCode};
use crate::rql_ast::{RqlArg, RqlNode, RqlQuery, SortTerm};
use crate::rql_lexer::{Lexer, Token};

pub struct Parser {
    tokens: Vec<Token>,
    position: usize,
}

impl Parser {
    pub fn new(tokens: Vec<Token>) -> Self {
        Parser { tokens, position: 0 }
    }

    /// Parse an RQL string
    pub fn parse(query: &str) -> Result<RqlQuery, RqlError> {
        let tokens = Lexer::new(query).tokenize()?;
        Parser::new(tokens).parse_query()
    }

    pub fn parse_query(&mut self) -> Result<RqlQuery, RqlError> {
        let mut query = RqlQuery::default();
        let mut filters = Vec::new();

        while self.current() != &Token::Eof {
            let term = self.parse_arg()?;
            match term {
                RqlArg::Node(node) => match node.op.as_str() {
                    "sort" => query.sort = parse_sort(&node)?,
                    "limit" => {
                        query.limit = Some(parse_count(&node, 0)?);
                        if node.args.len() > 1 {
                            query.offset = Some(parse_count(&node, 1)?);
                        }
                    }
                    "offset" => query.offset = Some(parse_count(&node, 0)?),
                    _ => filters.push(RqlArg::Node(node)),
                },
                other => {
                    return Err(wrong(format!("Expected operator call, got '{}'", other)));
                }
            }
            match self.current() {
                Token::Comma => self.advance(),
                Token::Eof => {}
                other => return Err(wrong(format!("Expected ',' got {}", other))),
            }
        }

        query.node = match filters.len() {
            0 => None,
            1 => match filters.pop() {
                Some(RqlArg::Node(node)) => Some(node),
                _ => None,
            },
            _ => Some(RqlNode::new("and", filters)),
        };
        Ok(query)
    }

    fn parse_arg(&mut self) -> Result<RqlArg, RqlError> {
        match self.current().clone() {
            Token::Word(word) => {
                self.advance();
                if self.current() == &Token::LeftParen {
                    self.advance();
                    let args = self.parse_args()?;
                    Ok(RqlArg::Node(RqlNode::new(word, args)))
                } else {
                    Ok(RqlArg::Value(word))
                }
            }
            Token::Quoted(text) => {
                self.advance();
                Ok(RqlArg::Value(text))
            }
            Token::LeftParen => {
                self.advance();
                Ok(RqlArg::List(self.parse_args()?))
            }
            other => Err(wrong(format!("Unexpected token {}", other))),
        }
    }

    /// Comma separated arguments up to and including the closing parenthesis
    fn parse_args(&mut self) -> Result<Vec<RqlArg>, RqlError> {
        let mut args = Vec::new();
        if self.current() == &Token::RightParen {
            self.advance();
            return Ok(args);
        }
        loop {
            args.push(self.parse_arg()?);
            match self.current() {
                Token::Comma => self.advance(),
                Token::RightParen => {
                    self.advance();
                    return Ok(args);
                }
                other => return Err(wrong(format!("Expected ',' or ')' got {}", other))),
            }
        }
    }

    fn current(&self) -> &Token {
        self.tokens.get(self.position).unwrap_or(&Token::Eof)
    }

    fn advance(&mut self) {
        if self.position < self.tokens.len() {
            self.position += 1;
        }
    }
}

fn wrong(message: String) -> RqlError {
    RqlError::new(RqlErrorCode::Wrong, message)
}

fn parse_sort(node: &RqlNode) -> Result<Vec<SortTerm>, RqlError> {
    node.args
        .iter()
        .map(|arg| {
            let raw = arg
                .as_value()
                .ok_or_else(|| wrong(format!("Sort term '{}' is not a field", arg)))?;
            let (by, desc) = match raw.chars().next() {
                Some('-') => (&raw[1..], true),
                Some('+') => (&raw[1..], false),
                _ => (raw, false),
            };
            if by.is_empty() {
                return Err(wrong("Empty sort term".to_string()));
            }
            Ok(SortTerm {
                by: by.to_string(),
                desc,
            })
        })
        .collect()
}

fn parse_count(node: &RqlNode, index: usize) -> Result<usize, RqlError> {
    node.args
        .get(index)
        .and_then(RqlArg::as_value)
        .and_then(|v| v.parse::<usize>().ok())
        .ok_or_else(|| {
            RqlError::new(
                RqlErrorCode::WrongValue,
                format!("'{}' expects a non-negative integer argument", node.op),
            )
        })
}
