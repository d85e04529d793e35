use super::DslError;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    True,
    False,
    Null,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Dot,
    Not,
    And,
    Or,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Eof,
}

/// A token with the byte offset it started at, for error messages.
#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub token: Token,
    pub pos: usize,
}

pub fn tokenize(source: &str) -> Result<Vec<Spanned>, DslError> {
    let chars: Vec<(usize, char)> = source.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let (pos, c) = chars[i];

        if c.is_whitespace() {
            i += 1;
            continue;
        }

        // Line comments
        if c == '/' && matches!(chars.get(i + 1), Some((_, '/'))) {
            while i < chars.len() && chars[i].1 != '\n' {
                i += 1;
            }
            continue;
        }

        if c.is_ascii_digit() {
            let start = i;
            while i < chars.len() && (chars[i].1.is_ascii_digit() || chars[i].1 == '.') {
                i += 1;
            }
            let text: String = chars[start..i].iter().map(|(_, c)| c).collect();
            let value = text.parse::<f64>().map_err(|_| DslError::Syntax {
                pos,
                message: format!("invalid number '{}'", text),
            })?;
            tokens.push(Spanned { token: Token::Number(value), pos });
            continue;
        }

        if c.is_alphabetic() || c == '_' || c == '$' {
            let start = i;
            while i < chars.len() && (chars[i].1.is_alphanumeric() || chars[i].1 == '_' || chars[i].1 == '$') {
                i += 1;
            }
            let word: String = chars[start..i].iter().map(|(_, c)| c).collect();
            let token = match word.as_str() {
                "true" => Token::True,
                "false" => Token::False,
                "null" | "undefined" => Token::Null,
                _ => Token::Ident(word),
            };
            tokens.push(Spanned { token, pos });
            continue;
        }

        if c == '"' || c == '\'' {
            let quote = c;
            i += 1;
            let mut text = String::new();
            loop {
                let Some(&(_, ch)) = chars.get(i) else {
                    return Err(DslError::Syntax { pos, message: "unterminated string".into() });
                };
                i += 1;
                if ch == quote {
                    break;
                }
                if ch == '\\' {
                    let Some(&(_, escaped)) = chars.get(i) else {
                        return Err(DslError::Syntax { pos, message: "unterminated escape".into() });
                    };
                    i += 1;
                    text.push(match escaped {
                        'n' => '\n',
                        'r' => '\r',
                        't' => '\t',
                        '0' => '\0',
                        other => other,
                    });
                } else {
                    text.push(ch);
                }
            }
            tokens.push(Spanned { token: Token::Str(text), pos });
            continue;
        }

        let next = chars.get(i + 1).map(|(_, c)| *c);
        let after = chars.get(i + 2).map(|(_, c)| *c);
        let (token, width) = match (c, next) {
            ('&', Some('&')) => (Token::And, 2),
            ('|', Some('|')) => (Token::Or, 2),
            ('=', Some('=')) if after == Some('=') => (Token::Eq, 3),
            ('=', Some('=')) => (Token::Eq, 2),
            ('!', Some('=')) if after == Some('=') => (Token::NotEq, 3),
            ('!', Some('=')) => (Token::NotEq, 2),
            ('<', Some('=')) => (Token::LtEq, 2),
            ('>', Some('=')) => (Token::GtEq, 2),
            ('<', _) => (Token::Lt, 1),
            ('>', _) => (Token::Gt, 1),
            ('!', _) => (Token::Not, 1),
            ('(', _) => (Token::LParen, 1),
            (')', _) => (Token::RParen, 1),
            ('[', _) => (Token::LBracket, 1),
            (']', _) => (Token::RBracket, 1),
            (',', _) => (Token::Comma, 1),
            ('.', _) => (Token::Dot, 1),
            ('+', _) => (Token::Plus, 1),
            ('-', _) => (Token::Minus, 1),
            ('*', _) => (Token::Star, 1),
            ('/', _) => (Token::Slash, 1),
            ('%', _) => (Token::Percent, 1),
            _ => {
                return Err(DslError::Syntax {
                    pos,
                    message: format!("unexpected character '{}'", c),
                })
            }
        };
        tokens.push(Spanned { token, pos });
        i += width;
    }

    tokens.push(Spanned { token: Token::Eof, pos: source.len() });
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<Token> {
        tokenize(source).unwrap().into_iter().map(|s| s.token).collect()
    }

    #[test]
    fn test_operators_and_literals() {
        assert_eq!(
            kinds("status_code == 200 && contains(body, 'ok')"),
            vec![
                Token::Ident("status_code".into()),
                Token::Eq,
                Token::Number(200.0),
                Token::And,
                Token::Ident("contains".into()),
                Token::LParen,
                Token::Ident("body".into()),
                Token::Comma,
                Token::Str("ok".into()),
                Token::RParen,
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_strict_equality_folds() {
        assert_eq!(kinds("a === b !== c"), vec![
            Token::Ident("a".into()),
            Token::Eq,
            Token::Ident("b".into()),
            Token::NotEq,
            Token::Ident("c".into()),
            Token::Eof,
        ]);
    }

    #[test]
    fn test_line_comments_skipped() {
        assert_eq!(
            kinds("// status check\nstatus_code != 404"),
            vec![Token::Ident("status_code".into()), Token::NotEq, Token::Number(404.0), Token::Eof]
        );
    }

    #[test]
    fn test_assignment_is_rejected() {
        assert!(matches!(tokenize("a = 1"), Err(DslError::Syntax { .. })));
    }

    #[test]
    fn test_string_escapes() {
        assert_eq!(kinds(r#""a\"b\n""#), vec![Token::Str("a\"b\n".into()), Token::Eof]);
    }

    #[test]
    fn test_unterminated_string() {
        assert!(matches!(tokenize("'abc"), Err(DslError::Syntax { .. })));
    }
}
