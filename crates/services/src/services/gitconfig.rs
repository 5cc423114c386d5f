//! Parser for the `--git-config` flag: comma-separated `key:value` pairs
//! with an escape grammar that lets values contain colons, commas and
//! quotes. Each element is either a double-quoted string or an unquoted
//! run ending at the first unescaped separator.

use std::{iter::Peekable, path::Path, str::Chars};

use thiserror::Error;
use tokio::time::Instant;

use super::git_cli::{GitCli, GitCliError};

#[derive(Debug, Error, PartialEq)]
pub enum GitConfigParseError {
    #[error("unknown escape sequence \\{0}")]
    UnknownEscape(char),
    #[error("escape at end of input")]
    DanglingEscape,
    #[error("unterminated quoted string")]
    UnterminatedQuote,
    #[error("expected {0:?} after closing quote, found {1:?}")]
    UnexpectedAfterQuote(char, char),
    #[error("key is missing a ':' separator")]
    MissingSeparator,
    #[error("empty key")]
    EmptyKey,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitConfigPair {
    pub key: String,
    pub value: String,
}

/// Parse the full pair list. An empty input yields no pairs.
pub fn parse_git_configs(input: &str) -> Result<Vec<GitConfigPair>, GitConfigParseError> {
    let mut pairs = Vec::new();
    if input.is_empty() {
        return Ok(pairs);
    }
    let mut chars = input.chars().peekable();
    loop {
        if chars.peek().is_none() {
            // Only reachable after a trailing comma.
            return Err(GitConfigParseError::EmptyKey);
        }
        let (key, _) = parse_element(&mut chars, ':')?;
        if key.is_empty() {
            return Err(GitConfigParseError::EmptyKey);
        }
        let (value, more) = parse_element(&mut chars, ',')?;
        pairs.push(GitConfigPair { key, value });
        if !more {
            return Ok(pairs);
        }
    }
}

/// Parse one element up to the unescaped `sep`, consuming it. Returns the
/// element and whether the separator was actually seen: a key must reach
/// its separator, a value may instead run to end of input.
fn parse_element(
    chars: &mut Peekable<Chars<'_>>,
    sep: char,
) -> Result<(String, bool), GitConfigParseError> {
    if chars.peek() == Some(&'"') {
        chars.next();
        let out = parse_quoted(chars)?;
        match chars.next() {
            Some(c) if c == sep => Ok((out, true)),
            Some(c) => Err(GitConfigParseError::UnexpectedAfterQuote(sep, c)),
            None if sep == ',' => Ok((out, false)),
            None => Err(GitConfigParseError::MissingSeparator),
        }
    } else {
        let mut out = String::new();
        loop {
            match chars.next() {
                Some('\\') => out.push(unescape(chars.next())?),
                Some(c) if c == sep => return Ok((out, true)),
                Some(c) => out.push(c),
                None if sep == ',' => return Ok((out, false)),
                None => return Err(GitConfigParseError::MissingSeparator),
            }
        }
    }
}

fn parse_quoted(chars: &mut Peekable<Chars<'_>>) -> Result<String, GitConfigParseError> {
    let mut out = String::new();
    loop {
        match chars.next() {
            Some('\\') => out.push(unescape(chars.next())?),
            Some('"') => return Ok(out),
            Some(c) => out.push(c),
            None => return Err(GitConfigParseError::UnterminatedQuote),
        }
    }
}

fn unescape(c: Option<char>) -> Result<char, GitConfigParseError> {
    match c {
        Some('n') => Ok('\n'),
        Some('t') => Ok('\t'),
        Some('"') => Ok('"'),
        Some(',') => Ok(','),
        Some('\\') => Ok('\\'),
        Some(other) => Err(GitConfigParseError::UnknownEscape(other)),
        None => Err(GitConfigParseError::DanglingEscape),
    }
}

/// Write the parsed pairs into the (private) global config.
pub async fn apply_git_configs(
    git: &GitCli,
    cwd: &Path,
    pairs: &[GitConfigPair],
    deadline: Instant,
) -> Result<(), GitCliError> {
    for pair in pairs {
        git.run(
            cwd,
            ["config", "--global", pair.key.as_str(), pair.value.as_str()],
            deadline,
        )
        .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(key: &str, value: &str) -> GitConfigPair {
        GitConfigPair {
            key: key.to_string(),
            value: value.to_string(),
        }
    }

    #[test]
    fn empty_input_is_no_pairs() {
        assert_eq!(parse_git_configs("").unwrap(), vec![]);
    }

    #[test]
    fn single_and_multiple_pairs() {
        assert_eq!(parse_git_configs("k:v").unwrap(), vec![pair("k", "v")]);
        assert_eq!(
            parse_git_configs("k1:v1,k2:v2").unwrap(),
            vec![pair("k1", "v1"), pair("k2", "v2")]
        );
    }

    #[test]
    fn empty_value_is_allowed() {
        assert_eq!(parse_git_configs("k:").unwrap(), vec![pair("k", "")]);
        assert_eq!(
            parse_git_configs("k1:,k2:v").unwrap(),
            vec![pair("k1", ""), pair("k2", "v")]
        );
    }

    #[test]
    fn unquoted_value_may_contain_colons() {
        assert_eq!(
            parse_git_configs("http.proxy:http://proxy:3128").unwrap(),
            vec![pair("http.proxy", "http://proxy:3128")]
        );
    }

    #[test]
    fn escaped_comma_in_unquoted_value() {
        assert_eq!(
            parse_git_configs(r"k:a\,b,k2:v").unwrap(),
            vec![pair("k", "a,b"), pair("k2", "v")]
        );
    }

    #[test]
    fn quoted_value_with_separators_and_escapes() {
        assert_eq!(
            parse_git_configs(r#"k:"a,b:c""#).unwrap(),
            vec![pair("k", "a,b:c")]
        );
        assert_eq!(
            parse_git_configs(r#""a key":"line1\nline2\t\"quoted\"\\""#).unwrap(),
            vec![pair("a key", "line1\nline2\t\"quoted\"\\")]
        );
    }

    #[test]
    fn quoted_key_then_unquoted_value() {
        assert_eq!(
            parse_git_configs(r#""k1":v1,k2:v2"#).unwrap(),
            vec![pair("k1", "v1"), pair("k2", "v2")]
        );
    }

    #[test]
    fn unknown_escape_is_an_error() {
        assert_eq!(
            parse_git_configs(r"k:a\zb").unwrap_err(),
            GitConfigParseError::UnknownEscape('z')
        );
    }

    #[test]
    fn missing_separator_is_an_error() {
        assert_eq!(
            parse_git_configs("justakey").unwrap_err(),
            GitConfigParseError::MissingSeparator
        );
    }

    #[test]
    fn empty_key_is_an_error() {
        assert_eq!(
            parse_git_configs(":v").unwrap_err(),
            GitConfigParseError::EmptyKey
        );
        // A trailing comma implies another (empty) pair.
        assert_eq!(
            parse_git_configs("k:v,").unwrap_err(),
            GitConfigParseError::EmptyKey
        );
    }

    #[test]
    fn unterminated_quote_is_an_error() {
        assert_eq!(
            parse_git_configs(r#"k:"open"#).unwrap_err(),
            GitConfigParseError::UnterminatedQuote
        );
    }

    #[test]
    fn junk_after_closing_quote_is_an_error() {
        assert_eq!(
            parse_git_configs(r#"k:"v"x,k2:v2"#).unwrap_err(),
            GitConfigParseError::UnexpectedAfterQuote(',', 'x')
        );
    }
}
