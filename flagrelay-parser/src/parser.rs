use crate::grammar::{BodyParser, Rule};
use flagrelay_core::{FlagrelayError, Result, Token};
use pest::Parser;

/// Split a request body on `&` into tokens, preserving their order.
///
/// Tokens are taken verbatim (no URL-decoding). An empty body, an empty token
/// or a token with no flag name before `=` is rejected as malformed input.
pub fn parse_body(input: &str) -> Result<Vec<Token>> {
    if input.is_empty() {
        return Err(FlagrelayError::MalformedInput(
            "request body is empty".to_string(),
        ));
    }

    let mut pairs = BodyParser::parse(Rule::body, input)
        .map_err(|e| FlagrelayError::MalformedInput(format!("Parse error: {}", e)))?;

    let body = pairs.next().ok_or_else(|| {
        FlagrelayError::MalformedInput("No tokens found in body".to_string())
    })?;

    body.into_inner()
        .filter(|pair| pair.as_rule() == Rule::token)
        .enumerate()
        .map(|(index, pair)| parse_token(pair, index + 1))
        .collect()
}

fn parse_token(pair: pest::iterators::Pair<Rule>, position: usize) -> Result<Token> {
    let raw = pair.as_str();
    if raw.is_empty() {
        return Err(FlagrelayError::MalformedInput(format!(
            "token {} is empty",
            position
        )));
    }

    let mut key = "";
    let mut value = None;
    for inner_pair in pair.into_inner() {
        match inner_pair.as_rule() {
            Rule::key => key = inner_pair.as_str(),
            Rule::value => value = Some(inner_pair.as_str().to_string()),
            _ => {}
        }
    }

    if key.is_empty() {
        return Err(FlagrelayError::MalformedInput(format!(
            "token {} ('{}') has no flag name",
            position, raw
        )));
    }

    Ok(Token::new(key, value))
}
