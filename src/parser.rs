use nom::{
    branch::alt,
    bytes::complete::{tag, tag_no_case, take_till, take_while, take_while1},
    character::complete::{char, digit1, multispace0, multispace1},
    combinator::{map, map_res, opt, recognize},
    multi::separated_list1,
    sequence::{delimited, pair, preceded},
    IResult,
};
use thiserror::Error;

use crate::filter::{RawClause, RawOp};
use crate::model::TxnId;

const DEFAULT_LIST_LIMIT: usize = 20;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseError {
    #[error("invalid syntax near '{0}'")]
    Syntax(String),

    #[error("unexpected tokens at end: '{0}'")]
    Trailing(String),

    #[error("incomplete input")]
    Incomplete,
}

/// Shell commands understood by `ledgerlens-shell`.
#[derive(Debug, PartialEq, Clone)]
pub enum Command {
    Search { query: String, filter: Vec<RawClause>, limit: Option<usize> },
    Get { id: TxnId },
    User { user_id: String, limit: usize },
    Category { category: String, limit: usize },
    Users,
    Categories,
    Stats,
    /// Whole catalog, or one user's transactions.
    Summary { user_id: Option<String> },
    Rebuild,
    Save,
    Help,
    Exit,
}

// --- BASIC PARSERS ---

fn parse_usize(input: &str) -> IResult<&str, usize> {
    map_res(digit1, |s: &str| s.parse::<usize>())(input)
}

fn parse_quoted(input: &str) -> IResult<&str, String> {
    map(
        alt((
            delimited(char('\''), take_till(|c| c == '\''), char('\'')),
            delimited(char('"'), take_till(|c| c == '"'), char('"')),
        )),
        str::to_string,
    )(input)
}

/// Unquoted literal: numbers, dates, identifiers like USER001.
fn parse_bare(input: &str) -> IResult<&str, String> {
    map(
        take_while1(|c: char| c.is_ascii_alphanumeric() || "._:+-".contains(c)),
        str::to_string,
    )(input)
}

fn parse_value(input: &str) -> IResult<&str, String> {
    alt((parse_quoted, parse_bare))(input)
}

fn parse_ident(input: &str) -> IResult<&str, &str> {
    recognize(pair(
        take_while1(|c: char| c.is_ascii_alphabetic() || c == '_'),
        take_while(|c: char| c.is_ascii_alphanumeric() || c == '_'),
    ))(input)
}

// --- HELPERS ---
fn ws<'a, F, O, E: nom::error::ParseError<&'a str>>(inner: F) -> impl FnMut(&'a str) -> IResult<&'a str, O, E>
where F: FnMut(&'a str) -> IResult<&'a str, O, E> {
    delimited(multispace0, inner, multispace0)
}

fn tag_ci(t: &'static str) -> impl FnMut(&str) -> IResult<&str, &str> {
    move |input| tag_no_case(t)(input)
}

/// Keyword surrounded by mandatory whitespace, e.g. ` AND `.
fn keyword(t: &'static str) -> impl FnMut(&str) -> IResult<&str, &str> {
    move |input| delimited(multispace1, tag_no_case(t), multispace1)(input)
}

// --- FILTER PARSERS ---

fn parse_between(input: &str) -> IResult<&str, RawOp> {
    let (input, _) = tag_ci("BETWEEN")(input)?;
    let (input, _) = multispace1(input)?;
    let (input, lo) = parse_value(input)?;
    let (input, _) = keyword("AND")(input)?;
    let (input, hi) = parse_value(input)?;
    Ok((input, RawOp::Between(lo, hi)))
}

fn parse_in(input: &str) -> IResult<&str, RawOp> {
    let (input, _) = tag_ci("IN")(input)?;
    let (input, _) = multispace0(input)?;
    let (input, values) = delimited(
        char('('),
        separated_list1(char(','), ws(parse_value)),
        char(')'),
    )(input)?;
    Ok((input, RawOp::In(values)))
}

fn parse_comparison(input: &str) -> IResult<&str, RawOp> {
    let (input, op) = alt((tag(">="), tag("<="), tag(">"), tag("<"), tag("=")))(input)?;
    let (input, _) = multispace0(input)?;
    let (input, value) = parse_value(input)?;
    let op = match op {
        ">=" => RawOp::Ge(value),
        "<=" => RawOp::Le(value),
        ">" => RawOp::Gt(value),
        "<" => RawOp::Lt(value),
        _ => RawOp::Eq(value),
    };
    Ok((input, op))
}

fn parse_clause(input: &str) -> IResult<&str, RawClause> {
    let (input, field) = ws(parse_ident)(input)?;
    let (input, op) = alt((parse_between, parse_in, parse_comparison))(input)?;
    Ok((input, RawClause::new(field, op)))
}

fn parse_clauses(input: &str) -> IResult<&str, Vec<RawClause>> {
    separated_list1(keyword("AND"), parse_clause)(input)
}

/// Parses a filter expression: `clause (AND clause)*`.
pub fn parse_filter(input: &str) -> Result<Vec<RawClause>, ParseError> {
    finish(parse_clauses(input.trim()))
}

// --- COMMAND PARSERS ---

fn parse_limit(input: &str) -> IResult<&str, usize> {
    preceded(keyword("LIMIT"), parse_usize)(input)
}

fn parse_search(input: &str) -> IResult<&str, Command> {
    let (input, _) = alt((tag_ci("SEARCH"), tag_ci("FIND")))(input)?;
    let (input, _) = multispace1(input)?;
    let (input, query) = parse_quoted(input)?;
    let (input, filter) = opt(preceded(keyword("WHERE"), parse_clauses))(input)?;
    let (input, limit) = opt(parse_limit)(input)?;
    Ok((input, Command::Search { query, filter: filter.unwrap_or_default(), limit }))
}

fn parse_get(input: &str) -> IResult<&str, Command> {
    let (input, _) = tag_ci("GET")(input)?;
    let (input, _) = multispace1(input)?;
    let (input, id) = map_res(parse_value, |s: String| s.parse::<TxnId>())(input)?;
    Ok((input, Command::Get { id }))
}

fn parse_user(input: &str) -> IResult<&str, Command> {
    let (input, _) = tag_ci("USER")(input)?;
    let (input, _) = multispace1(input)?;
    let (input, user_id) = parse_value(input)?;
    let (input, limit) = opt(parse_limit)(input)?;
    Ok((input, Command::User { user_id, limit: limit.unwrap_or(DEFAULT_LIST_LIMIT) }))
}

fn parse_category(input: &str) -> IResult<&str, Command> {
    let (input, _) = tag_ci("CATEGORY")(input)?;
    let (input, _) = multispace1(input)?;
    let (input, category) = parse_value(input)?;
    let (input, limit) = opt(parse_limit)(input)?;
    Ok((input, Command::Category { category, limit: limit.unwrap_or(DEFAULT_LIST_LIMIT) }))
}

fn parse_summary(input: &str) -> IResult<&str, Command> {
    let (input, _) = tag_ci("SUMMARY")(input)?;
    let (input, user_id) = opt(preceded(multispace1, parse_value))(input)?;
    Ok((input, Command::Summary { user_id }))
}

fn parse_keyword_command(input: &str) -> IResult<&str, Command> {
    alt((
        map(tag_ci("USERS"), |_| Command::Users),
        map(tag_ci("CATEGORIES"), |_| Command::Categories),
        map(tag_ci("STATS"), |_| Command::Stats),
        map(tag_ci("REBUILD"), |_| Command::Rebuild),
        map(tag_ci("SAVE"), |_| Command::Save),
        map(tag_ci("HELP"), |_| Command::Help),
        map(alt((tag_ci("EXIT"), tag_ci("QUIT"))), |_| Command::Exit),
    ))(input)
}

pub fn parse_command(input: &str) -> Result<Command, ParseError> {
    let input = input.trim();
    finish(alt((
        parse_search,
        parse_get,
        parse_user,
        parse_category,
        parse_summary,
        parse_keyword_command,
    ))(input))
}

fn finish<T>(result: IResult<&str, T>) -> Result<T, ParseError> {
    match result {
        Ok((remainder, value)) => {
            if !remainder.trim().is_empty() {
                return Err(ParseError::Trailing(remainder.trim().to_string()));
            }
            Ok(value)
        }
        Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => {
            // e.input is the slice where parsing failed
            let context = match e.input.char_indices().nth(20) {
                Some((cut, _)) => format!("{}...", &e.input[..cut]),
                None => e.input.to_string(),
            };
            Err(ParseError::Syntax(context))
        }
        Err(nom::Err::Incomplete(_)) => Err(ParseError::Incomplete),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn filter_with_every_operator() {
        let clauses = parse_filter(
            "amount >= 10000 AND category='Food & Dining' AND user_id IN ('USER001', USER002) AND date BETWEEN 2024-01-01 and 2024-03-31",
        )
        .unwrap();
        assert_eq!(
            clauses,
            vec![
                RawClause::new("amount", RawOp::Ge("10000".into())),
                RawClause::new("category", RawOp::Eq("Food & Dining".into())),
                RawClause::new("user_id", RawOp::In(vec!["USER001".into(), "USER002".into()])),
                RawClause::new("date", RawOp::Between("2024-01-01".into(), "2024-03-31".into())),
            ]
        );
    }

    #[test]
    fn strict_comparisons() {
        assert_eq!(
            parse_filter("amount<5").unwrap(),
            vec![RawClause::new("amount", RawOp::Lt("5".into()))]
        );
        assert_eq!(
            parse_filter("amount > -20.5").unwrap(),
            vec![RawClause::new("amount", RawOp::Gt("-20.5".into()))]
        );
    }

    #[test]
    fn filter_errors() {
        assert!(matches!(parse_filter("amount >= 5 AND"), Err(ParseError::Trailing(_))));
        assert!(matches!(parse_filter(">= 5"), Err(ParseError::Syntax(_))));
        assert!(matches!(parse_filter("amount >>= 5"), Err(ParseError::Syntax(_))));
        assert!(matches!(parse_filter("user_id IN ()"), Err(ParseError::Syntax(_))));
    }

    #[test]
    fn search_command_with_filter_and_limit() {
        let cmd = parse_command("search \"coffee shop\" WHERE amount <= 500 AND user_id = 'USER001' LIMIT 3").unwrap();
        assert_eq!(
            cmd,
            Command::Search {
                query: "coffee shop".into(),
                filter: vec![
                    RawClause::new("amount", RawOp::Le("500".into())),
                    RawClause::new("user_id", RawOp::Eq("USER001".into())),
                ],
                limit: Some(3),
            }
        );

        assert_eq!(
            parse_command("FIND 'rent'").unwrap(),
            Command::Search { query: "rent".into(), filter: vec![], limit: None }
        );
    }

    #[test]
    fn browse_commands() {
        assert_eq!(parse_command("GET TXN000042").unwrap(), Command::Get { id: TxnId(42) });
        assert_eq!(parse_command("get 7").unwrap(), Command::Get { id: TxnId(7) });
        assert_eq!(
            parse_command("USER 'USER001' LIMIT 5").unwrap(),
            Command::User { user_id: "USER001".into(), limit: 5 }
        );
        assert_eq!(
            parse_command("category 'Bills & Utilities'").unwrap(),
            Command::Category { category: "Bills & Utilities".into(), limit: DEFAULT_LIST_LIMIT }
        );
        assert_eq!(parse_command("users").unwrap(), Command::Users);
        assert_eq!(parse_command("CATEGORIES").unwrap(), Command::Categories);
        assert_eq!(parse_command(" quit ").unwrap(), Command::Exit);
    }

    #[test]
    fn summary_with_and_without_user() {
        assert_eq!(parse_command("SUMMARY").unwrap(), Command::Summary { user_id: None });
        assert_eq!(
            parse_command("summary 'USER003'").unwrap(),
            Command::Summary { user_id: Some("USER003".into()) }
        );
        assert!(matches!(parse_command("SUMMARY 'a' 'b'"), Err(ParseError::Trailing(_))));
    }

    #[test]
    fn command_errors() {
        assert!(matches!(parse_command("SEARCH coffee"), Err(ParseError::Syntax(_))));
        assert!(matches!(parse_command("STATS now"), Err(ParseError::Trailing(_))));
        assert!(matches!(parse_command("GET nope"), Err(ParseError::Syntax(_))));
    }
}
