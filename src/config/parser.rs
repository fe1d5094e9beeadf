use nom::{
    IResult, Parser,
    branch::alt,
    bytes::complete::take_till1,
    character::complete::{char, digit1, multispace0, space1},
    combinator::{eof, map_res, value},
    multi::many0,
    sequence::{delimited, separated_pair, terminated},
};

use crate::config::PeerRow;
use crate::config::errors::ConfigError;

/// A single whitespace-delimited token.
fn word(input: &str) -> IResult<&str, &str> {
    take_till1(|c: char| c.is_whitespace())(input)
}

/// One `Key Value` line of Common.cfg.
fn key_value(input: &str) -> IResult<&str, (&str, &str)> {
    separated_pair(word, space1, word).parse(input)
}

fn has_file_flag(input: &str) -> IResult<&str, bool> {
    alt((value(true, char('1')), value(false, char('0')))).parse(input)
}

/// One `<id> <host> <port> <hasFile>` row of PeerInfo.cfg.
fn peer_row(input: &str) -> IResult<&str, PeerRow> {
    let (inp, id) = map_res(digit1, str::parse::<u32>).parse(input)?;
    let (inp, _) = space1(inp)?;
    let (inp, host) = word(inp)?;
    let (inp, _) = space1(inp)?;
    let (inp, port) = map_res(digit1, str::parse::<u16>).parse(inp)?;
    let (inp, _) = space1(inp)?;
    let (inp, has_file) = has_file_flag(inp)?;

    Ok((
        inp,
        PeerRow {
            id,
            host: host.to_string(),
            port,
            has_file,
        },
    ))
}

/// Parses the full text of Common.cfg into key/value pairs. Unknown keys are
/// kept; the caller decides what to do with them.
pub fn parse_common(source: &str) -> Result<Vec<(&str, &str)>, ConfigError> {
    terminated(many0(delimited(multispace0, key_value, multispace0)), eof)
        .parse(source)
        .map(|(_, entries)| entries)
        .map_err(|e| ConfigError::Parse {
            file: "Common.cfg",
            reason: format!("{e:?}"),
        })
}

/// Parses the full text of PeerInfo.cfg.
pub fn parse_peer_rows(source: &str) -> Result<Vec<PeerRow>, ConfigError> {
    terminated(many0(delimited(multispace0, peer_row, multispace0)), eof)
        .parse(source)
        .map(|(_, rows)| rows)
        .map_err(|e| ConfigError::Parse {
            file: "PeerInfo.cfg",
            reason: format!("{e:?}"),
        })
}
