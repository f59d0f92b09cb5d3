use {
    super::{GCode, Word},
    nom::{
        bytes::complete::{take_while, take_while1},
        character::complete::{char as one_char, satisfy, space0},
        combinator::{eof, map_res, opt},
        error::{FromExternalError, ParseError},
        multi::many0,
        sequence::{delimited, preceded, terminated, tuple},
        Finish, IResult, Parser,
    },
    std::num::{ParseFloatError, ParseIntError},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GCodeParseError {
    pub remaining: String,
}

// Drops "(...)" comments and everything after ';'.
pub fn strip_comments(line: &str) -> String {
    let mut result = String::with_capacity(line.len());
    let mut depth = 0usize;
    for c in line.chars() {
        match c {
            ';' if depth == 0 => break,
            '(' => depth += 1,
            ')' if depth > 0 => depth -= 1,
            _ if depth == 0 => result.push(c),
            _ => {}
        }
    }
    result
}

fn parse_f64<'a, Error: 'a + ParseError<&'a str>>(input: &'a str) -> IResult<&'a str, f64, Error>
where
    Error: FromExternalError<&'a str, ParseFloatError>,
{
    map_res(
        take_while(|c: char| c.is_ascii_digit() || c == '.' || c == '-' || c == '+'),
        |substr: &str| substr.parse::<f64>(),
    )
    .parse(input)
}
fn parse_code<'a, Error: 'a + ParseError<&'a str>>(input: &'a str) -> IResult<&'a str, GCode, Error>
where
    Error: FromExternalError<&'a str, ParseIntError>,
{
    tuple((
        map_res(take_while1(|c: char| c.is_ascii_digit()), |s: &str| {
            s.parse::<u16>()
        }),
        opt(preceded(
            one_char('.'),
            map_res(take_while1(|c: char| c.is_ascii_digit()), |s: &str| {
                s.parse::<u8>()
            }),
        )),
    ))
    .map(|(major, minor)| GCode::new(major, minor.unwrap_or(0)))
    .parse(input)
}
fn parse_word<'a, Error: 'a + ParseError<&'a str>>(input: &'a str) -> IResult<&'a str, Word, Error>
where
    Error: FromExternalError<&'a str, ParseFloatError>,
    Error: FromExternalError<&'a str, ParseIntError>,
{
    let (input, letter) =
        delimited(space0, satisfy(|c| c.is_ascii_alphabetic()), space0).parse(input)?;
    match letter.to_ascii_uppercase() {
        'G' => parse_code.map(Word::G).parse(input),
        'M' => parse_code.map(Word::M).parse(input),
        other => parse_f64.map(|value| Word::Value(other, value)).parse(input),
    }
}

/*
    Splits a program line into its words. System commands ("$H", "$J=...", "$$") carry
no G-code words and come back empty.
*/
pub fn parse_words(line: &str) -> Result<Vec<Word>, GCodeParseError> {
    let stripped = strip_comments(line);
    if stripped.trim_start().starts_with('$') {
        return Ok(Vec::new());
    }
    let result: Result<_, ()> = terminated(many0(parse_word), tuple((space0, eof)))
        .parse(stripped.as_str())
        .finish();
    match result {
        Ok((_, words)) => Ok(words),
        Err(()) => Err(GCodeParseError {
            remaining: stripped.trim().to_string(),
        }),
    }
}
