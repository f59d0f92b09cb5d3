#[allow(unused_imports)] // used by the tests
use ndarray::array;
use {
    super::{messages::*, version::GrblVersion},
    ndarray::Array1,
    nom::{
        self,
        branch::alt,
        bytes::complete::{tag, tag_no_case, take, take_until, take_while, take_while1},
        character::complete::{char as one_char, space0},
        combinator::{all_consuming, eof, flat_map, map_res, opt, rest, success, verify},
        error::{FromExternalError, ParseError},
        multi::{many0_count, separated_list0},
        sequence::{delimited, preceded, separated_pair, terminated, tuple},
        FindSubstring, IResult, InputLength, InputTake, Parser,
    },
    std::num::{ParseFloatError, ParseIntError},
};

pub fn take_until_or_all<T, Input, Error: ParseError<Input>>(
    tag: T,
) -> impl Fn(Input) -> IResult<Input, Input, Error>
where
    Input: InputTake + InputLength + FindSubstring<T>,
    T: InputLength + Clone,
{
    move |input| {
        let size = match input.find_substring(tag.clone()) {
            Some(offset) => offset,
            None => input.input_len(),
        };
        let (suffix, prefix) = input.take_split(size);
        Ok((suffix, prefix))
    }
}
fn split_by<'a, Error: 'a + ParseError<&'a str>>(
    separator: &'a str,
) -> impl 'a + FnMut(&'a str) -> IResult<&'a str, Vec<&'a str>, Error> {
    separated_list0(
        tag(separator),
        verify(take_until_or_all(separator), |part: &str| !part.is_empty()),
    )
}
fn take_until_through<'a, Error: 'a + ParseError<&'a str>>(
    separator: &'a str,
) -> impl 'a + FnMut(&'a str) -> IResult<&'a str, &'a str, Error> {
    terminated(take_until(separator), tag(separator))
}
fn take_until_through_or_all<'a, Error: 'a + ParseError<&'a str>>(
    separator: &'a str,
) -> impl 'a + FnMut(&'a str) -> IResult<&'a str, &'a str, Error> {
    terminated(take_until_or_all(separator), tag(separator).or(success("")))
}
fn enclosed_by<'a, Error: 'a + ParseError<&'a str>>(
    open: &'a str,
    close: &'a str,
) -> impl 'a + FnMut(&'a str) -> IResult<&'a str, &'a str, Error> {
    delimited(tag(open), take_until(close), tag(close))
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
fn parse_u64<'a, Error: 'a + ParseError<&'a str>>(input: &'a str) -> IResult<&'a str, u64, Error>
where
    Error: FromExternalError<&'a str, ParseIntError>,
{
    map_res(take_while(|c: char| c.is_ascii_digit()), |substr: &str| {
        substr.parse::<u64>()
    })
    .parse(input)
}
fn parse_u16<'a, Error: 'a + ParseError<&'a str>>(input: &'a str) -> IResult<&'a str, u16, Error>
where
    Error: FromExternalError<&'a str, ParseIntError>,
{
    map_res(take_while(|c: char| c.is_ascii_digit()), |substr: &str| {
        substr.parse::<u16>()
    })
    .parse(input)
}
fn parse_triplet<'a, Error: 'a + ParseError<&'a str>>(
    input: &'a str,
) -> IResult<&'a str, Array1<f64>, Error>
where
    Error: FromExternalError<&'a str, ParseFloatError>,
{
    // Boards with more than three axes append further components; only XYZ are kept.
    terminated(
        tuple((parse_f64, tag(","), parse_f64, tag(","), parse_f64)),
        many0_count(preceded(tag(","), parse_f64)),
    )
    .map(|(x, _, y, _, z)| Array1::from(vec![x, y, z]))
    .parse(input)
}

// Status name with any ":n" substate dropped.
fn parse_state_name<'a, Error: 'a + ParseError<&'a str>>(
    input: &'a str,
) -> IResult<&'a str, String, Error> {
    all_consuming(take_until_or_all(":").and(rest))
        .map(|(name, _substate): (&str, &str)| name.to_string())
        .parse(input)
}

fn parse_pipe_field<'a, Error: 'a + ParseError<&'a str>>(
    input: &'a str,
) -> IResult<&'a str, Option<StatusField>, Error>
where
    Error: FromExternalError<&'a str, ParseFloatError>,
    Error: FromExternalError<&'a str, ParseIntError>,
{
    let named = flat_map(
        take_until_through(":"),
        |head| -> Box<dyn Parser<&'a str, Option<StatusField>, Error>> {
            match head {
                "Ov" => Box::new(
                    tuple((parse_u16, tag(","), parse_u16, tag(","), parse_u16)).map(
                        |(feed, _, rapid, _, spindle)| {
                            Some(StatusField::Overrides {
                                feed,
                                rapid,
                                spindle,
                            })
                        },
                    ),
                ),
                "Bf" => Box::new(
                    separated_pair(parse_u64, tag(","), parse_u64)
                        .map(|(blocks, bytes)| Some(StatusField::Buffer { blocks, bytes })),
                ),
                "WPos" => Box::new(parse_triplet.map(|p| Some(StatusField::WorkPosition(p)))),
                "MPos" => Box::new(parse_triplet.map(|p| Some(StatusField::MachinePosition(p)))),
                "WCO" => {
                    Box::new(parse_triplet.map(|p| Some(StatusField::WorkCoordinateOffset(p))))
                }
                "FS" => Box::new(
                    separated_pair(parse_f64, tag(","), parse_f64)
                        .map(|(feed, speed)| Some(StatusField::FeedSpindle(feed, speed))),
                ),
                "F" => Box::new(parse_f64.map(|feed| Some(StatusField::Feed(feed)))),
                _ => Box::new(rest.map(|_| None)),
            }
        },
    );
    // A field without a "name:" head carries nothing we use. A known field that
    // fails to parse fails the whole report.
    let headless = verify(rest, |field: &str| !field.contains(':')).map(|_| None);
    alt((named, headless)).parse(input)
}

/*
    Grbl 1.1: "Idle|MPos:0.000,0.000,0.000|FS:0,0|Ov:100,100,100". Fields after the
state are order independent.
*/
fn parse_pipe_status<'a, Error: 'a + ParseError<&'a str>>(
    input: &'a str,
) -> IResult<&'a str, StatusReport, Error>
where
    Error: FromExternalError<&'a str, ParseFloatError>,
    Error: FromExternalError<&'a str, ParseIntError>,
{
    let (input, state) = take_until_through_or_all("|")
        .and_then(parse_state_name)
        .parse(input)?;
    let (input, parts) = split_by("|").parse(input)?;
    let mut fields = Vec::with_capacity(parts.len());
    for part in parts {
        let (_, field) = all_consuming(parse_pipe_field).parse(part)?;
        fields.extend(field);
    }
    Ok((input, StatusReport { state, fields }))
}

/*
    Grbl 0.9: "Idle,MPos:0.000,0.000,0.000,WPos:0.000,0.000,0.000" and possibly more
after that. Strictly positional; the offset is whatever separates the two positions.
*/
fn parse_comma_status<'a, Error: 'a + ParseError<&'a str>>(
    input: &'a str,
) -> IResult<&'a str, StatusReport, Error>
where
    Error: FromExternalError<&'a str, ParseFloatError>,
{
    let (input, state) = take_until_through_or_all(",")
        .and_then(parse_state_name)
        .parse(input)?;
    let (input, machine) = opt(preceded(tag("MPos:"), parse_triplet)).parse(input)?;
    let (input, work) = match machine {
        Some(_) => opt(preceded(tag(",WPos:"), parse_triplet)).parse(input)?,
        None => (input, None),
    };
    let mut fields = Vec::new();
    if let Some(machine) = machine {
        if let Some(work) = work {
            fields.push(StatusField::WorkCoordinateOffset(&machine - &work));
        }
        fields.push(StatusField::MachinePosition(machine));
    }
    Ok((input, StatusReport { state, fields }))
}

// `report` is the text between the angle brackets.
pub fn parse_status_report(report: &str, version: Option<GrblVersion>) -> Option<StatusReport> {
    let version = version.unwrap_or_else(|| GrblVersion::guess_from_status(report));
    let result = if version >= GrblVersion::V1_1 {
        parse_pipe_status::<()>(report)
    } else {
        parse_comma_status::<()>(report)
    };
    result.ok().map(|(_, report)| report)
}

fn parse_response<'a, Error: 'a + ParseError<&'a str>>(
    input: &'a str,
) -> IResult<&'a str, CommandResponse, Error>
where
    Error: FromExternalError<&'a str, ParseIntError>,
{
    tag_no_case("ok")
        .map(|_| CommandResponse::Ok)
        .or(preceded(
            tag_no_case("error"),
            opt(preceded(tuple((one_char(':'), space0)), parse_u64)),
        )
        .map(CommandResponse::Error))
        .parse(input)
}

/*
    "Grbl 1.1h ['$' for help]", some forks write "Grbl v1.1f". The build letter is
optional.
*/
fn parse_banner<'a, Error: 'a + ParseError<&'a str>>(
    input: &'a str,
) -> IResult<&'a str, GrblVersion, Error>
where
    Error: FromExternalError<&'a str, ParseIntError>,
{
    let digits = || {
        map_res(take_while1(|c: char| c.is_ascii_digit()), |s: &str| {
            s.parse::<u8>()
        })
    };
    let build = opt(verify(take(1usize), |s: &str| {
        s.chars().all(|c| c.is_ascii_alphabetic())
    }))
    .map(|s: Option<&str>| s.and_then(|s| s.chars().next()));
    preceded(
        tuple((tag("Grbl "), opt(tag_no_case("v")))),
        tuple((digits(), one_char('.'), digits(), build)),
    )
    .map(|(major, _, minor, build)| GrblVersion::new(major, minor, build))
    .parse(input)
}

// Classification by prefix, first match wins.
pub fn parse_grbl_line(line: &str) -> GrblMessage {
    let line = line.trim();
    let lower = line.to_ascii_lowercase();
    if lower.starts_with("ok") || lower.starts_with("error") {
        let response = parse_response::<()>(line)
            .map(|(_, response)| response)
            .unwrap_or(CommandResponse::Error(None));
        GrblMessage::Response(response)
    } else if let Ok((_, inner)) = all_consuming(enclosed_by::<()>("<", ">")).parse(line) {
        GrblMessage::Status(inner.to_string())
    } else if line.starts_with("Grbl ") {
        GrblMessage::Banner(parse_banner::<()>(line).ok().map(|(_, version)| version))
    } else {
        GrblMessage::Unrecognized(line.to_string())
    }
}

// "$110=4000.000 (x max rate, mm/min)" -> (110, 4000.0)
pub fn parse_setting_line(line: &str) -> Option<(u32, f64)> {
    let result: IResult<&str, (u32, f64), ()> = tuple((
        preceded(
            tag("$"),
            map_res(take_while1(|c: char| c.is_ascii_digit()), |s: &str| {
                s.parse::<u32>()
            }),
        ),
        preceded(tag("="), parse_f64),
    ))
    .and(eof.or(preceded(one_char(' '), rest)))
    .map(|(pair, _)| pair)
    .parse(line.trim());
    result.ok().map(|(_, pair)| pair)
}
