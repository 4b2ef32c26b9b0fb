//! Nested numeric list literals as stored in the metadata database.
//!
//! Lists are written the way the acquisition software writes them
//! (`[[0.5, 0.5], [0.6, 0.6]]`). Parsing accepts only digits, `.`, `,`,
//! `[`, `]`, `-` and spaces; anything else is rejected before parsing.

use crate::types::{RoiBox, RoiSet, SnowError, SnowResult};

/// Parsed list literal
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Int(i64),
    Float(f64),
    List(Vec<Literal>),
}

impl Literal {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Literal::Int(v) => Some(*v as f64),
            Literal::Float(v) => Some(*v),
            Literal::List(_) => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Literal]> {
        match self {
            Literal::List(items) => Some(items),
            _ => None,
        }
    }
}

const ALLOWED: &str = "0123456789.,[]-";

/// Strip spaces and reject any character outside the literal alphabet
pub fn clean_literal(input: &str) -> SnowResult<String> {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        if c == ' ' {
            continue;
        }
        if !ALLOWED.contains(c) {
            return Err(SnowError::Parse(format!(
                "Invalid character {:?} in list literal {:?}",
                c, input
            )));
        }
        out.push(c);
    }
    Ok(out)
}

pub fn parse_literal(input: &str) -> SnowResult<Literal> {
    let cleaned = clean_literal(input)?;
    let mut parser = Parser {
        bytes: cleaned.as_bytes(),
        pos: 0,
        source: input,
    };
    let value = parser.value()?;
    if parser.pos != parser.bytes.len() {
        return Err(parser.error("trailing characters"));
    }
    Ok(value)
}

struct Parser<'a> {
    bytes: &'a [u8],
    pos: usize,
    source: &'a str,
}

impl<'a> Parser<'a> {
    fn error(&self, what: &str) -> SnowError {
        SnowError::Parse(format!(
            "Malformed list literal {:?}: {} at offset {}",
            self.source, what, self.pos
        ))
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn value(&mut self) -> SnowResult<Literal> {
        match self.peek() {
            Some(b'[') => self.list(),
            Some(_) => self.number(),
            None => Err(self.error("unexpected end")),
        }
    }

    fn list(&mut self) -> SnowResult<Literal> {
        self.pos += 1; // '['
        let mut items = Vec::new();
        if self.peek() == Some(b']') {
            self.pos += 1;
            return Ok(Literal::List(items));
        }
        loop {
            items.push(self.value()?);
            match self.peek() {
                Some(b',') => {
                    self.pos += 1;
                    // trailing comma
                    if self.peek() == Some(b']') {
                        self.pos += 1;
                        return Ok(Literal::List(items));
                    }
                }
                Some(b']') => {
                    self.pos += 1;
                    return Ok(Literal::List(items));
                }
                _ => return Err(self.error("expected ',' or ']'")),
            }
        }
    }

    fn number(&mut self) -> SnowResult<Literal> {
        let start = self.pos;
        if self.peek() == Some(b'-') {
            self.pos += 1;
        }
        let mut digits = 0;
        let mut dots = 0;
        while let Some(c) = self.peek() {
            match c {
                b'0'..=b'9' => digits += 1,
                b'.' => dots += 1,
                _ => break,
            }
            self.pos += 1;
        }
        if digits == 0 || dots > 1 {
            return Err(self.error("invalid number"));
        }
        let token = std::str::from_utf8(&self.bytes[start..self.pos])
            .map_err(|_| self.error("invalid number"))?;
        if dots == 0 {
            token
                .parse::<i64>()
                .map(Literal::Int)
                .map_err(|_| self.error("integer out of range"))
        } else {
            token
                .parse::<f64>()
                .map(Literal::Float)
                .map_err(|_| self.error("invalid float"))
        }
    }
}

/// Render a float the way the database writer always has: shortest
/// round-trip digits, never an exponent, always a decimal point.
pub fn format_float(value: f64) -> String {
    let mut s = format!("{}", value);
    if value.is_finite() && !s.contains('.') {
        s.push_str(".0");
    }
    s
}

pub fn format_literal(value: &Literal) -> String {
    match value {
        Literal::Int(v) => v.to_string(),
        Literal::Float(v) => format_float(*v),
        Literal::List(items) => {
            let inner: Vec<String> = items.iter().map(format_literal).collect();
            format!("[{}]", inner.join(", "))
        }
    }
}

fn expect_numbers(items: &[Literal], source: &str) -> SnowResult<Vec<f64>> {
    items
        .iter()
        .map(|item| {
            item.as_f64().ok_or_else(|| {
                SnowError::Parse(format!("Expected a flat list of numbers in {:?}", source))
            })
        })
        .collect()
}

pub fn parse_float_list(input: &str) -> SnowResult<Vec<f64>> {
    match parse_literal(input)? {
        Literal::List(items) => expect_numbers(&items, input),
        _ => Err(SnowError::Parse(format!("Expected a list in {:?}", input))),
    }
}

pub fn parse_float_pair(input: &str) -> SnowResult<[f64; 2]> {
    let values = parse_float_list(input)?;
    match values.as_slice() {
        [a, b] => Ok([*a, *b]),
        _ => Err(SnowError::Parse(format!(
            "Expected two coordinates in {:?}, found {}",
            input,
            values.len()
        ))),
    }
}

pub fn parse_nested_float_list(input: &str) -> SnowResult<Vec<Vec<f64>>> {
    let literal = parse_literal(input)?;
    let outer = literal
        .as_list()
        .ok_or_else(|| SnowError::Parse(format!("Expected a list of lists in {:?}", input)))?;
    outer
        .iter()
        .map(|row| match row {
            Literal::List(items) => expect_numbers(items, input),
            _ => Err(SnowError::Parse(format!("Expected a list of lists in {:?}", input))),
        })
        .collect()
}

fn roi_box(literal: &Literal, source: &str) -> SnowResult<RoiBox> {
    let bad = || SnowError::Parse(format!("ROI boxes must be [[x0, y0], [x1, y1]] in {:?}", source));
    let corners = literal.as_list().ok_or_else(bad)?;
    if corners.len() != 2 {
        return Err(bad());
    }
    let mut points = [[0.0; 2]; 2];
    for (point, corner) in points.iter_mut().zip(corners) {
        let xy = expect_numbers(corner.as_list().ok_or_else(bad)?, source)?;
        if xy.len() != 2 {
            return Err(bad());
        }
        *point = [xy[0], xy[1]];
    }
    Ok(RoiBox::new(points[0][0], points[0][1], points[1][0], points[1][1]))
}

/// Parse `[gray_boxes, white_boxes]`
pub fn parse_roi(input: &str) -> SnowResult<RoiSet> {
    let literal = parse_literal(input)?;
    let groups = literal
        .as_list()
        .filter(|groups| groups.len() == 2)
        .ok_or_else(|| {
            SnowError::Parse(format!("ROI must hold a gray and a white list in {:?}", input))
        })?;
    let boxes = |group: &Literal| -> SnowResult<Vec<RoiBox>> {
        group
            .as_list()
            .ok_or_else(|| SnowError::Parse(format!("ROI group is not a list in {:?}", input)))?
            .iter()
            .map(|b| roi_box(b, input))
            .collect()
    };
    Ok(RoiSet {
        gray: boxes(&groups[0])?,
        white: boxes(&groups[1])?,
    })
}

fn float_list(values: &[f64]) -> Literal {
    Literal::List(values.iter().map(|v| Literal::Float(*v)).collect())
}

pub fn format_float_list(values: &[f64]) -> String {
    format_literal(&float_list(values))
}

pub fn format_nested_float_list(rows: &[Vec<f64>]) -> String {
    format_literal(&Literal::List(rows.iter().map(|r| float_list(r)).collect()))
}

pub fn format_roi(roi: &RoiSet) -> String {
    let group = |boxes: &[RoiBox]| {
        Literal::List(
            boxes
                .iter()
                .map(|b| Literal::List(vec![float_list(&[b.x0, b.y0]), float_list(&[b.x1, b.y1])]))
                .collect(),
        )
    };
    format_literal(&Literal::List(vec![group(&roi.gray), group(&roi.white)]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_nested() {
        let lit = parse_literal("[[1, 2.5], [], -3]").unwrap();
        assert_eq!(
            lit,
            Literal::List(vec![
                Literal::List(vec![Literal::Int(1), Literal::Float(2.5)]),
                Literal::List(vec![]),
                Literal::Int(-3),
            ])
        );
    }

    #[test]
    fn test_rejects_foreign_characters() {
        assert!(parse_literal("[1, 2e5]").is_err());
        assert!(parse_literal("__import__('os')").is_err());
        assert!(parse_literal("[1,\t2]").is_err());
    }

    #[test]
    fn test_rejects_malformed() {
        assert!(parse_literal("[1, 2").is_err());
        assert!(parse_literal("[1..2]").is_err());
        assert!(parse_literal("[-]").is_err());
        assert!(parse_literal("[1][2]").is_err());
    }

    #[test]
    fn test_format_float() {
        assert_eq!(format_float(1.0), "1.0");
        assert_eq!(format_float(0.07691), "0.07691");
        assert_eq!(format_float(-0.25), "-0.25");
        assert_eq!(format_float(1e-5), "0.00001");
    }

    #[test]
    fn test_roi_text_is_stable() {
        let text = format_roi(&RoiSet::default());
        assert!(text.starts_with("[[[[0.07691, 0.16448], [0.11837, 0.22293]]"));
        let parsed = parse_roi(&text).unwrap();
        assert_eq!(parsed, RoiSet::default());
        assert_eq!(format_roi(&parsed), text);
    }

    #[test]
    fn test_empty_nested_list() {
        assert_eq!(parse_nested_float_list("[[]]").unwrap(), vec![Vec::<f64>::new()]);
        assert_eq!(format_nested_float_list(&[Vec::new()]), "[[]]");
        assert_eq!(format_float_list(&[]), "[]");
    }

    #[test]
    fn test_pair() {
        assert_eq!(parse_float_pair("[0.5, 1]").unwrap(), [0.5, 1.0]);
        assert!(parse_float_pair("[0.5]").is_err());
    }
}
