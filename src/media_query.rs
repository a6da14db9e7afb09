//! CSS media query parsing and evaluation
//!
//! Supports the subset of Media Queries Level 4 that responsive image source
//! sets rely on: comma separated query lists, `not`/`only`, the `all`,
//! `screen` and `print` media types (other types parse but never match),
//! viewport size features (including the
//! level 4 range syntax), orientation, aspect ratio, resolution, and the
//! `hover`/`pointer` interaction features.
//!
//! ```
//! use rfimage::media_query::{MediaContext, MediaQueryList};
//!
//! let ctx = MediaContext::screen(1024.0, 768.0);
//! let list = MediaQueryList::parse("(min-width: 992px) and (max-width: 1199px)").unwrap();
//! assert!(ctx.evaluate_list(&list));
//! ```

use crate::platform::DeviceMetrics;
use thiserror::Error;

/// Base font size used to resolve `em`/`rem` lengths inside queries
const BASE_FONT_SIZE_PX: f32 = 16.0;

/// Errors produced while parsing a media query
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MediaParseError {
    #[error("empty media query")]
    EmptyQuery,
    #[error("unknown media type '{0}'")]
    InvalidMediaType(String),
    #[error("unknown media feature '{0}'")]
    UnknownFeature(String),
    #[error("media feature '{0}' requires a value")]
    MissingValue(String),
    #[error("invalid value '{value}' for media feature '{feature}'")]
    InvalidValue { feature: String, value: String },
    #[error("expected '(' at offset {0}")]
    ExpectedOpenParen(usize),
    #[error("expected ')' at offset {0}")]
    ExpectedCloseParen(usize),
    #[error("unexpected input '{0}'")]
    UnexpectedToken(String),
}

/// Media type of a query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaType {
    All,
    Screen,
    Print,
    /// Any other identifier (`tv`, `speech`, ...); matches no device
    Unknown,
}

impl MediaType {
    pub fn parse(s: &str) -> Result<Self, MediaParseError> {
        match s.to_ascii_lowercase().as_str() {
            "all" => Ok(MediaType::All),
            "screen" => Ok(MediaType::Screen),
            "print" => Ok(MediaType::Print),
            // reserved keywords are not media types
            other @ ("and" | "or" | "not" | "only" | "layer") => {
                Err(MediaParseError::InvalidMediaType(other.to_string()))
            }
            _ => Ok(MediaType::Unknown),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaModifier {
    Not,
    Only,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComparisonOp {
    LessThan,
    LessThanEqual,
    GreaterThan,
    GreaterThanEqual,
    Equal,
}

impl ComparisonOp {
    /// The operator seen from the other side (`600px < width` == `width > 600px`)
    fn flipped(self) -> Self {
        match self {
            ComparisonOp::LessThan => ComparisonOp::GreaterThan,
            ComparisonOp::LessThanEqual => ComparisonOp::GreaterThanEqual,
            ComparisonOp::GreaterThan => ComparisonOp::LessThan,
            ComparisonOp::GreaterThanEqual => ComparisonOp::LessThanEqual,
            ComparisonOp::Equal => ComparisonOp::Equal,
        }
    }

    fn compare(self, actual: f32, target: f32, tolerance: f32) -> bool {
        match self {
            ComparisonOp::LessThan => actual < target,
            ComparisonOp::LessThanEqual => actual <= target,
            ComparisonOp::GreaterThan => actual > target,
            ComparisonOp::GreaterThanEqual => actual >= target,
            ComparisonOp::Equal => (actual - target).abs() < tolerance,
        }
    }
}

/// Numeric media dimension a comparison targets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeFeature {
    /// Viewport width in CSS px
    Width,
    /// Viewport height in CSS px
    Height,
    /// width / height
    AspectRatio,
    /// Device pixel ratio in dppx
    Resolution,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Orientation {
    Portrait,
    Landscape,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerCapability {
    None,
    Coarse,
    Fine,
}

/// A single parenthesized condition
///
/// `min-width`/`max-width` style features are normalized into `Range`
/// comparisons with lengths already resolved to px.
#[derive(Debug, Clone, PartialEq)]
pub enum MediaFeature {
    Range {
        feature: RangeFeature,
        op: ComparisonOp,
        value: f32,
    },
    /// Boolean context, e.g. `(width)`: true when the dimension is non-zero
    Present(RangeFeature),
    Orientation(Orientation),
    /// `(hover: hover)` is `Hover(true)`, `(hover: none)` is `Hover(false)`
    Hover(bool),
    Pointer(PointerCapability),
}

/// One query of a comma separated list
#[derive(Debug, Clone, PartialEq)]
pub struct MediaQuery {
    pub modifier: Option<MediaModifier>,
    pub media_type: Option<MediaType>,
    /// All features must match (AND)
    pub features: Vec<MediaFeature>,
}

impl MediaQuery {
    /// `not all`, the stand-in for a list member that failed to parse
    pub fn never() -> Self {
        Self {
            modifier: Some(MediaModifier::Not),
            media_type: Some(MediaType::All),
            features: Vec::new(),
        }
    }

    pub fn parse(input: &str) -> Result<Self, MediaParseError> {
        let mut parser = Parser::new(input);
        let query = parser.parse_query()?;
        parser.skip_whitespace();
        if !parser.is_eof() {
            return Err(MediaParseError::UnexpectedToken(parser.rest().to_string()));
        }
        Ok(query)
    }
}

/// Comma separated list of queries; matches when ANY query matches
#[derive(Debug, Clone, PartialEq)]
pub struct MediaQueryList {
    pub queries: Vec<MediaQuery>,
}

impl MediaQueryList {
    /// Parse a comma separated list. A member that fails to parse becomes
    /// [`MediaQuery::never`] and the others still apply; only blank input is
    /// an error.
    pub fn parse(input: &str) -> Result<Self, MediaParseError> {
        Self::parse_members(input).map(|(list, _)| list)
    }

    /// Like [`MediaQueryList::parse`], also returning why members were dropped
    pub fn parse_members(input: &str) -> Result<(Self, Vec<MediaParseError>), MediaParseError> {
        if input.trim().is_empty() {
            return Err(MediaParseError::EmptyQuery);
        }
        let mut errors = Vec::new();
        let queries = split_members(input)
            .into_iter()
            .map(|member| {
                MediaQuery::parse(member).unwrap_or_else(|e| {
                    errors.push(e);
                    MediaQuery::never()
                })
            })
            .collect();
        Ok((Self { queries }, errors))
    }

    /// True when every member failed to parse
    pub fn is_never(&self) -> bool {
        self.queries.iter().all(|q| *q == MediaQuery::never())
    }
}

/// Split at commas outside parentheses
fn split_members(input: &str) -> Vec<&str> {
    let mut members = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in input.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                members.push(&input[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    members.push(&input[start..]);
    members
}

/// Environment a query is evaluated against
#[derive(Debug, Clone, PartialEq)]
pub struct MediaContext {
    pub viewport_width: f32,
    pub viewport_height: f32,
    pub device_pixel_ratio: f32,
    pub media_type: MediaType,
    /// Touch-only devices cannot hover and have a coarse pointer
    pub touch: bool,
}

impl MediaContext {
    /// Desktop screen: dpr 1, fine pointer with hover
    pub fn screen(width: f32, height: f32) -> Self {
        Self {
            viewport_width: width,
            viewport_height: height,
            device_pixel_ratio: 1.0,
            media_type: MediaType::Screen,
            touch: false,
        }
    }

    pub fn evaluate_list(&self, list: &MediaQueryList) -> bool {
        list.queries.iter().any(|q| self.evaluate(q))
    }

    pub fn evaluate(&self, query: &MediaQuery) -> bool {
        let type_matches = match query.media_type {
            Some(MediaType::All) | None => true,
            Some(MediaType::Unknown) => false,
            Some(t) => t == self.media_type,
        };
        let matches = type_matches && query.features.iter().all(|f| self.evaluate_feature(f));
        match query.modifier {
            Some(MediaModifier::Not) => !matches,
            Some(MediaModifier::Only) | None => matches,
        }
    }

    fn dimension(&self, feature: RangeFeature) -> f32 {
        match feature {
            RangeFeature::Width => self.viewport_width,
            RangeFeature::Height => self.viewport_height,
            RangeFeature::AspectRatio => {
                if self.viewport_height > 0.0 {
                    self.viewport_width / self.viewport_height
                } else {
                    0.0
                }
            }
            RangeFeature::Resolution => self.device_pixel_ratio,
        }
    }

    fn evaluate_feature(&self, feature: &MediaFeature) -> bool {
        match feature {
            MediaFeature::Range { feature, op, value } => {
                let tolerance = match feature {
                    RangeFeature::Width | RangeFeature::Height => 0.5,
                    RangeFeature::AspectRatio => 0.01,
                    RangeFeature::Resolution => 0.1,
                };
                op.compare(self.dimension(*feature), *value, tolerance)
            }
            MediaFeature::Present(feature) => self.dimension(*feature) > 0.0,
            MediaFeature::Orientation(o) => {
                let portrait = self.viewport_height >= self.viewport_width;
                match o {
                    Orientation::Portrait => portrait,
                    Orientation::Landscape => !portrait,
                }
            }
            MediaFeature::Hover(hover) => *hover != self.touch,
            MediaFeature::Pointer(p) => match p {
                PointerCapability::None => false,
                PointerCapability::Coarse => self.touch,
                PointerCapability::Fine => !self.touch,
            },
        }
    }
}

impl From<&DeviceMetrics> for MediaContext {
    fn from(m: &DeviceMetrics) -> Self {
        Self {
            viewport_width: m.width as f32,
            viewport_height: m.height as f32,
            device_pixel_ratio: m.dpr,
            media_type: MediaType::Screen,
            touch: m.touch,
        }
    }
}

struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn rest(&self) -> &'a str {
        &self.input[self.pos..]
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn advance(&mut self) {
        if let Some(c) = self.peek() {
            self.pos += c.len_utf8();
        }
    }

    fn is_eof(&self) -> bool {
        self.pos >= self.input.len()
    }

    fn skip_whitespace(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.advance();
        }
    }

    fn peek_ident(&self) -> Option<&'a str> {
        let rest = self.rest();
        let end = rest
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '-' || c == '_'))
            .unwrap_or(rest.len());
        if end == 0 {
            None
        } else {
            Some(&rest[..end])
        }
    }

    fn take_ident(&mut self) -> Option<&'a str> {
        let ident = self.peek_ident()?;
        self.pos += ident.len();
        Some(ident)
    }

    fn parse_query(&mut self) -> Result<MediaQuery, MediaParseError> {
        self.skip_whitespace();
        let mut modifier = None;
        let mut media_type = None;
        let mut features = Vec::new();

        if let Some(ident) = self.peek_ident() {
            match ident.to_ascii_lowercase().as_str() {
                "not" => modifier = Some(MediaModifier::Not),
                "only" => modifier = Some(MediaModifier::Only),
                _ => {}
            }
            if modifier.is_some() {
                self.take_ident();
                self.skip_whitespace();
            }
        }

        if let Some(ident) = self.peek_ident() {
            media_type = Some(MediaType::parse(ident)?);
            self.take_ident();
        }

        loop {
            self.skip_whitespace();
            if media_type.is_some() || !features.is_empty() {
                match self.peek_ident() {
                    Some(ident) if ident.eq_ignore_ascii_case("and") => {
                        self.take_ident();
                        self.skip_whitespace();
                    }
                    _ => break,
                }
            }
            if self.peek() == Some('(') {
                features.extend(self.parse_feature()?);
            } else if media_type.is_some() || !features.is_empty() {
                // `and` must be followed by a feature
                return Err(MediaParseError::ExpectedOpenParen(self.pos));
            } else {
                break;
            }
        }

        if media_type.is_none() && features.is_empty() {
            return Err(MediaParseError::EmptyQuery);
        }

        Ok(MediaQuery {
            modifier,
            media_type,
            features,
        })
    }

    fn parse_feature(&mut self) -> Result<Vec<MediaFeature>, MediaParseError> {
        if self.peek() != Some('(') {
            return Err(MediaParseError::ExpectedOpenParen(self.pos));
        }
        self.advance();
        let close = self
            .rest()
            .find(')')
            .ok_or(MediaParseError::ExpectedCloseParen(self.input.len()))?;
        let inner = self.rest()[..close].trim();
        self.pos += close + 1;

        if inner.contains(&['<', '>', '='][..]) {
            return parse_range(inner);
        }

        match inner.split_once(':') {
            Some((name, value)) => parse_feature(name.trim(), Some(value.trim())).map(|f| vec![f]),
            None => parse_feature(inner, None).map(|f| vec![f]),
        }
    }
}

fn parse_feature(name: &str, value: Option<&str>) -> Result<MediaFeature, MediaParseError> {
    let name = name.to_ascii_lowercase();
    let (prefix, base) = match name.split_once('-') {
        Some((p @ ("min" | "max"), base)) => (Some(p), base.to_string()),
        _ => (None, name.clone()),
    };
    let op = match prefix {
        Some("min") => ComparisonOp::GreaterThanEqual,
        Some("max") => ComparisonOp::LessThanEqual,
        _ => ComparisonOp::Equal,
    };

    let range_feature = match base.as_str() {
        "width" => Some(RangeFeature::Width),
        "height" => Some(RangeFeature::Height),
        "aspect-ratio" => Some(RangeFeature::AspectRatio),
        "resolution" => Some(RangeFeature::Resolution),
        _ => None,
    };

    if let Some(feature) = range_feature {
        return match value {
            None if prefix.is_none() => Ok(MediaFeature::Present(feature)),
            None => Err(MediaParseError::MissingValue(name.clone())),
            Some(v) => Ok(MediaFeature::Range {
                feature,
                op,
                value: parse_value(feature, &name, v)?,
            }),
        };
    }

    if prefix.is_some() {
        return Err(MediaParseError::UnknownFeature(name.clone()));
    }

    let keyword = value.map(str::to_ascii_lowercase);
    match (name.as_str(), keyword.as_deref()) {
        ("orientation", Some("portrait")) => Ok(MediaFeature::Orientation(Orientation::Portrait)),
        ("orientation", Some("landscape")) => Ok(MediaFeature::Orientation(Orientation::Landscape)),
        ("hover" | "any-hover", Some("hover")) | ("hover" | "any-hover", None) => Ok(MediaFeature::Hover(true)),
        ("hover" | "any-hover", Some("none")) => Ok(MediaFeature::Hover(false)),
        ("pointer" | "any-pointer", Some("fine")) => Ok(MediaFeature::Pointer(PointerCapability::Fine)),
        ("pointer" | "any-pointer", Some("coarse")) => Ok(MediaFeature::Pointer(PointerCapability::Coarse)),
        ("pointer" | "any-pointer", Some("none")) => Ok(MediaFeature::Pointer(PointerCapability::None)),
        ("orientation" | "hover" | "any-hover" | "pointer" | "any-pointer", Some(v)) => Err(MediaParseError::InvalidValue {
            feature: name.clone(),
            value: v.to_string(),
        }),
        ("orientation" | "pointer" | "any-pointer", None) => Err(MediaParseError::MissingValue(name.clone())),
        _ => Err(MediaParseError::UnknownFeature(name.clone())),
    }
}

fn parse_value(feature: RangeFeature, name: &str, value: &str) -> Result<f32, MediaParseError> {
    let parsed = match feature {
        RangeFeature::Width | RangeFeature::Height => parse_length_px(value),
        RangeFeature::AspectRatio => parse_ratio(value),
        RangeFeature::Resolution => parse_resolution_dppx(value),
    };
    parsed.ok_or_else(|| MediaParseError::InvalidValue {
        feature: name.to_string(),
        value: value.to_string(),
    })
}

fn split_number(value: &str) -> Option<(f32, &str)> {
    let value = value.trim();
    let end = value
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '-' || c == '+'))
        .unwrap_or(value.len());
    let number = value[..end].parse::<f32>().ok()?;
    Some((number, value[end..].trim()))
}

fn parse_length_px(value: &str) -> Option<f32> {
    let (n, unit) = split_number(value)?;
    match unit.to_ascii_lowercase().as_str() {
        "px" => Some(n),
        "em" | "rem" => Some(n * BASE_FONT_SIZE_PX),
        "" if n == 0.0 => Some(0.0),
        _ => None,
    }
}

fn parse_ratio(value: &str) -> Option<f32> {
    match value.split_once('/') {
        Some((w, h)) => {
            let w = w.trim().parse::<f32>().ok()?;
            let h = h.trim().parse::<f32>().ok()?;
            (h > 0.0).then(|| w / h)
        }
        None => value.trim().parse::<f32>().ok(),
    }
}

fn parse_resolution_dppx(value: &str) -> Option<f32> {
    let (n, unit) = split_number(value)?;
    match unit.to_ascii_lowercase().as_str() {
        "dppx" | "x" => Some(n),
        "dpi" => Some(n / 96.0),
        "dpcm" => Some(n * 2.54 / 96.0),
        _ => None,
    }
}

/// Level 4 range syntax: `width >= 600px`, `600px < width`,
/// `400px <= width < 800px`
fn parse_range(inner: &str) -> Result<Vec<MediaFeature>, MediaParseError> {
    enum Token {
        Atom(String),
        Op(ComparisonOp),
    }

    let mut tokens = Vec::new();
    let mut buf = String::new();
    let mut chars = inner.chars().peekable();
    while let Some(c) = chars.next() {
        let op = match c {
            '<' | '>' => {
                let or_equal = chars.next_if_eq(&'=').is_some();
                match (c, or_equal) {
                    ('<', false) => ComparisonOp::LessThan,
                    ('<', true) => ComparisonOp::LessThanEqual,
                    ('>', false) => ComparisonOp::GreaterThan,
                    _ => ComparisonOp::GreaterThanEqual,
                }
            }
            '=' => ComparisonOp::Equal,
            _ => {
                buf.push(c);
                continue;
            }
        };
        if !buf.trim().is_empty() {
            tokens.push(Token::Atom(buf.trim().to_string()));
        }
        buf.clear();
        tokens.push(Token::Op(op));
    }
    if !buf.trim().is_empty() {
        tokens.push(Token::Atom(buf.trim().to_string()));
    }

    let feature_of = |s: &str| match s.to_ascii_lowercase().as_str() {
        "width" => Some(RangeFeature::Width),
        "height" => Some(RangeFeature::Height),
        "aspect-ratio" => Some(RangeFeature::AspectRatio),
        "resolution" => Some(RangeFeature::Resolution),
        _ => None,
    };
    let make = |feature: RangeFeature, op: ComparisonOp, raw: &str| {
        parse_value(feature, raw, raw).map(|value| MediaFeature::Range { feature, op, value })
    };
    let unexpected = || MediaParseError::UnexpectedToken(inner.to_string());

    match tokens.as_slice() {
        [Token::Atom(a), Token::Op(op), Token::Atom(b)] => {
            if let Some(feature) = feature_of(a) {
                Ok(vec![make(feature, *op, b)?])
            } else if let Some(feature) = feature_of(b) {
                Ok(vec![make(feature, op.flipped(), a)?])
            } else {
                Err(MediaParseError::UnknownFeature(a.clone()))
            }
        }
        [Token::Atom(low), Token::Op(op1), Token::Atom(name), Token::Op(op2), Token::Atom(high)] => {
            let feature = feature_of(name).ok_or_else(|| MediaParseError::UnknownFeature(name.clone()))?;
            Ok(vec![make(feature, op1.flipped(), low)?, make(feature, *op2, high)?])
        }
        _ => Err(unexpected()),
    }
}
