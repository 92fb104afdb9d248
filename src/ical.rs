//! A minimal iCalendar content-line model.
//!
//! Only what the work queue needs is modelled: the flat sequence of content lines
//! (components are represented by their `BEGIN`/`END` lines), property parameters, and
//! lookups of `UID`, `ORGANIZER` and `ATTENDEE`. Values are kept verbatim so that
//! serializing an unchanged calendar reproduces its properties exactly.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

const FOLD_WIDTH: usize = 75;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
  #[error("data is not a VCALENDAR object")]
  NotCalendar,
  #[error("malformed content line {line}: {content:?}")]
  MalformedLine { line: usize, content: String },
  #[error("required property {0} is missing")]
  MissingProperty(&'static str),
}

/// One content line: `NAME;PARAM=VALUE:value`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Property {
  name: String,
  params: Vec<(String, String)>,
  value: String,
}

impl Property {
  pub fn new(name: &str, value: impl Into<String>) -> Self {
    Self {
      name: name.to_ascii_uppercase(),
      params: Vec::new(),
      value: value.into(),
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn value(&self) -> &str {
    &self.value
  }

  /// Case-insensitive parameter lookup.
  pub fn parameter(&self, name: &str) -> Option<&str> {
    self
      .params
      .iter()
      .find(|(key, _)| key.eq_ignore_ascii_case(name))
      .map(|(_, value)| value.as_str())
  }

  /// Sets a parameter, replacing an existing one of the same name in place.
  /// Returns `true` if the stored value changed.
  pub fn set_parameter(&mut self, name: &str, value: &str) -> bool {
    match self.params.iter_mut().find(|(key, _)| key.eq_ignore_ascii_case(name)) {
      Some((_, existing)) if existing == value => false,
      Some((_, existing)) => {
        *existing = value.to_string();
        true
      }
      None => {
        self.params.push((name.to_ascii_uppercase(), value.to_string()));
        true
      }
    }
  }

  fn parse(line: &str) -> Option<Self> {
    let mut in_quotes = false;
    let mut segments = Vec::new();
    let mut segment_start = 0;
    let mut value_start = None;

    for (index, ch) in line.char_indices() {
      match ch {
        '"' => in_quotes = !in_quotes,
        ';' if !in_quotes => {
          segments.push(&line[segment_start..index]);
          segment_start = index + 1;
        }
        ':' if !in_quotes => {
          segments.push(&line[segment_start..index]);
          value_start = Some(index + 1);
          break;
        }
        _ => {}
      }
    }

    let value_start = value_start?;
    let mut segments = segments.into_iter();
    let name = segments.next()?.trim();
    if name.is_empty() {
      return None;
    }

    let mut params = Vec::new();
    for segment in segments {
      let (key, value) = segment.split_once('=')?;
      params.push((key.trim().to_ascii_uppercase(), unquote(value).to_string()));
    }

    Some(Self {
      name: name.to_ascii_uppercase(),
      params,
      value: line[value_start..].to_string(),
    })
  }

  fn write_folded(&self, out: &mut String) {
    let mut line = self.name.clone();
    for (key, value) in &self.params {
      line.push(';');
      line.push_str(key);
      line.push('=');
      if value.contains(|c| matches!(c, ':' | ';' | ',')) {
        line.push('"');
        line.push_str(value);
        line.push('"');
      } else {
        line.push_str(value);
      }
    }
    line.push(':');
    line.push_str(&self.value);

    // Continuation lines start with a space, which counts against the width.
    let mut width = 0;
    for ch in line.chars() {
      let len = ch.len_utf8();
      if width + len > FOLD_WIDTH {
        out.push_str("\r\n ");
        width = 1;
      }
      out.push(ch);
      width += len;
    }
    out.push_str("\r\n");
  }
}

fn unquote(value: &str) -> &str {
  let value = value.trim();
  value
    .strip_prefix('"')
    .and_then(|v| v.strip_suffix('"'))
    .unwrap_or(value)
}

/// A parsed `VCALENDAR` object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Calendar {
  properties: Vec<Property>,
}

impl Calendar {
  pub fn parse(text: &str) -> Result<Self, ParseError> {
    let mut properties = Vec::new();
    for (index, line) in unfold(text).into_iter().enumerate() {
      if line.trim().is_empty() {
        continue;
      }
      let property = Property::parse(&line).ok_or_else(|| ParseError::MalformedLine {
        line: index + 1,
        content: line.clone(),
      })?;
      properties.push(property);
    }

    let is_calendar = |p: Option<&Property>, marker: &str| {
      p.is_some_and(|p| p.name == marker && p.value.eq_ignore_ascii_case("VCALENDAR"))
    };
    if !is_calendar(properties.first(), "BEGIN") || !is_calendar(properties.last(), "END") {
      return Err(ParseError::NotCalendar);
    }

    Ok(Self { properties })
  }

  pub fn properties(&self) -> &[Property] {
    &self.properties
  }

  pub fn properties_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Property> + 'a {
    self
      .properties
      .iter()
      .filter(move |p| p.name.eq_ignore_ascii_case(name))
  }

  pub fn properties_named_mut<'a>(
    &'a mut self,
    name: &'a str,
  ) -> impl Iterator<Item = &'a mut Property> + 'a {
    self
      .properties
      .iter_mut()
      .filter(move |p| p.name.eq_ignore_ascii_case(name))
  }

  /// The iCalendar UID shared by every component of the resource.
  pub fn uid(&self) -> Option<&str> {
    self.properties_named("UID").next().map(Property::value)
  }

  /// The organizer calendar user address, if the data carries one.
  pub fn organizer(&self) -> Option<&str> {
    self.properties_named("ORGANIZER").next().map(Property::value)
  }

  /// Distinct attendee addresses in order of first appearance.
  pub fn attendees(&self) -> Vec<&str> {
    let mut attendees: Vec<&str> = Vec::new();
    for property in self.properties_named("ATTENDEE") {
      if !attendees.contains(&property.value()) {
        attendees.push(property.value());
      }
    }
    attendees
  }
}

impl FromStr for Calendar {
  type Err = ParseError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Self::parse(s)
  }
}

impl fmt::Display for Calendar {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let mut out = String::new();
    for property in &self.properties {
      property.write_folded(&mut out);
    }
    f.write_str(&out)
  }
}

fn unfold(text: &str) -> Vec<String> {
  let mut lines: Vec<String> = Vec::new();
  for raw in text.split('\n') {
    let raw = raw.strip_suffix('\r').unwrap_or(raw);
    if raw.starts_with(' ') || raw.starts_with('\t') {
      if let Some(last) = lines.last_mut() {
        last.push_str(&raw[1..]);
        continue;
      }
    }
    lines.push(raw.to_string());
  }
  lines
}
