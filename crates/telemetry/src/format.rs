//! Serialization of entity values
//!
//! - [`NumericFormat`]: integer/scaled rendering shared by properties and notifications
//! - [`MessageTemplate`]: notification templates, validated when the notification is created
//! - [`StateBatch`]: size-bounded JSON object assembled from property members

use std::fmt::Write as _;

use crate::error::{Result, TelemetryError};

/// Cut `s` to at most `max_len` bytes without splitting a character
pub(crate) fn truncate_at_boundary(s: &mut String, max_len: usize) {
    if s.len() <= max_len {
        return;
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s.truncate(end);
}

// ─────────────────────────────────────────────────────────────────────────────
// Numeric Format
// ─────────────────────────────────────────────────────────────────────────────

/// How an integer value is rendered on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NumericFormat {
    /// Divider applied before rendering; 1 means plain integer
    pub scale: u16,
    /// Fraction digits, used only when `scale != 1`
    pub decimals: u8,
    /// Signed or unsigned interpretation of the raw value, used only when `scale == 1`
    pub signed: bool,
}

impl NumericFormat {
    pub fn new(scale: u16, decimals: u8, signed: bool) -> Result<Self> {
        if scale == 0 {
            return Err(TelemetryError::InvalidScale);
        }
        Ok(Self {
            scale,
            decimals,
            signed,
        })
    }

    /// Plain signed integer
    pub fn integer() -> Self {
        Self {
            scale: 1,
            decimals: 0,
            signed: true,
        }
    }

    pub fn render(&self, value: i32) -> String {
        let mut out = String::new();
        self.render_into(&mut out, value);
        out
    }

    pub fn render_into(&self, out: &mut String, value: i32) {
        // Writing into a String cannot fail.
        let _ = if self.scale != 1 {
            write!(
                out,
                "{:.*}",
                self.decimals as usize,
                f64::from(value) / f64::from(self.scale)
            )
        } else if self.signed {
            write!(out, "{}", value)
        } else {
            write!(out, "{}", value as u32)
        };
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Message Template
// ─────────────────────────────────────────────────────────────────────────────

/// Substitution points of a notification template, in their mandatory order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateSlot {
    /// Notification name (`%s`)
    Name,
    /// Notification level (`%u` or `%d`)
    Level,
    /// Rendered value string (`%s`)
    Value,
}

impl TemplateSlot {
    const ORDER: [TemplateSlot; 3] = [TemplateSlot::Name, TemplateSlot::Level, TemplateSlot::Value];

    fn accepts(self, conversion: char) -> bool {
        match self {
            TemplateSlot::Name | TemplateSlot::Value => conversion == 's',
            TemplateSlot::Level => conversion == 'u' || conversion == 'd',
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Slot(TemplateSlot),
}

/// A printf-style notification template, parsed once.
///
/// The template must contain exactly three conversions: `%s` for the name,
/// `%u` (or `%d`) for the level and `%s` for the value, in that order.
/// `%%` produces a literal percent sign. Anything else is rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageTemplate {
    source: String,
    segments: Vec<Segment>,
}

impl MessageTemplate {
    pub fn parse(template: &str) -> Result<Self> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut slots = 0usize;
        let mut chars = template.chars();

        while let Some(c) = chars.next() {
            if c != '%' {
                literal.push(c);
                continue;
            }

            let conversion = chars.next().ok_or_else(|| {
                TelemetryError::InvalidFormat(format!("dangling '%' in '{}'", template))
            })?;

            if conversion == '%' {
                literal.push('%');
                continue;
            }

            let slot = *TemplateSlot::ORDER.get(slots).ok_or_else(|| {
                TelemetryError::InvalidFormat(format!(
                    "more than three conversions in '{}'",
                    template
                ))
            })?;

            if !slot.accepts(conversion) {
                return Err(TelemetryError::InvalidFormat(format!(
                    "unexpected conversion '%{}' for {:?} slot in '{}'",
                    conversion, slot, template
                )));
            }

            if !literal.is_empty() {
                segments.push(Segment::Literal(std::mem::take(&mut literal)));
            }
            segments.push(Segment::Slot(slot));
            slots += 1;
        }

        if slots != TemplateSlot::ORDER.len() {
            return Err(TelemetryError::InvalidFormat(format!(
                "expected 3 conversions (name, level, value), found {} in '{}'",
                slots, template
            )));
        }

        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Ok(Self {
            source: template.to_string(),
            segments,
        })
    }

    /// The template as written by the caller
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Fill the slots. The output never exceeds `max_len` bytes.
    pub fn render(&self, name: &str, level: u8, value: &str, max_len: usize) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Slot(TemplateSlot::Name) => out.push_str(name),
                Segment::Slot(TemplateSlot::Level) => {
                    let _ = write!(out, "{}", level);
                }
                Segment::Slot(TemplateSlot::Value) => out.push_str(value),
            }
            if out.len() > max_len {
                break;
            }
        }
        truncate_at_boundary(&mut out, max_len);
        out
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// State Batch
// ─────────────────────────────────────────────────────────────────────────────

/// Value of a property as it appears in a JSON member
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberValue<'a> {
    Number(i32, NumericFormat),
    Text(&'a str),
}

/// Flat JSON object built member by member, never larger than its capacity
#[derive(Debug)]
pub struct StateBatch {
    buffer: String,
    capacity: usize,
    members: usize,
    scratch: String,
}

impl StateBatch {
    pub fn new(capacity: usize) -> Self {
        let mut buffer = String::with_capacity(capacity);
        buffer.push('{');
        Self {
            buffer,
            capacity,
            members: 0,
            scratch: String::new(),
        }
    }

    /// Append `"key":value`. Returns false, leaving the batch untouched, when
    /// the member would push the closed object past the capacity.
    pub fn push(&mut self, key: &str, value: MemberValue<'_>) -> bool {
        self.scratch.clear();
        if self.members > 0 {
            self.scratch.push(',');
        }
        self.scratch.push('"');
        self.scratch.push_str(key);
        self.scratch.push_str("\":");
        match value {
            MemberValue::Number(raw, format) => format.render_into(&mut self.scratch, raw),
            MemberValue::Text(text) => {
                // Embedded quotes are not escaped.
                self.scratch.push('"');
                self.scratch.push_str(text);
                self.scratch.push('"');
            }
        }

        // +1 for the closing brace
        if self.buffer.len() + self.scratch.len() + 1 > self.capacity {
            return false;
        }
        self.buffer.push_str(&self.scratch);
        self.members += 1;
        true
    }

    pub fn len(&self) -> usize {
        self.members
    }

    pub fn is_empty(&self) -> bool {
        self.members == 0
    }

    /// Close the object, or `None` if nothing was added
    pub fn finish(mut self) -> Option<String> {
        if self.members == 0 {
            return None;
        }
        self.buffer.push('}');
        Some(self.buffer)
    }
}
