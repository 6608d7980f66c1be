//! Record codec
//!
//! Responses are colon-delimited ASCII records: `<tag>[:<field>]*`. Field
//! order is contract-defined by the firmware and never reordered; everything
//! above addresses fields purely by zero-based index after the tag.

use super::ProtocolError;

/// A parsed colon-delimited record
///
/// Field 0 of the raw record is the echoed tag; [`Record::field`] and friends
/// index the data fields that follow it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    fields: Vec<String>,
}

impl Record {
    /// Parse a raw response line. Empty fields are preserved, so `"C:"`
    /// yields the tag `"C"` followed by one empty data field.
    pub fn parse(raw: &str) -> Self {
        Self {
            fields: raw.split(':').map(str::to_string).collect(),
        }
    }

    /// A record with no fields at all (fire-and-forget transactions)
    pub fn empty() -> Self {
        Self { fields: Vec::new() }
    }

    /// The leading tag field
    pub fn tag(&self) -> &str {
        self.fields.first().map(String::as_str).unwrap_or("")
    }

    /// Number of data fields following the tag
    pub fn field_count(&self) -> usize {
        self.fields.len().saturating_sub(1)
    }

    /// Data field by zero-based index, tag excluded
    pub fn field(&self, index: usize) -> Option<&str> {
        self.fields.get(index + 1).map(String::as_str)
    }

    /// All data fields following the tag
    pub fn fields(&self) -> &[String] {
        self.fields.get(1..).unwrap_or(&[])
    }

    /// Parse a data field as a decimal number with a fixed scale divisor.
    ///
    /// Fields transmitted as integer hundredths of a physical unit use
    /// `scale = 100.0`; plain fields use `1.0`. A non-numeric value in a
    /// field the protocol guarantees numeric signals desynchronization and
    /// is reported, never defaulted.
    pub fn numeric_field(&self, index: usize, scale: f64) -> Result<f64, ProtocolError> {
        let value = self
            .field(index)
            .ok_or(ProtocolError::RecordTooShort {
                fields: self.field_count(),
                index,
            })?;
        value
            .trim()
            .parse::<f64>()
            .map(|v| v / scale)
            .map_err(|_| ProtocolError::FieldParse {
                index,
                value: value.to_string(),
            })
    }

    /// Parse a boolean-coded data field (`value > 0`)
    pub fn bool_field(&self, index: usize) -> Result<bool, ProtocolError> {
        Ok(self.numeric_field(index, 1.0)? > 0.0)
    }

    /// Reassemble the raw line, tag included
    pub fn to_line(&self) -> String {
        join(self.tag(), self.fields())
    }
}

/// Assemble a command or record string: `tag:field0:field1:...`
pub fn join(tag: &str, fields: &[String]) -> String {
    let mut out = String::from(tag);
    for field in fields {
        out.push(':');
        out.push_str(field);
    }
    out
}
