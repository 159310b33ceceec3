//! Text-protocol resultset decoding, streamed as events.
//!
//! The query driver reads backend packets and turns them into
//! [`ResultEvent`]s; result-stream handlers consume the events in arrival
//! order. Only the pieces the handlers observe are decoded: column count,
//! row fields, and the terminal OK/EOF/ERR.

use bytes::Bytes;

use super::handshake::{ErrPacket, OkPacket};
use super::packet::{get_lenenc_int, get_lenenc_str};

/// One event of a streamed query result
#[derive(Debug, Clone)]
pub enum ResultEvent {
    /// Start of a resultset: number of columns
    ColumnCount(u64),
    /// One column definition (content not decoded, handlers ignore it)
    Column,
    /// One text-protocol row
    Row(TextRow),
    /// End of rows (EOF)
    RowEnd,
    /// Statement produced no resultset
    Ok(OkPacket),
    /// Server error
    Err(ErrPacket),
}

/// A text-protocol row: one optional string per column, `None` is SQL NULL
#[derive(Debug, Clone, Default)]
pub struct TextRow {
    pub fields: Vec<Option<String>>,
}

impl TextRow {
    pub fn new(fields: Vec<Option<String>>) -> Self {
        Self { fields }
    }
}

/// Parse the first packet of a resultset into a column count.
/// Returns None when the payload is not a length-encoded integer.
pub fn parse_column_count(payload: &Bytes) -> Option<u64> {
    let mut buf: &[u8] = payload;
    let count = get_lenenc_int(&mut buf)?;
    if !buf.is_empty() {
        return None;
    }
    Some(count)
}

/// Parse a row packet: length-encoded strings until the payload ends,
/// with 0xFB as the NULL marker.
pub fn parse_text_row(payload: &Bytes) -> Option<TextRow> {
    let mut buf: &[u8] = payload;
    let mut fields = Vec::new();
    while !buf.is_empty() {
        fields.push(get_lenenc_str(&mut buf)?);
    }
    Some(TextRow::new(fields))
}
