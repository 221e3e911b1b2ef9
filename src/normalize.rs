// po_ingestor/src/normalize.rs
// Pure row-level normalization: raw CSV fields to typed BSON values.

use chrono::{NaiveDate, NaiveDateTime};
use csv::StringRecord;
use mongodb::bson::{Bson, Document};
use sha2::{Digest, Sha256};

/// Source columns parsed as dates (after header normalization).
const DATE_FIELDS: &[&str] = &["creation_date", "purchase_date"];
/// Source columns parsed as decimal amounts. Sign is preserved; refunds and
/// adjustments arrive as negative totals and are valid.
const DECIMAL_FIELDS: &[&str] = &["unit_price", "total_price"];
const INTEGER_FIELDS: &[&str] = &["quantity"];
const BOOL_FIELDS: &[&str] = &["calcard_used"];

/// Column whose presence is mandatory for a row to be ingested at all.
const IDENTITY_FIELD: &str = "purchase_order_number";

/// Why a row was excluded from ingestion. Rejections are counted and
/// reported, never propagated as errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq,)]
pub enum RejectReason {
    /// The mandatory purchase order number is missing or blank.
    MissingIdentity,
    /// The row has a different number of fields than the header.
    RaggedRow,
}

impl RejectReason {
    pub fn as_str(&self,) -> &'static str {
        match self {
            RejectReason::MissingIdentity => "missing_identity",
            RejectReason::RaggedRow => "ragged_row",
        }
    }
}

/// One fully normalized row, ready for insertion.
#[derive(Debug, Clone,)]
pub struct NormalizedRecord {
    /// Deterministic fingerprint of the raw row, also stored in the
    /// document under [`crate::ROW_KEY_FIELD`].
    pub key: String,
    pub doc: Document,
}

/// Maps a raw CSV header to its stored field name: trimmed, lowercased,
/// non-alphanumeric runs collapsed to a single underscore. "Sub-Acquisition
/// Method" becomes "sub_acquisition_method".
pub fn field_name(raw: &str,) -> String {
    let mut out = String::with_capacity(raw.len(),);
    for ch in raw.trim().chars() {
        if ch.is_ascii_alphanumeric() {
            out.extend(ch.to_lowercase(),);
        } else if !out.ends_with('_',) {
            out.push('_',);
        }
    }
    let name = out.trim_matches('_',).to_string();
    // The source header is "CalCard" but the stored attribute is a boolean.
    if name == "calcard" {
        "calcard_used".to_string()
    } else {
        name
    }
}

/// Strips currency formatting and parses a decimal. `"$1,234.56"` becomes
/// `1234.56`; `"($50.00)"` becomes `-50.00`; anything unparseable becomes
/// `None`, never zero.
pub fn clean_number(raw: &str,) -> Option<f64,> {
    let mut s = raw.trim();
    if s.is_empty() {
        return None;
    }
    let mut negative = false;
    if s.starts_with('(',) && s.ends_with(')',) {
        negative = true;
        s = &s[1..s.len() - 1];
    }
    let stripped: String = s
        .chars()
        .filter(|c| *c != '$' && *c != ',' && !c.is_whitespace(),)
        .collect();
    let value: f64 = stripped.parse().ok()?;
    if !value.is_finite() {
        return None;
    }
    Some(if negative { -value } else { value },)
}

/// Parses the date formats seen in the source extract and renders the result
/// as an ISO-8601 string, the representation the stored pipelines
/// (`$dateFromString`) expect.
pub fn parse_date(raw: &str,) -> Option<String,> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S", "%m/%d/%Y %H:%M:%S", "%m/%d/%Y %H:%M"] {
        if let Ok(dt,) = NaiveDateTime::parse_from_str(s, fmt,) {
            return Some(dt.format("%Y-%m-%dT%H:%M:%S",).to_string(),);
        }
    }
    for fmt in ["%m/%d/%Y", "%Y-%m-%d"] {
        if let Ok(d,) = NaiveDate::parse_from_str(s, fmt,) {
            let dt = d.and_hms_opt(0, 0, 0,)?;
            return Some(dt.format("%Y-%m-%dT%H:%M:%S",).to_string(),);
        }
    }
    None
}

fn parse_bool(raw: &str,) -> Option<bool,> {
    match raw.trim().to_ascii_uppercase().as_str() {
        "YES" | "Y" | "TRUE" => Some(true,),
        "NO" | "N" | "FALSE" => Some(false,),
        _ => None,
    }
}

/// Hex SHA-256 over the raw row fields, joined with a unit separator so that
/// field boundaries cannot collide. Stable across re-runs of the same file.
pub fn fingerprint(record: &StringRecord,) -> String {
    let mut hasher = Sha256::new();
    for (i, field,) in record.iter().enumerate() {
        if i > 0 {
            hasher.update([0x1f,],);
        }
        hasher.update(field.as_bytes(),);
    }
    hex::encode(hasher.finalize(),)
}

fn typed_value(name: &str, raw: &str,) -> Bson {
    if DATE_FIELDS.contains(&name,) {
        return match parse_date(raw,) {
            Some(iso,) => Bson::String(iso,),
            None => Bson::Null,
        };
    }
    if DECIMAL_FIELDS.contains(&name,) {
        return match clean_number(raw,) {
            Some(v,) => Bson::Double(v,),
            None => Bson::Null,
        };
    }
    if INTEGER_FIELDS.contains(&name,) {
        return match clean_number(raw,) {
            Some(v,) if v.fract() == 0.0 && v.abs() < i64::MAX as f64 => Bson::Int64(v as i64,),
            Some(v,) => Bson::Double(v,),
            None => Bson::Null,
        };
    }
    if BOOL_FIELDS.contains(&name,) {
        return match parse_bool(raw,) {
            Some(b,) => Bson::Boolean(b,),
            None => Bson::Null,
        };
    }
    // Text: trimmed, empty preserved as empty (distinct from an absent
    // field, which never produces a key at all).
    Bson::String(raw.trim().to_string(),)
}

/// Normalizes one raw row against the (already normalized) header. Malformed
/// fields degrade to null individually; only a missing identity or a ragged
/// row rejects the whole record.
pub fn normalize_record(
    headers: &[String],
    record: &StringRecord,
) -> std::result::Result<NormalizedRecord, RejectReason,> {
    if record.len() != headers.len() {
        return Err(RejectReason::RaggedRow,);
    }

    let identity = headers
        .iter()
        .position(|h| h == IDENTITY_FIELD,)
        .and_then(|i| record.get(i,),)
        .map(str::trim,)
        .unwrap_or("",);
    if identity.is_empty() {
        return Err(RejectReason::MissingIdentity,);
    }

    let key = fingerprint(record,);
    let mut doc = Document::new();
    doc.insert(crate::ROW_KEY_FIELD, key.clone(),);
    for (name, raw,) in headers.iter().zip(record.iter(),) {
        doc.insert(name.clone(), typed_value(name, raw,),);
    }

    Ok(NormalizedRecord { key, doc, },)
}
