use serde_json::{Map, Number, Value};
use tracing::warn;

use crate::models::Resource;

/// Turns the raw content of a capture data file into the payload returned to callers
pub trait DataFormatter: Send + Sync {
    fn name(&self) -> &'static str;
    fn format(&self, raw: &[u8]) -> Value;
}

/// Content returned as a single string
pub struct RawText;

impl DataFormatter for RawText {
    fn name(&self) -> &'static str {
        "raw"
    }

    fn format(&self, raw: &[u8]) -> Value {
        Value::String(String::from_utf8_lossy(raw).into_owned())
    }
}

/// Comma-separated samples; the first record names the columns, `#` lines are skipped
pub struct CsvRecords;

impl CsvRecords {
    fn cell(value: &str) -> Value {
        if let Ok(i) = value.parse::<i64>() {
            return Value::Number(i.into());
        }
        match value.parse::<f64>().ok().and_then(Number::from_f64) {
            Some(n) => Value::Number(n),
            None => Value::String(value.to_string()),
        }
    }
}

impl DataFormatter for CsvRecords {
    fn name(&self) -> &'static str {
        "csv-records"
    }

    fn format(&self, raw: &[u8]) -> Value {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .trim(csv::Trim::All)
            .comment(Some(b'#'))
            .from_reader(raw);
        let columns: Vec<String> = match reader.byte_headers() {
            Ok(header) => header
                .iter()
                .map(|c| String::from_utf8_lossy(c).into_owned())
                .collect(),
            Err(e) => {
                warn!(error = %e, "unreadable CSV header");
                return Value::Array(Vec::new());
            }
        };

        let mut records = Vec::new();
        for row in reader.byte_records() {
            let row = match row {
                Ok(row) => row,
                Err(e) => {
                    warn!(error = %e, "skipping unreadable CSV row");
                    continue;
                }
            };
            let mut record = Map::new();
            for (i, value) in row.iter().enumerate() {
                let key = columns
                    .get(i)
                    .cloned()
                    .unwrap_or_else(|| format!("column{i}"));
                record.insert(key, Self::cell(&String::from_utf8_lossy(value)));
            }
            records.push(Value::Object(record));
        }
        Value::Array(records)
    }
}

static RAW_TEXT: RawText = RawText;
static CSV_RECORDS: CsvRecords = CsvRecords;

/// Formatter chosen by the resource's type tags
pub fn formatter_for(resource: &Resource) -> &'static dyn DataFormatter {
    if resource.has_type("power-measurement") {
        &CSV_RECORDS
    } else {
        &RAW_TEXT
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Record;
    use serde_json::json;

    #[test]
    fn csv_lines_become_records() {
        let raw = b"time, power, unit\n0.0, 1.25, mW\n\n0.5,1.5,mW\n";
        let out = CsvRecords.format(raw);
        assert_eq!(
            out,
            json!([
                {"time": 0.0, "power": 1.25, "unit": "mW"},
                {"time": 0.5, "power": 1.5, "unit": "mW"}
            ])
        );
    }

    #[test]
    fn extra_columns_get_positional_names() {
        let out = CsvRecords.format(b"a\n1,2\n");
        assert_eq!(out, json!([{"a": 1, "column1": 2}]));
        assert_eq!(CsvRecords.format(b""), json!([]));
    }

    #[test]
    fn quoted_fields_keep_their_commas() {
        let out = CsvRecords.format(b"label,power\n\"board a, rev2\",1.5\n");
        assert_eq!(out, json!([{"label": "board a, rev2", "power": 1.5}]));
    }

    #[test]
    fn comment_lines_are_skipped() {
        let out = CsvRecords.format(b"# acme meter v2\ntime,power\n# resync\n1,2\n");
        assert_eq!(out, json!([{"time": 1, "power": 2}]));
    }

    #[test]
    fn formatter_follows_resource_type() {
        let meter = Resource::new(Record::new("acme0").with("type", "power-measurement"));
        let serial = Resource::new(Record::new("serial0").with("type", "serial"));
        assert_eq!(formatter_for(&meter).name(), "csv-records");
        assert_eq!(formatter_for(&serial).name(), "raw");
        assert_eq!(RawText.format(b"login:"), json!("login:"));
    }
}
