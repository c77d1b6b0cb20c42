use crate::condition::Value;
use crate::event::{Event, Payload};
use csv::StringRecord;
use log::warn;
use std::fs::File;
use std::io;
use std::path::Path;

/// Reads an event stream from headerless CSV.
///
/// Row format: `timestamp,event_type[,key=value,...]`. Attribute values are
/// coerced to the narrowest kind they parse as (integer, float, bool,
/// string). Malformed rows are skipped with a warning. Arrival indices are
/// assigned in reading order.
pub struct CsvEventStream<R: io::Read> {
    reader: csv::Reader<R>,
    record: StringRecord,
    next_id: u64,
}

impl CsvEventStream<File> {
    pub fn open(path: impl AsRef<Path>) -> csv::Result<Self> {
        Ok(Self::with_reader(
            csv::ReaderBuilder::new()
                .has_headers(false)
                .flexible(true)
                .from_path(path)?,
        ))
    }
}

impl<R: io::Read> CsvEventStream<R> {
    pub fn from_reader(reader: R) -> Self {
        Self::with_reader(
            csv::ReaderBuilder::new()
                .has_headers(false)
                .flexible(true)
                .from_reader(reader),
        )
    }

    fn with_reader(reader: csv::Reader<R>) -> Self {
        Self {
            reader,
            record: StringRecord::new(),
            next_id: 0,
        }
    }

    fn parse_record(&self) -> Option<Event> {
        let timestamp = self.record.get(0)?.trim().parse::<u64>().ok()?;
        let event_type = self.record.get(1)?.trim();
        if event_type.is_empty() {
            return None;
        }

        let mut payload = Payload::default();
        for field in self.record.iter().skip(2) {
            let (key, value) = field.split_once('=')?;
            payload.insert(key.trim().to_string(), parse_value(value.trim()));
        }

        Some(Event::new(event_type, timestamp, payload, self.next_id))
    }
}

impl<R: io::Read> Iterator for CsvEventStream<R> {
    type Item = Event;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.reader.read_record(&mut self.record) {
                Ok(true) => {
                    if let Some(event) = self.parse_record() {
                        self.next_id += 1;
                        return Some(event);
                    }
                    warn!("skipping malformed event record {:?}", self.record);
                }
                Ok(false) => return None,
                Err(error) => warn!("skipping unreadable event record: {}", error),
            }
        }
    }
}

/// Coerce an attribute string to the narrowest kind it parses as.
fn parse_value(input: &str) -> Value {
    if let Ok(v) = input.parse::<i64>() {
        Value::Int(v)
    } else if let Ok(v) = input.parse::<f64>() {
        Value::Float(v)
    } else if let Ok(v) = input.parse::<bool>() {
        Value::Bool(v)
    } else {
        Value::Str(input.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_events() {
        let data = "\
0,A,v=1
3,B,v=2.5,tag=probe
5,B,ok=true
";
        let events: Vec<Event> = CsvEventStream::from_reader(data.as_bytes()).collect();
        assert_eq!(events.len(), 3);

        assert_eq!(events[0].event_type, "A");
        assert_eq!(events[0].timestamp, 0);
        assert_eq!(events[0].id, 0);
        assert_eq!(events[0].payload.get("v"), Some(&Value::Int(1)));

        assert_eq!(events[1].payload.get("v"), Some(&Value::Float(2.5)));
        assert_eq!(
            events[1].payload.get("tag"),
            Some(&Value::Str("probe".to_string()))
        );

        assert_eq!(events[2].id, 2);
        assert_eq!(events[2].payload.get("ok"), Some(&Value::Bool(true)));
    }

    #[test]
    fn test_malformed_rows_are_skipped() {
        let data = "\
not-a-timestamp,A
1,A
2
3,B,orphan-field
";
        let events: Vec<Event> = CsvEventStream::from_reader(data.as_bytes()).collect();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "A");
        assert_eq!(events[0].id, 0);
    }
}
