//! Decoder seam between the reactor and vendor telemetry dialects.
//!
//! The reactor frames raw bytes into a per-peer buffer and hands each
//! read to the decoder; the decoder yields completed records and tells
//! the reactor how many trailing bytes belong to an incomplete record so
//! they can be carried into the next read.

use serde_json::Value;

/// Outcome of one decode pass over a peer buffer.
#[derive(Debug, Default, PartialEq)]
pub struct Decoded {
    /// Completed records, in arrival order.
    pub records: Vec<Value>,
    /// Bytes of an incomplete trailing record to carry over.
    pub truncated_len: usize,
}

/// A telemetry wire decoder.
pub trait Decoder {
    /// Decode `buf`, which holds any carried-over bytes followed by the
    /// newly received ones.
    fn decode(&mut self, peer: &str, buf: &[u8]) -> Decoded;
}

/// Newline-framed decoder. Lines that parse as JSON are kept as parsed
/// documents; anything else is wrapped as a raw string.
#[derive(Debug, Default, Clone)]
pub struct LineDecoder;

impl Decoder for LineDecoder {
    fn decode(&mut self, _peer: &str, buf: &[u8]) -> Decoded {
        let mut out = Decoded::default();
        let mut start = 0;

        for (i, b) in buf.iter().enumerate() {
            if *b != b'\n' {
                continue;
            }
            let mut line = &buf[start..i];
            start = i + 1;
            if line.last() == Some(&b'\r') {
                line = &line[..line.len() - 1];
            }
            if line.is_empty() {
                continue;
            }
            let record = match serde_json::from_slice::<Value>(line) {
                Ok(value) => value,
                Err(_) => Value::String(String::from_utf8_lossy(line).into_owned()),
            };
            out.records.push(record);
        }

        out.truncated_len = buf.len() - start;
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn partial_record_is_carried_over() {
        let mut decoder = LineDecoder;

        // 40 bytes, no terminator: nothing completes.
        let first = vec![b'x'; 40];
        let decoded = decoder.decode("10.0.0.1", &first);
        assert!(decoded.records.is_empty());
        assert_eq!(decoded.truncated_len, 40);

        // The next read sees the carried 40 bytes prefixed to 80 more,
        // terminated this time.
        let mut second = first;
        second.extend_from_slice(&vec![b'y'; 79]);
        second.push(b'\n');
        let decoded = decoder.decode("10.0.0.1", &second);
        assert_eq!(decoded.records.len(), 1);
        assert_eq!(decoded.truncated_len, 0);
        let line = decoded.records[0].as_str().unwrap();
        assert_eq!(line.len(), 119);
    }

    #[test]
    fn json_lines_parse_into_documents() {
        let mut decoder = LineDecoder;
        let decoded = decoder.decode("peer", b"{\"ifIndex\": 7}\nnot json\n{\"partial\":");
        assert_eq!(decoded.records.len(), 2);
        assert_eq!(decoded.records[0], json!({"ifIndex": 7}));
        assert_eq!(decoded.records[1], json!("not json"));
        assert_eq!(decoded.truncated_len, "{\"partial\":".len());
    }

    #[test]
    fn crlf_and_blank_lines_are_tolerated() {
        let mut decoder = LineDecoder;
        let decoded = decoder.decode("peer", b"a\r\n\r\nb\n");
        assert_eq!(decoded.records, vec![json!("a"), json!("b")]);
        assert_eq!(decoded.truncated_len, 0);
    }
}
