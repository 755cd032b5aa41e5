//! Decodes the provider's response wire format: HTTP/1.1 chunked framing
//! around a deflate stream around an array-encoded streaming protocol.
//!
//! The parser is deliberately stateless: it re-parses the whole accumulated
//! buffer on every call and returns the cumulative response state. Re-emitted
//! deltas are fine; the emitter diffs against its last snapshot.

use once_cell::sync::Lazy;
use regex::bytes::Regex;
use serde_json::Value;
use tracing::{debug, warn};

use super::bus::{StreamFrame, ToolInvocation};

/// Payload envelopes embedded in the inflated buffer look like
/// `[[[null, …]],"model"]`. Non-greedy so adjacent envelopes in one buffer
/// match separately.
static ENVELOPE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"\[\[\[null,.*?\]\],"model"\]"#).expect("envelope regex"));

/// Decode an HTTP/1.1 chunked body that may be truncated mid-chunk.
///
/// Returns the decoded bytes and whether the terminating `0\r\n\r\n` marker
/// was seen. A partially received chunk header or body is never consumed:
/// the caller re-parses once more bytes arrive.
pub fn decode_chunked(buf: &[u8]) -> (Vec<u8>, bool) {
    let mut out = Vec::new();
    let mut pos = 0usize;

    loop {
        let Some(header_end) = find_crlf(&buf[pos..]) else {
            break; // partial chunk header
        };
        let header = &buf[pos..pos + header_end];
        // Ignore chunk extensions after ';'.
        let size_part = header.split(|&b| b == b';').next().unwrap_or(header);
        let Ok(size_str) = std::str::from_utf8(size_part) else {
            break;
        };
        let Ok(size) = usize::from_str_radix(size_str.trim(), 16) else {
            break;
        };

        let data_start = pos + header_end + 2;
        if size == 0 {
            // Body-complete marker is "0\r\n" followed by an empty trailer.
            let done = buf.len() >= data_start + 2 && &buf[data_start..data_start + 2] == b"\r\n";
            return (out, done);
        }
        if buf.len() < data_start + size + 2 {
            break; // partial chunk body
        }
        out.extend_from_slice(&buf[data_start..data_start + size]);
        pos = data_start + size + 2;
    }

    (out, false)
}

/// Chunked-encode `data` in fixed-size chunks with the terminating marker.
/// Counterpart of [`decode_chunked`], used by diagnostics and tests.
pub fn encode_chunked(data: &[u8], chunk_size: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 32);
    let chunk_size = chunk_size.max(1);
    for chunk in data.chunks(chunk_size) {
        out.extend_from_slice(format!("{:x}\r\n", chunk.len()).as_bytes());
        out.extend_from_slice(chunk);
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"0\r\n\r\n");
    out
}

/// Inflate a gzip/zlib/raw-deflate buffer, tolerating a truncated tail.
/// Whatever decompressed cleanly is returned; trailing partial input is
/// silently dropped (the next call sees a longer buffer).
pub fn inflate_loose(data: &[u8]) -> Vec<u8> {
    use flate2::{Decompress, FlushDecompress, Status};

    if data.is_empty() {
        return Vec::new();
    }
    let mut inflater = if data.starts_with(&[0x1f, 0x8b]) {
        Decompress::new_gzip(15)
    } else if data[0] == 0x78 {
        Decompress::new(true)
    } else {
        Decompress::new(false)
    };

    let mut out = Vec::with_capacity(data.len().saturating_mul(4));
    let mut buf = [0u8; 16 * 1024];
    loop {
        let consumed_before = inflater.total_in() as usize;
        let produced_before = inflater.total_out();
        if consumed_before >= data.len() {
            break;
        }
        let status = inflater.decompress(&data[consumed_before..], &mut buf, FlushDecompress::Sync);
        let produced = (inflater.total_out() - produced_before) as usize;
        out.extend_from_slice(&buf[..produced]);
        match status {
            Ok(Status::StreamEnd) => break,
            Ok(_) => {
                let consumed = inflater.total_in() as usize;
                if consumed == consumed_before && produced == 0 {
                    break; // stalled on a partial tail
                }
            }
            Err(err) => {
                debug!("inflate stopped on partial data: {err}");
                break;
            }
        }
    }
    out
}

/// Run the envelope extractor over an inflated buffer and fold every decoded
/// payload into one cumulative frame.
pub fn parse_frames(decoded: &[u8]) -> StreamFrame {
    let mut frame = StreamFrame::default();

    for m in ENVELOPE_RE.find_iter(decoded) {
        let Ok(envelope) = serde_json::from_slice::<Value>(m.as_bytes()) else {
            // Matched a still-incomplete envelope; skip silently.
            continue;
        };
        let Some(payload) = envelope
            .get(0)
            .and_then(|v| v.get(0))
            .and_then(|v| v.as_array())
        else {
            continue;
        };

        match payload.len() {
            2 => {
                if let Some(text) = payload[1].as_str() {
                    frame.body.push_str(text);
                }
            }
            11 if payload[1].is_null() => {
                warn_on_unknown_slots(payload);
                if let Some(call) = payload[10].as_array() {
                    let name = call
                        .first()
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string();
                    let params = call.get(1).map(decode_tool_params).unwrap_or(Value::Null);
                    frame.function.push(ToolInvocation { name, params });
                }
            }
            _ => {
                // Remaining shapes carry thinking text at slot 1.
                if let Some(text) = payload.get(1).and_then(|v| v.as_str()) {
                    frame.reason.push_str(text);
                }
            }
        }
    }

    frame
}

/// Full pipeline over a raw (possibly truncated) response body: chunked
/// decode, inflate, extract. `done` reflects the chunked terminator only.
pub fn parse_response(raw: &[u8]) -> StreamFrame {
    let (decoded, done) = decode_chunked(raw);
    let inflated = inflate_loose(&decoded);
    let mut frame = parse_frames(&inflated);
    frame.done = done;
    frame
}

/// Decode a tool-call parameter list. The wire shape is
/// `[[ [name, tagged_value], … ]]`: a wrapper list whose first element is
/// the list of name/value pairs.
pub fn decode_tool_params(args: &Value) -> Value {
    let mut map = serde_json::Map::new();
    if let Some(params) = args.get(0).and_then(|v| v.as_array()) {
        for param in params {
            let Some(pair) = param.as_array() else {
                continue;
            };
            let (Some(name), Some(tagged)) = (pair.first().and_then(|v| v.as_str()), pair.get(1))
            else {
                continue;
            };
            map.insert(name.to_string(), decode_tagged_value(tagged));
        }
    }
    Value::Object(map)
}

/// A type-tagged value is a fixed-shape array whose populated slot selects
/// the type: 1 → number, 2 → string, 3 → boolean (1 = true), 4 → explicit
/// null, 5 → nested object, 6 → array (elementwise).
fn decode_tagged_value(tagged: &Value) -> Value {
    let Some(slots) = tagged.as_array() else {
        return Value::Null;
    };
    if let Some(v) = slot(slots, 1) {
        return v.clone();
    }
    if let Some(v) = slot(slots, 2) {
        return v.clone();
    }
    if let Some(v) = slot(slots, 3) {
        let truthy = v.as_i64() == Some(1) || v.as_bool() == Some(true);
        return Value::Bool(truthy);
    }
    if slot(slots, 4).is_some() {
        return Value::Null;
    }
    if let Some(v) = slot(slots, 5) {
        return decode_tool_params(v);
    }
    if let Some(v) = slot(slots, 6) {
        let items = v
            .as_array()
            .map(|arr| arr.iter().map(decode_tagged_value).collect())
            .unwrap_or_default();
        return Value::Array(items);
    }
    Value::Null
}

fn slot<'a>(slots: &'a [Value], idx: usize) -> Option<&'a Value> {
    slots.get(idx).filter(|v| !v.is_null())
}

/// The 11-slot tool-call payload is only documented for slots 1 (null
/// marker) and 10 (the call itself). Any other populated slot means the
/// protocol moved under us; shout instead of dropping it silently.
fn warn_on_unknown_slots(payload: &[Value]) {
    for (idx, value) in payload.iter().enumerate() {
        if idx == 1 || idx == 10 {
            continue;
        }
        if !value.is_null() {
            warn!(slot = idx, "unrecognized populated slot in tool-call payload: {value}");
        }
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunked_roundtrip() {
        let data = b"HelloWorld, this is a chunked body".to_vec();
        for chunk_size in [1, 3, 5, 1024] {
            let encoded = encode_chunked(&data, chunk_size);
            let (decoded, done) = decode_chunked(&encoded);
            assert_eq!(decoded, data);
            assert!(done);
        }
    }

    #[test]
    fn partial_chunk_is_not_consumed() {
        let encoded = encode_chunked(b"HelloWorld", 5);
        // Cut in the middle of the second chunk body.
        let cut = &encoded[..encoded.len() - 12];
        let (decoded, done) = decode_chunked(cut);
        assert_eq!(decoded, b"Hello");
        assert!(!done);
    }

    #[test]
    fn terminator_without_trailer_stays_open() {
        let mut encoded = encode_chunked(b"Hi", 8);
        encoded.truncate(encoded.len() - 2); // drop the final blank line
        let (decoded, done) = decode_chunked(&encoded);
        assert_eq!(decoded, b"Hi");
        assert!(!done);
    }

    #[test]
    fn body_delta_extraction() {
        let wire = br#"[[[null, "Hello"]],"model"]"#;
        let frame = parse_frames(wire);
        assert_eq!(frame.body, "Hello");
        assert_eq!(frame.reason, "");
        assert!(frame.function.is_empty());
    }

    #[test]
    fn adjacent_envelopes_accumulate() {
        let wire = br#"[[[null, "Hel"]],"model"][[[null, "lo"]],"model"]"#;
        let frame = parse_frames(wire);
        assert_eq!(frame.body, "Hello");
    }

    #[test]
    fn invalid_json_match_is_skipped() {
        let wire = br#"[[[null,"unclosed string]],"model"]"#;
        let frame = parse_frames(wire);
        assert_eq!(frame.body, "");
        assert!(frame.function.is_empty());
    }

    #[test]
    fn reason_delta_at_slot_one() {
        let wire = br#"[[[null, "thinking hard", null]],"model"]"#;
        let frame = parse_frames(wire);
        assert_eq!(frame.body, "");
        assert_eq!(frame.reason, "thinking hard");
    }

    #[test]
    fn tool_call_payload() {
        let params = serde_json::json!([[["q", [null, null, "x"]], ["n", [null, 3]]]]);
        let mut payload = vec![Value::Null; 11];
        payload[10] = serde_json::json!(["lookup", params]);
        let wire = format!(r#"[[{}],"model"]"#, serde_json::to_string(&payload).unwrap());
        let frame = parse_frames(wire.as_bytes());
        assert_eq!(frame.function.len(), 1);
        assert_eq!(frame.function[0].name, "lookup");
        assert_eq!(
            frame.function[0].params,
            serde_json::json!({"q": "x", "n": 3})
        );
    }

    #[test]
    fn tagged_value_lattice() {
        let args = serde_json::json!([[
            ["int_param", [null, 123]],
            ["str_param", [null, null, "string_val"]],
            ["bool_param", [null, null, null, 1]],
            ["null_param", [null]],
            ["explicit_null", [null, null, null, null, 1]],
            ["nested", [null, null, null, null, null, [[["inner", [null, 7]]]]]],
            ["list", [null, null, null, null, null, null, [[null, 1], [null, 2]]]]
        ]]);
        let decoded = decode_tool_params(&args);
        assert_eq!(decoded["int_param"], 123);
        assert_eq!(decoded["str_param"], "string_val");
        assert_eq!(decoded["bool_param"], true);
        assert_eq!(decoded["null_param"], Value::Null);
        assert_eq!(decoded["explicit_null"], Value::Null);
        assert_eq!(decoded["nested"], serde_json::json!({"inner": 7}));
        assert_eq!(decoded["list"], serde_json::json!([1, 2]));
    }

    #[test]
    fn full_pipeline_over_compressed_chunks() {
        use flate2::write::ZlibEncoder;
        use flate2::Compression;
        use std::io::Write;

        let inner = br#"[[[null, "ping"]],"model"]"#;
        let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
        enc.write_all(inner).unwrap();
        let compressed = enc.finish().unwrap();
        let wire = encode_chunked(&compressed, 7);

        let frame = parse_response(&wire);
        assert_eq!(frame.body, "ping");
        assert!(frame.done);

        // A truncated prefix parses what it can and stays open.
        let partial = parse_response(&wire[..wire.len() / 2]);
        assert!(!partial.done);
    }
}
