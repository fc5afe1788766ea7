use aqueduct::sse::SseEventCodec;
use bytes::BytesMut;
use tokio_util::codec::Decoder;

fn decode_chunks(chunks: &[&[u8]]) -> Vec<String> {
    let mut codec = SseEventCodec::new();
    let mut buf = BytesMut::new();
    let mut events = Vec::new();
    for chunk in chunks {
        buf.extend_from_slice(chunk);
        while let Some(event) = codec.decode(&mut buf).expect("decode must not fail") {
            events.push(event);
        }
    }
    while let Some(event) = codec.decode_eof(&mut buf).expect("eof decode must not fail") {
        events.push(event);
    }
    events
}

/// A realistic stream: multibyte text, a keepalive comment, a multi-line
/// data event, CRLF terminators, and the terminating sentinel.
const STREAM: &[u8] = "data: {\"choices\":[{\"delta\":{\"content\":\"héllo\"}}]}\n\n\
: keepalive\n\
data: {\"choices\":[{\"delta\"\ndata: :{\"content\":\" wörld\"}}]}\n\n\
data: {\"done\":true}\r\n\r\n\
data: [DONE]\n\n"
    .as_bytes();

#[test]
fn whole_stream_decodes_to_expected_events() {
    let events = decode_chunks(&[STREAM]);
    assert_eq!(
        events,
        vec![
            "{\"choices\":[{\"delta\":{\"content\":\"héllo\"}}]}",
            "{\"choices\":[{\"delta\"\n:{\"content\":\" wörld\"}}]}",
            "{\"done\":true}",
            "[DONE]",
        ]
    );
}

#[test]
fn event_sequence_is_invariant_under_every_split_point() {
    let baseline = decode_chunks(&[STREAM]);
    assert!(!baseline.is_empty());

    // Splitting the byte stream at any offset, including mid-line and
    // mid-UTF-8-codepoint, must not change the decoded event sequence.
    for split in 1..STREAM.len() {
        let events = decode_chunks(&[&STREAM[..split], &STREAM[split..]]);
        assert_eq!(events, baseline, "diverged at split offset {}", split);
    }
}

#[test]
fn one_byte_at_a_time_matches_baseline() {
    let baseline = decode_chunks(&[STREAM]);
    let trickle: Vec<&[u8]> = STREAM.chunks(1).collect();
    assert_eq!(decode_chunks(&trickle), baseline);
}

#[test]
fn leading_space_is_optional_and_stripped_once() {
    assert_eq!(decode_chunks(&[b"data:no-space\n\n"]), vec!["no-space"]);
    assert_eq!(decode_chunks(&[b"data:  two\n\n"]), vec![" two"]);
}

#[test]
fn empty_stream_produces_no_events() {
    assert!(decode_chunks(&[b""]).is_empty());
    assert!(decode_chunks(&[b"\n\n\n"]).is_empty());
    assert!(decode_chunks(&[b": only comments\n\n"]).is_empty());
}
