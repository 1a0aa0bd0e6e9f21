use bytes::Bytes;

/// Encode a message as an event-stream frame: an optional `event:` line, one
/// `data:` line per payload line, and the blank-line terminator the transport
/// uses to delimit frames.
pub fn encode_event(name: Option<&str>, data: &str) -> Bytes {
    let mut frame = String::with_capacity(data.len() + 16);
    if let Some(name) = name {
        frame.push_str("event: ");
        frame.push_str(name);
        frame.push('\n');
    }
    for line in data.split('\n') {
        frame.push_str("data: ");
        frame.push_str(line);
        frame.push('\n');
    }
    frame.push('\n');
    Bytes::from(frame)
}

/// Encode a comment frame. Comments are ignored by event-stream consumers,
/// which makes them the vehicle for the open-stream preamble and keep-alives.
pub fn encode_comment(text: &str) -> Bytes {
    Bytes::from(format!(": {}\n\n", text))
}
