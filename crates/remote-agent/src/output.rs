use protocol::defaults::TRUNCATION_MARKER;

/// Turns captured bytes into result text.
///
/// `bytes` is already cut to the ceiling. When `truncated` is set, a character
/// split by the cut is dropped and the marker is appended after the ceiling.
/// Untruncated output is decoded as is.
pub(crate) fn render_output(bytes: &[u8], truncated: bool) -> String {
    if !truncated {
        return String::from_utf8_lossy(bytes).into_owned();
    }
    let end = match std::str::from_utf8(bytes) {
        Err(err) if err.error_len().is_none() => err.valid_up_to(),
        _ => bytes.len(),
    };
    let mut text = String::from_utf8_lossy(&bytes[..end]).into_owned();
    text.push_str(TRUNCATION_MARKER);
    text
}

/// Splits `bytes` at `ceiling`, reporting whether anything was cut.
pub(crate) fn bound(mut bytes: Vec<u8>, ceiling: usize) -> (Vec<u8>, bool) {
    if bytes.len() > ceiling {
        bytes.truncate(ceiling);
        (bytes, true)
    } else {
        (bytes, false)
    }
}
