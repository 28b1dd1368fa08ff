/// Byte budget for any message stored in the builder output, including the
/// three-byte `...` truncation marker.
pub const MAX_MESSAGE_BYTES: usize = 3000;

const MARKER: &str = "...";

/// Trim whitespace and keep the last bytes of `message` that fit the budget.
///
/// The cut never splits a UTF-8 sequence, so the result may be a few bytes
/// shorter than [`MAX_MESSAGE_BYTES`].
pub fn keep_tail(message: &str) -> String {
    let message = message.trim();
    if message.len() <= MAX_MESSAGE_BYTES {
        return message.to_owned();
    }
    let mut start = message.len() - (MAX_MESSAGE_BYTES - MARKER.len());
    while !message.is_char_boundary(start) {
        start += 1;
    }
    format!("{MARKER}{}", &message[start..])
}

/// Trim whitespace and keep the first bytes of `message` that fit the budget.
pub fn keep_head(message: &str) -> String {
    let message = message.trim();
    if message.len() <= MAX_MESSAGE_BYTES {
        return message.to_owned();
    }
    let mut end = MAX_MESSAGE_BYTES - MARKER.len();
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}{MARKER}", &message[..end])
}
