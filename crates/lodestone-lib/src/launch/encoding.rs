//! Decoding of game output whose charset depends on the host locale.

use chardetng::EncodingDetector;
use encoding_rs::Encoding;

/// Best guess at the charset of `bytes`. UTF-8 wins whenever it is valid.
pub fn guess_encoding(bytes: &[u8]) -> &'static Encoding {
    if std::str::from_utf8(bytes).is_ok() {
        return encoding_rs::UTF_8;
    }
    let mut detector = EncodingDetector::new();
    detector.feed(bytes, true);
    detector.guess(None, true)
}

/// Decode one line of process output. Never fails; undecodable bytes are
/// replaced.
pub fn decode_output(bytes: &[u8]) -> String {
    if let Ok(text) = std::str::from_utf8(bytes) {
        return text.to_string();
    }
    let (text, _, _) = guess_encoding(bytes).decode(bytes);
    text.into_owned()
}
