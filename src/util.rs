//! Header parsing helpers and the origin-URL digest.

use md5::{Digest, Md5};

/// Derive the cache namespace prefix for an origin URL: a stable 128-bit
/// digest rendered as lowercase hex. Every chunk and the metadata record of
/// one object live under this prefix.
pub fn url_namespace(url: &str) -> String {
    hex::encode(Md5::digest(url.as_bytes()))
}

/// Parse a client `Range` header value into `(start, end)`.
///
/// Only the trailing `<start>-[<end>]` pair is considered, so `bytes=100-`
/// and a bare `100-200` both parse. A missing end is reported as 0, which
/// downstream treats as "to end of object". Values that do not end in such
/// a pair yield `(0, 0)`.
pub fn parse_range(value: &str) -> (u64, u64) {
    let (rest, end_digits) = split_trailing_digits(value);
    let Some(rest) = rest.strip_suffix('-') else {
        return (0, 0);
    };
    let (_, start_digits) = split_trailing_digits(rest);
    if start_digits.is_empty() {
        return (0, 0);
    }
    let start = start_digits.parse().unwrap_or(0);
    let end = if end_digits.is_empty() {
        0
    } else {
        end_digits.parse().unwrap_or(0)
    };
    (start, end)
}

/// Extract the total object length from an upstream `Content-Range` value
/// such as `bytes 0-262143/1000000`. Returns 0 when the value has no
/// `<digits>/<digits>` token, e.g. `bytes */1000000` or a missing header.
pub fn content_range_total(value: &str) -> u64 {
    let bytes = value.as_bytes();
    for (i, b) in bytes.iter().enumerate() {
        if *b != b'/' || i == 0 {
            continue;
        }
        let before = bytes.get(i - 1).copied().unwrap_or(0);
        if !before.is_ascii_digit() {
            continue;
        }
        let tail = value.get(i + 1..).unwrap_or("");
        let digits: &str = match tail.find(|c: char| !c.is_ascii_digit()) {
            Some(stop) => tail.get(..stop).unwrap_or(""),
            None => tail,
        };
        if digits.is_empty() {
            continue;
        }
        return digits.parse().unwrap_or(0);
    }
    0
}

fn split_trailing_digits(s: &str) -> (&str, &str) {
    let bytes = s.as_bytes();
    let mut cut = bytes.len();
    while cut > 0 && bytes[cut - 1].is_ascii_digit() {
        cut -= 1;
    }
    // everything past `cut` is ASCII digits, so it is a char boundary
    s.split_at(cut)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_with_both_ends() {
        assert_eq!(parse_range("bytes=300000-700000"), (300_000, 700_000));
        assert_eq!(parse_range("0-99"), (0, 99));
    }

    #[test]
    fn range_with_open_end() {
        assert_eq!(parse_range("bytes=100-"), (100, 0));
    }

    #[test]
    fn range_garbage() {
        assert_eq!(parse_range(""), (0, 0));
        assert_eq!(parse_range("bytes=-500"), (0, 0));
        assert_eq!(parse_range("units"), (0, 0));
    }

    #[test]
    fn content_range_totals() {
        assert_eq!(content_range_total("bytes 0-262143/1000000"), 1_000_000);
        assert_eq!(content_range_total("bytes */1000000"), 0);
        assert_eq!(content_range_total("opaque"), 0);
    }

    #[test]
    fn namespace_is_stable_hex() {
        let ns = url_namespace("https://example.com/a.bin");
        assert_eq!(ns.len(), 32);
        assert_eq!(ns, url_namespace("https://example.com/a.bin"));
        assert_ne!(ns, url_namespace("https://example.com/b.bin"));
    }
}
