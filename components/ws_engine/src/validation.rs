//! Pure validation rules for close codes, UTF-8 payloads and blob values

/// Inputs at least this long are checked by the standard library validator
const FAST_PATH_THRESHOLD: usize = 24;

/// Check whether a close status code may appear on the wire
///
/// Legal codes are 1000-1003, 1007-1014 and the 3000-4999 range reserved for
/// libraries, frameworks and applications. 1004, 1005 and 1006 are reserved
/// and must never be sent.
pub fn is_valid_status_code(code: u16) -> bool {
    matches!(code, 1000..=1003 | 1007..=1014 | 3000..=4999)
}

/// Check that `buf` is well-formed UTF-8
pub fn is_valid_utf8(buf: &[u8]) -> bool {
    if buf.len() >= FAST_PATH_THRESHOLD {
        return std::str::from_utf8(buf).is_ok();
    }
    is_valid_utf8_manual(buf)
}

/// Byte-by-byte UTF-8 validation
///
/// Rejects overlong forms, lone continuation bytes, truncated sequences,
/// UTF-16 surrogates (U+D800..U+DFFF) and code points past U+10FFFF.
pub fn is_valid_utf8_manual(buf: &[u8]) -> bool {
    let len = buf.len();
    let mut i = 0;

    while i < len {
        let b0 = buf[i];
        if b0 & 0x80 == 0 {
            // 0xxxxxxx
            i += 1;
        } else if b0 & 0xe0 == 0xc0 {
            // 110xxxxx 10xxxxxx
            if i + 1 == len || buf[i + 1] & 0xc0 != 0x80 || b0 & 0xfe == 0xc0 {
                return false;
            }
            i += 2;
        } else if b0 & 0xf0 == 0xe0 {
            // 1110xxxx 10xxxxxx 10xxxxxx
            if i + 2 >= len
                || buf[i + 1] & 0xc0 != 0x80
                || buf[i + 2] & 0xc0 != 0x80
                || (b0 == 0xe0 && buf[i + 1] & 0xe0 == 0x80)
                || (b0 == 0xed && buf[i + 1] & 0xe0 == 0xa0)
            {
                return false;
            }
            i += 3;
        } else if b0 & 0xf8 == 0xf0 {
            // 11110xxx 10xxxxxx 10xxxxxx 10xxxxxx
            if i + 3 >= len
                || buf[i + 1] & 0xc0 != 0x80
                || buf[i + 2] & 0xc0 != 0x80
                || buf[i + 3] & 0xc0 != 0x80
                || (b0 == 0xf0 && buf[i + 1] & 0xf0 == 0x80)
                || (b0 == 0xf4 && buf[i + 1] > 0x8f)
                || b0 > 0xf4
            {
                return false;
            }
            i += 4;
        } else {
            return false;
        }
    }

    true
}

/// Structural view of an opaque host value
///
/// Implemented by anything that can answer which members it exposes, so that
/// blob detection works on shape rather than on a concrete type.
pub trait ObjectShape {
    /// Whether the value exposes a callable member named `name`
    fn has_method(&self, name: &str) -> bool;

    /// Whether the value exposes a data member named `name`
    fn has_property(&self, name: &str) -> bool;

    /// The value's type tag, if it has one
    fn to_string_tag(&self) -> Option<&str>;
}

/// Check whether a value looks like a `Blob` or `File`
///
/// Requires an `arrayBuffer` method, a `type` property, a `stream` method
/// and a type tag of `Blob` or `File`.
pub fn is_blob<T: ObjectShape + ?Sized>(value: &T) -> bool {
    value.has_method("arrayBuffer")
        && value.has_property("type")
        && value.has_method("stream")
        && matches!(value.to_string_tag(), Some("Blob") | Some("File"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_code_table() {
        for code in 0..=u16::MAX {
            let expected = (1000..=1003).contains(&code)
                || (1007..=1014).contains(&code)
                || (3000..=4999).contains(&code);
            assert_eq!(is_valid_status_code(code), expected, "code {}", code);
        }
        assert!(!is_valid_status_code(1004));
        assert!(!is_valid_status_code(1005));
        assert!(!is_valid_status_code(1006));
        assert!(!is_valid_status_code(1015));
        assert!(!is_valid_status_code(2999));
        assert!(!is_valid_status_code(5000));
    }

    #[test]
    fn test_valid_utf8() {
        let samples: &[&[u8]] = &[
            b"",
            b"ascii only",
            "é".as_bytes(),
            "\u{0800}".as_bytes(),
            "\u{ffff}".as_bytes(),
            "\u{10000}".as_bytes(),
            "\u{10ffff}".as_bytes(),
            "κόσμε".as_bytes(),
            "mixed ascii, ü, 中文 and 🎉 emoji".as_bytes(),
        ];
        for sample in samples {
            assert!(is_valid_utf8(sample), "{:x?}", sample);
            assert!(is_valid_utf8_manual(sample), "{:x?}", sample);
        }
    }

    #[test]
    fn test_invalid_utf8() {
        let samples: &[&[u8]] = &[
            &[0x80],                   // lone continuation
            &[0xbf],                   // lone continuation
            &[0xc0, 0xaf],             // overlong '/'
            &[0xc1, 0xbf],             // overlong
            &[0xe0, 0x80, 0xaf],       // overlong 3-byte
            &[0xf0, 0x80, 0x80, 0xaf], // overlong 4-byte
            &[0xed, 0xa0, 0x80],       // U+D800
            &[0xed, 0xbf, 0xbf],       // U+DFFF
            &[0xf4, 0x90, 0x80, 0x80], // U+110000
            &[0xf5, 0x80, 0x80, 0x80], // beyond range
            &[0xff],
            &[0xc3],             // truncated 2-byte
            &[0xe2, 0x82],       // truncated 3-byte
            &[0xf0, 0x9f, 0x8e], // truncated 4-byte
            &[0xce, 0xba, 0xe1, 0xbd, 0xb9, 0xcf, 0x83, 0xce, 0xbc, 0xce, 0xb5, 0xed, 0xa0, 0x80],
        ];
        for sample in samples {
            assert!(!is_valid_utf8(sample), "{:x?}", sample);
            assert!(!is_valid_utf8_manual(sample), "{:x?}", sample);
        }
    }

    #[test]
    fn test_fast_path_agrees_with_manual() {
        let mut long = "a".repeat(40).into_bytes();
        assert_eq!(is_valid_utf8(&long), is_valid_utf8_manual(&long));

        long.extend_from_slice(&[0xed, 0xa0, 0x80]);
        assert!(!is_valid_utf8(&long));
        assert!(!is_valid_utf8_manual(&long));

        // every two-byte prefix followed by a continuation byte
        for first in 0u8..=0xff {
            for second in [0x80u8, 0x9f, 0xa0, 0xbf] {
                let sample = [first, second, 0x80, 0x80];
                assert_eq!(
                    std::str::from_utf8(&sample).is_ok(),
                    is_valid_utf8_manual(&sample),
                    "{:x?}",
                    sample
                );
            }
        }
    }

    struct Shape {
        tag: &'static str,
        methods: &'static [&'static str],
        properties: &'static [&'static str],
    }

    impl ObjectShape for Shape {
        fn has_method(&self, name: &str) -> bool {
            self.methods.contains(&name)
        }

        fn has_property(&self, name: &str) -> bool {
            self.properties.contains(&name)
        }

        fn to_string_tag(&self) -> Option<&str> {
            Some(self.tag)
        }
    }

    #[test]
    fn test_is_blob() {
        let file = Shape {
            tag: "File",
            methods: &["arrayBuffer", "stream"],
            properties: &["type"],
        };
        assert!(is_blob(&file));

        let wrong_tag = Shape {
            tag: "ArrayBuffer",
            methods: &["arrayBuffer", "stream"],
            properties: &["type"],
        };
        assert!(!is_blob(&wrong_tag));

        let no_stream = Shape {
            tag: "Blob",
            methods: &["arrayBuffer"],
            properties: &["type"],
        };
        assert!(!is_blob(&no_stream));

        let no_type = Shape {
            tag: "Blob",
            methods: &["arrayBuffer", "stream"],
            properties: &[],
        };
        assert!(!is_blob(&no_type));
    }
}
