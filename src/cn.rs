use data_encoding::BASE32;

use crate::error::DecodeError;

/// Decodes an OpenVPN common name from base32 into its display form.
///
/// The kernel's certificate tooling strips `=` padding from common names, so
/// `cn` is re-padded to a multiple of 8 bytes before decoding. Decode
/// failures are the caller's to downgrade (spec.md §4.8, §7: `DecodeError` is
/// never surfaced past logging) — this function returns `Result` so callers
/// can choose how to log it rather than silently swallowing here.
pub fn decode(cn: &str) -> Result<String, DecodeError> {
    let padded = pad(cn);
    let bytes = BASE32
        .decode(padded.as_bytes())
        .map_err(|_| DecodeError { cn: cn.to_string() })?;
    String::from_utf8(bytes).map_err(|_| DecodeError { cn: cn.to_string() })
}

/// Falls back to the raw common name when decoding fails, logging a warning.
/// This is the form every call site outside of tests should use.
pub fn display_name(cn: &str) -> String {
    match decode(cn) {
        Ok(name) => name,
        Err(err) => {
            tracing::warn!("failed to decode common name {:?}: {}", cn, err);
            cn.to_string()
        }
    }
}

fn pad(cn: &str) -> String {
    let remainder = cn.len() % 8;
    if remainder == 0 {
        cn.to_string()
    } else {
        let mut padded = cn.to_string();
        padded.extend(std::iter::repeat('=').take(8 - remainder));
        padded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pads_to_multiple_of_eight() {
        assert_eq!(pad("MFRGG"), "MFRGG===");
        assert_eq!(pad("MFRGGZA"), "MFRGGZA=");
        assert_eq!(pad("MFRGGZDF"), "MFRGGZDF");
    }

    #[test]
    fn decodes_known_value() {
        // "hello" base32-encoded without padding.
        assert_eq!(decode("NBSWY3DP").unwrap(), "hello");
    }

    #[test]
    fn falls_back_to_raw_cn_on_bad_input() {
        assert_eq!(display_name("not-valid-base32!!"), "not-valid-base32!!");
    }
}
