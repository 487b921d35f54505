use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use serde::Deserialize;

use crate::error::InferenceError;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Payload {
    image_data: Option<String>,
    error: Option<String>,
}

/// Decodes the image carried by the generation script's stdout.
///
/// The script prints one JSON object, `{"imageData": "<base64>"}`. Libraries
/// it loads sometimes write progress lines first, so when the whole output is
/// not a payload the last non-empty line is tried.
pub fn parse_payload(stdout: &[u8]) -> Result<Bytes, InferenceError> {
    let text = std::str::from_utf8(stdout)
        .map_err(|_| InferenceError::MalformedOutput("stdout is not valid UTF-8".into()))?
        .trim();
    if text.is_empty() {
        return Err(InferenceError::MalformedOutput("stdout was empty".into()));
    }

    let payload = match serde_json::from_str::<Payload>(text) {
        Ok(payload) => payload,
        Err(whole) => {
            let last_line = text.lines().rev().map(str::trim).find(|line| !line.is_empty());
            match last_line.map(serde_json::from_str::<Payload>) {
                Some(Ok(payload)) => payload,
                _ => {
                    return Err(InferenceError::MalformedOutput(format!(
                        "stdout is not a JSON payload: {whole}"
                    )))
                }
            }
        }
    };

    let encoded = match (payload.image_data, payload.error) {
        (Some(encoded), _) => encoded,
        (None, Some(error)) => {
            return Err(InferenceError::MalformedOutput(format!(
                "payload reported an error instead of an image: {error}"
            )))
        }
        (None, None) => {
            return Err(InferenceError::MalformedOutput(
                "payload has no imageData field".into(),
            ))
        }
    };

    let image = STANDARD
        .decode(encoded.trim())
        .map_err(|err| InferenceError::MalformedOutput(format!("imageData is not base64: {err}")))?;
    if image.is_empty() {
        return Err(InferenceError::MalformedOutput("imageData is empty".into()));
    }
    Ok(Bytes::from(image))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_single_object() {
        let image = parse_payload(br#"{"imageData":"aGVsbG8="}"#).unwrap();
        assert_eq!(image, Bytes::from_static(b"hello"));
    }

    #[test]
    fn tolerates_log_lines_before_payload() {
        let stdout = b"Loading pipeline components...\n100%|#####|\n{\"imageData\": \"aGk=\"}\n";
        assert_eq!(parse_payload(stdout).unwrap(), Bytes::from_static(b"hi"));
    }

    #[test]
    fn rejects_unusable_output() {
        let cases: [&[u8]; 6] = [
            b"",
            b"not json at all",
            br#"{"images":[]}"#,
            br#"{"imageData":"***"}"#,
            br#"{"imageData":""}"#,
            &[0xff, 0xfe, 0x00],
        ];
        for stdout in cases {
            assert!(
                matches!(parse_payload(stdout), Err(InferenceError::MalformedOutput(_))),
                "{stdout:?} should be malformed"
            );
        }
    }

    #[test]
    fn surfaces_script_error_text() {
        let err = parse_payload(br#"{"error":"CUDA out of memory"}"#).unwrap_err();
        assert!(err.to_string().contains("CUDA out of memory"));
    }
}
