//! Raw response parsing and formula decoding for PID reads

use obdlink_core::{DecodeFormula, PidDefinition, ReadingValue};

use super::ReadError;

/// Parse the whitespace-separated hex payload of a response line set
pub(crate) fn parse_hex_bytes(text: &str) -> Result<Vec<u8>, ReadError> {
    let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    hex::decode(&compact).map_err(|e| ReadError::Malformed(format!("hex payload: {e}")))
}

/// Reassemble a multi-frame response into one hex string
///
/// Long CAN responses arrive as a byte-count line followed by indexed
/// segments (`0: 49 02 01 31 ...`). Segments are ordered by index; the
/// byte count, when present, truncates trailing padding. Single-frame
/// responses pass through with lines joined.
pub(crate) fn reassemble(cleaned: &str) -> Result<String, ReadError> {
    let lines: Vec<&str> = cleaned.lines().collect();
    if !lines.iter().any(|l| l.contains(':')) {
        return Ok(lines.join(" "));
    }

    let mut total: Option<usize> = None;
    let mut segments: Vec<(u8, String)> = Vec::new();

    for line in lines {
        match line.split_once(':') {
            Some((index, data)) => {
                let index = u8::from_str_radix(index.trim(), 16)
                    .map_err(|_| ReadError::Malformed(format!("frame index: {line}")))?;
                segments.push((index, data.trim().to_string()));
            }
            None => {
                let count = usize::from_str_radix(line.trim(), 16)
                    .map_err(|_| ReadError::Malformed(format!("frame count: {line}")))?;
                total = Some(count);
            }
        }
    }

    segments.sort_by_key(|(index, _)| *index);
    let joined = segments
        .into_iter()
        .map(|(_, data)| data)
        .collect::<Vec<_>>()
        .join(" ");

    match total {
        Some(count) => {
            let mut bytes = parse_hex_bytes(&joined)?;
            if bytes.len() < count {
                return Err(ReadError::Malformed(format!(
                    "multi-frame response short: expected {count} bytes, got {}",
                    bytes.len()
                )));
            }
            bytes.truncate(count);
            Ok(hex::encode(bytes))
        }
        None => Ok(joined),
    }
}

/// Strip the positive-response echo and decode the payload
///
/// A request `010C` answers `41 0C <data>`: mode plus 0x40, then the
/// request's remaining bytes echoed back.
pub(crate) fn decode_response(
    definition: &PidDefinition,
    response: &str,
) -> Result<ReadingValue, ReadError> {
    let request = hex::decode(&definition.id)
        .map_err(|e| ReadError::Malformed(format!("pid id '{}': {e}", definition.id)))?;
    if request.is_empty() {
        return Err(ReadError::Malformed(format!(
            "empty pid id '{}'",
            definition.id
        )));
    }

    let bytes = parse_hex_bytes(&reassemble(response)?)?;

    let mut expected = request.clone();
    expected[0] = expected[0].wrapping_add(0x40);
    if bytes.len() < expected.len() || bytes[..expected.len()] != expected[..] {
        return Err(ReadError::Malformed(format!(
            "unexpected echo for {}: {}",
            definition.id,
            hex::encode(&bytes)
        )));
    }

    let data = &bytes[expected.len()..];
    if data.len() < definition.byte_length {
        return Err(ReadError::Truncated {
            pid: definition.id.clone(),
            expected: definition.byte_length,
            got: data.len(),
        });
    }
    let data = &data[..definition.byte_length];

    decode_payload(&definition.formula, data)
}

fn decode_payload(formula: &DecodeFormula, data: &[u8]) -> Result<ReadingValue, ReadError> {
    if data.len() > 4 {
        return Err(ReadError::Decode(format!(
            "payload too wide to decode: {} bytes",
            data.len()
        )));
    }
    let raw = data.iter().fold(0u32, |acc, &b| (acc << 8) | b as u32);

    match formula {
        DecodeFormula::Linear { scale, offset } => {
            Ok(ReadingValue::Numeric(raw as f64 * scale + offset))
        }
        DecodeFormula::SignedLinear { scale, offset } => {
            let width = data.len() as u32 * 8;
            let signed = (raw as i64) << (64 - width) >> (64 - width);
            Ok(ReadingValue::Numeric(signed as f64 * scale + offset))
        }
        DecodeFormula::BitField => Ok(ReadingValue::Bits(raw)),
        DecodeFormula::Lookup { table } => {
            let key = data
                .first()
                .ok_or_else(|| ReadError::Decode("empty payload for lookup".to_string()))?;
            table
                .get(key)
                .map(|label| ReadingValue::Text(label.clone()))
                .ok_or_else(|| ReadError::Decode(format!("no label for value {key:#04x}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn definition(id: &str, byte_length: usize, formula: DecodeFormula) -> PidDefinition {
        PidDefinition {
            id: id.to_string(),
            name: id.to_string(),
            unit: None,
            byte_length,
            formula,
            category: None,
            thresholds: None,
        }
    }

    #[test]
    fn test_rpm_decodes_to_quarter_revolutions() {
        let def = definition(
            "010C",
            2,
            DecodeFormula::Linear {
                scale: 0.25,
                offset: 0.0,
            },
        );
        let value = decode_response(&def, "41 0C 1A F8").unwrap();
        assert_eq!(value, ReadingValue::Numeric(1726.0));
    }

    #[test]
    fn test_coolant_temperature_offset() {
        let def = definition(
            "0105",
            1,
            DecodeFormula::Linear {
                scale: 1.0,
                offset: -40.0,
            },
        );
        let value = decode_response(&def, "41 05 7B").unwrap();
        assert_eq!(value, ReadingValue::Numeric(83.0));
    }

    #[test]
    fn test_signed_decode() {
        let def = definition(
            "0106",
            1,
            DecodeFormula::SignedLinear {
                scale: 100.0 / 128.0,
                offset: 0.0,
            },
        );
        // 0xFF is -1 as i8
        let value = decode_response(&def, "41 06 FF").unwrap();
        match value {
            ReadingValue::Numeric(v) => assert!((v + 100.0 / 128.0).abs() < 1e-9),
            other => panic!("expected numeric, got {other:?}"),
        }
    }

    #[test]
    fn test_bitfield_decode() {
        let def = definition("0100", 4, DecodeFormula::BitField);
        let value = decode_response(&def, "41 00 BE 3E B8 11").unwrap();
        assert_eq!(value, ReadingValue::Bits(0xBE3E_B811));
    }

    #[test]
    fn test_lookup_decode() {
        let mut table = HashMap::new();
        table.insert(0x01u8, "Open loop".to_string());
        table.insert(0x02u8, "Closed loop".to_string());
        let def = definition("0103", 1, DecodeFormula::Lookup { table });

        let value = decode_response(&def, "41 03 02").unwrap();
        assert_eq!(value, ReadingValue::Text("Closed loop".to_string()));
    }

    #[test]
    fn test_zero_length_lookup_is_an_error_not_a_panic() {
        let def = definition(
            "0103",
            0,
            DecodeFormula::Lookup {
                table: HashMap::new(),
            },
        );
        let err = decode_response(&def, "41 03").unwrap_err();
        assert!(matches!(err, ReadError::Decode(_)));
    }

    #[test]
    fn test_truncated_payload_rejected() {
        let def = definition(
            "010C",
            2,
            DecodeFormula::Linear {
                scale: 0.25,
                offset: 0.0,
            },
        );
        let err = decode_response(&def, "41 0C 1A").unwrap_err();
        assert!(matches!(err, ReadError::Truncated { got: 1, .. }));
    }

    #[test]
    fn test_wrong_echo_rejected() {
        let def = definition(
            "010C",
            2,
            DecodeFormula::Linear {
                scale: 0.25,
                offset: 0.0,
            },
        );
        let err = decode_response(&def, "41 0D 1A F8").unwrap_err();
        assert!(matches!(err, ReadError::Malformed(_)));
    }

    #[test]
    fn test_multiframe_reassembly() {
        // Byte-count header plus two indexed segments, with padding past
        // the advertised length
        let text = "009\n0: 49 02 01 31 41 32\n1: 33 34 35 AA AA AA";
        let joined = reassemble(text).unwrap();
        let bytes = parse_hex_bytes(&joined).unwrap();
        assert_eq!(bytes.len(), 9);
        assert_eq!(bytes[0], 0x49);
        assert_eq!(bytes[8], 0x35);
    }
}
