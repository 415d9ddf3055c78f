//! AAD verifier (spec.md §4.7): parses a transaction payload laid out as
//! `pk(16) || cipher_len(u64 BE) || aad_len(u64 BE) || cipher(cipher_len) ||
//! aad(aad_len) || nonce(5)` and checks the embedded `aad` against the
//! caller's authenticated AAD.

use dg_errors::GatewayError;

const PUBLIC_KEY_LEN: usize = 16;
const LEN_FIELD_LEN: usize = 8;
const NONCE_LEN: usize = 5;
const HEADER_LEN: usize = PUBLIC_KEY_LEN + LEN_FIELD_LEN + LEN_FIELD_LEN;
const MIN_PAYLOAD_LEN: usize = HEADER_LEN + NONCE_LEN;

fn too_short() -> GatewayError {
    GatewayError::AuthenticationFailed("Payload data is too short".to_string())
}

/// Returns `Ok(())` if `payload`'s embedded AAD equals `expected_aad`.
pub fn verify_aad(payload: &[u8], expected_aad: &[u8]) -> Result<(), GatewayError> {
    if payload.len() < MIN_PAYLOAD_LEN {
        return Err(too_short());
    }

    let cipher_len = u64::from_be_bytes(
        payload[PUBLIC_KEY_LEN..PUBLIC_KEY_LEN + LEN_FIELD_LEN]
            .try_into()
            .expect("slice is exactly 8 bytes"),
    ) as usize;
    let aad_len = u64::from_be_bytes(
        payload[PUBLIC_KEY_LEN + LEN_FIELD_LEN..HEADER_LEN]
            .try_into()
            .expect("slice is exactly 8 bytes"),
    ) as usize;

    let aad_start = HEADER_LEN
        .checked_add(cipher_len)
        .ok_or_else(too_short)?;
    let aad_end = aad_start.checked_add(aad_len).ok_or_else(too_short)?;
    let required_len = aad_end.checked_add(NONCE_LEN).ok_or_else(too_short)?;

    if payload.len() < required_len {
        return Err(too_short());
    }

    let embedded_aad = &payload[aad_start..aad_end];
    if embedded_aad != expected_aad {
        return Err(GatewayError::FailedAadVerification);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_payload(cipher: &[u8], aad: &[u8]) -> Vec<u8> {
        let mut payload = vec![0u8; PUBLIC_KEY_LEN];
        payload.extend_from_slice(&(cipher.len() as u64).to_be_bytes());
        payload.extend_from_slice(&(aad.len() as u64).to_be_bytes());
        payload.extend_from_slice(cipher);
        payload.extend_from_slice(aad);
        payload.extend_from_slice(&[0u8; NONCE_LEN]);
        payload
    }

    #[test]
    fn matching_aad_verifies() {
        let payload = build_payload(b"ciphertext", b"caller-aad");
        assert!(verify_aad(&payload, b"caller-aad").is_ok());
    }

    #[test]
    fn mismatched_aad_is_rejected() {
        let payload = build_payload(b"ciphertext", b"caller-aad");
        let err = verify_aad(&payload, b"other-aad").unwrap_err();
        assert!(matches!(err, GatewayError::FailedAadVerification));
    }

    #[test]
    fn payload_shorter_than_minimum_is_rejected() {
        let payload = vec![0u8; MIN_PAYLOAD_LEN - 1];
        let err = verify_aad(&payload, b"anything").unwrap_err();
        match err {
            GatewayError::AuthenticationFailed(msg) => assert_eq!(msg, "Payload data is too short"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn truncated_cipher_or_aad_is_rejected_as_too_short() {
        let mut payload = build_payload(b"ciphertext", b"caller-aad");
        payload.truncate(payload.len() - 3);
        assert!(matches!(
            verify_aad(&payload, b"caller-aad"),
            Err(GatewayError::AuthenticationFailed(_))
        ));
    }
}
