//! Personal-sign (`eth_sign`) signer recovery.

use alloy::primitives::{eip191_hash_message, hex, PrimitiveSignature, B256, U256};
use eyre::{eyre, Result};

use crate::types::lower_hex;

/// Hash a wallet signs for `message` under the personal-sign scheme:
/// `keccak256("\x19Ethereum Signed Message:\n" + len(message) + message)`.
pub fn personal_message_hash(message: &str) -> B256 {
    eip191_hash_message(message.as_bytes())
}

/// Recovers the lowercase `0x` address that signed `message`.
///
/// `signature` is the 65-byte `r || s || v` hex string with `v` in {27, 28}.
///
/// # Errors
/// Returns error if the signature is not 65 bytes of hex, if `v` is out of
/// range, or if no public key can be recovered.
pub fn recover_signer(message: &str, signature: &str) -> Result<String> {
    let raw = hex::decode(signature).map_err(|e| eyre!("signature is not hex: {e}"))?;
    if raw.len() != 65 {
        return Err(eyre!("signature must be 65 bytes, got {}", raw.len()));
    }
    let y_parity = match raw[64] {
        27 => false,
        28 => true,
        v => return Err(eyre!("signature recovery id must be 27 or 28, got {v}")),
    };

    let r = U256::from_be_slice(&raw[..32]);
    let s = U256::from_be_slice(&raw[32..64]);
    let sig = PrimitiveSignature::new(r, s, y_parity);

    let signer = sig
        .recover_address_from_prehash(&personal_message_hash(message))
        .map_err(|e| eyre!("signature recovery failed: {e}"))?;
    Ok(lower_hex(&signer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::signers::local::PrivateKeySigner;
    use alloy::signers::SignerSync;

    fn sign(signer: &PrivateKeySigner, message: &str) -> String {
        let sig = signer
            .sign_message_sync(message.as_bytes())
            .expect("local signing cannot fail");
        let mut raw = [0u8; 65];
        raw[..32].copy_from_slice(&sig.r().to_be_bytes::<32>());
        raw[32..64].copy_from_slice(&sig.s().to_be_bytes::<32>());
        raw[64] = 27 + sig.v() as u8;
        hex::encode_prefixed(raw)
    }

    #[test]
    fn recovers_the_signing_wallet() {
        let signer = PrivateKeySigner::random();
        let message = "0x38d7ea4c680000x0a{\"meta\":\"ipfs://x\"}00x1a2b3c0x64";

        let recovered = recover_signer(message, &sign(&signer, message)).expect("valid signature");
        assert_eq!(recovered, lower_hex(&signer.address()));
    }

    #[test]
    fn resigning_reproduces_the_signature() {
        let signer = PrivateKeySigner::random();
        let message = "1000000000000000000x3e8abc00x00000000000000000000000000000000000000010x10";
        let first = sign(&signer, message);

        recover_signer(message, &first).expect("valid signature");
        // RFC 6979 nonces make personal-sign deterministic
        assert_eq!(sign(&signer, message), first);
    }

    #[test]
    fn tampered_message_recovers_someone_else() {
        let signer = PrivateKeySigner::random();
        let sig = sign(&signer, "price=1");

        let recovered = recover_signer("price=2", &sig).expect("still a valid curve point");
        assert_ne!(recovered, lower_hex(&signer.address()));
    }

    #[test]
    fn rejects_bad_recovery_id_and_length() {
        let signer = PrivateKeySigner::random();
        let mut sig = sign(&signer, "m");
        sig.replace_range(sig.len() - 2.., "01");
        assert!(recover_signer("m", &sig).is_err());

        assert!(recover_signer("m", "0x1234").is_err());
        assert!(recover_signer("m", "not hex").is_err());
    }
}
