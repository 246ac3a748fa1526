/// Signed + encrypted envelope for config pushes.
///
/// - Envelope: bincode (deterministic, compact)
/// - Body: XChaCha20-Poly1305 ciphertext of the store's CBOR push payload,
///   associated data = version ‖ kind ‖ seqno ‖ context
/// - Signing: Ed25519 over BLAKE3(signable_bytes), checked before any
///   decryption is attempted
use serde::{Deserialize, Serialize};
use serde_big_array::BigArray;

use crate::crypto::{self, SymmetricKey};
use crate::limits::{CONFIG_MESSAGE_VERSION, MAX_MESSAGE_BYTES};
use crate::store::{Result, StoreError, StoreKind};

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ConfigMessage {
    pub version: u8,
    pub kind: u8,
    pub seqno: u64,
    pub ciphertext: Vec<u8>,
    #[serde(with = "BigArray")]
    pub signature: [u8; 64],
}

/// Fields covered by the signature, plus the context the message is bound to.
#[derive(Serialize)]
struct Signable<'a> {
    version: u8,
    kind: u8,
    seqno: u64,
    ciphertext: &'a [u8],
    context: &'a [u8],
}

impl ConfigMessage {
    /// Encrypt `payload` under `key` and sign the result with `signer_seed`.
    ///
    /// `context` (a group or user public key) is bound into both the
    /// associated data and the signature.
    pub fn seal(
        kind: StoreKind,
        seqno: u64,
        payload: &[u8],
        key: &SymmetricKey,
        signer_seed: &[u8; 32],
        context: &[u8],
    ) -> Result<Vec<u8>> {
        let ad = associated_data(CONFIG_MESSAGE_VERSION, kind.as_u8(), seqno, context);
        let ciphertext = crypto::encrypt(payload, key, &ad)?;

        let mut msg = ConfigMessage {
            version: CONFIG_MESSAGE_VERSION,
            kind: kind.as_u8(),
            seqno,
            ciphertext,
            signature: [0u8; 64],
        };
        let hash = msg.signable_hash(context)?;
        msg.signature = crypto::sign_data(&hash, signer_seed);

        let bytes =
            bincode::serialize(&msg).map_err(|e| StoreError::BincodeError(e.to_string()))?;
        if bytes.len() > MAX_MESSAGE_BYTES {
            return Err(StoreError::MessageTooLarge {
                size: bytes.len(),
                max: MAX_MESSAGE_BYTES,
            });
        }
        Ok(bytes)
    }

    /// Verify and decrypt a sealed message.
    ///
    /// `try_decrypt(ciphertext, associated_data)` is offered the body and
    /// should return the plaintext from whichever key opens it.
    ///
    /// # Returns
    /// (seqno, payload)
    pub fn open<F>(
        data: &[u8],
        kind: StoreKind,
        verify_key: &[u8; 32],
        context: &[u8],
        try_decrypt: F,
    ) -> Result<(u64, Vec<u8>)>
    where
        F: FnOnce(&[u8], &[u8]) -> Option<Vec<u8>>,
    {
        if data.len() > MAX_MESSAGE_BYTES {
            return Err(StoreError::MessageTooLarge {
                size: data.len(),
                max: MAX_MESSAGE_BYTES,
            });
        }
        let msg: ConfigMessage =
            bincode::deserialize(data).map_err(|e| StoreError::BincodeError(e.to_string()))?;

        if msg.version != CONFIG_MESSAGE_VERSION {
            return Err(StoreError::UnsupportedVersion(msg.version));
        }
        if msg.kind != kind.as_u8() {
            return Err(StoreError::WrongKind {
                expected: kind,
                got: msg.kind,
            });
        }

        let hash = msg.signable_hash(context)?;
        let valid = crypto::verify_signature(&hash, &msg.signature, verify_key)
            .map_err(|_| StoreError::AuthenticationFailed)?;
        if !valid {
            return Err(StoreError::AuthenticationFailed);
        }

        let ad = associated_data(msg.version, msg.kind, msg.seqno, context);
        let payload = try_decrypt(&msg.ciphertext, &ad).ok_or(StoreError::DecryptionFailed)?;
        Ok((msg.seqno, payload))
    }

    fn signable_hash(&self, context: &[u8]) -> Result<[u8; 32]> {
        let signable = Signable {
            version: self.version,
            kind: self.kind,
            seqno: self.seqno,
            ciphertext: &self.ciphertext,
            context,
        };
        let bytes =
            bincode::serialize(&signable).map_err(|e| StoreError::BincodeError(e.to_string()))?;
        Ok(*blake3::hash(&bytes).as_bytes())
    }
}

fn associated_data(version: u8, kind: u8, seqno: u64, context: &[u8]) -> Vec<u8> {
    let mut ad = Vec::with_capacity(10 + context.len());
    ad.push(version);
    ad.push(kind);
    ad.extend_from_slice(&seqno.to_be_bytes());
    ad.extend_from_slice(context);
    ad
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
