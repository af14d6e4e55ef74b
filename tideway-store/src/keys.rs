use crate::payload::PubKey;
use crate::traits::KeyStore;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use std::path::Path;
use tideway_base::{err, Result};

// Session keys travel sealed to the server's public key: an ephemeral
// keypair does x25519 with the montgomery form of the server's ed25519
// key, the shared point is kneaded into an AEAD key, and the ephemeral
// public key rides in front of the ciphertext. One-shot key, so a
// fixed nonce.
const SEAL_CONTEXT: &str = "tideway v1 session key seal";
const PUB_LEN: usize = 32;

/// The reference keystore: one optional ed25519 identity. Servers must
/// have one; clients without one can still connect anonymously.
#[derive(Clone)]
pub struct SealedKeys {
    identity: Option<(String, SigningKey)>,
}

impl SealedKeys {
    pub fn anonymous() -> SealedKeys {
        SealedKeys { identity: None }
    }

    pub fn generate(name: &str) -> SealedKeys {
        let signing = SigningKey::generate(&mut rand::rngs::OsRng);
        SealedKeys {
            identity: Some((name.to_string(), signing)),
        }
    }

    pub fn from_seed(name: &str, seed: [u8; 32]) -> SealedKeys {
        SealedKeys {
            identity: Some((name.to_string(), SigningKey::from_bytes(&seed))),
        }
    }

    pub fn load(path: &Path) -> Result<SealedKeys> {
        let bytes = std::fs::read(path)?;
        let (name, seed): (String, [u8; 32]) = rmp_serde::from_slice(&bytes)?;
        Ok(SealedKeys::from_seed(&name, seed))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let (name, signing) = self.signing()?;
        let bytes = rmp_serde::to_vec(&(name, signing.to_bytes()))?;
        std::fs::write(path, bytes)?;
        Ok(())
    }

    fn signing(&self) -> Result<(&str, &SigningKey)> {
        self.identity
            .as_ref()
            .map(|(n, k)| (n.as_str(), k))
            .ok_or_else(|| err("no local signing identity configured"))
    }
}

fn parse_pub(bytes: &[u8]) -> Result<VerifyingKey> {
    let arr: [u8; PUB_LEN] = bytes
        .try_into()
        .map_err(|_| err("public key has the wrong length"))?;
    Ok(VerifyingKey::from_bytes(&arr)?)
}

fn derive_seal_key(eph_pub: &VerifyingKey, shared: &[u8; 32]) -> chacha20poly1305::Key {
    let mut h = blake3::Hasher::new_derive_key(SEAL_CONTEXT);
    h.update(eph_pub.as_bytes());
    h.update(shared);
    let digest = h.finalize();
    *Key::from_slice(digest.as_bytes())
}

impl KeyStore for SealedKeys {
    fn local_name(&self) -> Option<&str> {
        self.identity.as_ref().map(|(n, _)| n.as_str())
    }

    fn local_pub(&self) -> Option<PubKey> {
        self.identity.as_ref().map(|(n, k)| PubKey {
            name: n.clone(),
            key: k.verifying_key().to_bytes().to_vec(),
        })
    }

    fn sign(&self, msg: &[u8]) -> Result<Vec<u8>> {
        let (_, signing) = self.signing()?;
        Ok(signing.sign(msg).to_bytes().to_vec())
    }

    fn verify(&self, pubkey: &[u8], msg: &[u8], sig: &[u8]) -> bool {
        let Ok(vk) = parse_pub(pubkey) else {
            return false;
        };
        let Ok(sig) = Signature::from_slice(sig) else {
            return false;
        };
        vk.verify(msg, &sig).is_ok()
    }

    fn encrypt_session_key(&self, server_pub: &[u8], key: &[u8; 20]) -> Result<Vec<u8>> {
        let server = parse_pub(server_pub)?;
        let eph = SigningKey::generate(&mut rand::rngs::OsRng);
        let shared = (server.to_montgomery() * eph.to_scalar()).to_bytes();
        let cipher = ChaCha20Poly1305::new(&derive_seal_key(&eph.verifying_key(), &shared));
        let ct = cipher
            .encrypt(Nonce::from_slice(&[0u8; 12]), key.as_slice())
            .map_err(|_| err("session key seal failed"))?;
        let mut blob = eph.verifying_key().to_bytes().to_vec();
        blob.extend_from_slice(&ct);
        Ok(blob)
    }

    fn decrypt_session_key(&self, blob: &[u8]) -> Result<Vec<u8>> {
        let (_, signing) = self.signing()?;
        if blob.len() <= PUB_LEN {
            return Err(err("sealed session key is too short"));
        }
        let eph = parse_pub(&blob[..PUB_LEN])?;
        let shared = (eph.to_montgomery() * signing.to_scalar()).to_bytes();
        let cipher = ChaCha20Poly1305::new(&derive_seal_key(&eph, &shared));
        cipher
            .decrypt(Nonce::from_slice(&[0u8; 12]), &blob[PUB_LEN..])
            .map_err(|_| err("sealed session key failed to open"))
    }
}
