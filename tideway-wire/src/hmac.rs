use hmac::{Hmac, Mac};
use sha1::Sha1;

pub const MAC_LEN: usize = 20;

/// HMAC-SHA1 with chaining: each MAC is taken over the previous MAC
/// followed by the new material, so a stream of frames authenticates
/// its own ordering. Until a session key is negotiated both sides run
/// the chain under the all-zero key.
#[derive(Clone)]
pub struct ChainedHmac {
    key: [u8; MAC_LEN],
    chain: [u8; MAC_LEN],
}

impl ChainedHmac {
    pub fn new() -> Self {
        ChainedHmac {
            key: [0; MAC_LEN],
            chain: [0; MAC_LEN],
        }
    }

    /// Install a negotiated session key. The chain value carries over:
    /// the first frame under the new key is still bound to the last
    /// frame under the old one.
    pub fn set_key(&mut self, key: &[u8; MAC_LEN]) {
        self.key = *key;
    }

    pub fn process(&mut self, data: &[u8]) -> [u8; MAC_LEN] {
        let mut mac =
            Hmac::<Sha1>::new_from_slice(&self.key).expect("hmac accepts any key length");
        mac.update(&self.chain);
        mac.update(data);
        self.chain = mac.finalize().into_bytes().into();
        self.chain
    }
}

impl Default for ChainedHmac {
    fn default() -> Self {
        ChainedHmac::new()
    }
}
