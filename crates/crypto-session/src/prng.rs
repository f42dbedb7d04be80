//! Random number generation capability

use rand::RngCore;
use rand::rngs::OsRng;

/// Cryptographically secure random source
pub trait Prng: Send + Sync {
    fn fill_bytes(&self, dest: &mut [u8]);

    fn data(&self, length: usize) -> Vec<u8> {
        let mut data = vec![0u8; length];
        self.fill_bytes(&mut data);
        data
    }
}

/// Operating system PRNG
#[derive(Debug, Clone, Copy, Default)]
pub struct OsPrng;

impl Prng for OsPrng {
    fn fill_bytes(&self, dest: &mut [u8]) {
        OsRng.fill_bytes(dest);
    }
}
