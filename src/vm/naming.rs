//! Random, collision-checked VM names

use crate::error::PxeError;
use rand::Rng;
use tracing::debug;

const SUFFIX_CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
pub const SUFFIX_LEN: usize = 3;

/// Draws `{prefix}{suffix}` names until one is free.
///
/// Uniqueness is only checked against the namespace at probe time; another
/// actor may still take the name before the VM is created.
pub struct NameAllocator<R> {
    rng: R,
    max_attempts: u32,
}

impl<R: Rng> NameAllocator<R> {
    pub fn new(rng: R, max_attempts: u32) -> Self {
        Self { rng, max_attempts }
    }

    pub fn suffix(&mut self) -> String {
        (0..SUFFIX_LEN)
            .map(|_| SUFFIX_CHARS[self.rng.gen_range(0..SUFFIX_CHARS.len())] as char)
            .collect()
    }

    /// Return the first candidate for which `exists` reports false
    pub fn allocate<F>(&mut self, prefix: &str, mut exists: F) -> Result<String, PxeError>
    where
        F: FnMut(&str) -> anyhow::Result<bool>,
    {
        for attempt in 1..=self.max_attempts {
            let candidate = format!("{prefix}{}", self.suffix());
            let taken = exists(&candidate).map_err(|e| PxeError::probe(&candidate, e))?;
            if !taken {
                debug!(name = %candidate, attempt, "allocated VM name");
                return Ok(candidate);
            }
            debug!(name = %candidate, attempt, "VM name already taken");
        }
        Err(PxeError::NameExhausted {
            prefix: prefix.to_string(),
            attempts: self.max_attempts,
        })
    }
}
