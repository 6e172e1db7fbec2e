//! In-memory register source.
//!
//! Holds a plain `register → value` table behind a mutex.  Tests (and the
//! demo binary) poke values in with [`MemoryRegisterSource::set`] to play
//! the part of the hardware, and can make the source fail or ignore writes
//! to exercise the error paths of the Device.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::debug;

use crate::application::ports::{RegisterError, RegisterSource};

#[derive(Default)]
pub struct MemoryRegisterSource {
    values: Mutex<HashMap<u16, i64>>,
    /// Registers that accept writes but keep their old value.
    frozen: Mutex<HashSet<u16>>,
    failing: AtomicBool,
}

impl MemoryRegisterSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Source pre-filled with `values`.
    pub fn with_values(values: impl IntoIterator<Item = (u16, i64)>) -> Self {
        let source = Self::new();
        source.lock_values().extend(values);
        source
    }

    pub fn set(&self, register: u16, value: i64) {
        self.lock_values().insert(register, value);
    }

    pub fn get(&self, register: u16) -> Option<i64> {
        self.lock_values().get(&register).copied()
    }

    /// While `true`, every read and write fails with
    /// [`RegisterError::Unavailable`].
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Writes to `register` are acknowledged but not applied.
    pub fn freeze(&self, register: u16) {
        self.frozen
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(register);
    }

    fn lock_values(&self) -> MutexGuard<'_, HashMap<u16, i64>> {
        self.values.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn check_available(&self) -> Result<(), RegisterError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(RegisterError::Unavailable("memory source set to fail".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl RegisterSource for MemoryRegisterSource {
    async fn read(
        &self,
        _node_id: u8,
        start: u16,
        count: u16,
    ) -> Result<HashMap<u16, i64>, RegisterError> {
        self.check_available()?;
        let end = u32::from(start) + u32::from(count);
        Ok(self
            .lock_values()
            .iter()
            .filter(|(id, _)| (u32::from(start)..end).contains(&u32::from(**id)))
            .map(|(&id, &value)| (id, value))
            .collect())
    }

    async fn write(&self, _node_id: u8, register: u16, value: i64) -> Result<(), RegisterError> {
        self.check_available()?;
        let frozen = self
            .frozen
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains(&register);
        if frozen {
            debug!(register, value, "write to frozen register ignored");
            return Ok(());
        }
        self.set(register, value);
        Ok(())
    }
}
