//! Resource factory: initialisation order and allocation tracking.
//!
//! The factory is the configuration root the host constructs once. It owns
//! the initialisation order (codec tables are static, transports live in
//! sessions, the pipeline comes last), hands out sessions, and keeps a
//! registry of long-lived buffer allocations. Teardown never swallows
//! leaks: whatever is still registered when the last `shutdown` runs is
//! reported, entry by entry.
//!
//! `initialize` is reference-counted and idempotent; each `initialize` is
//! balanced by one `shutdown`.

use crate::config::Config;
use crate::control::ControlSession;
use crate::error::{Error, Result};
use crate::grabber::GrabSession;
use kirana_correct::FlatField;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Instant;

/// One tracked allocation.
#[derive(Debug, Clone)]
pub struct AllocationRecord {
    pub size: usize,
    pub created: Instant,
}

#[derive(Default)]
struct FactoryInner {
    init_count: u32,
    allocations: HashMap<String, AllocationRecord>,
    sessions_created: u32,
}

/// Lifecycle owner for sessions and the correction pipeline.
pub struct ResourceFactory {
    config: Config,
    inner: Mutex<FactoryInner>,
}

impl ResourceFactory {
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        Ok(ResourceFactory {
            config,
            inner: Mutex::new(FactoryInner::default()),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Bump the initialisation count. The first call brings the factory up.
    pub fn initialize(&self) {
        let mut inner = self.inner.lock();
        inner.init_count += 1;
        if inner.init_count == 1 {
            log::info!("resource factory initialized");
        }
    }

    /// Balance one `initialize`. The last call reports outstanding
    /// allocations before clearing them.
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock();
        if inner.init_count == 0 {
            return;
        }
        inner.init_count -= 1;
        if inner.init_count > 0 {
            return;
        }

        if !inner.allocations.is_empty() {
            log::warn!(
                "factory teardown with {} outstanding allocation(s)",
                inner.allocations.len()
            );
            for (name, record) in &inner.allocations {
                log::warn!(
                    "  leaked '{}': {} bytes, held for {:?}",
                    name,
                    record.size,
                    record.created.elapsed()
                );
            }
            inner.allocations.clear();
        }
        log::info!("resource factory shut down");
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.lock().init_count > 0
    }

    /// Track a named allocation.
    pub fn register(&self, name: &str, size: usize) {
        let mut inner = self.inner.lock();
        if inner
            .allocations
            .insert(
                name.to_string(),
                AllocationRecord {
                    size,
                    created: Instant::now(),
                },
            )
            .is_some()
        {
            log::warn!("allocation '{}' re-registered, overwriting", name);
        }
    }

    /// Release a named allocation.
    pub fn unregister(&self, name: &str) {
        if self.inner.lock().allocations.remove(name).is_none() {
            log::warn!("unregister of unknown allocation '{}'", name);
        }
    }

    pub fn allocation_count(&self) -> usize {
        self.inner.lock().allocations.len()
    }

    pub fn total_allocated(&self) -> usize {
        self.inner.lock().allocations.values().map(|r| r.size).sum()
    }

    /// Build a command session from the factory's configuration.
    pub fn create_control_session(&self) -> Result<ControlSession> {
        self.require_initialized()?;
        self.inner.lock().sessions_created += 1;
        Ok(ControlSession::with_config(&self.config.command))
    }

    /// Build a grab session from the factory's configuration.
    pub fn create_grab_session(&self) -> Result<GrabSession> {
        self.require_initialized()?;
        self.inner.lock().sessions_created += 1;
        Ok(GrabSession::with_config(&self.config.acquisition))
    }

    /// Build a flat-field pipeline and track its table allocation under
    /// `name`. Release with [`unregister`](Self::unregister).
    pub fn create_flat_field(
        &self,
        name: &str,
        width: usize,
        height: usize,
        bit_depth: u8,
    ) -> Result<FlatField> {
        self.require_initialized()?;
        let tables = FlatField::new(width, height, bit_depth)?;
        // offset u16 + gain f32 + baseline u16 per pixel
        self.register(name, width * height * 8);
        Ok(tables)
    }

    fn require_initialized(&self) -> Result<()> {
        if !self.is_initialized() {
            return Err(Error::NotInitialized);
        }
        Ok(())
    }
}
