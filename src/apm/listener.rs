use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use log::trace;

use crate::apm::event::{CmapEvent, SdamEvent};
use crate::apm::EventHandler;
use crate::error::Result;

/// Fans events out to every registered handler. Events are always logged at trace level.
pub struct Listener {
    no_handlers: AtomicBool,
    handlers: RwLock<Vec<Arc<dyn EventHandler>>>,
}

impl Default for Listener {
    fn default() -> Self {
        Listener::new()
    }
}

impl Listener {
    pub fn new() -> Listener {
        Listener {
            no_handlers: AtomicBool::new(true),
            handlers: RwLock::new(Vec::new()),
        }
    }

    pub fn add_handler(&self, handler: Arc<dyn EventHandler>) -> Result<()> {
        let mut guard = self.handlers.write()?;
        self.no_handlers.store(false, Ordering::SeqCst);
        guard.push(handler);
        Ok(())
    }

    pub fn emit_sdam(&self, event: SdamEvent) {
        trace!("{}", event);
        if self.no_handlers.load(Ordering::SeqCst) {
            return;
        }

        if let Ok(guard) = self.handlers.read() {
            for handler in guard.iter() {
                handler.handle_sdam_event(&event);
            }
        }
    }

    pub fn emit_cmap(&self, event: CmapEvent) {
        trace!("{}", event);
        if self.no_handlers.load(Ordering::SeqCst) {
            return;
        }

        if let Ok(guard) = self.handlers.read() {
            for handler in guard.iter() {
                handler.handle_cmap_event(&event);
            }
        }
    }
}
