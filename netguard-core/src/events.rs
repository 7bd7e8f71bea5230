//! Event emitter abstraction. Callers never branch on "is an emitter
//! attached" — an always-present no-op implementation absorbs the
//! no-emitter case.

use crate::types::EventRecord;
use std::sync::Arc;

pub trait EventEmitter: Send + Sync {
    fn emit(&self, record: EventRecord);
}

/// Default emitter: discards every record. Used whenever the engine is
/// constructed without an explicit sink (e.g. in unit tests).
pub struct NoopEmitter;

impl EventEmitter for NoopEmitter {
    fn emit(&self, _record: EventRecord) {}
}

pub fn noop() -> Arc<dyn EventEmitter> {
    Arc::new(NoopEmitter)
}
