pub mod dispatch;
pub mod evaluator;
pub mod event;
pub mod recording;
pub mod thread;
pub mod verifier;

pub use dispatch::*;
pub use evaluator::*;
pub use event::*;
pub use recording::{
    CorrelationId, Direction, EventType, HttpEvent, RecordedEvent, Sanitizer, ServiceType,
    CORRELATION_ID_HEADER,
};
pub use thread::*;
pub use verifier::*;
