//! One-to-many media relay
//!
//! A single publisher session feeds a re-originated local stream; every
//! subscriber session negotiated afterwards is bound to that stream and
//! receives a copy of each packet without any decoding or re-encoding.

mod coordinator;
mod handle;
mod publish;
mod subscribe;

pub use coordinator::{RelayCoordinator, RelayState, RelayStatus, ShutdownCause, StreamStatus};
pub use handle::{MediaStreamHandle, STREAM_ID};
pub use publish::{PublishSession, StreamHandle};
pub use subscribe::{AdmitError, SubscriberId, SubscriberInfo, SubscriberPool, SubscriberState};
