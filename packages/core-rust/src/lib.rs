//! `ShopMesh` core: service instances, message envelopes, payment transactions, and clocks.

pub mod clock;
pub mod envelope;
pub mod instance;
pub mod transaction;

pub use clock::{ClockSource, ManualClock, SystemClock};
pub use envelope::{generate_message_id, MessageEnvelope, ReplyPayload};
pub use instance::{ServiceInstance, ServiceRegistration};
pub use transaction::{
    LineItem, PaymentTransaction, RetryInfo, TransactionStatus, TransitionError,
};
