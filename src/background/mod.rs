//! Background Collaborators
//!
//! Loops that run beside the data-structure clients on their own tasks and hand
//! results to application code through bounded mailboxes.
//!
//! ## Components
//! - **Mailbox**: bounded queue with a non-blocking `offer`; a full mailbox counts the
//!   event as an overflow instead of stalling the producer.
//! - **Lease renewal**: keeps every open path alive by renewing its lease on a timer.
//! - **Subscriber**: listens for mutation notifications on every partition tail of
//!   one data structure.

pub mod lease;
pub mod mailbox;
pub mod subscriber;

pub use lease::{LeaseAck, LeaseRenewalWorker, LeaseService};
pub use mailbox::Mailbox;
pub use subscriber::{Notification, Subscriber};
