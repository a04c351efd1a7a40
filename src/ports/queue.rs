//! Queue transport port (spec §6): at-least-once delivery of
//! [`SchedulerMessage`]s, with transport-maintained attempt counts and
//! handler-driven ack/nack/re-queue.

use async_trait::async_trait;
use std::time::Duration;

use crate::errors::PortError;
use crate::messages::SchedulerMessage;

/// Opaque handle a transport hands back with a delivered message, used to
/// ack/nack/requeue that specific delivery. `as_any` lets a transport
/// downcast back to its own concrete handle type (e.g. to read a message
/// id) without widening this trait with transport-specific methods.
pub trait MessageHandle: Send + Sync + std::fmt::Debug {
    fn as_any(&self) -> &dyn std::any::Any;
}

/// The queue transport the dispatcher polls. Implementations decide their
/// own visibility-timeout and redelivery mechanics; the core only needs
/// push/poll/ack/nack and a way to read the current attempt count.
#[async_trait]
pub trait Queue: Send + Sync {
    /// Enqueue a message for immediate (or, with `delay`, deferred) delivery.
    async fn push(
        &self,
        message: SchedulerMessage,
        delay: Option<Duration>,
    ) -> Result<(), PortError>;

    /// Pop the next available message, if any.
    async fn poll(&self) -> Result<Option<(SchedulerMessage, Box<dyn MessageHandle>)>, PortError>;

    /// Acknowledge successful processing; the transport will not redeliver.
    async fn ack(&self, handle: Box<dyn MessageHandle>) -> Result<(), PortError>;

    /// Return the message to the queue for redelivery after `delay`.
    async fn nack(
        &self,
        handle: Box<dyn MessageHandle>,
        delay: Option<Duration>,
    ) -> Result<(), PortError>;

    /// Transport-maintained redelivery counter for a live handle (spec §4.1
    /// `AttemptsAttribute`).
    async fn attempts(&self, handle: &dyn MessageHandle) -> Result<u32, PortError>;
}
