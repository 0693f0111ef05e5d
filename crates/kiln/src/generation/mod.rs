//! Generation ticket lifecycle: records, the worker pool, progress events.
//!
//! - [`ticket`]: [`Ticket`] and its [`TicketStatus`] lifecycle.
//! - [`pool`]: [`TicketPool`], a fixed-size worker pool with batch
//!   cancel/wait/cleanup, plus the [`Generator`] seam and
//!   [`RateLimitedGenerator`].
//! - [`progress`]: [`TicketEvent`] and the [`ProgressSink`] implementations.

pub mod pool;
pub mod progress;
pub mod ticket;

pub use pool::{
    BatchSummary, FnGenerator, GenerateFuture, Generator, Params, PoolConfig, PoolError,
    RateLimitedGenerator, TicketPool,
};
pub use progress::{
    ChannelSink, FnProgressSink, LoggingSink, NoopSink, ProgressSink, TicketEvent,
    artifact_reference,
};
pub use ticket::{Ticket, TicketStatus};
