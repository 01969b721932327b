//! Interactive client for a distributed chat/channel service.
//!
//! The process talks to two externally owned endpoints: a broker that
//! answers synchronous request/reply calls (login, registration, channel
//! management, publishing, direct messages) and a broadcast relay that
//! pushes subscribed notifications. A Lamport clock shared between the two
//! halves orders events causally. Each module covers one responsibility:
//!
//! - [`cli`] parses the command-line flags for the endpoint addresses.
//! - [`clock`] holds the shared Lamport clock.
//! - [`wire`] defines the JSON line protocol for requests, replies, and
//!   feed notifications.
//! - [`session`] carries the authenticated identity and agent flag.
//! - [`request`] performs one call/response exchange at a time against the
//!   broker.
//! - [`listener`] runs the background feed receiver with its live topic
//!   filter set.
//! - [`dispatcher`] ties it together: the pre-login menu and the command
//!   loop.
//!
//! Integration tests stand up in-process fakes of both endpoints to
//! exercise the client against the wire contract.

pub mod cli;
pub mod clock;
pub mod dispatcher;
pub mod listener;
pub mod request;
pub mod session;
pub mod wire;
