//! Inter-Node Messaging Module
//!
//! Every cross-node interaction of the fabric (job dispatch, results, sibling cancels,
//! checkpoint registration, service calls, assignment pushes) travels as an
//! [`envelope::Envelope`] through a [`channel::MessageChannel`].
//!
//! ## Submodules
//! - **`envelope`**: the closed set of wire messages and their topics.
//! - **`dispatcher`**: topic -> async handler registry on the receiving side.
//! - **`channel`**: the transport abstraction (fire-and-forget + request/response).
//! - **`local`**: in-process hub connecting nodes that share one runtime.
//! - **`http`**: JSON over HTTP between processes (axum server, reqwest client).

pub mod channel;
pub mod dispatcher;
pub mod envelope;
pub mod http;
pub mod local;

#[cfg(test)]
mod tests;
