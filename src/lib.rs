//! This crate contains the client-side execution core of a MongoDB driver: for
//! every outbound command it decides which server to target, whether and how to
//! retry on failure, how much time remains under a client-side deadline, and
//! how a multi-statement transaction's lifecycle advances across retries.
//!
//! Wire protocol encoding, connection establishment and pooling, server
//! discovery, and cursor iteration are external collaborators consumed through
//! the narrow interfaces in the [`sdam`] and [`cmap`] modules.
//!
//! The two entry points exposed to the rest of the driver are
//! [`Client::execute_operation`] and the transaction methods on
//! [`ClientSession`]: [`start_transaction`](ClientSession::start_transaction),
//! [`commit_transaction`](ClientSession::commit_transaction),
//! [`abort_transaction`](ClientSession::abort_transaction), and
//! [`with_transaction`](ClientSession::with_transaction).

pub use bson;

pub mod client;
pub mod cmap;
pub mod concern;
pub mod error;
pub mod operation;
pub mod options;
pub mod retry_budget;
pub mod sdam;
pub mod selection_criteria;
mod serde_util;
#[cfg(test)]
mod test;
pub mod timeout;

pub use crate::{
    client::{
        session::{ClientSession, ClusterTime},
        Client,
    },
    concern::{Acknowledgment, ReadConcern, WriteConcern},
    retry_budget::RetryBudget,
    timeout::{Timeout, TimeoutContext},
};

/// A boxed future, used for trait methods that need to be object safe.
pub type BoxFuture<'a, T> = futures_core::future::BoxFuture<'a, T>;
