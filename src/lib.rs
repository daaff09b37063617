#![doc = include_str!("../README.md")]
#![forbid(unsafe_code)]

mod adapter;
mod column;
mod dispatch;
mod outcome;
mod queue;
mod session;
mod statement;

pub mod config;
pub mod deferred;
pub mod error;
pub mod pool;
pub mod row;
pub mod transaction;
pub mod transport;
pub mod types;

pub use self::{
    adapter::{Adapter, AdapterBuilder, SqlParam},
    column::Column,
    config::Config,
    deferred::Deferred,
    error::Error,
    outcome::QueryOutcome,
    row::{Row, RowSet},
    session::SessionInfo,
    statement::Statement,
    transaction::{Transaction, TransactionStatus},
};

use core::{future::Future, pin::Pin};

pub type BoxedFuture<'a, O> = Pin<Box<dyn Future<Output = O> + Send + 'a>>;

fn _assert_send<F: Send>() {}

fn _assert_types_send() {
    _assert_send::<Adapter>();
    _assert_send::<Deferred>();
    _assert_send::<pool::Pool>();
}
