//! Infrastructure layer: ledger storage, delivery workers, target adapters.
//!
//! The write path is [`enqueue`]; everything after the business commit runs in
//! [`workers`], which drive [`payload`] builders and [`adapters`] and record
//! the outcome in the [`ledger`].

pub mod adapters;
pub mod admin;
pub mod config;
pub mod credentials;
pub mod enqueue;
pub mod ledger;
pub mod payload;
pub mod workers;

#[cfg(test)]
mod test_db;
