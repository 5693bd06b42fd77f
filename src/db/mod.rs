//! Database layer - destination connection, schema derivation and DDL

pub mod destination;
pub mod schema;

pub use destination::{ConnectArgs, ConnectArgsBuilder, Destination};
pub use schema::{Column, ColumnSchema, SqlType, TableRef};
