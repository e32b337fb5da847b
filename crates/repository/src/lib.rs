//! # Data Repository Layer
//!
//! This crate provides the repository traits the order service is written
//! against, plus two implementations: [`PgOrdersRepository`] for PostgreSQL
//! and [`InMemoryOrdersRepository`] for tests.
//!
//! Writes that must land together go through a [`UnitOfWork`]. A caller
//! checks a connection out with [`OrdersRepository::connect`] and opens the
//! unit of work on it with [`StoreConnection::begin`]. The unit of work
//! borrows the connection until it is consumed by `commit` or `rollback`.
//! Dropping it unfinished rolls it back.

use async_trait::async_trait;
use deadpool_postgres::PoolError;
use model::{Order, OrderDetails, OrderItem, OrderSummary};
use rust_decimal::Decimal;
use thiserror::Error;
use tokio_postgres::error::SqlState;

pub mod memory;
pub mod postgres;

pub use memory::{Fault, InMemoryConnection, InMemoryOrdersRepository, InMemoryUnitOfWork};
pub use postgres::{PgConnection, PgOrdersRepository, PgUnitOfWork};

/// # RepositoryError
///
/// Error types that can occur during repository operations.
///
/// Postgres errors are classified by SQLSTATE when converted, so callers can
/// tell a broken reference or a rejected value apart from an outage.
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// Database-related errors, wrapping the underlying PostgreSQL error
    #[error("Database error: {0}")]
    Db(tokio_postgres::Error),
    /// Failed to obtain a connection from the pool.
    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),
    /// No result found.
    #[error("Not found")]
    NotFound,
    /// A row references a parent that does not exist (SQLSTATE 23503).
    #[error("Foreign key violation: {0}")]
    ForeignKeyViolation(String),
    /// A unique constraint rejected the row (SQLSTATE 23505).
    #[error("Unique violation: {0}")]
    UniqueViolation(String),
    /// The store rejected a value, e.g. numeric overflow or a string too long (SQLSTATE class 22).
    #[error("Invalid value: {0}")]
    InvalidValue(String),
    /// The store cannot serve the request right now.
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl From<tokio_postgres::Error> for RepositoryError {
    fn from(err: tokio_postgres::Error) -> Self {
        let Some(code) = err.code() else {
            return RepositoryError::Db(err);
        };
        let message = err
            .as_db_error()
            .map(|db| match db.detail() {
                Some(detail) => format!("{}: {}", db.message(), detail),
                None => db.message().to_string(),
            })
            .unwrap_or_else(|| err.to_string());

        if *code == SqlState::FOREIGN_KEY_VIOLATION {
            RepositoryError::ForeignKeyViolation(message)
        } else if *code == SqlState::UNIQUE_VIOLATION {
            RepositoryError::UniqueViolation(message)
        } else if code.code().starts_with("22") {
            RepositoryError::InvalidValue(message)
        } else {
            RepositoryError::Db(err)
        }
    }
}

/// # PriceResolver
///
/// Looks up the authoritative unit price of a product.
///
/// Returns `Ok(None)` when the product does not exist.
#[async_trait]
pub trait PriceResolver: Send {
    async fn resolve_price(&mut self, product_id: i32) -> Result<Option<Decimal>, RepositoryError>;
}

/// # UnitOfWork
///
/// An open, all-or-nothing sequence of writes against the store.
///
/// Nothing written through a unit of work is visible to other readers until
/// [`UnitOfWork::commit`] succeeds. A unit dropped without being finished
/// discards its writes.
#[async_trait]
pub trait UnitOfWork: PriceResolver {
    /// Insert the parent order row and return it as stored.
    async fn insert_order(
        &mut self,
        user_id: Option<i32>,
        total_amount: Decimal,
        status: &str,
    ) -> Result<Order, RepositoryError>;

    /// Insert one line of `order_id`.
    async fn insert_item(
        &mut self,
        order_id: i32,
        product_id: i32,
        quantity: i32,
        unit_price: Decimal,
    ) -> Result<OrderItem, RepositoryError>;

    /// Make every write of this unit visible.
    async fn commit(self) -> Result<(), RepositoryError>;

    /// Discard every write of this unit.
    async fn rollback(self) -> Result<(), RepositoryError>;
}

/// # StoreConnection
///
/// A connection checked out of the store, returned to it on drop.
#[async_trait]
pub trait StoreConnection: Send {
    type Tx<'c>: UnitOfWork
    where
        Self: 'c;

    /// Open a unit of work on this connection.
    async fn begin<'c>(&'c mut self) -> Result<Self::Tx<'c>, RepositoryError>;
}

/// # OrdersRepository
///
/// Repository interface for orders and their items.
///
/// Reads and the status update run as single statements on a pooled
/// connection. Placement checks out a connection with
/// [`OrdersRepository::connect`] and writes through a unit of work on it.
#[async_trait]
pub trait OrdersRepository: Send + Sync {
    type Conn: StoreConnection + 'static;

    /// Check a connection out of the store, waiting at most the configured timeout.
    async fn connect(&self) -> Result<Self::Conn, RepositoryError>;

    /// Order with owner username and items (with product names), items in insertion order.
    async fn get_by_id(&self, id: i32) -> Result<OrderDetails, RepositoryError>;

    /// Every order with its owner username, most recent first.
    async fn list(&self) -> Result<Vec<OrderSummary>, RepositoryError>;

    /// Set the status and refresh `updated_at`. [`RepositoryError::NotFound`] if no row matched.
    async fn update_status(&self, id: i32, status: &str) -> Result<Order, RepositoryError>;
}
