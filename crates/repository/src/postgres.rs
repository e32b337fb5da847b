//! PostgreSQL implementation of the repository traits.

use async_trait::async_trait;
use deadpool_postgres::{Object, Pool, Transaction};
use model::{Order, OrderDetails, OrderItem, OrderItemView, OrderSummary};
use rust_decimal::Decimal;
use tokio_postgres::Row;
use tracing::debug;

use crate::{OrdersRepository, PriceResolver, RepositoryError, StoreConnection, UnitOfWork};

const ORDER_COLUMNS: &str = "id, user_id, total_amount, status, created_at, updated_at";
const ITEM_COLUMNS: &str = "id, order_id, product_id, quantity, unit_price, created_at";

/// PostgreSQL implementation of the OrdersRepository trait.
///
/// Every call borrows a connection from the pool for its own duration only.
#[derive(Clone)]
pub struct PgOrdersRepository {
    /// Bounded connection pool shared by every request.
    pool: Pool,
}

impl PgOrdersRepository {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

fn order_from_row(row: &Row) -> Order {
    Order {
        id: row.get("id"),
        user_id: row.get("user_id"),
        total_amount: row.get("total_amount"),
        status: row.get("status"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn item_from_row(row: &Row) -> OrderItem {
    OrderItem {
        id: row.get("id"),
        order_id: row.get("order_id"),
        product_id: row.get("product_id"),
        quantity: row.get("quantity"),
        unit_price: row.get("unit_price"),
        created_at: row.get("created_at"),
    }
}

#[async_trait]
impl OrdersRepository for PgOrdersRepository {
    type Conn = PgConnection;

    async fn connect(&self) -> Result<PgConnection, RepositoryError> {
        let client = self.pool.get().await?;
        Ok(PgConnection { client })
    }

    async fn get_by_id(&self, id: i32) -> Result<OrderDetails, RepositoryError> {
        let client = self.pool.get().await?;

        let query = r#"
            SELECT o.id, o.user_id, o.total_amount, o.status, o.created_at, o.updated_at,
                   u.username
            FROM orders o
            LEFT JOIN users u ON o.user_id = u.id
            WHERE o.id = $1
        "#;
        let row = client
            .query_opt(query, &[&id])
            .await?
            .ok_or(RepositoryError::NotFound)?;
        let order = order_from_row(&row);
        let username: Option<String> = row.get("username");

        let query = r#"
            SELECT oi.id, oi.order_id, oi.product_id, oi.quantity, oi.unit_price, oi.created_at,
                   p.name AS product_name
            FROM order_items oi
            LEFT JOIN products p ON oi.product_id = p.id
            WHERE oi.order_id = $1
            ORDER BY oi.id
        "#;
        let items = client
            .query(query, &[&id])
            .await?
            .iter()
            .map(|row| OrderItemView {
                item: item_from_row(row),
                product_name: row.get("product_name"),
            })
            .collect();

        Ok(OrderDetails {
            order,
            username,
            items,
        })
    }

    async fn list(&self) -> Result<Vec<OrderSummary>, RepositoryError> {
        let client = self.pool.get().await?;
        let query = r#"
            SELECT o.id, o.user_id, o.total_amount, o.status, o.created_at, o.updated_at,
                   u.username
            FROM orders o
            LEFT JOIN users u ON o.user_id = u.id
            ORDER BY o.created_at DESC, o.id DESC
        "#;
        let rows = client.query(query, &[]).await?;
        Ok(rows
            .iter()
            .map(|row| OrderSummary {
                order: order_from_row(row),
                username: row.get("username"),
            })
            .collect())
    }

    async fn update_status(&self, id: i32, status: &str) -> Result<Order, RepositoryError> {
        let client = self.pool.get().await?;
        let query = format!(
            "UPDATE orders SET status = $1, updated_at = CURRENT_TIMESTAMP WHERE id = $2 RETURNING {ORDER_COLUMNS}"
        );
        let row = client.query_opt(query.as_str(), &[&status, &id]).await?;
        row.as_ref()
            .map(order_from_row)
            .ok_or(RepositoryError::NotFound)
    }
}

/// A connection checked out of the pool.
///
/// Goes back to the pool when dropped.
pub struct PgConnection {
    client: Object,
}

#[async_trait]
impl StoreConnection for PgConnection {
    type Tx<'c>
        = PgUnitOfWork<'c>
    where
        Self: 'c;

    async fn begin<'c>(&'c mut self) -> Result<PgUnitOfWork<'c>, RepositoryError> {
        let tx = self.client.transaction().await?;
        debug!("Unit of work started");
        Ok(PgUnitOfWork { tx })
    }
}

/// An open transaction on a [`PgConnection`].
///
/// Dropping it unfinished rolls the transaction back before the connection
/// is used again.
pub struct PgUnitOfWork<'c> {
    tx: Transaction<'c>,
}

#[async_trait]
impl<'c> PriceResolver for PgUnitOfWork<'c> {
    async fn resolve_price(&mut self, product_id: i32) -> Result<Option<Decimal>, RepositoryError> {
        let row = self
            .tx
            .query_opt("SELECT price FROM products WHERE id = $1", &[&product_id])
            .await?;
        Ok(row.map(|row| row.get("price")))
    }
}

#[async_trait]
impl<'c> UnitOfWork for PgUnitOfWork<'c> {
    async fn insert_order(
        &mut self,
        user_id: Option<i32>,
        total_amount: Decimal,
        status: &str,
    ) -> Result<Order, RepositoryError> {
        let query = format!(
            "INSERT INTO orders (user_id, total_amount, status) VALUES ($1, $2, $3) RETURNING {ORDER_COLUMNS}"
        );
        let row = self
            .tx
            .query_one(query.as_str(), &[&user_id, &total_amount, &status])
            .await?;
        Ok(order_from_row(&row))
    }

    async fn insert_item(
        &mut self,
        order_id: i32,
        product_id: i32,
        quantity: i32,
        unit_price: Decimal,
    ) -> Result<OrderItem, RepositoryError> {
        let query = format!(
            "INSERT INTO order_items (order_id, product_id, quantity, unit_price) VALUES ($1, $2, $3, $4) RETURNING {ITEM_COLUMNS}"
        );
        let row = self
            .tx
            .query_one(query.as_str(), &[&order_id, &product_id, &quantity, &unit_price])
            .await?;
        Ok(item_from_row(&row))
    }

    async fn commit(self) -> Result<(), RepositoryError> {
        self.tx.commit().await?;
        debug!("Unit of work committed");
        Ok(())
    }

    async fn rollback(self) -> Result<(), RepositoryError> {
        self.tx.rollback().await?;
        debug!("Unit of work rolled back");
        Ok(())
    }
}
