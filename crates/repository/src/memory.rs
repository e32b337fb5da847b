//! In-memory implementation of the repository traits.
//!
//! Behaves like the Postgres store where the order service can observe it:
//! ids are consumed even by rolled-back units, item rows must reference an
//! existing order and product, writes stay invisible until commit, money is
//! kept at the column scale, and the number of checked-out connections is
//! bounded like a connection pool.
//! Faults can be injected to exercise the failure paths.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use model::{AMOUNT_SCALE, Order, OrderDetails, OrderItem, OrderItemView, OrderSummary};
use rust_decimal::Decimal;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};

use crate::{OrdersRepository, PriceResolver, RepositoryError, StoreConnection, UnitOfWork};

const DEFAULT_CAPACITY: usize = 16;
const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(2);

/// A failure the in-memory store can be told to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Every operation fails as if the database were unreachable.
    Unavailable,
    /// Inserting an order item fails.
    ItemInsert,
    /// Committing a unit of work fails.
    Commit,
}

/// Stores `amount` the way a `DECIMAL(10, 2)` column would.
fn to_column_scale(mut amount: Decimal) -> Decimal {
    amount.rescale(AMOUNT_SCALE);
    amount
}

#[derive(Debug, Clone)]
struct ProductRow {
    name: String,
    price: Decimal,
}

#[derive(Debug, Default)]
struct State {
    users: BTreeMap<i32, String>,
    products: BTreeMap<i32, ProductRow>,
    orders: Vec<Order>,
    items: Vec<OrderItem>,
    next_user_id: i32,
    next_product_id: i32,
    next_order_id: i32,
    next_item_id: i32,
    fault: Option<Fault>,
}

impl State {
    fn check(&self, fault: Fault) -> Result<(), RepositoryError> {
        match self.fault {
            Some(Fault::Unavailable) => Err(RepositoryError::Unavailable(
                "in-memory store marked unavailable".into(),
            )),
            Some(f) if f == fault => Err(RepositoryError::Unavailable(format!(
                "injected fault: {f:?}"
            ))),
            _ => Ok(()),
        }
    }

    fn available(&self) -> Result<(), RepositoryError> {
        self.check(Fault::Unavailable)
    }

    fn username(&self, user_id: Option<i32>) -> Option<String> {
        user_id.and_then(|id| self.users.get(&id).cloned())
    }
}

/// Thread-safe in-memory store of users, products, orders and items.
#[derive(Clone)]
pub struct InMemoryOrdersRepository {
    state: Arc<Mutex<State>>,
    permits: Arc<Semaphore>,
    capacity: usize,
    wait_timeout: Duration,
}

impl Default for InMemoryOrdersRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryOrdersRepository {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY, DEFAULT_WAIT_TIMEOUT)
    }

    /// Create an empty store allowing at most `capacity` checked-out connections.
    ///
    /// `connect` waits up to `wait_timeout` for a free slot.
    pub fn with_capacity(capacity: usize, wait_timeout: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
            wait_timeout,
        }
    }

    /// Register a user and return its id.
    pub async fn add_user(&self, username: &str) -> i32 {
        let mut state = self.state.lock().await;
        state.next_user_id += 1;
        let id = state.next_user_id;
        state.users.insert(id, username.to_string());
        id
    }

    /// Register a product and return its id.
    pub async fn add_product(&self, name: &str, price: Decimal) -> i32 {
        let mut state = self.state.lock().await;
        state.next_product_id += 1;
        let id = state.next_product_id;
        state.products.insert(
            id,
            ProductRow {
                name: name.to_string(),
                price: to_column_scale(price),
            },
        );
        id
    }

    /// Change the current price of a product. Returns `false` if it does not exist.
    pub async fn set_price(&self, product_id: i32, price: Decimal) -> bool {
        let mut state = self.state.lock().await;
        match state.products.get_mut(&product_id) {
            Some(product) => {
                product.price = to_column_scale(price);
                true
            }
            None => false,
        }
    }

    /// Make subsequent operations fail with `fault`, or clear it with `None`.
    pub async fn set_fault(&self, fault: Option<Fault>) {
        self.state.lock().await.fault = fault;
    }

    /// Committed orders.
    pub async fn order_count(&self) -> usize {
        self.state.lock().await.orders.len()
    }

    /// Committed order items.
    pub async fn item_count(&self) -> usize {
        self.state.lock().await.items.len()
    }

    /// Connections currently checked out.
    pub fn open_connections(&self) -> usize {
        self.capacity - self.permits.available_permits()
    }
}

#[async_trait]
impl OrdersRepository for InMemoryOrdersRepository {
    type Conn = InMemoryConnection;

    async fn connect(&self) -> Result<InMemoryConnection, RepositoryError> {
        self.state.lock().await.available()?;

        let permit = tokio::time::timeout(self.wait_timeout, self.permits.clone().acquire_owned())
            .await
            .map_err(|_| {
                RepositoryError::Unavailable(format!(
                    "timed out after {:?} waiting for a connection",
                    self.wait_timeout
                ))
            })?
            .map_err(|_| RepositoryError::Unavailable("store is closed".into()))?;

        Ok(InMemoryConnection {
            state: self.state.clone(),
            _permit: permit,
        })
    }

    async fn get_by_id(&self, id: i32) -> Result<OrderDetails, RepositoryError> {
        let state = self.state.lock().await;
        state.available()?;

        let order = state
            .orders
            .iter()
            .find(|o| o.id == id)
            .cloned()
            .ok_or(RepositoryError::NotFound)?;
        let items = state
            .items
            .iter()
            .filter(|item| item.order_id == id)
            .map(|item| OrderItemView {
                item: item.clone(),
                product_name: state.products.get(&item.product_id).map(|p| p.name.clone()),
            })
            .collect();

        Ok(OrderDetails {
            username: state.username(order.user_id),
            order,
            items,
        })
    }

    async fn list(&self) -> Result<Vec<OrderSummary>, RepositoryError> {
        let state = self.state.lock().await;
        state.available()?;

        let mut orders: Vec<OrderSummary> = state
            .orders
            .iter()
            .map(|order| OrderSummary {
                username: state.username(order.user_id),
                order: order.clone(),
            })
            .collect();
        orders.sort_by(|a, b| {
            b.order
                .created_at
                .cmp(&a.order.created_at)
                .then(b.order.id.cmp(&a.order.id))
        });
        Ok(orders)
    }

    async fn update_status(&self, id: i32, status: &str) -> Result<Order, RepositoryError> {
        let mut state = self.state.lock().await;
        state.available()?;

        let order = state
            .orders
            .iter_mut()
            .find(|o| o.id == id)
            .ok_or(RepositoryError::NotFound)?;
        order.status = status.to_string();
        order.updated_at = Utc::now();
        Ok(order.clone())
    }
}

/// A capacity slot of the store, released on drop.
#[derive(Debug)]
pub struct InMemoryConnection {
    state: Arc<Mutex<State>>,
    _permit: OwnedSemaphorePermit,
}

#[async_trait]
impl StoreConnection for InMemoryConnection {
    type Tx<'c>
        = InMemoryUnitOfWork<'c>
    where
        Self: 'c;

    async fn begin<'c>(&'c mut self) -> Result<InMemoryUnitOfWork<'c>, RepositoryError> {
        self.state.lock().await.available()?;
        Ok(InMemoryUnitOfWork {
            conn: self,
            orders: Vec::new(),
            items: Vec::new(),
        })
    }
}

/// Writes buffered on a connection until commit.
pub struct InMemoryUnitOfWork<'c> {
    conn: &'c mut InMemoryConnection,
    orders: Vec<Order>,
    items: Vec<OrderItem>,
}

#[async_trait]
impl<'c> PriceResolver for InMemoryUnitOfWork<'c> {
    async fn resolve_price(&mut self, product_id: i32) -> Result<Option<Decimal>, RepositoryError> {
        let state = self.conn.state.lock().await;
        state.available()?;
        Ok(state.products.get(&product_id).map(|p| p.price))
    }
}

#[async_trait]
impl<'c> UnitOfWork for InMemoryUnitOfWork<'c> {
    async fn insert_order(
        &mut self,
        user_id: Option<i32>,
        total_amount: Decimal,
        status: &str,
    ) -> Result<Order, RepositoryError> {
        let mut state = self.conn.state.lock().await;
        state.available()?;

        state.next_order_id += 1;
        let now = Utc::now();
        let order = Order {
            id: state.next_order_id,
            user_id,
            total_amount: to_column_scale(total_amount),
            status: status.to_string(),
            created_at: now,
            updated_at: now,
        };
        self.orders.push(order.clone());
        Ok(order)
    }

    async fn insert_item(
        &mut self,
        order_id: i32,
        product_id: i32,
        quantity: i32,
        unit_price: Decimal,
    ) -> Result<OrderItem, RepositoryError> {
        let mut state = self.conn.state.lock().await;
        state.check(Fault::ItemInsert)?;

        if !self.orders.iter().any(|o| o.id == order_id) && !state.orders.iter().any(|o| o.id == order_id) {
            return Err(RepositoryError::ForeignKeyViolation(format!(
                "order {order_id} is not present in table \"orders\""
            )));
        }
        if !state.products.contains_key(&product_id) {
            return Err(RepositoryError::ForeignKeyViolation(format!(
                "product {product_id} is not present in table \"products\""
            )));
        }

        state.next_item_id += 1;
        let item = OrderItem {
            id: state.next_item_id,
            order_id,
            product_id,
            quantity,
            unit_price: to_column_scale(unit_price),
            created_at: Utc::now(),
        };
        self.items.push(item.clone());
        Ok(item)
    }

    async fn commit(self) -> Result<(), RepositoryError> {
        let mut state = self.conn.state.lock().await;
        state.check(Fault::Commit)?;
        state.orders.extend(self.orders);
        state.items.extend(self.items);
        Ok(())
    }

    async fn rollback(self) -> Result<(), RepositoryError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_writes_are_invisible_until_commit() {
        let repo = InMemoryOrdersRepository::new();
        let product = repo.add_product("Mouse", dec!(19.50)).await;

        let mut conn = repo.connect().await.unwrap();
        let mut tx = conn.begin().await.unwrap();
        let order = tx.insert_order(None, dec!(39.00), "pending").await.unwrap();
        tx.insert_item(order.id, product, 2, dec!(19.50)).await.unwrap();
        assert!(repo.list().await.unwrap().is_empty());

        tx.commit().await.unwrap();
        assert_eq!(repo.order_count().await, 1);
        assert_eq!(repo.item_count().await, 1);
    }

    #[tokio::test]
    async fn test_rollback_discards_writes_but_consumes_ids() {
        let repo = InMemoryOrdersRepository::new();
        let mut conn = repo.connect().await.unwrap();

        let mut tx = conn.begin().await.unwrap();
        let first = tx.insert_order(None, dec!(1.00), "pending").await.unwrap();
        tx.rollback().await.unwrap();
        assert_eq!(repo.order_count().await, 0);

        let mut tx = conn.begin().await.unwrap();
        let second = tx.insert_order(None, dec!(1.00), "pending").await.unwrap();
        tx.commit().await.unwrap();
        assert!(second.id > first.id);
        assert_eq!(repo.order_count().await, 1);
    }

    #[tokio::test]
    async fn test_dropped_unit_discards_writes() {
        let repo = InMemoryOrdersRepository::new();
        let mut conn = repo.connect().await.unwrap();

        let mut tx = conn.begin().await.unwrap();
        tx.insert_order(None, dec!(1.00), "pending").await.unwrap();
        drop(tx);

        assert_eq!(repo.order_count().await, 0);
        assert!(conn.begin().await.is_ok());
    }

    #[tokio::test]
    async fn test_item_requires_existing_product() {
        let repo = InMemoryOrdersRepository::new();
        let mut conn = repo.connect().await.unwrap();
        let mut tx = conn.begin().await.unwrap();
        let order = tx.insert_order(None, dec!(1.00), "pending").await.unwrap();

        let err = tx.insert_item(order.id, 404, 1, dec!(1.00)).await.unwrap_err();
        assert!(matches!(err, RepositoryError::ForeignKeyViolation(_)));
    }

    #[tokio::test]
    async fn test_dropped_connection_releases_its_slot() {
        let repo = InMemoryOrdersRepository::with_capacity(1, Duration::from_millis(20));
        let conn = repo.connect().await.unwrap();
        assert_eq!(repo.open_connections(), 1);

        let err = repo.connect().await.unwrap_err();
        assert!(matches!(err, RepositoryError::Unavailable(_)));

        drop(conn);
        assert_eq!(repo.open_connections(), 0);
        assert!(repo.connect().await.is_ok());
    }

    #[tokio::test]
    async fn test_resolves_current_price() {
        let repo = InMemoryOrdersRepository::new();
        let product = repo.add_product("Cable", dec!(5.00)).await;
        assert!(repo.set_price(product, dec!(4.25)).await);

        let mut conn = repo.connect().await.unwrap();
        let mut tx = conn.begin().await.unwrap();
        assert_eq!(tx.resolve_price(product).await.unwrap(), Some(dec!(4.25)));
        assert_eq!(tx.resolve_price(product + 1).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_amounts_are_stored_at_column_scale() {
        let repo = InMemoryOrdersRepository::new();
        let product = repo.add_product("Adapter", dec!(30)).await;

        let mut conn = repo.connect().await.unwrap();
        let mut tx = conn.begin().await.unwrap();
        let price = tx.resolve_price(product).await.unwrap().unwrap();
        assert_eq!(price.to_string(), "30.00");

        let order = tx.insert_order(None, dec!(60), "pending").await.unwrap();
        let item = tx.insert_item(order.id, product, 2, dec!(30)).await.unwrap();
        assert_eq!(order.total_amount.scale(), AMOUNT_SCALE);
        assert_eq!(item.unit_price.to_string(), "30.00");
    }

    #[tokio::test]
    async fn test_update_status_on_missing_order() {
        let repo = InMemoryOrdersRepository::new();
        let err = repo.update_status(9, "completed").await.unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound));
    }
}
