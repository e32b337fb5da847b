//! Business logic layer for order management.
//!
//! This module defines the [`OrderService`] trait and its async implementation [`OrderServiceImpl`].
//! The service places orders as one unit of work, serves the order read paths, and
//! updates order status.
//!
//! # Features
//! - Atomic placement of an order and its items, priced from the store, in a single unit of work.
//! - Validation of input data before any store access.
//! - Explicit rollback on every failed placement.
//! - Dependency injection of the repository for testability.
//! - Well-typed error handling via [`ServiceError`].

use async_trait::async_trait;
use model::{
    NewOrder, Order, OrderDetails, OrderLine, OrderStatus, OrderSummary, PlacedOrder, MAX_AMOUNT,
};
use repository::{OrdersRepository, RepositoryError, StoreConnection, UnitOfWork};
use rust_decimal::Decimal;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

/// The main error type for all operations in [`OrderService`] and [`OrderServiceImpl`].
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The request is malformed; the store was not touched.
    #[error("{0}")]
    InvalidInput(String),
    /// The request names an entity that does not exist.
    #[error("{entity} {id} not found")]
    ReferencedEntityNotFound { entity: &'static str, id: i32 },
    /// The entity addressed by the operation does not exist.
    #[error("{0} not found")]
    NotFound(String),
    /// A uniqueness or referential rule of the store rejected the write.
    #[error("Conflicting state: {0}")]
    ConflictingState(String),
    /// The store could not be reached or failed mid-operation.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),
}

impl ServiceError {
    /// Stable, machine-checkable reason for this error.
    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::InvalidInput(_) => "INVALID_INPUT",
            ServiceError::ReferencedEntityNotFound { .. } => "REFERENCED_ENTITY_NOT_FOUND",
            ServiceError::NotFound(_) => "NOT_FOUND",
            ServiceError::ConflictingState(_) => "CONFLICTING_STATE",
            ServiceError::StoreUnavailable(_) => "STORE_UNAVAILABLE",
        }
    }
}

impl From<RepositoryError> for ServiceError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::NotFound => ServiceError::NotFound("Record".into()),
            RepositoryError::UniqueViolation(msg) | RepositoryError::ForeignKeyViolation(msg) => {
                ServiceError::ConflictingState(msg)
            }
            RepositoryError::InvalidValue(msg) => ServiceError::InvalidInput(msg),
            other @ (RepositoryError::Db(_)
            | RepositoryError::Pool(_)
            | RepositoryError::Unavailable(_)) => {
                ServiceError::StoreUnavailable(other.to_string())
            }
        }
    }
}

/// Trait describing business operations for order management.
#[async_trait]
pub trait OrderService: Send + Sync {
    /// Prices and persists an order and its items as one unit of work.
    ///
    /// # Errors
    /// [`ServiceError::InvalidInput`] for an empty line list, a non-positive quantity or
    /// a total outside the supported range; [`ServiceError::ReferencedEntityNotFound`]
    /// for an unknown product; [`ServiceError::StoreUnavailable`] if the store fails.
    /// Nothing is persisted on any error.
    async fn place_order(&self, order: NewOrder) -> Result<PlacedOrder, ServiceError>;

    /// Retrieves one order with its owner username and items.
    ///
    /// # Errors
    /// [`ServiceError::NotFound`] if no order has this id.
    async fn get_order(&self, id: i32) -> Result<OrderDetails, ServiceError>;

    /// All orders with owner usernames, most recent first.
    async fn list_orders(&self) -> Result<Vec<OrderSummary>, ServiceError>;

    /// Replaces the status of an order.
    ///
    /// # Errors
    /// [`ServiceError::InvalidInput`] if `status` is missing or empty,
    /// [`ServiceError::NotFound`] if no order has this id.
    async fn set_status(&self, id: i32, status: Option<&str>) -> Result<Order, ServiceError>;
}

/// Async implementation of [`OrderService`] over any [`OrdersRepository`].
pub struct OrderServiceImpl<R> {
    orders_repo: R,
}

impl<R> OrderServiceImpl<R>
where
    R: OrdersRepository,
{
    /// Constructs a new [`OrderServiceImpl`] from the provided repository.
    pub fn new(orders_repo: R) -> Self {
        Self { orders_repo }
    }
}

/// Checks the shape of a placement request.
///
/// Returns [`ServiceError::InvalidInput`] for an empty line list or a non-positive quantity.
pub fn validate_lines(lines: &[OrderLine]) -> Result<(), ServiceError> {
    if lines.is_empty() {
        return Err(ServiceError::InvalidInput("Order items are required".into()));
    }
    if let Some(line) = lines.iter().find(|line| line.quantity <= 0) {
        return Err(ServiceError::InvalidInput(format!(
            "Quantity for product {} must be a positive integer, got {}",
            line.product_id, line.quantity
        )));
    }
    Ok(())
}

/// Adds `price × quantity` to `total`.
///
/// Fails with [`ServiceError::InvalidInput`] if the result leaves the range of a stored amount.
pub fn accumulate_total(total: Decimal, price: Decimal, quantity: i32) -> Result<Decimal, ServiceError> {
    let overflow = || {
        ServiceError::InvalidInput(format!("Order total exceeds the maximum of {MAX_AMOUNT}"))
    };
    let next = price
        .checked_mul(Decimal::from(quantity))
        .and_then(|line| total.checked_add(line))
        .ok_or_else(overflow)?;
    if next > MAX_AMOUNT {
        return Err(overflow());
    }
    Ok(next)
}

/// Steps 1–4 of a placement, run inside `tx`. The caller commits or rolls back.
async fn assemble<U: UnitOfWork>(tx: &mut U, order: &NewOrder) -> Result<PlacedOrder, ServiceError> {
    let mut priced = Vec::with_capacity(order.items.len());
    let mut total = Decimal::ZERO;

    for line in &order.items {
        let price = tx.resolve_price(line.product_id).await?.ok_or(
            ServiceError::ReferencedEntityNotFound {
                entity: "Product",
                id: line.product_id,
            },
        )?;
        if line.unit_price_hint.is_some_and(|hint| hint != price) {
            debug!(
                product_id = line.product_id,
                hint = ?line.unit_price_hint,
                %price,
                "Ignoring caller price hint"
            );
        }
        total = accumulate_total(total, price, line.quantity)?;
        priced.push((line, price));
    }

    let stored = tx
        .insert_order(order.user_id, total, OrderStatus::default().as_str())
        .await?;

    let mut items = Vec::with_capacity(priced.len());
    for (line, price) in priced {
        let item = tx
            .insert_item(stored.id, line.product_id, line.quantity, price)
            .await
            .map_err(|e| match e {
                RepositoryError::ForeignKeyViolation(_) => ServiceError::ReferencedEntityNotFound {
                    entity: "Product",
                    id: line.product_id,
                },
                other => other.into(),
            })?;
        items.push(item);
    }

    Ok(PlacedOrder {
        order: stored,
        items,
    })
}

#[async_trait]
impl<R> OrderService for OrderServiceImpl<R>
where
    R: OrdersRepository,
{
    /// Validates, then prices and writes the order inside one unit of work.
    ///
    /// Any failure after the unit of work is opened is followed by an explicit
    /// rollback before the error is returned.
    #[instrument(skip(self, order), fields(lines = order.items.len(), user_id = ?order.user_id))]
    async fn place_order(&self, order: NewOrder) -> Result<PlacedOrder, ServiceError> {
        validate_lines(&order.items)?;

        let mut conn = self.orders_repo.connect().await?;
        let mut tx = conn.begin().await?;
        match assemble(&mut tx, &order).await {
            Ok(placed) => {
                tx.commit().await?;
                info!(
                    order_id = placed.order.id,
                    total = %placed.order.total_amount,
                    "Order placed"
                );
                Ok(placed)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    error!(error = %rollback_err, "Rollback failed");
                }
                warn!(error = %err, "Order placement rolled back");
                Err(err)
            }
        }
    }

    #[instrument(skip(self))]
    async fn get_order(&self, id: i32) -> Result<OrderDetails, ServiceError> {
        self.orders_repo.get_by_id(id).await.map_err(|e| match e {
            RepositoryError::NotFound => ServiceError::NotFound(format!("Order {id}")),
            other => other.into(),
        })
    }

    #[instrument(skip(self))]
    async fn list_orders(&self) -> Result<Vec<OrderSummary>, ServiceError> {
        Ok(self.orders_repo.list().await?)
    }

    /// Any non-empty status is stored; values outside [`OrderStatus`] are only logged.
    #[instrument(skip(self))]
    async fn set_status(&self, id: i32, status: Option<&str>) -> Result<Order, ServiceError> {
        let status = status
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ServiceError::InvalidInput("Status is required".into()))?;
        if !OrderStatus::is_known(status) {
            warn!(status, "Status outside the known set");
        }

        self.orders_repo
            .update_status(id, status)
            .await
            .map_err(|e| match e {
                RepositoryError::NotFound => ServiceError::NotFound(format!("Order {id}")),
                other => other.into(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use repository::{Fault, InMemoryOrdersRepository};
    use rust_decimal_macros::dec;

    fn line(product_id: i32, quantity: i32) -> OrderLine {
        OrderLine {
            product_id,
            quantity,
            unit_price_hint: None,
        }
    }

    async fn catalog() -> (InMemoryOrdersRepository, i32, i32) {
        let repo = InMemoryOrdersRepository::new();
        let p1 = repo.add_product("Keyboard", dec!(29.99)).await;
        let p2 = repo.add_product("Monitor stand", dec!(49.99)).await;
        (repo, p1, p2)
    }

    #[tokio::test]
    async fn test_place_order_computes_total_from_store_prices() {
        let (repo, p1, p2) = catalog().await;
        let service = OrderServiceImpl::new(repo.clone());

        let placed = service
            .place_order(NewOrder {
                user_id: None,
                items: vec![line(p1, 2), line(p2, 1)],
            })
            .await
            .unwrap();

        assert_eq!(placed.order.total_amount, dec!(109.97));
        assert_eq!(placed.order.status, "pending");
        assert_eq!(placed.items.len(), 2);
        assert_eq!(repo.order_count().await, 1);
        assert_eq!(repo.item_count().await, 2);
    }

    #[tokio::test]
    async fn test_empty_order_is_rejected_without_touching_store() {
        let repo = InMemoryOrdersRepository::new();
        repo.set_fault(Some(Fault::Unavailable)).await;
        let service = OrderServiceImpl::new(repo.clone());

        let err = service.place_order(NewOrder::default()).await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidInput(_)));
        assert_eq!(err.to_string(), "Order items are required");

        repo.set_fault(None).await;
        assert_eq!(repo.order_count().await, 0);
        assert_eq!(repo.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_non_positive_quantity_is_invalid() {
        let (repo, p1, _) = catalog().await;
        let service = OrderServiceImpl::new(repo.clone());

        for quantity in [0, -3] {
            let err = service
                .place_order(NewOrder {
                    user_id: None,
                    items: vec![line(p1, quantity)],
                })
                .await
                .unwrap_err();
            assert!(matches!(err, ServiceError::InvalidInput(_)));
        }
        assert_eq!(repo.order_count().await, 0);
    }

    #[tokio::test]
    async fn test_unknown_product_leaves_no_trace() {
        let (repo, p1, _) = catalog().await;
        let service = OrderServiceImpl::new(repo.clone());

        let err = service
            .place_order(NewOrder {
                user_id: None,
                items: vec![line(p1, 1), line(404, 1)],
            })
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ServiceError::ReferencedEntityNotFound {
                entity: "Product",
                id: 404
            }
        ));
        assert_eq!(err.code(), "REFERENCED_ENTITY_NOT_FOUND");
        assert_eq!(repo.order_count().await, 0);
        assert_eq!(repo.item_count().await, 0);
        assert!(service.list_orders().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_item_insert_failure_rolls_back_the_order() {
        let (repo, p1, p2) = catalog().await;
        repo.set_fault(Some(Fault::ItemInsert)).await;
        let service = OrderServiceImpl::new(repo.clone());

        let err = service
            .place_order(NewOrder {
                user_id: None,
                items: vec![line(p1, 1), line(p2, 1)],
            })
            .await
            .unwrap_err();

        assert!(matches!(err, ServiceError::StoreUnavailable(_)));
        assert_eq!(repo.order_count().await, 0);
        assert_eq!(repo.item_count().await, 0);
    }

    #[tokio::test]
    async fn test_commit_failure_is_store_unavailable() {
        let (repo, p1, _) = catalog().await;
        repo.set_fault(Some(Fault::Commit)).await;
        let service = OrderServiceImpl::new(repo.clone());

        let err = service
            .place_order(NewOrder {
                user_id: None,
                items: vec![line(p1, 1)],
            })
            .await
            .unwrap_err();

        assert_eq!(err.code(), "STORE_UNAVAILABLE");
        assert_eq!(repo.order_count().await, 0);
        assert_eq!(repo.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_unit_of_work_is_released_after_failure() {
        let repo = InMemoryOrdersRepository::with_capacity(1, Duration::from_millis(50));
        let p1 = repo.add_product("Keyboard", dec!(29.99)).await;
        let service = OrderServiceImpl::new(repo.clone());

        for _ in 0..3 {
            let err = service
                .place_order(NewOrder {
                    user_id: None,
                    items: vec![line(404, 1)],
                })
                .await
                .unwrap_err();
            assert!(matches!(err, ServiceError::ReferencedEntityNotFound { .. }));
        }
        assert_eq!(repo.open_connections(), 0);

        service
            .place_order(NewOrder {
                user_id: None,
                items: vec![line(p1, 1)],
            })
            .await
            .unwrap();
        assert_eq!(repo.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_exhausted_capacity_is_store_unavailable() {
        let repo = InMemoryOrdersRepository::with_capacity(1, Duration::from_millis(20));
        let p1 = repo.add_product("Keyboard", dec!(29.99)).await;
        let service = OrderServiceImpl::new(repo.clone());

        let _held = repo.connect().await.unwrap();
        let err = service
            .place_order(NewOrder {
                user_id: None,
                items: vec![line(p1, 1)],
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::StoreUnavailable(_)));
    }

    #[tokio::test]
    async fn test_price_hint_is_ignored() {
        let (repo, p1, _) = catalog().await;
        let service = OrderServiceImpl::new(repo.clone());

        let placed = service
            .place_order(NewOrder {
                user_id: None,
                items: vec![OrderLine {
                    product_id: p1,
                    quantity: 3,
                    unit_price_hint: Some(dec!(0.01)),
                }],
            })
            .await
            .unwrap();

        assert_eq!(placed.items[0].unit_price, dec!(29.99));
        assert_eq!(placed.order.total_amount, dec!(89.97));

        let stored = service.get_order(placed.order.id).await.unwrap();
        assert_eq!(stored.items.len(), 1);
        assert_eq!(stored.items[0].item.unit_price, dec!(29.99));
        assert_eq!(stored.items[0].item.quantity, 3);
        assert_eq!(stored.order.total_amount, dec!(89.97));
    }

    #[tokio::test]
    async fn test_get_order_returns_items_in_submitted_order() {
        let (repo, p1, p2) = catalog().await;
        let owner = repo.add_user("alice").await;
        let service = OrderServiceImpl::new(repo.clone());

        let placed = service
            .place_order(NewOrder {
                user_id: Some(owner),
                items: vec![line(p2, 4), line(p1, 1), line(p2, 2)],
            })
            .await
            .unwrap();

        // A later price change must not affect the stored snapshot.
        repo.set_price(p2, dec!(99.00)).await;

        let details = service.get_order(placed.order.id).await.unwrap();
        assert_eq!(details.username.as_deref(), Some("alice"));
        let got: Vec<_> = details
            .items
            .iter()
            .map(|v| (v.item.product_id, v.item.quantity, v.item.unit_price))
            .collect();
        assert_eq!(
            got,
            vec![(p2, 4, dec!(49.99)), (p1, 1, dec!(29.99)), (p2, 2, dec!(49.99))]
        );
        assert_eq!(details.items[1].product_name.as_deref(), Some("Keyboard"));
        assert_eq!(details.order.total_amount, dec!(329.93));
    }

    #[tokio::test]
    async fn test_get_missing_order_is_not_found() {
        let service = OrderServiceImpl::new(InMemoryOrdersRepository::new());
        let err = service.get_order(12).await.unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
        assert_eq!(err.to_string(), "Order 12 not found");
    }

    #[tokio::test]
    async fn test_order_without_known_owner_has_no_username() {
        let (repo, p1, _) = catalog().await;
        let service = OrderServiceImpl::new(repo.clone());
        let placed = service
            .place_order(NewOrder {
                user_id: Some(77),
                items: vec![line(p1, 1)],
            })
            .await
            .unwrap();

        let details = service.get_order(placed.order.id).await.unwrap();
        assert_eq!(details.order.user_id, Some(77));
        assert_eq!(details.username, None);
    }

    #[tokio::test]
    async fn test_list_orders_newest_first() {
        let (repo, p1, _) = catalog().await;
        let service = OrderServiceImpl::new(repo.clone());
        assert!(service.list_orders().await.unwrap().is_empty());

        let mut ids = Vec::new();
        for _ in 0..3 {
            let placed = service
                .place_order(NewOrder {
                    user_id: None,
                    items: vec![line(p1, 1)],
                })
                .await
                .unwrap();
            ids.push(placed.order.id);
        }

        let listed: Vec<_> = service
            .list_orders()
            .await
            .unwrap()
            .into_iter()
            .map(|o| o.order.id)
            .collect();
        ids.reverse();
        assert_eq!(listed, ids);
    }

    #[tokio::test]
    async fn test_set_status_updates_order() {
        let (repo, p1, _) = catalog().await;
        let service = OrderServiceImpl::new(repo.clone());
        let placed = service
            .place_order(NewOrder {
                user_id: None,
                items: vec![line(p1, 1)],
            })
            .await
            .unwrap();

        let updated = service
            .set_status(placed.order.id, Some("completed"))
            .await
            .unwrap();
        assert_eq!(updated.status, "completed");
        assert!(updated.updated_at >= placed.order.updated_at);
        assert_eq!(updated.total_amount, placed.order.total_amount);
    }

    #[tokio::test]
    async fn test_set_status_accepts_values_outside_known_set() {
        let (repo, p1, _) = catalog().await;
        let service = OrderServiceImpl::new(repo.clone());
        let placed = service
            .place_order(NewOrder {
                user_id: None,
                items: vec![line(p1, 1)],
            })
            .await
            .unwrap();

        let updated = service
            .set_status(placed.order.id, Some("shipped"))
            .await
            .unwrap();
        assert_eq!(updated.status, "shipped");
    }

    #[tokio::test]
    async fn test_set_status_requires_status() {
        let service = OrderServiceImpl::new(InMemoryOrdersRepository::new());
        for status in [None, Some("")] {
            let err = service.set_status(1, status).await.unwrap_err();
            assert!(matches!(err, ServiceError::InvalidInput(_)));
        }
    }

    #[tokio::test]
    async fn test_set_status_on_missing_order_writes_nothing() {
        let repo = InMemoryOrdersRepository::new();
        let service = OrderServiceImpl::new(repo.clone());
        let err = service.set_status(5, Some("completed")).await.unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
        assert_eq!(repo.order_count().await, 0);
    }

    #[test]
    fn test_accumulate_total_rejects_overflow() {
        assert_eq!(
            accumulate_total(dec!(10.00), dec!(2.50), 4).unwrap(),
            dec!(20.00)
        );
        assert!(accumulate_total(Decimal::ZERO, MAX_AMOUNT, 1).is_ok());
        assert!(matches!(
            accumulate_total(MAX_AMOUNT, dec!(0.01), 1),
            Err(ServiceError::InvalidInput(_))
        ));
        assert!(matches!(
            accumulate_total(Decimal::ZERO, Decimal::MAX, i32::MAX),
            Err(ServiceError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_total_beyond_supported_range_is_invalid() {
        let repo = InMemoryOrdersRepository::new();
        let pricey = repo.add_product("Yacht", dec!(99999999.99)).await;
        let service = OrderServiceImpl::new(repo.clone());

        let err = service
            .place_order(NewOrder {
                user_id: None,
                items: vec![line(pricey, 2)],
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidInput(_)));
        assert_eq!(repo.order_count().await, 0);
    }
}
