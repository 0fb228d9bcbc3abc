use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, ModelTrait, QueryFilter, Set,
    TransactionTrait,
};
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::{
    entities::{
        cart::{self, CartStatus, Entity as Cart},
        cart_item::{self, Entity as CartItem},
        product::Entity as Product,
    },
    errors::ServiceError,
};

#[derive(Clone)]
pub struct CartService {
    db: Arc<DatabaseConnection>,
}

impl CartService {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Returns the user's active cart, creating one if none exists. Carts
    /// come into being implicitly on first use.
    #[instrument(skip(self))]
    pub async fn get_or_create_cart(&self, user_id: Uuid) -> Result<cart::Model, ServiceError> {
        if let Some(existing) = Cart::find()
            .filter(cart::Column::UserId.eq(user_id))
            .filter(cart::Column::Status.eq(CartStatus::Active))
            .one(&*self.db)
            .await?
        {
            return Ok(existing);
        }

        let now = Utc::now();
        let cart = cart::ActiveModel {
            id: Set(Uuid::new_v4()),
            user_id: Set(user_id),
            status: Set(CartStatus::Active),
            created_at: Set(now),
            updated_at: Set(now),
        };
        let cart = cart.insert(&*self.db).await?;
        info!(cart_id = %cart.id, "cart created");
        Ok(cart)
    }

    /// Adds a product to the cart, snapshotting its current unit price onto
    /// the line. The product must exist, be active, and have stock to cover
    /// the requested quantity (plus whatever is already in the cart).
    #[instrument(skip(self), fields(cart_id = %cart_id, product_id = %product_id))]
    pub async fn add_item(
        &self,
        cart_id: Uuid,
        product_id: Uuid,
        quantity: i32,
    ) -> Result<cart_item::Model, ServiceError> {
        if quantity < 1 {
            return Err(ServiceError::ValidationError(
                "Quantity must be at least 1".to_string(),
            ));
        }

        let cart = Cart::find_by_id(cart_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Cart {} not found", cart_id)))?;
        if cart.status != CartStatus::Active {
            return Err(ServiceError::InvalidOperation(
                "Cart is not active".to_string(),
            ));
        }

        let product = Product::find_by_id(product_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Product {} not found", product_id)))?;
        if !product.is_active {
            return Err(ServiceError::InvalidOperation(
                "Product is not available".to_string(),
            ));
        }

        let existing = CartItem::find()
            .filter(cart_item::Column::CartId.eq(cart_id))
            .filter(cart_item::Column::ProductId.eq(product_id))
            .one(&*self.db)
            .await?;

        let already_in_cart = existing.as_ref().map(|i| i.quantity).unwrap_or(0);
        if product.stock_quantity < already_in_cart + quantity {
            return Err(ServiceError::InsufficientStock(format!(
                "Only {} of {} left in stock",
                product.stock_quantity, product.name
            )));
        }

        let now = Utc::now();
        let item = match existing {
            Some(line) => {
                let new_quantity = line.quantity + quantity;
                let mut active: cart_item::ActiveModel = line.into();
                active.quantity = Set(new_quantity);
                active.updated_at = Set(now);
                active.update(&*self.db).await?
            }
            None => {
                cart_item::ActiveModel {
                    id: Set(Uuid::new_v4()),
                    cart_id: Set(cart_id),
                    product_id: Set(product_id),
                    quantity: Set(quantity),
                    unit_price: Set(product.unit_price),
                    created_at: Set(now),
                    updated_at: Set(now),
                }
                .insert(&*self.db)
                .await?
            }
        };

        Ok(item)
    }

    /// Loads a cart along with its line items.
    pub async fn get_cart_with_items(
        &self,
        cart_id: Uuid,
    ) -> Result<(cart::Model, Vec<cart_item::Model>), ServiceError> {
        let cart = Cart::find_by_id(cart_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Cart {} not found", cart_id)))?;
        let items = cart.find_related(CartItem).all(&*self.db).await?;
        Ok((cart, items))
    }

    /// Empties the cart and marks it converted. Called only after a payment
    /// is observed completed, so a failed attempt keeps the cart intact.
    #[instrument(skip(self), fields(cart_id = %cart_id))]
    pub async fn clear_cart(&self, cart_id: Uuid) -> Result<(), ServiceError> {
        let txn = self.db.begin().await?;

        let cart = Cart::find_by_id(cart_id)
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Cart {} not found", cart_id)))?;

        CartItem::delete_many()
            .filter(cart_item::Column::CartId.eq(cart_id))
            .exec(&txn)
            .await?;

        let mut active: cart::ActiveModel = cart.into();
        active.status = Set(CartStatus::Converted);
        active.updated_at = Set(Utc::now());
        active.update(&txn).await?;

        txn.commit().await?;
        info!(cart_id = %cart_id, "cart cleared");
        Ok(())
    }
}
