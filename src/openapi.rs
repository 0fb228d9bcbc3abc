//! OpenAPI documentation, served through Swagger UI at `/docs`.

use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::{
    entities::{
        address, cart, cart_item,
        order::{self, OrderStatus, PaymentMethod, PaymentStatus},
        order_item, payment_attempt,
    },
    errors::ErrorResponse,
    handlers,
    services::{
        checkout::{AppliedCoupon, CheckoutSession, CheckoutState, PaymentInstrument},
        coupons::CouponValidation,
        orders::{OrderDetails, OrderItemInput, OrderTotals, UpdateOrderInput},
    },
};

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::checkout::start_checkout,
        handlers::checkout::get_checkout,
        handlers::checkout::set_address,
        handlers::checkout::set_payment_method,
        handlers::checkout::apply_coupon,
        handlers::checkout::remove_coupon,
        handlers::checkout::submit_checkout,
        handlers::checkout::cancel_wait,
        handlers::checkout::retry_payment,
        handlers::orders::list_orders,
        handlers::orders::get_order,
        handlers::orders::update_order,
        handlers::payments::payment_status,
        handlers::carts::get_cart,
        handlers::carts::add_item,
        handlers::coupons::validate_coupon,
        handlers::addresses::list_addresses,
        handlers::addresses::create_address,
        handlers::addresses::delete_address,
    ),
    components(schemas(
        ErrorResponse,
        CheckoutSession,
        CheckoutState,
        PaymentInstrument,
        AppliedCoupon,
        CouponValidation,
        OrderDetails,
        OrderTotals,
        OrderItemInput,
        UpdateOrderInput,
        OrderStatus,
        PaymentStatus,
        PaymentMethod,
        order::Model,
        order_item::Model,
        address::Model,
        cart::Model,
        cart_item::Model,
        payment_attempt::Model,
        handlers::checkout::SetAddressRequest,
        handlers::checkout::ApplyCouponRequest,
        handlers::checkout::ApplyCouponResponse,
        handlers::checkout::RetryPaymentRequest,
        handlers::carts::AddItemRequest,
        handlers::carts::CartResponse,
        handlers::coupons::ValidateCouponRequest,
        handlers::addresses::CreateAddressRequest,
        handlers::payments::PaymentStatusResponse,
    )),
    tags(
        (name = "checkout", description = "Checkout session flow"),
        (name = "orders", description = "Order history and fulfillment"),
        (name = "payments", description = "Payment status and webhooks"),
        (name = "cart", description = "Shopping cart"),
        (name = "coupons", description = "Coupon validation"),
        (name = "addresses", description = "Saved shipping addresses"),
    ),
    info(
        title = "Dukani API",
        description = "Checkout, order and payment API for the Dukani storefront",
    )
)]
pub struct ApiDoc;

pub fn swagger_ui() -> SwaggerUi {
    SwaggerUi::new("/docs").url("/api-docs/openapi.json", ApiDoc::openapi())
}
