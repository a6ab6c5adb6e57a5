//! Entity tags and the typed request payloads sent to the backend.
//!
//! Every payload is validated client-side before it is either sent or
//! queued, so a queued item can only fail on the server for reasons the
//! client could not know about (duplicate SKU, deleted parent, ...).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ValidationError;

// ---------------------------------------------------------------------------
// Entity tags
// ---------------------------------------------------------------------------

/// Entity types that can be mutated offline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Product,
    Order,
    Category,
    Customer,
    Coupon,
}

impl EntityKind {
    pub const ALL: [EntityKind; 5] = [
        EntityKind::Product,
        EntityKind::Order,
        EntityKind::Category,
        EntityKind::Customer,
        EntityKind::Coupon,
    ];

    /// Tag stored in the queue's `entity_type` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Product => "product",
            EntityKind::Order => "order",
            EntityKind::Category => "category",
            EntityKind::Customer => "customer",
            EntityKind::Coupon => "coupon",
        }
    }

    /// REST collection path, with the leading slash.
    pub fn resource_path(&self) -> &'static str {
        match self {
            EntityKind::Product => "/products",
            EntityKind::Order => "/orders",
            EntityKind::Category => "/categories",
            EntityKind::Customer => "/customers",
            EntityKind::Coupon => "/coupons",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "product" | "products" => Ok(EntityKind::Product),
            "order" | "orders" => Ok(EntityKind::Order),
            "category" | "categories" => Ok(EntityKind::Category),
            "customer" | "customers" => Ok(EntityKind::Customer),
            "coupon" | "coupons" => Ok(EntityKind::Coupon),
            other => Err(format!("Unknown entity type: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Payload traits
// ---------------------------------------------------------------------------

/// A request body that can be checked before it leaves the client.
pub trait Payload: Serialize + Send + Sync {
    fn validate(&self) -> Result<(), ValidationError>;
}

/// Binds an entity tag to its create and update payload types.
pub trait Entity: Send + Sync + 'static {
    const KIND: EntityKind;
    type New: Payload;
    type Patch: Payload;
}

pub struct Products;
pub struct Orders;
pub struct Categories;
pub struct Customers;
pub struct Coupons;

impl Entity for Products {
    const KIND: EntityKind = EntityKind::Product;
    type New = NewProduct;
    type Patch = ProductPatch;
}

impl Entity for Orders {
    const KIND: EntityKind = EntityKind::Order;
    type New = NewOrder;
    type Patch = OrderPatch;
}

impl Entity for Categories {
    const KIND: EntityKind = EntityKind::Category;
    type New = NewCategory;
    type Patch = CategoryPatch;
}

impl Entity for Customers {
    const KIND: EntityKind = EntityKind::Customer;
    type New = NewCustomer;
    type Patch = CustomerPatch;
}

impl Entity for Coupons {
    const KIND: EntityKind = EntityKind::Coupon;
    type New = NewCoupon;
    type Patch = CouponPatch;
}

// ---------------------------------------------------------------------------
// Validation helpers
// ---------------------------------------------------------------------------

fn require_non_empty(field: &str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::new(field, "must not be empty"));
    }
    Ok(())
}

fn require_non_negative(field: &str, value: f64) -> Result<(), ValidationError> {
    if !value.is_finite() || value < 0.0 {
        return Err(ValidationError::new(field, "must be a non-negative number"));
    }
    Ok(())
}

fn require_email(field: &str, value: &str) -> Result<(), ValidationError> {
    let trimmed = value.trim();
    match trimmed.split_once('@') {
        Some((user, domain)) if !user.is_empty() && domain.contains('.') => Ok(()),
        _ => Err(ValidationError::new(field, "must be a valid email address")),
    }
}

fn validate_opt<T, F>(value: &Option<T>, check: F) -> Result<(), ValidationError>
where
    F: FnOnce(&T) -> Result<(), ValidationError>,
{
    match value {
        Some(v) => check(v),
        None => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Products
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NewProduct {
    pub name: String,
    pub price: f64,
    #[serde(default)]
    pub quantity: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sku: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub barcode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_active: Option<bool>,
}

impl NewProduct {
    pub fn new(name: impl Into<String>, price: f64) -> Self {
        Self {
            name: name.into(),
            price,
            quantity: 0,
            category_id: None,
            sku: None,
            barcode: None,
            description: None,
            cost_price: None,
            is_active: None,
        }
    }
}

impl Payload for NewProduct {
    fn validate(&self) -> Result<(), ValidationError> {
        require_non_empty("name", &self.name)?;
        require_non_negative("price", self.price)?;
        if self.quantity < 0 {
            return Err(ValidationError::new("quantity", "must not be negative"));
        }
        validate_opt(&self.cost_price, |v| require_non_negative("costPrice", *v))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProductPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantity: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sku: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub barcode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_active: Option<bool>,
}

impl Payload for ProductPatch {
    fn validate(&self) -> Result<(), ValidationError> {
        validate_opt(&self.name, |v| require_non_empty("name", v))?;
        validate_opt(&self.price, |v| require_non_negative("price", *v))?;
        validate_opt(&self.cost_price, |v| require_non_negative("costPrice", *v))?;
        if matches!(self.quantity, Some(q) if q < 0) {
            return Err(ValidationError::new("quantity", "must not be negative"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Orders
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    #[default]
    Pickup,
    DineIn,
    Delivery,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Confirmed,
    Preparing,
    Ready,
    OutForDelivery,
    Delivered,
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OrderLine {
    pub product_id: String,
    pub quantity: i64,
    pub unit_price: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

fn validate_lines(lines: &[OrderLine]) -> Result<(), ValidationError> {
    if lines.is_empty() {
        return Err(ValidationError::new("items", "order must contain at least one item"));
    }
    for (idx, line) in lines.iter().enumerate() {
        require_non_empty(&format!("items[{idx}].productId"), &line.product_id)?;
        if line.quantity <= 0 {
            return Err(ValidationError::new(
                format!("items[{idx}].quantity"),
                "must be positive",
            ));
        }
        require_non_negative(&format!("items[{idx}].unitPrice"), line.unit_price)?;
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NewOrder {
    pub items: Vec<OrderLine>,
    #[serde(default)]
    pub order_type: OrderType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coupon_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<OrderStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl NewOrder {
    pub fn new(items: Vec<OrderLine>) -> Self {
        Self {
            items,
            order_type: OrderType::default(),
            customer_id: None,
            coupon_id: None,
            status: None,
            delivery_address: None,
            payment_method: None,
            notes: None,
        }
    }

    pub fn subtotal(&self) -> f64 {
        self.items
            .iter()
            .map(|l| l.unit_price * l.quantity as f64)
            .sum()
    }
}

impl Payload for NewOrder {
    fn validate(&self) -> Result<(), ValidationError> {
        validate_lines(&self.items)?;
        if self.order_type == OrderType::Delivery {
            let has_address = self
                .delivery_address
                .as_deref()
                .is_some_and(|a| !a.trim().is_empty());
            if !has_address {
                return Err(ValidationError::new(
                    "deliveryAddress",
                    "is required for delivery orders",
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OrderPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<OrderStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Vec<OrderLine>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl Payload for OrderPatch {
    fn validate(&self) -> Result<(), ValidationError> {
        validate_opt(&self.items, |lines| validate_lines(lines))
    }
}

// ---------------------------------------------------------------------------
// Categories
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NewCategory {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort_order: Option<i32>,
}

impl Payload for NewCategory {
    fn validate(&self) -> Result<(), ValidationError> {
        require_non_empty("name", &self.name)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CategoryPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort_order: Option<i32>,
}

impl Payload for CategoryPatch {
    fn validate(&self) -> Result<(), ValidationError> {
        validate_opt(&self.name, |v| require_non_empty("name", v))
    }
}

// ---------------------------------------------------------------------------
// Customers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NewCustomer {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl Payload for NewCustomer {
    fn validate(&self) -> Result<(), ValidationError> {
        require_non_empty("name", &self.name)?;
        validate_opt(&self.email, |v| require_email("email", v))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CustomerPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl Payload for CustomerPatch {
    fn validate(&self) -> Result<(), ValidationError> {
        validate_opt(&self.name, |v| require_non_empty("name", v))?;
        validate_opt(&self.email, |v| require_email("email", v))
    }
}

// ---------------------------------------------------------------------------
// Coupons
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DiscountType {
    Percentage,
    Fixed,
}

fn validate_discount(kind: DiscountType, value: f64) -> Result<(), ValidationError> {
    require_non_negative("discountValue", value)?;
    if kind == DiscountType::Percentage && value > 100.0 {
        return Err(ValidationError::new(
            "discountValue",
            "percentage discount cannot exceed 100",
        ));
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NewCoupon {
    pub code: String,
    pub discount_type: DiscountType,
    pub discount_value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_order_amount: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_uses: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_active: Option<bool>,
}

impl Payload for NewCoupon {
    fn validate(&self) -> Result<(), ValidationError> {
        require_non_empty("code", &self.code)?;
        if self.code.chars().any(char::is_whitespace) {
            return Err(ValidationError::new("code", "must not contain whitespace"));
        }
        validate_discount(self.discount_type, self.discount_value)?;
        validate_opt(&self.min_order_amount, |v| {
            require_non_negative("minOrderAmount", *v)
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CouponPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discount_type: Option<DiscountType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discount_value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_order_amount: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_uses: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_active: Option<bool>,
}

impl Payload for CouponPatch {
    fn validate(&self) -> Result<(), ValidationError> {
        validate_opt(&self.code, |v| require_non_empty("code", v))?;
        if let Some(value) = self.discount_value {
            // Without a type in the patch only the generic bound can be checked.
            validate_discount(self.discount_type.unwrap_or(DiscountType::Fixed), value)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_entity_kind_parse_and_paths() {
        for kind in EntityKind::ALL {
            assert_eq!(kind.as_str().parse::<EntityKind>().unwrap(), kind);
            assert!(kind.resource_path().starts_with('/'));
        }
        assert_eq!("Categories".parse::<EntityKind>().unwrap(), EntityKind::Category);
        assert!("widget".parse::<EntityKind>().is_err());
    }

    #[test]
    fn test_patch_omits_unset_fields() {
        let patch = ProductPatch {
            quantity: Some(5),
            ..Default::default()
        };
        assert_eq!(serde_json::to_value(&patch).unwrap(), json!({ "quantity": 5 }));
    }

    #[test]
    fn test_new_product_serializes_camel_case() {
        let mut product = NewProduct::new("Widget", 4.5);
        product.category_id = Some("local_abc".into());
        let value = serde_json::to_value(&product).unwrap();
        assert_eq!(value["name"], "Widget");
        assert_eq!(value["categoryId"], "local_abc");
        assert!(value.get("sku").is_none());
    }

    #[test]
    fn test_product_validation() {
        assert!(NewProduct::new("Widget", 1.0).validate().is_ok());
        let err = NewProduct::new("  ", 1.0).validate().unwrap_err();
        assert_eq!(err.field, "name");
        let err = NewProduct::new("Widget", -1.0).validate().unwrap_err();
        assert_eq!(err.field, "price");
        let patch = ProductPatch {
            quantity: Some(-2),
            ..Default::default()
        };
        assert_eq!(patch.validate().unwrap_err().field, "quantity");
    }

    #[test]
    fn test_order_validation() {
        let line = OrderLine {
            product_id: "p1".into(),
            quantity: 2,
            unit_price: 3.0,
            notes: None,
        };
        let order = NewOrder::new(vec![line.clone()]);
        assert!(order.validate().is_ok());
        assert!((order.subtotal() - 6.0).abs() < f64::EPSILON);

        assert_eq!(NewOrder::new(vec![]).validate().unwrap_err().field, "items");

        let mut zero = line.clone();
        zero.quantity = 0;
        let err = NewOrder::new(vec![zero]).validate().unwrap_err();
        assert_eq!(err.field, "items[0].quantity");

        let mut delivery = NewOrder::new(vec![line]);
        delivery.order_type = OrderType::Delivery;
        assert_eq!(delivery.validate().unwrap_err().field, "deliveryAddress");
        delivery.delivery_address = Some("1 Main St".into());
        assert!(delivery.validate().is_ok());
    }

    #[test]
    fn test_customer_email_validation() {
        let mut customer = NewCustomer {
            name: "Ana".into(),
            email: Some("ana@example.com".into()),
            phone: None,
            address: None,
            notes: None,
        };
        assert!(customer.validate().is_ok());
        customer.email = Some("not-an-email".into());
        assert_eq!(customer.validate().unwrap_err().field, "email");
    }

    #[test]
    fn test_coupon_validation() {
        let mut coupon = NewCoupon {
            code: "SUMMER10".into(),
            discount_type: DiscountType::Percentage,
            discount_value: 10.0,
            min_order_amount: None,
            max_uses: None,
            expires_at: None,
            category_id: None,
            is_active: None,
        };
        assert!(coupon.validate().is_ok());
        coupon.discount_value = 150.0;
        assert_eq!(coupon.validate().unwrap_err().field, "discountValue");
        coupon.discount_type = DiscountType::Fixed;
        assert!(coupon.validate().is_ok());
        coupon.code = "TWO WORDS".into();
        assert_eq!(coupon.validate().unwrap_err().field, "code");
    }

    #[test]
    fn test_order_status_wire_format() {
        assert_eq!(
            serde_json::to_value(OrderStatus::OutForDelivery).unwrap(),
            json!("out_for_delivery")
        );
        assert_eq!(serde_json::to_value(OrderType::DineIn).unwrap(), json!("dine_in"));
    }
}
