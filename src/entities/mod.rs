pub mod discount_code;
pub mod invoice;
pub mod order;
pub mod order_item;
pub mod product;
pub mod product_size_stock;
pub mod return_request;
