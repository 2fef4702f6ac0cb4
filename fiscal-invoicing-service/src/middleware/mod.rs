pub mod shop_context;

pub use shop_context::{ShopContext, SHOP_DOMAIN_HEADER};
