pub mod asset;
pub mod history;
pub mod internal_id;
pub mod quote;
