pub mod batch_service;
pub mod fx_service;
pub mod history_service;
pub mod normalizer;
pub mod quote_service;
pub mod resolver;
pub mod upstream;
