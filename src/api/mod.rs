//! External data providers.

mod data_client;

pub use data_client::DataClient;
