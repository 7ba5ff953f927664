pub mod config;
pub mod error;
pub mod export;
pub mod generalise;
pub mod kanon;
pub mod load;
pub mod pipeline;
pub mod policy;
