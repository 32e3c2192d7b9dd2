pub mod engine;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod pump;
pub mod reminder;
pub mod settings;
pub mod wal;
pub mod wire;
