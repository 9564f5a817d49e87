pub mod column;
pub mod connection;
pub mod model;
pub mod row;
pub mod schema;
