pub mod customer;
pub mod rate_limit;
