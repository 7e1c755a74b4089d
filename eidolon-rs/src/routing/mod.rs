//! Route normalization, resolution and administration

pub mod cidr;
pub mod resolver;
pub mod service;

pub use cidr::normalize_cidr;
pub use resolver::resolve_routes;
pub use service::RouteService;
