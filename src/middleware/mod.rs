pub mod timing;

pub use timing::record_requests;
