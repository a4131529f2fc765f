mod discovery;
pub mod stream;

pub use discovery::EdgeDiscoveryService;
