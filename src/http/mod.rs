mod client;
mod probe;
mod request;

pub use probe::probe;
pub use request::HttpExecutor;
#[cfg(feature = "http3")]
pub use request::RequestProfile;
