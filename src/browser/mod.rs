#[cfg(feature = "chrome")]
pub mod chrome;
pub(crate) mod dispatcher;
pub mod session;
pub mod shim;

#[cfg(feature = "chrome")]
pub use chrome::ChromeEngine;
pub use session::Browser;
pub use shim::{NoopCdpSession, ShimBrowser, ShimCache, ShimPage};
