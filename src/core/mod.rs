pub mod browser;
pub mod config;
pub mod events;
pub mod session;

pub use browser::{
    BrowserDriver, BrowserEvent, BrowserFamily, CdpSession, Engine, EngineKind, PageDriver,
    Target, TargetKind,
};
pub use config::{Config, FailurePolicy};
pub use events::EventHub;
pub use session::SessionContext;
